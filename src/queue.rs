//! The Document Queue: a process-wide, persisted dedup gate that every
//! ingestion path must pass through before any expensive work starts.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;

use crate::blob_store::{BlobStore, BlobStoreJsonExt};
use crate::model::{IngestSource, QueueEntry, QueueStatus};
use crate::prelude::*;

const QUEUE_KEY: &str = ".document_processing_queue.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueSnapshot {
    processing: HashMap<String, QueueEntry>,
    completed: Vec<String>,
    last_updated: Option<chrono::DateTime<Utc>>,
}

struct QueueState {
    processing: HashMap<String, QueueEntry>,
    completed: std::collections::HashSet<String>,
}

/// The single lock guarding both collections plus their persistence, mirroring
/// the "persist inside the lock" model used for small, infrequently-written
/// state elsewhere in this crate.
pub struct DocumentQueue {
    blob_store: Arc<dyn BlobStore>,
    state: Mutex<QueueState>,
}

impl DocumentQueue {
    /// Load the queue from its persisted snapshot, or start empty if none
    /// exists yet.
    pub async fn load(blob_store: Arc<dyn BlobStore>) -> Result<Self> {
        let snapshot: QueueSnapshot = blob_store
            .try_get_json(QUEUE_KEY)
            .await?
            .unwrap_or_default();
        Ok(DocumentQueue {
            blob_store,
            state: Mutex::new(QueueState {
                processing: snapshot.processing,
                completed: snapshot.completed.into_iter().collect(),
            }),
        })
    }

    async fn persist(&self, state: &QueueState) -> Result<()> {
        let snapshot = QueueSnapshot {
            processing: state.processing.clone(),
            completed: state.completed.iter().cloned().collect(),
            last_updated: Some(Utc::now()),
        };
        self.blob_store
            .put_json_verified(QUEUE_KEY, &snapshot)
            .await
            .map_err(|err| anyhow!(err))
    }

    /// Add a new entry if, and only if, `doc_id` is not already present in
    /// either collection. This is the sole dedup gate shared by every
    /// ingestion path; callers must call it before any expensive work.
    pub async fn add(&self, doc_id: &str, filename: &str, source: IngestSource) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.processing.contains_key(doc_id) || state.completed.contains(doc_id) {
            return Ok(false);
        }
        state
            .processing
            .insert(doc_id.to_string(), QueueEntry::new(doc_id.to_string(), filename.to_string(), source));
        self.persist(&state).await?;
        Ok(true)
    }

    /// Transition `doc_id` from queued to processing. A no-op with a warning
    /// if the entry is missing or already past `queued`.
    pub async fn mark_processing(&self, doc_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.processing.get_mut(doc_id) {
            Some(entry) if entry.status == QueueStatus::Queued => {
                entry.status = QueueStatus::Processing;
                entry.started_at = Some(Utc::now());
                self.persist(&state).await?;
            }
            Some(entry) => {
                warn!(doc_id, status = ?entry.status, "ignoring illegal transition to processing");
            }
            None => warn!(doc_id, "mark_processing on unknown doc_id"),
        }
        Ok(())
    }

    /// Transition `doc_id` to completed, moving it into the bounded
    /// completed set.
    pub async fn mark_completed(&self, doc_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.processing.remove(doc_id) {
            Some(mut entry) => {
                entry.status = QueueStatus::Completed;
                entry.completed_at = Some(Utc::now());
                state.completed.insert(doc_id.to_string());
                self.persist(&state).await?;
            }
            None => warn!(doc_id, "mark_completed on unknown doc_id"),
        }
        Ok(())
    }

    /// Transition `doc_id` to failed, recording `error`. The entry stays in
    /// `processing` (not `completed`) so a re-enqueue request can remove it
    /// and resubmit.
    pub async fn mark_failed(&self, doc_id: &str, error: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.processing.get_mut(doc_id) {
            Some(entry) => {
                entry.status = QueueStatus::Failed;
                entry.completed_at = Some(Utc::now());
                entry.error = Some(error.to_string());
                self.persist(&state).await?;
            }
            None => warn!(doc_id, "mark_failed on unknown doc_id"),
        }
        Ok(())
    }

    /// Is this document currently queued or processing?
    pub async fn is_active(&self, doc_id: &str) -> bool {
        let state = self.state.lock().await;
        matches!(
            state.processing.get(doc_id).map(|e| e.status),
            Some(QueueStatus::Queued) | Some(QueueStatus::Processing)
        )
    }

    /// The current entry for `doc_id`, wherever it lives.
    pub async fn status(&self, doc_id: &str) -> Option<QueueEntry> {
        let state = self.state.lock().await;
        state.processing.get(doc_id).cloned()
    }

    /// Revert a queued/in-flight entry back to `queued` so a worker can pick
    /// it up again, e.g. after the stage it was running in was cancelled.
    pub async fn revert_to_queued(&self, doc_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.processing.get_mut(doc_id) {
            entry.status = QueueStatus::Queued;
            entry.started_at = None;
            self.persist(&state).await?;
        }
        Ok(())
    }

    /// Every non-terminal entry (`queued` or `processing`), used to replay
    /// work into a fresh, in-memory [`crate::scheduler::Scheduler`] after a
    /// process restart -- the scheduler itself keeps no state across runs.
    pub async fn pending_entries(&self) -> Vec<QueueEntry> {
        let state = self.state.lock().await;
        state
            .processing
            .values()
            .filter(|entry| matches!(entry.status, QueueStatus::Queued | QueueStatus::Processing))
            .cloned()
            .collect()
    }

    /// Remove a completed entry's terminal status so it can be re-enqueued,
    /// per the client-requested re-enqueue flow.
    pub async fn reopen(&self, doc_id: &str, filename: &str, source: IngestSource) -> Result<()> {
        let mut state = self.state.lock().await;
        state.completed.remove(doc_id);
        state.processing.remove(doc_id);
        state
            .processing
            .insert(doc_id.to_string(), QueueEntry::new(doc_id.to_string(), filename.to_string(), source));
        self.persist(&state).await
    }
}
