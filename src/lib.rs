//! The document-processing pipeline core: ingestion, staged OCR/LLM
//! extraction, account splitting, name matching, and the caching/edit
//! reconciliation layer that the REST surface (out of scope here) is built
//! on top of.

pub mod aws;
pub mod blob_store;
pub mod cmd;
pub mod errors;
pub mod ingest;
pub mod index;
pub mod keys;
pub mod llm;
pub mod model;
pub mod name_match;
pub mod ocr;
pub mod page_store;
pub mod pipeline;
pub mod poller;
pub mod prelude;
pub mod prompt;
pub mod prompts;
pub mod queue;
pub mod rate_limit;
pub mod retry;
pub mod scheduler;
pub mod toml_utils;
pub mod ui;

/// Everything needed to run the pipeline end to end, assembled once at
/// startup and shared across the ingestion coordinator, scheduler, and S3
/// poller.
pub struct Platform {
    pub blob_store: std::sync::Arc<dyn blob_store::BlobStore>,
    pub index: std::sync::Arc<index::DocumentIndex>,
    pub queue: std::sync::Arc<queue::DocumentQueue>,
    pub scheduler: std::sync::Arc<scheduler::Scheduler>,
    pub page_store: std::sync::Arc<page_store::PageExtractionStore>,
}

impl Platform {
    pub async fn load(blob_store: std::sync::Arc<dyn blob_store::BlobStore>, max_workers: usize) -> anyhow::Result<Self> {
        let index = std::sync::Arc::new(index::DocumentIndex::load(blob_store.clone()).await?);
        let queue = std::sync::Arc::new(queue::DocumentQueue::load(blob_store.clone()).await?);
        let scheduler = std::sync::Arc::new(scheduler::Scheduler::new(max_workers));
        let page_store = std::sync::Arc::new(page_store::PageExtractionStore::new(
            blob_store.clone(),
            index.clone(),
            scheduler.clone(),
        ));
        Ok(Platform { blob_store, index, queue, scheduler, page_store })
    }

    /// Re-enqueue every non-terminal Document Queue entry into the
    /// scheduler. The scheduler's priority queue lives only in memory, so a
    /// process restart is a cold start for it; the persisted queue is the
    /// source of truth it replays from. Call this once after [`Platform::load`].
    pub async fn replay_pending(&self) -> anyhow::Result<usize> {
        let mut replayed = 0;
        for entry in self.queue.pending_entries().await {
            let doc_type = self
                .index
                .get(&entry.doc_id)
                .await
                .map(|doc| doc.doc_type)
                .unwrap_or(model::DocumentType::Generic);
            self.scheduler.enqueue(&entry.doc_id, ingest::priority_for(doc_type)).await?;
            replayed += 1;
        }
        Ok(replayed)
    }
}
