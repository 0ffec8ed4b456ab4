//! The page extraction store: the priority-ordered read path and the edit
//! reconciliation write path. This is the part of the pipeline human review
//! actually talks to.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;

use crate::blob_store::{BlobStore, BlobStoreJsonExt};
use crate::errors::{PipelineError, PipelineResult};
use crate::index::DocumentIndex;
use crate::keys;
use crate::model::{FieldValue, LastAction, PageExtraction};
use crate::scheduler::Scheduler;

/// Human-submitted changes to one page's extraction.
#[derive(Debug, Clone, Default)]
pub struct PageDelta {
    /// Fields to add or overwrite, by name.
    pub fields: BTreeMap<String, String>,
    /// Field names to remove.
    pub deleted_fields: Vec<String>,
    /// Tag describing what kind of edit this was, carried through to
    /// `last_action` for audit purposes only -- it does not change the
    /// reconciliation outcome.
    pub action_type: LastAction,
}

pub struct PageExtractionStore {
    blob_store: Arc<dyn BlobStore>,
    index: Arc<DocumentIndex>,
    scheduler: Arc<Scheduler>,
}

impl PageExtractionStore {
    pub fn new(blob_store: Arc<dyn BlobStore>, index: Arc<DocumentIndex>, scheduler: Arc<Scheduler>) -> Self {
        PageExtractionStore { blob_store, index, scheduler }
    }

    /// Read one page's extraction, trying each source in strict priority
    /// order. The first hit wins; sources are never merged.
    pub async fn get_page(
        &self,
        doc_id: &str,
        account_index: Option<usize>,
        page_index: usize,
    ) -> PipelineResult<PageExtraction> {
        let cache_key = keys::page_data_key(doc_id, account_index, page_index);
        if let Some(extraction) = self
            .blob_store
            .try_get_json::<PageExtraction>(&cache_key)
            .await
            .map_err(Into::<PipelineError>::into)?
        {
            return Ok(extraction);
        }

        if let Some(document) = self.index.get(doc_id).await {
            if let Some(account_index) = account_index {
                if let Some(account) = document.accounts.get(account_index) {
                    if let Some(extraction) = account.page_data.get(&page_index) {
                        return Ok(extraction.clone());
                    }
                }
            }
        }

        if let Some(extraction) = self.scheduler.cached_page(doc_id, account_index, page_index).await {
            return Ok(extraction);
        }

        match self.index.get(doc_id).await {
            Some(document) => Err(PipelineError::NotReady {
                stage: format!("{:?}", document.stage),
                progress: document.progress,
            }),
            None => Err(PipelineError::NotFound(doc_id.to_string())),
        }
    }

    /// Reconcile a human edit into a page's extraction and persist the
    /// result. See module docs for the exact procedure.
    pub async fn update_page(
        &self,
        doc_id: &str,
        account_index: Option<usize>,
        page_index: usize,
        delta: PageDelta,
    ) -> PipelineResult<PageExtraction> {
        let cache_key = keys::page_data_key(doc_id, account_index, page_index);

        // Step 1: read the existing record from the user-edit cache only (no
        // fallback to the inline or in-memory sources), or fall back to
        // whatever the pipeline already produced, or start empty.
        let existing = self
            .blob_store
            .try_get_json::<PageExtraction>(&cache_key)
            .await
            .map_err(Into::<PipelineError>::into)?;
        let base = match existing {
            Some(extraction) => extraction,
            None => match self.scheduler.cached_page(doc_id, account_index, page_index).await {
                Some(extraction) => extraction,
                None => PageExtraction::default(),
            },
        };

        // Step 2: copy every existing field into `next` unchanged. Fields
        // absent from the delta must come out byte-identical.
        let mut next = base.data.clone();

        // Step 3: process deletions.
        for name in &delta.deleted_fields {
            next.remove(name);
        }

        // Step 4: process additions/edits.
        let now = Utc::now();
        for (name, new_value) in &delta.fields {
            match base.data.get(name) {
                None => {
                    next.insert(name.clone(), FieldValue::human_added(new_value.clone(), now));
                }
                Some(original) => {
                    if &original.value == new_value {
                        next.insert(name.clone(), original.clone());
                    } else {
                        next.insert(name.clone(), FieldValue::human_corrected(new_value.clone(), now));
                    }
                }
            }
        }

        // Step 5: overall_confidence reflects pipeline quality, not human
        // edits, and is carried over untouched.
        let updated = PageExtraction {
            data: next,
            overall_confidence: base.overall_confidence,
            account_number: base.account_number.clone(),
            prompt_version: base.prompt_version.clone(),
            edited: true,
            edited_at: Some(now),
            last_action: Some(delta.action_type),
        };

        // Step 6: write back and verify by read-back.
        self.blob_store
            .put_json_verified(&cache_key, &updated)
            .await
            .map_err(Into::<PipelineError>::into)?;

        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::LocalBlobStore;
    use crate::model::{DocumentType, FieldSource, IngestSource};
    use crate::scheduler::Scheduler;

    async fn store() -> (PageExtractionStore, Arc<dyn BlobStore>) {
        let dir = tempfile::tempdir().unwrap();
        let blob_store: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::new(dir.path()));
        let index = Arc::new(DocumentIndex::load(blob_store.clone()).await.unwrap());
        let scheduler = Arc::new(Scheduler::new(1));
        (
            PageExtractionStore::new(blob_store.clone(), index, scheduler),
            blob_store,
        )
    }

    async fn seed_page(blob_store: &Arc<dyn BlobStore>, doc_id: &str, page_index: usize, extraction: &PageExtraction) {
        let key = keys::page_data_key(doc_id, None, page_index);
        blob_store.put_json_verified(&key, extraction).await.unwrap();
    }

    fn extraction_with(fields: &[(&str, &str, u8, FieldSource)], overall_confidence: f64) -> PageExtraction {
        let mut data = BTreeMap::new();
        for (name, value, confidence, source) in fields {
            data.insert(
                name.to_string(),
                FieldValue {
                    value: value.to_string(),
                    confidence: *confidence,
                    source: *source,
                    edited_at: None,
                },
            );
        }
        PageExtraction {
            data,
            overall_confidence,
            account_number: None,
            prompt_version: "v1".to_string(),
            edited: false,
            edited_at: None,
            last_action: Some(LastAction::Extract),
        }
    }

    #[tokio::test]
    async fn add_field_preserves_untouched_fields() {
        let (store, blob_store) = store().await;
        let pre = extraction_with(
            &[
                ("name", "John", 95, FieldSource::AiExtracted),
                ("email", "j@x", 90, FieldSource::AiExtracted),
            ],
            92.0,
        );
        seed_page(&blob_store, "d1", 0, &pre).await;

        let mut delta = PageDelta { action_type: LastAction::Add, ..Default::default() };
        delta.fields.insert("city".to_string(), "NY".to_string());
        let post = store.update_page("d1", None, 0, delta).await.unwrap();

        assert_eq!(post.data["name"], pre.data["name"]);
        assert_eq!(post.data["email"], pre.data["email"]);
        assert_eq!(post.data["city"].value, "NY");
        assert_eq!(post.data["city"].confidence, 100);
        assert_eq!(post.data["city"].source, FieldSource::HumanAdded);
        assert_eq!(post.overall_confidence, 92.0);
    }

    #[tokio::test]
    async fn edit_field_marks_human_corrected() {
        let (store, blob_store) = store().await;
        let pre = extraction_with(
            &[
                ("name", "John", 95, FieldSource::AiExtracted),
                ("email", "j@x", 90, FieldSource::AiExtracted),
                ("city", "NY", 100, FieldSource::HumanAdded),
            ],
            92.0,
        );
        seed_page(&blob_store, "d1", 0, &pre).await;

        let mut delta = PageDelta { action_type: LastAction::Edit, ..Default::default() };
        delta.fields.insert("name".to_string(), "Jane".to_string());
        let post = store.update_page("d1", None, 0, delta).await.unwrap();

        assert_eq!(post.data["name"].value, "Jane");
        assert_eq!(post.data["name"].confidence, 100);
        assert_eq!(post.data["name"].source, FieldSource::HumanCorrected);
        assert_eq!(post.data["email"], pre.data["email"]);
        assert_eq!(post.data["city"], pre.data["city"]);
        assert_eq!(post.overall_confidence, 92.0);
    }

    #[tokio::test]
    async fn delete_field_removes_only_that_field() {
        let (store, blob_store) = store().await;
        let pre = extraction_with(
            &[
                ("name", "Jane", 100, FieldSource::HumanCorrected),
                ("email", "j@x", 90, FieldSource::AiExtracted),
                ("city", "NY", 100, FieldSource::HumanAdded),
            ],
            92.0,
        );
        seed_page(&blob_store, "d1", 0, &pre).await;

        let delta = PageDelta {
            deleted_fields: vec!["email".to_string()],
            action_type: LastAction::Delete,
            ..Default::default()
        };
        let post = store.update_page("d1", None, 0, delta).await.unwrap();

        assert!(!post.data.contains_key("email"));
        assert_eq!(post.data["name"], pre.data["name"]);
        assert_eq!(post.data["city"], pre.data["city"]);
    }

    #[tokio::test]
    async fn copy_to_another_page_preserves_page_isolation() {
        let (store, blob_store) = store().await;
        let page0 = extraction_with(&[("x", "1", 95, FieldSource::AiExtracted)], 95.0);
        let page1 = extraction_with(&[("y", "2", 80, FieldSource::AiExtracted)], 80.0);
        seed_page(&blob_store, "d1", 0, &page0).await;
        seed_page(&blob_store, "d1", 1, &page1).await;

        let mut delta = PageDelta { action_type: LastAction::Copy, ..Default::default() };
        delta.fields.insert("x".to_string(), "1".to_string());
        let post_page1 = store.update_page("d1", None, 1, delta).await.unwrap();

        assert_eq!(post_page1.data["x"].value, "1");
        assert_eq!(post_page1.data["x"].source, FieldSource::HumanAdded);
        assert_eq!(post_page1.data["y"], page1.data["y"]);

        let post_page0 = store.get_page("d1", None, 0).await.unwrap();
        assert_eq!(post_page0, page0);
    }

    #[tokio::test]
    async fn update_page_is_idempotent_under_repetition() {
        let (store, blob_store) = store().await;
        let pre = extraction_with(&[("name", "John", 95, FieldSource::AiExtracted)], 90.0);
        seed_page(&blob_store, "d1", 0, &pre).await;

        let mut delta = PageDelta { action_type: LastAction::Edit, ..Default::default() };
        delta.fields.insert("name".to_string(), "Jane".to_string());
        let first = store.update_page("d1", None, 0, delta.clone()).await.unwrap();
        let second = store.update_page("d1", None, 0, delta).await.unwrap();

        assert_eq!(first.data["name"], second.data["name"]);
    }

    #[tokio::test]
    async fn reading_a_page_immediately_after_update_returns_exactly_what_was_written() {
        let (store, blob_store) = store().await;
        let pre = extraction_with(&[("name", "John", 95, FieldSource::AiExtracted)], 90.0);
        seed_page(&blob_store, "d1", 0, &pre).await;

        let mut delta = PageDelta { action_type: LastAction::Edit, ..Default::default() };
        delta.fields.insert("name".to_string(), "Jane".to_string());
        let written = store.update_page("d1", None, 0, delta).await.unwrap();
        let read = store.get_page("d1", None, 0).await.unwrap();
        assert_eq!(written, read);
    }

    #[tokio::test]
    async fn missing_page_with_no_document_record_is_not_found() {
        let (store, _blob_store) = store().await;
        let err = store.get_page("unknown", None, 0).await.unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(_)));
    }

    #[tokio::test]
    async fn missing_page_with_in_progress_document_is_not_ready() {
        let (store, blob_store) = store().await;
        let index = DocumentIndex::load(blob_store.clone()).await.unwrap();
        let doc = crate::model::Document::new(
            "d1".to_string(),
            "a.pdf".to_string(),
            IngestSource::Direct,
            DocumentType::Loan,
        );
        index.insert(doc).await.unwrap();
        // Reload the store against the same blob store so its index sees the
        // record we just inserted through a separate handle.
        let scheduler = Arc::new(Scheduler::new(1));
        let store = PageExtractionStore::new(blob_store, Arc::new(index), scheduler);
        let err = store.get_page("d1", None, 0).await.unwrap_err();
        assert!(matches!(err, PipelineError::NotReady { .. }));
    }
}
