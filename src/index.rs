//! The local Document index: the single JSON listing of every
//! [`Document`] record, kept in sync with the blob store by atomic
//! rename-on-write.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::model::Document;
use crate::prelude::*;

const INDEX_KEY: &str = ".document_index.json";

/// Process-wide index of Document records, guarded by a single lock. At most
/// one record exists per `doc_id` by construction: the map key is `doc_id`.
pub struct DocumentIndex {
    blob_store: Arc<dyn crate::blob_store::BlobStore>,
    documents: RwLock<HashMap<String, Document>>,
}

impl DocumentIndex {
    pub async fn load(blob_store: Arc<dyn crate::blob_store::BlobStore>) -> Result<Self> {
        use crate::blob_store::BlobStoreJsonExt;
        let documents: HashMap<String, Document> = blob_store
            .try_get_json(INDEX_KEY)
            .await
            .map_err(|err| anyhow!(err))?
            .unwrap_or_default();
        Ok(DocumentIndex {
            blob_store,
            documents: RwLock::new(documents),
        })
    }

    async fn persist(&self, documents: &HashMap<String, Document>) -> Result<()> {
        use crate::blob_store::BlobStoreJsonExt;
        self.blob_store
            .put_json_verified(INDEX_KEY, documents)
            .await
            .map_err(|err| anyhow!(err))
    }

    /// Insert a brand-new Document record. Overwrites only if a stale record
    /// for the same `doc_id` already exists, which should never happen past
    /// the Document Queue's dedup gate.
    pub async fn insert(&self, document: Document) -> Result<()> {
        let mut documents = self.documents.write().await;
        documents.insert(document.doc_id.clone(), document);
        self.persist(&documents).await
    }

    pub async fn get(&self, doc_id: &str) -> Option<Document> {
        self.documents.read().await.get(doc_id).cloned()
    }

    /// Apply `mutate` to the stored record for `doc_id` and persist the
    /// result. Used after every stage completion.
    pub async fn update<F>(&self, doc_id: &str, mutate: F) -> Result<Document>
    where
        F: FnOnce(&mut Document),
    {
        let mut documents = self.documents.write().await;
        let document = documents
            .get_mut(doc_id)
            .ok_or_else(|| anyhow!("no document record for {doc_id}"))?;
        mutate(document);
        let updated = document.clone();
        self.persist(&documents).await?;
        Ok(updated)
    }

    /// Remove the index record for `doc_id`. Does not touch any blobs.
    pub async fn remove(&self, doc_id: &str) -> Result<()> {
        let mut documents = self.documents.write().await;
        documents.remove(doc_id);
        self.persist(&documents).await
    }

    pub async fn list(&self) -> Vec<Document> {
        self.documents.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::LocalBlobStore;
    use crate::model::{DocumentType, IngestSource};

    async fn index() -> DocumentIndex {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn crate::blob_store::BlobStore> = Arc::new(LocalBlobStore::new(dir.path()));
        DocumentIndex::load(store).await.unwrap()
    }

    #[tokio::test]
    async fn at_most_one_record_per_doc_id() {
        let index = index().await;
        let doc = Document::new("abc".into(), "a.pdf".into(), IngestSource::Direct, DocumentType::Generic);
        index.insert(doc.clone()).await.unwrap();
        index.insert(doc).await.unwrap();
        assert_eq!(index.list().await.len(), 1);
    }

    #[tokio::test]
    async fn update_mutates_and_persists() {
        let index = index().await;
        let doc = Document::new("abc".into(), "a.pdf".into(), IngestSource::Direct, DocumentType::Generic);
        index.insert(doc).await.unwrap();
        index
            .update("abc", |d| {
                d.progress = 50;
            })
            .await
            .unwrap();
        let reloaded = index.get("abc").await.unwrap();
        assert_eq!(reloaded.progress, 50);
    }

    #[tokio::test]
    async fn remove_drops_index_record_only() {
        let index = index().await;
        let doc = Document::new("abc".into(), "a.pdf".into(), IngestSource::Direct, DocumentType::Generic);
        index.insert(doc).await.unwrap();
        index.remove("abc").await.unwrap();
        assert!(index.get("abc").await.is_none());
    }
}
