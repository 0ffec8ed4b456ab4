//! The ingestion coordinator: the single choke point every upload path
//! (direct upload, S3 poller, secondary uploader) passes through before a
//! document enters the pipeline.
//!
//! Responsibilities, in order: assign a `doc_id`, pass it through the
//! Document Queue's dedup gate, detect a coarse document type, create the
//! placeholder [`Document`] record, and hand off to the scheduler with the
//! right priority.

use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::blob_store::BlobStore;
use crate::index::DocumentIndex;
use crate::keys;
use crate::model::{Document, DocumentType, IngestSource};
use crate::pipeline::ACCOUNT_RE;
use crate::prelude::*;
use crate::queue::DocumentQueue;
use crate::scheduler::Scheduler;

/// Priority handed to the scheduler: loan documents jump the queue, vital
/// records and ID cards are next, anything else (bulk) comes last.
pub(crate) fn priority_for(doc_type: DocumentType) -> u8 {
    match doc_type {
        DocumentType::Loan => 0,
        DocumentType::Generic => 2,
        _ => 1,
    }
}

/// Pulls a fast, no-OCR text sniff of a document's first page, used only to
/// decide a coarse [`DocumentType`] at ingest time. Separate from
/// [`crate::ocr::OcrEngine`] because it operates on the whole uploaded file
/// rather than a single already-split page image.
#[async_trait]
pub trait TextSniffer: Send + Sync {
    async fn sniff_first_page(&self, bytes: &[u8]) -> Result<String>;
}

/// Shells out to `pdftotext -layout -f 1 -l 1`, the production sniffer: born
/// digital PDFs yield their first page's text with no external OCR call.
pub struct PdftotextSniffer;

#[async_trait]
impl TextSniffer for PdftotextSniffer {
    async fn sniff_first_page(&self, bytes: &[u8]) -> Result<String> {
        let dir = tempfile::tempdir().context("creating sniff tempdir")?;
        let pdf_path = dir.path().join("doc.pdf");
        tokio::fs::write(&pdf_path, bytes).await.context("writing sniff pdf")?;
        let txt_path = dir.path().join("doc.txt");

        let status = tokio::process::Command::new("pdftotext")
            .arg("-layout")
            .arg("-f")
            .arg("1")
            .arg("-l")
            .arg("1")
            .arg(&pdf_path)
            .arg(&txt_path)
            .status()
            .await
            .context("running pdftotext")?;
        if !status.success() {
            return Err(anyhow!("pdftotext exited with {status}"));
        }
        tokio::fs::read_to_string(&txt_path).await.context("reading sniffed text")
    }
}

/// Treats the whole byte buffer as the first page's text. Used in tests so
/// they stay hermetic and don't require `pdftotext` on the test host.
pub struct InlineSniffer;

#[async_trait]
impl TextSniffer for InlineSniffer {
    async fn sniff_first_page(&self, bytes: &[u8]) -> Result<String> {
        Ok(String::from_utf8_lossy(bytes).to_string())
    }
}

/// Detect a document's coarse type from its first page's text, per the exact
/// keyword rules below, checked in this order so text matching more than one
/// rule still resolves deterministically:
///
/// - contains "LOAN", or two or more distinct account-number candidates ⟹ loan
/// - contains "CERTIFICATE" and one of "DEATH"/"DECEASED"/"DECEDENT"/
///   "CAUSE OF DEATH" ⟹ death_cert
/// - contains "CERTIFICATE" and ("BIRTH" or both "DATE OF BIRTH" and
///   "PLACE OF BIRTH") ⟹ birth_cert
/// - contains "CERTIFICATE" and ("MARRIAGE" or both "BRIDE" and "GROOM") ⟹
///   marriage_cert
/// - contains "DRIVER", "LICENSE", or "IDENTIFICATION CARD" ⟹ id_card
/// - otherwise generic
pub fn detect_document_type(text: &str) -> DocumentType {
    let upper = text.to_uppercase();
    let distinct_account_candidates: std::collections::HashSet<String> = ACCOUNT_RE
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| crate::model::normalize_account_number(m.as_str()))
        .collect();

    if upper.contains("LOAN") || distinct_account_candidates.len() >= 2 {
        DocumentType::Loan
    } else if upper.contains("CERTIFICATE")
        && (upper.contains("DEATH") || upper.contains("DECEASED") || upper.contains("DECEDENT"))
    {
        DocumentType::DeathCert
    } else if upper.contains("CERTIFICATE")
        && (upper.contains("BIRTH") || (upper.contains("DATE OF BIRTH") && upper.contains("PLACE OF BIRTH")))
    {
        DocumentType::BirthCert
    } else if upper.contains("CERTIFICATE")
        && (upper.contains("MARRIAGE") || (upper.contains("BRIDE") && upper.contains("GROOM")))
    {
        DocumentType::MarriageCert
    } else if upper.contains("DRIVER") || upper.contains("LICENSE") || upper.contains("IDENTIFICATION CARD") {
        DocumentType::IdCard
    } else {
        DocumentType::Generic
    }
}

/// Derive a 12-hex-character `doc_id` from the filename and an ingestion
/// timestamp. Two uploads of the same filename at different instants get
/// different ids; the Document Queue is what actually prevents duplicate
/// processing, not this hash.
pub fn derive_doc_id(filename: &str, timestamp: chrono::DateTime<chrono::Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(filename.as_bytes());
    hasher.update(timestamp.timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
    let digest = hasher.finalize();
    digest.iter().take(6).map(|b| format!("{b:02x}")).collect()
}

/// Coordinates every ingestion path. Construct one per [`crate::Platform`]
/// and call [`Ingestor::ingest`] from the upload handler, the poller, and
/// the secondary uploader alike.
pub struct Ingestor {
    blob_store: Arc<dyn BlobStore>,
    index: Arc<DocumentIndex>,
    queue: Arc<DocumentQueue>,
    scheduler: Arc<Scheduler>,
    sniffer: Arc<dyn TextSniffer>,
}

impl Ingestor {
    pub fn new(
        blob_store: Arc<dyn BlobStore>,
        index: Arc<DocumentIndex>,
        queue: Arc<DocumentQueue>,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        Ingestor::with_sniffer(blob_store, index, queue, scheduler, Arc::new(PdftotextSniffer))
    }

    pub fn with_sniffer(
        blob_store: Arc<dyn BlobStore>,
        index: Arc<DocumentIndex>,
        queue: Arc<DocumentQueue>,
        scheduler: Arc<Scheduler>,
        sniffer: Arc<dyn TextSniffer>,
    ) -> Self {
        Ingestor { blob_store, index, queue, scheduler, sniffer }
    }

    /// Register and enqueue a document already sitting at `uploads/{filename}`
    /// in the blob store. Returns `None` if the Document Queue's dedup gate
    /// rejected it (already processing or already completed).
    #[instrument(level = "info", skip(self))]
    pub async fn ingest(&self, filename: &str, source: IngestSource) -> Result<Option<String>> {
        let doc_id = derive_doc_id(filename, chrono::Utc::now());

        if !self.queue.add(&doc_id, filename, source).await? {
            info!(doc_id, filename, "document already queued or completed, skipping");
            return Ok(None);
        }

        let upload_key = keys::upload_key(filename);
        let bytes = match self.blob_store.get(&upload_key).await {
            Ok(bytes) => bytes,
            Err(_) => {
                self.queue.mark_failed(&doc_id, "upload object missing at handoff time").await?;
                return Err(anyhow!("no uploaded object at {}", upload_key));
            }
        };

        let first_page_text = self.sniffer.sniff_first_page(&bytes).await.unwrap_or_default();
        let doc_type = detect_document_type(&first_page_text);
        let document = Document::new(doc_id.clone(), filename.to_string(), source, doc_type);
        self.index.insert(document).await?;

        self.queue.mark_processing(&doc_id).await?;
        self.scheduler.enqueue(&doc_id, priority_for(doc_type)).await?;

        info!(doc_id, filename, ?doc_type, "document ingested and enqueued");
        Ok(Some(doc_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::LocalBlobStore;

    async fn platform() -> (Ingestor, Arc<dyn BlobStore>) {
        let dir = tempfile::tempdir().unwrap();
        let blob_store: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::new(dir.path()));
        let index = Arc::new(DocumentIndex::load(blob_store.clone()).await.unwrap());
        let queue = Arc::new(DocumentQueue::load(blob_store.clone()).await.unwrap());
        let scheduler = Arc::new(Scheduler::new(1));
        let ingestor =
            Ingestor::with_sniffer(blob_store.clone(), index, queue, scheduler, Arc::new(InlineSniffer));
        (ingestor, blob_store)
    }

    #[tokio::test]
    async fn detects_document_type_from_first_page_text() {
        assert_eq!(detect_document_type("LOAN AGREEMENT\nAccount Number: 99812341"), DocumentType::Loan);
        assert_eq!(
            detect_document_type("account # 1234\naccount no 5678"),
            DocumentType::Loan,
            "two or more distinct account-number candidates imply a loan document"
        );
        assert_eq!(
            detect_document_type("Statement for account # 1234\nPage 2 of 2, account # 1234 continued"),
            DocumentType::Generic,
            "the same account number repeated is one candidate, not two"
        );
        assert_eq!(
            detect_document_type("STATE OF NEW YORK\nCERTIFICATE OF DEATH\nCause of Death: ..."),
            DocumentType::DeathCert
        );
        assert_eq!(
            detect_document_type("CERTIFICATE OF LIVE BIRTH\nDate of Birth: 1990-01-01"),
            DocumentType::BirthCert
        );
        assert_eq!(
            detect_document_type("CERTIFICATE OF MARRIAGE\nBride: Jane\nGroom: John"),
            DocumentType::MarriageCert
        );
        assert_eq!(detect_document_type("DRIVER LICENSE\nClass: D"), DocumentType::IdCard);
        assert_eq!(detect_document_type("Dear Sir or Madam, please find enclosed..."), DocumentType::Generic);
    }

    #[tokio::test]
    async fn ingest_fails_loudly_when_the_upload_object_is_missing() {
        let (ingestor, _blob_store) = platform().await;
        let err = ingestor.ingest("ghost.pdf", IngestSource::Direct).await.unwrap_err();
        assert!(err.to_string().contains("no uploaded object"));
    }

    #[tokio::test]
    async fn ingest_creates_a_document_record_and_enqueues_it() {
        let (ingestor, blob_store) = platform().await;
        blob_store.put(&keys::upload_key("loan.pdf"), b"LOAN AGREEMENT".to_vec(), "application/pdf").await.unwrap();
        let doc_id = ingestor.ingest("loan.pdf", IngestSource::Direct).await.unwrap();
        assert!(doc_id.is_some());
    }

    #[tokio::test]
    async fn doc_id_is_twelve_hex_characters() {
        let id = derive_doc_id("a.pdf", chrono::Utc::now());
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
