//! The OCR adapter: turns page images into text, backed by a cache so a
//! fully-cached document performs zero external OCR calls.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use keen_retry::{ExponentialJitter, RetryResult};
use tokio::sync::Mutex;

use crate::blob_store::{BlobStore, BlobStoreJsonExt};
use crate::errors::PipelineError;
use crate::keys;
use crate::prelude::*;

/// Per-page OCR text plus the word-level confidences it was built from.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OcrPageResult {
    pub text: String,
    #[serde(default)]
    pub word_confidences: Vec<f32>,
}

/// `{page_index -> text}`, the on-disk shape of the OCR cache.
type OcrCache = BTreeMap<usize, OcrPageResult>;

/// Timeout for a single page's external OCR call.
const OCR_PAGE_TIMEOUT: Duration = Duration::from_secs(60);
/// Maximum retry attempts for a transient OCR failure.
const OCR_MAX_RETRIES: usize = 5;

/// Errors specific to text extraction, malformed output is never retried.
#[derive(Debug, thiserror::Error)]
pub enum OcrError {
    #[error("OCR backend unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),

    #[error("OCR produced malformed output for page {page_index}: {reason}")]
    Malformed { page_index: usize, reason: String },
}

impl From<OcrError> for PipelineError {
    fn from(err: OcrError) -> Self {
        match err {
            OcrError::Unavailable(_) => PipelineError::transient(err),
            OcrError::Malformed { .. } => PipelineError::permanent(err),
        }
    }
}

/// A backend capable of turning page image bytes into text. Production code
/// points this at Textract; tests and local development use an inline
/// PDF-text engine or a stub.
#[async_trait]
pub trait OcrEngine: Send + Sync + 'static {
    async fn recognize(&self, image_bytes: &[u8]) -> Result<OcrPageResult, OcrError>;
}

/// Extracts embedded PDF text with no external call. Used as the "fast path"
/// before falling back to a scanned-page OCR engine; also the engine tests
/// exercise to keep them hermetic.
pub struct InlineTextEngine;

#[async_trait]
impl OcrEngine for InlineTextEngine {
    async fn recognize(&self, image_bytes: &[u8]) -> Result<OcrPageResult, OcrError> {
        let text = String::from_utf8_lossy(image_bytes).to_string();
        Ok(OcrPageResult {
            text,
            word_confidences: Vec::new(),
        })
    }
}

/// The OCR adapter: consults the per-document text cache before calling out,
/// and writes results back so repeated pipeline runs are free.
pub struct OcrAdapter {
    blob_store: Arc<dyn BlobStore>,
    engine: Arc<dyn OcrEngine>,
    /// One lock per `doc_id`, so concurrent pages of the same document
    /// serialize their cache read-modify-write instead of racing and
    /// silently dropping each other's entries.
    cache_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl OcrAdapter {
    pub fn new(blob_store: Arc<dyn BlobStore>, engine: Arc<dyn OcrEngine>) -> Self {
        OcrAdapter {
            blob_store,
            engine,
            cache_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn cache_lock(&self, doc_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.cache_locks.lock().await;
        locks.entry(doc_id.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    async fn load_cache(&self, doc_id: &str) -> Result<OcrCache, PipelineError> {
        let key = keys::ocr_cache_key(doc_id);
        self.blob_store
            .try_get_json(&key)
            .await
            .map(|opt| opt.unwrap_or_default())
            .map_err(Into::into)
    }

    async fn save_cache(&self, doc_id: &str, cache: &OcrCache) -> Result<(), PipelineError> {
        let key = keys::ocr_cache_key(doc_id);
        self.blob_store
            .put_json_verified(&key, cache)
            .await
            .map_err(Into::into)
    }

    /// Extract text for one page, serving the cache first. On a cache miss,
    /// calls the backend with exponential-backoff retry, then writes the
    /// result back.
    #[instrument(level = "debug", skip(self, image_bytes))]
    pub async fn extract_page(
        &self,
        doc_id: &str,
        page_index: usize,
        image_bytes: &[u8],
    ) -> Result<OcrPageResult, PipelineError> {
        let lock = self.cache_lock(doc_id).await;
        let _guard = lock.lock().await;

        let mut cache = self.load_cache(doc_id).await?;
        if let Some(cached) = cache.get(&page_index) {
            return Ok(cached.clone());
        }

        let result = self.recognize_with_retry(image_bytes).await?;
        cache.insert(page_index, result.clone());
        self.save_cache(doc_id, &cache).await?;
        Ok(result)
    }

    async fn recognize_with_retry(&self, image_bytes: &[u8]) -> Result<OcrPageResult, PipelineError> {
        let jitter = ExponentialJitter::FromBackoffRange {
            backoff_range_millis: 250..=4_000,
            re_attempts: OCR_MAX_RETRIES as u32,
            jitter_ratio: 0.2,
        };

        let outcome = keen_retry::RetryConsumerResult::from(
            tokio::time::timeout(OCR_PAGE_TIMEOUT, self.engine.recognize(image_bytes))
                .await
                .map_err(|_| OcrError::Unavailable(anyhow!("OCR call timed out")))
                .and_then(|inner| inner),
        )
        .retry_with(|| async {
            tokio::time::timeout(OCR_PAGE_TIMEOUT, self.engine.recognize(image_bytes))
                .await
                .map_err(|_| OcrError::Unavailable(anyhow!("OCR call timed out")))
                .and_then(|inner| inner)
        })
        .with_exponential_jitter(|| jitter.clone())
        .await;

        match outcome {
            RetryResult::Ok { output, .. } => Ok(output),
            RetryResult::Fatal { input: _, error } => Err(error.into()),
            RetryResult::Unrecoverable { input: _, error, .. } => Err(error.into()),
        }
    }
}

/// Recognizes page text via Amazon Textract's `AnalyzeDocument` call,
/// requesting `LAYOUT` blocks and reassembling them in document order.
pub struct TextractOcrEngine {
    client: aws_sdk_textract::Client,
}

impl TextractOcrEngine {
    pub async fn new() -> Result<Self> {
        let config = crate::aws::load_aws_config().await?;
        Ok(TextractOcrEngine { client: aws_sdk_textract::Client::new(&config) })
    }
}

#[async_trait]
impl OcrEngine for TextractOcrEngine {
    async fn recognize(&self, image_bytes: &[u8]) -> Result<OcrPageResult, OcrError> {
        use aws_sdk_textract::primitives::Blob;
        use aws_sdk_textract::types::{Document, FeatureType};

        let document = Document::builder().bytes(Blob::new(image_bytes)).build();
        let response = self
            .client
            .analyze_document()
            .document(document)
            .feature_types(FeatureType::Layout)
            .send()
            .await
            .map_err(|err| OcrError::Unavailable(anyhow!(err)))?;

        let blocks = response.blocks.unwrap_or_default();
        let text = layout_text(&blocks).map_err(|reason| OcrError::Malformed { page_index: 0, reason })?;
        Ok(OcrPageResult { text, word_confidences: word_confidences(&blocks) })
    }
}

fn word_confidences(blocks: &[aws_sdk_textract::types::Block]) -> Vec<f32> {
    blocks
        .iter()
        .filter(|b| b.block_type.as_ref().map(|t| t.as_str()) == Some("WORD"))
        .filter_map(|b| b.confidence)
        .collect()
}

/// Walks Textract's block relationship graph and reassembles `LAYOUT_*`
/// blocks in reading order, recursing into each block's children.
fn layout_text(blocks: &[aws_sdk_textract::types::Block]) -> Result<String, String> {
    use aws_sdk_textract::types::RelationshipType;
    use std::collections::HashMap;

    let by_id: HashMap<&str, &aws_sdk_textract::types::Block> =
        blocks.iter().filter_map(|b| b.id.as_deref().map(|id| (id, b))).collect();

    let mut out = String::new();
    for block in blocks {
        let is_layout = block
            .block_type
            .as_ref()
            .map(|t| t.as_str().starts_with("LAYOUT_"))
            .unwrap_or(false);
        if !is_layout {
            continue;
        }
        write_block(block, &by_id, &mut out)?;
        if !out.ends_with('\n') {
            out.push('\n');
        }
    }
    Ok(out)
}

fn write_block(
    block: &aws_sdk_textract::types::Block,
    by_id: &std::collections::HashMap<&str, &aws_sdk_textract::types::Block>,
    out: &mut String,
) -> Result<(), String> {
    use aws_sdk_textract::types::{BlockType, RelationshipType};

    if let Some(text) = block.text.as_deref() {
        out.push_str(text);
        match block.block_type {
            Some(BlockType::Line) => out.push('\n'),
            Some(BlockType::Word) => out.push(' '),
            _ => {}
        }
    }

    for relationship in block.relationships.iter().flatten() {
        if relationship.r#type() != Some(&RelationshipType::Child) {
            continue;
        }
        for id in relationship.ids.iter().flatten() {
            let child = by_id
                .get(id.as_str())
                .ok_or_else(|| format!("Textract child block {id} not found"))?;
            write_block(child, by_id, out)?;
        }
    }
    Ok(())
}

/// Shells out to `pdftotext -layout`, the fast path for born-digital PDF
/// pages: no external OCR call, and layout-preserving enough for the LLM
/// adapter's field extraction.
pub struct PdfToTextEngine;

#[async_trait]
impl OcrEngine for PdfToTextEngine {
    async fn recognize(&self, image_bytes: &[u8]) -> Result<OcrPageResult, OcrError> {
        let dir = tempfile::tempdir()
            .map_err(|err| OcrError::Unavailable(anyhow!(err)))?;
        let pdf_path = dir.path().join("page.pdf");
        tokio::fs::write(&pdf_path, image_bytes)
            .await
            .map_err(|err| OcrError::Unavailable(anyhow!(err)))?;
        let txt_path = dir.path().join("page.txt");

        let status = tokio::process::Command::new("pdftotext")
            .arg("-layout")
            .arg(&pdf_path)
            .arg(&txt_path)
            .status()
            .await
            .map_err(|err| OcrError::Unavailable(anyhow!(err)))?;
        if !status.success() {
            return Err(OcrError::Unavailable(anyhow!("pdftotext exited with {status}")));
        }

        let text = tokio::fs::read_to_string(&txt_path)
            .await
            .map_err(|err| OcrError::Malformed { page_index: 0, reason: err.to_string() })?;
        Ok(OcrPageResult { text, word_confidences: Vec::new() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::LocalBlobStore;

    struct FlakyEngine {
        attempts: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl OcrEngine for FlakyEngine {
        async fn recognize(&self, _image_bytes: &[u8]) -> Result<OcrPageResult, OcrError> {
            let n = self.attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n == 0 {
                Err(OcrError::Unavailable(anyhow!("simulated outage")))
            } else {
                Ok(OcrPageResult {
                    text: "recovered".to_string(),
                    word_confidences: vec![],
                })
            }
        }
    }

    struct AlwaysMalformedEngine;

    #[async_trait]
    impl OcrEngine for AlwaysMalformedEngine {
        async fn recognize(&self, _image_bytes: &[u8]) -> Result<OcrPageResult, OcrError> {
            Err(OcrError::Malformed {
                page_index: 0,
                reason: "no text blocks".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn cache_hit_avoids_engine_call() {
        let dir = tempfile::tempdir().unwrap();
        let blob_store: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::new(dir.path()));
        let engine = Arc::new(InlineTextEngine);
        let adapter = OcrAdapter::new(blob_store.clone(), engine);
        let first = adapter.extract_page("d1", 0, b"hello").await.unwrap();
        assert_eq!(first.text, "hello");

        // Replace the cache entry directly so a second call proves it came
        // from the cache, not the engine.
        let mut cache: OcrCache = BTreeMap::new();
        cache.insert(0, OcrPageResult { text: "from cache".to_string(), word_confidences: vec![] });
        blob_store.put_json_verified(&keys::ocr_cache_key("d1"), &cache).await.unwrap();

        let second = adapter.extract_page("d1", 0, b"hello").await.unwrap();
        assert_eq!(second.text, "from cache");
    }

    #[tokio::test]
    async fn malformed_output_is_a_permanent_failure() {
        let dir = tempfile::tempdir().unwrap();
        let blob_store: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::new(dir.path()));
        let adapter = OcrAdapter::new(blob_store, Arc::new(AlwaysMalformedEngine));
        let err = adapter.extract_page("d1", 0, b"x").await.unwrap_err();
        assert!(!err.is_transient());
    }

    struct SlowEngine;

    #[async_trait]
    impl OcrEngine for SlowEngine {
        async fn recognize(&self, image_bytes: &[u8]) -> Result<OcrPageResult, OcrError> {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            Ok(OcrPageResult { text: String::from_utf8_lossy(image_bytes).to_string(), word_confidences: vec![] })
        }
    }

    #[tokio::test]
    async fn concurrent_pages_of_the_same_document_both_land_in_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let blob_store: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::new(dir.path()));
        let adapter = Arc::new(OcrAdapter::new(blob_store, Arc::new(SlowEngine)));

        let a = {
            let adapter = adapter.clone();
            tokio::spawn(async move { adapter.extract_page("d1", 0, b"page-zero").await })
        };
        let b = {
            let adapter = adapter.clone();
            tokio::spawn(async move { adapter.extract_page("d1", 1, b"page-one").await })
        };
        let (first, second) = tokio::join!(a, b);
        assert_eq!(first.unwrap().unwrap().text, "page-zero");
        assert_eq!(second.unwrap().unwrap().text, "page-one");

        // Neither call's cache save should have clobbered the other's entry.
        let cache = adapter.load_cache("d1").await.unwrap();
        assert_eq!(cache.get(&0).map(|r| r.text.as_str()), Some("page-zero"));
        assert_eq!(cache.get(&1).map(|r| r.text.as_str()), Some("page-one"));
    }
}
