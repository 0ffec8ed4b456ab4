//! Command-line entry points.

use std::sync::Arc;

use clap::{Args, ValueEnum};

use crate::{
    blob_store::{BlobStore, LocalBlobStore, S3BlobStore},
    llm::{BedrockDriver, LlmAdapter, LlmDriver, OpenAiDriver},
    ocr::{OcrAdapter, OcrEngine, PdfToTextEngine, TextractOcrEngine},
    prelude::*,
    rate_limit::RateLimit,
};

pub mod ingest;
pub mod page;
pub mod poll;
pub mod status;
pub mod work;

/// Which blob store backend to talk to.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "snake_case")]
pub enum StoreBackend {
    /// A directory on local disk. Good for development and tests.
    #[default]
    Local,
    /// An S3 bucket.
    S3,
}

/// Where documents, the index, the queue, and caches all live.
#[derive(Debug, Clone, Args)]
pub struct StoreOpts {
    /// Which blob store backend to use.
    #[clap(long, value_enum, default_value_t = StoreBackend::default(), env = "IDP_STORE_BACKEND")]
    pub backend: StoreBackend,

    /// Local-disk root directory, used when `--backend local`.
    #[clap(long, default_value = "./idp-data", env = "IDP_LOCAL_ROOT")]
    pub local_root: PathBuf,

    /// S3 bucket name, required when `--backend s3`.
    #[clap(long, env = "IDP_S3_BUCKET")]
    pub bucket: Option<String>,
}

impl StoreOpts {
    pub async fn build(&self) -> Result<Arc<dyn BlobStore>> {
        match self.backend {
            StoreBackend::Local => Ok(Arc::new(LocalBlobStore::new(&self.local_root))),
            StoreBackend::S3 => {
                let bucket = self
                    .bucket
                    .as_deref()
                    .ok_or_else(|| anyhow!("--bucket is required when --backend s3 is used"))?;
                Ok(Arc::new(S3BlobStore::new(bucket).await?))
            }
        }
    }
}

/// Which LLM backend drives the extraction stages.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "snake_case")]
pub enum LlmDriverType {
    /// OpenAI's `/chat/completions` endpoint (also works with OpenAI-compatible gateways).
    #[default]
    OpenAi,
    /// AWS Bedrock's Converse API.
    Bedrock,
}

/// Options selecting and configuring the LLM extraction backend.
#[derive(Debug, Clone, Args)]
pub struct LlmOpts {
    /// The LLM driver to use.
    #[clap(long, value_enum, default_value_t = LlmDriverType::default(), env = "IDP_LLM_DRIVER")]
    pub llm_driver: LlmDriverType,

    /// Model (or Bedrock model ID) to extract with.
    #[clap(long, default_value = "gpt-4o-mini", env = "IDP_LLM_MODEL")]
    pub model: String,

    /// Rate limit for LLM calls, of the form "10/s" or "2000/m".
    #[clap(long, default_value = "5/s")]
    pub llm_rate_limit: RateLimit,
}

impl LlmOpts {
    pub async fn build(&self) -> Result<Arc<LlmAdapter>> {
        let driver: Arc<dyn LlmDriver> = match self.llm_driver {
            LlmDriverType::OpenAi => Arc::new(OpenAiDriver::new(self.model.clone())),
            LlmDriverType::Bedrock => Arc::new(BedrockDriver::new(self.model.clone()).await?),
        };
        Ok(Arc::new(LlmAdapter::new(driver, self.llm_rate_limit.clone())))
    }
}

/// Which OCR backend reads page text.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "snake_case")]
pub enum OcrEngineType {
    /// Shell out to `pdftotext -layout`. No AWS credentials required.
    #[default]
    Pdftotext,
    /// Amazon Textract's `AnalyzeDocument` with `LAYOUT` blocks.
    Textract,
}

/// Options selecting the OCR backend.
#[derive(Debug, Clone, Args)]
pub struct OcrOpts {
    /// The OCR engine to use.
    #[clap(long, value_enum, default_value_t = OcrEngineType::default(), env = "IDP_OCR_ENGINE")]
    pub ocr_engine: OcrEngineType,
}

impl OcrOpts {
    pub async fn build(&self, blob_store: Arc<dyn BlobStore>) -> Result<Arc<OcrAdapter>> {
        let engine: Arc<dyn OcrEngine> = match self.ocr_engine {
            OcrEngineType::Pdftotext => Arc::new(PdfToTextEngine),
            OcrEngineType::Textract => Arc::new(TextractOcrEngine::new().await?),
        };
        Ok(Arc::new(OcrAdapter::new(blob_store, engine)))
    }
}
