//! The `work` subcommand.

use std::sync::Arc;

use clap::Args;

use crate::{
    Platform,
    llm::PromptTemplate,
    pipeline::{PipelineExecutor, SinglePagePdfSplitter},
    prelude::*,
    prompts,
};

use super::{LlmOpts, OcrOpts, StoreOpts};

/// Command line arguments for the `work` subcommand.
#[derive(Debug, Args)]
pub struct WorkOpts {
    #[clap(flatten)]
    pub store_opts: StoreOpts,

    #[clap(flatten)]
    pub llm_opts: LlmOpts,

    #[clap(flatten)]
    pub ocr_opts: OcrOpts,

    /// Custom loan-extraction prompt, in TOML. Defaults to the built-in prompt.
    #[clap(long)]
    pub loan_prompt_path: Option<PathBuf>,

    /// Custom generic-document prompt, in TOML. Defaults to the built-in prompt.
    #[clap(long)]
    pub generic_prompt_path: Option<PathBuf>,

    /// How many documents to process concurrently.
    #[clap(long, default_value = "5")]
    pub max_workers: usize,
}

async fn load_prompt(path: &Option<PathBuf>, default: fn() -> Result<PromptTemplate>) -> Result<PromptTemplate> {
    match path {
        Some(path) => {
            let contents = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read {path:?}"))?;
            let version = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "custom".to_string());
            PromptTemplate::from_toml_str(version, &contents)
        }
        None => default(),
    }
}

/// The `work` subcommand: run the staged OCR/LLM pipeline over whatever is
/// queued, replaying anything left over from a previous run, until the queue
/// drains.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_work(opts: &WorkOpts) -> Result<()> {
    let blob_store = opts.store_opts.build().await?;
    let platform = Platform::load(blob_store.clone(), opts.max_workers).await?;

    let ocr = opts.ocr_opts.build(blob_store.clone()).await?;
    let llm = opts.llm_opts.build().await?;
    let loan_prompt = Arc::new(load_prompt(&opts.loan_prompt_path, prompts::default_loan_prompt).await?);
    let generic_prompt = Arc::new(load_prompt(&opts.generic_prompt_path, prompts::default_generic_prompt).await?);

    let executor = Arc::new(PipelineExecutor::new(
        platform.blob_store.clone(),
        platform.index.clone(),
        platform.queue.clone(),
        ocr,
        llm,
        Arc::new(SinglePagePdfSplitter),
        loan_prompt,
        generic_prompt,
    ));

    let replayed = platform.replay_pending().await?;
    info!(replayed, "replayed pending documents from the persisted queue");

    let scheduler = platform.scheduler.clone();
    scheduler.clone().run(move |scheduler, doc_id| {
        let executor = executor.clone();
        async move { executor.run_document(&scheduler, &doc_id).await }
    }).await;

    Ok(())
}
