//! The `ingest` subcommand.

use std::sync::Arc;

use clap::Args;

use crate::{
    Platform,
    ingest::Ingestor,
    keys,
    model::IngestSource,
    prelude::*,
};

use super::StoreOpts;

/// Command line arguments for the `ingest` subcommand.
#[derive(Debug, Args)]
pub struct IngestOpts {
    /// Path to the document to upload and ingest.
    pub file: PathBuf,

    #[clap(flatten)]
    pub store_opts: StoreOpts,
}

/// The `ingest` subcommand: upload a file to the blob store and enqueue it
/// for processing, then print the assigned `doc_id` (or nothing, if the
/// queue's dedup gate already has it).
#[instrument(level = "debug", skip_all)]
pub async fn cmd_ingest(opts: &IngestOpts) -> Result<()> {
    let blob_store = opts.store_opts.build().await?;
    let filename = opts
        .file
        .file_name()
        .ok_or_else(|| anyhow!("{:?} has no file name", opts.file))?
        .to_string_lossy()
        .into_owned();

    let bytes = tokio::fs::read(&opts.file)
        .await
        .with_context(|| format!("failed to read {:?}", opts.file))?;
    blob_store
        .put(&keys::upload_key(&filename), bytes, "application/pdf")
        .await?;

    let platform = Platform::load(blob_store, 1).await?;
    let ingestor = Arc::new(Ingestor::new(
        platform.blob_store.clone(),
        platform.index.clone(),
        platform.queue.clone(),
        platform.scheduler.clone(),
    ));

    match ingestor.ingest(&filename, IngestSource::Direct).await? {
        Some(doc_id) => println!("{doc_id}"),
        None => info!(filename, "already queued or completed, nothing to do"),
    }
    Ok(())
}
