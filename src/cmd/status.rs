//! The `status` subcommand.

use clap::Args;

use crate::{Platform, prelude::*};

use super::StoreOpts;

/// Command line arguments for the `status` subcommand.
#[derive(Debug, Args)]
pub struct StatusOpts {
    /// The `doc_id` returned by `ingest`.
    pub doc_id: String,

    #[clap(flatten)]
    pub store_opts: StoreOpts,
}

/// The `status` subcommand: print a document's current stage, progress, and
/// queue state as JSON.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_status(opts: &StatusOpts) -> Result<()> {
    let blob_store = opts.store_opts.build().await?;
    let platform = Platform::load(blob_store, 1).await?;

    let document = platform
        .index
        .get(&opts.doc_id)
        .await
        .ok_or_else(|| anyhow!("no document with doc_id {:?}", opts.doc_id))?;
    let queue_entry = platform.queue.status(&opts.doc_id).await;

    let report = json!({
        "doc_id": document.doc_id,
        "filename": document.filename,
        "doc_type": document.doc_type,
        "stage": document.stage,
        "progress": document.progress,
        "total_page_count": document.total_page_count,
        "account_count": document.accounts.len(),
        "unassociated_pages": document.unassociated_pages,
        "error": document.error,
        "queue_status": queue_entry.map(|entry| entry.status),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
