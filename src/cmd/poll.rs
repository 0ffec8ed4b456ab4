//! The `poll` subcommand.

use std::sync::Arc;

use clap::Args;

use crate::{Platform, ingest::Ingestor, poller::S3Poller, prelude::*};

use super::StoreOpts;

/// Command line arguments for the `poll` subcommand.
#[derive(Debug, Args)]
pub struct PollOpts {
    #[clap(flatten)]
    pub store_opts: StoreOpts,

    /// Keep polling every 30 seconds instead of scanning once and exiting.
    #[clap(long)]
    pub forever: bool,
}

/// The `poll` subcommand: scan `uploads/` for objects the secondary uploader
/// dropped and nobody has ingested yet.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_poll(opts: &PollOpts) -> Result<()> {
    let blob_store = opts.store_opts.build().await?;
    let platform = Platform::load(blob_store.clone(), 1).await?;
    let ingestor = Arc::new(Ingestor::new(
        platform.blob_store.clone(),
        platform.index.clone(),
        platform.queue.clone(),
        platform.scheduler.clone(),
    ));
    let poller = Arc::new(S3Poller::new(blob_store, ingestor));

    if opts.forever {
        poller.run_forever().await;
    } else {
        poller.scan_once().await?;
    }
    Ok(())
}
