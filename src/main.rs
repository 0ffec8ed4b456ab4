use std::str::FromStr;

use clap::{Parser, Subcommand};
use idp_core::{
    cmd::{
        ingest::{IngestOpts, cmd_ingest},
        page::{PageAction, PageOpts, cmd_page_get, cmd_page_update},
        poll::{PollOpts, cmd_poll},
        status::{StatusOpts, cmd_status},
        work::{WorkOpts, cmd_work},
    },
    ui::Ui,
};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use idp_core::prelude::*;

/// Intelligent document processing: ingest, OCR/LLM extraction, and
/// human-edit reconciliation for loan statements and vital records.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - OPENAI_API_BASE (optional): Override the server URL.
  - OPENAI_API_KEY: The OpenAI key to use.

  Standard AWS environment variables and credential files
  are used for AWS-based tools like Textract and Bedrock.

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// Upload a file and enqueue it for processing.
    Ingest(IngestOpts),
    /// Scan for objects dropped by a secondary uploader and ingest them.
    Poll(PollOpts),
    /// Run the OCR/LLM pipeline over whatever is queued.
    Work(WorkOpts),
    /// Print a document's current stage and progress.
    Status(StatusOpts),
    /// Read or edit a page's extraction.
    Page(PageOpts),
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    let ui = Ui::init();

    // Initialize tracing.
    let directive = Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);

    tracing_subscriber::registry().with(subscriber).init();

    real_main(ui).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    // `work` runs a worker loop with its own progress reporting; every other
    // subcommand prints a single JSON result to stdout.
    if !matches!(opts.subcmd, Cmd::Work(_)) {
        ui.hide_progress_bars();
    }

    match &opts.subcmd {
        Cmd::Ingest(opts) => cmd_ingest(opts).await?,
        Cmd::Poll(opts) => cmd_poll(opts).await?,
        Cmd::Work(opts) => cmd_work(opts).await?,
        Cmd::Status(opts) => cmd_status(opts).await?,
        Cmd::Page(opts) => match &opts.action {
            PageAction::Get(get_opts) => cmd_page_get(get_opts).await?,
            PageAction::Update(update_opts) => cmd_page_update(update_opts).await?,
        },
    }
    Ok(())
}
