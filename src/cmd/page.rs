//! The `page` subcommand: human read/write access to one page's extraction.

use std::collections::BTreeMap;

use clap::{Args, Subcommand};

use crate::{Platform, keys, model::LastAction, page_store::PageDelta, prelude::*};

use super::StoreOpts;

/// Command line arguments for the `page` subcommand.
#[derive(Debug, Args)]
pub struct PageOpts {
    #[clap(subcommand)]
    pub action: PageAction,
}

#[derive(Debug, Subcommand)]
pub enum PageAction {
    /// Read a page's current extraction.
    Get(PageGetOpts),
    /// Apply a human edit to a page's extraction.
    Update(PageUpdateOpts),
}

#[derive(Debug, Args)]
pub struct PageGetOpts {
    /// The `doc_id` returned by `ingest`.
    pub doc_id: String,

    /// 1-based page number.
    pub page_number: usize,

    /// Account index, for loan documents with more than one account.
    #[clap(long)]
    pub account_index: Option<usize>,

    #[clap(flatten)]
    pub store_opts: StoreOpts,
}

#[derive(Debug, Args)]
pub struct PageUpdateOpts {
    /// The `doc_id` returned by `ingest`.
    pub doc_id: String,

    /// 1-based page number.
    pub page_number: usize,

    /// Account index, for loan documents with more than one account.
    #[clap(long)]
    pub account_index: Option<usize>,

    /// Set a field, as `name=value`. May be repeated.
    #[clap(long = "set", value_parser = parse_field)]
    pub set: Vec<(String, String)>,

    /// Delete a field by name. May be repeated.
    #[clap(long = "delete")]
    pub delete: Vec<String>,

    #[clap(flatten)]
    pub store_opts: StoreOpts,
}

fn parse_field(raw: &str) -> Result<(String, String)> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("expected name=value, got {raw:?}"))?;
    Ok((name.to_string(), value.to_string()))
}

/// `page get`: print a page's current extraction as JSON.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_page_get(opts: &PageGetOpts) -> Result<()> {
    let page_index = keys::page_number_to_index(opts.page_number)
        .ok_or_else(|| anyhow!("page numbers are 1-based, got {}", opts.page_number))?;
    let blob_store = opts.store_opts.build().await?;
    let platform = Platform::load(blob_store, 1).await?;
    let extraction = platform
        .page_store
        .get_page(&opts.doc_id, opts.account_index, page_index)
        .await?;
    println!("{}", serde_json::to_string_pretty(&extraction)?);
    Ok(())
}

/// `page update`: reconcile a human edit into a page's extraction.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_page_update(opts: &PageUpdateOpts) -> Result<()> {
    let page_index = keys::page_number_to_index(opts.page_number)
        .ok_or_else(|| anyhow!("page numbers are 1-based, got {}", opts.page_number))?;
    let blob_store = opts.store_opts.build().await?;
    let platform = Platform::load(blob_store, 1).await?;

    let fields: BTreeMap<String, String> = opts.set.iter().cloned().collect();
    let action_type = if !opts.delete.is_empty() && fields.is_empty() {
        LastAction::Delete
    } else if fields.is_empty() && opts.delete.is_empty() {
        LastAction::Edit
    } else {
        LastAction::Add
    };
    let delta = PageDelta {
        fields,
        deleted_fields: opts.delete.clone(),
        action_type,
    };

    let extraction = platform
        .page_store
        .update_page(&opts.doc_id, opts.account_index, page_index, delta)
        .await?;
    println!("{}", serde_json::to_string_pretty(&extraction)?);
    Ok(())
}
