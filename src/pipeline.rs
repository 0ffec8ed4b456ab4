//! The pipeline executor: drives a single document through its stage graph,
//! writing page extractions and progress as it goes.
//!
//! Two stage graphs exist:
//!
//! * loan: `Ingested -> SOcr -> SSplit -> SMap -> SExtract -> Completed`
//! * generic (vital records, ID cards, anything else): `Ingested -> SOcr ->
//!   SExtractWhole -> Completed`
//!
//! A stage that fails transiently is retried in place up to
//! [`MAX_STAGE_RETRIES`] times before the failure is escalated to
//! `PipelineError::Permanent` and the document is marked `Failed`.
//! Cancellation is checked between pages and between batches, never
//! mid-call, so a call already in flight always finishes cleanly.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::sync::Semaphore;

use crate::blob_store::{BlobStore, BlobStoreJsonExt};
use crate::errors::PipelineError;
use crate::index::DocumentIndex;
use crate::keys;
use crate::llm::{BATCH_PAGES, LlmAdapter, PromptTemplate};
use crate::model::{Account, DocumentType, Holder, LastAction, PageExtraction, Stage};
use crate::name_match::{self, Candidate};
use crate::ocr::OcrAdapter;
use crate::prelude::*;
use crate::queue::DocumentQueue;
use crate::scheduler::Scheduler;

/// Default number of pages processed concurrently during OCR. Overridable
/// per [`PipelineExecutor`] instance; see [`WorkerCounts`].
pub const DEFAULT_OCR_WORKERS: usize = 5;
/// Default number of batches processed concurrently during LLM extraction.
pub const DEFAULT_LLM_WORKERS: usize = 3;
/// Default number of pages grouped into a single LLM invocation.
pub const DEFAULT_BATCH_PAGES: usize = crate::llm::BATCH_PAGES;
/// Attempts a stage gets before a transient error is escalated to permanent.
const MAX_STAGE_RETRIES: usize = 3;

/// Per-document, per-document-pipeline-batch concurrency, threaded in from
/// the CLI's `work` subcommand. Kept as a small plain struct that can be
/// passed down to where it's used, rather than as global mutable constants.
#[derive(Debug, Clone, Copy)]
pub struct WorkerCounts {
    pub ocr_workers: usize,
    pub llm_workers: usize,
    pub batch_pages: usize,
}

impl Default for WorkerCounts {
    fn default() -> Self {
        WorkerCounts {
            ocr_workers: DEFAULT_OCR_WORKERS,
            llm_workers: DEFAULT_LLM_WORKERS,
            batch_pages: DEFAULT_BATCH_PAGES,
        }
    }
}

pub(crate) static ACCOUNT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)account\s*(?:number|no\.?|#)?\s*[:#]?\s*([A-Za-z0-9-]{4,})").unwrap());
static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^\s*(?:borrower|name|applicant)\s*[:#]?\s*(.+)$").unwrap());
static SSN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(\d{3}-?\d{2}-?\d{4})\b").unwrap());

/// Splits the raw uploaded bytes into per-page byte slices. Production PDF
/// rendering/paging lives behind this seam so the executor never needs to
/// know about page-image formats. The default treats the whole upload as one
/// page, which is correct for the single-page vital records and ID cards the
/// generic pipeline mostly handles.
#[async_trait]
pub trait PageSplitter: Send + Sync + 'static {
    async fn split(&self, bytes: &[u8]) -> Result<Vec<Vec<u8>>>;
}

pub struct SinglePagePdfSplitter;

#[async_trait]
impl PageSplitter for SinglePagePdfSplitter {
    async fn split(&self, bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
        Ok(vec![bytes.to_vec()])
    }
}

async fn with_stage_retry<F, Fut, T>(doc_id: &str, stage: &str, f: F) -> Result<T, PipelineError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, PipelineError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < MAX_STAGE_RETRIES => {
                warn!(doc_id, stage, attempt, error = %err, "stage attempt failed, retrying");
                tokio::time::sleep(Duration::from_millis(250 * attempt as u64)).await;
            }
            Err(PipelineError::Transient(inner)) => {
                error!(doc_id, stage, attempts = attempt, "stage exhausted retries, escalating to permanent");
                return Err(PipelineError::Permanent(inner));
            }
            Err(other) => return Err(other),
        }
    }
}

fn is_cancelled(flag: &std::sync::atomic::AtomicBool) -> bool {
    flag.load(std::sync::atomic::Ordering::SeqCst)
}

/// Assembles everything one document needs passed through the stage graph:
/// the OCR/LLM adapters, a pair of versioned prompts (loan vs generic), and
/// the shared platform state.
pub struct PipelineExecutor {
    blob_store: Arc<dyn BlobStore>,
    index: Arc<DocumentIndex>,
    queue: Arc<DocumentQueue>,
    ocr: Arc<OcrAdapter>,
    llm: Arc<LlmAdapter>,
    page_splitter: Arc<dyn PageSplitter>,
    loan_prompt: Arc<PromptTemplate>,
    generic_prompt: Arc<PromptTemplate>,
    workers: WorkerCounts,
}

impl PipelineExecutor {
    pub fn new(
        blob_store: Arc<dyn BlobStore>,
        index: Arc<DocumentIndex>,
        queue: Arc<DocumentQueue>,
        ocr: Arc<OcrAdapter>,
        llm: Arc<LlmAdapter>,
        page_splitter: Arc<dyn PageSplitter>,
        loan_prompt: Arc<PromptTemplate>,
        generic_prompt: Arc<PromptTemplate>,
    ) -> Self {
        Self::with_worker_counts(
            blob_store,
            index,
            queue,
            ocr,
            llm,
            page_splitter,
            loan_prompt,
            generic_prompt,
            WorkerCounts::default(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_worker_counts(
        blob_store: Arc<dyn BlobStore>,
        index: Arc<DocumentIndex>,
        queue: Arc<DocumentQueue>,
        ocr: Arc<OcrAdapter>,
        llm: Arc<LlmAdapter>,
        page_splitter: Arc<dyn PageSplitter>,
        loan_prompt: Arc<PromptTemplate>,
        generic_prompt: Arc<PromptTemplate>,
        workers: WorkerCounts,
    ) -> Self {
        PipelineExecutor {
            blob_store,
            index,
            queue,
            ocr,
            llm,
            page_splitter,
            loan_prompt,
            generic_prompt,
            workers,
        }
    }

    async fn set_stage(&self, doc_id: &str, stage: Stage, progress: u8) -> Result<()> {
        self.index
            .update(doc_id, |doc| {
                doc.stage = stage;
                doc.progress = progress;
            })
            .await?;
        Ok(())
    }

    async fn fail(&self, doc_id: &str, err: &PipelineError) -> Result<()> {
        self.index
            .update(doc_id, |doc| {
                doc.stage = Stage::Failed;
                doc.error = Some(err.to_string());
            })
            .await?;
        self.queue.mark_failed(doc_id, &err.to_string()).await?;
        Ok(())
    }

    /// Drive `doc_id` through its full stage graph. Matches the signature
    /// [`Scheduler::run`] expects, via a thin closure the caller builds.
    #[instrument(level = "info", skip(self, scheduler))]
    pub async fn run_document(&self, scheduler: &Arc<Scheduler>, doc_id: &str) -> Result<()> {
        let cancel_flag = scheduler.cancel_flag(doc_id).await;
        let Some(document) = self.index.get(doc_id).await else {
            return Err(anyhow!("no document record for {doc_id}"));
        };

        let result = if document.doc_type.is_loan() {
            self.run_loan(scheduler, doc_id, &cancel_flag).await
        } else {
            self.run_generic(scheduler, doc_id, &cancel_flag).await
        };

        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                self.fail(doc_id, &err).await?;
                Err(anyhow!(err))
            }
        }
    }

    async fn ocr_all_pages(
        &self,
        doc_id: &str,
        pages: &[Vec<u8>],
        cancel_flag: &std::sync::atomic::AtomicBool,
    ) -> Result<BTreeMap<usize, String>, PipelineError> {
        let semaphore = Arc::new(Semaphore::new(self.workers.ocr_workers));
        let mut handles = Vec::with_capacity(pages.len());
        for (page_index, bytes) in pages.iter().enumerate() {
            if is_cancelled(cancel_flag) {
                break;
            }
            let semaphore = semaphore.clone();
            let ocr = self.ocr.clone();
            let doc_id = doc_id.to_string();
            let bytes = bytes.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
                with_stage_retry(&doc_id, "s_ocr", || {
                    let ocr = ocr.clone();
                    let doc_id = doc_id.clone();
                    let bytes = bytes.clone();
                    async move { ocr.extract_page(&doc_id, page_index, &bytes).await }
                })
                .await
                .map(|result| (page_index, result.text))
            }));
        }

        let mut texts = BTreeMap::new();
        for handle in handles {
            let (page_index, text) = handle.await.map_err(|err| PipelineError::permanent(anyhow!(err)))??;
            texts.insert(page_index, text);
        }
        Ok(texts)
    }

    async fn run_loan(
        &self,
        scheduler: &Arc<Scheduler>,
        doc_id: &str,
        cancel_flag: &std::sync::atomic::AtomicBool,
    ) -> Result<(), PipelineError> {
        self.set_stage(doc_id, Stage::SOcr, 10).await.map_err(PipelineError::permanent)?;
        let document = self.index.get(doc_id).await.ok_or_else(|| PipelineError::NotFound(doc_id.to_string()))?;
        let bytes = self
            .blob_store
            .get(&keys::upload_key(&document.filename))
            .await
            .map_err(PipelineError::from)?;
        let pages = self.page_splitter.split(&bytes).await.map_err(PipelineError::permanent)?;
        self.index
            .update(doc_id, |doc| doc.total_page_count = pages.len())
            .await
            .map_err(PipelineError::permanent)?;

        let texts = self.ocr_all_pages(doc_id, &pages, cancel_flag).await?;
        if is_cancelled(cancel_flag) {
            return self.park_cancelled(doc_id).await;
        }

        self.set_stage(doc_id, Stage::SSplit, 40).await.map_err(PipelineError::permanent)?;
        let mut accounts = split_into_accounts(&texts);

        self.set_stage(doc_id, Stage::SMap, 55).await.map_err(PipelineError::permanent)?;
        let unassociated_pages = map_unassigned_pages(&mut accounts, &texts);
        self.index
            .update(doc_id, |doc| {
                doc.accounts = accounts.clone();
                doc.unassociated_pages = unassociated_pages;
            })
            .await
            .map_err(PipelineError::permanent)?;

        self.set_stage(doc_id, Stage::SExtract, 70).await.map_err(PipelineError::permanent)?;
        self.extract_accounts(scheduler, doc_id, &accounts, &texts, cancel_flag).await?;
        if is_cancelled(cancel_flag) {
            return self.park_cancelled(doc_id).await;
        }

        self.complete(doc_id).await
    }

    async fn run_generic(
        &self,
        scheduler: &Arc<Scheduler>,
        doc_id: &str,
        cancel_flag: &std::sync::atomic::AtomicBool,
    ) -> Result<(), PipelineError> {
        self.set_stage(doc_id, Stage::SOcr, 10).await.map_err(PipelineError::permanent)?;
        let document = self.index.get(doc_id).await.ok_or_else(|| PipelineError::NotFound(doc_id.to_string()))?;
        let bytes = self
            .blob_store
            .get(&keys::upload_key(&document.filename))
            .await
            .map_err(PipelineError::from)?;
        let pages = self.page_splitter.split(&bytes).await.map_err(PipelineError::permanent)?;
        self.index
            .update(doc_id, |doc| doc.total_page_count = pages.len())
            .await
            .map_err(PipelineError::permanent)?;

        let texts = self.ocr_all_pages(doc_id, &pages, cancel_flag).await?;
        if is_cancelled(cancel_flag) {
            return self.park_cancelled(doc_id).await;
        }

        self.set_stage(doc_id, Stage::SExtractWhole, 70).await.map_err(PipelineError::permanent)?;
        let whole_text = texts.values().cloned().collect::<Vec<_>>().join("\n\n");
        let extraction = with_stage_retry(doc_id, "s_extract_whole", || {
            let llm = self.llm.clone();
            let whole_text = whole_text.clone();
            async move { llm.extract_whole_document(&whole_text, &self.generic_prompt).await }
        })
        .await?;

        self.blob_store
            .put_json_verified(&keys::document_extraction_key(doc_id), &extraction)
            .await
            .map_err(PipelineError::from)?;
        for page_index in 0..pages.len() {
            self.blob_store
                .put_json_verified(&keys::generic_page_data_key(doc_id, page_index), &extraction)
                .await
                .map_err(PipelineError::from)?;
            scheduler.cache_page(doc_id, None, page_index, extraction.clone()).await;
        }

        self.complete(doc_id).await
    }

    async fn extract_accounts(
        &self,
        scheduler: &Arc<Scheduler>,
        doc_id: &str,
        accounts: &[Account],
        texts: &BTreeMap<usize, String>,
        cancel_flag: &std::sync::atomic::AtomicBool,
    ) -> Result<(), PipelineError> {
        let semaphore = Arc::new(Semaphore::new(self.workers.llm_workers));
        let mut handles = Vec::new();

        for (account_index, account) in accounts.iter().enumerate() {
            let mut pages = account.page_indices.clone();
            pages.sort_unstable();
            for batch in pages.chunks(self.workers.batch_pages) {
                if is_cancelled(cancel_flag) {
                    break;
                }
                let semaphore = semaphore.clone();
                let llm = self.llm.clone();
                let loan_prompt = self.loan_prompt.clone();
                let blob_store = self.blob_store.clone();
                let scheduler = Arc::clone(scheduler);
                let doc_id = doc_id.to_string();
                let account_number = account.account_number.clone();
                let batch: Vec<(usize, String)> =
                    batch.iter().map(|&i| (i, texts.get(&i).cloned().unwrap_or_default())).collect();

                handles.push(tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
                    let refs: Vec<(usize, &str)> = batch.iter().map(|(i, t)| (*i, t.as_str())).collect();
                    let mut result = with_stage_retry(&doc_id, "s_extract", || {
                        let llm = llm.clone();
                        let loan_prompt = loan_prompt.clone();
                        let refs = refs.clone();
                        async move { llm.extract_page_batch(&refs, &loan_prompt).await }
                    })
                    .await?;

                    for (page_index, mut extraction) in result.drain() {
                        extraction.account_number = Some(account_number.clone());
                        let key = keys::account_page_data_key(&doc_id, account_index, page_index);
                        blob_store.put_json_verified(&key, &extraction).await.map_err(PipelineError::from)?;
                        scheduler.cache_page(&doc_id, Some(account_index), page_index, extraction).await;
                    }
                    Ok::<(), PipelineError>(())
                }));
            }
        }

        for handle in handles {
            handle.await.map_err(|err| PipelineError::permanent(anyhow!(err)))??;
        }
        Ok(())
    }

    async fn park_cancelled(&self, doc_id: &str) -> Result<(), PipelineError> {
        info!(doc_id, "cancellation observed between stages, reverting to queued");
        self.queue.revert_to_queued(doc_id).await.map_err(PipelineError::permanent)?;
        Ok(())
    }

    async fn complete(&self, doc_id: &str) -> Result<(), PipelineError> {
        self.index
            .update(doc_id, |doc| {
                doc.stage = Stage::Completed;
                doc.progress = 100;
            })
            .await
            .map_err(PipelineError::permanent)?;
        self.queue.mark_completed(doc_id).await.map_err(PipelineError::permanent)?;
        Ok(())
    }
}

/// Extract the first account number/name/SSN this page's text mentions.
fn extract_candidate(text: &str) -> (Option<String>, Candidate<'_>) {
    let account_number = ACCOUNT_RE.captures(text).and_then(|c| c.get(1)).map(|m| m.as_str().to_string());
    let name = NAME_RE.captures(text).and_then(|c| c.get(1)).map(|m| m.as_str().trim());
    let ssn = SSN_RE.captures(text).and_then(|c| c.get(1)).map(|m| m.as_str());
    (account_number, Candidate { account_number: None, ssn, name })
}

/// Group pages into accounts by detected account number. A page with no
/// detected number joins the most recently opened account, since loan
/// packets interleave supporting pages after the account's lead page.
fn split_into_accounts(texts: &BTreeMap<usize, String>) -> Vec<Account> {
    let mut accounts: Vec<Account> = Vec::new();
    let mut by_number: BTreeMap<String, usize> = BTreeMap::new();

    for (&page_index, text) in texts {
        let (account_number, candidate) = extract_candidate(text);
        let holder = candidate.name.map(|name| Holder {
            full_name: name.to_string(),
            ssn: candidate.ssn.map(str::to_string),
            address: None,
        });

        match account_number {
            Some(raw) => {
                let normalized = crate::model::normalize_account_number(&raw);
                let account_index = *by_number.entry(normalized.clone()).or_insert_with(|| {
                    accounts.push(Account {
                        account_number: normalized,
                        page_indices: Vec::new(),
                        holders: Vec::new(),
                        page_data: BTreeMap::new(),
                    });
                    accounts.len() - 1
                });
                accounts[account_index].page_indices.push(page_index);
                if let Some(holder) = holder {
                    if !accounts[account_index].holders.iter().any(|h| h.full_name == holder.full_name) {
                        accounts[account_index].holders.push(holder);
                    }
                }
            }
            None => {
                if let Some(last) = accounts.last_mut() {
                    last.page_indices.push(page_index);
                } else {
                    accounts.push(Account {
                        account_number: String::new(),
                        page_indices: vec![page_index],
                        holders: holder.into_iter().collect(),
                        page_data: BTreeMap::new(),
                    });
                }
            }
        }
    }

    accounts
}

/// A page reads as a signature card when it lists several signers on their
/// own lines, each carrying an SSN -- a loan packet's account-holder roster,
/// as opposed to a single-borrower statement page.
const MIN_SIGNATURE_CARD_LINES: usize = 2;

fn is_signature_card_like(text: &str) -> bool {
    text.lines().filter(|line| SSN_RE.is_match(line)).count() >= MIN_SIGNATURE_CARD_LINES
}

/// Matches an `ssn`/`social security (no./number)` label immediately before
/// the digits, so it can be stripped off the name portion of a signer line.
static SSN_LABEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\s*(?:ssn|social\s*security(?:\s*(?:no\.?|number))?|ss#)\s*[:#-]*\s*$").unwrap()
});

/// Pull a `(name, ssn)` holder off every line of a signature-card-like page
/// that carries both. The name is whatever precedes the SSN on that line,
/// with any `SSN:`/`Social Security Number:` label and leading/trailing
/// punctuation stripped.
fn extract_signature_card_holders(text: &str) -> Vec<Holder> {
    let mut holders = Vec::new();
    for line in text.lines() {
        let Some(captures) = SSN_RE.captures(line) else {
            continue;
        };
        let ssn = captures.get(1).map(|m| m.as_str().to_string());
        let whole = captures.get(0).unwrap();
        let prefix = line[..whole.start()].trim_start_matches(|c: char| !c.is_alphabetic());
        let name = SSN_LABEL_RE.replace(prefix, "");
        let name = name.trim();
        if !name.is_empty() {
            holders.push(Holder {
                full_name: name.to_string(),
                ssn,
                address: None,
            });
        }
    }
    holders
}

/// Scan every page already assigned to an account for a signature-card
/// layout and fold any holders it lists into that account's holder set, so
/// later role/name matching has the fullest roster available.
fn populate_holders_from_signature_cards(accounts: &mut [Account], texts: &BTreeMap<usize, String>) {
    for account in accounts.iter_mut() {
        for &page_index in &account.page_indices {
            let Some(text) = texts.get(&page_index) else {
                continue;
            };
            if !is_signature_card_like(text) {
                continue;
            }
            for holder in extract_signature_card_holders(text) {
                if !account.holders.iter().any(|h| h.full_name == holder.full_name) {
                    account.holders.push(holder);
                }
            }
        }
    }
}

/// Map every page with no direct account number onto the accounts its
/// name/SSN or vital-record role matches, at or above
/// [`name_match::MIN_CONFIDENCE`]. A page may match more than one account --
/// it is added to all of them, never removed from where [`split_into_accounts`]
/// already placed it. A page matching none is left in place and its index is
/// returned so the caller can flag it for manual review.
fn map_unassigned_pages(accounts: &mut [Account], texts: &BTreeMap<usize, String>) -> Vec<usize> {
    populate_holders_from_signature_cards(accounts, texts);

    if accounts.len() < 2 {
        return Vec::new();
    }
    let snapshot: Vec<Vec<Holder>> = accounts.iter().map(|a| a.holders.clone()).collect();
    let mut unassociated = Vec::new();

    for (&page_index, text) in texts {
        let (account_number, candidate) = extract_candidate(text);
        if account_number.is_some() {
            // Already owns a direct account number; S_SPLIT placed it.
            continue;
        }
        let role_candidates = name_match::extract_role_candidates(text);
        if candidate.name.is_none() && candidate.ssn.is_none() && role_candidates.is_empty() {
            unassociated.push(page_index);
            continue;
        }

        let mut matches: Vec<usize> = Vec::new();
        for (account_index, holders) in snapshot.iter().enumerate() {
            let hit = holders.iter().any(|holder| {
                (candidate.name.is_some() || candidate.ssn.is_some())
                    && name_match::match_holder(holder, &candidate).matched
                    || !name_match::match_role_candidates(&role_candidates, holder).is_empty()
            });
            if hit {
                matches.push(account_index);
            }
        }

        if matches.is_empty() {
            unassociated.push(page_index);
            continue;
        }
        for account_index in matches {
            if !accounts[account_index].page_indices.contains(&page_index) {
                accounts[account_index].page_indices.push(page_index);
            }
        }
    }

    unassociated
}
