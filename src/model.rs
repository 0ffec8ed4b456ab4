//! Core document, page, and extraction types.
//!
//! Every type here is plain data; the behavior that mutates it (pipeline
//! stages, edit reconciliation) lives in the modules that own that behavior
//! (`pipeline.rs`, `page_store.rs`, `queue.rs`).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::prelude::*;

/// Coarse document type tags. Represented as a tagged variant, not a class
/// hierarchy, so the pipeline can switch on it statically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Loan,
    DeathCert,
    BirthCert,
    MarriageCert,
    IdCard,
    Generic,
}

impl DocumentType {
    /// Is this a vital record (death/birth/marriage certificate)? Used by the
    /// name matcher's family-document role matching.
    pub fn is_vital_record(&self) -> bool {
        matches!(
            self,
            DocumentType::DeathCert | DocumentType::BirthCert | DocumentType::MarriageCert
        )
    }

    /// Does this document type get split into accounts?
    pub fn is_loan(&self) -> bool {
        matches!(self, DocumentType::Loan)
    }
}

/// Where a document entered the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestSource {
    Direct,
    Poller,
    SecondaryUploader,
}

/// The pipeline stage a document currently occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Ingested,
    SOcr,
    SSplit,
    SMap,
    SExtract,
    SExtractWhole,
    Completed,
    Failed,
}

/// A Document record. At most one exists per `doc_id`. Owned by the local
/// index (`index.rs`); mutated only by the pipeline and the edit reconciler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub doc_id: String,
    pub filename: String,
    pub source: IngestSource,
    pub doc_type: DocumentType,
    pub total_page_count: usize,
    pub stage: Stage,
    /// Cumulative progress, 0-100.
    pub progress: u8,
    pub accounts: Vec<Account>,
    /// Pages S_MAP could not match to any account's holders at
    /// [`crate::name_match::MIN_CONFIDENCE`] or above. Retained on the
    /// document (not dropped) pending manual review.
    #[serde(default)]
    pub unassociated_pages: Vec<usize>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Document {
    pub fn new(
        doc_id: String,
        filename: String,
        source: IngestSource,
        doc_type: DocumentType,
    ) -> Self {
        Document {
            doc_id,
            filename,
            source,
            doc_type,
            total_page_count: 0,
            stage: Stage::Ingested,
            progress: 5,
            accounts: Vec::new(),
            unassociated_pages: Vec::new(),
            error: None,
            created_at: Utc::now(),
        }
    }
}

/// A person associated with an [`Account`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Holder {
    pub full_name: String,
    pub ssn: Option<String>,
    pub address: Option<String>,
}

/// A logical group of pages sharing one account number.
///
/// Accounts reference pages by index only; pages carry no back-pointer, so
/// there is no cyclic ownership between the two.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub account_number: String,
    pub page_indices: Vec<usize>,
    pub holders: Vec<Holder>,
    /// Legacy fast-path inline extraction data, populated by the pipeline
    /// before the external page-data cache existed. Read-only to the page
    /// extraction store.
    #[serde(default)]
    pub page_data: BTreeMap<usize, PageExtraction>,
}

/// Normalize an account number: strip separators, fold `O`/`o` to `0`.
pub fn normalize_account_number(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_alphanumeric())
        .map(|c| match c {
            'O' | 'o' => '0',
            other => other.to_ascii_uppercase(),
        })
        .collect()
}

/// Where a [`FieldValue`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldSource {
    AiExtracted,
    HumanAdded,
    HumanCorrected,
}

/// The atomic extraction unit.
///
/// Invariant: `source == HumanAdded | HumanCorrected` implies
/// `confidence == 100`; enforced by the constructors below, never by the
/// caller setting fields directly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldValue {
    pub value: String,
    pub confidence: u8,
    pub source: FieldSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
}

impl FieldValue {
    /// An AI-extracted value, with whatever confidence the model reported.
    pub fn ai_extracted(value: impl Into<String>, confidence: u8) -> Self {
        FieldValue {
            value: value.into(),
            confidence,
            source: FieldSource::AiExtracted,
            edited_at: None,
        }
    }

    /// A brand-new field added by a human. Always full confidence.
    pub fn human_added(value: impl Into<String>, now: DateTime<Utc>) -> Self {
        FieldValue {
            value: value.into(),
            confidence: 100,
            source: FieldSource::HumanAdded,
            edited_at: Some(now),
        }
    }

    /// An existing field a human corrected. Always full confidence.
    pub fn human_corrected(value: impl Into<String>, now: DateTime<Utc>) -> Self {
        FieldValue {
            value: value.into(),
            confidence: 100,
            source: FieldSource::HumanCorrected,
            edited_at: Some(now),
        }
    }
}

/// What triggered the most recent write to a [`PageExtraction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LastAction {
    Extract,
    Add,
    #[default]
    Edit,
    Delete,
    Copy,
}

/// The flat map of field name to [`FieldValue`] for one page, plus metadata.
///
/// Field names are unique per page (a `BTreeMap` enforces this structurally).
/// Nested field objects must never survive into this type — callers flatten
/// before constructing one.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PageExtraction {
    pub data: BTreeMap<String, FieldValue>,
    pub overall_confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_number: Option<String>,
    #[serde(default)]
    pub prompt_version: String,
    #[serde(default)]
    pub edited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_action: Option<LastAction>,
}

/// A whole-document extraction for non-loan documents. Shares the wire shape
/// of [`PageExtraction`], keyed only by `doc_id`.
pub type DocumentExtraction = PageExtraction;

/// The status of a queued document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

/// An entry in the [`crate::queue::DocumentQueue`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub doc_id: String,
    pub filename: String,
    pub source: IngestSource,
    pub status: QueueStatus,
    pub added_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl QueueEntry {
    pub fn new(doc_id: String, filename: String, source: IngestSource) -> Self {
        QueueEntry {
            doc_id,
            filename,
            source,
            status: QueueStatus::Queued,
            added_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// Is this entry in a terminal state? Terminal states are sticky.
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, QueueStatus::Completed | QueueStatus::Failed)
    }
}

/// Per-object-key poller state, persisted under the status prefix in the
/// blob store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollerStatus {
    New,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerState {
    pub file_key: String,
    pub status: PollerStatus,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_account_numbers() {
        assert_eq!(normalize_account_number("ab-12 O3"), "AB1203");
        assert_eq!(normalize_account_number("O0O0"), "0000");
    }

    #[test]
    fn human_added_is_always_full_confidence() {
        let now = Utc::now();
        let fv = FieldValue::human_added("x", now);
        assert_eq!(fv.confidence, 100);
        assert_eq!(fv.source, FieldSource::HumanAdded);
    }
}
