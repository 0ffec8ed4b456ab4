//! Blob store key conventions.
//!
//! This is the *only* place key strings are built. Both the writer and the
//! reader of any given artifact call these functions, which is what
//! guarantees that a cache key used by a writer always equals the key used
//! by its reader. Nobody outside this module should ever format a key by
//! hand.
//!
//! All page indices here are 0-based. Callers converting from 1-based API
//! page numbers must do so exactly once, at the API boundary — never in
//! here.

/// `uploads/{filename}` — original PDF bytes.
pub fn upload_key(filename: &str) -> String {
    format!("uploads/{filename}")
}

/// `processing_logs/{uploads/filename}.status.json` — poller state for one
/// uploaded object.
pub fn processing_log_key(upload_key: &str) -> String {
    format!("processing_logs/{upload_key}.status.json")
}

/// `ocr_cache/{doc_id}/text_cache.json` — `{page_index -> text}`.
pub fn ocr_cache_key(doc_id: &str) -> String {
    format!("ocr_cache/{doc_id}/text_cache.json")
}

/// `page_mapping/{doc_id}/mapping.json` — `{page_index -> account_number}`.
pub fn page_mapping_key(doc_id: &str) -> String {
    format!("page_mapping/{doc_id}/mapping.json")
}

/// `page_data/{doc_id}/account_{ai}/page_{page}.json` — PageExtraction for an
/// account-based (loan) document.
pub fn account_page_data_key(doc_id: &str, account_index: usize, page_index: usize) -> String {
    format!("page_data/{doc_id}/account_{account_index}/page_{page_index}.json")
}

/// `page_data/{doc_id}/page_{page}.json` — PageExtraction for a generic
/// (non-loan) document.
pub fn generic_page_data_key(doc_id: &str, page_index: usize) -> String {
    format!("page_data/{doc_id}/page_{page_index}.json")
}

/// Dispatch to [`account_page_data_key`] or [`generic_page_data_key`]
/// depending on whether this page belongs to an account.
pub fn page_data_key(doc_id: &str, account_index: Option<usize>, page_index: usize) -> String {
    match account_index {
        Some(ai) => account_page_data_key(doc_id, ai, page_index),
        None => generic_page_data_key(doc_id, page_index),
    }
}

/// `document_extraction_cache/{doc_id}/full_extraction.json` — whole-document
/// extraction for generic documents.
pub fn document_extraction_key(doc_id: &str) -> String {
    format!("document_extraction_cache/{doc_id}/full_extraction.json")
}

/// `account_results/{doc_id}/{normalized_account_number}.json` — optional
/// per-account roll-up.
pub fn account_results_key(doc_id: &str, normalized_account_number: &str) -> String {
    format!("account_results/{doc_id}/{normalized_account_number}.json")
}

/// Convert a 1-based API page number to a 0-based internal page index. The
/// single sanctioned place this conversion happens.
pub fn page_number_to_index(page_number: usize) -> Option<usize> {
    page_number.checked_sub(1)
}

/// Convert a 0-based internal page index back to a 1-based API page number.
pub fn page_index_to_number(page_index: usize) -> usize {
    page_index + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_0_based_and_stable() {
        assert_eq!(
            account_page_data_key("abc123", 0, 0),
            "page_data/abc123/account_0/page_0.json"
        );
        assert_eq!(
            generic_page_data_key("abc123", 3),
            "page_data/abc123/page_3.json"
        );
        assert_eq!(
            page_data_key("abc123", Some(2), 5),
            account_page_data_key("abc123", 2, 5)
        );
        assert_eq!(page_data_key("abc123", None, 5), generic_page_data_key("abc123", 5));
    }

    #[test]
    fn page_number_conversion_is_a_single_off_by_one() {
        assert_eq!(page_number_to_index(1), Some(0));
        assert_eq!(page_number_to_index(0), None);
        assert_eq!(page_index_to_number(0), 1);
    }

    #[test]
    fn writer_and_reader_keys_match_for_the_same_page() {
        // Whatever the writer used to build a key, the reader must compute
        // byte-identically from the same inputs.
        for (doc_id, account_index, page_index) in
            [("d1", None, 0), ("d1", Some(0), 1), ("d2", Some(3), 12)]
        {
            let written = page_data_key(doc_id, account_index, page_index);
            let read = page_data_key(doc_id, account_index, page_index);
            assert_eq!(written, read);
        }
    }
}
