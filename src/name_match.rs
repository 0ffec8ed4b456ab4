//! Fuzzy matching of a candidate name/SSN/address against a stored
//! [`Holder`](crate::model::Holder), used to decide whether a supporting page
//! belongs to an account.
//!
//! Matching is a strict decision procedure: the first rule that fires wins,
//! nothing downstream is consulted once a match is found. A result below
//! [`MIN_CONFIDENCE`] is treated as no match at all.

use std::sync::LazyLock;

use regex::Regex;
use strsim::levenshtein;
use unicode_normalization::UnicodeNormalization;

use crate::model::Holder;

/// Minimum confidence accepted as a match.
pub const MIN_CONFIDENCE: u8 = 85;

/// The outcome of a match attempt. Never panics; a failed match is a normal,
/// representable value, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResult {
    pub matched: bool,
    pub confidence: u8,
    pub rationale: String,
}

impl MatchResult {
    fn no_match(rationale: impl Into<String>) -> Self {
        MatchResult {
            matched: false,
            confidence: 0,
            rationale: rationale.into(),
        }
    }

    fn hit(confidence: u8, rationale: impl Into<String>) -> Self {
        let rationale = rationale.into();
        MatchResult {
            matched: confidence >= MIN_CONFIDENCE,
            confidence,
            rationale,
        }
    }
}

/// A candidate found on a page: whatever we could scrape off it that might
/// identify an account holder.
#[derive(Debug, Clone, Default)]
pub struct Candidate<'a> {
    pub account_number: Option<&'a str>,
    pub ssn: Option<&'a str>,
    pub name: Option<&'a str>,
}

/// Uppercase ASCII-fold, strip `.`, `-`, `'`, `,`, collapse whitespace runs,
/// trim. Diacritics are removed via NFD decomposition followed by dropping
/// combining marks.
pub fn normalize_name(input: &str) -> String {
    let decomposed: String = input.nfd().filter(|c| !is_combining_mark(*c)).collect();
    let mut out = String::with_capacity(decomposed.len());
    let mut last_was_space = false;
    for ch in decomposed.chars() {
        match ch {
            '.' | '-' | '\'' | ',' => continue,
            c if c.is_whitespace() => {
                if !last_was_space && !out.is_empty() {
                    out.push(' ');
                }
                last_was_space = true;
            }
            c => {
                out.push(c.to_ascii_uppercase());
                last_was_space = false;
            }
        }
    }
    out.trim_end().to_string()
}

fn is_combining_mark(c: char) -> bool {
    matches!(c as u32, 0x0300..=0x036F)
}

/// Split a normalized name into `[first, middle, last]`.
pub fn split_name_components(normalized: &str) -> [String; 3] {
    let tokens: Vec<&str> = normalized.split(' ').filter(|t| !t.is_empty()).collect();
    match tokens.len() {
        0 => [String::new(), String::new(), String::new()],
        1 => [tokens[0].to_string(), String::new(), String::new()],
        2 => [tokens[0].to_string(), String::new(), tokens[1].to_string()],
        3 => [tokens[0].to_string(), tokens[1].to_string(), tokens[2].to_string()],
        n => [
            tokens[0].to_string(),
            tokens[1..n - 1].join(" "),
            tokens[n - 1].to_string(),
        ],
    }
}

/// Strip everything but digits, for SSN comparison.
fn digits_only(input: &str) -> String {
    input.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Strip separators and fold `O`/`o` to `0`, mirroring
/// [`crate::model::normalize_account_number`] so the two normalizers never
/// drift apart.
fn normalize_account(input: &str) -> String {
    crate::model::normalize_account_number(input)
}

fn is_initial_of(short: &str, long: &str) -> bool {
    short.len() == 1 && long.starts_with(short.chars().next().unwrap_or_default())
}

/// A component "matches" if equal, one is empty, or one is the initial of
/// the other.
fn component_compatible(a: &str, b: &str) -> bool {
    if a.is_empty() || b.is_empty() {
        return true;
    }
    a == b || is_initial_of(a, b) || is_initial_of(b, a)
}

fn edit_distance_within(a: &str, b: &str, max: usize) -> bool {
    levenshtein(a, b) <= max
}

/// Is `short` a strict sequence of initials of `long`'s components (e.g.
/// "J D" for "JOHN DOE")?
fn is_abbreviation_of(short: &[String; 3], long: &[String; 3]) -> bool {
    let short_tokens: Vec<&String> = short.iter().filter(|t| !t.is_empty()).collect();
    let long_tokens: Vec<&String> = long.iter().filter(|t| !t.is_empty()).collect();
    if short_tokens.is_empty() || short_tokens.len() != long_tokens.len() {
        return false;
    }
    short_tokens
        .iter()
        .zip(long_tokens.iter())
        .all(|(s, l)| s.len() == 1 && l.starts_with(s.chars().next().unwrap_or_default()))
}

/// Run the exact full-name comparison tiers (spec-free: equality, component
/// match, abbreviation, reversed order, spelling variation).
fn compare_full_names(stored: &str, candidate: &str) -> Option<(u8, &'static str)> {
    let stored_norm = normalize_name(stored);
    let candidate_norm = normalize_name(candidate);
    if stored_norm.is_empty() || candidate_norm.is_empty() {
        return None;
    }
    if stored_norm == candidate_norm {
        return Some((100, "exact normalized name match"));
    }

    let stored_parts = split_name_components(&stored_norm);
    let candidate_parts = split_name_components(&candidate_norm);

    let first_last_match = |a: &[String; 3], b: &[String; 3]| -> bool {
        component_compatible(&a[0], &b[0]) && a[2] == b[2] && !a[2].is_empty()
    };

    if first_last_match(&stored_parts, &candidate_parts) {
        if stored_parts[1] == candidate_parts[1] {
            return Some((95, "first and last match, middle identical"));
        }
        if component_compatible(&stored_parts[1], &candidate_parts[1]) {
            return Some((90, "first and last match, middle initial or missing"));
        }
    }

    if is_abbreviation_of(&stored_parts, &candidate_parts)
        || is_abbreviation_of(&candidate_parts, &stored_parts)
    {
        return Some((90, "abbreviation: one name is an initial sequence of the other"));
    }

    // Reversed order: candidate's first/last swapped relative to stored.
    let reversed_exact = stored_parts[0] == candidate_parts[2] && stored_parts[2] == candidate_parts[0];
    if reversed_exact {
        return Some((90, "reversed name order"));
    }
    let reversed_close = !stored_parts[0].is_empty()
        && !stored_parts[2].is_empty()
        && edit_distance_within(&stored_parts[0], &candidate_parts[2], 2)
        && edit_distance_within(&stored_parts[2], &candidate_parts[0], 2);
    if reversed_close {
        return Some((85, "reversed name order with spelling variation"));
    }

    // Spelling variation in normal order: first and last both pass an edit
    // distance threshold.
    if !stored_parts[0].is_empty()
        && !stored_parts[2].is_empty()
        && edit_distance_within(&stored_parts[0], &candidate_parts[0], 2)
        && edit_distance_within(&stored_parts[2], &candidate_parts[2], 2)
    {
        return Some((85, "spelling variation in first and last name"));
    }

    None
}

fn compare_last_name_only(stored: &str, candidate: &str) -> Option<(u8, &'static str)> {
    let stored_parts = split_name_components(&normalize_name(stored));
    let candidate_parts = split_name_components(&normalize_name(candidate));
    if stored_parts[2].is_empty() || candidate_parts[2].is_empty() {
        return None;
    }
    if stored_parts[2] == candidate_parts[2] {
        return Some((90, "last name exact match"));
    }
    if edit_distance_within(&stored_parts[2], &candidate_parts[2], 2) {
        return Some((85, "last name spelling variation"));
    }
    None
}

fn compare_first_name_only(stored: &str, candidate: &str) -> Option<(u8, &'static str)> {
    let stored_parts = split_name_components(&normalize_name(stored));
    let candidate_parts = split_name_components(&normalize_name(candidate));
    if stored_parts[0].is_empty() || candidate_parts[0].is_empty() {
        return None;
    }
    if stored_parts[0] == candidate_parts[0] || is_initial_of(&stored_parts[0], &candidate_parts[0])
        || is_initial_of(&candidate_parts[0], &stored_parts[0])
    {
        return Some((85, "first name exact or initial match"));
    }
    None
}

/// Run the full decision procedure against one holder. Account-number
/// presence is checked against the owning account, not the holder, via
/// [`match_account_number`] -- callers try that first.
pub fn match_holder(holder: &Holder, candidate: &Candidate<'_>) -> MatchResult {
    if let (Some(stored_ssn), Some(candidate_ssn)) = (holder.ssn.as_deref(), candidate.ssn) {
        let stored_digits = digits_only(stored_ssn);
        let candidate_digits = digits_only(candidate_ssn);
        if !stored_digits.is_empty() && stored_digits == candidate_digits {
            return MatchResult::hit(100, "SSN match");
        }
    }

    if let Some(candidate_name) = candidate.name {
        if let Some((confidence, rationale)) = compare_full_names(&holder.full_name, candidate_name) {
            return MatchResult::hit(confidence, rationale);
        }
        if let Some((confidence, rationale)) = compare_last_name_only(&holder.full_name, candidate_name) {
            return MatchResult::hit(confidence, rationale);
        }
        if let Some((confidence, rationale)) = compare_first_name_only(&holder.full_name, candidate_name) {
            return MatchResult::hit(confidence, rationale);
        }
    }

    MatchResult::no_match("no matching signal found")
}

/// Role labels that can appear on a vital-record page (death/birth/marriage
/// certificates), each paired with a regex pulling the name that follows it.
/// Checked independently -- a page can carry more than one role.
static ROLE_PATTERNS: LazyLock<[(&'static str, Regex); 6]> = LazyLock::new(|| {
    [
        ("surviving spouse", Regex::new(r"(?im)^\s*surviving spouse\s*[:#]?\s*(.+)$").unwrap()),
        ("informant", Regex::new(r"(?im)^\s*informant\s*[:#]?\s*(.+)$").unwrap()),
        ("bride", Regex::new(r"(?im)^\s*bride(?:'s name)?\s*[:#]?\s*(.+)$").unwrap()),
        ("groom", Regex::new(r"(?im)^\s*groom(?:'s name)?\s*[:#]?\s*(.+)$").unwrap()),
        ("father", Regex::new(r"(?im)^\s*(?:father|parent)\s*[:#]?\s*(.+)$").unwrap()),
        ("mother", Regex::new(r"(?im)^\s*mother\s*[:#]?\s*(.+)$").unwrap()),
    ]
});

/// Pull every role-bearing name off a vital-record page: a surviving spouse,
/// informant, bride/groom, or parent, each labeled on its own line. Returns
/// `(role, name)` pairs in the order the roles are checked.
pub fn extract_role_candidates(text: &str) -> Vec<(&'static str, String)> {
    ROLE_PATTERNS
        .iter()
        .filter_map(|(role, re)| {
            re.captures(text).and_then(|c| c.get(1)).map(|m| (*role, m.as_str().trim().to_string()))
        })
        .collect()
}

/// Run the full-name/last-name/first-name tiers against `holder`
/// for every extracted role candidate. Confidence is whatever the underlying
/// tier assigns; the rationale is prefixed with the role so callers can see
/// which relationship produced the match.
pub fn match_role_candidates(candidates: &[(&'static str, String)], holder: &Holder) -> Vec<MatchResult> {
    candidates
        .iter()
        .filter_map(|(role, name)| {
            compare_full_names(&holder.full_name, name)
                .or_else(|| compare_last_name_only(&holder.full_name, name))
                .or_else(|| compare_first_name_only(&holder.full_name, name))
                .map(|(confidence, rationale)| MatchResult::hit(confidence, format!("{role}: {rationale}")))
        })
        .filter(|m| m.matched)
        .collect()
}

/// Match a candidate's account number against a stored (already normalized)
/// account number. Exact or separator-normalized equality scores 100.
pub fn match_account_number(stored_account_number: &str, candidate: &str) -> MatchResult {
    let stored = normalize_account(stored_account_number);
    let candidate_norm = normalize_account(candidate);
    if !stored.is_empty() && stored == candidate_norm {
        MatchResult::hit(100, "account number match")
    } else {
        MatchResult::no_match("account number does not match")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn holder(name: &str) -> Holder {
        Holder {
            full_name: name.to_string(),
            ssn: None,
            address: None,
        }
    }

    #[test]
    fn exact_name_match_scores_100() {
        let result = match_holder(&holder("John Q Public"), &Candidate {
            name: Some("JOHN Q. PUBLIC"),
            ..Default::default()
        });
        assert!(result.matched);
        assert_eq!(result.confidence, 100);
    }

    #[test]
    fn reversed_order_with_spelling_variation_scores_85() {
        // Reversed name order plus a one-letter spelling variant.
        let result = match_holder(&holder("Rahmah A Gooba"), &Candidate {
            name: Some("GOOBA RAHMAHA"),
            ..Default::default()
        });
        assert!(result.matched);
        assert_eq!(result.confidence, 85);
        assert!(result.rationale.contains("reversed"));
    }

    #[test]
    fn ssn_match_ignores_formatting() {
        let mut h = holder("Jane Doe");
        h.ssn = Some("123-45-6789".to_string());
        let result = match_holder(&h, &Candidate {
            ssn: Some("123456789"),
            ..Default::default()
        });
        assert!(result.matched);
        assert_eq!(result.confidence, 100);
    }

    #[test]
    fn last_name_only_with_variation_scores_85() {
        let result = match_holder(&holder("Unknown Smithson"), &Candidate {
            name: Some("Smithsen"),
            ..Default::default()
        });
        assert!(result.matched);
        assert_eq!(result.confidence, 85);
    }

    #[test]
    fn unrelated_names_do_not_match() {
        let result = match_holder(&holder("Alice Anderson"), &Candidate {
            name: Some("Bob Brennan"),
            ..Default::default()
        });
        assert!(!result.matched);
    }

    #[test]
    fn account_number_normalization_tolerates_letter_o_and_separators() {
        let result = match_account_number("AB-0012", "ab O012");
        assert!(result.matched);
        assert_eq!(result.confidence, 100);
    }

    #[test]
    fn role_candidates_are_extracted_from_a_death_certificate_body() {
        let text = "CERTIFICATE OF DEATH\nDecedent: John Q Public\nSurviving Spouse: Jane R Public\nInformant: Mary Public";
        let candidates = extract_role_candidates(text);
        assert!(candidates.contains(&("surviving spouse", "Jane R Public".to_string())));
        assert!(candidates.contains(&("informant", "Mary Public".to_string())));
    }

    #[test]
    fn role_candidate_match_carries_the_role_into_the_rationale() {
        let candidates = vec![("surviving spouse", "Jane R Public".to_string())];
        let matches = match_role_candidates(&candidates, &holder("Jane Public"));
        assert_eq!(matches.len(), 1);
        assert!(matches[0].matched);
        assert!(matches[0].rationale.starts_with("surviving spouse:"));
    }

    #[test]
    fn role_candidate_below_threshold_is_dropped() {
        let candidates = vec![("bride", "Totally Unrelated Name".to_string())];
        let matches = match_role_candidates(&candidates, &holder("Jane Public"));
        assert!(matches.is_empty());
    }

    #[test]
    fn split_name_components_handles_long_names() {
        let parts = split_name_components("JOHN DAVID ROBERT SMITH");
        assert_eq!(parts, ["JOHN".to_string(), "DAVID ROBERT".to_string(), "SMITH".to_string()]);
    }
}
