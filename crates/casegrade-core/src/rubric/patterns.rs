//! Extraction patterns for rubric documents.
//!
//! A rubric document is a prompt template written for humans. The scoring
//! metadata lives in three textual conventions inside it:
//!
//! - `Criterion N: Maximum M points` lines carrying the point maxima
//! - a JSON response template with `"id": N ... "criterion": "TEXT"` entries
//! - safety markers, either `(safety criterion)` after a maximum line or an
//!   explicit `SAFETY CRITERIA SCORING (Criteria 3, 4 ONLY)` list

use lazy_static::lazy_static;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};

lazy_static! {
    /// `Criterion 3: Maximum 8 points`
    pub static ref MAXIMUM_PATTERN: Regex = Regex::new(
        r"Criterion\s+(\d+):\s+Maximum\s+(\d+)\s+points"
    ).unwrap();

    /// `"id": 3, "criterion": "Flags contraindicated medications"` (either quote style, any line breaks)
    pub static ref CRITERION_TEXT_PATTERN: Regex = Regex::new(
        r#"(?s)["']id["']:\s*(\d+).*?["']criterion["']:\s*["'](.*?)["']\s*[,}]"#
    ).unwrap();

    /// `Criterion 3: Maximum 8 points (safety criterion)`
    pub static ref SAFETY_MARKER_PATTERN: Regex = Regex::new(
        r"(?i)Criterion\s+(\d+):\s+Maximum\s+\d+\s+points\s*\(safety\s+criterion\)"
    ).unwrap();

    /// `SAFETY CRITERIA SCORING (Criteria 3, 4 ONLY)`
    pub static ref SAFETY_LIST_PATTERN: Regex = Regex::new(
        r"(?is)SAFETY\s+CRITERIA\s+SCORING.*?Criteria\s+([\d,\s]+)\s+ONLY"
    ).unwrap();

    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
    static ref CRITERION_PREFIX: Regex = Regex::new(r"^criterion\s+\d+:\s*").unwrap();
    static ref DIGITS: Regex = Regex::new(r"\d+").unwrap();
}

/// Point maxima keyed by criterion id. A later line for the same id wins.
pub fn extract_maxima(content: &str) -> BTreeMap<u32, u32> {
    MAXIMUM_PATTERN
        .captures_iter(content)
        .filter_map(|caps| {
            let id = caps[1].parse::<u32>().ok()?;
            let max = caps[2].parse::<u32>().ok()?;
            Some((id, max))
        })
        .collect()
}

/// Display texts keyed by criterion id, whitespace collapsed.
pub fn extract_criterion_texts(content: &str) -> BTreeMap<u32, String> {
    CRITERION_TEXT_PATTERN
        .captures_iter(content)
        .filter_map(|caps| {
            let id = caps[1].parse::<u32>().ok()?;
            Some((id, collapse_whitespace(&caps[2])))
        })
        .collect()
}

/// Ids flagged as safety criteria by either convention.
pub fn extract_safety_ids(content: &str) -> BTreeSet<u32> {
    let mut ids: BTreeSet<u32> = SAFETY_MARKER_PATTERN
        .captures_iter(content)
        .filter_map(|caps| caps[1].parse::<u32>().ok())
        .collect();

    for caps in SAFETY_LIST_PATTERN.captures_iter(content) {
        ids.extend(
            DIGITS
                .find_iter(&caps[1])
                .filter_map(|m| m.as_str().parse::<u32>().ok()),
        );
    }

    ids
}

/// Lower-case, drop a leading `criterion N:` and collapse whitespace.
pub fn normalize_criterion_text(text: &str) -> String {
    let lowered = text.trim().to_lowercase();
    let stripped = CRITERION_PREFIX.replace(&lowered, "");
    collapse_whitespace(&stripped)
}

fn collapse_whitespace(text: &str) -> String {
    WHITESPACE.replace_all(text.trim(), " ").into_owned()
}
