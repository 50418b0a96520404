//! Rubric extraction from prompt documents.

use super::patterns::{
    extract_criterion_texts, extract_maxima, extract_safety_ids, normalize_criterion_text,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur when loading a rubric.
#[derive(Error, Debug)]
pub enum RubricError {
    #[error("Rubric document not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("No criterion maxima found in rubric document: {0}")]
    Empty(String),

    #[error("Failed to read rubric document: {0}")]
    Io(#[from] std::io::Error),

    #[error("Duplicate criterion id: {0}")]
    DuplicateCriterion(u32),

    #[error("Criterion maxima overflow the total score")]
    MaxScoreOverflow,
}

/// One scored dimension of a rubric.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Criterion {
    /// Criterion id, unique within a rubric
    pub id: u32,

    /// Display text; `"Criterion N"` when the document carries none
    pub text: String,

    /// Maximum points
    pub max_score: u32,

    /// Whether the criterion is safety-relevant
    #[serde(default)]
    pub is_safety: bool,
}

impl Criterion {
    pub fn new(id: u32, text: impl Into<String>, max_score: u32) -> Self {
        Self {
            id,
            text: text.into(),
            max_score,
            is_safety: false,
        }
    }

    pub fn safety(mut self) -> Self {
        self.is_safety = true;
        self
    }
}

/// Ordered, immutable set of criteria.
///
/// Criteria are kept sorted by id and ids are unique. `max_possible_score`
/// is computed once at construction; a reload builds a new schema.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RubricSchema {
    criteria: Vec<Criterion>,
    max_possible_score: u32,
    #[serde(skip)]
    text_index: HashMap<String, u32>,
}

impl RubricSchema {
    /// Build a schema from explicit criteria.
    pub fn from_criteria(mut criteria: Vec<Criterion>) -> Result<Self, RubricError> {
        if criteria.is_empty() {
            return Err(RubricError::Empty("no criteria supplied".to_string()));
        }

        criteria.sort_by_key(|c| c.id);
        if let Some(pair) = criteria.windows(2).find(|w| w[0].id == w[1].id) {
            return Err(RubricError::DuplicateCriterion(pair[0].id));
        }

        let max_possible_score = criteria
            .iter()
            .try_fold(0u32, |acc, c| acc.checked_add(c.max_score))
            .ok_or(RubricError::MaxScoreOverflow)?;
        let text_index = criteria
            .iter()
            .map(|c| (normalize_criterion_text(&c.text), c.id))
            .collect();

        Ok(Self {
            criteria,
            max_possible_score,
            text_index,
        })
    }

    /// Derive a schema from rubric document text.
    ///
    /// `source` names the document in errors and logs.
    pub fn parse(content: &str, source: &str) -> Result<Self, RubricError> {
        let maxima = extract_maxima(content);
        if maxima.is_empty() {
            return Err(RubricError::Empty(source.to_string()));
        }

        let mut texts = extract_criterion_texts(content);
        let safety = extract_safety_ids(content);

        if safety.is_empty() {
            tracing::warn!(
                rubric = source,
                "No safety criteria found; mark them with '(safety criterion)'"
            );
        } else {
            tracing::debug!(rubric = source, safety = ?safety, "Extracted safety criteria");
        }

        let criteria = maxima
            .into_iter()
            .map(|(id, max_score)| Criterion {
                id,
                text: texts
                    .remove(&id)
                    .unwrap_or_else(|| format!("Criterion {}", id)),
                max_score,
                is_safety: safety.contains(&id),
            })
            .collect();

        Self::from_criteria(criteria)
    }

    /// Criteria sorted by id.
    pub fn criteria(&self) -> &[Criterion] {
        &self.criteria
    }

    pub fn len(&self) -> usize {
        self.criteria.len()
    }

    pub fn is_empty(&self) -> bool {
        self.criteria.is_empty()
    }

    /// Sum of all criterion maxima.
    pub fn max_possible_score(&self) -> u32 {
        self.max_possible_score
    }

    pub fn get(&self, id: u32) -> Option<&Criterion> {
        self.criteria
            .binary_search_by_key(&id, |c| c.id)
            .ok()
            .map(|idx| &self.criteria[idx])
    }

    pub fn max_score(&self, id: u32) -> Option<u32> {
        self.get(id).map(|c| c.max_score)
    }

    /// Find a criterion by display text.
    ///
    /// Texts are normalized first. An exact match wins; otherwise the first
    /// criterion (by id) whose text contains, or is contained in, the query.
    pub fn find_by_text(&self, text: &str) -> Option<&Criterion> {
        let normalized = normalize_criterion_text(text);
        if normalized.is_empty() {
            return None;
        }

        if let Some(id) = self.text_index.get(&normalized) {
            return self.get(*id);
        }

        self.criteria.iter().find(|c| {
            let candidate = normalize_criterion_text(&c.text);
            !candidate.is_empty()
                && (candidate.contains(&normalized) || normalized.contains(&candidate))
        })
    }

    /// Safety-relevant criteria, sorted by id.
    pub fn safety_criteria(&self) -> impl Iterator<Item = &Criterion> {
        self.criteria.iter().filter(|c| c.is_safety)
    }

    /// Display text to maximum points.
    pub fn max_scores_by_text(&self) -> BTreeMap<String, u32> {
        self.criteria
            .iter()
            .map(|c| (c.text.clone(), c.max_score))
            .collect()
    }
}

/// A rubric document: its path, raw text and derived schema.
///
/// The raw text doubles as the prompt template for the inference call.
#[derive(Debug, Clone)]
pub struct RubricDocument {
    pub path: PathBuf,
    pub content: String,
    pub schema: RubricSchema,
}

impl RubricDocument {
    /// Read and parse a rubric document from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RubricError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(RubricError::NotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let schema = RubricSchema::parse(&content, &path.display().to_string())?;

        tracing::debug!(
            rubric = %path.display(),
            criteria = schema.len(),
            max_possible_score = schema.max_possible_score(),
            "Loaded rubric"
        );

        Ok(Self {
            path: path.to_path_buf(),
            content,
            schema,
        })
    }

    /// Build a document from text already in memory.
    pub fn from_text(path: impl Into<PathBuf>, content: impl Into<String>) -> Result<Self, RubricError> {
        let path = path.into();
        let content = content.into();
        let schema = RubricSchema::parse(&content, &path.display().to_string())?;
        Ok(Self {
            path,
            content,
            schema,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;

    const SAMPLE: &str = include_str!("../../fixtures/sample_rubric.txt");

    #[test]
    fn test_parse_sample_rubric() {
        let schema = RubricSchema::parse(SAMPLE, "sample").unwrap();

        assert_eq!(schema.len(), 4);
        assert_eq!(schema.max_possible_score(), 30);
        assert_eq!(schema.max_score(1), Some(10));
        assert_eq!(schema.max_score(9), None);

        let second = schema.get(2).unwrap();
        assert_eq!(second.text, "Orders appropriate follow-up imaging");

        let safety: Vec<u32> = schema.safety_criteria().map(|c| c.id).collect();
        assert_eq!(safety, vec![3, 4]);
    }

    #[test]
    fn test_missing_text_gets_placeholder() {
        let schema = RubricSchema::parse("Criterion 5: Maximum 2 points", "inline").unwrap();
        assert_eq!(schema.get(5).unwrap().text, "Criterion 5");
    }

    #[test]
    fn test_no_maxima_is_empty_error() {
        let err = RubricSchema::parse("Score the case fairly.", "inline").unwrap_err();
        assert!(matches!(err, RubricError::Empty(_)));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let err = RubricSchema::from_criteria(vec![
            Criterion::new(1, "a", 2),
            Criterion::new(1, "b", 3),
        ])
        .unwrap_err();
        assert!(matches!(err, RubricError::DuplicateCriterion(1)));
    }

    #[test]
    fn test_overflowing_maxima_rejected() {
        let err = RubricSchema::from_criteria(vec![
            Criterion::new(1, "a", u32::MAX),
            Criterion::new(2, "b", 1),
        ])
        .unwrap_err();
        assert!(matches!(err, RubricError::MaxScoreOverflow));
    }

    #[test]
    fn test_find_by_text() {
        let schema = RubricSchema::parse(SAMPLE, "sample").unwrap();

        let exact = schema.find_by_text("Criterion 3: flags contraindicated   MEDICATIONS");
        assert_eq!(exact.map(|c| c.id), Some(3));

        let partial = schema.find_by_text("specialist referral");
        assert_eq!(partial.map(|c| c.id), Some(4));

        assert!(schema.find_by_text("unrelated text").is_none());
        assert!(schema.find_by_text("   ").is_none());
    }

    #[test]
    fn test_max_scores_by_text() {
        let schema = RubricSchema::parse(SAMPLE, "sample").unwrap();
        let map = schema.max_scores_by_text();
        assert_eq!(map.get("Identifies the primary diagnosis"), Some(&10));
    }

    #[test]
    fn test_load_missing_document() {
        let err = RubricDocument::load("/nonexistent/rubric.txt").unwrap_err();
        assert!(matches!(err, RubricError::NotFound(_)));
    }

    #[test]
    fn test_load_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let doc = RubricDocument::load(file.path()).unwrap();
        assert_eq!(doc.schema.max_possible_score(), 30);
        assert!(doc.content.contains("{summary}"));
    }

    proptest! {
        #[test]
        fn prop_parsed_ids_unique_and_sum(maxima in proptest::collection::btree_map(0u32..500, 0u32..100, 1..20)) {
            let content: String = maxima
                .iter()
                .map(|(id, max)| format!("Criterion {}: Maximum {} points\n", id, max))
                .collect();

            let schema = RubricSchema::parse(&content, "generated").unwrap();
            let ids: Vec<u32> = schema.criteria().iter().map(|c| c.id).collect();
            let mut deduped = ids.clone();
            deduped.dedup();

            prop_assert_eq!(ids.len(), deduped.len());
            prop_assert_eq!(schema.max_possible_score(), maxima.values().sum::<u32>());
        }
    }
}
