//! Score reconciliation for untrusted model output.
//!
//! The model is asked for a JSON evaluation, but nothing it returns is
//! trusted as-is. Criterion ids are checked against the rubric, every score
//! is clamped into its criterion's range, and the overall percentage is
//! recomputed from the corrected scores. Declared totals and maxima are only
//! compared, never used.

use super::extract::{classify_unparseable, find_json_object, preview};
use crate::rubric::RubricSchema;
use crate::score::{score_from_value, validate_criterion_score};
use crate::types::{
    CriterionScoreEntry, ErrorKind, EvaluationOutcome, ValidationAudit, UNKNOWN_COMPLEXITY,
};
use chrono::Utc;
use serde_json::{json, Map, Value as JsonValue};
use std::collections::BTreeMap;
use thiserror::Error;

/// Declared totals within this distance of the computed sum are accepted.
pub const TOTAL_TOLERANCE: f64 = 0.1;

const FEEDBACK_PREVIEW_CHARS: usize = 200;
const LOG_PREVIEW_CHARS: usize = 500;

/// Reasons a response cannot be scored.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResponseParseError {
    #[error("Response was empty")]
    EmptyResponse,

    #[error("Response too short to hold an evaluation ({length} chars)")]
    TruncatedResponse { length: usize },

    #[error("Response did not contain a valid evaluation JSON object")]
    InvalidResponseFormat,

    #[error("Criterion {reference} is not defined in the rubric")]
    UnknownCriterion { reference: String },
}

impl ResponseParseError {
    /// Stable classification persisted with failed outcomes.
    pub fn error_type(&self) -> ErrorKind {
        match self {
            ResponseParseError::EmptyResponse => ErrorKind::EmptyResponse,
            ResponseParseError::TruncatedResponse { .. } => ErrorKind::TruncatedResponse,
            ResponseParseError::InvalidResponseFormat => ErrorKind::InvalidResponseFormat,
            ResponseParseError::UnknownCriterion { .. } => ErrorKind::UnknownCriterion,
        }
    }

    fn unparseable(raw: &str) -> Self {
        match classify_unparseable(raw) {
            ErrorKind::EmptyResponse => ResponseParseError::EmptyResponse,
            ErrorKind::TruncatedResponse => ResponseParseError::TruncatedResponse {
                length: raw.trim().chars().count(),
            },
            _ => ResponseParseError::InvalidResponseFormat,
        }
    }
}

/// A response that was scored against the rubric.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredEvaluation {
    pub entries: Vec<CriterionScoreEntry>,
    pub criterion_scores: BTreeMap<u32, f64>,
    pub overall_score: f64,
    pub complexity_level: String,
    pub recommendations: Vec<String>,

    /// The model JSON, pretty-printed, with totals rewritten to validated values
    pub feedback: String,

    pub audit: ValidationAudit,
}

impl ScoredEvaluation {
    /// Package as a successful outcome. Caller fills timing, tokens and model.
    pub fn into_outcome(self, case_id: impl Into<String>) -> EvaluationOutcome {
        EvaluationOutcome {
            case_id: case_id.into(),
            success: true,
            overall_score: self.overall_score,
            complexity_level: self.complexity_level,
            criterion_scores: self.criterion_scores,
            criterion_entries: self.entries,
            feedback: self.feedback,
            model_used: String::new(),
            token_usage: Default::default(),
            trace_id: None,
            processing_time: 0.0,
            error_type: None,
            audit: Some(self.audit),
            recommendations: self.recommendations,
            flagged_for_review: false,
            review_priority: Default::default(),
            content_moderation: false,
            attempts: 0,
        }
    }
}

/// Validates raw model output against one rubric.
pub struct ResponseValidator<'a> {
    rubric: &'a RubricSchema,
}

impl<'a> ResponseValidator<'a> {
    pub fn new(rubric: &'a RubricSchema) -> Self {
        Self { rubric }
    }

    /// Parse, reconcile and score a raw response.
    pub fn validate(&self, raw: &str) -> Result<ScoredEvaluation, ResponseParseError> {
        let Some(mut parsed) = find_json_object(raw) else {
            return Err(ResponseParseError::unparseable(raw));
        };

        let mut issues = Vec::new();
        let mut corrections = Vec::new();

        let raw_scores = self.collect_raw_scores(&parsed, &mut issues)?;

        let max_possible = self.rubric.max_possible_score();
        let max_f = f64::from(max_possible);

        let mut entries = Vec::with_capacity(raw_scores.len());
        for (&id, &raw_score) in &raw_scores {
            // collect_raw_scores only admits ids known to the rubric
            let max_score = f64::from(self.rubric.max_score(id).unwrap_or(0));
            let corrected = validate_criterion_score(raw_score, max_score);

            if corrected != raw_score {
                corrections.push(format!(
                    "Corrected criterion {}: {} → {}",
                    id, raw_score, corrected
                ));
                if raw_score < 0.0 {
                    issues.push(format!(
                        "Criterion {}: Score {} below minimum (0)",
                        id, raw_score
                    ));
                } else if raw_score > max_score {
                    issues.push(format!(
                        "Criterion {}: Score {} exceeds maximum ({})",
                        id, raw_score, max_score
                    ));
                }
            }

            entries.push(CriterionScoreEntry {
                criterion_id: id,
                raw_score,
                corrected_score: corrected,
            });
        }

        // fold from +0.0: an empty f64 sum is -0.0
        let raw_sum = entries.iter().fold(0.0, |acc, e| acc + e.raw_score);
        let calculated_sum = entries.iter().fold(0.0, |acc, e| acc + e.corrected_score);
        let original_overall = percentage(raw_sum, max_f);
        let overall_score = percentage(calculated_sum, max_f);

        if entries.len() != self.rubric.len() {
            issues.push(format!(
                "Expected {} criteria, found {}",
                self.rubric.len(),
                entries.len()
            ));
        }

        let declared_total = declared_total(&parsed);
        if let Some(declared) = declared_total {
            if (declared - calculated_sum).abs() > TOTAL_TOLERANCE {
                issues.push(format!(
                    "Math mismatch: Declared {}, calculated {}",
                    declared, calculated_sum
                ));
                corrections.push(format!("Using calculated sum: {}", calculated_sum));
            }
        }

        if let Some(declared_max) = parsed
            .get("final_validation")
            .and_then(|fv| fv.get("maximum_possible_score"))
            .and_then(score_from_value)
        {
            if (declared_max - max_f).abs() > TOTAL_TOLERANCE {
                issues.push(format!(
                    "Declared maximum {} differs from rubric maximum {}; using rubric",
                    declared_max, max_possible
                ));
            }
        }

        let complexity_level = complexity_level(&parsed);
        let recommendations = recommendations(&parsed);
        rewrite_totals(&mut parsed, calculated_sum, max_possible, overall_score);
        let feedback = serde_json::to_string_pretty(&JsonValue::Object(parsed))
            .unwrap_or_default();

        let validation_passed = issues.is_empty();
        if validation_passed {
            tracing::debug!(overall_score, "Validation passed");
        } else {
            tracing::warn!(count = issues.len(), "Validation issues found");
            for issue in &issues {
                tracing::warn!(issue = %issue, "Validation issue");
            }
        }
        for correction in &corrections {
            tracing::info!(correction = %correction, "Score corrected");
        }

        let criterion_scores = entries
            .iter()
            .map(|e| (e.criterion_id, e.corrected_score))
            .collect();

        Ok(ScoredEvaluation {
            entries,
            criterion_scores,
            overall_score,
            complexity_level,
            recommendations,
            feedback,
            audit: ValidationAudit {
                issues,
                corrections,
                validation_passed,
                original_overall,
                validated_overall: overall_score,
                declared_total,
                calculated_sum,
                max_possible_score: max_possible,
                evaluated_at: Utc::now(),
            },
        })
    }

    /// Raw score per known criterion id.
    ///
    /// Ids are the reconciliation key; display text is consulted only when an
    /// entry has no id. Unknown criteria abort scoring.
    fn collect_raw_scores(
        &self,
        parsed: &Map<String, JsonValue>,
        issues: &mut Vec<String>,
    ) -> Result<BTreeMap<u32, f64>, ResponseParseError> {
        let mut scores = BTreeMap::new();

        let Some(items) = parsed.get("criteria").and_then(JsonValue::as_array) else {
            issues.push("Response has no criteria array".to_string());
            return Ok(scores);
        };

        for item in items {
            let Some(entry) = item.as_object() else {
                issues.push(format!("Ignored malformed criteria entry: {}", item));
                continue;
            };

            let id = self.resolve_id(entry)?;

            let raw_score = match entry.get("score").and_then(score_from_value) {
                Some(score) => score,
                None => {
                    issues.push(format!(
                        "Criterion {}: missing or non-numeric score, counted as 0",
                        id
                    ));
                    0.0
                }
            };

            if scores.insert(id, raw_score).is_some() {
                issues.push(format!(
                    "Criterion {} scored more than once; using the last score",
                    id
                ));
            }
        }

        Ok(scores)
    }

    fn resolve_id(&self, entry: &Map<String, JsonValue>) -> Result<u32, ResponseParseError> {
        let text = entry.get("criterion").and_then(JsonValue::as_str);

        match entry.get("id").filter(|v| !v.is_null()) {
            Some(value) => {
                let id = criterion_id_from_value(value).ok_or_else(|| {
                    ResponseParseError::UnknownCriterion {
                        reference: value.to_string(),
                    }
                })?;
                if self.rubric.get(id).is_none() {
                    return Err(ResponseParseError::UnknownCriterion {
                        reference: id.to_string(),
                    });
                }
                Ok(id)
            }
            None => text
                .and_then(|t| self.rubric.find_by_text(t))
                .map(|c| c.id)
                .ok_or_else(|| ResponseParseError::UnknownCriterion {
                    reference: format!("\"{}\"", text.unwrap_or("<no id or text>")),
                }),
        }
    }
}

/// Parse and validate, folding any failure into a failed outcome.
///
/// The returned outcome has an empty `case_id`; token, model and timing
/// fields are left for the caller.
pub fn parse_and_validate(raw: &str, rubric: &RubricSchema) -> EvaluationOutcome {
    match ResponseValidator::new(rubric).validate(raw) {
        Ok(scored) => scored.into_outcome(String::new()),
        Err(err) => {
            let kind = err.error_type();
            tracing::error!(
                error_type = kind.as_str(),
                length = raw.len(),
                raw = preview(raw, LOG_PREVIEW_CHARS),
                "Failed to score response"
            );
            EvaluationOutcome::failure(String::new(), kind, failure_feedback(&err, raw))
        }
    }
}

fn failure_feedback(err: &ResponseParseError, raw: &str) -> String {
    format!(
        "EVALUATION FAILED: {}. {}. Raw response: {}",
        err.error_type(),
        err,
        preview(raw, FEEDBACK_PREVIEW_CHARS)
    )
}

fn percentage(sum: f64, max: f64) -> f64 {
    if max > 0.0 {
        sum / max * 100.0
    } else {
        0.0
    }
}

fn criterion_id_from_value(value: &JsonValue) -> Option<u32> {
    match value {
        JsonValue::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn declared_total(parsed: &Map<String, JsonValue>) -> Option<f64> {
    parsed
        .get("final_validation")
        .and_then(|fv| fv.get("final_score"))
        .or_else(|| parsed.get("final_score"))
        .and_then(score_from_value)
}

fn complexity_level(parsed: &Map<String, JsonValue>) -> String {
    match parsed.get("complexity_assessment") {
        Some(JsonValue::Object(obj)) => obj
            .get("complexity_level")
            .and_then(JsonValue::as_str)
            .unwrap_or(UNKNOWN_COMPLEXITY)
            .to_string(),
        Some(JsonValue::String(level)) => level.clone(),
        _ => UNKNOWN_COMPLEXITY.to_string(),
    }
}

fn recommendations(parsed: &Map<String, JsonValue>) -> Vec<String> {
    parsed
        .get("recommendations")
        .and_then(JsonValue::as_array)
        .map(|items| {
            items
                .iter()
                .map(|item| match item {
                    JsonValue::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect()
        })
        .unwrap_or_default()
}

fn rewrite_totals(parsed: &mut Map<String, JsonValue>, sum: f64, max: u32, overall: f64) {
    if let Some(JsonValue::Object(fv)) = parsed.get_mut("final_validation") {
        fv.insert("final_score".to_string(), json!(sum));
        fv.insert("maximum_possible_score".to_string(), json!(max));
        if max > 0 {
            fv.insert("final_percentage".to_string(), json!(format!("{:.0}%", overall)));
        }
    }

    if let Some(JsonValue::Object(summary)) = parsed.get_mut("evaluation_summary") {
        summary.insert(
            "overall_score".to_string(),
            json!(format!("{}/{}", sum.trunc() as i64, max)),
        );
        if max > 0 {
            summary.insert(
                "overall_percentage".to_string(),
                json!(format!("{:.0}%", overall)),
            );
        }
    }
}
