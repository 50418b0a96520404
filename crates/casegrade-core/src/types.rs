//! Core data model: cases, outcomes, audits and jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// One case to evaluate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaseInput {
    pub case_id: String,
    pub summary: String,
    pub recommendation: String,
}

impl CaseInput {
    pub fn new(
        case_id: impl Into<String>,
        summary: impl Into<String>,
        recommendation: impl Into<String>,
    ) -> Self {
        Self {
            case_id: case_id.into(),
            summary: summary.into(),
            recommendation: recommendation.into(),
        }
    }
}

/// Provider-reported token counts.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

/// A criterion score before and after clamping.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CriterionScoreEntry {
    pub criterion_id: u32,
    pub raw_score: f64,
    pub corrected_score: f64,
}

impl CriterionScoreEntry {
    pub fn was_corrected(&self) -> bool {
        self.raw_score != self.corrected_score
    }
}

/// Record of what reconciliation found and changed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationAudit {
    pub issues: Vec<String>,
    pub corrections: Vec<String>,
    pub validation_passed: bool,

    /// Percentage from raw model scores
    pub original_overall: f64,

    /// Percentage from corrected scores
    pub validated_overall: f64,

    /// Total the model declared, if any
    pub declared_total: Option<f64>,

    pub calculated_sum: f64,
    pub max_possible_score: u32,
    pub evaluated_at: DateTime<Utc>,
}

/// Why a case failed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    EmptyResponse,
    TruncatedResponse,
    InvalidResponseFormat,
    UnknownCriterion,
    RubricUnavailable,
    ProviderFailure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::EmptyResponse => "empty_response",
            ErrorKind::TruncatedResponse => "truncated_response",
            ErrorKind::InvalidResponseFormat => "invalid_response_format",
            ErrorKind::UnknownCriterion => "unknown_criterion",
            ErrorKind::RubricUnavailable => "rubric_unavailable",
            ErrorKind::ProviderFailure => "provider_failure",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "empty_response" => Some(ErrorKind::EmptyResponse),
            "truncated_response" => Some(ErrorKind::TruncatedResponse),
            "invalid_response_format" => Some(ErrorKind::InvalidResponseFormat),
            "unknown_criterion" => Some(ErrorKind::UnknownCriterion),
            "rubric_unavailable" => Some(ErrorKind::RubricUnavailable),
            "provider_failure" => Some(ErrorKind::ProviderFailure),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Human review priority for low-scoring outcomes.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReviewPriority {
    #[default]
    None,
    Medium,
    High,
}

/// Result of evaluating one case, successful or not.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvaluationOutcome {
    pub case_id: String,
    pub success: bool,

    /// Validated percentage, 0 to 100
    pub overall_score: f64,

    pub complexity_level: String,

    /// Corrected score per criterion id
    pub criterion_scores: BTreeMap<u32, f64>,

    #[serde(default)]
    pub criterion_entries: Vec<CriterionScoreEntry>,

    pub feedback: String,
    pub model_used: String,
    pub token_usage: TokenUsage,
    pub trace_id: Option<String>,

    /// Wall-clock seconds spent in the inference call
    pub processing_time: f64,

    pub error_type: Option<ErrorKind>,

    #[serde(default)]
    pub audit: Option<ValidationAudit>,

    #[serde(default)]
    pub recommendations: Vec<String>,

    #[serde(default)]
    pub flagged_for_review: bool,

    #[serde(default)]
    pub review_priority: ReviewPriority,

    /// Raw text carried refusal or content-policy language
    #[serde(default)]
    pub content_moderation: bool,

    /// Evaluation attempts spent on this case
    #[serde(default)]
    pub attempts: u32,
}

/// Complexity level used when the model reports none.
pub const UNKNOWN_COMPLEXITY: &str = "Unknown";

impl EvaluationOutcome {
    /// A zero-score failure with no criterion scores.
    pub fn failure(case_id: impl Into<String>, kind: ErrorKind, feedback: impl Into<String>) -> Self {
        Self {
            case_id: case_id.into(),
            success: false,
            overall_score: 0.0,
            complexity_level: UNKNOWN_COMPLEXITY.to_string(),
            criterion_scores: BTreeMap::new(),
            criterion_entries: Vec::new(),
            feedback: feedback.into(),
            model_used: String::new(),
            token_usage: TokenUsage::default(),
            trace_id: None,
            processing_time: 0.0,
            error_type: Some(kind),
            audit: None,
            recommendations: Vec::new(),
            flagged_for_review: false,
            review_priority: ReviewPriority::None,
            content_moderation: false,
            attempts: 0,
        }
    }

    /// Flag successful outcomes scoring below `review_threshold`.
    ///
    /// Below `high_priority_threshold` the priority is `High`, otherwise `Medium`.
    /// Failed outcomes are never flagged.
    pub fn apply_review_policy(&mut self, review_threshold: f64, high_priority_threshold: f64) {
        if self.success && self.overall_score < review_threshold {
            self.flagged_for_review = true;
            self.review_priority = if self.overall_score < high_priority_threshold {
                ReviewPriority::High
            } else {
                ReviewPriority::Medium
            };
        } else {
            self.flagged_for_review = false;
            self.review_priority = ReviewPriority::None;
        }
    }

    pub fn error_type_str(&self) -> Option<&'static str> {
        self.error_type.as_ref().map(ErrorKind::as_str)
    }
}

/// Lifecycle of a batch job.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Cancelled | JobStatus::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "cancelled" => Some(JobStatus::Cancelled),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A batch of cases evaluated under one rubric and one model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvaluationJob {
    pub id: String,
    pub rubric_source: String,
    pub model: String,
    pub status: JobStatus,
    pub total_cases: usize,
    pub processed_cases: usize,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl EvaluationJob {
    pub fn new(
        id: impl Into<String>,
        rubric_source: impl Into<String>,
        model: impl Into<String>,
        total_cases: usize,
    ) -> Self {
        Self {
            id: id.into(),
            rubric_source: rubric_source.into(),
            model: model.into(),
            status: JobStatus::Pending,
            total_cases,
            processed_cases: 0,
            start_time: None,
            end_time: None,
            error_message: None,
        }
    }
}
