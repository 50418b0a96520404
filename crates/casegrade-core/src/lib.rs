//! # casegrade-core
//!
//! Deterministic rubric scoring for model-evaluated medical cases.
//!
//! This crate turns a rubric document and a raw model response into a
//! numerically sound, auditable score:
//! - Which criteria does the rubric define, and what are they worth?
//! - Which criterion scores did the model actually produce?
//! - What had to be corrected to make them consistent?
//!
//! ## Key Guarantees
//!
//! 1. **No model calls**: everything here is pure and synchronous
//! 2. **Rubric is authoritative**: maxima and totals always come from the rubric
//! 3. **Auditable**: every clamp and mismatch lands in a [`ValidationAudit`]
//!
//! ## Example
//!
//! ```rust,ignore
//! use casegrade_core::{parse_and_validate, RubricDocument};
//!
//! let rubric = RubricDocument::load("prompts/cardiology.txt")?;
//! let outcome = parse_and_validate(&raw_model_text, &rubric.schema);
//!
//! if outcome.success {
//!     println!("{:.1}%", outcome.overall_score);
//! } else {
//!     println!("failed: {}", outcome.error_type_str().unwrap_or("unknown"));
//! }
//! ```

pub mod response;
pub mod rubric;
pub mod score;
pub mod types;

pub use response::{parse_and_validate, ResponseParseError, ResponseValidator, ScoredEvaluation};
pub use rubric::{Criterion, RubricDocument, RubricError, RubricSchema};
pub use score::{criterion_score, score_from_value, validate_criterion_score, ScoreEntry};
pub use types::{
    CaseInput, CriterionScoreEntry, ErrorKind, EvaluationJob, EvaluationOutcome, JobStatus,
    ReviewPriority, TokenUsage, ValidationAudit, UNKNOWN_COMPLEXITY,
};
