//! Score extraction and clamping shared by the validator and the stores.
//!
//! Persisted criterion scores exist in two historical shapes: a bare number,
//! or an object carrying the score together with its criterion id. Both are
//! represented by [`ScoreEntry`] and read through [`criterion_score`].

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A single criterion score as produced by a model or read back from storage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScoreEntry {
    /// Structured shape: `{"score": 7, "id": 3}`
    Scored { score: f64, id: u32 },

    /// Legacy shape: a bare number
    Number(f64),
}

impl ScoreEntry {
    /// The numeric score regardless of shape.
    pub fn score(&self) -> f64 {
        match self {
            ScoreEntry::Scored { score, .. } => *score,
            ScoreEntry::Number(score) => *score,
        }
    }

    /// The criterion id, when the entry carries one.
    pub fn id(&self) -> Option<u32> {
        match self {
            ScoreEntry::Scored { id, .. } => Some(*id),
            ScoreEntry::Number(_) => None,
        }
    }

    /// Same shape, different score.
    pub fn with_score(self, score: f64) -> Self {
        match self {
            ScoreEntry::Scored { id, .. } => ScoreEntry::Scored { score, id },
            ScoreEntry::Number(_) => ScoreEntry::Number(score),
        }
    }
}

/// Extract the numeric score from an entry of either shape.
pub fn criterion_score(entry: &ScoreEntry) -> f64 {
    entry.score()
}

/// Clamp a score into `[0, max_score]`.
///
/// Non-finite scores collapse to `0`, and a negative maximum is treated as `0`.
pub fn validate_criterion_score(score: f64, max_score: f64) -> f64 {
    if !score.is_finite() {
        return 0.0;
    }
    let max = if max_score.is_finite() && max_score > 0.0 {
        max_score
    } else {
        0.0
    };
    score.clamp(0.0, max)
}

/// Read a numeric score out of an arbitrary JSON value.
///
/// Accepts numbers and numeric strings (`"7"`, `" 4.5 "`). Anything else
/// yields `None`.
pub fn score_from_value(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        _ => None,
    }
}
