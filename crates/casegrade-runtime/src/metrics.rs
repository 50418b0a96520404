//! Inference usage accounting.
//!
//! Every inference call made by a [`CaseEvaluator`](crate::CaseEvaluator)
//! is recorded here: duration, success, and provider-reported tokens.

use casegrade_core::TokenUsage;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Snapshot of accumulated usage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,

    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,

    /// Seconds
    pub total_duration: f64,
    pub min_duration: Option<f64>,
    pub max_duration: Option<f64>,
    pub avg_duration: f64,

    /// Fraction of successful calls, 0.0 when nothing was called
    pub success_rate: f64,
}

impl UsageSummary {
    fn add(&mut self, duration: Duration, success: bool, usage: Option<&TokenUsage>) {
        let secs = duration.as_secs_f64();

        self.total_calls += 1;
        if success {
            self.successful_calls += 1;
        } else {
            self.failed_calls += 1;
        }

        if let Some(usage) = usage {
            self.prompt_tokens += u64::from(usage.prompt_tokens);
            self.completion_tokens += u64::from(usage.completion_tokens);
            self.total_tokens += u64::from(usage.total_tokens);
        }

        self.total_duration += secs;
        self.min_duration = Some(self.min_duration.map_or(secs, |m| m.min(secs)));
        self.max_duration = Some(self.max_duration.map_or(secs, |m| m.max(secs)));
        self.avg_duration = self.total_duration / self.total_calls as f64;
        self.success_rate = self.successful_calls as f64 / self.total_calls as f64;
    }
}

/// Thread-safe usage accumulator shared by evaluators.
#[derive(Debug, Default)]
pub struct UsageTracker {
    summary: RwLock<UsageSummary>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one inference call.
    pub fn record(&self, duration: Duration, success: bool, usage: Option<&TokenUsage>) {
        self.summary.write().add(duration, success, usage);
    }

    pub fn summary(&self) -> UsageSummary {
        self.summary.read().clone()
    }

    pub fn reset(&self) {
        *self.summary.write() = UsageSummary::default();
    }
}
