//! Single-case evaluation.
//!
//! [`CaseEvaluator`] renders one case into its rubric, makes exactly one
//! inference call, and scores the reply. It never persists anything and
//! never retries; both belong to the orchestrator.

use std::path::Path;
use std::sync::Arc;

use casegrade_core::{parse_and_validate, CaseInput, ErrorKind, EvaluationOutcome, RubricDocument};
use tokio::time::Instant;

use crate::cache::RubricCache;
use crate::config::RuntimeConfig;
use crate::correlation::{CorrelationIdProvider, SpanCorrelation};
use crate::metrics::UsageTracker;
use crate::prompts::{detect_content_moderation, render_case_prompt, SYSTEM_PROMPT};
use crate::providers::{ChatMessage, LlmProvider};

/// Evaluates one case against one rubric.
///
/// Owns the rubric cache so repeated cases under the same rubric read the
/// document once per process.
pub struct CaseEvaluator {
    provider: Arc<dyn LlmProvider>,
    rubrics: RubricCache,
    config: RuntimeConfig,
    usage: Arc<UsageTracker>,
    correlation: Arc<dyn CorrelationIdProvider>,
}

impl CaseEvaluator {
    pub fn new(provider: Arc<dyn LlmProvider>, config: RuntimeConfig) -> Self {
        Self {
            provider,
            rubrics: RubricCache::new(config.rubric_cache_capacity),
            config,
            usage: Arc::new(UsageTracker::new()),
            correlation: Arc::new(SpanCorrelation),
        }
    }

    /// Share a rubric cache with other evaluators.
    pub fn with_rubric_cache(mut self, rubrics: RubricCache) -> Self {
        self.rubrics = rubrics;
        self
    }

    /// Share a usage tracker with other evaluators.
    pub fn with_usage_tracker(mut self, usage: Arc<UsageTracker>) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_correlation(mut self, correlation: Arc<dyn CorrelationIdProvider>) -> Self {
        self.correlation = correlation;
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn rubrics(&self) -> &RubricCache {
        &self.rubrics
    }

    pub fn usage(&self) -> &UsageTracker {
        &self.usage
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Evaluate a case, loading the rubric through the cache.
    ///
    /// A rubric that cannot be loaded fails this case only.
    pub async fn evaluate(&self, case: &CaseInput, rubric_source: &Path) -> EvaluationOutcome {
        match self.rubrics.load(rubric_source).await {
            Ok(rubric) => self.evaluate_with_rubric(case, &rubric).await,
            Err(err) => {
                tracing::error!(
                    case_id = %case.case_id,
                    rubric = %rubric_source.display(),
                    error = %err,
                    "Rubric unavailable"
                );
                let mut outcome = EvaluationOutcome::failure(
                    case.case_id.clone(),
                    ErrorKind::RubricUnavailable,
                    format!("EVALUATION FAILED: {}. {}", ErrorKind::RubricUnavailable, err),
                );
                outcome.model_used = self.config.default_model.clone();
                outcome
            }
        }
    }

    /// Evaluate a case against an already loaded rubric.
    #[tracing::instrument(
        name = "evaluate_case",
        skip_all,
        fields(case_id = %case.case_id, provider = self.provider.name())
    )]
    pub async fn evaluate_with_rubric(
        &self,
        case: &CaseInput,
        rubric: &RubricDocument,
    ) -> EvaluationOutcome {
        let prompt = render_case_prompt(&rubric.content, &case.summary, &case.recommendation);
        let messages = vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(prompt)];
        let trace_id = self.correlation.correlation_id();

        let started = Instant::now();
        let response = self
            .provider
            .complete(messages, &self.config.completion_config())
            .await;
        let elapsed = started.elapsed();

        let mut outcome = match response {
            Ok(response) => {
                let content_moderation = detect_content_moderation(&response.content);
                if content_moderation {
                    tracing::warn!(
                        length = response.content.len(),
                        "Response contains content-moderation language"
                    );
                }

                let mut outcome = parse_and_validate(&response.content, &rubric.schema);
                outcome.content_moderation = content_moderation;
                outcome.model_used = response
                    .model
                    .filter(|m| !m.trim().is_empty())
                    .unwrap_or_else(|| self.config.default_model.clone());
                if let Some(usage) = response.usage {
                    outcome.token_usage = usage;
                }
                outcome
            }
            Err(err) => {
                tracing::error!(error = %err, "Inference call failed");
                let mut outcome = EvaluationOutcome::failure(
                    String::new(),
                    ErrorKind::ProviderFailure,
                    format!("EVALUATION FAILED: {}. {}", ErrorKind::ProviderFailure, err),
                );
                outcome.model_used = self.config.default_model.clone();
                outcome
            }
        };

        outcome.case_id = case.case_id.clone();
        outcome.trace_id = trace_id;
        outcome.processing_time = elapsed.as_secs_f64();
        outcome.attempts = 1;
        outcome.apply_review_policy(
            self.config.review_threshold,
            self.config.high_priority_threshold,
        );

        self.usage.record(
            elapsed,
            outcome.success,
            Some(&outcome.token_usage).filter(|u| u.total_tokens > 0),
        );

        if outcome.success {
            tracing::info!(
                overall_score = outcome.overall_score,
                flagged = outcome.flagged_for_review,
                "Case evaluated"
            );
        }

        outcome
    }
}

impl std::fmt::Debug for CaseEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaseEvaluator")
            .field("provider", &self.provider.name())
            .field("rubrics", &self.rubrics)
            .field("default_model", &self.config.default_model)
            .finish()
    }
}
