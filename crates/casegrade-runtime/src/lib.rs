//! # casegrade-runtime
//!
//! Inference-backed evaluation and batch orchestration for casegrade.
//!
//! `casegrade-core` decides what a model response is worth. This crate
//! gets the response in the first place and keeps track of the results:
//! - [`CaseEvaluator`] renders a case into its rubric and makes one inference call
//! - [`BatchOrchestrator`] runs a job's cases in order with retry and cancellation
//! - [`OutcomeStore`] persists at most one outcome per `(job_id, case_id)`
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use casegrade_runtime::{
//!     BatchOrchestrator, CaseEvaluator, MemoryStore, ProviderRegistry, RuntimeConfig,
//! };
//!
//! let config = RuntimeConfig::from_env()?;
//! let provider = ProviderRegistry::with_defaults().create("openai", &config.provider_options)?;
//! let evaluator = Arc::new(CaseEvaluator::new(provider, config));
//!
//! let store = Arc::new(MemoryStore::new());
//! store.create_job(&EvaluationJob::new("job-1", "rubric.txt", "gpt-4o", cases.len())).await?;
//!
//! let summary = BatchOrchestrator::builder(evaluator, store)
//!     .build()
//!     .run_job("job-1", &cases, Path::new("rubric.txt"))
//!     .await?;
//! ```

pub mod cache;
pub mod config;
pub mod correlation;
pub mod evaluator;
pub mod metrics;
pub mod orchestrator;
pub mod prompts;
pub mod providers;
pub mod store;

pub use cache::RubricCache;
pub use config::{ConfigError, RetryConfig, RuntimeConfig, DEFAULT_MODEL};
pub use correlation::{CorrelationIdProvider, NoCorrelation, SpanCorrelation, StaticCorrelation};
pub use evaluator::CaseEvaluator;
pub use metrics::{UsageSummary, UsageTracker};
pub use orchestrator::{
    BatchOrchestrator, BatchOrchestratorBuilder, BatchSummary, JobProgress, OrchestratorError,
    ProgressReporter, TracingReporter,
};
pub use prompts::{detect_content_moderation, render_case_prompt, SYSTEM_PROMPT};
pub use providers::{
    ApiCredential, ChatMessage, CompletionConfig, CompletionResponse, LlmProvider, ProviderError,
    ProviderFactory, ProviderRegistry,
};
pub use store::{JobTransition, MemoryStore, OutcomeStore, StoreError, UpsertResult};

#[cfg(feature = "openai")]
pub use providers::OpenAiProvider;

#[cfg(feature = "sqlite")]
pub use store::SqliteStore;
