//! Batch orchestration for evaluation jobs.
//!
//! A job moves `pending → running → {completed | cancelled | failed}`.
//! Cases run one at a time, in order:
//! - Job status is re-read before each case; `cancelled` stops the loop
//! - A failed case is retried after a fixed delay, up to `retry.max_attempts`
//! - Every evaluated case yields exactly one stored outcome
//! - A store write failure for one case is logged and the batch continues
//!
//! Only errors outside the per-case loop (rubric, job bookkeeping) fail
//! the whole job.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use backon::{ConstantBuilder, Retryable};
use casegrade_core::{CaseInput, EvaluationOutcome, JobStatus, RubricDocument, RubricError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::Instrument;

use crate::config::RetryConfig;
use crate::evaluator::CaseEvaluator;
use crate::store::{JobTransition, OutcomeStore, StoreError, UpsertResult};

/// Job-level errors. Each one leaves the job `failed`.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Rubric error: {0}")]
    Rubric(#[from] RubricError),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job aborted: {0}")]
    Aborted(String),

    #[error("Store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for OrchestratorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::JobNotFound(id) => OrchestratorError::JobNotFound(id),
            other => OrchestratorError::Store(other),
        }
    }
}

/// Progress after one case.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub current: usize,
    pub total: usize,
    pub percentage: f64,
}

impl JobProgress {
    fn new(current: usize, total: usize) -> Self {
        let percentage = if total == 0 {
            100.0
        } else {
            current as f64 / total as f64 * 100.0
        };
        Self {
            current,
            total,
            percentage,
        }
    }
}

/// Receives progress after every case.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, job_id: &str, progress: &JobProgress);
}

/// Logs progress at `info`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl ProgressReporter for TracingReporter {
    fn report(&self, job_id: &str, progress: &JobProgress) {
        tracing::info!(
            job_id,
            current = progress.current,
            total = progress.total,
            percentage = progress.percentage,
            "Batch progress"
        );
    }
}

/// Counts for a finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub job_id: String,
    pub status: JobStatus,
    pub successful: usize,
    pub failed: usize,

    /// Cases never evaluated because the job was cancelled
    pub skipped: usize,

    /// Evaluated cases whose outcome was already stored
    pub duplicates: usize,

    /// Mean overall score of successful cases, 0.0 if none
    pub average_score: f64,
}

impl BatchSummary {
    fn new(job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            status: JobStatus::Running,
            successful: 0,
            failed: 0,
            skipped: 0,
            duplicates: 0,
            average_score: 0.0,
        }
    }
}

/// Runs evaluation jobs against an [`OutcomeStore`].
pub struct BatchOrchestrator {
    evaluator: Arc<CaseEvaluator>,
    store: Arc<dyn OutcomeStore>,
    reporter: Arc<dyn ProgressReporter>,
    retry: RetryConfig,
}

/// Builder for [`BatchOrchestrator`].
pub struct BatchOrchestratorBuilder {
    evaluator: Arc<CaseEvaluator>,
    store: Arc<dyn OutcomeStore>,
    reporter: Option<Arc<dyn ProgressReporter>>,
    retry: Option<RetryConfig>,
}

impl BatchOrchestratorBuilder {
    pub fn reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Override the evaluator config's retry policy.
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn build(self) -> BatchOrchestrator {
        let retry = self
            .retry
            .unwrap_or_else(|| self.evaluator.config().retry.clone());

        BatchOrchestrator {
            evaluator: self.evaluator,
            store: self.store,
            reporter: self.reporter.unwrap_or_else(|| Arc::new(TracingReporter)),
            retry,
        }
    }
}

impl BatchOrchestrator {
    pub fn builder(
        evaluator: Arc<CaseEvaluator>,
        store: Arc<dyn OutcomeStore>,
    ) -> BatchOrchestratorBuilder {
        BatchOrchestratorBuilder {
            evaluator,
            store,
            reporter: None,
            retry: None,
        }
    }

    pub fn evaluator(&self) -> &CaseEvaluator {
        &self.evaluator
    }

    pub fn store(&self) -> &Arc<dyn OutcomeStore> {
        &self.store
    }

    /// Run every case of an existing job.
    ///
    /// On a job-level error the job is marked `failed` with the error
    /// message before the error is returned.
    pub async fn run_job(
        &self,
        job_id: &str,
        cases: &[CaseInput],
        rubric_source: &Path,
    ) -> Result<BatchSummary, OrchestratorError> {
        let span = tracing::info_span!("batch_job", job_id, cases = cases.len());

        async move {
            match self.run_cases(job_id, cases, rubric_source).await {
                Ok(summary) => Ok(summary),
                Err(err) => {
                    tracing::error!(error = %err, "Batch job failed");
                    self.mark_failed(job_id, &err).await;
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run_cases(
        &self,
        job_id: &str,
        cases: &[CaseInput],
        rubric_source: &Path,
    ) -> Result<BatchSummary, OrchestratorError> {
        let mut summary = BatchSummary::new(job_id);

        let start = JobTransition::to(JobStatus::Running)
            .total_cases(cases.len())
            .started_at(Utc::now());
        let started = self
            .store
            .transition_job(job_id, &[JobStatus::Pending, JobStatus::Running], &start)
            .await?;
        if !started {
            let status = self.store.job_status(job_id).await?;
            if status == JobStatus::Cancelled {
                tracing::info!("Job cancelled before start");
                summary.status = JobStatus::Cancelled;
                summary.skipped = cases.len();
                return Ok(summary);
            }
            return Err(OrchestratorError::Aborted(format!(
                "job is already {}",
                status
            )));
        }

        let rubric = self.evaluator.rubrics().load(rubric_source).await?;
        tracing::info!(
            rubric = %rubric_source.display(),
            criteria = rubric.schema.len(),
            max_possible_score = rubric.schema.max_possible_score(),
            "Starting batch"
        );

        let mut score_total = 0.0;
        let total = cases.len();

        for (index, case) in cases.iter().enumerate() {
            if self.store.job_status(job_id).await? == JobStatus::Cancelled {
                tracing::info!(
                    processed = index,
                    remaining = total - index,
                    "Job cancelled, stopping"
                );
                summary.skipped = total - index;
                break;
            }

            let outcome = self.evaluate_with_retry(case, &rubric).await;
            if outcome.success {
                summary.successful += 1;
                score_total += outcome.overall_score;
            } else {
                summary.failed += 1;
            }

            match self.store.upsert_outcome(job_id, &outcome).await {
                Ok(UpsertResult::Inserted) => {}
                Ok(UpsertResult::AlreadyExists) => {
                    tracing::debug!(case_id = %case.case_id, "Outcome already stored, skipping");
                    summary.duplicates += 1;
                }
                Err(err) => {
                    tracing::warn!(case_id = %case.case_id, error = %err, "Failed to store outcome");
                }
            }

            self.reporter
                .report(job_id, &JobProgress::new(index + 1, total));
        }

        if summary.successful > 0 {
            summary.average_score = score_total / summary.successful as f64;
        }

        let ended = Utc::now();
        let finish = JobTransition::to(JobStatus::Completed)
            .processed_cases(summary.successful)
            .ended_at(ended);
        let status = if self
            .store
            .transition_job(job_id, &[JobStatus::Running], &finish)
            .await?
        {
            JobStatus::Completed
        } else {
            // Cancelled after the last status check: keep it, record the counts.
            let stamp = JobTransition::to(JobStatus::Cancelled)
                .processed_cases(summary.successful)
                .ended_at(ended);
            if !self
                .store
                .transition_job(job_id, &[JobStatus::Cancelled], &stamp)
                .await?
            {
                let status = self.store.job_status(job_id).await?;
                return Err(OrchestratorError::Aborted(format!(
                    "job became {} while running",
                    status
                )));
            }
            JobStatus::Cancelled
        };

        summary.status = status;
        tracing::info!(
            status = %status,
            successful = summary.successful,
            failed = summary.failed,
            skipped = summary.skipped,
            average_score = summary.average_score,
            "Batch finished"
        );

        Ok(summary)
    }

    /// Evaluate one case, retrying failures.
    ///
    /// Always returns an outcome; after the last attempt it is a zero-score
    /// failure naming the error type.
    async fn evaluate_with_retry(
        &self,
        case: &CaseInput,
        rubric: &RubricDocument,
    ) -> EvaluationOutcome {
        let attempts = AtomicU32::new(0);
        let evaluator = &self.evaluator;
        let counter = &attempts;

        let policy = ConstantBuilder::default()
            .with_delay(self.retry.delay)
            .with_max_times(self.retry.max_attempts.saturating_sub(1) as usize);

        let result = (move || async move {
            let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
            let mut outcome = evaluator.evaluate_with_rubric(case, rubric).await;
            outcome.attempts = attempt;
            if outcome.success {
                Ok(outcome)
            } else {
                Err(outcome)
            }
        })
        .retry(policy)
        .sleep(tokio::time::sleep)
        .notify(|failed: &EvaluationOutcome, delay| {
            tracing::warn!(
                case_id = %case.case_id,
                attempt = failed.attempts,
                error_type = failed.error_type_str().unwrap_or("unknown"),
                delay = ?delay,
                "Case evaluation failed, retrying"
            );
        })
        .await;

        match result {
            Ok(outcome) => outcome,
            Err(last) => exhausted(last),
        }
    }

    async fn mark_failed(&self, job_id: &str, err: &OrchestratorError) {
        let change = JobTransition::to(JobStatus::Failed)
            .ended_at(Utc::now())
            .error_message(err.to_string());

        // A finished job is never reopened as failed.
        match self
            .store
            .transition_job(job_id, &[JobStatus::Pending, JobStatus::Running], &change)
            .await
        {
            Ok(true) => {}
            Ok(false) => tracing::debug!("Job already finished, leaving status as is"),
            Err(store_err) => tracing::warn!(error = %store_err, "Cannot mark job failed"),
        }
    }
}

impl std::fmt::Debug for BatchOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchOrchestrator")
            .field("evaluator", &self.evaluator)
            .field("retry", &self.retry)
            .finish()
    }
}

/// Turn the last failed attempt into the stored failure record.
fn exhausted(mut last: EvaluationOutcome) -> EvaluationOutcome {
    let error_type = last.error_type_str().unwrap_or("unknown");
    tracing::error!(
        case_id = %last.case_id,
        attempts = last.attempts,
        error_type,
        "Case failed after all attempts"
    );

    last.feedback = format!("Evaluation failed: {} - {}", error_type, last.feedback);
    last.success = false;
    last.overall_score = 0.0;
    last.criterion_scores.clear();
    last.criterion_entries.clear();
    last.flagged_for_review = false;
    last
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::providers::{
        ChatMessage, CompletionConfig, CompletionResponse, LlmProvider, ProviderError,
    };
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use casegrade_core::{ErrorKind, EvaluationJob};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::io::Write;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    const SAMPLE: &str = include_str!("../../casegrade-core/fixtures/sample_rubric.txt");
    const FULL_MARKS: &str = r#"{"criteria": [
        {"id": 1, "score": 10}, {"id": 2, "score": 5},
        {"id": 3, "score": 8}, {"id": 4, "score": 7}
    ]}"#;

    /// Pops scripted replies; repeats the last one when the script runs out.
    struct ScriptedProvider {
        replies: Mutex<VecDeque<String>>,
        fallback: String,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(replies: &[&str], fallback: &str) -> Self {
            Self {
                replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
                fallback: fallback.to_string(),
                calls: AtomicUsize::new(0),
            }
        }

        fn always(reply: &str) -> Self {
            Self::new(&[], reply)
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn complete(
            &self,
            _messages: Vec<ChatMessage>,
            _config: &CompletionConfig,
        ) -> Result<CompletionResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let reply = self
                .replies
                .lock()
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone());
            Ok(CompletionResponse::text(reply))
        }

        async fn health_check(&self) -> bool {
            true
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    /// Marks the job cancelled while serving the n-th call.
    struct CancellingProvider {
        store: Arc<MemoryStore>,
        job_id: String,
        cancel_on_call: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmProvider for CancellingProvider {
        async fn complete(
            &self,
            _messages: Vec<ChatMessage>,
            _config: &CompletionConfig,
        ) -> Result<CompletionResponse, ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call == self.cancel_on_call {
                self.store.mark_cancelled(&self.job_id).await.unwrap();
            }
            Ok(CompletionResponse::text(FULL_MARKS))
        }

        async fn health_check(&self) -> bool {
            true
        }

        fn name(&self) -> &str {
            "cancelling"
        }
    }

    /// Rejects writes for one case id, delegates everything else.
    struct FlakyStore {
        inner: MemoryStore,
        reject_case: String,
    }

    #[async_trait]
    impl OutcomeStore for FlakyStore {
        async fn create_job(&self, job: &EvaluationJob) -> Result<(), StoreError> {
            self.inner.create_job(job).await
        }

        async fn job(&self, job_id: &str) -> Result<EvaluationJob, StoreError> {
            self.inner.job(job_id).await
        }

        async fn transition_job(
            &self,
            job_id: &str,
            from: &[JobStatus],
            change: &JobTransition,
        ) -> Result<bool, StoreError> {
            self.inner.transition_job(job_id, from, change).await
        }

        async fn upsert_outcome(
            &self,
            job_id: &str,
            outcome: &EvaluationOutcome,
        ) -> Result<UpsertResult, StoreError> {
            if outcome.case_id == self.reject_case {
                return Err(StoreError::Backend("disk full".to_string()));
            }
            self.inner.upsert_outcome(job_id, outcome).await
        }

        async fn outcomes(&self, job_id: &str) -> Result<Vec<EvaluationOutcome>, StoreError> {
            self.inner.outcomes(job_id).await
        }
    }

    /// Lands a cancellation just before the job is moved to `running`.
    struct CancelOnStartStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl OutcomeStore for CancelOnStartStore {
        async fn create_job(&self, job: &EvaluationJob) -> Result<(), StoreError> {
            self.inner.create_job(job).await
        }

        async fn job(&self, job_id: &str) -> Result<EvaluationJob, StoreError> {
            self.inner.job(job_id).await
        }

        async fn transition_job(
            &self,
            job_id: &str,
            from: &[JobStatus],
            change: &JobTransition,
        ) -> Result<bool, StoreError> {
            if change.status == JobStatus::Running {
                self.inner.mark_cancelled(job_id).await?;
            }
            self.inner.transition_job(job_id, from, change).await
        }

        async fn upsert_outcome(
            &self,
            job_id: &str,
            outcome: &EvaluationOutcome,
        ) -> Result<UpsertResult, StoreError> {
            self.inner.upsert_outcome(job_id, outcome).await
        }

        async fn outcomes(&self, job_id: &str) -> Result<Vec<EvaluationOutcome>, StoreError> {
            self.inner.outcomes(job_id).await
        }
    }

    #[derive(Default)]
    struct CollectingReporter {
        seen: Mutex<Vec<JobProgress>>,
    }

    impl ProgressReporter for CollectingReporter {
        fn report(&self, _job_id: &str, progress: &JobProgress) {
            self.seen.lock().push(*progress);
        }
    }

    fn rubric_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        file
    }

    fn cases(n: usize) -> Vec<CaseInput> {
        (1..=n)
            .map(|i| CaseInput::new(format!("case-{}", i), "summary", "recommendation"))
            .collect()
    }

    async fn setup(
        provider: Arc<dyn LlmProvider>,
        store: Arc<dyn OutcomeStore>,
        total: usize,
    ) -> BatchOrchestrator {
        store
            .create_job(&EvaluationJob::new("job-1", "sample_rubric.txt", "gpt-4o", total))
            .await
            .unwrap();
        let evaluator = Arc::new(CaseEvaluator::new(provider, RuntimeConfig::default()));
        BatchOrchestrator::builder(evaluator, store).build()
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_batch_completes() {
        let rubric = rubric_file();
        let provider = Arc::new(ScriptedProvider::always(FULL_MARKS));
        let store = Arc::new(MemoryStore::new());
        let reporter = Arc::new(CollectingReporter::default());

        store
            .create_job(&EvaluationJob::new("job-1", "sample_rubric.txt", "gpt-4o", 3))
            .await
            .unwrap();
        let evaluator = Arc::new(CaseEvaluator::new(provider.clone(), RuntimeConfig::default()));
        let orchestrator = BatchOrchestrator::builder(evaluator, store.clone())
            .reporter(reporter.clone())
            .build();

        let summary = orchestrator
            .run_job("job-1", &cases(3), rubric.path())
            .await
            .unwrap();

        assert_eq!(summary.status, JobStatus::Completed);
        assert_eq!(summary.successful, 3);
        assert_eq!(summary.failed, 0);
        assert!((summary.average_score - 100.0).abs() < 1e-9);
        assert_eq!(provider.calls(), 3);

        let job = store.job("job-1").await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.processed_cases, 3);
        assert!(job.start_time.is_some());
        assert!(job.end_time.is_some());

        let progress = reporter.seen.lock();
        assert_eq!(progress.len(), 3);
        assert_eq!(progress[2].current, 3);
        assert!((progress[2].percentage - 100.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_case_attempted_twice_then_stored_once() {
        let rubric = rubric_file();
        let provider = Arc::new(ScriptedProvider::always(""));
        let store = Arc::new(MemoryStore::new());
        let orchestrator = setup(provider.clone(), store.clone(), 1).await;

        let started = tokio::time::Instant::now();
        let summary = orchestrator
            .run_job("job-1", &cases(1), rubric.path())
            .await
            .unwrap();

        assert_eq!(provider.calls(), 2);
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(summary.failed, 1);

        let outcomes = store.outcomes("job-1").await.unwrap();
        assert_eq!(outcomes.len(), 1);
        let failure = &outcomes[0];
        assert!(!failure.success);
        assert_eq!(failure.overall_score, 0.0);
        assert!(failure.criterion_scores.is_empty());
        assert_eq!(failure.error_type, Some(ErrorKind::EmptyResponse));
        assert_eq!(failure.attempts, 2);
        assert!(failure.feedback.starts_with("Evaluation failed: empty_response - "));

        // A failed case does not fail the job
        assert_eq!(
            store.job_status("job-1").await.unwrap(),
            JobStatus::Completed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_attempt_can_succeed() {
        let rubric = rubric_file();
        let provider = Arc::new(ScriptedProvider::new(&["not json"], FULL_MARKS));
        let store = Arc::new(MemoryStore::new());
        let orchestrator = setup(provider.clone(), store.clone(), 1).await;

        let summary = orchestrator
            .run_job("job-1", &cases(1), rubric.path())
            .await
            .unwrap();

        assert_eq!(provider.calls(), 2);
        assert_eq!(summary.successful, 1);
        let outcomes = store.outcomes("job-1").await.unwrap();
        assert!(outcomes[0].success);
        assert_eq!(outcomes[0].attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_at_case_boundary() {
        let rubric = rubric_file();
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(CancellingProvider {
            store: store.clone(),
            job_id: "job-1".to_string(),
            cancel_on_call: 3,
            calls: AtomicUsize::new(0),
        });
        let orchestrator = setup(provider.clone(), store.clone(), 10).await;

        let summary = orchestrator
            .run_job("job-1", &cases(10), rubric.path())
            .await
            .unwrap();

        // The in-flight third case finishes; cases 4-10 never run
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        assert_eq!(summary.status, JobStatus::Cancelled);
        assert_eq!(summary.successful, 3);
        assert_eq!(summary.skipped, 7);

        let job = store.job("job-1").await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.end_time.is_some());

        let stored: Vec<String> = store
            .outcomes("job-1")
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.case_id)
            .collect();
        assert_eq!(stored, vec!["case-1", "case-2", "case-3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_start_runs_nothing() {
        let rubric = rubric_file();
        let provider = Arc::new(ScriptedProvider::always(FULL_MARKS));
        let store = Arc::new(MemoryStore::new());
        let orchestrator = setup(provider.clone(), store.clone(), 2).await;
        store.mark_cancelled("job-1").await.unwrap();

        let summary = orchestrator
            .run_job("job-1", &cases(2), rubric.path())
            .await
            .unwrap();

        assert_eq!(provider.calls(), 0);
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.status, JobStatus::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_racing_start_is_kept() {
        let rubric = rubric_file();
        let provider = Arc::new(ScriptedProvider::always(FULL_MARKS));
        let store = Arc::new(CancelOnStartStore {
            inner: MemoryStore::new(),
        });
        let orchestrator = setup(provider.clone(), store.clone(), 3).await;

        let summary = orchestrator
            .run_job("job-1", &cases(3), rubric.path())
            .await
            .unwrap();

        assert_eq!(provider.calls(), 0);
        assert_eq!(summary.status, JobStatus::Cancelled);
        assert_eq!(summary.skipped, 3);
        assert_eq!(
            store.job_status("job-1").await.unwrap(),
            JobStatus::Cancelled
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_last_case_is_kept() {
        let rubric = rubric_file();
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(CancellingProvider {
            store: store.clone(),
            job_id: "job-1".to_string(),
            cancel_on_call: 2,
            calls: AtomicUsize::new(0),
        });
        let orchestrator = setup(provider, store.clone(), 2).await;

        let summary = orchestrator
            .run_job("job-1", &cases(2), rubric.path())
            .await
            .unwrap();

        assert_eq!(summary.status, JobStatus::Cancelled);
        assert_eq!(summary.skipped, 0);
        let job = store.job("job-1").await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.processed_cases, 2);
        assert!(job.end_time.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_job_is_not_rerun() {
        let rubric = rubric_file();
        let provider = Arc::new(ScriptedProvider::always(FULL_MARKS));
        let store = Arc::new(MemoryStore::new());
        let mut done = EvaluationJob::new("job-1", "sample_rubric.txt", "gpt-4o", 1);
        done.status = JobStatus::Completed;
        store.create_job(&done).await.unwrap();
        let evaluator = Arc::new(CaseEvaluator::new(provider.clone(), RuntimeConfig::default()));
        let orchestrator = BatchOrchestrator::builder(evaluator, store.clone()).build();

        let err = orchestrator
            .run_job("job-1", &cases(1), rubric.path())
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::Aborted(_)));
        assert_eq!(provider.calls(), 0);
        let job = store.job("job-1").await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.error_message.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_existing_outcome_not_duplicated() {
        let rubric = rubric_file();
        let provider = Arc::new(ScriptedProvider::always(FULL_MARKS));
        let store = Arc::new(MemoryStore::new());
        let orchestrator = setup(provider, store.clone(), 2).await;

        let earlier = EvaluationOutcome::failure("case-1", ErrorKind::ProviderFailure, "earlier");
        store.upsert_outcome("job-1", &earlier).await.unwrap();

        let summary = orchestrator
            .run_job("job-1", &cases(2), rubric.path())
            .await
            .unwrap();

        assert_eq!(summary.duplicates, 1);
        let outcomes = store.outcomes("job-1").await.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].feedback, "earlier");
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_rubric_fails_job() {
        let provider = Arc::new(ScriptedProvider::always(FULL_MARKS));
        let store = Arc::new(MemoryStore::new());
        let orchestrator = setup(provider.clone(), store.clone(), 2).await;

        let err = orchestrator
            .run_job("job-1", &cases(2), Path::new("/nonexistent/rubric.txt"))
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::Rubric(RubricError::NotFound(_))));
        assert_eq!(provider.calls(), 0);

        let job = store.job("job-1").await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_message.unwrap().contains("not found"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_failure_does_not_abort_batch() {
        let rubric = rubric_file();
        let provider = Arc::new(ScriptedProvider::always(FULL_MARKS));
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            reject_case: "case-2".to_string(),
        });
        let orchestrator = setup(provider.clone(), store.clone(), 3).await;

        let summary = orchestrator
            .run_job("job-1", &cases(3), rubric.path())
            .await
            .unwrap();

        assert_eq!(provider.calls(), 3);
        assert_eq!(summary.status, JobStatus::Completed);
        let stored: Vec<String> = store
            .outcomes("job-1")
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.case_id)
            .collect();
        assert_eq!(stored, vec!["case-1", "case-3"]);
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let rubric = rubric_file();
        let provider = Arc::new(ScriptedProvider::always(FULL_MARKS));
        let evaluator = Arc::new(CaseEvaluator::new(provider, RuntimeConfig::default()));
        let orchestrator =
            BatchOrchestrator::builder(evaluator, Arc::new(MemoryStore::new())).build();

        let err = orchestrator
            .run_job("missing", &cases(1), rubric.path())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::JobNotFound(_)));
    }

    #[test]
    fn test_progress_percentage() {
        assert_eq!(JobProgress::new(3, 10).percentage, 30.0);
        assert_eq!(JobProgress::new(0, 0).percentage, 100.0);
    }

    proptest::proptest! {
        #[test]
        fn prop_progress_within_bounds(total in 1usize..10_000, done in 0usize..10_000) {
            let current = done.min(total);
            let progress = JobProgress::new(current, total);
            proptest::prop_assert!((0.0..=100.0).contains(&progress.percentage));
            proptest::prop_assert_eq!(progress.percentage == 100.0, current == total);
        }
    }
}
