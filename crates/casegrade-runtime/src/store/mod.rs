//! Persistence of jobs and outcomes.
//!
//! The orchestrator only needs a keyed record store: one row per job, and
//! at most one outcome per `(job_id, case_id)`. [`OutcomeStore::upsert_outcome`]
//! is the single place that guarantees the latter.

use async_trait::async_trait;
use casegrade_core::{EvaluationJob, EvaluationOutcome, JobStatus};
use chrono::{DateTime, Utc};
use thiserror::Error;

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

/// Errors from a store backend.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job already exists: {0}")]
    DuplicateJob(String),

    #[error("Failed to serialize record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store backend error: {0}")]
    Backend(String),
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// What [`OutcomeStore::upsert_outcome`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertResult {
    Inserted,
    /// An outcome for this `(job_id, case_id)` was already stored; nothing written
    AlreadyExists,
}

/// A status change plus the job fields written with it.
///
/// Fields left as `None` keep their stored value.
#[derive(Debug, Clone, PartialEq)]
pub struct JobTransition {
    pub status: JobStatus,
    pub total_cases: Option<usize>,
    pub processed_cases: Option<usize>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl JobTransition {
    pub fn to(status: JobStatus) -> Self {
        Self {
            status,
            total_cases: None,
            processed_cases: None,
            start_time: None,
            end_time: None,
            error_message: None,
        }
    }

    pub fn total_cases(mut self, total: usize) -> Self {
        self.total_cases = Some(total);
        self
    }

    pub fn processed_cases(mut self, processed: usize) -> Self {
        self.processed_cases = Some(processed);
        self
    }

    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.start_time = Some(at);
        self
    }

    pub fn ended_at(mut self, at: DateTime<Utc>) -> Self {
        self.end_time = Some(at);
        self
    }

    pub fn error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    /// Write the transition onto an in-memory job row.
    pub fn apply(&self, job: &mut EvaluationJob) {
        job.status = self.status;
        if let Some(total) = self.total_cases {
            job.total_cases = total;
        }
        if let Some(processed) = self.processed_cases {
            job.processed_cases = processed;
        }
        if let Some(start) = self.start_time {
            job.start_time = Some(start);
        }
        if let Some(end) = self.end_time {
            job.end_time = Some(end);
        }
        if let Some(message) = &self.error_message {
            job.error_message = Some(message.clone());
        }
    }
}

/// Keyed record store for jobs and their outcomes.
#[async_trait]
pub trait OutcomeStore: Send + Sync {
    async fn create_job(&self, job: &EvaluationJob) -> Result<(), StoreError>;

    async fn job(&self, job_id: &str) -> Result<EvaluationJob, StoreError>;

    /// Apply `change` only if the job's current status is one of `from`.
    ///
    /// The check and the write are atomic. Returns `false`, writing nothing,
    /// when the status did not match.
    async fn transition_job(
        &self,
        job_id: &str,
        from: &[JobStatus],
        change: &JobTransition,
    ) -> Result<bool, StoreError>;

    /// Insert unless an outcome for `(job_id, outcome.case_id)` exists.
    async fn upsert_outcome(
        &self,
        job_id: &str,
        outcome: &EvaluationOutcome,
    ) -> Result<UpsertResult, StoreError>;

    /// Outcomes for a job in insertion order.
    async fn outcomes(&self, job_id: &str) -> Result<Vec<EvaluationOutcome>, StoreError>;

    async fn job_status(&self, job_id: &str) -> Result<JobStatus, StoreError> {
        Ok(self.job(job_id).await?.status)
    }

    /// Request cooperative cancellation.
    ///
    /// Returns `false` when the job was already terminal and is left as is.
    async fn mark_cancelled(&self, job_id: &str) -> Result<bool, StoreError> {
        self.transition_job(
            job_id,
            &[JobStatus::Pending, JobStatus::Running],
            &JobTransition::to(JobStatus::Cancelled),
        )
        .await
    }

    /// Percentage of a job's cases with a stored outcome.
    async fn progress(&self, job_id: &str) -> Result<f64, StoreError> {
        let job = self.job(job_id).await?;
        if job.total_cases == 0 {
            return Ok(0.0);
        }
        let stored = self.outcomes(job_id).await?.len();
        Ok(stored as f64 / job.total_cases as f64 * 100.0)
    }
}
