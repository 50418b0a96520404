//! In-process store, for tests and single-run CLI use.

use super::{JobTransition, OutcomeStore, StoreError, UpsertResult};
use async_trait::async_trait;
use casegrade_core::{EvaluationJob, EvaluationOutcome, JobStatus};
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<String, EvaluationJob>,
    outcomes: HashMap<String, Vec<EvaluationOutcome>>,
}

/// Store backed by a mutex-guarded map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OutcomeStore for MemoryStore {
    async fn create_job(&self, job: &EvaluationJob) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if state.jobs.contains_key(&job.id) {
            return Err(StoreError::DuplicateJob(job.id.clone()));
        }
        state.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn job(&self, job_id: &str) -> Result<EvaluationJob, StoreError> {
        self.state
            .lock()
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))
    }

    async fn transition_job(
        &self,
        job_id: &str,
        from: &[JobStatus],
        change: &JobTransition,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))?;
        if !from.contains(&job.status) {
            return Ok(false);
        }
        change.apply(job);
        Ok(true)
    }

    async fn upsert_outcome(
        &self,
        job_id: &str,
        outcome: &EvaluationOutcome,
    ) -> Result<UpsertResult, StoreError> {
        let mut state = self.state.lock();
        if !state.jobs.contains_key(job_id) {
            return Err(StoreError::JobNotFound(job_id.to_string()));
        }

        let rows = state.outcomes.entry(job_id.to_string()).or_default();
        if rows.iter().any(|o| o.case_id == outcome.case_id) {
            return Ok(UpsertResult::AlreadyExists);
        }
        rows.push(outcome.clone());
        Ok(UpsertResult::Inserted)
    }

    async fn outcomes(&self, job_id: &str) -> Result<Vec<EvaluationOutcome>, StoreError> {
        let state = self.state.lock();
        if !state.jobs.contains_key(job_id) {
            return Err(StoreError::JobNotFound(job_id.to_string()));
        }
        Ok(state.outcomes.get(job_id).cloned().unwrap_or_default())
    }
}
