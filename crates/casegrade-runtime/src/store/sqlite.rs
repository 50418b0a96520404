//! SQLite-backed store.
//!
//! Criterion scores are stored as a JSON object keyed by criterion id. Rows
//! written by older versions hold bare numbers instead of `{score, id}`
//! objects; both load through [`ScoreEntry`].

use super::{JobTransition, OutcomeStore, StoreError, UpsertResult};
use async_trait::async_trait;
use casegrade_core::{
    criterion_score, CriterionScoreEntry, ErrorKind, EvaluationJob, EvaluationOutcome, JobStatus,
    ReviewPriority, ScoreEntry, TokenUsage, ValidationAudit,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    rubric_source TEXT NOT NULL,
    model TEXT NOT NULL,
    status TEXT NOT NULL,
    total_cases INTEGER NOT NULL,
    processed_cases INTEGER NOT NULL DEFAULT 0,
    start_time TEXT,
    end_time TEXT,
    error_message TEXT
);

CREATE TABLE IF NOT EXISTS outcomes (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    case_id TEXT NOT NULL,
    success INTEGER NOT NULL,
    overall_score REAL NOT NULL,
    complexity_level TEXT NOT NULL,
    criterion_scores TEXT NOT NULL,
    feedback TEXT NOT NULL,
    model_used TEXT NOT NULL,
    prompt_tokens INTEGER NOT NULL DEFAULT 0,
    completion_tokens INTEGER NOT NULL DEFAULT 0,
    total_tokens INTEGER NOT NULL DEFAULT 0,
    trace_id TEXT,
    processing_time REAL NOT NULL DEFAULT 0,
    error_type TEXT,
    metadata TEXT,
    created_at TEXT NOT NULL,
    UNIQUE (job_id, case_id)
);
CREATE INDEX IF NOT EXISTS idx_outcomes_job ON outcomes(job_id);
"#;

/// Outcome fields without a dedicated column.
#[derive(Debug, Default, Serialize, Deserialize)]
struct OutcomeMetadata {
    #[serde(default)]
    criterion_entries: Vec<CriterionScoreEntry>,
    #[serde(default)]
    audit: Option<ValidationAudit>,
    #[serde(default)]
    recommendations: Vec<String>,
    #[serde(default)]
    flagged_for_review: bool,
    #[serde(default)]
    review_priority: ReviewPriority,
    #[serde(default)]
    content_moderation: bool,
    #[serde(default)]
    attempts: u32,
}

/// Store backed by a single SQLite connection.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|e| {
            StoreError::Backend(format!(
                "failed to open database at {}: {}",
                path.display(),
                e
            ))
        })?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<EvaluationJob> {
    let status: String = row.get(3)?;
    let total: i64 = row.get(4)?;
    let processed: i64 = row.get(5)?;
    let start: Option<String> = row.get(6)?;
    let end: Option<String> = row.get(7)?;

    Ok(EvaluationJob {
        id: row.get(0)?,
        rubric_source: row.get(1)?,
        model: row.get(2)?,
        status: JobStatus::parse(&status).unwrap_or(JobStatus::Failed),
        total_cases: total.max(0) as usize,
        processed_cases: processed.max(0) as usize,
        start_time: start.as_deref().and_then(parse_time),
        end_time: end.as_deref().and_then(parse_time),
        error_message: row.get(8)?,
    })
}

fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Read criterion scores in either stored shape.
fn decode_scores(raw: &str) -> Result<BTreeMap<u32, f64>, StoreError> {
    let stored: BTreeMap<String, ScoreEntry> = serde_json::from_str(raw)?;
    Ok(stored
        .into_iter()
        .filter_map(|(key, entry)| {
            let id = key.parse::<u32>().ok().or_else(|| entry.id())?;
            Some((id, criterion_score(&entry)))
        })
        .collect())
}

fn encode_scores(scores: &BTreeMap<u32, f64>) -> Result<String, StoreError> {
    let stored: BTreeMap<String, ScoreEntry> = scores
        .iter()
        .map(|(&id, &score)| (id.to_string(), ScoreEntry::Scored { score, id }))
        .collect();
    Ok(serde_json::to_string(&stored)?)
}

struct OutcomeRow {
    case_id: String,
    success: bool,
    overall_score: f64,
    complexity_level: String,
    criterion_scores: String,
    feedback: String,
    model_used: String,
    tokens: (i64, i64, i64),
    trace_id: Option<String>,
    processing_time: f64,
    error_type: Option<String>,
    metadata: Option<String>,
}

impl OutcomeRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            case_id: row.get(0)?,
            success: row.get(1)?,
            overall_score: row.get(2)?,
            complexity_level: row.get(3)?,
            criterion_scores: row.get(4)?,
            feedback: row.get(5)?,
            model_used: row.get(6)?,
            tokens: (row.get(7)?, row.get(8)?, row.get(9)?),
            trace_id: row.get(10)?,
            processing_time: row.get(11)?,
            error_type: row.get(12)?,
            metadata: row.get(13)?,
        })
    }

    fn into_outcome(self) -> Result<EvaluationOutcome, StoreError> {
        let metadata: OutcomeMetadata = match self.metadata.as_deref() {
            Some(raw) if !raw.is_empty() => serde_json::from_str(raw)?,
            _ => OutcomeMetadata::default(),
        };
        let (prompt, completion, total) = self.tokens;

        Ok(EvaluationOutcome {
            case_id: self.case_id,
            success: self.success,
            overall_score: self.overall_score,
            complexity_level: self.complexity_level,
            criterion_scores: decode_scores(&self.criterion_scores)?,
            criterion_entries: metadata.criterion_entries,
            feedback: self.feedback,
            model_used: self.model_used,
            token_usage: TokenUsage {
                prompt_tokens: prompt.max(0) as u32,
                completion_tokens: completion.max(0) as u32,
                total_tokens: total.max(0) as u32,
            },
            trace_id: self.trace_id,
            processing_time: self.processing_time,
            error_type: self.error_type.as_deref().and_then(ErrorKind::parse),
            audit: metadata.audit,
            recommendations: metadata.recommendations,
            flagged_for_review: metadata.flagged_for_review,
            review_priority: metadata.review_priority,
            content_moderation: metadata.content_moderation,
            attempts: metadata.attempts,
        })
    }
}

#[async_trait]
impl OutcomeStore for SqliteStore {
    async fn create_job(&self, job: &EvaluationJob) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO jobs (id, rubric_source, model, status, total_cases, processed_cases, start_time, end_time, error_message) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                job.id,
                job.rubric_source,
                job.model,
                job.status.as_str(),
                job.total_cases as i64,
                job.processed_cases as i64,
                job.start_time.map(|t| t.to_rfc3339()),
                job.end_time.map(|t| t.to_rfc3339()),
                job.error_message,
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::DuplicateJob(job.id.clone()));
        }
        Ok(())
    }

    async fn job(&self, job_id: &str) -> Result<EvaluationJob, StoreError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, rubric_source, model, status, total_cases, processed_cases, start_time, end_time, error_message \
             FROM jobs WHERE id = ?1",
            params![job_id],
            job_from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))
    }

    async fn transition_job(
        &self,
        job_id: &str,
        from: &[JobStatus],
        change: &JobTransition,
    ) -> Result<bool, StoreError> {
        let from: Vec<&str> = from.iter().map(|status| status.as_str()).collect();
        let from = serde_json::to_string(&from)?;

        let conn = self.conn.lock();
        // Status check and write in one statement.
        let updated = conn.execute(
            "UPDATE jobs SET status = ?2, \
             total_cases = COALESCE(?3, total_cases), \
             processed_cases = COALESCE(?4, processed_cases), \
             start_time = COALESCE(?5, start_time), \
             end_time = COALESCE(?6, end_time), \
             error_message = COALESCE(?7, error_message) \
             WHERE id = ?1 AND status IN (SELECT value FROM json_each(?8))",
            params![
                job_id,
                change.status.as_str(),
                change.total_cases.map(|n| n as i64),
                change.processed_cases.map(|n| n as i64),
                change.start_time.map(|t| t.to_rfc3339()),
                change.end_time.map(|t| t.to_rfc3339()),
                change.error_message,
                from,
            ],
        )?;
        if updated == 1 {
            return Ok(true);
        }

        let exists = conn
            .query_row("SELECT 1 FROM jobs WHERE id = ?1", params![job_id], |_| Ok(()))
            .optional()?
            .is_some();
        if exists {
            Ok(false)
        } else {
            Err(StoreError::JobNotFound(job_id.to_string()))
        }
    }

    async fn upsert_outcome(
        &self,
        job_id: &str,
        outcome: &EvaluationOutcome,
    ) -> Result<UpsertResult, StoreError> {
        let metadata = serde_json::to_string(&OutcomeMetadata {
            criterion_entries: outcome.criterion_entries.clone(),
            audit: outcome.audit.clone(),
            recommendations: outcome.recommendations.clone(),
            flagged_for_review: outcome.flagged_for_review,
            review_priority: outcome.review_priority,
            content_moderation: outcome.content_moderation,
            attempts: outcome.attempts,
        })?;
        let scores = encode_scores(&outcome.criterion_scores)?;

        let conn = self.conn.lock();
        let job_exists: bool = conn
            .query_row("SELECT 1 FROM jobs WHERE id = ?1", params![job_id], |_| Ok(()))
            .optional()?
            .is_some();
        if !job_exists {
            return Err(StoreError::JobNotFound(job_id.to_string()));
        }

        // UNIQUE(job_id, case_id) makes the existence check and insert one statement.
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO outcomes (job_id, case_id, success, overall_score, complexity_level, \
             criterion_scores, feedback, model_used, prompt_tokens, completion_tokens, total_tokens, \
             trace_id, processing_time, error_type, metadata, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                job_id,
                outcome.case_id,
                outcome.success,
                outcome.overall_score,
                outcome.complexity_level,
                scores,
                outcome.feedback,
                outcome.model_used,
                outcome.token_usage.prompt_tokens,
                outcome.token_usage.completion_tokens,
                outcome.token_usage.total_tokens,
                outcome.trace_id,
                outcome.processing_time,
                outcome.error_type_str(),
                metadata,
                Utc::now().to_rfc3339(),
            ],
        )?;

        Ok(if inserted == 1 {
            UpsertResult::Inserted
        } else {
            UpsertResult::AlreadyExists
        })
    }

    async fn outcomes(&self, job_id: &str) -> Result<Vec<EvaluationOutcome>, StoreError> {
        let rows = {
            let conn = self.conn.lock();
            let job_exists = conn
                .query_row("SELECT 1 FROM jobs WHERE id = ?1", params![job_id], |_| Ok(()))
                .optional()?
                .is_some();
            if !job_exists {
                return Err(StoreError::JobNotFound(job_id.to_string()));
            }

            let mut stmt = conn.prepare(
                "SELECT case_id, success, overall_score, complexity_level, criterion_scores, feedback, \
                 model_used, prompt_tokens, completion_tokens, total_tokens, trace_id, processing_time, \
                 error_type, metadata FROM outcomes WHERE job_id = ?1 ORDER BY seq",
            )?;
            let rows = stmt
                .query_map(params![job_id], OutcomeRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        rows.into_iter().map(OutcomeRow::into_outcome).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: &str) -> EvaluationJob {
        EvaluationJob::new(id, "rubric.txt", "gpt-4o", 3)
    }

    fn scored_outcome(case_id: &str) -> EvaluationOutcome {
        let mut outcome = EvaluationOutcome::failure(case_id, ErrorKind::EmptyResponse, "{}");
        outcome.success = true;
        outcome.error_type = None;
        outcome.overall_score = 80.0;
        outcome.criterion_scores = BTreeMap::from([(1, 8.0), (2, 4.0)]);
        outcome.token_usage = TokenUsage::new(1000, 200);
        outcome.recommendations = vec!["Check potassium".to_string()];
        outcome.attempts = 1;
        outcome
    }

    #[tokio::test]
    async fn test_round_trip_job_and_outcome() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut stored_job = job("j1");
        stored_job.start_time = Some(Utc::now());
        store.create_job(&stored_job).await.unwrap();

        let outcome = scored_outcome("case-1");
        assert_eq!(
            store.upsert_outcome("j1", &outcome).await.unwrap(),
            UpsertResult::Inserted
        );

        let loaded = store.outcomes("j1").await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].criterion_scores, outcome.criterion_scores);
        assert_eq!(loaded[0].token_usage.total_tokens, 1200);
        assert_eq!(loaded[0].recommendations, outcome.recommendations);
        assert!(loaded[0].error_type.is_none());

        let loaded_job = store.job("j1").await.unwrap();
        assert_eq!(loaded_job.status, JobStatus::Pending);
        assert!(loaded_job.start_time.is_some());
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create_job(&job("j1")).await.unwrap();

        let outcome = scored_outcome("case-1");
        store.upsert_outcome("j1", &outcome).await.unwrap();
        assert_eq!(
            store.upsert_outcome("j1", &outcome).await.unwrap(),
            UpsertResult::AlreadyExists
        );
        assert_eq!(store.outcomes("j1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failure_error_type_persisted() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create_job(&job("j1")).await.unwrap();

        let outcome = EvaluationOutcome::failure("case-9", ErrorKind::TruncatedResponse, "refused");
        store.upsert_outcome("j1", &outcome).await.unwrap();

        let loaded = store.outcomes("j1").await.unwrap();
        assert_eq!(loaded[0].error_type, Some(ErrorKind::TruncatedResponse));
        assert!(loaded[0].criterion_scores.is_empty());
    }

    #[test]
    fn test_legacy_score_shape_loads() {
        let scores = decode_scores(r#"{"1": 7, "2": {"score": 3.5, "id": 2}}"#).unwrap();
        assert_eq!(scores.get(&1), Some(&7.0));
        assert_eq!(scores.get(&2), Some(&3.5));
    }

    #[tokio::test]
    async fn test_status_update_and_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("casegrade.db")).unwrap();
        store.create_job(&job("j1")).await.unwrap();

        let start = JobTransition::to(JobStatus::Running)
            .total_cases(3)
            .started_at(Utc::now());
        assert!(store
            .transition_job("j1", &[JobStatus::Pending], &start)
            .await
            .unwrap());

        assert!(store.mark_cancelled("j1").await.unwrap());
        assert_eq!(store.job_status("j1").await.unwrap(), JobStatus::Cancelled);
        assert!(store.job("j1").await.unwrap().start_time.is_some());
    }

    #[tokio::test]
    async fn test_finish_does_not_replace_cancelled() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create_job(&job("j1")).await.unwrap();
        let start = JobTransition::to(JobStatus::Running);
        store
            .transition_job("j1", &[JobStatus::Pending], &start)
            .await
            .unwrap();
        store.mark_cancelled("j1").await.unwrap();

        let finish = JobTransition::to(JobStatus::Completed)
            .processed_cases(3)
            .ended_at(Utc::now());
        assert!(!store
            .transition_job("j1", &[JobStatus::Running], &finish)
            .await
            .unwrap());

        let stored = store.job("j1").await.unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
        assert_eq!(stored.processed_cases, 0);
        assert!(stored.end_time.is_none());
    }

    #[tokio::test]
    async fn test_cancel_leaves_completed_job_alone() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create_job(&job("j1")).await.unwrap();
        let finish = JobTransition::to(JobStatus::Completed)
            .processed_cases(3)
            .ended_at(Utc::now());
        store
            .transition_job("j1", &[JobStatus::Pending], &finish)
            .await
            .unwrap();

        assert!(!store.mark_cancelled("j1").await.unwrap());
        let stored = store.job("j1").await.unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.processed_cases, 3);
        assert!(stored.end_time.is_some());
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(matches!(
            store.job("nope").await,
            Err(StoreError::JobNotFound(_))
        ));
        assert!(matches!(
            store.mark_cancelled("nope").await,
            Err(StoreError::JobNotFound(_))
        ));
    }
}
