//! Durable job record store.
//!
//! The Job record is the single source of truth for a submission's
//! lifecycle. Two backends implement the same `JobStore` contract:
//!
//! - `MemoryStore`: in-process map, used by tests and the demo
//! - `PgStore`: PostgreSQL via sqlx
//!
//! All lifecycle mutation goes through the `Job::apply_*` helpers so both
//! backends enforce the same state machine: no transition ever leaves a
//! terminal state, progress never decreases while RUNNING, and exactly one
//! of {result, error} is populated once a job is terminal.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::model::Conformation;
use crate::solver::{Algorithm, EnergySample, SolverParams};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Errors from job store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Job {0} not found")]
    NotFound(Uuid),

    #[error("Invalid status transition from '{from}' to '{to}'")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("Store backend unavailable: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Job lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Whether this status admits no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// The lifecycle state machine. `Running -> Queued` is the scheduler's
    /// retry path; everything out of a terminal state is forbidden.
    pub fn can_transition(self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Paused)
                | (Running, Queued)
                | (Paused, Running)
                | (Paused, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "paused" => Some(JobStatus::Paused),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result payload, present only on COMPLETED jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoldResult {
    /// Best conformation found. For Rosetta delegations this is the lattice
    /// interpretation of the submitted directions; the real structure is in
    /// `pdb`.
    pub best: Conformation,
    /// Energy of the best conformation.
    pub energy: f64,
    /// Sampled energy trajectory (empty for Rosetta delegations).
    pub energy_history: Vec<EnergySample>,
    /// Iterations actually executed.
    pub total_iterations: u64,
    /// Solver wall time in milliseconds.
    pub elapsed_ms: u64,
    /// PDB artifact from the external service, when one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pdb: Option<String>,
}

/// The durable record of one submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub owner_id: String,
    pub algorithm: Algorithm,
    pub sequence: String,
    pub params: SolverParams,
    pub status: JobStatus,
    /// Priority tier; higher dequeues first.
    pub priority: i32,
    /// 0-100; reset to 0 entering RUNNING, never decreases while RUNNING.
    pub progress: u8,
    pub result: Option<FoldResult>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Submission-time duration estimate.
    pub estimated_duration_ms: Option<u64>,
    /// Measured duration, set on terminal transition from RUNNING.
    pub actual_duration_ms: Option<u64>,
    /// Executor attempts consumed so far.
    pub attempts: u32,
    /// Backend queue handle (the remote Rosetta job id).
    pub remote_handle: Option<String>,
}

impl Job {
    /// Creates a QUEUED record for a validated submission.
    pub fn new(
        owner_id: impl Into<String>,
        algorithm: Algorithm,
        sequence: impl Into<String>,
        params: SolverParams,
        priority: i32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            algorithm,
            sequence: sequence.into(),
            params,
            status: JobStatus::Queued,
            priority,
            progress: 0,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            estimated_duration_ms: None,
            actual_duration_ms: None,
            attempts: 0,
            remote_handle: None,
        }
    }

    /// Sets the submission-time duration estimate.
    pub fn with_estimated_duration_ms(mut self, estimate: u64) -> Self {
        self.estimated_duration_ms = Some(estimate);
        self
    }

    fn ensure_transition(&self, to: JobStatus) -> Result<(), StoreError> {
        if self.status.can_transition(to) {
            Ok(())
        } else {
            Err(StoreError::InvalidTransition {
                from: self.status,
                to,
            })
        }
    }

    /// QUEUED/PAUSED -> RUNNING. Progress resets to 0 when entering from
    /// QUEUED; a PAUSED resume keeps its progress.
    pub fn apply_running(&mut self, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.ensure_transition(JobStatus::Running)?;
        if self.status == JobStatus::Queued {
            self.progress = 0;
            self.started_at = Some(now);
            self.attempts += 1;
        }
        self.status = JobStatus::Running;
        Ok(())
    }

    /// Progress write; only applies while RUNNING and never decreases.
    /// Returns whether the record changed.
    pub fn apply_progress(&mut self, progress: u8) -> bool {
        if self.status != JobStatus::Running {
            return false;
        }
        let clamped = progress.min(100);
        if clamped > self.progress {
            self.progress = clamped;
            true
        } else {
            false
        }
    }

    /// RUNNING -> COMPLETED with the result payload.
    pub fn apply_completed(
        &mut self,
        result: FoldResult,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.ensure_transition(JobStatus::Completed)?;
        self.status = JobStatus::Completed;
        self.progress = 100;
        self.result = Some(result);
        self.error = None;
        self.completed_at = Some(now);
        self.actual_duration_ms = self
            .started_at
            .map(|s| (now - s).num_milliseconds().max(0) as u64);
        Ok(())
    }

    /// RUNNING -> FAILED with the captured message.
    pub fn apply_failed(
        &mut self,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.ensure_transition(JobStatus::Failed)?;
        self.status = JobStatus::Failed;
        self.error = Some(message.into());
        self.result = None;
        self.completed_at = Some(now);
        self.actual_duration_ms = self
            .started_at
            .map(|s| (now - s).num_milliseconds().max(0) as u64);
        Ok(())
    }

    /// QUEUED/RUNNING/PAUSED -> CANCELLED. Partial results are discarded.
    pub fn apply_cancelled(&mut self, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.ensure_transition(JobStatus::Cancelled)?;
        self.status = JobStatus::Cancelled;
        self.result = None;
        self.completed_at = Some(now);
        self.actual_duration_ms = self
            .started_at
            .map(|s| (now - s).num_milliseconds().max(0) as u64);
        Ok(())
    }

    /// RUNNING -> QUEUED, the retry path after a transient executor failure.
    pub fn apply_retry(&mut self) -> Result<(), StoreError> {
        self.ensure_transition(JobStatus::Queued)?;
        self.status = JobStatus::Queued;
        self.progress = 0;
        self.started_at = None;
        Ok(())
    }

    /// Projected completion time from the submission estimate. `None` when
    /// no estimate exists or it lands outside the representable range.
    pub fn estimated_completion(&self) -> Option<DateTime<Utc>> {
        self.estimated_duration_ms.and_then(|ms| {
            self.created_at
                .checked_add_signed(chrono::Duration::milliseconds(ms.min(i64::MAX as u64) as i64))
        })
    }

    /// Observable projection of this record.
    pub fn view(&self) -> JobView {
        JobView {
            job_id: self.id,
            status: self.status,
            progress: self.progress,
            result: self.result.clone(),
            error: self.error.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            estimated_completion: self.estimated_completion(),
        }
    }
}

/// The observable fields of a Job, as returned to callers and carried in
/// stream events. Subscribers treat it as idempotent state replacement
/// keyed by `job_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<FoldResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub estimated_completion: Option<DateTime<Utc>>,
}

/// Durable store contract. Writes to a given job come from the worker
/// holding its lease or the scheduler's cancel/retry bookkeeping only.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: Job) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Jobs for one owner, most recent first.
    async fn list_by_owner(&self, owner_id: &str, limit: usize) -> Result<Vec<Job>, StoreError>;

    /// All non-terminal jobs, highest priority first. Used at startup to
    /// restore the pending queue from the durable records.
    async fn list_active(&self) -> Result<Vec<Job>, StoreError>;

    async fn mark_running(&self, id: Uuid) -> Result<Job, StoreError>;

    /// Monotone progress write; `Ok(None)` when the job is no longer
    /// RUNNING or the value does not advance (late progress reports after
    /// cancellation are expected and harmless).
    async fn set_progress(&self, id: Uuid, progress: u8) -> Result<Option<Job>, StoreError>;

    async fn set_remote_handle(&self, id: Uuid, handle: &str) -> Result<Job, StoreError>;

    async fn mark_completed(&self, id: Uuid, result: FoldResult) -> Result<Job, StoreError>;

    async fn mark_failed(&self, id: Uuid, message: &str) -> Result<Job, StoreError>;

    async fn mark_cancelled(&self, id: Uuid) -> Result<Job, StoreError>;

    async fn requeue_for_retry(&self, id: Uuid) -> Result<Job, StoreError>;

    /// Counts terminal jobs of `status` in the given algorithm class whose
    /// completion timestamp is strictly older than `cutoff`.
    async fn count_terminal_older(
        &self,
        status: JobStatus,
        expensive: bool,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Deletes what `count_terminal_older` would count. Only ever touches
    /// terminal records, so it is safe alongside submissions and workers.
    async fn delete_terminal_older(
        &self,
        status: JobStatus,
        expensive: bool,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::conformation::parse_sequence;
    use crate::model::Direction;
    use rand::RngExt;
    use rand_chacha::ChaCha8Rng;

    fn sample_job() -> Job {
        Job::new(
            "owner-1",
            Algorithm::MonteCarlo,
            "HPHP",
            SolverParams::default(),
            0,
        )
    }

    fn sample_result() -> FoldResult {
        let sequence = parse_sequence("HPHP").unwrap();
        let best = Conformation::new(
            sequence,
            vec![Direction::Right, Direction::Right, Direction::Right],
        )
        .unwrap();
        FoldResult {
            energy: best.energy,
            best,
            energy_history: Vec::new(),
            total_iterations: 100,
            elapsed_ms: 5,
            pdb: None,
        }
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut job = sample_job();
        assert_eq!(job.status, JobStatus::Queued);

        job.apply_running(Utc::now()).unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.progress, 0);
        assert_eq!(job.attempts, 1);
        assert!(job.started_at.is_some());

        assert!(job.apply_progress(40));
        assert!(!job.apply_progress(30)); // never decreases
        assert_eq!(job.progress, 40);

        job.apply_completed(sample_result(), Utc::now()).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert!(job.result.is_some());
        assert!(job.error.is_none());
        assert!(job.completed_at.is_some());
        assert!(job.actual_duration_ms.is_some());
    }

    #[test]
    fn test_exactly_one_of_result_error_when_terminal() {
        let mut job = sample_job();
        job.apply_running(Utc::now()).unwrap();
        job.apply_failed("solver exploded", Utc::now()).unwrap();
        assert!(job.result.is_none());
        assert_eq!(job.error.as_deref(), Some("solver exploded"));
    }

    #[test]
    fn test_no_transition_out_of_terminal() {
        let mut job = sample_job();
        job.apply_running(Utc::now()).unwrap();
        job.apply_completed(sample_result(), Utc::now()).unwrap();

        assert!(job.apply_running(Utc::now()).is_err());
        assert!(job.apply_cancelled(Utc::now()).is_err());
        assert!(job.apply_failed("late", Utc::now()).is_err());
        assert!(job.apply_retry().is_err());
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[test]
    fn test_cancel_from_queued_and_running() {
        let mut job = sample_job();
        job.apply_cancelled(Utc::now()).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);

        let mut job = sample_job();
        job.apply_running(Utc::now()).unwrap();
        job.apply_progress(70);
        job.apply_cancelled(Utc::now()).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.result.is_none());
    }

    #[test]
    fn test_retry_resets_progress_and_keeps_attempts() {
        let mut job = sample_job();
        job.apply_running(Utc::now()).unwrap();
        job.apply_progress(55);
        job.apply_retry().unwrap();

        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.progress, 0);
        assert_eq!(job.attempts, 1);

        job.apply_running(Utc::now()).unwrap();
        assert_eq!(job.attempts, 2);
    }

    #[test]
    fn test_pause_resume_keeps_progress() {
        let mut job = sample_job();
        job.apply_running(Utc::now()).unwrap();
        job.apply_progress(30);

        job.status = JobStatus::Paused; // worker-side pause bookkeeping
        job.apply_running(Utc::now()).unwrap();
        assert_eq!(job.progress, 30);
        assert_eq!(job.attempts, 1);
    }

    #[test]
    fn test_progress_ignored_outside_running() {
        let mut job = sample_job();
        assert!(!job.apply_progress(10));
        assert_eq!(job.progress, 0);
    }

    #[test]
    fn test_random_transition_sequences_never_escape_terminal() {
        use rand::SeedableRng;
        let mut rng = ChaCha8Rng::seed_from_u64(2024);

        for _ in 0..200 {
            let mut job = sample_job();
            let mut terminal_seen: Option<JobStatus> = None;

            for _ in 0..50 {
                let op = rng.random_range(0..5);
                let _ = match op {
                    0 => job.apply_running(Utc::now()),
                    1 => job.apply_completed(sample_result(), Utc::now()),
                    2 => job.apply_failed("boom", Utc::now()),
                    3 => job.apply_cancelled(Utc::now()),
                    _ => job.apply_retry(),
                };
                if let Some(t) = terminal_seen {
                    assert_eq!(job.status, t, "terminal state must never change");
                } else if job.status.is_terminal() {
                    terminal_seen = Some(job.status);
                }
            }
        }
    }

    #[test]
    fn test_status_parse_roundtrip() {
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Paused,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("archived"), None);
    }

    #[test]
    fn test_view_mirrors_record() {
        let mut job = sample_job().with_estimated_duration_ms(1_000);
        job.apply_running(Utc::now()).unwrap();
        job.apply_progress(25);

        let view = job.view();
        assert_eq!(view.job_id, job.id);
        assert_eq!(view.status, JobStatus::Running);
        assert_eq!(view.progress, 25);
        assert!(view.estimated_completion.is_some());
    }
}
