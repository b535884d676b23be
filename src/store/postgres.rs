//! PostgreSQL job store backed by sqlx.
//!
//! Lifecycle writes are read-modify-write inside a transaction with
//! `SELECT ... FOR UPDATE`, applying the same `Job::apply_*` helpers as the
//! in-memory store so the state machine lives in exactly one place.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use uuid::Uuid;

use crate::solver::Algorithm;

use super::{FoldResult, Job, JobStatus, JobStore, StoreError};

/// PostgreSQL-backed store.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connects to the database.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Creates a store from an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the jobs table and its indexes if they do not exist.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS fold_jobs (
                id UUID PRIMARY KEY,
                owner_id TEXT NOT NULL,
                algorithm TEXT NOT NULL,
                sequence TEXT NOT NULL,
                params JSONB NOT NULL,
                status TEXT NOT NULL,
                priority INT NOT NULL DEFAULT 0,
                progress INT NOT NULL DEFAULT 0,
                result JSONB,
                error TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                started_at TIMESTAMPTZ,
                completed_at TIMESTAMPTZ,
                estimated_duration_ms BIGINT,
                actual_duration_ms BIGINT,
                attempts INT NOT NULL DEFAULT 0,
                remote_handle TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_fold_jobs_owner \
             ON fold_jobs (owner_id, created_at DESC)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_fold_jobs_retention \
             ON fold_jobs (status, algorithm, completed_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<Job, StoreError> {
        let status_text: String = row.try_get("status")?;
        let status = JobStatus::parse(&status_text)
            .ok_or_else(|| StoreError::Backend(format!("unknown status '{status_text}'")))?;

        let algorithm_text: String = row.try_get("algorithm")?;
        let algorithm = Algorithm::parse(&algorithm_text)
            .ok_or_else(|| StoreError::Backend(format!("unknown algorithm '{algorithm_text}'")))?;

        let params: serde_json::Value = row.try_get("params")?;
        let result: Option<serde_json::Value> = row.try_get("result")?;
        let result: Option<FoldResult> = match result {
            Some(value) => Some(serde_json::from_value(value)?),
            None => None,
        };

        Ok(Job {
            id: row.try_get("id")?,
            owner_id: row.try_get("owner_id")?,
            algorithm,
            sequence: row.try_get("sequence")?,
            params: serde_json::from_value(params)?,
            status,
            priority: row.try_get("priority")?,
            progress: row.try_get::<i32, _>("progress")?.clamp(0, 100) as u8,
            result,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            estimated_duration_ms: row
                .try_get::<Option<i64>, _>("estimated_duration_ms")?
                .map(|v| v as u64),
            actual_duration_ms: row
                .try_get::<Option<i64>, _>("actual_duration_ms")?
                .map(|v| v as u64),
            attempts: row.try_get::<i32, _>("attempts")? as u32,
            remote_handle: row.try_get("remote_handle")?,
        })
    }

    /// Locks the row, applies a lifecycle mutation, and writes it back.
    async fn update<F>(&self, id: Uuid, f: F) -> Result<Job, StoreError>
    where
        F: FnOnce(&mut Job) -> Result<(), StoreError> + Send,
    {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM fold_jobs WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let row = row.ok_or(StoreError::NotFound(id))?;
        let mut job = Self::job_from_row(&row)?;

        f(&mut job)?;

        let result_json = match &job.result {
            Some(r) => Some(serde_json::to_value(r)?),
            None => None,
        };

        sqlx::query(
            r#"
            UPDATE fold_jobs SET
                status = $2, progress = $3, result = $4, error = $5,
                started_at = $6, completed_at = $7, actual_duration_ms = $8,
                attempts = $9, remote_handle = $10
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(job.status.as_str())
        .bind(i32::from(job.progress))
        .bind(result_json)
        .bind(&job.error)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.actual_duration_ms.map(|v| v as i64))
        .bind(job.attempts as i32)
        .bind(&job.remote_handle)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(job)
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn insert(&self, job: Job) -> Result<(), StoreError> {
        let params_json = serde_json::to_value(&job.params)?;
        let result_json = match &job.result {
            Some(r) => Some(serde_json::to_value(r)?),
            None => None,
        };

        sqlx::query(
            r#"
            INSERT INTO fold_jobs (
                id, owner_id, algorithm, sequence, params, status, priority,
                progress, result, error, created_at, started_at, completed_at,
                estimated_duration_ms, actual_duration_ms, attempts, remote_handle
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(job.id)
        .bind(&job.owner_id)
        .bind(job.algorithm.as_str())
        .bind(&job.sequence)
        .bind(params_json)
        .bind(job.status.as_str())
        .bind(job.priority)
        .bind(i32::from(job.progress))
        .bind(result_json)
        .bind(&job.error)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.estimated_duration_ms.map(|v| v as i64))
        .bind(job.actual_duration_ms.map(|v| v as i64))
        .bind(job.attempts as i32)
        .bind(&job.remote_handle)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query("SELECT * FROM fold_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(Self::job_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_by_owner(&self, owner_id: &str, limit: usize) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM fold_jobs WHERE owner_id = $1 \
             ORDER BY created_at DESC LIMIT $2",
        )
        .bind(owner_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::job_from_row).collect()
    }

    async fn list_active(&self) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM fold_jobs \
             WHERE status IN ('queued', 'running', 'paused') \
             ORDER BY priority DESC, created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::job_from_row).collect()
    }

    async fn mark_running(&self, id: Uuid) -> Result<Job, StoreError> {
        self.update(id, |job| job.apply_running(Utc::now())).await
    }

    async fn set_progress(&self, id: Uuid, progress: u8) -> Result<Option<Job>, StoreError> {
        // Monotone conditional write; no transaction needed since the guard
        // is in the predicate.
        let row = sqlx::query(
            "UPDATE fold_jobs SET progress = $2 \
             WHERE id = $1 AND status = 'running' AND progress < $2 \
             RETURNING *",
        )
        .bind(id)
        .bind(i32::from(progress.min(100)))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(Self::job_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn set_remote_handle(&self, id: Uuid, handle: &str) -> Result<Job, StoreError> {
        self.update(id, |job| {
            job.remote_handle = Some(handle.to_string());
            Ok(())
        })
        .await
    }

    async fn mark_completed(&self, id: Uuid, result: FoldResult) -> Result<Job, StoreError> {
        self.update(id, move |job| job.apply_completed(result, Utc::now()))
            .await
    }

    async fn mark_failed(&self, id: Uuid, message: &str) -> Result<Job, StoreError> {
        self.update(id, |job| job.apply_failed(message, Utc::now()))
            .await
    }

    async fn mark_cancelled(&self, id: Uuid) -> Result<Job, StoreError> {
        self.update(id, |job| job.apply_cancelled(Utc::now())).await
    }

    async fn requeue_for_retry(&self, id: Uuid) -> Result<Job, StoreError> {
        self.update(id, |job| job.apply_retry()).await
    }

    async fn count_terminal_older(
        &self,
        status: JobStatus,
        expensive: bool,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM fold_jobs \
             WHERE status = $1 AND (algorithm = 'rosetta') = $2 \
             AND completed_at IS NOT NULL AND completed_at < $3",
        )
        .bind(status.as_str())
        .bind(expensive)
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get::<i64, _>("n")? as u64)
    }

    async fn delete_terminal_older(
        &self,
        status: JobStatus,
        expensive: bool,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        if !status.is_terminal() {
            return Ok(0);
        }
        let result = sqlx::query(
            "DELETE FROM fold_jobs \
             WHERE status = $1 AND (algorithm = 'rosetta') = $2 \
             AND completed_at IS NOT NULL AND completed_at < $3",
        )
        .bind(status.as_str())
        .bind(expensive)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
