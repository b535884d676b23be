//! In-process job store used by tests and the demo.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{FoldResult, Job, JobStatus, JobStore, StoreError};

/// Map-backed store. Lifecycle invariants are enforced by the shared
/// `Job::apply_*` helpers, the same code path `PgStore` uses.
#[derive(Default)]
pub struct MemoryStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of records, terminal or not.
    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    async fn update<F>(&self, id: Uuid, f: F) -> Result<Job, StoreError>
    where
        F: FnOnce(&mut Job) -> Result<(), StoreError>,
    {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        f(job)?;
        Ok(job.clone())
    }

    fn matches_class(job: &Job, expensive: bool) -> bool {
        job.algorithm.is_expensive() == expensive
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert(&self, job: Job) -> Result<(), StoreError> {
        self.jobs.write().await.insert(job.id, job);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn list_by_owner(&self, owner_id: &str, limit: usize) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read().await;
        let mut owned: Vec<Job> = jobs
            .values()
            .filter(|j| j.owner_id == owner_id)
            .cloned()
            .collect();
        owned.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        owned.truncate(limit);
        Ok(owned)
    }

    async fn list_active(&self) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read().await;
        let mut active: Vec<Job> = jobs
            .values()
            .filter(|j| !j.status.is_terminal())
            .cloned()
            .collect();
        active.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(active)
    }

    async fn mark_running(&self, id: Uuid) -> Result<Job, StoreError> {
        self.update(id, |job| job.apply_running(Utc::now())).await
    }

    async fn set_progress(&self, id: Uuid, progress: u8) -> Result<Option<Job>, StoreError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if job.apply_progress(progress) {
            Ok(Some(job.clone()))
        } else {
            Ok(None)
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
        self.update(id, |job| job.apply_completed(result, Utc::now()))
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
        let jobs = self.jobs.read().await;
        Ok(jobs
            .values()
            .filter(|j| {
                j.status == status
                    && j.status.is_terminal()
                    && Self::matches_class(j, expensive)
                    && j.completed_at.is_some_and(|t| t < cutoff)
            })
            .count() as u64)
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
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, j| {
            !(j.status == status
                && Self::matches_class(j, expensive)
                && j.completed_at.is_some_and(|t| t < cutoff))
        });
        Ok((before - jobs.len()) as u64)
    }
}
