//! The engine facade tying the pipeline together.
//!
//! `FoldEngine` owns the queue, the worker pool, the notifier, the rate
//! limiter, and the background heartbeat and retention tasks. Callers
//! interact with it through five operations: submit, status, list, cancel,
//! and subscribe.
//!
//! Submission is transactional from the caller's view: validation and rate
//! checks happen before the record exists, and a store failure means no job
//! was created. Once `submit` returns a receipt the job is durable and will
//! be executed at least once; finalization is idempotent, so a duplicate
//! lease after a crash cannot corrupt a terminal record.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::SubmitError;
use crate::limiter::RateLimiter;
use crate::notifier::{Notifier, StreamEvent};
use crate::retention::Sweeper;
use crate::scheduler::{
    CancelRegistry, PendingQueue, PoolError, PoolStats, WorkerContext, WorkerPool,
    WorkerPoolConfig,
};
use crate::solver::{Algorithm, RosettaClient, SolveRequest, SolverParams};
use crate::store::{Job, JobStatus, JobStore, JobView, StoreError};

/// What `submit` hands back once a job is durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub job_id: Uuid,
    /// Heuristic completion estimate; refine by watching the stream.
    pub estimated_completion: Option<DateTime<Utc>>,
}

/// Outcome of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was still queued (or paused) and is now CANCELLED.
    Cancelled,
    /// A worker is executing the job and has been signalled; the CANCELLED
    /// transition arrives on the stream once acknowledged.
    Signalled,
    /// The job is already terminal; nothing to do.
    NotCancellable,
}

/// The job-execution engine.
pub struct FoldEngine {
    config: EngineConfig,
    store: Arc<dyn JobStore>,
    queue: Arc<PendingQueue>,
    notifier: Arc<Notifier>,
    cancels: Arc<CancelRegistry>,
    limiter: Arc<RateLimiter>,
    pool: Mutex<WorkerPool>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl FoldEngine {
    /// Assembles an engine over the given store. Nothing executes until
    /// `start`.
    pub fn new(config: EngineConfig, store: Arc<dyn JobStore>) -> Self {
        let queue = Arc::new(PendingQueue::new());
        let notifier = Arc::new(Notifier::new(config.event_capacity));
        let cancels = Arc::new(CancelRegistry::new());

        let rosetta = config.rosetta_url.as_ref().map(|url| {
            RosettaClient::new(url.clone()).with_poll_interval(config.rosetta_poll_interval)
        });

        let ctx = Arc::new(WorkerContext {
            store: Arc::clone(&store),
            queue: Arc::clone(&queue),
            notifier: Arc::clone(&notifier),
            cancels: Arc::clone(&cancels),
            rosetta,
        });

        let mut pool_config = WorkerPoolConfig::new(config.num_workers)
            .with_poll_interval(config.poll_interval)
            .with_max_attempts(config.max_attempts)
            .with_retry_base_delay(config.retry_base_delay);
        if let Some(deadline) = config.job_deadline {
            pool_config = pool_config.with_job_deadline(deadline);
        }

        let pool = WorkerPool::new(pool_config, ctx);

        Self {
            config,
            store,
            queue,
            notifier,
            cancels,
            limiter: Arc::new(RateLimiter::new()),
            pool: Mutex::new(pool),
            background: Mutex::new(Vec::new()),
        }
    }

    /// Starts the workers, the heartbeat task, and the retention sweeper.
    ///
    /// Before workers spin up, non-terminal records from a previous run are
    /// restored to the queue: RUNNING jobs (orphaned by a crash) go back to
    /// QUEUED and are re-executed, which is the at-least-once half of the
    /// delivery contract.
    pub async fn start(&self) -> Result<(), PoolError> {
        match self.recover().await {
            Ok(0) => {}
            Ok(recovered) => info!(recovered = recovered, "Restored jobs to the queue"),
            Err(e) => warn!(error = %e, "Failed to restore jobs from the store"),
        }

        self.pool.lock().await.start()?;

        let mut background = self.background.lock().await;

        let notifier = Arc::clone(&self.notifier);
        let limiter = Arc::clone(&self.limiter);
        let heartbeat_interval = self.config.heartbeat_interval;
        background.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_interval);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                notifier.broadcast_heartbeat().await;
                limiter.sweep_expired();
            }
        }));

        let sweeper = Sweeper::new(Arc::clone(&self.store), self.config.retention);
        let sweep_interval = self.config.sweep_interval;
        background.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = sweeper.sweep().await {
                    error!(error = %e, "Retention sweep failed");
                }
            }
        }));

        info!(num_workers = self.config.num_workers, "Engine started");
        Ok(())
    }

    /// Re-enqueues non-terminal records. RUNNING records have no live worker
    /// at this point, so they take the retry transition first.
    async fn recover(&self) -> Result<usize, StoreError> {
        let mut recovered = 0;
        for job in self.store.list_active().await? {
            match job.status {
                JobStatus::Queued => {
                    self.queue.enqueue(job.id, job.priority).await;
                    recovered += 1;
                }
                JobStatus::Running => {
                    let updated = self.store.requeue_for_retry(job.id).await?;
                    self.notifier.publish(&updated.owner_id, updated.view()).await;
                    self.queue.enqueue(job.id, job.priority).await;
                    recovered += 1;
                }
                // PAUSED jobs wait for an explicit resume.
                _ => {}
            }
        }
        Ok(recovered)
    }

    /// Stops the workers and background tasks. In-flight jobs finish first.
    pub async fn stop(&self) -> Result<(), PoolError> {
        for handle in self.background.lock().await.drain(..) {
            handle.abort();
        }
        self.pool.lock().await.shutdown().await?;
        info!("Engine stopped");
        Ok(())
    }

    /// Validates, rate-checks, persists, and enqueues one submission.
    ///
    /// On `Ok`, the job exists in the store with status QUEUED. On any error
    /// no job was created.
    pub async fn submit(
        &self,
        owner_id: &str,
        algorithm: Algorithm,
        sequence: &str,
        params: SolverParams,
        priority: i32,
    ) -> Result<SubmitReceipt, SubmitError> {
        // Fail-fast validation before any quota is spent.
        let request = SolveRequest::new(sequence, algorithm, params.clone())?;

        self.enforce_rate(owner_id, algorithm)?;

        let estimate_ms = estimate_duration_ms(algorithm, request.sequence.len(), &params);
        let job = Job::new(owner_id, algorithm, sequence, params, priority)
            .with_estimated_duration_ms(estimate_ms);
        let job_id = job.id;
        let estimated_completion = job.estimated_completion();
        let view = job.view();

        self.store
            .insert(job)
            .await
            .map_err(|e| SubmitError::Backend(e.to_string()))?;

        self.queue.enqueue(job_id, priority).await;
        self.notifier.publish(owner_id, view).await;

        info!(
            job_id = %job_id,
            owner_id = %owner_id,
            algorithm = %algorithm,
            "Job submitted"
        );

        Ok(SubmitReceipt {
            job_id,
            estimated_completion,
        })
    }

    fn enforce_rate(&self, owner_id: &str, algorithm: Algorithm) -> Result<(), SubmitError> {
        let general = self.limiter.check(owner_id, &self.config.general_policy);
        if !general.allowed {
            return Err(SubmitError::RateLimited {
                identifier: owner_id.to_string(),
                policy: self.config.general_policy.name.clone(),
                remaining: general.remaining,
                reset_at: general.reset_at,
            });
        }

        if algorithm.is_expensive() {
            let expensive = self.limiter.check(owner_id, &self.config.expensive_policy);
            if !expensive.allowed {
                return Err(SubmitError::RateLimited {
                    identifier: owner_id.to_string(),
                    policy: self.config.expensive_policy.name.clone(),
                    remaining: expensive.remaining,
                    reset_at: expensive.reset_at,
                });
            }
        }

        Ok(())
    }

    /// Observable state of one job.
    pub async fn status(&self, job_id: Uuid) -> Result<Option<JobView>, StoreError> {
        Ok(self.store.get(job_id).await?.map(|job| job.view()))
    }

    /// An owner's jobs, most recent first.
    pub async fn list_jobs(
        &self,
        owner_id: &str,
        limit: usize,
    ) -> Result<Vec<JobView>, StoreError> {
        Ok(self
            .store
            .list_by_owner(owner_id, limit)
            .await?
            .into_iter()
            .map(|job| job.view())
            .collect())
    }

    /// Requests cancellation of a job in any non-terminal state.
    pub async fn cancel(&self, job_id: Uuid) -> Result<CancelOutcome, StoreError> {
        let job = self
            .store
            .get(job_id)
            .await?
            .ok_or(StoreError::NotFound(job_id))?;

        match job.status {
            JobStatus::Queued | JobStatus::Paused => {
                let _ = self.queue.cancel_pending(job_id).await;
                match self.store.mark_cancelled(job_id).await {
                    Ok(updated) => {
                        self.notifier.publish(&updated.owner_id, updated.view()).await;
                        Ok(CancelOutcome::Cancelled)
                    }
                    // A worker claimed the job between our read and the
                    // write; fall through to signalling it.
                    Err(StoreError::InvalidTransition { .. }) => {
                        Ok(self.signal_running(job_id, &job).await)
                    }
                    Err(e) => Err(e),
                }
            }
            JobStatus::Running => Ok(self.signal_running(job_id, &job).await),
            _ => Ok(CancelOutcome::NotCancellable),
        }
    }

    async fn signal_running(&self, job_id: Uuid, job: &Job) -> CancelOutcome {
        if self.cancels.cancel(job_id) {
            return CancelOutcome::Signalled;
        }
        // No registered token: the worker is between claiming and
        // registering, or already finalizing. Try the direct transition.
        match self.store.mark_cancelled(job_id).await {
            Ok(updated) => {
                self.notifier.publish(&updated.owner_id, updated.view()).await;
                CancelOutcome::Cancelled
            }
            Err(e) => {
                warn!(job_id = %job_id, owner_id = %job.owner_id, error = %e, "Cancel raced with finalization");
                CancelOutcome::NotCancellable
            }
        }
    }

    /// Opens the owner's event stream.
    pub async fn subscribe(&self, owner_id: &str) -> BoxStream<'static, StreamEvent> {
        self.notifier.subscribe(owner_id).await
    }

    /// Current worker pool statistics.
    pub async fn pool_stats(&self) -> PoolStats {
        self.pool.lock().await.stats()
    }

    /// Current queue depth.
    pub async fn queue_len(&self) -> usize {
        self.queue.len().await
    }
}

/// Rough duration estimate for the submission receipt. Calibrated to the
/// in-process solvers' per-iteration cost; Rosetta delegations get a flat
/// figure since the remote queue dominates.
fn estimate_duration_ms(algorithm: Algorithm, sequence_len: usize, params: &SolverParams) -> u64 {
    if algorithm.is_expensive() {
        return 5 * 60 * 1000;
    }

    let per_iteration_us = (sequence_len as u64).max(1);
    let multiplier = if algorithm.is_population_based() {
        params.population_size as u64
    } else {
        1
    };

    // An absurd but valid iteration budget saturates the estimate instead of
    // overflowing.
    (params
        .iterations
        .saturating_mul(per_iteration_us)
        .saturating_mul(multiplier)
        / 1000)
        .max(1)
}
