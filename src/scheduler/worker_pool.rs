//! Worker pool executing queued fold jobs.
//!
//! Each worker is an independent async task that leases job ids from the
//! shared `PendingQueue`, loads the durable record, runs the selected solver,
//! and finalizes the record. In-process solvers run on the blocking thread
//! pool with progress bridged back over a channel; Rosetta delegations stay
//! async and poll the external service.
//!
//! Finalization is idempotent: a worker that leases an id whose record is no
//! longer QUEUED simply drops the lease, and terminal transitions rejected by
//! the store are logged rather than retried.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::notifier::Notifier;
use crate::solver::rosetta::RosettaError;
use crate::solver::{
    solver_for, CancelToken, RosettaClient, SolveContext, SolveOutcome, SolveRequest,
    SolverError,
};
use crate::store::{FoldResult, Job, JobStatus, JobStore};

use super::queue::PendingQueue;
use super::CancelRegistry;

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// How long a worker waits on an empty queue before re-checking shutdown.
    pub poll_interval: Duration,
    /// Total executor attempts per job before it is marked FAILED.
    pub max_attempts: u32,
    /// Base delay for the exponential retry backoff.
    pub retry_base_delay: Duration,
    /// Optional wall-clock ceiling per solver run.
    pub job_deadline: Option<Duration>,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            poll_interval: Duration::from_secs(1),
            max_attempts: 3,
            retry_base_delay: Duration::from_secs(5),
            job_deadline: None,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the attempt budget.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Sets the retry backoff base.
    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    /// Sets the per-run wall-clock ceiling.
    pub fn with_job_deadline(mut self, deadline: Duration) -> Self {
        self.job_deadline = Some(deadline);
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently executing a job.
    pub active_workers: usize,
    /// Jobs finalized as COMPLETED.
    pub jobs_completed: u64,
    /// Jobs finalized as FAILED.
    pub jobs_failed: u64,
    /// Jobs finalized as CANCELLED while executing.
    pub jobs_cancelled: u64,
    /// Transient failures sent back to the queue.
    pub jobs_retried: u64,
    /// Average execution duration over finalized jobs.
    pub average_job_duration: Duration,
}

impl PoolStats {
    /// Total jobs finalized by this pool.
    pub fn total_processed(&self) -> u64 {
        self.jobs_completed + self.jobs_failed + self.jobs_cancelled
    }

    /// COMPLETED share of finalized jobs, as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.jobs_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_cancelled: AtomicU64,
    jobs_retried: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            jobs_completed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            jobs_cancelled: AtomicU64::new(0),
            jobs_retried: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record_completion(&self, duration: Duration) {
        self.jobs_completed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_failure(&self, duration: Duration) {
        self.jobs_failed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_cancellation(&self, duration: Duration) {
        self.jobs_cancelled.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_retry(&self) {
        self.jobs_retried.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let completed = self.jobs_completed.load(Ordering::SeqCst);
        let failed = self.jobs_failed.load(Ordering::SeqCst);
        let cancelled = self.jobs_cancelled.load(Ordering::SeqCst);
        let retried = self.jobs_retried.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let active = self.active_workers.load(Ordering::SeqCst);

        let total_jobs = completed + failed + cancelled;
        let average_duration = if total_jobs > 0 {
            Duration::from_millis(total_duration_ms / total_jobs)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: active as usize,
            jobs_completed: completed,
            jobs_failed: failed,
            jobs_cancelled: cancelled,
            jobs_retried: retried,
            average_job_duration: average_duration,
        }
    }
}

/// Shared dependencies handed to every worker.
pub struct WorkerContext {
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<PendingQueue>,
    pub notifier: Arc<Notifier>,
    pub cancels: Arc<CancelRegistry>,
    /// Present only when an external Rosetta service is configured.
    pub rosetta: Option<RosettaClient>,
}

/// Worker pool that manages multiple workers executing jobs from the queue.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    ctx: Arc<WorkerContext>,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl WorkerPool {
    /// Creates a new worker pool. Workers are not started until `start`.
    pub fn new(config: WorkerPoolConfig, ctx: Arc<WorkerContext>) -> Self {
        // Buffer size of 1 is sufficient since the shutdown signal is sent once
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            ctx,
            shutdown_tx,
            worker_handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::new()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Starts all workers in the pool.
    pub fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        for i in 0..self.config.num_workers {
            let worker = Worker {
                id: format!("worker-{}", i),
                config: self.config.clone(),
                ctx: Arc::clone(&self.ctx),
                shutdown_rx: self.shutdown_tx.subscribe(),
                stats: Arc::clone(&self.stats),
            };

            let handle = tokio::spawn(async move {
                worker.run().await;
            });

            self.worker_handles.push(handle);
        }

        self.is_running.store(true, Ordering::SeqCst);
        info!(num_workers = self.config.num_workers, "Worker pool started");

        Ok(())
    }

    /// Gracefully shuts down all workers.
    ///
    /// Workers finish their current job before stopping; jobs still queued
    /// remain QUEUED in the store.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");

        // Ignore send error - workers may have already stopped
        let _ = self.shutdown_tx.send(());

        let shutdown_future = async {
            for handle in self.worker_handles.drain(..) {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        match tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await {
            Ok(()) => {
                self.is_running.store(false, Ordering::SeqCst);
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => {
                self.is_running.store(false, Ordering::SeqCst);
                Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout))
            }
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Returns the number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }
}

/// How one execution attempt ended.
enum ExecOutcome {
    Finished(FoldResult),
    Cancelled,
}

/// Execution-attempt errors. Transient errors go back to the queue while
/// attempts remain; permanent ones finalize the job as FAILED immediately.
#[derive(Debug, Error)]
enum ExecError {
    #[error("{0}")]
    Permanent(String),

    #[error("{0}")]
    Transient(String),
}

impl ExecError {
    fn is_permanent(&self) -> bool {
        matches!(self, ExecError::Permanent(_))
    }
}

/// A single worker task.
struct Worker {
    id: String,
    config: WorkerPoolConfig,
    ctx: Arc<WorkerContext>,
    shutdown_rx: broadcast::Receiver<()>,
    stats: Arc<SharedPoolStats>,
}

impl Worker {
    /// Main worker loop: lease, execute, finalize, until shutdown.
    async fn run(mut self) {
        info!(worker_id = %self.id, "Worker started");

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            match self.ctx.queue.lease(self.config.poll_interval).await {
                Some(job_id) => {
                    self.process_job(job_id).await;
                    self.ctx.queue.release(job_id).await;
                }
                None => {
                    debug!(worker_id = %self.id, "No jobs available");
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Loads, executes, and finalizes one leased job.
    async fn process_job(&self, job_id: Uuid) {
        let job = match self.ctx.store.get(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(worker_id = %self.id, job_id = %job_id, "Leased job has no record");
                return;
            }
            Err(e) => {
                error!(worker_id = %self.id, job_id = %job_id, error = %e, "Failed to load job");
                return;
            }
        };

        // Idempotent lease handling: anything not QUEUED was already claimed
        // or resolved elsewhere.
        if job.status != JobStatus::Queued {
            debug!(
                worker_id = %self.id,
                job_id = %job_id,
                status = %job.status,
                "Skipping job no longer queued"
            );
            return;
        }

        let job = match self.ctx.store.mark_running(job_id).await {
            Ok(job) => job,
            Err(e) => {
                debug!(worker_id = %self.id, job_id = %job_id, error = %e, "Lost claim race");
                return;
            }
        };
        self.publish(&job).await;

        info!(
            worker_id = %self.id,
            job_id = %job_id,
            algorithm = %job.algorithm,
            attempt = job.attempts,
            "Executing job"
        );

        let token = CancelToken::new();
        self.ctx.cancels.register(job_id, token.clone());
        self.stats.increment_active();

        let start_time = Instant::now();
        let result = self.execute(&job, token).await;
        let duration = start_time.elapsed();

        self.stats.decrement_active();
        self.ctx.cancels.remove(job_id);

        self.finalize(job, result, duration).await;
    }

    /// Writes the terminal (or retry) transition for an execution result.
    async fn finalize(
        &self,
        job: Job,
        result: Result<ExecOutcome, ExecError>,
        duration: Duration,
    ) {
        let job_id = job.id;

        match result {
            Ok(ExecOutcome::Finished(fold)) => {
                let energy = fold.energy;
                match self.ctx.store.mark_completed(job_id, fold).await {
                    Ok(updated) => {
                        self.publish(&updated).await;
                        self.stats.record_completion(duration);
                        info!(
                            worker_id = %self.id,
                            job_id = %job_id,
                            energy = energy,
                            duration_ms = duration.as_millis(),
                            "Job completed"
                        );
                    }
                    Err(e) => {
                        error!(worker_id = %self.id, job_id = %job_id, error = %e, "Failed to mark job complete");
                    }
                }
            }
            Ok(ExecOutcome::Cancelled) => match self.ctx.store.mark_cancelled(job_id).await {
                Ok(updated) => {
                    self.publish(&updated).await;
                    self.stats.record_cancellation(duration);
                    info!(worker_id = %self.id, job_id = %job_id, "Job cancelled");
                }
                Err(e) => {
                    warn!(worker_id = %self.id, job_id = %job_id, error = %e, "Failed to mark job cancelled");
                }
            },
            Err(e) => {
                let retryable = !e.is_permanent() && job.attempts < self.config.max_attempts;

                if retryable {
                    warn!(
                        worker_id = %self.id,
                        job_id = %job_id,
                        error = %e,
                        attempt = job.attempts,
                        max_attempts = self.config.max_attempts,
                        "Job failed, requeueing for retry"
                    );
                    match self.ctx.store.requeue_for_retry(job_id).await {
                        Ok(updated) => {
                            self.publish(&updated).await;
                            self.stats.record_retry();
                            let backoff = self.config.retry_base_delay
                                * 2u32.saturating_pow(job.attempts.saturating_sub(1));
                            self.ctx.queue.requeue_after(job_id, job.priority, backoff);
                        }
                        Err(requeue_err) => {
                            error!(worker_id = %self.id, job_id = %job_id, error = %requeue_err, "Failed to requeue job");
                        }
                    }
                } else {
                    error!(worker_id = %self.id, job_id = %job_id, error = %e, "Job failed");
                    match self.ctx.store.mark_failed(job_id, &e.to_string()).await {
                        Ok(updated) => {
                            self.publish(&updated).await;
                            self.stats.record_failure(duration);
                        }
                        Err(store_err) => {
                            error!(worker_id = %self.id, job_id = %job_id, error = %store_err, "Failed to mark job failed");
                        }
                    }
                }
            }
        }
    }

    /// Dispatches execution to the in-process solver or the Rosetta client.
    async fn execute(&self, job: &Job, token: CancelToken) -> Result<ExecOutcome, ExecError> {
        let request = SolveRequest::new(&job.sequence, job.algorithm, job.params.clone())
            .map_err(|e| ExecError::Permanent(e.to_string()))?;

        match solver_for(job.algorithm) {
            Some(solver) => self.run_local(job, request, solver, token).await,
            None => self.run_remote(job, request, token).await,
        }
    }

    /// Runs a synchronous solver on the blocking pool, pumping its progress
    /// reports into the store and the owner's event stream.
    async fn run_local(
        &self,
        job: &Job,
        request: SolveRequest,
        solver: Box<dyn crate::solver::Solver>,
        token: CancelToken,
    ) -> Result<ExecOutcome, ExecError> {
        let total_iterations = request.params.iterations.max(1);
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();

        let mut ctx = SolveContext::new(token).with_progress(move |p| {
            let _ = progress_tx.send(p);
        });
        if let Some(deadline) = self.config.job_deadline {
            ctx = ctx.with_deadline(deadline);
        }

        let solver_task =
            tokio::task::spawn_blocking(move || solver.solve(&request, &ctx));

        let job_id = job.id;
        let owner_id = job.owner_id.clone();
        let progress_pump = async {
            while let Some(p) = progress_rx.recv().await {
                // Hold 100 back for the terminal transition.
                let pct = ((p.iteration.saturating_mul(100) / total_iterations).min(99)) as u8;
                match self.ctx.store.set_progress(job_id, pct).await {
                    Ok(Some(updated)) => {
                        self.ctx.notifier.publish(&owner_id, updated.view()).await;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(job_id = %job_id, error = %e, "Failed to persist progress");
                    }
                }
            }
        };

        let (joined, ()) = tokio::join!(solver_task, progress_pump);

        let outcome: SolveOutcome = joined
            .map_err(|e| ExecError::Transient(format!("solver task panicked: {e}")))?
            .map_err(|e| match e {
                SolverError::Validation(v) => ExecError::Permanent(v.to_string()),
                SolverError::Internal(m) => ExecError::Transient(m),
            })?;

        if outcome.is_cancelled() {
            return Ok(ExecOutcome::Cancelled);
        }

        Ok(ExecOutcome::Finished(FoldResult {
            energy: outcome.best.energy,
            best: outcome.best,
            energy_history: outcome.energy_history,
            total_iterations: outcome.total_iterations,
            elapsed_ms: outcome.elapsed_ms,
            pdb: None,
        }))
    }

    /// Delegates execution to the external Rosetta service.
    async fn run_remote(
        &self,
        job: &Job,
        request: SolveRequest,
        token: CancelToken,
    ) -> Result<ExecOutcome, ExecError> {
        let client = self
            .ctx
            .rosetta
            .as_ref()
            .ok_or_else(|| ExecError::Permanent("Rosetta service not configured".to_string()))?;

        let start_time = Instant::now();
        let directions = request
            .initial
            .as_ref()
            .map(|moves| moves.iter().map(|d| d.as_char().to_string()).collect());

        let handle = client
            .submit(&job.id.to_string(), &job.sequence, directions, None)
            .await
            .map_err(map_rosetta_error)?;

        // Persist the handle so the record shows where the work went even if
        // polling is interrupted.
        if let Err(e) = self
            .ctx
            .store
            .set_remote_handle(job.id, &handle.job_id)
            .await
        {
            warn!(job_id = %job.id, error = %e, "Failed to persist remote handle");
        }

        match client.await_completion(&handle.job_id, &token).await {
            Ok(remote) => {
                let best = request.starting_conformation();
                Ok(ExecOutcome::Finished(FoldResult {
                    energy: best.energy,
                    best,
                    energy_history: Vec::new(),
                    total_iterations: 0,
                    elapsed_ms: start_time.elapsed().as_millis() as u64,
                    pdb: remote.pdb,
                }))
            }
            Err(RosettaError::Cancelled) => Ok(ExecOutcome::Cancelled),
            Err(e) => Err(map_rosetta_error(e)),
        }
    }

    async fn publish(&self, job: &Job) {
        self.ctx.notifier.publish(&job.owner_id, job.view()).await;
    }
}

/// Maps remote-service errors onto the retry policy: a run the service
/// actually rejected or failed will fail again, while transport hiccups and
/// lost handles are worth another attempt.
fn map_rosetta_error(e: RosettaError) -> ExecError {
    match e {
        RosettaError::Rejected { .. } | RosettaError::RemoteFailure(_) => {
            ExecError::Permanent(e.to_string())
        }
        RosettaError::Transport(_)
        | RosettaError::RemoteNotFound { .. }
        | RosettaError::Cancelled => ExecError::Transient(e.to_string()),
    }
}
