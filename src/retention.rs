//! Retention sweeping of terminal job records.
//!
//! Terminal records age out on a schedule that keeps successful results the
//! longest and discards cancellations first. The expensive algorithm class
//! gets longer thresholds across the board since those results cost the most
//! to reproduce. Only terminal records are ever deleted, so the sweeper is
//! safe to run alongside submissions and workers.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use crate::store::{JobStatus, JobStore, StoreError};

/// Per-status retention thresholds for one algorithm class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassRetention {
    pub completed: Duration,
    pub failed: Duration,
    pub cancelled: Duration,
}

impl ClassRetention {
    fn threshold(&self, status: JobStatus) -> Option<Duration> {
        match status {
            JobStatus::Completed => Some(self.completed),
            JobStatus::Failed => Some(self.failed),
            JobStatus::Cancelled => Some(self.cancelled),
            _ => None,
        }
    }
}

/// Full retention policy: thresholds for the standard and expensive classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub standard: ClassRetention,
    pub expensive: ClassRetention,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        const DAY: Duration = Duration::from_secs(24 * 3600);
        Self {
            standard: ClassRetention {
                completed: 7 * DAY,
                failed: 3 * DAY,
                cancelled: DAY,
            },
            expensive: ClassRetention {
                completed: 30 * DAY,
                failed: 7 * DAY,
                cancelled: 3 * DAY,
            },
        }
    }
}

impl RetentionPolicy {
    fn class(&self, expensive: bool) -> &ClassRetention {
        if expensive {
            &self.expensive
        } else {
            &self.standard
        }
    }
}

/// Counts of deleted (or deletable) records per category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub expensive_completed: u64,
    pub expensive_failed: u64,
    pub expensive_cancelled: u64,
}

impl SweepReport {
    pub fn total(&self) -> u64 {
        self.completed
            + self.failed
            + self.cancelled
            + self.expensive_completed
            + self.expensive_failed
            + self.expensive_cancelled
    }

    fn record(&mut self, status: JobStatus, expensive: bool, count: u64) {
        let slot = match (status, expensive) {
            (JobStatus::Completed, false) => &mut self.completed,
            (JobStatus::Failed, false) => &mut self.failed,
            (JobStatus::Cancelled, false) => &mut self.cancelled,
            (JobStatus::Completed, true) => &mut self.expensive_completed,
            (JobStatus::Failed, true) => &mut self.expensive_failed,
            (JobStatus::Cancelled, true) => &mut self.expensive_cancelled,
            _ => return,
        };
        *slot += count;
    }
}

const TERMINAL_STATUSES: [JobStatus; 3] = [
    JobStatus::Completed,
    JobStatus::Failed,
    JobStatus::Cancelled,
];

/// Deletes aged-out terminal records according to a `RetentionPolicy`.
pub struct Sweeper {
    store: Arc<dyn JobStore>,
    policy: RetentionPolicy,
}

impl Sweeper {
    pub fn new(store: Arc<dyn JobStore>, policy: RetentionPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// Runs one sweep pass, deleting every category's aged-out records.
    pub async fn sweep(&self) -> Result<SweepReport, StoreError> {
        let report = self.run(true).await?;
        if report.total() > 0 {
            info!(deleted = report.total(), "Retention sweep removed records");
        } else {
            debug!("Retention sweep found nothing to remove");
        }
        Ok(report)
    }

    /// Dry run: counts what `sweep` would delete without touching anything.
    pub async fn pending(&self) -> Result<SweepReport, StoreError> {
        self.run(false).await
    }

    async fn run(&self, delete: bool) -> Result<SweepReport, StoreError> {
        let now = Utc::now();
        let mut report = SweepReport::default();

        for expensive in [false, true] {
            let class = self.policy.class(expensive);
            for status in TERMINAL_STATUSES {
                let threshold = match class.threshold(status) {
                    Some(t) => t,
                    None => continue,
                };
                let cutoff = now
                    - chrono::Duration::from_std(threshold)
                        .unwrap_or(chrono::Duration::MAX);

                let count = if delete {
                    self.store
                        .delete_terminal_older(status, expensive, cutoff)
                        .await?
                } else {
                    self.store
                        .count_terminal_older(status, expensive, cutoff)
                        .await?
                };
                report.record(status, expensive, count);
            }
        }

        Ok(report)
    }
}
