//! In-process pending-job queue.
//!
//! The queue holds job ids only; the durable record lives in the `JobStore`.
//! Ordering is priority-first (higher dequeues earlier), FIFO within a
//! priority tier. Workers lease ids with a bounded wait; a lease is released
//! when processing ends, and retries re-enter through `requeue_after` with a
//! backoff delay.
//!
//! Cancellation of a queued job is lazy: the id is marked and the stale heap
//! entry is skipped at lease time, so cancel never rebuilds the heap.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

/// A heap entry. Max-heap order: higher priority first, then lower sequence
/// number (earlier enqueue) first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    priority: i32,
    seq: u64,
    job_id: Uuid,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct Inner {
    heap: BinaryHeap<Entry>,
    pending: HashSet<Uuid>,
    cancelled: HashSet<Uuid>,
    leased: HashSet<Uuid>,
    seq: u64,
}

/// Statistics about queue state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Jobs waiting for a worker.
    pub pending_jobs: usize,
    /// Jobs currently leased by workers.
    pub leased_jobs: usize,
}

/// Priority queue of pending job ids shared between the engine and workers.
#[derive(Default)]
pub struct PendingQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a job id. A no-op if the id is already pending.
    pub async fn enqueue(&self, job_id: Uuid, priority: i32) {
        let mut inner = self.inner.lock().await;
        if !inner.pending.insert(job_id) {
            return;
        }
        inner.cancelled.remove(&job_id);
        inner.seq += 1;
        let entry = Entry {
            priority,
            seq: inner.seq,
            job_id,
        };
        inner.heap.push(entry);
        drop(inner);
        self.notify.notify_one();
    }

    /// Leases the highest-priority pending id, waiting up to `timeout` for
    /// one to arrive. Returns `None` on timeout.
    pub async fn lease(&self, timeout: Duration) -> Option<Uuid> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(id) = self.try_lease().await {
                return Some(id);
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return None;
            }
        }
    }

    async fn try_lease(&self) -> Option<Uuid> {
        let mut inner = self.inner.lock().await;
        while let Some(entry) = inner.heap.pop() {
            let id = entry.job_id;
            if inner.cancelled.remove(&id) {
                inner.pending.remove(&id);
                continue;
            }
            // Stale entries (requeued under a new seq) no longer appear in
            // the pending set.
            if inner.pending.remove(&id) {
                inner.leased.insert(id);
                return Some(id);
            }
        }
        None
    }

    /// Removes a still-pending id so no worker ever leases it. Returns
    /// whether the job was pending here (false means it was never queued or
    /// a worker already holds it).
    pub async fn cancel_pending(&self, job_id: Uuid) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.pending.contains(&job_id) {
            inner.cancelled.insert(job_id);
            inner.pending.remove(&job_id);
            true
        } else {
            false
        }
    }

    /// Releases a worker's lease after processing ends.
    pub async fn release(&self, job_id: Uuid) {
        self.inner.lock().await.leased.remove(&job_id);
    }

    /// Re-enqueues a job after `delay`, the retry backoff path.
    pub fn requeue_after(self: &Arc<Self>, job_id: Uuid, priority: i32, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.enqueue(job_id, priority).await;
        });
    }

    /// Number of jobs waiting for a worker.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.pending.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().await;
        QueueStats {
            pending_jobs: inner.pending.len(),
            leased_jobs: inner.leased.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_fifo_within_priority() {
        let queue = PendingQueue::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        queue.enqueue(first, 0).await;
        queue.enqueue(second, 0).await;

        assert_eq!(queue.lease(SHORT).await, Some(first));
        assert_eq!(queue.lease(SHORT).await, Some(second));
    }

    #[tokio::test]
    async fn test_higher_priority_leases_first() {
        let queue = PendingQueue::new();
        let low = Uuid::new_v4();
        let high = Uuid::new_v4();

        queue.enqueue(low, 0).await;
        queue.enqueue(high, 5).await;

        assert_eq!(queue.lease(SHORT).await, Some(high));
        assert_eq!(queue.lease(SHORT).await, Some(low));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_times_out_when_empty() {
        let queue = PendingQueue::new();
        assert_eq!(queue.lease(Duration::from_secs(1)).await, None);
    }

    #[tokio::test]
    async fn test_lease_wakes_on_enqueue() {
        let queue = Arc::new(PendingQueue::new());
        let id = Uuid::new_v4();

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.lease(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.enqueue(id, 0).await;

        assert_eq!(waiter.await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn test_cancel_pending_prevents_lease() {
        let queue = PendingQueue::new();
        let doomed = Uuid::new_v4();
        let kept = Uuid::new_v4();

        queue.enqueue(doomed, 0).await;
        queue.enqueue(kept, 0).await;

        assert!(queue.cancel_pending(doomed).await);
        assert!(!queue.cancel_pending(doomed).await); // no longer pending

        assert_eq!(queue.lease(SHORT).await, Some(kept));
        assert_eq!(queue.lease(SHORT).await, None);
    }

    #[tokio::test]
    async fn test_duplicate_enqueue_is_ignored() {
        let queue = PendingQueue::new();
        let id = Uuid::new_v4();

        queue.enqueue(id, 0).await;
        queue.enqueue(id, 0).await;
        assert_eq!(queue.len().await, 1);

        assert_eq!(queue.lease(SHORT).await, Some(id));
        assert_eq!(queue.lease(SHORT).await, None);
    }

    #[tokio::test]
    async fn test_release_clears_lease() {
        let queue = PendingQueue::new();
        let id = Uuid::new_v4();

        queue.enqueue(id, 0).await;
        queue.lease(SHORT).await.unwrap();
        assert_eq!(queue.stats().await.leased_jobs, 1);

        queue.release(id).await;
        let stats = queue.stats().await;
        assert_eq!(stats.leased_jobs, 0);
        assert_eq!(stats.pending_jobs, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_after_delay() {
        let queue = Arc::new(PendingQueue::new());
        let id = Uuid::new_v4();

        queue.requeue_after(id, 0, Duration::from_secs(30));
        tokio::time::sleep(Duration::from_secs(31)).await;

        assert_eq!(queue.lease(Duration::from_millis(1)).await, Some(id));
    }
}
