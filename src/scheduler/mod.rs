//! Job scheduling: pending queue, worker pool, and cancellation routing.

pub mod queue;
pub mod worker_pool;

use std::collections::HashMap;
use std::sync::Mutex;

use uuid::Uuid;

use crate::solver::CancelToken;

pub use queue::{PendingQueue, QueueStats};
pub use worker_pool::{PoolError, PoolStats, WorkerContext, WorkerPool, WorkerPoolConfig};

/// Routes cancel requests to the token of the worker currently executing a
/// job. Entries exist only while a job is actually running.
#[derive(Default)]
pub struct CancelRegistry {
    tokens: Mutex<HashMap<Uuid, CancelToken>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the token for a job entering execution.
    pub fn register(&self, job_id: Uuid, token: CancelToken) {
        self.tokens
            .lock()
            .expect("cancel registry lock poisoned")
            .insert(job_id, token);
    }

    /// Drops the token once execution ends.
    pub fn remove(&self, job_id: Uuid) {
        self.tokens
            .lock()
            .expect("cancel registry lock poisoned")
            .remove(&job_id);
    }

    /// Signals the executing worker, if any. Returns whether a token was
    /// found; the worker acknowledges at its next checkpoint.
    pub fn cancel(&self, job_id: Uuid) -> bool {
        let tokens = self.tokens.lock().expect("cancel registry lock poisoned");
        match tokens.get(&job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_registry_routes_to_token() {
        let registry = CancelRegistry::new();
        let id = Uuid::new_v4();
        let token = CancelToken::new();

        assert!(!registry.cancel(id));

        registry.register(id, token.clone());
        assert!(registry.cancel(id));
        assert!(token.is_cancelled());

        registry.remove(id);
        assert!(!registry.cancel(id));
    }
}
