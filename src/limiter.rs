//! Fixed-window rate limiting for job submission.
//!
//! Two policies apply per submitting identifier: a general cap on all
//! submissions and a much stricter cap on the expensive algorithm class
//! (Rosetta delegations occupy the external service for a long time). A
//! window is created lazily on first use and expires in place; a rejected
//! submission does not consume quota.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// One named rate-limit policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatePolicy {
    pub name: String,
    /// Submissions allowed per window.
    pub max_requests: u32,
    /// Window length.
    pub window: Duration,
}

impl RatePolicy {
    pub fn new(name: impl Into<String>, max_requests: u32, window: Duration) -> Self {
        Self {
            name: name.into(),
            max_requests: max_requests.max(1),
            window,
        }
    }

    /// The default cap on all submissions: 10 per minute.
    pub fn general() -> Self {
        Self::new("general", 10, Duration::from_secs(60))
    }

    /// The cap on the expensive algorithm class: 3 per hour.
    pub fn expensive() -> Self {
        Self::new("expensive", 3, Duration::from_secs(3600))
    }

    fn window_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::MAX)
    }
}

/// Outcome of a rate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Quota left in the current window after this decision.
    pub remaining: u32,
    /// When the current window ends.
    pub reset_at: DateTime<Utc>,
}

struct Window {
    count: u32,
    reset_at: DateTime<Utc>,
}

/// Fixed-window counter keyed by (identifier, policy name).
#[derive(Default)]
pub struct RateLimiter {
    windows: Mutex<HashMap<(String, String), Window>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks and, if allowed, consumes one unit of quota.
    pub fn check(&self, identifier: &str, policy: &RatePolicy) -> RateDecision {
        self.check_at(identifier, policy, Utc::now())
    }

    fn check_at(&self, identifier: &str, policy: &RatePolicy, now: DateTime<Utc>) -> RateDecision {
        let key = (identifier.to_string(), policy.name.clone());
        let mut windows = self.windows.lock().expect("rate limiter lock poisoned");

        let window = windows.entry(key).or_insert_with(|| Window {
            count: 0,
            reset_at: now + policy.window_chrono(),
        });

        // Lazy expiry: a stale window restarts on first touch.
        if now >= window.reset_at {
            window.count = 0;
            window.reset_at = now + policy.window_chrono();
        }

        if window.count >= policy.max_requests {
            return RateDecision {
                allowed: false,
                remaining: 0,
                reset_at: window.reset_at,
            };
        }

        window.count += 1;
        RateDecision {
            allowed: true,
            remaining: policy.max_requests - window.count,
            reset_at: window.reset_at,
        }
    }

    /// Drops windows that have fully expired. The limiter works without this
    /// (expiry is lazy); sweeping just bounds the map size.
    pub fn sweep_expired(&self) {
        let now = Utc::now();
        self.windows
            .lock()
            .expect("rate limiter lock poisoned")
            .retain(|_, w| now < w.reset_at);
    }

    /// Number of live windows, for observability.
    pub fn window_count(&self) -> usize {
        self.windows.lock().expect("rate limiter lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_policy(max: u32) -> RatePolicy {
        RatePolicy::new("test", max, Duration::from_secs(60))
    }

    #[test]
    fn test_allows_up_to_limit_then_rejects() {
        let limiter = RateLimiter::new();
        let policy = tiny_policy(3);

        for expected_remaining in [2, 1, 0] {
            let decision = limiter.check("alice", &policy);
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
        }

        let decision = limiter.check("alice", &policy);
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert!(decision.reset_at > Utc::now());
    }

    #[test]
    fn test_identifiers_are_independent() {
        let limiter = RateLimiter::new();
        let policy = tiny_policy(1);

        assert!(limiter.check("alice", &policy).allowed);
        assert!(limiter.check("bob", &policy).allowed);
        assert!(!limiter.check("alice", &policy).allowed);
    }

    #[test]
    fn test_policies_are_independent() {
        let limiter = RateLimiter::new();
        let general = RatePolicy::general();
        let expensive = RatePolicy::expensive();

        for _ in 0..3 {
            assert!(limiter.check("alice", &expensive).allowed);
        }
        assert!(!limiter.check("alice", &expensive).allowed);
        // The general policy still has quota.
        assert!(limiter.check("alice", &general).allowed);
    }

    #[test]
    fn test_window_expiry_restores_quota() {
        let limiter = RateLimiter::new();
        let policy = tiny_policy(1);
        let start = Utc::now();

        assert!(limiter.check_at("alice", &policy, start).allowed);
        assert!(!limiter.check_at("alice", &policy, start).allowed);

        let later = start + chrono::Duration::seconds(61);
        let decision = limiter.check_at("alice", &policy, later);
        assert!(decision.allowed);
        assert!(decision.reset_at > later);
    }

    #[test]
    fn test_rejection_does_not_consume_quota() {
        let limiter = RateLimiter::new();
        let policy = tiny_policy(1);
        let start = Utc::now();

        assert!(limiter.check_at("alice", &policy, start).allowed);
        for _ in 0..5 {
            assert!(!limiter.check_at("alice", &policy, start).allowed);
        }

        // After expiry there is exactly one unit again, proving rejections
        // never advanced the count past the cap.
        let later = start + chrono::Duration::seconds(61);
        assert!(limiter.check_at("alice", &policy, later).allowed);
        assert!(!limiter.check_at("alice", &policy, later).allowed);
    }

    #[test]
    fn test_sweep_drops_only_expired_windows() {
        let limiter = RateLimiter::new();
        let expired = RatePolicy::new("expired", 1, Duration::ZERO);
        let live = tiny_policy(1);

        limiter.check("alice", &expired);
        limiter.check("alice", &live);
        assert_eq!(limiter.window_count(), 2);

        limiter.sweep_expired();
        assert_eq!(limiter.window_count(), 1);
    }

    #[test]
    fn test_default_policies() {
        let general = RatePolicy::general();
        assert_eq!(general.max_requests, 10);
        assert_eq!(general.window, Duration::from_secs(60));

        let expensive = RatePolicy::expensive();
        assert_eq!(expensive.max_requests, 3);
        assert_eq!(expensive.window, Duration::from_secs(3600));
    }
}
