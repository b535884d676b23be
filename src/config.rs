//! Engine configuration.

use std::time::Duration;

use thiserror::Error;

use crate::limiter::RatePolicy;
use crate::retention::RetentionPolicy;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("Invalid environment variable {name}: {reason}")]
    InvalidEnv { name: String, reason: String },
}

/// Top-level engine configuration.
///
/// Every knob has a sensible default; `from_env` layers `FOLDQ_*` overrides
/// on top.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of executor workers.
    pub num_workers: usize,
    /// Worker wait on an empty queue between shutdown checks.
    pub poll_interval: Duration,
    /// Executor attempts per job before FAILED.
    pub max_attempts: u32,
    /// Base delay of the exponential retry backoff.
    pub retry_base_delay: Duration,
    /// Optional wall-clock ceiling per solver run.
    pub job_deadline: Option<Duration>,
    /// Interval between stream heartbeats.
    pub heartbeat_interval: Duration,
    /// Interval between retention sweeps.
    pub sweep_interval: Duration,
    /// Retention thresholds.
    pub retention: RetentionPolicy,
    /// Rate limit on all submissions.
    pub general_policy: RatePolicy,
    /// Rate limit on the expensive algorithm class.
    pub expensive_policy: RatePolicy,
    /// Base URL of the external Rosetta service; `None` disables delegation.
    pub rosetta_url: Option<String>,
    /// Rosetta status poll interval.
    pub rosetta_poll_interval: Duration,
    /// Per-owner event channel capacity.
    pub event_capacity: usize,
    /// PostgreSQL connection URL; `None` selects the in-memory store.
    pub database_url: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            poll_interval: Duration::from_secs(1),
            max_attempts: 3,
            retry_base_delay: Duration::from_secs(5),
            job_deadline: None,
            heartbeat_interval: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(3600),
            retention: RetentionPolicy::default(),
            general_policy: RatePolicy::general(),
            expensive_policy: RatePolicy::expensive(),
            rosetta_url: None,
            rosetta_poll_interval: Duration::from_secs(2),
            event_capacity: 64,
            database_url: None,
        }
    }
}

impl EngineConfig {
    /// Builds a config from defaults plus `FOLDQ_*` environment overrides:
    /// `FOLDQ_NUM_WORKERS`, `FOLDQ_MAX_ATTEMPTS`, `FOLDQ_ROSETTA_URL`,
    /// `FOLDQ_DATABASE_URL`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(raw) = std::env::var("FOLDQ_NUM_WORKERS") {
            config.num_workers = raw.parse().map_err(|e| ConfigError::InvalidEnv {
                name: "FOLDQ_NUM_WORKERS".to_string(),
                reason: format!("{e}"),
            })?;
        }
        if let Ok(raw) = std::env::var("FOLDQ_MAX_ATTEMPTS") {
            config.max_attempts = raw.parse().map_err(|e| ConfigError::InvalidEnv {
                name: "FOLDQ_MAX_ATTEMPTS".to_string(),
                reason: format!("{e}"),
            })?;
        }
        if let Ok(url) = std::env::var("FOLDQ_ROSETTA_URL") {
            config.rosetta_url = Some(url);
        }
        if let Ok(url) = std::env::var("FOLDQ_DATABASE_URL") {
            config.database_url = Some(url);
        }

        config.validate()?;
        Ok(config)
    }

    /// Sets the worker count.
    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Sets the queue poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the attempt budget.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
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

    /// Sets the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the retention sweep interval.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Sets the retention policy.
    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    /// Sets the general submission rate policy.
    pub fn with_general_policy(mut self, policy: RatePolicy) -> Self {
        self.general_policy = policy;
        self
    }

    /// Sets the expensive-class rate policy.
    pub fn with_expensive_policy(mut self, policy: RatePolicy) -> Self {
        self.expensive_policy = policy;
        self
    }

    /// Enables Rosetta delegation against the given service URL.
    pub fn with_rosetta_url(mut self, url: impl Into<String>) -> Self {
        self.rosetta_url = Some(url.into());
        self
    }

    /// Selects the PostgreSQL store.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    /// Sets the per-owner event channel capacity.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Validates field sanity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "num_workers",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "event_capacity",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "poll_interval",
                reason: "must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.num_workers, 4);
        assert_eq!(config.max_attempts, 3);
        assert!(config.rosetta_url.is_none());
        assert!(config.database_url.is_none());
    }

    #[test]
    fn test_builder_chain() {
        let config = EngineConfig::default()
            .with_num_workers(2)
            .with_max_attempts(5)
            .with_job_deadline(Duration::from_secs(300))
            .with_rosetta_url("http://rosetta:8000")
            .with_event_capacity(128);

        assert_eq!(config.num_workers, 2);
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.job_deadline, Some(Duration::from_secs(300)));
        assert_eq!(config.rosetta_url.as_deref(), Some("http://rosetta:8000"));
        assert_eq!(config.event_capacity, 128);
    }

    #[test]
    fn test_validation_rejects_zero_workers() {
        let config = EngineConfig::default().with_num_workers(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "num_workers",
                ..
            })
        ));
    }

    #[test]
    fn test_validation_rejects_zero_attempts() {
        let config = EngineConfig::default().with_max_attempts(0);
        assert!(config.validate().is_err());
    }
}
