//! Crate-level error types.
//!
//! Subsystems with their own failure modes (queue, store, worker pool,
//! solver, config) define errors next to their code; this module holds the
//! errors shared across the submission path:
//!
//! - `ValidationError`: bad input rejected before a job exists
//! - `SubmitError`: everything the submit operation can surface to a caller

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors for inputs rejected synchronously, before a Job record is created.
///
/// Validation failures are never retried.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Sequence must contain at least 2 residues, got {length}")]
    SequenceTooShort { length: usize },

    #[error("Invalid residue '{symbol}': sequence alphabet is {{H, P}}")]
    InvalidResidue { symbol: char },

    #[error("Initial moves must have sequence length - 1 entries: expected {expected}, got {actual}")]
    MoveCountMismatch { expected: usize, actual: usize },

    #[error("Invalid lattice direction '{symbol}': move alphabet is {{U, D, L, R}}")]
    InvalidDirection { symbol: char },

    #[error("Iteration budget must be positive")]
    ZeroIterations,

    #[error("Population size must be at least 2, got {size}")]
    PopulationTooSmall { size: usize },

    #[error("Temperature schedule invalid: initial {initial} must be >= final {final_}, both positive")]
    InvalidTemperatureSchedule { initial: f64, final_: f64 },
}

/// Errors surfaced by the submit operation.
///
/// Validation and capacity rejections are local and immediate; once a job is
/// accepted, failures are recorded on the durable record and reach callers
/// only through status polling or the event stream.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Rate limit exceeded for '{identifier}' under policy '{policy}'; retry after {reset_at}")]
    RateLimited {
        identifier: String,
        policy: String,
        remaining: u32,
        reset_at: DateTime<Utc>,
    },

    #[error("Submission backend unavailable: {0}")]
    Backend(String),
}
