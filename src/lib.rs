//! foldq: an asynchronous job engine for HP-lattice protein folding.
//!
//! Submissions run conformational searches over the 2D hydrophobic-polar
//! lattice model. Jobs are validated up front, rate limited per submitter,
//! queued by priority, and executed by a worker pool running one of several
//! search algorithms (or delegating to an external Rosetta service).
//! Lifecycle updates stream to subscribers per owner, and terminal records
//! age out under a retention policy.
//!
//! `FoldEngine` is the entry point:
//!
//! ```no_run
//! use std::sync::Arc;
//! use foldq::config::EngineConfig;
//! use foldq::engine::FoldEngine;
//! use foldq::solver::{Algorithm, SolverParams};
//! use foldq::store::MemoryStore;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let engine = FoldEngine::new(EngineConfig::default(), Arc::new(MemoryStore::new()));
//! engine.start().await?;
//!
//! let receipt = engine
//!     .submit(
//!         "alice",
//!         Algorithm::SimulatedAnnealing,
//!         "HPHPPHHPHH",
//!         SolverParams::default(),
//!         0,
//!     )
//!     .await?;
//! let status = engine.status(receipt.job_id).await?;
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod limiter;
pub mod model;
pub mod notifier;
pub mod retention;
pub mod scheduler;
pub mod solver;
pub mod store;

pub use config::EngineConfig;
pub use engine::{CancelOutcome, FoldEngine, SubmitReceipt};
pub use error::{SubmitError, ValidationError};
pub use model::{Conformation, Direction, Residue};
pub use solver::{Algorithm, SolverParams, StopReason};
pub use store::{FoldResult, JobStatus, JobView};
