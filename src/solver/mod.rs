//! Conformational-search solver engine.
//!
//! One `Solver` contract shared by every algorithm variant:
//!
//! - **MonteCarlo**: Metropolis acceptance at a fixed temperature
//! - **SimulatedAnnealing**: exponential temperature decay schedule
//! - **GeneticAlgorithm / EvolutionStrategies / EvolutionaryProgramming**:
//!   population search over move sequences
//! - **Rosetta**: delegation to the external long-running service (async,
//!   handled by `rosetta::RosettaClient` rather than the sync trait)
//!
//! Solvers run synchronously inside a worker. Each loop evaluates a
//! cooperative checkpoint at a fixed iteration interval where cancellation
//! and the optional wall-clock ceiling take effect, and reports progress at
//! an algorithm-defined cadence so notification volume stays bounded.
//!
//! Self-intersecting candidates are compared as energy +infinity and are
//! never installed as the current or best state; they are not errors.

pub mod annealing;
pub mod evolution;
pub mod genetic;
pub mod monte_carlo;
pub mod rosetta;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::RngExt;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ValidationError;
use crate::model::{Conformation, Direction, Residue, DIRECTIONS};
use crate::model::conformation::parse_sequence;

pub use annealing::SimulatedAnnealing;
pub use evolution::{EvolutionStrategies, EvolutionaryProgramming};
pub use genetic::GeneticAlgorithm;
pub use monte_carlo::MonteCarlo;
pub use rosetta::{RosettaClient, RosettaError};

/// How often (in iterations) solver loops poll the cancellation token and
/// wall-clock ceiling. Bounds cancellation latency without slowing the loop.
pub const CHECKPOINT_INTERVAL: u64 = 128;

/// The algorithm selected at submission time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    MonteCarlo,
    SimulatedAnnealing,
    GeneticAlgorithm,
    EvolutionStrategies,
    EvolutionaryProgramming,
    /// Delegates to the external Rosetta service.
    Rosetta,
}

impl Algorithm {
    /// Whether this algorithm belongs to the expensive class gated by the
    /// strict rate-limit policy and given the longest retention.
    pub fn is_expensive(self) -> bool {
        matches!(self, Algorithm::Rosetta)
    }

    /// Whether this variant maintains a population rather than a single
    /// current conformation.
    pub fn is_population_based(self) -> bool {
        matches!(
            self,
            Algorithm::GeneticAlgorithm
                | Algorithm::EvolutionStrategies
                | Algorithm::EvolutionaryProgramming
        )
    }

    /// Kebab-case name, matching the wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Algorithm::MonteCarlo => "monte-carlo",
            Algorithm::SimulatedAnnealing => "simulated-annealing",
            Algorithm::GeneticAlgorithm => "genetic-algorithm",
            Algorithm::EvolutionStrategies => "evolution-strategies",
            Algorithm::EvolutionaryProgramming => "evolutionary-programming",
            Algorithm::Rosetta => "rosetta",
        }
    }

    /// Parses the kebab-case name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "monte-carlo" => Some(Algorithm::MonteCarlo),
            "simulated-annealing" => Some(Algorithm::SimulatedAnnealing),
            "genetic-algorithm" => Some(Algorithm::GeneticAlgorithm),
            "evolution-strategies" => Some(Algorithm::EvolutionStrategies),
            "evolutionary-programming" => Some(Algorithm::EvolutionaryProgramming),
            "rosetta" => Some(Algorithm::Rosetta),
            _ => None,
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Free-form algorithm parameters supplied at submission.
///
/// Every field has a default so callers only set what they care about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverParams {
    /// Iteration budget (generations, for population variants).
    pub iterations: u64,
    /// Population size for the evolutionary variants.
    pub population_size: usize,
    /// Fixed temperature for Monte Carlo.
    pub temperature: f64,
    /// Annealing schedule start.
    pub initial_temperature: f64,
    /// Annealing schedule floor; the run may stop early once reached.
    pub final_temperature: f64,
    /// Per-gene mutation probability for population variants.
    pub mutation_rate: f64,
    /// Crossover probability for the genetic algorithm.
    pub crossover_rate: f64,
    /// Explicit seed; a seeded run is exactly reproducible.
    pub seed: Option<u64>,
    /// Optional starting conformation as a move string (e.g. "URRD").
    pub initial_moves: Option<String>,
}

impl Default for SolverParams {
    fn default() -> Self {
        Self {
            iterations: 10_000,
            population_size: 50,
            temperature: 1.0,
            initial_temperature: 2.0,
            final_temperature: 0.05,
            mutation_rate: 0.05,
            crossover_rate: 0.8,
            seed: None,
            initial_moves: None,
        }
    }
}

impl SolverParams {
    /// Validates parameter sanity for the given algorithm.
    pub fn validate(&self, algorithm: Algorithm) -> Result<(), ValidationError> {
        if self.iterations == 0 {
            return Err(ValidationError::ZeroIterations);
        }
        if algorithm.is_population_based() && self.population_size < 2 {
            return Err(ValidationError::PopulationTooSmall {
                size: self.population_size,
            });
        }
        if algorithm == Algorithm::SimulatedAnnealing
            && (self.initial_temperature < self.final_temperature
                || self.final_temperature <= 0.0)
        {
            return Err(ValidationError::InvalidTemperatureSchedule {
                initial: self.initial_temperature,
                final_: self.final_temperature,
            });
        }
        Ok(())
    }
}

/// A validated solve request: parsed sequence, parameters, and optional
/// starting moves. Construction is the fail-fast validation gate; no solver
/// iterates before these checks pass.
#[derive(Debug, Clone)]
pub struct SolveRequest {
    pub sequence: Vec<Residue>,
    pub params: SolverParams,
    pub initial: Option<Vec<Direction>>,
}

impl SolveRequest {
    /// Validates and builds a request from raw submission inputs.
    pub fn new(
        sequence: &str,
        algorithm: Algorithm,
        params: SolverParams,
    ) -> Result<Self, ValidationError> {
        let residues = parse_sequence(sequence)?;
        params.validate(algorithm)?;

        let initial = match &params.initial_moves {
            Some(raw) => {
                let moves: Result<Vec<Direction>, ValidationError> = raw
                    .chars()
                    .map(|c| {
                        Direction::from_char(c)
                            .ok_or(ValidationError::InvalidDirection { symbol: c })
                    })
                    .collect();
                let moves = moves?;
                if moves.len() != residues.len() - 1 {
                    return Err(ValidationError::MoveCountMismatch {
                        expected: residues.len() - 1,
                        actual: moves.len(),
                    });
                }
                Some(moves)
            }
            None => None,
        };

        Ok(Self {
            sequence: residues,
            params,
            initial,
        })
    }

    /// The starting conformation for single-point solvers: the supplied
    /// initial moves, or a straight line (always feasible) when none were
    /// given.
    pub fn starting_conformation(&self) -> Conformation {
        let moves = self
            .initial
            .clone()
            .unwrap_or_else(|| vec![Direction::Right; self.sequence.len() - 1]);
        Conformation::new(self.sequence.clone(), moves)
            .expect("move count checked at request construction")
    }
}

/// A cooperative cancellation token polled at solver checkpoints.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation; the solver stops at its next checkpoint.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Progress snapshot passed to the worker's callback.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolverProgress {
    pub iteration: u64,
    pub current_energy: f64,
    pub best_energy: f64,
}

/// Callback invoked at the progress cadence.
pub type ProgressFn = dyn Fn(SolverProgress) + Send + Sync;

/// Execution context handed to a solver by the worker.
pub struct SolveContext {
    progress: Option<Box<ProgressFn>>,
    cancel: CancelToken,
    deadline: Option<Instant>,
}

impl SolveContext {
    pub fn new(cancel: CancelToken) -> Self {
        Self {
            progress: None,
            cancel,
            deadline: None,
        }
    }

    /// Installs the progress callback.
    pub fn with_progress(mut self, f: impl Fn(SolverProgress) + Send + Sync + 'static) -> Self {
        self.progress = Some(Box::new(f));
        self
    }

    /// Sets an optional wall-clock ceiling, enforced at checkpoints.
    pub fn with_deadline(mut self, ceiling: Duration) -> Self {
        self.deadline = Some(Instant::now() + ceiling);
        self
    }

    /// Checkpoint: returns the stop reason if the run must end now.
    pub fn checkpoint(&self) -> Option<StopReason> {
        if self.cancel.is_cancelled() {
            return Some(StopReason::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Some(StopReason::DeadlineReached);
            }
        }
        None
    }

    /// Reports progress if a callback is installed.
    pub fn report(&self, progress: SolverProgress) {
        if let Some(f) = &self.progress {
            f(progress);
        }
    }
}

/// Why a solver run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Iteration budget exhausted.
    BudgetExhausted,
    /// Annealing temperature fell below the floor.
    TemperatureFloor,
    /// Cancellation acknowledged at a checkpoint.
    Cancelled,
    /// Wall-clock ceiling hit at a checkpoint.
    DeadlineReached,
}

/// One energy-history sample. Sampled at a fixed interval, not every
/// iteration, to bound memory.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnergySample {
    pub iteration: u64,
    pub current_energy: f64,
    pub best_energy: f64,
    /// Present for annealing runs only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

/// Result of a solver run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolveOutcome {
    /// Best feasible conformation observed. Never self-intersecting.
    pub best: Conformation,
    /// Sampled energy trajectory.
    pub energy_history: Vec<EnergySample>,
    /// Iterations actually executed.
    pub total_iterations: u64,
    /// Wall time of the run in milliseconds.
    pub elapsed_ms: u64,
    /// Why the run ended.
    pub stop_reason: StopReason,
}

impl SolveOutcome {
    /// Whether the run ended by cancellation.
    pub fn is_cancelled(&self) -> bool {
        self.stop_reason == StopReason::Cancelled
    }
}

/// Errors a solver run can raise. Infeasible conformations are not errors;
/// they are rejected candidates inside the acceptance logic.
#[derive(Debug, Error)]
pub enum SolverError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Solver internal error: {0}")]
    Internal(String),
}

/// The common contract across in-process algorithm variants.
pub trait Solver: Send + Sync {
    fn solve(&self, request: &SolveRequest, ctx: &SolveContext) -> Result<SolveOutcome, SolverError>;
}

/// Selects the in-process solver for an algorithm.
///
/// Returns `None` for `Rosetta`, which runs through the async
/// `RosettaClient` instead of the sync trait.
pub fn solver_for(algorithm: Algorithm) -> Option<Box<dyn Solver>> {
    match algorithm {
        Algorithm::MonteCarlo => Some(Box::new(MonteCarlo)),
        Algorithm::SimulatedAnnealing => Some(Box::new(SimulatedAnnealing)),
        Algorithm::GeneticAlgorithm => Some(Box::new(GeneticAlgorithm)),
        Algorithm::EvolutionStrategies => Some(Box::new(EvolutionStrategies)),
        Algorithm::EvolutionaryProgramming => Some(Box::new(EvolutionaryProgramming)),
        Algorithm::Rosetta => None,
    }
}

// ---------------------------------------------------------------------------
// Shared search primitives (free functions, used by every variant)
// ---------------------------------------------------------------------------

/// Builds the run RNG. Seeded runs are exactly reproducible; unseeded runs
/// draw a fresh seed from the thread RNG.
pub(crate) fn make_rng(seed: Option<u64>) -> ChaCha8Rng {
    use rand::SeedableRng;
    let seed = seed.unwrap_or_else(|| rand::rng().random());
    ChaCha8Rng::seed_from_u64(seed)
}

/// Picks a random move index and a random *different* direction for it.
pub(crate) fn propose_mutation(
    moves: &[Direction],
    rng: &mut ChaCha8Rng,
) -> (usize, Direction) {
    let index = rng.random_range(0..moves.len());
    loop {
        let direction = DIRECTIONS[rng.random_range(0..DIRECTIONS.len())];
        if direction != moves[index] {
            return (index, direction);
        }
    }
}

/// Metropolis acceptance: accept if the candidate does not increase energy,
/// otherwise with probability exp((current - candidate) / temperature).
/// Infeasible candidates (+infinity) are never accepted.
pub(crate) fn metropolis_accept(
    current_energy: f64,
    candidate_energy: f64,
    temperature: f64,
    rng: &mut ChaCha8Rng,
) -> bool {
    if candidate_energy.is_infinite() {
        return false;
    }
    if candidate_energy <= current_energy {
        return true;
    }
    let p = ((current_energy - candidate_energy) / temperature).exp();
    rng.random::<f64>() < p
}

/// Uniform random move sequence of the given length.
pub(crate) fn random_moves(len: usize, rng: &mut ChaCha8Rng) -> Vec<Direction> {
    (0..len)
        .map(|_| DIRECTIONS[rng.random_range(0..DIRECTIONS.len())])
        .collect()
}

/// History sampling interval for an iteration budget.
pub(crate) fn history_interval(iterations: u64) -> u64 {
    (iterations / 200).max(1)
}

/// Progress reporting interval for an iteration budget.
pub(crate) fn report_interval(iterations: u64) -> u64 {
    (iterations / 100).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algorithm_roundtrip() {
        for algo in [
            Algorithm::MonteCarlo,
            Algorithm::SimulatedAnnealing,
            Algorithm::GeneticAlgorithm,
            Algorithm::EvolutionStrategies,
            Algorithm::EvolutionaryProgramming,
            Algorithm::Rosetta,
        ] {
            assert_eq!(Algorithm::parse(algo.as_str()), Some(algo));
        }
        assert_eq!(Algorithm::parse("quantum"), None);
    }

    #[test]
    fn test_algorithm_serde_kebab_case() {
        let json = serde_json::to_string(&Algorithm::SimulatedAnnealing).unwrap();
        assert_eq!(json, "\"simulated-annealing\"");
    }

    #[test]
    fn test_expensive_class() {
        assert!(Algorithm::Rosetta.is_expensive());
        assert!(!Algorithm::MonteCarlo.is_expensive());
        assert!(!Algorithm::GeneticAlgorithm.is_expensive());
    }

    #[test]
    fn test_request_validation_rejects_bad_sequence() {
        let err = SolveRequest::new("HX", Algorithm::MonteCarlo, SolverParams::default())
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidResidue { symbol: 'X' }));
    }

    #[test]
    fn test_request_validation_rejects_bad_initial_moves() {
        let params = SolverParams {
            initial_moves: Some("UQ".to_string()),
            ..Default::default()
        };
        let err = SolveRequest::new("HHH", Algorithm::MonteCarlo, params).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidDirection { symbol: 'Q' }));

        let params = SolverParams {
            initial_moves: Some("U".to_string()),
            ..Default::default()
        };
        let err = SolveRequest::new("HHHH", Algorithm::MonteCarlo, params).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::MoveCountMismatch {
                expected: 3,
                actual: 1
            }
        ));
    }

    #[test]
    fn test_request_validation_rejects_bad_params() {
        let params = SolverParams {
            iterations: 0,
            ..Default::default()
        };
        assert!(SolveRequest::new("HHH", Algorithm::MonteCarlo, params).is_err());

        let params = SolverParams {
            population_size: 1,
            ..Default::default()
        };
        assert!(SolveRequest::new("HHH", Algorithm::GeneticAlgorithm, params).is_err());
        // Population size only matters for population variants.
        let params = SolverParams {
            population_size: 1,
            ..Default::default()
        };
        assert!(SolveRequest::new("HHH", Algorithm::MonteCarlo, params).is_ok());

        let params = SolverParams {
            initial_temperature: 0.1,
            final_temperature: 1.0,
            ..Default::default()
        };
        assert!(SolveRequest::new("HHH", Algorithm::SimulatedAnnealing, params).is_err());
    }

    #[test]
    fn test_starting_conformation_defaults_to_straight_line() {
        let request =
            SolveRequest::new("HPHP", Algorithm::MonteCarlo, SolverParams::default()).unwrap();
        let start = request.starting_conformation();
        assert!(start.is_feasible());
        assert_eq!(start.moves_string(), "RRR");
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_checkpoint_reports_cancellation() {
        let token = CancelToken::new();
        let ctx = SolveContext::new(token.clone());
        assert_eq!(ctx.checkpoint(), None);
        token.cancel();
        assert_eq!(ctx.checkpoint(), Some(StopReason::Cancelled));
    }

    #[test]
    fn test_checkpoint_reports_deadline() {
        let ctx = SolveContext::new(CancelToken::new()).with_deadline(Duration::ZERO);
        assert_eq!(ctx.checkpoint(), Some(StopReason::DeadlineReached));
    }

    #[test]
    fn test_metropolis_never_accepts_infeasible() {
        let mut rng = make_rng(Some(7));
        for _ in 0..100 {
            assert!(!metropolis_accept(0.0, f64::INFINITY, 10.0, &mut rng));
        }
    }

    #[test]
    fn test_metropolis_accepts_downhill() {
        let mut rng = make_rng(Some(7));
        assert!(metropolis_accept(-1.0, -2.0, 0.001, &mut rng));
        assert!(metropolis_accept(-1.0, -1.0, 0.001, &mut rng));
    }

    #[test]
    fn test_propose_mutation_changes_direction() {
        let mut rng = make_rng(Some(3));
        let moves = vec![Direction::Up, Direction::Right, Direction::Down];
        for _ in 0..50 {
            let (index, direction) = propose_mutation(&moves, &mut rng);
            assert!(index < moves.len());
            assert_ne!(direction, moves[index]);
        }
    }

    #[test]
    fn test_intervals_never_zero() {
        assert_eq!(history_interval(1), 1);
        assert_eq!(report_interval(5), 1);
        assert_eq!(history_interval(2000), 10);
        assert_eq!(report_interval(2000), 20);
    }
}
