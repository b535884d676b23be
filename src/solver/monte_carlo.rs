//! Fixed-temperature Metropolis Monte Carlo search.

use std::time::Instant;

use super::{
    history_interval, make_rng, metropolis_accept, propose_mutation, report_interval,
    EnergySample, SolveContext, SolveOutcome, SolveRequest, Solver, SolverError, SolverProgress,
    StopReason, CHECKPOINT_INTERVAL,
};
use crate::model::{Conformation, Direction};

/// Single-chain Monte Carlo: mutate one randomly chosen move per iteration,
/// accept by the Metropolis criterion at a fixed temperature, and track the
/// best-ever conformation separately from the current one.
pub struct MonteCarlo;

impl Solver for MonteCarlo {
    fn solve(
        &self,
        request: &SolveRequest,
        ctx: &SolveContext,
    ) -> Result<SolveOutcome, SolverError> {
        let started = Instant::now();
        let params = &request.params;
        let total = params.iterations;
        let mut rng = make_rng(params.seed);

        let mut current = request.starting_conformation();
        // The best slot must never hold an infeasible fold. A supplied
        // starting conformation may self-intersect; seed best with the
        // straight line in that case.
        let mut best = if current.is_feasible() {
            current.clone()
        } else {
            Conformation::new(
                request.sequence.clone(),
                vec![Direction::Right; request.sequence.len() - 1],
            )
            .expect("straight line matches sequence length")
        };

        let report_every = report_interval(total);
        let history_every = history_interval(total);
        let mut history = Vec::new();
        let mut stop_reason = StopReason::BudgetExhausted;
        let mut executed = 0;

        for iteration in 1..=total {
            if iteration % CHECKPOINT_INTERVAL == 0 {
                if let Some(reason) = ctx.checkpoint() {
                    stop_reason = reason;
                    break;
                }
            }

            let current_energy = current.energy;
            let (index, direction) = propose_mutation(&current.moves, &mut rng);
            let previous = current.moves[index];
            current.moves[index] = direction;
            current.refold();

            if metropolis_accept(current_energy, current.energy, params.temperature, &mut rng) {
                if current.energy < best.energy {
                    best = current.clone();
                }
            } else {
                current.moves[index] = previous;
                current.refold();
            }

            executed = iteration;

            if iteration % history_every == 0 {
                history.push(EnergySample {
                    iteration,
                    current_energy: current.energy,
                    best_energy: best.energy,
                    temperature: None,
                });
            }
            if iteration % report_every == 0 {
                ctx.report(SolverProgress {
                    iteration,
                    current_energy: current.energy,
                    best_energy: best.energy,
                });
            }
        }

        Ok(SolveOutcome {
            best,
            energy_history: history,
            total_iterations: executed,
            elapsed_ms: started.elapsed().as_millis() as u64,
            stop_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::{Algorithm, CancelToken, SolverParams};

    fn request(sequence: &str, params: SolverParams) -> SolveRequest {
        SolveRequest::new(sequence, Algorithm::MonteCarlo, params).expect("valid request")
    }

    #[test]
    fn test_best_is_always_feasible() {
        let req = request(
            "HHPHHPHH",
            SolverParams {
                iterations: 5_000,
                seed: Some(42),
                ..Default::default()
            },
        );
        let ctx = SolveContext::new(CancelToken::new());
        let outcome = MonteCarlo.solve(&req, &ctx).unwrap();

        assert!(outcome.best.is_feasible());
        assert!(outcome.best.energy <= 0.0);
        assert_eq!(outcome.stop_reason, StopReason::BudgetExhausted);
        assert_eq!(outcome.total_iterations, 5_000);
    }

    #[test]
    fn test_seeded_runs_are_reproducible() {
        let params = SolverParams {
            iterations: 2_000,
            seed: Some(99),
            ..Default::default()
        };
        let req = request("HHPPHHPPHH", params);
        let a = MonteCarlo
            .solve(&req, &SolveContext::new(CancelToken::new()))
            .unwrap();
        let b = MonteCarlo
            .solve(&req, &SolveContext::new(CancelToken::new()))
            .unwrap();

        assert_eq!(a.best.moves, b.best.moves);
        assert_eq!(a.best.energy, b.best.energy);
        assert_eq!(a.energy_history, b.energy_history);
    }

    #[test]
    fn test_finds_a_contact_for_foldable_sequence() {
        // HHHH can reach -1 with a U-turn; a few thousand iterations find it.
        let req = request(
            "HHHH",
            SolverParams {
                iterations: 5_000,
                seed: Some(7),
                ..Default::default()
            },
        );
        let outcome = MonteCarlo
            .solve(&req, &SolveContext::new(CancelToken::new()))
            .unwrap();
        assert!(outcome.best.energy <= -1.0);
    }

    #[test]
    fn test_cancellation_stops_at_checkpoint() {
        let token = CancelToken::new();
        token.cancel();
        let req = request(
            "HHPH",
            SolverParams {
                iterations: 1_000_000,
                seed: Some(1),
                ..Default::default()
            },
        );
        let outcome = MonteCarlo
            .solve(&req, &SolveContext::new(token))
            .unwrap();
        assert!(outcome.is_cancelled());
        assert!(outcome.total_iterations < CHECKPOINT_INTERVAL);
    }

    #[test]
    fn test_infeasible_start_never_reported_as_best() {
        // U then D revisits the origin.
        let req = request(
            "HHH",
            SolverParams {
                iterations: 10,
                seed: Some(5),
                initial_moves: Some("UD".to_string()),
                ..Default::default()
            },
        );
        let outcome = MonteCarlo
            .solve(&req, &SolveContext::new(CancelToken::new()))
            .unwrap();
        assert!(outcome.best.is_feasible());
    }

    #[test]
    fn test_history_samples_are_bounded() {
        let req = request(
            "HPHPHP",
            SolverParams {
                iterations: 10_000,
                seed: Some(11),
                ..Default::default()
            },
        );
        let outcome = MonteCarlo
            .solve(&req, &SolveContext::new(CancelToken::new()))
            .unwrap();
        assert!(!outcome.energy_history.is_empty());
        assert!(outcome.energy_history.len() <= 200);
        // Best-so-far column is non-increasing.
        for pair in outcome.energy_history.windows(2) {
            assert!(pair[1].best_energy <= pair[0].best_energy);
        }
    }
}
