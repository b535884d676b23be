//! Simulated annealing with an exponential cooling schedule.

use std::time::Instant;

use super::{
    history_interval, make_rng, metropolis_accept, propose_mutation, report_interval,
    EnergySample, SolveContext, SolveOutcome, SolveRequest, Solver, SolverError, SolverProgress,
    StopReason, CHECKPOINT_INTERVAL,
};
use crate::model::{Conformation, Direction};

/// Same move generation and Metropolis rule as Monte Carlo, but the
/// temperature decays exponentially from `initial_temperature` toward
/// `final_temperature` over the iteration budget. The run terminates early
/// once the temperature falls below the floor.
pub struct SimulatedAnnealing;

impl Solver for SimulatedAnnealing {
    fn solve(
        &self,
        request: &SolveRequest,
        ctx: &SolveContext,
    ) -> Result<SolveOutcome, SolverError> {
        let started = Instant::now();
        let params = &request.params;
        let total = params.iterations;
        let mut rng = make_rng(params.seed);

        // Per-iteration decay factor such that T reaches the floor at the
        // end of the budget: T_k = T0 * alpha^k with alpha = (Tf/T0)^(1/n).
        let alpha = if params.initial_temperature > params.final_temperature {
            (params.final_temperature / params.initial_temperature).powf(1.0 / total as f64)
        } else {
            1.0
        };
        let mut temperature = params.initial_temperature;

        let mut current = request.starting_conformation();
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
            if temperature < params.final_temperature {
                stop_reason = StopReason::TemperatureFloor;
                break;
            }

            let current_energy = current.energy;
            let (index, direction) = propose_mutation(&current.moves, &mut rng);
            let previous = current.moves[index];
            current.moves[index] = direction;
            current.refold();

            if metropolis_accept(current_energy, current.energy, temperature, &mut rng) {
                if current.energy < best.energy {
                    best = current.clone();
                }
            } else {
                current.moves[index] = previous;
                current.refold();
            }

            temperature *= alpha;
            executed = iteration;

            if iteration % history_every == 0 {
                history.push(EnergySample {
                    iteration,
                    current_energy: current.energy,
                    best_energy: best.energy,
                    temperature: Some(temperature),
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
        SolveRequest::new(sequence, Algorithm::SimulatedAnnealing, params).expect("valid request")
    }

    #[test]
    fn test_annealed_best_is_feasible_and_nonpositive() {
        let req = request(
            "HHPHPHHPHH",
            SolverParams {
                iterations: 8_000,
                seed: Some(13),
                ..Default::default()
            },
        );
        let outcome = SimulatedAnnealing
            .solve(&req, &SolveContext::new(CancelToken::new()))
            .unwrap();
        assert!(outcome.best.is_feasible());
        assert!(outcome.best.energy <= 0.0);
    }

    #[test]
    fn test_history_records_decaying_temperature() {
        let req = request(
            "HHHHHH",
            SolverParams {
                iterations: 4_000,
                seed: Some(21),
                initial_temperature: 3.0,
                final_temperature: 0.1,
                ..Default::default()
            },
        );
        let outcome = SimulatedAnnealing
            .solve(&req, &SolveContext::new(CancelToken::new()))
            .unwrap();

        let temps: Vec<f64> = outcome
            .energy_history
            .iter()
            .map(|s| s.temperature.expect("annealing samples carry temperature"))
            .collect();
        assert!(temps.len() >= 2);
        for pair in temps.windows(2) {
            assert!(pair[1] < pair[0]);
        }
    }

    #[test]
    fn test_seeded_annealing_is_reproducible() {
        let params = SolverParams {
            iterations: 3_000,
            seed: Some(404),
            ..Default::default()
        };
        let req = request("HHPPHHPPHH", params);
        let a = SimulatedAnnealing
            .solve(&req, &SolveContext::new(CancelToken::new()))
            .unwrap();
        let b = SimulatedAnnealing
            .solve(&req, &SolveContext::new(CancelToken::new()))
            .unwrap();
        assert_eq!(a.best.moves, b.best.moves);
        assert_eq!(a.energy_history, b.energy_history);
    }

    #[test]
    fn test_cancellation_stops_at_checkpoint() {
        let token = CancelToken::new();
        token.cancel();
        let req = request(
            "HHPH",
            SolverParams {
                iterations: 500_000,
                seed: Some(2),
                ..Default::default()
            },
        );
        let outcome = SimulatedAnnealing
            .solve(&req, &SolveContext::new(token))
            .unwrap();
        assert!(outcome.is_cancelled());
    }

    #[test]
    fn test_flat_schedule_runs_full_budget() {
        // initial == final keeps alpha at 1.0; the floor is never crossed.
        let req = request(
            "HPHP",
            SolverParams {
                iterations: 1_000,
                seed: Some(3),
                initial_temperature: 1.0,
                final_temperature: 1.0,
                ..Default::default()
            },
        );
        let outcome = SimulatedAnnealing
            .solve(&req, &SolveContext::new(CancelToken::new()))
            .unwrap();
        assert_eq!(outcome.stop_reason, StopReason::BudgetExhausted);
        assert_eq!(outcome.total_iterations, 1_000);
    }
}
