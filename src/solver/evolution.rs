//! Evolution strategies and evolutionary programming variants.
//!
//! Both reuse the population primitives from `genetic.rs` but differ in how
//! the next generation is formed: ES uses (mu + lambda) truncation survival
//! with mutation-only offspring; EP pits parents and offspring against
//! random opponents and keeps the tournament winners.

use std::time::Instant;

use rand::RngExt;
use rand_chacha::ChaCha8Rng;

use super::genetic::{best_feasible, init_population, mutate_moves};
use super::{
    history_interval, make_rng, report_interval, EnergySample, SolveContext, SolveOutcome,
    SolveRequest, Solver, SolverError, SolverProgress, StopReason,
};
use crate::model::{Conformation, Direction, Residue};

/// Opponents drawn per candidate in the EP survival tournament.
const EP_OPPONENTS: usize = 4;

fn straight_line(sequence: &[Residue]) -> Conformation {
    Conformation::new(sequence.to_vec(), vec![Direction::Right; sequence.len() - 1])
        .expect("straight line matches sequence length")
}

fn mutated_child(
    parent: &Conformation,
    rate: f64,
    rng: &mut ChaCha8Rng,
) -> Conformation {
    let mut moves = parent.moves.clone();
    mutate_moves(&mut moves, rate, rng);
    Conformation::new(parent.sequence.clone(), moves)
        .expect("mutation preserves move count")
}

/// (mu + lambda) evolution strategies: mu parents survive truncation
/// selection over the union of parents and lambda mutated offspring.
pub struct EvolutionStrategies;

impl Solver for EvolutionStrategies {
    fn solve(
        &self,
        request: &SolveRequest,
        ctx: &SolveContext,
    ) -> Result<SolveOutcome, SolverError> {
        let started = Instant::now();
        let params = &request.params;
        let generations = params.iterations;
        let mut rng = make_rng(params.seed);

        let mu = (params.population_size / 2).max(1);
        let lambda = params.population_size;

        let mut parents = init_population(request, mu, &mut rng);
        let mut best = best_feasible(&parents)
            .cloned()
            .unwrap_or_else(|| straight_line(&request.sequence));

        let report_every = report_interval(generations);
        let history_every = history_interval(generations);
        let mut history = Vec::new();
        let mut stop_reason = StopReason::BudgetExhausted;
        let mut executed = 0;

        for generation in 1..=generations {
            if let Some(reason) = ctx.checkpoint() {
                stop_reason = reason;
                break;
            }

            let mut pool = parents.clone();
            for _ in 0..lambda {
                let parent = &parents[rng.random_range(0..parents.len())];
                pool.push(mutated_child(parent, params.mutation_rate, &mut rng));
            }

            pool.sort_by(|a, b| a.energy.total_cmp(&b.energy));
            pool.truncate(mu);
            parents = pool;

            if let Some(candidate) = best_feasible(&parents) {
                if candidate.energy < best.energy {
                    best = candidate.clone();
                }
            }

            executed = generation;
            let current_energy = parents[0].energy;

            if generation % history_every == 0 {
                history.push(EnergySample {
                    iteration: generation,
                    current_energy,
                    best_energy: best.energy,
                    temperature: None,
                });
            }
            if generation % report_every == 0 {
                ctx.report(SolverProgress {
                    iteration: generation,
                    current_energy,
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

/// Evolutionary programming: every parent spawns one mutated offspring, then
/// each candidate scores wins against random opponents and the highest
/// scorers survive.
pub struct EvolutionaryProgramming;

impl Solver for EvolutionaryProgramming {
    fn solve(
        &self,
        request: &SolveRequest,
        ctx: &SolveContext,
    ) -> Result<SolveOutcome, SolverError> {
        let started = Instant::now();
        let params = &request.params;
        let generations = params.iterations;
        let mut rng = make_rng(params.seed);
        let size = params.population_size;

        let mut population = init_population(request, size, &mut rng);
        let mut best = best_feasible(&population)
            .cloned()
            .unwrap_or_else(|| straight_line(&request.sequence));

        let report_every = report_interval(generations);
        let history_every = history_interval(generations);
        let mut history = Vec::new();
        let mut stop_reason = StopReason::BudgetExhausted;
        let mut executed = 0;

        for generation in 1..=generations {
            if let Some(reason) = ctx.checkpoint() {
                stop_reason = reason;
                break;
            }

            let mut pool = population.clone();
            for parent in &population {
                pool.push(mutated_child(parent, params.mutation_rate, &mut rng));
            }

            // Stochastic survival: count wins against random opponents, keep
            // the top half by (wins, energy).
            let mut scored: Vec<(usize, usize)> = (0..pool.len())
                .map(|i| {
                    let wins = (0..EP_OPPONENTS)
                        .filter(|_| {
                            let opponent = rng.random_range(0..pool.len());
                            pool[i].energy <= pool[opponent].energy
                        })
                        .count();
                    (wins, i)
                })
                .collect();
            scored.sort_by(|a, b| {
                b.0.cmp(&a.0)
                    .then_with(|| pool[a.1].energy.total_cmp(&pool[b.1].energy))
            });
            population = scored
                .into_iter()
                .take(size)
                .map(|(_, i)| pool[i].clone())
                .collect();

            if let Some(candidate) = best_feasible(&population) {
                if candidate.energy < best.energy {
                    best = candidate.clone();
                }
            }

            executed = generation;
            let current_energy = population
                .iter()
                .map(|c| c.energy)
                .fold(f64::INFINITY, f64::min);

            if generation % history_every == 0 {
                history.push(EnergySample {
                    iteration: generation,
                    current_energy,
                    best_energy: best.energy,
                    temperature: None,
                });
            }
            if generation % report_every == 0 {
                ctx.report(SolverProgress {
                    iteration: generation,
                    current_energy,
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

    fn request(algorithm: Algorithm, sequence: &str, params: SolverParams) -> SolveRequest {
        SolveRequest::new(sequence, algorithm, params).expect("valid request")
    }

    #[test]
    fn test_es_best_is_feasible() {
        let req = request(
            Algorithm::EvolutionStrategies,
            "HHPHHPHH",
            SolverParams {
                iterations: 200,
                population_size: 20,
                seed: Some(51),
                ..Default::default()
            },
        );
        let outcome = EvolutionStrategies
            .solve(&req, &SolveContext::new(CancelToken::new()))
            .unwrap();
        assert!(outcome.best.is_feasible());
        assert!(outcome.best.energy <= 0.0);
    }

    #[test]
    fn test_ep_best_is_feasible() {
        let req = request(
            Algorithm::EvolutionaryProgramming,
            "HHPHHPHH",
            SolverParams {
                iterations: 200,
                population_size: 20,
                seed: Some(52),
                ..Default::default()
            },
        );
        let outcome = EvolutionaryProgramming
            .solve(&req, &SolveContext::new(CancelToken::new()))
            .unwrap();
        assert!(outcome.best.is_feasible());
        assert!(outcome.best.energy <= 0.0);
    }

    #[test]
    fn test_es_seeded_reproducibility() {
        let params = SolverParams {
            iterations: 100,
            population_size: 16,
            seed: Some(61),
            ..Default::default()
        };
        let req = request(Algorithm::EvolutionStrategies, "HHPPHHPP", params);
        let a = EvolutionStrategies
            .solve(&req, &SolveContext::new(CancelToken::new()))
            .unwrap();
        let b = EvolutionStrategies
            .solve(&req, &SolveContext::new(CancelToken::new()))
            .unwrap();
        assert_eq!(a.best.moves, b.best.moves);
        assert_eq!(a.energy_history, b.energy_history);
    }

    #[test]
    fn test_ep_seeded_reproducibility() {
        let params = SolverParams {
            iterations: 100,
            population_size: 16,
            seed: Some(62),
            ..Default::default()
        };
        let req = request(Algorithm::EvolutionaryProgramming, "HHPPHHPP", params);
        let a = EvolutionaryProgramming
            .solve(&req, &SolveContext::new(CancelToken::new()))
            .unwrap();
        let b = EvolutionaryProgramming
            .solve(&req, &SolveContext::new(CancelToken::new()))
            .unwrap();
        assert_eq!(a.best.moves, b.best.moves);
    }

    #[test]
    fn test_es_cancellation() {
        let token = CancelToken::new();
        token.cancel();
        let req = request(
            Algorithm::EvolutionStrategies,
            "HHPH",
            SolverParams {
                iterations: 100_000,
                population_size: 8,
                seed: Some(5),
                ..Default::default()
            },
        );
        let outcome = EvolutionStrategies
            .solve(&req, &SolveContext::new(token))
            .unwrap();
        assert!(outcome.is_cancelled());
    }
}
