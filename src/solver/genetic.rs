//! Genetic algorithm over move sequences.
//!
//! Also home to the population primitives (initialization, tournament
//! selection, per-gene mutation) shared with the other evolutionary
//! variants in `evolution.rs`.

use std::time::Instant;

use rand::RngExt;
use rand_chacha::ChaCha8Rng;

use super::{
    history_interval, make_rng, propose_mutation, random_moves, report_interval, EnergySample,
    SolveContext, SolveOutcome, SolveRequest, Solver, SolverError, SolverProgress, StopReason,
};
use crate::model::{Conformation, Direction, Residue, DIRECTIONS};

/// Number of elite individuals copied unchanged into the next generation.
const ELITE_COUNT: usize = 2;

/// Tournament size for parent selection.
const TOURNAMENT_SIZE: usize = 3;

/// Builds the initial population.
///
/// Slot 0 is always a feasible anchor (the starting conformation, or the
/// straight line when the supplied start self-intersects, in which case the
/// supplied start still joins the population); the rest are random walks,
/// feasible or not.
pub(crate) fn init_population(
    request: &SolveRequest,
    size: usize,
    rng: &mut ChaCha8Rng,
) -> Vec<Conformation> {
    let sequence = &request.sequence;
    let move_count = sequence.len() - 1;
    let start = request.starting_conformation();

    let mut population = Vec::with_capacity(size);
    if start.is_feasible() {
        population.push(start);
    } else {
        population.push(straight_line(sequence));
        population.push(start);
    }
    while population.len() < size {
        let moves = random_moves(move_count, rng);
        population.push(
            Conformation::new(sequence.clone(), moves)
                .expect("random moves match sequence length"),
        );
    }
    population.truncate(size);
    population
}

fn straight_line(sequence: &[Residue]) -> Conformation {
    Conformation::new(sequence.to_vec(), vec![Direction::Right; sequence.len() - 1])
        .expect("straight line matches sequence length")
}

/// Tournament selection: the lowest-energy of `TOURNAMENT_SIZE` random
/// entrants wins. Infinite energies lose against anything finite.
pub(crate) fn tournament<'a>(
    population: &'a [Conformation],
    rng: &mut ChaCha8Rng,
) -> &'a Conformation {
    let mut winner = &population[rng.random_range(0..population.len())];
    for _ in 1..TOURNAMENT_SIZE {
        let challenger = &population[rng.random_range(0..population.len())];
        if challenger.energy < winner.energy {
            winner = challenger;
        }
    }
    winner
}

/// Mutates each move independently with probability `rate`. When no gene
/// drew a mutation, one random gene is flipped to a different direction so
/// offspring never equal their parent.
pub(crate) fn mutate_moves(moves: &mut [Direction], rate: f64, rng: &mut ChaCha8Rng) {
    let mut changed = false;
    for m in moves.iter_mut() {
        if rng.random::<f64>() < rate {
            *m = DIRECTIONS[rng.random_range(0..DIRECTIONS.len())];
            changed = true;
        }
    }
    if !changed {
        let (index, direction) = propose_mutation(moves, rng);
        moves[index] = direction;
    }
}

/// Returns the best feasible individual, if the population has one.
pub(crate) fn best_feasible(population: &[Conformation]) -> Option<&Conformation> {
    population
        .iter()
        .filter(|c| c.is_feasible())
        .min_by(|a, b| a.energy.total_cmp(&b.energy))
}

/// Generational GA: elitism, tournament selection, single-point crossover of
/// move sequences, per-gene mutation, survival by energy.
pub struct GeneticAlgorithm;

impl Solver for GeneticAlgorithm {
    fn solve(
        &self,
        request: &SolveRequest,
        ctx: &SolveContext,
    ) -> Result<SolveOutcome, SolverError> {
        let started = Instant::now();
        let params = &request.params;
        let generations = params.iterations;
        let mut rng = make_rng(params.seed);

        let mut population = init_population(request, params.population_size, &mut rng);
        let mut best = best_feasible(&population)
            .cloned()
            .unwrap_or_else(|| straight_line(&request.sequence));

        let report_every = report_interval(generations);
        let history_every = history_interval(generations);
        let mut history = Vec::new();
        let mut stop_reason = StopReason::BudgetExhausted;
        let mut executed = 0;

        for generation in 1..=generations {
            // A generation does population-size work, so every generation is
            // a checkpoint.
            if let Some(reason) = ctx.checkpoint() {
                stop_reason = reason;
                break;
            }

            population.sort_by(|a, b| a.energy.total_cmp(&b.energy));

            let mut next = Vec::with_capacity(population.len());
            next.extend(population.iter().take(ELITE_COUNT).cloned());

            while next.len() < population.len() {
                let parent_a = tournament(&population, &mut rng);
                let parent_b = tournament(&population, &mut rng);

                let mut child_moves = if rng.random::<f64>() < params.crossover_rate {
                    let cut = rng.random_range(1..parent_a.moves.len().max(2));
                    let cut = cut.min(parent_a.moves.len() - 1).max(1);
                    let mut moves = parent_a.moves[..cut].to_vec();
                    moves.extend_from_slice(&parent_b.moves[cut..]);
                    moves
                } else if parent_a.energy <= parent_b.energy {
                    parent_a.moves.clone()
                } else {
                    parent_b.moves.clone()
                };

                mutate_moves(&mut child_moves, params.mutation_rate, &mut rng);
                next.push(
                    Conformation::new(request.sequence.clone(), child_moves)
                        .expect("crossover preserves move count"),
                );
            }
            population = next;

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

    fn request(sequence: &str, params: SolverParams) -> SolveRequest {
        SolveRequest::new(sequence, Algorithm::GeneticAlgorithm, params).expect("valid request")
    }

    #[test]
    fn test_population_always_has_feasible_anchor() {
        let mut rng = make_rng(Some(8));
        let req = request(
            "HHHH",
            SolverParams {
                initial_moves: Some("UDU".to_string()), // self-intersecting
                ..Default::default()
            },
        );
        let population = init_population(&req, 10, &mut rng);
        assert_eq!(population.len(), 10);
        assert!(population.iter().any(|c| c.is_feasible()));
    }

    #[test]
    fn test_mutate_moves_always_changes_something() {
        let mut rng = make_rng(Some(9));
        for _ in 0..50 {
            let mut moves = vec![Direction::Up, Direction::Right, Direction::Down];
            let original = moves.clone();
            mutate_moves(&mut moves, 0.0, &mut rng);
            // Rate 0 still flips exactly one gene, always to a different
            // direction.
            assert_ne!(moves, original);
            let differing = moves
                .iter()
                .zip(&original)
                .filter(|(a, b)| a != b)
                .count();
            assert_eq!(differing, 1);
        }
    }

    #[test]
    fn test_ga_best_is_feasible() {
        let req = request(
            "HHPHHPHHPH",
            SolverParams {
                iterations: 200,
                population_size: 30,
                seed: Some(17),
                ..Default::default()
            },
        );
        let outcome = GeneticAlgorithm
            .solve(&req, &SolveContext::new(CancelToken::new()))
            .unwrap();
        assert!(outcome.best.is_feasible());
        assert!(outcome.best.energy <= 0.0);
        assert_eq!(outcome.total_iterations, 200);
    }

    #[test]
    fn test_ga_improves_on_straight_line_for_rich_sequence() {
        let req = request(
            "HHHHHHHH",
            SolverParams {
                iterations: 300,
                population_size: 40,
                seed: Some(23),
                ..Default::default()
            },
        );
        let outcome = GeneticAlgorithm
            .solve(&req, &SolveContext::new(CancelToken::new()))
            .unwrap();
        // All-H length 8 admits several contacts; the GA should find at
        // least one.
        assert!(outcome.best.energy <= -1.0);
    }

    #[test]
    fn test_ga_seeded_reproducibility() {
        let params = SolverParams {
            iterations: 100,
            population_size: 20,
            seed: Some(31),
            ..Default::default()
        };
        let req = request("HHPPHHPP", params);
        let a = GeneticAlgorithm
            .solve(&req, &SolveContext::new(CancelToken::new()))
            .unwrap();
        let b = GeneticAlgorithm
            .solve(&req, &SolveContext::new(CancelToken::new()))
            .unwrap();
        assert_eq!(a.best.moves, b.best.moves);
        assert_eq!(a.energy_history, b.energy_history);
    }

    #[test]
    fn test_ga_cancellation() {
        let token = CancelToken::new();
        token.cancel();
        let req = request(
            "HHPH",
            SolverParams {
                iterations: 100_000,
                population_size: 10,
                seed: Some(4),
                ..Default::default()
            },
        );
        let outcome = GeneticAlgorithm
            .solve(&req, &SolveContext::new(token))
            .unwrap();
        assert!(outcome.is_cancelled());
        assert_eq!(outcome.total_iterations, 0);
    }
}
