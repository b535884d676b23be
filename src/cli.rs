//! Command-line interface for foldq.
//!
//! Two commands: `solve` runs one conformational search in the foreground
//! and prints the result; `demo` drives the full engine (queue, workers,
//! event streams) against an in-memory store.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use futures::StreamExt;
use tracing::info;

use crate::config::EngineConfig;
use crate::engine::FoldEngine;
use crate::notifier::StreamEvent;
use crate::solver::{
    solver_for, Algorithm, CancelToken, SolveContext, SolveRequest, SolverParams,
};
use crate::store::{JobStatus, MemoryStore};

/// HP-lattice protein folding job engine.
#[derive(Parser)]
#[command(name = "foldq")]
#[command(about = "Run HP-lattice conformational searches, standalone or through the job engine")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run one solver in the foreground and print the best conformation.
    Solve(SolveArgs),

    /// Run the full engine against an in-memory store and stream events.
    Demo(DemoArgs),
}

/// Arguments for `foldq solve`.
#[derive(Parser, Debug)]
pub struct SolveArgs {
    /// HP sequence, e.g. HPHPPHHPHH.
    #[arg(short, long)]
    pub sequence: String,

    /// Search algorithm (monte-carlo, simulated-annealing, genetic-algorithm,
    /// evolution-strategies, evolutionary-programming).
    #[arg(short, long, default_value = "simulated-annealing")]
    pub algorithm: String,

    /// Iteration budget (generations for population variants).
    #[arg(short, long, default_value = "10000")]
    pub iterations: u64,

    /// Population size for the evolutionary variants.
    #[arg(short, long, default_value = "50")]
    pub population_size: usize,

    /// RNG seed for a reproducible run.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Starting conformation as a move string (e.g. URRD).
    #[arg(long)]
    pub initial_moves: Option<String>,

    /// Print the full result as JSON instead of a summary.
    #[arg(short, long)]
    pub json: bool,
}

/// Arguments for `foldq demo`.
#[derive(Parser, Debug)]
pub struct DemoArgs {
    /// HP sequence every demo job folds.
    #[arg(short, long, default_value = "HPHPPHHPHPPHPHHPPHPH")]
    pub sequence: String,

    /// Number of jobs to submit.
    #[arg(short = 'n', long, default_value = "4")]
    pub count: usize,

    /// Number of engine workers.
    #[arg(short, long, default_value = "2")]
    pub workers: usize,

    /// Iteration budget per job.
    #[arg(short, long, default_value = "20000")]
    pub iterations: u64,
}

/// Parses command-line arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Runs a parsed CLI invocation.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Solve(args) => run_solve(args).await,
        Commands::Demo(args) => run_demo(args).await,
    }
}

async fn run_solve(args: SolveArgs) -> anyhow::Result<()> {
    let algorithm = Algorithm::parse(&args.algorithm)
        .with_context(|| format!("unknown algorithm '{}'", args.algorithm))?;

    let params = SolverParams {
        iterations: args.iterations,
        population_size: args.population_size,
        seed: args.seed,
        initial_moves: args.initial_moves.clone(),
        ..Default::default()
    };

    let request = SolveRequest::new(&args.sequence, algorithm, params)?;
    let solver = match solver_for(algorithm) {
        Some(solver) => solver,
        None => bail!(
            "'{algorithm}' delegates to an external service; run it through the job engine"
        ),
    };

    info!(algorithm = %algorithm, sequence = %args.sequence, "Starting solve");

    let ctx = SolveContext::new(CancelToken::new());
    let outcome = tokio::task::spawn_blocking(move || solver.solve(&request, &ctx))
        .await
        .context("solver task panicked")??;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    println!("sequence:   {}", args.sequence);
    println!("algorithm:  {algorithm}");
    println!("moves:      {}", outcome.best.moves_string());
    println!("energy:     {}", outcome.best.energy);
    println!("iterations: {}", outcome.total_iterations);
    println!("elapsed:    {} ms", outcome.elapsed_ms);
    println!("stopped:    {:?}", outcome.stop_reason);

    Ok(())
}

async fn run_demo(args: DemoArgs) -> anyhow::Result<()> {
    let algorithms = [
        Algorithm::MonteCarlo,
        Algorithm::SimulatedAnnealing,
        Algorithm::GeneticAlgorithm,
        Algorithm::EvolutionStrategies,
    ];

    let config = EngineConfig::default()
        .with_num_workers(args.workers)
        .with_poll_interval(Duration::from_millis(100));
    config.validate()?;

    let engine = Arc::new(FoldEngine::new(config, Arc::new(MemoryStore::new())));
    engine.start().await?;

    let owner = "demo";
    let mut stream = engine.subscribe(owner).await;

    let mut job_ids = Vec::new();
    for i in 0..args.count {
        let algorithm = algorithms[i % algorithms.len()];
        let params = SolverParams {
            iterations: args.iterations,
            seed: Some(1000 + i as u64),
            ..Default::default()
        };
        let receipt = engine
            .submit(owner, algorithm, &args.sequence, params, 0)
            .await?;
        println!("submitted {} ({algorithm})", receipt.job_id);
        job_ids.push(receipt.job_id);
    }

    let mut remaining = job_ids.len();
    while remaining > 0 {
        match stream.next().await {
            Some(StreamEvent::JobUpdate(view)) => {
                println!(
                    "job {} -> {} ({}%)",
                    view.job_id, view.status, view.progress
                );
                if view.status.is_terminal() {
                    if let Some(result) = &view.result {
                        println!(
                            "  best energy {} with moves {}",
                            result.energy,
                            result.best.moves_string()
                        );
                    }
                    remaining -= 1;
                }
            }
            Some(StreamEvent::Connected { .. }) => println!("stream connected"),
            Some(StreamEvent::Heartbeat { .. }) => {}
            Some(StreamEvent::Error { message }) => println!("stream error: {message}"),
            None => bail!("event stream closed before all jobs finished"),
        }
    }

    // Every record should now be terminal.
    for id in &job_ids {
        let view = engine
            .status(*id)
            .await?
            .with_context(|| format!("job {id} missing from store"))?;
        if view.status != JobStatus::Completed {
            bail!("job {id} ended {} instead of completed", view.status);
        }
    }

    let stats = engine.pool_stats().await;
    println!(
        "done: {} completed, {} failed, avg {} ms",
        stats.jobs_completed,
        stats.jobs_failed,
        stats.average_job_duration.as_millis()
    );

    engine.stop().await?;
    Ok(())
}
