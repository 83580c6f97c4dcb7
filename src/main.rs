use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use trove_sim::config::SimConfig;
use trove_sim::error::{SimError, SimResult};
use trove_sim::historical;
use trove_sim::monte_carlo::{self, MonteCarlo};
use trove_sim::output::{self, CsvSink, PeriodRow};
use trove_sim::simulation::Simulation;

#[derive(Parser)]
#[command(name = "trove-sim", about = "Agent-based stress simulator for a trove-backed stablecoin")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the simulation and write the per-period table
    Run {
        /// Parameter bundle (.toml, or .json)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override the number of periods
        #[arg(long)]
        periods: Option<u64>,

        /// Override the seed
        #[arg(long)]
        seed: Option<u64>,

        /// Output table CSV
        #[arg(long, default_value = "output/simulation.csv")]
        output: PathBuf,

        /// Replay a recorded collateral price path instead of the random walk
        #[arg(long)]
        prices: Option<PathBuf>,

        /// Split each recorded price interval into this many periods
        #[arg(long, default_value = "1")]
        interpolate: usize,

        /// Number of seeds to run; more than one writes one table per seed
        #[arg(long, default_value = "1")]
        runs: usize,
    },
}

fn progress_bar(len: u64) -> ProgressBar {
    let pb = ProgressBar::new(len);
    if let Ok(style) = ProgressStyle::with_template("{bar:40} {pos}/{len} [{elapsed_precise}] {msg}") {
        pb.set_style(style);
    }
    pb
}

fn load_prices(path: &Path, interpolate: usize, initial: f64) -> SimResult<Vec<f64>> {
    let raw = historical::load_price_path(path)?;
    let prices = historical::rebase(&historical::interpolate(&raw, interpolate), initial);
    info!(path = %path.display(), points = prices.len(), "loaded price path");
    Ok(prices)
}

fn run_single(config: SimConfig, prices: Option<Vec<f64>>, output: &Path) -> SimResult<()> {
    let mut sim = Simulation::new(config.clone())?;
    if let Some(prices) = prices {
        sim = sim.with_price_path(prices)?;
    }

    let pb = progress_bar(sim.periods());
    let mut sink = (CsvSink::create(output)?, Vec::<PeriodRow>::new());
    while sim.step(&mut sink)?.is_some() {
        pb.inc(1);
    }
    pb.finish_with_message("done");

    output::save_config_toml(&config, &output.with_extension("toml"))?;
    if let Some(summary) = output::compute_summary(&sink.1) {
        output::save_summary_json(&summary, &output.with_extension("summary.json"))?;
        println!("\n=== Run Summary (seed {}) ===", config.seed);
        println!("Periods:                {}", summary.periods);
        println!(
            "Stablecoin price:       mean {:.4}  min {:.4}  max {:.4}  final {:.4}",
            summary.mean_stable_price, summary.min_stable_price, summary.max_stable_price, summary.final_stable_price
        );
        println!("Troves:                 max {}  final {}", summary.max_troves, summary.final_troves);
        println!("Min TCR:                {:.4}", summary.min_tcr);
        println!("Recovery-mode periods:  {}", summary.recovery_periods);
        println!("Collateral liquidated:  {:.2} of {:.2} added", summary.total_coll_liquidated, summary.total_coll_added);
        println!("Stablecoin redeemed:    {:.2}", summary.total_stable_redeemed);
    }
    println!("\nTable written to {}", output.display());
    Ok(())
}

fn run_batch(config: SimConfig, prices: Option<Vec<f64>>, output: &Path, runs: usize) -> SimResult<()> {
    let mut mc = MonteCarlo::new(config, runs);
    mc.output = Some(output.to_path_buf());
    mc.prices = prices;

    let pb = progress_bar(runs as u64);
    let outcomes = mc.run(Some(&pb));
    pb.finish_with_message("done");

    for o in &outcomes {
        match (&o.summary, &o.error) {
            (_, Some(e)) => println!("seed {:>6}  FAILED  {}", o.seed, e),
            (Some(s), None) => println!(
                "seed {:>6}  min {:.4}  max {:.4}  liquidated {:.2}%  redeemed {:.2}",
                o.seed,
                s.min_stable_price,
                s.max_stable_price,
                s.liquidated_share() * 100.0,
                s.total_stable_redeemed
            ),
            (None, None) => println!("seed {:>6}  no periods", o.seed),
        }
    }

    let batch = monte_carlo::summarize(&outcomes);
    println!("\n=== Batch Summary ({} runs, {} failed) ===", batch.runs, batch.failed);
    println!("Min stablecoin price:   p5 {:.4}  median {:.4}", batch.min_stable_price_p5, batch.min_stable_price_median);
    println!("Max stablecoin price:   p95 {:.4}", batch.max_stable_price_p95);
    println!("Liquidated share:       {:.2}%", batch.mean_liquidated_share * 100.0);
    println!("Recovery-mode runs:     {:.1}%", batch.recovery_run_share * 100.0);

    if batch.failed > 0 {
        return Err(SimError::BatchFailed {
            failed: batch.failed,
            runs: batch.runs,
        });
    }
    Ok(())
}

fn run(cli: Cli) -> SimResult<()> {
    match cli.command {
        Commands::Run {
            config,
            periods,
            seed,
            output,
            prices,
            interpolate,
            runs,
        } => {
            let mut cfg = match config {
                Some(path) => SimConfig::load(&path)?,
                None => SimConfig::default(),
            };
            if let Some(p) = periods {
                cfg.periods = p;
            }
            if let Some(s) = seed {
                cfg.seed = s;
            }
            cfg.validate()?;

            let prices = match prices {
                Some(path) => Some(load_prices(&path, interpolate, cfg.collateral_price.initial)?),
                None => None,
            };

            info!(periods = cfg.periods, seed = cfg.seed, accounts = cfg.accounts, runs, "starting");
            if runs > 1 {
                run_batch(cfg, prices, &output, runs)
            } else {
                run_single(cfg, prices, &output)
            }
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "run failed");
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
