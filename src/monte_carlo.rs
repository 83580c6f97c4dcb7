//! Multi-seed runs.
//!
//! Seed `k` of a batch runs with `config.seed + k`, on its own rayon task,
//! with its own protocol instance. Each run writes its table to
//! `<stem>_seed<seed>.<ext>` when an output path is given.

use std::path::{Path, PathBuf};

use indicatif::ProgressBar;
use rayon::prelude::*;
use serde::Serialize;
use tracing::warn;

use crate::config::SimConfig;
use crate::error::SimResult;
use crate::output::{compute_summary, CsvSink, PeriodRow, RunSummary};
use crate::simulation::Simulation;

/// Outcome of one seed in a batch.
#[derive(Debug, Clone)]
pub struct SeedOutcome {
    pub seed: u64,
    pub summary: Option<RunSummary>,
    pub error: Option<String>,
}

/// Cross-seed statistics.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub runs: usize,
    pub failed: usize,
    pub min_stable_price_p5: f64,
    pub min_stable_price_median: f64,
    pub max_stable_price_p95: f64,
    pub mean_liquidated_share: f64,
    pub mean_stable_redeemed: f64,
    pub recovery_run_share: f64,
}

pub struct MonteCarlo {
    pub config: SimConfig,
    pub runs: usize,
    pub output: Option<PathBuf>,
    pub prices: Option<Vec<f64>>,
}

/// `out/run.csv` + seed 7 -> `out/run_seed7.csv`.
pub fn seed_path(base: &Path, seed: u64) -> PathBuf {
    let stem = base.file_stem().and_then(|s| s.to_str()).unwrap_or("run");
    let name = match base.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}_seed{}.{}", stem, seed, ext),
        None => format!("{}_seed{}", stem, seed),
    };
    base.with_file_name(name)
}

impl MonteCarlo {
    pub fn new(config: SimConfig, runs: usize) -> Self {
        MonteCarlo {
            config,
            runs,
            output: None,
            prices: None,
        }
    }

    pub fn seeds(&self) -> Vec<u64> {
        (0..self.runs as u64).map(|k| self.config.seed.wrapping_add(k)).collect()
    }

    fn run_seed(&self, seed: u64) -> SimResult<Vec<PeriodRow>> {
        let mut config = self.config.clone();
        config.seed = seed;
        let mut sim = Simulation::new(config)?;
        if let Some(prices) = &self.prices {
            sim = sim.with_price_path(prices.clone())?;
        }

        let mut rows: Vec<PeriodRow> = Vec::new();
        match &self.output {
            Some(base) => {
                let mut sink = (CsvSink::create(&seed_path(base, seed))?, rows);
                sim.run(&mut sink)?;
                rows = sink.1;
            }
            None => {
                sim.run(&mut rows)?;
            }
        }
        Ok(rows)
    }

    /// Run every seed in parallel. A failed seed is reported, not fatal to the batch.
    pub fn run(&self, progress: Option<&ProgressBar>) -> Vec<SeedOutcome> {
        self.seeds()
            .par_iter()
            .map(|&seed| {
                let outcome = match self.run_seed(seed) {
                    Ok(rows) => SeedOutcome {
                        seed,
                        summary: compute_summary(&rows),
                        error: None,
                    },
                    Err(e) => {
                        warn!(seed, error = %e, "run aborted");
                        SeedOutcome {
                            seed,
                            summary: None,
                            error: Some(e.to_string()),
                        }
                    }
                };
                if let Some(pb) = progress {
                    pb.inc(1);
                }
                outcome
            })
            .collect()
    }
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() - 1) as f64 * p).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn sorted(mut values: Vec<f64>) -> Vec<f64> {
    values.sort_by(|a, b| a.total_cmp(b));
    values
}

pub fn summarize(outcomes: &[SeedOutcome]) -> BatchSummary {
    let done: Vec<&RunSummary> = outcomes.iter().filter_map(|o| o.summary.as_ref()).collect();
    let n = done.len().max(1) as f64;
    let mins = sorted(done.iter().map(|s| s.min_stable_price).collect());
    let maxs = sorted(done.iter().map(|s| s.max_stable_price).collect());

    BatchSummary {
        runs: outcomes.len(),
        failed: outcomes.iter().filter(|o| o.error.is_some()).count(),
        min_stable_price_p5: percentile(&mins, 0.05),
        min_stable_price_median: percentile(&mins, 0.5),
        max_stable_price_p95: percentile(&maxs, 0.95),
        mean_liquidated_share: done.iter().map(|s| s.liquidated_share()).sum::<f64>() / n,
        mean_stable_redeemed: done.iter().map(|s| s.total_stable_redeemed).sum::<f64>() / n,
        recovery_run_share: done.iter().filter(|s| s.recovery_periods > 0).count() as f64 / n,
    }
}
