use std::fs::File;
use std::io::Write;
use std::path::Path;

use serde::Serialize;

use crate::config::SimConfig;
use crate::error::SimResult;

/// Column order of the per-period table.
pub const COLUMNS: [&str; 15] = [
    "iteration",
    "collateral_price",
    "stable_price",
    "reward_price",
    "num_troves",
    "total_coll",
    "total_debt",
    "tcr",
    "recovery_mode",
    "last_icr",
    "sp_stable",
    "sp_collateral",
    "total_coll_added",
    "total_coll_liquidated",
    "total_stable_redeemed",
];

/// One row of the per-period table, written after the period completes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeriodRow {
    pub iteration: u64,
    pub collateral_price: f64,
    pub stable_price: f64,
    pub reward_price: f64,
    pub num_troves: usize,
    pub total_coll: f64,
    pub total_debt: f64,
    pub tcr: f64,
    pub recovery_mode: bool,
    pub last_icr: f64,
    pub sp_stable: f64,
    pub sp_collateral: f64,
    pub total_coll_added: f64,
    pub total_coll_liquidated: f64,
    pub total_stable_redeemed: f64,
}

impl PeriodRow {
    /// Fields in `COLUMNS` order. Floats keep full precision.
    pub fn record(&self) -> [String; 15] {
        [
            self.iteration.to_string(),
            self.collateral_price.to_string(),
            self.stable_price.to_string(),
            self.reward_price.to_string(),
            self.num_troves.to_string(),
            self.total_coll.to_string(),
            self.total_debt.to_string(),
            self.tcr.to_string(),
            self.recovery_mode.to_string(),
            self.last_icr.to_string(),
            self.sp_stable.to_string(),
            self.sp_collateral.to_string(),
            self.total_coll_added.to_string(),
            self.total_coll_liquidated.to_string(),
            self.total_stable_redeemed.to_string(),
        ]
    }
}

/// Destination for period rows.
pub trait RowSink {
    fn append(&mut self, row: &PeriodRow) -> SimResult<()>;
}

impl RowSink for Vec<PeriodRow> {
    fn append(&mut self, row: &PeriodRow) -> SimResult<()> {
        self.push(row.clone());
        Ok(())
    }
}

impl<A: RowSink, B: RowSink> RowSink for (A, B) {
    fn append(&mut self, row: &PeriodRow) -> SimResult<()> {
        self.0.append(row)?;
        self.1.append(row)
    }
}

/// CSV table. The header is written on creation and every row is flushed,
/// so an aborted run leaves the rows of all completed periods behind.
pub struct CsvSink<W: Write> {
    writer: csv::Writer<W>,
}

impl CsvSink<File> {
    pub fn create(path: &Path) -> SimResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        CsvSink::from_writer(File::create(path)?)
    }
}

impl<W: Write> CsvSink<W> {
    pub fn from_writer(inner: W) -> SimResult<Self> {
        let mut writer = csv::Writer::from_writer(inner);
        writer.write_record(COLUMNS)?;
        writer.flush()?;
        Ok(CsvSink { writer })
    }
}

impl<W: Write> RowSink for CsvSink<W> {
    fn append(&mut self, row: &PeriodRow) -> SimResult<()> {
        self.writer.write_record(row.record())?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Summary statistics for one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub periods: u64,
    pub mean_stable_price: f64,
    pub min_stable_price: f64,
    pub max_stable_price: f64,
    pub final_stable_price: f64,
    pub final_collateral_price: f64,
    pub final_reward_price: f64,
    pub max_troves: usize,
    pub final_troves: usize,
    pub min_tcr: f64,
    pub recovery_periods: u64,
    pub total_coll_added: f64,
    pub total_coll_liquidated: f64,
    pub total_stable_redeemed: f64,
}

impl RunSummary {
    /// Share of all collateral ever added that ended up liquidated.
    pub fn liquidated_share(&self) -> f64 {
        if self.total_coll_added <= 0.0 {
            return 0.0;
        }
        self.total_coll_liquidated / self.total_coll_added
    }
}

/// Compute summary statistics from the period table. `None` for an empty run.
pub fn compute_summary(rows: &[PeriodRow]) -> Option<RunSummary> {
    let last = rows.last()?;
    let n = rows.len() as f64;
    let prices = rows.iter().map(|r| r.stable_price);

    Some(RunSummary {
        periods: rows.len() as u64,
        mean_stable_price: prices.clone().sum::<f64>() / n,
        min_stable_price: prices.clone().fold(f64::INFINITY, f64::min),
        max_stable_price: prices.fold(f64::NEG_INFINITY, f64::max),
        final_stable_price: last.stable_price,
        final_collateral_price: last.collateral_price,
        final_reward_price: last.reward_price,
        max_troves: rows.iter().map(|r| r.num_troves).max().unwrap_or(0),
        final_troves: last.num_troves,
        min_tcr: rows.iter().map(|r| r.tcr).fold(f64::INFINITY, f64::min),
        recovery_periods: rows.iter().filter(|r| r.recovery_mode).count() as u64,
        total_coll_added: last.total_coll_added,
        total_coll_liquidated: last.total_coll_liquidated,
        total_stable_redeemed: last.total_stable_redeemed,
    })
}

/// Save a run summary next to its table.
pub fn save_summary_json(summary: &RunSummary, path: &Path) -> SimResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, serde_json::to_string_pretty(summary)?)?;
    Ok(())
}

/// Save the effective parameter bundle, so a table can be traced back to
/// the exact configuration that produced it.
pub fn save_config_toml(config: &SimConfig, path: &Path) -> SimResult<()> {
    let text = toml::to_string_pretty(config).map_err(|e| crate::error::SimError::Config(e.to_string()))?;
    std::fs::write(path, text)?;
    Ok(())
}
