//! Recorded collateral price paths for replay.
//!
//! Reads a CSV with a header row and takes the `close` column (or `price`,
//! or the last column when neither exists). Sparse paths can be linearly
//! interpolated to the simulation's period length.

use std::path::Path;

use crate::error::{SimError, SimResult};

/// Load a price path from CSV.
pub fn load_price_path(path: &Path) -> SimResult<Vec<f64>> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();
    let column = headers
        .iter()
        .position(|h| h.eq_ignore_ascii_case("close"))
        .or_else(|| headers.iter().position(|h| h.eq_ignore_ascii_case("price")))
        .or_else(|| headers.len().checked_sub(1))
        .ok_or_else(|| SimError::Config(format!("{} has no columns", path.display())))?;

    let mut prices = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record?;
        let field = record.get(column).unwrap_or("").trim();
        let price: f64 = field.parse().map_err(|_| {
            SimError::Config(format!("{} row {}: cannot parse price {:?}", path.display(), line + 1, field))
        })?;
        if !(price > 0.0 && price.is_finite()) {
            return Err(SimError::Config(format!("{} row {}: price must be positive", path.display(), line + 1)));
        }
        prices.push(price);
    }

    if prices.len() < 2 {
        return Err(SimError::Config(format!("{} needs at least two prices", path.display())));
    }
    Ok(prices)
}

/// Linearly interpolate between consecutive points.
///
/// For N points, produces `(N - 1) * steps + 1` prices: each segment is split
/// into `steps` equal parts and the final point is kept.
pub fn interpolate(prices: &[f64], steps: usize) -> Vec<f64> {
    if prices.len() < 2 || steps <= 1 {
        return prices.to_vec();
    }
    let mut out = Vec::with_capacity((prices.len() - 1) * steps + 1);
    for pair in prices.windows(2) {
        let (p0, p1) = (pair[0], pair[1]);
        for j in 0..steps {
            let t = j as f64 / steps as f64;
            out.push(p0 + (p1 - p0) * t);
        }
    }
    if let Some(last) = prices.last() {
        out.push(*last);
    }
    out
}

/// Rescale a path so it starts at `initial`, keeping relative moves.
pub fn rebase(prices: &[f64], initial: f64) -> Vec<f64> {
    match prices.first() {
        Some(first) if *first > 0.0 => prices.iter().map(|p| p / first * initial).collect(),
        _ => prices.to_vec(),
    }
}
