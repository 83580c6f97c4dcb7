//! Exogenous random processes driving the simulation.
//!
//! Every process draws from its own stream: a `StdRng` seeded from the run
//! seed, a per-process tag, the period, and an index within the period.
//! Streams never share state, so adding a draw to one process leaves every
//! other process's sequence untouched.

use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use rand_distr::{ChiSquared, Distribution, Gamma, LogNormal, Normal};

use crate::config::{CollateralPriceConfig, RewardTokenConfig, StabilityConfig, TroveConfig};

/// Tags separating the per-process streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum Stream {
    CollateralPrice = 1,
    NaturalRate = 2,
    OpenCount = 3,
    OpenSelection = 4,
    TroveCollateral = 5,
    TargetRatio = 6,
    Inattention = 7,
    CloseCount = 8,
    CloseSelection = 9,
    Attention = 10,
    AdjustChoice = 11,
    StabilityShock = 12,
    StabilityDepositor = 13,
    LiquidityShock = 14,
    RewardPrice = 15,
}

fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Factory for independent, reproducible random streams.
#[derive(Debug, Clone, Copy)]
pub struct SeedStreams {
    seed: u64,
}

impl SeedStreams {
    pub fn new(seed: u64) -> Self {
        SeedStreams { seed }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Stream for `(process, period, index)`.
    pub fn rng(&self, stream: Stream, period: u64, index: u64) -> StdRng {
        let mut h = splitmix64(self.seed ^ (stream as u64).wrapping_mul(0xA24B_AED4_963E_E407));
        h = splitmix64(h ^ period);
        h = splitmix64(h ^ index.wrapping_mul(0x9FB2_1C65_1E98_DF25));
        StdRng::seed_from_u64(h)
    }

    /// Whole-run stream for processes generated up front.
    pub fn path_rng(&self, stream: Stream) -> StdRng {
        self.rng(stream, u64::MAX, 0)
    }
}

/// Zero-mean Gaussian draw; a zero or invalid sd is a point mass at 0.
fn gaussian<R: Rng>(sd: f64, rng: &mut R) -> f64 {
    match Normal::new(0.0, sd) {
        Ok(d) if sd > 0.0 => d.sample(rng),
        _ => 0.0,
    }
}

/// Collateral price path of `periods + 1` points (index 0 is the bootstrap price).
///
/// Multiplicative lognormal steps: `p[i] = p[i-1] * (1 + drift) * LogNormal(-σ²/2, σ)`,
/// so each step has expectation `1 + drift` and every price stays positive.
pub fn collateral_price_path(config: &CollateralPriceConfig, periods: u64, streams: &SeedStreams) -> Vec<f64> {
    let sigma = config.volatility.max(0.0);
    let mut rng = streams.path_rng(Stream::CollateralPrice);
    let mut path = Vec::with_capacity(periods as usize + 1);
    path.push(config.initial);

    let step = LogNormal::new(-0.5 * sigma * sigma, sigma).ok();
    for i in 1..=periods as usize {
        let shock = match &step {
            Some(d) if sigma > 0.0 => d.sample(&mut rng),
            _ => 1.0,
        };
        path.push(path[i - 1] * (1.0 + config.drift) * shock);
    }
    path
}

/// Opportunity-cost rate the stability pool return competes against.
pub fn natural_rate_path(config: &StabilityConfig, periods: u64, streams: &SeedStreams) -> Vec<f64> {
    let mut rng = streams.path_rng(Stream::NaturalRate);
    let mut path = Vec::with_capacity(periods as usize + 1);
    path.push(config.natural_rate_initial);
    for i in 1..=periods as usize {
        let next = path[i - 1] * (1.0 + gaussian(config.natural_rate_sd, &mut rng));
        path.push(next.max(0.0));
    }
    path
}

/// Traits drawn for a trove at open time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TroveDraw {
    pub collateral: f64,
    pub target_cr: f64,
    pub inattention: f64,
}

/// Gamma/chi-square borrower model.
#[derive(Debug, Clone)]
pub struct TroveModel {
    collateral: Gamma<f64>,
    ratio: ChiSquared<f64>,
    inattention: Gamma<f64>,
    cr_a: f64,
    cr_b: f64,
    min_cr: f64,
}

impl TroveModel {
    /// Parameters are checked by `SimConfig::validate`; invalid ones yield `None`.
    pub fn new(config: &TroveConfig, min_cr: f64) -> Option<Self> {
        Some(TroveModel {
            collateral: Gamma::new(config.collateral_gamma_k, config.collateral_gamma_theta).ok()?,
            ratio: ChiSquared::new(config.target_cr_df).ok()?,
            inattention: Gamma::new(config.inattention_gamma_k, config.inattention_gamma_theta).ok()?,
            cr_a: config.target_cr_a,
            cr_b: config.target_cr_b,
            min_cr,
        })
    }

    pub fn collateral(&self, streams: &SeedStreams, period: u64, index: u64) -> f64 {
        self.collateral.sample(&mut streams.rng(Stream::TroveCollateral, period, index))
    }

    /// `a + b·χ²(df)`, never below the protocol minimum.
    pub fn target_cr(&self, streams: &SeedStreams, period: u64, index: u64) -> f64 {
        let chi = self.ratio.sample(&mut streams.rng(Stream::TargetRatio, period, index));
        (self.cr_a + self.cr_b * chi).max(self.min_cr)
    }

    pub fn inattention(&self, streams: &SeedStreams, period: u64, index: u64) -> f64 {
        self.inattention.sample(&mut streams.rng(Stream::Inattention, period, index))
    }

    pub fn draw(&self, streams: &SeedStreams, period: u64, index: u64) -> TroveDraw {
        TroveDraw {
            collateral: self.collateral(streams, period, index),
            target_cr: self.target_cr(streams, period, index),
            inattention: self.inattention(streams, period, index),
        }
    }
}

/// Mean and standard deviation of one borrower trait.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Moments {
    pub mean: f64,
    pub sd: f64,
}

/// Moments of the open-time trove draws.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TroveMoments {
    pub collateral: Moments,
    /// Before the floor at MCR
    pub target_cr: Moments,
    pub inattention: Moments,
}

fn gamma_moments(k: f64, theta: f64) -> Moments {
    Moments {
        mean: k * theta,
        sd: k.sqrt() * theta,
    }
}

pub fn trove_moments(config: &TroveConfig) -> TroveMoments {
    TroveMoments {
        collateral: gamma_moments(config.collateral_gamma_k, config.collateral_gamma_theta),
        target_cr: Moments {
            mean: config.target_cr_a + config.target_cr_b * config.target_cr_df,
            sd: config.target_cr_b * (2.0 * config.target_cr_df).sqrt(),
        },
        inattention: gamma_moments(config.inattention_gamma_k, config.inattention_gamma_theta),
    }
}

fn round_count(raw: f64, max: usize) -> usize {
    let n = raw.max(0.0).round() as usize;
    n.min(max)
}

/// Number of troves opened this period.
pub fn open_count(
    config: &TroveConfig,
    streams: &SeedStreams,
    period: u64,
    stable_price: f64,
    borrowing_rate: f64,
    available: usize,
) -> usize {
    if period <= 1 {
        return round_count(config.initial_open, available);
    }
    let mut rng = streams.rng(Stream::OpenCount, period, 0);
    let mut raw = config.open_base + gaussian(config.open_sd, &mut rng);
    let premium = stable_price - 1.0 - borrowing_rate;
    if premium > 0.0 {
        raw += config.open_price_sensitivity * premium * 100.0;
    }
    round_count(raw, available)
}

/// Number of troves closed this period.
pub fn close_count(
    config: &TroveConfig,
    streams: &SeedStreams,
    period: u64,
    stable_price: f64,
    available: usize,
) -> usize {
    let mut rng = streams.rng(Stream::CloseCount, period, 0);
    if period <= config.close_warmup_periods {
        return round_count(rng.gen::<f64>(), available);
    }
    let mut raw = config.close_base + gaussian(config.close_sd, &mut rng);
    if stable_price < 1.0 {
        raw += config.close_price_sensitivity * (1.0 - stable_price) * 100.0;
    }
    round_count(raw, available)
}

/// Pick `amount` distinct elements, reproducibly for the stream.
pub fn choose<T: Copy>(items: &[T], amount: usize, streams: &SeedStreams, stream: Stream, period: u64) -> Vec<T> {
    let amount = amount.min(items.len());
    if amount == 0 {
        return Vec::new();
    }
    let mut rng = streams.rng(stream, period, 0);
    sample(&mut rng, items.len(), amount)
        .into_iter()
        .map(|i| items[i])
        .collect()
}

/// Whether an account looks at its trove this period. Keyed on the account so
/// the close and adjust steps see the same answer.
pub fn is_attentive(probability: f64, streams: &SeedStreams, period: u64, account: u32) -> bool {
    let mut rng = streams.rng(Stream::Attention, period, account as u64);
    rng.gen::<f64>() < probability
}

/// Fair coin per account and period, used to choose between the two ways of
/// restoring a target ratio.
pub fn coin_flip(streams: &SeedStreams, period: u64, account: u32) -> bool {
    streams.rng(Stream::AdjustChoice, period, account as u64).gen_bool(0.5)
}

pub fn normal_shock(sd: f64, streams: &SeedStreams, stream: Stream, period: u64) -> f64 {
    gaussian(sd, &mut streams.rng(stream, period, 0))
}

/// Reward-token price for the exogenous warm-up walk.
pub fn reward_walk_step(config: &RewardTokenConfig, previous: f64, streams: &SeedStreams, period: u64) -> f64 {
    let shock = normal_shock(config.volatility, streams, Stream::RewardPrice, period);
    (previous * (1.0 + config.drift) * (1.0 + shock)).max(f64::MIN_POSITIVE)
}
