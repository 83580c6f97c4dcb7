use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{SimError, SimResult};

/// Protocol constants for the reference chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Minimum collateral ratio (liquidation threshold), e.g. 1.1 = 110%
    pub mcr: f64,
    /// Critical system collateral ratio; TCR below this is recovery mode
    pub ccr: f64,
    /// Minimum net debt per trove, in stablecoin
    pub min_net_debt: f64,
    /// Stablecoin reserved per trove and paid to the liquidator
    pub gas_compensation: f64,
    pub borrowing_fee_floor: f64,
    pub max_borrowing_fee: f64,
    pub redemption_fee_floor: f64,
    /// Base-rate half life, in periods
    pub base_rate_half_life: f64,
    /// Redeemed fraction of supply is divided by this before being added to the base rate
    pub redemption_beta: f64,
    pub max_liquidations_per_call: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig {
            mcr: 1.1,
            ccr: 1.5,
            min_net_debt: 1800.0,
            gas_compensation: 200.0,
            borrowing_fee_floor: 0.005,
            max_borrowing_fee: 0.05,
            redemption_fee_floor: 0.005,
            base_rate_half_life: 12.0,
            redemption_beta: 2.0,
            max_liquidations_per_call: 90,
        }
    }
}

/// Period-0 state: the whale trove and the seeded stability pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    pub whale_collateral: f64,
    pub whale_debt: f64,
    pub stability_initial: f64,
    pub initial_stable_price: f64,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        BootstrapConfig {
            whale_collateral: 30_000.0,
            whale_debt: 10_000_000.0,
            stability_initial: 500_000.0,
            initial_stable_price: 1.0,
        }
    }
}

/// Geometric random walk for the collateral price.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollateralPriceConfig {
    pub initial: f64,
    /// Per-period drift (0.001 = +0.1% per period)
    pub drift: f64,
    /// Per-period log volatility
    pub volatility: f64,
}

impl Default for CollateralPriceConfig {
    fn default() -> Self {
        CollateralPriceConfig {
            initial: 2000.0,
            drift: 0.0,
            volatility: 0.02,
        }
    }
}

/// Borrower behaviour: trove sizes, targets, arrivals, exits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TroveConfig {
    pub collateral_gamma_k: f64,
    pub collateral_gamma_theta: f64,
    pub target_cr_a: f64,
    pub target_cr_b: f64,
    pub target_cr_df: f64,
    pub inattention_gamma_k: f64,
    pub inattention_gamma_theta: f64,
    /// Troves opened in period 1
    pub initial_open: f64,
    pub open_base: f64,
    pub open_sd: f64,
    /// Extra openings per percentage point the stablecoin trades above 1 + fee
    pub open_price_sensitivity: f64,
    pub close_base: f64,
    pub close_sd: f64,
    pub close_warmup_periods: u64,
    /// Extra closures per percentage point the stablecoin trades below 1
    pub close_price_sensitivity: f64,
    /// Chance an account looks at its trove in a given period
    pub check_probability: f64,
}

impl Default for TroveConfig {
    fn default() -> Self {
        TroveConfig {
            collateral_gamma_k: 10.0,
            collateral_gamma_theta: 5.0,
            target_cr_a: 1.1,
            target_cr_b: 0.1,
            target_cr_df: 16.0,
            inattention_gamma_k: 4.0,
            inattention_gamma_theta: 0.08,
            initial_open: 10.0,
            open_base: 1.0,
            open_sd: 0.5,
            open_price_sensitivity: 1.0,
            close_base: 0.5,
            close_sd: 0.5,
            close_warmup_periods: 240,
            close_price_sensitivity: 1.0,
            check_probability: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilityConfig {
    /// Annualized return assumed before any gains are observed
    pub initial_return: f64,
    pub natural_rate_initial: f64,
    pub natural_rate_sd: f64,
    pub shock_sd: f64,
    /// Pool growth per unit of (return - natural rate)
    pub sensitivity: f64,
    /// Trailing window, in periods, for return and earnings averages
    pub return_window: usize,
    /// Reward tokens airdropped to depositors each period
    pub airdrop_quantity: f64,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        StabilityConfig {
            initial_return: 0.2,
            natural_rate_initial: 0.2,
            natural_rate_sd: 0.002,
            shock_sd: 0.001,
            sensitivity: 0.01,
            return_window: 720,
            airdrop_quantity: 500.0,
        }
    }
}

/// Synthetic secondary-market demand for the stablecoin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiquidityConfig {
    pub drift: f64,
    pub shock_sd: f64,
    /// Price elasticity of demand (negative)
    pub elasticity: f64,
    /// Price ceiling defended by opening troves at `arbitrage_cr`
    pub ceiling: f64,
    pub arbitrage_cr: f64,
}

impl Default for LiquidityConfig {
    fn default() -> Self {
        LiquidityConfig {
            drift: 1.0003,
            shock_sd: 0.001,
            elasticity: -20.0,
            ceiling: 1.1,
            arbitrage_cr: 1.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardTokenConfig {
    pub initial_price: f64,
    pub drift: f64,
    pub volatility: f64,
    /// Periods during which the price follows the exogenous walk only
    pub warmup_periods: u64,
    pub pe_ratio: f64,
    pub total_supply: f64,
    /// Weight of the fee-based fundamental value in the post-warmup price
    pub fee_feedback: f64,
}

impl Default for RewardTokenConfig {
    fn default() -> Self {
        RewardTokenConfig {
            initial_price: 0.4,
            drift: 0.0035,
            volatility: 0.005,
            warmup_periods: 720,
            pe_ratio: 50.0,
            total_supply: 100_000_000.0,
            fee_feedback: 0.1,
        }
    }
}

/// The full parameter bundle for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub periods: u64,
    pub seed: u64,
    /// Size of the account pool, whale included
    pub accounts: usize,
    pub periods_per_year: f64,
    pub protocol: ProtocolConfig,
    pub bootstrap: BootstrapConfig,
    pub collateral_price: CollateralPriceConfig,
    pub troves: TroveConfig,
    pub stability: StabilityConfig,
    pub liquidity: LiquidityConfig,
    pub reward_token: RewardTokenConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            periods: 720,
            seed: 42,
            accounts: 200,
            periods_per_year: 8760.0,
            protocol: ProtocolConfig::default(),
            bootstrap: BootstrapConfig::default(),
            collateral_price: CollateralPriceConfig::default(),
            troves: TroveConfig::default(),
            stability: StabilityConfig::default(),
            liquidity: LiquidityConfig::default(),
            reward_token: RewardTokenConfig::default(),
        }
    }
}

impl SimConfig {
    /// Load a bundle from a `.json` file or, for any other extension, TOML.
    pub fn load(path: &Path) -> SimResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: SimConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&text)?,
            _ => toml::from_str(&text)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject bundles the simulation cannot run meaningfully.
    pub fn validate(&self) -> SimResult<()> {
        let fail = |msg: &str| Err(SimError::Config(msg.to_string()));

        if self.accounts < 1 {
            return fail("accounts must include at least the whale");
        }
        if self.periods_per_year <= 0.0 {
            return fail("periods_per_year must be positive");
        }
        if self.protocol.mcr <= 1.0 {
            return fail("protocol.mcr must exceed 1.0");
        }
        if self.protocol.ccr < self.protocol.mcr {
            return fail("protocol.ccr must be at least protocol.mcr");
        }
        if self.protocol.max_liquidations_per_call == 0 {
            return fail("protocol.max_liquidations_per_call must be positive");
        }
        if self.protocol.base_rate_half_life <= 0.0 {
            return fail("protocol.base_rate_half_life must be positive");
        }
        if self.collateral_price.initial <= 0.0 {
            return fail("collateral_price.initial must be positive");
        }
        if self.collateral_price.volatility < 0.0 {
            return fail("collateral_price.volatility must be non-negative");
        }
        if self.troves.collateral_gamma_k <= 0.0
            || self.troves.collateral_gamma_theta <= 0.0
            || self.troves.inattention_gamma_k <= 0.0
            || self.troves.inattention_gamma_theta <= 0.0
        {
            return fail("gamma shape and scale parameters must be positive");
        }
        if self.troves.target_cr_df <= 0.0 {
            return fail("troves.target_cr_df must be positive");
        }
        if !(0.0..=1.0).contains(&self.troves.check_probability) {
            return fail("troves.check_probability must be within [0, 1]");
        }
        if self.stability.return_window == 0 {
            return fail("stability.return_window must be positive");
        }
        if self.liquidity.elasticity >= 0.0 {
            return fail("liquidity.elasticity must be negative");
        }
        if self.liquidity.arbitrage_cr < self.protocol.mcr {
            return fail("liquidity.arbitrage_cr must be at least protocol.mcr");
        }
        if self.bootstrap.initial_stable_price <= 0.0 {
            return fail("bootstrap.initial_stable_price must be positive");
        }
        if self.bootstrap.stability_initial > self.bootstrap.whale_debt {
            return fail("bootstrap.stability_initial cannot exceed the whale's debt");
        }
        if self.reward_token.initial_price <= 0.0 || self.reward_token.total_supply <= 0.0 {
            return fail("reward_token price and supply must be positive");
        }
        if !(0.0..=1.0).contains(&self.reward_token.fee_feedback) {
            return fail("reward_token.fee_feedback must be within [0, 1]");
        }
        Ok(())
    }

    /// A bundle with every random shock and behavioural flow switched off.
    /// Only the whale trove exists; useful as a baseline for scripted scenarios.
    pub fn quiet() -> Self {
        let mut config = SimConfig::default();
        config.collateral_price.volatility = 0.0;
        config.collateral_price.drift = 0.0;
        config.troves.initial_open = 0.0;
        config.troves.open_base = 0.0;
        config.troves.open_sd = 0.0;
        config.troves.open_price_sensitivity = 0.0;
        config.troves.close_base = 0.0;
        config.troves.close_sd = 0.0;
        config.troves.close_warmup_periods = 0;
        config.troves.close_price_sensitivity = 0.0;
        config.troves.check_probability = 0.0;
        config.stability.natural_rate_sd = 0.0;
        config.stability.shock_sd = 0.0;
        config.stability.sensitivity = 0.0;
        config.liquidity.drift = 1.0;
        config.liquidity.shock_sd = 0.0;
        config
    }
}
