//! The period loop.
//!
//! `Simulation` owns the protocol, the account pool and the carried state,
//! runs the bootstrap once, then applies the seven steps in fixed order for
//! each period and emits one row per completed period.

use tracing::{debug, info};

use crate::accounts::{AccountId, AccountPool};
use crate::config::SimConfig;
use crate::error::{SimError, SimResult};
use crate::output::{PeriodRow, RowSink};
use crate::processes::{self, SeedStreams, TroveModel};
use crate::protocol::{MemoryProtocol, Protocol};
use crate::steps::{self, RewardMarket, StepContext};

const EPS: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Bootstrapping,
    Running,
    Finished,
}

/// State carried from one period to the next.
///
/// Series are indexed by period; index 0 is the bootstrap and holds zeros.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimulationState {
    pub period: u64,
    pub stable_price: f64,
    pub reward_price: f64,
    /// Scale `L` of the stablecoin demand curve
    pub liquidity_demand: f64,
    pub stability_return: f64,
    pub total_collateral_added: f64,
    pub total_collateral_liquidated: f64,
    pub total_stable_redeemed: f64,
    pub liquidation_gain: Vec<f64>,
    pub airdrop_gain: Vec<f64>,
    /// Borrowing fees, valued at the period's stablecoin price
    pub issuance_fee: Vec<f64>,
    pub redemption_fee: Vec<f64>,
}

fn window_sum(series: &[f64], end: usize, window: usize) -> f64 {
    let end = end.min(series.len());
    series[end.saturating_sub(window)..end].iter().sum()
}

impl SimulationState {
    /// Stability-pool gains over `[end - window, end)`.
    pub fn trailing_gains(&self, end: usize, window: usize) -> f64 {
        window_sum(&self.liquidation_gain, end, window) + window_sum(&self.airdrop_gain, end, window)
    }

    /// Fee revenue over `[end - window, end)`.
    pub fn trailing_revenue(&self, end: usize, window: usize) -> f64 {
        window_sum(&self.issuance_fee, end, window) + window_sum(&self.redemption_fee, end, window)
    }
}

/// What happened inside one period, beyond the table row.
#[derive(Debug, Clone, Default)]
pub struct PeriodReport {
    pub period: u64,
    pub liquidated: Vec<AccountId>,
    pub closed: Vec<AccountId>,
    /// Accounts that opened a trove, arbitrage troves included
    pub opened: Vec<AccountId>,
    /// Accounts whose troves were redeemed to zero
    pub redeemed_out: Vec<AccountId>,
    pub adjusted: usize,
    pub stable_issued: f64,
    pub stability_target: f64,
    pub stability_return: f64,
    pub reward_market: RewardMarket,
    pub rejected: u32,
}

pub struct Simulation<P: Protocol> {
    pub config: SimConfig,
    pub protocol: P,
    pub pool: AccountPool,
    pub state: SimulationState,
    pub reports: Vec<PeriodReport>,
    phase: Phase,
    next_period: u64,
    periods: u64,
    streams: SeedStreams,
    trove_model: TroveModel,
    collateral_prices: Vec<f64>,
    natural_rates: Vec<f64>,
}

impl Simulation<MemoryProtocol> {
    /// Simulation against the in-memory reference protocol.
    pub fn new(config: SimConfig) -> SimResult<Self> {
        let protocol = MemoryProtocol::new(config.protocol.clone(), config.collateral_price.initial);
        Simulation::with_protocol(config, protocol)
    }
}

impl<P: Protocol> Simulation<P> {
    pub fn with_protocol(config: SimConfig, protocol: P) -> SimResult<Self> {
        config.validate()?;
        let streams = SeedStreams::new(config.seed);
        let trove_model = TroveModel::new(&config.troves, config.protocol.mcr)
            .ok_or_else(|| SimError::Config("trove distribution parameters are invalid".to_string()))?;
        let collateral_prices = processes::collateral_price_path(&config.collateral_price, config.periods, &streams);
        let natural_rates = processes::natural_rate_path(&config.stability, config.periods, &streams);

        Ok(Simulation {
            pool: AccountPool::new(config.accounts),
            periods: config.periods,
            config,
            protocol,
            state: SimulationState::default(),
            reports: Vec::new(),
            phase: Phase::Bootstrapping,
            next_period: 1,
            streams,
            trove_model,
            collateral_prices,
            natural_rates,
        })
    }

    /// Replay a recorded collateral price path instead of the random walk.
    /// `prices[0]` is the bootstrap price; the run is cut to the path length.
    pub fn with_price_path(mut self, prices: Vec<f64>) -> SimResult<Self> {
        if self.phase != Phase::Bootstrapping {
            return Err(SimError::Setup("price path must be set before bootstrap".to_string()));
        }
        if prices.len() < 2 {
            return Err(SimError::Config("price path needs at least two points".to_string()));
        }
        if let Some(bad) = prices.iter().find(|p| !(**p > 0.0 && p.is_finite())) {
            return Err(SimError::Config(format!("price path contains non-positive price {}", bad)));
        }
        self.periods = self.config.periods.min(prices.len() as u64 - 1);
        self.collateral_prices = prices;
        Ok(self)
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Number of periods this run will execute.
    pub fn periods(&self) -> u64 {
        self.periods
    }

    pub fn collateral_prices(&self) -> &[f64] {
        &self.collateral_prices[..=self.periods as usize]
    }

    /// Open the whale trove, seed the stability pool, and calibrate the
    /// demand curve so period 0 clears at the initial stablecoin price.
    pub fn bootstrap(&mut self) -> SimResult<()> {
        if self.phase != Phase::Bootstrapping {
            return Err(SimError::Setup("bootstrap already ran".to_string()));
        }
        let boot = &self.config.bootstrap;
        let price = self.collateral_prices[0];
        let whale = AccountPool::WHALE;
        self.protocol.set_price(price);

        self.protocol
            .open_trove(whale, boot.whale_collateral, boot.whale_debt)
            .map_err(|e| SimError::Setup(format!("whale trove rejected: {}", e)))?;
        let whale_cr = self.protocol.icr(whale).unwrap_or(f64::INFINITY);
        // The whale never rebalances
        self.pool.activate(whale, whale_cr, f64::INFINITY, 0);

        if boot.stability_initial > 0.0 {
            self.protocol
                .provide_to_stability_pool(whale, boot.stability_initial)
                .map_err(|e| SimError::Setup(format!("stability seed rejected: {}", e)))?;
        }

        let snapshot = self.protocol.snapshot();
        let float = snapshot.stable_supply - snapshot.sp_stable;
        if float <= 0.0 {
            return Err(SimError::Setup("no stablecoin left outside the stability pool".to_string()));
        }
        let p0 = boot.initial_stable_price;

        self.state = SimulationState {
            period: 0,
            stable_price: p0,
            reward_price: self.config.reward_token.initial_price,
            liquidity_demand: float / p0.powf(self.config.liquidity.elasticity),
            stability_return: self.config.stability.initial_return,
            total_collateral_added: boot.whale_collateral,
            liquidation_gain: vec![0.0],
            airdrop_gain: vec![0.0],
            issuance_fee: vec![0.0],
            redemption_fee: vec![0.0],
            ..SimulationState::default()
        };
        self.phase = Phase::Running;

        info!(
            seed = self.streams.seed(),
            collateral_price = price,
            troves = snapshot.num_troves,
            tcr = snapshot.tcr,
            sp = snapshot.sp_stable,
            "bootstrap complete"
        );
        let moments = processes::trove_moments(&self.config.troves);
        info!(
            collateral_mean = moments.collateral.mean,
            collateral_sd = moments.collateral.sd,
            target_cr_mean = moments.target_cr.mean,
            target_cr_sd = moments.target_cr.sd,
            inattention_mean = moments.inattention.mean,
            inattention_sd = moments.inattention.sd,
            "borrower trait distributions"
        );
        Ok(())
    }

    /// Open a trove directly, outside the behavioural model. Scripted
    /// scenarios use this after bootstrap to place troves at chosen ratios.
    pub fn seed_trove(
        &mut self,
        account: AccountId,
        collateral: f64,
        net_debt: f64,
        target_cr: f64,
        inattention: f64,
    ) -> SimResult<()> {
        if self.phase != Phase::Running {
            return Err(SimError::Setup("troves can only be seeded while running".to_string()));
        }
        if self.pool.is_active(account) || self.pool.get(account).is_none() {
            return Err(SimError::Setup(format!("account {} is not available", account)));
        }
        self.protocol
            .open_trove(account, collateral, net_debt)
            .map_err(|e| SimError::Setup(format!("seeded trove for {} rejected: {}", account, e)))?;
        self.pool.activate(account, target_cr, inattention, self.next_period - 1);
        self.state.total_collateral_added += collateral;
        Ok(())
    }

    /// Run one period. Bootstraps on first use; `None` once every period has run.
    pub fn step<S: RowSink>(&mut self, sink: &mut S) -> SimResult<Option<PeriodRow>> {
        match self.phase {
            Phase::Bootstrapping => self.bootstrap()?,
            Phase::Finished => return Ok(None),
            Phase::Running => {}
        }
        let period = self.next_period;
        if period > self.periods {
            self.phase = Phase::Finished;
            return Ok(None);
        }

        let row = self.advance(period)?;
        sink.append(&row)?;
        self.next_period += 1;
        if period == self.periods {
            self.phase = Phase::Finished;
        }
        Ok(Some(row))
    }

    /// Run every remaining period.
    pub fn run<S: RowSink>(&mut self, sink: &mut S) -> SimResult<&SimulationState> {
        while self.step(sink)?.is_some() {}
        Ok(&self.state)
    }

    fn advance(&mut self, period: u64) -> SimResult<PeriodRow> {
        let price = self.collateral_prices[period as usize];
        self.protocol.set_price(price);

        let ctx = StepContext {
            config: &self.config,
            streams: &self.streams,
            trove_model: &self.trove_model,
            period,
            collateral_price: price,
            stable_price: self.state.stable_price,
            reward_price: self.state.reward_price,
            natural_rate: self.natural_rates.get(period as usize).copied().unwrap_or(0.0),
        };

        let liquidated = steps::liquidate(&ctx, &mut self.pool, &mut self.protocol, &self.state);
        let closed = steps::close(&ctx, &mut self.pool, &mut self.protocol);
        let adjusted = steps::adjust(&ctx, &mut self.pool, &mut self.protocol);
        let opened = steps::open(&ctx, &mut self.pool, &mut self.protocol);
        let stability = steps::update_stability_pool(&ctx, &self.pool, &mut self.protocol, liquidated.stability_return);
        let stabilizer = steps::stabilize_price(&ctx, &mut self.pool, &mut self.protocol, self.state.liquidity_demand);

        if !(stabilizer.stable_price > 0.0 && stabilizer.stable_price.is_finite()) {
            return Err(SimError::InvariantViolation {
                period,
                detail: format!("stablecoin price {} is not positive", stabilizer.stable_price),
            });
        }

        let issued_fee = adjusted.issuance_fee + opened.issuance_fee + stabilizer.issuance.issuance_fee;
        let state = &mut self.state;
        state.period = period;
        state.stable_price = stabilizer.stable_price;
        state.liquidity_demand = stabilizer.liquidity_demand;
        state.stability_return = liquidated.stability_return;
        state.total_collateral_added +=
            adjusted.collateral_added + opened.collateral_added + stabilizer.issuance.collateral_added;
        state.total_collateral_liquidated += liquidated.collateral_liquidated;
        state.total_stable_redeemed += stabilizer.redeemed;
        state.liquidation_gain.push(liquidated.liquidation_gain);
        state.airdrop_gain.push(liquidated.airdrop_gain);
        state.issuance_fee.push(stabilizer.stable_price * issued_fee);
        state.redemption_fee.push(stabilizer.redemption_fee);

        let market = steps::reward_market(&ctx, &self.state);
        self.state.reward_price = market.price;

        if self.state.total_collateral_liquidated > self.state.total_collateral_added + EPS {
            return Err(SimError::InvariantViolation {
                period,
                detail: format!(
                    "collateral liquidated {} exceeds collateral added {}",
                    self.state.total_collateral_liquidated, self.state.total_collateral_added
                ),
            });
        }
        if !self.pool.is_partitioned() {
            return Err(SimError::InvariantViolation {
                period,
                detail: "account pool is no longer partitioned".to_string(),
            });
        }

        let snapshot = self.protocol.snapshot();
        let row = PeriodRow {
            iteration: period,
            collateral_price: price,
            stable_price: self.state.stable_price,
            reward_price: self.state.reward_price,
            num_troves: snapshot.num_troves,
            total_coll: snapshot.total_collateral,
            total_debt: snapshot.total_debt,
            tcr: snapshot.tcr,
            recovery_mode: snapshot.recovery_mode,
            last_icr: snapshot.last_icr,
            sp_stable: snapshot.sp_stable,
            sp_collateral: snapshot.sp_collateral,
            total_coll_added: self.state.total_collateral_added,
            total_coll_liquidated: self.state.total_collateral_liquidated,
            total_stable_redeemed: self.state.total_stable_redeemed,
        };

        let mut opened_accounts = opened.accounts;
        opened_accounts.extend(stabilizer.issuance.accounts.iter().copied());
        let rejected = liquidated.tally.rejected
            + closed.tally.rejected
            + adjusted.tally.rejected
            + opened.tally.rejected
            + stability.tally.rejected
            + stabilizer.issuance.tally.rejected
            + stabilizer.redemption_tally.rejected;

        debug!(
            period,
            liquidated = liquidated.liquidated.len(),
            closed = closed.closed.len(),
            adjusted = adjusted.accounts.len(),
            opened = opened_accounts.len(),
            redeemed = stabilizer.redeemed,
            rejected,
            "period actions"
        );
        info!(
            period,
            collateral_price = price,
            stable_price = row.stable_price,
            reward_price = row.reward_price,
            troves = row.num_troves,
            tcr = row.tcr,
            recovery = row.recovery_mode,
            sp = row.sp_stable,
            "period complete"
        );

        self.reports.push(PeriodReport {
            period,
            liquidated: liquidated.liquidated,
            closed: closed.closed,
            opened: opened_accounts,
            redeemed_out: stabilizer.redeemed_out,
            adjusted: adjusted.accounts.len(),
            stable_issued: adjusted.stable_issued + opened.stable_issued + stabilizer.issuance.stable_issued,
            stability_target: stability.target,
            stability_return: liquidated.stability_return,
            reward_market: market,
            rejected,
        });

        self.protocol.advance_period();
        Ok(row)
    }
}
