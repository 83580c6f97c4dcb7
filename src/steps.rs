//! The seven per-period step functions, in the order the loop runs them:
//! liquidate, close, adjust, open, stability update, price stabilizer,
//! reward-token market.
//!
//! Each step reads the protocol as left by the previous step. A refused
//! protocol call skips that one action for this period and is tallied.

use tracing::{debug, warn};

use crate::accounts::{AccountId, AccountPool};
use crate::config::SimConfig;
use crate::error::Revert;
use crate::processes::{self, SeedStreams, Stream, TroveModel};
use crate::protocol::Protocol;
use crate::simulation::SimulationState;

const EPS: f64 = 1e-9;

/// Result of one attempted account action.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome<T> {
    Accepted(T),
    Rejected(Revert),
}

/// Accepted/rejected counts for one step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActionTally {
    pub accepted: u32,
    pub rejected: u32,
}

impl ActionTally {
    /// Turn a protocol answer into an outcome, counting and logging it.
    pub fn attempt<T>(&mut self, step: &'static str, account: AccountId, result: Result<T, Revert>) -> ActionOutcome<T> {
        match result {
            Ok(value) => {
                self.accepted += 1;
                ActionOutcome::Accepted(value)
            }
            Err(reason) => {
                self.rejected += 1;
                debug!(step, %account, %reason, "action rejected");
                ActionOutcome::Rejected(reason)
            }
        }
    }
}

/// Inputs shared by every step of a period.
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    pub config: &'a SimConfig,
    pub streams: &'a SeedStreams,
    pub trove_model: &'a TroveModel,
    pub period: u64,
    pub collateral_price: f64,
    /// Stablecoin price carried over from the previous period
    pub stable_price: f64,
    /// Reward-token price carried over from the previous period
    pub reward_price: f64,
    pub natural_rate: f64,
}

/// Top up `account` from the whale so it holds at least `need` stablecoin.
fn ensure_balance<P: Protocol>(protocol: &mut P, account: AccountId, need: f64) -> Result<(), Revert> {
    let short = need - protocol.stable_balance(account);
    if short > EPS && account != AccountPool::WHALE {
        protocol.transfer_stable(AccountPool::WHALE, account, short)?;
    }
    Ok(())
}

fn is_triggered<P: Protocol>(ctx: &StepContext, pool: &AccountPool, protocol: &P, id: AccountId) -> bool {
    if !processes::is_attentive(ctx.config.troves.check_probability, ctx.streams, ctx.period, id.0) {
        return false;
    }
    match (pool.get(id), protocol.icr(id)) {
        (Some(account), Some(icr)) => account.deviation(icr).abs() > account.inattention,
        _ => false,
    }
}

// ─── 1. Liquidate ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct LiquidateOutcome {
    /// In the order the protocol liquidated them
    pub liquidated: Vec<AccountId>,
    pub collateral_liquidated: f64,
    pub debt_offset: f64,
    pub liquidation_gain: f64,
    pub airdrop_gain: f64,
    /// Annualized stability-pool return used by the stability update
    pub stability_return: f64,
    pub tally: ActionTally,
}

/// Annualized return depositors earned over the trailing window of gains.
pub fn stability_return(config: &SimConfig, state: &SimulationState, period: u64, sp_total: f64, stable_price: f64) -> f64 {
    let initial = config.stability.initial_return;
    if period <= 1 {
        return initial;
    }
    if sp_total <= EPS || stable_price <= 0.0 {
        return 2.0 * initial;
    }
    let window = (period as usize).min(config.stability.return_window);
    let gains = state.trailing_gains(period as usize, window);
    config.periods_per_year / window as f64 * gains / (stable_price * sp_total)
}

pub fn liquidate<P: Protocol>(
    ctx: &StepContext,
    pool: &mut AccountPool,
    protocol: &mut P,
    state: &SimulationState,
) -> LiquidateOutcome {
    let mut out = LiquidateOutcome::default();
    let max = ctx.config.protocol.max_liquidations_per_call;

    if pool.active_count() > 0 {
        while protocol.has_pending_liquidations() {
            match out.tally.attempt("liquidate", AccountPool::WHALE, protocol.liquidate_troves(AccountPool::WHALE, max)) {
                ActionOutcome::Accepted(batch) => {
                    for l in batch {
                        pool.deactivate(l.account, ctx.period);
                        out.collateral_liquidated += l.collateral_to_pool;
                        out.debt_offset += l.debt_offset;
                        out.liquidated.push(l.account);
                    }
                }
                ActionOutcome::Rejected(_) => break,
            }
        }
    }

    out.liquidation_gain = out.collateral_liquidated * ctx.collateral_price - out.debt_offset * ctx.stable_price;
    let airdrop = ctx.config.stability.airdrop_quantity;
    out.airdrop_gain = if protocol.issue_rewards(airdrop) > 0.0 {
        ctx.reward_price * airdrop
    } else {
        0.0
    };

    let sp_total = protocol.snapshot().sp_stable;
    out.stability_return = stability_return(ctx.config, state, ctx.period, sp_total, ctx.stable_price);
    out
}

// ─── 2. Close ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct CloseOutcome {
    pub target: usize,
    pub closed: Vec<AccountId>,
    pub tally: ActionTally,
}

pub fn close<P: Protocol>(ctx: &StepContext, pool: &mut AccountPool, protocol: &mut P) -> CloseOutcome {
    let mut out = CloseOutcome::default();
    if pool.active_count() == 0 || protocol.is_recovery_mode() {
        return out;
    }

    let candidates: Vec<AccountId> = pool
        .borrowers()
        .into_iter()
        .filter(|id| is_triggered(ctx, pool, protocol, *id))
        .collect();
    out.target = processes::close_count(&ctx.config.troves, ctx.streams, ctx.period, ctx.stable_price, candidates.len());

    for id in processes::choose(&candidates, out.target, ctx.streams, Stream::CloseSelection, ctx.period) {
        let Some(trove) = protocol.trove(id) else {
            continue;
        };
        // The gas reserve is burned from the pool, not repaid by the owner
        let repay = trove.debt - ctx.config.protocol.gas_compensation.min(trove.debt);
        if let Err(reason) = ensure_balance(protocol, id, repay) {
            out.tally.attempt::<()>("close", id, Err(reason));
            continue;
        }
        if let ActionOutcome::Accepted(_) = out.tally.attempt("close", id, protocol.close_trove(id)) {
            pool.deactivate(id, ctx.period);
            out.closed.push(id);
        }
        if protocol.is_recovery_mode() {
            break;
        }
    }
    out
}

// ─── 3. Adjust ─────────────────────────────────────────────────────────

/// Collateral and stablecoin flows from adjust, open and the stabilizer.
#[derive(Debug, Clone, Default)]
pub struct IssuanceOutcome {
    pub accounts: Vec<AccountId>,
    pub collateral_added: f64,
    pub stable_issued: f64,
    pub issuance_fee: f64,
    pub tally: ActionTally,
}

pub fn adjust<P: Protocol>(ctx: &StepContext, pool: &mut AccountPool, protocol: &mut P) -> IssuanceOutcome {
    let mut out = IssuanceOutcome::default();
    let price = ctx.collateral_price;

    for id in pool.borrowers() {
        if !is_triggered(ctx, pool, protocol, id) {
            continue;
        }
        let (Some(account), Some(trove)) = (pool.get(id), protocol.trove(id)) else {
            continue;
        };
        let target = account.target_cr;
        let fell = account.deviation(trove.icr(price)) < 0.0;
        let via_collateral = processes::coin_flip(ctx.streams, ctx.period, id.0);

        match (fell, via_collateral) {
            (true, true) => {
                let add = trove.debt * target / price - trove.collateral;
                if let ActionOutcome::Accepted(_) = out.tally.attempt("adjust", id, protocol.adjust_trove(id, add, 0.0)) {
                    out.collateral_added += add;
                    out.accounts.push(id);
                }
            }
            (true, false) => {
                let repay = trove.debt - trove.collateral * price / target;
                if let Err(reason) = ensure_balance(protocol, id, repay) {
                    out.tally.attempt::<()>("adjust", id, Err(reason));
                    continue;
                }
                if let ActionOutcome::Accepted(_) = out.tally.attempt("adjust", id, protocol.adjust_trove(id, 0.0, -repay)) {
                    out.accounts.push(id);
                }
            }
            (false, true) => {
                let withdraw = trove.collateral - trove.debt * target / price;
                if let ActionOutcome::Accepted(_) = out.tally.attempt("adjust", id, protocol.adjust_trove(id, -withdraw, 0.0)) {
                    out.accounts.push(id);
                }
            }
            (false, false) => {
                // The fee is added to the debt, so draw less to land on the target
                let rate = protocol.borrowing_rate();
                let draw = (trove.collateral * price / target - trove.debt) / (1.0 + rate);
                if let ActionOutcome::Accepted(change) = out.tally.attempt("adjust", id, protocol.adjust_trove(id, 0.0, draw)) {
                    out.stable_issued += draw;
                    out.issuance_fee += change.fee;
                    out.accounts.push(id);
                }
            }
        }
    }
    out
}

// ─── 4. Open ───────────────────────────────────────────────────────────

pub fn open<P: Protocol>(ctx: &StepContext, pool: &mut AccountPool, protocol: &mut P) -> IssuanceOutcome {
    let mut out = IssuanceOutcome::default();
    let price = ctx.collateral_price;
    let min_net_debt = ctx.config.protocol.min_net_debt;

    let inactive: Vec<AccountId> = pool
        .inactive()
        .into_iter()
        .filter(|id| *id != AccountPool::WHALE)
        .collect();
    let rate = protocol.borrowing_rate();
    let count = processes::open_count(&ctx.config.troves, ctx.streams, ctx.period, ctx.stable_price, rate, inactive.len());

    for id in processes::choose(&inactive, count, ctx.streams, Stream::OpenSelection, ctx.period) {
        let draw = ctx.trove_model.draw(ctx.streams, ctx.period, id.0 as u64);
        let mut collateral = draw.collateral;
        let mut net_debt = collateral * price / draw.target_cr;
        if net_debt < min_net_debt {
            net_debt = min_net_debt;
            collateral = net_debt * draw.target_cr / price;
        }

        if let ActionOutcome::Accepted(change) = out.tally.attempt("open", id, protocol.open_trove(id, collateral, net_debt)) {
            pool.activate(id, draw.target_cr, draw.inattention, ctx.period);
            out.collateral_added += collateral;
            out.stable_issued += net_debt;
            out.issuance_fee += change.fee;
            out.accounts.push(id);
        }
    }
    out
}

// ─── 5. Stability pool ─────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct StabilityOutcome {
    pub previous: f64,
    pub target: f64,
    pub deposited: f64,
    pub withdrawn: f64,
    pub collateral_claimed: f64,
    pub reward_claimed: f64,
    pub tally: ActionTally,
}

pub fn update_stability_pool<P: Protocol>(
    ctx: &StepContext,
    pool: &AccountPool,
    protocol: &mut P,
    stability_return: f64,
) -> StabilityOutcome {
    let mut out = StabilityOutcome::default();

    // Realized gains are paid out before the pool is resized
    for id in protocol.stability_depositors() {
        if let ActionOutcome::Accepted(gains) = out.tally.attempt("stability", id, protocol.claim_stability_gains(id)) {
            out.collateral_claimed += gains.collateral;
            out.reward_claimed += gains.reward;
        }
    }

    let current = protocol.snapshot().sp_stable;
    let cfg = &ctx.config.stability;
    let shock = processes::normal_shock(cfg.shock_sd, ctx.streams, Stream::StabilityShock, ctx.period);
    let base = if current <= EPS && stability_return > ctx.natural_rate {
        ctx.config.protocol.min_net_debt
    } else {
        current
    };
    let target = (base * (1.0 + shock) * (1.0 + cfg.sensitivity * (stability_return - ctx.natural_rate))).max(0.0);
    out.previous = current;
    out.target = target;

    if target > current + EPS {
        let mut need = target - current;
        let holders: Vec<AccountId> = pool
            .borrowers()
            .into_iter()
            .filter(|id| protocol.stable_balance(*id) > EPS)
            .collect();
        let order = processes::choose(&holders, holders.len(), ctx.streams, Stream::StabilityDepositor, ctx.period);
        for id in order.into_iter().chain(std::iter::once(AccountPool::WHALE)) {
            if need <= EPS {
                break;
            }
            let amount = need.min(protocol.stable_balance(id));
            if amount <= EPS {
                continue;
            }
            if let ActionOutcome::Accepted(()) = out.tally.attempt("stability", id, protocol.provide_to_stability_pool(id, amount)) {
                out.deposited += amount;
                need -= amount;
            }
        }
    } else if target + EPS < current {
        let need = current - target;
        for id in protocol.stability_depositors() {
            let share = protocol.stability_deposit(id) / current;
            let amount = need * share;
            if amount <= EPS {
                continue;
            }
            if let ActionOutcome::Accepted(withdrawn) =
                out.tally.attempt("stability", id, protocol.withdraw_from_stability_pool(id, amount))
            {
                out.withdrawn += withdrawn;
            }
        }
    }
    out
}

// ─── 6. Price stabilizer / redemption ──────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct StabilizerOutcome {
    pub stable_price: f64,
    pub liquidity_demand: f64,
    pub redeemed: f64,
    /// Redemption fee valued in collateral-price terms
    pub redemption_fee: f64,
    /// Accounts whose troves were redeemed to zero
    pub redeemed_out: Vec<AccountId>,
    pub redemption_tally: ActionTally,
    pub issuance: IssuanceOutcome,
}

/// Open a trove at `arbitrage_cr` adding `shortfall` to supply, gas reserve and fee included.
fn open_arbitrage_trove<P: Protocol>(
    ctx: &StepContext,
    pool: &mut AccountPool,
    protocol: &mut P,
    issuance: &mut IssuanceOutcome,
    id: AccountId,
    shortfall: f64,
) -> bool {
    let cfg = &ctx.config.liquidity;
    let rate = protocol.borrowing_rate();
    let gas = ctx.config.protocol.gas_compensation;
    let net = ((shortfall - gas) / (1.0 + rate)).max(ctx.config.protocol.min_net_debt);
    let collateral = cfg.arbitrage_cr * (net * (1.0 + rate) + gas) / ctx.collateral_price;

    match issuance.tally.attempt("stabilizer", id, protocol.open_trove(id, collateral, net)) {
        ActionOutcome::Accepted(change) => {
            let inattention = ctx.trove_model.inattention(ctx.streams, ctx.period, id.0 as u64);
            pool.activate(id, cfg.arbitrage_cr, inattention, ctx.period);
            issuance.collateral_added += collateral;
            issuance.stable_issued += net;
            issuance.issuance_fee += change.fee;
            issuance.accounts.push(id);
            true
        }
        ActionOutcome::Rejected(reason) => {
            warn!(period = ctx.period, %reason, "ceiling arbitrage trove rejected");
            false
        }
    }
}

/// With every account already borrowing, the whale draws the shortfall
/// itself, posting collateral for the new debt at `arbitrage_cr`.
fn whale_draw<P: Protocol>(ctx: &StepContext, protocol: &mut P, issuance: &mut IssuanceOutcome, shortfall: f64) -> bool {
    let rate = protocol.borrowing_rate();
    let draw = shortfall / (1.0 + rate);
    let collateral = ctx.config.liquidity.arbitrage_cr * shortfall / ctx.collateral_price;

    match issuance.tally.attempt("stabilizer", AccountPool::WHALE, protocol.adjust_trove(AccountPool::WHALE, collateral, draw)) {
        ActionOutcome::Accepted(change) => {
            issuance.collateral_added += collateral;
            issuance.stable_issued += draw;
            issuance.issuance_fee += change.fee;
            true
        }
        ActionOutcome::Rejected(reason) => {
            warn!(period = ctx.period, %reason, "whale ceiling draw rejected");
            false
        }
    }
}

/// Price at which `float` stablecoin outside the stability pool meets demand `L · p^δ`.
pub fn clearing_price(float: f64, demand: f64, elasticity: f64) -> f64 {
    (float.max(EPS) / demand).powf(1.0 / elasticity)
}

pub fn stabilize_price<P: Protocol>(
    ctx: &StepContext,
    pool: &mut AccountPool,
    protocol: &mut P,
    previous_demand: f64,
) -> StabilizerOutcome {
    let cfg = &ctx.config.liquidity;
    let delta = cfg.elasticity;
    let shock = processes::normal_shock(cfg.shock_sd, ctx.streams, Stream::LiquidityShock, ctx.period);
    let demand = previous_demand * cfg.drift * (1.0 + shock);

    let sp = protocol.snapshot().sp_stable;
    let supply = protocol.stable_supply();
    let mut out = StabilizerOutcome {
        liquidity_demand: demand,
        stable_price: clearing_price(supply - sp, demand, delta),
        ..StabilizerOutcome::default()
    };

    // Ceiling: arbitrageurs borrow at a thin ratio and sell into the market
    let rate = protocol.borrowing_rate();
    let ceiling = cfg.ceiling + rate;
    if out.stable_price > ceiling {
        let shortfall = sp + demand * ceiling.powf(delta) - supply;
        let arbitrageur = pool.inactive().into_iter().find(|id| *id != AccountPool::WHALE);
        let issued = match arbitrageur {
            Some(id) => open_arbitrage_trove(ctx, pool, protocol, &mut out.issuance, id, shortfall),
            None => whale_draw(ctx, protocol, &mut out.issuance, shortfall),
        };
        if issued {
            out.stable_price = clearing_price(protocol.stable_supply() - sp, demand, delta);
        }
    }

    // Floor: redeem against the weakest troves until the price is back at 1 - fee
    let floor = 1.0 - protocol.redemption_rate();
    if out.stable_price < floor {
        let target_supply = sp + demand * floor.powf(delta);
        let amount = (supply - target_supply).min(protocol.stable_balance(AccountPool::WHALE));
        if amount > EPS {
            match out.redemption_tally.attempt("redeem", AccountPool::WHALE, protocol.redeem(AccountPool::WHALE, amount)) {
                ActionOutcome::Accepted(r) => {
                    for id in &r.closed {
                        pool.deactivate(*id, ctx.period);
                    }
                    out.redeemed = r.stable_redeemed;
                    out.redemption_fee = r.fee_collateral * ctx.collateral_price;
                    out.redeemed_out = r.closed;
                    out.stable_price = clearing_price(protocol.stable_supply() - sp, demand, delta);
                }
                ActionOutcome::Rejected(reason) => {
                    warn!(period = ctx.period, %reason, "floor redemption rejected");
                }
            }
        }
    }
    out
}

// ─── 7. Reward-token market ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RewardMarket {
    pub price: f64,
    pub annualized_earnings: f64,
    pub market_cap: f64,
}

/// Reward-token price for the period.
///
/// Warm-up periods follow the exogenous walk. Afterwards the walk is pulled
/// towards a fee-based fundamental value:
/// `discount · PE · annualized_earnings / total_supply`, blended with weight
/// `fee_feedback`.
pub fn reward_market(ctx: &StepContext, state: &SimulationState) -> RewardMarket {
    let cfg = &ctx.config.reward_token;
    let ppy = ctx.config.periods_per_year;
    let walked = processes::reward_walk_step(cfg, ctx.reward_price, ctx.streams, ctx.period);

    let window = (ctx.period as usize).clamp(1, ctx.config.stability.return_window);
    let revenue = state.trailing_revenue(ctx.period as usize + 1, window);
    let annualized_earnings = revenue / window as f64 * ppy;

    let price = if ctx.period <= cfg.warmup_periods {
        walked
    } else {
        let discount = (ctx.period as f64 / ppy).min(1.0);
        let fundamental = discount * cfg.pe_ratio * annualized_earnings / cfg.total_supply;
        ((1.0 - cfg.fee_feedback) * walked + cfg.fee_feedback * fundamental).max(0.0)
    };

    let circulating = cfg.total_supply / 3.0 * (1.0 - 0.5_f64.powf(ctx.period as f64 / ppy));
    RewardMarket {
        price,
        annualized_earnings,
        market_cap: price * circulating,
    }
}
