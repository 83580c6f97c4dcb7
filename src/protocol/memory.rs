use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::accounts::AccountId;
use crate::config::ProtocolConfig;
use crate::error::Revert;

use super::{GlobalSnapshot, Liquidation, Protocol, Redemption, StabilityGains, Trove, TroveChange};

const EPS: f64 = 1e-9;

/// In-memory reference chain.
///
/// A float model of a Liquity-style system: troves sorted by ICR, MCR/CCR
/// checks, recovery mode, stability-pool offset with redistribution of the
/// uncovered remainder, redemptions against the lowest ICR, and a base rate
/// raised by redemptions and decaying each period.
#[derive(Debug, Clone)]
pub struct MemoryProtocol {
    pub config: ProtocolConfig,
    price: f64,
    troves: BTreeMap<AccountId, Trove>,
    balances: BTreeMap<AccountId, f64>,
    deposits: BTreeMap<AccountId, f64>,
    collateral_gains: BTreeMap<AccountId, f64>,
    reward_gains: BTreeMap<AccountId, f64>,
    sp_collateral: f64,
    gas_pool: f64,
    /// Borrowing fees, held by the protocol's fee recipient
    fee_pool: f64,
    supply: f64,
    base_rate: f64,
    pub total_collateral_surplus: f64,
    pub total_redemption_fees: f64,
}

impl MemoryProtocol {
    pub fn new(config: ProtocolConfig, price: f64) -> Self {
        MemoryProtocol {
            config,
            price,
            troves: BTreeMap::new(),
            balances: BTreeMap::new(),
            deposits: BTreeMap::new(),
            collateral_gains: BTreeMap::new(),
            reward_gains: BTreeMap::new(),
            sp_collateral: 0.0,
            gas_pool: 0.0,
            fee_pool: 0.0,
            supply: 0.0,
            base_rate: 0.0,
            total_collateral_surplus: 0.0,
            total_redemption_fees: 0.0,
        }
    }

    pub fn base_rate(&self) -> f64 {
        self.base_rate
    }

    pub fn fee_pool(&self) -> f64 {
        self.fee_pool
    }

    pub fn total_collateral(&self) -> f64 {
        self.troves.values().map(|t| t.collateral).sum()
    }

    pub fn total_debt(&self) -> f64 {
        self.troves.values().map(|t| t.debt).sum()
    }

    fn ratio(collateral: f64, debt: f64, price: f64) -> f64 {
        if debt <= EPS {
            return f64::INFINITY;
        }
        collateral * price / debt
    }

    pub fn tcr(&self) -> f64 {
        Self::ratio(self.total_collateral(), self.total_debt(), self.price)
    }

    /// TCR after applying the given change to the system totals.
    fn tcr_after(&self, collateral_change: f64, debt_change: f64) -> f64 {
        Self::ratio(
            self.total_collateral() + collateral_change,
            self.total_debt() + debt_change,
            self.price,
        )
    }

    pub fn total_deposits(&self) -> f64 {
        self.deposits.values().sum()
    }

    /// Troves sorted by ascending ICR; ties broken by account id.
    pub fn sorted_troves(&self) -> Vec<(AccountId, f64)> {
        let mut list: Vec<(AccountId, f64)> = self
            .troves
            .iter()
            .map(|(id, t)| (*id, t.icr(self.price)))
            .collect();
        list.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal).then(a.0.cmp(&b.0)));
        list
    }

    fn credit(&mut self, account: AccountId, amount: f64) {
        *self.balances.entry(account).or_insert(0.0) += amount;
    }

    fn debit(&mut self, account: AccountId, amount: f64) -> Result<(), Revert> {
        let have = self.stable_balance(account);
        if have + EPS < amount {
            return Err(Revert::InsufficientBalance { have, need: amount });
        }
        self.balances.insert(account, (have - amount).max(0.0));
        Ok(())
    }

    fn is_liquidatable(&self, trove: &Trove, recovery: bool, tcr: f64, sp_total: f64) -> bool {
        let icr = trove.icr(self.price);
        if icr < self.config.mcr {
            return true;
        }
        recovery && icr < tcr && sp_total + EPS >= trove.debt
    }

    /// Spread debt and collateral over all remaining troves, pro-rata to collateral.
    fn redistribute(&mut self, debt: f64, collateral: f64) {
        let total: f64 = self.troves.values().map(|t| t.collateral).sum();
        if total <= EPS {
            return;
        }
        for trove in self.troves.values_mut() {
            let share = trove.collateral / total;
            trove.debt += debt * share;
            trove.collateral += collateral * share;
        }
    }

    /// Cancel `debt` against deposits and hand `collateral` to depositors, both pro-rata.
    fn offset(&mut self, debt: f64, collateral: f64) {
        let total = self.total_deposits();
        if total <= EPS {
            return;
        }
        let remaining = (1.0 - debt / total).max(0.0);
        for (account, deposit) in self.deposits.iter_mut() {
            let share = *deposit / total;
            *self.collateral_gains.entry(*account).or_insert(0.0) += collateral * share;
            *deposit *= remaining;
        }
        self.sp_collateral += collateral;
        self.supply -= debt;
    }

    fn liquidate_one(&mut self, account: AccountId, liquidator: AccountId) -> Option<Liquidation> {
        let recovery = self.is_recovery_mode();
        let trove = self.troves.remove(&account)?;
        let icr = trove.icr(self.price);
        let sp_total = self.total_deposits();

        let gas = self.config.gas_compensation.min(trove.debt);
        self.gas_pool -= gas;
        self.credit(liquidator, gas);

        let mut liquidation = Liquidation {
            account,
            collateral: trove.collateral,
            debt: trove.debt,
            debt_offset: 0.0,
            collateral_to_pool: 0.0,
            debt_redistributed: 0.0,
            collateral_redistributed: 0.0,
            surplus: 0.0,
        };

        if recovery && icr >= self.config.mcr {
            // Fully covered by the pool; collateral capped at MCR × debt
            let capped = (trove.debt * self.config.mcr / self.price).min(trove.collateral);
            self.offset(trove.debt, capped);
            liquidation.debt_offset = trove.debt;
            liquidation.collateral_to_pool = capped;
            liquidation.surplus = trove.collateral - capped;
            self.total_collateral_surplus += liquidation.surplus;
        } else {
            let debt_offset = trove.debt.min(sp_total);
            let collateral_offset = trove.collateral * debt_offset / trove.debt;
            self.offset(debt_offset, collateral_offset);
            liquidation.debt_offset = debt_offset;
            liquidation.collateral_to_pool = collateral_offset;
            liquidation.debt_redistributed = trove.debt - debt_offset;
            liquidation.collateral_redistributed = trove.collateral - collateral_offset;
            self.redistribute(liquidation.debt_redistributed, liquidation.collateral_redistributed);
        }
        Some(liquidation)
    }

    fn pay_out_gains(&mut self, account: AccountId) -> StabilityGains {
        let collateral = self.collateral_gains.remove(&account).unwrap_or(0.0);
        let reward = self.reward_gains.remove(&account).unwrap_or(0.0);
        self.sp_collateral = (self.sp_collateral - collateral).max(0.0);
        StabilityGains { collateral, reward }
    }
}

impl Protocol for MemoryProtocol {
    fn set_price(&mut self, price: f64) {
        self.price = price;
    }

    fn price(&self) -> f64 {
        self.price
    }

    fn advance_period(&mut self) {
        let decay = 0.5_f64.powf(1.0 / self.config.base_rate_half_life);
        self.base_rate *= decay;
    }

    fn open_trove(&mut self, account: AccountId, collateral: f64, net_debt: f64) -> Result<TroveChange, Revert> {
        if self.troves.contains_key(&account) {
            return Err(Revert::TroveExists(account));
        }
        if collateral <= 0.0 || !collateral.is_finite() {
            return Err(Revert::InvalidAmount(collateral));
        }
        if !net_debt.is_finite() || net_debt + EPS < self.config.min_net_debt {
            return Err(Revert::DebtBelowMinimum {
                debt: net_debt,
                min: self.config.min_net_debt,
            });
        }

        let recovery = self.is_recovery_mode();
        let fee = if recovery { 0.0 } else { net_debt * self.borrowing_rate() };
        let debt = net_debt + fee + self.config.gas_compensation;
        let icr = Self::ratio(collateral, debt, self.price);

        let min = if recovery { self.config.ccr } else { self.config.mcr };
        if icr < min {
            return Err(Revert::IcrBelowMinimum { icr, min });
        }
        if !recovery {
            let tcr = self.tcr_after(collateral, debt);
            if tcr < self.config.ccr {
                return Err(Revert::TcrBelowCcr {
                    tcr,
                    ccr: self.config.ccr,
                });
            }
        }

        self.troves.insert(account, Trove { collateral, debt });
        self.credit(account, net_debt);
        self.fee_pool += fee;
        self.gas_pool += self.config.gas_compensation;
        self.supply += debt;

        Ok(TroveChange {
            collateral_delta: collateral,
            debt_delta: debt,
            fee,
        })
    }

    fn close_trove(&mut self, account: AccountId) -> Result<TroveChange, Revert> {
        let trove = *self.troves.get(&account).ok_or(Revert::NoTrove(account))?;
        if self.troves.len() <= 1 {
            return Err(Revert::OnlyOneTrove);
        }
        if self.is_recovery_mode() {
            return Err(Revert::RecoveryMode);
        }
        let tcr = self.tcr_after(-trove.collateral, -trove.debt);
        if tcr < self.config.ccr {
            return Err(Revert::TcrBelowCcr {
                tcr,
                ccr: self.config.ccr,
            });
        }

        let gas = self.config.gas_compensation.min(trove.debt);
        self.debit(account, trove.debt - gas)?;
        self.gas_pool -= gas;
        self.supply -= trove.debt;
        self.troves.remove(&account);

        Ok(TroveChange {
            collateral_delta: -trove.collateral,
            debt_delta: -trove.debt,
            fee: 0.0,
        })
    }

    fn adjust_trove(&mut self, account: AccountId, collateral_delta: f64, debt_delta: f64) -> Result<TroveChange, Revert> {
        let trove = *self.troves.get(&account).ok_or(Revert::NoTrove(account))?;
        if collateral_delta.abs() <= EPS && debt_delta.abs() <= EPS {
            return Err(Revert::InvalidAmount(0.0));
        }
        if !collateral_delta.is_finite() || !debt_delta.is_finite() {
            return Err(Revert::InvalidAmount(collateral_delta + debt_delta));
        }

        let recovery = self.is_recovery_mode();
        if recovery && collateral_delta < 0.0 {
            return Err(Revert::RecoveryMode);
        }

        let fee = if debt_delta > 0.0 && !recovery {
            debt_delta * self.borrowing_rate()
        } else {
            0.0
        };
        let new_collateral = trove.collateral + collateral_delta;
        let new_debt = trove.debt + debt_delta + fee;
        if new_collateral <= EPS {
            return Err(Revert::InvalidAmount(collateral_delta));
        }
        let net_debt = new_debt - self.config.gas_compensation;
        if net_debt + EPS < self.config.min_net_debt {
            return Err(Revert::DebtBelowMinimum {
                debt: net_debt,
                min: self.config.min_net_debt,
            });
        }
        if debt_delta < 0.0 {
            let have = self.stable_balance(account);
            if have + EPS < -debt_delta {
                return Err(Revert::InsufficientBalance { have, need: -debt_delta });
            }
        }

        let old_icr = trove.icr(self.price);
        let new_icr = Self::ratio(new_collateral, new_debt, self.price);
        if recovery {
            if debt_delta > 0.0 && new_icr < self.config.ccr {
                return Err(Revert::IcrBelowMinimum {
                    icr: new_icr,
                    min: self.config.ccr,
                });
            }
            if new_icr + EPS < old_icr {
                return Err(Revert::IcrBelowMinimum { icr: new_icr, min: old_icr });
            }
        } else {
            if new_icr < self.config.mcr {
                return Err(Revert::IcrBelowMinimum {
                    icr: new_icr,
                    min: self.config.mcr,
                });
            }
            let tcr = self.tcr_after(collateral_delta, debt_delta + fee);
            if tcr < self.config.ccr {
                return Err(Revert::TcrBelowCcr {
                    tcr,
                    ccr: self.config.ccr,
                });
            }
        }

        if debt_delta < 0.0 {
            self.debit(account, -debt_delta)?;
        } else {
            self.credit(account, debt_delta);
        }
        self.fee_pool += fee;
        self.supply += debt_delta + fee;
        self.troves.insert(
            account,
            Trove {
                collateral: new_collateral,
                debt: new_debt,
            },
        );

        Ok(TroveChange {
            collateral_delta,
            debt_delta: debt_delta + fee,
            fee,
        })
    }

    fn trove(&self, account: AccountId) -> Option<Trove> {
        self.troves.get(&account).copied()
    }

    fn has_pending_liquidations(&self) -> bool {
        if self.troves.len() <= 1 {
            return false;
        }
        // Liquidation walks up from the lowest ICR, so only the head matters
        let Some((account, _)) = self.sorted_troves().into_iter().next() else {
            return false;
        };
        let recovery = self.is_recovery_mode();
        let tcr = self.tcr();
        let sp_total = self.total_deposits();
        self.troves
            .get(&account)
            .map(|t| self.is_liquidatable(t, recovery, tcr, sp_total))
            .unwrap_or(false)
    }

    fn liquidate_troves(&mut self, liquidator: AccountId, max: usize) -> Result<Vec<Liquidation>, Revert> {
        if !self.has_pending_liquidations() {
            return Err(Revert::NothingToLiquidate);
        }

        let mut liquidated = Vec::new();
        // Recovery mode and pool size are re-read before every trove
        while liquidated.len() < max && self.has_pending_liquidations() {
            let Some((account, _)) = self.sorted_troves().into_iter().next() else {
                break;
            };
            match self.liquidate_one(account, liquidator) {
                Some(l) => liquidated.push(l),
                None => break,
            }
        }

        if liquidated.is_empty() {
            return Err(Revert::NothingToLiquidate);
        }
        Ok(liquidated)
    }

    fn redeem(&mut self, redeemer: AccountId, amount: f64) -> Result<Redemption, Revert> {
        if amount <= 0.0 || !amount.is_finite() {
            return Err(Revert::InvalidAmount(amount));
        }
        let have = self.stable_balance(redeemer);
        if have + EPS < amount {
            return Err(Revert::InsufficientBalance { have, need: amount });
        }
        if self.tcr() < self.config.mcr {
            return Err(Revert::RedemptionBlocked);
        }

        let supply_before = self.supply;
        let gas = self.config.gas_compensation;
        let mut remaining = amount;
        let mut redemption = Redemption::default();

        for (account, icr) in self.sorted_troves() {
            if remaining <= EPS {
                break;
            }
            if icr < self.config.mcr {
                continue;
            }
            let Some(trove) = self.troves.get(&account).copied() else {
                continue;
            };
            let net = trove.debt - gas;
            let take = remaining.min(net);
            let left = net - take;
            if left > EPS && left + EPS < self.config.min_net_debt {
                // A partial redemption may not leave the trove under the minimum
                break;
            }

            let collateral = take / self.price;
            remaining -= take;
            redemption.stable_redeemed += take;
            redemption.collateral_drawn += collateral;

            if left <= EPS {
                // Redeemed down to the gas reserve: trove closes, gas burned
                let surplus = (trove.collateral - collateral).max(0.0);
                self.troves.remove(&account);
                self.gas_pool -= gas;
                self.supply -= gas;
                self.total_collateral_surplus += surplus;
                redemption.closed.push(account);
            } else if let Some(t) = self.troves.get_mut(&account) {
                t.collateral -= collateral;
                t.debt -= take;
            }
        }

        if redemption.stable_redeemed <= EPS {
            return Err(Revert::NothingToRedeem);
        }

        self.debit(redeemer, redemption.stable_redeemed)?;
        self.supply -= redemption.stable_redeemed;
        if supply_before > EPS {
            let fraction = redemption.stable_redeemed / supply_before;
            self.base_rate = (self.base_rate + fraction / self.config.redemption_beta).min(1.0);
        }
        redemption.fee_collateral = redemption.collateral_drawn * self.redemption_rate();
        self.total_redemption_fees += redemption.fee_collateral;

        Ok(redemption)
    }

    fn provide_to_stability_pool(&mut self, account: AccountId, amount: f64) -> Result<(), Revert> {
        if amount <= 0.0 || !amount.is_finite() {
            return Err(Revert::InvalidAmount(amount));
        }
        self.debit(account, amount)?;
        self.pay_out_gains(account);
        *self.deposits.entry(account).or_insert(0.0) += amount;
        Ok(())
    }

    fn withdraw_from_stability_pool(&mut self, account: AccountId, amount: f64) -> Result<f64, Revert> {
        if amount <= 0.0 || !amount.is_finite() {
            return Err(Revert::InvalidAmount(amount));
        }
        let deposit = self.stability_deposit(account);
        if deposit <= EPS {
            return Err(Revert::NoDeposit(account));
        }
        let price = self.price;
        if self.troves.len() > 1 && self.troves.values().any(|t| t.icr(price) < self.config.mcr) {
            return Err(Revert::PendingLiquidations);
        }

        self.pay_out_gains(account);
        let withdrawn = amount.min(deposit);
        let left = deposit - withdrawn;
        if left <= EPS {
            self.deposits.remove(&account);
        } else {
            self.deposits.insert(account, left);
        }
        self.credit(account, withdrawn);
        Ok(withdrawn)
    }

    fn claim_stability_gains(&mut self, account: AccountId) -> Result<StabilityGains, Revert> {
        if self.stability_deposit(account) <= EPS
            && !self.collateral_gains.contains_key(&account)
            && !self.reward_gains.contains_key(&account)
        {
            return Err(Revert::NoDeposit(account));
        }
        Ok(self.pay_out_gains(account))
    }

    fn stability_deposit(&self, account: AccountId) -> f64 {
        self.deposits.get(&account).copied().unwrap_or(0.0)
    }

    fn stability_depositors(&self) -> Vec<AccountId> {
        self.deposits
            .iter()
            .filter(|(_, d)| **d > EPS)
            .map(|(id, _)| *id)
            .collect()
    }

    fn issue_rewards(&mut self, amount: f64) -> f64 {
        let total = self.total_deposits();
        if total <= EPS || amount <= 0.0 {
            return 0.0;
        }
        for (account, deposit) in &self.deposits {
            *self.reward_gains.entry(*account).or_insert(0.0) += amount * deposit / total;
        }
        amount
    }

    fn transfer_stable(&mut self, from: AccountId, to: AccountId, amount: f64) -> Result<(), Revert> {
        if amount <= 0.0 || !amount.is_finite() {
            return Err(Revert::InvalidAmount(amount));
        }
        self.debit(from, amount)?;
        self.credit(to, amount);
        Ok(())
    }

    fn stable_balance(&self, account: AccountId) -> f64 {
        self.balances.get(&account).copied().unwrap_or(0.0)
    }

    fn stable_supply(&self) -> f64 {
        self.supply
    }

    fn borrowing_rate(&self) -> f64 {
        (self.config.borrowing_fee_floor + self.base_rate).min(self.config.max_borrowing_fee)
    }

    fn redemption_rate(&self) -> f64 {
        (self.config.redemption_fee_floor + self.base_rate).min(1.0)
    }

    fn is_recovery_mode(&self) -> bool {
        self.tcr() < self.config.ccr
    }

    fn snapshot(&self) -> GlobalSnapshot {
        let last_icr = self.sorted_troves().first().map(|(_, icr)| *icr).unwrap_or(0.0);
        GlobalSnapshot {
            collateral_price: self.price,
            num_troves: self.troves.len(),
            total_collateral: self.total_collateral(),
            total_debt: self.total_debt(),
            tcr: self.tcr(),
            recovery_mode: self.is_recovery_mode(),
            last_icr,
            sp_stable: self.total_deposits(),
            sp_collateral: self.sp_collateral,
            stable_supply: self.supply,
        }
    }
}
