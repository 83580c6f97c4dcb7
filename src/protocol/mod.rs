//! The protocol boundary.
//!
//! The harness only ever talks to the protocol through [`Protocol`]. Every
//! state-changing call answers `Result<_, Revert>`; a revert means "this
//! action was refused", never "the run is broken".

mod memory;

pub use memory::MemoryProtocol;

use crate::accounts::AccountId;
use crate::error::Revert;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Trove {
    pub collateral: f64,
    /// Entire debt, gas compensation and borrowing fee included
    pub debt: f64,
}

impl Trove {
    /// Individual collateral ratio at `price`.
    pub fn icr(&self, price: f64) -> f64 {
        if self.debt <= 0.0 {
            return f64::INFINITY;
        }
        self.collateral * price / self.debt
    }
}

/// Effect of an accepted open/adjust/close.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TroveChange {
    pub collateral_delta: f64,
    pub debt_delta: f64,
    /// Borrowing fee charged, in stablecoin
    pub fee: f64,
}

/// One liquidated trove.
#[derive(Debug, Clone, PartialEq)]
pub struct Liquidation {
    pub account: AccountId,
    pub collateral: f64,
    pub debt: f64,
    /// Debt cancelled against stability-pool deposits
    pub debt_offset: f64,
    /// Collateral sent to the stability pool
    pub collateral_to_pool: f64,
    pub debt_redistributed: f64,
    pub collateral_redistributed: f64,
    /// Collateral above the liquidation cap returned to the owner
    pub surplus: f64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Redemption {
    pub stable_redeemed: f64,
    pub collateral_drawn: f64,
    /// Part of `collateral_drawn` kept by the protocol as the redemption fee
    pub fee_collateral: f64,
    /// Accounts whose troves were redeemed down to zero and closed
    pub closed: Vec<AccountId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StabilityGains {
    pub collateral: f64,
    pub reward: f64,
}

/// Point-in-time read of the protocol's global state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GlobalSnapshot {
    pub collateral_price: f64,
    pub num_troves: usize,
    pub total_collateral: f64,
    pub total_debt: f64,
    pub tcr: f64,
    pub recovery_mode: bool,
    /// ICR of the lowest-collateralized trove, 0 when no trove exists
    pub last_icr: f64,
    pub sp_stable: f64,
    pub sp_collateral: f64,
    pub stable_supply: f64,
}

/// Capability set the harness consumes from a deployed protocol.
///
/// Calls are synchronous and blocking. Accounts are assumed pre-funded with
/// collateral; stablecoin balances live in the protocol.
pub trait Protocol {
    fn set_price(&mut self, price: f64);
    fn price(&self) -> f64;
    /// Let one period of time pass (fee base-rate decay).
    fn advance_period(&mut self);

    fn open_trove(&mut self, account: AccountId, collateral: f64, net_debt: f64) -> Result<TroveChange, Revert>;
    fn close_trove(&mut self, account: AccountId) -> Result<TroveChange, Revert>;
    /// Positive deltas add collateral / draw debt, negative ones withdraw / repay.
    fn adjust_trove(&mut self, account: AccountId, collateral_delta: f64, debt_delta: f64) -> Result<TroveChange, Revert>;
    fn trove(&self, account: AccountId) -> Option<Trove>;
    fn icr(&self, account: AccountId) -> Option<f64> {
        self.trove(account).map(|t| t.icr(self.price()))
    }

    fn has_pending_liquidations(&self) -> bool;
    /// Liquidate up to `max` eligible troves, lowest ICR first.
    fn liquidate_troves(&mut self, liquidator: AccountId, max: usize) -> Result<Vec<Liquidation>, Revert>;
    /// Redeem `amount` stablecoin against the lowest-ICR troves.
    fn redeem(&mut self, redeemer: AccountId, amount: f64) -> Result<Redemption, Revert>;

    fn provide_to_stability_pool(&mut self, account: AccountId, amount: f64) -> Result<(), Revert>;
    /// Returns the amount actually withdrawn (capped at the deposit).
    fn withdraw_from_stability_pool(&mut self, account: AccountId, amount: f64) -> Result<f64, Revert>;
    fn claim_stability_gains(&mut self, account: AccountId) -> Result<StabilityGains, Revert>;
    fn stability_deposit(&self, account: AccountId) -> f64;
    fn stability_depositors(&self) -> Vec<AccountId>;
    /// Airdrop reward tokens to depositors pro-rata; returns the amount distributed.
    fn issue_rewards(&mut self, amount: f64) -> f64;

    fn transfer_stable(&mut self, from: AccountId, to: AccountId, amount: f64) -> Result<(), Revert>;
    fn stable_balance(&self, account: AccountId) -> f64;
    fn stable_supply(&self) -> f64;

    fn borrowing_rate(&self) -> f64;
    fn redemption_rate(&self) -> f64;
    fn is_recovery_mode(&self) -> bool;
    fn snapshot(&self) -> GlobalSnapshot;
}
