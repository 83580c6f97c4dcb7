//! Error types for the harness.
//!
//! Two layers: [`Revert`] is what a protocol call answers when it refuses an
//! action (recovered locally by the step that issued it), [`SimError`] is
//! what ends a run.

use crate::accounts::AccountId;

/// Reason a protocol call refused an action.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Revert {
    #[error("account {0} already has an active trove")]
    TroveExists(AccountId),

    #[error("account {0} has no active trove")]
    NoTrove(AccountId),

    #[error("ICR {icr:.4} below minimum {min:.4}")]
    IcrBelowMinimum { icr: f64, min: f64 },

    #[error("operation would drop TCR to {tcr:.4}, below CCR {ccr:.4}")]
    TcrBelowCcr { tcr: f64, ccr: f64 },

    #[error("operation not permitted during recovery mode")]
    RecoveryMode,

    #[error("net debt {debt:.2} below minimum {min:.2}")]
    DebtBelowMinimum { debt: f64, min: f64 },

    #[error("insufficient balance: have {have:.2}, need {need:.2}")]
    InsufficientBalance { have: f64, need: f64 },

    #[error("nothing to liquidate")]
    NothingToLiquidate,

    #[error("only one trove in the system")]
    OnlyOneTrove,

    #[error("cannot redeem when TCR < MCR")]
    RedemptionBlocked,

    #[error("no trove eligible for redemption")]
    NothingToRedeem,

    #[error("account {0} has no stability deposit")]
    NoDeposit(AccountId),

    #[error("cannot withdraw while troves with ICR < MCR are pending liquidation")]
    PendingLiquidations,

    #[error("invalid amount {0}")]
    InvalidAmount(f64),
}

/// Fatal run errors.
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("setup failed: {0}")]
    Setup(String),

    #[error("invariant violated in period {period}: {detail}")]
    InvariantViolation { period: u64, detail: String },

    #[error("{failed} of {runs} runs aborted")]
    BatchFailed { failed: usize, runs: usize },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type SimResult<T> = Result<T, SimError>;
