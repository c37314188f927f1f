//! Error types for wallet operations.

use thiserror::Error;

use crate::amount::{Cents, Liters};
use crate::model::{MachineId, RechargeId};
use crate::signing::LinkFailure;
use crate::store::StoreError;

use super::provider::ProviderError;

/// Top-level error returned by [`Engine`](super::Engine) operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    InsufficientFunds(#[from] InsufficientFunds),

    #[error("{0} not found")]
    NotFound(#[from] NotFound),

    #[error("signed link rejected: {0}")]
    Link(#[from] LinkFailure),

    #[error("payment provider unavailable: {0}")]
    Provider(#[from] ProviderError),

    #[error("storage failure: {0}")]
    Store(#[from] StoreError),
}

/// Malformed input, rejected before any mutation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("amount {amount} is below the minimum of {min}")]
    AmountBelowMinimum { amount: Cents, min: Cents },

    #[error("amount {amount} is above the maximum of {max}")]
    AmountAboveMaximum { amount: Cents, max: Cents },

    #[error("{liters}L is not an allowed quantity (allowed: {allowed:?})")]
    Liters { liters: Liters, allowed: Vec<Liters> },

    #[error("{liters}L prices at {total}, which is not a chargeable total")]
    NonPositiveTotal { liters: Liters, total: Cents },

    #[error("invalid machine id '{0}'")]
    MachineId(String),

    #[error("invalid page cursor '{0}'")]
    Cursor(String),

    #[error("malformed signed link: {0}")]
    Link(String),
}

/// The wallet cannot cover a debit. Nothing was mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("insufficient funds: balance {balance}, total {total}, short by {needed}")]
pub struct InsufficientFunds {
    /// Shortfall: `total - balance`.
    pub needed: Cents,
    pub balance: Cents,
    pub total: Cents,
}

/// A referenced record does not exist or is not visible to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotFound {
    #[error("recharge {0}")]
    Recharge(RechargeId),

    #[error("recharge for payment {0}")]
    Payment(String),

    #[error("machine {0}")]
    Machine(MachineId),
}
