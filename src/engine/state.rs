//! Recharge lifecycle.
//!
//! `PENDING` is the only state with outgoing edges; `SUCCEEDED`, `FAILED` and
//! `CANCELED` are final. Every transition is a conditional update on the current
//! status, so the first writer wins and later writers observe a no-op.

use crate::model::{ProviderStatus, RechargeId, RechargeStatus};
use crate::store::{StoreError, StoreTx};

impl RechargeStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RechargeStatus::Pending)
    }

    pub fn can_transition_to(&self, to: RechargeStatus) -> bool {
        *self == RechargeStatus::Pending && to.is_terminal()
    }
}

/// Terminal state implied by a provider status, or `None` while the payment is
/// still unresolved.
pub fn target_status(observed: &ProviderStatus) -> Option<RechargeStatus> {
    match observed {
        ProviderStatus::Succeeded => Some(RechargeStatus::Succeeded),
        ProviderStatus::Canceled => Some(RechargeStatus::Canceled),
        ProviderStatus::RequiresPaymentMethod | ProviderStatus::RequiresConfirmation => {
            Some(RechargeStatus::Failed)
        }
        ProviderStatus::Other(_) => None,
    }
}

/// Result of a guarded transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// This caller moved the recharge out of `PENDING`.
    Applied,
    /// Someone else already did; carries the status found.
    AlreadyTerminal(RechargeStatus),
}

/// Moves `id` from `PENDING` to `to` inside `tx`.
pub(crate) async fn transition(
    tx: &mut dyn StoreTx,
    id: RechargeId,
    to: RechargeStatus,
) -> Result<Transition, StoreError> {
    debug_assert!(to.is_terminal(), "recharges only move to terminal states");

    if tx
        .transition_recharge(id, RechargeStatus::Pending, to)
        .await?
    {
        return Ok(Transition::Applied);
    }
    let current = tx
        .get_recharge(id)
        .await?
        .ok_or(StoreError::MissingRecharge(id))?;
    Ok(Transition::AlreadyTerminal(current.status))
}
