//! Transactional storage seam.
//!
//! Every multi-record mutation runs inside one [`StoreTx`]. A transaction that is
//! dropped without [`StoreTx::commit`] leaves no trace, so wallet balance, ledger,
//! recharge status and dispense rows can never be observed out of sync.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::amount::Cents;
use crate::model::{
    Dispense, LedgerEntry, NewDispense, NewLedgerEntry, NewRecharge, Recharge, RechargeId,
    RechargeStatus, UserId, WebhookEvent,
};

mod memory;
pub use memory::MemoryStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("balance of user {0} would become negative")]
    NegativeBalance(UserId),

    #[error("balance of user {0} would overflow")]
    BalanceOverflow(UserId),

    #[error("recharge {0} does not exist")]
    MissingRecharge(RechargeId),

    #[error("unknown cursor '{0}'")]
    InvalidCursor(String),

    #[error("transaction already committed")]
    Finished,

    #[error("{0}")]
    Backend(String),
}

/// Opaque pagination cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(raw: impl Into<String>) -> Self {
        Cursor(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub limit: usize,
    pub cursor: Option<Cursor>,
}

impl PageRequest {
    pub fn first(limit: usize) -> Self {
        Self {
            limit,
            cursor: None,
        }
    }

    pub fn after(limit: usize, cursor: Cursor) -> Self {
        Self {
            limit,
            cursor: Some(cursor),
        }
    }
}

/// One page of a newest-first listing.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<Cursor>,
    pub has_more: bool,
}

/// A handle to the transactional store. Shared by every engine component.
#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError>;
}

/// One atomic unit of work.
#[async_trait]
pub trait StoreTx: Send {
    /// Current balance; creates an empty wallet on first access.
    async fn balance(&mut self, user: &UserId) -> Result<Cents, StoreError>;

    /// Applies a relative delta and returns the new balance. Fails with
    /// [`StoreError::NegativeBalance`] rather than going below zero.
    async fn adjust_balance(&mut self, user: &UserId, delta: Cents) -> Result<Cents, StoreError>;

    /// Fails with [`StoreError::UniqueViolation`] when an entry with the same
    /// `(user, external_id)` already exists.
    async fn append_ledger(&mut self, entry: NewLedgerEntry) -> Result<LedgerEntry, StoreError>;

    async fn find_ledger_by_external(
        &mut self,
        user: &UserId,
        external_id: &str,
    ) -> Result<Option<LedgerEntry>, StoreError>;

    /// Signed sum of every posted entry of `user`.
    async fn ledger_sum(&mut self, user: &UserId) -> Result<Cents, StoreError>;

    async fn insert_recharge(&mut self, recharge: NewRecharge) -> Result<Recharge, StoreError>;

    async fn get_recharge(&mut self, id: RechargeId) -> Result<Option<Recharge>, StoreError>;

    async fn find_recharge_by_payment_id(
        &mut self,
        provider_payment_id: &str,
    ) -> Result<Option<Recharge>, StoreError>;

    async fn set_provider_payment_id(
        &mut self,
        id: RechargeId,
        provider_payment_id: &str,
    ) -> Result<(), StoreError>;

    /// Conditional update: moves `id` to `to` only if its status is `from`.
    /// Returns whether the row changed.
    async fn transition_recharge(
        &mut self,
        id: RechargeId,
        from: RechargeStatus,
        to: RechargeStatus,
    ) -> Result<bool, StoreError>;

    /// Pending recharges that carry a provider reference, oldest first.
    async fn pending_recharges(
        &mut self,
        user: Option<&UserId>,
        limit: usize,
    ) -> Result<Vec<Recharge>, StoreError>;

    async fn insert_dispense(&mut self, dispense: NewDispense) -> Result<Dispense, StoreError>;

    async fn webhook_event_exists(&mut self, event_id: &str) -> Result<bool, StoreError>;

    /// Returns `false` when the event id was already recorded.
    async fn insert_webhook_event(&mut self, event: WebhookEvent) -> Result<bool, StoreError>;

    async fn list_ledger(
        &mut self,
        user: &UserId,
        page: &PageRequest,
    ) -> Result<Page<LedgerEntry>, StoreError>;

    async fn list_recharges(
        &mut self,
        user: &UserId,
        page: &PageRequest,
    ) -> Result<Page<Recharge>, StoreError>;

    async fn list_dispenses(
        &mut self,
        user: &UserId,
        page: &PageRequest,
    ) -> Result<Page<Dispense>, StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;
}
