//! Read side: balances, wallet audit and paginated history.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{Engine, EngineError, ValidationError};
use crate::amount::{Cents, Liters};
use crate::model::{
    Dispense, DisplayStatus, Identity, LedgerEntry, MachineId, Recharge, UserId,
};
use crate::store::{Cursor, Page, PageRequest, StoreError};

const DEFAULT_HISTORY_LIMIT: usize = 20;
const MAX_LEDGER_LIMIT: usize = 100;
const MAX_RECHARGE_LIMIT: usize = 50;
const MAX_DISPENSE_LIMIT: usize = 100;
const DEFAULT_ACTIVITY_LIMIT: usize = 100;
const MAX_ACTIVITY_LIMIT: usize = 200;

/// Cached balance against the ledger it is derived from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WalletAudit {
    pub user_id: UserId,
    pub balance: Cents,
    pub ledger_sum: Cents,
    pub consistent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityKind {
    Recharge,
    Dispense,
}

/// One row of the combined activity feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivityItem {
    pub kind: ActivityKind,
    pub id: String,
    pub title: String,
    pub amount: Cents,
    pub currency: String,
    pub status: DisplayStatus,
    pub liters: Option<Liters>,
    pub machine_id: Option<MachineId>,
    pub created_at: DateTime<Utc>,
}

impl From<Recharge> for ActivityItem {
    fn from(recharge: Recharge) -> Self {
        Self {
            kind: ActivityKind::Recharge,
            id: recharge.id.to_string(),
            title: format!("Recharge via {}", recharge.provider.display_name()),
            amount: recharge.amount,
            currency: recharge.currency,
            status: recharge.status.into(),
            liters: None,
            machine_id: None,
            created_at: recharge.created_at,
        }
    }
}

impl From<Dispense> for ActivityItem {
    fn from(dispense: Dispense) -> Self {
        Self {
            kind: ActivityKind::Dispense,
            id: dispense.id.to_string(),
            title: format!("Water dispense • {}L", dispense.liters),
            amount: dispense.total,
            currency: dispense.currency,
            status: dispense.status.into(),
            liters: Some(dispense.liters),
            machine_id: dispense.machine_id,
            created_at: dispense.created_at,
        }
    }
}

fn clamp_limit(requested: Option<usize>, default: usize, max: usize) -> usize {
    requested.unwrap_or(default).clamp(1, max)
}

fn page_request(limit: usize, cursor: Option<Cursor>) -> PageRequest {
    match cursor {
        Some(cursor) => PageRequest::after(limit, cursor),
        None => PageRequest::first(limit),
    }
}

fn page_error(err: StoreError) -> EngineError {
    match err {
        StoreError::InvalidCursor(cursor) => ValidationError::Cursor(cursor).into(),
        other => other.into(),
    }
}

impl Engine {
    /// Current balance of the caller. The wallet is created on first access.
    pub async fn balance(&self, identity: &Identity) -> Result<Cents, EngineError> {
        let mut tx = self.store.begin().await?;
        let balance = tx.balance(&identity.user_id).await?;
        tx.commit().await?;
        Ok(balance)
    }

    /// Compares the stored balance with the signed sum of the ledger.
    pub async fn audit_wallet(&self, user: &UserId) -> Result<WalletAudit, EngineError> {
        let mut tx = self.store.begin().await?;
        let balance = tx.balance(user).await?;
        let ledger_sum = tx.ledger_sum(user).await?;
        tx.commit().await?;
        Ok(WalletAudit {
            user_id: user.clone(),
            balance,
            ledger_sum,
            consistent: balance == ledger_sum,
        })
    }

    pub async fn ledger_history(
        &self,
        identity: &Identity,
        limit: Option<usize>,
        cursor: Option<Cursor>,
    ) -> Result<Page<LedgerEntry>, EngineError> {
        let page = page_request(
            clamp_limit(limit, DEFAULT_HISTORY_LIMIT, MAX_LEDGER_LIMIT),
            cursor,
        );
        let mut tx = self.store.begin().await?;
        tx.list_ledger(&identity.user_id, &page)
            .await
            .map_err(page_error)
    }

    pub async fn recharge_history(
        &self,
        identity: &Identity,
        limit: Option<usize>,
        cursor: Option<Cursor>,
    ) -> Result<Page<Recharge>, EngineError> {
        let page = page_request(
            clamp_limit(limit, DEFAULT_HISTORY_LIMIT, MAX_RECHARGE_LIMIT),
            cursor,
        );
        let mut tx = self.store.begin().await?;
        tx.list_recharges(&identity.user_id, &page)
            .await
            .map_err(page_error)
    }

    pub async fn dispense_history(
        &self,
        identity: &Identity,
        limit: Option<usize>,
        cursor: Option<Cursor>,
    ) -> Result<Page<Dispense>, EngineError> {
        let page = page_request(
            clamp_limit(limit, DEFAULT_HISTORY_LIMIT, MAX_DISPENSE_LIMIT),
            cursor,
        );
        let mut tx = self.store.begin().await?;
        tx.list_dispenses(&identity.user_id, &page)
            .await
            .map_err(page_error)
    }

    /// Recharges and dispenses merged newest-first.
    pub async fn activity(
        &self,
        identity: &Identity,
        limit: Option<usize>,
    ) -> Result<Vec<ActivityItem>, EngineError> {
        let limit = clamp_limit(limit, DEFAULT_ACTIVITY_LIMIT, MAX_ACTIVITY_LIMIT);
        let page = PageRequest::first(limit);

        let mut tx = self.store.begin().await?;
        let recharges = tx.list_recharges(&identity.user_id, &page).await?;
        let dispenses = tx.list_dispenses(&identity.user_id, &page).await?;
        drop(tx);

        let mut items: Vec<ActivityItem> = recharges
            .items
            .into_iter()
            .map(ActivityItem::from)
            .chain(dispenses.items.into_iter().map(ActivityItem::from))
            .collect();
        // Stable sort keeps store order for equal timestamps.
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        items.truncate(limit);
        Ok(items)
    }
}
