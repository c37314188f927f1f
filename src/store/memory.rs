use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use super::{Cursor, Page, PageRequest, Store, StoreError, StoreTx};
use crate::amount::Cents;
use crate::model::{
    Dispense, DispenseId, EntryStatus, LedgerEntry, LedgerEntryId, NewDispense, NewLedgerEntry,
    NewRecharge, Recharge, RechargeId, RechargeStatus, UserId, WebhookEvent,
};

/// In-process store with serializable transactions.
///
/// A transaction holds the table lock until it is committed or dropped, and
/// records an undo log so that a dropped transaction restores every row it
/// touched.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Default)]
struct Tables {
    wallets: HashMap<UserId, Cents>,
    /// Append-only, in insertion order.
    ledger: Vec<LedgerEntry>,
    ledger_keys: HashSet<(UserId, String)>,
    /// In creation order.
    recharges: Vec<Recharge>,
    recharge_index: HashMap<RechargeId, usize>,
    payment_index: HashMap<String, RechargeId>,
    dispenses: Vec<Dispense>,
    webhook_events: HashMap<String, WebhookEvent>,
}

impl Tables {
    fn recharge_mut(&mut self, id: RechargeId) -> Result<(usize, &mut Recharge), StoreError> {
        let idx = *self
            .recharge_index
            .get(&id)
            .ok_or(StoreError::MissingRecharge(id))?;
        Ok((idx, &mut self.recharges[idx]))
    }
}

enum Undo {
    Wallet {
        user: UserId,
        previous: Option<Cents>,
    },
    LedgerAppend,
    RechargeInsert,
    RechargeStatus {
        idx: usize,
        previous: RechargeStatus,
    },
    PaymentId {
        idx: usize,
        previous: Option<String>,
    },
    DispenseInsert,
    WebhookInsert {
        event_id: String,
    },
}

struct MemoryTx {
    tables: OwnedMutexGuard<Tables>,
    undo: Vec<Undo>,
    committed: bool,
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        let tables = self.tables.clone().lock_owned().await;
        Ok(Box::new(MemoryTx {
            tables,
            undo: Vec::new(),
            committed: false,
        }))
    }
}

impl MemoryTx {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.committed {
            Err(StoreError::Finished)
        } else {
            Ok(())
        }
    }

    fn rollback(&mut self) {
        let tables = &mut *self.tables;
        while let Some(undo) = self.undo.pop() {
            match undo {
                Undo::Wallet { user, previous } => match previous {
                    Some(balance) => {
                        tables.wallets.insert(user, balance);
                    }
                    None => {
                        tables.wallets.remove(&user);
                    }
                },
                Undo::LedgerAppend => {
                    if let Some(LedgerEntry {
                        user_id,
                        external_id: Some(external_id),
                        ..
                    }) = tables.ledger.pop()
                    {
                        tables.ledger_keys.remove(&(user_id, external_id));
                    }
                }
                Undo::RechargeInsert => {
                    if let Some(recharge) = tables.recharges.pop() {
                        tables.recharge_index.remove(&recharge.id);
                    }
                }
                Undo::RechargeStatus { idx, previous } => {
                    tables.recharges[idx].status = previous;
                }
                Undo::PaymentId { idx, previous } => {
                    let recharge = &mut tables.recharges[idx];
                    if let Some(current) = recharge.provider_payment_id.take() {
                        tables.payment_index.remove(&current);
                    }
                    if let Some(previous) = &previous {
                        tables.payment_index.insert(previous.clone(), recharge.id);
                    }
                    recharge.provider_payment_id = previous;
                }
                Undo::DispenseInsert => {
                    tables.dispenses.pop();
                }
                Undo::WebhookInsert { event_id } => {
                    tables.webhook_events.remove(&event_id);
                }
            }
        }
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if !self.committed && !self.undo.is_empty() {
            debug!(writes = self.undo.len(), "rolling back uncommitted transaction");
            self.rollback();
        }
    }
}

/// Newest-first page over `rows` (given oldest-first), starting after `cursor`.
fn paginate<T: Clone>(
    rows: Vec<&T>,
    id_of: impl Fn(&T) -> String,
    page: &PageRequest,
) -> Result<Page<T>, StoreError> {
    let mut newest_first = rows.into_iter().rev().peekable();
    if let Some(cursor) = &page.cursor {
        let found = newest_first
            .by_ref()
            .any(|row| id_of(row) == cursor.as_str());
        if !found {
            return Err(StoreError::InvalidCursor(cursor.as_str().to_string()));
        }
    }

    let items: Vec<T> = newest_first.by_ref().take(page.limit).cloned().collect();
    let has_more = newest_first.peek().is_some();
    let next_cursor = match items.last() {
        Some(last) if has_more => Some(Cursor::new(id_of(last))),
        _ => None,
    };
    Ok(Page {
        items,
        next_cursor,
        has_more,
    })
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn balance(&mut self, user: &UserId) -> Result<Cents, StoreError> {
        self.ensure_open()?;
        if let Some(balance) = self.tables.wallets.get(user) {
            return Ok(*balance);
        }
        self.tables.wallets.insert(user.clone(), Cents::ZERO);
        self.undo.push(Undo::Wallet {
            user: user.clone(),
            previous: None,
        });
        Ok(Cents::ZERO)
    }

    async fn adjust_balance(&mut self, user: &UserId, delta: Cents) -> Result<Cents, StoreError> {
        self.ensure_open()?;
        let previous = self.tables.wallets.get(user).copied();
        let updated = previous
            .unwrap_or(Cents::ZERO)
            .checked_add(delta)
            .ok_or_else(|| StoreError::BalanceOverflow(user.clone()))?;
        if updated < Cents::ZERO {
            return Err(StoreError::NegativeBalance(user.clone()));
        }
        self.tables.wallets.insert(user.clone(), updated);
        self.undo.push(Undo::Wallet {
            user: user.clone(),
            previous,
        });
        Ok(updated)
    }

    async fn append_ledger(&mut self, entry: NewLedgerEntry) -> Result<LedgerEntry, StoreError> {
        self.ensure_open()?;
        let tables = &mut *self.tables;
        if let Some(external_id) = &entry.external_id {
            let key = (entry.user_id.clone(), external_id.clone());
            if !tables.ledger_keys.insert(key) {
                return Err(StoreError::UniqueViolation(format!(
                    "ledger ({}, {external_id})",
                    entry.user_id
                )));
            }
        }
        let row = LedgerEntry {
            id: LedgerEntryId::generate(),
            user_id: entry.user_id,
            entry_type: entry.entry_type,
            amount: entry.amount,
            currency: entry.currency,
            description: entry.description,
            source: entry.source,
            external_id: entry.external_id,
            status: EntryStatus::Posted,
            created_at: Utc::now(),
        };
        tables.ledger.push(row.clone());
        self.undo.push(Undo::LedgerAppend);
        Ok(row)
    }

    async fn find_ledger_by_external(
        &mut self,
        user: &UserId,
        external_id: &str,
    ) -> Result<Option<LedgerEntry>, StoreError> {
        self.ensure_open()?;
        Ok(self
            .tables
            .ledger
            .iter()
            .find(|e| &e.user_id == user && e.external_id.as_deref() == Some(external_id))
            .cloned())
    }

    async fn ledger_sum(&mut self, user: &UserId) -> Result<Cents, StoreError> {
        self.ensure_open()?;
        Ok(self
            .tables
            .ledger
            .iter()
            .filter(|e| &e.user_id == user)
            .map(LedgerEntry::signed_amount)
            .sum())
    }

    async fn insert_recharge(&mut self, recharge: NewRecharge) -> Result<Recharge, StoreError> {
        self.ensure_open()?;
        let tables = &mut *self.tables;
        let row = Recharge {
            id: RechargeId::generate(),
            user_id: recharge.user_id,
            provider: recharge.provider,
            amount: recharge.amount,
            currency: recharge.currency,
            status: RechargeStatus::Pending,
            provider_payment_id: None,
            created_at: Utc::now(),
        };
        tables.recharge_index.insert(row.id, tables.recharges.len());
        tables.recharges.push(row.clone());
        self.undo.push(Undo::RechargeInsert);
        Ok(row)
    }

    async fn get_recharge(&mut self, id: RechargeId) -> Result<Option<Recharge>, StoreError> {
        self.ensure_open()?;
        let tables = &*self.tables;
        Ok(tables
            .recharge_index
            .get(&id)
            .map(|idx| tables.recharges[*idx].clone()))
    }

    async fn find_recharge_by_payment_id(
        &mut self,
        provider_payment_id: &str,
    ) -> Result<Option<Recharge>, StoreError> {
        self.ensure_open()?;
        let tables = &*self.tables;
        Ok(tables
            .payment_index
            .get(provider_payment_id)
            .and_then(|id| tables.recharge_index.get(id))
            .map(|idx| tables.recharges[*idx].clone()))
    }

    async fn set_provider_payment_id(
        &mut self,
        id: RechargeId,
        provider_payment_id: &str,
    ) -> Result<(), StoreError> {
        self.ensure_open()?;
        let tables = &mut *self.tables;
        if tables
            .payment_index
            .get(provider_payment_id)
            .is_some_and(|owner| *owner != id)
        {
            return Err(StoreError::UniqueViolation(format!(
                "recharge provider payment id {provider_payment_id}"
            )));
        }
        let (idx, recharge) = tables.recharge_mut(id)?;
        let previous = recharge
            .provider_payment_id
            .replace(provider_payment_id.to_string());
        if let Some(previous) = &previous {
            tables.payment_index.remove(previous);
        }
        tables
            .payment_index
            .insert(provider_payment_id.to_string(), id);
        self.undo.push(Undo::PaymentId { idx, previous });
        Ok(())
    }

    async fn transition_recharge(
        &mut self,
        id: RechargeId,
        from: RechargeStatus,
        to: RechargeStatus,
    ) -> Result<bool, StoreError> {
        self.ensure_open()?;
        let (idx, recharge) = self.tables.recharge_mut(id)?;
        if recharge.status != from {
            return Ok(false);
        }
        recharge.status = to;
        self.undo.push(Undo::RechargeStatus {
            idx,
            previous: from,
        });
        Ok(true)
    }

    async fn pending_recharges(
        &mut self,
        user: Option<&UserId>,
        limit: usize,
    ) -> Result<Vec<Recharge>, StoreError> {
        self.ensure_open()?;
        Ok(self
            .tables
            .recharges
            .iter()
            .filter(|r| r.status == RechargeStatus::Pending && r.provider_payment_id.is_some())
            .filter(|r| user.is_none_or(|u| &r.user_id == u))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn insert_dispense(&mut self, dispense: NewDispense) -> Result<Dispense, StoreError> {
        self.ensure_open()?;
        let row = Dispense {
            id: DispenseId::generate(),
            user_id: dispense.user_id,
            liters: dispense.liters,
            price_per_liter: dispense.price_per_liter,
            total: dispense.total,
            currency: dispense.currency,
            status: dispense.status,
            machine_id: dispense.machine_id,
            machine_location: dispense.machine_location,
            created_at: Utc::now(),
        };
        self.tables.dispenses.push(row.clone());
        self.undo.push(Undo::DispenseInsert);
        Ok(row)
    }

    async fn webhook_event_exists(&mut self, event_id: &str) -> Result<bool, StoreError> {
        self.ensure_open()?;
        Ok(self.tables.webhook_events.contains_key(event_id))
    }

    async fn insert_webhook_event(&mut self, event: WebhookEvent) -> Result<bool, StoreError> {
        self.ensure_open()?;
        if self.tables.webhook_events.contains_key(&event.event_id) {
            return Ok(false);
        }
        let event_id = event.event_id.clone();
        self.tables.webhook_events.insert(event_id.clone(), event);
        self.undo.push(Undo::WebhookInsert { event_id });
        Ok(true)
    }

    async fn list_ledger(
        &mut self,
        user: &UserId,
        page: &PageRequest,
    ) -> Result<Page<LedgerEntry>, StoreError> {
        self.ensure_open()?;
        let rows = self
            .tables
            .ledger
            .iter()
            .filter(|e| &e.user_id == user)
            .collect();
        paginate(rows, |e| e.id.to_string(), page)
    }

    async fn list_recharges(
        &mut self,
        user: &UserId,
        page: &PageRequest,
    ) -> Result<Page<Recharge>, StoreError> {
        self.ensure_open()?;
        let rows = self
            .tables
            .recharges
            .iter()
            .filter(|r| &r.user_id == user)
            .collect();
        paginate(rows, |r| r.id.to_string(), page)
    }

    async fn list_dispenses(
        &mut self,
        user: &UserId,
        page: &PageRequest,
    ) -> Result<Page<Dispense>, StoreError> {
        self.ensure_open()?;
        let rows = self
            .tables
            .dispenses
            .iter()
            .filter(|d| &d.user_id == user)
            .collect();
        paginate(rows, |d| d.id.to_string(), page)
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.committed = true;
        self.undo.clear();
        Ok(())
    }
}
