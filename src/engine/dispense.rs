//! Wallet debits for dispensed water.

use serde::Serialize;
use tracing::info;

use super::{Engine, EngineError, InsufficientFunds, ValidationError};
use crate::amount::{Cents, Liters};
use crate::model::{
    DispenseId, DispenseStatus, EntryType, Identity, MachineId, NewDispense, NewLedgerEntry,
    UserId,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispenseRequest {
    pub liters: Liters,
    pub machine_id: Option<String>,
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispenseReceipt {
    pub dispense_id: DispenseId,
    pub liters: Liters,
    pub price_per_liter: Cents,
    pub total: Cents,
    pub currency: String,
    /// Wallet balance after the debit.
    pub balance: Cents,
    pub machine_id: Option<MachineId>,
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Quote {
    pub liters: Liters,
    pub price_per_liter: Cents,
    pub total: Cents,
    pub currency: String,
}

/// Public price list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PricingInfo {
    pub currency: String,
    pub container_liters: u32,
    pub price_per_container: Cents,
    pub price_per_liter: Cents,
    pub options: Vec<Quote>,
}

impl Engine {
    /// Debits the caller for `request.liters` at the configured price.
    ///
    /// A machine id, when given, must name an active registered machine
    /// (or any well-formed id if unknown machines are allowed). The request
    /// location wins over the registered one.
    pub async fn dispense(
        &self,
        identity: &Identity,
        request: DispenseRequest,
    ) -> Result<DispenseReceipt, EngineError> {
        let machine = match request.machine_id.as_deref() {
            Some(raw) => {
                let id = MachineId::parse(raw)?;
                Some(self.machines.resolve_active(&id)?)
            }
            None => None,
        };
        let location = request
            .location
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .or_else(|| machine.as_ref().and_then(|m| m.location.clone()));

        self.debit(
            &identity.user_id,
            request.liters,
            self.config.dispense.price_per_liter(),
            machine.map(|m| m.id),
            location,
        )
        .await
    }

    /// Atomically checks the balance, decrements it, and records the ledger
    /// entry and the dispense. On insufficient funds nothing is written.
    pub async fn debit(
        &self,
        user: &UserId,
        liters: Liters,
        price_per_liter: Cents,
        machine_id: Option<MachineId>,
        location: Option<String>,
    ) -> Result<DispenseReceipt, EngineError> {
        let result = self
            .apply_debit(user, liters, price_per_liter, machine_id, location)
            .await;
        Self::log_debit(user, liters, &result);
        result
    }

    /// Price of an allowed quantity, without touching the wallet.
    pub fn quote(&self, liters: Liters) -> Result<Quote, EngineError> {
        self.check_liters(liters)?;
        Ok(self.quote_unchecked(liters))
    }

    pub fn pricing(&self) -> PricingInfo {
        let dispense = &self.config.dispense;
        PricingInfo {
            currency: self.config.currency.clone(),
            container_liters: dispense.container_liters,
            price_per_container: dispense.price_per_container_cents,
            price_per_liter: dispense.price_per_liter(),
            options: dispense
                .allowed_liters()
                .into_iter()
                .map(|liters| self.quote_unchecked(liters))
                .collect(),
        }
    }
}

impl Engine {
    fn check_liters(&self, liters: Liters) -> Result<(), ValidationError> {
        let allowed = self.config.dispense.allowed_liters();
        if allowed.contains(&liters) {
            Ok(())
        } else {
            Err(ValidationError::Liters { liters, allowed })
        }
    }

    fn quote_unchecked(&self, liters: Liters) -> Quote {
        let price_per_liter = self.config.dispense.price_per_liter();
        Quote {
            liters,
            price_per_liter,
            total: liters.price(price_per_liter),
            currency: self.config.currency.clone(),
        }
    }

    async fn apply_debit(
        &self,
        user: &UserId,
        liters: Liters,
        price_per_liter: Cents,
        machine_id: Option<MachineId>,
        location: Option<String>,
    ) -> Result<DispenseReceipt, EngineError> {
        self.check_liters(liters)?;
        let total = liters.price(price_per_liter);
        if !total.is_positive() {
            return Err(ValidationError::NonPositiveTotal { liters, total }.into());
        }
        let currency = self.config.currency.clone();

        let mut tx = self.store.begin().await?;
        let balance = tx.balance(user).await?;
        if balance < total {
            return Err(InsufficientFunds {
                needed: total - balance,
                balance,
                total,
            }
            .into());
        }

        let new_balance = tx.adjust_balance(user, Cents::ZERO - total).await?;
        let dispense = tx
            .insert_dispense(NewDispense {
                user_id: user.clone(),
                liters,
                price_per_liter,
                total,
                currency: currency.clone(),
                status: DispenseStatus::Completed,
                machine_id: machine_id.clone(),
                machine_location: location.clone(),
            })
            .await?;
        tx.append_ledger(NewLedgerEntry {
            user_id: user.clone(),
            entry_type: EntryType::Debit,
            amount: total,
            currency: currency.clone(),
            description: format!("Water dispense • {liters}L"),
            source: ledger_source(machine_id.as_ref(), location.as_deref()),
            external_id: Some(format!("dispense:{}", dispense.id)),
        })
        .await?;
        tx.commit().await?;

        Ok(DispenseReceipt {
            dispense_id: dispense.id,
            liters,
            price_per_liter,
            total,
            currency,
            balance: new_balance,
            machine_id,
            location,
        })
    }

    fn log_debit(user: &UserId, liters: Liters, result: &Result<DispenseReceipt, EngineError>) {
        match result {
            Ok(receipt) => info!(
                user = %user,
                liters = %liters,
                total = %receipt.total,
                balance = %receipt.balance,
                "dispense applied"
            ),
            Err(e) => info!(
                user = %user,
                liters = %liters,
                reason = %e,
                "dispense skipped"
            ),
        }
    }
}

/// `DISPENSE`, optionally tagged with `:machine` and `@location`.
fn ledger_source(machine_id: Option<&MachineId>, location: Option<&str>) -> String {
    let mut source = String::from("DISPENSE");
    if let Some(machine_id) = machine_id {
        source.push(':');
        source.push_str(machine_id.as_str());
    }
    if let Some(location) = location {
        source.push('@');
        source.push_str(location);
    }
    source
}
