//! Core domain types for the wallet ledger.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::amount::{Cents, Liters};
use crate::engine::ValidationError;

/// User identifier as issued by the external identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        UserId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn generate() -> Self {
                $name(Uuid::new_v4())
            }

            pub fn parse(s: &str) -> Option<Self> {
                Uuid::parse_str(s).ok().map($name)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

uuid_id!(
    /// Recharge identifier.
    RechargeId
);
uuid_id!(
    /// Ledger entry identifier.
    LedgerEntryId
);
uuid_id!(
    /// Dispense identifier.
    DispenseId
);

/// Identifier of a physical dispensing machine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MachineId(String);

impl MachineId {
    const MAX_LEN: usize = 64;

    /// Trims and validates a machine id: 1..=64 chars of `[A-Za-z0-9_.-]`.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let id = raw.trim();
        let valid = !id.is_empty()
            && id.len() <= Self::MAX_LEN
            && id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'));
        if valid {
            Ok(MachineId(id.to_string()))
        } else {
            Err(ValidationError::MachineId(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for MachineId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        MachineId::parse(&value)
    }
}

impl From<MachineId> for String {
    fn from(value: MachineId) -> Self {
        value.0
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A registered dispensing machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub id: MachineId,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default = "default_machine_status")]
    pub status: String,
}

impl Machine {
    /// Stand-in record for machines resolved without a registry entry.
    pub fn unregistered(id: MachineId) -> Self {
        Self {
            id,
            is_active: true,
            location: None,
            status: default_machine_status(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_machine_status() -> String {
    "ONLINE".to_string()
}

/// Authenticated caller, produced by the external identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub email: Option<String>,
    pub name: Option<String>,
}

impl Identity {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            email: None,
            name: None,
        }
    }
}

/// Direction of a ledger movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntryType {
    Credit,
    Debit,
}

/// Ledger entries are only ever written as posted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntryStatus {
    #[default]
    Posted,
}

/// An immutable ledger movement.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntry {
    pub id: LedgerEntryId,
    pub user_id: UserId,
    pub entry_type: EntryType,
    /// Always positive; direction comes from `entry_type`.
    pub amount: Cents,
    pub currency: String,
    pub description: String,
    pub source: String,
    /// Idempotency key, unique per user when present.
    pub external_id: Option<String>,
    pub status: EntryStatus,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Signed contribution of this entry to the wallet balance.
    pub fn signed_amount(&self) -> Cents {
        match self.entry_type {
            EntryType::Credit => self.amount,
            EntryType::Debit => Cents::ZERO - self.amount,
        }
    }
}

/// Ledger entry before the store assigns its id and timestamp.
#[derive(Debug, Clone)]
pub struct NewLedgerEntry {
    pub user_id: UserId,
    pub entry_type: EntryType,
    pub amount: Cents,
    pub currency: String,
    pub description: String,
    pub source: String,
    pub external_id: Option<String>,
}

/// Payment provider backing a recharge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Provider {
    #[default]
    Stripe,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Stripe => "STRIPE",
        }
    }

    /// Name shown to users in history listings.
    pub fn display_name(&self) -> &'static str {
        match self {
            Provider::Stripe => "Stripe",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a recharge. `Pending` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RechargeStatus {
    Pending,
    Succeeded,
    Failed,
    Canceled,
}

impl RechargeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RechargeStatus::Pending => "PENDING",
            RechargeStatus::Succeeded => "SUCCEEDED",
            RechargeStatus::Failed => "FAILED",
            RechargeStatus::Canceled => "CANCELED",
        }
    }
}

impl fmt::Display for RechargeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A wallet top-up request.
#[derive(Debug, Clone, Serialize)]
pub struct Recharge {
    pub id: RechargeId,
    pub user_id: UserId,
    pub provider: Provider,
    pub amount: Cents,
    pub currency: String,
    pub status: RechargeStatus,
    pub provider_payment_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewRecharge {
    pub user_id: UserId,
    pub provider: Provider,
    pub amount: Cents,
    pub currency: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DispenseStatus {
    Completed,
    Started,
    Failed,
    Canceled,
}

/// A completed debit against the wallet for a dispensed volume.
#[derive(Debug, Clone, Serialize)]
pub struct Dispense {
    pub id: DispenseId,
    pub user_id: UserId,
    pub liters: Liters,
    pub price_per_liter: Cents,
    pub total: Cents,
    pub currency: String,
    pub status: DispenseStatus,
    pub machine_id: Option<MachineId>,
    pub machine_location: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewDispense {
    pub user_id: UserId,
    pub liters: Liters,
    pub price_per_liter: Cents,
    pub total: Cents,
    pub currency: String,
    pub status: DispenseStatus,
    pub machine_id: Option<MachineId>,
    pub machine_location: Option<String>,
}

/// Marker that an upstream event id already produced its side effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookEvent {
    pub provider: Provider,
    pub event_id: String,
}

/// Status vocabulary shown to end users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayStatus {
    Completed,
    Pending,
    Failed,
    Cancelled,
}

impl From<RechargeStatus> for DisplayStatus {
    fn from(status: RechargeStatus) -> Self {
        match status {
            RechargeStatus::Succeeded => DisplayStatus::Completed,
            RechargeStatus::Pending => DisplayStatus::Pending,
            RechargeStatus::Failed => DisplayStatus::Failed,
            RechargeStatus::Canceled => DisplayStatus::Cancelled,
        }
    }
}

impl From<DispenseStatus> for DisplayStatus {
    fn from(status: DispenseStatus) -> Self {
        match status {
            DispenseStatus::Completed => DisplayStatus::Completed,
            DispenseStatus::Started => DisplayStatus::Pending,
            DispenseStatus::Failed => DisplayStatus::Failed,
            DispenseStatus::Canceled => DisplayStatus::Cancelled,
        }
    }
}

/// Payment status as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderStatus {
    Succeeded,
    Canceled,
    RequiresPaymentMethod,
    RequiresConfirmation,
    /// Any status that does not resolve the payment yet.
    Other(String),
}

impl ProviderStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "succeeded" => ProviderStatus::Succeeded,
            "canceled" => ProviderStatus::Canceled,
            "requires_payment_method" => ProviderStatus::RequiresPaymentMethod,
            "requires_confirmation" => ProviderStatus::RequiresConfirmation,
            other => ProviderStatus::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ProviderStatus::Succeeded => "succeeded",
            ProviderStatus::Canceled => "canceled",
            ProviderStatus::RequiresPaymentMethod => "requires_payment_method",
            ProviderStatus::RequiresConfirmation => "requires_confirmation",
            ProviderStatus::Other(s) => s,
        }
    }
}

impl fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A push notification from the payment provider.
#[derive(Debug, Clone)]
pub struct ProviderEvent {
    /// Provider-assigned unique id, used for deduplication.
    pub event_id: String,
    pub provider_payment_id: String,
    pub status: ProviderStatus,
    pub amount: Cents,
    pub currency: String,
}
