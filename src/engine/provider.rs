//! Payment provider seam.
//!
//! The engine only needs two calls from the provider: open a payment intent for
//! a new recharge, and read back the authoritative status of a payment.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::amount::Cents;
use crate::model::{Provider, ProviderStatus, RechargeId, UserId};

/// Upstream call failed; the recharge stays `PENDING` and may be retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("payment {0} is unknown to the provider")]
    UnknownPayment(String),

    #[error("request failed: {0}")]
    Request(String),
}

#[derive(Debug, Clone)]
pub struct IntentRequest {
    pub recharge_id: RechargeId,
    pub user_id: UserId,
    pub amount: Cents,
    pub currency: String,
    pub receipt_email: Option<String>,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderIntent {
    pub provider_payment_id: String,
    /// Handed to the client to complete the payment.
    pub client_secret: String,
}

/// Provider-side view of a payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderPayment {
    pub provider_payment_id: String,
    pub status: ProviderStatus,
    pub amount: Cents,
    pub amount_received: Option<Cents>,
    pub currency: Option<String>,
}

impl ProviderPayment {
    /// Amount actually captured, falling back to the requested amount.
    pub fn settled_amount(&self) -> Cents {
        self.amount_received
            .filter(|received| received.is_positive())
            .unwrap_or(self.amount)
    }
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn provider(&self) -> Provider;

    async fn create_intent(&self, request: IntentRequest) -> Result<ProviderIntent, ProviderError>;

    async fn retrieve(&self, provider_payment_id: &str) -> Result<ProviderPayment, ProviderError>;
}

/// In-memory provider whose payment statuses are driven by the caller.
///
/// New intents start as `requires_payment_method`. Used by the replay binary
/// and by tests.
#[derive(Default)]
pub struct ScriptedProvider {
    payments: Mutex<HashMap<String, ProviderPayment>>,
    unreachable: Mutex<HashSet<String>>,
    reject_intents: Mutex<bool>,
    next_id: AtomicU64,
    retrieve_calls: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the status reported for a payment; received amount follows the
    /// status (full amount once succeeded, none otherwise).
    pub fn set_status(&self, provider_payment_id: &str, status: ProviderStatus) {
        if let Some(payment) = lock(&self.payments).get_mut(provider_payment_id) {
            payment.amount_received = match status {
                ProviderStatus::Succeeded => Some(payment.amount),
                _ => None,
            };
            payment.status = status;
        }
    }

    /// Registers a payment created outside of [`PaymentProvider::create_intent`].
    pub fn insert(&self, payment: ProviderPayment) {
        lock(&self.payments).insert(payment.provider_payment_id.clone(), payment);
    }

    /// Makes every `retrieve` of this payment fail until cleared.
    pub fn set_unreachable(&self, provider_payment_id: &str, unreachable: bool) {
        let mut set = lock(&self.unreachable);
        if unreachable {
            set.insert(provider_payment_id.to_string());
        } else {
            set.remove(provider_payment_id);
        }
    }

    pub fn reject_intents(&self, reject: bool) {
        *lock(&self.reject_intents) = reject;
    }

    pub fn retrieve_calls(&self) -> usize {
        self.retrieve_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl PaymentProvider for ScriptedProvider {
    fn provider(&self) -> Provider {
        Provider::Stripe
    }

    async fn create_intent(&self, request: IntentRequest) -> Result<ProviderIntent, ProviderError> {
        if *lock(&self.reject_intents) {
            return Err(ProviderError::Request("intent creation rejected".into()));
        }
        let seq = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let provider_payment_id = format!("pi_{seq:06}");
        self.insert(ProviderPayment {
            provider_payment_id: provider_payment_id.clone(),
            status: ProviderStatus::RequiresPaymentMethod,
            amount: request.amount,
            amount_received: None,
            currency: Some(request.currency.to_ascii_lowercase()),
        });
        Ok(ProviderIntent {
            client_secret: format!("{provider_payment_id}_secret_{}", Uuid::new_v4().simple()),
            provider_payment_id,
        })
    }

    async fn retrieve(&self, provider_payment_id: &str) -> Result<ProviderPayment, ProviderError> {
        self.retrieve_calls.fetch_add(1, Ordering::Relaxed);
        if lock(&self.unreachable).contains(provider_payment_id) {
            return Err(ProviderError::Request(format!(
                "timed out fetching {provider_payment_id}"
            )));
        }
        lock(&self.payments)
            .get(provider_payment_id)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownPayment(provider_payment_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(amount: i64) -> IntentRequest {
        IntentRequest {
            recharge_id: RechargeId::generate(),
            user_id: UserId::new("u1"),
            amount: Cents::new(amount),
            currency: "MXN".into(),
            receipt_email: None,
            description: "top-up".into(),
        }
    }

    #[tokio::test]
    async fn intents_get_unique_ids() {
        let provider = ScriptedProvider::new();
        let a = provider.create_intent(request(1000)).await.unwrap();
        let b = provider.create_intent(request(1000)).await.unwrap();
        assert_ne!(a.provider_payment_id, b.provider_payment_id);
        assert!(a.client_secret.starts_with(&a.provider_payment_id));
    }

    #[tokio::test]
    async fn status_is_scripted() {
        let provider = ScriptedProvider::new();
        let intent = provider.create_intent(request(2500)).await.unwrap();
        let id = intent.provider_payment_id.as_str();

        let payment = provider.retrieve(id).await.unwrap();
        assert_eq!(payment.status, ProviderStatus::RequiresPaymentMethod);
        assert_eq!(payment.amount_received, None);

        provider.set_status(id, ProviderStatus::Succeeded);
        let payment = provider.retrieve(id).await.unwrap();
        assert_eq!(payment.status, ProviderStatus::Succeeded);
        assert_eq!(payment.settled_amount(), Cents::new(2500));
        assert_eq!(payment.currency.as_deref(), Some("mxn"));
        assert_eq!(provider.retrieve_calls(), 2);
    }

    #[tokio::test]
    async fn unreachable_and_unknown_payments_fail() {
        let provider = ScriptedProvider::new();
        let intent = provider.create_intent(request(1000)).await.unwrap();
        provider.set_unreachable(&intent.provider_payment_id, true);
        assert!(matches!(
            provider.retrieve(&intent.provider_payment_id).await,
            Err(ProviderError::Request(_))
        ));
        provider.set_unreachable(&intent.provider_payment_id, false);
        assert!(provider.retrieve(&intent.provider_payment_id).await.is_ok());

        assert_eq!(
            provider.retrieve("pi_missing").await,
            Err(ProviderError::UnknownPayment("pi_missing".into()))
        );
    }

    #[tokio::test]
    async fn rejected_intents() {
        let provider = ScriptedProvider::new();
        provider.reject_intents(true);
        assert!(provider.create_intent(request(1000)).await.is_err());
    }

    #[test]
    fn settled_amount_prefers_received() {
        let mut payment = ProviderPayment {
            provider_payment_id: "pi_1".into(),
            status: ProviderStatus::Succeeded,
            amount: Cents::new(1000),
            amount_received: Some(Cents::new(900)),
            currency: None,
        };
        assert_eq!(payment.settled_amount(), Cents::new(900));
        payment.amount_received = Some(Cents::ZERO);
        assert_eq!(payment.settled_amount(), Cents::new(1000));
    }
}
