//! Recharge lifecycle entry points: opening a top-up and the two pull-based
//! reconciliation triggers (manual recheck and batch sweep).

use serde::Serialize;
use tracing::{info, warn};

use super::provider::{IntentRequest, ProviderPayment};
use super::reconcile::{ReconcileOutcome, RechargeRef, SkipReason, Trigger};
use super::{Engine, EngineError, NotFound, ValidationError};
use crate::amount::Cents;
use crate::model::{
    Identity, NewRecharge, ProviderStatus, Recharge, RechargeId, RechargeStatus, UserId,
};

/// What the client needs to complete a payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RechargeIntent {
    pub recharge_id: RechargeId,
    pub provider_payment_id: String,
    pub client_secret: String,
    pub amount: Cents,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepScope {
    All,
    User(UserId),
}

/// Per-recharge result of a sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum SweepOutcome {
    Credited(Cents),
    /// Another trigger got there first.
    AlreadyApplied,
    MarkedCanceled,
    MarkedFailed,
    /// Provider status that does not resolve the payment yet.
    LeftPending(String),
    /// Provider or store failure; the recharge stays pending.
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepItem {
    pub recharge_id: RechargeId,
    pub provider_payment_id: String,
    pub outcome: SweepOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub checked: usize,
    pub results: Vec<SweepItem>,
}

impl SweepReport {
    pub fn credited(&self) -> usize {
        self.count(|o| matches!(o, SweepOutcome::Credited(_)))
    }

    pub fn errors(&self) -> usize {
        self.count(|o| matches!(o, SweepOutcome::Error(_)))
    }

    fn count(&self, pred: impl Fn(&SweepOutcome) -> bool) -> usize {
        self.results.iter().filter(|item| pred(&item.outcome)).count()
    }
}

impl SweepOutcome {
    fn from_reconcile(outcome: &ReconcileOutcome, observed: &ProviderStatus) -> Self {
        match (outcome.skipped, outcome.status, outcome.credited) {
            (None, RechargeStatus::Succeeded, Some(amount)) => SweepOutcome::Credited(amount),
            (None, RechargeStatus::Canceled, _) => SweepOutcome::MarkedCanceled,
            (None, RechargeStatus::Failed, _) => SweepOutcome::MarkedFailed,
            (Some(SkipReason::Unresolved), _, _) => SweepOutcome::LeftPending(observed.to_string()),
            (Some(SkipReason::AmountExceedsRecharge), _, _) => {
                SweepOutcome::Error("provider amount exceeds recharge amount".to_string())
            }
            _ => SweepOutcome::AlreadyApplied,
        }
    }
}

impl Engine {
    /// Creates a `PENDING` recharge and the matching provider intent.
    ///
    /// If the provider call fails the recharge stays pending without a
    /// provider reference; sweeps never pick it up.
    pub async fn open_recharge(
        &self,
        identity: &Identity,
        amount: Cents,
    ) -> Result<RechargeIntent, EngineError> {
        let limits = &self.config.recharge;
        if amount < limits.min_cents {
            return Err(ValidationError::AmountBelowMinimum {
                amount,
                min: limits.min_cents,
            }
            .into());
        }
        if amount > limits.max_cents {
            return Err(ValidationError::AmountAboveMaximum {
                amount,
                max: limits.max_cents,
            }
            .into());
        }

        let recharge = {
            let mut tx = self.store.begin().await?;
            tx.balance(&identity.user_id).await?;
            let recharge = tx
                .insert_recharge(NewRecharge {
                    user_id: identity.user_id.clone(),
                    provider: self.provider.provider(),
                    amount,
                    currency: self.config.currency.clone(),
                })
                .await?;
            tx.commit().await?;
            recharge
        };

        let intent = self
            .provider
            .create_intent(IntentRequest {
                recharge_id: recharge.id,
                user_id: identity.user_id.clone(),
                amount,
                currency: recharge.currency.clone(),
                receipt_email: identity.email.clone(),
                description: format!("Wallet top-up {} {}", amount, recharge.currency),
            })
            .await
            .inspect_err(|e| {
                warn!(recharge = %recharge.id, user = %identity.user_id, reason = %e, "intent creation failed");
            })?;

        let mut tx = self.store.begin().await?;
        tx.set_provider_payment_id(recharge.id, &intent.provider_payment_id)
            .await?;
        tx.commit().await?;

        info!(
            recharge = %recharge.id,
            user = %identity.user_id,
            amount = %amount,
            payment = %intent.provider_payment_id,
            "recharge opened"
        );
        Ok(RechargeIntent {
            recharge_id: recharge.id,
            provider_payment_id: intent.provider_payment_id,
            client_secret: intent.client_secret,
            amount,
            currency: recharge.currency,
        })
    }

    /// A recharge owned by the caller.
    pub async fn recharge_status(
        &self,
        identity: &Identity,
        id: RechargeId,
    ) -> Result<Recharge, EngineError> {
        let mut tx = self.store.begin().await?;
        tx.get_recharge(id)
            .await?
            .filter(|r| r.user_id == identity.user_id)
            .ok_or_else(|| NotFound::Recharge(id).into())
    }

    /// Asks the provider about one of the caller's recharges and reconciles.
    /// Recharges that already left `PENDING` are answered without a provider
    /// call.
    pub async fn recheck(
        &self,
        identity: &Identity,
        id: RechargeId,
    ) -> Result<ReconcileOutcome, EngineError> {
        let recharge = self.recharge_status(identity, id).await?;
        if recharge.status.is_terminal() {
            return Ok(ReconcileOutcome::skipped(
                id,
                recharge.status,
                SkipReason::AlreadyTerminal,
            ));
        }
        let Some(payment_id) = recharge.provider_payment_id.as_deref() else {
            return Ok(ReconcileOutcome::skipped(
                id,
                recharge.status,
                SkipReason::Unresolved,
            ));
        };

        let payment = self.provider.retrieve(payment_id).await?;
        self.reconcile_payment(Trigger::Recheck, &recharge, &payment)
            .await
    }

    /// Reconciles up to `limit` pending recharges, oldest first.
    ///
    /// Each recharge is handled on its own; a failure is recorded in the
    /// report and the sweep moves on.
    pub async fn sweep(
        &self,
        scope: SweepScope,
        limit: Option<usize>,
    ) -> Result<SweepReport, EngineError> {
        let limits = &self.config.recharge;
        let limit = limit
            .unwrap_or(limits.sweep_page_size)
            .clamp(1, limits.sweep_max_page_size);

        let pending = {
            let mut tx = self.store.begin().await?;
            let user = match &scope {
                SweepScope::All => None,
                SweepScope::User(user) => Some(user),
            };
            tx.pending_recharges(user, limit).await?
        };

        let mut report = SweepReport::default();
        for recharge in pending {
            let Some(payment_id) = recharge.provider_payment_id.clone() else {
                continue;
            };
            let outcome = self.sweep_one(&recharge, &payment_id).await;
            report.results.push(SweepItem {
                recharge_id: recharge.id,
                provider_payment_id: payment_id,
                outcome,
            });
        }
        report.checked = report.results.len();

        info!(
            checked = report.checked,
            credited = report.credited(),
            errors = report.errors(),
            "sweep finished"
        );
        Ok(report)
    }

    async fn sweep_one(&self, recharge: &Recharge, payment_id: &str) -> SweepOutcome {
        let payment = match self.provider.retrieve(payment_id).await {
            Ok(payment) => payment,
            Err(e) => {
                warn!(recharge = %recharge.id, payment = payment_id, reason = %e, "sweep lookup failed");
                return SweepOutcome::Error(e.to_string());
            }
        };
        match self
            .reconcile_payment(Trigger::Sweep, recharge, &payment)
            .await
        {
            Ok(outcome) => SweepOutcome::from_reconcile(&outcome, &payment.status),
            Err(e) => {
                warn!(recharge = %recharge.id, reason = %e, "sweep reconcile failed");
                SweepOutcome::Error(e.to_string())
            }
        }
    }

    async fn reconcile_payment(
        &self,
        trigger: Trigger,
        recharge: &Recharge,
        payment: &ProviderPayment,
    ) -> Result<ReconcileOutcome, EngineError> {
        let currency = payment.currency.as_deref().unwrap_or(&recharge.currency);
        self.reconcile(
            trigger,
            RechargeRef::Id(recharge.id),
            &payment.status,
            payment.settled_amount(),
            currency,
        )
        .await
    }
}
