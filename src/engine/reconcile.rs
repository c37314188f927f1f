//! Exactly-once crediting of recharges.
//!
//! Webhook delivery, manual rechecks and batch sweeps all funnel into
//! [`Engine::reconcile`]. Two independent guards make a credit happen at most
//! once per recharge:
//! 1. the conditional `PENDING -> SUCCEEDED` update, which only one caller can win;
//! 2. a lookup of an existing ledger entry keyed by the provider payment id,
//!    which catches state left behind by an earlier partial failure.
//!
//! Both guards and the balance/ledger writes share one store transaction.

use serde::Serialize;
use tracing::{info, warn};

use super::state::{self, Transition, target_status};
use super::{Engine, EngineError, NotFound};
use crate::amount::Cents;
use crate::model::{EntryType, NewLedgerEntry, ProviderStatus, Recharge, RechargeId, RechargeStatus};
use crate::store::StoreTx;

/// Which entry point asked for reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Webhook,
    Recheck,
    Sweep,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Webhook => "webhook",
            Trigger::Recheck => "recheck",
            Trigger::Sweep => "sweep",
        }
    }

    fn ledger_source(&self) -> &'static str {
        match self {
            Trigger::Webhook => "stripe",
            Trigger::Recheck => "stripe-recheck",
            Trigger::Sweep => "stripe-sweep",
        }
    }

    fn ledger_description(&self) -> &'static str {
        match self {
            Trigger::Webhook => "Wallet top-up via Stripe",
            Trigger::Recheck | Trigger::Sweep => "Wallet top-up via Stripe (reconciled)",
        }
    }
}

/// How the caller refers to a recharge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RechargeRef {
    Id(RechargeId),
    /// The provider's payment id, as carried by push events.
    Payment(String),
}

/// Why a reconcile call changed nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The recharge had already left `PENDING`.
    AlreadyTerminal,
    /// A credit for this payment is already in the ledger.
    LedgerExists,
    /// The provider has not resolved the payment yet.
    Unresolved,
    /// The provider reported more than the recharge asked for. The recharge
    /// stays `PENDING` until someone looks at it.
    AmountExceedsRecharge,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub recharge_id: RechargeId,
    /// Whether this call changed the recharge.
    pub applied: bool,
    pub status: RechargeStatus,
    /// Amount credited to the wallet by this call.
    pub credited: Option<Cents>,
    pub skipped: Option<SkipReason>,
}

impl ReconcileOutcome {
    pub(super) fn applied(recharge_id: RechargeId, status: RechargeStatus, credited: Option<Cents>) -> Self {
        Self {
            recharge_id,
            applied: true,
            status,
            credited,
            skipped: None,
        }
    }

    pub(super) fn skipped(recharge_id: RechargeId, status: RechargeStatus, reason: SkipReason) -> Self {
        Self {
            recharge_id,
            applied: false,
            status,
            credited: None,
            skipped: Some(reason),
        }
    }
}

impl Engine {
    /// Aligns a recharge with the status observed at the provider.
    ///
    /// `succeeded` credits the wallet once, `canceled` and the
    /// `requires_*` statuses close the recharge without touching the wallet,
    /// anything else leaves it pending. Calls against a recharge that already
    /// left `PENDING` return `applied: false`.
    pub async fn reconcile(
        &self,
        trigger: Trigger,
        recharge: RechargeRef,
        observed: &ProviderStatus,
        amount: Cents,
        currency: &str,
    ) -> Result<ReconcileOutcome, EngineError> {
        let mut tx = self.store.begin().await?;
        let recharge = Self::load_recharge(tx.as_mut(), recharge).await?;

        let outcome = match target_status(observed) {
            None => ReconcileOutcome::skipped(recharge.id, recharge.status, SkipReason::Unresolved),
            Some(RechargeStatus::Succeeded) => {
                self.credit(tx.as_mut(), trigger, &recharge, amount, currency)
                    .await?
            }
            Some(target) => match state::transition(tx.as_mut(), recharge.id, target).await? {
                Transition::Applied => ReconcileOutcome::applied(recharge.id, target, None),
                Transition::AlreadyTerminal(current) => {
                    ReconcileOutcome::skipped(recharge.id, current, SkipReason::AlreadyTerminal)
                }
            },
        };

        tx.commit().await?;
        Self::log_outcome(trigger, &recharge, observed, &outcome);
        Ok(outcome)
    }

    async fn load_recharge(
        tx: &mut dyn StoreTx,
        recharge: RechargeRef,
    ) -> Result<Recharge, EngineError> {
        match recharge {
            RechargeRef::Id(id) => tx
                .get_recharge(id)
                .await?
                .ok_or_else(|| NotFound::Recharge(id).into()),
            RechargeRef::Payment(payment_id) => tx
                .find_recharge_by_payment_id(&payment_id)
                .await?
                .ok_or_else(|| NotFound::Payment(payment_id).into()),
        }
    }

    /// Gate, guard, then credit. Runs inside the caller's transaction.
    async fn credit(
        &self,
        tx: &mut dyn StoreTx,
        trigger: Trigger,
        recharge: &Recharge,
        observed_amount: Cents,
        currency: &str,
    ) -> Result<ReconcileOutcome, EngineError> {
        let amount = if observed_amount.is_positive() {
            observed_amount
        } else {
            recharge.amount
        };
        if recharge.status == RechargeStatus::Pending && amount > recharge.amount {
            warn!(
                recharge = %recharge.id,
                requested = %recharge.amount,
                observed = %amount,
                "provider amount exceeds recharge amount, not crediting"
            );
            return Ok(ReconcileOutcome::skipped(
                recharge.id,
                recharge.status,
                SkipReason::AmountExceedsRecharge,
            ));
        }

        if let Transition::AlreadyTerminal(current) =
            state::transition(tx, recharge.id, RechargeStatus::Succeeded).await?
        {
            return Ok(ReconcileOutcome::skipped(
                recharge.id,
                current,
                SkipReason::AlreadyTerminal,
            ));
        }

        // Recharges opened without a provider reference fall back to their own id.
        let external_id = recharge
            .provider_payment_id
            .clone()
            .unwrap_or_else(|| recharge.id.to_string());

        // The status change is kept: the ledger already reflects this payment.
        if tx
            .find_ledger_by_external(&recharge.user_id, &external_id)
            .await?
            .is_some()
        {
            return Ok(ReconcileOutcome::skipped(
                recharge.id,
                RechargeStatus::Succeeded,
                SkipReason::LedgerExists,
            ));
        }

        if amount != recharge.amount {
            warn!(
                recharge = %recharge.id,
                requested = %recharge.amount,
                observed = %amount,
                "provider amount differs from recharge amount"
            );
        }
        let currency = if currency.trim().is_empty() {
            recharge.currency.clone()
        } else {
            currency.trim().to_ascii_uppercase()
        };

        tx.adjust_balance(&recharge.user_id, amount).await?;
        tx.append_ledger(NewLedgerEntry {
            user_id: recharge.user_id.clone(),
            entry_type: EntryType::Credit,
            amount,
            currency,
            description: trigger.ledger_description().to_string(),
            source: trigger.ledger_source().to_string(),
            external_id: Some(external_id),
        })
        .await?;

        Ok(ReconcileOutcome::applied(
            recharge.id,
            RechargeStatus::Succeeded,
            Some(amount),
        ))
    }

    fn log_outcome(
        trigger: Trigger,
        recharge: &Recharge,
        observed: &ProviderStatus,
        outcome: &ReconcileOutcome,
    ) {
        match (outcome.applied, outcome.credited, outcome.skipped) {
            (true, Some(amount), _) => info!(
                trigger = trigger.as_str(),
                recharge = %recharge.id,
                user = %recharge.user_id,
                amount = %amount,
                "recharge credited"
            ),
            (true, None, _) => info!(
                trigger = trigger.as_str(),
                recharge = %recharge.id,
                status = %outcome.status,
                "recharge closed"
            ),
            (false, _, reason) => info!(
                trigger = trigger.as_str(),
                recharge = %recharge.id,
                observed = %observed,
                status = %outcome.status,
                reason = ?reason,
                "reconcile skipped"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::engine::test_support::{TestEngine, ppid};
    use crate::model::{EntryType, Identity, UserId};
    use crate::store::{PageRequest, Store};

    async fn ledger_credits(t: &TestEngine, user: &str) -> usize {
        let mut tx = t.store.begin().await.unwrap();
        tx.list_ledger(&UserId::new(user), &PageRequest::first(100))
            .await
            .unwrap()
            .items
            .iter()
            .filter(|e| e.entry_type == EntryType::Credit)
            .count()
    }

    #[tokio::test]
    async fn succeeded_credits_once() {
        let t = TestEngine::new();
        let recharge = t.open("u1", 10_000).await;

        let first = t
            .engine
            .reconcile(
                Trigger::Webhook,
                RechargeRef::Id(recharge),
                &ProviderStatus::Succeeded,
                Cents::new(10_000),
                "mxn",
            )
            .await
            .unwrap();
        assert!(first.applied);
        assert_eq!(first.status, RechargeStatus::Succeeded);
        assert_eq!(first.credited, Some(Cents::new(10_000)));

        let second = t
            .engine
            .reconcile(
                Trigger::Recheck,
                RechargeRef::Id(recharge),
                &ProviderStatus::Succeeded,
                Cents::new(10_000),
                "mxn",
            )
            .await
            .unwrap();
        assert!(!second.applied);
        assert_eq!(second.skipped, Some(SkipReason::AlreadyTerminal));

        assert_eq!(t.balance("u1").await, Cents::new(10_000));
        assert_eq!(ledger_credits(&t, "u1").await, 1);
    }

    #[tokio::test]
    async fn credit_is_recorded_with_payment_id_and_currency() {
        let t = TestEngine::new();
        let recharge = t.open("u1", 5_000).await;
        let payment_id = ppid(&t, recharge).await;

        t.engine
            .reconcile(
                Trigger::Webhook,
                RechargeRef::Payment(payment_id.clone()),
                &ProviderStatus::Succeeded,
                Cents::new(5_000),
                "mxn",
            )
            .await
            .unwrap();

        let mut tx = t.store.begin().await.unwrap();
        let entry = tx
            .find_ledger_by_external(&UserId::new("u1"), &payment_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.amount, Cents::new(5_000));
        assert_eq!(entry.currency, "MXN");
        assert_eq!(entry.source, "stripe");
    }

    #[tokio::test]
    async fn zero_observed_amount_falls_back_to_recharge_amount() {
        let t = TestEngine::new();
        let recharge = t.open("u1", 2_000).await;
        let outcome = t
            .engine
            .reconcile(
                Trigger::Sweep,
                RechargeRef::Id(recharge),
                &ProviderStatus::Succeeded,
                Cents::ZERO,
                "",
            )
            .await
            .unwrap();
        assert_eq!(outcome.credited, Some(Cents::new(2_000)));
        assert_eq!(t.balance("u1").await, Cents::new(2_000));
    }

    #[tokio::test]
    async fn observed_amount_above_recharge_is_not_credited() {
        let t = TestEngine::new();
        let recharge = t.open("u1", 1_000).await;

        for trigger in [Trigger::Webhook, Trigger::Sweep] {
            let outcome = t
                .engine
                .reconcile(
                    trigger,
                    RechargeRef::Id(recharge),
                    &ProviderStatus::Succeeded,
                    Cents::new(i64::MAX / 2 + 10),
                    "mxn",
                )
                .await
                .unwrap();
            assert!(!outcome.applied);
            assert_eq!(outcome.skipped, Some(SkipReason::AmountExceedsRecharge));
            assert_eq!(outcome.status, RechargeStatus::Pending);
        }
        assert_eq!(t.balance("u1").await, Cents::ZERO);
        assert_eq!(ledger_credits(&t, "u1").await, 0);
        assert_eq!(t.status(recharge).await, RechargeStatus::Pending);

        // A partial capture is still credited.
        let outcome = t
            .engine
            .reconcile(
                Trigger::Recheck,
                RechargeRef::Id(recharge),
                &ProviderStatus::Succeeded,
                Cents::new(600),
                "mxn",
            )
            .await
            .unwrap();
        assert_eq!(outcome.credited, Some(Cents::new(600)));
        assert_eq!(t.balance("u1").await, Cents::new(600));
    }

    #[tokio::test]
    async fn failed_credit_leaves_no_trace() {
        let t = TestEngine::new();
        let recharge = t.open("u1", 1_000).await;

        // The wallet is already at the top of the range, so the credit overflows.
        {
            let mut tx = t.store.begin().await.unwrap();
            tx.adjust_balance(&UserId::new("u1"), Cents::new(i64::MAX - 10))
                .await
                .unwrap();
            tx.commit().await.unwrap();
        }

        let result = t
            .engine
            .reconcile(
                Trigger::Webhook,
                RechargeRef::Id(recharge),
                &ProviderStatus::Succeeded,
                Cents::new(1_000),
                "mxn",
            )
            .await;
        assert!(matches!(
            result,
            Err(EngineError::Store(crate::store::StoreError::BalanceOverflow(_)))
        ));
        assert_eq!(t.status(recharge).await, RechargeStatus::Pending);
        assert_eq!(t.balance("u1").await, Cents::new(i64::MAX - 10));
        assert_eq!(ledger_credits(&t, "u1").await, 0);
    }

    #[tokio::test]
    async fn failed_ledger_write_keeps_recharge_pending() {
        let t = TestEngine::new();
        let recharge = t.open("u1", 1_000).await;

        let result = t
            .failing_ledger()
            .reconcile(
                Trigger::Webhook,
                RechargeRef::Id(recharge),
                &ProviderStatus::Succeeded,
                Cents::new(1_000),
                "mxn",
            )
            .await;
        assert!(matches!(result, Err(EngineError::Store(_))));
        assert_eq!(t.status(recharge).await, RechargeStatus::Pending);
        assert_eq!(t.balance("u1").await, Cents::ZERO);

        // A later trigger still credits exactly once.
        let outcome = t
            .engine
            .reconcile(
                Trigger::Sweep,
                RechargeRef::Id(recharge),
                &ProviderStatus::Succeeded,
                Cents::new(1_000),
                "mxn",
            )
            .await
            .unwrap();
        assert!(outcome.applied);
        assert_eq!(t.balance("u1").await, Cents::new(1_000));
        assert_eq!(ledger_credits(&t, "u1").await, 1);
    }

    #[tokio::test]
    async fn existing_ledger_entry_blocks_credit_but_closes_recharge() {
        let t = TestEngine::new();
        let recharge = t.open("u1", 10_000).await;
        let payment_id = ppid(&t, recharge).await;

        // A credit that landed without its status update.
        {
            let mut tx = t.store.begin().await.unwrap();
            tx.adjust_balance(&UserId::new("u1"), Cents::new(10_000))
                .await
                .unwrap();
            tx.append_ledger(NewLedgerEntry {
                user_id: UserId::new("u1"),
                entry_type: EntryType::Credit,
                amount: Cents::new(10_000),
                currency: "MXN".into(),
                description: "earlier".into(),
                source: "stripe".into(),
                external_id: Some(payment_id.clone()),
            })
            .await
            .unwrap();
            tx.commit().await.unwrap();
        }

        let outcome = t
            .engine
            .reconcile(
                Trigger::Recheck,
                RechargeRef::Id(recharge),
                &ProviderStatus::Succeeded,
                Cents::new(10_000),
                "MXN",
            )
            .await
            .unwrap();
        assert!(!outcome.applied);
        assert_eq!(outcome.skipped, Some(SkipReason::LedgerExists));
        assert_eq!(outcome.status, RechargeStatus::Succeeded);
        assert_eq!(t.balance("u1").await, Cents::new(10_000));
        assert_eq!(ledger_credits(&t, "u1").await, 1);
        assert_eq!(t.status(recharge).await, RechargeStatus::Succeeded);
    }

    #[tokio::test]
    async fn canceled_and_failed_close_without_ledger() {
        let t = TestEngine::new();
        let canceled = t.open("u1", 1_000).await;
        let failed = t.open("u1", 1_000).await;

        let outcome = t
            .engine
            .reconcile(
                Trigger::Sweep,
                RechargeRef::Id(canceled),
                &ProviderStatus::Canceled,
                Cents::new(1_000),
                "MXN",
            )
            .await
            .unwrap();
        assert!(outcome.applied);
        assert_eq!(outcome.status, RechargeStatus::Canceled);

        let outcome = t
            .engine
            .reconcile(
                Trigger::Sweep,
                RechargeRef::Id(failed),
                &ProviderStatus::RequiresConfirmation,
                Cents::new(1_000),
                "MXN",
            )
            .await
            .unwrap();
        assert!(outcome.applied);
        assert_eq!(outcome.status, RechargeStatus::Failed);

        assert_eq!(t.balance("u1").await, Cents::ZERO);
        assert_eq!(ledger_credits(&t, "u1").await, 0);
    }

    #[tokio::test]
    async fn unresolved_status_is_a_no_op() {
        let t = TestEngine::new();
        let recharge = t.open("u1", 1_000).await;
        let outcome = t
            .engine
            .reconcile(
                Trigger::Recheck,
                RechargeRef::Id(recharge),
                &ProviderStatus::Other("processing".into()),
                Cents::new(1_000),
                "MXN",
            )
            .await
            .unwrap();
        assert!(!outcome.applied);
        assert_eq!(outcome.status, RechargeStatus::Pending);
        assert_eq!(outcome.skipped, Some(SkipReason::Unresolved));
    }

    #[tokio::test]
    async fn terminal_recharges_never_change() {
        let t = TestEngine::new();
        let statuses = [
            (ProviderStatus::Succeeded, RechargeStatus::Succeeded),
            (ProviderStatus::Canceled, RechargeStatus::Canceled),
            (ProviderStatus::RequiresPaymentMethod, RechargeStatus::Failed),
        ];
        for (first, expected) in statuses {
            let recharge = t.open("u1", 1_000).await;
            t.engine
                .reconcile(
                    Trigger::Webhook,
                    RechargeRef::Id(recharge),
                    &first,
                    Cents::new(1_000),
                    "MXN",
                )
                .await
                .unwrap();
            let balance = t.balance("u1").await;

            for next in [
                ProviderStatus::Succeeded,
                ProviderStatus::Canceled,
                ProviderStatus::RequiresConfirmation,
            ] {
                let outcome = t
                    .engine
                    .reconcile(
                        Trigger::Sweep,
                        RechargeRef::Id(recharge),
                        &next,
                        Cents::new(1_000),
                        "MXN",
                    )
                    .await
                    .unwrap();
                assert!(!outcome.applied);
                assert_eq!(outcome.status, expected);
            }
            assert_eq!(t.status(recharge).await, expected);
            assert_eq!(t.balance("u1").await, balance);
        }
        assert_eq!(ledger_credits(&t, "u1").await, 1);
    }

    #[tokio::test]
    async fn unknown_references_are_not_found() {
        let t = TestEngine::new();
        let result = t
            .engine
            .reconcile(
                Trigger::Webhook,
                RechargeRef::Payment("pi_missing".into()),
                &ProviderStatus::Succeeded,
                Cents::new(1_000),
                "MXN",
            )
            .await;
        assert!(matches!(
            result,
            Err(EngineError::NotFound(NotFound::Payment(_)))
        ));

        let result = t
            .engine
            .reconcile(
                Trigger::Recheck,
                RechargeRef::Id(RechargeId::generate()),
                &ProviderStatus::Succeeded,
                Cents::new(1_000),
                "MXN",
            )
            .await;
        assert!(matches!(
            result,
            Err(EngineError::NotFound(NotFound::Recharge(_)))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_triggers_credit_exactly_once() {
        let t = TestEngine::new();
        let identity = Identity::new(UserId::new("u1"));
        let recharge = t.open("u1", 10_000).await;
        let payment_id = ppid(&t, recharge).await;
        t.provider
            .set_status(&payment_id, ProviderStatus::Succeeded);

        let engine = Arc::clone(&t.engine);
        let mut handles = Vec::new();
        for i in 0..48 {
            let engine = Arc::clone(&engine);
            let identity = identity.clone();
            let payment_id = payment_id.clone();
            handles.push(tokio::spawn(async move {
                match i % 3 {
                    0 => engine
                        .reconcile(
                            Trigger::Webhook,
                            RechargeRef::Payment(payment_id),
                            &ProviderStatus::Succeeded,
                            Cents::new(10_000),
                            "mxn",
                        )
                        .await
                        .map(|o| o.credited.is_some()),
                    1 => engine
                        .recheck(&identity, recharge)
                        .await
                        .map(|o| o.credited.is_some()),
                    _ => engine
                        .sweep(crate::engine::SweepScope::All, None)
                        .await
                        .map(|report| report.credited() > 0),
                }
            }));
        }

        let mut credited = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() {
                credited += 1;
            }
        }

        assert_eq!(credited, 1);
        assert_eq!(t.balance("u1").await, Cents::new(10_000));
        assert_eq!(ledger_credits(&t, "u1").await, 1);
        assert_eq!(t.status(recharge).await, RechargeStatus::Succeeded);
        assert!(t.engine.audit_wallet(&UserId::new("u1")).await.unwrap().consistent);
    }
}
