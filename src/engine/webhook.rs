//! Provider push events.
//!
//! Handled event ids are recorded after the domain effect, so a crash in
//! between can lead to a redelivery being processed again. That is harmless:
//! [`Engine::reconcile`] is idempotent on its own and the event log is only a
//! fast path.

use tracing::{debug, info};

use super::reconcile::{ReconcileOutcome, RechargeRef, Trigger};
use super::{Engine, EngineError};
use crate::model::{Provider, ProviderEvent, WebhookEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// The event id was seen before; nothing was done.
    Duplicate,
    Processed(ReconcileOutcome),
}

impl Engine {
    pub async fn already_handled(&self, event_id: &str) -> Result<bool, EngineError> {
        let mut tx = self.store.begin().await?;
        Ok(tx.webhook_event_exists(event_id).await?)
    }

    /// Records `event_id` as handled. Returns `false` if it already was.
    pub async fn mark_handled(&self, provider: Provider, event_id: &str) -> Result<bool, EngineError> {
        let mut tx = self.store.begin().await?;
        let inserted = tx
            .insert_webhook_event(WebhookEvent {
                provider,
                event_id: event_id.to_string(),
            })
            .await?;
        tx.commit().await?;
        Ok(inserted)
    }

    /// Check, reconcile, then mark handled.
    ///
    /// Events for payments without a matching recharge fail with
    /// [`NotFound`](super::NotFound) and are left unmarked so the provider
    /// delivers them again.
    pub async fn handle_provider_event(
        &self,
        event: &ProviderEvent,
    ) -> Result<WebhookOutcome, EngineError> {
        if self.already_handled(&event.event_id).await? {
            info!(event = %event.event_id, "duplicate provider event ignored");
            return Ok(WebhookOutcome::Duplicate);
        }

        let outcome = self
            .reconcile(
                Trigger::Webhook,
                RechargeRef::Payment(event.provider_payment_id.clone()),
                &event.status,
                event.amount,
                &event.currency,
            )
            .await?;

        if !self
            .mark_handled(self.provider.provider(), &event.event_id)
            .await?
        {
            debug!(event = %event.event_id, "provider event recorded concurrently");
        }
        Ok(WebhookOutcome::Processed(outcome))
    }
}
