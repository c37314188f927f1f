//! Wallet engine.
//!
//! The engine owns no state of its own: balances, ledger, recharges and
//! dispenses live in the [`Store`], payment statuses come from the
//! [`PaymentProvider`]. Every operation takes `&self`, so one engine can be
//! shared across any number of concurrent request handlers and all
//! cross-request invariants are enforced through store transactions.

use std::sync::Arc;

use crate::config::{Config, ConfigError};
use crate::store::Store;

mod error;
pub use error::{EngineError, InsufficientFunds, NotFound, ValidationError};

mod state;
pub use state::{Transition, target_status};

mod provider;
pub use provider::{
    IntentRequest, PaymentProvider, ProviderError, ProviderIntent, ProviderPayment,
    ScriptedProvider,
};

mod reconcile;
pub use reconcile::{ReconcileOutcome, RechargeRef, SkipReason, Trigger};

mod webhook;
pub use webhook::WebhookOutcome;

mod recharge;
pub use recharge::{RechargeIntent, SweepItem, SweepOutcome, SweepReport, SweepScope};

mod dispense;
pub use dispense::{DispenseReceipt, DispenseRequest, PricingInfo, Quote};

mod history;
pub use history::{ActivityItem, ActivityKind, WalletAudit};

mod links;
pub use links::{GeneratedLink, MachineRegistry, ResolvedMachine};

pub struct Engine {
    store: Arc<dyn Store>,
    provider: Arc<dyn PaymentProvider>,
    config: Arc<Config>,
    machines: MachineRegistry,
}

impl Engine {
    /// Fails if `config` does not pass [`Config::validate`].
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn PaymentProvider>,
        config: Config,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let machines = MachineRegistry::from_config(&config.machines);
        Ok(Self {
            store,
            provider,
            config: Arc::new(config),
            machines,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn machines(&self) -> &MachineRegistry {
        &self.machines
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::test_support::test_config;
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn new_rejects_invalid_config() {
        let mut config = test_config();
        config.recharge.sweep_max_page_size = 0;
        let result = Engine::new(
            Arc::new(MemoryStore::new()),
            Arc::new(ScriptedProvider::new()),
            config,
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }
}
