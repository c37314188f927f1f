//! Scripted replay of wallet events.
//!
//! Drives an [`Engine`] backed by a [`MemoryStore`] and a [`ScriptedProvider`]
//! from a stream of [`Command`]s. Recharges are referred to by caller-chosen
//! aliases since their ids are only known once opened.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use thiserror::Error;
use tokio_stream::{Stream, StreamExt};
use tracing::info;

use crate::amount::{Cents, Liters};
use crate::config::{Config, ConfigError};
use crate::engine::{
    DispenseRequest, Engine, EngineError, ScriptedProvider, SweepScope, WalletAudit,
};
use crate::model::{Identity, ProviderEvent, ProviderStatus, RechargeId, UserId};
use crate::store::MemoryStore;

/// One replayed event.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Opens a recharge and binds it to `alias`.
    Open {
        user: UserId,
        alias: String,
        amount: Cents,
    },
    /// Changes what the provider reports for the aliased payment.
    Provider {
        alias: String,
        status: ProviderStatus,
    },
    /// Delivers a push event; `amount` defaults to the recharge amount.
    Webhook {
        alias: String,
        event_id: String,
        status: ProviderStatus,
        amount: Option<Cents>,
    },
    /// Manual recheck; `user` defaults to the recharge owner.
    Recheck {
        user: Option<UserId>,
        alias: String,
    },
    Sweep {
        user: Option<UserId>,
    },
    Dispense {
        user: UserId,
        liters: Liters,
        machine: Option<String>,
    },
}

impl Command {
    fn kind(&self) -> &'static str {
        match self {
            Command::Open { .. } => "open",
            Command::Provider { .. } => "provider",
            Command::Webhook { .. } => "webhook",
            Command::Recheck { .. } => "recheck",
            Command::Sweep { .. } => "sweep",
            Command::Dispense { .. } => "dispense",
        }
    }
}

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("unknown recharge alias '{0}'")]
    UnknownAlias(String),

    #[error("recharge alias '{0}' is already bound")]
    DuplicateAlias(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

#[derive(Debug, Clone)]
struct Opened {
    id: RechargeId,
    user: UserId,
    payment_id: String,
    amount: Cents,
}

pub struct Replay {
    engine: Engine,
    provider: Arc<ScriptedProvider>,
    aliases: HashMap<String, Opened>,
    users: BTreeSet<UserId>,
}

impl Replay {
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        let provider = Arc::new(ScriptedProvider::new());
        let engine = Engine::new(Arc::new(MemoryStore::new()), provider.clone(), config)?;
        Ok(Self {
            engine,
            provider,
            aliases: HashMap::new(),
            users: BTreeSet::new(),
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Applies every command of `stream`. A failing command is logged and
    /// skipped.
    pub async fn run(&mut self, mut stream: impl Stream<Item = Command> + Unpin) {
        while let Some(command) = stream.next().await {
            let _ = self.apply(command).await;
        }
    }

    pub async fn apply(&mut self, command: Command) -> Result<(), ReplayError> {
        let kind = command.kind();
        let result = self.dispatch(command).await;
        Self::log_result(kind, &result);
        result
    }

    /// Audits of every user seen so far, ordered by user id.
    pub async fn wallets(&self) -> Result<Vec<WalletAudit>, EngineError> {
        let mut audits = Vec::with_capacity(self.users.len());
        for user in &self.users {
            audits.push(self.engine.audit_wallet(user).await?);
        }
        Ok(audits)
    }
}

impl Replay {
    fn log_result(kind: &str, result: &Result<(), ReplayError>) {
        match result {
            Ok(()) => info!("{kind} applied"),
            Err(e) => info!(reason = %e, "{kind} skipped"),
        }
    }

    fn opened(&self, alias: &str) -> Result<Opened, ReplayError> {
        self.aliases
            .get(alias)
            .cloned()
            .ok_or_else(|| ReplayError::UnknownAlias(alias.to_string()))
    }

    async fn dispatch(&mut self, command: Command) -> Result<(), ReplayError> {
        match command {
            Command::Open {
                user,
                alias,
                amount,
            } => {
                if self.aliases.contains_key(&alias) {
                    return Err(ReplayError::DuplicateAlias(alias));
                }
                self.users.insert(user.clone());
                let intent = self
                    .engine
                    .open_recharge(&Identity::new(user.clone()), amount)
                    .await?;
                self.aliases.insert(
                    alias,
                    Opened {
                        id: intent.recharge_id,
                        user,
                        payment_id: intent.provider_payment_id,
                        amount,
                    },
                );
            }
            Command::Provider { alias, status } => {
                let opened = self.opened(&alias)?;
                self.provider.set_status(&opened.payment_id, status);
            }
            Command::Webhook {
                alias,
                event_id,
                status,
                amount,
            } => {
                let opened = self.opened(&alias)?;
                let event = ProviderEvent {
                    event_id,
                    provider_payment_id: opened.payment_id,
                    status,
                    amount: amount.unwrap_or(opened.amount),
                    currency: self.engine.config().currency.to_ascii_lowercase(),
                };
                self.engine.handle_provider_event(&event).await?;
            }
            Command::Recheck { user, alias } => {
                let opened = self.opened(&alias)?;
                let user = user.unwrap_or(opened.user);
                self.users.insert(user.clone());
                self.engine
                    .recheck(&Identity::new(user), opened.id)
                    .await?;
            }
            Command::Sweep { user } => {
                let scope = match user {
                    Some(user) => SweepScope::User(user),
                    None => SweepScope::All,
                };
                self.engine.sweep(scope, None).await?;
            }
            Command::Dispense {
                user,
                liters,
                machine,
            } => {
                self.users.insert(user.clone());
                self.engine
                    .dispense(
                        &Identity::new(user),
                        DispenseRequest {
                            liters,
                            machine_id: machine,
                            location: None,
                        },
                    )
                    .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::test_config;

    fn open(user: &str, alias: &str, cents: i64) -> Command {
        Command::Open {
            user: UserId::new(user),
            alias: alias.to_string(),
            amount: Cents::new(cents),
        }
    }

    fn provider(alias: &str, status: ProviderStatus) -> Command {
        Command::Provider {
            alias: alias.to_string(),
            status,
        }
    }

    fn webhook(alias: &str, event_id: &str) -> Command {
        Command::Webhook {
            alias: alias.to_string(),
            event_id: event_id.to_string(),
            status: ProviderStatus::Succeeded,
            amount: None,
        }
    }

    fn dispense(user: &str, liters: u32) -> Command {
        Command::Dispense {
            user: UserId::new(user),
            liters: Liters::whole(liters),
            machine: None,
        }
    }

    async fn audit(replay: &Replay, user: &str) -> WalletAudit {
        replay
            .wallets()
            .await
            .unwrap()
            .into_iter()
            .find(|a| a.user_id.as_str() == user)
            .unwrap()
    }

    #[tokio::test]
    async fn webhook_recheck_and_sweep_credit_once() {
        let mut replay = Replay::new(test_config()).unwrap();
        let commands = vec![
            open("alice", "r1", 10_000),
            provider("r1", ProviderStatus::Succeeded),
            webhook("r1", "E1"),
            webhook("r1", "E1"),
            Command::Recheck {
                user: None,
                alias: "r1".into(),
            },
            Command::Sweep { user: None },
        ];
        replay.run(tokio_stream::iter(commands)).await;

        let alice = audit(&replay, "alice").await;
        assert_eq!(alice.balance, Cents::new(10_000));
        assert!(alice.consistent);
    }

    #[tokio::test]
    async fn failing_commands_do_not_stop_the_replay() {
        let mut replay = Replay::new(test_config()).unwrap();
        let commands = vec![
            open("bob", "r1", 5_000),
            open("bob", "r1", 5_000),
            webhook("missing", "E1"),
            dispense("bob", 20),
            provider("r1", ProviderStatus::Succeeded),
            Command::Sweep {
                user: Some(UserId::new("bob")),
            },
            dispense("bob", 20),
        ];
        replay.run(tokio_stream::iter(commands)).await;

        let bob = audit(&replay, "bob").await;
        assert_eq!(bob.balance, Cents::new(1_500));
        assert_eq!(bob.ledger_sum, Cents::new(1_500));
    }

    #[tokio::test]
    async fn apply_reports_errors() {
        let mut replay = Replay::new(test_config()).unwrap();
        assert!(matches!(
            replay.apply(webhook("nope", "E1")).await,
            Err(ReplayError::UnknownAlias(_))
        ));
        replay.apply(open("carol", "r1", 1_000)).await.unwrap();
        assert!(matches!(
            replay.apply(open("carol", "r1", 1_000)).await,
            Err(ReplayError::DuplicateAlias(_))
        ));
        assert!(matches!(
            replay.apply(dispense("carol", 5)).await,
            Err(ReplayError::Engine(EngineError::InsufficientFunds(_)))
        ));
    }
}
