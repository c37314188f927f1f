//! Machine registry and signed machine links.

use std::collections::HashMap;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info};

use super::{Engine, EngineError, NotFound};
use crate::config::MachineConfig;
use crate::model::{Machine, MachineId};
use crate::signing::{self, LinkMode, SignedLink};

/// Known dispensing machines, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct MachineRegistry {
    machines: HashMap<MachineId, Machine>,
    allow_unknown: bool,
}

impl MachineRegistry {
    pub fn from_config(config: &MachineConfig) -> Self {
        Self {
            machines: config
                .registry
                .iter()
                .map(|m| (m.id.clone(), m.clone()))
                .collect(),
            allow_unknown: config.allow_unknown,
        }
    }

    pub fn lookup(&self, id: &MachineId) -> Option<&Machine> {
        self.machines.get(id)
    }

    /// An active registered machine. Unregistered ids resolve to a stand-in
    /// record only when unknown machines are allowed; inactive ones never do.
    pub fn resolve_active(&self, id: &MachineId) -> Result<Machine, NotFound> {
        match self.lookup(id) {
            Some(machine) if machine.is_active => Ok(machine.clone()),
            Some(_) => Err(NotFound::Machine(id.clone())),
            None if self.allow_unknown => Ok(Machine::unregistered(id.clone())),
            None => Err(NotFound::Machine(id.clone())),
        }
    }
}

/// A freshly signed link, ready to be rendered as a QR code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeneratedLink {
    pub machine_id: MachineId,
    pub mode: LinkMode,
    pub sig: String,
    pub ts: Option<i64>,
    pub url: String,
}

/// A link that passed verification and names a usable machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedMachine {
    pub mode: LinkMode,
    pub machine: Machine,
}

impl Engine {
    pub fn generate_link(&self, machine_id: &str, mode: LinkMode) -> Result<GeneratedLink, EngineError> {
        self.generate_link_at(machine_id, mode, Utc::now().timestamp_millis())
    }

    /// Signs a link for `machine_id`. `now` is only used by ephemeral links.
    pub fn generate_link_at(
        &self,
        machine_id: &str,
        mode: LinkMode,
        now: i64,
    ) -> Result<GeneratedLink, EngineError> {
        let id = MachineId::parse(machine_id)?;
        let machine = self.machines.resolve_active(&id)?;

        let signature = signing::sign(
            machine.id.as_str(),
            mode,
            self.config.links.secret.as_bytes(),
            Some(now),
        );
        let link = SignedLink::new(machine.id.as_str(), signature.clone());
        debug!(machine = %machine.id, mode = %mode, "link signed");
        Ok(GeneratedLink {
            url: link.deep_url(&self.config.links.base_url),
            machine_id: machine.id,
            mode,
            sig: signature.sig,
            ts: signature.ts,
        })
    }

    pub fn resolve_link(&self, query: &str) -> Result<ResolvedMachine, EngineError> {
        self.resolve_link_at(query, Utc::now().timestamp_millis())
    }

    /// Verifies a `?m=&sig=[&ts=]` query and looks the machine up.
    pub fn resolve_link_at(&self, query: &str, now: i64) -> Result<ResolvedMachine, EngineError> {
        let link = SignedLink::from_query(query);
        let mode = link
            .verify(
                self.config.links.secret.as_bytes(),
                now,
                self.config.links.ttl_ms,
            )
            .inspect_err(|reason| {
                info!(machine = %link.machine_id, reason = %reason, "link rejected");
            })?;

        let id = MachineId::parse(&link.machine_id)?;
        let machine = self.machines.resolve_active(&id)?;
        Ok(ResolvedMachine { mode, machine })
    }
}
