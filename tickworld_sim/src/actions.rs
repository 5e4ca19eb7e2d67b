//! Task actions available to world configurations.
//!
//! Every action carries its whole state as serde data so scheduler
//! snapshots can rebuild it through `action_factory()`.

use crate::machine::Machine;
use serde::{Deserialize, Serialize};
use tickworld_core::{ActionFactory, TaskAction, TaskContext};
use tickworld_env::Address;
use tracing::trace;

/// Bumps one counter on the owning machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub counter: String,
}

impl Heartbeat {
    pub const KIND: &'static str = "heartbeat";

    pub fn new(counter: impl Into<String>) -> Self {
        Self {
            counter: counter.into(),
        }
    }
}

impl TaskAction<Machine> for Heartbeat {
    fn kind(&self) -> &str {
        Self::KIND
    }

    fn execute(&mut self, ctx: &mut TaskContext<'_, Machine>) {
        ctx.owner().bump(&self.counter);
    }

    fn clone_action(&self) -> Box<dyn TaskAction<Machine>> {
        Box::new(self.clone())
    }

    fn state(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Sends one packet per firing, cycling through `targets`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Beacon {
    pub targets: Vec<Address>,

    /// Firings so far; selects the next target
    #[serde(default)]
    pub seq: u64,
}

impl Beacon {
    pub const KIND: &'static str = "beacon";

    pub fn new(targets: Vec<Address>) -> Self {
        Self { targets, seq: 0 }
    }
}

impl TaskAction<Machine> for Beacon {
    fn kind(&self) -> &str {
        Self::KIND
    }

    fn execute(&mut self, ctx: &mut TaskContext<'_, Machine>) {
        if self.targets.is_empty() {
            return;
        }
        let target = self.targets[(self.seq % self.targets.len() as u64) as usize].clone();
        self.seq += 1;

        let machine = ctx.owner();
        trace!("{} beacon #{} -> {}", machine.name(), self.seq, target);
        machine.send(target, self.seq.to_be_bytes().to_vec());
        machine.bump("beacons_sent");
    }

    fn clone_action(&self) -> Box<dyn TaskAction<Machine>> {
        Box::new(self.clone())
    }

    fn state(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Configured action, as written in world files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionConfig {
    Heartbeat { counter: String },
    Beacon { targets: Vec<Address> },
}

impl ActionConfig {
    pub fn build(&self) -> Box<dyn TaskAction<Machine>> {
        match self {
            ActionConfig::Heartbeat { counter } => Box::new(Heartbeat::new(counter.clone())),
            ActionConfig::Beacon { targets } => Box::new(Beacon::new(targets.clone())),
        }
    }
}

/// Factory that rebuilds every action this crate defines.
pub fn action_factory() -> ActionFactory<Machine> {
    let mut factory = ActionFactory::new();
    factory
        .register_serde::<Heartbeat>(Heartbeat::KIND)
        .register_serde::<Beacon>(Beacon::KIND);
    factory
}
