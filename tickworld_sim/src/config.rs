//! World configuration: topology, machine placements and task templates.

use crate::actions::ActionConfig;
use crate::machine::MachineKind;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tickworld_core::{
    NodeRole, NodeSpec, PersistenceError, RoutingError, SchedulerError, TopologyError, TopologySpec,
    DEFAULT_GROUP,
};
use tickworld_env::{Address, NetId};

/// Harness errors.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid world file: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("Machine {name} placed on unknown node {address}")]
    UnplacedMachine { name: String, address: NetId },

    #[error("No machine sits on node {0}")]
    UnknownMachine(NetId),
}

/// A machine and the node it sits on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachinePlacement {
    pub name: String,
    pub kind: MachineKind,
    pub address: NetId,
}

/// A task template registered for one machine kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateConfig {
    pub kind: MachineKind,
    pub name: String,

    #[serde(default = "default_group")]
    pub group: String,

    pub initial_delay: u64,

    /// `<= 0` for one-shot
    #[serde(default)]
    pub periodic_delay: i64,

    pub action: ActionConfig,
}

fn default_group() -> String {
    DEFAULT_GROUP.to_string()
}

fn default_groups() -> Vec<String> {
    vec![DEFAULT_GROUP.to_string()]
}

/// Configuration for a simulated world.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldConfig {
    /// Master seed for determinism
    pub seed: u64,

    /// Ticks to run
    pub ticks: u64,

    /// Groups advanced on every tick, in order
    #[serde(default = "default_groups")]
    pub groups: Vec<String>,

    pub topology: TopologySpec,

    #[serde(default)]
    pub machines: Vec<MachinePlacement>,

    #[serde(default)]
    pub templates: Vec<TemplateConfig>,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self::generated(42)
    }
}

impl WorldConfig {
    /// Loads a world description from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SimError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Builds a random tiered world from `seed`.
    ///
    /// Every device hosts a machine. Computers run a heartbeat; servers
    /// override it and also beacon to a seeded sample of devices.
    pub fn generated(seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let topology = generate_topology(&mut rng, 3, 4);

        let devices: Vec<NetId> = topology
            .nodes
            .iter()
            .filter(|n| n.role == NodeRole::Device)
            .map(|n| n.id.clone())
            .collect();

        let machines: Vec<MachinePlacement> = devices
            .iter()
            .enumerate()
            .map(|(i, id)| MachinePlacement {
                name: format!("m{}", i),
                kind: if rng.gen_bool(0.5) {
                    MachineKind::Server
                } else {
                    MachineKind::Computer
                },
                address: id.clone(),
            })
            .collect();

        let targets: Vec<Address> = devices
            .choose_multiple(&mut rng, devices.len().min(4))
            .map(|id| Address::new(id.clone(), 80))
            .collect();

        let templates = vec![
            TemplateConfig {
                kind: MachineKind::Computer,
                name: "heartbeat".into(),
                group: DEFAULT_GROUP.into(),
                initial_delay: 1,
                periodic_delay: 3,
                action: ActionConfig::Heartbeat {
                    counter: "computer_heartbeat".into(),
                },
            },
            TemplateConfig {
                kind: MachineKind::Server,
                name: "heartbeat".into(),
                group: DEFAULT_GROUP.into(),
                initial_delay: 2,
                periodic_delay: 2,
                action: ActionConfig::Heartbeat {
                    counter: "server_heartbeat".into(),
                },
            },
            TemplateConfig {
                kind: MachineKind::Server,
                name: "beacon".into(),
                group: "network".into(),
                initial_delay: 1,
                periodic_delay: 5,
                action: ActionConfig::Beacon { targets },
            },
        ];

        Self {
            seed,
            ticks: 40,
            groups: vec![DEFAULT_GROUP.to_string(), "network".to_string()],
            topology,
            machines,
            templates,
        }
    }

    pub fn with_ticks(mut self, ticks: u64) -> Self {
        self.ticks = ticks;
        self
    }
}

/// Generates a tree of networks at most `max_depth` tiers deep.
///
/// The root network has no uplink router and always holds at least two
/// devices. Every other network has its uplink router at local id 0.
pub fn generate_topology(rng: &mut impl Rng, max_depth: usize, fanout: u32) -> TopologySpec {
    let mut nodes = Vec::new();
    grow(rng, &NetId::root(), 1, max_depth, fanout.max(2), &mut nodes);

    let next = nodes.iter().filter(|n| n.id.depth() == 1).count() as u32;
    nodes.push(NodeSpec::new(NetId::root().child(next), NodeRole::Device));
    nodes.push(NodeSpec::new(NetId::root().child(next + 1), NodeRole::Device));

    TopologySpec {
        nodes,
        ..Default::default()
    }
}

fn grow(rng: &mut impl Rng, prefix: &NetId, depth: usize, max_depth: usize, fanout: u32, nodes: &mut Vec<NodeSpec>) {
    let first = if prefix.is_root() {
        0
    } else {
        nodes.push(NodeSpec::new(prefix.child(0), NodeRole::UplinkRouter));
        1
    };

    let count = rng.gen_range(1..=fanout);
    for k in first..first + count {
        let id = prefix.child(k);
        if depth < max_depth && rng.gen_bool(0.4) {
            nodes.push(NodeSpec::new(id.clone(), NodeRole::DownlinkRouter));
            grow(rng, &id, depth + 1, max_depth, fanout, nodes);
        } else {
            nodes.push(NodeSpec::new(id, NodeRole::Device));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_generated_is_deterministic() {
        assert_eq!(WorldConfig::generated(7), WorldConfig::generated(7));
        assert_eq!(WorldConfig::generated(7).machines.len(), WorldConfig::generated(7).topology.nodes.iter().filter(|n| n.role == NodeRole::Device).count());
    }

    #[test]
    fn test_world_json_round_trip() {
        let config = WorldConfig::generated(3);
        let json = serde_json::to_string_pretty(&config).unwrap();
        let back: WorldConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_minimal_world_json() {
        let json = r#"{
            "seed": 1,
            "ticks": 10,
            "topology": { "nodes": [ { "id": [0], "role": "device" } ] },
            "templates": [
                { "kind": "computer", "name": "boot", "initial_delay": 3,
                  "action": { "type": "heartbeat", "counter": "boot" } }
            ]
        }"#;
        let config: WorldConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.groups, vec!["default".to_string()]);
        assert_eq!(config.templates[0].group, "default");
        assert_eq!(config.templates[0].periodic_delay, 0);
        assert!(config.machines.is_empty());
    }

    #[test]
    fn test_load_missing_file() {
        let err = WorldConfig::load("/nonexistent/world.json").unwrap_err();
        assert!(matches!(err, SimError::Io(_)));
    }

    proptest! {
        #[test]
        fn prop_generated_topology_is_well_formed(seed in any::<u64>()) {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let spec = generate_topology(&mut rng, 3, 4);

            let mut ids: Vec<&NetId> = spec.nodes.iter().map(|n| &n.id).collect();
            let total = ids.len();
            ids.sort();
            ids.dedup();
            prop_assert_eq!(ids.len(), total);

            // Every non-root network hangs below a downlink router
            for node in &spec.nodes {
                let prefix = node.id.parent().unwrap();
                if !prefix.is_root() {
                    prop_assert!(spec.nodes.iter().any(|n| n.id == prefix && n.role == NodeRole::DownlinkRouter));
                }
            }
        }
    }
}
