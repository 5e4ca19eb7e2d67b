//! SimWorld - the simulation harness container.

use crate::actions::action_factory;
use crate::config::{SimError, WorldConfig};
use crate::machine::{lock, Machine};

use std::collections::BTreeMap;
use std::sync::Arc;
use tickworld_core::{
    ActionFactory, Delivery, Inbox, SchedulerDefinition, SchedulerHandle, SchedulerRegistry,
    SchedulerSnapshot, SchedulerStore, SchedulerTask, TaskTiming, Topology,
};
use tickworld_env::{NetId, PacketSink, SchedulerId};
use tracing::{debug, info, warn};

/// Counters accumulated over a world's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorldStats {
    pub tasks_fired: u64,
    pub tasks_removed: u64,
    pub packets_sent: u64,
    pub packets_delivered: u64,
    pub packets_dismissed: u64,

    /// Hops walked by delivered packets
    pub total_hops: u64,

    /// Packets rejected with a routing error
    pub routing_errors: u64,
}

/// Per-machine counters and received packet count, keyed by machine name.
pub type Fingerprint = BTreeMap<String, (BTreeMap<String, u64>, usize)>;

/// Adds up the fingerprints of two consecutive runs of the same world.
pub fn merge_fingerprints(mut first: Fingerprint, second: Fingerprint) -> Fingerprint {
    for (name, (counters, received)) in second {
        let entry = first.entry(name).or_default();
        for (counter, value) in counters {
            *entry.0.entry(counter).or_insert(0) += value;
        }
        entry.1 += received;
    }
    first
}

/// The SimWorld - container for the entire simulation.
pub struct SimWorld {
    /// Configuration
    pub config: WorldConfig,

    registry: SchedulerRegistry,
    topology: Topology,
    definition: SchedulerDefinition<Machine>,
    factory: ActionFactory<Machine>,

    machines: BTreeMap<NetId, Arc<Machine>>,
    schedulers: BTreeMap<NetId, SchedulerHandle<Machine>>,

    stats: WorldStats,
    tick_count: u64,
}

impl SimWorld {
    /// Builds a world with every machine's scheduler freshly populated from
    /// the configured templates.
    pub fn new(config: WorldConfig) -> Result<Self, SimError> {
        let mut world = Self::assemble(config)?;
        let ids: Vec<(usize, NetId)> = world.machines.keys().cloned().enumerate().collect();
        for (index, address) in ids {
            world.spawn_scheduler(index, &address)?;
        }
        info!(
            "world ready: {} machines, {} nodes, {} live schedulers",
            world.machines.len(),
            world.topology.node_count(),
            world.registry.len()
        );
        Ok(world)
    }

    /// Builds a world whose schedulers come from `store` where a snapshot
    /// exists, falling back to fresh templates otherwise.
    pub fn resume(config: WorldConfig, store: &dyn SchedulerStore) -> Result<Self, SimError> {
        let mut world = Self::assemble(config)?;
        let ids: Vec<(usize, NetId)> = world.machines.keys().cloned().enumerate().collect();
        let mut restored = 0;
        for (index, address) in ids {
            let id = SchedulerId::from_seed(index as u64);
            match store.load(id)? {
                Some(snapshot) => {
                    let machine = world.machine_arc(&address)?;
                    let handle = snapshot.restore_shared(&machine, &world.registry, &world.factory)?;
                    world.schedulers.insert(address, handle);
                    restored += 1;
                }
                None => world.spawn_scheduler(index, &address)?,
            }
        }
        info!("world resumed: {} schedulers restored from store", restored);
        Ok(world)
    }

    fn assemble(config: WorldConfig) -> Result<Self, SimError> {
        let machines: BTreeMap<NetId, Arc<Machine>> = config
            .machines
            .iter()
            .map(|p| (p.address.clone(), Machine::shared(p.name.clone(), p.kind, p.address.clone())))
            .collect();

        let mut topology = Topology::from_spec(&config.topology, |node| match machines.get(&node.id) {
            Some(machine) => machine.clone() as Arc<dyn PacketSink>,
            None => Inbox::new() as Arc<dyn PacketSink>,
        })?;

        for placement in &config.machines {
            if topology.node(&placement.address).is_none() {
                return Err(SimError::UnplacedMachine {
                    name: placement.name.clone(),
                    address: placement.address.clone(),
                });
            }
        }
        // Machines placed on routers receive through the router's local sink
        for (address, machine) in &machines {
            topology.bind_sink(address, machine.clone())?;
        }

        let mut definition = SchedulerDefinition::new("world");
        for template in &config.templates {
            let task = SchedulerTask::from_boxed(template.action.build())
                .named(template.name.clone())
                .in_group(template.group.clone())
                .with_timing(TaskTiming {
                    initial_delay: template.initial_delay,
                    periodic_delay: template.periodic_delay,
                    elapsed: 0,
                });
            definition.schedule(&task, template.kind)?;
        }

        Ok(Self {
            config,
            registry: SchedulerRegistry::new(),
            topology,
            definition,
            factory: action_factory(),
            machines,
            schedulers: BTreeMap::new(),
            stats: WorldStats::default(),
            tick_count: 0,
        })
    }

    fn machine_arc(&self, address: &NetId) -> Result<Arc<Machine>, SimError> {
        self.machines
            .get(address)
            .cloned()
            .ok_or_else(|| SimError::UnknownMachine(address.clone()))
    }

    fn spawn_scheduler(&mut self, index: usize, address: &NetId) -> Result<(), SimError> {
        let machine = self.machine_arc(address)?;
        let handle = self
            .definition
            .realize(SchedulerId::from_seed(index as u64), &machine, &self.registry)?;
        self.schedulers.insert(address.clone(), handle);
        Ok(())
    }

    /// Advances every configured group by one tick, then routes whatever
    /// the machines queued.
    pub fn tick(&mut self) {
        for group in &self.config.groups {
            let summary = self.registry.tick_all(group);
            self.stats.tasks_fired += summary.fired as u64;
            self.stats.tasks_removed += summary.removed as u64;
        }
        self.flush_outboxes();
        self.tick_count += 1;
    }

    /// Runs `ticks` ticks.
    pub fn run(&mut self, ticks: u64) {
        for tick in 0..ticks {
            self.tick();
            if tick % 10 == 0 {
                debug!(
                    "  tick={} | live schedulers={} | delivered={}",
                    self.tick_count,
                    self.registry.len(),
                    self.stats.packets_delivered
                );
            }
        }
    }

    fn flush_outboxes(&mut self) {
        for machine in self.machines.values() {
            for packet in machine.drain_outbox() {
                self.stats.packets_sent += 1;
                match self.topology.send(machine.address(), packet) {
                    Ok(Delivery::Delivered { route, .. }) => {
                        self.stats.packets_delivered += 1;
                        self.stats.total_hops += route.len() as u64;
                    }
                    Ok(Delivery::Dismissed { .. }) => self.stats.packets_dismissed += 1,
                    Err(e) => {
                        warn!("{}: {}", machine.name(), e);
                        self.stats.routing_errors += 1;
                    }
                }
            }
        }
    }

    /// Saves every scheduler to `store`. Returns how many were saved.
    pub fn snapshot(&self, store: &dyn SchedulerStore) -> Result<usize, SimError> {
        for handle in self.schedulers.values() {
            let snapshot = SchedulerSnapshot::capture(&lock(handle));
            store.save(&snapshot)?;
        }
        debug!("saved {} scheduler snapshots", self.schedulers.len());
        Ok(self.schedulers.len())
    }

    pub fn registry(&self) -> &SchedulerRegistry {
        &self.registry
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn definition(&self) -> &SchedulerDefinition<Machine> {
        &self.definition
    }

    pub fn machine(&self, address: &NetId) -> Option<&Arc<Machine>> {
        self.machines.get(address)
    }

    pub fn machines(&self) -> impl Iterator<Item = &Arc<Machine>> {
        self.machines.values()
    }

    pub fn scheduler(&self, address: &NetId) -> Option<&SchedulerHandle<Machine>> {
        self.schedulers.get(address)
    }

    pub fn stats(&self) -> &WorldStats {
        &self.stats
    }

    /// Returns the current tick count.
    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Per-machine counters and received packet counts, for comparing runs.
    pub fn fingerprint(&self) -> Fingerprint {
        self.machines
            .values()
            .map(|m| (m.name().to_string(), (m.counters(), m.received_count())))
            .collect()
    }
}
