//! Simulated machines: the owning contexts of the world's schedulers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tickworld_env::{Address, ContextKind, NetId, Packet, PacketId, PacketSink, Schedulable};

pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Folds a NetId into a stable 32-bit key.
fn address_key(id: &NetId) -> u64 {
    id.segments()
        .iter()
        .fold(17u64, |h, s| h.wrapping_mul(31).wrapping_add(*s as u64))
        & 0xffff_ffff
}

/// Machine kinds. `Server` and `Router` specialize `Computer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineKind {
    Computer,
    Server,
    Router,
}

impl ContextKind for MachineKind {
    fn base(&self) -> Option<Self> {
        match self {
            MachineKind::Computer => None,
            MachineKind::Server | MachineKind::Router => Some(MachineKind::Computer),
        }
    }
}

impl std::str::FromStr for MachineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "computer" | "pc" => Ok(MachineKind::Computer),
            "server" => Ok(MachineKind::Server),
            "router" => Ok(MachineKind::Router),
            _ => Err(format!("Unknown machine kind: {}", s)),
        }
    }
}

/// A machine placed on a network node.
///
/// Tasks running on the machine queue packets in its outbox; the world
/// flushes outboxes through the topology after each tick. Packets that
/// reach the machine's node land in its inbox.
pub struct Machine {
    name: String,
    kind: MachineKind,
    address: NetId,

    outbox: Mutex<Vec<Packet>>,
    inbox: Mutex<Vec<Packet>>,

    /// Named event counters bumped by task actions
    counters: Mutex<BTreeMap<String, u64>>,

    /// Sequence for deterministic packet ids
    next_packet: Mutex<u64>,
}

impl Machine {
    pub fn new(name: impl Into<String>, kind: MachineKind, address: NetId) -> Self {
        Self {
            name: name.into(),
            kind,
            address,
            outbox: Mutex::new(Vec::new()),
            inbox: Mutex::new(Vec::new()),
            counters: Mutex::new(BTreeMap::new()),
            next_packet: Mutex::new(0),
        }
    }

    /// Creates an Arc-wrapped machine for sharing.
    pub fn shared(name: impl Into<String>, kind: MachineKind, address: NetId) -> Arc<Self> {
        Arc::new(Self::new(name, kind, address))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &NetId {
        &self.address
    }

    /// Queues a packet for the next outbox flush.
    pub fn send(&self, destination: Address, payload: Vec<u8>) {
        let seq = {
            let mut next = lock(&self.next_packet);
            *next += 1;
            *next
        };
        let packet = Packet::new(destination, payload)
            .with_id(PacketId::from_seq(address_key(&self.address) << 32 | seq))
            .from_source(Address::new(self.address.clone(), 0));
        lock(&self.outbox).push(packet);
    }

    pub fn drain_outbox(&self) -> Vec<Packet> {
        std::mem::take(&mut *lock(&self.outbox))
    }

    /// Packets received so far.
    pub fn received(&self) -> Vec<Packet> {
        lock(&self.inbox).clone()
    }

    pub fn received_count(&self) -> usize {
        lock(&self.inbox).len()
    }

    pub fn bump(&self, counter: &str) {
        *lock(&self.counters).entry(counter.to_string()).or_insert(0) += 1;
    }

    pub fn counter(&self, counter: &str) -> u64 {
        lock(&self.counters).get(counter).copied().unwrap_or(0)
    }

    pub fn counters(&self) -> BTreeMap<String, u64> {
        lock(&self.counters).clone()
    }
}

impl Schedulable for Machine {
    type Kind = MachineKind;

    fn kind(&self) -> MachineKind {
        self.kind
    }

    fn label(&self) -> String {
        format!("{}@{}", self.name, self.address)
    }
}

impl PacketSink for Machine {
    fn deliver(&self, packet: Packet) {
        lock(&self.inbox).push(packet);
    }
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("address", &self.address)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_lineage() {
        assert_eq!(MachineKind::Server.lineage(), vec![MachineKind::Server, MachineKind::Computer]);
        assert!(MachineKind::Router.is_a(MachineKind::Computer));
        assert!(!MachineKind::Computer.is_a(MachineKind::Server));
        assert_eq!("Server".parse::<MachineKind>(), Ok(MachineKind::Server));
        assert!("mainframe".parse::<MachineKind>().is_err());
    }

    #[test]
    fn test_outbox_and_inbox() {
        let machine = Machine::shared("alpha", MachineKind::Computer, NetId::from([0, 1]));
        machine.send(Address::new([2], 22), b"ssh".to_vec());
        machine.send(Address::new([2], 22), b"ssh".to_vec());

        let out = machine.drain_outbox();
        assert_eq!(out.len(), 2);
        assert_ne!(out[0].id, out[1].id);
        assert_eq!(out[0].source, Some(Address::new([0, 1], 0)));
        assert!(machine.drain_outbox().is_empty());

        machine.deliver(out[0].clone());
        assert_eq!(machine.received_count(), 1);
        assert_eq!(machine.label(), "alpha@0,1");
    }

    #[test]
    fn test_counters() {
        let machine = Machine::new("beta", MachineKind::Server, NetId::from([3]));
        machine.bump("boot");
        machine.bump("boot");
        assert_eq!(machine.counter("boot"), 2);
        assert_eq!(machine.counter("missing"), 0);
    }
}
