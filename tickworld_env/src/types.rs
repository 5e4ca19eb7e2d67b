//! Common types for the tickworld environment.

use crate::error::EnvError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Hierarchical network identifier.
///
/// One integer segment per network tier, outermost (backbone-facing) tier
/// first, ending with the node's own id inside its network. The empty id
/// names the root network itself.
///
/// Text form is comma separated: `"0,2,1"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NetId(Vec<u32>);

impl NetId {
    /// The root network prefix (no segments).
    pub const fn root() -> Self {
        Self(Vec::new())
    }

    /// Creates a NetId from its segments.
    pub fn new(segments: impl Into<Vec<u32>>) -> Self {
        Self(segments.into())
    }

    /// Returns the segments, outermost tier first.
    pub fn segments(&self) -> &[u32] {
        &self.0
    }

    /// Number of tiers this id spans.
    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// The node's own id inside its network (last segment).
    pub fn local_id(&self) -> Option<u32> {
        self.0.last().copied()
    }

    /// The id of the network this node lives in (all but the last segment).
    pub fn parent(&self) -> Option<NetId> {
        if self.0.is_empty() {
            None
        } else {
            Some(Self(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    /// Appends one tier, producing the id of a node inside the network
    /// whose prefix is `self`.
    pub fn child(&self, local_id: u32) -> NetId {
        let mut segments = self.0.clone();
        segments.push(local_id);
        Self(segments)
    }

    /// Element-wise prefix test. Every id starts with itself and with root.
    pub fn starts_with(&self, prefix: &NetId) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Segment at tier `index`, if the id is that deep.
    pub fn segment(&self, index: usize) -> Option<u32> {
        self.0.get(index).copied()
    }
}

impl From<Vec<u32>> for NetId {
    fn from(segments: Vec<u32>) -> Self {
        Self(segments)
    }
}

impl<const N: usize> From<[u32; N]> for NetId {
    fn from(segments: [u32; N]) -> Self {
        Self(segments.to_vec())
    }
}

impl std::fmt::Display for NetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for segment in &self.0 {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{}", segment)?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for NetId {
    type Err = EnvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Ok(NetId::root());
        }
        trimmed
            .split(',')
            .map(|part| {
                part.trim()
                    .parse::<u32>()
                    .map_err(|_| EnvError::invalid_net_id(s))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(NetId)
    }
}

/// A destination on the simulated network: node plus service port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub net_id: NetId,
    pub port: u16,
}

impl Address {
    pub fn new(net_id: impl Into<NetId>, port: u16) -> Self {
        Self {
            net_id: net_id.into(),
            port,
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]:{}", self.net_id, self.port)
    }
}

impl FromStr for Address {
    type Err = EnvError;

    /// Parses `"[0,1]:22"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .trim()
            .strip_prefix('[')
            .ok_or_else(|| EnvError::invalid_address(s))?;
        let (net, port) = rest
            .split_once("]:")
            .ok_or_else(|| EnvError::invalid_address(s))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| EnvError::invalid_address(s))?;
        Ok(Self {
            net_id: net.parse()?,
            port,
        })
    }
}

/// Unique identifier for a packet in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PacketId(pub Uuid);

impl PacketId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a deterministic PacketId from a sequence number (for simulation).
    pub fn from_seq(seq: u64) -> Self {
        Self(Uuid::from_u64_pair(0x7469_636b_776f_726c, seq))
    }
}

impl Default for PacketId {
    fn default() -> Self {
        Self::new()
    }
}

/// A packet travelling through the tiered network.
///
/// Packets are values: a node either consumes one (delivery) or hands it
/// to exactly one next node. Destination and payload never change in
/// flight; only `hop_count` is bumped by the forwarding loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub id: PacketId,

    /// Where the packet came from (informational)
    pub source: Option<Address>,

    /// Final destination
    pub destination: Address,

    /// Opaque application bytes
    pub payload: Vec<u8>,

    /// Number of node-to-node handoffs so far
    pub hop_count: u32,
}

impl Packet {
    /// Creates a new packet addressed to `destination`.
    pub fn new(destination: Address, payload: Vec<u8>) -> Self {
        Self {
            id: PacketId::new(),
            source: None,
            destination,
            payload,
            hop_count: 0,
        }
    }

    pub fn with_id(mut self, id: PacketId) -> Self {
        self.id = id;
        self
    }

    pub fn from_source(mut self, source: Address) -> Self {
        self.source = Some(source);
        self
    }

    /// Destination node id.
    pub fn destination_id(&self) -> &NetId {
        &self.destination.net_id
    }

    /// Returns the payload size in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// Identity of a live scheduler, used as the registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SchedulerId(pub Uuid);

impl SchedulerId {
    /// Creates a new random SchedulerId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a deterministic SchedulerId from a seed (for simulation).
    pub fn from_seed(seed: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&seed.to_le_bytes());
        bytes[8..16].copy_from_slice(&seed.wrapping_mul(0x517cc1b727220a95).to_le_bytes());
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SchedulerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SchedulerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Show first 8 chars for readability
        write!(f, "{}", &self.0.to_string()[..8])
    }
}
