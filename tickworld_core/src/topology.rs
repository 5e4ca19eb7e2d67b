//! Tiered network topology and hop-by-hop forwarding.
//!
//! A `Topology` is a tree of `Network`s keyed by prefix. The root network
//! has the empty prefix; a network attached below the downlink router
//! `R` has prefix `R`. Forwarding asks the current node for one `Hop`,
//! resolves it against that node's own network links and repeats until the
//! packet is delivered or dismissed.

use crate::nodes::{DeviceNode, DownlinkRouterNode, NetNode, NodeRole, UplinkRouterNode};
use crate::routing::{DropReason, Hop, Routable, RoutingError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tickworld_env::{Address, NetId, Packet, PacketSink};
use tracing::{debug, warn};

/// Hop budget for one packet.
pub const DEFAULT_MAX_HOPS: u32 = 64;

/// Construction errors. Raised while building, never while forwarding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError {
    #[error("Network {0} already has an uplink router")]
    DuplicateUplink(NetId),

    #[error("Node {0} already exists")]
    DuplicateNode(NetId),

    #[error("Network [{0}] already exists")]
    DuplicateNetwork(NetId),

    #[error("No network with prefix [{0}]")]
    UnknownNetwork(NetId),

    #[error("Node {0} is not a downlink router")]
    NotADownlinkRouter(NetId),

    #[error("Downlink router {0} already carries a sub-network")]
    SubnetAlreadyAttached(NetId),

    #[error("Invalid node id: [{0}]")]
    InvalidNodeId(NetId),
}

/// One tier: the nodes sharing a prefix.
#[derive(Debug, Clone)]
pub struct Network {
    prefix: NetId,
    nodes: BTreeMap<u32, NetNode>,

    /// Local id of the uplink router
    uplink: Option<u32>,
}

impl Network {
    fn new(prefix: NetId) -> Self {
        Self {
            prefix,
            nodes: BTreeMap::new(),
            uplink: None,
        }
    }

    pub fn prefix(&self) -> &NetId {
        &self.prefix
    }

    pub fn node(&self, local_id: u32) -> Option<&NetNode> {
        self.nodes.get(&local_id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NetNode> {
        self.nodes.values()
    }

    /// Id of this network's uplink router.
    pub fn uplink(&self) -> Option<NetId> {
        self.uplink.map(|k| self.prefix.child(k))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// End state of one packet's traversal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Consumed by `at`. `route` lists every node entered after the origin.
    Delivered { at: NetId, route: Vec<NetId> },

    /// Dropped at `at`. `traversed` is kept for diagnostics only.
    Dismissed {
        at: NetId,
        reason: DropReason,
        traversed: Vec<NetId>,
    },
}

impl Delivery {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Delivery::Delivered { .. })
    }

    /// Hops of a successful delivery. Empty when the packet was dismissed.
    pub fn route(&self) -> &[NetId] {
        match self {
            Delivery::Delivered { route, .. } => route,
            Delivery::Dismissed { .. } => &[],
        }
    }

    pub fn drop_reason(&self) -> Option<DropReason> {
        match self {
            Delivery::Dismissed { reason, .. } => Some(*reason),
            Delivery::Delivered { .. } => None,
        }
    }
}

/// Node entry in a `TopologySpec`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: NetId,
    pub role: NodeRole,
}

impl NodeSpec {
    pub fn new(id: impl Into<NetId>, role: NodeRole) -> Self {
        Self { id: id.into(), role }
    }
}

fn default_max_hops() -> u32 {
    DEFAULT_MAX_HOPS
}

/// Static description of a topology, as loaded from world files.
///
/// A node whose network prefix names a downlink router gets that router's
/// sub-network attached automatically. Prefixes listed in `detached` get a
/// standalone network with no downlink router above it. Any other prefix
/// is a construction error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologySpec {
    pub nodes: Vec<NodeSpec>,

    #[serde(default)]
    pub detached: Vec<NetId>,

    #[serde(default = "default_max_hops")]
    pub max_hops: u32,
}

impl Default for TopologySpec {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            detached: Vec::new(),
            max_hops: DEFAULT_MAX_HOPS,
        }
    }
}

/// The whole network tree.
#[derive(Debug, Clone)]
pub struct Topology {
    networks: BTreeMap<NetId, Network>,
    max_hops: u32,
}

impl Default for Topology {
    fn default() -> Self {
        Self::new()
    }
}

impl Topology {
    /// Creates a topology holding only the (empty) root network.
    pub fn new() -> Self {
        let mut networks = BTreeMap::new();
        networks.insert(NetId::root(), Network::new(NetId::root()));
        Self {
            networks,
            max_hops: DEFAULT_MAX_HOPS,
        }
    }

    pub fn with_max_hops(mut self, max_hops: u32) -> Self {
        self.max_hops = max_hops;
        self
    }

    pub fn max_hops(&self) -> u32 {
        self.max_hops
    }

    /// Builds a topology from its static description.
    ///
    /// `sink_for` supplies the interface of every device.
    pub fn from_spec<F>(spec: &TopologySpec, mut sink_for: F) -> Result<Self, TopologyError>
    where
        F: FnMut(&NodeSpec) -> Arc<dyn PacketSink>,
    {
        let mut topology = Self::new().with_max_hops(spec.max_hops);

        let mut nodes: Vec<&NodeSpec> = spec.nodes.iter().collect();
        nodes.sort_by_key(|n| n.id.depth());

        let mut detached: Vec<&NetId> = spec.detached.iter().collect();
        detached.sort_by_key(|p| p.depth());

        for node in nodes {
            let prefix = node.id.parent().ok_or_else(|| TopologyError::InvalidNodeId(node.id.clone()))?;

            if !topology.networks.contains_key(&prefix) {
                if detached.contains(&&prefix) {
                    topology.add_network(prefix.clone())?;
                } else {
                    match topology.find(&prefix) {
                        Some(NetNode::Downlink(_)) => {
                            topology.attach_subnet(&prefix)?;
                        }
                        Some(_) => return Err(TopologyError::NotADownlinkRouter(prefix)),
                        None => return Err(TopologyError::UnknownNetwork(prefix)),
                    }
                }
            }

            match node.role {
                NodeRole::Device => topology.add_device(node.id.clone(), sink_for(node))?,
                NodeRole::UplinkRouter => topology.add_uplink_router(node.id.clone())?,
                NodeRole::DownlinkRouter => topology.add_downlink_router(node.id.clone())?,
            }
        }

        for prefix in detached {
            if !topology.networks.contains_key(prefix) {
                topology.add_network(prefix.clone())?;
            }
        }

        debug!(
            "topology: built {} networks, {} nodes",
            topology.networks.len(),
            topology.node_count()
        );
        Ok(topology)
    }

    /// Adds an empty network with no downlink router above it.
    pub fn add_network(&mut self, prefix: NetId) -> Result<(), TopologyError> {
        if prefix.is_root() || self.networks.contains_key(&prefix) {
            return Err(TopologyError::DuplicateNetwork(prefix));
        }
        self.networks.insert(prefix.clone(), Network::new(prefix));
        Ok(())
    }

    /// Attaches a new (or existing detached) network below downlink router `router`.
    ///
    /// The network's prefix is the router's id. Returns that prefix.
    pub fn attach_subnet(&mut self, router: &NetId) -> Result<NetId, TopologyError> {
        let prefix = match self.find_mut(router) {
            Some(NetNode::Downlink(downlink)) => {
                if downlink.downlink_target().is_some() {
                    return Err(TopologyError::SubnetAlreadyAttached(router.clone()));
                }
                downlink.attach()
            }
            _ => return Err(TopologyError::NotADownlinkRouter(router.clone())),
        };

        let network = self
            .networks
            .entry(prefix.clone())
            .or_insert_with(|| Network::new(prefix.clone()));

        // A detached network may already have its uplink router
        if let Some(k) = network.uplink {
            if let Some(NetNode::Uplink(uplink)) = network.nodes.get_mut(&k) {
                uplink.link(router.clone());
            }
        }

        debug!("topology: sub-network [{}] attached below {}", prefix, router);
        Ok(prefix)
    }

    pub fn add_device(&mut self, id: NetId, interface: Arc<dyn PacketSink>) -> Result<(), TopologyError> {
        let node = NetNode::Device(DeviceNode::new(id.clone(), interface));
        self.insert(id, node)
    }

    /// Adds the uplink router of `id`'s network. At most one per network.
    pub fn add_uplink_router(&mut self, id: NetId) -> Result<(), TopologyError> {
        let (prefix, _) = Self::split(&id)?;
        if let Some(network) = self.networks.get(&prefix) {
            if network.uplink.is_some() {
                return Err(TopologyError::DuplicateUplink(prefix));
            }
        }

        let mut router = UplinkRouterNode::new(id.clone());
        if let Some(NetNode::Downlink(parent)) = self.find(&prefix) {
            if parent.downlink_target() == Some(&prefix) {
                router.link(prefix.clone());
            }
        }

        self.insert(id.clone(), NetNode::Uplink(router))?;
        if let Some(network) = self.networks.get_mut(&prefix) {
            network.uplink = id.local_id();
        }
        Ok(())
    }

    pub fn add_downlink_router(&mut self, id: NetId) -> Result<(), TopologyError> {
        let node = NetNode::Downlink(DownlinkRouterNode::new(id.clone()));
        self.insert(id, node)
    }

    /// Gives a router somewhere to hand packets addressed to itself,
    /// or replaces a device's interface.
    pub fn bind_sink(&mut self, id: &NetId, sink: Arc<dyn PacketSink>) -> Result<(), TopologyError> {
        let node = self
            .find_mut(id)
            .ok_or_else(|| TopologyError::InvalidNodeId(id.clone()))?;
        node.bind_sink(sink);
        Ok(())
    }

    fn split(id: &NetId) -> Result<(NetId, u32), TopologyError> {
        match (id.parent(), id.local_id()) {
            (Some(prefix), Some(local)) => Ok((prefix, local)),
            _ => Err(TopologyError::InvalidNodeId(id.clone())),
        }
    }

    fn insert(&mut self, id: NetId, node: NetNode) -> Result<(), TopologyError> {
        let (prefix, local) = Self::split(&id)?;
        let network = self
            .networks
            .get_mut(&prefix)
            .ok_or_else(|| TopologyError::UnknownNetwork(prefix.clone()))?;
        if network.nodes.contains_key(&local) {
            return Err(TopologyError::DuplicateNode(id));
        }
        debug!("topology: {} {} added", node.role(), id);
        network.nodes.insert(local, node);
        Ok(())
    }

    fn find(&self, id: &NetId) -> Option<&NetNode> {
        let (prefix, local) = Self::split(id).ok()?;
        self.networks.get(&prefix)?.nodes.get(&local)
    }

    fn find_mut(&mut self, id: &NetId) -> Option<&mut NetNode> {
        let (prefix, local) = Self::split(id).ok()?;
        self.networks.get_mut(&prefix)?.nodes.get_mut(&local)
    }

    pub fn node(&self, id: &NetId) -> Option<&NetNode> {
        self.find(id)
    }

    pub fn network(&self, prefix: &NetId) -> Option<&Network> {
        self.networks.get(prefix)
    }

    pub fn networks(&self) -> impl Iterator<Item = &Network> {
        self.networks.values()
    }

    pub fn node_count(&self) -> usize {
        self.networks.values().map(Network::len).sum()
    }

    /// Ids of every node, network by network.
    pub fn node_ids(&self) -> Vec<NetId> {
        self.networks
            .values()
            .flat_map(|n| n.nodes.values().map(|node| node.net_id().clone()))
            .collect()
    }

    /// Ids of every device.
    pub fn devices(&self) -> Vec<NetId> {
        self.networks
            .values()
            .flat_map(|n| n.nodes.values())
            .filter(|node| node.role() == NodeRole::Device)
            .map(|node| node.net_id().clone())
            .collect()
    }

    /// Resolves a node's hop to the id of the node that receives the packet.
    fn resolve(&self, at: &NetId, hop: Hop) -> Result<NetId, DropReason> {
        let prefix = at.parent().unwrap_or_else(NetId::root);
        let network = self.networks.get(&prefix).ok_or(DropReason::NoSuchNode)?;

        let next = match hop {
            Hop::Sibling(k) => prefix.child(k),
            Hop::NetworkUplink => network.uplink().ok_or(DropReason::NoUplink)?,
            Hop::ParentDownlink => match self.find(at) {
                Some(NetNode::Uplink(uplink)) => uplink.uplink_target().cloned().ok_or(DropReason::Unlinked)?,
                _ => return Err(DropReason::Unlinked),
            },
            Hop::SubnetUplink => {
                let subnet = self.networks.get(at).ok_or(DropReason::NoSubnet)?;
                subnet.uplink().ok_or(DropReason::NoUplink)?
            }
            Hop::Deliver => at.clone(),
            Hop::Dismiss(reason) => return Err(reason),
        };

        if self.find(&next).is_some() {
            Ok(next)
        } else {
            Err(DropReason::NoSuchNode)
        }
    }

    /// Sends a packet from node `from`.
    ///
    /// The origin picks the first hop; every later node routes what it
    /// receives. Fails only on an unknown origin or a protocol violation.
    pub fn send(&self, from: &NetId, packet: Packet) -> Result<Delivery, RoutingError> {
        let origin = self
            .find(from)
            .ok_or_else(|| RoutingError::UnknownNode(from.clone()))?;
        let hop = origin.first_hop(&packet)?;
        self.forward(from.clone(), hop, packet, true)
    }

    /// Hands a packet to node `at` as if it had just arrived there.
    pub fn process(&self, at: &NetId, packet: Packet) -> Result<Delivery, RoutingError> {
        let node = self
            .find(at)
            .ok_or_else(|| RoutingError::UnknownNode(at.clone()))?;
        let hop = node.route(&packet)?;
        self.forward(at.clone(), hop, packet, true)
    }

    /// Walks `packet` hop by hop from `at`. With `deliver` unset the final
    /// node's sink is left untouched.
    fn forward(
        &self,
        mut at: NetId,
        mut hop: Hop,
        mut packet: Packet,
        deliver: bool,
    ) -> Result<Delivery, RoutingError> {
        let mut route = Vec::new();

        loop {
            if hop == Hop::Deliver {
                if deliver {
                    if let Some(node) = self.find(&at) {
                        if !node.deliver(packet) {
                            debug!("topology: {} consumed a packet with no local sink", at);
                        }
                    }
                }
                return Ok(Delivery::Delivered { at, route });
            }

            let next = match self.resolve(&at, hop) {
                Ok(next) => next,
                Err(reason) => return Ok(self.dismiss(at, reason, route, &packet)),
            };

            if packet.hop_count >= self.max_hops {
                return Ok(self.dismiss(at, DropReason::HopLimit, route, &packet));
            }
            packet.hop_count += 1;
            debug!("topology: packet {:?} hop {} -> {}", packet.id.0, at, next);

            let node = self.find(&next).ok_or_else(|| RoutingError::UnknownNode(next.clone()))?;
            hop = node.route(&packet)?;
            route.push(next.clone());
            at = next;
        }
    }

    fn dismiss(&self, at: NetId, reason: DropReason, traversed: Vec<NetId>, packet: &Packet) -> Delivery {
        warn!(
            "topology: packet for {} dismissed at {} ({})",
            packet.destination, at, reason
        );
        Delivery::Dismissed { at, reason, traversed }
    }

    /// Ids of the nodes a packet from `from` to `to` would enter.
    /// Empty when the destination is unreachable. Nothing is delivered.
    pub fn trace_route(&self, from: &NetId, to: &NetId) -> Result<Vec<NetId>, RoutingError> {
        let sample = Packet::new(Address::new(to.clone(), 0), Vec::new());
        let origin = self
            .find(from)
            .ok_or_else(|| RoutingError::UnknownNode(from.clone()))?;
        let hop = origin.first_hop(&sample)?;
        let delivery = self.forward(from.clone(), hop, sample, false)?;
        Ok(delivery.route().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::Inbox;

    fn ids(list: &[&[u32]]) -> Vec<NetId> {
        list.iter().map(|s| NetId::new(s.to_vec())).collect()
    }

    fn packet(to: &[u32]) -> Packet {
        Packet::new(Address::new(to.to_vec(), 22), b"cat /etc/motd".to_vec())
    }

    /// Root network: downlink (0), device (2), downlink (3).
    /// Sub-network [0]: uplink (0,0), device (0,1), device (0,2).
    /// Sub-network [3]: uplink (3,0), downlink (3,1), device (3,2).
    /// Sub-network [3,1]: uplink (3,1,0), device (3,1,5).
    fn three_tiers(inbox: &Arc<Inbox>) -> Topology {
        let spec = TopologySpec {
            nodes: vec![
                NodeSpec::new([0], NodeRole::DownlinkRouter),
                NodeSpec::new([2], NodeRole::Device),
                NodeSpec::new([3], NodeRole::DownlinkRouter),
                NodeSpec::new([0, 0], NodeRole::UplinkRouter),
                NodeSpec::new([0, 1], NodeRole::Device),
                NodeSpec::new([0, 2], NodeRole::Device),
                NodeSpec::new([3, 0], NodeRole::UplinkRouter),
                NodeSpec::new([3, 1], NodeRole::DownlinkRouter),
                NodeSpec::new([3, 2], NodeRole::Device),
                NodeSpec::new([3, 1, 0], NodeRole::UplinkRouter),
                NodeSpec::new([3, 1, 5], NodeRole::Device),
            ],
            ..Default::default()
        };
        let sink: Arc<dyn PacketSink> = inbox.clone();
        Topology::from_spec(&spec, |_| sink.clone()).unwrap()
    }

    #[test]
    fn test_hop_sequences() {
        let inbox = Inbox::new();
        let topo = three_tiers(&inbox);
        let cases: Vec<(&[u32], &[u32], Vec<NetId>)> = vec![
            (&[0, 1], &[0, 2], ids(&[&[0, 2]])),
            (&[0, 1], &[2], ids(&[&[0, 0], &[0], &[2]])),
            (&[2], &[0, 1], ids(&[&[0], &[0, 0], &[0, 1]])),
            (&[0, 1], &[3, 2], ids(&[&[0, 0], &[0], &[3], &[3, 0], &[3, 2]])),
            (
                &[0, 2],
                &[3, 1, 5],
                ids(&[&[0, 0], &[0], &[3], &[3, 0], &[3, 1], &[3, 1, 0], &[3, 1, 5]]),
            ),
            (&[3, 1, 5], &[2], ids(&[&[3, 1, 0], &[3, 1], &[3, 0], &[3], &[2]])),
        ];

        for (from, to, expected) in cases {
            let from = NetId::new(from.to_vec());
            let delivery = topo.send(&from, packet(to)).unwrap();
            assert!(delivery.is_delivered(), "{} -> {:?}", from, to);
            assert_eq!(delivery.route(), expected.as_slice(), "{} -> {:?}", from, to);
        }
        assert_eq!(inbox.len(), 6);
    }

    #[test]
    fn test_hop_count_matches_route() {
        let inbox = Inbox::new();
        let topo = three_tiers(&inbox);
        let delivery = topo.send(&NetId::from([0, 1]), packet(&[3, 2])).unwrap();
        let received = inbox.drain();
        assert_eq!(received[0].hop_count as usize, delivery.route().len());
    }

    #[test]
    fn test_unreachable_destinations_are_dismissed() {
        let inbox = Inbox::new();
        let topo = three_tiers(&inbox);

        let missing_sibling = topo.send(&NetId::from([0, 1]), packet(&[0, 9])).unwrap();
        assert_eq!(missing_sibling.drop_reason(), Some(DropReason::NoSuchNode));
        assert!(missing_sibling.route().is_empty());

        let missing_root = topo.send(&NetId::from([0, 1]), packet(&[7])).unwrap();
        assert_eq!(missing_root.drop_reason(), Some(DropReason::NoSuchNode));

        let below_device = topo.send(&NetId::from([0, 1]), packet(&[2, 4])).unwrap();
        assert_eq!(below_device.drop_reason(), Some(DropReason::NoSubnet));

        // The root network has no uplink router
        let above_root = topo.process(&NetId::from([0]), packet(&[])).unwrap();
        assert_eq!(above_root.drop_reason(), Some(DropReason::NoUplink));

        assert!(inbox.is_empty());
    }

    #[test]
    fn test_network_without_uplink_dismisses() {
        let inbox = Inbox::new();
        let mut topo = Topology::new();
        topo.add_downlink_router(NetId::from([1])).unwrap();
        topo.attach_subnet(&NetId::from([1])).unwrap();
        topo.add_device(NetId::from([1, 4]), inbox.clone()).unwrap();

        let delivery = topo.send(&NetId::from([1, 4]), packet(&[5])).unwrap();
        assert_eq!(delivery.drop_reason(), Some(DropReason::NoUplink));
        assert!(topo.trace_route(&NetId::from([1, 4]), &NetId::from([5])).unwrap().is_empty());
    }

    #[test]
    fn test_detached_network_uplink_is_unlinked() {
        let inbox = Inbox::new();
        let mut topo = Topology::new();
        topo.add_device(NetId::from([1]), inbox.clone()).unwrap();
        topo.add_network(NetId::from([9])).unwrap();
        topo.add_uplink_router(NetId::from([9, 0])).unwrap();
        topo.add_device(NetId::from([9, 1]), inbox.clone()).unwrap();

        let delivery = topo.send(&NetId::from([9, 1]), packet(&[1])).unwrap();
        assert_eq!(delivery.drop_reason(), Some(DropReason::Unlinked));
        assert!(inbox.is_empty());
    }

    #[test]
    fn test_detached_network_links_when_attached() {
        let inbox = Inbox::new();
        let mut topo = Topology::new();
        topo.add_device(NetId::from([1]), inbox.clone()).unwrap();
        topo.add_downlink_router(NetId::from([9])).unwrap();
        topo.add_network(NetId::from([9])).unwrap();
        topo.add_uplink_router(NetId::from([9, 0])).unwrap();
        topo.add_device(NetId::from([9, 1]), inbox.clone()).unwrap();

        topo.attach_subnet(&NetId::from([9])).unwrap();
        let route = topo.trace_route(&NetId::from([9, 1]), &NetId::from([1])).unwrap();
        assert_eq!(route, ids(&[&[9, 0], &[9], &[1]]));

        // Dry runs do not reach real sinks
        assert!(inbox.is_empty());
    }

    #[test]
    fn test_device_forwarding_is_a_protocol_violation() {
        let inbox = Inbox::new();
        let topo = three_tiers(&inbox);
        let err = topo.process(&NetId::from([0, 1]), packet(&[0, 2])).unwrap_err();
        assert_eq!(
            err,
            RoutingError::ProtocolViolation {
                device: NetId::from([0, 1]),
                destination: NetId::from([0, 2]),
            }
        );
    }

    #[test]
    fn test_unknown_origin() {
        let topo = Topology::new();
        let err = topo.send(&NetId::from([4]), packet(&[1])).unwrap_err();
        assert_eq!(err, RoutingError::UnknownNode(NetId::from([4])));
    }

    #[test]
    fn test_hop_limit() {
        let inbox = Inbox::new();
        let topo = three_tiers(&inbox).with_max_hops(2);
        let delivery = topo.send(&NetId::from([0, 1]), packet(&[3, 2])).unwrap();
        assert_eq!(delivery.drop_reason(), Some(DropReason::HopLimit));
        match delivery {
            Delivery::Dismissed { traversed, .. } => assert_eq!(traversed, ids(&[&[0, 0], &[0]])),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_router_can_receive_with_bound_sink() {
        let inbox = Inbox::new();
        let mut topo = three_tiers(&inbox);
        let router_inbox = Inbox::new();
        topo.bind_sink(&NetId::from([3]), router_inbox.clone()).unwrap();

        let delivery = topo.send(&NetId::from([2]), packet(&[3])).unwrap();
        assert_eq!(delivery.route(), ids(&[&[3]]).as_slice());
        assert_eq!(router_inbox.len(), 1);
    }

    #[test]
    fn test_construction_errors() {
        let inbox = Inbox::new();
        let mut topo = Topology::new();
        topo.add_downlink_router(NetId::from([0])).unwrap();
        topo.attach_subnet(&NetId::from([0])).unwrap();
        topo.add_uplink_router(NetId::from([0, 0])).unwrap();

        assert_eq!(
            topo.add_uplink_router(NetId::from([0, 5])),
            Err(TopologyError::DuplicateUplink(NetId::from([0])))
        );
        assert_eq!(
            topo.add_device(NetId::from([0, 0]), inbox.clone()),
            Err(TopologyError::DuplicateNode(NetId::from([0, 0])))
        );
        assert_eq!(
            topo.add_device(NetId::from([4, 1]), inbox.clone()),
            Err(TopologyError::UnknownNetwork(NetId::from([4])))
        );
        assert_eq!(
            topo.attach_subnet(&NetId::from([0])),
            Err(TopologyError::SubnetAlreadyAttached(NetId::from([0])))
        );
        assert_eq!(
            topo.attach_subnet(&NetId::from([0, 0])),
            Err(TopologyError::NotADownlinkRouter(NetId::from([0, 0])))
        );
        assert_eq!(
            topo.add_device(NetId::root(), inbox.clone()),
            Err(TopologyError::InvalidNodeId(NetId::root()))
        );
        assert_eq!(
            topo.add_network(NetId::from([0])),
            Err(TopologyError::DuplicateNetwork(NetId::from([0])))
        );
    }

    #[test]
    fn test_spec_from_json() {
        let json = r#"{
            "nodes": [
                { "id": [0], "role": "downlink_router" },
                { "id": [0, 0], "role": "uplink_router" },
                { "id": [0, 1], "role": "device" },
                { "id": [1], "role": "device" }
            ]
        }"#;
        let spec: TopologySpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.max_hops, DEFAULT_MAX_HOPS);

        let inbox = Inbox::new();
        let sink: Arc<dyn PacketSink> = inbox.clone();
        let topo = Topology::from_spec(&spec, |_| sink.clone()).unwrap();
        assert_eq!(topo.node_count(), 4);
        assert_eq!(topo.devices(), ids(&[&[1], &[0, 1]]));
        assert_eq!(topo.network(&NetId::from([0])).and_then(Network::uplink), Some(NetId::from([0, 0])));
        assert_eq!(
            topo.trace_route(&NetId::from([1]), &NetId::from([0, 1])).unwrap(),
            ids(&[&[0], &[0, 0], &[0, 1]])
        );
    }

    #[test]
    fn test_spec_detached_prefix() {
        let spec = TopologySpec {
            nodes: vec![
                NodeSpec::new([5], NodeRole::DownlinkRouter),
                NodeSpec::new([5, 0], NodeRole::UplinkRouter),
                NodeSpec::new([5, 1], NodeRole::Device),
                NodeSpec::new([6], NodeRole::Device),
            ],
            detached: vec![NetId::from([5])],
            ..Default::default()
        };
        let inbox = Inbox::new();
        let sink: Arc<dyn PacketSink> = inbox.clone();
        let topo = Topology::from_spec(&spec, |_| sink.clone()).unwrap();

        let delivery = topo.send(&NetId::from([5, 1]), packet(&[6])).unwrap();
        assert_eq!(delivery.drop_reason(), Some(DropReason::Unlinked));
    }

    #[test]
    fn test_spec_rejects_node_below_device() {
        let spec = TopologySpec {
            nodes: vec![NodeSpec::new([2], NodeRole::Device), NodeSpec::new([2, 1], NodeRole::Device)],
            ..Default::default()
        };
        let inbox = Inbox::new();
        let sink: Arc<dyn PacketSink> = inbox.clone();
        let err = Topology::from_spec(&spec, |_| sink.clone()).unwrap_err();
        assert_eq!(err, TopologyError::NotADownlinkRouter(NetId::from([2])));
    }

    #[test]
    fn test_spec_rejects_node_below_missing_prefix() {
        let spec = TopologySpec {
            nodes: vec![NodeSpec::new([1], NodeRole::Device), NodeSpec::new([7, 1], NodeRole::Device)],
            ..Default::default()
        };
        let inbox = Inbox::new();
        let sink: Arc<dyn PacketSink> = inbox.clone();
        let err = Topology::from_spec(&spec, |_| sink.clone()).unwrap_err();
        assert_eq!(err, TopologyError::UnknownNetwork(NetId::from([7])));

        // Listing the prefix as detached makes it a standalone network
        let spec = TopologySpec {
            detached: vec![NetId::from([7])],
            ..spec
        };
        let topo = Topology::from_spec(&spec, |_| sink.clone()).unwrap();
        assert_eq!(topo.network(&NetId::from([7])).map(Network::len), Some(1));
    }

    #[test]
    fn test_trace_route_leaves_sinks_untouched() {
        let inbox = Inbox::new();
        let mut topo = three_tiers(&inbox);
        let router_sink = Inbox::new();
        topo.bind_sink(&NetId::from([3]), router_sink.clone()).unwrap();

        let route = topo.trace_route(&NetId::from([0, 1]), &NetId::from([3])).unwrap();
        assert_eq!(route.last(), Some(&NetId::from([3])));
        assert!(router_sink.is_empty());
        assert!(inbox.is_empty());

        let delivery = topo.send(&NetId::from([0, 1]), packet(&[3])).unwrap();
        assert_eq!(delivery.route(), route.as_slice());
        assert_eq!(router_sink.len(), 1);
    }
}
