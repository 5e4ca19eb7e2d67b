//! Node roles of the tiered network.
//!
//! Each role turns a `RoutingDecision` into a concrete `Hop` using only its
//! own links. None of them knows the wider topology.
//!
//! # Roles
//!
//! ```text
//!            parent network (prefix P)
//!   ... [P,k] DownlinkRouterNode ...
//!                 |  subnet = P,k
//!   child network (prefix P,k)
//!   [P,k,0] UplinkRouterNode   [P,k,1] DeviceNode   [P,k,2] ...
//! ```

use crate::registry::lock;
use crate::routing::{next_routing_target, DropReason, Hop, Routable, RoutingDecision, RoutingError};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tickworld_env::{NetId, Packet, PacketSink};

/// Terminal leaf. Consumes packets addressed to it; never forwards.
#[derive(Clone)]
pub struct DeviceNode {
    id: NetId,
    interface: Arc<dyn PacketSink>,
}

impl DeviceNode {
    pub fn new(id: NetId, interface: Arc<dyn PacketSink>) -> Self {
        Self { id, interface }
    }

    /// First hop for a packet this device sends.
    ///
    /// Devices have no subnet, so a destination below the device itself
    /// does not exist.
    pub fn outbound(&self, packet: &Packet) -> Hop {
        match next_routing_target(&self.id, packet.destination_id()) {
            RoutingDecision::Local => Hop::Deliver,
            RoutingDecision::RouteUp => Hop::NetworkUplink,
            RoutingDecision::RouteDown(k) => Hop::Sibling(k),
            RoutingDecision::RouteToDownlinkSubtree => Hop::Dismiss(DropReason::NoSubnet),
        }
    }

    pub fn deliver(&self, packet: Packet) {
        self.interface.deliver(packet);
    }
}

impl Routable for DeviceNode {
    fn net_id(&self) -> &NetId {
        &self.id
    }

    fn route(&self, packet: &Packet) -> Result<Hop, RoutingError> {
        match next_routing_target(&self.id, packet.destination_id()) {
            RoutingDecision::Local => Ok(Hop::Deliver),
            // Addressed below a leaf: the node simply does not exist
            RoutingDecision::RouteToDownlinkSubtree => Ok(Hop::Dismiss(DropReason::NoSubnet)),
            RoutingDecision::RouteUp | RoutingDecision::RouteDown(_) => {
                Err(RoutingError::ProtocolViolation {
                    device: self.id.clone(),
                    destination: packet.destination_id().clone(),
                })
            }
        }
    }
}

impl std::fmt::Debug for DeviceNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceNode").field("id", &self.id).finish()
    }
}

/// The single router connecting a network to its parent network.
#[derive(Clone)]
pub struct UplinkRouterNode {
    id: NetId,

    /// Downlink router on the parent side, if linked
    parent: Option<NetId>,

    local: Option<Arc<dyn PacketSink>>,
}

impl UplinkRouterNode {
    pub fn new(id: NetId) -> Self {
        Self {
            id,
            parent: None,
            local: None,
        }
    }

    /// The parent network's downlink router, or `None` when unlinked.
    pub fn uplink_target(&self) -> Option<&NetId> {
        self.parent.as_ref()
    }

    pub(crate) fn link(&mut self, parent: NetId) {
        self.parent = Some(parent);
    }
}

impl Routable for UplinkRouterNode {
    fn net_id(&self) -> &NetId {
        &self.id
    }

    fn route(&self, packet: &Packet) -> Result<Hop, RoutingError> {
        Ok(match next_routing_target(&self.id, packet.destination_id()) {
            RoutingDecision::Local => Hop::Deliver,
            RoutingDecision::RouteUp => match self.parent {
                Some(_) => Hop::ParentDownlink,
                None => Hop::Dismiss(DropReason::Unlinked),
            },
            RoutingDecision::RouteDown(k) => Hop::Sibling(k),
            RoutingDecision::RouteToDownlinkSubtree => Hop::Dismiss(DropReason::NoSubnet),
        })
    }
}

impl std::fmt::Debug for UplinkRouterNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UplinkRouterNode")
            .field("id", &self.id)
            .field("parent", &self.parent)
            .finish()
    }
}

/// Router that may carry a child network underneath it.
#[derive(Clone)]
pub struct DownlinkRouterNode {
    id: NetId,

    /// Prefix of the attached child network (always equal to `id`)
    subnet: Option<NetId>,

    local: Option<Arc<dyn PacketSink>>,
}

impl DownlinkRouterNode {
    pub fn new(id: NetId) -> Self {
        Self {
            id,
            subnet: None,
            local: None,
        }
    }

    /// Prefix of the attached child network, or `None`.
    pub fn downlink_target(&self) -> Option<&NetId> {
        self.subnet.as_ref()
    }

    pub(crate) fn attach(&mut self) -> NetId {
        let prefix = self.id.clone();
        self.subnet = Some(prefix.clone());
        prefix
    }
}

impl Routable for DownlinkRouterNode {
    fn net_id(&self) -> &NetId {
        &self.id
    }

    fn route(&self, packet: &Packet) -> Result<Hop, RoutingError> {
        Ok(match next_routing_target(&self.id, packet.destination_id()) {
            RoutingDecision::Local => Hop::Deliver,
            RoutingDecision::RouteUp => Hop::NetworkUplink,
            RoutingDecision::RouteDown(k) => Hop::Sibling(k),
            RoutingDecision::RouteToDownlinkSubtree => match self.subnet {
                Some(_) => Hop::SubnetUplink,
                None => Hop::Dismiss(DropReason::NoSubnet),
            },
        })
    }
}

impl std::fmt::Debug for DownlinkRouterNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownlinkRouterNode")
            .field("id", &self.id)
            .field("subnet", &self.subnet)
            .finish()
    }
}

/// Role tag, as used in topology descriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Device,
    UplinkRouter,
    DownlinkRouter,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Device => write!(f, "device"),
            NodeRole::UplinkRouter => write!(f, "uplink_router"),
            NodeRole::DownlinkRouter => write!(f, "downlink_router"),
        }
    }
}

/// Any node in a network.
#[derive(Debug, Clone)]
pub enum NetNode {
    Device(DeviceNode),
    Uplink(UplinkRouterNode),
    Downlink(DownlinkRouterNode),
}

impl NetNode {
    pub fn role(&self) -> NodeRole {
        match self {
            NetNode::Device(_) => NodeRole::Device,
            NetNode::Uplink(_) => NodeRole::UplinkRouter,
            NetNode::Downlink(_) => NodeRole::DownlinkRouter,
        }
    }

    /// First hop for a packet originating at this node.
    pub fn first_hop(&self, packet: &Packet) -> Result<Hop, RoutingError> {
        match self {
            NetNode::Device(device) => Ok(device.outbound(packet)),
            other => other.route(packet),
        }
    }

    /// Hands a packet that reached this node to its local consumer.
    ///
    /// Returns false when the node has nobody to hand it to (a router
    /// without a bound sink); the packet is still consumed.
    pub fn deliver(&self, packet: Packet) -> bool {
        let sink = match self {
            NetNode::Device(device) => Some(&device.interface),
            NetNode::Uplink(router) => router.local.as_ref(),
            NetNode::Downlink(router) => router.local.as_ref(),
        };
        match sink {
            Some(sink) => {
                sink.deliver(packet);
                true
            }
            None => false,
        }
    }

    pub(crate) fn bind_sink(&mut self, sink: Arc<dyn PacketSink>) {
        match self {
            NetNode::Device(device) => device.interface = sink,
            NetNode::Uplink(router) => router.local = Some(sink),
            NetNode::Downlink(router) => router.local = Some(sink),
        }
    }
}

impl Routable for NetNode {
    fn net_id(&self) -> &NetId {
        match self {
            NetNode::Device(node) => node.net_id(),
            NetNode::Uplink(node) => node.net_id(),
            NetNode::Downlink(node) => node.net_id(),
        }
    }

    fn route(&self, packet: &Packet) -> Result<Hop, RoutingError> {
        match self {
            NetNode::Device(node) => node.route(packet),
            NetNode::Uplink(node) => node.route(packet),
            NetNode::Downlink(node) => node.route(packet),
        }
    }
}

/// Packet sink that keeps everything it receives.
#[derive(Debug, Default)]
pub struct Inbox {
    packets: Mutex<Vec<Packet>>,
}

impl Inbox {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn len(&self) -> usize {
        lock(&self.packets).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.packets).is_empty()
    }

    /// Removes and returns every packet received so far.
    pub fn drain(&self) -> Vec<Packet> {
        std::mem::take(&mut *lock(&self.packets))
    }
}

impl PacketSink for Inbox {
    fn deliver(&self, packet: Packet) {
        lock(&self.packets).push(packet);
    }
}
