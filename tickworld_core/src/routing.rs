//! Next-hop computation over hierarchical network ids.
//!
//! A node at `self_id` lives in the network whose prefix is
//! `self_id.parent()`. For a destination `dest` the decision is:
//!
//! ```text
//! dest == self_id                                  -> Local
//! dest starts with prefix, dest deeper than prefix:
//!     k = dest[prefix.depth()]
//!     k != self_id.local_id()                      -> RouteDown(k)   (sibling k)
//!     k == self_id.local_id() (dest below self)    -> RouteToDownlinkSubtree
//! otherwise                                        -> RouteUp
//! ```
//!
//! The function is pure: no node state, no topology, no side effects.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tickworld_env::{NetId, Packet};

/// Routing errors. Dead ends are not errors; see `DropReason`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    /// A device was handed a packet it would have to forward.
    #[error("Protocol violation: device {device} cannot forward packet for {destination}")]
    ProtocolViolation { device: NetId, destination: NetId },

    /// A packet was injected at a node that does not exist.
    #[error("Unknown node: {0}")]
    UnknownNode(NetId),
}

/// Classification of the next hop, from one node's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoutingDecision {
    /// The packet has arrived
    Local,

    /// Destination is outside this node's network
    RouteUp,

    /// Destination is at or below sibling `k` of this network
    RouteDown(u32),

    /// Destination is below this node itself
    RouteToDownlinkSubtree,
}

/// Decides where a packet for `destination` goes next from `self_id`.
pub fn next_routing_target(self_id: &NetId, destination: &NetId) -> RoutingDecision {
    if destination == self_id {
        return RoutingDecision::Local;
    }

    let Some(prefix) = self_id.parent() else {
        return RoutingDecision::RouteUp;
    };
    if destination.depth() <= prefix.depth() || !destination.starts_with(&prefix) {
        return RoutingDecision::RouteUp;
    }

    match destination.segment(prefix.depth()) {
        Some(next) if Some(next) == self_id.local_id() => RoutingDecision::RouteToDownlinkSubtree,
        Some(next) => RoutingDecision::RouteDown(next),
        None => RoutingDecision::RouteUp,
    }
}

/// Packet-level convenience over `next_routing_target`.
pub fn compute_next_routing_target(self_id: &NetId, packet: &Packet) -> RoutingDecision {
    next_routing_target(self_id, packet.destination_id())
}

/// Why a packet was dismissed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DropReason {
    /// No node with the next hop's id exists
    NoSuchNode,

    /// The network has no uplink router
    NoUplink,

    /// The uplink router has no parent network
    Unlinked,

    /// The destination lies below a node with no sub-network
    NoSubnet,

    /// Hop budget exhausted
    HopLimit,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            DropReason::NoSuchNode => "no such node",
            DropReason::NoUplink => "network has no uplink router",
            DropReason::Unlinked => "uplink router is not linked to a parent network",
            DropReason::NoSubnet => "no sub-network attached",
            DropReason::HopLimit => "hop limit exceeded",
        };
        write!(f, "{}", text)
    }
}

/// Concrete next hop chosen by a node from its own links.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hop {
    /// Consume the packet here
    Deliver,

    /// Hand to sibling `k` in the same network
    Sibling(u32),

    /// Hand to this network's uplink router
    NetworkUplink,

    /// Hand to the parent network's downlink router (uplink routers only)
    ParentDownlink,

    /// Hand to the attached sub-network's uplink router (downlink routers only)
    SubnetUplink,

    /// Dead end
    Dismiss(DropReason),
}

/// The routing capability of a node.
pub trait Routable {
    fn net_id(&self) -> &NetId;

    /// Chooses the next hop for a packet this node has just received.
    fn route(&self, packet: &Packet) -> Result<Hop, RoutingError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn decide(self_id: &[u32], dest: &[u32]) -> RoutingDecision {
        next_routing_target(&NetId::new(self_id.to_vec()), &NetId::new(dest.to_vec()))
    }

    #[test]
    fn test_exact_match_is_local() {
        assert_eq!(decide(&[1, 2, 3], &[1, 2, 3]), RoutingDecision::Local);
        assert_eq!(decide(&[0], &[0]), RoutingDecision::Local);
        assert_eq!(decide(&[], &[]), RoutingDecision::Local);
    }

    #[test]
    fn test_sibling_routes_down() {
        assert_eq!(decide(&[1, 2, 3], &[1, 2, 4]), RoutingDecision::RouteDown(4));
        assert_eq!(decide(&[1, 2, 3], &[1, 2, 4, 9]), RoutingDecision::RouteDown(4));
        assert_eq!(decide(&[0], &[2]), RoutingDecision::RouteDown(2));
    }

    #[test]
    fn test_outside_prefix_routes_up() {
        assert_eq!(decide(&[1, 2, 3, 4], &[1, 2, 5, 6, 7]), RoutingDecision::RouteUp);
        assert_eq!(decide(&[1, 2, 3], &[1]), RoutingDecision::RouteUp);
        assert_eq!(decide(&[1, 2, 3], &[1, 2]), RoutingDecision::RouteUp);
        assert_eq!(decide(&[0, 1], &[2]), RoutingDecision::RouteUp);
        assert_eq!(decide(&[], &[4]), RoutingDecision::RouteUp);
    }

    #[test]
    fn test_below_self_routes_into_subtree() {
        assert_eq!(decide(&[1, 2, 3], &[1, 2, 3, 0]), RoutingDecision::RouteToDownlinkSubtree);
        assert_eq!(decide(&[0], &[0, 5, 1]), RoutingDecision::RouteToDownlinkSubtree);
    }

    #[test]
    fn test_packet_wrapper() {
        use tickworld_env::Address;
        let packet = Packet::new(Address::new([3, 1], 22), Vec::new());
        assert_eq!(
            compute_next_routing_target(&NetId::from([3, 0]), &packet),
            RoutingDecision::RouteDown(1)
        );
    }

    fn net_id() -> impl Strategy<Value = NetId> {
        prop::collection::vec(0u32..4, 1..5).prop_map(NetId::new)
    }

    proptest! {
        #[test]
        fn prop_self_is_always_local(id in net_id()) {
            prop_assert_eq!(next_routing_target(&id, &id), RoutingDecision::Local);
        }

        #[test]
        fn prop_route_down_targets_a_real_sibling(me in net_id(), dest in net_id()) {
            if let RoutingDecision::RouteDown(k) = next_routing_target(&me, &dest) {
                let prefix = me.parent().unwrap();
                prop_assert!(dest.starts_with(&prefix.child(k)));
                prop_assert_ne!(Some(k), me.local_id());
            }
        }

        #[test]
        fn prop_route_up_only_outside_own_network(me in net_id(), dest in net_id()) {
            let prefix = me.parent().unwrap();
            let inside = dest.depth() > prefix.depth() && dest.starts_with(&prefix);
            let up = next_routing_target(&me, &dest) == RoutingDecision::RouteUp;
            prop_assert_eq!(up, !inside);
        }
    }
}
