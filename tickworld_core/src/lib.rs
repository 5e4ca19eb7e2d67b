//! Tickworld Core - Tick-Driven Task Scheduling and Tiered Packet Routing
//!
//! This library provides the two engine subsystems of a simulated
//! networked world:
//! 1. **Scheduling**: cooperative, tick-counted tasks grouped per owning
//!    context (`Scheduler`), per-kind task templates (`SchedulerDefinition`)
//!    and a registry of live schedulers driven once per tick (`SchedulerRegistry`)
//! 2. **Routing**: a pure next-hop decision over hierarchical `NetId`s and
//!    the device / uplink / downlink node roles that forward packets
//!    hop by hop through a `Topology`
//!
//! # Architecture
//!
//! ```text
//!   driver loop ── tick_all(group) ──> SchedulerRegistry (weak refs)
//!                                          │
//!                                          ▼
//!                     Scheduler<C> ── update(group) ──> SchedulerTask<C>::execute
//!                          ▲                                    │
//!   SchedulerDefinition ───┘ (fresh template clones)            ▼
//!                                                   owning context C (game code)
//!                                                               │ send
//!                                                               ▼
//!   Topology ── NetNode::route ──> RoutingDecision ──> Hop ──> next NetNode ... Delivery
//! ```
//!
//! Both subsystems are synchronous. One `update` pass and one packet's
//! traversal each run to completion before returning.

pub mod definition;
pub mod nodes;
pub mod persistence;
pub mod registry;
pub mod routing;
pub mod scheduler;
pub mod task;
pub mod topology;

// Re-export key types for convenience
pub use definition::SchedulerDefinition;
pub use nodes::{DeviceNode, DownlinkRouterNode, Inbox, NetNode, NodeRole, UplinkRouterNode};
pub use persistence::{
    ActionFactory, DefinitionSnapshot, PersistenceError, SchedulerSnapshot, SchedulerStore,
    SledSchedulerStore, TaskRecord, FORMAT_VERSION,
};
pub use registry::{SchedulerRegistry, Tick, TickHandle, TickSummary};
pub use routing::{
    compute_next_routing_target, next_routing_target, DropReason, Hop, Routable, RoutingDecision,
    RoutingError,
};
pub use scheduler::{Scheduler, SchedulerError, SchedulerHandle, UpdateReport};
pub use task::{CancelToken, FnAction, SchedulerTask, TaskAction, TaskContext, TaskId, TaskTiming, DEFAULT_GROUP};
pub use topology::{Delivery, Network, NodeSpec, Topology, TopologyError, TopologySpec, DEFAULT_MAX_HOPS};
