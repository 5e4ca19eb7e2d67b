//! Tickworld deterministic world harness
//!
//! Places machines on the nodes of a tiered network, gives each one a
//! scheduler realized from per-kind task templates, and drives the whole
//! world one tick at a time.
//!
//! # Core Principle: one seed, one run
//!
//! Nothing in a world depends on wall-clock time or thread timing:
//! - **Time**: a tick is one `tick_all` per configured group, in order
//! - **Network**: packets queued during a tick are routed before it ends
//! - **Randomness**: generated topologies and traffic come from a single seed
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        SimWorld                          │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │ SchedulerRegistry (tick_all per group)             │  │
//! │  └────────────────────────────────────────────────────┘  │
//! │       │                          │                       │
//! │  ┌────▼─────┐               ┌────▼─────┐                 │
//! │  │ Machine  │  outbox/inbox │ Machine  │     ...         │
//! │  │  m0 @[1] │◄─────────────►│ m1 @[0,2]│                 │
//! │  └──────────┘               └──────────┘                 │
//! │       ▲                          ▲                       │
//! │  ┌────┴──────────────────────────┴────┐                  │
//! │  │        Topology (NetId router)     │                  │
//! │  └────────────────────────────────────┘                  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use tickworld_sim::{SimWorld, WorldConfig};
//!
//! let mut world = SimWorld::new(WorldConfig::generated(42))?;
//! world.run(40);
//! println!("{:?}", world.stats());
//! ```

mod actions;
mod config;
mod machine;
mod runner;
pub mod scenarios;
mod world;

pub use actions::{action_factory, ActionConfig, Beacon, Heartbeat};
pub use config::{generate_topology, MachinePlacement, SimError, TemplateConfig, WorldConfig};
pub use machine::{Machine, MachineKind};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use world::{merge_fingerprints, Fingerprint, SimWorld, WorldStats};
