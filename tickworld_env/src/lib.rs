//! Tickworld Environment Vocabulary
//!
//! Types shared by the tickworld engine and its harness:
//! - `NetId` / `Address` / `Packet`: hierarchical addressing for the router
//! - `SchedulerId`: identity of a live scheduler
//! - `Schedulable` / `ContextKind`: what a scheduler's owning context must provide
//! - `PacketSink`: where a device hands packets that reached it
//!
//! Nothing here performs I/O or keeps global state.

mod context;
mod error;
mod network;
mod types;

pub use context::{ContextKind, Schedulable};
pub use error::EnvError;
pub use network::PacketSink;
pub use types::{Address, NetId, Packet, PacketId, SchedulerId};
