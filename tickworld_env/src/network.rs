//! Local network interface abstraction.

use crate::types::Packet;

/// Final consumer of packets delivered to a device.
///
/// # Packet Flow
///
/// ```text
/// Router                  DeviceNode                PacketSink
///   |                         |                          |
///   |-- process(packet) ----->|                          |
///   |                         |-- deliver(packet) ------>|
/// ```
pub trait PacketSink: Send + Sync {
    /// Accepts a packet that reached its destination node.
    fn deliver(&self, packet: Packet);
}
