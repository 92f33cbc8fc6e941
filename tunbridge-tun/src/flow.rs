//! Packet I/O surface of the virtual interface
//!
//! [`PacketFlow`] is what the packet bridge drives. It mirrors the shape of
//! `NEPacketTunnelFlow`: reads come back in batches, writes carry the address
//! family of the packet. [`TunDevice`](crate::TunDevice) implements it over a
//! real descriptor; [`MockPacketFlow`](crate::mock::MockPacketFlow) implements
//! it for tests.

use async_trait::async_trait;

use crate::error::Result;
use crate::packet::IpFamily;

/// Information about the interface behind a flow
#[derive(Debug, Clone)]
pub struct FlowInfo {
    /// Interface name (e.g., "utun3", "tun0")
    pub name: String,
    /// Maximum transmission unit size
    pub mtu: u16,
}

/// Async packet I/O on the virtual interface
///
/// # Implementation Notes
///
/// - `read_packets` blocks until at least one packet is available and must be
///   cancel-safe: dropping the future loses no data.
/// - A read error for which [`Error::is_interface_closed`](crate::Error::is_interface_closed)
///   holds means the interface is gone; any other error is transient.
/// - Packets in a batch are in the order the OS delivered them.
#[async_trait]
pub trait PacketFlow: Send + Sync {
    /// Wait for the next batch of packets from the OS
    async fn read_packets(&self) -> Result<Vec<Vec<u8>>>;

    /// Write one packet back to the OS, tagged with its address family
    async fn write_packet(&self, packet: &[u8], family: IpFamily) -> Result<usize>;

    /// Get information about the interface
    fn info(&self) -> &FlowInfo;

    /// Get the interface name
    fn name(&self) -> &str {
        &self.info().name
    }

    /// Get the MTU of the interface
    fn mtu(&self) -> u16 {
        self.info().mtu
    }
}
