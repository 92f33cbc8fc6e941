//! Virtual interface plumbing for the tunnel bridge
//!
//! This crate owns everything that touches the TUN descriptor itself:
//!
//! - **Discovery**: [`DescriptorLocator`] scans the process descriptor table for
//!   the utun control socket the OS opened on our behalf (Apple packet tunnel
//!   providers expose no handle-returning API).
//! - **Ownership**: [`OwnedTunFd`] is the single owner of the descriptor. It can
//!   be moved into a [`TunDevice`] or released to a foreign owner with
//!   [`IntoRawFd`](std::os::fd::IntoRawFd), never both.
//! - **Packet I/O**: the [`PacketFlow`] trait is what the packet bridge reads from
//!   and writes to; [`TunDevice`] implements it on top of `tun-rs`.
//! - **Settings**: [`NetworkSettings`] describes the address, routes, DNS and MTU
//!   handed to the OS collaborator when the interface is activated.
//!
//! # Platform Notes
//!
//! ## iOS / macOS (NetworkExtension)
//! The packet tunnel provider configures the interface, then the descriptor is
//! located with [`DescriptorLocator::system()`]. It must run *after*
//! `setTunnelNetworkSettings` has completed, otherwise the scan finds nothing.
//!
//! ## Android
//! `VpnService.Builder.establish()` returns the descriptor directly; detach it
//! and adopt it with [`OwnedTunFd::adopt`]. No scan is needed.
//!
//! ## Linux (development)
//! [`TunDevice::create_descriptor`] creates and configures an interface with
//! `tun-rs`, and [`route::install`] points the configured routes at it.
//! Requires root or `CAP_NET_ADMIN`.
//!
//! # Example
//!
//! ```ignore
//! use tunbridge_tun::{DescriptorLocator, OwnedTunFd, TunDevice};
//!
//! let locator = DescriptorLocator::system();
//! let raw = locator.locate_with_retry(5, Duration::from_millis(100)).await?;
//! let fd = unsafe { OwnedTunFd::adopt(raw) };
//! let device = TunDevice::from_owned(fd, "utun", 1500)?;
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod fd;
pub mod flow;
pub mod locator;
pub mod mock;
pub mod packet;
pub mod route;

pub use config::{Ipv4Config, Ipv6Config, NetworkSettings, NetworkSettingsBuilder};
pub use device::TunDevice;
pub use error::{Error, Result};
pub use fd::OwnedTunFd;
pub use flow::{FlowInfo, PacketFlow};
pub use locator::{DescriptorLocator, DescriptorTable, PeerControl, SystemDescriptorTable};
pub use packet::IpFamily;
pub use route::{InstalledRoutes, Route, RouteTable, SystemRouteTable};

/// Default MTU for the virtual interface
pub const DEFAULT_MTU: u16 = 1500;

/// Largest packet the interface can hand us (maximum IP datagram size)
pub const MAX_PACKET_SIZE: usize = 65535;
