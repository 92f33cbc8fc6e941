//! TUN device backed by an owned descriptor
//!
//! This module wraps the `tun-rs` crate for the two ways the bridge gets
//! hold of an interface:
//!
//! ## 1. From an Owned Descriptor (Packet Bridge path)
//!
//! Use [`TunDevice::from_owned()`] to move an [`OwnedTunFd`] into a device the
//! packet bridge can read from and write to. The device closes the descriptor
//! when it is dropped.
//!
//! ```rust,ignore
//! let device = TunDevice::from_owned(fd, "utun4", 1500)?;
//! ```
//!
//! ## 2. Creating an Interface (Linux development)
//!
//! Use [`TunDevice::create_descriptor()`] to create and configure a fresh
//! interface from [`NetworkSettings`] and get back an owned duplicate of its
//! descriptor along with the interface name. Requires root or `CAP_NET_ADMIN`.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, IntoRawFd};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::config::NetworkSettings;
use crate::error::{Error, Result};
use crate::fd::OwnedTunFd;
use crate::flow::{FlowInfo, PacketFlow};
use crate::packet::IpFamily;
use crate::MAX_PACKET_SIZE;

/// Virtual interface device wrapping `tun_rs::AsyncDevice`
pub struct TunDevice {
    inner: tun_rs::AsyncDevice,
    scratch: Mutex<Vec<u8>>,
    info: FlowInfo,
}

impl TunDevice {
    /// Move an owned descriptor into a new device
    ///
    /// On success the device is the descriptor's only owner. On failure the
    /// descriptor is closed when `fd` is dropped.
    pub fn from_owned(fd: OwnedTunFd, name: impl Into<String>, mtu: u16) -> Result<Self> {
        let raw = fd.as_raw_fd();
        // SAFETY: `fd` is the exclusive owner of `raw`; ownership is released
        // to the device right below, only once construction succeeded.
        let device = unsafe { tun_rs::AsyncDevice::from_fd(raw) }.map_err(|e| {
            Error::DeviceCreation(format!("failed to create device from fd {}: {}", raw, e))
        })?;
        let _ = fd.into_raw_fd();

        let name = name.into();
        log::info!("Created TUN device from fd {}: {} (MTU: {})", raw, name, mtu);

        Ok(Self {
            inner: device,
            scratch: Mutex::new(vec![0u8; MAX_PACKET_SIZE]),
            info: FlowInfo { name, mtu },
        })
    }

    /// Create and configure a new interface
    ///
    /// `tun-rs` handles interface creation, address assignment, MTU and
    /// bringing the link up; routes are left to [`crate::route`]. Returns an
    /// owned duplicate of the descriptor and the interface name. The interface
    /// lives for as long as the descriptor stays open.
    pub fn create_descriptor(settings: &NetworkSettings) -> Result<(OwnedTunFd, String)> {
        settings.validate()?;

        let mut builder = tun_rs::DeviceBuilder::new();

        if let Some(ref name) = settings.name {
            builder = builder.name(name);
        }

        if let Some(ref ipv4) = settings.ipv4 {
            builder = builder.ipv4(ipv4.address, ipv4.prefix_len, None);
        }

        for ipv6 in &settings.ipv6 {
            builder = builder.ipv6(ipv6.address, ipv6.prefix_len);
        }

        builder = builder.mtu(settings.mtu);

        // Kept as I/O errors so a missing privilege stays recognizable
        let device = builder.build_sync()?;
        let name = device.name()?;

        // SAFETY: the device keeps the descriptor open for the duration of
        // the borrow.
        let borrowed = unsafe { BorrowedFd::borrow_raw(device.as_raw_fd()) };
        let fd = OwnedTunFd::duplicate(borrowed)?;

        log::info!(
            "Created TUN device: {} (MTU: {}, fd: {})",
            name,
            settings.mtu,
            fd.raw()
        );

        Ok((fd, name))
    }

    /// Get device information
    pub fn info(&self) -> &FlowInfo {
        &self.info
    }
}

#[async_trait]
impl PacketFlow for TunDevice {
    async fn read_packets(&self) -> Result<Vec<Vec<u8>>> {
        let mut buf = self.scratch.lock().await;
        let n = self.inner.recv(&mut buf).await.map_err(Error::Io)?;
        Ok(vec![buf[..n].to_vec()])
    }

    async fn write_packet(&self, packet: &[u8], family: IpFamily) -> Result<usize> {
        // tun-rs prepends the utun protocol header itself on Apple targets.
        log::trace!("TUN write: {} bytes ({})", packet.len(), family);
        self.inner.send(packet).await.map_err(Error::Io)
    }

    fn info(&self) -> &FlowInfo {
        &self.info
    }
}

impl AsFd for TunDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        // SAFETY: the descriptor is owned by `inner` and outlives `&self`.
        unsafe { BorrowedFd::borrow_raw(self.inner.as_raw_fd()) }
    }
}

impl std::fmt::Debug for TunDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunDevice")
            .field("info", &self.info)
            .finish()
    }
}
