//! TUN descriptor discovery
//!
//! A NetworkExtension packet tunnel provider never hands out the descriptor of
//! the utun interface it creates; the descriptor is simply already open in the
//! process. [`DescriptorLocator`] finds it by walking the descriptor table and
//! picking the first socket whose peer is the `com.apple.net.utun_control`
//! kernel control.
//!
//! The scan goes through the [`DescriptorTable`] trait so tests can inject a
//! fake table, and so platforms that hand the descriptor over directly never
//! scan at all.
//!
//! The locator only inspects descriptors; it never takes ownership.

use std::ops::RangeInclusive;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::error::{Error, Result};

/// Name of the kernel control that backs utun interfaces
pub const UTUN_CONTROL_NAME: &str = "com.apple.net.utun_control";

/// `AF_SYSTEM` address family of kernel control sockets
pub const AF_SYSTEM: u8 = 32;

/// Descriptor numbers scanned by default
pub const DEFAULT_SCAN_RANGE: RangeInclusive<RawFd> = 0..=1024;

/// Peer address of a kernel control socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerControl {
    /// Address family of the peer (`sc_family`)
    pub family: u8,
    /// Kernel control id of the peer (`sc_id`)
    pub control_id: u32,
}

/// Read-only view of the process descriptor table
pub trait DescriptorTable: Send + Sync {
    /// Peer address of `fd`, or `None` if it is closed, not a socket, or
    /// `getpeername` fails
    fn peer(&self, fd: RawFd) -> Option<PeerControl>;

    /// Resolve the control id registered under `name`, querying through `fd`
    fn resolve_control_id(&self, fd: RawFd, name: &str) -> Option<u32>;
}

/// The real descriptor table of this process
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDescriptorTable;

#[cfg(any(target_os = "macos", target_os = "ios"))]
impl DescriptorTable for SystemDescriptorTable {
    fn peer(&self, fd: RawFd) -> Option<PeerControl> {
        use std::mem::{size_of, zeroed};

        // SAFETY: sockaddr_ctl is plain old data; getpeername writes at most
        // `len` bytes into it.
        let mut addr: libc::sockaddr_ctl = unsafe { zeroed() };
        let mut len = size_of::<libc::sockaddr_ctl>() as libc::socklen_t;
        let ret = unsafe {
            libc::getpeername(fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut len)
        };
        if ret != 0 {
            return None;
        }

        Some(PeerControl {
            family: addr.sc_family,
            control_id: addr.sc_id,
        })
    }

    fn resolve_control_id(&self, fd: RawFd, name: &str) -> Option<u32> {
        // SAFETY: ctl_info is plain old data.
        let mut info: libc::ctl_info = unsafe { std::mem::zeroed() };
        if name.len() >= info.ctl_name.len() {
            return None;
        }
        for (idx, byte) in name.bytes().enumerate() {
            info.ctl_name[idx] = byte as libc::c_char;
        }

        // SAFETY: valid descriptor number and a properly initialized ctl_info.
        let ret = unsafe { libc::ioctl(fd, libc::CTLIOCGINFO, &mut info) };
        if ret != 0 {
            return None;
        }
        Some(info.ctl_id)
    }
}

#[cfg(not(any(target_os = "macos", target_os = "ios")))]
impl DescriptorTable for SystemDescriptorTable {
    // Kernel control sockets only exist on Apple platforms.
    fn peer(&self, _fd: RawFd) -> Option<PeerControl> {
        None
    }

    fn resolve_control_id(&self, _fd: RawFd, _name: &str) -> Option<u32> {
        None
    }
}

/// Finds the descriptor of an already-established utun interface
pub struct DescriptorLocator {
    table: Box<dyn DescriptorTable>,
    range: RangeInclusive<RawFd>,
    control_name: String,
    /// Resolved control id, 0 while unresolved
    control_id: AtomicU32,
}

impl DescriptorLocator {
    /// Create a locator over the given descriptor table
    pub fn new(table: impl DescriptorTable + 'static) -> Self {
        Self {
            table: Box::new(table),
            range: DEFAULT_SCAN_RANGE,
            control_name: UTUN_CONTROL_NAME.to_string(),
            control_id: AtomicU32::new(0),
        }
    }

    /// Create a locator over this process's descriptor table
    pub fn system() -> Self {
        Self::new(SystemDescriptorTable)
    }

    /// Scan a different descriptor range
    pub fn with_range(mut self, range: RangeInclusive<RawFd>) -> Self {
        self.range = range;
        self
    }

    /// The control id resolved by a previous scan, if any
    pub fn cached_control_id(&self) -> Option<u32> {
        match self.control_id.load(Ordering::Relaxed) {
            0 => None,
            id => Some(id),
        }
    }

    /// Find the numerically lowest matching descriptor
    pub fn locate(&self) -> Option<RawFd> {
        for fd in self.range.clone() {
            let peer = match self.table.peer(fd) {
                Some(peer) if peer.family == AF_SYSTEM => peer,
                _ => continue,
            };

            let control_id = match self.cached_control_id() {
                Some(id) => id,
                None => match self.table.resolve_control_id(fd, &self.control_name) {
                    Some(id) if id != 0 => {
                        self.control_id.store(id, Ordering::Relaxed);
                        id
                    }
                    _ => continue,
                },
            };

            if peer.control_id == control_id {
                log::info!("Found TUN descriptor: {}", fd);
                return Some(fd);
            }
        }

        log::debug!(
            "No {} descriptor in {:?}",
            self.control_name,
            self.range
        );
        None
    }

    /// Locate with a bounded number of attempts
    ///
    /// The interface may not exist yet right after the OS acknowledged the
    /// settings, so a miss is retried `attempts` times, `interval` apart.
    pub async fn locate_with_retry(&self, attempts: u32, interval: Duration) -> Result<RawFd> {
        let attempts = attempts.max(1);
        for attempt in 1..=attempts {
            if let Some(fd) = self.locate() {
                return Ok(fd);
            }
            if attempt < attempts {
                log::debug!("TUN descriptor not found (attempt {}/{})", attempt, attempts);
                tokio::time::sleep(interval).await;
            }
        }
        log::error!("Could not find TUN descriptor after {} attempt(s)", attempts);
        Err(Error::DescriptorNotFound { attempts })
    }
}

impl Default for DescriptorLocator {
    fn default() -> Self {
        Self::system()
    }
}

impl std::fmt::Debug for DescriptorLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorLocator")
            .field("range", &self.range)
            .field("control_name", &self.control_name)
            .field("control_id", &self.cached_control_id())
            .finish()
    }
}
