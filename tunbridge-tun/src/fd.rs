//! Exclusively-owned TUN descriptor
//!
//! The descriptor has exactly one owner at any instant. [`OwnedTunFd`] is
//! neither `Copy` nor `Clone`; the only ways out are:
//!
//! - [`TunDevice::from_owned`](crate::TunDevice::from_owned), which moves it
//!   into the packet bridge's device, or
//! - [`IntoRawFd::into_raw_fd`], which releases it to a foreign owner (the
//!   proxy core). After that call nothing on this side closes it.
//!
//! Dropping an unused handle closes the descriptor once.

use std::fmt;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

use crate::error::Result;

/// Exclusively-owned descriptor of the virtual interface
pub struct OwnedTunFd {
    fd: OwnedFd,
}

impl OwnedTunFd {
    /// Take ownership of a raw descriptor
    ///
    /// # Safety
    ///
    /// `fd` must be open and must not be owned or closed by anyone else
    /// (on Android, call `ParcelFileDescriptor.detachFd()` first).
    pub unsafe fn adopt(fd: RawFd) -> Self {
        Self {
            fd: OwnedFd::from_raw_fd(fd),
        }
    }

    /// Duplicate a borrowed descriptor into a new owned one
    ///
    /// The interface stays alive as long as any duplicate is open, so this is
    /// how a descriptor owned by another object (e.g. a `tun-rs` device) is
    /// turned into one the bridge can hand off.
    pub fn duplicate(fd: BorrowedFd<'_>) -> Result<Self> {
        Ok(Self {
            fd: fd.try_clone_to_owned()?,
        })
    }

    /// The descriptor number, for logging
    pub fn raw(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl From<OwnedFd> for OwnedTunFd {
    fn from(fd: OwnedFd) -> Self {
        Self { fd }
    }
}

impl From<OwnedTunFd> for OwnedFd {
    fn from(fd: OwnedTunFd) -> Self {
        fd.fd
    }
}

impl AsFd for OwnedTunFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for OwnedTunFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl IntoRawFd for OwnedTunFd {
    fn into_raw_fd(self) -> RawFd {
        let fd = self.fd.into_raw_fd();
        log::debug!("Released TUN descriptor {} to a foreign owner", fd);
        fd
    }
}

impl fmt::Debug for OwnedTunFd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedTunFd").field("fd", &self.raw()).finish()
    }
}
