//! Error types for tunbridge-tun

use std::io;
use thiserror::Error;

/// Result type alias for tunbridge-tun operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while locating or driving the virtual interface
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Device creation error
    #[error("device creation error: {0}")]
    DeviceCreation(String),

    /// The descriptor scan found no matching control socket
    #[error("TUN descriptor not found after {attempts} attempt(s)")]
    DescriptorNotFound { attempts: u32 },

    /// Invalid IP address
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid network prefix
    #[error("invalid network prefix: {0}")]
    InvalidPrefix(String),

    /// Route installation or removal failed
    #[error("route error: {0}")]
    Route(String),
}

impl Error {
    /// Check if the error is a permission-related error
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == io::ErrorKind::PermissionDenied)
    }

    /// Check if the error is a not-found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::DescriptorNotFound { .. })
            || matches!(self, Error::Io(e) if e.kind() == io::ErrorKind::NotFound)
    }

    /// Check if the interface behind the descriptor is gone
    ///
    /// Forwarding loops stop on these; every other I/O error only costs the
    /// packet that triggered it.
    pub fn is_interface_closed(&self) -> bool {
        match self {
            Error::Io(e) => {
                matches!(
                    e.kind(),
                    io::ErrorKind::BrokenPipe
                        | io::ErrorKind::UnexpectedEof
                        | io::ErrorKind::NotConnected
                ) || matches!(
                    e.raw_os_error(),
                    Some(libc::EBADF) | Some(libc::ENXIO) | Some(libc::ENODEV)
                )
            }
            _ => false,
        }
    }
}
