//! Packet relay seam
//!
//! When the proxy core does not take the descriptor itself, packets go
//! through a relay (a tun2socks-style library that turns raw IP packets into
//! SOCKS5 streams toward the core). The relay is started against the core's
//! SOCKS endpoint when a session comes up and stopped when it goes down; in
//! between, the packet bridge drives its synchronous packet surface.

use std::ffi::{c_char, c_int, CString};
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;

use crate::error::{Error, Result};

/// Lifecycle and packet surface of a relay
pub trait Relay: Send + Sync {
    /// Start relaying to the SOCKS endpoint at `socks` with the given MTU
    ///
    /// Starting resets the relay's own counters. Starting a running relay is
    /// an error.
    fn start(&self, socks: SocketAddr, mtu: u16) -> Result<()>;

    /// Stop relaying; stopping a stopped relay does nothing
    fn stop(&self);

    fn is_running(&self) -> bool;

    /// Push one packet read from the interface; `false` means it was not accepted
    fn input_packet(&self, packet: &[u8]) -> bool;

    /// Copy the next outgoing packet into `buf`
    ///
    /// Returns the packet length, or zero/negative when nothing is ready.
    fn read_packet(&self, buf: &mut [u8]) -> isize;

    /// Whether `read_packet` may block, so it has to run off the async workers
    fn read_may_block(&self) -> bool {
        false
    }
}

/// Check the SOCKS endpoint accepts connections
///
/// A failure is only logged: the core may open its listener a moment later.
pub async fn check_socks(addr: SocketAddr, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_)) => {
            log::info!("SOCKS endpoint {} is reachable", addr);
            true
        }
        Ok(Err(e)) => {
            log::warn!("SOCKS endpoint {} refused a connection: {}", addr, e);
            false
        }
        Err(_) => {
            log::warn!("SOCKS endpoint {} did not answer within {:?}", addr, timeout);
            false
        }
    }
}

/// `int start(const char *socks_host, int socks_port, int mtu)`, 0 on success
pub type StartFn = unsafe extern "C" fn(host: *const c_char, port: c_int, mtu: c_int) -> c_int;

/// `void stop(void)`
pub type StopFn = unsafe extern "C" fn();

/// `int is_running(void)`, non-zero while running
pub type IsRunningFn = unsafe extern "C" fn() -> c_int;

/// `int input(const uint8_t *data, int len)`, non-zero on success
pub type InputPacketFn = unsafe extern "C" fn(data: *const u8, len: c_int) -> c_int;

/// `int read(uint8_t *buf, int max_len)`, packet length or <= 0
pub type ReadPacketFn = unsafe extern "C" fn(buf: *mut u8, max_len: c_int) -> c_int;

/// Exported functions of a relay linked in through a C ABI
#[derive(Debug, Clone, Copy)]
pub struct RelayFunctions {
    pub start: StartFn,
    pub stop: StopFn,
    pub is_running: IsRunningFn,
    pub input: InputPacketFn,
    pub read: ReadPacketFn,
}

/// Relay linked in through a C ABI
#[derive(Debug, Clone, Copy)]
pub struct ExternRelay {
    functions: RelayFunctions,
    blocking_reads: bool,
}

impl ExternRelay {
    /// Wrap the relay's exported functions
    ///
    /// # Safety
    ///
    /// Every function must be safe to call from any thread; the packet
    /// functions must accept a valid buffer of the given length and must not
    /// retain the pointer after returning.
    pub unsafe fn new(functions: RelayFunctions) -> Self {
        Self {
            functions,
            blocking_reads: false,
        }
    }

    /// The relay's read function waits for a packet instead of returning 0
    pub fn with_blocking_reads(mut self) -> Self {
        self.blocking_reads = true;
        self
    }
}

impl Relay for ExternRelay {
    fn start(&self, socks: SocketAddr, mtu: u16) -> Result<()> {
        let host = CString::new(socks.ip().to_string())
            .map_err(|e| Error::Relay(format!("invalid SOCKS host: {}", e)))?;
        // SAFETY: contract of `ExternRelay::new`; `host` outlives the call.
        let status = unsafe {
            (self.functions.start)(host.as_ptr(), c_int::from(socks.port()), c_int::from(mtu))
        };
        if status != 0 {
            return Err(Error::Relay(format!(
                "relay refused to start against {} (status {})",
                socks, status
            )));
        }
        Ok(())
    }

    fn stop(&self) {
        // SAFETY: contract of `ExternRelay::new`.
        unsafe { (self.functions.stop)() }
    }

    fn is_running(&self) -> bool {
        // SAFETY: contract of `ExternRelay::new`.
        unsafe { (self.functions.is_running)() != 0 }
    }

    fn input_packet(&self, packet: &[u8]) -> bool {
        let Ok(len) = c_int::try_from(packet.len()) else {
            return false;
        };
        // SAFETY: contract of `ExternRelay::new`; the slice outlives the call.
        unsafe { (self.functions.input)(packet.as_ptr(), len) != 0 }
    }

    fn read_packet(&self, buf: &mut [u8]) -> isize {
        let max_len = c_int::try_from(buf.len()).unwrap_or(c_int::MAX);
        // SAFETY: contract of `ExternRelay::new`; at most `max_len` bytes are written.
        let n = unsafe { (self.functions.read)(buf.as_mut_ptr(), max_len) };
        n as isize
    }

    fn read_may_block(&self) -> bool {
        self.blocking_reads
    }
}
