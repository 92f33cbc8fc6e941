//! Packet bridge between the virtual interface and a relay
//!
//! Two independent loops, one per direction:
//!
//! - **inbound**: interface → relay. Blocks on a batch read from the
//!   [`PacketFlow`] and pushes each packet into [`Relay::input_packet`].
//! - **outbound**: relay → interface. Polls [`Relay::read_packet`] into a
//!   fixed buffer; packets are classified by IP version and written back.
//!   Empty polls sleep according to a [`Backoff`] staircase that resets on
//!   the next packet.
//!
//! Both loops check the shared running flag at every turn and also listen on
//! a shutdown channel, so a stop never waits out a full backoff sleep or a
//! blocked read. A single bad packet only costs that packet, and repeated
//! read errors are spaced out with the same staircase. The loops end on stop
//! or when the interface goes away; the latter clears the running flag and
//! is reported through [`BridgeHandle::exit_signal`].
//!
//! A relay whose `read_packet` blocks is read on the blocking pool.
//!
//! The flow (and with it the descriptor) is released only after
//! [`BridgeHandle::shutdown`] has observed both loops exit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tunbridge_tun::{IpFamily, PacketFlow, MAX_PACKET_SIZE};

use crate::config::{default_backoff, BackoffTier};
use crate::relay::Relay;
use crate::stats::SharedStatsRef;

/// Idle backoff of the outbound loop
///
/// The sleep after the n-th consecutive empty poll comes from the first tier
/// whose `max_polls` is at least n. The sequence never decreases until
/// [`reset`](Self::reset).
#[derive(Debug, Clone)]
pub struct Backoff {
    tiers: Vec<BackoffTier>,
    empty_polls: u32,
}

impl Backoff {
    pub fn new(tiers: Vec<BackoffTier>) -> Self {
        let tiers = if tiers.is_empty() { default_backoff() } else { tiers };
        Self {
            tiers,
            empty_polls: 0,
        }
    }

    /// Record an empty poll and return how long to sleep
    pub fn next_delay(&mut self) -> Duration {
        self.empty_polls = self.empty_polls.saturating_add(1);
        self.current()
    }

    /// Sleep for the current count without recording a poll
    pub fn current(&self) -> Duration {
        let count = self.empty_polls.max(1);
        self.tiers
            .iter()
            .find(|tier| tier.max_polls.map_or(true, |max| count <= max))
            .or(self.tiers.last())
            .map(BackoffTier::sleep)
            .unwrap_or_default()
    }

    /// Data was observed; go back to the shortest sleep
    pub fn reset(&mut self) {
        self.empty_polls = 0;
    }

    pub fn empty_polls(&self) -> u32 {
        self.empty_polls
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(default_backoff())
    }
}

/// Packet bridge, ready to spawn
pub struct PacketBridge {
    flow: Arc<dyn PacketFlow>,
    relay: Arc<dyn Relay>,
    running: Arc<AtomicBool>,
    stats: SharedStatsRef,
    buffer_size: usize,
    backoff: Vec<BackoffTier>,
}

impl PacketBridge {
    /// Create a bridge over `flow` and `relay`
    ///
    /// `running` is the session's liveness flag; the loops exit once it is
    /// false. The caller sets it before spawning.
    pub fn new(
        flow: Arc<dyn PacketFlow>,
        relay: Arc<dyn Relay>,
        running: Arc<AtomicBool>,
        stats: SharedStatsRef,
    ) -> Self {
        Self {
            flow,
            relay,
            running,
            stats,
            buffer_size: MAX_PACKET_SIZE,
            backoff: default_backoff(),
        }
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.max(1);
        self
    }

    pub fn with_backoff(mut self, tiers: Vec<BackoffTier>) -> Self {
        self.backoff = tiers;
        self
    }

    /// Spawn both loops
    pub fn spawn(self) -> BridgeHandle {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (exit_tx, exit_rx) = watch::channel(None);
        let exit_tx = Arc::new(exit_tx);

        log::info!(
            "Starting packet bridge on {} (MTU {})",
            self.flow.name(),
            self.flow.mtu()
        );

        let inbound = tokio::spawn(inbound_loop(
            self.flow.clone(),
            self.relay.clone(),
            self.running.clone(),
            self.stats.clone(),
            exit_tx.clone(),
            shutdown_tx.subscribe(),
        ));

        let outbound = tokio::spawn(outbound_loop(
            self.flow.clone(),
            self.relay,
            self.running,
            self.stats,
            self.buffer_size,
            Backoff::new(self.backoff),
            exit_tx,
            shutdown_tx.subscribe(),
        ));

        BridgeHandle {
            shutdown_tx,
            exit_rx,
            inbound,
            outbound,
            flow: self.flow,
        }
    }
}

/// Running bridge
pub struct BridgeHandle {
    shutdown_tx: broadcast::Sender<()>,
    exit_rx: watch::Receiver<Option<String>>,
    inbound: JoinHandle<()>,
    outbound: JoinHandle<()>,
    flow: Arc<dyn PacketFlow>,
}

impl BridgeHandle {
    /// Signal both loops, wait for them, then release the flow
    ///
    /// The caller clears the running flag first.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());

        if let Err(e) = self.inbound.await {
            log::warn!("Inbound loop ended abnormally: {}", e);
        }
        if let Err(e) = self.outbound.await {
            log::warn!("Outbound loop ended abnormally: {}", e);
        }

        log::debug!("Packet bridge on {} drained", self.flow.name());
        drop(self.flow);
    }

    /// Receiver that turns `Some(reason)` when the interface goes away
    ///
    /// The loops have cleared the running flag by then. It stays `None` on a
    /// requested shutdown, and its sender is gone once both loops exited.
    pub fn exit_signal(&self) -> watch::Receiver<Option<String>> {
        self.exit_rx.clone()
    }
}

/// Record that the interface is gone; the first reason wins
fn interface_lost(running: &AtomicBool, exit_tx: &watch::Sender<Option<String>>, reason: String) {
    log::warn!("TUN interface closed: {}", reason);
    running.store(false, Ordering::Release);
    exit_tx.send_if_modified(|slot| {
        if slot.is_some() {
            return false;
        }
        *slot = Some(reason);
        true
    });
}

async fn inbound_loop(
    flow: Arc<dyn PacketFlow>,
    relay: Arc<dyn Relay>,
    running: Arc<AtomicBool>,
    stats: SharedStatsRef,
    exit_tx: Arc<watch::Sender<Option<String>>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut errors = Backoff::default();

    while running.load(Ordering::Acquire) {
        let batch = tokio::select! {
            _ = shutdown_rx.recv() => break,
            batch = flow.read_packets() => batch,
        };

        match batch {
            Ok(packets) => {
                errors.reset();
                for packet in packets {
                    if relay.input_packet(&packet) {
                        stats.record_in(packet.len());
                    } else {
                        stats.record_drop();
                        log::debug!("Relay rejected a {} byte packet", packet.len());
                    }
                }
            }
            Err(e) if e.is_interface_closed() => {
                interface_lost(&running, &exit_tx, e.to_string());
                break;
            }
            Err(e) => {
                let delay = errors.next_delay();
                log::debug!("TUN read error (retry in {:?}): {}", delay, e);
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    log::debug!("Inbound loop exited");
}

/// Read one packet from the relay, off the async workers when it may block
///
/// `None` means the blocking read task died.
async fn read_relay(relay: &Arc<dyn Relay>, buf: &mut Vec<u8>) -> Option<isize> {
    if !relay.read_may_block() {
        return Some(relay.read_packet(buf));
    }

    let relay = Arc::clone(relay);
    let mut owned = std::mem::take(buf);
    let read = tokio::task::spawn_blocking(move || {
        let n = relay.read_packet(&mut owned);
        (n, owned)
    });
    match read.await {
        Ok((n, owned)) => {
            *buf = owned;
            Some(n)
        }
        Err(e) => {
            log::warn!("Relay read task failed: {}", e);
            None
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn outbound_loop(
    flow: Arc<dyn PacketFlow>,
    relay: Arc<dyn Relay>,
    running: Arc<AtomicBool>,
    stats: SharedStatsRef,
    buffer_size: usize,
    mut backoff: Backoff,
    exit_tx: Arc<watch::Sender<Option<String>>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; buffer_size];

    while running.load(Ordering::Acquire) {
        let n = tokio::select! {
            _ = shutdown_rx.recv() => break,
            n = read_relay(&relay, &mut buf) => match n {
                Some(n) => n,
                None => break,
            },
        };

        if n <= 0 {
            let delay = backoff.next_delay();
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            continue;
        }

        backoff.reset();
        let len = (n as usize).min(buf.len());
        let packet = &buf[..len];

        let Some(family) = IpFamily::classify(packet) else {
            stats.record_drop();
            log::debug!("Dropping non-IP packet from relay ({} bytes)", len);
            continue;
        };

        match flow.write_packet(packet, family).await {
            Ok(_) => stats.record_out(len),
            Err(e) if e.is_interface_closed() => {
                interface_lost(&running, &exit_tx, e.to_string());
                break;
            }
            Err(e) => {
                stats.record_drop();
                log::debug!("TUN write error: {}", e);
            }
        }
    }

    log::debug!("Outbound loop exited");
}
