//! Test doubles for the interface layer
//!
//! These are used by this crate's tests and by the engine's tests, which is why
//! the module is public. Nothing here touches a real interface.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ipnet::IpNet;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::fd::OwnedTunFd;
use crate::flow::{FlowInfo, PacketFlow};
use crate::locator::{DescriptorTable, PeerControl};
use crate::packet::IpFamily;
use crate::route::{Route, RouteTable};

/// In-memory packet flow
///
/// Batches injected with [`inject`](Self::inject) come out of
/// `read_packets` in order; packets written to the flow are recorded and can be
/// inspected with [`written`](Self::written). After [`close`](Self::close), once
/// pending batches are drained, reads fail with an interface-closed error.
pub struct MockPacketFlow {
    info: FlowInfo,
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<Vec<u8>>>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<Vec<u8>>>>,
    written: Mutex<Vec<(Vec<u8>, IpFamily)>>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    reads: AtomicUsize,
    read_attempts: AtomicUsize,
    _descriptor: Option<OwnedTunFd>,
}

impl MockPacketFlow {
    pub fn new(name: &str, mtu: u16) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            info: FlowInfo {
                name: name.to_string(),
                mtu,
            },
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            written: Mutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            reads: AtomicUsize::new(0),
            read_attempts: AtomicUsize::new(0),
            _descriptor: None,
        }
    }

    /// Hold a descriptor for the lifetime of the flow, closing it on drop
    pub fn with_descriptor(mut self, fd: OwnedTunFd) -> Self {
        self._descriptor = Some(fd);
        self
    }

    /// Queue a single-packet batch
    pub fn inject(&self, packet: Vec<u8>) {
        self.inject_batch(vec![packet]);
    }

    /// Queue a batch of packets
    pub fn inject_batch(&self, batch: Vec<Vec<u8>>) {
        if let Some(tx) = self.tx.lock().unwrap().as_ref() {
            let _ = tx.send(batch);
        }
    }

    /// Simulate the interface going away
    pub fn close(&self) {
        self.tx.lock().unwrap().take();
    }

    /// Make subsequent writes fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent reads fail with `EIO`, which does not close the interface
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Packets written to the flow so far
    pub fn written(&self) -> Vec<(Vec<u8>, IpFamily)> {
        self.written.lock().unwrap().clone()
    }

    /// Number of batches handed out by `read_packets`
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of `read_packets` calls, failed ones included
    pub fn read_attempts(&self) -> usize {
        self.read_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PacketFlow for MockPacketFlow {
    async fn read_packets(&self) -> Result<Vec<Vec<u8>>> {
        self.read_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::from_raw_os_error(libc::EIO)));
        }

        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(batch) => {
                self.reads.fetch_add(1, Ordering::SeqCst);
                Ok(batch)
            }
            None => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "mock interface closed",
            ))),
        }
    }

    async fn write_packet(&self, packet: &[u8], family: IpFamily) -> Result<usize> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                "mock write failure",
            )));
        }
        self.written.lock().unwrap().push((packet.to_vec(), family));
        Ok(packet.len())
    }

    fn info(&self) -> &FlowInfo {
        &self.info
    }
}

/// Scripted descriptor table for locator tests
#[derive(Debug, Default)]
pub struct FakeDescriptorTable {
    peers: HashMap<RawFd, PeerControl>,
    controls: HashMap<String, u32>,
    resolves: Arc<AtomicUsize>,
}

impl FakeDescriptorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor whose peer has the given family and control id
    pub fn with_peer(mut self, fd: RawFd, family: u8, control_id: u32) -> Self {
        self.peers.insert(fd, PeerControl { family, control_id });
        self
    }

    /// Register a kernel control name
    pub fn with_control(mut self, name: &str, id: u32) -> Self {
        self.controls.insert(name.to_string(), id);
        self
    }

    /// Counter of `resolve_control_id` calls
    pub fn resolve_counter(&self) -> Arc<AtomicUsize> {
        self.resolves.clone()
    }
}

impl DescriptorTable for FakeDescriptorTable {
    fn peer(&self, fd: RawFd) -> Option<PeerControl> {
        self.peers.get(&fd).copied()
    }

    fn resolve_control_id(&self, fd: RawFd, name: &str) -> Option<u32> {
        if !self.peers.contains_key(&fd) {
            return None;
        }
        self.resolves.fetch_add(1, Ordering::SeqCst);
        self.controls.get(name).copied()
    }
}

/// Routing table that only records what it is asked to do
#[derive(Debug, Default)]
pub struct RecordingRouteTable {
    installed: Mutex<Vec<Route>>,
    deleted: Mutex<Vec<Route>>,
    fail_on: Option<IpNet>,
}

impl RecordingRouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse to add a route to `destination`
    pub fn fail_on(mut self, destination: IpNet) -> Self {
        self.fail_on = Some(destination);
        self
    }

    /// Routes currently present
    pub fn installed(&self) -> Vec<Route> {
        self.installed.lock().unwrap().clone()
    }

    /// Routes deleted so far, in order
    pub fn deleted(&self) -> Vec<Route> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl RouteTable for RecordingRouteTable {
    async fn add(&self, route: &Route) -> Result<()> {
        if self.fail_on == Some(route.destination) {
            return Err(Error::Route(format!("refused {}", route)));
        }
        self.installed.lock().unwrap().push(route.clone());
        Ok(())
    }

    async fn delete(&self, route: &Route) -> Result<()> {
        self.installed.lock().unwrap().retain(|r| r != route);
        self.deleted.lock().unwrap().push(route.clone());
        Ok(())
    }
}

/// Builds minimal UDP-over-IP packets
#[derive(Debug, Clone)]
pub struct IpPacketBuilder {
    family: IpFamily,
    src: [u8; 16],
    dst: [u8; 16],
    payload: Vec<u8>,
}

impl IpPacketBuilder {
    pub fn ipv4(src: Ipv4Addr, dst: Ipv4Addr) -> Self {
        let mut s = [0u8; 16];
        let mut d = [0u8; 16];
        s[..4].copy_from_slice(&src.octets());
        d[..4].copy_from_slice(&dst.octets());
        Self {
            family: IpFamily::V4,
            src: s,
            dst: d,
            payload: Vec::new(),
        }
    }

    pub fn ipv6(src: Ipv6Addr, dst: Ipv6Addr) -> Self {
        Self {
            family: IpFamily::V6,
            src: src.octets(),
            dst: dst.octets(),
            payload: Vec::new(),
        }
    }

    pub fn payload(mut self, payload: &[u8]) -> Self {
        self.payload = payload.to_vec();
        self
    }

    pub fn build(&self) -> Vec<u8> {
        match self.family {
            IpFamily::V4 => self.build_v4(),
            IpFamily::V6 => self.build_v6(),
        }
    }

    fn build_v4(&self) -> Vec<u8> {
        let total = 20 + self.payload.len();
        let mut packet = Vec::with_capacity(total);
        packet.push(0x45);
        packet.push(0);
        packet.extend_from_slice(&(total as u16).to_be_bytes());
        packet.extend_from_slice(&[0, 0, 0x40, 0]); // id, DF
        packet.push(64); // ttl
        packet.push(17); // udp
        packet.extend_from_slice(&[0, 0]);
        packet.extend_from_slice(&self.src[..4]);
        packet.extend_from_slice(&self.dst[..4]);

        let checksum = ipv4_checksum(&packet[..20]);
        packet[10..12].copy_from_slice(&checksum.to_be_bytes());

        packet.extend_from_slice(&self.payload);
        packet
    }

    fn build_v6(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(40 + self.payload.len());
        packet.extend_from_slice(&[0x60, 0, 0, 0]);
        packet.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        packet.push(17); // next header: udp
        packet.push(64); // hop limit
        packet.extend_from_slice(&self.src);
        packet.extend_from_slice(&self.dst);
        packet.extend_from_slice(&self.payload);
        packet
    }
}

fn ipv4_checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = header
        .chunks(2)
        .map(|c| u16::from_be_bytes([c[0], *c.get(1).unwrap_or(&0)]) as u32)
        .sum();
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}
