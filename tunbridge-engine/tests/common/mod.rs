//! Shared test doubles for the engine's integration tests
#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::Read;
use std::net::SocketAddr;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use tunbridge_engine::config::BridgeConfig;
use tunbridge_engine::{Error, ProxyCore, ProxyMode, Relay, Result, TunProvider, TunStack};
use tunbridge_tun::mock::MockPacketFlow;
use tunbridge_tun::{NetworkSettings, OwnedTunFd, PacketFlow};

/// A descriptor standing in for the TUN interface, plus its peer
///
/// The peer observes EOF once every copy of the descriptor is closed.
pub fn tun_pair() -> (OwnedTunFd, UnixStream) {
    let (ours, peer) = UnixStream::pair().unwrap();
    (OwnedTunFd::from(OwnedFd::from(ours)), peer)
}

/// Check whether the other side of `peer` has been closed
pub fn peer_closed(peer: &UnixStream) -> bool {
    peer.set_nonblocking(true).unwrap();
    let mut buf = [0u8; 1];
    match (&*peer).read(&mut buf) {
        Ok(0) => true,
        Ok(_) => false,
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => false,
        Err(_) => true,
    }
}

/// Config rooted in `home` with fast retries and a short restart delay
pub fn test_config(home: &Path) -> BridgeConfig {
    let mut config = BridgeConfig::with_home(home);
    config.bridge.locate_attempts = 2;
    config.bridge.locate_interval_ms = 1;
    config.bridge.restart_delay_ms = 10;
    config.relay.connect_timeout_ms = 100;
    config
}

/// Write a proxy core configuration file and return its path
pub fn write_core_config(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, "mixed-port: 7890\nmode: rule\nproxies: []\n").unwrap();
    path
}

/// Proxy core that records calls and takes ownership of handed-over descriptors
#[derive(Default)]
pub struct MockCore {
    pub init_calls: AtomicUsize,
    pub start_tun_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,
    pub fail_init: AtomicBool,
    pub fail_start_tun: AtomicBool,
    pub last_config: Mutex<Option<String>>,
    pub tun_args: Mutex<Option<(String, String, String)>>,
    mode: Mutex<Option<ProxyMode>>,
    owned: Mutex<Vec<OwnedFd>>,
}

impl MockCore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn owned_descriptors(&self) -> usize {
        self.owned.lock().unwrap().len()
    }
}

#[async_trait]
impl ProxyCore for MockCore {
    async fn init(&self, _home_dir: &Path, config: &str, _descriptor: RawFd) -> Result<()> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_config.lock().unwrap() = Some(config.to_string());
        if self.fail_init.load(Ordering::SeqCst) {
            return Err(Error::CoreInit("yaml: line 1: did not find expected key".into()));
        }
        Ok(())
    }

    async fn start_tun(
        &self,
        descriptor: RawFd,
        stack: TunStack,
        address: &str,
        dns: &str,
    ) -> Result<()> {
        self.start_tun_calls.fetch_add(1, Ordering::SeqCst);
        // The core owns the descriptor from here on, success or not
        self.owned
            .lock()
            .unwrap()
            .push(unsafe { OwnedFd::from_raw_fd(descriptor) });
        *self.tun_args.lock().unwrap() =
            Some((stack.to_string(), address.to_string(), dns.to_string()));

        if self.fail_start_tun.load(Ordering::SeqCst) {
            return Err(Error::CoreTun("tun stack refused descriptor".into()));
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.owned.lock().unwrap().clear();
        Ok(())
    }

    async fn set_mode(&self, mode: ProxyMode) -> Result<()> {
        *self.mode.lock().unwrap() = Some(mode);
        Ok(())
    }

    async fn get_mode(&self) -> Result<ProxyMode> {
        self.mode
            .lock()
            .unwrap()
            .ok_or_else(|| Error::Core("core not initialized".into()))
    }
}

/// OS collaborator handing out queued descriptors
#[derive(Default)]
pub struct MockProvider {
    fds: Mutex<VecDeque<OwnedTunFd>>,
    pub activations: AtomicUsize,
    pub deactivations: AtomicUsize,
    pub fail: AtomicBool,
    flows: Mutex<Vec<Weak<MockPacketFlow>>>,
}

impl MockProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Provider that never hands a descriptor over, forcing a scan
    pub fn scanning() -> Arc<Self> {
        Self::new()
    }

    pub fn push(&self, fd: OwnedTunFd) {
        self.fds.lock().unwrap().push_back(fd);
    }

    pub fn queued(&self) -> usize {
        self.fds.lock().unwrap().len()
    }

    pub fn activations(&self) -> usize {
        self.activations.load(Ordering::SeqCst)
    }

    pub fn deactivations(&self) -> usize {
        self.deactivations.load(Ordering::SeqCst)
    }

    /// The most recently opened flow, if it is still alive
    pub fn flow(&self) -> Option<Arc<MockPacketFlow>> {
        self.flows.lock().unwrap().last().and_then(Weak::upgrade)
    }
}

#[async_trait]
impl TunProvider for MockProvider {
    async fn activate(&self, _settings: &NetworkSettings) -> Result<Option<OwnedTunFd>> {
        self.activations.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::InterfaceActivation("permission denied".into()));
        }
        Ok(self.fds.lock().unwrap().pop_front())
    }

    async fn deactivate(&self) -> Result<()> {
        self.deactivations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn open_flow(
        &self,
        fd: OwnedTunFd,
        settings: &NetworkSettings,
    ) -> Result<Arc<dyn PacketFlow>> {
        let flow = Arc::new(MockPacketFlow::new("mock0", settings.mtu).with_descriptor(fd));
        self.flows.lock().unwrap().push(Arc::downgrade(&flow));
        Ok(flow)
    }
}

/// Relay with a scripted outbound queue that records everything it sees
#[derive(Default)]
pub struct ScriptedRelay {
    pub inbound: Mutex<Vec<Vec<u8>>>,
    outbound: Mutex<VecDeque<Vec<u8>>>,
    polls: Mutex<Vec<tokio::time::Instant>>,
    pub reject: AtomicBool,
    pub fail_start: AtomicBool,
    pub start_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,
    running: AtomicBool,
    started_with: Mutex<Option<(SocketAddr, u16)>>,
    read_delay: Option<Duration>,
}

impl ScriptedRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Relay whose empty reads block the calling thread for `delay`
    pub fn blocking(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            read_delay: Some(delay),
            ..Self::default()
        })
    }

    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn started_with(&self) -> Option<(SocketAddr, u16)> {
        *self.started_with.lock().unwrap()
    }

    pub fn queue(&self, packet: Vec<u8>) {
        self.outbound.lock().unwrap().push_back(packet);
    }

    pub fn received(&self) -> Vec<Vec<u8>> {
        self.inbound.lock().unwrap().clone()
    }

    pub fn poll_times(&self) -> Vec<tokio::time::Instant> {
        self.polls.lock().unwrap().clone()
    }

    pub fn polls(&self) -> usize {
        self.polls.lock().unwrap().len()
    }
}

impl Relay for ScriptedRelay {
    fn start(&self, socks: SocketAddr, mtu: u16) -> Result<()> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(Error::Relay("SOCKS handshake failed".into()));
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::Relay("already running".into()));
        }
        *self.started_with.lock().unwrap() = Some((socks, mtu));
        Ok(())
    }

    fn stop(&self) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn input_packet(&self, packet: &[u8]) -> bool {
        if self.reject.load(Ordering::SeqCst) {
            return false;
        }
        self.inbound.lock().unwrap().push(packet.to_vec());
        true
    }

    fn read_packet(&self, buf: &mut [u8]) -> isize {
        self.polls.lock().unwrap().push(tokio::time::Instant::now());
        let next = self.outbound.lock().unwrap().pop_front();
        match next {
            Some(packet) => {
                let len = packet.len().min(buf.len());
                buf[..len].copy_from_slice(&packet[..len]);
                len as isize
            }
            None => {
                if let Some(delay) = self.read_delay {
                    std::thread::sleep(delay);
                }
                0
            }
        }
    }

    fn read_may_block(&self) -> bool {
        self.read_delay.is_some()
    }
}

/// Poll `cond` until it holds, for up to two seconds
pub async fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Request seen by the mock controller
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub method: String,
    pub path: String,
    pub body: String,
}

/// Minimal stand-in for the proxy core's REST controller
///
/// - `GET /version` → 200 JSON
/// - `GET /configs` → 200 `{"mode": ...}`
/// - `PATCH /configs`, `PUT /configs` → 204, applying `mode` when present
/// - `DELETE /connections` → 204
/// - `GET /slow` → answers after two seconds
/// - anything else → 404 JSON
pub struct MockController {
    pub addr: SocketAddr,
    pub requests: Arc<Mutex<Vec<SeenRequest>>>,
    mode: Arc<Mutex<String>>,
}

impl MockController {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let mode = Arc::new(Mutex::new("rule".to_string()));

        let seen = requests.clone();
        let current = mode.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let seen = seen.clone();
                let current = current.clone();
                tokio::spawn(async move {
                    let _ = serve_one(stream, seen, current).await;
                });
            }
        });

        Self {
            addr,
            requests,
            mode,
        }
    }

    pub fn controller(&self) -> String {
        self.addr.to_string()
    }

    pub fn mode(&self) -> String {
        self.mode.lock().unwrap().clone()
    }

    pub fn requests(&self) -> Vec<SeenRequest> {
        self.requests.lock().unwrap().clone()
    }
}

async fn serve_one(
    mut stream: tokio::net::TcpStream,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
    mode: Arc<Mutex<String>>,
) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.lines();
    let mut request_line = lines.next().unwrap_or("").split_whitespace();
    let method = request_line.next().unwrap_or("").to_string();
    let path = request_line.next().unwrap_or("").to_string();
    let content_length = lines
        .filter_map(|l| l.split_once(':'))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while buf.len() < header_end + content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body = String::from_utf8_lossy(&buf[header_end..]).to_string();

    seen.lock().unwrap().push(SeenRequest {
        method: method.clone(),
        path: path.clone(),
        body: body.clone(),
    });

    let (status, payload) = match (method.as_str(), path.as_str()) {
        ("GET", "/version") => (200, r#"{"meta":true,"version":"v1.18.0"}"#.to_string()),
        ("GET", "/configs") => {
            let mode = mode.lock().unwrap().clone();
            (200, format!(r#"{{"port":0,"mode":"{}"}}"#, mode))
        }
        ("PATCH", "/configs") | ("PUT", "/configs?force=true") => {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(&body) {
                if let Some(m) = value.get("mode").and_then(|m| m.as_str()) {
                    *mode.lock().unwrap() = m.to_string();
                }
            }
            (204, String::new())
        }
        ("DELETE", "/connections") => (204, String::new()),
        ("GET", "/slow") => {
            tokio::time::sleep(Duration::from_secs(2)).await;
            (200, "{}".to_string())
        }
        _ => (404, r#"{"message":"Resource not found"}"#.to_string()),
    };

    let reason = match status {
        200 => "OK",
        204 => "No Content",
        _ => "Not Found",
    };
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason,
        payload.len(),
        payload
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}
