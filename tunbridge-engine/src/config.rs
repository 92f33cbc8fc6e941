//! Configuration types for the bridge engine

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use ipnet::IpNet;
use tunbridge_tun::NetworkSettings;

use crate::error::{Error, Result};

/// Main configuration structure
///
/// The file is TOML. Only `[core] home_dir` is required; everything else has
/// a default matching a packet tunnel provider's usual settings.
///
/// # Example Configuration
///
/// ```toml
/// [core]
/// home_dir = "/var/lib/tunbridge"
/// controller = "127.0.0.1:9090"
///
/// [tun]
/// ipv4 = "198.18.0.1/16"
/// dns = ["8.8.8.8", "1.1.1.1"]
/// stack = "gvisor"
/// strategy = "direct"
///
/// [relay]
/// socks = "127.0.0.1:7890"
///
/// [bridge]
/// restart_delay_ms = 500
///
/// [control]
/// socket = "/tmp/tunbridge.sock"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Proxy core settings
    pub core: CoreConfig,

    /// Virtual interface settings
    #[serde(default)]
    pub tun: TunConfig,

    /// Relay settings for the relay strategy
    #[serde(default)]
    pub relay: RelayConfig,

    /// Packet bridge and lifecycle tuning
    #[serde(default)]
    pub bridge: BridgeSettings,

    /// Control socket settings
    #[serde(default)]
    pub control: ControlConfig,
}

impl BridgeConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: BridgeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration rooted at `home_dir` with every other value defaulted
    pub fn with_home(home_dir: impl Into<PathBuf>) -> Self {
        Self {
            core: CoreConfig::with_home(home_dir),
            tun: TunConfig::default(),
            relay: RelayConfig::default(),
            bridge: BridgeSettings::default(),
            control: ControlConfig::default(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.core.validate()?;
        self.tun.validate()?;
        self.relay.validate()?;
        self.bridge.validate()?;

        if self.bridge.buffer_size < self.tun.mtu as usize {
            return Err(Error::Config(format!(
                "buffer_size {} is smaller than the MTU {}",
                self.bridge.buffer_size, self.tun.mtu
            )));
        }

        Ok(())
    }

    /// Generate a sample configuration
    pub fn sample() -> String {
        r#"# Tunnel bridge configuration

[core]
# Working directory handed to the proxy core (required)
home_dir = "/var/lib/tunbridge"

# Proxy core configuration text; defaults to <home_dir>/config.yaml
# config_path = "/var/lib/tunbridge/config.yaml"

# File remembering the last configuration path used, for restarts;
# defaults to <home_dir>/last_config
# cache_file = "/var/lib/tunbridge/last_config"

# Loopback address of the proxy core's REST controller
controller = "127.0.0.1:9090"

# Bearer token for the controller (optional)
# secret = "change-me"

# Timeout for controller requests, in seconds
request_timeout_secs = 10

# Program and arguments of the proxy core. When set, the core is spawned
# with the interface descriptor inherited and terminated on stop; the
# direct strategy needs this. Runs in home_dir.
command = ["mihomo", "-d", "."]

# How long to wait for a spawned core's controller, in milliseconds
ready_timeout_ms = 5000

[tun]
# Interface name; ignored where the OS picks it (utun)
# name = "tunbridge0"

mtu = 1500
ipv4 = "198.18.0.1/16"
# ipv6 = "fd00:7f::1/64"

# Routes through the tunnel; empty means all traffic
routes = []

dns = ["8.8.8.8", "1.1.1.1"]

# Network stack the proxy core runs on the interface: "gvisor", "system", "mixed"
stack = "gvisor"

# "direct": the proxy core takes the descriptor
# "relay": packets are pumped through an embedded relay
strategy = "direct"

[relay]
# SOCKS endpoint of the proxy core the relay connects to
socks = "127.0.0.1:7890"

# Reachability check before the relay starts; failure is only logged
connect_timeout_ms = 2000

[bridge]
# Outbound read buffer; must hold the largest packet
buffer_size = 65535

# Delay before starting again on restart
restart_delay_ms = 500

# Bounded descriptor scan after the interface is activated
locate_attempts = 5
locate_interval_ms = 100

# Idle backoff of the outbound loop. Each tier applies up to max_polls
# consecutive empty polls; the last tier has no limit.
[[bridge.backoff]]
max_polls = 10
sleep_ms = 1

[[bridge.backoff]]
max_polls = 100
sleep_ms = 10

[[bridge.backoff]]
max_polls = 500
sleep_ms = 50

[[bridge.backoff]]
sleep_ms = 500

[control]
socket = "/tmp/tunbridge.sock"
"#
        .to_string()
    }
}

/// Proxy core settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Working directory handed to the proxy core
    pub home_dir: PathBuf,

    /// Proxy core configuration (default: `<home_dir>/config.yaml`)
    #[serde(default)]
    pub config_path: Option<PathBuf>,

    /// File holding the last configuration path used (default: `<home_dir>/last_config`)
    #[serde(default)]
    pub cache_file: Option<PathBuf>,

    /// Loopback `host:port` of the proxy core's REST controller
    #[serde(default = "default_controller")]
    pub controller: String,

    /// Bearer token for the controller
    #[serde(default)]
    pub secret: Option<String>,

    /// Controller request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Program and arguments to spawn the core with; empty when it runs on its own
    #[serde(default)]
    pub command: Vec<String>,

    /// Wait for a spawned core's controller, in milliseconds
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_ms: u64,
}

impl CoreConfig {
    pub fn with_home(home_dir: impl Into<PathBuf>) -> Self {
        Self {
            home_dir: home_dir.into(),
            config_path: None,
            cache_file: None,
            controller: default_controller(),
            secret: None,
            request_timeout_secs: default_request_timeout(),
            command: Vec::new(),
            ready_timeout_ms: default_ready_timeout(),
        }
    }

    /// Validate core settings
    pub fn validate(&self) -> Result<()> {
        if self.home_dir.as_os_str().is_empty() {
            return Err(Error::Config("home_dir is required".into()));
        }

        let addr = self.controller_addr()?;
        if !addr.ip().is_loopback() {
            return Err(Error::Config(format!(
                "controller {} must be a loopback address",
                addr
            )));
        }

        if self.request_timeout_secs == 0 {
            return Err(Error::Config("request_timeout_secs must be positive".into()));
        }

        Ok(())
    }

    /// Resolved configuration path
    pub fn config_path(&self) -> PathBuf {
        self.config_path
            .clone()
            .unwrap_or_else(|| self.home_dir.join("config.yaml"))
    }

    /// Resolved cache file path
    pub fn cache_file(&self) -> PathBuf {
        self.cache_file
            .clone()
            .unwrap_or_else(|| self.home_dir.join("last_config"))
    }

    /// Parsed controller address
    pub fn controller_addr(&self) -> Result<SocketAddr> {
        self.controller
            .parse()
            .map_err(|_| Error::Config(format!("invalid controller address: {}", self.controller)))
    }

    /// Base URL of the controller
    pub fn controller_url(&self) -> String {
        format!("http://{}", self.controller)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    /// Whether the core is spawned as a child
    pub fn spawns_core(&self) -> bool {
        !self.command.is_empty()
    }
}

/// Network stack the proxy core runs on the interface
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunStack {
    #[default]
    Gvisor,
    System,
    Mixed,
}

impl TunStack {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunStack::Gvisor => "gvisor",
            TunStack::System => "system",
            TunStack::Mixed => "mixed",
        }
    }
}

impl std::fmt::Display for TunStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who consumes the interface descriptor once a session starts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStrategy {
    /// The proxy core takes the descriptor and runs its own stack on it
    #[default]
    Direct,
    /// The packet bridge pumps packets between the interface and a relay
    Relay,
}

impl std::fmt::Display for TunnelStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelStrategy::Direct => write!(f, "direct"),
            TunnelStrategy::Relay => write!(f, "relay"),
        }
    }
}

/// Virtual interface settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunConfig {
    /// Interface name (ignored where the OS picks it)
    #[serde(default)]
    pub name: Option<String>,

    /// MTU (default: 1500)
    #[serde(default = "default_mtu")]
    pub mtu: u16,

    /// IPv4 address in CIDR notation
    #[serde(default = "default_ipv4")]
    pub ipv4: String,

    /// IPv6 address in CIDR notation
    #[serde(default)]
    pub ipv6: Option<String>,

    /// Routes sent through the tunnel; empty routes everything
    #[serde(default)]
    pub routes: Vec<IpNet>,

    /// DNS servers announced to the OS and hijacked by the core
    #[serde(default = "default_dns")]
    pub dns: Vec<IpAddr>,

    /// Network stack for the direct strategy
    #[serde(default)]
    pub stack: TunStack,

    /// Descriptor consumer
    #[serde(default)]
    pub strategy: TunnelStrategy,
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            name: None,
            mtu: default_mtu(),
            ipv4: default_ipv4(),
            ipv6: None,
            routes: Vec::new(),
            dns: default_dns(),
            stack: TunStack::default(),
            strategy: TunnelStrategy::default(),
        }
    }
}

impl TunConfig {
    /// Validate interface settings
    pub fn validate(&self) -> Result<()> {
        self.network_settings().map(|_| ())
    }

    /// Build the settings handed to the OS collaborator
    pub fn network_settings(&self) -> Result<NetworkSettings> {
        let mut builder = NetworkSettings::builder()
            .mtu(self.mtu)
            .address_cidr(&self.ipv4)
            .map_err(|e| Error::Config(format!("tun.ipv4: {}", e)))?;

        if let Some(ref ipv6) = self.ipv6 {
            builder = builder
                .address_cidr(ipv6)
                .map_err(|e| Error::Config(format!("tun.ipv6: {}", e)))?;
        }

        if let Some(ref name) = self.name {
            builder = builder.name(name);
        }

        if self.routes.is_empty() {
            builder = builder.route_all();
        } else {
            for route in &self.routes {
                builder = builder.route(*route);
            }
        }

        for server in &self.dns {
            builder = builder.dns(*server);
        }

        builder.build().map_err(|e| Error::Config(e.to_string()))
    }
}

/// Relay settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// SOCKS endpoint the relay forwards to
    #[serde(default = "default_socks")]
    pub socks: SocketAddr,

    /// Reachability check timeout before starting the relay
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            socks: default_socks(),
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<()> {
        if self.socks.port() == 0 {
            return Err(Error::Config("relay.socks needs a port".into()));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// One step of the outbound loop's idle backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffTier {
    /// Highest consecutive empty poll count this tier covers; `None` is unbounded
    #[serde(default)]
    pub max_polls: Option<u32>,

    /// Sleep after an empty poll in this tier
    pub sleep_ms: u64,
}

impl BackoffTier {
    pub fn new(max_polls: Option<u32>, sleep_ms: u64) -> Self {
        Self { max_polls, sleep_ms }
    }

    pub fn sleep(&self) -> Duration {
        Duration::from_millis(self.sleep_ms)
    }
}

/// Default idle backoff: 1 ms, 10 ms, 50 ms, then 500 ms
pub fn default_backoff() -> Vec<BackoffTier> {
    vec![
        BackoffTier::new(Some(10), 1),
        BackoffTier::new(Some(100), 10),
        BackoffTier::new(Some(500), 50),
        BackoffTier::new(None, 500),
    ]
}

/// Packet bridge and lifecycle tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSettings {
    /// Outbound read buffer size (default: 65535)
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Idle backoff tiers
    #[serde(default = "default_backoff")]
    pub backoff: Vec<BackoffTier>,

    /// Settle delay between stop and start on restart
    #[serde(default = "default_restart_delay")]
    pub restart_delay_ms: u64,

    /// Descriptor scan attempts after activation
    #[serde(default = "default_locate_attempts")]
    pub locate_attempts: u32,

    /// Delay between descriptor scan attempts
    #[serde(default = "default_locate_interval")]
    pub locate_interval_ms: u64,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            backoff: default_backoff(),
            restart_delay_ms: default_restart_delay(),
            locate_attempts: default_locate_attempts(),
            locate_interval_ms: default_locate_interval(),
        }
    }
}

impl BridgeSettings {
    /// Validate bridge settings
    ///
    /// Backoff tiers must form a staircase: strictly increasing bounds,
    /// non-decreasing sleeps, and exactly one unbounded tier at the end.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(Error::Config("buffer_size must be positive".into()));
        }

        if self.locate_attempts == 0 {
            return Err(Error::Config("locate_attempts must be at least 1".into()));
        }

        let Some((last, bounded)) = self.backoff.split_last() else {
            return Err(Error::Config("at least one backoff tier is required".into()));
        };

        if last.max_polls.is_some() {
            return Err(Error::Config(
                "the last backoff tier must not set max_polls".into(),
            ));
        }

        let mut prev_polls = 0u32;
        let mut prev_sleep = 0u64;
        for tier in bounded {
            let Some(max_polls) = tier.max_polls else {
                return Err(Error::Config(
                    "only the last backoff tier may omit max_polls".into(),
                ));
            };
            if max_polls <= prev_polls {
                return Err(Error::Config(format!(
                    "backoff max_polls must increase (got {} after {})",
                    max_polls, prev_polls
                )));
            }
            if tier.sleep_ms < prev_sleep {
                return Err(Error::Config(format!(
                    "backoff sleep_ms must not decrease (got {} after {})",
                    tier.sleep_ms, prev_sleep
                )));
            }
            prev_polls = max_polls;
            prev_sleep = tier.sleep_ms;
        }

        if last.sleep_ms < prev_sleep {
            return Err(Error::Config(
                "the last backoff tier must sleep at least as long as the others".into(),
            ));
        }

        Ok(())
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn locate_interval(&self) -> Duration {
        Duration::from_millis(self.locate_interval_ms)
    }
}

/// Control socket settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Path of the Unix control socket
    #[serde(default = "default_socket")]
    pub socket: PathBuf,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            socket: default_socket(),
        }
    }
}

fn default_controller() -> String {
    "127.0.0.1:9090".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

fn default_ready_timeout() -> u64 {
    5000
}

fn default_socks() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 7890)
}

fn default_connect_timeout() -> u64 {
    2000
}

fn default_mtu() -> u16 {
    tunbridge_tun::DEFAULT_MTU
}

fn default_ipv4() -> String {
    "198.18.0.1/16".to_string()
}

fn default_dns() -> Vec<IpAddr> {
    vec![
        IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
        IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
    ]
}

fn default_buffer_size() -> usize {
    tunbridge_tun::MAX_PACKET_SIZE
}

fn default_restart_delay() -> u64 {
    500
}

fn default_locate_attempts() -> u32 {
    5
}

fn default_locate_interval() -> u64 {
    100
}

fn default_socket() -> PathBuf {
    PathBuf::from(crate::control::DEFAULT_SOCKET_PATH)
}
