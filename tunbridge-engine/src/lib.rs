//! Tunnel bridge engine
//!
//! This crate drives one packet-tunnel session: it brings up the virtual
//! interface, hands its descriptor to the proxy core (or to the packet bridge
//! in front of a relay), and answers control-plane messages from the
//! controlling process.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                    Controlling process                         │
//! │   app message / control socket ──▶ Dispatcher                  │
//! └───────────────────────────────┬────────────────────────────────┘
//!                                 ▼
//! ┌────────────────────────────────────────────────────────────────┐
//! │                      tunbridge-engine                          │
//! │  TunnelController ──▶ TunProvider (activate / deactivate)      │
//! │        │          ──▶ DescriptorLocator (scan for utun fd)     │
//! │        │          ──▶ ProxyCore (init / start_tun / mode)      │
//! │        │                └─▶ CoreProcess (inherits the fd)      │
//! │        └──────────▶ PacketBridge ◀──▶ Relay (tun2socks)        │
//! │  Dispatcher ──▶ AdminClient ──▶ proxy core REST controller     │
//! └────────────────────────────────────────────────────────────────┘
//!                                 │
//!                                 ▼
//! ┌────────────────────────────────────────────────────────────────┐
//! │                        tunbridge-tun                           │
//! │  OwnedTunFd · DescriptorLocator · TunDevice · PacketFlow       │
//! └────────────────────────────────────────────────────────────────┘
//! ```

pub mod admin;
pub mod bridge;
pub mod config;
pub mod control;
pub mod controller;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod process;
pub mod protocol;
pub mod provider;
pub mod proxy;
pub mod relay;
pub mod stats;

pub use admin::{AdminClient, AdminResponse};
pub use bridge::{Backoff, BridgeHandle, PacketBridge};
pub use config::{BackoffTier, BridgeConfig, RelayConfig, TunStack, TunnelStrategy};
pub use control::{ControlClient, ControlServer, DEFAULT_SOCKET_PATH};
pub use controller::TunnelController;
pub use dispatch::Dispatcher;
pub use error::{Error, Result};
pub use event::{BridgeEvent, EventHandler, LoggingEventHandler, SessionState};
pub use process::CoreProcess;
pub use protocol::{ApiRequest, ControlMessage};
pub use provider::{CreatedInterface, InheritedDescriptor, ScannedInterface, TunProvider};
pub use proxy::{HttpCore, ProxyCore, ProxyMode};
pub use relay::{check_socks, ExternRelay, Relay, RelayFunctions};
pub use stats::{SharedStats, SharedStatsRef, StatsSnapshot};
