//! Session events and state management

use std::os::fd::RawFd;

use crate::config::TunnelStrategy;

/// Tunnel session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No session
    #[default]
    Idle,
    /// Activating the interface and initializing the proxy core
    Starting,
    /// Forwarding
    Running,
    /// Tearing the session down
    Stopping,
    /// Stopping, settling, then starting again
    Restarting,
}

impl SessionState {
    /// Get a human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            SessionState::Idle => "Idle",
            SessionState::Starting => "Starting...",
            SessionState::Running => "Running",
            SessionState::Stopping => "Stopping...",
            SessionState::Restarting => "Restarting...",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Events emitted by the tunnel controller
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    /// State changed
    StateChanged {
        old: SessionState,
        new: SessionState,
    },

    /// A session is up
    SessionStarted {
        /// Who consumes the descriptor
        strategy: TunnelStrategy,
        /// Descriptor number handed over
        descriptor: RawFd,
    },

    /// A session was torn down
    SessionStopped {
        /// Reason for the teardown
        reason: String,
    },

    /// The interface went away under a running session, which is torn down next
    InterfaceLost {
        /// What the packet bridge saw
        reason: String,
    },

    /// Start requested while a session already exists
    StartIgnored {
        /// State at the time of the request
        state: SessionState,
    },

    /// Stop requested with no session
    StopIgnored,

    /// Error occurred
    Error {
        /// Error message
        message: String,
        /// Whether the error is recoverable
        recoverable: bool,
    },

    /// Log message
    Log {
        /// Log level
        level: LogLevel,
        /// Message
        message: String,
    },
}

/// Log levels for bridge events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warning => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Event handler trait for receiving bridge events
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle a bridge event
    async fn on_event(&self, event: BridgeEvent);
}

/// Simple event handler that logs events
pub struct LoggingEventHandler;

#[async_trait::async_trait]
impl EventHandler for LoggingEventHandler {
    async fn on_event(&self, event: BridgeEvent) {
        match event {
            BridgeEvent::StateChanged { old, new } => {
                log::info!("Tunnel state: {} -> {}", old, new);
            }
            BridgeEvent::SessionStarted {
                strategy,
                descriptor,
            } => {
                log::info!(
                    "Session started: strategy={}, descriptor={}",
                    strategy,
                    descriptor
                );
            }
            BridgeEvent::SessionStopped { reason } => {
                log::info!("Session stopped: {}", reason);
            }
            BridgeEvent::InterfaceLost { reason } => {
                log::warn!("Interface lost: {}", reason);
            }
            BridgeEvent::StartIgnored { state } => {
                log::warn!("Start ignored, session already {}", state);
            }
            BridgeEvent::StopIgnored => {
                log::debug!("Stop ignored, no session");
            }
            BridgeEvent::Error {
                message,
                recoverable,
            } => {
                if recoverable {
                    log::warn!("Recoverable error: {}", message);
                } else {
                    log::error!("Error: {}", message);
                }
            }
            BridgeEvent::Log { level, message } => match level {
                LogLevel::Debug => log::debug!("{}", message),
                LogLevel::Info => log::info!("{}", message),
                LogLevel::Warning => log::warn!("{}", message),
                LogLevel::Error => log::error!("{}", message),
            },
        }
    }
}
