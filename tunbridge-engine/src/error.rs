//! Error types for the bridge engine

use thiserror::Error;

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running a tunnel session
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to parse configuration file
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TUN layer error
    #[error("TUN error: {0}")]
    Tun(#[from] tunbridge_tun::Error),

    /// The OS collaborator could not bring up the interface
    #[error("interface activation failed: {0}")]
    InterfaceActivation(String),

    /// The interface descriptor could not be located
    #[error("TUN descriptor not found after {attempts} attempt(s)")]
    DescriptorNotFound { attempts: u32 },

    /// Proxy core rejected its configuration
    #[error("proxy core init failed: {0}")]
    CoreInit(String),

    /// Proxy core could not take over the interface
    #[error("proxy core TUN start failed: {0}")]
    CoreTun(String),

    /// Any other proxy core failure
    #[error("proxy core error: {0}")]
    Core(String),

    /// Relay missing or unusable
    #[error("relay error: {0}")]
    Relay(String),

    /// Control channel error
    #[error("control error: {0}")]
    Control(String),

    /// HTTP error talking to the proxy core controller
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Invalid state
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl Error {
    /// Check if this error aborted a session start
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            Error::InterfaceActivation(_)
                | Error::DescriptorNotFound { .. }
                | Error::CoreInit(_)
                | Error::CoreTun(_)
        )
    }

    /// Check if this is a recoverable error
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Http(e) => e.is_timeout() || e.is_connect(),
            Error::DescriptorNotFound { .. } | Error::Control(_) | Error::Relay(_) => true,
            _ => false,
        }
    }

    /// Check if this is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::Config(_) | Error::ConfigParse(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Control(format!("invalid JSON: {}", e))
    }
}
