//! Tunnel lifecycle controller
//!
//! Owns one tunnel session at a time and drives it through
//! `Idle → Starting → Running → Stopping → Idle`, with `Restarting` wrapping
//! a stop, a settle delay and a start.
//!
//! The interface descriptor lives in an [`OwnedTunFd`] until it is consumed
//! exactly once: released to the proxy core ([`TunnelStrategy::Direct`]) or
//! moved into the packet flow the bridge drives ([`TunnelStrategy::Relay`]).
//! A failed start drops whatever is still owned, stops the relay and the core
//! and deactivates the interface, leaving the controller `Idle`.
//!
//! When the interface disappears under a relay session, the bridge reports it
//! and the session is torn down as if stopped, with an
//! [`InterfaceLost`](BridgeEvent::InterfaceLost) event first.

use std::os::fd::{IntoRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Mutex, RwLock};
use tunbridge_tun::{DescriptorLocator, NetworkSettings, OwnedTunFd};

use crate::bridge::{BridgeHandle, PacketBridge};
use crate::config::{BridgeConfig, TunnelStrategy};
use crate::error::{Error, Result};
use crate::event::{BridgeEvent, EventHandler, LogLevel, LoggingEventHandler, SessionState};
use crate::provider::TunProvider;
use crate::proxy::{ProxyCore, ProxyMode};
use crate::relay::{check_socks, Relay};
use crate::stats::{SharedStats, SharedStatsRef, StatsSnapshot};

/// Live session
struct Session {
    id: u64,
    strategy: TunnelStrategy,
    descriptor: RawFd,
    bridge: Option<BridgeHandle>,
}

/// Collaborators and state shared with the interface watcher
#[derive(Clone)]
struct Lifecycle {
    core: Arc<dyn ProxyCore>,
    provider: Arc<dyn TunProvider>,
    relay: Option<Arc<dyn Relay>>,
    event_handler: Arc<dyn EventHandler>,
    state: Arc<RwLock<SessionState>>,
    running: Arc<AtomicBool>,
}

impl Lifecycle {
    /// Release everything a session holds and go back to `Idle`
    ///
    /// The caller has already taken the session out of its slot.
    async fn teardown(&self, session: Session, reason: &str) {
        self.set_state(SessionState::Stopping).await;
        self.running.store(false, Ordering::Release);

        if let Some(bridge) = session.bridge {
            bridge.shutdown().await;
            if let Some(ref relay) = self.relay {
                relay.stop();
            }
        }

        if let Err(e) = self.core.stop().await {
            log::warn!("Proxy core stop failed: {}", e);
        }

        if let Err(e) = self.provider.deactivate().await {
            log::warn!("Interface deactivation failed: {}", e);
        }

        self.set_state(SessionState::Idle).await;
        self.emit(BridgeEvent::SessionStopped {
            reason: reason.to_string(),
        })
        .await;
    }

    /// Update state, emitting an event only on a change
    async fn set_state(&self, new_state: SessionState) {
        let old_state = {
            let mut state = self.state.write().await;
            let old = *state;
            *state = new_state;
            old
        };

        if old_state != new_state {
            self.emit(BridgeEvent::StateChanged {
                old: old_state,
                new: new_state,
            })
            .await;
        }
    }

    async fn emit(&self, event: BridgeEvent) {
        self.event_handler.on_event(event).await;
    }
}

/// Tunnel lifecycle controller
pub struct TunnelController {
    /// Configuration
    config: BridgeConfig,

    /// Collaborators, state and liveness flag
    lifecycle: Lifecycle,

    /// Descriptor discovery when the provider does not hand one over
    locator: DescriptorLocator,

    /// Current session; the lock serializes start/stop/restart
    session: Arc<Mutex<Option<Session>>>,

    /// Id of the next session
    next_session: AtomicU64,

    /// Config path of the last successful start
    last_config: Mutex<Option<PathBuf>>,

    /// Shared statistics
    stats: SharedStatsRef,
}

impl TunnelController {
    /// Create a controller with the given configuration, core and provider
    pub fn new(
        config: BridgeConfig,
        core: Arc<dyn ProxyCore>,
        provider: Arc<dyn TunProvider>,
    ) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            config,
            lifecycle: Lifecycle {
                core,
                provider,
                relay: None,
                event_handler: Arc::new(LoggingEventHandler),
                state: Arc::new(RwLock::new(SessionState::Idle)),
                running: Arc::new(AtomicBool::new(false)),
            },
            locator: DescriptorLocator::system(),
            session: Arc::new(Mutex::new(None)),
            next_session: AtomicU64::new(1),
            last_config: Mutex::new(None),
            stats: Arc::new(SharedStats::new()),
        })
    }

    /// Set the relay used by the relay strategy
    pub fn with_relay(mut self, relay: Arc<dyn Relay>) -> Self {
        self.lifecycle.relay = Some(relay);
        self
    }

    /// Use a different descriptor locator
    pub fn with_locator(mut self, locator: DescriptorLocator) -> Self {
        self.locator = locator;
        self
    }

    /// Set a custom event handler
    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.lifecycle.event_handler = handler;
        self
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Get the current state
    pub async fn state(&self) -> SessionState {
        *self.lifecycle.state.read().await
    }

    /// Check the liveness flag
    pub fn is_running(&self) -> bool {
        self.lifecycle.running.load(Ordering::Acquire)
    }

    /// Get the current statistics
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Start a session with the proxy core configuration at `config_path`
    ///
    /// A start while a session exists is ignored and returns `Ok`. Any failure
    /// is fully unwound before the error is returned.
    pub async fn start(&self, config_path: impl AsRef<Path>) -> Result<()> {
        let config_path = config_path.as_ref();
        let mut session = self.session.lock().await;

        if session.is_some() {
            let state = self.state().await;
            self.lifecycle
                .emit(BridgeEvent::StartIgnored { state })
                .await;
            return Ok(());
        }

        self.lifecycle.set_state(SessionState::Starting).await;
        self.stats.reset();

        match self.establish(config_path).await {
            Ok(new_session) => {
                let id = new_session.id;
                let strategy = new_session.strategy;
                let descriptor = new_session.descriptor;
                let exit = new_session.bridge.as_ref().map(BridgeHandle::exit_signal);
                *session = Some(new_session);

                self.remember_config(config_path).await;
                self.lifecycle.set_state(SessionState::Running).await;
                self.lifecycle
                    .emit(BridgeEvent::SessionStarted {
                        strategy,
                        descriptor,
                    })
                    .await;

                if let Some(exit) = exit {
                    self.watch_interface(id, exit);
                }
                Ok(())
            }
            Err(e) => {
                self.lifecycle.running.store(false, Ordering::Release);
                self.lifecycle.set_state(SessionState::Idle).await;
                self.lifecycle
                    .emit(BridgeEvent::Error {
                        message: format!("start failed: {}", e),
                        recoverable: e.is_recoverable(),
                    })
                    .await;
                Err(e)
            }
        }
    }

    /// Start with the configured path, `<home_dir>/config.yaml` by default
    pub async fn start_default(&self) -> Result<()> {
        let path = self.config.core.config_path();
        self.start(path).await
    }

    /// Stop the session; a stop without a session is a no-op
    pub async fn stop(&self) -> Result<()> {
        self.stop_with_reason("stop requested").await
    }

    /// Stop, wait the settle delay, and start from the last known config
    pub async fn restart(&self) -> Result<()> {
        {
            let mut guard = self.session.lock().await;
            self.lifecycle.set_state(SessionState::Restarting).await;
            match guard.take() {
                Some(session) => self.lifecycle.teardown(session, "restart").await,
                None => self.lifecycle.set_state(SessionState::Idle).await,
            }
        }

        tokio::time::sleep(self.config.bridge.restart_delay()).await;

        let path = self.cached_config_path().await;
        self.log(LogLevel::Info, format!("Restarting with {}", path.display()))
            .await;
        self.start(path).await
    }

    /// Current proxy mode, `rule` when the core cannot answer
    pub async fn mode(&self) -> ProxyMode {
        match self.lifecycle.core.get_mode().await {
            Ok(mode) => mode,
            Err(e) => {
                log::debug!("Proxy core did not report a mode: {}", e);
                ProxyMode::default()
            }
        }
    }

    /// Switch the proxy mode
    pub async fn set_mode(&self, mode: ProxyMode) -> Result<()> {
        self.lifecycle.core.set_mode(mode).await?;
        log::info!("Proxy mode set to {}", mode);
        Ok(())
    }

    /// Config path a restart would use
    ///
    /// The path of the last successful start, else the one in the cache file,
    /// else the configured default.
    pub async fn cached_config_path(&self) -> PathBuf {
        if let Some(path) = self.last_config.lock().await.clone() {
            return path;
        }

        let cache_file = self.config.core.cache_file();
        match tokio::fs::read_to_string(&cache_file).await {
            Ok(content) if !content.trim().is_empty() => PathBuf::from(content.trim()),
            _ => self.config.core.config_path(),
        }
    }

    async fn stop_with_reason(&self, reason: &str) -> Result<()> {
        let mut guard = self.session.lock().await;

        let Some(session) = guard.take() else {
            self.lifecycle.emit(BridgeEvent::StopIgnored).await;
            return Ok(());
        };

        self.lifecycle.teardown(session, reason).await;
        Ok(())
    }

    /// Tear session `id` down once its bridge reports the interface gone
    ///
    /// The watcher ends quietly when the bridge shuts down normally, when the
    /// session was replaced, or when the controller is gone.
    fn watch_interface(&self, id: u64, mut exit: watch::Receiver<Option<String>>) {
        let slot = Arc::downgrade(&self.session);
        let lifecycle = self.lifecycle.clone();

        tokio::spawn(async move {
            let reason = exit
                .wait_for(Option::is_some)
                .await
                .ok()
                .and_then(|r| (*r).clone());
            let Some(reason) = reason else {
                return;
            };
            let Some(slot) = slot.upgrade() else {
                return;
            };

            let mut guard = slot.lock().await;
            if guard.as_ref().map(|s| s.id) != Some(id) {
                return;
            }
            let Some(session) = guard.take() else {
                return;
            };

            lifecycle
                .emit(BridgeEvent::InterfaceLost {
                    reason: reason.clone(),
                })
                .await;
            lifecycle
                .teardown(session, &format!("interface closed: {}", reason))
                .await;
        });
    }

    /// Run the start sequence; on error everything acquired has been released
    async fn establish(&self, config_path: &Path) -> Result<Session> {
        let strategy = self.config.tun.strategy;
        let relay = match strategy {
            TunnelStrategy::Relay => Some(self.lifecycle.relay.clone().ok_or_else(|| {
                Error::Relay("relay strategy selected but no relay is attached".into())
            })?),
            TunnelStrategy::Direct => None,
        };

        let config_text = tokio::fs::read_to_string(config_path).await.map_err(|e| {
            Error::Config(format!("failed to read {}: {}", config_path.display(), e))
        })?;
        let settings = self.config.tun.network_settings()?;

        let fd = match self.lifecycle.provider.activate(&settings).await {
            Ok(fd) => fd,
            Err(e @ Error::InterfaceActivation(_)) => return Err(e),
            Err(e) => return Err(Error::InterfaceActivation(e.to_string())),
        };

        let fd = match fd {
            Some(fd) => fd,
            None => match self.locate().await {
                Ok(fd) => fd,
                Err(e) => {
                    self.deactivate_quietly().await;
                    return Err(e);
                }
            },
        };

        if let Err(e) = self
            .lifecycle
            .core
            .init(&self.config.core.home_dir, &config_text, 0)
            .await
        {
            drop(fd);
            self.unwind().await;
            return Err(match e {
                Error::CoreInit(_) => e,
                other => Error::CoreInit(other.to_string()),
            });
        }

        let descriptor = fd.raw();
        let bridge = match relay {
            None => {
                self.hand_to_core(fd, &settings).await?;
                None
            }
            Some(relay) => Some(self.spawn_bridge(fd, &settings, relay).await?),
        };

        self.lifecycle.running.store(true, Ordering::Release);

        Ok(Session {
            id: self.next_session.fetch_add(1, Ordering::Relaxed),
            strategy,
            descriptor,
            bridge,
        })
    }

    /// Release the descriptor to the proxy core
    ///
    /// After `into_raw_fd` nothing on this side closes the descriptor, even
    /// if the core then fails.
    async fn hand_to_core(&self, fd: OwnedTunFd, settings: &NetworkSettings) -> Result<()> {
        let raw = fd.into_raw_fd();
        let result = self
            .lifecycle
            .core
            .start_tun(
                raw,
                self.config.tun.stack,
                &settings.address_list(),
                &settings.dns_list(),
            )
            .await;

        if let Err(e) = result {
            self.unwind().await;
            return Err(match e {
                Error::CoreTun(_) => e,
                other => Error::CoreTun(other.to_string()),
            });
        }
        Ok(())
    }

    /// Start the relay, move the descriptor into a packet flow and start the bridge
    async fn spawn_bridge(
        &self,
        fd: OwnedTunFd,
        settings: &NetworkSettings,
        relay: Arc<dyn Relay>,
    ) -> Result<BridgeHandle> {
        let socks = self.config.relay.socks;
        check_socks(socks, self.config.relay.connect_timeout()).await;

        if relay.is_running() {
            log::warn!("Relay still running from an earlier session, stopping it");
            relay.stop();
        }
        if let Err(e) = relay.start(socks, settings.mtu) {
            drop(fd);
            self.unwind().await;
            return Err(e);
        }
        log::info!("Relay started against {} (MTU {})", socks, settings.mtu);

        let flow = match self.lifecycle.provider.open_flow(fd, settings) {
            Ok(flow) => flow,
            Err(e) => {
                relay.stop();
                self.unwind().await;
                return Err(e);
            }
        };

        self.lifecycle.running.store(true, Ordering::Release);
        Ok(PacketBridge::new(
            flow,
            relay,
            self.lifecycle.running.clone(),
            self.stats.clone(),
        )
        .with_buffer_size(self.config.bridge.buffer_size)
        .with_backoff(self.config.bridge.backoff.clone())
        .spawn())
    }

    async fn locate(&self) -> Result<OwnedTunFd> {
        let raw = self
            .locator
            .locate_with_retry(
                self.config.bridge.locate_attempts,
                self.config.bridge.locate_interval(),
            )
            .await
            .map_err(|e| match e {
                tunbridge_tun::Error::DescriptorNotFound { attempts } => {
                    Error::DescriptorNotFound { attempts }
                }
                other => Error::Tun(other),
            })?;

        // SAFETY: the scan matched the utun control socket the OS opened for
        // this provider; nothing else in the process owns it.
        Ok(unsafe { OwnedTunFd::adopt(raw) })
    }

    /// Stop the core and deactivate the interface after a failed start
    async fn unwind(&self) {
        if let Err(e) = self.lifecycle.core.stop().await {
            log::debug!("Proxy core stop during rollback failed: {}", e);
        }
        self.deactivate_quietly().await;
    }

    async fn deactivate_quietly(&self) {
        if let Err(e) = self.lifecycle.provider.deactivate().await {
            log::debug!("Interface deactivation during rollback failed: {}", e);
        }
    }

    async fn remember_config(&self, path: &Path) {
        *self.last_config.lock().await = Some(path.to_path_buf());

        let cache_file = self.config.core.cache_file();
        if let Err(e) = tokio::fs::write(&cache_file, path.to_string_lossy().as_bytes()).await {
            log::debug!("Failed to cache config path in {}: {}", cache_file.display(), e);
        }
    }

    /// Log a message through the event system
    async fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.lifecycle
            .emit(BridgeEvent::Log {
                level,
                message: message.into(),
            })
            .await;
    }
}

impl Drop for TunnelController {
    fn drop(&mut self) {
        self.lifecycle.running.store(false, Ordering::Release);

        let bridged = self
            .session
            .try_lock()
            .ok()
            .and_then(|mut guard| guard.take())
            .map_or(false, |session| session.bridge.is_some());
        if bridged {
            if let Some(ref relay) = self.lifecycle.relay {
                relay.stop();
            }
        }
    }
}
