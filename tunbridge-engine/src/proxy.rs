//! Proxy core seam
//!
//! The proxy core is the routing engine that makes forwarding decisions. The
//! bridge only needs a narrow slice of it: hand it a home directory and its
//! configuration text, optionally hand it the interface descriptor, switch
//! its mode and stop it. [`ProxyCore`] is that slice.
//!
//! [`HttpCore`] implements it for cores that expose a Clash-style REST
//! controller on loopback, either already running or spawned as a child.

use std::net::{IpAddr, SocketAddr};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::json;
use tokio::sync::Mutex;

use crate::admin::AdminClient;
use crate::config::TunStack;
use crate::error::{Error, Result};
use crate::process::CoreProcess;

/// Proxy core operating mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ProxyMode {
    /// Route by rules
    #[default]
    Rule,
    /// Everything through the selected proxy
    Global,
    /// Everything direct
    Direct,
}

impl ProxyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyMode::Rule => "rule",
            ProxyMode::Global => "global",
            ProxyMode::Direct => "direct",
        }
    }
}

impl std::fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProxyMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rule" => Ok(ProxyMode::Rule),
            "global" => Ok(ProxyMode::Global),
            "direct" => Ok(ProxyMode::Direct),
            other => Err(Error::Config(format!(
                "invalid mode '{}' (expected rule, global or direct)",
                other
            ))),
        }
    }
}

/// The operations the bridge drives on the proxy core
#[async_trait]
pub trait ProxyCore: Send + Sync {
    /// Load `config` with `home_dir` as working directory
    ///
    /// `descriptor` is 0 unless the core should adopt an interface during init.
    async fn init(&self, home_dir: &Path, config: &str, descriptor: RawFd) -> Result<()>;

    /// Hand the interface descriptor to the core
    ///
    /// From the moment this is called the core owns `descriptor`, whether it
    /// succeeds or not. `address` and `dns` are comma-separated lists.
    async fn start_tun(&self, descriptor: RawFd, stack: TunStack, address: &str, dns: &str)
        -> Result<()>;

    /// Stop the core; calling it when already stopped is not an error
    async fn stop(&self) -> Result<()>;

    async fn set_mode(&self, mode: ProxyMode) -> Result<()>;

    async fn get_mode(&self) -> Result<ProxyMode>;
}

/// Proxy core reached through its REST controller
///
/// Two ways of running the core are supported:
///
/// - **attached**: the core is already running as its own service. `init`
///   writes the configuration into the home directory and asks the core to
///   reload it. The core cannot adopt a descriptor from another process, so
///   only the relay strategy works; `start_tun` closes the descriptor and
///   fails.
/// - **process** ([`with_process`](Self::with_process)): `init` only writes
///   the configuration. `start_tun` spawns the core with the descriptor
///   inherited, waits for its controller, loads the configuration and enables
///   TUN on that descriptor. `stop` terminates the child, which releases the
///   interface.
pub struct HttpCore {
    admin: AdminClient,
    process: Option<CoreProcess>,
    ready_timeout: Duration,
    config_path: Mutex<Option<PathBuf>>,
    tun_enabled: AtomicBool,
}

impl HttpCore {
    pub fn new(admin: AdminClient) -> Self {
        Self {
            admin,
            process: None,
            ready_timeout: Duration::from_secs(5),
            config_path: Mutex::new(None),
            tun_enabled: AtomicBool::new(false),
        }
    }

    /// Run the core as a child process that inherits the descriptor
    ///
    /// `ready_timeout` bounds the wait for its controller after a spawn.
    pub fn with_process(mut self, process: CoreProcess, ready_timeout: Duration) -> Self {
        self.process = Some(process);
        self.ready_timeout = ready_timeout;
        self
    }

    async fn patch_configs(&self, value: serde_json::Value) -> Result<()> {
        let response = self.admin.send_json(Method::PATCH, "/configs", &value).await?;
        if response.is_success() {
            Ok(())
        } else {
            Err(Error::Core(format!(
                "PATCH /configs returned {}: {}",
                response.status, response.body
            )))
        }
    }

    async fn load_config(&self, path: &Path) -> Result<()> {
        let body = json!({ "path": path.to_string_lossy() });
        let response = self
            .admin
            .send_json(Method::PUT, "/configs?force=true", &body)
            .await?;

        if !response.is_success() {
            return Err(Error::CoreInit(format!(
                "controller rejected configuration ({}): {}",
                response.status, response.body
            )));
        }
        log::info!("Proxy core loaded {}", path.display());
        Ok(())
    }

    /// Poll `GET /version` until the controller answers
    async fn wait_ready(&self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.ready_timeout;
        loop {
            match self.admin.request("GET", "/version", "").await {
                Ok(response) if response.is_success() => return Ok(()),
                Ok(response) => log::debug!("Controller not ready ({})", response.status),
                Err(e) => log::debug!("Controller not ready: {}", e),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Core(format!(
                    "controller did not come up within {:?}",
                    self.ready_timeout
                )));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Spawn the child with `fd`, load the configuration, enable TUN
    async fn start_child(
        &self,
        process: &CoreProcess,
        fd: OwnedFd,
        stack: TunStack,
        address: &str,
        dns: &str,
    ) -> Result<RawFd> {
        let descriptor = process.spawn_with(fd).await?;
        self.wait_ready().await?;

        let path = self
            .config_path
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::InvalidState("start_tun before init".into()))?;
        self.load_config(&path).await?;

        self.patch_configs(tun_body(descriptor, stack, address, dns))
            .await?;
        self.tun_enabled.store(true, Ordering::SeqCst);
        Ok(descriptor)
    }
}

/// `PATCH /configs` body enabling TUN on `descriptor`
fn tun_body(descriptor: RawFd, stack: TunStack, address: &str, dns: &str) -> serde_json::Value {
    let (inet4, inet6): (Vec<&str>, Vec<&str>) = address
        .split(',')
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .partition(|a| !a.contains(':'));

    let hijack: Vec<String> = dns
        .split(',')
        .filter_map(|s| s.trim().parse::<IpAddr>().ok())
        .map(|ip| SocketAddr::new(ip, 53).to_string())
        .collect();

    json!({
        "tun": {
            "enable": true,
            "stack": stack.as_str(),
            "file-descriptor": descriptor,
            "inet4-address": inet4,
            "inet6-address": inet6,
            "dns-hijack": hijack,
            "auto-route": false,
        }
    })
}

#[async_trait]
impl ProxyCore for HttpCore {
    async fn init(&self, home_dir: &Path, config: &str, descriptor: RawFd) -> Result<()> {
        if descriptor != 0 {
            log::debug!("Ignoring descriptor {} at init; it is passed to start_tun", descriptor);
        }

        tokio::fs::create_dir_all(home_dir)
            .await
            .map_err(|e| Error::CoreInit(format!("failed to create {}: {}", home_dir.display(), e)))?;

        let path = home_dir.join("config.yaml");
        tokio::fs::write(&path, config)
            .await
            .map_err(|e| Error::CoreInit(format!("failed to write {}: {}", path.display(), e)))?;
        *self.config_path.lock().await = Some(path.clone());

        if self.process.is_some() {
            log::debug!("Proxy core configuration staged at {}", path.display());
            return Ok(());
        }

        self.load_config(&path).await.map_err(|e| match e {
            Error::CoreInit(_) => e,
            other => Error::CoreInit(other.to_string()),
        })
    }

    async fn start_tun(
        &self,
        descriptor: RawFd,
        stack: TunStack,
        address: &str,
        dns: &str,
    ) -> Result<()> {
        // SAFETY: the caller released `descriptor` to the core.
        let fd = unsafe { OwnedFd::from_raw_fd(descriptor) };

        let Some(ref process) = self.process else {
            drop(fd);
            return Err(Error::CoreTun(
                "the proxy core runs in another process and cannot adopt a descriptor; \
                 configure core.command or use the relay strategy"
                    .into(),
            ));
        };

        match self.start_child(process, fd, stack, address, dns).await {
            Ok(descriptor) => {
                log::info!(
                    "Proxy core took TUN descriptor {} (stack: {}, address: {})",
                    descriptor,
                    stack,
                    address
                );
                Ok(())
            }
            Err(e) => {
                process.terminate().await;
                Err(Error::CoreTun(e.to_string()))
            }
        }
    }

    async fn stop(&self) -> Result<()> {
        let disabled = if self.tun_enabled.swap(false, Ordering::SeqCst) {
            self.patch_configs(json!({ "tun": { "enable": false } })).await
        } else {
            log::debug!("Proxy core TUN already stopped");
            Ok(())
        };

        match self.process {
            Some(ref process) => {
                if let Err(e) = disabled {
                    log::debug!("Disabling TUN before terminating the core failed: {}", e);
                }
                process.terminate().await;
                Ok(())
            }
            None => disabled,
        }
    }

    async fn set_mode(&self, mode: ProxyMode) -> Result<()> {
        self.patch_configs(json!({ "mode": mode.as_str() })).await
    }

    async fn get_mode(&self) -> Result<ProxyMode> {
        let configs = self.admin.get_json("/configs").await?;
        configs
            .get("mode")
            .and_then(|m| m.as_str())
            .ok_or_else(|| Error::Core("controller reported no mode".into()))?
            .parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert_eq!("rule".parse::<ProxyMode>().unwrap(), ProxyMode::Rule);
        assert_eq!("Global".parse::<ProxyMode>().unwrap(), ProxyMode::Global);
        assert_eq!(" DIRECT ".parse::<ProxyMode>().unwrap(), ProxyMode::Direct);
        assert!("script".parse::<ProxyMode>().is_err());
        assert!("".parse::<ProxyMode>().is_err());
    }

    #[test]
    fn test_tun_body_splits_families() {
        let body = tun_body(7, TunStack::Mixed, "198.18.0.1/16, fd00::1/64", "8.8.8.8,bogus");
        let tun = &body["tun"];
        assert_eq!(tun["file-descriptor"], 7);
        assert_eq!(tun["stack"], "mixed");
        assert_eq!(tun["inet4-address"], json!(["198.18.0.1/16"]));
        assert_eq!(tun["inet6-address"], json!(["fd00::1/64"]));
        assert_eq!(tun["dns-hijack"], json!(["8.8.8.8:53"]));
    }

    #[test]
    fn test_mode_display() {
        assert_eq!(ProxyMode::default().to_string(), "rule");
        assert_eq!(ProxyMode::Global.to_string(), "global");
    }
}
