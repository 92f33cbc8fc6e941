//! OS collaborator that brings the virtual interface up and down
//!
//! How the interface comes to exist differs per platform:
//!
//! - **Apple packet tunnel providers** apply `NEPacketTunnelNetworkSettings`;
//!   the descriptor then has to be found by scanning ([`ScannedInterface`]).
//! - **Android** `VpnService.Builder.establish()` returns the descriptor, and
//!   a supervisor can pass one to a child process ([`InheritedDescriptor`]).
//! - **Linux development** creates the interface with `tun-rs` and routes
//!   through it itself ([`CreatedInterface`]).

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tunbridge_tun::route::{self, InstalledRoutes, RouteTable, SystemRouteTable};
use tunbridge_tun::{NetworkSettings, OwnedTunFd, PacketFlow, TunDevice};

use crate::error::{Error, Result};

/// Brings the virtual interface up and down
#[async_trait]
pub trait TunProvider: Send + Sync {
    /// Bring the interface up with `settings`
    ///
    /// Returns the owned descriptor when the platform hands it over, or `None`
    /// when it has to be located by scanning the descriptor table.
    async fn activate(&self, settings: &NetworkSettings) -> Result<Option<OwnedTunFd>>;

    /// Undo [`activate`](Self::activate); called on stop and on failed starts
    async fn deactivate(&self) -> Result<()> {
        Ok(())
    }

    /// Wrap a descriptor in the packet flow the bridge drives
    fn open_flow(
        &self,
        fd: OwnedTunFd,
        settings: &NetworkSettings,
    ) -> Result<Arc<dyn PacketFlow>> {
        let name = settings.name.clone().unwrap_or_else(|| "utun".to_string());
        Ok(Arc::new(TunDevice::from_owned(fd, name, settings.mtu)?))
    }
}

/// Interface configured by the OS; the descriptor is found by scanning
#[derive(Debug, Default)]
pub struct ScannedInterface;

#[async_trait]
impl TunProvider for ScannedInterface {
    async fn activate(&self, settings: &NetworkSettings) -> Result<Option<OwnedTunFd>> {
        log::debug!(
            "Interface settings applied by the OS: {} (MTU {})",
            settings.address_list(),
            settings.mtu
        );
        Ok(None)
    }
}

/// Descriptor handed over by the parent process
///
/// It can be activated once; a new session needs a new descriptor.
#[derive(Debug)]
pub struct InheritedDescriptor {
    fd: Mutex<Option<OwnedTunFd>>,
}

impl InheritedDescriptor {
    pub fn new(fd: OwnedTunFd) -> Self {
        Self {
            fd: Mutex::new(Some(fd)),
        }
    }
}

#[async_trait]
impl TunProvider for InheritedDescriptor {
    async fn activate(&self, _settings: &NetworkSettings) -> Result<Option<OwnedTunFd>> {
        let fd = self
            .fd
            .lock()
            .map_err(|_| Error::InvalidState("descriptor lock poisoned".into()))?
            .take();
        match fd {
            Some(fd) => {
                log::info!("Using inherited TUN descriptor {}", fd.raw());
                Ok(Some(fd))
            }
            None => Err(Error::InterfaceActivation(
                "inherited descriptor was already consumed".into(),
            )),
        }
    }
}

/// Interface created with `tun-rs` (requires root or `CAP_NET_ADMIN`)
///
/// Nothing else routes traffic into an interface created this way, so the
/// routes from the settings are installed after creation and removed on
/// deactivation. DNS stays with the proxy core's hijack.
#[derive(Default)]
pub struct CreatedInterface {
    table: Option<Arc<dyn RouteTable>>,
    installed: tokio::sync::Mutex<Option<InstalledRoutes>>,
}

impl CreatedInterface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install routes into `table` instead of the system routing table
    pub fn with_route_table(mut self, table: Arc<dyn RouteTable>) -> Self {
        self.table = Some(table);
        self
    }

    fn table(&self) -> Result<Arc<dyn RouteTable>> {
        match self.table {
            Some(ref table) => Ok(table.clone()),
            None => Ok(Arc::new(SystemRouteTable::new()?)),
        }
    }

    /// Add the routes of `settings` through `interface` and keep them for removal
    async fn install_routes(&self, interface: &str, settings: &NetworkSettings) -> Result<()> {
        let table = self.table()?;
        let routes = route::install(table.as_ref(), settings, interface).await?;
        log::info!("Installed {} route(s) through {}", routes.routes().len(), interface);
        *self.installed.lock().await = Some(routes);
        Ok(())
    }
}

#[async_trait]
impl TunProvider for CreatedInterface {
    async fn activate(&self, settings: &NetworkSettings) -> Result<Option<OwnedTunFd>> {
        let owned = settings.clone();
        let (fd, name) = tokio::task::spawn_blocking(move || TunDevice::create_descriptor(&owned))
            .await
            .map_err(|e| Error::InterfaceActivation(format!("interface task failed: {}", e)))?
            .map_err(|e| {
                if e.is_permission_denied() {
                    Error::InterfaceActivation(format!(
                        "creating a TUN interface requires root or CAP_NET_ADMIN: {}",
                        e
                    ))
                } else {
                    Error::InterfaceActivation(e.to_string())
                }
            })?;

        if let Err(e) = self.install_routes(&name, settings).await {
            drop(fd);
            return Err(Error::InterfaceActivation(format!(
                "failed to route through {}: {}",
                name, e
            )));
        }
        Ok(Some(fd))
    }

    async fn deactivate(&self) -> Result<()> {
        let Some(routes) = self.installed.lock().await.take() else {
            return Ok(());
        };
        let table = self.table()?;
        routes.remove(table.as_ref()).await;
        Ok(())
    }
}
