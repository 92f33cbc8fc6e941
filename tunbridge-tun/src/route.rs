//! Routes through a created interface
//!
//! When the bridge creates the interface itself (Linux development), nothing
//! else installs the routes from [`NetworkSettings`]. [`install`] adds them
//! through a [`RouteTable`] and returns the [`InstalledRoutes`] needed to take
//! them out again.
//!
//! A default route (`0.0.0.0/0`, `::/0`) is installed as its two `/1` halves,
//! so it takes precedence over the existing default route without replacing it.

use std::ffi::CString;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use async_trait::async_trait;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};

use crate::config::NetworkSettings;
use crate::error::{Error, Result};

/// A route sending a network through an interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Destination network
    pub destination: IpNet,
    /// Interface name
    pub interface: String,
}

impl Route {
    pub fn new(destination: IpNet, interface: impl Into<String>) -> Self {
        Self {
            destination,
            interface: interface.into(),
        }
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} dev {}", self.destination, self.interface)
    }
}

/// The routing table routes are installed into
#[async_trait]
pub trait RouteTable: Send + Sync {
    async fn add(&self, route: &Route) -> Result<()>;

    async fn delete(&self, route: &Route) -> Result<()>;
}

/// The system routing table, through `net-route`
///
/// Requires root or `CAP_NET_ADMIN`.
pub struct SystemRouteTable {
    handle: net_route::Handle,
}

impl SystemRouteTable {
    pub fn new() -> Result<Self> {
        let handle = net_route::Handle::new()
            .map_err(|e| Error::Route(format!("failed to create route handle: {}", e)))?;
        Ok(Self { handle })
    }

    fn to_net_route(route: &Route) -> Result<net_route::Route> {
        let ifindex = interface_index(&route.interface)?;
        Ok(
            net_route::Route::new(route.destination.addr(), route.destination.prefix_len())
                .with_ifindex(ifindex),
        )
    }
}

#[async_trait]
impl RouteTable for SystemRouteTable {
    async fn add(&self, route: &Route) -> Result<()> {
        let net_route = Self::to_net_route(route)?;
        match self.handle.add(&net_route).await {
            Ok(()) => {
                log::info!("Added route: {}", route);
                Ok(())
            }
            Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {
                log::debug!("Route already exists: {}", route);
                Ok(())
            }
            Err(e) => Err(Error::Route(format!("failed to add route {}: {}", route, e))),
        }
    }

    async fn delete(&self, route: &Route) -> Result<()> {
        let net_route = Self::to_net_route(route)?;
        self.handle
            .delete(&net_route)
            .await
            .map_err(|e| Error::Route(format!("failed to delete route {}: {}", route, e)))?;
        log::info!("Deleted route: {}", route);
        Ok(())
    }
}

fn interface_index(name: &str) -> Result<u32> {
    let c_name =
        CString::new(name).map_err(|_| Error::Config(format!("invalid interface name: {}", name)))?;

    // SAFETY: if_nametoindex only reads the NUL-terminated name.
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if index == 0 {
        return Err(Error::Route(format!(
            "interface '{}' not found: {}",
            name,
            std::io::Error::last_os_error()
        )));
    }
    Ok(index)
}

/// Routes for `settings` on `interface`, default routes split in halves
pub fn tunnel_routes(settings: &NetworkSettings, interface: &str) -> Vec<Route> {
    let mut routes = Vec::new();
    for net in &settings.routes {
        if net.prefix_len() == 0 {
            routes.extend(split_default(net).into_iter().map(|half| Route::new(half, interface)));
        } else {
            routes.push(Route::new(*net, interface));
        }
    }
    routes
}

fn split_default(net: &IpNet) -> [IpNet; 2] {
    match net {
        IpNet::V4(_) => [
            IpNet::V4(Ipv4Net::new(Ipv4Addr::new(0, 0, 0, 0), 1).unwrap_or_default()),
            IpNet::V4(Ipv4Net::new(Ipv4Addr::new(128, 0, 0, 0), 1).unwrap_or_default()),
        ],
        IpNet::V6(_) => [
            IpNet::V6(Ipv6Net::new(Ipv6Addr::UNSPECIFIED, 1).unwrap_or_default()),
            IpNet::V6(
                Ipv6Net::new(Ipv6Addr::new(0x8000, 0, 0, 0, 0, 0, 0, 0), 1).unwrap_or_default(),
            ),
        ],
    }
}

/// Routes added by [`install`]
#[derive(Debug, Default)]
pub struct InstalledRoutes {
    routes: Vec<Route>,
}

impl InstalledRoutes {
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Delete every route, newest first
    ///
    /// Failures are logged; the interface may already be gone and taken its
    /// routes with it.
    pub async fn remove(self, table: &dyn RouteTable) {
        for route in self.routes.iter().rev() {
            if let Err(e) = table.delete(route).await {
                log::debug!("Route cleanup: {}", e);
            }
        }
    }
}

/// Add the routes of `settings` on `interface`
///
/// Either every route is added or, on the first failure, the ones already
/// added are deleted again before the error is returned.
pub async fn install(
    table: &dyn RouteTable,
    settings: &NetworkSettings,
    interface: &str,
) -> Result<InstalledRoutes> {
    let mut installed = InstalledRoutes::default();

    for route in tunnel_routes(settings, interface) {
        if let Err(e) = table.add(&route).await {
            installed.remove(table).await;
            return Err(e);
        }
        installed.routes.push(route);
    }

    if !settings.dns.is_empty() {
        log::debug!(
            "DNS {} is left to the proxy core's hijack on {}",
            settings.dns_list(),
            interface
        );
    }

    Ok(installed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::RecordingRouteTable;

    fn settings(routes: &[&str]) -> NetworkSettings {
        let mut builder = NetworkSettings::builder()
            .ipv4(Ipv4Addr::new(198, 18, 0, 1), 16);
        if routes.is_empty() {
            builder = builder.route_all();
        }
        for route in routes {
            builder = builder.route(route.parse().unwrap());
        }
        builder.build().unwrap()
    }

    #[test]
    fn test_default_routes_are_split() {
        let routes = tunnel_routes(&settings(&[]), "tun7");
        let destinations: Vec<String> = routes.iter().map(|r| r.destination.to_string()).collect();
        assert_eq!(
            destinations,
            vec!["0.0.0.0/1", "128.0.0.0/1", "::/1", "8000::/1"]
        );
        assert!(routes.iter().all(|r| r.interface == "tun7"));
    }

    #[test]
    fn test_specific_routes_kept() {
        let routes = tunnel_routes(&settings(&["10.0.0.0/8", "fd00::/64"]), "tun7");
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].to_string(), "10.0.0.0/8 dev tun7");
    }

    #[tokio::test]
    async fn test_install_and_remove() {
        let table = RecordingRouteTable::new();
        let installed = install(&table, &settings(&["10.0.0.0/8", "172.16.0.0/12"]), "tun7")
            .await
            .unwrap();

        assert_eq!(installed.routes().len(), 2);
        assert_eq!(table.installed().len(), 2);

        installed.remove(&table).await;
        assert!(table.installed().is_empty());
        assert_eq!(table.deleted()[0].destination.to_string(), "172.16.0.0/12");
    }

    #[tokio::test]
    async fn test_failed_install_rolls_back() {
        let table = RecordingRouteTable::new().fail_on("172.16.0.0/12".parse().unwrap());
        let err = install(
            &table,
            &settings(&["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16"]),
            "tun7",
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Route(_)));
        assert!(table.installed().is_empty());
        assert_eq!(table.deleted().len(), 1);
    }
}
