//! Network settings for the virtual interface
//!
//! These values are deployment configuration handed to the OS collaborator
//! (NetworkExtension, `VpnService.Builder`, or `tun-rs` on Linux) when the
//! interface is activated. Nothing in the core hard-codes them.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::IpNet;

use crate::error::{Error, Result};
use crate::DEFAULT_MTU;

/// IPv4 address configuration for the interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Config {
    /// The IPv4 address to assign to the interface
    pub address: Ipv4Addr,
    /// Network prefix length (e.g., 16 for /16)
    pub prefix_len: u8,
}

impl Ipv4Config {
    /// Create a new IPv4 configuration
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Self {
        Self {
            address,
            prefix_len,
        }
    }
}

/// IPv6 address configuration for the interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv6Config {
    /// The IPv6 address to assign to the interface
    pub address: Ipv6Addr,
    /// Network prefix length (e.g., 126 for /126)
    pub prefix_len: u8,
}

impl Ipv6Config {
    /// Create a new IPv6 configuration
    pub fn new(address: Ipv6Addr, prefix_len: u8) -> Self {
        Self {
            address,
            prefix_len,
        }
    }
}

/// Settings applied to the virtual interface when it is activated
#[derive(Debug, Clone)]
pub struct NetworkSettings {
    /// Interface name (ignored where the OS picks the name, e.g. utun)
    pub name: Option<String>,
    /// IPv4 configuration
    pub ipv4: Option<Ipv4Config>,
    /// IPv6 configurations
    pub ipv6: Vec<Ipv6Config>,
    /// Routes sent through the tunnel
    pub routes: Vec<IpNet>,
    /// DNS servers announced to the OS
    pub dns: Vec<IpAddr>,
    /// Maximum transmission unit
    pub mtu: u16,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            name: None,
            ipv4: None,
            ipv6: Vec::new(),
            routes: Vec::new(),
            dns: Vec::new(),
            mtu: DEFAULT_MTU,
        }
    }
}

impl NetworkSettings {
    /// Create a new settings builder
    pub fn builder() -> NetworkSettingsBuilder {
        NetworkSettingsBuilder::new()
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<()> {
        if self.ipv4.is_none() && self.ipv6.is_empty() {
            return Err(Error::Config(
                "at least one IPv4 or IPv6 address must be configured".into(),
            ));
        }

        if let Some(ref ipv4) = self.ipv4 {
            if ipv4.prefix_len > 32 {
                return Err(Error::InvalidPrefix(format!(
                    "IPv4 prefix length {} is invalid (max 32)",
                    ipv4.prefix_len
                )));
            }
        }

        for ipv6 in &self.ipv6 {
            if ipv6.prefix_len > 128 {
                return Err(Error::InvalidPrefix(format!(
                    "IPv6 prefix length {} is invalid (max 128)",
                    ipv6.prefix_len
                )));
            }
        }

        if self.mtu < 576 {
            return Err(Error::Config(format!(
                "MTU {} is too small (minimum 576)",
                self.mtu
            )));
        }

        Ok(())
    }

    /// Interface addresses in CIDR form, comma separated
    ///
    /// This is the shape the proxy core's TUN listener expects,
    /// e.g. `"198.18.0.1/16,fd00::1/126"`.
    pub fn address_list(&self) -> String {
        let mut out: Vec<String> = Vec::new();
        if let Some(ref ipv4) = self.ipv4 {
            out.push(format!("{}/{}", ipv4.address, ipv4.prefix_len));
        }
        for ipv6 in &self.ipv6 {
            out.push(format!("{}/{}", ipv6.address, ipv6.prefix_len));
        }
        out.join(",")
    }

    /// DNS servers, comma separated
    pub fn dns_list(&self) -> String {
        self.dns
            .iter()
            .map(|ip| ip.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Builder for NetworkSettings
#[derive(Debug, Default)]
pub struct NetworkSettingsBuilder {
    settings: NetworkSettings,
}

impl NetworkSettingsBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the interface name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.settings.name = Some(name.into());
        self
    }

    /// Set the IPv4 address and prefix length
    pub fn ipv4(mut self, address: impl Into<Ipv4Addr>, prefix_len: u8) -> Self {
        self.settings.ipv4 = Some(Ipv4Config::new(address.into(), prefix_len));
        self
    }

    /// Add an IPv6 address
    pub fn ipv6(mut self, address: impl Into<Ipv6Addr>, prefix_len: u8) -> Self {
        self.settings
            .ipv6
            .push(Ipv6Config::new(address.into(), prefix_len));
        self
    }

    /// Set an interface address from CIDR notation (e.g., "198.18.0.1/16")
    pub fn address_cidr(self, cidr: &str) -> Result<Self> {
        let net: IpNet = cidr
            .parse()
            .map_err(|_| Error::InvalidAddress(cidr.to_string()))?;
        Ok(match net {
            IpNet::V4(v4) => self.ipv4(v4.addr(), v4.prefix_len()),
            IpNet::V6(v6) => self.ipv6(v6.addr(), v6.prefix_len()),
        })
    }

    /// Route a network through the tunnel
    pub fn route(mut self, net: IpNet) -> Self {
        self.settings.routes.push(net);
        self
    }

    /// Route all IPv4 and IPv6 traffic through the tunnel
    pub fn route_all(self) -> Self {
        self.route(IpNet::V4(ipnet::Ipv4Net::default()))
            .route(IpNet::V6(ipnet::Ipv6Net::default()))
    }

    /// Add a DNS server
    pub fn dns(mut self, server: IpAddr) -> Self {
        self.settings.dns.push(server);
        self
    }

    /// Set the MTU
    pub fn mtu(mut self, mtu: u16) -> Self {
        self.settings.mtu = mtu;
        self
    }

    /// Build and validate the settings
    pub fn build(self) -> Result<NetworkSettings> {
        self.settings.validate()?;
        Ok(self.settings)
    }
}
