//! Default route management
//!
//! The gateway only ever manipulates one route: the IPv4 default route. It is
//! replaced wholesale on every tunnel edge: every existing default route is
//! flushed, then the new one is installed with `ip route replace`.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use ipnet::{IpNet, Ipv4Net};

use crate::command::{args, CommandRunner};
use crate::error::{Error, Result};

/// Path to the `ip` binary
pub const IP_BINARY: &str = "/sbin/ip";

/// A network route entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Destination network (CIDR notation internally)
    pub destination: IpNet,
    /// Gateway address (None for direct/interface routes)
    pub gateway: Option<IpAddr>,
    /// Interface name
    pub interface: Option<String>,
}

impl Route {
    /// Create a default route (0.0.0.0/0) via a gateway
    pub fn default_via(gateway: IpAddr) -> Self {
        Self {
            destination: IpNet::V4(Ipv4Net::default()),
            gateway: Some(gateway),
            interface: None,
        }
    }

    /// Parse a gateway string and build a default route through it
    pub fn default_via_str(gateway: &str) -> Result<Self> {
        let gateway: IpAddr = gateway
            .trim()
            .parse()
            .map_err(|_| Error::InvalidAddress(gateway.to_string()))?;
        Ok(Self::default_via(gateway))
    }

    /// Set the interface for this route
    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    /// Check if this is a default route
    pub fn is_default(&self) -> bool {
        self.destination.prefix_len() == 0
    }

    /// Arguments for `ip route replace`
    fn replace_args(&self) -> Vec<String> {
        let mut out = args(["route", "replace"]);
        if self.is_default() {
            out.push("default".to_string());
        } else {
            out.push(self.destination.to_string());
        }
        if let Some(gw) = self.gateway {
            out.push("via".to_string());
            out.push(gw.to_string());
        }
        if let Some(ref iface) = self.interface {
            out.push("dev".to_string());
            out.push(iface.clone());
        }
        out
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_default() {
            write!(f, "default")?;
        } else {
            write!(f, "{}", self.destination)?;
        }
        if let Some(ref gw) = self.gateway {
            write!(f, " via {}", gw)?;
        }
        if let Some(ref iface) = self.interface {
            write!(f, " dev {}", iface)?;
        }
        Ok(())
    }
}

/// Route manager backed by the `ip` command
pub struct RouteManager {
    runner: Arc<dyn CommandRunner>,
    ip: String,
}

impl RouteManager {
    /// Create a new route manager
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            ip: IP_BINARY.to_string(),
        }
    }

    /// Override the `ip` binary path
    pub fn with_binary(mut self, ip: impl Into<String>) -> Self {
        self.ip = ip.into();
        self
    }

    /// Make `route` the only IPv4 default route
    ///
    /// All default routes are flushed first, whatever their metric or device.
    /// A failed flush is logged; the install step must succeed.
    pub async fn replace_default(&self, route: &Route) -> Result<()> {
        if !route.is_default() {
            return Err(Error::Route(format!("{} is not a default route", route)));
        }

        if let Err(e) = self
            .runner
            .run(&self.ip, &args(["-4", "route", "flush", "exact", "0.0.0.0/0"]))
            .await
        {
            log::warn!("Failed to flush default routes: {}", e);
        }

        self.runner
            .run(&self.ip, &route.replace_args())
            .await
            .map_err(|e| Error::Route(format!("failed to install {}: {}", route, e)))?;

        log::info!("Default route set: {}", route);
        Ok(())
    }

    /// Read the gateway of the current IPv4 default route, if any
    pub async fn default_gateway(&self) -> Result<Option<Ipv4Addr>> {
        let output = self.runner.run(&self.ip, &args(["route"])).await?;
        Ok(parse_default_gateway(&output))
    }
}

/// Extract the gateway from the `default via X ...` line of `ip route` output
pub fn parse_default_gateway(output: &str) -> Option<Ipv4Addr> {
    output.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some("default"), Some("via"), Some(gw)) => gw.parse().ok(),
            _ => None,
        }
    })
}
