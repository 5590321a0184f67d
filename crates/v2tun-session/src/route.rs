//! Route Plan Builder
//!
//! Derives the interface parameters for a session: address, MTU, routed
//! subnets, excluded applications and DNS servers. Pure transform over
//! [`SessionConfig`]; malformed subnet or DNS entries are logged and skipped,
//! they never fail the plan.

use crate::config::{ConfigError, SessionConfig};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tracing::{debug, warn};

/// Interface MTU shared with the relay's `--tunmtu`
pub const TUNNEL_MTU: u32 = 1500;

/// Interface-side address of the point-to-point /30
pub const INTERFACE_ADDRESS: Ipv4Addr = Ipv4Addr::new(26, 26, 26, 1);

/// Prefix length of the interface address
pub const INTERFACE_PREFIX: u8 = 30;

/// Relay-side address of the /30 (`--netif-ipaddr`)
pub const RELAY_ADDRESS: Ipv4Addr = Ipv4Addr::new(26, 26, 26, 2);

/// Netmask of the /30 (`--netif-netmask`)
pub const RELAY_NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 252);

/// A routed network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Route {
    pub network: IpAddr,
    pub prefix_len: u8,
}

impl Route {
    /// The all-traffic IPv4 route (0.0.0.0/0)
    pub const fn default_v4() -> Self {
        Self {
            network: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            prefix_len: 0,
        }
    }

    /// Is this a default route?
    pub fn is_default(&self) -> bool {
        self.prefix_len == 0
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

impl std::str::FromStr for Route {
    type Err = ConfigError;

    /// Parse `address/prefixLength`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidSubnet(s.to_string());

        let mut parts = s.trim().split('/');
        let (addr, prefix) = match (parts.next(), parts.next(), parts.next()) {
            (Some(addr), Some(prefix), None) => (addr, prefix),
            _ => return Err(invalid()),
        };

        let network: IpAddr = addr.parse().map_err(|_| invalid())?;
        let prefix_len: u8 = prefix.parse().map_err(|_| invalid())?;
        let max = if network.is_ipv4() { 32 } else { 128 };
        if prefix_len > max {
            return Err(invalid());
        }

        Ok(Self { network, prefix_len })
    }
}

/// Everything the privileged-interface collaborator needs to establish the interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePlan {
    /// Interface session name
    pub session_name: String,
    pub address: IpAddr,
    pub prefix_len: u8,
    pub mtu: u32,
    pub routes: Vec<Route>,
    /// Passed through unvalidated; the interface provider skips unknown ones
    pub disallowed_apps: BTreeSet<String>,
    pub dns_servers: Vec<IpAddr>,
}

impl RoutePlan {
    /// Does the plan capture all traffic?
    pub fn routes_all_traffic(&self) -> bool {
        self.routes.iter().any(Route::is_default)
    }
}

/// Build the route plan for a session.
///
/// Same configuration, same plan.
pub fn build(config: &SessionConfig) -> RoutePlan {
    let routes = if config.bypass_subnets.is_empty() {
        vec![Route::default_v4()]
    } else {
        parse_subnets(&config.bypass_subnets)
    };

    let plan = RoutePlan {
        session_name: config.label.clone(),
        address: IpAddr::V4(INTERFACE_ADDRESS),
        prefix_len: INTERFACE_PREFIX,
        mtu: TUNNEL_MTU,
        routes,
        disallowed_apps: config.disallowed_apps.clone(),
        dns_servers: extract_dns_servers(&config.engine_config),
    };

    debug!(
        routes = plan.routes.len(),
        dns = plan.dns_servers.len(),
        disallowed = plan.disallowed_apps.len(),
        "built route plan"
    );
    plan
}

/// Parse subnet strings, skipping malformed ones.
pub fn parse_subnets(subnets: &[String]) -> Vec<Route> {
    subnets
        .iter()
        .filter_map(|subnet| match subnet.parse::<Route>() {
            Ok(route) => Some(route),
            Err(e) => {
                warn!("Skipping subnet: {}", e);
                None
            }
        })
        .collect()
}

/// Extract DNS servers from the engine payload's `dns.servers` section.
///
/// Entries are either plain strings or objects with an `address` (optionally
/// `host:port`) and a `port`. Only numeric IP literals survive; the port is
/// left to the engine.
pub fn extract_dns_servers(payload: &str) -> Vec<IpAddr> {
    let root: Value = match serde_json::from_str(payload) {
        Ok(root) => root,
        Err(e) => {
            warn!("DNS config: payload is not valid JSON: {}", e);
            return Vec::new();
        }
    };

    let Some(servers) = root.pointer("/dns/servers").and_then(Value::as_array) else {
        debug!("DNS config: no dns.servers section");
        return Vec::new();
    };

    servers
        .iter()
        .filter_map(|entry| match dns_entry(entry) {
            Ok(ip) => Some(ip),
            Err(e) => {
                warn!("DNS config: {}", e);
                None
            }
        })
        .collect()
}

fn dns_entry(entry: &Value) -> Result<IpAddr, ConfigError> {
    match entry {
        Value::String(address) => parse_dns_host(address),
        Value::Object(object) => {
            let address = object
                .get("address")
                .and_then(Value::as_str)
                .ok_or_else(|| ConfigError::InvalidDns(entry.to_string()))?;
            let ip = parse_dns_host(address)?;
            if let Some(port) = object.get("port") {
                debug!("DNS port {} for {} is handled by the engine", port, ip);
            }
            Ok(ip)
        }
        other => Err(ConfigError::InvalidDns(format!("unsupported entry {}", other))),
    }
}

/// Strip an optional port and require a numeric IP literal.
pub fn parse_dns_host(address: &str) -> Result<IpAddr, ConfigError> {
    let host = strip_port(address.trim());
    host.parse()
        .map_err(|_| ConfigError::InvalidDns(address.to_string()))
}

/// `1.1.1.1:53` → `1.1.1.1`, `[2606:4700::1111]:53` → `2606:4700::1111`.
///
/// A leading `tcp://` style scheme is dropped first. Bare IPv6 literals are
/// returned unchanged.
pub fn strip_port(address: &str) -> &str {
    let address = address
        .split_once("://")
        .map_or(address, |(_, rest)| rest.trim_end_matches('/'));
    if address.parse::<IpAddr>().is_ok() {
        return address;
    }
    if let Ok(socket) = address.parse::<SocketAddr>() {
        // Slice the literal back out of the input to stay borrow-only
        let ip = socket.ip().to_string();
        if let Some(start) = address.find(&ip) {
            return &address[start..start + ip.len()];
        }
    }
    if let Some(inner) = address.strip_prefix('[').and_then(|rest| rest.split(']').next()) {
        return inner;
    }
    match address.split_once(':') {
        Some((host, port)) if !port.contains(':') => host,
        _ => address,
    }
}
