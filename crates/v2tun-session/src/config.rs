//! Session and manager configuration
//!
//! [`SessionConfig`] is built once per session from the proxy engine's JSON
//! payload and never mutated afterwards; a new session replaces it wholesale.
//! [`ManagerSettings`] holds the host-level knobs and is loaded from TOML.

use crate::handoff::BackoffPolicy;
use crate::relay::RestartPolicy;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Local SOCKS inbound port when the payload declares none
pub const DEFAULT_SOCKS_PORT: u16 = 10808;

/// Local HTTP inbound port when the payload declares none
pub const DEFAULT_HTTP_PORT: u16 = 10809;

/// Loopback port of the engine's stats API when the payload declares none
pub const STATS_API_PORT: u16 = 10853;

/// Inbound and outbound tag of the engine's stats API
pub const STATS_API_TAG: &str = "api";

/// Interface session label when the host gives none
pub const DEFAULT_LABEL: &str = "Secure Tunnel";

/// Upstream server the engine connects to (display only)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEndpoint {
    pub address: String,
    pub port: u16,
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Immutable configuration of one session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Display label, also used as the interface session name
    pub label: String,
    /// Full engine configuration, forwarded verbatim to the engine
    pub engine_config: String,
    /// Local SOCKS listening port of the engine
    pub socks_port: u16,
    /// Local HTTP listening port of the engine
    pub http_port: u16,
    /// CIDR subnets routed through the tunnel; empty routes everything
    pub bypass_subnets: Vec<String>,
    /// Applications excluded from the tunnel
    pub disallowed_apps: BTreeSet<String>,
    /// First upstream server found in the payload
    pub server: Option<ServerEndpoint>,
    /// Whether the payload was rewritten to enable traffic counters
    pub traffic_stats: bool,
    /// Loopback port the engine answers stats queries on
    pub stats_api_port: Option<u16>,
}

impl SessionConfig {
    /// Build a configuration around an engine payload, with traffic statistics enabled.
    pub fn from_engine_json(label: &str, payload: &str) -> Result<Self, ConfigError> {
        Self::parse(label, payload, true)
    }

    /// Build a configuration around an engine payload.
    ///
    /// Inbound ports and the upstream server are read from the payload. With
    /// `traffic_stats` set, any `policy`/`stats` sections are replaced with a
    /// policy that turns on outbound uplink/downlink counters, and a loopback
    /// stats API inbound is added unless the payload already tags one `api`.
    pub fn parse(label: &str, payload: &str, traffic_stats: bool) -> Result<Self, ConfigError> {
        let value: Value = serde_json::from_str(payload)?;
        let mut root = match value {
            Value::Object(map) => map,
            _ => return Err(ConfigError::NotAnObject),
        };

        let socks_port = inbound_port(&root, "socks").unwrap_or(DEFAULT_SOCKS_PORT);
        let http_port = inbound_port(&root, "http").unwrap_or(DEFAULT_HTTP_PORT);
        let server = upstream_server(&root);

        let mut stats_api_port = None;
        if traffic_stats {
            root.remove("policy");
            root.remove("stats");
            root.insert("policy".into(), stats_policy());
            root.insert("stats".into(), Value::Object(Map::new()));
            stats_api_port = Some(enable_stats_api(&mut root));
        }

        let engine_config = serde_json::to_string(&Value::Object(root))?;
        let label = if label.trim().is_empty() {
            DEFAULT_LABEL.to_string()
        } else {
            label.to_string()
        };

        debug!(
            socks_port,
            http_port,
            server = ?server.as_ref().map(ToString::to_string),
            "parsed engine configuration"
        );

        Ok(Self {
            label,
            engine_config,
            socks_port,
            http_port,
            bypass_subnets: Vec::new(),
            disallowed_apps: BTreeSet::new(),
            server,
            traffic_stats,
            stats_api_port,
        })
    }

    /// Stamp `mark` on every outbound socket of the engine.
    ///
    /// Sets `streamSettings.sockopt.mark`, keeping the other socket options.
    pub fn with_socket_mark(mut self, mark: u32) -> Result<Self, ConfigError> {
        let mut root: Value = serde_json::from_str(&self.engine_config)?;
        if let Some(outbounds) = root.get_mut("outbounds").and_then(Value::as_array_mut) {
            for outbound in outbounds.iter_mut().filter_map(Value::as_object_mut) {
                let sockopt = object_entry(object_entry(outbound, "streamSettings"), "sockopt");
                sockopt.insert("mark".into(), Value::from(mark));
            }
        }
        self.engine_config = serde_json::to_string(&root)?;
        debug!(mark, "engine outbounds marked");
        Ok(self)
    }

    /// Route only these subnets through the tunnel
    pub fn with_bypass_subnets<I, S>(mut self, subnets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bypass_subnets = subnets.into_iter().map(Into::into).collect();
        self
    }

    /// Exclude these applications from the tunnel
    pub fn with_disallowed_apps<I, S>(mut self, apps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.disallowed_apps = apps.into_iter().map(Into::into).collect();
        self
    }

    /// Local SOCKS proxy URL
    pub fn proxy_url(&self) -> String {
        format!("socks5://127.0.0.1:{}", self.socks_port)
    }
}

fn inbound_port(root: &Map<String, Value>, protocol: &str) -> Option<u16> {
    root.get("inbounds")?
        .as_array()?
        .iter()
        .filter(|inbound| inbound.get("protocol").and_then(Value::as_str) == Some(protocol))
        .find_map(|inbound| inbound.get("port")?.as_u64())
        .and_then(|port| u16::try_from(port).ok())
}

fn upstream_server(root: &Map<String, Value>) -> Option<ServerEndpoint> {
    let settings = root.get("outbounds")?.as_array()?.first()?.get("settings")?;
    let entry = ["vnext", "servers"]
        .iter()
        .find_map(|key| settings.get(*key)?.as_array()?.first())?;

    let address = entry.get("address")?.as_str()?.to_string();
    let port = entry
        .get("port")
        .and_then(Value::as_u64)
        .and_then(|p| u16::try_from(p).ok())
        .unwrap_or(0);
    Some(ServerEndpoint { address, port })
}

/// `map[key]` as an object, replacing a missing or non-object value.
fn object_entry<'a>(map: &'a mut Map<String, Value>, key: &str) -> &'a mut Map<String, Value> {
    let slot = map
        .entry(key)
        .or_insert_with(|| Value::Object(Map::new()));
    if !slot.is_object() {
        *slot = Value::Object(Map::new());
    }
    match slot {
        Value::Object(inner) => inner,
        _ => unreachable!("slot was just made an object"),
    }
}

/// Turn on the engine's StatsService and return the port it listens on.
///
/// Reuses an inbound already tagged `api`; otherwise adds a loopback
/// dokodemo-door inbound. The routing rule to the API goes first.
fn enable_stats_api(root: &mut Map<String, Value>) -> u16 {
    root.insert(
        "api".into(),
        json!({ "tag": STATS_API_TAG, "services": ["StatsService"] }),
    );

    let inbounds = root
        .entry("inbounds")
        .or_insert_with(|| Value::Array(Vec::new()));
    if !inbounds.is_array() {
        *inbounds = Value::Array(Vec::new());
    }
    let existing = inbounds.as_array().and_then(|list| {
        list.iter()
            .filter(|inbound| inbound.get("tag").and_then(Value::as_str) == Some(STATS_API_TAG))
            .find_map(|inbound| inbound.get("port")?.as_u64())
            .and_then(|port| u16::try_from(port).ok())
    });
    let port = match existing {
        Some(port) => port,
        None => {
            if let Some(list) = inbounds.as_array_mut() {
                list.push(json!({
                    "tag": STATS_API_TAG,
                    "listen": "127.0.0.1",
                    "port": STATS_API_PORT,
                    "protocol": "dokodemo-door",
                    "settings": { "address": "127.0.0.1" }
                }));
            }
            STATS_API_PORT
        }
    };

    let routing = object_entry(root, "routing");
    let rules = routing
        .entry("rules")
        .or_insert_with(|| Value::Array(Vec::new()));
    if !rules.is_array() {
        *rules = Value::Array(Vec::new());
    }
    if let Some(rules) = rules.as_array_mut() {
        let routed = rules.iter().any(|rule| {
            rule.get("inboundTag")
                .and_then(Value::as_array)
                .is_some_and(|tags| tags.iter().any(|tag| tag.as_str() == Some(STATS_API_TAG)))
        });
        if !routed {
            rules.insert(
                0,
                json!({ "type": "field", "inboundTag": [STATS_API_TAG], "outboundTag": STATS_API_TAG }),
            );
        }
    }
    port
}

fn stats_policy() -> Value {
    json!({
        "levels": {
            "8": {
                "connIdle": 300,
                "downlinkOnly": 1,
                "handshake": 4,
                "uplinkOnly": 1
            }
        },
        "system": {
            "statsOutboundUplink": true,
            "statsOutboundDownlink": true
        }
    })
}

/// How the session routes traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    /// Virtual interface + relay + engine
    #[default]
    VpnTun,
    /// Engine only; clients use the local proxy ports directly
    ProxyOnly,
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionMode::VpnTun => f.write_str("VPN_TUN"),
            ConnectionMode::ProxyOnly => f.write_str("PROXY_ONLY"),
        }
    }
}

impl std::str::FromStr for ConnectionMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "vpn_tun" | "tun" | "vpn" => Ok(ConnectionMode::VpnTun),
            "proxy_only" | "proxy" => Ok(ConnectionMode::ProxyOnly),
            _ => Err(ConfigError::InvalidMode(s.to_string())),
        }
    }
}

/// Host-level settings for the session manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerSettings {
    /// Packet relay executable
    pub relay_path: PathBuf,
    /// Arguments placed before the relay's own arguments
    pub relay_args: Vec<String>,
    /// Working directory of the relay and engine (holds the handoff socket)
    pub work_dir: PathBuf,
    /// File name of the handoff socket inside `work_dir`
    pub socket_name: String,
    /// Relay `--loglevel`
    pub relay_log_level: String,
    /// Relay `--enable-udprelay`
    pub enable_udp_relay: bool,
    pub handoff_base_delay_ms: u64,
    pub handoff_max_attempts: u32,
    /// Minimum pause before relaunching an exited relay
    pub restart_min_delay_ms: u64,
    /// Relay exits tolerated within the window; 0 restarts forever
    pub restart_max_failures: u32,
    pub restart_window_secs: u64,
    /// Grace period for relay/engine termination
    pub terminate_grace_ms: u64,
    pub stats_interval_ms: u64,
    pub delay_timeout_ms: u64,
    pub delay_url: String,
    /// Proxy engine executable and arguments preceding the config path
    pub engine_path: PathBuf,
    pub engine_args: Vec<String>,
    pub mode: ConnectionMode,
    /// Name of the virtual interface (Linux)
    pub interface_name: String,
    pub log_level: String,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            relay_path: PathBuf::from("tun2socks"),
            relay_args: Vec::new(),
            work_dir: PathBuf::from("/var/lib/v2tun"),
            socket_name: "sock_path".to_string(),
            relay_log_level: "error".to_string(),
            enable_udp_relay: true,
            handoff_base_delay_ms: 100,
            handoff_max_attempts: 6,
            restart_min_delay_ms: 500,
            restart_max_failures: 5,
            restart_window_secs: 30,
            terminate_grace_ms: 500,
            stats_interval_ms: 1000,
            delay_timeout_ms: 3000,
            delay_url: "http://www.gstatic.com/generate_204".to_string(),
            engine_path: PathBuf::from("xray"),
            engine_args: vec!["run".to_string(), "-c".to_string()],
            mode: ConnectionMode::VpnTun,
            interface_name: "v2tun0".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl ManagerSettings {
    /// Load settings from a TOML file; missing keys keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.display().to_string(), e.to_string()))?;
        let settings: Self = toml::from_str(&text)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.handoff_max_attempts == 0 {
            return Err(ConfigError::Invalid("handoff_max_attempts must be at least 1".into()));
        }
        if self.socket_name.is_empty() || self.socket_name.contains('/') {
            return Err(ConfigError::Invalid(format!(
                "socket_name must be a plain file name, got {:?}",
                self.socket_name
            )));
        }
        if self.stats_interval_ms == 0 {
            return Err(ConfigError::Invalid("stats_interval_ms must be positive".into()));
        }
        Ok(())
    }

    /// Absolute path of the handoff socket
    pub fn socket_path(&self) -> PathBuf {
        self.work_dir.join(&self.socket_name)
    }

    pub fn handoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(self.handoff_base_delay_ms),
            max_attempts: self.handoff_max_attempts,
        }
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            min_delay: Duration::from_millis(self.restart_min_delay_ms),
            max_failures: self.restart_max_failures,
            window: Duration::from_secs(self.restart_window_secs),
        }
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    pub fn delay_timeout(&self) -> Duration {
        Duration::from_millis(self.delay_timeout_ms)
    }
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid engine JSON: {0}")]
    InvalidJson(String),

    #[error("Engine configuration must be a JSON object")]
    NotAnObject,

    #[error("Invalid subnet: {0}")]
    InvalidSubnet(String),

    #[error("Invalid DNS entry: {0}")]
    InvalidDns(String),

    #[error("Unknown connection mode: {0}")]
    InvalidMode(String),

    #[error("Cannot read {0}: {1}")]
    Read(String, String),

    #[error("Invalid settings: {0}")]
    Invalid(String),
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::InvalidJson(e.to_string())
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Invalid(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &str = r#"{
        "inbounds": [
            {"protocol": "http", "port": 20809},
            {"protocol": "socks", "port": 20808}
        ],
        "outbounds": [
            {"protocol": "vless", "settings": {"vnext": [{"address": "edge.example.net", "port": 443}]}}
        ],
        "policy": {"levels": {}},
        "dns": {"servers": ["1.1.1.1"]}
    }"#;

    #[test]
    fn test_inbound_ports_and_server() {
        let config = SessionConfig::from_engine_json("Home", PAYLOAD).unwrap();

        assert_eq!(config.socks_port, 20808);
        assert_eq!(config.http_port, 20809);
        assert_eq!(config.server.as_ref().unwrap().to_string(), "edge.example.net:443");
        assert_eq!(config.proxy_url(), "socks5://127.0.0.1:20808");
    }

    #[test]
    fn test_default_ports_and_label() {
        let config = SessionConfig::parse("  ", "{}", false).unwrap();

        assert_eq!(config.label, DEFAULT_LABEL);
        assert_eq!(config.socks_port, DEFAULT_SOCKS_PORT);
        assert_eq!(config.http_port, DEFAULT_HTTP_PORT);
        assert!(config.server.is_none());
        assert!(config.stats_api_port.is_none());
        assert_eq!(config.engine_config, "{}");
    }

    #[test]
    fn test_stats_policy_injected() {
        let config = SessionConfig::from_engine_json("Home", PAYLOAD).unwrap();
        let value: Value = serde_json::from_str(&config.engine_config).unwrap();

        assert_eq!(value["policy"]["system"]["statsOutboundUplink"], json!(true));
        assert_eq!(value["stats"], json!({}));
        assert_eq!(value["dns"]["servers"][0], json!("1.1.1.1"));
    }

    #[test]
    fn test_stats_api_injected() {
        let config = SessionConfig::from_engine_json("Home", PAYLOAD).unwrap();
        let value: Value = serde_json::from_str(&config.engine_config).unwrap();

        assert_eq!(config.stats_api_port, Some(STATS_API_PORT));
        assert_eq!(value["api"]["services"], json!(["StatsService"]));
        assert_eq!(value["inbounds"][2]["tag"], json!(STATS_API_TAG));
        assert_eq!(value["inbounds"][2]["listen"], json!("127.0.0.1"));
        assert_eq!(value["inbounds"][2]["port"], json!(STATS_API_PORT));
        assert_eq!(value["routing"]["rules"][0]["outboundTag"], json!(STATS_API_TAG));
        // The user-facing inbounds are still found
        assert_eq!(config.socks_port, 20808);
    }

    #[test]
    fn test_stats_api_reuses_tagged_inbound() {
        let payload = r#"{
            "inbounds": [{"tag": "api", "protocol": "dokodemo-door", "port": 10085}],
            "routing": {"rules": [
                {"type": "field", "outboundTag": "direct", "ip": ["geoip:private"]},
                {"type": "field", "inboundTag": ["api"], "outboundTag": "api"}
            ]}
        }"#;
        let config = SessionConfig::from_engine_json("Home", payload).unwrap();
        let value: Value = serde_json::from_str(&config.engine_config).unwrap();

        assert_eq!(config.stats_api_port, Some(10085));
        assert_eq!(value["inbounds"].as_array().unwrap().len(), 1);
        assert_eq!(value["routing"]["rules"].as_array().unwrap().len(), 2);
        assert_eq!(value["routing"]["rules"][0]["outboundTag"], json!("direct"));
    }

    #[test]
    fn test_socket_mark_on_every_outbound() {
        let payload = r#"{
            "outbounds": [
                {"protocol": "vless", "streamSettings": {"network": "ws", "sockopt": {"tcpFastOpen": true}}},
                {"protocol": "freedom", "tag": "direct"},
                {"protocol": "blackhole", "streamSettings": "bogus"}
            ]
        }"#;
        let config = SessionConfig::parse("Home", payload, false)
            .unwrap()
            .with_socket_mark(2626)
            .unwrap();
        let value: Value = serde_json::from_str(&config.engine_config).unwrap();

        for outbound in value["outbounds"].as_array().unwrap() {
            assert_eq!(outbound["streamSettings"]["sockopt"]["mark"], json!(2626));
        }
        assert_eq!(value["outbounds"][0]["streamSettings"]["network"], json!("ws"));
        assert_eq!(value["outbounds"][0]["streamSettings"]["sockopt"]["tcpFastOpen"], json!(true));
        assert_eq!(value["outbounds"][1]["tag"], json!("direct"));
    }

    #[test]
    fn test_socket_mark_without_outbounds() {
        let config = SessionConfig::parse("Home", "{}", false)
            .unwrap()
            .with_socket_mark(2626)
            .unwrap();
        assert_eq!(config.engine_config, "{}");
    }

    #[test]
    fn test_payload_untouched_without_stats() {
        let config = SessionConfig::parse("Home", PAYLOAD, false).unwrap();
        let value: Value = serde_json::from_str(&config.engine_config).unwrap();

        assert_eq!(value["policy"], json!({"levels": {}}));
        assert!(value.get("stats").is_none());
    }

    #[test]
    fn test_invalid_payload() {
        assert!(matches!(
            SessionConfig::from_engine_json("x", "not json"),
            Err(ConfigError::InvalidJson(_))
        ));
        assert!(matches!(
            SessionConfig::from_engine_json("x", "[1, 2]"),
            Err(ConfigError::NotAnObject)
        ));
    }

    #[test]
    fn test_builders() {
        let config = SessionConfig::parse("x", "{}", false)
            .unwrap()
            .with_bypass_subnets(["10.0.0.0/8"])
            .with_disallowed_apps(["com.example.bank", "com.example.bank"]);

        assert_eq!(config.bypass_subnets, vec!["10.0.0.0/8".to_string()]);
        assert_eq!(config.disallowed_apps.len(), 1);
    }

    #[test]
    fn test_connection_mode_parse() {
        assert_eq!("vpn-tun".parse::<ConnectionMode>().unwrap(), ConnectionMode::VpnTun);
        assert_eq!("PROXY_ONLY".parse::<ConnectionMode>().unwrap(), ConnectionMode::ProxyOnly);
        assert!("bridge".parse::<ConnectionMode>().is_err());
    }

    #[test]
    fn test_settings_defaults_from_partial_toml() {
        let settings: ManagerSettings = toml::from_str(
            r#"
            relay_path = "/opt/v2tun/tun2socks"
            mode = "proxy_only"
            handoff_max_attempts = 3
            "#,
        )
        .unwrap();

        assert_eq!(settings.relay_path, PathBuf::from("/opt/v2tun/tun2socks"));
        assert_eq!(settings.mode, ConnectionMode::ProxyOnly);
        assert_eq!(settings.handoff_policy().max_attempts, 3);
        assert_eq!(settings.handoff_policy().base_delay, Duration::from_millis(100));
        assert_eq!(settings.socket_path(), PathBuf::from("/var/lib/v2tun/sock_path"));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_settings_validation() {
        let settings = ManagerSettings {
            socket_name: "nested/sock".into(),
            ..ManagerSettings::default()
        };
        assert!(settings.validate().is_err());

        let settings = ManagerSettings {
            handoff_max_attempts: 0,
            ..ManagerSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_settings_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v2tun.toml");
        std::fs::write(&path, "stats_interval_ms = 250\n").unwrap();

        let settings = ManagerSettings::load(&path).unwrap();
        assert_eq!(settings.stats_interval(), Duration::from_millis(250));

        assert!(ManagerSettings::load(dir.path().join("missing.toml")).is_err());
    }
}
