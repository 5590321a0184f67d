//! v2tun session - Tunnel Session Manager
//!
//! Turns a proxy-engine configuration into a running virtual interface:
//! the engine serves a local SOCKS inbound, a packet relay (tun2socks)
//! translates interface packets into SOCKS connections, and the interface
//! descriptor reaches the relay over a Unix socket.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                        Host process                            │
//! │                                                                │
//! │  SessionHandle ──▶ session actor ──▶ TunnelSession             │
//! │                          │              │       │        │     │
//! │                          │         RoutePlan  Relay   Engine   │
//! │                          ▼              │    Supervisor  │     │
//! │                    SessionEvent         ▼       │        │     │
//! │                                    /dev/net/tun │        │     │
//! └──────────────────────────────────────────│─────│────────│─────┘
//!                                            │ fd  ▼        ▼
//!                                     ┌──────┴───────┐  ┌────────┐
//!                                     │  tun2socks   │─▶│ engine │─▶ upstream
//!                                     │ (sock_path)  │  │ :10808 │
//!                                     └──────────────┘  └────────┘
//! ```
//!
//! # Threads
//!
//! - `session-actor`: the only writer of session state, interface and relay
//! - `relay-watcher-<pid>`: blocks on the relay, reports its exit
//! - `relay-handoff`: descriptor handoff with exponential backoff
//! - `session-stats`, `session-delay`: reporting, never mutate state

mod cancel;
mod config;
mod engine;
mod handoff;
mod interface;
mod message;
mod probe;
mod relay;
mod route;
mod service;
mod session;
mod stats;
#[cfg(target_os = "linux")]
mod tun;

pub use cancel::CancelToken;
pub use config::{
    ConfigError, ConnectionMode, ManagerSettings, ServerEndpoint, SessionConfig,
    DEFAULT_HTTP_PORT, DEFAULT_LABEL, DEFAULT_SOCKS_PORT, STATS_API_PORT, STATS_API_TAG,
};
pub use engine::{EngineController, EngineError, ProcessEngine, ProxyEngine};
pub use handoff::{
    BackoffPolicy, DescriptorSender, HandoffChannel, HandoffError, UnixDescriptorSender,
    HANDOFF_BYTE,
};
pub use interface::{InterfaceError, InterfaceProvider, TunInterface};
pub use message::{Command, SessionEvent, SessionState, StateCell, DELAY_UNKNOWN};
pub use probe::ProbeError;
pub use relay::{
    ExitNotifier, RelayArgs, RelayError, RelayExit, RelayProcess, RelaySpec, RelaySupervisor,
    RestartDecision, RestartPolicy, RestartTracker,
};
pub use route::{
    Route, RoutePlan, INTERFACE_ADDRESS, INTERFACE_PREFIX, RELAY_ADDRESS, RELAY_NETMASK,
    TUNNEL_MTU,
};
pub use service::{ProxyOnlySession, RelayRecovery, SessionService, TunnelSession};
pub use session::{wait_for_state, ErrorKind, SessionError, SessionHandle, SessionManager};
pub use stats::{
    format_duration, SpeedMeter, StatsReporter, StatusReport, TrafficCounters, TrafficSource,
};
#[cfg(target_os = "linux")]
pub use tun::{LinuxTunProvider, BYPASS_MARK, ROUTE_TABLE};

/// Route plan construction
pub mod plan {
    pub use crate::route::{build, extract_dns_servers, parse_dns_host, parse_subnets, strip_port};
}

/// Delay measurement through a local SOCKS5 inbound
pub mod delay {
    pub use crate::probe::{measure, measure_blocking, parse_url};
}
