//! Commands from the host and events published back to it.

use crate::config::{ConnectionMode, SessionConfig};
use crate::stats::StatusReport;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

/// Delay value published when no measurement could be taken.
pub const DELAY_UNKNOWN: i64 = -1;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No session is running
    Disconnected,
    /// Start sequence in progress
    Connecting,
    /// Interface, relay and engine are all up
    Connected,
    /// Teardown in progress
    Disconnecting,
    /// The last start failed or the session broke down
    Failed,
}

impl SessionState {
    /// Check if the session is usable
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected)
    }

    /// Check if a session is starting or running
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Connected)
    }

    /// Wire name used by hosts
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "DISCONNECTED",
            SessionState::Connecting => "CONNECTING",
            SessionState::Connected => "CONNECTED",
            SessionState::Disconnecting => "DISCONNECTING",
            SessionState::Failed => "FAILED",
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            SessionState::Disconnected => 0,
            SessionState::Connecting => 1,
            SessionState::Connected => 2,
            SessionState::Disconnecting => 3,
            SessionState::Failed => 4,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => SessionState::Connecting,
            2 => SessionState::Connected,
            3 => SessionState::Disconnecting,
            4 => SessionState::Failed,
            _ => SessionState::Disconnected,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single authoritative copy of the session state.
///
/// Only the state machine thread writes; everyone else takes snapshots.
#[derive(Debug, Clone)]
pub struct StateCell {
    inner: Arc<AtomicU8>,
}

impl StateCell {
    pub fn new(state: SessionState) -> Self {
        Self {
            inner: Arc::new(AtomicU8::new(state.to_u8())),
        }
    }

    /// Current state snapshot
    pub fn get(&self) -> SessionState {
        SessionState::from_u8(self.inner.load(Ordering::SeqCst))
    }

    pub(crate) fn set(&self, state: SessionState) {
        self.inner.store(state.to_u8(), Ordering::SeqCst);
    }
}

/// Commands accepted from the host.
#[derive(Debug, Clone)]
pub enum Command {
    /// Start (or restart) a session with this configuration
    Start(Box<SessionConfig>),
    /// Stop the running session
    Stop,
    /// Measure the delay of the connected server
    MeasureDelay,
    /// Switch between full tunnel and proxy-only; ignored unless disconnected
    SetMode(ConnectionMode),
    /// The host withdrew tunnel privilege
    Revoke,
}

impl Command {
    /// Does this command supersede any in-flight start?
    pub(crate) fn supersedes(&self) -> bool {
        matches!(self, Command::Start(_) | Command::Stop | Command::Revoke)
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            Command::Start(_) => "START_SERVICE",
            Command::Stop => "STOP_SERVICE",
            Command::MeasureDelay => "MEASURE_DELAY",
            Command::SetMode(_) => "SET_MODE",
            Command::Revoke => "REVOKE",
        }
    }
}

/// Notifications published to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The session moved to a new state
    StateChanged(SessionState),
    /// Result of a delay measurement in milliseconds, `-1` on failure
    DelayMeasured(i64),
    /// Periodic report while connected
    Status(StatusReport),
}
