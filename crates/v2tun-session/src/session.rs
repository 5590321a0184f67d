//! Tunnel Session State Machine
//!
//! One actor thread owns the session: the state, the interface handle and
//! the relay. Everything else talks to it through a channel.
//!
//! ```text
//!   SessionHandle ──Command──▶ ┌──────────────┐ ──SessionEvent──▶ host
//!   relay watcher ──Exited───▶ │ session actor │
//!                              └──────┬───────┘
//!                                     │ drives
//!                       SessionService (ProxyOnly | Tunnel)
//! ```
//!
//! | State | Command | Next |
//! |---|---|---|
//! | Disconnected, Failed | Start | Connecting, then Connected or Failed |
//! | Connected | Start | full stop, then as above |
//! | Connected | Stop, Revoke | Disconnecting, then Disconnected |
//! | Disconnected | Stop, Revoke | unchanged |
//! | Failed | Stop, Revoke | Disconnected |
//! | Connected | MeasureDelay | unchanged, delay published |
//! | other | MeasureDelay | unchanged, `-1` published |
//! | Disconnected, Failed | SetMode | unchanged, mode switched |
//!
//! `Start`, `Stop` and `Revoke` bump a generation counter as they are
//! queued. An in-flight start that sees the bump unwinds and the session
//! lands in `Disconnected`.

use crate::cancel::CancelToken;
use crate::config::{ConfigError, ConnectionMode, ManagerSettings, SessionConfig};
use crate::engine::{EngineController, EngineError, ProxyEngine};
use crate::handoff::{DescriptorSender, HandoffError, UnixDescriptorSender};
use crate::interface::{InterfaceError, InterfaceProvider};
use crate::message::{Command, DELAY_UNKNOWN, SessionEvent, SessionState, StateCell};
use crate::relay::{ExitNotifier, RelayError, RelayExit};
use crate::service::{ProxyOnlySession, RelayRecovery, SessionService, TunnelSession};
use crate::stats::{StatsReporter, TrafficSource};
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::os::fd::BorrowedFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Error taxonomy reported with failed sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed configuration
    ConfigInvalid,
    /// Privilege denied or the interface could not be established
    InterfaceUnavailable,
    /// The relay never accepted the descriptor
    HandoffUnreachable,
    /// The relay died and could not be brought back
    RelayCrashed,
    /// The engine refused to start
    EngineStartFailed,
    /// A bounded operation ran out of time
    Timeout,
    /// Superseded by a newer command
    Cancelled,
    /// The session actor is gone
    Shutdown,
}

/// Session errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Interface error: {0}")]
    Interface(#[from] InterfaceError),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("Relay exited {failures} times within the restart window")]
    RelayCrashLoop { failures: u32 },

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Superseded by a newer command")]
    Cancelled,

    #[error("Session manager has shut down")]
    Shutdown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Config(_) => ErrorKind::ConfigInvalid,
            SessionError::Interface(_) | SessionError::Io(_) => ErrorKind::InterfaceUnavailable,
            SessionError::Relay(RelayError::Handoff(HandoffError::Cancelled)) => ErrorKind::Cancelled,
            SessionError::Relay(RelayError::Handoff(_)) => ErrorKind::HandoffUnreachable,
            SessionError::Relay(_) | SessionError::RelayCrashLoop { .. } => ErrorKind::RelayCrashed,
            SessionError::Engine(EngineError::Timeout) => ErrorKind::Timeout,
            SessionError::Engine(_) => ErrorKind::EngineStartFailed,
            SessionError::Cancelled => ErrorKind::Cancelled,
            SessionError::Shutdown => ErrorKind::Shutdown,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }
}

enum Envelope {
    Command { command: Command, generation: u64 },
    RelayExited { exit: RelayExit, generation: u64 },
    Shutdown,
}

/// Builds the session actor from its collaborators.
pub struct SessionManager {
    settings: ManagerSettings,
    engine: Arc<dyn ProxyEngine>,
    provider: Arc<dyn InterfaceProvider>,
    sender: Arc<dyn DescriptorSender>,
}

impl SessionManager {
    pub fn new(
        settings: ManagerSettings,
        engine: Arc<dyn ProxyEngine>,
        provider: Arc<dyn InterfaceProvider>,
    ) -> Self {
        Self {
            settings,
            engine,
            provider,
            sender: Arc::new(UnixDescriptorSender),
        }
    }

    /// Replace the Unix-socket descriptor transport.
    pub fn with_descriptor_sender(mut self, sender: Arc<dyn DescriptorSender>) -> Self {
        self.sender = sender;
        self
    }

    /// Start the actor thread.
    pub fn spawn(self) -> Result<SessionHandle, SessionError> {
        self.settings.validate()?;

        let (commands, inbox) = unbounded();
        let (events_tx, events) = unbounded();
        let state = StateCell::new(SessionState::Disconnected);
        let generation = Arc::new(AtomicU64::new(0));
        let mode = Arc::new(Mutex::new(self.settings.mode));

        let engine = EngineController::new(
            self.engine,
            self.settings.delay_url.clone(),
            self.settings.delay_timeout(),
        );
        let actor = SessionActor {
            tunnel: TunnelSession::new(
                self.settings.clone(),
                engine.clone(),
                self.provider.clone(),
                self.sender,
            ),
            proxy: ProxyOnlySession::new(engine.clone()),
            engine,
            mode: mode.clone(),
            state: state.clone(),
            events: events_tx,
            generation: generation.clone(),
            inbox: commands.clone(),
            running_generation: None,
            reporter: None,
            settings: self.settings,
        };

        let thread = thread::Builder::new()
            .name("session-actor".to_string())
            .spawn(move || actor.run(inbox))?;

        info!("session manager started");
        Ok(SessionHandle {
            commands,
            events,
            state,
            generation,
            mode,
            provider: self.provider,
            thread: Some(thread),
        })
    }
}

/// Host-side handle to a running session manager.
pub struct SessionHandle {
    commands: Sender<Envelope>,
    events: Receiver<SessionEvent>,
    state: StateCell,
    generation: Arc<AtomicU64>,
    mode: Arc<Mutex<ConnectionMode>>,
    provider: Arc<dyn InterfaceProvider>,
    thread: Option<JoinHandle<()>>,
}

impl SessionHandle {
    /// Queue a command.
    pub fn send(&self, command: Command) -> Result<(), SessionError> {
        let generation = if command.supersedes() {
            self.generation.fetch_add(1, Ordering::SeqCst) + 1
        } else {
            self.generation.load(Ordering::SeqCst)
        };
        debug!(command = command.name(), generation, "queueing command");
        self.commands
            .send(Envelope::Command { command, generation })
            .map_err(|_| SessionError::Shutdown)
    }

    pub fn start(&self, config: SessionConfig) -> Result<(), SessionError> {
        self.send(Command::Start(Box::new(config)))
    }

    pub fn stop(&self) -> Result<(), SessionError> {
        self.send(Command::Stop)
    }

    pub fn measure_delay(&self) -> Result<(), SessionError> {
        self.send(Command::MeasureDelay)
    }

    pub fn set_mode(&self, mode: ConnectionMode) -> Result<(), SessionError> {
        self.send(Command::SetMode(mode))
    }

    /// The host withdrew tunnel privilege.
    pub fn revoke(&self) -> Result<(), SessionError> {
        self.send(Command::Revoke)
    }

    /// Current state snapshot
    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn mode(&self) -> ConnectionMode {
        *self.mode.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// State changes, delay results and status reports
    pub fn events(&self) -> &Receiver<SessionEvent> {
        &self.events
    }

    /// Keep a socket out of the tunnel; a no-op in proxy-only mode.
    pub fn protect(&self, fd: BorrowedFd<'_>) -> Result<(), SessionError> {
        match self.mode() {
            ConnectionMode::VpnTun => Ok(self.provider.protect(fd)?),
            ConnectionMode::ProxyOnly => Ok(()),
        }
    }

    /// Stop the session and join the actor.
    pub fn shutdown(mut self) {
        self.close();
    }

    fn close(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.stop();
            let _ = self.commands.send(Envelope::Shutdown);
            if thread.join().is_err() {
                error!("session actor panicked");
            }
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

struct SessionActor {
    settings: ManagerSettings,
    tunnel: TunnelSession,
    proxy: ProxyOnlySession,
    engine: EngineController,
    mode: Arc<Mutex<ConnectionMode>>,
    state: StateCell,
    events: Sender<SessionEvent>,
    generation: Arc<AtomicU64>,
    /// Own inbox, for relay watchers
    inbox: Sender<Envelope>,
    /// Generation of the session that is up
    running_generation: Option<u64>,
    reporter: Option<StatsReporter>,
}

impl SessionActor {
    fn run(mut self, inbox: Receiver<Envelope>) {
        for envelope in inbox.iter() {
            match envelope {
                Envelope::Command { command, generation } => self.handle(command, generation),
                Envelope::RelayExited { exit, generation } => self.on_relay_exit(exit, generation),
                Envelope::Shutdown => break,
            }
        }
        self.teardown();
        debug!("session actor stopped");
    }

    fn handle(&mut self, command: Command, generation: u64) {
        if command.supersedes() && generation != self.generation.load(Ordering::SeqCst) {
            debug!(command = command.name(), generation, "superseded, skipping");
            return;
        }

        match command {
            Command::Start(config) => self.start(*config, generation),
            Command::Stop => self.stop(),
            Command::Revoke => {
                info!("tunnel privilege revoked");
                self.stop();
            }
            Command::MeasureDelay => self.measure_delay(),
            Command::SetMode(mode) => self.set_mode(mode),
        }
    }

    fn service(&mut self) -> &mut dyn SessionService {
        match self.current_mode() {
            ConnectionMode::VpnTun => &mut self.tunnel,
            ConnectionMode::ProxyOnly => &mut self.proxy,
        }
    }

    fn current_mode(&self) -> ConnectionMode {
        *self.mode.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn transition(&mut self, next: SessionState) {
        let previous = self.state.get();
        if previous == next {
            return;
        }
        self.state.set(next);
        info!("session {} -> {}", previous, next);
        let _ = self.events.send(SessionEvent::StateChanged(next));
    }

    fn start(&mut self, config: SessionConfig, generation: u64) {
        if self.state.get().is_active() {
            info!("restarting session");
            self.teardown();
        }

        self.transition(SessionState::Connecting);
        let cancel = CancelToken::new(self.generation.clone(), generation);
        let relay_exits = self.relay_notifier(generation);

        match self.service().start(&config, &cancel, relay_exits) {
            Ok(()) => {
                self.running_generation = Some(generation);
                self.transition(SessionState::Connected);
                self.spawn_reporter();
                info!(label = %config.label, mode = %self.current_mode(), "session connected");
            }
            Err(e) if e.is_cancelled() => {
                info!("start cancelled");
                self.transition(SessionState::Disconnected);
            }
            Err(e) => {
                error!(kind = ?e.kind(), "session start failed: {}", e);
                self.transition(SessionState::Failed);
            }
        }
    }

    fn stop(&mut self) {
        match self.state.get() {
            SessionState::Disconnected => debug!("stop while disconnected"),
            SessionState::Failed => self.transition(SessionState::Disconnected),
            _ => {
                self.transition(SessionState::Disconnecting);
                self.teardown();
                self.transition(SessionState::Disconnected);
            }
        }
    }

    /// Stop reporting and tear the active service down.
    fn teardown(&mut self) {
        if let Some(reporter) = self.reporter.take() {
            reporter.stop();
        }
        if self.running_generation.take().is_some() {
            self.service().stop();
        }
    }

    fn measure_delay(&mut self) {
        if !self.state.get().is_connected() {
            let _ = self.events.send(SessionEvent::DelayMeasured(DELAY_UNKNOWN));
            return;
        }

        let engine = self.engine.clone();
        let events = self.events.clone();
        let spawned = thread::Builder::new()
            .name("session-delay".to_string())
            .spawn(move || {
                let delay = engine.delay_or_unknown();
                info!(delay, "delay measured");
                let _ = events.send(SessionEvent::DelayMeasured(delay));
            });
        if let Err(e) = spawned {
            warn!("could not spawn delay probe: {}", e);
            let _ = self.events.send(SessionEvent::DelayMeasured(DELAY_UNKNOWN));
        }
    }

    fn set_mode(&mut self, mode: ConnectionMode) {
        match self.state.get() {
            SessionState::Disconnected | SessionState::Failed => {
                *self.mode.lock().unwrap_or_else(|p| p.into_inner()) = mode;
                info!("connection mode set to {}", mode);
            }
            state => warn!("ignoring mode change to {} while {}", mode, state),
        }
    }

    /// Forward relay exits of this generation, after the restart pause.
    fn relay_notifier(&self, generation: u64) -> ExitNotifier {
        let inbox = self.inbox.clone();
        let current = self.generation.clone();
        let min_delay = self.settings.restart_policy().min_delay;

        Arc::new(move |exit: RelayExit| {
            if exit.requested {
                return;
            }
            // A stop during the pause drops the exit
            if !CancelToken::new(current.clone(), generation).sleep(min_delay) {
                return;
            }
            let _ = inbox.send(Envelope::RelayExited { exit, generation });
        })
    }

    fn on_relay_exit(&mut self, exit: RelayExit, generation: u64) {
        if self.running_generation != Some(generation) || !self.state.get().is_connected() {
            debug!(pid = exit.pid, "relay exit from an inactive session");
            return;
        }

        let cancel = CancelToken::new(self.generation.clone(), generation);
        match self.service().on_relay_exit(&exit, &cancel) {
            Ok(RelayRecovery::Relaunched { pid }) => info!(pid, "relay relaunched"),
            Ok(RelayRecovery::Ignored) => {}
            Err(e) if e.is_cancelled() => debug!("relaunch cancelled"),
            Err(e) => {
                error!(kind = ?e.kind(), "relay recovery failed: {}", e);
                self.teardown();
                self.transition(SessionState::Failed);
            }
        }
    }

    fn spawn_reporter(&mut self) {
        let engine = self.engine.clone();
        let traffic: TrafficSource = Arc::new(move || engine.traffic());
        match StatsReporter::spawn(
            self.settings.stats_interval(),
            self.state.clone(),
            traffic,
            self.events.clone(),
        ) {
            Ok(reporter) => self.reporter = Some(reporter),
            Err(e) => warn!("status reporting disabled: {}", e),
        }
    }
}

/// Wait for `state` on `events`, skipping everything else.
///
/// Returns the states seen on the way.
pub fn wait_for_state(
    events: &Receiver<SessionEvent>,
    state: SessionState,
    timeout: Duration,
) -> Option<Vec<SessionState>> {
    let deadline = std::time::Instant::now() + timeout;
    let mut seen = Vec::new();
    loop {
        let remaining = deadline.checked_duration_since(std::time::Instant::now())?;
        match events.recv_timeout(remaining) {
            Ok(SessionEvent::StateChanged(next)) => {
                seen.push(next);
                if next == state {
                    return Some(seen);
                }
            }
            Ok(_) => {}
            Err(_) => return None,
        }
    }
}
