//! Session services
//!
//! The state machine drives either kind of session through
//! [`SessionService`]:
//!
//! - [`ProxyOnlySession`]: engine only, clients use the local proxy ports
//! - [`TunnelSession`]: engine, virtual interface, relay and handoff
//!
//! `start` either brings everything up or leaves nothing running.

use crate::cancel::CancelToken;
use crate::config::{ConnectionMode, ManagerSettings, SessionConfig};
use crate::engine::EngineController;
use crate::handoff::{DescriptorSender, HandoffChannel};
use crate::interface::{InterfaceError, InterfaceProvider, TunInterface};
use crate::relay::{ExitNotifier, RelayExit, RelaySpec, RelaySupervisor, RestartDecision};
use crate::route;
use crate::session::SessionError;
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of handling a relay exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayRecovery {
    /// Exit was requested, stale, or there is no relay
    Ignored,
    /// A new relay is attached to the interface
    Relaunched { pid: u32 },
}

/// One kind of session.
pub trait SessionService: Send {
    fn kind(&self) -> ConnectionMode;

    /// Bring the session up, replacing whatever runs.
    ///
    /// On error everything started so far has been torn down again.
    fn start(
        &mut self,
        config: &SessionConfig,
        cancel: &CancelToken,
        relay_exits: ExitNotifier,
    ) -> Result<(), SessionError>;

    /// Tear everything down: relay, engine, interface.
    fn stop(&mut self);

    /// Keep a socket out of the tunnel.
    fn protect(&self, fd: BorrowedFd<'_>) -> Result<(), InterfaceError>;

    /// React to an unexpected relay exit.
    fn on_relay_exit(&mut self, _exit: &RelayExit, _cancel: &CancelToken) -> Result<RelayRecovery, SessionError> {
        Ok(RelayRecovery::Ignored)
    }

    /// Pid of the live relay
    fn relay_pid(&self) -> Option<u32> {
        None
    }
}

/// Engine only.
pub struct ProxyOnlySession {
    engine: EngineController,
}

impl ProxyOnlySession {
    pub fn new(engine: EngineController) -> Self {
        Self { engine }
    }
}

impl SessionService for ProxyOnlySession {
    fn kind(&self) -> ConnectionMode {
        ConnectionMode::ProxyOnly
    }

    fn start(
        &mut self,
        config: &SessionConfig,
        cancel: &CancelToken,
        _relay_exits: ExitNotifier,
    ) -> Result<(), SessionError> {
        self.engine.start(config)?;
        if cancel.is_cancelled() {
            self.stop();
            return Err(SessionError::Cancelled);
        }
        info!("proxy available at {}", config.proxy_url());
        Ok(())
    }

    fn stop(&mut self) {
        if let Err(e) = self.engine.stop() {
            warn!("engine stop failed: {}", e);
        }
    }

    /// Nothing is captured, so nothing needs protecting.
    fn protect(&self, _fd: BorrowedFd<'_>) -> Result<(), InterfaceError> {
        Ok(())
    }
}

/// Engine + virtual interface + relay.
pub struct TunnelSession {
    settings: ManagerSettings,
    engine: EngineController,
    provider: Arc<dyn InterfaceProvider>,
    sender: Arc<dyn DescriptorSender>,
    interface: Option<TunInterface>,
    relay: Option<RelaySupervisor>,
}

impl TunnelSession {
    pub fn new(
        settings: ManagerSettings,
        engine: EngineController,
        provider: Arc<dyn InterfaceProvider>,
        sender: Arc<dyn DescriptorSender>,
    ) -> Self {
        Self {
            settings,
            engine,
            provider,
            sender,
            interface: None,
            relay: None,
        }
    }

    fn is_held(&self) -> bool {
        self.interface.is_some() || self.relay.is_some() || self.engine.is_running()
    }

    fn bring_up(
        &mut self,
        config: &SessionConfig,
        cancel: &CancelToken,
        relay_exits: ExitNotifier,
    ) -> Result<(), SessionError> {
        let marked;
        let config = match self.provider.socket_mark() {
            Some(mark) => {
                marked = config.clone().with_socket_mark(mark)?;
                &marked
            }
            None => config,
        };
        self.engine.start(config)?;
        checkpoint(cancel)?;

        let plan = route::build(config);
        // The previous handle is gone before a new one is requested
        debug_assert!(self.interface.is_none());
        let interface = self.provider.establish(&plan)?;
        info!(name = interface.name(), "interface up");
        let interface = self.interface.insert(interface);
        checkpoint(cancel)?;

        // Holds the relay's handoff socket
        std::fs::create_dir_all(&self.settings.work_dir)?;
        let mut relay = RelaySupervisor::new(
            RelaySpec::for_session(config, &self.settings),
            HandoffChannel::new(self.sender.clone(), self.settings.handoff_policy()),
            self.settings.restart_policy(),
            self.settings.terminate_grace(),
            relay_exits,
        );
        let started = relay.start(interface.as_fd(), cancel);
        self.relay = Some(relay);
        let pid = started?;
        checkpoint(cancel)?;

        info!(pid, "relay attached to {}", interface.name());
        Ok(())
    }
}

fn checkpoint(cancel: &CancelToken) -> Result<(), SessionError> {
    if cancel.is_cancelled() {
        Err(SessionError::Cancelled)
    } else {
        Ok(())
    }
}

impl SessionService for TunnelSession {
    fn kind(&self) -> ConnectionMode {
        ConnectionMode::VpnTun
    }

    fn start(
        &mut self,
        config: &SessionConfig,
        cancel: &CancelToken,
        relay_exits: ExitNotifier,
    ) -> Result<(), SessionError> {
        if self.is_held() {
            debug!("replacing running tunnel");
            self.stop();
        }

        let result = self.bring_up(config, cancel, relay_exits);
        if let Err(e) = &result {
            debug!("rolling back tunnel start: {}", e);
            self.stop();
        }
        result
    }

    fn stop(&mut self) {
        if let Some(mut relay) = self.relay.take() {
            relay.terminate();
        }
        if let Err(e) = self.engine.stop() {
            warn!("engine stop failed: {}", e);
        }
        if let Some(interface) = self.interface.take() {
            interface.close();
        }
    }

    fn protect(&self, fd: BorrowedFd<'_>) -> Result<(), InterfaceError> {
        self.provider.protect(fd)
    }

    fn on_relay_exit(&mut self, exit: &RelayExit, cancel: &CancelToken) -> Result<RelayRecovery, SessionError> {
        let (Some(relay), Some(interface)) = (self.relay.as_mut(), self.interface.as_ref()) else {
            return Ok(RelayRecovery::Ignored);
        };

        match relay.on_exit(exit) {
            RestartDecision::Ignore => Ok(RelayRecovery::Ignored),
            RestartDecision::GiveUp { failures } => Err(SessionError::RelayCrashLoop { failures }),
            RestartDecision::Relaunch => {
                info!(pid = exit.pid, code = ?exit.code, "relaunching relay");
                let pid = relay.start(interface.as_fd(), cancel)?;
                Ok(RelayRecovery::Relaunched { pid })
            }
        }
    }

    fn relay_pid(&self) -> Option<u32> {
        self.relay.as_ref().and_then(RelaySupervisor::pid)
    }
}

impl Drop for TunnelSession {
    fn drop(&mut self) {
        if self.is_held() {
            self.stop();
        }
    }
}
