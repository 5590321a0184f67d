//! Relay Process Supervisor
//!
//! Runs the packet relay (tun2socks) as a child process, hands it the
//! interface descriptor, and watches it from a dedicated thread.
//!
//! # Restart policy
//!
//! The watcher never restarts anything itself: it reports the exit through
//! an [`ExitNotifier`], and the session decides via [`RelaySupervisor::on_exit`].
//! Relaunching is unconditional while the session lives, except that
//! `max_failures` exits within `window` trip a breaker and fail the session.
//! A `max_failures` of 0 disables the breaker.

use crate::cancel::CancelToken;
use crate::config::{ManagerSettings, SessionConfig};
use crate::handoff::{HandoffChannel, HandoffError};
use crate::route::{RELAY_ADDRESS, RELAY_NETMASK, TUNNEL_MTU};
use crossbeam_channel::{Receiver, bounded};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr};
use std::os::fd::BorrowedFd;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Command-line contract of the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayArgs {
    /// Relay-side address of the interface link
    pub netif_address: Ipv4Addr,
    pub netif_netmask: Ipv4Addr,
    /// Local SOCKS inbound of the engine
    pub socks_server: SocketAddr,
    pub mtu: u32,
    /// Socket path as seen from the relay's working directory
    pub socket_name: String,
    pub enable_udp_relay: bool,
    pub log_level: String,
}

impl RelayArgs {
    /// Arguments for a session
    pub fn for_session(config: &SessionConfig, settings: &ManagerSettings) -> Self {
        Self {
            netif_address: RELAY_ADDRESS,
            netif_netmask: RELAY_NETMASK,
            socks_server: SocketAddr::from((Ipv4Addr::LOCALHOST, config.socks_port)),
            mtu: TUNNEL_MTU,
            socket_name: settings.socket_name.clone(),
            enable_udp_relay: settings.enable_udp_relay,
            log_level: settings.relay_log_level.clone(),
        }
    }

    /// Render as a command line
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "--netif-ipaddr".to_string(),
            self.netif_address.to_string(),
            "--netif-netmask".to_string(),
            self.netif_netmask.to_string(),
            "--socks-server-addr".to_string(),
            self.socks_server.to_string(),
            "--tunmtu".to_string(),
            self.mtu.to_string(),
            "--sock-path".to_string(),
            self.socket_name.clone(),
        ];
        if self.enable_udp_relay {
            args.push("--enable-udprelay".to_string());
        }
        args.push("--loglevel".to_string());
        args.push(self.log_level.clone());
        args
    }
}

/// What to run, with which arguments, and where
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySpec {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub work_dir: PathBuf,
    /// File name of the handoff socket inside `work_dir`
    pub socket_name: String,
}

impl RelaySpec {
    /// The relay invocation for a session
    pub fn for_session(config: &SessionConfig, settings: &ManagerSettings) -> Self {
        let args = RelayArgs::for_session(config, settings);
        Self {
            executable: settings.relay_path.clone(),
            args: settings.relay_args.iter().cloned().chain(args.to_args()).collect(),
            work_dir: settings.work_dir.clone(),
            socket_name: args.socket_name,
        }
    }

    /// Absolute path of the handoff socket
    pub fn socket_path(&self) -> PathBuf {
        self.work_dir.join(&self.socket_name)
    }
}

/// A relay exit observed by the watcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayExit {
    pub pid: u32,
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// The exit was caused by [`RelayProcess::terminate`]
    pub requested: bool,
}

impl RelayExit {
    fn from_status(pid: u32, status: Option<ExitStatus>, requested: bool) -> Self {
        Self {
            pid,
            code: status.and_then(|s| s.code()),
            signal: status.and_then(|s| s.signal()),
            requested,
        }
    }
}

/// Callback invoked on the watcher thread when the relay exits
pub type ExitNotifier = Arc<dyn Fn(RelayExit) + Send + Sync>;

/// Relay errors
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("failed to launch relay {path}: {source}")]
    Launch {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("relay already watched")]
    AlreadyWatched,

    #[error(transparent)]
    Handoff(#[from] HandoffError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One launched relay process
pub struct RelayProcess {
    pid: u32,
    child: Option<Child>,
    watcher: Option<JoinHandle<()>>,
    exited: Arc<AtomicBool>,
    requested: Arc<AtomicBool>,
    done: Option<Receiver<()>>,
}

impl RelayProcess {
    /// Spawn the relay in its working directory.
    pub fn launch(spec: &RelaySpec) -> Result<Self, RelayError> {
        let child = Command::new(&spec.executable)
            .args(&spec.args)
            .current_dir(&spec.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|source| RelayError::Launch {
                path: spec.executable.display().to_string(),
                source,
            })?;

        let pid = child.id();
        info!(pid, "relay launched: {}", spec.executable.display());

        Ok(Self {
            pid,
            child: Some(child),
            watcher: None,
            exited: Arc::new(AtomicBool::new(false)),
            requested: Arc::new(AtomicBool::new(false)),
            done: None,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Has the process been reaped?
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Block a dedicated thread on the child and report its exit.
    pub fn watch<F>(&mut self, on_exit: F) -> Result<(), RelayError>
    where
        F: FnOnce(RelayExit) + Send + 'static,
    {
        let mut child = self.child.take().ok_or(RelayError::AlreadyWatched)?;
        let (done_tx, done_rx) = bounded(1);
        let exited = self.exited.clone();
        let requested = self.requested.clone();
        let pid = self.pid;

        let watcher = thread::Builder::new()
            .name(format!("relay-watcher-{}", pid))
            .spawn(move || {
                let status = match child.wait() {
                    Ok(status) => Some(status),
                    Err(e) => {
                        error!(pid, "waiting on relay failed: {}", e);
                        None
                    }
                };
                exited.store(true, Ordering::SeqCst);
                let _ = done_tx.send(());

                let exit = RelayExit::from_status(pid, status, requested.load(Ordering::SeqCst));
                if exit.requested {
                    debug!(pid, "relay stopped on request");
                } else {
                    warn!(pid, code = ?exit.code, signal = ?exit.signal, "relay exited");
                }
                on_exit(exit);
            })?;

        self.watcher = Some(watcher);
        self.done = Some(done_rx);
        Ok(())
    }

    /// Stop the relay: SIGTERM, then SIGKILL after `grace`.
    ///
    /// Waits at most twice `grace`; a relay that survives is left to the
    /// watcher thread.
    pub fn terminate(&mut self, grace: Duration) {
        self.requested.store(true, Ordering::SeqCst);

        if let Some(mut child) = self.child.take() {
            // Never watched: reap inline
            let _ = child.kill();
            let _ = child.wait();
            self.exited.store(true, Ordering::SeqCst);
            return;
        }

        if !self.has_exited() {
            for signal in [Signal::SIGTERM, Signal::SIGKILL] {
                debug!(pid = self.pid, "sending {} to relay", signal);
                if let Err(e) = kill(Pid::from_raw(self.pid as i32), signal) {
                    debug!(pid = self.pid, "signal failed: {}", e);
                }
                if self.wait_done(grace) {
                    break;
                }
            }
        }

        if self.has_exited() {
            if let Some(watcher) = self.watcher.take() {
                let _ = watcher.join();
            }
        } else {
            warn!(pid = self.pid, "relay did not exit within grace period");
        }
    }

    fn wait_done(&self, timeout: Duration) -> bool {
        match &self.done {
            Some(done) => done.recv_timeout(timeout).is_ok() || self.has_exited(),
            None => self.has_exited(),
        }
    }
}

impl Drop for RelayProcess {
    fn drop(&mut self) {
        if !self.has_exited() {
            self.terminate(Duration::from_millis(200));
        }
    }
}

/// Restart hardening
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Pause between an exit and the relaunch
    pub min_delay: Duration,
    /// Exits within `window` that fail the session; 0 disables the breaker
    pub max_failures: u32,
    pub window: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(500),
            max_failures: 5,
            window: Duration::from_secs(30),
        }
    }
}

/// What to do about a relay exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Relaunch and hand off the descriptor again
    Relaunch,
    /// Too many exits in the window
    GiveUp { failures: u32 },
    /// Requested or stale exit
    Ignore,
}

/// Sliding window of recent unexpected exits
#[derive(Debug, Clone)]
pub struct RestartTracker {
    policy: RestartPolicy,
    failures: VecDeque<Instant>,
}

impl RestartTracker {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            failures: VecDeque::new(),
        }
    }

    pub fn policy(&self) -> RestartPolicy {
        self.policy
    }

    /// Record an unexpected exit at `at`.
    pub fn record(&mut self, at: Instant) -> RestartDecision {
        self.failures.push_back(at);
        while let Some(&oldest) = self.failures.front() {
            if at.saturating_duration_since(oldest) > self.policy.window {
                self.failures.pop_front();
            } else {
                break;
            }
        }

        let failures = self.failures.len() as u32;
        if self.policy.max_failures > 0 && failures >= self.policy.max_failures {
            RestartDecision::GiveUp { failures }
        } else {
            RestartDecision::Relaunch
        }
    }

    pub fn reset(&mut self) {
        self.failures.clear();
    }
}

/// Keeps at most one relay alive for a session and re-attaches it after exits.
pub struct RelaySupervisor {
    spec: RelaySpec,
    handoff: HandoffChannel,
    restarts: RestartTracker,
    grace: Duration,
    notifier: ExitNotifier,
    process: Option<RelayProcess>,
    launches: u32,
}

impl RelaySupervisor {
    pub fn new(
        spec: RelaySpec,
        handoff: HandoffChannel,
        policy: RestartPolicy,
        grace: Duration,
        notifier: ExitNotifier,
    ) -> Self {
        Self {
            spec,
            handoff,
            restarts: RestartTracker::new(policy),
            grace,
            notifier,
            process: None,
            launches: 0,
        }
    }

    pub fn spec(&self) -> &RelaySpec {
        &self.spec
    }

    /// Pid of the live relay
    pub fn pid(&self) -> Option<u32> {
        self.process
            .as_ref()
            .filter(|p| !p.has_exited())
            .map(RelayProcess::pid)
    }

    /// Number of launches so far
    pub fn launches(&self) -> u32 {
        self.launches
    }

    /// Launch the relay and hand it `tun_fd`.
    ///
    /// Any previous relay is terminated first. A failed handoff terminates
    /// the new relay too: an interface with no relay attached passes no
    /// traffic.
    pub fn start(&mut self, tun_fd: BorrowedFd<'_>, cancel: &CancelToken) -> Result<u32, RelayError> {
        self.terminate();

        let socket_path = self.spec.socket_path();
        if std::fs::remove_file(&socket_path).is_ok() {
            debug!("removed stale relay socket {}", socket_path.display());
        }

        let mut process = RelayProcess::launch(&self.spec)?;
        let pid = process.pid();
        let notifier = self.notifier.clone();
        process.watch(move |exit| notifier(exit))?;
        self.process = Some(process);
        self.launches += 1;

        let pending = self
            .handoff
            .spawn(tun_fd.try_clone_to_owned()?, socket_path, cancel.clone())?;
        let result = pending
            .recv()
            .unwrap_or_else(|_| Err(HandoffError::Thread("handoff thread vanished".into())));

        match result {
            Ok(_) => Ok(pid),
            Err(e) => {
                self.terminate();
                Err(e.into())
            }
        }
    }

    /// Decide what to do about an exit reported by the watcher.
    pub fn on_exit(&mut self, exit: &RelayExit) -> RestartDecision {
        if exit.requested {
            return RestartDecision::Ignore;
        }
        match &self.process {
            Some(process) if process.pid() == exit.pid => {}
            _ => {
                debug!(pid = exit.pid, "ignoring exit of a replaced relay");
                return RestartDecision::Ignore;
            }
        }

        if let Some(mut process) = self.process.take() {
            process.terminate(self.grace);
        }

        let decision = self.restarts.record(Instant::now());
        if let RestartDecision::GiveUp { failures } = decision {
            error!(
                failures,
                window = ?self.restarts.policy().window,
                "relay keeps exiting, giving up"
            );
        }
        decision
    }

    /// Terminate the live relay, if any. Bounded by the grace period.
    pub fn terminate(&mut self) {
        if let Some(mut process) = self.process.take() {
            info!(pid = process.pid(), "terminating relay");
            process.terminate(self.grace);
        }
    }
}

impl Drop for RelaySupervisor {
    fn drop(&mut self) {
        self.terminate();
    }
}
