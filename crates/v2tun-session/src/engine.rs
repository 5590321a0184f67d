//! Proxy Engine Controller
//!
//! The engine is an opaque collaborator behind [`ProxyEngine`].
//! [`EngineController`] adds what the session relies on: at most one
//! running instance, and delay measurements that never outlive their
//! timeout.

use crate::config::{ManagerSettings, STATS_API_TAG, SessionConfig};
use crate::message::DELAY_UNKNOWN;
use crate::probe::{self, ProbeError};
use crate::stats::TrafficCounters;
use crossbeam_channel::bounded;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde::Deserialize;
use serde_json::Value;
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long a freshly spawned engine gets to open its SOCKS inbound
const READY_TIMEOUT: Duration = Duration::from_secs(5);
const READY_POLL: Duration = Duration::from_millis(50);

/// Engine errors
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to launch engine {path}: {source}")]
    Launch {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("engine exited during startup (code {0:?})")]
    Exited(Option<i32>),

    #[error("engine never opened {0}")]
    NotReady(SocketAddr),

    #[error("engine is not running")]
    NotRunning,

    #[error("engine refused to start: {0}")]
    Refused(String),

    #[error("delay measurement timed out")]
    Timeout,

    #[error("engine {command} failed: {detail}")]
    Query { command: &'static str, detail: String },

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The proxy engine as seen by the session.
///
/// Implementations use interior mutability: the engine is shared with the
/// delay and statistics threads.
pub trait ProxyEngine: Send + Sync {
    fn is_running(&self) -> bool;

    fn start(&self, config: &SessionConfig) -> Result<(), EngineError>;

    fn stop(&self) -> Result<(), EngineError>;

    /// Delay to `url` through the running engine, in milliseconds
    fn connected_delay(&self, url: &str, timeout: Duration) -> Result<i64, EngineError>;

    /// Delay to `url` through `config`, without a running session
    fn server_delay(&self, config: &SessionConfig, url: &str, timeout: Duration) -> Result<i64, EngineError>;

    /// Cumulative uplink/downlink byte counters
    fn traffic(&self) -> TrafficCounters {
        TrafficCounters::default()
    }
}

/// Single-instance front for a [`ProxyEngine`].
#[derive(Clone)]
pub struct EngineController {
    engine: Arc<dyn ProxyEngine>,
    delay_url: String,
    timeout: Duration,
}

impl EngineController {
    pub fn new(engine: Arc<dyn ProxyEngine>, delay_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            engine,
            delay_url: delay_url.into(),
            timeout,
        }
    }

    pub fn is_running(&self) -> bool {
        self.engine.is_running()
    }

    /// Start the engine, stopping a running instance first.
    pub fn start(&self, config: &SessionConfig) -> Result<(), EngineError> {
        if self.engine.is_running() {
            info!("engine already running, restarting");
            self.engine.stop()?;
        }
        self.engine.start(config)?;
        info!(socks_port = config.socks_port, "engine started");
        Ok(())
    }

    /// Stop the engine if it runs.
    pub fn stop(&self) -> Result<(), EngineError> {
        if !self.engine.is_running() {
            return Ok(());
        }
        self.engine.stop()?;
        info!("engine stopped");
        Ok(())
    }

    /// Delay through the running engine, bounded by `timeout`.
    pub fn measure_delay(&self, timeout: Duration) -> Result<i64, EngineError> {
        if !self.engine.is_running() {
            return Err(EngineError::NotRunning);
        }
        let engine = self.engine.clone();
        let url = self.delay_url.clone();
        bounded_call("engine-delay", timeout, move || engine.connected_delay(&url, timeout))
    }

    /// Delay of an arbitrary configuration/URL pair.
    ///
    /// Bounded by the default timeout plus engine startup time.
    pub fn server_delay(&self, config: &SessionConfig, url: Option<&str>) -> Result<i64, EngineError> {
        let engine = self.engine.clone();
        let config = config.clone();
        let url = url.unwrap_or(&self.delay_url).to_string();
        let timeout = self.timeout;
        bounded_call("engine-server-delay", timeout + READY_TIMEOUT, move || {
            engine.server_delay(&config, &url, timeout)
        })
    }

    /// [`measure_delay`](Self::measure_delay) with failures folded into `-1`.
    pub fn delay_or_unknown(&self) -> i64 {
        match self.measure_delay(self.timeout) {
            Ok(delay) => delay,
            Err(e) => {
                debug!("delay measurement failed: {}", e);
                DELAY_UNKNOWN
            }
        }
    }

    pub fn traffic(&self) -> TrafficCounters {
        self.engine.traffic()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Run `call` on a named thread and give up after `timeout`.
///
/// An overrunning call is left to finish on its own; its result is dropped.
fn bounded_call<F>(name: &str, timeout: Duration, call: F) -> Result<i64, EngineError>
where
    F: FnOnce() -> Result<i64, EngineError> + Send + 'static,
{
    let (tx, rx) = bounded(1);
    thread::Builder::new().name(name.to_string()).spawn(move || {
        let _ = tx.send(call());
    })?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(_) => {
            warn!(?timeout, "{} timed out", name);
            Err(EngineError::Timeout)
        }
    }
}

struct EngineProcess {
    child: Child,
    config_path: PathBuf,
    socks: SocketAddr,
    stats_api: Option<SocketAddr>,
}

/// Arguments of the engine's stats query against `server`.
pub fn stats_query_args(server: SocketAddr) -> Vec<String> {
    vec!["api".into(), "statsquery".into(), format!("--server={}", server)]
}

#[derive(Deserialize)]
struct StatsQuery {
    #[serde(default)]
    stat: Vec<StatEntry>,
}

#[derive(Deserialize)]
struct StatEntry {
    name: String,
    #[serde(default)]
    value: Value,
}

/// Sum the outbound counters in a stats query response.
///
/// Names look like `outbound>>>proxy>>>traffic>>>uplink`; the stats API's
/// own outbound is left out. Values arrive as numbers or decimal strings,
/// and zero counters are omitted entirely.
pub fn parse_stats_query(output: &str) -> Result<TrafficCounters, EngineError> {
    let query: StatsQuery = serde_json::from_str(output.trim()).map_err(|e| EngineError::Query {
        command: "stats query",
        detail: e.to_string(),
    })?;

    let mut counters = TrafficCounters::default();
    for entry in &query.stat {
        let parts: Vec<&str> = entry.name.split(">>>").collect();
        let [kind, tag, "traffic", direction] = parts.as_slice() else {
            continue;
        };
        if *kind != "outbound" || *tag == STATS_API_TAG {
            continue;
        }
        let value = match &entry.value {
            Value::Number(n) => n.as_u64().unwrap_or(0),
            Value::String(s) => s.parse().unwrap_or(0),
            _ => 0,
        };
        match *direction {
            "uplink" => counters.uplink = counters.uplink.saturating_add(value),
            "downlink" => counters.downlink = counters.downlink.saturating_add(value),
            _ => {}
        }
    }
    Ok(counters)
}

/// Engine run as an external executable: `<engine_path> <engine_args...> <config file>`.
pub struct ProcessEngine {
    executable: PathBuf,
    args: Vec<String>,
    work_dir: PathBuf,
    config_name: String,
    grace: Duration,
    process: Mutex<Option<EngineProcess>>,
    last_traffic: Mutex<TrafficCounters>,
}

impl ProcessEngine {
    pub fn new(executable: impl Into<PathBuf>, args: Vec<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args,
            work_dir: work_dir.into(),
            config_name: "engine.json".to_string(),
            grace: Duration::from_millis(500),
            process: Mutex::new(None),
            last_traffic: Mutex::new(TrafficCounters::default()),
        }
    }

    pub fn from_settings(settings: &ManagerSettings) -> Self {
        Self::new(
            settings.engine_path.clone(),
            settings.engine_args.clone(),
            settings.work_dir.clone(),
        )
        .with_grace(settings.terminate_grace())
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    fn with_config_name(mut self, name: impl Into<String>) -> Self {
        self.config_name = name.into();
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<EngineProcess>> {
        self.process.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Engine build reported by `<engine> version`, first line only.
    pub fn version(&self) -> Result<String, EngineError> {
        let output = self.run_query("version", &["version".to_string()])?;
        Ok(output
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or_default()
            .to_string())
    }

    /// Run a one-shot engine subcommand and collect its stdout.
    fn run_query(&self, command: &'static str, args: &[String]) -> Result<String, EngineError> {
        let mut query = Command::new(&self.executable);
        query.args(args).stdin(Stdio::null());
        if self.work_dir.is_dir() {
            query.current_dir(&self.work_dir);
        }
        let output = query.output().map_err(|source| EngineError::Launch {
            path: self.executable.display().to_string(),
            source,
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = match stderr.trim() {
                "" => output.status.to_string(),
                text => text.to_string(),
            };
            return Err(EngineError::Query { command, detail });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn query_traffic(&self, server: SocketAddr) -> Result<TrafficCounters, EngineError> {
        let output = self.run_query("stats query", &stats_query_args(server))?;
        parse_stats_query(&output)
    }

    fn wait_ready(child: &mut Child, socks: SocketAddr) -> Result<(), EngineError> {
        let deadline = Instant::now() + READY_TIMEOUT;
        loop {
            if let Some(status) = child.try_wait()? {
                return Err(EngineError::Exited(status.code()));
            }
            if TcpStream::connect_timeout(&socks, READY_POLL).is_ok() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(EngineError::NotReady(socks));
            }
            thread::sleep(READY_POLL);
        }
    }

    fn shutdown(&self, mut process: EngineProcess) {
        let pid = process.child.id();
        if let Ok(None) = process.child.try_wait() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            let deadline = Instant::now() + self.grace;
            while Instant::now() < deadline {
                if let Ok(Some(_)) = process.child.try_wait() {
                    break;
                }
                thread::sleep(Duration::from_millis(10));
            }
            if let Ok(None) = process.child.try_wait() {
                warn!(pid, "engine ignored SIGTERM, killing");
                let _ = process.child.kill();
            }
        }
        let _ = process.child.wait();
        let _ = std::fs::remove_file(&process.config_path);
        debug!(pid, "engine process reaped");
    }
}

impl ProxyEngine for ProcessEngine {
    fn is_running(&self) -> bool {
        match self.lock().as_mut() {
            Some(process) => matches!(process.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    fn start(&self, config: &SessionConfig) -> Result<(), EngineError> {
        let mut slot = self.lock();
        if let Some(previous) = slot.take() {
            self.shutdown(previous);
        }

        std::fs::create_dir_all(&self.work_dir)?;
        let config_path = self.work_dir.join(&self.config_name);
        std::fs::write(&config_path, &config.engine_config)?;

        let child = Command::new(&self.executable)
            .args(&self.args)
            .arg(&config_path)
            .current_dir(&self.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|source| EngineError::Launch {
                path: self.executable.display().to_string(),
                source,
            })?;

        let socks = SocketAddr::from((Ipv4Addr::LOCALHOST, config.socks_port));
        let stats_api = config
            .stats_api_port
            .map(|port| SocketAddr::from((Ipv4Addr::LOCALHOST, port)));
        debug!(pid = child.id(), %socks, "waiting for engine inbound");

        let mut process = EngineProcess {
            child,
            config_path,
            socks,
            stats_api,
        };
        if let Err(e) = Self::wait_ready(&mut process.child, socks) {
            self.shutdown(process);
            return Err(e);
        }

        *self.last_traffic.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = TrafficCounters::default();
        *slot = Some(process);
        Ok(())
    }

    fn stop(&self) -> Result<(), EngineError> {
        if let Some(process) = self.lock().take() {
            self.shutdown(process);
        }
        Ok(())
    }

    fn connected_delay(&self, url: &str, timeout: Duration) -> Result<i64, EngineError> {
        let socks = match self.lock().as_ref() {
            Some(process) => process.socks,
            None => return Err(EngineError::NotRunning),
        };
        let elapsed = probe::measure_blocking(socks, url, timeout)?;
        Ok(elapsed.as_millis() as i64)
    }

    /// Runs a throwaway engine instance on the configuration's own ports.
    fn server_delay(&self, config: &SessionConfig, url: &str, timeout: Duration) -> Result<i64, EngineError> {
        let scratch = ProcessEngine::new(self.executable.clone(), self.args.clone(), self.work_dir.clone())
            .with_grace(self.grace)
            .with_config_name("engine-probe.json");
        scratch.start(config)?;
        let result = scratch.connected_delay(url, timeout);
        scratch.stop()?;
        result
    }

    /// Counters from the engine's stats API.
    ///
    /// A failed query repeats the last good reading so speeds never spike.
    fn traffic(&self) -> TrafficCounters {
        let Some(server) = self.lock().as_ref().and_then(|process| process.stats_api) else {
            return TrafficCounters::default();
        };
        let mut last = self.last_traffic.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match self.query_traffic(server) {
            Ok(counters) => *last = counters,
            Err(e) => debug!(%server, "stats query failed: {}", e),
        }
        *last
    }
}

impl Drop for ProcessEngine {
    fn drop(&mut self) {
        if let Some(process) = self.lock().take() {
            self.shutdown(process);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct FakeEngine {
        running: Mutex<bool>,
        starts: AtomicU32,
        stops: AtomicU32,
        max_concurrent: AtomicU32,
        delay: Duration,
    }

    impl ProxyEngine for FakeEngine {
        fn is_running(&self) -> bool {
            *self.running.lock().unwrap()
        }

        fn start(&self, _config: &SessionConfig) -> Result<(), EngineError> {
            let mut running = self.running.lock().unwrap();
            if *running {
                self.max_concurrent.store(2, Ordering::SeqCst);
            }
            *running = true;
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn stop(&self) -> Result<(), EngineError> {
            *self.running.lock().unwrap() = false;
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn connected_delay(&self, _url: &str, _timeout: Duration) -> Result<i64, EngineError> {
            thread::sleep(self.delay);
            Ok(42)
        }

        fn server_delay(&self, _config: &SessionConfig, _url: &str, _timeout: Duration) -> Result<i64, EngineError> {
            thread::sleep(self.delay);
            Ok(7)
        }
    }

    fn config(socks_port: u16) -> SessionConfig {
        let payload = format!(r#"{{"inbounds": [{{"protocol": "socks", "port": {}}}]}}"#, socks_port);
        SessionConfig::parse("Test", &payload, false).unwrap()
    }

    #[test]
    fn test_single_instance() {
        let engine = Arc::new(FakeEngine::default());
        let controller = EngineController::new(engine.clone(), "http://x/", Duration::from_secs(1));

        controller.start(&config(10808)).unwrap();
        controller.start(&config(10808)).unwrap();

        assert_eq!(engine.starts.load(Ordering::SeqCst), 2);
        assert_eq!(engine.stops.load(Ordering::SeqCst), 1);
        assert_eq!(engine.max_concurrent.load(Ordering::SeqCst), 0);

        controller.stop().unwrap();
        controller.stop().unwrap();
        assert_eq!(engine.stops.load(Ordering::SeqCst), 2);
        assert!(!controller.is_running());
    }

    #[test]
    fn test_measure_delay() {
        let engine = Arc::new(FakeEngine::default());
        let controller = EngineController::new(engine, "http://x/", Duration::from_secs(1));

        assert!(matches!(controller.measure_delay(Duration::from_secs(1)), Err(EngineError::NotRunning)));
        assert_eq!(controller.delay_or_unknown(), DELAY_UNKNOWN);

        controller.start(&config(10808)).unwrap();
        assert_eq!(controller.measure_delay(Duration::from_secs(1)).unwrap(), 42);
        assert_eq!(controller.server_delay(&config(10808), None).unwrap(), 7);
    }

    #[test]
    fn test_measure_delay_timeout() {
        let engine = Arc::new(FakeEngine {
            delay: Duration::from_secs(2),
            ..FakeEngine::default()
        });
        let controller = EngineController::new(engine, "http://x/", Duration::from_millis(100));
        controller.start(&config(10808)).unwrap();

        let started = Instant::now();
        assert_eq!(controller.delay_or_unknown(), DELAY_UNKNOWN);
        assert!(matches!(controller.measure_delay(Duration::from_millis(50)), Err(EngineError::Timeout)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_process_engine_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        // Stands in for the engine's SOCKS inbound
        let inbound = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = inbound.local_addr().unwrap().port();

        let engine = ProcessEngine::new(
            "/bin/sh",
            vec!["-c".into(), "exec sleep 30".into(), "sh".into()],
            dir.path(),
        )
        .with_grace(Duration::from_millis(300));

        engine.start(&config(port)).unwrap();
        assert!(engine.is_running());
        assert!(dir.path().join("engine.json").exists());

        engine.stop().unwrap();
        assert!(!engine.is_running());
        assert!(!dir.path().join("engine.json").exists());
    }

    fn sleeper(work_dir: &std::path::Path) -> ProcessEngine {
        ProcessEngine::new(
            "/bin/sh",
            vec!["-c".into(), "exec sleep 30".into(), "sh".into()],
            work_dir,
        )
        .with_grace(Duration::from_millis(300))
    }

    #[test]
    fn test_process_engine_creates_work_dir() {
        let dir = tempfile::tempdir().unwrap();
        let work_dir = dir.path().join("state").join("v2tun");
        let inbound = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = inbound.local_addr().unwrap().port();

        let engine = sleeper(&work_dir);
        engine.start(&config(port)).unwrap();

        assert!(engine.is_running());
        assert!(work_dir.join("engine.json").exists());
        engine.stop().unwrap();
    }

    #[test]
    fn test_parse_stats_query() {
        let output = r#"{"stat": [
            {"name": "outbound>>>proxy>>>traffic>>>uplink", "value": "1200"},
            {"name": "outbound>>>proxy>>>traffic>>>downlink", "value": 3400},
            {"name": "outbound>>>direct>>>traffic>>>uplink", "value": "5"},
            {"name": "outbound>>>api>>>traffic>>>downlink", "value": "999"},
            {"name": "inbound>>>socks>>>traffic>>>uplink", "value": "777"},
            {"name": "outbound>>>block>>>traffic>>>downlink"}
        ]}"#;

        assert_eq!(
            parse_stats_query(output).unwrap(),
            TrafficCounters {
                uplink: 1205,
                downlink: 3400
            }
        );
        assert_eq!(parse_stats_query("{}\n").unwrap(), TrafficCounters::default());
        assert!(matches!(parse_stats_query("rpc error"), Err(EngineError::Query { .. })));
    }

    #[test]
    fn test_stats_query_args() {
        let server = SocketAddr::from((Ipv4Addr::LOCALHOST, 10853));
        assert_eq!(stats_query_args(server), vec!["api", "statsquery", "--server=127.0.0.1:10853"]);
    }

    #[test]
    fn test_traffic_zero_when_stopped() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(sleeper(dir.path()).traffic(), TrafficCounters::default());
    }

    #[test]
    fn test_traffic_from_stats_api() {
        let dir = tempfile::tempdir().unwrap();
        let inbound = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = inbound.local_addr().unwrap().port();
        // `/bin/sh api statsquery ...` runs this file from the work dir
        std::fs::write(
            dir.path().join("api"),
            r#"[ "$1" = statsquery ] || exit 2
printf '%s' '{"stat":[{"name":"outbound>>>proxy>>>traffic>>>uplink","value":"64"},{"name":"outbound>>>proxy>>>traffic>>>downlink","value":"128"}]}'
"#,
        )
        .unwrap();

        let payload = format!(r#"{{"inbounds": [{{"protocol": "socks", "port": {}}}]}}"#, port);
        let engine = sleeper(dir.path());
        engine
            .start(&SessionConfig::from_engine_json("Test", &payload).unwrap())
            .unwrap();

        let expected = TrafficCounters {
            uplink: 64,
            downlink: 128,
        };
        assert_eq!(engine.traffic(), expected);

        // A failing query keeps the last reading
        std::fs::write(dir.path().join("api"), "echo 'connection refused' >&2; exit 1\n").unwrap();
        assert_eq!(engine.traffic(), expected);

        engine.stop().unwrap();
        assert_eq!(engine.traffic(), TrafficCounters::default());
    }

    #[test]
    fn test_traffic_without_stats_api() {
        let dir = tempfile::tempdir().unwrap();
        let inbound = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = inbound.local_addr().unwrap().port();
        std::fs::write(dir.path().join("api"), "printf '%s' '{\"stat\":[{\"name\":\"outbound>>>p>>>traffic>>>uplink\",\"value\":\"1\"}]}'\n").unwrap();

        let engine = sleeper(dir.path());
        engine.start(&config(port)).unwrap();

        assert_eq!(engine.traffic(), TrafficCounters::default());
        engine.stop().unwrap();
    }

    #[test]
    fn test_engine_version() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("version"), "echo\necho 'Xray 1.8.24 (Xray, Penetrates Everything.)'\necho 'A unified platform'\n").unwrap();
        let engine = ProcessEngine::new("/bin/sh", Vec::new(), dir.path());

        assert_eq!(engine.version().unwrap(), "Xray 1.8.24 (Xray, Penetrates Everything.)");
    }

    #[test]
    fn test_engine_version_failure() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("version"), "echo 'unknown command' >&2\nexit 3\n").unwrap();
        let engine = ProcessEngine::new("/bin/sh", Vec::new(), dir.path());

        match engine.version() {
            Err(EngineError::Query { command, detail }) => {
                assert_eq!(command, "version");
                assert_eq!(detail, "unknown command");
            }
            other => panic!("unexpected {:?}", other),
        }

        let missing = ProcessEngine::new(dir.path().join("no-such-engine"), Vec::new(), dir.path());
        assert!(matches!(missing.version(), Err(EngineError::Launch { .. })));
    }

    #[test]
    fn test_process_engine_exits_early() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ProcessEngine::new(
            "/bin/sh",
            vec!["-c".into(), "exit 7".into(), "sh".into()],
            dir.path(),
        );

        let err = engine.start(&config(1)).unwrap_err();
        assert!(matches!(err, EngineError::Exited(Some(7))));
        assert!(!engine.is_running());
    }

    #[test]
    fn test_process_engine_missing_executable() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ProcessEngine::new(dir.path().join("no-such-engine"), Vec::new(), dir.path());

        assert!(matches!(engine.start(&config(1)), Err(EngineError::Launch { .. })));
        assert!(matches!(
            engine.connected_delay("http://x/", Duration::from_millis(10)),
            Err(EngineError::NotRunning)
        ));
    }
}
