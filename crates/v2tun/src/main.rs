//! v2tun: tunnel session host
//!
//! Loads settings, starts one session, prints its events, and treats
//! Ctrl-C / SIGTERM as revocation. SIGUSR1 requests a delay measurement.

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, TopCommand};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use v2tun_session::{
    EngineController, InterfaceProvider, ManagerSettings, ProcessEngine,
    SessionConfig, SessionEvent, SessionHandle, SessionManager, DEFAULT_LABEL,
    DELAY_UNKNOWN,
};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.settings {
        Some(path) => ManagerSettings::load(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => ManagerSettings::default(),
    };

    // RUST_LOG wins over the settings file
    let default_level = if cli.verbose { "debug" } else { settings.log_level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    match cli.command {
        TopCommand::Start {
            config,
            mode,
            bypass,
            disallow,
            label,
        } => {
            let mut settings = settings;
            if let Some(mode) = mode {
                settings.mode = mode.into();
            }
            let label = label.unwrap_or_else(|| DEFAULT_LABEL.to_string());
            let config = load_config(&config, &label)?
                .with_bypass_subnets(bypass)
                .with_disallowed_apps(disallow);
            run_session(settings, config)
        }
        TopCommand::Delay { config, url } => {
            let config = load_config(&config, DEFAULT_LABEL)?;
            let engine = EngineController::new(
                Arc::new(ProcessEngine::from_settings(&settings)),
                settings.delay_url.clone(),
                settings.delay_timeout(),
            );
            let delay = match engine.server_delay(&config, url.as_deref()) {
                Ok(delay) => delay,
                Err(e) => {
                    warn!("delay measurement failed: {}", e);
                    DELAY_UNKNOWN
                }
            };
            println!("{}", delay);
            Ok(())
        }
        TopCommand::Version => {
            println!("v2tun {}", env!("CARGO_PKG_VERSION"));
            let engine = ProcessEngine::from_settings(&settings);
            let version = engine
                .version()
                .with_context(|| format!("querying {}", settings.engine_path.display()))?;
            println!("engine {}", version);
            Ok(())
        }
    }
}

fn load_config(path: &Path, label: &str) -> Result<SessionConfig> {
    let payload = std::fs::read_to_string(path)
        .with_context(|| format!("reading engine configuration {}", path.display()))?;
    SessionConfig::from_engine_json(label, &payload)
        .with_context(|| format!("parsing engine configuration {}", path.display()))
}

#[cfg(target_os = "linux")]
fn interface_provider(settings: &ManagerSettings) -> Result<Arc<dyn InterfaceProvider>> {
    Ok(Arc::new(v2tun_session::LinuxTunProvider::new(settings.interface_name.clone())))
}

#[cfg(not(target_os = "linux"))]
fn interface_provider(_settings: &ManagerSettings) -> Result<Arc<dyn InterfaceProvider>> {
    anyhow::bail!("virtual interfaces are only supported on Linux")
}

fn run_session(settings: ManagerSettings, config: SessionConfig) -> Result<()> {
    info!(mode = %settings.mode, label = %config.label, "v2tun starting");

    let engine = Arc::new(ProcessEngine::from_settings(&settings));
    let provider = interface_provider(&settings)?;
    let handle = SessionManager::new(settings, engine, provider)
        .spawn()
        .context("starting session manager")?;

    let events = handle.events().clone();
    let printer = thread::Builder::new()
        .name("event-printer".to_string())
        .spawn(move || print_events(events))?;

    handle.start(config)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()?;
    runtime.block_on(wait_for_signals(&handle))?;

    info!("stopping session");
    handle.revoke()?;
    // Joins the actor once the revocation is processed
    handle.shutdown();
    let _ = printer.join();

    info!("v2tun shutting down");
    Ok(())
}

async fn wait_for_signals(handle: &SessionHandle) -> Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    let mut measure = signal(SignalKind::user_defined1())?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = terminate.recv() => break,
            _ = measure.recv() => handle.measure_delay()?,
        }
    }
    Ok(())
}

fn print_events(events: crossbeam_channel::Receiver<SessionEvent>) {
    for event in events.iter() {
        match event {
            SessionEvent::StateChanged(state) => println!("state: {}", state),
            SessionEvent::DelayMeasured(delay) => println!("delay: {} ms", delay),
            SessionEvent::Status(report) => println!(
                "{} up {} B/s down {} B/s total {}/{} B",
                report.duration,
                report.upload_speed,
                report.download_speed,
                report.total_upload,
                report.total_download
            ),
        }
    }
}
