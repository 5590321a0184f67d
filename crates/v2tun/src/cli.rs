use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use v2tun_session::ConnectionMode;

#[derive(Parser)]
#[command(name = "v2tun", about = "Route traffic through a proxy engine via a virtual interface", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: TopCommand,

    /// Manager settings (TOML)
    #[arg(short, long, global = true)]
    pub settings: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum TopCommand {
    /// Start a session and keep it up until interrupted
    Start {
        /// Engine configuration (JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Override the configured connection mode
        #[arg(short, long, value_enum)]
        mode: Option<Mode>,

        /// Route only this subnet through the tunnel (repeatable)
        #[arg(long = "bypass", value_name = "CIDR")]
        bypass: Vec<String>,

        /// Keep this user's traffic out of the tunnel (repeatable)
        #[arg(long = "disallow", value_name = "USER")]
        disallow: Vec<String>,

        /// Session label
        #[arg(short, long)]
        label: Option<String>,
    },

    /// Measure server delay for a configuration without starting a session
    Delay {
        /// Engine configuration (JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Probe URL
        #[arg(short, long)]
        url: Option<String>,
    },

    /// Print the v2tun and proxy engine versions
    Version,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum Mode {
    VpnTun,
    ProxyOnly,
}

impl From<Mode> for ConnectionMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::VpnTun => ConnectionMode::VpnTun,
            Mode::ProxyOnly => ConnectionMode::ProxyOnly,
        }
    }
}
