//! hotplug - companion CLI for hotplugd
//!
//! Encodes device events and sends them to the daemon's event socket.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use hotplug_core::HotplugConfig;
use hotplug_core::config::DEFAULT_SOCKET;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;

/// hotplug - send device events to hotplugd
#[derive(Parser, Debug)]
#[command(name = "hotplug")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to daemon configuration file (used to find the socket)
    #[arg(short, long, default_value = "hotplugd.toml")]
    config: PathBuf,

    /// Path to event socket (`@name` for the abstract namespace)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Send one device event to the daemon
    Send(commands::send::SendArgs),
}

impl Cli {
    /// Socket from `--socket`, else from the config file, else the default.
    fn socket_path(&self) -> PathBuf {
        if let Some(socket) = &self.socket {
            return socket.clone();
        }
        if self.config.exists() {
            if let Ok(config) = HotplugConfig::from_file(&self.config) {
                return config.daemon.socket;
            }
        }
        PathBuf::from(DEFAULT_SOCKET)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let socket_path = cli.socket_path();
    match &cli.command {
        Commands::Send(args) => commands::send::run(&socket_path, args),
    }
}
