//! hotplugd - hotplug event serializer daemon
//!
//! Receives device events on a Unix datagram socket, restores the kernel's
//! sequence order, and runs one worker process per event while never running
//! two workers for the same device at once.
//!
//! # Fork Safety
//!
//! Daemonization via `fork()` happens in a synchronous `main` BEFORE the Tokio
//! runtime is built. The runtime is then constructed by hand (current-thread
//! flavor, since the event loop owns all queue state on one task) and driven
//! with `block_on()`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::Parser;
use hotplug_core::{Engine, EngineStats, HotplugConfig};
use hotplug_daemon::{EventLoop, EventSocket, ProcessLauncher};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// hotplugd - serialize device events and run one worker per event
#[derive(Parser, Debug)]
#[command(name = "hotplugd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "hotplugd.toml")]
    config: PathBuf,

    /// Run in foreground (don't daemonize)
    #[arg(long)]
    no_daemon: bool,

    /// Event socket path (`@name` for the abstract namespace)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Path to PID file
    #[arg(long)]
    pid_file: Option<PathBuf>,

    /// Worker program run once per event
    #[arg(long)]
    worker: Option<PathBuf>,

    /// Seconds a pending event waits for its predecessor
    #[arg(long)]
    event_timeout: Option<u64>,

    /// Only accept messages from this uid
    #[arg(long)]
    trusted_uid: Option<u32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,
}

/// Effective settings: config file values overridden by CLI flags.
#[derive(Debug)]
struct DaemonSettings {
    config: HotplugConfig,
    socket_path: PathBuf,
    pid_path: PathBuf,
    log_file: Option<PathBuf>,
    trusted_uid: u32,
}

impl DaemonSettings {
    fn new(args: &Args) -> Result<Self> {
        let mut config = if args.config.exists() {
            HotplugConfig::from_file(&args.config).context("failed to load configuration")?
        } else {
            HotplugConfig::default()
        };

        if let Some(socket) = &args.socket {
            config.daemon.socket.clone_from(socket);
        }
        if let Some(pid_file) = &args.pid_file {
            config.daemon.pid_file.clone_from(pid_file);
        }
        if let Some(worker) = &args.worker {
            config.worker.program.clone_from(worker);
        }
        if let Some(secs) = args.event_timeout {
            config.daemon.event_timeout_secs = secs;
        }
        if args.trusted_uid.is_some() {
            config.daemon.trusted_uid = args.trusted_uid;
        }
        config.validate().context("invalid configuration")?;

        // The daemon changes directory to `/`, so relative paths are resolved
        // up front.
        let socket_path = if config.daemon.socket.as_os_str().as_encoded_bytes().starts_with(b"@")
        {
            config.daemon.socket.clone()
        } else {
            absolute(&config.daemon.socket)?
        };
        let pid_path = absolute(&config.daemon.pid_file)?;
        let log_file = args.log_file.as_deref().map(absolute).transpose()?;
        let trusted_uid = config
            .daemon
            .trusted_uid
            .unwrap_or_else(|| nix::unistd::getuid().as_raw());

        Ok(Self {
            config,
            socket_path,
            pid_path,
            log_file,
            trusted_uid,
        })
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).with_context(|| format!("invalid path {}", path.display()))
}

/// Write PID file atomically (temp file + rename).
fn write_pid_file(pid_path: &Path) -> Result<()> {
    if let Some(parent) = pid_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let tmp = pid_path.with_extension("pid.tmp");
    std::fs::write(&tmp, std::process::id().to_string())
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, pid_path).context("failed to write PID file")?;
    info!("PID file written to {:?}", pid_path);
    Ok(())
}

/// Remove PID file.
fn remove_pid_file(pid_path: &Path) {
    if pid_path.exists() {
        if let Err(e) = std::fs::remove_file(pid_path) {
            warn!("Failed to remove PID file: {e}");
        }
    }
}

/// Detach via the double-fork pattern.
///
/// Must run before the Tokio runtime exists; `fork()` in a multi-threaded
/// process only duplicates the calling thread.
#[allow(unsafe_code)] // fork() requires unsafe
fn daemonize() -> Result<()> {
    use nix::unistd::{ForkResult, fork, setsid};

    // SAFETY: no runtime and no other threads exist yet.
    match unsafe { fork() }? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {},
    }

    setsid()?;

    // SAFETY: still single-threaded; the first child inherited only this
    // thread.
    match unsafe { fork() }? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {},
    }

    std::env::set_current_dir("/")?;
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let settings = DaemonSettings::new(&args)?;

    if settings.config.daemon.require_root && !nix::unistd::geteuid().is_root() {
        bail!("root privileges required (set require_root = false to override)");
    }

    if !args.no_daemon {
        if let Err(e) = daemonize() {
            // Tracing is not initialized yet.
            eprintln!("Daemonization failed: {e}");
            return Err(e);
        }
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to create Tokio runtime")?;

    runtime.block_on(async_main(args, settings))
}

async fn async_main(args: Args, settings: DaemonSettings) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &settings.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    if args.no_daemon {
        info!("Running in foreground mode (--no-daemon)");
    } else {
        info!("Daemonized successfully");
    }

    // Binding fails while another instance owns the socket, so the PID file
    // is only written once this process is the running daemon.
    let socket = EventSocket::bind(&settings.socket_path, settings.trusted_uid)
        .context("failed to bind event socket")?;

    write_pid_file(&settings.pid_path)?;
    let result = serve(socket, &settings).await;
    remove_pid_file(&settings.pid_path);

    let stats = result?;
    info!(
        received = stats.received,
        duplicates = stats.duplicates,
        forced_promotions = stats.forced_promotions,
        dispatched = stats.dispatched,
        spawn_failures = stats.spawn_failures,
        completed = stats.completed,
        "Daemon shutdown complete"
    );
    Ok(())
}

async fn serve(socket: EventSocket, settings: &DaemonSettings) -> Result<EngineStats> {
    let launcher = ProcessLauncher::new(&settings.config.worker.program);
    let engine = Engine::new(launcher, settings.config.daemon.event_timeout());
    let event_loop = EventLoop::new(socket, engine).context("failed to set up event loop")?;

    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;
    let shutdown = async move {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    };

    info!(
        worker = %settings.config.worker.program.display(),
        event_timeout_secs = settings.config.daemon.event_timeout_secs,
        "hotplugd ready"
    );
    event_loop
        .run(shutdown)
        .await
        .context("event loop stopped")
}

#[cfg(test)]
mod daemon_settings_tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["hotplugd"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn defaults_apply_without_config_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let missing = tmp.path().join("absent.toml");
        let settings = DaemonSettings::new(&args(&["--config", missing.to_str().unwrap()])).unwrap();

        assert_eq!(settings.config, HotplugConfig::default());
        assert_eq!(settings.socket_path, PathBuf::from(hotplug_core::config::DEFAULT_SOCKET));
        assert_eq!(settings.trusted_uid, nix::unistd::getuid().as_raw());
    }

    #[test]
    fn cli_overrides_config_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = tmp.path().join("hotplugd.toml");
        std::fs::write(
            &config,
            "[daemon]\n\
             socket = \"/run/a.sock\"\n\
             event_timeout_secs = 9\n\
             trusted_uid = 0\n\
             [worker]\n\
             program = \"/bin/a\"\n",
        )
        .unwrap();

        let settings = DaemonSettings::new(&args(&[
            "--config",
            config.to_str().unwrap(),
            "--socket",
            "/run/b.sock",
            "--worker",
            "/bin/b",
            "--event-timeout",
            "2",
            "--trusted-uid",
            "42",
        ]))
        .unwrap();

        assert_eq!(settings.socket_path, PathBuf::from("/run/b.sock"));
        assert_eq!(settings.config.worker.program, PathBuf::from("/bin/b"));
        assert_eq!(settings.config.daemon.event_timeout_secs, 2);
        assert_eq!(settings.trusted_uid, 42);
    }

    #[test]
    fn config_values_used_when_cli_absent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = tmp.path().join("hotplugd.toml");
        std::fs::write(&config, "[daemon]\ntrusted_uid = 7\nsocket = \"@hotplugd\"\n").unwrap();

        let settings = DaemonSettings::new(&args(&["--config", config.to_str().unwrap()])).unwrap();
        assert_eq!(settings.trusted_uid, 7);
        assert_eq!(settings.socket_path, PathBuf::from("@hotplugd"));
    }

    #[test]
    fn relative_paths_made_absolute() {
        let tmp = tempfile::TempDir::new().unwrap();
        let missing = tmp.path().join("absent.toml");
        let settings = DaemonSettings::new(&args(&[
            "--config",
            missing.to_str().unwrap(),
            "--socket",
            "run/event.sock",
            "--pid-file",
            "run/hotplugd.pid",
        ]))
        .unwrap();

        assert!(settings.socket_path.is_absolute());
        assert!(settings.socket_path.ends_with("run/event.sock"));
        assert!(settings.pid_path.is_absolute());
    }

    #[test]
    fn zero_timeout_from_cli_rejected() {
        let tmp = tempfile::TempDir::new().unwrap();
        let missing = tmp.path().join("absent.toml");
        let result = DaemonSettings::new(&args(&[
            "--config",
            missing.to_str().unwrap(),
            "--event-timeout",
            "0",
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn pid_file_written_and_removed() {
        let tmp = tempfile::TempDir::new().unwrap();
        let pid_path = tmp.path().join("run").join("hotplugd.pid");

        write_pid_file(&pid_path).unwrap();
        let written = std::fs::read_to_string(&pid_path).unwrap();
        assert_eq!(written, std::process::id().to_string());

        remove_pid_file(&pid_path);
        assert!(!pid_path.exists());
    }
}
