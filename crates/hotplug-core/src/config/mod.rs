//! Configuration parsing and management.
//!
//! This module handles parsing of the daemon configuration file (TOML) that
//! defines the event socket, trust policy, event timeout and worker program.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default event socket path.
pub const DEFAULT_SOCKET: &str = "/run/hotplugd/event.sock";

/// Default PID file path.
pub const DEFAULT_PID_FILE: &str = "/run/hotplugd/hotplugd.pid";

/// Default worker program.
pub const DEFAULT_WORKER_PROGRAM: &str = "/sbin/hotplug-worker";

/// Default seconds a pending event waits for its predecessor.
pub const DEFAULT_EVENT_TIMEOUT_SECS: u64 = 5;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct HotplugConfig {
    /// Daemon configuration.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Worker configuration.
    #[serde(default)]
    pub worker: WorkerConfig,
}

impl HotplugConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The TOML is invalid
    /// - The legacy `timeout` key is present in the `[daemon]` section
    /// - Validation fails (see [`HotplugConfig::validate`])
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        // Reject the legacy key explicitly rather than silently ignoring it
        // and running with the default timeout.
        if let Ok(raw) = content.parse::<toml::Table>() {
            if let Some(daemon) = raw.get("daemon").and_then(toml::Value::as_table) {
                if daemon.contains_key("timeout") {
                    return Err(ConfigError::Validation(
                        "'timeout' is no longer supported in [daemon] section. \
                         Use 'event_timeout_secs' instead."
                            .to_string(),
                    ));
                }
            }
        }
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Check semantic constraints serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if the event timeout is zero or
    /// the worker program is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.daemon.event_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "event_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.worker.program.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "worker program must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DaemonConfig {
    /// Event socket path. A leading `@` selects the abstract namespace.
    #[serde(default = "default_socket")]
    pub socket: PathBuf,

    /// Path to the PID file.
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,

    /// Only messages from this uid are accepted. Defaults to the daemon's own
    /// uid when unset.
    #[serde(default)]
    pub trusted_uid: Option<u32>,

    /// Refuse to start unless running as root.
    #[serde(default = "default_require_root")]
    pub require_root: bool,

    /// Seconds a pending event waits for its predecessor before it is
    /// promoted anyway.
    #[serde(default = "default_event_timeout_secs")]
    pub event_timeout_secs: u64,
}

impl DaemonConfig {
    /// Returns the event timeout as a [`Duration`].
    #[must_use]
    pub const fn event_timeout(&self) -> Duration {
        Duration::from_secs(self.event_timeout_secs)
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket: default_socket(),
            pid_file: default_pid_file(),
            trusted_uid: None,
            require_root: default_require_root(),
            event_timeout_secs: default_event_timeout_secs(),
        }
    }
}

/// Worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    /// Program run once per event as `<program> <subsystem>`.
    #[serde(default = "default_worker_program")]
    pub program: PathBuf,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: default_worker_program(),
        }
    }
}

fn default_socket() -> PathBuf {
    PathBuf::from(DEFAULT_SOCKET)
}

fn default_pid_file() -> PathBuf {
    PathBuf::from(DEFAULT_PID_FILE)
}

fn default_worker_program() -> PathBuf {
    PathBuf::from(DEFAULT_WORKER_PROGRAM)
}

const fn default_require_root() -> bool {
    true
}

const fn default_event_timeout_secs() -> u64 {
    DEFAULT_EVENT_TIMEOUT_SECS
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error reading config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("config validation failed: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = HotplugConfig::from_toml("").unwrap();
        assert_eq!(config, HotplugConfig::default());
        assert_eq!(config.daemon.socket, PathBuf::from(DEFAULT_SOCKET));
        assert_eq!(config.daemon.event_timeout(), Duration::from_secs(5));
        assert!(config.daemon.require_root);
        assert_eq!(config.daemon.trusted_uid, None);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [daemon]
            socket = "@hotplugd"
            pid_file = "/tmp/hotplugd.pid"
            trusted_uid = 1000
            require_root = false
            event_timeout_secs = 10

            [worker]
            program = "/usr/lib/hotplug/worker"
        "#;

        let config = HotplugConfig::from_toml(toml).unwrap();
        assert_eq!(config.daemon.socket, PathBuf::from("@hotplugd"));
        assert_eq!(config.daemon.pid_file, PathBuf::from("/tmp/hotplugd.pid"));
        assert_eq!(config.daemon.trusted_uid, Some(1000));
        assert!(!config.daemon.require_root);
        assert_eq!(config.daemon.event_timeout(), Duration::from_secs(10));
        assert_eq!(
            config.worker.program,
            PathBuf::from("/usr/lib/hotplug/worker")
        );
    }

    #[test]
    fn test_config_roundtrips_through_toml() {
        let mut config = HotplugConfig::default();
        config.daemon.trusted_uid = Some(0);
        let text = config.to_toml().unwrap();
        assert_eq!(HotplugConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn config_reject_legacy_timeout() {
        let toml = r"
            [daemon]
            timeout = 5
        ";

        match HotplugConfig::from_toml(toml).unwrap_err() {
            ConfigError::Validation(msg) => {
                assert!(
                    msg.contains("event_timeout_secs"),
                    "Error should name the replacement key: {msg}"
                );
            },
            other => panic!("Expected ConfigError::Validation, got {other:?}"),
        }
    }

    #[test]
    fn config_rejects_zero_timeout() {
        let toml = r"
            [daemon]
            event_timeout_secs = 0
        ";

        assert!(matches!(
            HotplugConfig::from_toml(toml),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn config_rejects_empty_worker_program() {
        let toml = r#"
            [worker]
            program = ""
        "#;

        assert!(matches!(
            HotplugConfig::from_toml(toml),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn config_rejects_unknown_worker_key() {
        let toml = r#"
            [worker]
            program = "/bin/true"
            args = ["x"]
        "#;

        assert!(matches!(
            HotplugConfig::from_toml(toml),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_from_file_reads_toml() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("hotplugd.toml");
        std::fs::write(&path, "[daemon]\nevent_timeout_secs = 3\n").unwrap();

        let config = HotplugConfig::from_file(&path).unwrap();
        assert_eq!(config.daemon.event_timeout_secs, 3);
    }

    #[test]
    fn test_from_file_missing_is_io_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = HotplugConfig::from_file(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
