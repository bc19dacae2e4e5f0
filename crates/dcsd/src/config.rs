//! Daemon configuration.
//!
//! Sources are layered: built-in defaults, then an optional TOML file, then
//! `DCS_*` environment variables. The binary applies CLI flags last.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use dcs_core::{DomainError, Lease, MAX_LEASE_SECONDS};
use serde::Deserialize;
use thiserror::Error;

/// Default listen address.
pub const DEFAULT_LISTEN: &str = "127.0.0.1:60620";

/// Environment variable overriding `listen`.
pub const ENV_LISTEN: &str = "DCS_LISTEN";

/// Environment variable overriding `device_file`.
pub const ENV_DEVICES: &str = "DCS_DEVICES";

/// Environment variable overriding `state_dir`.
pub const ENV_STATE_DIR: &str = "DCS_STATE_DIR";

/// Shortest reaper interval, in seconds.
const MIN_REAPER_INTERVAL_SECS: f64 = 0.25;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Runtime configuration for the coordination daemon.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Address the HTTP/WebSocket server binds
    pub listen: SocketAddr,
    /// Device catalog file (TOML, or JSON by extension)
    pub device_file: Option<PathBuf>,
    /// Lease applied when a request names none
    pub lease_duration_seconds: f64,
    /// Longest lease a client may request
    pub max_lease_seconds: f64,
    /// Reaper sweep interval; a quarter of the default lease when unset
    pub reaper_interval_seconds: Option<f64>,
    /// Sessions silent for longer than this are disconnected
    pub heartbeat_timeout_seconds: f64,
    /// Directory for the PID and log files; the platform state directory
    /// when unset
    pub state_dir: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 60620)),
            device_file: None,
            lease_duration_seconds: 30.0,
            max_lease_seconds: 3600.0,
            reaper_interval_seconds: None,
            heartbeat_timeout_seconds: 60.0,
            state_dir: None,
        }
    }
}

impl DaemonConfig {
    /// Loads configuration from an optional TOML file and the process
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read or parsed, an
    /// environment override is malformed, or the result fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a TOML config file without applying overrides.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Applies `DCS_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_LISTEN) {
            self.listen = value.parse().map_err(|_| ConfigError::InvalidValue {
                key: ENV_LISTEN.to_string(),
                value,
            })?;
        }
        if let Some(value) = lookup(ENV_DEVICES) {
            if !value.is_empty() {
                self.device_file = Some(PathBuf::from(value));
            }
        }
        if let Some(value) = lookup(ENV_STATE_DIR) {
            if !value.is_empty() {
                self.state_dir = Some(PathBuf::from(value));
            }
        }
        Ok(())
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.max_lease_seconds.is_finite() && self.max_lease_seconds > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "max_lease_seconds must be positive, got {}",
                self.max_lease_seconds
            )));
        }
        if self.max_lease_seconds > MAX_LEASE_SECONDS {
            return Err(ConfigError::Invalid(format!(
                "max_lease_seconds must be at most {MAX_LEASE_SECONDS}, got {}",
                self.max_lease_seconds
            )));
        }
        self.default_lease()
            .map_err(|e| ConfigError::Invalid(format!("lease_duration_seconds: {e}")))?;

        if !(self.heartbeat_timeout_seconds.is_finite() && self.heartbeat_timeout_seconds > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "heartbeat_timeout_seconds must be positive, got {}",
                self.heartbeat_timeout_seconds
            )));
        }
        if let Some(interval) = self.reaper_interval_seconds {
            if !(interval.is_finite() && interval > 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "reaper_interval_seconds must be positive, got {interval}"
                )));
            }
        }
        Ok(())
    }

    /// The default lease as a validated `Lease`.
    pub fn default_lease(&self) -> Result<Lease, DomainError> {
        Lease::from_secs_f64(self.lease_duration_seconds, self.max_lease_seconds)
    }

    /// Interval between reaper sweeps.
    pub fn reaper_interval(&self) -> Duration {
        let secs = self
            .reaper_interval_seconds
            .unwrap_or(self.lease_duration_seconds / 4.0)
            .max(MIN_REAPER_INTERVAL_SECS);
        Duration::from_secs_f64(secs)
    }

    /// Heartbeat timeout as a chrono duration for timestamp arithmetic.
    pub fn heartbeat_timeout(&self) -> chrono::Duration {
        chrono::Duration::milliseconds((self.heartbeat_timeout_seconds * 1000.0).round() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.listen.to_string(), DEFAULT_LISTEN);
        assert_eq!(config.reaper_interval(), Duration::from_secs_f64(7.5));
        assert_eq!(config.default_lease().unwrap().as_millis(), 30_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_reaper_interval_floor() {
        let config = DaemonConfig {
            lease_duration_seconds: 0.5,
            ..DaemonConfig::default()
        };
        assert_eq!(config.reaper_interval(), Duration::from_millis(250));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
listen = "0.0.0.0:7000"
device_file = "/etc/dcs/devices.toml"
lease_duration_seconds = 10
reaper_interval_seconds = 1.5
"#
        )
        .unwrap();

        let config = DaemonConfig::from_file(file.path()).unwrap();
        assert_eq!(config.listen.port(), 7000);
        assert_eq!(config.device_file, Some(PathBuf::from("/etc/dcs/devices.toml")));
        assert_eq!(config.lease_duration_seconds, 10.0);
        assert_eq!(config.reaper_interval(), Duration::from_millis(1500));
        assert_eq!(config.heartbeat_timeout_seconds, 60.0);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "lease_seconds = 10").unwrap();

        let err = DaemonConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_LISTEN, "127.0.0.1:9999"),
            (ENV_DEVICES, "/tmp/devices.json"),
            (ENV_STATE_DIR, "/var/lib/dcs"),
        ]
        .into_iter()
        .collect();

        let mut config = DaemonConfig::default();
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.listen.port(), 9999);
        assert_eq!(config.device_file, Some(PathBuf::from("/tmp/devices.json")));
        assert_eq!(config.state_dir, Some(PathBuf::from("/var/lib/dcs")));
    }

    #[test]
    fn test_bad_env_listen() {
        let mut config = DaemonConfig::default();
        let err = config
            .apply_env(|key| (key == ENV_LISTEN).then(|| "not-an-addr".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_LISTEN));
    }

    #[test]
    fn test_validation_rejects_lease_over_max() {
        let config = DaemonConfig {
            lease_duration_seconds: 120.0,
            max_lease_seconds: 60.0,
            ..DaemonConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validation_rejects_unbounded_max_lease() {
        let config = DaemonConfig {
            max_lease_seconds: 1e15,
            ..DaemonConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = DaemonConfig {
            max_lease_seconds: MAX_LEASE_SECONDS,
            ..DaemonConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_heartbeat() {
        let config = DaemonConfig {
            heartbeat_timeout_seconds: 0.0,
            ..DaemonConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
