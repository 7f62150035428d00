//! Daemon and worker configuration.
//!
//! Loaded from a TOML file. A missing file yields the defaults, so the daemon
//! runs out of the box; a present but invalid file is an error.
//!
//! ```toml
//! socket_path = "/tmp/maintd.sock"
//! max_worker_slots = 8
//! max_worker_processes = 8
//! restart_delay_secs = 5
//! startup_timeout_secs = 30
//! naptime_ms = 5000
//! default_owner = 10
//!
//! [owners]
//! 16384 = 10
//! ```

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use maint_core::{PrincipalId, UnitId};

/// Default socket path
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/maintd.sock";

/// Environment variable overriding the socket path.
pub const SOCKET_ENV: &str = "MAINT_SOCKET";

/// Default number of units the registry can track.
pub const DEFAULT_MAX_WORKER_SLOTS: usize = 8;

/// Default number of worker processes the process manager may run.
pub const DEFAULT_MAX_WORKER_PROCESSES: usize = 8;

/// Default delay before a stopped worker is relaunched.
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(5);

/// Default bound on the wait for a worker's startup handshake.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout of the worker's wait between cycles.
pub const DEFAULT_NAPTIME: Duration = Duration::from_millis(5000);

/// Configuration shared by the daemon and its workers.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Unix socket the control server listens on
    pub socket_path: PathBuf,

    /// Capacity of the unit registry
    pub max_worker_slots: usize,

    /// Worker processes the process manager may run at once
    pub max_worker_processes: usize,

    pub restart_delay_secs: u64,

    pub startup_timeout_secs: u64,

    /// Worker wait timeout between check cycles
    pub naptime_ms: u64,

    /// Principal used for units without an explicit owner
    pub default_owner: Option<u32>,

    /// Per-unit owners, keyed by unit id (TOML keys are strings)
    pub owners: BTreeMap<String, u32>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            max_worker_slots: DEFAULT_MAX_WORKER_SLOTS,
            max_worker_processes: DEFAULT_MAX_WORKER_PROCESSES,
            restart_delay_secs: DEFAULT_RESTART_DELAY.as_secs(),
            startup_timeout_secs: DEFAULT_STARTUP_TIMEOUT.as_secs(),
            naptime_ms: DEFAULT_NAPTIME.as_millis() as u64,
            default_owner: None,
            owners: BTreeMap::new(),
        }
    }
}

impl DaemonConfig {
    /// Default config file location (`<config_dir>/maintd/config.toml`).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("maintd").join("config.toml"))
    }

    /// Loads configuration from `path`, or from the default location.
    ///
    /// The `MAINT_SOCKET` environment variable overrides `socket_path`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path.map(Path::to_path_buf).or_else(Self::default_path) {
            Some(path) if path.exists() => Self::from_file(&path)?,
            Some(path) => {
                debug!(path = %path.display(), "No config file, using defaults");
                Self::default()
            }
            None => Self::default(),
        };

        if let Ok(socket) = env::var(SOCKET_ENV) {
            config.socket_path = PathBuf::from(socket);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        let config = Self::from_toml(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Parses TOML text without touching the environment.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_worker_slots == 0 {
            return Err(ConfigError::Invalid {
                field: "max_worker_slots",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_worker_processes == 0 {
            return Err(ConfigError::Invalid {
                field: "max_worker_processes",
                reason: "must be at least 1".to_string(),
            });
        }
        // owner_of looks keys up by the unit's canonical form
        if let Some(key) = self
            .owners
            .keys()
            .find(|k| !matches!(k.parse::<UnitId>(), Ok(unit) if unit.to_string() == **k))
        {
            return Err(ConfigError::Invalid {
                field: "owners",
                reason: format!("'{key}' is not a unit id in canonical form"),
            });
        }
        if self.restart_delay_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "restart_delay_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.startup_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "startup_timeout_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.naptime_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "naptime_ms",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn naptime(&self) -> Duration {
        Duration::from_millis(self.naptime_ms)
    }

    /// Owner configured for `unit`, falling back to `default_owner`.
    pub fn owner_of(&self, unit: UnitId) -> Option<PrincipalId> {
        self.owners
            .get(&unit.to_string())
            .copied()
            .or(self.default_owner)
            .map(PrincipalId::new)
    }
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {error}")]
    Read { path: PathBuf, error: String },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.max_worker_slots, 8);
        assert_eq!(config.restart_delay(), Duration::from_secs(5));
        assert_eq!(config.naptime(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_file() {
        let config = DaemonConfig::from_toml(
            r#"
            socket_path = "/run/maintd.sock"
            max_worker_slots = 2
            naptime_ms = 250
            default_owner = 10

            [owners]
            16384 = 20
            "#,
        )
        .unwrap();

        assert_eq!(config.socket_path, PathBuf::from("/run/maintd.sock"));
        assert_eq!(config.max_worker_slots, 2);
        assert_eq!(config.max_worker_processes, DEFAULT_MAX_WORKER_PROCESSES);
        assert_eq!(config.naptime(), Duration::from_millis(250));
        assert_eq!(config.owner_of(UnitId::new(16384)), Some(PrincipalId::new(20)));
        assert_eq!(config.owner_of(UnitId::new(1)), Some(PrincipalId::new(10)));
    }

    #[test]
    fn test_owner_without_default() {
        let config = DaemonConfig::default();
        assert_eq!(config.owner_of(UnitId::new(1)), None);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = DaemonConfig::from_toml("max_slots = 3").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_non_numeric_owner_key_invalid() {
        let config = DaemonConfig::from_toml("[owners]\nsales = 3").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("sales"));
    }

    #[test]
    fn test_non_canonical_owner_keys_invalid() {
        for key in ["\"007\"", "\" 7 \"", "\"+7\""] {
            let config = DaemonConfig::from_toml(&format!("[owners]\n{key} = 3")).unwrap();
            let err = config.validate().unwrap_err();
            assert!(
                matches!(err, ConfigError::Invalid { field: "owners", .. }),
                "{key} accepted"
            );
        }

        let config = DaemonConfig::from_toml("[owners]\n7 = 3").unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.owner_of(UnitId::new(7)), Some(PrincipalId::new(3)));
    }

    #[test]
    fn test_zero_restart_delay_invalid() {
        let config = DaemonConfig::from_toml("restart_delay_secs = 0").unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "restart_delay_secs", .. }));
    }

    #[test]
    fn test_zero_startup_timeout_invalid() {
        let config = DaemonConfig::from_toml("startup_timeout_secs = 0").unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "startup_timeout_secs", .. }));
    }

    #[test]
    fn test_zero_slots_invalid() {
        let config = DaemonConfig::from_toml("max_worker_slots = 0").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_worker_slots"));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "naptime_ms = 100").unwrap();

        let config = DaemonConfig::from_file(file.path()).unwrap();
        assert_eq!(config.naptime_ms, 100);
    }

    #[test]
    fn test_from_missing_file() {
        let err = DaemonConfig::from_file(Path::new("/nonexistent/maintd.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
