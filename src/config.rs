//! Configuration module for pingwatch.
//!
//! File locations are loaded from environment variables with sensible
//! defaults. Monitor parameters live in a `key=value` settings file that is
//! validated on load and re-read whenever it changes on disk.

use std::env;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;

use crate::monitor::HealthPolicy;
use crate::probe::ProbeParams;

/// Application paths loaded from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Settings file (default: "settings.txt")
    pub settings_path: PathBuf,
    /// Transition log file (default: "log.txt")
    pub log_path: PathBuf,
    /// Target list to monitor at startup
    pub hosts_file: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            settings_path: PathBuf::from("settings.txt"),
            log_path: PathBuf::from("log.txt"),
            hosts_file: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PINGWATCH_SETTINGS_PATH`: settings file (default: "settings.txt")
    /// - `PINGWATCH_LOG_PATH`: transition log file (default: "log.txt")
    /// - `PINGWATCH_HOSTS_FILE`: target list loaded at startup
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(path) = env::var("PINGWATCH_SETTINGS_PATH") {
            cfg.settings_path = PathBuf::from(path);
        }

        if let Ok(path) = env::var("PINGWATCH_LOG_PATH") {
            cfg.log_path = PathBuf::from(path);
        }

        if let Ok(path) = env::var("PINGWATCH_HOSTS_FILE") {
            cfg.hosts_file = Some(PathBuf::from(path));
        }

        cfg
    }
}

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("line {0}: expected key=value")]
    Syntax(usize),
    #[error("unknown setting: {0}")]
    UnknownKey(String),
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
    #[error("{key} = {value} is outside {min}..={max}")]
    OutOfRange {
        key: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },
}

/// Runtime parameters shared by every host monitor.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub buffer_size: usize,
    pub ttl: u32,
    pub statistics_capacity: usize,
    pub dock_threshold_ms: u64,
    pub log_retention_hours: u64,
    pub ignore_dock_in_log: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            timeout_ms: 4000,
            buffer_size: 32,
            ttl: 128,
            statistics_capacity: 100,
            dock_threshold_ms: 400,
            log_retention_hours: 72,
            ignore_dock_in_log: false,
        }
    }
}

fn check_range(key: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            key,
            value,
            min,
            max,
        })
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_flag(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "t" | "true" => Ok(true),
        "0" | "f" | "false" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

impl MonitorConfig {
    /// Parse a settings file body. Keys not present keep their defaults.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        for (index, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or(ConfigError::Syntax(index + 1))?;
            let (key, value) = (key.trim(), value.trim());

            match key {
                "interval_ms" => cfg.interval_ms = parse_number(key, value)?,
                "timeout_ms" => cfg.timeout_ms = parse_number(key, value)?,
                "buffer_size" => cfg.buffer_size = parse_number(key, value)?,
                "ttl" => cfg.ttl = parse_number(key, value)?,
                "statistics_capacity" => cfg.statistics_capacity = parse_number(key, value)?,
                "dock_threshold_ms" => cfg.dock_threshold_ms = parse_number(key, value)?,
                "log_retention_hours" => cfg.log_retention_hours = parse_number(key, value)?,
                "ignore_dock_in_log" => cfg.ignore_dock_in_log = parse_flag(key, value)?,
                other => return Err(ConfigError::UnknownKey(other.to_string())),
            }
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values outside the supported ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("interval_ms", self.interval_ms, 500, 10_000)?;
        check_range("timeout_ms", self.timeout_ms, 500, 10_000)?;
        check_range("buffer_size", self.buffer_size as u64, 32, 65_500)?;
        check_range("ttl", u64::from(self.ttl), 1, 255)?;
        check_range("statistics_capacity", self.statistics_capacity as u64, 1, 500)?;
        check_range("dock_threshold_ms", self.dock_threshold_ms, 0, 1000)?;
        check_range("log_retention_hours", self.log_retention_hours, 0, 168)?;
        Ok(())
    }

    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    /// Load the settings file, falling back to defaults if it is missing or
    /// rejected.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        match Self::load_file(path) {
            Ok(cfg) => cfg,
            Err(ConfigError::Io(e)) if e.kind() == ErrorKind::NotFound => {
                tracing::info!("No settings at {}, using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Rejected settings in {}: {}; using defaults", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn to_settings_string(&self) -> String {
        format!(
            "interval_ms={}\ntimeout_ms={}\nbuffer_size={}\nttl={}\nstatistics_capacity={}\n\
             dock_threshold_ms={}\nlog_retention_hours={}\nignore_dock_in_log={}\n",
            self.interval_ms,
            self.timeout_ms,
            self.buffer_size,
            self.ttl,
            self.statistics_capacity,
            self.dock_threshold_ms,
            self.log_retention_hours,
            u8::from(self.ignore_dock_in_log),
        )
    }

    /// Persist validated settings.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        self.validate()?;
        std::fs::write(path, self.to_settings_string())?;
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn probe_params(&self) -> ProbeParams {
        ProbeParams {
            buffer_size: self.buffer_size,
            ttl: self.ttl,
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }

    pub fn health_policy(&self) -> HealthPolicy {
        HealthPolicy {
            statistics_capacity: self.statistics_capacity,
            ignore_dock_in_log: self.ignore_dock_in_log,
        }
    }
}

/// Re-reads the settings file when its modification time changes.
pub struct SettingsWatcher {
    path: PathBuf,
    last_modified: Option<SystemTime>,
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

impl SettingsWatcher {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let last_modified = modified(&path);
        Self {
            path,
            last_modified,
        }
    }

    /// Load the file again if it changed since the last poll.
    pub fn poll(&mut self) -> Option<Result<MonitorConfig, ConfigError>> {
        let current = modified(&self.path);
        if current.is_none() || current == self.last_modified {
            return None;
        }
        self.last_modified = current;
        Some(MonitorConfig::load_file(&self.path))
    }
}
