//! Configuration file support for rtccal.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (RTCCAL_*)
//! 3. File given with `--config`
//! 4. Local config file (./rtccal.toml)
//! 5. Global config file (~/.config/rtccal/config.toml)
//!
//! A file that cannot be read or parsed is reported and skipped.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use log::{debug, warn};
use rtccal::SessionConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the per-directory config file.
pub const LOCAL_CONFIG: &str = "rtccal.toml";

/// Largest accepted `timing.max_spin_secs`. The clock latch holds a CPU core
/// for up to this long.
pub const MAX_SPIN_CEILING: Duration = Duration::from_secs(10);

/// Serial connection settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Baud rate of the calibration firmware.
    pub baud: Option<u32>,
    /// Per-read timeout in seconds.
    pub read_timeout_secs: Option<f64>,
    /// Per-write timeout in seconds.
    pub write_timeout_secs: Option<f64>,
}

/// Protocol timing settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Bound for each marker wait in a short exchange, in seconds.
    pub command_timeout_secs: Option<f64>,
    /// Nominal oscillator frequency.
    pub tick_frequency_hz: Option<u32>,
    /// Longest acceptable busy-wait when setting the clock, in seconds.
    pub max_spin_secs: Option<f64>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection configuration.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Timing configuration.
    #[serde(default)]
    pub timing: TimingConfig,
    /// Settle time overrides in seconds, keyed by window name.
    #[serde(default)]
    pub windows: BTreeMap<String, f64>,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load(explicit: Option<&Path>) -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
        }

        if let Some(path) = explicit {
            config.merge(Self::load_from_path(path));
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "rtccal").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        let conn = other.connection;
        if conn.baud.is_some() {
            self.connection.baud = conn.baud;
        }
        if conn.read_timeout_secs.is_some() {
            self.connection.read_timeout_secs = conn.read_timeout_secs;
        }
        if conn.write_timeout_secs.is_some() {
            self.connection.write_timeout_secs = conn.write_timeout_secs;
        }

        let timing = other.timing;
        if timing.command_timeout_secs.is_some() {
            self.timing.command_timeout_secs = timing.command_timeout_secs;
        }
        if timing.tick_frequency_hz.is_some() {
            self.timing.tick_frequency_hz = timing.tick_frequency_hz;
        }
        if timing.max_spin_secs.is_some() {
            self.timing.max_spin_secs = timing.max_spin_secs;
        }

        self.windows.extend(other.windows);
    }

    /// Session parameters with file settings applied over the defaults.
    pub fn session_config(&self) -> Result<SessionConfig> {
        let mut session = SessionConfig::default();
        if let Some(secs) = self.timing.command_timeout_secs {
            session = session.with_command_timeout(seconds(secs, "timing.command_timeout_secs")?);
        }
        if let Some(secs) = self.timing.max_spin_secs {
            let max_spin = seconds(secs, "timing.max_spin_secs")?;
            anyhow::ensure!(
                max_spin <= MAX_SPIN_CEILING,
                "timing.max_spin_secs must not exceed {} s, got {secs}",
                MAX_SPIN_CEILING.as_secs()
            );
            session = session.with_max_spin(max_spin);
        }
        if let Some(hz) = self.timing.tick_frequency_hz {
            anyhow::ensure!(hz > 0, "timing.tick_frequency_hz must be positive");
            session = session.with_tick_frequency(hz);
        }
        Ok(session)
    }
}

/// Convert a seconds value from the config or command line.
pub fn seconds(value: f64, what: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value).with_context(|| format!("invalid duration for {what}: {value}"))
}
