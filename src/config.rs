//! Static configuration snapshot for a mirror run.
//!
//! Configuration is layered: built-in defaults, then an optional TOML file,
//! then `CORPUS_MIRROR_*` environment variables, then CLI flags (applied by
//! the binary). [`EngineConfig::validate`] runs once before any work starts.
//!
//! # Example
//!
//! ```no_run
//! use mirror_core::EngineConfig;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = EngineConfig::load("corpus-mirror.toml")?;
//! config.apply_env_overrides()?;
//! config.validate()?;
//! # Ok(())
//! # }
//! ```

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::download::constants::{
    CONNECT_TIMEOUT_SECS, DEFAULT_CONCURRENCY, DEFAULT_PROGRESS_INTERVAL_BYTES,
    DEFAULT_SAVE_INTERVAL_ITEMS, MAX_CONCURRENCY, MIN_CONCURRENCY, STALL_TIMEOUT_SECS,
};
use crate::download::disk_guard::{DEFAULT_CHECK_INTERVAL, DEFAULT_MIN_FREE_SPACE_BYTES};
use crate::download::rate_governor::{DEFAULT_REQUEST_WINDOW, DEFAULT_SUCCESS_STREAK};
use crate::download::{
    DEFAULT_MAX_ATTEMPTS, RateGovernorConfig, RetryPolicy, TransferSettings,
};

/// Default corpus root.
pub const DEFAULT_BASE_URL: &str = "https://ftp.ncbi.nlm.nih.gov/pubchem/RDF/";

/// Categories mirrored when none are configured.
pub const DEFAULT_CATEGORIES: &[&str] = &[
    "compound",
    "substance",
    "bioassay",
    "protein",
    "gene",
    "taxonomy",
    "pathway",
];

/// Upper bound for any configured delay, in seconds.
const MAX_DELAY_CEILING_SECS: f64 = 600.0;

/// Accepted `logging.level` values.
const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Rotated log files older than this are removed by `--cleanup-logs`.
pub const DEFAULT_LOG_RETENTION_DAYS: u32 = 30;

/// Errors loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read or written.
    #[error("config file {path}: {source}")]
    Io {
        /// Config file path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML for this schema.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// Config file path.
        path: PathBuf,
        /// The underlying parse error.
        #[source]
        source: toml::de::Error,
    },

    /// `--create-config` target already exists.
    #[error("refusing to overwrite existing config file {0}")]
    AlreadyExists(PathBuf),

    /// An environment override could not be parsed.
    #[error("invalid value for {var}: {value:?}")]
    Env {
        /// Variable name.
        var: &'static str,
        /// Raw value.
        value: String,
    },

    /// A value is outside its allowed range.
    #[error("invalid config value for `{field}`: {value}. Expected: {expected}")]
    Invalid {
        /// Dotted field name.
        field: &'static str,
        /// Offending value.
        value: String,
        /// Accepted range or set.
        expected: String,
    },
}

impl ConfigError {
    fn invalid(field: &'static str, value: impl ToString, expected: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            value: value.to_string(),
            expected: expected.into(),
        }
    }
}

/// Rate governor bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateConfig {
    /// Delay before any feedback, in seconds.
    pub initial_delay_secs: f64,
    /// Delay floor, in seconds.
    pub min_delay_secs: f64,
    /// Delay ceiling, in seconds.
    pub max_delay_secs: f64,
    /// Consecutive successes before the delay shrinks.
    pub success_streak: u32,
    /// Requests allowed in any 60-second window; 0 disables the cap.
    pub max_requests_per_minute: u32,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: 2.0,
            min_delay_secs: 0.5,
            max_delay_secs: 30.0,
            success_streak: DEFAULT_SUCCESS_STREAK,
            max_requests_per_minute: 0,
        }
    }
}

/// Disk guard settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiskConfig {
    /// Free-space floor in bytes.
    pub min_free_space_bytes: u64,
    /// Sampling interval in seconds.
    pub check_interval_secs: u64,
    /// Delete orphaned partial files once per pressure episode.
    pub reclaim_on_pressure: bool,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            min_free_space_bytes: DEFAULT_MIN_FREE_SPACE_BYTES,
            check_interval_secs: DEFAULT_CHECK_INTERVAL.as_secs(),
            reclaim_on_pressure: true,
        }
    }
}

/// Ledger file settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LedgerConfig {
    /// Snapshot file path.
    pub path: PathBuf,
    /// Terminal updates between snapshots.
    pub save_interval_items: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/download_progress.json"),
            save_interval_items: DEFAULT_SAVE_INTERVAL_ITEMS,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` and CLI flags are absent.
    pub level: String,
    /// Optional log file; rotated daily.
    pub file: Option<PathBuf>,
    /// Age in days after which `--cleanup-logs` deletes rotated files.
    pub retention_days: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            retention_days: DEFAULT_LOG_RETENTION_DAYS,
        }
    }
}

/// Complete configuration for one mirror run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Corpus root URL.
    pub base_url: String,
    /// Local storage root.
    pub data_dir: PathBuf,
    /// Top-level categories to mirror.
    pub categories: Vec<String>,
    /// Worker pool size.
    pub max_concurrent: usize,
    /// Attempts per item before it stays failed.
    pub max_attempts: u32,
    /// Connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Stall timeout for responses and body reads, in seconds.
    pub transfer_timeout_secs: u64,
    /// Bytes between durability checkpoints.
    pub progress_interval_bytes: u64,
    /// Rate governor bounds.
    pub rate: RateConfig,
    /// Disk guard settings.
    pub disk: DiskConfig,
    /// Ledger settings.
    pub ledger: LedgerConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            data_dir: PathBuf::from("data/pubchem_rdf"),
            categories: DEFAULT_CATEGORIES.iter().map(|c| (*c).to_string()).collect(),
            max_concurrent: DEFAULT_CONCURRENCY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            connect_timeout_secs: CONNECT_TIMEOUT_SECS,
            transfer_timeout_secs: STALL_TIMEOUT_SECS,
            progress_interval_bytes: DEFAULT_PROGRESS_INTERVAL_BYTES,
            rate: RateConfig::default(),
            disk: DiskConfig::default(),
            ledger: LedgerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Loads a TOML config file; missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read and
    /// [`ConfigError::Parse`] for invalid TOML or unknown keys.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Returns the commented default config file.
    #[must_use]
    pub fn default_toml() -> String {
        let defaults = Self::default();
        let categories = defaults
            .categories
            .iter()
            .map(|c| format!("\"{c}\""))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            r#"# corpus-mirror configuration.
# Every key is optional; shown values are the defaults.

# Corpus root (an Apache-style directory index).
base_url = "{base_url}"
# Local storage root for mirrored files.
data_dir = "{data_dir}"
# Top-level categories to mirror.
categories = [{categories}]
# Concurrent transfers (1..=20).
max_concurrent = {max_concurrent}
# Attempts per item before it stays failed (1..=10).
max_attempts = {max_attempts}
connect_timeout_secs = {connect}
# A response or body read idle this long fails the attempt.
transfer_timeout_secs = {transfer}
# Bytes between fsync checkpoints.
progress_interval_bytes = {progress}

[rate]
# Delay between requests adapts within [min, max]: doubled on failure,
# shortened by 10% after `success_streak` consecutive successes.
initial_delay_secs = {initial:.1}
min_delay_secs = {min:.1}
max_delay_secs = {max:.1}
success_streak = {streak}
# Requests allowed in any 60-second window (0 = no cap).
max_requests_per_minute = {rpm}

[disk]
# New transfers pause while free space is below this floor.
min_free_space_bytes = {floor}
check_interval_secs = {interval}
# Delete orphaned partial files once per low-space episode.
reclaim_on_pressure = {reclaim}

[ledger]
path = "{ledger_path}"
# Completed/failed items between progress snapshots.
save_interval_items = {save_interval}

[logging]
level = "{level}"
# file = "logs/corpus-mirror.log"
# `--cleanup-logs` deletes rotated log files older than this.
retention_days = {retention}
"#,
            base_url = defaults.base_url,
            data_dir = defaults.data_dir.display(),
            max_concurrent = defaults.max_concurrent,
            max_attempts = defaults.max_attempts,
            connect = defaults.connect_timeout_secs,
            transfer = defaults.transfer_timeout_secs,
            progress = defaults.progress_interval_bytes,
            initial = defaults.rate.initial_delay_secs,
            min = defaults.rate.min_delay_secs,
            max = defaults.rate.max_delay_secs,
            streak = defaults.rate.success_streak,
            rpm = defaults.rate.max_requests_per_minute,
            floor = defaults.disk.min_free_space_bytes,
            interval = defaults.disk.check_interval_secs,
            reclaim = defaults.disk.reclaim_on_pressure,
            ledger_path = defaults.ledger.path.display(),
            save_interval = defaults.ledger.save_interval_items,
            level = defaults.logging.level,
            retention = defaults.logging.retention_days,
        )
    }

    /// Writes [`EngineConfig::default_toml`] to `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::AlreadyExists`] rather than overwriting, or
    /// [`ConfigError::Io`] if the file cannot be written.
    pub fn write_default(path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            return Err(ConfigError::AlreadyExists(path.to_path_buf()));
        }
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        fs::write(path, Self::default_toml()).map_err(io_err)
    }

    /// Applies `CORPUS_MIRROR_*` overrides from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Env`] for a value that does not parse.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_env_overrides_from(|name| env::var(name).ok())
    }

    /// Applies overrides using `lookup` as the environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Env`] for a value that does not parse.
    pub fn apply_env_overrides_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(value) = get("CORPUS_MIRROR_BASE_URL") {
            self.base_url = value;
        }
        if let Some(value) = get("CORPUS_MIRROR_DATA_DIR") {
            self.data_dir = PathBuf::from(value);
        }
        if let Some(value) = get("CORPUS_MIRROR_LEDGER_PATH") {
            self.ledger.path = PathBuf::from(value);
        }
        if let Some(value) = get("CORPUS_MIRROR_MAX_CONCURRENT") {
            self.max_concurrent = parse_env("CORPUS_MIRROR_MAX_CONCURRENT", &value)?;
        }
        if let Some(value) = get("CORPUS_MIRROR_INITIAL_DELAY") {
            let delay = parse_env("CORPUS_MIRROR_INITIAL_DELAY", &value)?;
            self.set_initial_delay(delay);
        }
        if let Some(value) = get("CORPUS_MIRROR_MAX_REQUESTS_PER_MINUTE") {
            self.rate.max_requests_per_minute =
                parse_env("CORPUS_MIRROR_MAX_REQUESTS_PER_MINUTE", &value)?;
        }
        if let Some(value) = get("CORPUS_MIRROR_MIN_FREE_SPACE_BYTES") {
            self.disk.min_free_space_bytes =
                parse_env("CORPUS_MIRROR_MIN_FREE_SPACE_BYTES", &value)?;
        }
        if let Some(value) = get("CORPUS_MIRROR_LOG_LEVEL") {
            self.logging.level = value.to_lowercase();
        }
        Ok(())
    }

    /// Sets the initial delay, widening the bounds to contain it.
    pub fn set_initial_delay(&mut self, secs: f64) {
        self.rate.initial_delay_secs = secs;
        if secs < self.rate.min_delay_secs {
            self.rate.min_delay_secs = secs;
        }
        if secs > self.rate.max_delay_secs {
            self.rate.max_delay_secs = secs;
        }
    }

    /// Checks every value against its allowed range.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError::Invalid`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if url::Url::parse(&self.base_url)
            .map(|u| !matches!(u.scheme(), "http" | "https"))
            .unwrap_or(true)
        {
            return Err(ConfigError::invalid(
                "base_url",
                &self.base_url,
                "an http(s) URL",
            ));
        }
        if self.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::invalid("data_dir", "\"\"", "a non-empty path"));
        }
        if self.categories.is_empty() {
            return Err(ConfigError::invalid("categories", "[]", "at least one category"));
        }
        if let Some(bad) = self
            .categories
            .iter()
            .find(|c| crate::remote::normalize_remote_path(c).is_none())
        {
            return Err(ConfigError::invalid(
                "categories",
                format!("{bad:?}"),
                "relative corpus paths without `..`",
            ));
        }
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&self.max_concurrent) {
            return Err(ConfigError::invalid(
                "max_concurrent",
                self.max_concurrent,
                format!("{MIN_CONCURRENCY}..={MAX_CONCURRENCY}"),
            ));
        }
        if !(1..=10).contains(&self.max_attempts) {
            return Err(ConfigError::invalid("max_attempts", self.max_attempts, "1..=10"));
        }
        validate_timeout_secs("connect_timeout_secs", self.connect_timeout_secs)?;
        validate_timeout_secs("transfer_timeout_secs", self.transfer_timeout_secs)?;
        if self.progress_interval_bytes < 64 * 1024 {
            return Err(ConfigError::invalid(
                "progress_interval_bytes",
                self.progress_interval_bytes,
                ">= 65536",
            ));
        }
        self.validate_rate()?;
        if !(1..=86_400).contains(&self.disk.check_interval_secs) {
            return Err(ConfigError::invalid(
                "disk.check_interval_secs",
                self.disk.check_interval_secs,
                "1..=86400",
            ));
        }
        if !(1..=1000).contains(&self.ledger.save_interval_items) {
            return Err(ConfigError::invalid(
                "ledger.save_interval_items",
                self.ledger.save_interval_items,
                "1..=1000",
            ));
        }
        if self.ledger.path.as_os_str().is_empty() {
            return Err(ConfigError::invalid("ledger.path", "\"\"", "a non-empty path"));
        }
        if !LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::invalid(
                "logging.level",
                &self.logging.level,
                LOG_LEVELS.join("|"),
            ));
        }
        if !(1..=3650).contains(&self.logging.retention_days) {
            return Err(ConfigError::invalid(
                "logging.retention_days",
                self.logging.retention_days,
                "1..=3650",
            ));
        }
        Ok(())
    }

    fn validate_rate(&self) -> Result<(), ConfigError> {
        let rate = &self.rate;
        let ordered = 0.0 <= rate.min_delay_secs
            && rate.min_delay_secs <= rate.initial_delay_secs
            && rate.initial_delay_secs <= rate.max_delay_secs
            && rate.max_delay_secs <= MAX_DELAY_CEILING_SECS;
        if !ordered {
            return Err(ConfigError::invalid(
                "rate",
                format!(
                    "min={} initial={} max={}",
                    rate.min_delay_secs, rate.initial_delay_secs, rate.max_delay_secs
                ),
                format!("0 <= min <= initial <= max <= {MAX_DELAY_CEILING_SECS}"),
            ));
        }
        if !(1..=100).contains(&rate.success_streak) {
            return Err(ConfigError::invalid(
                "rate.success_streak",
                rate.success_streak,
                "1..=100",
            ));
        }
        if rate.max_requests_per_minute > 6000 {
            return Err(ConfigError::invalid(
                "rate.max_requests_per_minute",
                rate.max_requests_per_minute,
                "0..=6000",
            ));
        }
        Ok(())
    }

    /// Rate governor tunables derived from `[rate]`.
    #[must_use]
    pub fn rate_governor_config(&self) -> RateGovernorConfig {
        RateGovernorConfig {
            initial_delay: Duration::from_secs_f64(self.rate.initial_delay_secs.max(0.0)),
            min_delay: Duration::from_secs_f64(self.rate.min_delay_secs.max(0.0)),
            max_delay: Duration::from_secs_f64(self.rate.max_delay_secs.max(0.0)),
            success_streak: self.rate.success_streak,
            max_requests_per_window: self.rate.max_requests_per_minute,
            request_window: DEFAULT_REQUEST_WINDOW,
            ..RateGovernorConfig::default()
        }
    }

    /// Retry policy derived from `max_attempts`.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_max_attempts(self.max_attempts)
    }

    /// Transfer settings derived from this config.
    #[must_use]
    pub fn transfer_settings(&self) -> TransferSettings {
        TransferSettings {
            root: self.data_dir.clone(),
            progress_interval: self.progress_interval_bytes,
            stall_timeout: Duration::from_secs(self.transfer_timeout_secs),
        }
    }

    /// Disk sampling interval.
    #[must_use]
    pub fn disk_check_interval(&self) -> Duration {
        Duration::from_secs(self.disk.check_interval_secs)
    }
}

/// Resolves the default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/corpus-mirror/config.toml`
/// 2. `$HOME/.config/corpus-mirror/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(
            PathBuf::from(xdg_config_home)
                .join("corpus-mirror")
                .join("config.toml"),
        );
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("corpus-mirror")
            .join("config.toml"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

fn parse_env<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Env {
        var,
        value: value.to_string(),
    })
}

fn validate_timeout_secs(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if !(1..=3600).contains(&value) {
        return Err(ConfigError::invalid(field, value, "1..=3600"));
    }
    Ok(())
}
