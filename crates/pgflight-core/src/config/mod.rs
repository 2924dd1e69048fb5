//! Typed recorder configuration.
//!
//! Every key has a default, so an empty TOML file is a valid configuration.
//! Ranges are checked once by [`Config::validate`] when a file is loaded or a
//! key is set, never at the point of use.

mod store;

pub use store::ConfigStore;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::model::CostMetric;

/// Smallest and largest ring capacity accepted anywhere.
pub const RING_CAPACITY_MIN: usize = 72;
pub const RING_CAPACITY_MAX: usize = 2880;

/// Error type for configuration loading and mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    UnknownKey(String),
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
    OutOfRange {
        key: String,
        reason: String,
    },
    Io(String),
    Parse(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::UnknownKey(key) => write!(f, "unknown config key '{}'", key),
            ConfigError::InvalidValue { key, value, reason } => {
                write!(f, "invalid value '{}' for '{}': {}", value, key, reason)
            }
            ConfigError::OutOfRange { key, reason } => {
                write!(f, "'{}' out of range: {}", key, reason)
            }
            ConfigError::Io(msg) => write!(f, "config io error: {}", msg),
            ConfigError::Parse(msg) => write!(f, "config parse error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Normal,
    /// Longer interval, used while the server is under stress.
    Emergency,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Normal => "normal",
            Mode::Emergency => "emergency",
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    // Scheduler
    pub enabled: bool,
    pub mode: Mode,
    /// Switch to emergency mode after a shed cycle, back after
    /// `auto_resolve_after` unshed cycles.
    pub auto_mode: bool,
    pub normal_interval_secs: u64,
    pub emergency_interval_secs: u64,
    /// Upper bound of the random delay added before each tick. 0 disables jitter.
    pub jitter_max_secs: u64,
    /// Read all catalogs of a cycle inside one REPEATABLE READ transaction.
    pub snapshot_mode: bool,

    // Governor
    pub shed_connection_ratio: f64,
    pub throttle_connection_ratio: f64,
    /// Transactions per second above which scope is reduced.
    pub max_txn_rate: f64,
    /// Blocks read per second above which scope is reduced.
    pub max_block_io_rate: f64,
    pub lock_timeout_ms: u64,
    pub statement_timeout_ms: u64,
    /// Consecutive cycles with lock timeouts before the breaker opens.
    pub breaker_failure_threshold: u32,
    /// Cycles kept throttled once the breaker opens.
    pub breaker_cooldown_cycles: u32,

    // Storage
    pub ring_capacity: usize,
    pub archive_fsync: bool,
    /// Consecutive cycles with storage failures before the alarm is raised.
    pub storage_alarm_threshold: u32,

    // Aggregation and retention
    /// Raw rows younger than this are never aggregated.
    pub aggregate_after_secs: i64,
    pub aggregate_bucket_secs: i64,
    /// Wall-clock budget of one retention pass before it yields.
    pub retention_budget_ms: u64,
    pub retention_raw_days: u32,
    pub retention_aggregate_days: u32,
    pub retention_collection_stats_days: u32,
    pub retention_storm_days: u32,
    pub retention_regression_days: u32,
    pub retention_anomaly_days: u32,

    // Storm detector
    pub storm_threshold: f64,
    /// Baseline executions per window below which a fingerprint is skipped.
    pub storm_min_baseline: f64,
    pub cache_miss_factor: f64,
    /// Aborted-transaction observations of one fingerprint that mark a retry storm.
    pub retry_aborted_threshold: u32,

    // Regression detector
    pub regression_threshold_pct: f64,
    pub regression_min_calls: i64,
    pub regression_metric: CostMetric,

    /// Clean evaluations before a storm or regression is auto-resolved.
    pub auto_resolve_after: u32,

    // Anomaly rules
    pub idle_in_transaction_secs: i64,
    pub dead_tuple_ratio: f64,
    pub dead_tuple_min: i64,
    pub vacuum_starvation_snapshots: usize,
    pub connection_leak_secs: i64,
    pub replication_lag_min_samples: usize,

    // Forecaster
    pub forecast_min_samples: usize,
    pub forecast_min_r2: f64,
    pub forecast_lead_time_secs: i64,
    /// Disk available to the data directory. 0 means unknown.
    pub disk_capacity_bytes: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: Mode::Normal,
            auto_mode: false,
            normal_interval_secs: 180,
            emergency_interval_secs: 300,
            jitter_max_secs: 15,
            snapshot_mode: true,

            shed_connection_ratio: 0.70,
            throttle_connection_ratio: 0.50,
            max_txn_rate: 1000.0,
            max_block_io_rate: 10_000.0,
            lock_timeout_ms: 50,
            statement_timeout_ms: 5_000,
            breaker_failure_threshold: 3,
            breaker_cooldown_cycles: 5,

            ring_capacity: 120,
            archive_fsync: true,
            storage_alarm_threshold: 5,

            aggregate_after_secs: 3600,
            aggregate_bucket_secs: 3600,
            retention_budget_ms: 5_000,
            retention_raw_days: 7,
            retention_aggregate_days: 90,
            retention_collection_stats_days: 3,
            retention_storm_days: 30,
            retention_regression_days: 30,
            retention_anomaly_days: 30,

            storm_threshold: 3.0,
            storm_min_baseline: 1.0,
            cache_miss_factor: 2.0,
            retry_aborted_threshold: 3,

            regression_threshold_pct: 50.0,
            regression_min_calls: 10,
            regression_metric: CostMetric::BufferOps,

            auto_resolve_after: 3,

            idle_in_transaction_secs: 300,
            dead_tuple_ratio: 0.2,
            dead_tuple_min: 10_000,
            vacuum_starvation_snapshots: 5,
            connection_leak_secs: 7 * 86_400,
            replication_lag_min_samples: 5,

            forecast_min_samples: 10,
            forecast_min_r2: 0.7,
            forecast_lead_time_secs: 3 * 86_400,
            disk_capacity_bytes: 0,
        }
    }
}

fn check(ok: bool, key: &str, reason: impl Into<String>) -> Result<(), ConfigError> {
    if ok {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            key: key.to_string(),
            reason: reason.into(),
        })
    }
}

impl Config {
    /// Loads a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::Io(format!("{}: {}", path.display(), e))),
        };
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check(
            (10..=3600).contains(&self.normal_interval_secs),
            "normal_interval_secs",
            "must be within 10..=3600",
        )?;
        check(
            (10..=7200).contains(&self.emergency_interval_secs),
            "emergency_interval_secs",
            "must be within 10..=7200",
        )?;
        check(self.jitter_max_secs <= 300, "jitter_max_secs", "must be <= 300")?;
        check(
            self.shed_connection_ratio > 0.0 && self.shed_connection_ratio <= 1.0,
            "shed_connection_ratio",
            "must be within (0, 1]",
        )?;
        check(
            self.throttle_connection_ratio > 0.0
                && self.throttle_connection_ratio <= self.shed_connection_ratio,
            "throttle_connection_ratio",
            "must be within (0, shed_connection_ratio]",
        )?;
        check(self.max_txn_rate > 0.0, "max_txn_rate", "must be positive")?;
        check(self.max_block_io_rate > 0.0, "max_block_io_rate", "must be positive")?;
        check(
            (1..=10_000).contains(&self.lock_timeout_ms),
            "lock_timeout_ms",
            "must be within 1..=10000",
        )?;
        check(
            (100..=600_000).contains(&self.statement_timeout_ms),
            "statement_timeout_ms",
            "must be within 100..=600000",
        )?;
        check(
            self.breaker_failure_threshold >= 1,
            "breaker_failure_threshold",
            "must be >= 1",
        )?;
        check(
            self.breaker_cooldown_cycles >= 1,
            "breaker_cooldown_cycles",
            "must be >= 1",
        )?;
        check(
            (RING_CAPACITY_MIN..=RING_CAPACITY_MAX).contains(&self.ring_capacity),
            "ring_capacity",
            format!("must be within {RING_CAPACITY_MIN}..={RING_CAPACITY_MAX}"),
        )?;
        check(
            self.storage_alarm_threshold >= 1,
            "storage_alarm_threshold",
            "must be >= 1",
        )?;
        check(
            (60..=7 * 86_400).contains(&self.aggregate_after_secs),
            "aggregate_after_secs",
            "must be within 60..=604800",
        )?;
        check(
            (60..=86_400).contains(&self.aggregate_bucket_secs),
            "aggregate_bucket_secs",
            "must be within 60..=86400",
        )?;
        check(
            (10..=600_000).contains(&self.retention_budget_ms),
            "retention_budget_ms",
            "must be within 10..=600000",
        )?;
        for (key, days) in [
            ("retention_raw_days", self.retention_raw_days),
            ("retention_aggregate_days", self.retention_aggregate_days),
            (
                "retention_collection_stats_days",
                self.retention_collection_stats_days,
            ),
            ("retention_storm_days", self.retention_storm_days),
            ("retention_regression_days", self.retention_regression_days),
            ("retention_anomaly_days", self.retention_anomaly_days),
        ] {
            check((1..=3650).contains(&days), key, "must be within 1..=3650")?;
        }
        check(
            self.storm_threshold > 1.0 && self.storm_threshold <= 1000.0,
            "storm_threshold",
            "must be within (1, 1000]",
        )?;
        check(
            self.storm_min_baseline >= 0.0,
            "storm_min_baseline",
            "must be >= 0",
        )?;
        check(
            self.cache_miss_factor >= 1.0,
            "cache_miss_factor",
            "must be >= 1",
        )?;
        check(
            self.retry_aborted_threshold >= 1,
            "retry_aborted_threshold",
            "must be >= 1",
        )?;
        check(
            self.regression_threshold_pct > 0.0,
            "regression_threshold_pct",
            "must be positive",
        )?;
        check(
            self.regression_min_calls >= 1,
            "regression_min_calls",
            "must be >= 1",
        )?;
        check(
            (1..=1000).contains(&self.auto_resolve_after),
            "auto_resolve_after",
            "must be within 1..=1000",
        )?;
        check(
            self.idle_in_transaction_secs >= 1,
            "idle_in_transaction_secs",
            "must be >= 1",
        )?;
        check(
            self.dead_tuple_ratio > 0.0 && self.dead_tuple_ratio <= 1.0,
            "dead_tuple_ratio",
            "must be within (0, 1]",
        )?;
        check(self.dead_tuple_min >= 0, "dead_tuple_min", "must be >= 0")?;
        check(
            self.vacuum_starvation_snapshots >= 2,
            "vacuum_starvation_snapshots",
            "must be >= 2",
        )?;
        check(
            self.connection_leak_secs >= 60,
            "connection_leak_secs",
            "must be >= 60",
        )?;
        check(
            self.replication_lag_min_samples >= 3,
            "replication_lag_min_samples",
            "must be >= 3",
        )?;
        check(
            self.forecast_min_samples >= 3,
            "forecast_min_samples",
            "must be >= 3",
        )?;
        check(
            (0.0..=1.0).contains(&self.forecast_min_r2),
            "forecast_min_r2",
            "must be within [0, 1]",
        )?;
        check(
            self.forecast_lead_time_secs >= 0,
            "forecast_lead_time_secs",
            "must be >= 0",
        )?;
        Ok(())
    }

    /// Tick interval for the current mode.
    pub fn interval_secs(&self) -> u64 {
        match self.mode {
            Mode::Normal => self.normal_interval_secs,
            Mode::Emergency => self.emergency_interval_secs,
        }
    }

    pub(crate) fn to_table(&self) -> Result<toml::Table, ConfigError> {
        match toml::Value::try_from(self) {
            Ok(toml::Value::Table(t)) => Ok(t),
            Ok(_) => Err(ConfigError::Parse("config did not serialize to a table".into())),
            Err(e) => Err(ConfigError::Parse(e.to_string())),
        }
    }

    /// Returns a copy with `key` replaced by `raw`, parsed according to the
    /// key's current type and validated as a whole.
    pub fn with_value(&self, key: &str, raw: &str) -> Result<Config, ConfigError> {
        let mut table = self.to_table()?;
        let current = table
            .get(key)
            .ok_or_else(|| ConfigError::UnknownKey(key.to_string()))?;

        let invalid = |reason: String| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.to_string(),
            reason,
        };
        let raw_trimmed = raw.trim();
        let value = match current {
            toml::Value::Boolean(_) => match raw_trimmed {
                "true" | "on" | "1" => toml::Value::Boolean(true),
                "false" | "off" | "0" => toml::Value::Boolean(false),
                _ => return Err(invalid("expected a boolean".into())),
            },
            toml::Value::Integer(_) => raw_trimmed
                .parse::<i64>()
                .map(toml::Value::Integer)
                .map_err(|e| invalid(e.to_string()))?,
            toml::Value::Float(_) => raw_trimmed
                .parse::<f64>()
                .map(toml::Value::Float)
                .map_err(|e| invalid(e.to_string()))?,
            toml::Value::String(_) => toml::Value::String(raw_trimmed.to_string()),
            _ => return Err(invalid("unsupported value type".into())),
        };
        table.insert(key.to_string(), value);

        let updated: Config = toml::Value::Table(table)
            .try_into()
            .map_err(|e: toml::de::Error| invalid(e.to_string()))?;
        updated.validate()?;
        Ok(updated)
    }

    /// Renders one key as a string, without TOML quoting.
    pub fn value_of(&self, key: &str) -> Result<String, ConfigError> {
        let table = self.to_table()?;
        match table.get(key) {
            Some(toml::Value::String(s)) => Ok(s.clone()),
            Some(v) => Ok(v.to_string()),
            None => Err(ConfigError::UnknownKey(key.to_string())),
        }
    }

    /// All key names, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.to_table()
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default()
    }
}
