//! The flight recorder facade: one object behind every operator-facing call.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::analysis::anomaly::anomaly_report;
use crate::analysis::blast::blast_radius;
use crate::analysis::forecast::{forecast_all, forecast_metric};
use crate::analysis::regression::detect_regressions;
use crate::analysis::storm::detect_storms;
use crate::analysis::timeline::{incident_timeline, what_happened_at};
use crate::analysis::{
    AnalysisError, AnomalyReport, BlastRadius, Forecast, ForecastMetric, History, Reconstruction,
    RegressionReport, StormReport, TimelineEvent,
};
use crate::collector::{CycleReport, Scheduler};
use crate::config::{Config, ConfigError, ConfigStore, Mode};
use crate::model::{CollectionOutcome, DataBlock, SampleKind};
use crate::source::StatSource;
use crate::storage::{MaintenanceReport, Slot, Storage, StorageError, run_maintenance};

/// Lookback used by the periodic detection pass.
pub const DEFAULT_LOOKBACK_SECS: i64 = 3_600;
pub const DEFAULT_BASELINE_DAYS: u32 = 7;

#[derive(Debug, Clone, PartialEq)]
pub enum RecorderError {
    Config(ConfigError),
    Storage(StorageError),
}

impl fmt::Display for RecorderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecorderError::Config(e) => write!(f, "{}", e),
            RecorderError::Storage(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for RecorderError {}

impl From<ConfigError> for RecorderError {
    fn from(e: ConfigError) -> Self {
        RecorderError::Config(e)
    }
}

impl From<StorageError> for RecorderError {
    fn from(e: StorageError) -> Self {
        RecorderError::Storage(e)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RecorderStatus {
    pub enabled: bool,
    pub mode: Mode,
    pub config_version: u64,
    pub ring_capacity: usize,
    pub ring_fill: BTreeMap<SampleKind, usize>,
    pub cycles: u64,
    pub last_cycle_at: Option<i64>,
    pub last_outcome: Option<CollectionOutcome>,
    pub last_snapshot_id: Option<u64>,
    pub storage_failure_cycles: u32,
    pub storage_alarm: bool,
    pub breaker_open: bool,
    pub archive_pending: usize,
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

pub struct FlightRecorder<S: StatSource> {
    config: Arc<ConfigStore>,
    storage: Arc<Storage>,
    scheduler: Scheduler<S>,
    /// Ring capacity and fsync last pushed into storage.
    applied: Mutex<(usize, bool)>,
}

impl<S: StatSource> FlightRecorder<S> {
    /// Opens storage under `data_dir` with the store's current config.
    pub fn open(
        source: S,
        config: Arc<ConfigStore>,
        data_dir: impl Into<PathBuf>,
    ) -> Result<Self, RecorderError> {
        let snapshot = config.snapshot();
        let storage = Arc::new(Storage::open(data_dir, &snapshot)?);
        let scheduler = Scheduler::new(source, config.clone(), storage.clone());
        Ok(Self {
            applied: Mutex::new((storage.ring_capacity(), snapshot.archive_fsync)),
            config,
            storage,
            scheduler,
        })
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.snapshot()
    }

    // ------------------------------------------------------------------
    // Control
    // ------------------------------------------------------------------

    pub fn enable(&self) -> Result<(), RecorderError> {
        self.config_set("enabled", "true")
    }

    pub fn disable(&self) -> Result<(), RecorderError> {
        self.config_set("enabled", "false")
    }

    pub fn set_mode(&self, mode: Mode) -> Result<(), RecorderError> {
        self.config_set("mode", mode.as_str())
    }

    pub fn config_get(&self, key: &str) -> Result<String, RecorderError> {
        Ok(self.config.get(key)?)
    }

    /// Validates and applies one key. Storage-level keys take effect
    /// immediately; the rest at the next cycle.
    pub fn config_set(&self, key: &str, value: &str) -> Result<(), RecorderError> {
        self.config.set(key, value)?;
        info!(key, value, "config updated");
        self.apply_storage_settings()
    }

    /// Re-reads the config file if it changed on disk.
    pub fn reload_config(&self) -> Result<bool, RecorderError> {
        let changed = self.config.reload_if_changed()?;
        if changed {
            self.apply_storage_settings()?;
        }
        Ok(changed)
    }

    fn apply_storage_settings(&self) -> Result<(), RecorderError> {
        let config = self.config.snapshot();
        let mut applied = self.applied.lock().unwrap_or_else(|e| e.into_inner());
        if applied.1 != config.archive_fsync {
            self.storage.set_fsync(config.archive_fsync);
            applied.1 = config.archive_fsync;
        }
        if applied.0 != config.ring_capacity {
            applied.0 = config.ring_capacity;
            self.resize_ring(config.ring_capacity)?;
        }
        Ok(())
    }

    /// Resizes every ring; rows that no longer fit are archived first.
    pub fn resize_ring(&self, capacity: usize) -> Result<usize, RecorderError> {
        let archived = self.storage.resize_ring(capacity)?;
        info!(
            capacity = self.storage.ring_capacity(),
            archived, "ring buffers resized"
        );
        Ok(self.storage.ring_capacity())
    }

    // ------------------------------------------------------------------
    // Collection
    // ------------------------------------------------------------------

    /// Runs one guarded cycle now. A cycle already in flight makes this one
    /// a recorded skip.
    pub fn trigger_collection(&self) -> CycleReport {
        self.scheduler.run_cycle()
    }

    pub fn run_cycle_at(&self, at: i64) -> CycleReport {
        self.scheduler.run_cycle_at(at)
    }

    /// Asks the run loop for an early cycle.
    pub fn request_collection(&self) {
        self.scheduler.request_collection();
    }

    pub fn take_request(&self) -> bool {
        self.scheduler.take_request()
    }

    pub fn next_delay(&self) -> std::time::Duration {
        self.scheduler.next_delay()
    }

    /// Most recent ring entries of one kind, newest first.
    pub fn recent_activity(&self, kind: SampleKind, n: usize) -> Vec<Slot<DataBlock>> {
        self.storage.recent(kind, n)
    }

    pub fn status(&self) -> RecorderStatus {
        let config = self.config.snapshot();
        let sched = self.scheduler.status();
        RecorderStatus {
            enabled: config.enabled,
            mode: config.mode,
            config_version: self.config.version(),
            ring_capacity: self.storage.ring_capacity(),
            ring_fill: self.storage.ring_fill(),
            cycles: sched.cycles,
            last_cycle_at: sched.last_cycle_at,
            last_outcome: sched.last_outcome,
            last_snapshot_id: sched.last_snapshot_id,
            storage_failure_cycles: sched.storage_failure_cycles,
            storage_alarm: sched.storage_alarm,
            breaker_open: sched.breaker_open,
            archive_pending: self.storage.archive_pending(),
        }
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    pub fn run_maintenance(&self) -> Result<MaintenanceReport, RecorderError> {
        self.run_maintenance_at(now())
    }

    pub fn run_maintenance_at(&self, at: i64) -> Result<MaintenanceReport, RecorderError> {
        Ok(run_maintenance(&self.storage, &self.config.snapshot(), at)?)
    }

    /// Drains the rings into the archive and saves incidents.
    pub fn shutdown(&self) -> Result<usize, RecorderError> {
        let flushed = self.storage.flush_rings()?;
        self.storage.incidents().save()?;
        info!(flushed, "ring buffers flushed to archive");
        Ok(flushed)
    }

    // ------------------------------------------------------------------
    // Analysis
    // ------------------------------------------------------------------

    pub fn detect_storms(
        &self,
        lookback_secs: i64,
        baseline_days: u32,
    ) -> Result<StormReport, AnalysisError> {
        self.detect_storms_at(now(), lookback_secs, baseline_days)
    }

    pub fn detect_storms_at(
        &self,
        at: i64,
        lookback_secs: i64,
        baseline_days: u32,
    ) -> Result<StormReport, AnalysisError> {
        detect_storms(&self.storage, &self.config.snapshot(), at, lookback_secs, baseline_days)
    }

    /// `threshold_pct` of `None` uses the configured threshold.
    pub fn detect_regressions(
        &self,
        lookback_secs: i64,
        baseline_days: u32,
        threshold_pct: Option<f64>,
    ) -> Result<RegressionReport, AnalysisError> {
        self.detect_regressions_at(now(), lookback_secs, baseline_days, threshold_pct)
    }

    pub fn detect_regressions_at(
        &self,
        at: i64,
        lookback_secs: i64,
        baseline_days: u32,
        threshold_pct: Option<f64>,
    ) -> Result<RegressionReport, AnalysisError> {
        let config = self.config.snapshot();
        let threshold = threshold_pct.unwrap_or(config.regression_threshold_pct);
        detect_regressions(&self.storage, &config, at, lookback_secs, baseline_days, threshold)
    }

    /// Findings over the trailing window. Recorded only when `persist` is set.
    pub fn anomaly_report(&self, window_secs: i64, persist: bool) -> Result<AnomalyReport, AnalysisError> {
        self.anomaly_report_at(now(), window_secs, persist)
    }

    pub fn anomaly_report_at(
        &self,
        at: i64,
        window_secs: i64,
        persist: bool,
    ) -> Result<AnomalyReport, AnalysisError> {
        anomaly_report(&self.storage, &self.config.snapshot(), at, window_secs, persist)
    }

    pub fn forecast(
        &self,
        metric: ForecastMetric,
        lookback_secs: i64,
        horizon_secs: i64,
    ) -> Result<Forecast, AnalysisError> {
        self.forecast_at(now(), metric, lookback_secs, horizon_secs)
    }

    pub fn forecast_at(
        &self,
        at: i64,
        metric: ForecastMetric,
        lookback_secs: i64,
        horizon_secs: i64,
    ) -> Result<Forecast, AnalysisError> {
        let history = History::load(&self.storage, at - lookback_secs, at)?;
        forecast_metric(&history, &self.config.snapshot(), metric, at, lookback_secs, horizon_secs)
    }

    /// Every forecastable metric, most urgent first.
    pub fn forecast_summary(
        &self,
        lookback_secs: i64,
        horizon_secs: i64,
    ) -> Result<Vec<Forecast>, AnalysisError> {
        self.forecast_summary_at(now(), lookback_secs, horizon_secs)
    }

    pub fn forecast_summary_at(
        &self,
        at: i64,
        lookback_secs: i64,
        horizon_secs: i64,
    ) -> Result<Vec<Forecast>, AnalysisError> {
        let history = History::load(&self.storage, at - lookback_secs, at)?;
        forecast_all(&history, &self.config.snapshot(), at, lookback_secs, horizon_secs)
    }

    pub fn blast_radius(&self, start: i64, end: i64) -> Result<BlastRadius, AnalysisError> {
        blast_radius(&self.storage, &self.config.snapshot(), start, end)
    }

    pub fn what_happened_at(&self, at: i64) -> Result<Reconstruction, AnalysisError> {
        what_happened_at(&self.storage, at)
    }

    pub fn incident_timeline(&self, start: i64, end: i64) -> Result<Vec<TimelineEvent>, AnalysisError> {
        incident_timeline(&self.storage, start, end)
    }

    /// Operator resolution. Returns false for an unknown or already
    /// resolved id.
    pub fn resolve_storm(&self, id: u64, notes: Option<String>) -> Result<bool, RecorderError> {
        let mut incidents = self.storage.incidents();
        let resolved = incidents.resolve_storm(id, now(), notes);
        if resolved {
            incidents.save()?;
            info!(id, "storm resolved by operator");
        } else {
            warn!(id, "no open storm with this id");
        }
        Ok(resolved)
    }

    pub fn resolve_regression(&self, id: u64, notes: Option<String>) -> Result<bool, RecorderError> {
        let mut incidents = self.storage.incidents();
        let resolved = incidents.resolve_regression(id, now(), notes);
        if resolved {
            incidents.save()?;
            info!(id, "regression resolved by operator");
        } else {
            warn!(id, "no open regression with this id");
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::mock::MockStatSource;
    use tempfile::tempdir;

    const T0: i64 = 1_700_000_000;

    fn recorder(dir: &std::path::Path) -> FlightRecorder<MockStatSource> {
        let config = Config {
            archive_fsync: false,
            jitter_max_secs: 0,
            ..Config::default()
        };
        FlightRecorder::open(MockStatSource::healthy(), Arc::new(ConfigStore::new(config)), dir)
            .unwrap()
    }

    #[test]
    fn disable_stops_collection() {
        let dir = tempdir().unwrap();
        let rec = recorder(dir.path());
        assert!(rec.run_cycle_at(T0).snapshot_id.is_some());
        rec.disable().unwrap();
        let report = rec.run_cycle_at(T0 + 180);
        assert_eq!(report.outcome, CollectionOutcome::Skipped);
        assert!(report.snapshot_id.is_none());
        rec.enable().unwrap();
        assert!(rec.run_cycle_at(T0 + 360).snapshot_id.is_some());
    }

    #[test]
    fn invalid_config_keeps_prior_value() {
        let dir = tempdir().unwrap();
        let rec = recorder(dir.path());
        assert!(rec.config_set("shed_connection_ratio", "1.5").is_err());
        assert_eq!(rec.config_get("shed_connection_ratio").unwrap(), "0.7");
        assert!(rec.config_set("no_such_key", "1").is_err());
    }

    #[test]
    fn ring_capacity_key_resizes_rings() {
        let dir = tempdir().unwrap();
        let rec = recorder(dir.path());
        rec.config_set("ring_capacity", "200").unwrap();
        assert_eq!(rec.status().ring_capacity, 200);
    }

    #[test]
    fn status_reflects_mode_and_fill() {
        let dir = tempdir().unwrap();
        let rec = recorder(dir.path());
        rec.set_mode(Mode::Emergency).unwrap();
        rec.run_cycle_at(T0);
        let status = rec.status();
        assert_eq!(status.mode, Mode::Emergency);
        assert_eq!(status.cycles, 1);
        assert_eq!(status.ring_fill.get(&SampleKind::Database), Some(&1));
        assert!(!status.storage_alarm);
    }

    #[test]
    fn recent_activity_is_newest_first() {
        let dir = tempdir().unwrap();
        let rec = recorder(dir.path());
        for i in 0..3 {
            rec.run_cycle_at(T0 + i * 180);
        }
        let recent = rec.recent_activity(SampleKind::Activity, 2);
        assert_eq!(recent.len(), 2);
        assert!(recent[0].captured_at > recent[1].captured_at);
    }

    #[test]
    fn resolving_unknown_storm_is_false() {
        let dir = tempdir().unwrap();
        let rec = recorder(dir.path());
        assert!(!rec.resolve_storm(99, None).unwrap());
    }

    #[test]
    fn shutdown_moves_ring_rows_to_archive() {
        let dir = tempdir().unwrap();
        let rec = recorder(dir.path());
        rec.run_cycle_at(T0);
        assert!(rec.shutdown().unwrap() > 0);
        assert_eq!(rec.status().ring_fill.values().sum::<usize>(), 0);

        let reopened = recorder(dir.path());
        let snaps = reopened.storage().snapshots_between(T0 - 1, T0 + 1).unwrap();
        assert_eq!(snaps.len(), 1);
        assert!(snaps[0].has(SampleKind::Database));
    }
}
