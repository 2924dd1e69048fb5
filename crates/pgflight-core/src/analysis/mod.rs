//! Analysis engine: read-only detectors over recorded history.
//!
//! ```text
//!   Storage ──► History (raw snapshots + statement aggregates)
//!                 ├─ storm        per-fingerprint execution frequency
//!                 ├─ regression   per-fingerprint cost per call
//!                 ├─ anomaly      rule set over latest snapshot + trend
//!                 ├─ forecast     OLS trend toward a ceiling
//!                 ├─ blast        incident window vs preceding window
//!                 └─ timeline     what_happened_at, incident_timeline
//! ```
//!
//! History is loaded once per evaluation through the storage read path, so
//! detectors never hold a storage lock while they compute.

pub mod anomaly;
pub mod blast;
pub mod forecast;
pub mod regression;
pub mod storm;
pub mod timeline;

pub use anomaly::{AnomalyContext, AnomalyReport, AnomalyRule, all_rules};
pub use blast::{BlastRadius, Recommendation};
pub use forecast::{Exhaustion, Forecast, ForecastMetric, ForecastOutcome, LinearFit, Undetermined};
pub use regression::{RegressionReport, regression_severity};
pub use storm::{StormReport, storm_severity};
pub use timeline::{Reconstruction, TimelineEvent, TimelineEventKind};

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use crate::model::{
    CheckpointSignal, CorrelationSnapshot, IoSignal, LockSignal, SampleKind, Snapshot,
    VacuumSignal, changed_settings,
};
use crate::storage::metrics::{StatementTotals, di64, statement_totals};
use crate::storage::{AggregateBucket, AggregateFamily, Storage, StorageError};

pub(crate) const DAY_SECS: i64 = 86_400;

/// Extra history loaded before a window so its first statement pair has a
/// previous point. Covers the longest configurable collection interval.
const LOOKBEHIND_SECS: i64 = 7_200;

// ============================================================
// Errors
// ============================================================

#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisError {
    InvalidWindow { start: i64, end: i64 },
    /// Not enough history to produce an answer.
    InsufficientData(String),
    Storage(StorageError),
}

impl fmt::Display for AnalysisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisError::InvalidWindow { start, end } => {
                write!(f, "invalid window: start {} is not before end {}", start, end)
            }
            AnalysisError::InsufficientData(what) => write!(f, "insufficient data: {}", what),
            AnalysisError::Storage(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for AnalysisError {}

impl From<StorageError> for AnalysisError {
    fn from(e: StorageError) -> Self {
        AnalysisError::Storage(e)
    }
}

pub(crate) fn check_window(start: i64, end: i64) -> Result<(), AnalysisError> {
    if start < end {
        Ok(())
    } else {
        Err(AnalysisError::InvalidWindow { start, end })
    }
}

// ============================================================
// History
// ============================================================

/// Snapshots and statement aggregates covering one analysis span.
#[derive(Debug, Default, Clone)]
pub struct History {
    /// Sorted by capture time.
    pub snapshots: Vec<Snapshot>,
    statement_buckets: Vec<AggregateBucket>,
}

impl History {
    /// Loads raw snapshots for `[from, to]` (plus a short lookbehind) and the
    /// statement aggregates overlapping the span.
    pub fn load(storage: &Storage, from: i64, to: i64) -> Result<Self, AnalysisError> {
        let snapshots = storage.snapshots_between(from.saturating_sub(LOOKBEHIND_SECS), to)?;
        let statement_buckets = storage.aggregates_between(AggregateFamily::Statements, from, to)?;
        Ok(Self {
            snapshots,
            statement_buckets,
        })
    }

    pub fn from_snapshots(mut snapshots: Vec<Snapshot>) -> Self {
        snapshots.sort_by_key(|s| (s.captured_at, s.id));
        Self {
            snapshots,
            statement_buckets: Vec::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_buckets(mut self, buckets: Vec<AggregateBucket>) -> Self {
        self.statement_buckets = buckets;
        self
    }

    /// Snapshots captured within `[from, to]`.
    pub fn in_window(&self, from: i64, to: i64) -> &[Snapshot] {
        let lo = self.snapshots.partition_point(|s| s.captured_at < from);
        let hi = self.snapshots.partition_point(|s| s.captured_at <= to);
        &self.snapshots[lo..hi.max(lo)]
    }

    /// Last snapshot captured strictly before `at`.
    pub fn before(&self, at: i64) -> Option<&Snapshot> {
        let idx = self.snapshots.partition_point(|s| s.captured_at < at);
        idx.checked_sub(1).map(|i| &self.snapshots[i])
    }

    /// Statement work over `(from, to]`.
    ///
    /// Raw snapshot pairs are used where they exist. Older parts of the
    /// window, whose raw rows were already retired, fall back to whole
    /// aggregate buckets that end before the first raw statement sample.
    pub fn statement_window(&self, from: i64, to: i64) -> BTreeMap<i64, StatementTotals> {
        let mut totals = statement_totals(&self.snapshots, from, to);
        let raw_start = self
            .snapshots
            .iter()
            .find(|s| s.has(SampleKind::Statements))
            .map(|s| s.captured_at)
            .unwrap_or(i64::MAX);
        for bucket in &self.statement_buckets {
            let end = bucket.bucket_start + bucket.bucket_secs;
            if bucket.bucket_start < from || end > to || end > raw_start {
                continue;
            }
            for stmt in &bucket.statements {
                totals
                    .entry(stmt.queryid)
                    .or_insert_with(|| StatementTotals {
                        queryid: stmt.queryid,
                        ..StatementTotals::default()
                    })
                    .merge(stmt);
            }
        }
        totals
    }
}

// ============================================================
// Correlation
// ============================================================

/// Signals observed over `[from, to]`, used to explain a detection.
pub fn correlate(history: &History, from: i64, to: i64) -> CorrelationSnapshot {
    let window = history.in_window(from, to);
    let around: Vec<&Snapshot> = history.before(from).into_iter().chain(window).collect();

    let with_counters: Vec<&Snapshot> = around
        .iter()
        .copied()
        .filter(|s| s.counters().is_some())
        .collect();
    let mut checkpoint = None;
    let mut io = None;
    if let (Some(first), Some(last)) = (with_counters.first(), with_counters.last())
        && first.id != last.id
        && let (Some(a), Some(b)) = (first.counters(), last.counters())
    {
        if let (Some(timed), Some(requested)) = (
            di64(b.checkpoints_timed, a.checkpoints_timed),
            di64(b.checkpoints_req, a.checkpoints_req),
        ) {
            checkpoint = Some(CheckpointSignal { timed, requested });
        }
        let dt = (last.captured_at - first.captured_at) as f64;
        if dt > 0.0
            && let (Some(read), Some(hit)) = (di64(b.blks_read, a.blks_read), di64(b.blks_hit, a.blks_hit))
        {
            let total = read + hit;
            io = Some(IoSignal {
                blocks_read_per_sec: read as f64 / dt,
                hit_ratio: if total > 0 { hit as f64 / total as f64 } else { 1.0 },
            });
        }
    }

    let locks = window.iter().rev().find(|s| s.has(SampleKind::Locks)).map(|s| {
        let mut pids: Vec<i32> = s.blocked_locks().map(|l| l.pid).collect();
        pids.sort_unstable();
        pids.dedup();
        LockSignal {
            waiting: pids.len(),
            blocked_pids: pids,
        }
    });

    let vacuum = window
        .iter()
        .filter(|s| s.has(SampleKind::Activity))
        .map(|s| {
            s.activity()
                .iter()
                .filter(|a| a.backend_type == "autovacuum worker")
                .count()
        })
        .max()
        .map(|autovacuum_workers| VacuumSignal { autovacuum_workers });

    let with_settings: Vec<&Snapshot> = around
        .iter()
        .copied()
        .filter(|s| s.has(SampleKind::Settings))
        .collect();
    let config_changes = match (with_settings.first(), with_settings.last()) {
        (Some(first), Some(last)) => changed_settings(first.settings(), last.settings()),
        _ => Vec::new(),
    };

    CorrelationSnapshot {
        captured_at: to,
        checkpoint,
        locks,
        io,
        vacuum,
        config_changes,
    }
}

// ============================================================
// Incident lifecycle
// ============================================================

/// Storms and regressions share one open/clean/resolve lifecycle, keyed by
/// query fingerprint.
pub(crate) trait Tracked {
    fn id(&self) -> u64;
    fn queryid(&self) -> i64;
    fn is_open(&self) -> bool;
    fn clean_evaluations_mut(&mut self) -> &mut u32;
    fn close(&mut self, at: i64, notes: String);
}

/// Counts one clean evaluation for every open incident whose fingerprint
/// was not detected this time, closing those that reached `after`.
/// Returns the ids closed.
pub(crate) fn age_unseen<T: Tracked>(
    items: &mut [T],
    seen: &HashSet<i64>,
    now: i64,
    after: u32,
) -> Vec<u64> {
    let mut closed = Vec::new();
    for item in items.iter_mut().filter(|i| i.is_open()) {
        if seen.contains(&item.queryid()) {
            continue;
        }
        let clean = item.clean_evaluations_mut();
        *clean += 1;
        if *clean >= after {
            let notes = format!("auto-resolved after {} clean evaluations", *clean);
            item.close(now, notes);
            closed.push(item.id());
        }
    }
    closed
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::{DataBlock, DatabaseCounters, LockSample, SettingSample};
    use crate::source::mock::{session, statement};

    /// Snapshot with database counters and one statement.
    pub(crate) fn snap_with(id: u64, at: i64, queryid: i64, calls: i64) -> Snapshot {
        let mut s = Snapshot::new(id, at);
        s.blocks.push(DataBlock::Database(DatabaseCounters {
            numbackends: 10,
            max_connections: 100,
            xact_commit: id as i64 * 100,
            blks_hit: id as i64 * 900,
            blks_read: id as i64 * 100,
            ..DatabaseCounters::default()
        }));
        s.blocks
            .push(DataBlock::Statements(vec![statement(queryid, "SELECT 1", calls)]));
        s
    }

    #[test]
    fn window_slices_are_inclusive() {
        let history = History::from_snapshots((1..=5).map(|i| snap_with(i, i as i64 * 10, 1, 0)).collect());
        assert_eq!(history.in_window(20, 40).len(), 3);
        assert!(history.in_window(41, 49).is_empty());
        assert_eq!(history.before(20).map(|s| s.id), Some(1));
        assert!(history.before(10).is_none());
    }

    #[test]
    fn statement_window_falls_back_to_buckets_before_raw_data() {
        let history = History::from_snapshots(vec![
            snap_with(1, 10_000, 7, 100),
            snap_with(2, 10_360, 7, 160),
        ])
        .with_buckets(vec![AggregateBucket {
            family: AggregateFamily::Statements,
            bucket_start: 3_600,
            bucket_secs: 3_600,
            metrics: BTreeMap::new(),
            statements: vec![StatementTotals {
                queryid: 7,
                calls: 40,
                covered_secs: 3_600,
                ..StatementTotals::default()
            }],
        }]);
        let totals = history.statement_window(0, 20_000);
        assert_eq!(totals[&7].calls, 100);
        assert_eq!(totals[&7].covered_secs, 3_960);

        // A bucket overlapping raw data is not counted twice.
        let raw_only = history.statement_window(9_000, 20_000);
        assert_eq!(raw_only[&7].calls, 60);
    }

    #[test]
    fn correlation_collects_available_signals() {
        let mut a = snap_with(1, 100, 1, 0);
        a.blocks.push(DataBlock::Settings(vec![SettingSample {
            name: "work_mem".into(),
            setting: "4096".into(),
            ..SettingSample::default()
        }]));
        let mut b = snap_with(2, 200, 1, 0);
        b.blocks.push(DataBlock::Locks(vec![LockSample {
            pid: 42,
            granted: false,
            ..LockSample::default()
        }]));
        b.blocks.push(DataBlock::Activity(vec![session(
            7,
            "active",
            "",
            "autovacuum worker",
        )]));
        b.blocks.push(DataBlock::Settings(vec![SettingSample {
            name: "work_mem".into(),
            setting: "65536".into(),
            ..SettingSample::default()
        }]));
        let history = History::from_snapshots(vec![a, b]);
        let c = correlate(&history, 150, 200);
        assert_eq!(c.locks.as_ref().map(|l| l.blocked_pids.clone()), Some(vec![42]));
        assert_eq!(c.vacuum.map(|v| v.autovacuum_workers), Some(1));
        assert_eq!(c.config_changes, vec!["work_mem".to_string()]);
        let io = c.io.unwrap();
        assert!((io.hit_ratio - 0.9).abs() < 1e-9);
        assert_eq!(io.blocks_read_per_sec, 1.0);
    }

    #[test]
    fn correlation_without_samples_is_empty() {
        let c = correlate(&History::default(), 0, 100);
        assert_eq!(c, CorrelationSnapshot {
            captured_at: 100,
            ..CorrelationSnapshot::default()
        });
    }
}
