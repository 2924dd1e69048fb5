//! Execution-frequency storms per query fingerprint.

use std::collections::HashSet;

use serde::Serialize;
use tracing::info;

use super::{AnalysisError, DAY_SECS, History, Tracked, age_unseen, check_window, correlate};
use crate::config::Config;
use crate::model::{QueryStorm, Severity, Snapshot, StormClass};
use crate::storage::Storage;
use crate::storage::metrics::{StatementTotals, di64};

/// Miss ratio a cache-miss storm must reach regardless of its baseline.
const CACHE_MISS_FLOOR: f64 = 0.1;
/// Rollback share of all transactions that, with a rows-per-call drop,
/// marks failing retries.
const RETRY_ROLLBACK_RATIO: f64 = 0.5;

/// `LOW` up to 5x, `MEDIUM` up to 10x, `HIGH` up to 50x, `CRITICAL` above.
/// A retry storm is always critical.
pub fn storm_severity(multiplier: f64, class: StormClass) -> Severity {
    if class == StormClass::RetryStorm {
        return Severity::Critical;
    }
    if multiplier <= 5.0 {
        Severity::Low
    } else if multiplier <= 10.0 {
        Severity::Medium
    } else if multiplier <= 50.0 {
        Severity::High
    } else {
        Severity::Critical
    }
}

#[derive(Clone, Serialize, Debug, PartialEq)]
pub struct StormReport {
    pub evaluated_at: i64,
    pub lookback_secs: i64,
    pub baseline_days: u32,
    /// Storms observed in this evaluation, with their persisted ids.
    pub storms: Vec<QueryStorm>,
    pub auto_resolved: Vec<u64>,
}

/// Sessions seen in an aborted transaction while running `queryid`.
fn aborted_observations(window: &[Snapshot], queryid: i64) -> u32 {
    window
        .iter()
        .flat_map(|s| s.activity())
        .filter(|a| a.query_id == queryid && a.in_aborted_transaction())
        .count() as u32
}

/// Share of rolled back transactions across the window.
fn rollback_ratio(history: &History, from: i64, to: i64) -> Option<f64> {
    let points: Vec<&Snapshot> = history
        .before(from)
        .into_iter()
        .chain(history.in_window(from, to))
        .filter(|s| s.counters().is_some())
        .collect();
    let (a, b) = (points.first()?.counters()?, points.last()?.counters()?);
    let commits = di64(b.xact_commit, a.xact_commit)?;
    let rollbacks = di64(b.xact_rollback, a.xact_rollback)?;
    let total = commits + rollbacks;
    (total > 0).then(|| rollbacks as f64 / total as f64)
}

fn rows_per_call(t: &StatementTotals) -> f64 {
    if t.calls > 0 {
        t.rows as f64 / t.calls as f64
    } else {
        0.0
    }
}

fn classify(
    history: &History,
    config: &Config,
    from: i64,
    to: i64,
    recent: &StatementTotals,
    baseline: &StatementTotals,
) -> StormClass {
    let window = history.in_window(from, to);
    if aborted_observations(window, recent.queryid) >= config.retry_aborted_threshold {
        return StormClass::RetryStorm;
    }
    let failing = rollback_ratio(history, from, to).is_some_and(|r| r >= RETRY_ROLLBACK_RATIO);
    if failing && rows_per_call(recent) < rows_per_call(baseline) * 0.5 {
        return StormClass::RetryStorm;
    }
    let miss = recent.miss_ratio();
    if miss >= CACHE_MISS_FLOOR && miss >= baseline.miss_ratio() * config.cache_miss_factor {
        return StormClass::CacheMiss;
    }
    StormClass::Spike
}

/// Compares each fingerprint's executions in `(now - lookback, now]` with its
/// average per equally sized window over the preceding `baseline_days`.
///
/// Returned storms carry id 0; persistence assigns ids.
pub fn evaluate_storms(
    history: &History,
    config: &Config,
    now: i64,
    lookback_secs: i64,
    baseline_days: u32,
) -> Result<Vec<QueryStorm>, AnalysisError> {
    let recent_from = now - lookback_secs;
    let baseline_from = recent_from - baseline_days as i64 * DAY_SECS;
    check_window(recent_from, now)?;
    check_window(baseline_from, recent_from)?;

    let recent = history.statement_window(recent_from, now);
    let baseline = history.statement_window(baseline_from, recent_from);

    let mut storms = Vec::new();
    for (queryid, r) in &recent {
        let Some(b) = baseline.get(queryid) else {
            continue;
        };
        if b.covered_secs <= 0 || r.calls <= 0 {
            continue;
        }
        let baseline_count = b.calls as f64 * lookback_secs as f64 / b.covered_secs as f64;
        if baseline_count <= 0.0 || baseline_count < config.storm_min_baseline {
            continue;
        }
        let recent_count = r.calls as f64;
        let multiplier = recent_count / baseline_count;
        if multiplier <= config.storm_threshold {
            continue;
        }
        let class = classify(history, config, recent_from, now, r, b);
        let query = if r.query.is_empty() { b.query.clone() } else { r.query.clone() };
        storms.push(QueryStorm {
            id: 0,
            queryid: *queryid,
            query,
            recent_count,
            baseline_count,
            multiplier,
            class,
            severity: storm_severity(multiplier, class),
            correlation: correlate(history, recent_from, now),
            detected_at: now,
            last_seen_at: now,
            clean_evaluations: 0,
            resolved_at: None,
            resolution_notes: None,
        });
    }
    storms.sort_by(|a, b| b.multiplier.total_cmp(&a.multiplier));
    Ok(storms)
}

impl Tracked for QueryStorm {
    fn id(&self) -> u64 {
        self.id
    }

    fn queryid(&self) -> i64 {
        self.queryid
    }

    fn is_open(&self) -> bool {
        QueryStorm::is_open(self)
    }

    fn clean_evaluations_mut(&mut self) -> &mut u32 {
        &mut self.clean_evaluations
    }

    fn close(&mut self, at: i64, notes: String) {
        self.resolved_at = Some(at);
        self.resolution_notes = Some(notes);
    }
}

/// Runs the storm detector and persists its outcome: new storms are
/// opened, open ones refreshed, and unseen ones aged toward auto-resolve.
pub fn detect_storms(
    storage: &Storage,
    config: &Config,
    now: i64,
    lookback_secs: i64,
    baseline_days: u32,
) -> Result<StormReport, AnalysisError> {
    let from = now - lookback_secs - baseline_days as i64 * DAY_SECS;
    let history = History::load(storage, from, now)?;
    let found = evaluate_storms(&history, config, now, lookback_secs, baseline_days)?;

    let mut incidents = storage.incidents();
    let mut storms = Vec::with_capacity(found.len());
    for storm in found {
        let open = incidents
            .storms_mut()
            .iter_mut()
            .find(|s| s.is_open() && s.queryid == storm.queryid);
        match open {
            Some(existing) => {
                existing.recent_count = storm.recent_count;
                existing.baseline_count = storm.baseline_count;
                existing.multiplier = storm.multiplier;
                existing.class = storm.class;
                existing.severity = storm.severity;
                existing.correlation = storm.correlation;
                existing.last_seen_at = now;
                existing.clean_evaluations = 0;
                storms.push(existing.clone());
            }
            None => {
                let mut storm = storm;
                storm.id = incidents.insert_storm(storm.clone());
                info!(
                    id = storm.id,
                    queryid = storm.queryid,
                    multiplier = storm.multiplier,
                    class = %storm.class,
                    severity = %storm.severity,
                    "query storm detected"
                );
                storms.push(storm);
            }
        }
    }

    let seen: HashSet<i64> = storms.iter().map(|s| s.queryid).collect();
    let auto_resolved = age_unseen(incidents.storms_mut(), &seen, now, config.auto_resolve_after);
    for id in &auto_resolved {
        info!(id, "query storm auto-resolved");
    }
    incidents.save()?;

    Ok(StormReport {
        evaluated_at: now,
        lookback_secs,
        baseline_days,
        storms,
        auto_resolved,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DataBlock, DatabaseCounters};
    use crate::source::mock::{session, statement};
    use tempfile::tempdir;

    const NOW: i64 = 1_700_000_000;

    /// One snapshot every 360s over 8 days. Baseline adds `base` calls per
    /// sample; the last hour adds `burst`.
    fn series(base: i64, burst: i64) -> Vec<Snapshot> {
        let mut out = Vec::new();
        let mut calls = 0;
        let start = NOW - 8 * DAY_SECS;
        let mut id = 0;
        let mut at = start;
        while at <= NOW {
            id += 1;
            calls += if at > NOW - 3600 { burst } else { base };
            let mut s = Snapshot::new(id, at);
            s.blocks.push(DataBlock::Database(DatabaseCounters {
                xact_commit: id as i64 * 10,
                ..DatabaseCounters::default()
            }));
            s.blocks
                .push(DataBlock::Statements(vec![statement(42, "SELECT 42", calls)]));
            out.push(s);
            at += 360;
        }
        out
    }

    #[test]
    fn band_edges_use_lower_band() {
        let spike = StormClass::Spike;
        assert_eq!(storm_severity(4.0, spike), Severity::Low);
        assert_eq!(storm_severity(5.0, spike), Severity::Low);
        assert_eq!(storm_severity(6.0, spike), Severity::Medium);
        assert_eq!(storm_severity(9.0, spike), Severity::Medium);
        assert_eq!(storm_severity(10.0, spike), Severity::Medium);
        assert_eq!(storm_severity(11.0, spike), Severity::High);
        assert_eq!(storm_severity(49.0, spike), Severity::High);
        assert_eq!(storm_severity(50.0, spike), Severity::High);
        assert_eq!(storm_severity(51.0, spike), Severity::Critical);
        assert_eq!(storm_severity(3.5, StormClass::RetryStorm), Severity::Critical);
    }

    #[test]
    fn sixty_fold_spike_is_critical() {
        let history = History::from_snapshots(series(1, 60));
        let storms = evaluate_storms(&history, &Config::default(), NOW, 3600, 7).unwrap();
        assert_eq!(storms.len(), 1);
        let s = &storms[0];
        assert_eq!(s.queryid, 42);
        assert!((s.baseline_count - 10.0).abs() < 1e-9);
        assert_eq!(s.recent_count, 600.0);
        assert!((s.multiplier - 60.0).abs() < 1e-9);
        assert_eq!(s.class, StormClass::Spike);
        assert_eq!(s.severity, Severity::Critical);
    }

    #[test]
    fn steady_rate_is_not_a_storm() {
        let history = History::from_snapshots(series(5, 5));
        assert!(evaluate_storms(&history, &Config::default(), NOW, 3600, 7).unwrap().is_empty());
    }

    #[test]
    fn baseline_below_floor_is_skipped() {
        let history = History::from_snapshots(series(1, 60));
        let config = Config {
            storm_min_baseline: 20.0,
            ..Config::default()
        };
        assert!(evaluate_storms(&history, &config, NOW, 3600, 7).unwrap().is_empty());
    }

    #[test]
    fn aborted_sessions_mark_retry_storm() {
        let mut snaps = series(1, 10);
        for s in snaps.iter_mut().rev().take(3) {
            let mut a = session(7, "idle in transaction (aborted)", "app", "client backend");
            a.query_id = 42;
            s.blocks.push(DataBlock::Activity(vec![a]));
        }
        let history = History::from_snapshots(snaps);
        let storms = evaluate_storms(&history, &Config::default(), NOW, 3600, 7).unwrap();
        assert_eq!(storms[0].class, StormClass::RetryStorm);
        assert_eq!(storms[0].severity, Severity::Critical);
    }

    #[test]
    fn invalid_lookback_is_rejected() {
        let history = History::default();
        assert!(matches!(
            evaluate_storms(&history, &Config::default(), NOW, 0, 7),
            Err(AnalysisError::InvalidWindow { .. })
        ));
    }

    #[test]
    fn storms_are_upserted_and_auto_resolved() {
        let dir = tempdir().unwrap();
        let config = Config {
            archive_fsync: false,
            auto_resolve_after: 2,
            ..Config::default()
        };
        let storage = Storage::open(dir.path(), &config).unwrap();
        for s in series(1, 60) {
            for block in s.blocks {
                storage.write_block(s.id, s.captured_at, block).unwrap();
            }
        }

        let first = detect_storms(&storage, &config, NOW, 3600, 7).unwrap();
        assert_eq!(first.storms.len(), 1);
        let id = first.storms[0].id;
        let again = detect_storms(&storage, &config, NOW, 3600, 7).unwrap();
        assert_eq!(again.storms[0].id, id);
        assert_eq!(storage.incidents().storms().len(), 1);

        // Two hours later the burst has left the lookback window.
        let later = NOW + 7200;
        assert!(detect_storms(&storage, &config, later, 3600, 7).unwrap().auto_resolved.is_empty());
        let report = detect_storms(&storage, &config, later, 3600, 7).unwrap();
        assert_eq!(report.auto_resolved, vec![id]);
        assert!(!storage.incidents().storms()[0].is_open());
    }
}
