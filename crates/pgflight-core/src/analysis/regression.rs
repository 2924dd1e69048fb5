//! Per-fingerprint cost regressions against the fingerprint's own baseline.
//!
//! The cost metric is selectable. Buffer operations are the default: under
//! an unchanged plan they stay put no matter how loaded the machine is,
//! while mean time moves with load.

use std::collections::HashSet;

use serde::Serialize;
use tracing::info;

use super::{AnalysisError, DAY_SECS, History, Tracked, age_unseen, check_window, correlate};
use crate::config::Config;
use crate::model::{CorrelationSnapshot, CostMetric, ProbableCause, QueryRegression, Severity};
use crate::storage::Storage;
use crate::storage::metrics::StatementTotals;

/// `LOW` up to 200%, `MEDIUM` up to 500%, `HIGH` up to 1000%, `CRITICAL` above.
pub fn regression_severity(change_pct: f64) -> Severity {
    if change_pct <= 200.0 {
        Severity::Low
    } else if change_pct <= 500.0 {
        Severity::Medium
    } else if change_pct <= 1000.0 {
        Severity::High
    } else {
        Severity::Critical
    }
}

/// Average cost of one call, `None` without calls.
pub fn cost_per_call(totals: &StatementTotals, metric: CostMetric) -> Option<f64> {
    if totals.calls <= 0 {
        return None;
    }
    let cost = match metric {
        CostMetric::BufferOps => totals.buffer_ops as f64,
        CostMetric::Time => totals.total_time_ms,
    };
    Some(cost / totals.calls as f64)
}

fn per_call(value: i64, calls: i64) -> f64 {
    if calls > 0 { value as f64 / calls as f64 } else { 0.0 }
}

/// Signals that explain a regression, strongest first. Falls back to a
/// plan change when nothing concurrent accounts for it.
fn probable_causes(
    correlation: &CorrelationSnapshot,
    recent: &StatementTotals,
    baseline: &StatementTotals,
) -> Vec<ProbableCause> {
    let mut causes = Vec::new();
    if correlation.locks.as_ref().is_some_and(|l| l.waiting > 0) {
        causes.push(ProbableCause::LockContention);
    }
    if !correlation.config_changes.is_empty() {
        causes.push(ProbableCause::ConfigurationChange);
    }
    let recent_temp = per_call(recent.temp_blks, recent.calls);
    if recent_temp > 0.0 && recent_temp > per_call(baseline.temp_blks, baseline.calls) * 1.5 {
        causes.push(ProbableCause::TempSpill);
    }
    if recent.miss_ratio() > 0.05 && recent.miss_ratio() > baseline.miss_ratio() * 1.5 {
        causes.push(ProbableCause::CacheEviction);
    }
    if correlation.checkpoint.as_ref().is_some_and(|c| c.requested > 0) {
        causes.push(ProbableCause::CheckpointActivity);
    }
    if correlation.vacuum.as_ref().is_some_and(|v| v.autovacuum_workers > 0) {
        causes.push(ProbableCause::VacuumActivity);
    }
    if causes.is_empty() {
        causes.push(ProbableCause::PlanChange);
    }
    causes
}

#[derive(Clone, Serialize, Debug, PartialEq)]
pub struct RegressionReport {
    pub evaluated_at: i64,
    pub lookback_secs: i64,
    pub baseline_days: u32,
    pub threshold_pct: f64,
    pub metric: CostMetric,
    pub regressions: Vec<QueryRegression>,
    pub auto_resolved: Vec<u64>,
}

/// Compares cost per call in `(now - lookback, now]` with the preceding
/// `baseline_days`. Both sides need `regression_min_calls` calls.
///
/// Returned regressions carry id 0; persistence assigns ids.
pub fn evaluate_regressions(
    history: &History,
    config: &Config,
    now: i64,
    lookback_secs: i64,
    baseline_days: u32,
    threshold_pct: f64,
) -> Result<Vec<QueryRegression>, AnalysisError> {
    let recent_from = now - lookback_secs;
    let baseline_from = recent_from - baseline_days as i64 * DAY_SECS;
    check_window(recent_from, now)?;
    check_window(baseline_from, recent_from)?;

    let metric = config.regression_metric;
    let recent = history.statement_window(recent_from, now);
    let baseline = history.statement_window(baseline_from, recent_from);
    let correlation = correlate(history, recent_from, now);

    let mut out = Vec::new();
    for (queryid, r) in &recent {
        let Some(b) = baseline.get(queryid) else {
            continue;
        };
        if r.calls < config.regression_min_calls || b.calls < config.regression_min_calls {
            continue;
        }
        let (Some(current_avg), Some(baseline_avg)) = (cost_per_call(r, metric), cost_per_call(b, metric))
        else {
            continue;
        };
        if baseline_avg <= 0.0 {
            continue;
        }
        let change_pct = (current_avg - baseline_avg) / baseline_avg * 100.0;
        if change_pct <= threshold_pct {
            continue;
        }
        out.push(QueryRegression {
            id: 0,
            queryid: *queryid,
            query: if r.query.is_empty() { b.query.clone() } else { r.query.clone() },
            metric,
            baseline_avg,
            current_avg,
            change_pct,
            severity: regression_severity(change_pct),
            probable_causes: probable_causes(&correlation, r, b),
            correlation: correlation.clone(),
            detected_at: now,
            last_seen_at: now,
            clean_evaluations: 0,
            resolved_at: None,
            resolution_notes: None,
        });
    }
    out.sort_by(|a, b| b.change_pct.total_cmp(&a.change_pct));
    Ok(out)
}

impl Tracked for QueryRegression {
    fn id(&self) -> u64 {
        self.id
    }

    fn queryid(&self) -> i64 {
        self.queryid
    }

    fn is_open(&self) -> bool {
        QueryRegression::is_open(self)
    }

    fn clean_evaluations_mut(&mut self) -> &mut u32 {
        &mut self.clean_evaluations
    }

    fn close(&mut self, at: i64, notes: String) {
        self.resolved_at = Some(at);
        self.resolution_notes = Some(notes);
    }
}

/// Runs the regression detector and persists the outcome, with the same
/// open/refresh/auto-resolve lifecycle as storms.
pub fn detect_regressions(
    storage: &Storage,
    config: &Config,
    now: i64,
    lookback_secs: i64,
    baseline_days: u32,
    threshold_pct: f64,
) -> Result<RegressionReport, AnalysisError> {
    let from = now - lookback_secs - baseline_days as i64 * DAY_SECS;
    let history = History::load(storage, from, now)?;
    let found = evaluate_regressions(&history, config, now, lookback_secs, baseline_days, threshold_pct)?;

    let mut incidents = storage.incidents();
    let mut regressions = Vec::with_capacity(found.len());
    for regression in found {
        let open = incidents
            .regressions_mut()
            .iter_mut()
            .find(|r| r.is_open() && r.queryid == regression.queryid);
        match open {
            Some(existing) => {
                existing.baseline_avg = regression.baseline_avg;
                existing.current_avg = regression.current_avg;
                existing.change_pct = regression.change_pct;
                existing.severity = regression.severity;
                existing.probable_causes = regression.probable_causes;
                existing.correlation = regression.correlation;
                existing.last_seen_at = now;
                existing.clean_evaluations = 0;
                regressions.push(existing.clone());
            }
            None => {
                let mut regression = regression;
                regression.id = incidents.insert_regression(regression.clone());
                info!(
                    id = regression.id,
                    queryid = regression.queryid,
                    metric = regression.metric.as_str(),
                    change_pct = regression.change_pct,
                    severity = %regression.severity,
                    "query regression detected"
                );
                regressions.push(regression);
            }
        }
    }

    let seen: HashSet<i64> = regressions.iter().map(|r| r.queryid).collect();
    let auto_resolved = age_unseen(
        incidents.regressions_mut(),
        &seen,
        now,
        config.auto_resolve_after,
    );
    for id in &auto_resolved {
        info!(id, "query regression auto-resolved");
    }
    incidents.save()?;

    Ok(RegressionReport {
        evaluated_at: now,
        lookback_secs,
        baseline_days,
        threshold_pct,
        metric: config.regression_metric,
        regressions,
        auto_resolved,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DataBlock, DatabaseCounters, LockSample, Snapshot, StatementSample};

    const NOW: i64 = 1_700_000_000;

    /// Hourly snapshots over three days; each hour runs 20 calls of
    /// query 9. Hits per call jump from 10 to `recent_hits` in the last hour.
    fn series(recent_hits: i64) -> Vec<Snapshot> {
        let mut out = Vec::new();
        let mut stmt = StatementSample {
            queryid: 9,
            query: "SELECT * FROM t WHERE a = $1".into(),
            ..StatementSample::default()
        };
        let mut at = NOW - 3 * DAY_SECS;
        let mut id = 0;
        while at <= NOW {
            id += 1;
            let hits = if at > NOW - 3600 { recent_hits } else { 10 };
            stmt.calls += 20;
            stmt.shared_blks_hit += 20 * hits;
            stmt.total_time_ms += 20.0;
            let mut s = Snapshot::new(id, at);
            s.blocks.push(DataBlock::Database(DatabaseCounters::default()));
            s.blocks.push(DataBlock::Statements(vec![stmt.clone()]));
            out.push(s);
            at += 3600;
        }
        out
    }

    #[test]
    fn band_edges_use_lower_band() {
        assert_eq!(regression_severity(199.0), Severity::Low);
        assert_eq!(regression_severity(200.0), Severity::Low);
        assert_eq!(regression_severity(201.0), Severity::Medium);
        assert_eq!(regression_severity(500.0), Severity::Medium);
        assert_eq!(regression_severity(501.0), Severity::High);
        assert_eq!(regression_severity(1000.0), Severity::High);
        assert_eq!(regression_severity(1001.0), Severity::Critical);
    }

    #[test]
    fn buffer_ops_growth_is_a_regression() {
        let history = History::from_snapshots(series(70));
        let found = evaluate_regressions(&history, &Config::default(), NOW, 3600, 2, 50.0).unwrap();
        assert_eq!(found.len(), 1);
        let r = &found[0];
        assert_eq!(r.baseline_avg, 10.0);
        assert_eq!(r.current_avg, 70.0);
        assert!((r.change_pct - 600.0).abs() < 1e-9);
        assert_eq!(r.severity, Severity::High);
        assert_eq!(r.probable_causes, vec![ProbableCause::PlanChange]);
    }

    #[test]
    fn time_metric_ignores_buffer_growth() {
        let history = History::from_snapshots(series(70));
        let config = Config {
            regression_metric: CostMetric::Time,
            ..Config::default()
        };
        assert!(evaluate_regressions(&history, &config, NOW, 3600, 2, 50.0).unwrap().is_empty());
    }

    #[test]
    fn too_few_calls_are_ignored() {
        let history = History::from_snapshots(series(70));
        let config = Config {
            regression_min_calls: 21,
            ..Config::default()
        };
        assert!(evaluate_regressions(&history, &config, NOW, 3600, 2, 50.0).unwrap().is_empty());
    }

    #[test]
    fn concurrent_lock_waits_are_a_probable_cause() {
        let mut snaps = series(30);
        if let Some(last) = snaps.last_mut() {
            last.blocks.push(DataBlock::Locks(vec![LockSample {
                pid: 5,
                granted: false,
                ..LockSample::default()
            }]));
        }
        let history = History::from_snapshots(snaps);
        let found = evaluate_regressions(&history, &Config::default(), NOW, 3600, 2, 50.0).unwrap();
        assert_eq!(found[0].severity, Severity::Low);
        assert_eq!(found[0].probable_causes, vec![ProbableCause::LockContention]);
    }
}
