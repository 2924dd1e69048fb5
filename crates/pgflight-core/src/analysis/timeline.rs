//! Time-travel reconstruction and incident timelines.

use std::collections::BTreeMap;

use serde::Serialize;

use super::{AnalysisError, DAY_SECS, History, check_window};
use crate::model::{
    CollectionOutcome, CollectionStat, Finding, QueryRegression, QueryStorm, SampleKind, Severity,
    Snapshot, StatScope, changed_settings,
};
use crate::storage::Storage;
use crate::storage::metrics::{di64, snapshot_metrics};

// ============================================================
// what_happened_at
// ============================================================

#[derive(Clone, Serialize, Debug, PartialEq)]
pub struct SnapshotRef {
    pub id: u64,
    pub captured_at: i64,
}

impl From<&Snapshot> for SnapshotRef {
    fn from(s: &Snapshot) -> Self {
        Self {
            id: s.id,
            captured_at: s.captured_at,
        }
    }
}

#[derive(Clone, Serialize, Debug, PartialEq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Reconstruction {
    /// A snapshot was captured at exactly the requested time.
    Exact { snapshot: Snapshot },
    /// Each metric present on both sides, linearly interpolated.
    Interpolated {
        at: i64,
        before: SnapshotRef,
        after: SnapshotRef,
        metrics: BTreeMap<String, f64>,
    },
    /// No snapshot on one side within a day of the requested time.
    OutOfRange {
        at: i64,
        nearest_before: Option<i64>,
        nearest_after: Option<i64>,
    },
}

fn metrics_of(history: &History, snap: &Snapshot) -> BTreeMap<String, f64> {
    let prev = history
        .snapshots
        .iter()
        .rev()
        .find(|s| s.captured_at < snap.captured_at && s.counters().is_some());
    snapshot_metrics(snap, prev)
}

/// Estimated state at `at` from the snapshots bracketing it.
pub fn reconstruct(history: &History, at: i64) -> Reconstruction {
    if let Some(exact) = history.snapshots.iter().find(|s| s.captured_at == at) {
        return Reconstruction::Exact {
            snapshot: exact.clone(),
        };
    }
    let before = history.before(at);
    let after = history.snapshots.iter().find(|s| s.captured_at > at);
    let (Some(before), Some(after)) = (before, after) else {
        return Reconstruction::OutOfRange {
            at,
            nearest_before: before.map(|s| s.captured_at),
            nearest_after: after.map(|s| s.captured_at),
        };
    };

    let weight = (at - before.captured_at) as f64 / (after.captured_at - before.captured_at) as f64;
    let lhs = metrics_of(history, before);
    let rhs = metrics_of(history, after);
    let metrics = lhs
        .iter()
        .filter_map(|(name, v0)| rhs.get(name).map(|v1| (name.clone(), v0 + (v1 - v0) * weight)))
        .collect();

    Reconstruction::Interpolated {
        at,
        before: before.into(),
        after: after.into(),
        metrics,
    }
}

/// Reconstructs the state at `at` from snapshots within a day either side.
pub fn what_happened_at(storage: &Storage, at: i64) -> Result<Reconstruction, AnalysisError> {
    let history = History::load(storage, at - DAY_SECS, at + DAY_SECS)?;
    Ok(reconstruct(&history, at))
}

// ============================================================
// incident_timeline
// ============================================================

#[derive(Clone, Copy, Serialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimelineEventKind {
    Checkpoint,
    Deadlock,
    ReplicationConflict,
    BlockedSessions,
    ConfigChange,
    CollectionSkipped,
    CollectionThrottled,
    CollectionFailed,
    StormDetected,
    StormResolved,
    RegressionDetected,
    RegressionResolved,
    Anomaly,
}

#[derive(Clone, Serialize, Debug, PartialEq)]
pub struct TimelineEvent {
    pub at: i64,
    pub kind: TimelineEventKind,
    pub severity: Severity,
    pub summary: String,
}

fn event(at: i64, kind: TimelineEventKind, severity: Severity, summary: String) -> TimelineEvent {
    TimelineEvent {
        at,
        kind,
        severity,
        summary,
    }
}

fn blocked_count(snap: &Snapshot) -> usize {
    let mut pids: Vec<i32> = snap.blocked_locks().map(|l| l.pid).collect();
    pids.sort_unstable();
    pids.dedup();
    pids.len()
}

/// Events visible in consecutive snapshot pairs: counter jumps, onset or
/// change of lock blocking, and setting changes.
fn snapshot_events(history: &History, start: i64, end: i64) -> Vec<TimelineEvent> {
    let mut out = Vec::new();
    let window = history.in_window(start, end);

    let with_counters: Vec<&Snapshot> = history
        .before(start)
        .into_iter()
        .chain(window)
        .filter(|s| s.counters().is_some())
        .collect();
    for pair in with_counters.windows(2) {
        let (prev, curr) = (pair[0], pair[1]);
        let (Some(p), Some(c)) = (prev.counters(), curr.counters()) else {
            continue;
        };
        let at = curr.captured_at;
        if let Some(n) = di64(c.checkpoints_req, p.checkpoints_req).filter(|n| *n > 0) {
            out.push(event(
                at,
                TimelineEventKind::Checkpoint,
                Severity::Low,
                format!("{} requested checkpoint(s)", n),
            ));
        }
        if let Some(n) = di64(c.deadlocks, p.deadlocks).filter(|n| *n > 0) {
            out.push(event(
                at,
                TimelineEventKind::Deadlock,
                Severity::High,
                format!("{} deadlock(s)", n),
            ));
        }
        if let Some(n) = di64(c.conflicts, p.conflicts).filter(|n| *n > 0) {
            out.push(event(
                at,
                TimelineEventKind::ReplicationConflict,
                Severity::Medium,
                format!("{} recovery conflict(s)", n),
            ));
        }
    }

    let mut prev_blocked = history
        .before(start)
        .filter(|s| s.has(SampleKind::Locks))
        .map(blocked_count)
        .unwrap_or(0);
    for snap in window.iter().filter(|s| s.has(SampleKind::Locks)) {
        let blocked = blocked_count(snap);
        if blocked > 0 && blocked != prev_blocked {
            out.push(event(
                snap.captured_at,
                TimelineEventKind::BlockedSessions,
                if blocked >= 5 { Severity::High } else { Severity::Medium },
                format!("{} blocked session(s)", blocked),
            ));
        }
        prev_blocked = blocked;
    }

    let with_settings: Vec<&Snapshot> = history
        .before(start)
        .into_iter()
        .chain(window)
        .filter(|s| s.has(SampleKind::Settings))
        .collect();
    for pair in with_settings.windows(2) {
        let changed = changed_settings(pair[0].settings(), pair[1].settings());
        if !changed.is_empty() {
            out.push(event(
                pair[1].captured_at,
                TimelineEventKind::ConfigChange,
                Severity::Medium,
                format!("settings changed: {}", changed.join(", ")),
            ));
        }
    }
    out
}

fn collection_events(stats: &[CollectionStat]) -> Vec<TimelineEvent> {
    stats
        .iter()
        .filter(|s| s.scope == StatScope::Cycle)
        .filter_map(|s| {
            let (kind, severity) = match s.outcome {
                CollectionOutcome::Skipped => (TimelineEventKind::CollectionSkipped, Severity::Low),
                CollectionOutcome::Throttled => {
                    (TimelineEventKind::CollectionThrottled, Severity::Low)
                }
                CollectionOutcome::Failed => (TimelineEventKind::CollectionFailed, Severity::Medium),
                CollectionOutcome::Succeeded | CollectionOutcome::Partial => return None,
            };
            let summary = match &s.detail {
                Some(d) => format!("collection {}: {}", s.outcome, d),
                None => format!("collection {}", s.outcome),
            };
            Some(event(s.started_at, kind, severity, summary))
        })
        .collect()
}

fn incident_events(
    storms: &[QueryStorm],
    regressions: &[QueryRegression],
    findings: &[Finding],
    start: i64,
    end: i64,
) -> Vec<TimelineEvent> {
    let within = |t: i64| t >= start && t <= end;
    let mut out = Vec::new();
    for s in storms {
        if within(s.detected_at) {
            out.push(event(
                s.detected_at,
                TimelineEventKind::StormDetected,
                s.severity,
                format!(
                    "storm #{} ({}) on query {}: {:.1}x baseline",
                    s.id, s.class, s.queryid, s.multiplier
                ),
            ));
        }
        if let Some(at) = s.resolved_at.filter(|t| within(*t)) {
            out.push(event(
                at,
                TimelineEventKind::StormResolved,
                Severity::Low,
                format!("storm #{} resolved", s.id),
            ));
        }
    }
    for r in regressions {
        if within(r.detected_at) {
            out.push(event(
                r.detected_at,
                TimelineEventKind::RegressionDetected,
                r.severity,
                format!(
                    "regression #{} on query {}: {} +{:.0}%",
                    r.id,
                    r.queryid,
                    r.metric.as_str(),
                    r.change_pct
                ),
            ));
        }
        if let Some(at) = r.resolved_at.filter(|t| within(*t)) {
            out.push(event(
                at,
                TimelineEventKind::RegressionResolved,
                Severity::Low,
                format!("regression #{} resolved", r.id),
            ));
        }
    }
    for f in findings.iter().filter(|f| within(f.detected_at)) {
        out.push(event(
            f.detected_at,
            TimelineEventKind::Anomaly,
            f.severity,
            format!("{}: {}", f.rule_id, f.title),
        ));
    }
    out
}

/// Every event in `[start, end]` from snapshots, collection stats, storms,
/// regressions and recorded findings, in time order.
pub fn incident_timeline(
    storage: &Storage,
    start: i64,
    end: i64,
) -> Result<Vec<TimelineEvent>, AnalysisError> {
    check_window(start, end)?;
    let history = History::load(storage, start, end)?;
    let mut events = snapshot_events(&history, start, end);
    events.extend(collection_events(&storage.stats_between(start, end)?));
    {
        let incidents = storage.incidents();
        events.extend(incident_events(
            incidents.storms(),
            incidents.regressions(),
            incidents.findings(),
            start,
            end,
        ));
    }
    events.sort_by_key(|e| e.at);
    Ok(events)
}
