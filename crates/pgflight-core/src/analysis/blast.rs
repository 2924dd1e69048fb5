//! Blast radius of an incident window against the equally long window
//! right before it.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use super::regression::cost_per_call;
use super::{AnalysisError, History, check_window};
use crate::config::Config;
use crate::model::{SampleKind, Severity, Snapshot};
use crate::storage::Storage;
use crate::storage::metrics::di64;

/// Cost growth beyond which a query counts as degraded.
const DEGRADED_FACTOR: f64 = 1.5;

#[derive(Clone, Serialize, Debug, PartialEq, Default)]
pub struct BlockedSummary {
    /// Distinct blocked sessions.
    pub sessions: usize,
    /// Longest observed wait of any blocked session.
    pub max_wait_secs: i64,
    pub by_lock_type: BTreeMap<String, usize>,
    pub by_application: BTreeMap<String, usize>,
}

#[derive(Clone, Copy, Serialize, Debug, PartialEq, Default)]
pub struct MetricDelta {
    pub baseline: Option<f64>,
    pub incident: Option<f64>,
}

impl MetricDelta {
    pub fn change_pct(&self) -> Option<f64> {
        match (self.baseline, self.incident) {
            (Some(b), Some(i)) if b > 0.0 => Some((i - b) / b * 100.0),
            _ => None,
        }
    }
}

#[derive(Clone, Serialize, Debug, PartialEq)]
pub struct Recommendation {
    pub id: String,
    pub severity: Severity,
    pub title: String,
    pub description: String,
}

#[derive(Clone, Serialize, Debug, PartialEq)]
pub struct BlastRadius {
    pub start: i64,
    pub end: i64,
    pub baseline_start: i64,
    pub blocked: BlockedSummary,
    pub queries_compared: usize,
    pub degraded_queries: Vec<i64>,
    pub degraded_fraction: f64,
    /// Mean backend count.
    pub connections: MetricDelta,
    /// Transactions per second.
    pub throughput: MetricDelta,
    /// Per `type:event`, share of waiting sessions in the incident window
    /// minus the share in the baseline.
    pub wait_shift: BTreeMap<String, f64>,
    pub score: u32,
    pub severity: Severity,
    pub recommendations: Vec<Recommendation>,
}

fn blocked_summary(window: &[Snapshot]) -> BlockedSummary {
    // pid -> (first seen, last seen, longest explicit wait)
    let mut seen: BTreeMap<i32, (i64, i64, i64)> = BTreeMap::new();
    let mut lock_types: BTreeMap<String, BTreeSet<i32>> = BTreeMap::new();
    let mut apps: BTreeMap<String, BTreeSet<i32>> = BTreeMap::new();

    for snap in window.iter().filter(|s| s.has(SampleKind::Locks)) {
        for lock in snap.blocked_locks() {
            let wait = if lock.wait_start > 0 {
                snap.captured_at - lock.wait_start
            } else {
                0
            };
            let entry = seen
                .entry(lock.pid)
                .or_insert((snap.captured_at, snap.captured_at, 0));
            entry.1 = snap.captured_at;
            entry.2 = entry.2.max(wait);
            lock_types.entry(lock.locktype.clone()).or_default().insert(lock.pid);
            let app = if lock.application_name.is_empty() {
                "(unknown)".to_string()
            } else {
                lock.application_name.clone()
            };
            apps.entry(app).or_default().insert(lock.pid);
        }
    }

    BlockedSummary {
        sessions: seen.len(),
        max_wait_secs: seen
            .values()
            .map(|(first, last, wait)| (last - first).max(*wait))
            .max()
            .unwrap_or(0),
        by_lock_type: lock_types.into_iter().map(|(k, v)| (k, v.len())).collect(),
        by_application: apps.into_iter().map(|(k, v)| (k, v.len())).collect(),
    }
}

fn mean_connections(window: &[Snapshot]) -> Option<f64> {
    let values: Vec<f64> = window
        .iter()
        .filter_map(|s| s.counters().map(|c| c.numbackends as f64))
        .collect();
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

fn throughput(history: &History, from: i64, to: i64) -> Option<f64> {
    let points: Vec<&Snapshot> = history
        .before(from)
        .into_iter()
        .chain(history.in_window(from, to))
        .filter(|s| s.counters().is_some())
        .collect();
    let (first, last) = (points.first()?, points.last()?);
    let (a, b) = (first.counters()?, last.counters()?);
    let dt = (last.captured_at - first.captured_at) as f64;
    if dt <= 0.0 {
        return None;
    }
    let xacts = di64(b.xact_commit + b.xact_rollback, a.xact_commit + a.xact_rollback)?;
    Some(xacts as f64 / dt)
}

fn wait_shares(window: &[Snapshot]) -> BTreeMap<String, f64> {
    let mut counts: BTreeMap<String, f64> = BTreeMap::new();
    for snap in window {
        for w in snap.waits() {
            *counts
                .entry(format!("{}:{}", w.wait_event_type, w.wait_event))
                .or_default() += w.count as f64;
        }
    }
    let total: f64 = counts.values().sum();
    if total > 0.0 {
        counts.values_mut().for_each(|v| *v /= total);
    }
    counts
}

fn score(radius: &BlastRadius) -> u32 {
    let blocked = match radius.blocked.sessions {
        0 => 0,
        1..=4 => 1,
        5..=19 => 2,
        _ => 3,
    };
    let degraded = match radius.degraded_fraction {
        f if f >= 0.5 => 3,
        f if f >= 0.25 => 2,
        f if f > 0.0 => 1,
        _ => 0,
    };
    let connections = match radius.connections.change_pct() {
        Some(p) if p >= 100.0 => 3,
        Some(p) if p >= 50.0 => 2,
        Some(p) if p >= 20.0 => 1,
        _ => 0,
    };
    let throughput = match radius.throughput.change_pct() {
        Some(p) if p <= -80.0 => 3,
        Some(p) if p <= -50.0 => 2,
        Some(p) if p <= -20.0 => 1,
        _ => 0,
    };
    blocked + degraded + connections + throughput
}

fn severity_for(score: u32) -> Severity {
    match score {
        0..=2 => Severity::Low,
        3..=5 => Severity::Medium,
        6..=8 => Severity::High,
        _ => Severity::Critical,
    }
}

/// Compares `[start, end]` with `[2 * start - end, start)`.
pub fn compute_blast_radius(
    history: &History,
    config: &Config,
    start: i64,
    end: i64,
) -> Result<BlastRadius, AnalysisError> {
    check_window(start, end)?;
    let baseline_start = start - (end - start);
    let incident = history.in_window(start, end);
    if incident.is_empty() {
        return Err(AnalysisError::InsufficientData(format!(
            "no snapshots between {} and {}",
            start, end
        )));
    }
    let baseline = history.in_window(baseline_start, start - 1);

    let metric = config.regression_metric;
    let before = history.statement_window(baseline_start, start);
    let during = history.statement_window(start, end);
    let mut compared = 0;
    let mut degraded = Vec::new();
    for (queryid, d) in &during {
        let Some(b) = before.get(queryid) else {
            continue;
        };
        let (Some(cost), Some(base)) = (cost_per_call(d, metric), cost_per_call(b, metric)) else {
            continue;
        };
        compared += 1;
        if base > 0.0 && cost > base * DEGRADED_FACTOR {
            degraded.push(*queryid);
        }
    }

    let incident_waits = wait_shares(incident);
    let baseline_waits = wait_shares(baseline);
    let mut wait_shift = BTreeMap::new();
    for key in incident_waits.keys().chain(baseline_waits.keys()) {
        let shift = incident_waits.get(key).copied().unwrap_or(0.0)
            - baseline_waits.get(key).copied().unwrap_or(0.0);
        if shift != 0.0 {
            wait_shift.insert(key.clone(), shift);
        }
    }

    let mut radius = BlastRadius {
        start,
        end,
        baseline_start,
        blocked: blocked_summary(incident),
        queries_compared: compared,
        degraded_fraction: if compared > 0 {
            degraded.len() as f64 / compared as f64
        } else {
            0.0
        },
        degraded_queries: degraded,
        connections: MetricDelta {
            baseline: mean_connections(baseline),
            incident: mean_connections(incident),
        },
        throughput: MetricDelta {
            baseline: throughput(history, baseline_start, start - 1),
            incident: throughput(history, start, end),
        },
        wait_shift,
        score: 0,
        severity: Severity::Low,
        recommendations: Vec::new(),
    };
    radius.score = score(&radius);
    radius.severity = severity_for(radius.score);
    radius.recommendations = all_advisors()
        .iter()
        .filter_map(|a| a.evaluate(&radius))
        .collect();
    Ok(radius)
}

/// Loads the incident window plus its baseline and computes the blast radius.
pub fn blast_radius(
    storage: &Storage,
    config: &Config,
    start: i64,
    end: i64,
) -> Result<BlastRadius, AnalysisError> {
    check_window(start, end)?;
    let history = History::load(storage, start - (end - start), end)?;
    compute_blast_radius(&history, config, start, end)
}

// ============================================================
// Advisors
// ============================================================

pub trait Advisor: Send + Sync {
    fn id(&self) -> &'static str;
    fn evaluate(&self, radius: &BlastRadius) -> Option<Recommendation>;
}

pub fn all_advisors() -> Vec<Box<dyn Advisor>> {
    vec![
        Box::new(LockContentionAdvisor),
        Box::new(DegradedQueriesAdvisor),
        Box::new(ConnectionSurgeAdvisor),
        Box::new(ThroughputDropAdvisor),
        Box::new(WaitShiftAdvisor),
    ]
}

fn top<'a>(counts: &'a BTreeMap<String, usize>) -> Option<(&'a str, usize)> {
    counts
        .iter()
        .max_by_key(|(_, n)| **n)
        .map(|(k, n)| (k.as_str(), *n))
}

pub struct LockContentionAdvisor;

impl Advisor for LockContentionAdvisor {
    fn id(&self) -> &'static str {
        "lock_contention"
    }

    fn evaluate(&self, radius: &BlastRadius) -> Option<Recommendation> {
        let blocked = &radius.blocked;
        if blocked.sessions == 0 {
            return None;
        }
        let mut desc = format!(
            "{} session(s) were blocked, the longest for {}s. Inspect pg_locks and \
             pg_blocking_pids() for the holders and keep transactions that take \
             strong locks short.",
            blocked.sessions, blocked.max_wait_secs
        );
        if let Some((lock_type, n)) = top(&blocked.by_lock_type) {
            desc.push_str(&format!(" Most waits were on {} locks ({} sessions).", lock_type, n));
        }
        if let Some((app, n)) = top(&blocked.by_application) {
            desc.push_str(&format!(" Application most affected: {} ({} sessions).", app, n));
        }
        Some(Recommendation {
            id: self.id().to_string(),
            severity: if blocked.sessions >= 5 {
                Severity::High
            } else {
                Severity::Medium
            },
            title: "Investigate blocking sessions".to_string(),
            description: desc,
        })
    }
}

pub struct DegradedQueriesAdvisor;

impl Advisor for DegradedQueriesAdvisor {
    fn id(&self) -> &'static str {
        "degraded_queries"
    }

    fn evaluate(&self, radius: &BlastRadius) -> Option<Recommendation> {
        if radius.degraded_queries.is_empty() {
            return None;
        }
        Some(Recommendation {
            id: self.id().to_string(),
            severity: if radius.degraded_fraction >= 0.25 {
                Severity::High
            } else {
                Severity::Medium
            },
            title: "Review plans of degraded queries".to_string(),
            description: format!(
                "{} of {} compared queries cost more than 1.5x their baseline per call. \
                 Compare EXPLAIN output against the baseline period and check whether \
                 statistics are stale (ANALYZE) or settings changed.",
                radius.degraded_queries.len(),
                radius.queries_compared
            ),
        })
    }
}

pub struct ConnectionSurgeAdvisor;

impl Advisor for ConnectionSurgeAdvisor {
    fn id(&self) -> &'static str {
        "connection_surge"
    }

    fn evaluate(&self, radius: &BlastRadius) -> Option<Recommendation> {
        let pct = radius.connections.change_pct().filter(|p| *p >= 50.0)?;
        Some(Recommendation {
            id: self.id().to_string(),
            severity: if pct >= 100.0 {
                Severity::High
            } else {
                Severity::Medium
            },
            title: "Check connection pooling".to_string(),
            description: format!(
                "Mean backend count rose {:.0}% over the baseline. A pooler in front of \
                 the server, or smaller client pool limits, keeps bursts from exhausting \
                 max_connections.",
                pct
            ),
        })
    }
}

pub struct ThroughputDropAdvisor;

impl Advisor for ThroughputDropAdvisor {
    fn id(&self) -> &'static str {
        "throughput_drop"
    }

    fn evaluate(&self, radius: &BlastRadius) -> Option<Recommendation> {
        let pct = radius.throughput.change_pct().filter(|p| *p <= -20.0)?;
        Some(Recommendation {
            id: self.id().to_string(),
            severity: if pct <= -50.0 {
                Severity::High
            } else {
                Severity::Medium
            },
            title: "Throughput dropped".to_string(),
            description: format!(
                "Transactions per second fell {:.0}% against the baseline window. \
                 Correlate with the blocked sessions and wait events of the incident.",
                -pct
            ),
        })
    }
}

pub struct WaitShiftAdvisor;

impl Advisor for WaitShiftAdvisor {
    fn id(&self) -> &'static str {
        "wait_shift"
    }

    fn evaluate(&self, radius: &BlastRadius) -> Option<Recommendation> {
        let (event, shift) = radius
            .wait_shift
            .iter()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .filter(|(_, s)| **s >= 0.2)?;
        Some(Recommendation {
            id: self.id().to_string(),
            severity: Severity::Low,
            title: format!("Wait event {} became dominant", event),
            description: format!(
                "Its share of waiting sessions grew by {:.0} percentage points over the \
                 baseline window.",
                shift * 100.0
            ),
        })
    }
}
