//! Rule-based anomaly detection over the latest snapshot and a short trend
//! window. Each rule emits at most one finding per evaluation.

pub mod replication;
pub mod sessions;
pub mod tables;

use serde::Serialize;
use tracing::debug;

use super::{AnalysisError, History, check_window};
use crate::config::Config;
use crate::model::{Finding, SampleKind, Severity, Snapshot};
use crate::storage::Storage;

pub struct AnomalyContext<'a> {
    /// Newest snapshot in the window.
    pub snapshot: &'a Snapshot,
    /// Every snapshot in the trend window, oldest first, ending with `snapshot`.
    pub history: &'a [Snapshot],
    pub config: &'a Config,
    pub now: i64,
}

impl AnomalyContext<'_> {
    /// Newest snapshot in the window that carries a `kind` block. A cycle
    /// whose sub-collection failed says nothing about that kind.
    pub fn latest(&self, kind: SampleKind) -> Option<&Snapshot> {
        self.history.iter().rev().find(|s| s.has(kind))
    }
}

pub trait AnomalyRule: Send + Sync {
    fn id(&self) -> &'static str;
    fn evaluate(&self, ctx: &AnomalyContext) -> Option<Finding>;
}

pub fn all_rules() -> Vec<Box<dyn AnomalyRule>> {
    vec![
        // Sessions
        Box::new(sessions::IdleInTransactionRule),
        Box::new(sessions::ConnectionLeakRule),
        // Tables
        Box::new(tables::DeadTupleAccumulationRule),
        Box::new(tables::VacuumStarvationRule),
        // Replication
        Box::new(replication::ReplicationLagGrowingRule),
    ]
}

pub(crate) fn finding(
    ctx: &AnomalyContext,
    rule_id: &str,
    severity: Severity,
    title: String,
    value: f64,
) -> Finding {
    Finding {
        rule_id: rule_id.to_string(),
        severity,
        title,
        detail: None,
        value,
        detected_at: ctx.now,
        entity: None,
    }
}

#[derive(Clone, Serialize, Debug, PartialEq)]
pub struct AnomalyReport {
    pub evaluated_at: i64,
    pub window_secs: i64,
    pub snapshots_analyzed: usize,
    pub findings: Vec<Finding>,
    /// Findings were written to the incident ledger.
    pub persisted: bool,
}

/// Runs every rule against `history`, newest snapshot last.
pub fn evaluate_rules(history: &[Snapshot], config: &Config, now: i64) -> Vec<Finding> {
    let Some(snapshot) = history.last() else {
        return Vec::new();
    };
    let ctx = AnomalyContext {
        snapshot,
        history,
        config,
        now,
    };
    all_rules()
        .iter()
        .filter_map(|rule| {
            let found = rule.evaluate(&ctx);
            if found.is_some() {
                debug!(rule = rule.id(), "anomaly rule fired");
            }
            found
        })
        .collect()
}

/// Evaluates the rules over `[now - window_secs, now]`. Findings are only
/// recorded in the incident ledger when `persist` is set.
pub fn anomaly_report(
    storage: &Storage,
    config: &Config,
    now: i64,
    window_secs: i64,
    persist: bool,
) -> Result<AnomalyReport, AnalysisError> {
    check_window(now - window_secs, now)?;
    let history = History::load(storage, now - window_secs, now)?;
    let window = history.in_window(now - window_secs, now);
    if window.is_empty() {
        return Err(AnalysisError::InsufficientData(format!(
            "no snapshots in the last {}s",
            window_secs
        )));
    }
    let findings = evaluate_rules(window, config, now);
    if persist && !findings.is_empty() {
        let mut incidents = storage.incidents();
        incidents.record_findings(&findings);
        incidents.save()?;
    }
    Ok(AnomalyReport {
        evaluated_at: now,
        window_secs,
        snapshots_analyzed: window.len(),
        findings,
        persisted: persist,
    })
}
