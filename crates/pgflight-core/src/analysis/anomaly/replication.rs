use std::collections::BTreeMap;

use super::{AnomalyContext, AnomalyRule, finding};
use crate::analysis::forecast::fit_line;
use crate::model::{Finding, SampleKind, Severity};

/// Fit quality below which a rising lag is treated as noise.
const MIN_TREND_R2: f64 = 0.5;
const LAG_HIGH_BYTES: i64 = 1 << 30;

// ============================================================
// ReplicationLagGrowingRule
// ============================================================

/// Replay lag trending upward across the window, not merely high once.
pub struct ReplicationLagGrowingRule;

impl AnomalyRule for ReplicationLagGrowingRule {
    fn id(&self) -> &'static str {
        "replication_lag_growing"
    }

    fn evaluate(&self, ctx: &AnomalyContext) -> Option<Finding> {
        let mut series: BTreeMap<&str, Vec<(i64, f64)>> = BTreeMap::new();
        for snap in ctx.history.iter().filter(|s| s.has(SampleKind::Replication)) {
            for r in snap.replication() {
                series
                    .entry(r.application_name.as_str())
                    .or_default()
                    .push((snap.captured_at, r.replay_lag_bytes as f64));
            }
        }

        let mut worst: Option<(&str, f64, f64)> = None;
        for (replica, points) in &series {
            if points.len() < ctx.config.replication_lag_min_samples {
                continue;
            }
            let Some(fit) = fit_line(points) else {
                continue;
            };
            if fit.slope <= 0.0 || fit.r2 < MIN_TREND_R2 {
                continue;
            }
            let latest = points.last().map(|(_, v)| *v).unwrap_or_default();
            if worst.is_none_or(|(_, slope, _)| fit.slope > slope) {
                worst = Some((*replica, fit.slope, latest));
            }
        }
        let (replica, slope, latest) = worst?;

        let severity = if latest >= LAG_HIGH_BYTES as f64 {
            Severity::High
        } else {
            Severity::Medium
        };
        let mut f = finding(
            ctx,
            self.id(),
            severity,
            format!("replication lag of {replica} growing at {slope:.0} bytes/s"),
            slope,
        );
        f.detail = Some(format!("current replay lag {} bytes", latest as i64));
        f.entity = Some(replica.to_string());
        Some(f)
    }
}
