use super::{AnomalyContext, AnomalyRule, finding};
use crate::model::{Finding, SampleKind, Severity};

// ============================================================
// IdleInTransactionRule
// ============================================================

/// Sessions holding a transaction open while idle. They pin the xmin
/// horizon, so vacuum cannot clean up behind them.
pub struct IdleInTransactionRule;

impl AnomalyRule for IdleInTransactionRule {
    fn id(&self) -> &'static str {
        "idle_in_transaction"
    }

    fn evaluate(&self, ctx: &AnomalyContext) -> Option<Finding> {
        let threshold = ctx.config.idle_in_transaction_secs;
        let snapshot = ctx.latest(SampleKind::Activity)?;
        let at = snapshot.captured_at;

        let mut count = 0usize;
        let mut worst: Option<(i64, i32, &str)> = None;
        for s in snapshot.activity() {
            if !s.in_transaction_idle() || s.xact_start <= 0 {
                continue;
            }
            let open_for = at - s.xact_start;
            if open_for < threshold {
                continue;
            }
            count += 1;
            if worst.is_none_or(|(d, _, _)| open_for > d) {
                worst = Some((open_for, s.pid, s.application_name.as_str()));
            }
        }
        let (longest, pid, app) = worst?;

        let severity = if longest >= threshold * 12 || count >= 5 {
            Severity::Critical
        } else if longest >= threshold * 4 {
            Severity::High
        } else {
            Severity::Medium
        };
        let mut f = finding(
            ctx,
            self.id(),
            severity,
            format!("{count} idle-in-transaction session(s), longest {longest}s"),
            longest as f64,
        );
        f.detail = Some(format!("pid {pid} ({app}) has held its transaction open for {longest}s"));
        f.entity = Some(pid.to_string());
        Some(f)
    }
}

// ============================================================
// ConnectionLeakRule
// ============================================================

pub struct ConnectionLeakRule;

impl AnomalyRule for ConnectionLeakRule {
    fn id(&self) -> &'static str {
        "connection_leak"
    }

    fn evaluate(&self, ctx: &AnomalyContext) -> Option<Finding> {
        let threshold = ctx.config.connection_leak_secs;
        let snapshot = ctx.latest(SampleKind::Activity)?;
        let at = snapshot.captured_at;

        let old: Vec<_> = snapshot
            .activity()
            .iter()
            .filter(|s| s.is_client_backend() && s.backend_start > 0)
            .filter(|s| at - s.backend_start >= threshold)
            .collect();
        let oldest = old.iter().min_by_key(|s| s.backend_start)?;
        let age = at - oldest.backend_start;

        let severity = if old.len() >= 10 {
            Severity::High
        } else {
            Severity::Medium
        };
        let mut f = finding(
            ctx,
            self.id(),
            severity,
            format!("{} session(s) connected longer than {}s", old.len(), threshold),
            age as f64,
        );
        f.detail = Some(format!(
            "oldest: pid {} ({}) connected {}s ago",
            oldest.pid, oldest.application_name, age
        ));
        f.entity = Some(oldest.pid.to_string());
        Some(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::model::{ActivitySample, DataBlock, Snapshot};
    use crate::source::mock::session;

    fn snapshot(at: i64, sessions: Vec<ActivitySample>) -> Snapshot {
        let mut s = Snapshot::new(1, at);
        s.blocks.push(DataBlock::Activity(sessions));
        s
    }

    fn ctx<'a>(snap: &'a Snapshot, history: &'a [Snapshot], config: &'a Config) -> AnomalyContext<'a> {
        AnomalyContext {
            snapshot: snap,
            history,
            config,
            now: snap.captured_at,
        }
    }

    #[test]
    fn idle_transaction_past_threshold_fires() {
        let config = Config::default();
        let mut young = session(1, "idle in transaction", "app", "client backend");
        young.xact_start = 10_000 - 60;
        let mut old = session(2, "idle in transaction (aborted)", "batch", "client backend");
        old.xact_start = 10_000 - 1_500;
        let snap = snapshot(10_000, vec![young, old]);
        let history = [snap.clone()];

        let f = IdleInTransactionRule.evaluate(&ctx(&snap, &history, &config)).unwrap();
        assert_eq!(f.value, 1_500.0);
        assert_eq!(f.entity.as_deref(), Some("2"));
        assert_eq!(f.severity, Severity::High);
    }

    #[test]
    fn idle_transaction_below_threshold_is_quiet() {
        let config = Config::default();
        let mut s = session(1, "idle in transaction", "app", "client backend");
        s.xact_start = 10_000 - 299;
        let snap = snapshot(10_000, vec![s]);
        let history = [snap.clone()];
        assert!(IdleInTransactionRule.evaluate(&ctx(&snap, &history, &config)).is_none());
    }

    #[test]
    fn cycle_without_activity_falls_back_to_last_sampled_sessions() {
        let config = Config::default();
        let mut idle = session(7, "idle in transaction", "app", "client backend");
        idle.xact_start = 10_000 - 3_600;
        let sampled = snapshot(10_000, vec![idle]);
        // Activity failed on the next cycle; only database counters landed.
        let mut partial = Snapshot::new(2, 10_180);
        partial.blocks.push(DataBlock::Database(Default::default()));
        let history = [sampled, partial.clone()];

        let f = IdleInTransactionRule.evaluate(&ctx(&partial, &history, &config)).unwrap();
        assert_eq!(f.entity.as_deref(), Some("7"));
        assert_eq!(f.value, 3_600.0);

        let only_partial = [partial.clone()];
        assert!(IdleInTransactionRule.evaluate(&ctx(&partial, &only_partial, &config)).is_none());
    }

    #[test]
    fn week_old_connection_is_a_leak() {
        let config = Config::default();
        let now = 2_000_000;
        let mut leaked = session(3, "idle", "app", "client backend");
        leaked.backend_start = now - 8 * 86_400;
        let mut fresh = session(4, "idle", "app", "client backend");
        fresh.backend_start = now - 60;
        let mut walsender = session(5, "active", "", "walsender");
        walsender.backend_start = now - 30 * 86_400;
        let snap = snapshot(now, vec![leaked, fresh, walsender]);
        let history = [snap.clone()];

        let f = ConnectionLeakRule.evaluate(&ctx(&snap, &history, &config)).unwrap();
        assert_eq!(f.entity.as_deref(), Some("3"));
        assert_eq!(f.value, (8 * 86_400) as f64);
    }
}
