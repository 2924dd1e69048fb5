use super::{AnomalyContext, AnomalyRule, finding};
use crate::model::{Finding, SampleKind, Severity, Snapshot, TableSnapshot};

fn table_in(snapshot: &Snapshot, relid: i64) -> Option<&TableSnapshot> {
    snapshot.tables().iter().find(|t| t.relid == relid)
}

fn vacuumed_between(before: &TableSnapshot, after: &TableSnapshot) -> bool {
    after.vacuum_events() != before.vacuum_events()
        || after.last_vacuum != before.last_vacuum
        || after.last_autovacuum != before.last_autovacuum
}

// ============================================================
// DeadTupleAccumulationRule
// ============================================================

/// Dead-tuple ratio above the threshold on a table that saw no vacuum
/// across the trend window.
pub struct DeadTupleAccumulationRule;

impl AnomalyRule for DeadTupleAccumulationRule {
    fn id(&self) -> &'static str {
        "dead_tuple_accumulation"
    }

    fn evaluate(&self, ctx: &AnomalyContext) -> Option<Finding> {
        let earliest = ctx.history.iter().find(|s| s.has(SampleKind::Tables))?;

        let worst = ctx
            .snapshot
            .tables()
            .iter()
            .filter(|t| t.n_dead_tup >= ctx.config.dead_tuple_min)
            .filter(|t| t.dead_ratio() > ctx.config.dead_tuple_ratio)
            .filter(|t| table_in(earliest, t.relid).is_none_or(|first| !vacuumed_between(first, t)))
            .max_by(|a, b| a.dead_ratio().total_cmp(&b.dead_ratio()))?;

        let ratio = worst.dead_ratio();
        let severity = if ratio >= 0.5 {
            Severity::High
        } else {
            Severity::Medium
        };
        let mut f = finding(
            ctx,
            self.id(),
            severity,
            format!(
                "{}: {:.0}% dead tuples with no vacuum",
                worst.qualified_name(),
                ratio * 100.0
            ),
            ratio,
        );
        f.detail = Some(format!(
            "{} dead / {} live tuples",
            worst.n_dead_tup, worst.n_live_tup
        ));
        f.entity = Some(worst.qualified_name());
        Some(f)
    }
}

// ============================================================
// VacuumStarvationRule
// ============================================================

/// Dead tuples strictly increasing over the last N table samples with no
/// vacuum in between.
pub struct VacuumStarvationRule;

impl AnomalyRule for VacuumStarvationRule {
    fn id(&self) -> &'static str {
        "vacuum_starvation"
    }

    fn evaluate(&self, ctx: &AnomalyContext) -> Option<Finding> {
        let n = ctx.config.vacuum_starvation_snapshots;
        let samples: Vec<&Snapshot> = ctx
            .history
            .iter()
            .filter(|s| s.has(SampleKind::Tables))
            .collect();
        if samples.len() < n {
            return None;
        }
        let recent = &samples[samples.len() - n..];
        let latest = recent.last()?;

        let mut worst: Option<(&TableSnapshot, i64)> = None;
        for table in latest.tables() {
            let series: Option<Vec<&TableSnapshot>> =
                recent.iter().map(|s| table_in(s, table.relid)).collect();
            let Some(series) = series else {
                continue;
            };
            let starving = series.windows(2).all(|w| {
                w[1].n_dead_tup > w[0].n_dead_tup && !vacuumed_between(w[0], w[1])
            });
            if !starving {
                continue;
            }
            let growth = table.n_dead_tup - series[0].n_dead_tup;
            if worst.is_none_or(|(_, g)| growth > g) {
                worst = Some((table, growth));
            }
        }
        let (table, growth) = worst?;

        let mut f = finding(
            ctx,
            self.id(),
            Severity::High,
            format!(
                "{}: dead tuples grew by {} over {} samples without vacuum",
                table.qualified_name(),
                growth,
                n
            ),
            growth as f64,
        );
        f.entity = Some(table.qualified_name());
        Some(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::model::DataBlock;

    fn table(dead: i64, autovacuums: i64) -> TableSnapshot {
        TableSnapshot {
            relid: 1,
            schemaname: "public".into(),
            relname: "events".into(),
            n_live_tup: 100_000,
            n_dead_tup: dead,
            autovacuum_count: autovacuums,
            ..TableSnapshot::default()
        }
    }

    fn history(tables: &[TableSnapshot]) -> Vec<Snapshot> {
        tables
            .iter()
            .enumerate()
            .map(|(i, t)| {
                let mut s = Snapshot::new(i as u64 + 1, 1_000 + i as i64 * 180);
                s.blocks.push(DataBlock::Tables(vec![t.clone()]));
                s
            })
            .collect()
    }

    fn run(rule: &dyn AnomalyRule, snaps: &[Snapshot]) -> Option<Finding> {
        let config = Config::default();
        let ctx = AnomalyContext {
            snapshot: snaps.last().unwrap(),
            history: snaps,
            config: &config,
            now: 5_000,
        };
        rule.evaluate(&ctx)
    }

    #[test]
    fn dead_tuples_without_vacuum_fire() {
        let snaps = history(&[table(30_000, 4), table(40_000, 4)]);
        let f = run(&DeadTupleAccumulationRule, &snaps).unwrap();
        assert_eq!(f.entity.as_deref(), Some("public.events"));
        assert!((f.value - 40_000.0 / 140_000.0).abs() < 1e-9);
        assert_eq!(f.severity, Severity::Medium);
    }

    #[test]
    fn vacuum_in_window_suppresses_accumulation() {
        let snaps = history(&[table(30_000, 4), table(40_000, 5)]);
        assert!(run(&DeadTupleAccumulationRule, &snaps).is_none());
    }

    #[test]
    fn monotonic_growth_over_n_samples_is_starvation() {
        let snaps = history(&[
            table(100, 2),
            table(200, 2),
            table(300, 2),
            table(400, 2),
            table(500, 2),
        ]);
        let f = run(&VacuumStarvationRule, &snaps).unwrap();
        assert_eq!(f.value, 400.0);
        assert!(run(&VacuumStarvationRule, &snaps[..4]).is_none());
    }

    #[test]
    fn plateau_breaks_starvation() {
        let snaps = history(&[
            table(100, 2),
            table(200, 2),
            table(200, 2),
            table(400, 2),
            table(500, 2),
        ]);
        assert!(run(&VacuumStarvationRule, &snaps).is_none());
    }
}
