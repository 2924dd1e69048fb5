//! Time-bucketed summaries of archived history.
//!
//! Each family gets its own segment log under `<data>/aggregates/`. A bucket
//! is summarized exactly once: the watermark (end of the last summarized
//! bucket) is persisted after every bucket so a restart never duplicates one.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::metrics::{
    StatementTotals, activity_metrics, database_metrics, statement_totals, table_metrics,
    wait_metrics,
};
use super::segment::{PurgeOutcome, SegmentLog, Timestamped};
use super::{StorageError, write_atomic};
use crate::model::Snapshot;

/// Widest bucket accepted by the configuration.
pub const MAX_BUCKET_SECS: i64 = 86_400;

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFamily {
    Database,
    Activity,
    Waits,
    Tables,
    Statements,
}

impl AggregateFamily {
    pub const ALL: [AggregateFamily; 5] = [
        AggregateFamily::Database,
        AggregateFamily::Activity,
        AggregateFamily::Waits,
        AggregateFamily::Tables,
        AggregateFamily::Statements,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateFamily::Database => "database",
            AggregateFamily::Activity => "activity",
            AggregateFamily::Waits => "waits",
            AggregateFamily::Tables => "tables",
            AggregateFamily::Statements => "statements",
        }
    }
}

impl fmt::Display for AggregateFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// count / sum / min / max / p95 of one metric over one bucket.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Summary {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub p95: f64,
}

impl Summary {
    /// `None` for an empty series.
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let n = sorted.len();
        let idx = ((n as f64 * 0.95) as usize).min(n - 1);
        Some(Self {
            count: n as u64,
            sum: sorted.iter().sum(),
            min: sorted[0],
            max: sorted[n - 1],
            p95: sorted[idx],
        })
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct AggregateBucket {
    pub family: AggregateFamily,
    pub bucket_start: i64,
    pub bucket_secs: i64,
    pub metrics: BTreeMap<String, Summary>,
    /// Only populated for [`AggregateFamily::Statements`].
    pub statements: Vec<StatementTotals>,
}

impl Timestamped for AggregateBucket {
    fn timestamp(&self) -> i64 {
        self.bucket_start
    }
}

fn summarize(series: BTreeMap<String, Vec<f64>>) -> BTreeMap<String, Summary> {
    series
        .into_iter()
        .filter_map(|(name, values)| Summary::from_values(&values).map(|s| (name, s)))
        .collect()
}

/// Summarizes the snapshots captured in `[bucket_start, bucket_start + bucket_secs)`.
///
/// `snapshots` is sorted and may start before the bucket; the earlier entries
/// only serve as the previous point for rates and deltas.
pub fn summarize_bucket(
    snapshots: &[Snapshot],
    bucket_start: i64,
    bucket_secs: i64,
) -> Vec<AggregateBucket> {
    let bucket_end = bucket_start + bucket_secs;
    let mut series: BTreeMap<AggregateFamily, BTreeMap<String, Vec<f64>>> = BTreeMap::new();
    let mut push = |family: AggregateFamily, values: BTreeMap<String, f64>| {
        let family_series = series.entry(family).or_default();
        for (name, value) in values {
            family_series.entry(name).or_default().push(value);
        }
    };

    let mut prev_db: Option<&Snapshot> = None;
    for snap in snapshots {
        let in_bucket = snap.captured_at >= bucket_start && snap.captured_at < bucket_end;
        if in_bucket {
            push(AggregateFamily::Database, database_metrics(snap, prev_db));
            push(AggregateFamily::Activity, activity_metrics(snap));
            push(AggregateFamily::Waits, wait_metrics(snap));
            push(AggregateFamily::Tables, table_metrics(snap));
        }
        if snap.counters().is_some() {
            prev_db = Some(snap);
        }
    }

    let mut out: Vec<AggregateBucket> = series
        .into_iter()
        .map(|(family, values)| AggregateBucket {
            family,
            bucket_start,
            bucket_secs,
            metrics: summarize(values),
            statements: Vec::new(),
        })
        .filter(|b| !b.metrics.is_empty())
        .collect();

    let statements: Vec<StatementTotals> =
        statement_totals(snapshots, bucket_start - 1, bucket_end - 1)
            .into_values()
            .filter(|t| t.calls > 0)
            .collect();
    if !statements.is_empty() {
        out.push(AggregateBucket {
            family: AggregateFamily::Statements,
            bucket_start,
            bucket_secs,
            metrics: BTreeMap::new(),
            statements,
        });
    }
    out
}

pub struct AggregateStore {
    dir: PathBuf,
    fsync: bool,
    logs: BTreeMap<AggregateFamily, SegmentLog<AggregateBucket>>,
    /// Buckets starting before this are summarized.
    watermark: Option<i64>,
}

impl AggregateStore {
    pub fn open(dir: &Path, fsync: bool) -> Result<Self, StorageError> {
        let mut logs = BTreeMap::new();
        for family in AggregateFamily::ALL {
            logs.insert(family, SegmentLog::open(dir, family.as_str(), fsync)?);
        }
        let watermark = match std::fs::read_to_string(dir.join("watermark")) {
            Ok(text) => Some(text.trim().parse::<i64>().map_err(|e| StorageError::Corrupt {
                path: dir.join("watermark").display().to_string(),
                detail: e.to_string(),
            })?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            dir: dir.to_path_buf(),
            fsync,
            logs,
            watermark,
        })
    }

    pub fn watermark(&self) -> Option<i64> {
        self.watermark
    }

    pub fn set_fsync(&mut self, fsync: bool) {
        self.fsync = fsync;
        for log in self.logs.values_mut() {
            log.set_fsync(fsync);
        }
    }

    /// Stores the summaries of one bucket and advances the watermark past it.
    pub fn commit_bucket(
        &mut self,
        bucket_end: i64,
        buckets: &[AggregateBucket],
    ) -> Result<(), StorageError> {
        for bucket in buckets {
            if let Some(log) = self.logs.get_mut(&bucket.family) {
                log.append(bucket)?;
            }
        }
        write_atomic(
            &self.dir.join("watermark"),
            bucket_end.to_string().as_bytes(),
            self.fsync,
        )?;
        self.watermark = Some(bucket_end);
        Ok(())
    }

    pub fn scan(
        &self,
        family: AggregateFamily,
        from: i64,
        to: i64,
    ) -> Result<Vec<AggregateBucket>, StorageError> {
        match self.logs.get(&family) {
            Some(log) => log.scan(from, to),
            None => Ok(Vec::new()),
        }
    }

    pub fn purge_before(
        &mut self,
        cutoff: i64,
        deadline: std::time::Instant,
    ) -> Result<PurgeOutcome, StorageError> {
        let mut total = PurgeOutcome::default();
        for log in self.logs.values_mut() {
            let outcome = log.purge_before(cutoff, deadline)?;
            total.absorb(&outcome);
            if outcome.yielded {
                break;
            }
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DataBlock, DatabaseCounters};
    use crate::source::mock::{session, statement};
    use tempfile::tempdir;

    fn snapshot(id: u64, at: i64, backends: i64, calls: i64) -> Snapshot {
        let mut snap = Snapshot::new(id, at);
        snap.blocks.push(DataBlock::Database(DatabaseCounters {
            numbackends: backends,
            xact_commit: id as i64 * 100,
            ..DatabaseCounters::default()
        }));
        snap.blocks.push(DataBlock::Activity(vec![
            session(1, "active", "app", "client backend"),
            session(2, "idle", "app", "client backend"),
        ]));
        snap.blocks.push(DataBlock::Statements(vec![statement(9, "SELECT 9", calls)]));
        snap
    }

    #[test]
    fn p95_uses_floor_index() {
        let values: Vec<f64> = (1..=20).map(|v| v as f64).collect();
        let s = Summary::from_values(&values).unwrap();
        assert_eq!(s.count, 20);
        assert_eq!(s.p95, 20.0);
        assert_eq!(s.min, 1.0);
        assert_eq!(s.sum, 210.0);
        let s = Summary::from_values(&[3.0, 1.0, 2.0]).unwrap();
        assert_eq!(s.p95, 3.0);
        assert!(Summary::from_values(&[]).is_none());
    }

    #[test]
    fn bucket_summaries_use_previous_point_for_deltas() {
        let snaps = vec![
            snapshot(1, 3500, 10, 100),
            snapshot(2, 3600, 20, 110),
            snapshot(3, 3700, 30, 130),
        ];
        let buckets = summarize_bucket(&snaps, 3600, 3600);
        let db = buckets
            .iter()
            .find(|b| b.family == AggregateFamily::Database)
            .unwrap();
        assert_eq!(db.metrics["connections"].count, 2);
        assert_eq!(db.metrics["connections"].avg(), 25.0);
        assert_eq!(db.metrics["tps"].max, 1.0);

        let stmts = buckets
            .iter()
            .find(|b| b.family == AggregateFamily::Statements)
            .unwrap();
        assert_eq!(stmts.statements[0].calls, 30);
        assert_eq!(stmts.statements[0].covered_secs, 200);
    }

    #[test]
    fn watermark_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let mut store = AggregateStore::open(dir.path(), false).unwrap();
            assert_eq!(store.watermark(), None);
            let snaps = vec![snapshot(1, 3600, 10, 1), snapshot(2, 3700, 10, 5)];
            let buckets = summarize_bucket(&snaps, 3600, 3600);
            store.commit_bucket(7200, &buckets).unwrap();
        }
        let store = AggregateStore::open(dir.path(), false).unwrap();
        assert_eq!(store.watermark(), Some(7200));
        assert_eq!(store.scan(AggregateFamily::Activity, 0, 7200).unwrap().len(), 1);
        assert_eq!(store.scan(AggregateFamily::Statements, 0, 7200).unwrap()[0].statements[0].calls, 4);
    }
}
