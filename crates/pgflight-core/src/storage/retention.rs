//! Aggregation and retention pass.
//!
//! Runs on its own schedule, separate from collection. The whole pass shares
//! one wall-clock budget (`retention_budget_ms`); once it is spent the pass
//! stops where it is and reports `yielded`, and the next pass resumes from
//! the aggregate watermark and the remaining old segments.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::aggregate::summarize_bucket;
use super::incidents::IncidentPurge;
use super::segment::{PurgeOutcome, day_of};
use super::{Storage, StorageError};
use crate::config::Config;

const DAY_SECS: i64 = 86_400;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct MaintenanceReport {
    pub buckets_aggregated: usize,
    pub archive: PurgeOutcome,
    pub aggregates: PurgeOutcome,
    pub collection_stats: PurgeOutcome,
    pub incidents: IncidentPurge,
    pub segments_sealed: usize,
    /// The budget ran out; remaining work is left for the next pass.
    pub yielded: bool,
    pub duration_ms: u64,
}

fn cutoff(now: i64, days: u32) -> i64 {
    now - days as i64 * DAY_SECS
}

/// Summarizes every complete bucket older than `aggregate_after_secs` that
/// lies past the watermark. Returns the number of buckets committed and
/// whether the deadline cut the pass short.
pub fn aggregate_pending(
    storage: &Storage,
    config: &Config,
    now: i64,
    deadline: Instant,
) -> Result<(usize, bool), StorageError> {
    let bucket_secs = config.aggregate_bucket_secs;
    let horizon = now - config.aggregate_after_secs;
    let limit = horizon.div_euclid(bucket_secs) * bucket_secs;

    let watermark = storage.aggregates().watermark();
    let mut start = match watermark {
        Some(w) => w,
        None => match storage.earliest_capture()? {
            Some(ts) => ts.div_euclid(bucket_secs) * bucket_secs,
            None => return Ok((0, false)),
        },
    };
    // Raw rows older than raw retention are gone; skip the empty stretch.
    let oldest_raw = cutoff(now, config.retention_raw_days).div_euclid(bucket_secs) * bucket_secs;
    start = start.max(oldest_raw);

    let mut committed = 0;
    while start + bucket_secs <= limit {
        if Instant::now() >= deadline {
            return Ok((committed, true));
        }
        let end = start + bucket_secs;
        let snapshots = storage.snapshots_between(start - bucket_secs, end - 1)?;
        let buckets = summarize_bucket(&snapshots, start, bucket_secs);
        storage.aggregates().commit_bucket(end, &buckets)?;
        debug!(bucket_start = start, families = buckets.len(), "bucket aggregated");
        committed += 1;
        start = end;
    }
    Ok((committed, false))
}

/// Aggregates, purges every data class past its retention and seals
/// past-day segments.
pub fn run_maintenance(
    storage: &Storage,
    config: &Config,
    now: i64,
) -> Result<MaintenanceReport, StorageError> {
    let started = Instant::now();
    let deadline = started + Duration::from_millis(config.retention_budget_ms);
    let mut report = MaintenanceReport::default();

    let (buckets, yielded) = aggregate_pending(storage, config, now, deadline)?;
    report.buckets_aggregated = buckets;
    report.yielded = yielded;

    if !report.yielded {
        report.archive = storage
            .archive()
            .purge_before(cutoff(now, config.retention_raw_days), deadline)?;
        report.yielded = report.archive.yielded;
    }
    if !report.yielded {
        report.aggregates = storage
            .aggregates()
            .purge_before(cutoff(now, config.retention_aggregate_days), deadline)?;
        report.yielded = report.aggregates.yielded;
    }
    if !report.yielded {
        report.collection_stats = storage
            .stats_log()
            .purge_before(cutoff(now, config.retention_collection_stats_days), deadline)?;
        report.yielded = report.collection_stats.yielded;
    }
    if !report.yielded {
        let mut incidents = storage.incidents();
        report.incidents = incidents.purge(
            cutoff(now, config.retention_storm_days),
            cutoff(now, config.retention_regression_days),
            cutoff(now, config.retention_anomaly_days),
        );
        if report.incidents != IncidentPurge::default() {
            incidents.save()?;
        }
    }
    if !report.yielded {
        let today = day_of(now)?;
        report.segments_sealed = storage.archive().seal_before(today, deadline)?;
        report.segments_sealed += storage.stats_log().seal_before(today, deadline)?;
        report.yielded = Instant::now() >= deadline;
    }

    report.duration_ms = started.elapsed().as_millis() as u64;
    if report.yielded {
        warn!(
            budget_ms = config.retention_budget_ms,
            buckets = report.buckets_aggregated,
            "maintenance budget exhausted, yielding until next pass"
        );
    } else {
        info!(
            buckets = report.buckets_aggregated,
            archive_files_removed = report.archive.files_removed,
            archive_rows_removed = report.archive.records_removed,
            bytes_freed = report.archive.bytes_freed
                + report.aggregates.bytes_freed
                + report.collection_stats.bytes_freed,
            sealed = report.segments_sealed,
            duration_ms = report.duration_ms,
            "maintenance pass complete"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DataBlock, DatabaseCounters, SampleKind};
    use crate::storage::AggregateFamily;
    use crate::storage::ring::Slot;
    use tempfile::tempdir;

    const NOW: i64 = 1_700_000_000 - 1_700_000_000 % DAY_SECS + 12 * 3600;

    fn config() -> Config {
        Config {
            archive_fsync: false,
            ring_capacity: 72,
            ..Config::default()
        }
    }

    fn archived(id: u64, at: i64) -> Slot<DataBlock> {
        Slot {
            sequence: id,
            snapshot_id: id,
            captured_at: at,
            payload: DataBlock::Database(DatabaseCounters {
                numbackends: 4,
                xact_commit: id as i64 * 10,
                ..DatabaseCounters::default()
            }),
        }
    }

    #[test]
    fn raw_rows_past_retention_are_removed() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path(), &config()).unwrap();
        {
            let mut archive = storage.archive();
            archive.append(archived(1, NOW - 10 * DAY_SECS)).unwrap();
            archive.append(archived(2, NOW - 10 * DAY_SECS + 60)).unwrap();
            archive.append(archived(3, NOW - DAY_SECS)).unwrap();
        }
        let report = run_maintenance(&storage, &config(), NOW).unwrap();
        assert!(!report.yielded);
        assert_eq!(report.archive.files_removed, 1);

        let left = storage.archive().scan_kind(SampleKind::Database, 0, NOW).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].snapshot_id, 3);
    }

    #[test]
    fn aggregation_advances_watermark_once() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path(), &config()).unwrap();
        {
            let mut archive = storage.archive();
            for i in 0..40u64 {
                archive.append(archived(i + 1, NOW - 4 * 3600 + i as i64 * 300)).unwrap();
            }
        }
        let deadline = Instant::now() + Duration::from_secs(60);
        let (first, yielded) = aggregate_pending(&storage, &config(), NOW, deadline).unwrap();
        assert!(!yielded);
        assert_eq!(first, 3);
        assert_eq!(storage.aggregates().watermark(), Some(NOW - 3600));
        let (second, _) = aggregate_pending(&storage, &config(), NOW, deadline).unwrap();
        assert_eq!(second, 0);

        let buckets = storage
            .aggregates_between(AggregateFamily::Database, NOW - 4 * 3600, NOW)
            .unwrap();
        assert_eq!(buckets.len(), 3);
        assert_eq!(buckets[0].metrics["connections"].count, 12);
    }

    #[test]
    fn exhausted_budget_yields() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path(), &config()).unwrap();
        storage
            .archive()
            .append(archived(1, NOW - 10 * DAY_SECS))
            .unwrap();
        let config = Config {
            retention_budget_ms: 0,
            ..config()
        };
        let report = run_maintenance(&storage, &config, NOW).unwrap();
        assert!(report.yielded);
        assert_eq!(storage.archive().scan(0, NOW).unwrap().len(), 1);
    }
}
