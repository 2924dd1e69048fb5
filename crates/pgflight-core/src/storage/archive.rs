//! Durable copy of everything evicted from the rings.
//!
//! One segment log per sample kind under `<data>/archive/`. Records are the
//! ring [`Slot`]s themselves, so ring and archive rows are the same structure.
//! A failed append parks the slot in a bounded pending queue that is retried
//! before the next append.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::time::Instant;

use chrono::NaiveDate;
use tracing::{info, warn};

use super::StorageError;
use super::ring::Slot;
use super::segment::{PurgeOutcome, SegmentLog, Timestamped};
use crate::model::{DataBlock, SampleKind};

pub type ArchiveRecord = Slot<DataBlock>;

/// Slots kept in memory while the archive cannot be written.
pub const PENDING_LIMIT: usize = 2880;

impl<T> Timestamped for Slot<T> {
    fn timestamp(&self) -> i64 {
        self.captured_at
    }
}

pub struct Archive {
    logs: BTreeMap<SampleKind, SegmentLog<ArchiveRecord>>,
    pending: VecDeque<ArchiveRecord>,
    pending_limit: usize,
    /// Slots lost because the pending queue overflowed.
    dropped: u64,
}

impl Archive {
    pub fn open(dir: &Path, fsync: bool) -> Result<Self, StorageError> {
        let mut logs = BTreeMap::new();
        for kind in SampleKind::ALL {
            logs.insert(kind, SegmentLog::open(dir, kind.as_str(), fsync)?);
        }
        Ok(Self {
            logs,
            pending: VecDeque::new(),
            pending_limit: PENDING_LIMIT,
            dropped: 0,
        })
    }

    pub fn set_fsync(&mut self, fsync: bool) {
        for log in self.logs.values_mut() {
            log.set_fsync(fsync);
        }
    }

    #[cfg(test)]
    pub(crate) fn set_pending_limit(&mut self, limit: usize) {
        self.pending_limit = limit.max(1);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn write_one(&mut self, record: &ArchiveRecord) -> Result<(), StorageError> {
        let kind = record.payload.kind();
        match self.logs.get_mut(&kind) {
            Some(log) => log.append(record),
            None => Err(StorageError::Io(format!("no archive log for {}", kind))),
        }
    }

    fn park(&mut self, record: ArchiveRecord) {
        if self.pending.len() >= self.pending_limit {
            self.pending.pop_front();
            self.dropped += 1;
            warn!(
                dropped_total = self.dropped,
                limit = self.pending_limit,
                "archive pending queue full, dropping oldest slot"
            );
        }
        self.pending.push_back(record);
    }

    /// Writes parked slots, oldest first. Stops at the first failure.
    pub fn retry_pending(&mut self) -> Result<usize, StorageError> {
        let mut written = 0;
        while let Some(record) = self.pending.pop_front() {
            if let Err(e) = self.write_one(&record) {
                self.pending.push_front(record);
                return Err(e);
            }
            written += 1;
        }
        if written > 0 {
            info!(written, "archive pending queue flushed");
        }
        Ok(written)
    }

    /// Appends one evicted slot. On failure the slot is parked, not lost.
    pub fn append(&mut self, record: ArchiveRecord) -> Result<(), StorageError> {
        if !self.pending.is_empty()
            && let Err(e) = self.retry_pending()
        {
            self.park(record);
            return Err(e);
        }
        if let Err(e) = self.write_one(&record) {
            self.park(record);
            return Err(e);
        }
        Ok(())
    }

    /// Archived and pending slots of every kind captured within `[from, to]`.
    pub fn scan(&self, from: i64, to: i64) -> Result<Vec<ArchiveRecord>, StorageError> {
        let mut out = Vec::new();
        for log in self.logs.values() {
            out.extend(log.scan(from, to)?);
        }
        out.extend(
            self.pending
                .iter()
                .filter(|r| r.captured_at >= from && r.captured_at <= to)
                .cloned(),
        );
        Ok(out)
    }

    pub fn scan_kind(
        &self,
        kind: SampleKind,
        from: i64,
        to: i64,
    ) -> Result<Vec<ArchiveRecord>, StorageError> {
        let mut out = match self.logs.get(&kind) {
            Some(log) => log.scan(from, to)?,
            None => Vec::new(),
        };
        out.extend(
            self.pending
                .iter()
                .filter(|r| r.payload.kind() == kind && r.captured_at >= from && r.captured_at <= to)
                .cloned(),
        );
        Ok(out)
    }

    /// Highest snapshot id and capture time ever archived.
    pub fn latest(&self) -> Result<Option<(u64, i64)>, StorageError> {
        let mut latest: Option<(u64, i64)> = None;
        let mut consider = |r: &ArchiveRecord| {
            if latest.is_none_or(|(id, _)| r.snapshot_id > id) {
                latest = Some((r.snapshot_id, r.captured_at));
            }
        };
        for log in self.logs.values() {
            for r in log.last_segment_records()? {
                consider(&r);
            }
        }
        for r in &self.pending {
            consider(r);
        }
        Ok(latest)
    }

    /// Capture time of the oldest archived or pending slot.
    pub fn earliest(&self) -> Result<Option<i64>, StorageError> {
        let mut earliest = self.pending.iter().map(|r| r.captured_at).min();
        for log in self.logs.values() {
            if let Some(ts) = log.first_timestamp()? {
                earliest = Some(earliest.map_or(ts, |e| e.min(ts)));
            }
        }
        Ok(earliest)
    }

    pub fn purge_before(
        &mut self,
        cutoff: i64,
        deadline: Instant,
    ) -> Result<PurgeOutcome, StorageError> {
        let mut total = PurgeOutcome::default();
        for log in self.logs.values_mut() {
            let outcome = log.purge_before(cutoff, deadline)?;
            total.absorb(&outcome);
            if outcome.yielded {
                break;
            }
        }
        let before = self.pending.len();
        self.pending.retain(|r| r.captured_at >= cutoff);
        total.records_removed += before - self.pending.len();
        Ok(total)
    }

    pub fn seal_before(&mut self, today: NaiveDate, deadline: Instant) -> Result<usize, StorageError> {
        let mut sealed = 0;
        for log in self.logs.values_mut() {
            sealed += log.seal_before(today, deadline)?;
        }
        Ok(sealed)
    }

    pub fn size_bytes(&self) -> Result<u64, StorageError> {
        let mut total = 0;
        for log in self.logs.values() {
            total += log.total_size()?;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DatabaseCounters;
    use tempfile::tempdir;

    const T0: i64 = 1_700_000_000;

    fn db_slot(sequence: u64, captured_at: i64) -> ArchiveRecord {
        Slot {
            sequence,
            snapshot_id: sequence + 1,
            captured_at,
            payload: DataBlock::Database(DatabaseCounters {
                xact_commit: sequence as i64,
                ..DatabaseCounters::default()
            }),
        }
    }

    #[test]
    fn append_scan_and_latest() {
        let dir = tempdir().unwrap();
        let mut archive = Archive::open(dir.path(), false).unwrap();
        archive.append(db_slot(0, T0)).unwrap();
        archive.append(db_slot(1, T0 + 180)).unwrap();
        archive
            .append(Slot {
                sequence: 0,
                snapshot_id: 2,
                captured_at: T0 + 180,
                payload: DataBlock::Locks(Vec::new()),
            })
            .unwrap();

        assert_eq!(archive.scan(T0, T0 + 180).unwrap().len(), 3);
        assert_eq!(archive.scan_kind(SampleKind::Locks, T0, T0 + 180).unwrap().len(), 1);
        assert_eq!(archive.latest().unwrap(), Some((2, T0 + 180)));
    }

    #[test]
    fn failed_append_is_parked_and_retried() {
        let dir = tempdir().unwrap();
        let archive_dir = dir.path().join("archive");
        let mut archive = Archive::open(&archive_dir, false).unwrap();
        archive.set_pending_limit(2);

        std::fs::remove_dir_all(&archive_dir).unwrap();
        assert!(archive.append(db_slot(0, T0)).is_err());
        assert!(archive.append(db_slot(1, T0 + 1)).is_err());
        assert!(archive.append(db_slot(2, T0 + 2)).is_err());
        assert_eq!(archive.pending_len(), 2);
        assert_eq!(archive.dropped(), 1);
        // Pending slots are still visible to readers.
        assert_eq!(archive.scan(T0, T0 + 10).unwrap().len(), 2);

        std::fs::create_dir_all(&archive_dir).unwrap();
        archive.append(db_slot(3, T0 + 3)).unwrap();
        assert_eq!(archive.pending_len(), 0);
        let ids: Vec<u64> = archive
            .scan_kind(SampleKind::Database, T0, T0 + 10)
            .unwrap()
            .iter()
            .map(|r| r.sequence)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
