//! Ring buffers, archive, aggregates, collection stats and incidents.
//!
//! ```text
//!   scheduler ── write_block ──► RingStore ── evicted slot ──► Archive (segments)
//!                                                                  │
//!   maintenance ─────────────── aggregate ◄────────────────────────┘
//!                               retention ──► Archive / Aggregates / Stats / Incidents
//! ```
//!
//! Lock order is rings, then archive. A writer archives the evicted slot
//! while still holding the ring lock; a reader clones the ring range first
//! and scans the archive after releasing it. Any slot missing from the clone
//! was archived before the clone was taken, so reads never lose a row and
//! duplicates are removed by `(snapshot_id, kind)`.

pub mod aggregate;
pub mod archive;
pub mod incidents;
pub mod metrics;
pub mod retention;
pub mod ring;
pub mod segment;

pub use aggregate::{AggregateBucket, AggregateFamily, AggregateStore, MAX_BUCKET_SECS, Summary};
pub use archive::{Archive, ArchiveRecord};
pub use incidents::{IncidentPurge, IncidentStore};
pub use retention::{MaintenanceReport, run_maintenance};
pub use ring::{Ring, RingStats, RingStore, Slot};
pub use segment::{PurgeOutcome, SegmentLog, Timestamped};

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::Config;
use crate::model::{CollectionStat, DataBlock, SampleKind, Snapshot};

/// Error type for storage operations.
#[derive(Debug, Clone, PartialEq)]
pub enum StorageError {
    Io(String),
    Encode(String),
    Decode(String),
    Corrupt { path: String, detail: String },
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Io(msg) => write!(f, "storage io error: {}", msg),
            StorageError::Encode(msg) => write!(f, "encode error: {}", msg),
            StorageError::Decode(msg) => write!(f, "decode error: {}", msg),
            StorageError::Corrupt { path, detail } => {
                write!(f, "corrupted file {}: {}", path, detail)
            }
        }
    }
}

impl std::error::Error for StorageError {}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e.to_string())
    }
}

/// Writes `bytes` to `<path>.tmp` and renames it over `path`.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8], fsync: bool) -> Result<(), StorageError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp_path = PathBuf::from(tmp);
    let mut file = File::create(&tmp_path)?;
    file.write_all(bytes)?;
    if fsync {
        file.sync_all()?;
    }
    drop(file);
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

impl Timestamped for CollectionStat {
    fn timestamp(&self) -> i64 {
        self.started_at
    }
}

/// Groups ring/archive slots into snapshots, oldest first.
/// A `(snapshot_id, kind)` seen twice keeps its first occurrence.
pub fn assemble_snapshots(slots: impl IntoIterator<Item = Slot<DataBlock>>) -> Vec<Snapshot> {
    let mut by_id: BTreeMap<u64, Snapshot> = BTreeMap::new();
    for slot in slots {
        let snap = by_id
            .entry(slot.snapshot_id)
            .or_insert_with(|| Snapshot::new(slot.snapshot_id, slot.captured_at));
        if !snap.has(slot.payload.kind()) {
            snap.blocks.push(slot.payload);
        }
    }
    let mut snapshots: Vec<Snapshot> = by_id.into_values().collect();
    snapshots.sort_by_key(|s| (s.captured_at, s.id));
    snapshots
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct Storage {
    data_dir: PathBuf,
    rings: RwLock<RingStore>,
    archive: Mutex<Archive>,
    aggregates: Mutex<AggregateStore>,
    stats: Mutex<SegmentLog<CollectionStat>>,
    incidents: Mutex<IncidentStore>,
}

impl Storage {
    /// Opens (creating) every store under `data_dir`.
    pub fn open(data_dir: impl Into<PathBuf>, config: &Config) -> Result<Self, StorageError> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)?;
        let fsync = config.archive_fsync;
        Ok(Self {
            rings: RwLock::new(RingStore::new(config.ring_capacity)),
            archive: Mutex::new(Archive::open(&data_dir.join("archive"), fsync)?),
            aggregates: Mutex::new(AggregateStore::open(&data_dir.join("aggregates"), fsync)?),
            stats: Mutex::new(SegmentLog::open(&data_dir, "collection_stats", fsync)?),
            incidents: Mutex::new(IncidentStore::open(&data_dir.join("incidents.json"), fsync)?),
            data_dir,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn rings_read(&self) -> RwLockReadGuard<'_, RingStore> {
        self.rings.read().unwrap_or_else(|e| e.into_inner())
    }

    fn rings_write(&self) -> RwLockWriteGuard<'_, RingStore> {
        self.rings.write().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn archive(&self) -> MutexGuard<'_, Archive> {
        lock(&self.archive)
    }

    pub(crate) fn aggregates(&self) -> MutexGuard<'_, AggregateStore> {
        lock(&self.aggregates)
    }

    pub(crate) fn stats_log(&self) -> MutexGuard<'_, SegmentLog<CollectionStat>> {
        lock(&self.stats)
    }

    pub fn incidents(&self) -> MutexGuard<'_, IncidentStore> {
        lock(&self.incidents)
    }

    pub fn set_fsync(&self, fsync: bool) {
        self.archive().set_fsync(fsync);
        self.aggregates().set_fsync(fsync);
        self.stats_log().set_fsync(fsync);
        self.incidents().set_fsync(fsync);
    }

    /// Writes one block into its ring and archives the slot it replaced.
    ///
    /// The ring write itself cannot fail. An archive failure is returned but
    /// the evicted slot is parked in the archive's pending queue, not lost.
    pub fn write_block(
        &self,
        snapshot_id: u64,
        captured_at: i64,
        block: DataBlock,
    ) -> Result<(), StorageError> {
        let mut rings = self.rings_write();
        match rings.write(snapshot_id, captured_at, block) {
            Some(evicted) => self.archive().append(evicted),
            None => Ok(()),
        }
    }

    /// Up to `n` newest ring entries of one kind, newest first.
    pub fn recent(&self, kind: SampleKind, n: usize) -> Vec<Slot<DataBlock>> {
        self.rings_read().read_recent(kind, n)
    }

    /// Every raw slot captured within `[from, to]`, from rings and archive.
    pub fn slots_between(&self, from: i64, to: i64) -> Result<Vec<Slot<DataBlock>>, StorageError> {
        let mut slots = self.rings_read().collect_range(from, to);
        slots.extend(self.archive().scan(from, to)?);
        Ok(slots)
    }

    /// Raw snapshots captured within `[from, to]`, oldest first.
    pub fn snapshots_between(&self, from: i64, to: i64) -> Result<Vec<Snapshot>, StorageError> {
        Ok(assemble_snapshots(self.slots_between(from, to)?))
    }

    /// Changes ring capacity; entries that no longer fit go to the archive.
    /// Returns how many were archived.
    pub fn resize_ring(&self, capacity: usize) -> Result<usize, StorageError> {
        let mut rings = self.rings_write();
        let overflow = rings.resize(capacity);
        let count = overflow.len();
        let mut archive = self.archive();
        let mut first_error = None;
        for slot in overflow {
            if let Err(e) = archive.append(slot) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(count),
        }
    }

    /// Moves every live ring entry to the archive. Used on shutdown so the
    /// next process finds the full history on disk.
    pub fn flush_rings(&self) -> Result<usize, StorageError> {
        let mut rings = self.rings_write();
        let live = rings.drain();
        let count = live.len();
        let mut archive = self.archive();
        for slot in live {
            archive.append(slot)?;
        }
        archive.retry_pending()?;
        Ok(count)
    }

    pub fn ring_capacity(&self) -> usize {
        self.rings_read().capacity()
    }

    pub fn ring_fill(&self) -> BTreeMap<SampleKind, usize> {
        self.rings_read().fill()
    }

    pub fn ring_stats(&self) -> RingStats {
        self.rings_read().stats()
    }

    /// Highest snapshot id and its capture time, from rings or archive.
    pub fn latest_snapshot(&self) -> Result<Option<(u64, i64)>, StorageError> {
        let from_ring = SampleKind::ALL
            .into_iter()
            .flat_map(|kind| self.recent(kind, 1))
            .map(|slot| (slot.snapshot_id, slot.captured_at))
            .max();
        let from_archive = self.archive().latest()?;
        Ok(from_ring.max(from_archive))
    }

    /// Capture time of the oldest raw slot still stored.
    pub fn earliest_capture(&self) -> Result<Option<i64>, StorageError> {
        let from_ring = self
            .rings_read()
            .collect_range(i64::MIN, i64::MAX)
            .iter()
            .map(|s| s.captured_at)
            .min();
        let from_archive = self.archive().earliest()?;
        Ok(match (from_ring, from_archive) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        })
    }

    pub fn record_stat(&self, stat: &CollectionStat) -> Result<(), StorageError> {
        self.stats_log().append(stat)
    }

    pub fn stats_between(&self, from: i64, to: i64) -> Result<Vec<CollectionStat>, StorageError> {
        self.stats_log().scan(from, to)
    }

    pub fn archive_pending(&self) -> usize {
        self.archive().pending_len()
    }

    /// Aggregate buckets of one family overlapping `[from, to]`.
    pub fn aggregates_between(
        &self,
        family: AggregateFamily,
        from: i64,
        to: i64,
    ) -> Result<Vec<AggregateBucket>, StorageError> {
        let buckets = self
            .aggregates()
            .scan(family, from.saturating_sub(MAX_BUCKET_SECS), to)?;
        Ok(buckets
            .into_iter()
            .filter(|b| b.bucket_start + b.bucket_secs > from && b.bucket_start <= to)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ActivitySample, DatabaseCounters};
    use tempfile::tempdir;

    fn test_config() -> Config {
        Config {
            ring_capacity: 72,
            archive_fsync: false,
            ..Config::default()
        }
    }

    fn db(xact: i64) -> DataBlock {
        DataBlock::Database(DatabaseCounters {
            xact_commit: xact,
            ..DatabaseCounters::default()
        })
    }

    #[test]
    fn evicted_slots_land_in_archive_and_reads_see_both() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path(), &test_config()).unwrap();
        for i in 0..100u64 {
            storage.write_block(i + 1, 1_000 + i as i64 * 10, db(i as i64)).unwrap();
        }
        assert_eq!(storage.ring_fill()[&SampleKind::Database], 72);
        assert_eq!(storage.archive().scan(0, i64::MAX).unwrap().len(), 28);

        let snaps = storage.snapshots_between(1_000, 1_000 + 99 * 10).unwrap();
        assert_eq!(snaps.len(), 100);
        assert!(snaps.windows(2).all(|w| w[0].captured_at < w[1].captured_at));
        assert_eq!(storage.latest_snapshot().unwrap(), Some((100, 1_990)));
        assert_eq!(storage.earliest_capture().unwrap(), Some(1_000));
    }

    #[test]
    fn assemble_groups_blocks_and_drops_duplicates() {
        let slot = |id: u64, block: DataBlock| Slot {
            sequence: 0,
            snapshot_id: id,
            captured_at: id as i64 * 100,
            payload: block,
        };
        let snaps = assemble_snapshots(vec![
            slot(2, db(2)),
            slot(1, db(1)),
            slot(1, DataBlock::Activity(vec![ActivitySample::default()])),
            slot(1, db(1)),
        ]);
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[0].id, 1);
        assert_eq!(snaps[0].blocks.len(), 2);
    }

    #[test]
    fn flush_moves_ring_to_archive_and_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let storage = Storage::open(dir.path(), &test_config()).unwrap();
            for i in 0..5u64 {
                storage.write_block(i + 1, 1_000 + i as i64, db(i as i64)).unwrap();
            }
            assert_eq!(storage.flush_rings().unwrap(), 5);
        }
        let storage = Storage::open(dir.path(), &test_config()).unwrap();
        assert_eq!(storage.ring_fill()[&SampleKind::Database], 0);
        assert_eq!(storage.snapshots_between(0, 2_000).unwrap().len(), 5);
        assert_eq!(storage.latest_snapshot().unwrap(), Some((5, 1_004)));
    }

    #[test]
    fn resize_down_archives_overflow() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(
            dir.path(),
            &Config {
                ring_capacity: 100,
                ..test_config()
            },
        )
        .unwrap();
        for i in 0..100u64 {
            storage.write_block(i + 1, 1_000 + i as i64, db(i as i64)).unwrap();
        }
        assert_eq!(storage.resize_ring(80).unwrap(), 20);
        assert_eq!(storage.ring_capacity(), 80);
        assert_eq!(storage.snapshots_between(0, 5_000).unwrap().len(), 100);
    }
}
