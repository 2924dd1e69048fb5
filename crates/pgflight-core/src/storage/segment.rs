//! Append-only, per-day segment files.
//!
//! File layout: `<prefix>_YYYY-MM-DD.seg`, a sequence of frames
//! `[u32 len LE][u32 crc32 LE][postcard payload]`. The day comes from the
//! record's own timestamp, so retention can drop whole files by name.
//!
//! Past-day segments may be sealed into `<prefix>_YYYY-MM-DD.seg.zst` (one
//! zstd frame over the same bytes). Scans read both forms.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, NaiveDate};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::{StorageError, write_atomic};

const FRAME_HEADER_LEN: usize = 8;
const SEALED_ZSTD_LEVEL: i32 = 3;

/// Records stored in a segment log carry their own timestamp.
pub trait Timestamped {
    fn timestamp(&self) -> i64;
}

/// UTC calendar day of a Unix timestamp.
pub fn day_of(ts: i64) -> Result<NaiveDate, StorageError> {
    DateTime::from_timestamp(ts, 0)
        .map(|d| d.date_naive())
        .ok_or_else(|| StorageError::Encode(format!("timestamp {} out of range", ts)))
}

#[derive(Debug, Clone, PartialEq)]
pub struct SegmentFile {
    pub path: PathBuf,
    pub date: NaiveDate,
    pub sealed: bool,
    pub size: u64,
}

/// Result of a purge pass over one log.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PurgeOutcome {
    pub files_removed: usize,
    /// Records dropped while compacting the boundary segment.
    pub records_removed: usize,
    pub bytes_freed: u64,
    /// The deadline passed before every segment was visited.
    pub yielded: bool,
}

impl PurgeOutcome {
    pub fn absorb(&mut self, other: &PurgeOutcome) {
        self.files_removed += other.files_removed;
        self.records_removed += other.records_removed;
        self.bytes_freed += other.bytes_freed;
        self.yielded |= other.yielded;
    }
}

pub struct SegmentLog<T> {
    dir: PathBuf,
    prefix: String,
    fsync: bool,
    /// Open handle for the day currently being appended to.
    current: Option<(NaiveDate, File)>,
    _marker: PhantomData<fn() -> T>,
}

pub(crate) fn encode_frame<T: Serialize>(record: &T) -> Result<Vec<u8>, StorageError> {
    let payload = postcard::to_allocvec(record).map_err(|e| StorageError::Encode(e.to_string()))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| StorageError::Encode("record too large".to_string()))?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decodes frames until the first invalid one.
/// Returns the records and the byte length of the valid prefix.
pub(crate) fn decode_frames<T: DeserializeOwned>(data: &[u8]) -> (Vec<T>, usize) {
    let mut records = Vec::new();
    let mut pos = 0usize;
    while data.len() - pos >= FRAME_HEADER_LEN {
        let len = u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
            as usize;
        let crc = u32::from_le_bytes([data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]]);
        let start = pos + FRAME_HEADER_LEN;
        let Some(end) = start.checked_add(len).filter(|end| *end <= data.len()) else {
            break;
        };
        let payload = &data[start..end];
        if crc32fast::hash(payload) != crc {
            break;
        }
        match postcard::from_bytes::<T>(payload) {
            Ok(record) => records.push(record),
            Err(_) => break,
        }
        pos = end;
    }
    (records, pos)
}

impl<T: Serialize + DeserializeOwned + Timestamped> SegmentLog<T> {
    /// Opens (creating) the directory, drops stale `.tmp` files and truncates
    /// any corrupted tail left by a crash mid-append.
    pub fn open(
        dir: impl Into<PathBuf>,
        prefix: &str,
        fsync: bool,
    ) -> Result<Self, StorageError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let log = Self {
            dir,
            prefix: prefix.to_string(),
            fsync,
            current: None,
            _marker: PhantomData,
        };

        for entry in std::fs::read_dir(&log.dir)?.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "tmp")
                && log.parse_name(&path).is_some()
            {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "could not remove stale temp file");
                }
            }
        }
        for segment in log.segments()? {
            if !segment.sealed {
                log.recover_tail(&segment.path)?;
            }
        }
        Ok(log)
    }

    pub fn set_fsync(&mut self, fsync: bool) {
        self.fsync = fsync;
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn recover_tail(&self, path: &Path) -> Result<(), StorageError> {
        let data = std::fs::read(path)?;
        let (records, valid_end) = decode_frames::<T>(&data);
        if valid_end < data.len() {
            warn!(
                path = %path.display(),
                garbage_bytes = data.len() - valid_end,
                valid_records = records.len(),
                "segment corruption detected, truncating"
            );
            OpenOptions::new()
                .write(true)
                .open(path)
                .and_then(|f| f.set_len(valid_end as u64))?;
        }
        Ok(())
    }

    fn segment_path(&self, date: NaiveDate, sealed: bool) -> PathBuf {
        let ext = if sealed { "seg.zst" } else { "seg" };
        self.dir
            .join(format!("{}_{}.{}", self.prefix, date.format("%Y-%m-%d"), ext))
    }

    /// Parses `<prefix>_YYYY-MM-DD.seg[.zst][.tmp]`.
    fn parse_name(&self, path: &Path) -> Option<(NaiveDate, bool)> {
        let name = path.file_name()?.to_str()?;
        let rest = name.strip_prefix(&self.prefix)?.strip_prefix('_')?;
        let rest = rest.strip_suffix(".tmp").unwrap_or(rest);
        let (date, sealed) = if let Some(d) = rest.strip_suffix(".seg.zst") {
            (d, true)
        } else {
            (rest.strip_suffix(".seg")?, false)
        };
        NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .ok()
            .map(|d| (d, sealed))
    }

    /// All segments, oldest first; a day may appear twice (sealed and open).
    pub fn segments(&self) -> Result<Vec<SegmentFile>, StorageError> {
        let mut files = Vec::new();
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "tmp") {
                continue;
            }
            if let Some((date, sealed)) = self.parse_name(&path) {
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                files.push(SegmentFile {
                    path,
                    date,
                    sealed,
                    size,
                });
            }
        }
        files.sort_by(|a, b| a.date.cmp(&b.date).then(b.sealed.cmp(&a.sealed)));
        Ok(files)
    }

    pub fn append(&mut self, record: &T) -> Result<(), StorageError> {
        let date = day_of(record.timestamp())?;
        let frame = encode_frame(record)?;

        if self.current.as_ref().map(|(d, _)| *d) != Some(date) {
            let path = self.segment_path(date, false);
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            self.current = Some((date, file));
        }
        let Some((_, file)) = self.current.as_mut() else {
            return Err(StorageError::Io("segment not open".to_string()));
        };
        if let Err(e) = file.write_all(&frame) {
            self.current = None;
            return Err(e.into());
        }
        if self.fsync {
            file.sync_data()?;
        }
        Ok(())
    }

    fn read_segment(segment: &SegmentFile) -> Result<Vec<T>, StorageError> {
        let raw = std::fs::read(&segment.path)?;
        let data = if segment.sealed {
            zstd::decode_all(&raw[..]).map_err(|e| StorageError::Decode(e.to_string()))?
        } else {
            raw
        };
        let (records, valid_end) = decode_frames::<T>(&data);
        if valid_end < data.len() {
            debug!(path = %segment.path.display(), "ignoring partial frame at segment tail");
        }
        Ok(records)
    }

    /// Records with timestamp in `[from, to]`, in file order.
    pub fn scan(&self, from: i64, to: i64) -> Result<Vec<T>, StorageError> {
        if from > to {
            return Ok(Vec::new());
        }
        let first = day_of(from)?;
        let last = day_of(to)?;
        let mut out = Vec::new();
        for segment in self.segments()? {
            if segment.date < first || segment.date > last {
                continue;
            }
            out.extend(
                Self::read_segment(&segment)?
                    .into_iter()
                    .filter(|r| r.timestamp() >= from && r.timestamp() <= to),
            );
        }
        Ok(out)
    }

    /// Timestamp of the oldest stored record.
    pub fn first_timestamp(&self) -> Result<Option<i64>, StorageError> {
        let segments = self.segments()?;
        let Some(oldest) = segments.first().map(|s| s.date) else {
            return Ok(None);
        };
        let mut first: Option<i64> = None;
        for segment in segments.iter().filter(|s| s.date == oldest) {
            for r in Self::read_segment(segment)? {
                first = Some(first.map_or(r.timestamp(), |f| f.min(r.timestamp())));
            }
        }
        Ok(first)
    }

    /// Every record in the newest segment, for restart bookkeeping.
    pub fn last_segment_records(&self) -> Result<Vec<T>, StorageError> {
        let segments = self.segments()?;
        let Some(newest) = segments.last().map(|s| s.date) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for segment in segments.iter().filter(|s| s.date == newest) {
            out.extend(Self::read_segment(segment)?);
        }
        Ok(out)
    }

    /// Deletes records older than `cutoff`.
    ///
    /// Whole segments from earlier days are removed by name; the segment of
    /// the cutoff day is rewritten keeping only newer records. Stops early
    /// (`yielded`) once `deadline` has passed.
    pub fn purge_before(
        &mut self,
        cutoff: i64,
        deadline: Instant,
    ) -> Result<PurgeOutcome, StorageError> {
        let cutoff_day = day_of(cutoff)?;
        let mut outcome = PurgeOutcome::default();

        for segment in self.segments()? {
            if segment.date > cutoff_day {
                break;
            }
            if Instant::now() >= deadline {
                outcome.yielded = true;
                break;
            }
            if self.current.as_ref().map(|(d, _)| *d) == Some(segment.date) {
                self.current = None;
            }

            if segment.date < cutoff_day {
                std::fs::remove_file(&segment.path)?;
                outcome.files_removed += 1;
                outcome.bytes_freed += segment.size;
                continue;
            }

            let records = Self::read_segment(&segment)?;
            let total = records.len();
            let kept: Vec<T> = records
                .into_iter()
                .filter(|r| r.timestamp() >= cutoff)
                .collect();
            if kept.len() == total {
                continue;
            }
            outcome.records_removed += total - kept.len();
            if kept.is_empty() {
                std::fs::remove_file(&segment.path)?;
                outcome.files_removed += 1;
                outcome.bytes_freed += segment.size;
                continue;
            }
            let mut data = Vec::new();
            for record in &kept {
                data.extend(encode_frame(record)?);
            }
            let bytes = if segment.sealed {
                zstd::encode_all(&data[..], SEALED_ZSTD_LEVEL)
                    .map_err(|e| StorageError::Encode(e.to_string()))?
            } else {
                data
            };
            write_atomic(&segment.path, &bytes, self.fsync)?;
            outcome.bytes_freed += segment.size.saturating_sub(bytes.len() as u64);
        }
        Ok(outcome)
    }

    /// Compresses every open segment from days before `today`.
    /// Returns the number of segments sealed.
    pub fn seal_before(&mut self, today: NaiveDate, deadline: Instant) -> Result<usize, StorageError> {
        let mut sealed = 0;
        for segment in self.segments()? {
            if segment.date >= today {
                break;
            }
            if segment.sealed {
                continue;
            }
            if Instant::now() >= deadline {
                break;
            }
            if self.current.as_ref().map(|(d, _)| *d) == Some(segment.date) {
                self.current = None;
            }

            let sealed_path = self.segment_path(segment.date, true);
            let mut data = if sealed_path.exists() {
                let raw = std::fs::read(&sealed_path)?;
                zstd::decode_all(&raw[..]).map_err(|e| StorageError::Decode(e.to_string()))?
            } else {
                Vec::new()
            };
            let open = std::fs::read(&segment.path)?;
            let (_, valid_end) = decode_frames::<T>(&open);
            data.extend_from_slice(&open[..valid_end]);

            let compressed = zstd::encode_all(&data[..], SEALED_ZSTD_LEVEL)
                .map_err(|e| StorageError::Encode(e.to_string()))?;
            write_atomic(&sealed_path, &compressed, self.fsync)?;
            std::fs::remove_file(&segment.path)?;
            sealed += 1;
            debug!(path = %sealed_path.display(), bytes = compressed.len(), "segment sealed");
        }
        Ok(sealed)
    }

    /// Total bytes on disk across all segments.
    pub fn total_size(&self) -> Result<u64, StorageError> {
        Ok(self.segments()?.iter().map(|s| s.size).sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::time::Duration;
    use tempfile::tempdir;

    #[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
    struct Row {
        ts: i64,
        value: u32,
    }

    impl Timestamped for Row {
        fn timestamp(&self) -> i64 {
            self.ts
        }
    }

    const DAY: i64 = 86_400;
    const T0: i64 = 1_700_000_000 - 1_700_000_000 % DAY;

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[test]
    fn append_and_scan_across_days() {
        let dir = tempdir().unwrap();
        let mut log = SegmentLog::<Row>::open(dir.path(), "rows", false).unwrap();
        for i in 0..6 {
            log.append(&Row { ts: T0 + i * DAY / 2, value: i as u32 }).unwrap();
        }
        assert_eq!(log.segments().unwrap().len(), 3);

        let all = log.scan(T0, T0 + 3 * DAY).unwrap();
        assert_eq!(all.len(), 6);
        let middle = log.scan(T0 + DAY, T0 + DAY + DAY / 2).unwrap();
        assert_eq!(middle.iter().map(|r| r.value).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn corrupted_tail_is_truncated_on_open() {
        let dir = tempdir().unwrap();
        {
            let mut log = SegmentLog::<Row>::open(dir.path(), "rows", true).unwrap();
            log.append(&Row { ts: T0, value: 1 }).unwrap();
            log.append(&Row { ts: T0 + 1, value: 2 }).unwrap();
        }
        let path = dir.path().join(format!("rows_{}.seg", day_of(T0).unwrap().format("%Y-%m-%d")));
        let valid_len = std::fs::metadata(&path).unwrap().len();
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[7, 0, 0, 0, 1, 2]).unwrap();
        drop(f);

        let mut log = SegmentLog::<Row>::open(dir.path(), "rows", true).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), valid_len);
        log.append(&Row { ts: T0 + 2, value: 3 }).unwrap();
        assert_eq!(log.scan(T0, T0 + 10).unwrap().len(), 3);
    }

    #[test]
    fn stale_temp_files_do_not_block_open() {
        let dir = tempdir().unwrap();
        let day = |ts: i64| day_of(ts).unwrap().format("%Y-%m-%d").to_string();
        let stale = dir.path().join(format!("rows_{}.seg.tmp", day(T0)));
        std::fs::write(&stale, b"partial rewrite").unwrap();
        // A directory cannot be removed as a file; open logs it and carries on.
        let stuck = dir.path().join(format!("rows_{}.seg.zst.tmp", day(T0 + DAY)));
        std::fs::create_dir(&stuck).unwrap();

        let mut log = SegmentLog::<Row>::open(dir.path(), "rows", false).unwrap();
        assert!(!stale.exists());
        assert!(stuck.exists());
        assert!(log.segments().unwrap().is_empty());
        log.append(&Row { ts: T0, value: 1 }).unwrap();
        assert_eq!(log.scan(T0, T0 + 1).unwrap().len(), 1);
    }

    #[test]
    fn purge_removes_old_days_and_compacts_boundary() {
        let dir = tempdir().unwrap();
        let mut log = SegmentLog::<Row>::open(dir.path(), "rows", false).unwrap();
        log.append(&Row { ts: T0, value: 0 }).unwrap();
        log.append(&Row { ts: T0 + DAY + 100, value: 1 }).unwrap();
        log.append(&Row { ts: T0 + DAY + 5000, value: 2 }).unwrap();
        log.append(&Row { ts: T0 + 2 * DAY, value: 3 }).unwrap();

        let outcome = log.purge_before(T0 + DAY + 1000, far_deadline()).unwrap();
        assert_eq!(outcome.files_removed, 1);
        assert_eq!(outcome.records_removed, 1);
        assert!(!outcome.yielded);

        let left: Vec<u32> = log.scan(T0, T0 + 3 * DAY).unwrap().iter().map(|r| r.value).collect();
        assert_eq!(left, vec![2, 3]);
    }

    #[test]
    fn purge_yields_when_deadline_passed() {
        let dir = tempdir().unwrap();
        let mut log = SegmentLog::<Row>::open(dir.path(), "rows", false).unwrap();
        log.append(&Row { ts: T0, value: 0 }).unwrap();
        let outcome = log.purge_before(T0 + 5 * DAY, Instant::now()).unwrap();
        assert!(outcome.yielded);
        assert_eq!(outcome.files_removed, 0);
        assert_eq!(log.scan(T0, T0).unwrap().len(), 1);
    }

    #[test]
    fn sealed_segments_remain_readable_and_accept_late_records() {
        let dir = tempdir().unwrap();
        let mut log = SegmentLog::<Row>::open(dir.path(), "rows", false).unwrap();
        log.append(&Row { ts: T0, value: 0 }).unwrap();
        log.append(&Row { ts: T0 + 10, value: 1 }).unwrap();
        log.append(&Row { ts: T0 + DAY, value: 2 }).unwrap();

        let today = day_of(T0 + DAY).unwrap();
        assert_eq!(log.seal_before(today, far_deadline()).unwrap(), 1);
        let segments = log.segments().unwrap();
        assert!(segments[0].sealed);
        assert!(!segments[1].sealed);

        log.append(&Row { ts: T0 + 20, value: 9 }).unwrap();
        assert_eq!(log.seal_before(today, far_deadline()).unwrap(), 1);
        let day0: Vec<u32> = log.scan(T0, T0 + 100).unwrap().iter().map(|r| r.value).collect();
        assert_eq!(day0, vec![0, 1, 9]);
        assert_eq!(log.scan(T0, T0 + 2 * DAY).unwrap().len(), 4);
    }
}
