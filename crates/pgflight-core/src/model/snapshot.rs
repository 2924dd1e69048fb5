//! Snapshot structures shared by the ring, the archive and the analysis engine.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::samples::{
    ActivitySample, DatabaseCounters, IoSample, LockSample, ReplicationSample, SettingSample,
    StatementSample, TableSnapshot, WaitSample,
};

/// One sampled entity type. Each kind has its own ring and archive log.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SampleKind {
    Database,
    Activity,
    Waits,
    Locks,
    Statements,
    Tables,
    Io,
    Replication,
    Settings,
}

impl SampleKind {
    pub const ALL: [SampleKind; 9] = [
        SampleKind::Database,
        SampleKind::Activity,
        SampleKind::Waits,
        SampleKind::Locks,
        SampleKind::Statements,
        SampleKind::Tables,
        SampleKind::Io,
        SampleKind::Replication,
        SampleKind::Settings,
    ];

    /// Kinds collected while throttled. Statements, tables, I/O and settings
    /// are the expensive reads and are left out.
    pub const REDUCED: [SampleKind; 5] = [
        SampleKind::Database,
        SampleKind::Activity,
        SampleKind::Waits,
        SampleKind::Locks,
        SampleKind::Replication,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SampleKind::Database => "database",
            SampleKind::Activity => "activity",
            SampleKind::Waits => "waits",
            SampleKind::Locks => "locks",
            SampleKind::Statements => "statements",
            SampleKind::Tables => "tables",
            SampleKind::Io => "io",
            SampleKind::Replication => "replication",
            SampleKind::Settings => "settings",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

impl fmt::Display for SampleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A block of rows of one kind within a snapshot.
///
/// Tagged union so heterogeneous sample types share one ring/archive
/// record format while staying typed.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub enum DataBlock {
    /// Source: `pg_stat_database`, `pg_stat_bgwriter`, `pg_stat_archiver`
    Database(DatabaseCounters),
    /// Source: `pg_stat_activity`
    Activity(Vec<ActivitySample>),
    /// Source: `pg_stat_activity` grouped by wait event
    Waits(Vec<WaitSample>),
    /// Source: `pg_locks` + `pg_stat_activity`
    Locks(Vec<LockSample>),
    /// Source: `pg_stat_statements`
    Statements(Vec<StatementSample>),
    /// Source: `pg_stat_user_tables`
    Tables(Vec<TableSnapshot>),
    /// Source: `pg_stat_io`
    Io(Vec<IoSample>),
    /// Source: `pg_stat_replication`
    Replication(Vec<ReplicationSample>),
    /// Source: `pg_settings`
    Settings(Vec<SettingSample>),
}

impl DataBlock {
    pub fn kind(&self) -> SampleKind {
        match self {
            DataBlock::Database(_) => SampleKind::Database,
            DataBlock::Activity(_) => SampleKind::Activity,
            DataBlock::Waits(_) => SampleKind::Waits,
            DataBlock::Locks(_) => SampleKind::Locks,
            DataBlock::Statements(_) => SampleKind::Statements,
            DataBlock::Tables(_) => SampleKind::Tables,
            DataBlock::Io(_) => SampleKind::Io,
            DataBlock::Replication(_) => SampleKind::Replication,
            DataBlock::Settings(_) => SampleKind::Settings,
        }
    }

    /// Number of rows carried by the block.
    pub fn rows(&self) -> usize {
        match self {
            DataBlock::Database(_) => 1,
            DataBlock::Activity(v) => v.len(),
            DataBlock::Waits(v) => v.len(),
            DataBlock::Locks(v) => v.len(),
            DataBlock::Statements(v) => v.len(),
            DataBlock::Tables(v) => v.len(),
            DataBlock::Io(v) => v.len(),
            DataBlock::Replication(v) => v.len(),
            DataBlock::Settings(v) => v.len(),
        }
    }
}

/// One collection event reassembled from its blocks.
///
/// Ids and capture timestamps are strictly increasing. A throttled cycle
/// yields a snapshot with fewer blocks; a shed cycle yields none.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct Snapshot {
    pub id: u64,
    /// Seconds since Unix epoch.
    pub captured_at: i64,
    pub blocks: Vec<DataBlock>,
}

macro_rules! block_accessor {
    ($name:ident, $variant:ident, $ty:ty) => {
        pub fn $name(&self) -> &[$ty] {
            self.blocks
                .iter()
                .find_map(|b| match b {
                    DataBlock::$variant(v) => Some(v.as_slice()),
                    _ => None,
                })
                .unwrap_or(&[])
        }
    };
}

impl Snapshot {
    pub fn new(id: u64, captured_at: i64) -> Self {
        Self {
            id,
            captured_at,
            blocks: Vec::new(),
        }
    }

    pub fn counters(&self) -> Option<&DatabaseCounters> {
        self.blocks.iter().find_map(|b| match b {
            DataBlock::Database(c) => Some(c),
            _ => None,
        })
    }

    pub fn has(&self, kind: SampleKind) -> bool {
        self.blocks.iter().any(|b| b.kind() == kind)
    }

    block_accessor!(activity, Activity, ActivitySample);
    block_accessor!(waits, Waits, WaitSample);
    block_accessor!(locks, Locks, LockSample);
    block_accessor!(statements, Statements, StatementSample);
    block_accessor!(tables, Tables, TableSnapshot);
    block_accessor!(io, Io, IoSample);
    block_accessor!(replication, Replication, ReplicationSample);
    block_accessor!(settings, Settings, SettingSample);

    /// Sessions currently waiting on a lock they were not granted.
    pub fn blocked_locks(&self) -> impl Iterator<Item = &LockSample> {
        self.locks().iter().filter(|l| !l.granted)
    }
}

/// Order-independent fingerprint of a settings block, used to detect
/// configuration changes without diffing every row.
pub fn settings_fingerprint(settings: &[SettingSample]) -> u64 {
    let mut rows: Vec<String> = settings
        .iter()
        .map(|s| format!("{}={}{}", s.name, s.setting, s.unit))
        .collect();
    rows.sort();
    xxhash_rust::xxh3::xxh3_64(rows.join("\n").as_bytes())
}

/// Names of settings whose value differs between two blocks.
pub fn changed_settings(before: &[SettingSample], after: &[SettingSample]) -> Vec<String> {
    if settings_fingerprint(before) == settings_fingerprint(after) {
        return Vec::new();
    }
    let mut changed: Vec<String> = Vec::new();
    for s in after {
        match before.iter().find(|b| b.name == s.name) {
            Some(b) if b.setting == s.setting && b.unit == s.unit => {}
            _ => changed.push(s.name.clone()),
        }
    }
    for b in before {
        if !after.iter().any(|s| s.name == b.name) {
            changed.push(b.name.clone());
        }
    }
    changed.sort();
    changed.dedup();
    changed
}
