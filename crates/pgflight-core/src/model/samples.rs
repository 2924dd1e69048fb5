//! Point-in-time rows read from PostgreSQL statistics views.
//!
//! Every struct here is stored unchanged in both the ring and the archive,
//! so a field added here is visible to both representations at once.

use serde::{Deserialize, Serialize};

/// Instance-wide counters for one snapshot.
///
/// Source: `pg_stat_database` summed over all databases, plus
/// `pg_stat_bgwriter`/`pg_stat_checkpointer`, `pg_stat_archiver` and
/// `pg_database` age functions.
///
/// All `*_total` style counters are cumulative since the last stats reset.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct DatabaseCounters {
    /// Source: `sum(pg_stat_database.numbackends)`
    pub numbackends: i64,
    /// Source: `current_setting('max_connections')`
    pub max_connections: i64,
    /// Source: `sum(pg_stat_database.xact_commit)`
    pub xact_commit: i64,
    /// Source: `sum(pg_stat_database.xact_rollback)`
    pub xact_rollback: i64,
    /// Source: `sum(pg_stat_database.blks_read)`
    pub blks_read: i64,
    /// Source: `sum(pg_stat_database.blks_hit)`
    pub blks_hit: i64,
    /// Source: `sum(pg_stat_database.tup_inserted + tup_updated + tup_deleted)`
    pub tup_modified: i64,
    /// Source: `sum(pg_stat_database.conflicts)`
    pub conflicts: i64,
    /// Source: `sum(pg_stat_database.deadlocks)`
    pub deadlocks: i64,
    /// Source: `sum(pg_stat_database.temp_files)`
    pub temp_files: i64,
    /// Source: `sum(pg_stat_database.temp_bytes)`
    pub temp_bytes: i64,
    /// Source: `sum(pg_database_size(datname))`
    pub db_size_bytes: i64,
    /// Oldest frozen xid age across databases.
    /// Source: `max(age(pg_database.datfrozenxid))`
    pub xid_age: i64,
    /// Source: `pg_control_checkpoint().next_oid` consumption, 0 when unavailable.
    pub next_oid: i64,
    /// Source: `pg_stat_bgwriter.checkpoints_timed` (`pg_stat_checkpointer.num_timed` on 17+)
    pub checkpoints_timed: i64,
    /// Source: `pg_stat_bgwriter.checkpoints_req` (`pg_stat_checkpointer.num_requested` on 17+)
    pub checkpoints_req: i64,
    /// Source: `pg_stat_bgwriter.buffers_checkpoint` (`pg_stat_checkpointer.buffers_written` on 17+)
    pub buffers_checkpoint: i64,
    /// Source: `pg_stat_archiver.archived_count`
    pub archived_count: i64,
    /// Source: `pg_stat_archiver.failed_count`
    pub archive_failed_count: i64,
}

/// Session row from pg_stat_activity.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct ActivitySample {
    /// Source: `pg_stat_activity.pid`
    pub pid: i32,
    pub datname: String,
    pub usename: String,
    pub application_name: String,
    /// Source: `pg_stat_activity.client_addr`, empty for local sockets.
    pub client_addr: String,
    /// client backend, autovacuum worker, walsender, ...
    pub backend_type: String,
    /// active, idle, idle in transaction, idle in transaction (aborted), ...
    pub state: String,
    pub wait_event_type: String,
    pub wait_event: String,
    /// Source: `pg_stat_activity.query_id` (PostgreSQL 14+), 0 otherwise.
    pub query_id: i64,
    /// Truncated to 256 characters.
    pub query: String,
    /// Seconds since Unix epoch, 0 when NULL.
    pub backend_start: i64,
    pub xact_start: i64,
    pub query_start: i64,
    pub state_change: i64,
}

impl ActivitySample {
    pub fn is_client_backend(&self) -> bool {
        self.backend_type == "client backend"
    }

    pub fn in_transaction_idle(&self) -> bool {
        self.state.starts_with("idle in transaction")
    }

    pub fn in_aborted_transaction(&self) -> bool {
        self.state == "idle in transaction (aborted)"
    }
}

/// Sessions grouped by wait event.
///
/// Source: `pg_stat_activity GROUP BY wait_event_type, wait_event`
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct WaitSample {
    pub wait_event_type: String,
    pub wait_event: String,
    pub count: i64,
}

/// Lock row from pg_locks joined to the holding/waiting session.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct LockSample {
    /// Source: `pg_locks.pid`
    pub pid: i32,
    /// relation, transactionid, tuple, advisory, ...
    pub locktype: String,
    /// AccessShareLock ... AccessExclusiveLock
    pub mode: String,
    pub granted: bool,
    /// Source: `pg_locks.relation`, 0 for non-relation locks.
    pub relation: i64,
    /// `schema.relname` when the relation is resolvable.
    pub relname: String,
    pub application_name: String,
    /// Source: `pg_locks.waitstart` (PostgreSQL 14+), 0 when granted or unavailable.
    pub wait_start: i64,
    /// Source: `pg_blocking_pids(pid)`
    pub blocked_by: Vec<i32>,
}

/// Cumulative per-query statistics.
///
/// Source: `pg_stat_statements` grouped by queryid.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct StatementSample {
    pub queryid: i64,
    /// Truncated normalized query text.
    pub query: String,
    pub calls: i64,
    /// Source: `total_exec_time` (13+) or `total_time` (older), milliseconds.
    pub total_time_ms: f64,
    pub rows: i64,
    pub shared_blks_hit: i64,
    pub shared_blks_read: i64,
    pub temp_blks_read: i64,
    pub temp_blks_written: i64,
}

impl StatementSample {
    /// Buffer operations: shared hits + reads + temp reads + temp writes.
    pub fn buffer_ops(&self) -> i64 {
        self.shared_blks_hit + self.shared_blks_read + self.temp_blks_read + self.temp_blks_written
    }
}

/// Per-relation statistics.
///
/// Source: `pg_stat_user_tables`
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct TableSnapshot {
    pub relid: i64,
    pub schemaname: String,
    pub relname: String,
    pub n_live_tup: i64,
    pub n_dead_tup: i64,
    pub n_mod_since_analyze: i64,
    /// Seconds since Unix epoch, 0 when never.
    pub last_vacuum: i64,
    pub last_autovacuum: i64,
    pub last_analyze: i64,
    pub last_autoanalyze: i64,
    pub vacuum_count: i64,
    pub autovacuum_count: i64,
    /// Source: `pg_relation_size(relid)`
    pub size_bytes: i64,
}

impl TableSnapshot {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schemaname, self.relname)
    }

    pub fn dead_ratio(&self) -> f64 {
        let total = self.n_live_tup + self.n_dead_tup;
        if total <= 0 {
            0.0
        } else {
            self.n_dead_tup as f64 / total as f64
        }
    }

    pub fn vacuum_events(&self) -> i64 {
        self.vacuum_count + self.autovacuum_count
    }
}

/// I/O breakdown by backend type.
///
/// Source: `pg_stat_io` summed per backend_type (PostgreSQL 16+).
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct IoSample {
    pub backend_type: String,
    pub reads: i64,
    pub writes: i64,
    pub hits: i64,
    pub evictions: i64,
    pub fsyncs: i64,
}

/// Source: `pg_stat_replication`
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct ReplicationSample {
    pub pid: i32,
    pub application_name: String,
    pub client_addr: String,
    pub state: String,
    /// `pg_wal_lsn_diff(pg_current_wal_lsn(), replay_lsn)`
    pub replay_lag_bytes: i64,
    /// Source: `replay_lag` in seconds, 0 when NULL.
    pub replay_lag_secs: f64,
}

/// Non-default server setting.
///
/// Source: `pg_settings WHERE source NOT IN ('default', 'override')`
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct SettingSample {
    pub name: String,
    pub setting: String,
    pub unit: String,
    pub pending_restart: bool,
}
