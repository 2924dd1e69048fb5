//! SQL builders for the statistics views read each cycle.
//!
//! Every nullable column is wrapped in COALESCE so row decoding never has
//! to handle NULL.

pub(super) fn build_load_signals_query() -> &'static str {
    r#"
        SELECT
            (SELECT count(*) FROM pg_stat_activity
              WHERE state IS DISTINCT FROM 'idle'
                AND backend_type = 'client backend')::bigint AS active_connections,
            current_setting('max_connections')::bigint AS max_connections,
            (SELECT COALESCE(sum(xact_commit + xact_rollback), 0)
               FROM pg_stat_database)::bigint AS xact_total,
            (SELECT COALESCE(sum(blks_read), 0)
               FROM pg_stat_database)::bigint AS blocks_read_total
    "#
}

/// Builds version-aware query for instance-wide counters.
///
/// PG < 17: checkpoint counters come from pg_stat_bgwriter.
/// PG 17+:  checkpoint counters moved to pg_stat_checkpointer.
pub(super) fn build_database_counters_query(server_version_num: Option<i32>) -> String {
    let checkpoint_source = if server_version_num.unwrap_or(0) >= 170000 {
        r#"(SELECT num_timed::bigint AS checkpoints_timed,
                   num_requested::bigint AS checkpoints_req,
                   buffers_written::bigint AS buffers_checkpoint
              FROM pg_stat_checkpointer) c"#
    } else {
        r#"(SELECT checkpoints_timed::bigint AS checkpoints_timed,
                   checkpoints_req::bigint AS checkpoints_req,
                   buffers_checkpoint::bigint AS buffers_checkpoint
              FROM pg_stat_bgwriter) c"#
    };

    format!(
        r#"
            SELECT
                d.numbackends,
                current_setting('max_connections')::bigint AS max_connections,
                d.xact_commit,
                d.xact_rollback,
                d.blks_read,
                d.blks_hit,
                d.tup_modified,
                d.conflicts,
                d.deadlocks,
                d.temp_files,
                d.temp_bytes,
                (SELECT COALESCE(sum(pg_database_size(oid)), 0)
                   FROM pg_database WHERE datallowconn)::bigint AS db_size_bytes,
                (SELECT COALESCE(max(age(datfrozenxid)), 0)
                   FROM pg_database)::bigint AS xid_age,
                CASE WHEN has_function_privilege('pg_control_checkpoint()', 'EXECUTE')
                     THEN (SELECT next_oid::bigint FROM pg_control_checkpoint())
                     ELSE 0 END::bigint AS next_oid,
                COALESCE(c.checkpoints_timed, 0)::bigint AS checkpoints_timed,
                COALESCE(c.checkpoints_req, 0)::bigint AS checkpoints_req,
                COALESCE(c.buffers_checkpoint, 0)::bigint AS buffers_checkpoint,
                COALESCE(a.archived_count, 0)::bigint AS archived_count,
                COALESCE(a.failed_count, 0)::bigint AS archive_failed_count
            FROM (
                SELECT
                    COALESCE(sum(numbackends), 0)::bigint AS numbackends,
                    COALESCE(sum(xact_commit), 0)::bigint AS xact_commit,
                    COALESCE(sum(xact_rollback), 0)::bigint AS xact_rollback,
                    COALESCE(sum(blks_read), 0)::bigint AS blks_read,
                    COALESCE(sum(blks_hit), 0)::bigint AS blks_hit,
                    COALESCE(sum(tup_inserted + tup_updated + tup_deleted), 0)::bigint AS tup_modified,
                    COALESCE(sum(conflicts), 0)::bigint AS conflicts,
                    COALESCE(sum(deadlocks), 0)::bigint AS deadlocks,
                    COALESCE(sum(temp_files), 0)::bigint AS temp_files,
                    COALESCE(sum(temp_bytes), 0)::bigint AS temp_bytes
                FROM pg_stat_database
            ) d,
            {checkpoint_source},
            pg_stat_archiver a
        "#
    )
}

/// Builds version-aware query for pg_stat_activity.
pub(super) fn build_activity_query(server_version_num: Option<i32>) -> String {
    let query_id_expr = if server_version_num.unwrap_or(0) >= 140000 {
        "COALESCE(query_id, 0)::bigint as query_id"
    } else {
        "0::bigint as query_id"
    };

    format!(
        r#"
            SELECT
                pid,
                COALESCE(datname, '') as datname,
                COALESCE(usename, '') as usename,
                COALESCE(application_name, '') as application_name,
                COALESCE(client_addr::text, '') as client_addr,
                COALESCE(backend_type, '') as backend_type,
                COALESCE(state, '') as state,
                COALESCE(wait_event_type, '') as wait_event_type,
                COALESCE(wait_event, '') as wait_event,
                {query_id_expr},
                left(COALESCE(query, ''), 256) as query,
                COALESCE(EXTRACT(EPOCH FROM backend_start)::bigint, 0) as backend_start,
                COALESCE(EXTRACT(EPOCH FROM xact_start)::bigint, 0) as xact_start,
                COALESCE(EXTRACT(EPOCH FROM query_start)::bigint, 0) as query_start,
                COALESCE(EXTRACT(EPOCH FROM state_change)::bigint, 0) as state_change
            FROM pg_stat_activity
            WHERE pid <> pg_backend_pid()
        "#
    )
}

pub(super) fn build_wait_events_query() -> &'static str {
    r#"
        SELECT
            COALESCE(wait_event_type, '') as wait_event_type,
            COALESCE(wait_event, '') as wait_event,
            count(*)::bigint as count
        FROM pg_stat_activity
        WHERE wait_event IS NOT NULL
          AND pid <> pg_backend_pid()
        GROUP BY 1, 2
        ORDER BY 3 DESC
    "#
}

/// Builds version-aware query for waiting locks and the locks their blockers hold.
///
/// `pg_locks.waitstart` exists since PG 14.
pub(super) fn build_locks_query(server_version_num: Option<i32>) -> String {
    let wait_start_expr = if server_version_num.unwrap_or(0) >= 140000 {
        "COALESCE(EXTRACT(EPOCH FROM l.waitstart)::bigint, 0) as wait_start"
    } else {
        "0::bigint as wait_start"
    };

    format!(
        r#"
            WITH waiting AS (
                SELECT pid FROM pg_locks WHERE NOT granted
            ),
            blockers AS (
                SELECT DISTINCT unnest(pg_blocking_pids(pid)) AS pid FROM waiting
            )
            SELECT
                l.pid,
                COALESCE(l.locktype, '') as locktype,
                COALESCE(l.mode, '') as mode,
                l.granted,
                COALESCE(l.relation::bigint, 0) as relation,
                COALESCE(n.nspname || '.' || c.relname, '') as relname,
                COALESCE(a.application_name, '') as application_name,
                {wait_start_expr},
                pg_blocking_pids(l.pid) as blocked_by
            FROM pg_locks l
            LEFT JOIN pg_stat_activity a ON a.pid = l.pid
            LEFT JOIN pg_class c ON c.oid = l.relation
            LEFT JOIN pg_namespace n ON n.oid = c.relnamespace
            WHERE l.pid IS NOT NULL
              AND l.pid <> pg_backend_pid()
              AND (NOT l.granted OR l.pid IN (SELECT pid FROM blockers))
            LIMIT 1000
        "#
    )
}

/// Builds version-aware query for pg_stat_statements.
///
/// PG 13+ renamed total_time to total_exec_time.
pub(super) fn build_statements_query(server_version_num: Option<i32>) -> String {
    let total_time_expr = if server_version_num.unwrap_or(0) >= 130000 {
        "s.total_exec_time"
    } else {
        "s.total_time"
    };

    format!(
        r#"
            SELECT
                s.queryid::bigint as queryid,
                left(min(s.query), 256) as query,
                sum(s.calls)::bigint as calls,
                sum({total_time_expr})::double precision as total_time_ms,
                sum(s.rows)::bigint as rows,
                sum(s.shared_blks_hit)::bigint as shared_blks_hit,
                sum(s.shared_blks_read)::bigint as shared_blks_read,
                sum(s.temp_blks_read)::bigint as temp_blks_read,
                sum(s.temp_blks_written)::bigint as temp_blks_written
            FROM pg_stat_statements s
            WHERE s.queryid IS NOT NULL
            GROUP BY s.queryid
            ORDER BY sum(s.calls) DESC
            LIMIT 500
        "#
    )
}

pub(super) fn build_statements_available_query() -> &'static str {
    "SELECT count(*)::bigint FROM pg_extension WHERE extname = 'pg_stat_statements'"
}

pub(super) fn build_tables_query() -> &'static str {
    r#"
        SELECT
            relid::bigint as relid,
            COALESCE(schemaname, '') as schemaname,
            COALESCE(relname, '') as relname,
            COALESCE(n_live_tup, 0)::bigint as n_live_tup,
            COALESCE(n_dead_tup, 0)::bigint as n_dead_tup,
            COALESCE(n_mod_since_analyze, 0)::bigint as n_mod_since_analyze,
            COALESCE(EXTRACT(EPOCH FROM last_vacuum)::bigint, 0) as last_vacuum,
            COALESCE(EXTRACT(EPOCH FROM last_autovacuum)::bigint, 0) as last_autovacuum,
            COALESCE(EXTRACT(EPOCH FROM last_analyze)::bigint, 0) as last_analyze,
            COALESCE(EXTRACT(EPOCH FROM last_autoanalyze)::bigint, 0) as last_autoanalyze,
            COALESCE(vacuum_count, 0)::bigint as vacuum_count,
            COALESCE(autovacuum_count, 0)::bigint as autovacuum_count,
            COALESCE(pg_relation_size(relid), 0)::bigint as size_bytes
        FROM pg_stat_user_tables
        ORDER BY COALESCE(n_dead_tup, 0) DESC
        LIMIT 500
    "#
}

/// pg_stat_io exists since PG 16. Returns `None` on older servers.
pub(super) fn build_io_query(server_version_num: Option<i32>) -> Option<&'static str> {
    if server_version_num.unwrap_or(0) < 160000 {
        return None;
    }
    Some(
        r#"
            SELECT
                backend_type,
                COALESCE(sum(reads), 0)::bigint as reads,
                COALESCE(sum(writes), 0)::bigint as writes,
                COALESCE(sum(hits), 0)::bigint as hits,
                COALESCE(sum(evictions), 0)::bigint as evictions,
                COALESCE(sum(fsyncs), 0)::bigint as fsyncs
            FROM pg_stat_io
            GROUP BY backend_type
        "#,
    )
}

pub(super) fn build_replication_query() -> &'static str {
    r#"
        SELECT
            pid,
            COALESCE(application_name, '') as application_name,
            COALESCE(client_addr::text, '') as client_addr,
            COALESCE(state, '') as state,
            CASE WHEN pg_is_in_recovery() THEN 0
                 ELSE COALESCE(pg_wal_lsn_diff(pg_current_wal_lsn(), replay_lsn), 0)
            END::bigint as replay_lag_bytes,
            COALESCE(EXTRACT(EPOCH FROM replay_lag), 0)::double precision as replay_lag_secs
        FROM pg_stat_replication
    "#
}

pub(super) fn build_settings_query() -> &'static str {
    r#"
        SELECT
            name,
            COALESCE(setting, '') as setting,
            COALESCE(unit, '') as unit,
            pending_restart
        FROM pg_settings
        WHERE source NOT IN ('default', 'override')
        ORDER BY name
    "#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_counters_query_pg16_reads_bgwriter() {
        let q = build_database_counters_query(Some(160000));
        assert!(q.contains("FROM pg_stat_bgwriter"));
        assert!(!q.contains("pg_stat_checkpointer"));
        assert!(q.contains("pg_stat_archiver"));
    }

    #[test]
    fn database_counters_query_pg17_reads_checkpointer() {
        let q = build_database_counters_query(Some(170000));
        assert!(q.contains("pg_stat_checkpointer"));
        assert!(q.contains("num_requested"));
        assert!(!q.contains("FROM pg_stat_bgwriter"));
    }

    #[test]
    fn activity_query_includes_query_id_on_pg14_plus() {
        let q = build_activity_query(Some(140000));
        assert!(q.contains("COALESCE(query_id, 0)::bigint as query_id"));
        let q = build_activity_query(Some(130000));
        assert!(q.contains("0::bigint as query_id"));
        assert!(!q.contains("COALESCE(query_id"));
    }

    #[test]
    fn locks_query_uses_waitstart_on_pg14_plus() {
        assert!(build_locks_query(Some(150000)).contains("l.waitstart"));
        assert!(!build_locks_query(Some(130000)).contains("waitstart"));
        assert!(build_locks_query(None).contains("pg_blocking_pids"));
    }

    #[test]
    fn statements_query_uses_exec_time_on_pg13_plus() {
        assert!(build_statements_query(Some(130000)).contains("s.total_exec_time"));
        let legacy = build_statements_query(Some(120000));
        assert!(legacy.contains("s.total_time"));
        assert!(!legacy.contains("total_exec_time"));
    }

    #[test]
    fn io_query_requires_pg16() {
        assert!(build_io_query(Some(150000)).is_none());
        assert!(build_io_query(None).is_none());
        assert!(build_io_query(Some(160000)).unwrap().contains("pg_stat_io"));
    }

    #[test]
    fn replication_query_guards_standby() {
        assert!(build_replication_query().contains("pg_is_in_recovery()"));
    }
}
