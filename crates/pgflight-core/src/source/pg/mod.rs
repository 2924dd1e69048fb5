//! PostgreSQL implementation of [`StatSource`].
//!
//! Connection parameters come from the standard libpq environment variables.
//! Each cycle first bounds every query with `lock_timeout` and
//! `statement_timeout`. In snapshot mode the whole cycle runs inside one
//! `REPEATABLE READ READ ONLY` transaction, and each sub-collection gets its
//! own savepoint so one failed read does not abort the rest.

mod queries;

use postgres::error::SqlState;
use postgres::{Client, NoTls, Row};
use tracing::{debug, warn};

use super::{LoadSignals, QueryBounds, SourceError, StatSource};
use crate::model::{
    ActivitySample, DatabaseCounters, IoSample, LockSample, ReplicationSample, SettingSample,
    StatementSample, TableSnapshot, WaitSample,
};
use queries::*;

const SUB_COLLECTION_SAVEPOINT: &str = "pgflight_sub";

pub struct PgStatSource {
    connection_string: String,
    client: Option<Client>,
    server_version_num: Option<i32>,
    /// Cached per connection; `None` until first checked.
    statements_available: Option<bool>,
    in_transaction: bool,
    last_error: Option<String>,
}

impl PgStatSource {
    /// Builds the connection from PGHOST, PGPORT, PGUSER, PGPASSWORD and PGDATABASE.
    ///
    /// Uses $USER when PGUSER is not set.
    pub fn from_env() -> Result<Self, SourceError> {
        let user = std::env::var("PGUSER")
            .or_else(|_| std::env::var("USER"))
            .map_err(|_| SourceError::Connection("PGUSER or USER not set".to_string()))?;

        let host = std::env::var("PGHOST").unwrap_or_else(|_| "localhost".to_string());
        let port = std::env::var("PGPORT").unwrap_or_else(|_| "5432".to_string());
        let password = std::env::var("PGPASSWORD").unwrap_or_default();
        let database = std::env::var("PGDATABASE").unwrap_or_else(|_| user.clone());

        let mut connection_string = format!(
            "host={} port={} user={} dbname={} application_name=pgflight",
            host, port, user, database
        );
        if !password.is_empty() {
            connection_string.push_str(&format!(" password={}", password));
        }
        Ok(Self::with_connection_string(connection_string))
    }

    pub fn with_connection_string(connection_string: String) -> Self {
        Self {
            connection_string,
            client: None,
            server_version_num: None,
            statements_available: None,
            in_transaction: false,
            last_error: None,
        }
    }

    /// Attempts to connect. Useful for startup checks.
    pub fn try_connect(&mut self) -> Result<(), SourceError> {
        self.ensure_connected()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn server_version_num(&self) -> Option<i32> {
        self.server_version_num
    }

    fn ensure_connected(&mut self) -> Result<(), SourceError> {
        if self.client.is_some() {
            return Ok(());
        }

        match Client::connect(&self.connection_string, NoTls) {
            Ok(mut client) => {
                self.server_version_num = client
                    .query_one("SHOW server_version_num", &[])
                    .ok()
                    .and_then(|row| row.try_get::<_, String>(0).ok())
                    .and_then(|v| v.parse::<i32>().ok());
                self.statements_available = None;
                self.in_transaction = false;
                self.client = Some(client);
                self.last_error = None;
                debug!(server_version_num = ?self.server_version_num, "connected");
                Ok(())
            }
            Err(e) => {
                let msg = format_postgres_error(&e);
                self.last_error = Some(msg.clone());
                self.server_version_num = None;
                Err(SourceError::Connection(msg))
            }
        }
    }

    fn disconnect(&mut self) {
        self.client = None;
        self.in_transaction = false;
        self.server_version_num = None;
        self.statements_available = None;
    }

    /// Runs one catalog query. Inside a cycle transaction the query is
    /// wrapped in a savepoint and rolled back to it on error.
    fn query_rows(&mut self, sql: &str) -> Result<Vec<Row>, SourceError> {
        self.ensure_connected()?;
        let in_transaction = self.in_transaction;
        let Some(client) = self.client.as_mut() else {
            return Err(SourceError::Connection("not connected".to_string()));
        };

        if in_transaction
            && let Err(e) = client.batch_execute(&format!("SAVEPOINT {SUB_COLLECTION_SAVEPOINT}"))
        {
            let err = classify_error(&e);
            self.last_error = Some(err.to_string());
            self.disconnect();
            return Err(err);
        }

        let result = client.query(sql, &[]);
        let mut lost_connection = false;
        let outcome = match result {
            Ok(rows) => {
                if in_transaction {
                    let _ = client
                        .batch_execute(&format!("RELEASE SAVEPOINT {SUB_COLLECTION_SAVEPOINT}"));
                }
                Ok(rows)
            }
            Err(e) => {
                let err = classify_error(&e);
                if e.is_closed() {
                    lost_connection = true;
                } else if in_transaction
                    && client
                        .batch_execute(&format!(
                            "ROLLBACK TO SAVEPOINT {SUB_COLLECTION_SAVEPOINT}"
                        ))
                        .is_err()
                {
                    lost_connection = true;
                }
                Err(err)
            }
        };

        match &outcome {
            Ok(_) => self.last_error = None,
            Err(e) => self.last_error = Some(e.to_string()),
        }
        if lost_connection {
            self.disconnect();
        }
        outcome
    }

    fn check_statements_available(&mut self) -> Result<bool, SourceError> {
        if let Some(available) = self.statements_available {
            return Ok(available);
        }
        let rows = self.query_rows(build_statements_available_query())?;
        let available = rows
            .first()
            .map(|row| row.get::<_, i64>(0) > 0)
            .unwrap_or(false);
        self.statements_available = Some(available);
        Ok(available)
    }
}

impl StatSource for PgStatSource {
    fn load_signals(&mut self) -> Result<LoadSignals, SourceError> {
        let rows = self.query_rows(build_load_signals_query())?;
        let row = rows
            .first()
            .ok_or_else(|| SourceError::Query("load probe returned no rows".to_string()))?;
        Ok(LoadSignals {
            active_connections: row.get("active_connections"),
            max_connections: row.get("max_connections"),
            xact_total: row.get("xact_total"),
            blocks_read_total: row.get("blocks_read_total"),
        })
    }

    fn begin_cycle(&mut self, bounds: &QueryBounds) -> Result<(), SourceError> {
        self.ensure_connected()?;
        let lock_ms = bounds.lock_timeout.as_millis();
        let statement_ms = bounds.statement_timeout.as_millis();
        let sql = if bounds.snapshot_mode {
            format!(
                "BEGIN ISOLATION LEVEL REPEATABLE READ READ ONLY; \
                 SET LOCAL lock_timeout = '{lock_ms}ms'; \
                 SET LOCAL statement_timeout = '{statement_ms}ms'"
            )
        } else {
            format!(
                "SET lock_timeout = '{lock_ms}ms'; \
                 SET statement_timeout = '{statement_ms}ms'"
            )
        };

        let Some(client) = self.client.as_mut() else {
            return Err(SourceError::Connection("not connected".to_string()));
        };
        match client.batch_execute(&sql) {
            Ok(()) => {
                self.in_transaction = bounds.snapshot_mode;
                Ok(())
            }
            Err(e) => {
                let err = classify_error(&e);
                self.last_error = Some(err.to_string());
                self.disconnect();
                Err(err)
            }
        }
    }

    fn end_cycle(&mut self) {
        if !self.in_transaction {
            return;
        }
        self.in_transaction = false;
        if let Some(client) = self.client.as_mut()
            && let Err(e) = client.batch_execute("COMMIT")
        {
            warn!(error = %format_postgres_error(&e), "failed to close cycle transaction");
            self.disconnect();
        }
    }

    fn database_counters(&mut self) -> Result<DatabaseCounters, SourceError> {
        let sql = build_database_counters_query(self.server_version_num);
        let rows = self.query_rows(&sql)?;
        let row = rows
            .first()
            .ok_or_else(|| SourceError::Query("counters query returned no rows".to_string()))?;
        Ok(DatabaseCounters {
            numbackends: row.get("numbackends"),
            max_connections: row.get("max_connections"),
            xact_commit: row.get("xact_commit"),
            xact_rollback: row.get("xact_rollback"),
            blks_read: row.get("blks_read"),
            blks_hit: row.get("blks_hit"),
            tup_modified: row.get("tup_modified"),
            conflicts: row.get("conflicts"),
            deadlocks: row.get("deadlocks"),
            temp_files: row.get("temp_files"),
            temp_bytes: row.get("temp_bytes"),
            db_size_bytes: row.get("db_size_bytes"),
            xid_age: row.get("xid_age"),
            next_oid: row.get("next_oid"),
            checkpoints_timed: row.get("checkpoints_timed"),
            checkpoints_req: row.get("checkpoints_req"),
            buffers_checkpoint: row.get("buffers_checkpoint"),
            archived_count: row.get("archived_count"),
            archive_failed_count: row.get("archive_failed_count"),
        })
    }

    fn activity(&mut self) -> Result<Vec<ActivitySample>, SourceError> {
        let sql = build_activity_query(self.server_version_num);
        let rows = self.query_rows(&sql)?;
        Ok(rows
            .iter()
            .map(|row| ActivitySample {
                pid: row.get("pid"),
                datname: row.get("datname"),
                usename: row.get("usename"),
                application_name: row.get("application_name"),
                client_addr: row.get("client_addr"),
                backend_type: row.get("backend_type"),
                state: row.get("state"),
                wait_event_type: row.get("wait_event_type"),
                wait_event: row.get("wait_event"),
                query_id: row.get("query_id"),
                query: row.get("query"),
                backend_start: row.get("backend_start"),
                xact_start: row.get("xact_start"),
                query_start: row.get("query_start"),
                state_change: row.get("state_change"),
            })
            .collect())
    }

    fn wait_events(&mut self) -> Result<Vec<WaitSample>, SourceError> {
        let rows = self.query_rows(build_wait_events_query())?;
        Ok(rows
            .iter()
            .map(|row| WaitSample {
                wait_event_type: row.get("wait_event_type"),
                wait_event: row.get("wait_event"),
                count: row.get("count"),
            })
            .collect())
    }

    fn locks(&mut self) -> Result<Vec<LockSample>, SourceError> {
        let sql = build_locks_query(self.server_version_num);
        let rows = self.query_rows(&sql)?;
        Ok(rows
            .iter()
            .map(|row| LockSample {
                pid: row.get("pid"),
                locktype: row.get("locktype"),
                mode: row.get("mode"),
                granted: row.get("granted"),
                relation: row.get("relation"),
                relname: row.get("relname"),
                application_name: row.get("application_name"),
                wait_start: row.get("wait_start"),
                blocked_by: row.get("blocked_by"),
            })
            .collect())
    }

    fn statements(&mut self) -> Result<Vec<StatementSample>, SourceError> {
        if !self.check_statements_available()? {
            return Err(SourceError::Unavailable("pg_stat_statements".to_string()));
        }
        let sql = build_statements_query(self.server_version_num);
        let rows = self.query_rows(&sql)?;
        Ok(rows
            .iter()
            .map(|row| StatementSample {
                queryid: row.get("queryid"),
                query: row.get("query"),
                calls: row.get("calls"),
                total_time_ms: row.get("total_time_ms"),
                rows: row.get("rows"),
                shared_blks_hit: row.get("shared_blks_hit"),
                shared_blks_read: row.get("shared_blks_read"),
                temp_blks_read: row.get("temp_blks_read"),
                temp_blks_written: row.get("temp_blks_written"),
            })
            .collect())
    }

    fn tables(&mut self) -> Result<Vec<TableSnapshot>, SourceError> {
        let rows = self.query_rows(build_tables_query())?;
        Ok(rows
            .iter()
            .map(|row| TableSnapshot {
                relid: row.get("relid"),
                schemaname: row.get("schemaname"),
                relname: row.get("relname"),
                n_live_tup: row.get("n_live_tup"),
                n_dead_tup: row.get("n_dead_tup"),
                n_mod_since_analyze: row.get("n_mod_since_analyze"),
                last_vacuum: row.get("last_vacuum"),
                last_autovacuum: row.get("last_autovacuum"),
                last_analyze: row.get("last_analyze"),
                last_autoanalyze: row.get("last_autoanalyze"),
                vacuum_count: row.get("vacuum_count"),
                autovacuum_count: row.get("autovacuum_count"),
                size_bytes: row.get("size_bytes"),
            })
            .collect())
    }

    fn io(&mut self) -> Result<Vec<IoSample>, SourceError> {
        let Some(sql) = build_io_query(self.server_version_num) else {
            return Ok(Vec::new());
        };
        let rows = self.query_rows(sql)?;
        Ok(rows
            .iter()
            .map(|row| IoSample {
                backend_type: row.get("backend_type"),
                reads: row.get("reads"),
                writes: row.get("writes"),
                hits: row.get("hits"),
                evictions: row.get("evictions"),
                fsyncs: row.get("fsyncs"),
            })
            .collect())
    }

    fn replication(&mut self) -> Result<Vec<ReplicationSample>, SourceError> {
        let rows = self.query_rows(build_replication_query())?;
        Ok(rows
            .iter()
            .map(|row| ReplicationSample {
                pid: row.get("pid"),
                application_name: row.get("application_name"),
                client_addr: row.get("client_addr"),
                state: row.get("state"),
                replay_lag_bytes: row.get("replay_lag_bytes"),
                replay_lag_secs: row.get("replay_lag_secs"),
            })
            .collect())
    }

    fn settings(&mut self) -> Result<Vec<SettingSample>, SourceError> {
        let rows = self.query_rows(build_settings_query())?;
        Ok(rows
            .iter()
            .map(|row| SettingSample {
                name: row.get("name"),
                setting: row.get("setting"),
                unit: row.get("unit"),
                pending_restart: row.get("pending_restart"),
            })
            .collect())
    }
}

/// Maps a driver error onto the collection error taxonomy.
fn classify_error(e: &postgres::Error) -> SourceError {
    let msg = format_postgres_error(e);
    if e.is_closed() {
        return SourceError::Connection(msg);
    }
    match e.code() {
        Some(code) if *code == SqlState::LOCK_NOT_AVAILABLE || *code == SqlState::QUERY_CANCELED => {
            SourceError::LockTimeout(msg)
        }
        Some(code)
            if *code == SqlState::UNDEFINED_TABLE
                || *code == SqlState::UNDEFINED_FUNCTION
                || *code == SqlState::OBJECT_NOT_IN_PREREQUISITE_STATE =>
        {
            SourceError::Unavailable(msg)
        }
        Some(_) => SourceError::Query(msg),
        None => SourceError::Connection(msg),
    }
}

/// Formats a PostgreSQL error as `SEVERITY: message (SQLSTATE)`, or a short
/// description for client-side errors.
pub fn format_postgres_error(e: &postgres::Error) -> String {
    if let Some(db_error) = e.as_db_error() {
        format!(
            "{}: {} ({})",
            db_error.severity(),
            db_error.message(),
            db_error.code().code()
        )
    } else {
        let msg = e.to_string();
        if msg.contains("Connection refused") {
            "connection refused".to_string()
        } else if msg.contains("password authentication failed") {
            "password authentication failed".to_string()
        } else {
            msg
        }
    }
}
