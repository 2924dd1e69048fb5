//! Read-only access to the observed server's statistics views.
//!
//! [`StatSource`] is the only seam between the recorder and PostgreSQL.
//! [`PgStatSource`] implements it over the `postgres` client; [`mock`]
//! provides a scripted implementation for tests.

pub mod mock;
mod pg;

pub use pg::{PgStatSource, format_postgres_error};

use std::fmt;
use std::time::Duration;

use crate::model::{
    ActivitySample, DatabaseCounters, IoSample, LockSample, ReplicationSample, SettingSample,
    StatementSample, TableSnapshot, WaitSample,
};

/// Error type for statistics collection.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceError {
    /// Connection could not be established or was lost.
    Connection(String),
    /// Query execution failed.
    Query(String),
    /// The query gave up waiting for a lock or hit the statement timeout.
    LockTimeout(String),
    /// The view or extension is not available on this server.
    Unavailable(String),
}

impl SourceError {
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, SourceError::LockTimeout(_))
    }
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceError::Connection(msg) => write!(f, "PostgreSQL: {}", msg),
            SourceError::Query(msg) => write!(f, "PostgreSQL query error: {}", msg),
            SourceError::LockTimeout(msg) => write!(f, "PostgreSQL lock timeout: {}", msg),
            SourceError::Unavailable(what) => write!(f, "PostgreSQL: {} not available", what),
        }
    }
}

impl std::error::Error for SourceError {}

/// Cheap load probe taken before every cycle.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct LoadSignals {
    /// Non-idle client sessions.
    pub active_connections: i64,
    pub max_connections: i64,
    /// Cumulative commits + rollbacks across databases.
    pub xact_total: i64,
    /// Cumulative blocks read across databases.
    pub blocks_read_total: i64,
}

impl LoadSignals {
    pub fn connection_ratio(&self) -> f64 {
        if self.max_connections <= 0 {
            0.0
        } else {
            self.active_connections as f64 / self.max_connections as f64
        }
    }
}

/// Bounds applied to every catalog query of one cycle.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryBounds {
    pub lock_timeout: Duration,
    pub statement_timeout: Duration,
    /// Read all catalogs of the cycle from one consistent snapshot.
    pub snapshot_mode: bool,
}

/// Read-only statistics interface.
///
/// `load_signals` is the gate probe and runs outside the cycle; every other
/// method is a catalog query issued between `begin_cycle` and `end_cycle`.
pub trait StatSource: Send {
    fn load_signals(&mut self) -> Result<LoadSignals, SourceError>;

    fn begin_cycle(&mut self, bounds: &QueryBounds) -> Result<(), SourceError>;
    fn end_cycle(&mut self);

    fn database_counters(&mut self) -> Result<DatabaseCounters, SourceError>;
    fn activity(&mut self) -> Result<Vec<ActivitySample>, SourceError>;
    fn wait_events(&mut self) -> Result<Vec<WaitSample>, SourceError>;
    fn locks(&mut self) -> Result<Vec<LockSample>, SourceError>;
    fn statements(&mut self) -> Result<Vec<StatementSample>, SourceError>;
    fn tables(&mut self) -> Result<Vec<TableSnapshot>, SourceError>;
    fn io(&mut self) -> Result<Vec<IoSample>, SourceError>;
    fn replication(&mut self) -> Result<Vec<ReplicationSample>, SourceError>;
    fn settings(&mut self) -> Result<Vec<SettingSample>, SourceError>;
}
