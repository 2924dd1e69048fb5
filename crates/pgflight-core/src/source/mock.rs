//! Scripted [`StatSource`] for tests and dry runs.
//!
//! Clones share state, so a test can hand one clone to the scheduler and keep
//! another to change the scenario between cycles and to count queries.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{LoadSignals, QueryBounds, SourceError, StatSource};
use crate::model::{
    ActivitySample, DatabaseCounters, IoSample, LockSample, ReplicationSample, SampleKind,
    SettingSample, StatementSample, TableSnapshot, WaitSample,
};

#[derive(Debug, Default)]
struct MockState {
    active_connections: i64,
    max_connections: i64,
    xact_total: i64,
    blocks_read_total: i64,
    /// Added to the cumulative counters on every load probe.
    xact_per_probe: i64,
    blocks_per_probe: i64,

    counters: DatabaseCounters,
    activity: Vec<ActivitySample>,
    locks: Vec<LockSample>,
    statements: Vec<StatementSample>,
    tables: Vec<TableSnapshot>,
    io: Vec<IoSample>,
    replication: Vec<ReplicationSample>,
    settings: Vec<SettingSample>,

    failures: HashMap<SampleKind, SourceError>,
    probe_failure: Option<SourceError>,

    probes: u64,
    catalog_queries: u64,
    queries_by_kind: HashMap<SampleKind, u64>,
    cycles_begun: u64,
    last_bounds: Option<QueryBounds>,
    in_cycle: bool,
}

#[derive(Clone, Debug, Default)]
pub struct MockStatSource {
    state: Arc<Mutex<MockState>>,
}

impl MockStatSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lightly loaded server: 10% connection ratio, ~100 txn/s and ~50
    /// blocks/s at a 180s interval, a handful of sessions, statements and tables.
    pub fn healthy() -> Self {
        let mock = Self::new();
        {
            let mut s = mock.lock();
            s.active_connections = 10;
            s.max_connections = 100;
            s.xact_per_probe = 18_000;
            s.blocks_per_probe = 9_000;
            s.counters = DatabaseCounters {
                numbackends: 12,
                max_connections: 100,
                db_size_bytes: 512 * 1024 * 1024,
                xid_age: 50_000_000,
                ..DatabaseCounters::default()
            };
            s.activity = vec![
                session(101, "active", "app", "client backend"),
                session(102, "idle", "app", "client backend"),
                session(103, "active", "batch", "client backend"),
            ];
            s.statements = vec![
                statement(1001, "SELECT * FROM orders WHERE id = $1", 100),
                statement(1002, "UPDATE accounts SET balance = $1 WHERE id = $2", 40),
            ];
            s.tables = vec![TableSnapshot {
                relid: 16384,
                schemaname: "public".to_string(),
                relname: "orders".to_string(),
                n_live_tup: 100_000,
                n_dead_tup: 500,
                ..TableSnapshot::default()
            }];
            s.settings = vec![SettingSample {
                name: "work_mem".to_string(),
                setting: "4096".to_string(),
                unit: "kB".to_string(),
                pending_restart: false,
            }];
        }
        mock
    }

    /// 85% connection ratio: above the default shed threshold.
    pub fn overloaded() -> Self {
        let mock = Self::healthy();
        mock.set_connections(85, 100);
        mock
    }

    /// 60% connection ratio: between the default throttle and shed thresholds.
    pub fn busy() -> Self {
        let mock = Self::healthy();
        mock.set_connections(60, 100);
        mock
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_connections(&self, active: i64, max: i64) {
        let mut s = self.lock();
        s.active_connections = active;
        s.max_connections = max;
        s.counters.max_connections = max;
    }

    pub fn set_rates_per_probe(&self, xact: i64, blocks: i64) {
        let mut s = self.lock();
        s.xact_per_probe = xact;
        s.blocks_per_probe = blocks;
    }

    pub fn set_counters(&self, counters: DatabaseCounters) {
        self.lock().counters = counters;
    }

    pub fn update_counters(&self, f: impl FnOnce(&mut DatabaseCounters)) {
        f(&mut self.lock().counters);
    }

    pub fn set_activity(&self, activity: Vec<ActivitySample>) {
        self.lock().activity = activity;
    }

    pub fn set_locks(&self, locks: Vec<LockSample>) {
        self.lock().locks = locks;
    }

    pub fn set_statements(&self, statements: Vec<StatementSample>) {
        self.lock().statements = statements;
    }

    pub fn update_statements(&self, f: impl FnOnce(&mut Vec<StatementSample>)) {
        f(&mut self.lock().statements);
    }

    pub fn set_tables(&self, tables: Vec<TableSnapshot>) {
        self.lock().tables = tables;
    }

    pub fn set_io(&self, io: Vec<IoSample>) {
        self.lock().io = io;
    }

    pub fn set_replication(&self, replication: Vec<ReplicationSample>) {
        self.lock().replication = replication;
    }

    pub fn set_settings(&self, settings: Vec<SettingSample>) {
        self.lock().settings = settings;
    }

    /// Makes every subsequent read of `kind` fail with `error`.
    pub fn fail(&self, kind: SampleKind, error: SourceError) {
        self.lock().failures.insert(kind, error);
    }

    pub fn fail_probe(&self, error: Option<SourceError>) {
        self.lock().probe_failure = error;
    }

    pub fn clear_failures(&self) {
        let mut s = self.lock();
        s.failures.clear();
        s.probe_failure = None;
    }

    /// Catalog queries issued so far. The load probe is not counted.
    pub fn catalog_queries(&self) -> u64 {
        self.lock().catalog_queries
    }

    pub fn queries_for(&self, kind: SampleKind) -> u64 {
        self.lock().queries_by_kind.get(&kind).copied().unwrap_or(0)
    }

    /// Kinds read at least once so far.
    pub fn kinds_queried(&self) -> HashSet<SampleKind> {
        self.lock()
            .queries_by_kind
            .iter()
            .filter(|(_, n)| **n > 0)
            .map(|(k, _)| *k)
            .collect()
    }

    pub fn probes(&self) -> u64 {
        self.lock().probes
    }

    pub fn cycles_begun(&self) -> u64 {
        self.lock().cycles_begun
    }

    pub fn last_bounds(&self) -> Option<QueryBounds> {
        self.lock().last_bounds.clone()
    }

    pub fn reset_counts(&self) {
        let mut s = self.lock();
        s.catalog_queries = 0;
        s.queries_by_kind.clear();
        s.probes = 0;
        s.cycles_begun = 0;
    }

    fn read<T: Clone>(
        &self,
        kind: SampleKind,
        pick: impl FnOnce(&MockState) -> T,
    ) -> Result<T, SourceError> {
        let mut s = self.lock();
        s.catalog_queries += 1;
        *s.queries_by_kind.entry(kind).or_insert(0) += 1;
        if let Some(err) = s.failures.get(&kind) {
            return Err(err.clone());
        }
        Ok(pick(&s))
    }
}

impl StatSource for MockStatSource {
    fn load_signals(&mut self) -> Result<LoadSignals, SourceError> {
        let mut s = self.lock();
        s.probes += 1;
        if let Some(err) = &s.probe_failure {
            return Err(err.clone());
        }
        s.xact_total += s.xact_per_probe;
        s.blocks_read_total += s.blocks_per_probe;
        let xact_per_probe = s.xact_per_probe;
        let blocks_per_probe = s.blocks_per_probe;
        s.counters.xact_commit += xact_per_probe;
        s.counters.blks_read += blocks_per_probe;
        s.counters.blks_hit += blocks_per_probe * 9;
        Ok(LoadSignals {
            active_connections: s.active_connections,
            max_connections: s.max_connections,
            xact_total: s.xact_total,
            blocks_read_total: s.blocks_read_total,
        })
    }

    fn begin_cycle(&mut self, bounds: &QueryBounds) -> Result<(), SourceError> {
        let mut s = self.lock();
        s.cycles_begun += 1;
        s.last_bounds = Some(bounds.clone());
        s.in_cycle = true;
        Ok(())
    }

    fn end_cycle(&mut self) {
        self.lock().in_cycle = false;
    }

    fn database_counters(&mut self) -> Result<DatabaseCounters, SourceError> {
        self.read(SampleKind::Database, |s| s.counters.clone())
    }

    fn activity(&mut self) -> Result<Vec<ActivitySample>, SourceError> {
        self.read(SampleKind::Activity, |s| s.activity.clone())
    }

    fn wait_events(&mut self) -> Result<Vec<WaitSample>, SourceError> {
        self.read(SampleKind::Waits, |s| {
            let mut waits: Vec<WaitSample> = Vec::new();
            for a in s.activity.iter().filter(|a| !a.wait_event.is_empty()) {
                match waits.iter_mut().find(|w| {
                    w.wait_event_type == a.wait_event_type && w.wait_event == a.wait_event
                }) {
                    Some(w) => w.count += 1,
                    None => waits.push(WaitSample {
                        wait_event_type: a.wait_event_type.clone(),
                        wait_event: a.wait_event.clone(),
                        count: 1,
                    }),
                }
            }
            waits
        })
    }

    fn locks(&mut self) -> Result<Vec<LockSample>, SourceError> {
        self.read(SampleKind::Locks, |s| s.locks.clone())
    }

    fn statements(&mut self) -> Result<Vec<StatementSample>, SourceError> {
        self.read(SampleKind::Statements, |s| s.statements.clone())
    }

    fn tables(&mut self) -> Result<Vec<TableSnapshot>, SourceError> {
        self.read(SampleKind::Tables, |s| s.tables.clone())
    }

    fn io(&mut self) -> Result<Vec<IoSample>, SourceError> {
        self.read(SampleKind::Io, |s| s.io.clone())
    }

    fn replication(&mut self) -> Result<Vec<ReplicationSample>, SourceError> {
        self.read(SampleKind::Replication, |s| s.replication.clone())
    }

    fn settings(&mut self) -> Result<Vec<SettingSample>, SourceError> {
        self.read(SampleKind::Settings, |s| s.settings.clone())
    }
}

/// Client session in the given state.
pub fn session(pid: i32, state: &str, application: &str, backend_type: &str) -> ActivitySample {
    ActivitySample {
        pid,
        datname: "app".to_string(),
        usename: "app".to_string(),
        application_name: application.to_string(),
        backend_type: backend_type.to_string(),
        state: state.to_string(),
        ..ActivitySample::default()
    }
}

/// Statement with `calls` executions and 10 shared hits per call.
pub fn statement(queryid: i64, query: &str, calls: i64) -> StatementSample {
    StatementSample {
        queryid,
        query: query.to_string(),
        calls,
        total_time_ms: calls as f64 * 0.5,
        rows: calls,
        shared_blks_hit: calls * 10,
        ..StatementSample::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_is_not_a_catalog_query() {
        let mut mock = MockStatSource::healthy();
        mock.load_signals().unwrap();
        assert_eq!(mock.probes(), 1);
        assert_eq!(mock.catalog_queries(), 0);
    }

    #[test]
    fn clones_share_counters_and_scenario() {
        let observer = MockStatSource::healthy();
        let mut source = observer.clone();
        source.activity().unwrap();
        source.statements().unwrap();
        assert_eq!(observer.catalog_queries(), 2);
        assert_eq!(observer.queries_for(SampleKind::Activity), 1);

        observer.set_connections(85, 100);
        let signals = source.load_signals().unwrap();
        assert!((signals.connection_ratio() - 0.85).abs() < 1e-9);
    }

    #[test]
    fn injected_failure_is_returned_and_still_counted() {
        let mut mock = MockStatSource::healthy();
        mock.fail(SampleKind::Locks, SourceError::LockTimeout("55P03".into()));
        assert!(mock.locks().unwrap_err().is_lock_timeout());
        assert_eq!(mock.queries_for(SampleKind::Locks), 1);
        mock.clear_failures();
        assert!(mock.locks().is_ok());
    }

    #[test]
    fn wait_events_group_activity() {
        let mock = MockStatSource::healthy();
        let mut a = session(1, "active", "app", "client backend");
        a.wait_event_type = "Lock".into();
        a.wait_event = "relation".into();
        mock.set_activity(vec![a.clone(), a]);
        let mut source = mock.clone();
        let waits = source.wait_events().unwrap();
        assert_eq!(waits.len(), 1);
        assert_eq!(waits[0].count, 2);
    }
}
