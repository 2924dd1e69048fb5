//! Numeric metrics derived from snapshots.
//!
//! Shared by the aggregator (bucket summaries), time-travel reconstruction
//! (interpolation) and the detectors (per-statement deltas). Rates need the
//! previous snapshot; counters that went backwards (stats reset) yield no rate.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::{Snapshot, StatementSample};

/// Delta of a cumulative counter, `None` on reset.
pub fn di64(curr: i64, prev: i64) -> Option<i64> {
    if curr >= prev { Some(curr - prev) } else { None }
}

fn rate(curr: i64, prev: i64, dt: f64) -> Option<f64> {
    di64(curr, prev).map(|d| d as f64 / dt)
}

// ---------------------------------------------------------------------------
// Per-family metric extraction
// ---------------------------------------------------------------------------

/// Instance-wide gauges plus per-second rates when `prev` is given.
pub fn database_metrics(snapshot: &Snapshot, prev: Option<&Snapshot>) -> BTreeMap<String, f64> {
    let mut out = BTreeMap::new();
    let Some(c) = snapshot.counters() else {
        return out;
    };
    out.insert("connections".to_string(), c.numbackends as f64);
    out.insert("db_size_bytes".to_string(), c.db_size_bytes as f64);
    out.insert("xid_age".to_string(), c.xid_age as f64);

    let Some((p, prev_at)) = prev.and_then(|p| p.counters().map(|c| (c, p.captured_at))) else {
        return out;
    };
    let dt = (snapshot.captured_at - prev_at) as f64;
    if dt <= 0.0 {
        return out;
    }
    let xact_curr = c.xact_commit + c.xact_rollback;
    let xact_prev = p.xact_commit + p.xact_rollback;
    if let Some(v) = rate(xact_curr, xact_prev, dt) {
        out.insert("tps".to_string(), v);
    }
    if let Some(v) = rate(c.xact_rollback, p.xact_rollback, dt) {
        out.insert("rollbacks_per_sec".to_string(), v);
    }
    if let Some(v) = rate(c.blks_read, p.blks_read, dt) {
        out.insert("blocks_read_per_sec".to_string(), v);
    }
    if let Some(v) = rate(c.temp_bytes, p.temp_bytes, dt) {
        out.insert("temp_bytes_per_sec".to_string(), v);
    }
    if let (Some(hit), Some(read)) = (di64(c.blks_hit, p.blks_hit), di64(c.blks_read, p.blks_read))
        && hit + read > 0
    {
        out.insert("hit_ratio".to_string(), hit as f64 / (hit + read) as f64);
    }
    if let Some(d) = di64(c.deadlocks, p.deadlocks) {
        out.insert("deadlocks".to_string(), d as f64);
    }
    let checkpoints =
        di64(c.checkpoints_timed, p.checkpoints_timed).zip(di64(c.checkpoints_req, p.checkpoints_req));
    if let Some((timed, req)) = checkpoints {
        out.insert("checkpoints".to_string(), (timed + req) as f64);
    }
    out
}

/// Session counts by state.
pub fn activity_metrics(snapshot: &Snapshot) -> BTreeMap<String, f64> {
    let mut out = BTreeMap::new();
    if !snapshot.has(crate::model::SampleKind::Activity) {
        return out;
    }
    let clients: Vec<_> = snapshot
        .activity()
        .iter()
        .filter(|a| a.is_client_backend())
        .collect();
    let active = clients.iter().filter(|a| a.state == "active").count();
    let idle_tx = clients.iter().filter(|a| a.in_transaction_idle()).count();
    out.insert("sessions".to_string(), clients.len() as f64);
    out.insert("active_sessions".to_string(), active as f64);
    out.insert("idle_in_transaction".to_string(), idle_tx as f64);
    out.insert(
        "autovacuum_workers".to_string(),
        snapshot
            .activity()
            .iter()
            .filter(|a| a.backend_type == "autovacuum worker")
            .count() as f64,
    );
    if snapshot.has(crate::model::SampleKind::Locks) {
        let mut blocked: Vec<i32> = snapshot.blocked_locks().map(|l| l.pid).collect();
        blocked.sort_unstable();
        blocked.dedup();
        out.insert("blocked_sessions".to_string(), blocked.len() as f64);
    }
    out
}

/// Waiting sessions per `type:event`.
pub fn wait_metrics(snapshot: &Snapshot) -> BTreeMap<String, f64> {
    snapshot
        .waits()
        .iter()
        .map(|w| (format!("{}:{}", w.wait_event_type, w.wait_event), w.count as f64))
        .collect()
}

/// Dead tuples per table.
pub fn table_metrics(snapshot: &Snapshot) -> BTreeMap<String, f64> {
    snapshot
        .tables()
        .iter()
        .map(|t| (t.qualified_name(), t.n_dead_tup as f64))
        .collect()
}

/// Every interpolatable metric of one snapshot.
pub fn snapshot_metrics(snapshot: &Snapshot, prev: Option<&Snapshot>) -> BTreeMap<String, f64> {
    let mut out = database_metrics(snapshot, prev);
    out.extend(activity_metrics(snapshot));
    if !snapshot.tables().is_empty() {
        let dead: i64 = snapshot.tables().iter().map(|t| t.n_dead_tup).sum();
        out.insert("dead_tuples".to_string(), dead as f64);
    }
    if let Some(lag) = snapshot.replication().iter().map(|r| r.replay_lag_bytes).max() {
        out.insert("replication_lag_bytes".to_string(), lag as f64);
    }
    let waiting: i64 = snapshot.waits().iter().map(|w| w.count).sum();
    if snapshot.has(crate::model::SampleKind::Waits) {
        out.insert("waiting_sessions".to_string(), waiting as f64);
    }
    out
}

// ---------------------------------------------------------------------------
// Statement deltas
// ---------------------------------------------------------------------------

/// Work done by one statement between two consecutive snapshots.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct StatementDelta {
    pub queryid: i64,
    pub calls: i64,
    pub total_time_ms: f64,
    pub buffer_ops: i64,
    pub shared_blks_hit: i64,
    pub shared_blks_read: i64,
    pub temp_blks: i64,
    pub rows: i64,
}

fn statement_delta(curr: &StatementSample, prev: &StatementSample) -> Option<StatementDelta> {
    Some(StatementDelta {
        queryid: curr.queryid,
        calls: di64(curr.calls, prev.calls)?,
        total_time_ms: (curr.total_time_ms - prev.total_time_ms).max(0.0),
        buffer_ops: di64(curr.buffer_ops(), prev.buffer_ops())?,
        shared_blks_hit: di64(curr.shared_blks_hit, prev.shared_blks_hit)?,
        shared_blks_read: di64(curr.shared_blks_read, prev.shared_blks_read)?,
        temp_blks: di64(
            curr.temp_blks_read + curr.temp_blks_written,
            prev.temp_blks_read + prev.temp_blks_written,
        )?,
        rows: di64(curr.rows, prev.rows)?,
    })
}

/// Per-statement deltas between two snapshots that both carry statements.
/// Statements missing from `prev` or whose counters were reset are left out.
pub fn statement_deltas(prev: &Snapshot, curr: &Snapshot) -> Vec<StatementDelta> {
    let before: BTreeMap<i64, &StatementSample> =
        prev.statements().iter().map(|s| (s.queryid, s)).collect();
    curr.statements()
        .iter()
        .filter_map(|s| before.get(&s.queryid).and_then(|p| statement_delta(s, p)))
        .collect()
}

/// Accumulated statement work over a window.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct StatementTotals {
    pub queryid: i64,
    pub query: String,
    pub calls: i64,
    pub total_time_ms: f64,
    pub buffer_ops: i64,
    pub shared_blks_hit: i64,
    pub shared_blks_read: i64,
    pub temp_blks: i64,
    pub rows: i64,
    /// Seconds of history the totals were accumulated over.
    pub covered_secs: i64,
}

impl StatementTotals {
    pub fn absorb(&mut self, delta: &StatementDelta, dt: i64) {
        self.calls += delta.calls;
        self.total_time_ms += delta.total_time_ms;
        self.buffer_ops += delta.buffer_ops;
        self.shared_blks_hit += delta.shared_blks_hit;
        self.shared_blks_read += delta.shared_blks_read;
        self.temp_blks += delta.temp_blks;
        self.rows += delta.rows;
        self.covered_secs += dt;
    }

    pub fn merge(&mut self, other: &StatementTotals) {
        if self.query.is_empty() {
            self.query = other.query.clone();
        }
        self.calls += other.calls;
        self.total_time_ms += other.total_time_ms;
        self.buffer_ops += other.buffer_ops;
        self.shared_blks_hit += other.shared_blks_hit;
        self.shared_blks_read += other.shared_blks_read;
        self.temp_blks += other.temp_blks;
        self.rows += other.rows;
        self.covered_secs += other.covered_secs;
    }

    /// Shared-buffer miss ratio over the window.
    pub fn miss_ratio(&self) -> f64 {
        let total = self.shared_blks_hit + self.shared_blks_read;
        if total <= 0 {
            0.0
        } else {
            self.shared_blks_read as f64 / total as f64
        }
    }
}

/// Sums statement deltas over consecutive snapshot pairs whose later point
/// lies in `(from, to]`. `snapshots` must be sorted by capture time.
pub fn statement_totals(snapshots: &[Snapshot], from: i64, to: i64) -> BTreeMap<i64, StatementTotals> {
    let mut totals: BTreeMap<i64, StatementTotals> = BTreeMap::new();
    let with_statements: Vec<&Snapshot> = snapshots
        .iter()
        .filter(|s| s.has(crate::model::SampleKind::Statements))
        .collect();
    for pair in with_statements.windows(2) {
        let (prev, curr) = (pair[0], pair[1]);
        if curr.captured_at <= from || curr.captured_at > to {
            continue;
        }
        let dt = curr.captured_at - prev.captured_at;
        for delta in statement_deltas(prev, curr) {
            let entry = totals.entry(delta.queryid).or_insert_with(|| StatementTotals {
                queryid: delta.queryid,
                ..StatementTotals::default()
            });
            entry.absorb(&delta, dt);
        }
        for s in curr.statements() {
            if let Some(t) = totals.get_mut(&s.queryid)
                && t.query.is_empty()
            {
                t.query = s.query.clone();
            }
        }
    }
    totals
}
