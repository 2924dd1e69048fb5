//! Collection cycle: probe, gate, read, store.
//!
//! One cycle at a time. The whole cycle runs under a single mutex taken with
//! `try_lock`; a cycle that finds it held is recorded as skipped instead of
//! waiting, so two collectors never contend for the same catalog locks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, error, info, warn};

use super::governor::{Decision, LoadGovernor};
use crate::config::{Config, ConfigStore, Mode};
use crate::model::{CollectionOutcome, CollectionStat, DataBlock, SampleKind, StatScope};
use crate::source::{QueryBounds, SourceError, StatSource};
use crate::storage::Storage;

const OVERLAP_REASON: &str = "previous cycle still running";

/// Result of one `run_cycle_at` call.
#[derive(Clone, Debug, PartialEq)]
pub struct CycleReport {
    pub started_at: i64,
    /// Set when at least one block was stored.
    pub snapshot_id: Option<u64>,
    pub outcome: CollectionOutcome,
    /// `None` when the cycle never reached the governor.
    pub decision: Option<Decision>,
    pub kinds_collected: Vec<SampleKind>,
    pub failures: Vec<(SampleKind, String)>,
    pub storage_failures: usize,
    pub duration_ms: u64,
    pub detail: Option<String>,
}

impl CycleReport {
    fn empty(started_at: i64, outcome: CollectionOutcome, detail: Option<String>) -> Self {
        Self {
            started_at,
            snapshot_id: None,
            outcome,
            decision: None,
            kinds_collected: Vec::new(),
            failures: Vec::new(),
            storage_failures: 0,
            duration_ms: 0,
            detail,
        }
    }
}

/// Scheduler state visible without waiting for a running cycle.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SchedulerStatus {
    pub cycles: u64,
    pub last_cycle_at: Option<i64>,
    pub last_outcome: Option<CollectionOutcome>,
    pub last_snapshot_id: Option<u64>,
    /// Consecutive cycles with at least one ring/archive write failure.
    pub storage_failure_cycles: u32,
    pub storage_alarm: bool,
    pub breaker_open: bool,
}

struct CycleState<S> {
    source: S,
    governor: LoadGovernor,
    next_snapshot_id: u64,
    last_captured_at: i64,
    /// Consecutive cycles that were not shed, for leaving emergency mode.
    unshed_streak: u32,
}

pub struct Scheduler<S: StatSource> {
    config: Arc<ConfigStore>,
    storage: Arc<Storage>,
    cycle: Mutex<CycleState<S>>,
    status: Mutex<SchedulerStatus>,
    requested: AtomicBool,
}

fn read_block<S: StatSource>(source: &mut S, kind: SampleKind) -> Result<DataBlock, SourceError> {
    Ok(match kind {
        SampleKind::Database => DataBlock::Database(source.database_counters()?),
        SampleKind::Activity => DataBlock::Activity(source.activity()?),
        SampleKind::Waits => DataBlock::Waits(source.wait_events()?),
        SampleKind::Locks => DataBlock::Locks(source.locks()?),
        SampleKind::Statements => DataBlock::Statements(source.statements()?),
        SampleKind::Tables => DataBlock::Tables(source.tables()?),
        SampleKind::Io => DataBlock::Io(source.io()?),
        SampleKind::Replication => DataBlock::Replication(source.replication()?),
        SampleKind::Settings => DataBlock::Settings(source.settings()?),
    })
}

fn bounds(config: &Config) -> QueryBounds {
    QueryBounds {
        lock_timeout: Duration::from_millis(config.lock_timeout_ms),
        statement_timeout: Duration::from_millis(config.statement_timeout_ms),
        snapshot_mode: config.snapshot_mode,
    }
}

impl<S: StatSource> Scheduler<S> {
    /// Snapshot ids continue after the highest id already stored.
    pub fn new(source: S, config: Arc<ConfigStore>, storage: Arc<Storage>) -> Self {
        let (next_snapshot_id, last_captured_at) = match storage.latest_snapshot() {
            Ok(Some((id, at))) => (id + 1, at),
            Ok(None) => (1, i64::MIN),
            Err(e) => {
                warn!(error = %e, "could not read latest snapshot id, starting from archive-less state");
                (1, i64::MIN)
            }
        };
        Self {
            config,
            storage,
            cycle: Mutex::new(CycleState {
                source,
                governor: LoadGovernor::new(),
                next_snapshot_id,
                last_captured_at,
                unshed_streak: 0,
            }),
            status: Mutex::new(SchedulerStatus::default()),
            requested: AtomicBool::new(false),
        }
    }

    fn status_lock(&self) -> MutexGuard<'_, SchedulerStatus> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn status(&self) -> SchedulerStatus {
        self.status_lock().clone()
    }

    /// Asks the run loop for an immediate cycle. The cycle still goes
    /// through the single-flight guard.
    pub fn request_collection(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    /// Consumes a pending request.
    pub fn take_request(&self) -> bool {
        self.requested.swap(false, Ordering::SeqCst)
    }

    /// Delay before the next tick: the mode's interval plus random jitter.
    pub fn next_delay(&self) -> Duration {
        let config = self.config.snapshot();
        let jitter = if config.jitter_max_secs > 0 {
            rand::thread_rng().gen_range(0..=config.jitter_max_secs * 1000)
        } else {
            0
        };
        Duration::from_secs(config.interval_secs()) + Duration::from_millis(jitter)
    }

    pub fn run_cycle(&self) -> CycleReport {
        self.run_cycle_at(chrono::Utc::now().timestamp())
    }

    fn record(&self, stat: &CollectionStat) -> bool {
        match self.storage.record_stat(stat) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "failed to record collection stat");
                false
            }
        }
    }

    /// Runs one cycle with `now` as the capture time (clamped to stay
    /// strictly after the previous snapshot).
    pub fn run_cycle_at(&self, now: i64) -> CycleReport {
        let mut state = match self.cycle.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
            Err(TryLockError::WouldBlock) => {
                info!(reason = OVERLAP_REASON, "collection cycle skipped");
                self.record(&CollectionStat {
                    started_at: now,
                    scope: StatScope::Cycle,
                    duration_ms: 0,
                    outcome: CollectionOutcome::Skipped,
                    detail: Some(OVERLAP_REASON.to_string()),
                    snapshot_id: None,
                });
                return CycleReport::empty(
                    now,
                    CollectionOutcome::Skipped,
                    Some(OVERLAP_REASON.to_string()),
                );
            }
        };

        let config = self.config.snapshot();
        if !config.enabled {
            debug!("collection disabled");
            return CycleReport::empty(now, CollectionOutcome::Skipped, Some("disabled".to_string()));
        }

        let started = Instant::now();
        let captured_at = now.max(state.last_captured_at.saturating_add(1));
        let mut report = CycleReport::empty(captured_at, CollectionOutcome::Succeeded, None);

        let signals = match state.source.load_signals() {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "load probe failed, cycle abandoned");
                report.outcome = CollectionOutcome::Failed;
                report.detail = Some(e.to_string());
                return self.finish(&mut state, &config, report, started, false);
            }
        };

        let decision = state.governor.evaluate(&config, captured_at, &signals);
        report.decision = Some(decision);
        match decision {
            Decision::Shed { connection_ratio } => {
                info!(connection_ratio, threshold = config.shed_connection_ratio, "collection shed");
                report.outcome = CollectionOutcome::Skipped;
                report.detail = Some(decision.to_string());
                self.on_shed(&mut state, &config);
                return self.finish(&mut state, &config, report, started, false);
            }
            Decision::Throttle(reason) => {
                info!(reason = %reason, "collection throttled to reduced scope");
                report.detail = Some(decision.to_string());
            }
            Decision::Proceed => {}
        }
        self.on_unshed(&mut state, &config);

        if let Err(e) = state.source.begin_cycle(&bounds(&config)) {
            warn!(error = %e, "could not open collection transaction");
            report.outcome = CollectionOutcome::Failed;
            report.detail = Some(e.to_string());
            let hit_lock_timeout = e.is_lock_timeout();
            return self.finish(&mut state, &config, report, started, hit_lock_timeout);
        }

        let snapshot_id = state.next_snapshot_id;
        let mut hit_lock_timeout = false;
        let mut attempted = 0usize;
        for &kind in decision.scope() {
            let kind_started = Instant::now();
            let (outcome, detail) = match read_block(&mut state.source, kind) {
                Ok(block) => {
                    attempted += 1;
                    match self.storage.write_block(snapshot_id, captured_at, block) {
                        Ok(()) => {
                            report.kinds_collected.push(kind);
                            (CollectionOutcome::Succeeded, None)
                        }
                        Err(e) => {
                            // The ring holds the block; only its archive copy is pending.
                            report.kinds_collected.push(kind);
                            report.storage_failures += 1;
                            warn!(kind = %kind, error = %e, "archive write failed");
                            (CollectionOutcome::Partial, Some(format!("storage: {}", e)))
                        }
                    }
                }
                Err(SourceError::Unavailable(what)) => {
                    debug!(kind = %kind, what = %what, "sample source not available");
                    (CollectionOutcome::Skipped, Some(format!("{} not available", what)))
                }
                Err(e) => {
                    attempted += 1;
                    hit_lock_timeout |= e.is_lock_timeout();
                    warn!(kind = %kind, error = %e, "sub-collection failed");
                    report.failures.push((kind, e.to_string()));
                    (CollectionOutcome::Failed, Some(e.to_string()))
                }
            };
            let stat = CollectionStat {
                started_at: captured_at,
                scope: StatScope::Sample(kind),
                duration_ms: kind_started.elapsed().as_millis() as u64,
                outcome,
                detail,
                snapshot_id: Some(snapshot_id),
            };
            if !self.record(&stat) {
                report.storage_failures += 1;
            }
        }
        state.source.end_cycle();

        if !report.kinds_collected.is_empty() {
            report.snapshot_id = Some(snapshot_id);
            state.next_snapshot_id += 1;
            state.last_captured_at = captured_at;
        }
        report.outcome = if attempted > 0 && report.failures.len() == attempted {
            CollectionOutcome::Failed
        } else if !report.failures.is_empty() || report.storage_failures > 0 {
            CollectionOutcome::Partial
        } else if matches!(decision, Decision::Throttle(_)) {
            CollectionOutcome::Throttled
        } else {
            CollectionOutcome::Succeeded
        };
        self.finish(&mut state, &config, report, started, hit_lock_timeout)
    }

    fn on_shed(&self, state: &mut CycleState<S>, config: &Config) {
        state.unshed_streak = 0;
        if config.auto_mode && config.mode == Mode::Normal {
            match self.config.set("mode", Mode::Emergency.as_str()) {
                Ok(()) => warn!("auto mode: switched to emergency interval"),
                Err(e) => warn!(error = %e, "auto mode: could not switch mode"),
            }
        }
    }

    fn on_unshed(&self, state: &mut CycleState<S>, config: &Config) {
        state.unshed_streak = state.unshed_streak.saturating_add(1);
        if config.auto_mode
            && config.mode == Mode::Emergency
            && state.unshed_streak >= config.auto_resolve_after
        {
            match self.config.set("mode", Mode::Normal.as_str()) {
                Ok(()) => info!(cycles = state.unshed_streak, "auto mode: back to normal interval"),
                Err(e) => warn!(error = %e, "auto mode: could not switch mode"),
            }
        }
    }

    /// Records the cycle stat, feeds the breaker and the storage alarm, and
    /// publishes status.
    fn finish(
        &self,
        state: &mut CycleState<S>,
        config: &Config,
        mut report: CycleReport,
        started: Instant,
        hit_lock_timeout: bool,
    ) -> CycleReport {
        report.duration_ms = started.elapsed().as_millis() as u64;
        if state.governor.record_cycle(config, hit_lock_timeout) {
            warn!(
                cooldown_cycles = config.breaker_cooldown_cycles,
                "repeated lock timeouts, throttling collection"
            );
        }

        let stat = CollectionStat {
            started_at: report.started_at,
            scope: StatScope::Cycle,
            duration_ms: report.duration_ms,
            outcome: report.outcome,
            detail: report.detail.clone(),
            snapshot_id: report.snapshot_id,
        };
        if !self.record(&stat) {
            report.storage_failures += 1;
        }

        let mut status = self.status_lock();
        status.cycles += 1;
        status.last_cycle_at = Some(report.started_at);
        status.last_outcome = Some(report.outcome);
        if report.snapshot_id.is_some() {
            status.last_snapshot_id = report.snapshot_id;
        }
        status.breaker_open = state.governor.breaker_open();
        if report.storage_failures > 0 {
            status.storage_failure_cycles += 1;
            if status.storage_failure_cycles >= config.storage_alarm_threshold
                && !status.storage_alarm
            {
                status.storage_alarm = true;
                error!(
                    cycles = status.storage_failure_cycles,
                    pending = self.storage.archive_pending(),
                    "persistent storage failures, alarm raised"
                );
            }
        } else if status.storage_failure_cycles > 0 || status.storage_alarm {
            if status.storage_alarm {
                info!("storage writes recovered, alarm cleared");
            }
            status.storage_failure_cycles = 0;
            status.storage_alarm = false;
        }
        drop(status);

        debug!(
            snapshot_id = ?report.snapshot_id,
            outcome = %report.outcome,
            kinds = report.kinds_collected.len(),
            failures = report.failures.len(),
            duration_ms = report.duration_ms,
            "collection cycle finished"
        );
        report
    }
}
