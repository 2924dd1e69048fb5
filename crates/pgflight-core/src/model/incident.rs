//! Detected storms, regressions and anomaly findings.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        })
    }
}

/// Classification of an execution-frequency storm.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StormClass {
    /// Same fingerprint failing and being retried immediately.
    RetryStorm,
    /// Shared-buffer miss ratio jumped along with the call rate.
    CacheMiss,
    Spike,
}

impl fmt::Display for StormClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StormClass::RetryStorm => "RETRY_STORM",
            StormClass::CacheMiss => "CACHE_MISS",
            StormClass::Spike => "SPIKE",
        })
    }
}

/// Cost metric compared by the regression detector.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CostMetric {
    /// Shared hits + reads + temp reads + temp writes per call. Stable under
    /// identical plans regardless of machine load.
    #[default]
    BufferOps,
    /// Mean execution time per call. Load-sensitive.
    Time,
}

impl CostMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            CostMetric::BufferOps => "buffer_ops",
            CostMetric::Time => "time",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "buffer_ops" => Some(CostMetric::BufferOps),
            "time" => Some(CostMetric::Time),
            _ => None,
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct CheckpointSignal {
    pub timed: i64,
    pub requested: i64,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct LockSignal {
    pub waiting: usize,
    pub blocked_pids: Vec<i32>,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct IoSignal {
    pub blocks_read_per_sec: f64,
    pub hit_ratio: f64,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct VacuumSignal {
    pub autovacuum_workers: usize,
}

/// Signals observed around a detection. Each field is `None` when the
/// underlying samples were not collected in the window.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct CorrelationSnapshot {
    pub captured_at: i64,
    pub checkpoint: Option<CheckpointSignal>,
    pub locks: Option<LockSignal>,
    pub io: Option<IoSignal>,
    pub vacuum: Option<VacuumSignal>,
    #[serde(default)]
    pub config_changes: Vec<String>,
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProbableCause {
    LockContention,
    CheckpointActivity,
    VacuumActivity,
    ConfigurationChange,
    TempSpill,
    CacheEviction,
    /// Nothing else explains it; the plan most likely changed.
    PlanChange,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct QueryStorm {
    pub id: u64,
    pub queryid: i64,
    pub query: String,
    pub recent_count: f64,
    pub baseline_count: f64,
    pub multiplier: f64,
    pub class: StormClass,
    pub severity: Severity,
    pub correlation: CorrelationSnapshot,
    pub detected_at: i64,
    pub last_seen_at: i64,
    /// Consecutive evaluations in which the storm was not observed.
    pub clean_evaluations: u32,
    pub resolved_at: Option<i64>,
    pub resolution_notes: Option<String>,
}

impl QueryStorm {
    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct QueryRegression {
    pub id: u64,
    pub queryid: i64,
    pub query: String,
    pub metric: CostMetric,
    pub baseline_avg: f64,
    pub current_avg: f64,
    pub change_pct: f64,
    pub severity: Severity,
    pub probable_causes: Vec<ProbableCause>,
    pub correlation: CorrelationSnapshot,
    pub detected_at: i64,
    pub last_seen_at: i64,
    pub clean_evaluations: u32,
    pub resolved_at: Option<i64>,
    pub resolution_notes: Option<String>,
}

impl QueryRegression {
    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}

/// Output of one anomaly rule evaluation.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Finding {
    pub rule_id: String,
    pub severity: Severity,
    pub title: String,
    pub detail: Option<String>,
    pub value: f64,
    pub detected_at: i64,
    /// pid, relation or replica name the finding points at.
    pub entity: Option<String>,
}
