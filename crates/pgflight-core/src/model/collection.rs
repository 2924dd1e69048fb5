use serde::{Deserialize, Serialize};
use std::fmt;

use super::snapshot::SampleKind;

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
pub enum CollectionOutcome {
    Succeeded,
    /// Some sub-collections failed, the rest were stored.
    Partial,
    /// Governor reduced the scope.
    Throttled,
    /// Governor shed the cycle, or a previous cycle was still running.
    Skipped,
    Failed,
}

impl fmt::Display for CollectionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CollectionOutcome::Succeeded => "succeeded",
            CollectionOutcome::Partial => "partial",
            CollectionOutcome::Throttled => "throttled",
            CollectionOutcome::Skipped => "skipped",
            CollectionOutcome::Failed => "failed",
        })
    }
}

/// What a CollectionStat row describes: the whole cycle or one sub-collection.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
pub enum StatScope {
    Cycle,
    Sample(SampleKind),
}

/// One row per collection attempt. Append-only.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct CollectionStat {
    pub started_at: i64,
    pub scope: StatScope,
    pub duration_ms: u64,
    pub outcome: CollectionOutcome,
    /// Error text for failures, the governor's reason for skips and throttles.
    pub detail: Option<String>,
    pub snapshot_id: Option<u64>,
}

impl CollectionStat {
    pub fn succeeded(&self) -> bool {
        matches!(
            self.outcome,
            CollectionOutcome::Succeeded | CollectionOutcome::Throttled
        )
    }
}
