//! Data model for the flight recorder.
//!
//! - [`Snapshot`]: one collection event, made of typed [`DataBlock`]s
//! - sample rows ([`samples`]): identical in ring and archive
//! - [`CollectionStat`]: one row per collection attempt
//! - incidents ([`incident`]): storms, regressions, anomaly findings

pub mod collection;
pub mod incident;
pub mod samples;
pub mod snapshot;

#[allow(unused_imports)]
pub use collection::{CollectionOutcome, CollectionStat, StatScope};
#[allow(unused_imports)]
pub use incident::{
    CheckpointSignal, CorrelationSnapshot, CostMetric, Finding, IoSignal, LockSignal,
    ProbableCause, QueryRegression, QueryStorm, Severity, StormClass, VacuumSignal,
};
#[allow(unused_imports)]
pub use samples::{
    ActivitySample, DatabaseCounters, IoSample, LockSample, ReplicationSample, SettingSample,
    StatementSample, TableSnapshot, WaitSample,
};
#[allow(unused_imports)]
pub use snapshot::{DataBlock, SampleKind, Snapshot, changed_settings, settings_fingerprint};
