//! Sampling scheduler and its load governor.
//!
//! ```text
//!   tick ─► Scheduler::run_cycle_at (single-flight)
//!              │
//!              ├─ StatSource::load_signals   (cheap probe, never gated)
//!              ├─ LoadGovernor::evaluate     ─► Shed │ Throttle │ Proceed
//!              ├─ StatSource::begin_cycle    (lock_timeout, statement_timeout, snapshot)
//!              ├─ per kind: read ─► Storage::write_block ─► CollectionStat
//!              └─ StatSource::end_cycle, cycle CollectionStat
//! ```

pub mod governor;
pub mod scheduler;

pub use governor::{Decision, LoadGovernor, LoadRates, ThrottleReason};
pub use scheduler::{CycleReport, Scheduler, SchedulerStatus};
