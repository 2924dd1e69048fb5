//! pgflight-core: PostgreSQL flight recorder library.
//!
//! Provides:
//! - `config`: typed configuration, TOML loading, runtime get/set and hot reload
//! - `source`: read-only statistics source (PostgreSQL client and a scripted mock)
//! - `model`: snapshots, sample rows, collection stats, incidents
//! - `storage`: ring buffers, archive segments, aggregates, retention
//! - `collector`: load governor and single-flight scheduler
//! - `analysis`: storm, regression and anomaly detection, forecasts,
//!   blast radius, time-travel reconstruction
//! - `recorder`: [`FlightRecorder`], the facade over all of the above
//!
//! ```text
//!   StatSource ──► Scheduler ──► Storage ◄── run_maintenance
//!                                  │
//!                                  └──► analysis ──► FlightRecorder
//! ```

pub mod analysis;
pub mod collector;
pub mod config;
pub mod model;
pub mod recorder;
pub mod source;
pub mod storage;

pub use recorder::{FlightRecorder, RecorderError, RecorderStatus};
