//! pgflightd - PostgreSQL flight recorder daemon.
//!
//! Samples the server's statistics views on a governed schedule, keeps the
//! recent history in ring buffers backed by an append-only archive, and runs
//! aggregation, retention and the detectors once an hour.

use tikv_jemallocator::Jemalloc;
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

/// Returns unused jemalloc pages to the operating system.
fn release_memory_to_os() {
    // SAFETY: mallctl is called with a valid NUL-terminated name and no
    // in/out buffers, which is the documented form for purge commands.
    unsafe {
        tikv_jemalloc_sys::mallctl(
            c"arena.0.purge".as_ptr().cast(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            0,
        );
    }
}

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{Timelike, Utc};
use clap::Parser;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use pgflight_core::FlightRecorder;
use pgflight_core::collector::CycleReport;
use pgflight_core::config::{Config, ConfigStore};
use pgflight_core::recorder::{DEFAULT_BASELINE_DAYS, DEFAULT_LOOKBACK_SECS};
use pgflight_core::source::{PgStatSource, StatSource};

/// PostgreSQL flight recorder daemon.
#[derive(Parser)]
#[command(name = "pgflightd", about = "PostgreSQL flight recorder daemon", version)]
struct Args {
    /// TOML config file. Reloaded when it changes on disk.
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Directory for archive segments, aggregates and incidents.
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,

    /// Run a single collection cycle, flush and exit.
    #[arg(long)]
    once: bool,
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for target in ["pgflightd", "pgflight_core"] {
        match format!("{}={}", target, level).parse() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(e) => eprintln!("invalid log directive for {}: {}", target, e),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// One-line summary of a finished cycle for the log.
fn describe_cycle(report: &CycleReport) -> String {
    let mut parts = vec![report.outcome.to_string()];
    if let Some(id) = report.snapshot_id {
        parts.push(format!("snapshot #{}", id));
    }
    if !report.kinds_collected.is_empty() {
        parts.push(format!("{} kinds", report.kinds_collected.len()));
    }
    if !report.failures.is_empty() {
        let failed: Vec<String> = report
            .failures
            .iter()
            .map(|(kind, _)| kind.to_string())
            .collect();
        parts.push(format!("failed: {}", failed.join(", ")));
    }
    if let Some(detail) = &report.detail {
        parts.push(detail.clone());
    }
    parts.push(format!("{}ms", report.duration_ms));
    parts.join(", ")
}

fn log_cycle(report: &CycleReport) {
    let description = describe_cycle(report);
    if report.failures.is_empty() {
        info!("Cycle: {}", description);
    } else {
        warn!("Cycle: {}", description);
    }
}

/// Aggregation, retention, then the periodic detection pass.
fn hourly_pass<S: StatSource>(recorder: &FlightRecorder<S>) {
    match recorder.run_maintenance() {
        Ok(report) => {
            info!(
                buckets = report.buckets_aggregated,
                archive_files_removed = report.archive.files_removed,
                sealed = report.segments_sealed,
                yielded = report.yielded,
                duration_ms = report.duration_ms,
                "maintenance pass finished"
            );
            release_memory_to_os();
            debug!("Memory released after maintenance");
        }
        Err(e) => error!("Maintenance failed: {}", e),
    }

    match recorder.detect_storms(DEFAULT_LOOKBACK_SECS, DEFAULT_BASELINE_DAYS) {
        Ok(report) => {
            for storm in &report.storms {
                warn!(
                    id = storm.id,
                    queryid = storm.queryid,
                    class = %storm.class,
                    severity = %storm.severity,
                    multiplier = storm.multiplier,
                    "query storm open"
                );
            }
        }
        Err(e) => warn!("Storm detection failed: {}", e),
    }
    match recorder.detect_regressions(DEFAULT_LOOKBACK_SECS, DEFAULT_BASELINE_DAYS, None) {
        Ok(report) => {
            for r in &report.regressions {
                warn!(
                    id = r.id,
                    queryid = r.queryid,
                    severity = %r.severity,
                    change_pct = r.change_pct,
                    "query regression open"
                );
            }
        }
        Err(e) => warn!("Regression detection failed: {}", e),
    }
    match recorder.forecast_summary(7 * 86_400, 30 * 86_400) {
        Ok(forecasts) => {
            for f in forecasts.iter().filter(|f| f.alert()) {
                warn!(metric = f.metric.as_str(), exhaustion = ?f.exhaustion(), "capacity forecast alert");
            }
        }
        Err(e) => warn!("Forecast failed: {}", e),
    }
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    info!("pgflightd {} starting", env!("CARGO_PKG_VERSION"));

    let config = match &args.config {
        Some(path) => match ConfigStore::open(path) {
            Ok(store) => {
                info!("Config loaded from {}", path.display());
                store
            }
            Err(e) => {
                error!("Failed to load config {}: {}", path.display(), e);
                std::process::exit(2);
            }
        },
        None => ConfigStore::new(Config::default()),
    };
    let config = Arc::new(config);
    {
        let c = config.snapshot();
        info!(
            "Config: mode={}, interval={}s, ring_capacity={}, data={}",
            c.mode.as_str(),
            c.interval_secs(),
            c.ring_capacity,
            args.data_dir.display()
        );
    }

    let source = match PgStatSource::from_env() {
        Ok(mut source) => {
            match source.try_connect() {
                Ok(()) => info!("PostgreSQL: connected"),
                Err(e) => {
                    warn!("PostgreSQL: connection failed ({}), will retry every cycle", e);
                    print_pg_warning(&e.to_string());
                }
            }
            source
        }
        Err(e) => {
            error!("PostgreSQL: {}", e);
            print_pg_warning(&e.to_string());
            std::process::exit(2);
        }
    };

    let recorder = match FlightRecorder::open(source, config, &args.data_dir) {
        Ok(r) => r,
        Err(e) => {
            error!("Failed to open storage at {}: {}", args.data_dir.display(), e);
            std::process::exit(1);
        }
    };

    if args.once {
        log_cycle(&recorder.trigger_collection());
        if let Err(e) = recorder.shutdown() {
            error!("Failed to flush on shutdown: {}", e);
            std::process::exit(1);
        }
        return;
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
    }) {
        warn!("Failed to set Ctrl-C handler: {}", e);
    }

    let mut last_pass_hour: Option<u32> = None;
    info!("Starting collection loop");

    while running.load(Ordering::SeqCst) {
        match recorder.reload_config() {
            Ok(true) => info!("Config reloaded"),
            Ok(false) => {}
            Err(e) => warn!("Config reload rejected, keeping previous values: {}", e),
        }

        log_cycle(&recorder.trigger_collection());
        let status = recorder.status();
        if status.storage_alarm {
            error!(
                failing_cycles = status.storage_failure_cycles,
                archive_pending = status.archive_pending,
                "storage alarm active"
            );
        }

        let current_hour = Utc::now().hour();
        if last_pass_hour != Some(current_hour) {
            last_pass_hour = Some(current_hour);
            hourly_pass(&recorder);
        }

        // Sleep with periodic checks for shutdown and collection requests.
        let sleep_interval = Duration::from_millis(100);
        let mut remaining = recorder.next_delay();
        while remaining > Duration::ZERO && running.load(Ordering::SeqCst) {
            if recorder.take_request() {
                break;
            }
            let sleep_time = remaining.min(sleep_interval);
            std::thread::sleep(sleep_time);
            remaining = remaining.saturating_sub(sleep_time);
        }
    }

    info!("Shutting down...");
    match recorder.shutdown() {
        Ok(flushed) => info!("Flushed {} ring entries to the archive", flushed),
        Err(e) => error!("Failed to flush on shutdown: {}", e),
    }
    info!("Shutdown complete");
}

/// Prints a colored PostgreSQL warning with configuration hints.
fn print_pg_warning(error: &str) {
    const RED: &str = "\x1b[1;31m";
    const YELLOW: &str = "\x1b[33m";
    const RESET: &str = "\x1b[0m";

    eprintln!("{RED}PostgreSQL: {error}{RESET}");
    eprintln!();
    eprintln!("{YELLOW}  Configure connection with environment variables:");
    eprintln!("    export PGHOST=localhost");
    eprintln!("    export PGPORT=5432");
    eprintln!("    export PGUSER=postgres");
    eprintln!("    export PGPASSWORD=secret");
    eprintln!("    export PGDATABASE=postgres{RESET}");
}

#[cfg(test)]
mod tests {
    use super::describe_cycle;
    use pgflight_core::collector::CycleReport;
    use pgflight_core::model::{CollectionOutcome, SampleKind};

    #[test]
    fn describe_cycle_lists_outcome_and_failures() {
        let report = CycleReport {
            started_at: 0,
            snapshot_id: Some(7),
            outcome: CollectionOutcome::Partial,
            decision: None,
            kinds_collected: vec![SampleKind::Database, SampleKind::Activity],
            failures: vec![(SampleKind::Locks, "lock timeout".into())],
            storage_failures: 0,
            duration_ms: 12,
            detail: None,
        };
        let desc = describe_cycle(&report);
        assert!(desc.starts_with("partial"));
        assert!(desc.contains("snapshot #7"));
        assert!(desc.contains("2 kinds"));
        assert!(desc.contains("failed: locks"));
        assert!(desc.ends_with("12ms"));
    }
}
