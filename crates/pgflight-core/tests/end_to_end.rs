//! Recorder scenarios driven through the public facade with a scripted
//! statistics source and deterministic capture times.

use std::sync::Arc;

use pgflight_core::FlightRecorder;
use pgflight_core::analysis::{
    Exhaustion, ForecastMetric, ForecastOutcome, Reconstruction, TimelineEventKind, Undetermined,
};
use pgflight_core::collector::Decision;
use pgflight_core::config::{Config, ConfigStore};
use pgflight_core::model::{CollectionOutcome, SampleKind, Severity, StormClass};
use pgflight_core::source::SourceError;
use pgflight_core::source::mock::{MockStatSource, session};
use tempfile::{TempDir, tempdir};

const NOW: i64 = 1_700_000_000;
const DAY: i64 = 86_400;

fn test_config() -> Config {
    Config {
        archive_fsync: false,
        jitter_max_secs: 0,
        retention_budget_ms: 60_000,
        ..Config::default()
    }
}

fn recorder(config: Config) -> (TempDir, FlightRecorder<MockStatSource>, MockStatSource) {
    let dir = tempdir().unwrap();
    let mock = MockStatSource::healthy();
    let rec = FlightRecorder::open(mock.clone(), Arc::new(ConfigStore::new(config)), dir.path())
        .unwrap();
    (dir, rec, mock)
}

#[test]
fn thousand_cycles_shed_exactly_the_overloaded_ones() {
    let (_dir, rec, mock) = recorder(test_config());
    assert_eq!(rec.status().ring_capacity, 120);
    let overloaded = [100, 500, 900];

    let mut silent = 0;
    let mut full = 0;
    for i in 0..1000 {
        if overloaded.contains(&i) {
            mock.set_connections(85, 100);
        } else {
            mock.set_connections(10, 100);
        }
        let before = mock.catalog_queries();
        let report = rec.run_cycle_at(NOW + i * 180);
        let issued = mock.catalog_queries() - before;

        if issued == 0 {
            silent += 1;
            assert_eq!(report.outcome, CollectionOutcome::Skipped);
            assert!(matches!(report.decision, Some(Decision::Shed { .. })));
        }
        if report.decision == Some(Decision::Proceed)
            && report.kinds_collected.len() == SampleKind::ALL.len()
        {
            full += 1;
            assert_eq!(issued, SampleKind::ALL.len() as u64);
        }
    }
    assert_eq!(silent, 3);
    assert_eq!(full, 997);

    let status = rec.status();
    assert_eq!(status.cycles, 1000);
    assert!(status.ring_fill.values().all(|n| *n == 120));
    assert_eq!(status.last_snapshot_id, Some(997));
}

#[test]
fn sixty_fold_execution_spike_is_a_critical_storm() {
    let (_dir, rec, mock) = recorder(test_config());
    // One cycle every 360s: 1 call per sample is 10/hour, 60 per sample is 600/hour.
    let mut at = NOW - DAY - 3_600;
    while at <= NOW {
        let bump = if at > NOW - 3_600 { 60 } else { 1 };
        mock.update_statements(|s| s[0].calls += bump);
        rec.run_cycle_at(at);
        at += 360;
    }

    let report = rec.detect_storms_at(NOW, 3_600, 1).unwrap();
    assert_eq!(report.storms.len(), 1);
    let storm = &report.storms[0];
    assert_eq!(storm.queryid, 1001);
    assert!((storm.baseline_count - 10.0).abs() < 1e-9);
    assert_eq!(storm.recent_count, 600.0);
    assert!((storm.multiplier - 60.0).abs() < 1e-9);
    assert_eq!(storm.class, StormClass::Spike);
    assert_eq!(storm.severity, Severity::Critical);
    assert!(storm.is_open());

    assert!(rec.resolve_storm(storm.id, Some("deploy rolled back".into())).unwrap());
    assert!(!rec.storage().incidents().storms()[0].is_open());

    let timeline = rec.incident_timeline(NOW - 3_600, NOW).unwrap();
    assert!(timeline.iter().any(|e| e.kind == TimelineEventKind::StormDetected));
}

#[test]
fn buffer_regression_is_tracked_until_resolved() {
    let (_dir, rec, mock) = recorder(test_config());
    // 20 calls of query 1001 per cycle at `hits` shared hits per call.
    let cycle = |at: i64, hits: i64| {
        mock.update_statements(|s| {
            s[0].calls += 20;
            s[0].shared_blks_hit += 20 * hits;
        });
        rec.run_cycle_at(at);
    };

    let mut at = NOW - DAY - 3_600;
    while at <= NOW {
        cycle(at, if at > NOW - 3_600 { 70 } else { 10 });
        at += 360;
    }
    let report = rec.detect_regressions_at(NOW, 3_600, 1, None).unwrap();
    assert_eq!(report.regressions.len(), 1);
    let first = &report.regressions[0];
    assert_eq!(first.queryid, 1001);
    assert!((first.baseline_avg - 10.0).abs() < 1e-9);
    assert!((first.current_avg - 70.0).abs() < 1e-9);
    assert!((first.change_pct - 600.0).abs() < 1e-6);
    assert_eq!(first.severity, Severity::High);
    let first_id = first.id;

    // Still regressed one cycle later: same incident, refreshed.
    cycle(NOW + 360, 70);
    let report = rec.detect_regressions_at(NOW + 360, 3_600, 1, None).unwrap();
    assert_eq!(report.regressions.len(), 1);
    assert_eq!(report.regressions[0].id, first_id);
    assert_eq!(report.regressions[0].last_seen_at, NOW + 360);
    assert_eq!(rec.storage().incidents().regressions().len(), 1);

    // Cost back to baseline for over an hour.
    let mut at = NOW + 720;
    while at <= NOW + 720 + 3_600 {
        cycle(at, 10);
        at += 360;
    }
    let quiet = at - 360;
    for i in 0..3 {
        let report = rec.detect_regressions_at(quiet + i, 3_600, 1, None).unwrap();
        assert!(report.regressions.is_empty());
        if i < 2 {
            assert!(report.auto_resolved.is_empty());
        } else {
            assert_eq!(report.auto_resolved, vec![first_id]);
        }
    }
    assert!(!rec.storage().incidents().regressions()[0].is_open());
    assert!(!rec.resolve_regression(first_id, None).unwrap());

    // A fresh regression opens a new incident that the operator closes.
    let mut at = quiet + 360;
    let spike_end = at + 3_600;
    while at <= spike_end {
        cycle(at, 70);
        at += 360;
    }
    let report = rec.detect_regressions_at(spike_end, 3_600, 1, None).unwrap();
    assert_eq!(report.regressions.len(), 1);
    let second_id = report.regressions[0].id;
    assert_ne!(second_id, first_id);

    assert!(rec.resolve_regression(second_id, Some("index restored".into())).unwrap());
    assert!(!rec.resolve_regression(second_id, None).unwrap());
    assert!(rec.storage().incidents().regressions().iter().all(|r| !r.is_open()));
}

#[test]
fn failed_activity_read_keeps_session_anomalies_visible() {
    let (_dir, rec, mock) = recorder(test_config());
    let mut idle = session(4242, "idle in transaction", "billing", "client backend");
    idle.xact_start = NOW - 3_600;
    mock.set_activity(vec![idle]);
    rec.run_cycle_at(NOW);

    mock.fail(SampleKind::Activity, SourceError::LockTimeout("canceling statement".into()));
    let report = rec.run_cycle_at(NOW + 180);
    assert_eq!(report.outcome, CollectionOutcome::Partial);

    let anomalies = rec.anomaly_report_at(NOW + 180, 3_600, false).unwrap();
    let idle_finding = anomalies
        .findings
        .iter()
        .find(|f| f.rule_id == "idle_in_transaction")
        .unwrap();
    assert_eq!(idle_finding.entity.as_deref(), Some("4242"));
    assert_eq!(idle_finding.value, 3_600.0);
}

#[test]
fn retention_drops_archive_rows_past_seven_days() {
    let (_dir, rec, _mock) = recorder(test_config());
    rec.run_cycle_at(NOW - 10 * DAY);
    rec.run_cycle_at(NOW - DAY);
    rec.shutdown().unwrap();

    let report = rec.run_maintenance_at(NOW).unwrap();
    assert!(!report.yielded);
    assert!(report.archive.files_removed > 0);

    let storage = rec.storage();
    assert!(storage.snapshots_between(NOW - 11 * DAY, NOW - 9 * DAY).unwrap().is_empty());
    let kept = storage.snapshots_between(NOW - 2 * DAY, NOW).unwrap();
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].captured_at, NOW - DAY);
}

#[test]
fn shed_cycles_appear_on_the_timeline() {
    let (_dir, rec, mock) = recorder(test_config());
    rec.run_cycle_at(NOW);
    mock.set_connections(85, 100);
    rec.run_cycle_at(NOW + 180);

    let timeline = rec.incident_timeline(NOW - 60, NOW + 600).unwrap();
    let skipped: Vec<_> = timeline
        .iter()
        .filter(|e| e.kind == TimelineEventKind::CollectionSkipped)
        .collect();
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0].at, NOW + 180);
}

#[test]
fn linear_growth_forecasts_closed_form_exhaustion() {
    let gib = 1024 * 1024 * 1024;
    let (_dir, rec, mock) = recorder(Config {
        disk_capacity_bytes: 10 * gib as u64,
        ..test_config()
    });
    let start = NOW - 24 * 360;
    for i in 0..=24 {
        let at = start + i * 360;
        mock.update_counters(|c| c.db_size_bytes = gib + 1_000 * (at - start));
        rec.run_cycle_at(at);
    }

    let forecast = rec
        .forecast_at(NOW, ForecastMetric::DatabaseSize, DAY, 7 * DAY)
        .unwrap();
    let ForecastOutcome::Predicted { fit, current, .. } = forecast.outcome else {
        panic!("expected a prediction, got {:?}", forecast.outcome);
    };
    assert!((fit.slope - 1_000.0).abs() < 1e-3);
    assert!(fit.r2 > 0.999);

    let expected = (10.0 * gib as f64 - current) / 1_000.0;
    match forecast.exhaustion() {
        Some(Exhaustion::At { seconds, at }) => {
            assert!((seconds - expected).abs() < 1.0);
            assert_eq!(at, NOW + seconds.round() as i64);
        }
        other => panic!("unexpected exhaustion {:?}", other),
    }
    // Months away: beyond the three-day lead time.
    assert!(!forecast.alert());
}

#[test]
fn too_few_samples_is_undetermined() {
    let (_dir, rec, _mock) = recorder(test_config());
    for i in 0..3 {
        rec.run_cycle_at(NOW - 1_000 + i * 180);
    }
    let forecast = rec
        .forecast_at(NOW, ForecastMetric::XidAge, DAY, DAY)
        .unwrap();
    assert_eq!(
        forecast.outcome,
        ForecastOutcome::Undetermined(Undetermined::InsufficientSamples { have: 3, need: 10 })
    );
    assert!(forecast.exhaustion().is_none());

    let summary = rec.forecast_summary_at(NOW, DAY, DAY).unwrap();
    assert_eq!(summary.len(), ForecastMetric::ALL.len());
}

#[test]
fn what_happened_at_interpolates_between_snapshots() {
    let (_dir, rec, mock) = recorder(test_config());
    mock.update_counters(|c| c.numbackends = 10);
    rec.run_cycle_at(NOW);
    mock.update_counters(|c| c.numbackends = 20);
    rec.run_cycle_at(NOW + 180);

    match rec.what_happened_at(NOW + 90).unwrap() {
        Reconstruction::Interpolated { metrics, .. } => {
            assert_eq!(metrics["connections"], 15.0);
        }
        other => panic!("unexpected {:?}", other),
    }
    match rec.what_happened_at(NOW).unwrap() {
        Reconstruction::Exact { snapshot } => {
            assert_eq!(snapshot.captured_at, NOW);
            assert_eq!(snapshot.counters().map(|c| c.numbackends), Some(10));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn config_changes_apply_without_restart() {
    let (_dir, rec, _mock) = recorder(test_config());
    rec.config_set("ring_capacity", "72").unwrap();
    assert_eq!(rec.status().ring_capacity, 72);
    assert!(rec.config_set("ring_capacity", "10").is_err());
    assert_eq!(rec.config_get("ring_capacity").unwrap(), "72");

    rec.config_set("regression_metric", "time").unwrap();
    assert_eq!(rec.config_get("regression_metric").unwrap(), "time");
}
