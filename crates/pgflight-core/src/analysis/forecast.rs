//! Linear trend forecasts toward capacity ceilings.
//!
//! A forecast is an ordinary least-squares fit of one metric against time.
//! Too few samples or a poor fit yield [`ForecastOutcome::Undetermined`],
//! never a number.

use serde::Serialize;

use super::{AnalysisError, History, check_window};
use crate::config::Config;
use crate::model::{SampleKind, Snapshot};

/// `age(datfrozenxid)` at which PostgreSQL refuses new transaction ids.
pub const XID_WRAPAROUND_LIMIT: f64 = 2_147_483_647.0;

#[derive(Clone, Copy, Serialize, Debug, PartialEq)]
pub struct LinearFit {
    /// Units per second.
    pub slope: f64,
    /// Value at the first sample.
    pub intercept: f64,
    pub r2: f64,
    pub samples: usize,
}

impl LinearFit {
    /// Fitted value `secs` after the first sample.
    pub fn value_at(&self, secs: f64) -> f64 {
        self.intercept + self.slope * secs
    }
}

/// OLS fit of `(seconds since first point, value)` pairs.
///
/// `None` with fewer than two points or when every point shares one
/// timestamp. A perfectly flat series has `r2 = 1`.
pub fn fit_line(points: &[(i64, f64)]) -> Option<LinearFit> {
    let (&(t0, _), _) = points.split_first()?;
    let n = points.len() as f64;
    if points.len() < 2 {
        return None;
    }
    let xs: Vec<f64> = points.iter().map(|(t, _)| (t - t0) as f64).collect();
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = points.iter().map(|(_, v)| v).sum::<f64>() / n;

    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for (x, (_, y)) in xs.iter().zip(points) {
        sxx += (x - mean_x) * (x - mean_x);
        sxy += (x - mean_x) * (y - mean_y);
    }
    if sxx == 0.0 {
        return None;
    }
    let slope = sxy / sxx;
    let intercept = mean_y - slope * mean_x;

    let mut ss_res = 0.0;
    let mut ss_tot = 0.0;
    for (x, (_, y)) in xs.iter().zip(points) {
        let fitted = intercept + slope * x;
        ss_res += (y - fitted) * (y - fitted);
        ss_tot += (y - mean_y) * (y - mean_y);
    }
    let r2 = if ss_tot == 0.0 { 1.0 } else { 1.0 - ss_res / ss_tot };

    Some(LinearFit {
        slope,
        intercept,
        r2,
        samples: points.len(),
    })
}

#[derive(Clone, Copy, Serialize, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ForecastMetric {
    DatabaseSize,
    XidAge,
    Connections,
    DeadTuples,
}

impl ForecastMetric {
    pub const ALL: [ForecastMetric; 4] = [
        ForecastMetric::DatabaseSize,
        ForecastMetric::XidAge,
        ForecastMetric::Connections,
        ForecastMetric::DeadTuples,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ForecastMetric::DatabaseSize => "database_size",
            ForecastMetric::XidAge => "xid_age",
            ForecastMetric::Connections => "connections",
            ForecastMetric::DeadTuples => "dead_tuples",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_str() == s)
    }

    pub fn value(&self, snapshot: &Snapshot) -> Option<f64> {
        match self {
            ForecastMetric::DatabaseSize => snapshot.counters().map(|c| c.db_size_bytes as f64),
            ForecastMetric::XidAge => snapshot.counters().map(|c| c.xid_age as f64),
            ForecastMetric::Connections => snapshot.counters().map(|c| c.numbackends as f64),
            ForecastMetric::DeadTuples => snapshot
                .has(SampleKind::Tables)
                .then(|| snapshot.tables().iter().map(|t| t.n_dead_tup as f64).sum::<f64>()),
        }
    }

    /// Known capacity limit, if any.
    pub fn ceiling(&self, latest: &Snapshot, config: &Config) -> Option<f64> {
        match self {
            ForecastMetric::DatabaseSize => {
                (config.disk_capacity_bytes > 0).then_some(config.disk_capacity_bytes as f64)
            }
            ForecastMetric::XidAge => Some(XID_WRAPAROUND_LIMIT),
            ForecastMetric::Connections => latest
                .counters()
                .map(|c| c.max_connections)
                .filter(|m| *m > 0)
                .map(|m| m as f64),
            ForecastMetric::DeadTuples => None,
        }
    }
}

#[derive(Clone, Copy, Serialize, Debug, PartialEq)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum Undetermined {
    InsufficientSamples { have: usize, need: usize },
    LowConfidence { r2: f64, need: f64 },
}

#[derive(Clone, Copy, Serialize, Debug, PartialEq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Exhaustion {
    /// Flat or shrinking trend.
    NotPredicted,
    /// The metric has no known ceiling.
    NoCeiling,
    At { seconds: f64, at: i64 },
}

#[derive(Clone, Serialize, Debug, PartialEq)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum ForecastOutcome {
    Undetermined(Undetermined),
    Predicted {
        fit: LinearFit,
        current: f64,
        /// Fitted value at the end of the horizon.
        projected: f64,
        ceiling: Option<f64>,
        exhaustion: Exhaustion,
        /// Exhaustion falls within the configured lead time.
        alert: bool,
    },
}

#[derive(Clone, Serialize, Debug, PartialEq)]
pub struct Forecast {
    pub metric: ForecastMetric,
    pub evaluated_at: i64,
    pub lookback_secs: i64,
    pub horizon_secs: i64,
    pub outcome: ForecastOutcome,
}

impl Forecast {
    pub fn exhaustion(&self) -> Option<Exhaustion> {
        match &self.outcome {
            ForecastOutcome::Predicted { exhaustion, .. } => Some(*exhaustion),
            ForecastOutcome::Undetermined(_) => None,
        }
    }

    pub fn alert(&self) -> bool {
        matches!(self.outcome, ForecastOutcome::Predicted { alert: true, .. })
    }

    /// Soonest exhaustion first, then other predictions, then undetermined.
    fn urgency(&self) -> (u8, f64) {
        match self.exhaustion() {
            Some(Exhaustion::At { seconds, .. }) => (0, seconds),
            Some(_) => (1, 0.0),
            None => (2, 0.0),
        }
    }
}

/// Fits `metric` over the snapshots in `[now - lookback_secs, now]`.
pub fn forecast_metric(
    history: &History,
    config: &Config,
    metric: ForecastMetric,
    now: i64,
    lookback_secs: i64,
    horizon_secs: i64,
) -> Result<Forecast, AnalysisError> {
    check_window(now - lookback_secs, now)?;
    let window = history.in_window(now - lookback_secs, now);
    let points: Vec<(i64, f64)> = window
        .iter()
        .filter_map(|s| metric.value(s).map(|v| (s.captured_at, v)))
        .collect();

    let done = |outcome| Forecast {
        metric,
        evaluated_at: now,
        lookback_secs,
        horizon_secs,
        outcome,
    };
    let need = config.forecast_min_samples;
    if points.len() < need {
        return Ok(done(ForecastOutcome::Undetermined(
            Undetermined::InsufficientSamples {
                have: points.len(),
                need,
            },
        )));
    }
    let Some(fit) = fit_line(&points) else {
        return Ok(done(ForecastOutcome::Undetermined(
            Undetermined::InsufficientSamples {
                have: points.len(),
                need,
            },
        )));
    };
    if fit.r2 < config.forecast_min_r2 {
        return Ok(done(ForecastOutcome::Undetermined(
            Undetermined::LowConfidence {
                r2: fit.r2,
                need: config.forecast_min_r2,
            },
        )));
    }

    let (t0, _) = points[0];
    let (last_at, current) = points[points.len() - 1];
    let projected = fit.value_at((now + horizon_secs - t0) as f64);
    let ceiling = window.last().and_then(|s| metric.ceiling(s, config));

    let exhaustion = match ceiling {
        None => Exhaustion::NoCeiling,
        Some(_) if fit.slope <= 0.0 => Exhaustion::NotPredicted,
        Some(limit) => {
            let seconds = ((limit - current) / fit.slope).max(0.0);
            Exhaustion::At {
                seconds,
                at: last_at + seconds.round() as i64,
            }
        }
    };
    let alert = matches!(exhaustion, Exhaustion::At { seconds, .. }
        if seconds <= config.forecast_lead_time_secs as f64);

    Ok(done(ForecastOutcome::Predicted {
        fit,
        current,
        projected,
        ceiling,
        exhaustion,
        alert,
    }))
}

/// Every metric, most urgent first.
pub fn forecast_all(
    history: &History,
    config: &Config,
    now: i64,
    lookback_secs: i64,
    horizon_secs: i64,
) -> Result<Vec<Forecast>, AnalysisError> {
    let mut out = ForecastMetric::ALL
        .into_iter()
        .map(|m| forecast_metric(history, config, m, now, lookback_secs, horizon_secs))
        .collect::<Result<Vec<_>, _>>()?;
    out.sort_by(|a, b| {
        let (ka, sa) = a.urgency();
        let (kb, sb) = b.urgency();
        ka.cmp(&kb).then(sa.total_cmp(&sb))
    });
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DataBlock, DatabaseCounters};

    fn snap(id: u64, at: i64, xid_age: i64, backends: i64) -> Snapshot {
        let mut s = Snapshot::new(id, at);
        s.blocks.push(DataBlock::Database(DatabaseCounters {
            xid_age,
            numbackends: backends,
            max_connections: 100,
            ..DatabaseCounters::default()
        }));
        s
    }

    fn config() -> Config {
        Config {
            forecast_min_samples: 10,
            forecast_min_r2: 0.7,
            ..Config::default()
        }
    }

    #[test]
    fn fit_recovers_exact_line() {
        let points: Vec<(i64, f64)> = (0..10).map(|i| (100 + i * 60, 5.0 + 2.0 * (i * 60) as f64)).collect();
        let fit = fit_line(&points).unwrap();
        assert!((fit.slope - 2.0).abs() < 1e-9);
        assert!((fit.intercept - 5.0).abs() < 1e-9);
        assert!((fit.r2 - 1.0).abs() < 1e-12);
        assert!(fit_line(&points[..1]).is_none());
        assert!(fit_line(&[(5, 1.0), (5, 2.0)]).is_none());
    }

    #[test]
    fn exhaustion_matches_closed_form() {
        let start = 1_000_000;
        let slope = 50.0;
        let base = 2_142_000_000i64;
        let snaps: Vec<Snapshot> = (0..20)
            .map(|i| {
                let at = start + i * 600;
                snap(i as u64 + 1, at, base + (slope as i64) * (at - start), 10)
            })
            .collect();
        let now = start + 19 * 600;
        let history = History::from_snapshots(snaps);
        let f = forecast_metric(&history, &config(), ForecastMetric::XidAge, now, 86_400, 3_600).unwrap();

        let current = (base + 50 * 19 * 600) as f64;
        let expected = (XID_WRAPAROUND_LIMIT - current) / slope;
        match f.outcome {
            ForecastOutcome::Predicted {
                exhaustion: Exhaustion::At { seconds, at },
                alert,
                ..
            } => {
                assert!((seconds - expected).abs() < 1e-3, "{} vs {}", seconds, expected);
                assert_eq!(at, now + expected.round() as i64);
                // ~27 hours away, inside the 3-day lead time.
                assert!(alert);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn too_few_samples_is_undetermined() {
        let history = History::from_snapshots((0..9).map(|i| snap(i + 1, i as i64 * 60, 100, 10)).collect());
        let f = forecast_metric(&history, &config(), ForecastMetric::XidAge, 600, 3_600, 3_600).unwrap();
        assert_eq!(
            f.outcome,
            ForecastOutcome::Undetermined(Undetermined::InsufficientSamples { have: 9, need: 10 })
        );
        assert!(f.exhaustion().is_none());
    }

    #[test]
    fn noisy_series_is_undetermined() {
        let history = History::from_snapshots(
            (0..12)
                .map(|i| snap(i + 1, i as i64 * 60, if i % 2 == 0 { 100 } else { 5_000 }, 10))
                .collect(),
        );
        let f = forecast_metric(&history, &config(), ForecastMetric::XidAge, 720, 3_600, 3_600).unwrap();
        assert!(matches!(
            f.outcome,
            ForecastOutcome::Undetermined(Undetermined::LowConfidence { .. })
        ));
    }

    #[test]
    fn flat_or_falling_trend_predicts_no_exhaustion() {
        let history = History::from_snapshots((0..12).map(|i| snap(i + 1, i as i64 * 60, 100, 40 - i as i64)).collect());
        let f = forecast_metric(&history, &config(), ForecastMetric::Connections, 720, 3_600, 3_600).unwrap();
        assert_eq!(f.exhaustion(), Some(Exhaustion::NotPredicted));
        let f = forecast_metric(&history, &config(), ForecastMetric::XidAge, 720, 3_600, 3_600).unwrap();
        assert_eq!(f.exhaustion(), Some(Exhaustion::NotPredicted));
        let f = forecast_metric(&history, &config(), ForecastMetric::DatabaseSize, 720, 3_600, 3_600).unwrap();
        assert_eq!(f.exhaustion(), Some(Exhaustion::NoCeiling));
    }

    #[test]
    fn summary_orders_soonest_exhaustion_first() {
        let history = History::from_snapshots(
            (0..12)
                .map(|i| snap(i + 1, i as i64 * 60, 100 + i as i64 * 10, 10 + i as i64 * 5))
                .collect(),
        );
        let all = forecast_all(&history, &config(), 720, 3_600, 3_600).unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].metric, ForecastMetric::Connections);
        assert_eq!(all[1].metric, ForecastMetric::XidAge);
        assert!(matches!(all[3].outcome, ForecastOutcome::Undetermined(_)));
    }

    #[test]
    fn inverted_window_is_rejected() {
        let history = History::default();
        assert!(matches!(
            forecast_metric(&history, &config(), ForecastMetric::XidAge, 100, 0, 10),
            Err(AnalysisError::InvalidWindow { .. })
        ));
    }
}
