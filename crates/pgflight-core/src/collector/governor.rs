//! Load governor: decides, from the cheap probe alone, whether a cycle
//! proceeds, runs with reduced scope, or is skipped.

use std::fmt;

use crate::config::Config;
use crate::model::SampleKind;
use crate::source::LoadSignals;

/// Why a cycle was throttled.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ThrottleReason {
    ConnectionRatio(f64),
    TxnRate(f64),
    BlockIoRate(f64),
    /// Breaker opened after repeated lock timeouts; cycles left in cooldown.
    Breaker(u32),
}

impl fmt::Display for ThrottleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThrottleReason::ConnectionRatio(r) => write!(f, "connection ratio {:.2}", r),
            ThrottleReason::TxnRate(r) => write!(f, "txn rate {:.0}/s", r),
            ThrottleReason::BlockIoRate(r) => write!(f, "block io rate {:.0}/s", r),
            ThrottleReason::Breaker(left) => write!(f, "lock-timeout breaker open ({} cycles left)", left),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Decision {
    Proceed,
    Throttle(ThrottleReason),
    /// Connection ratio above the shed threshold: no catalog query at all.
    Shed { connection_ratio: f64 },
}

impl Decision {
    /// Sample kinds to read under this decision. Empty when shed.
    pub fn scope(&self) -> &'static [SampleKind] {
        match self {
            Decision::Proceed => &SampleKind::ALL,
            Decision::Throttle(_) => &SampleKind::REDUCED,
            Decision::Shed { .. } => &[],
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Proceed => f.write_str("proceed"),
            Decision::Throttle(reason) => write!(f, "throttle: {}", reason),
            Decision::Shed { connection_ratio } => {
                write!(f, "shed: connection ratio {:.2}", connection_ratio)
            }
        }
    }
}

/// Rates derived from two consecutive probes.
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct LoadRates {
    pub txn_per_sec: f64,
    pub blocks_per_sec: f64,
}

#[derive(Debug, Default)]
pub struct LoadGovernor {
    prev: Option<(i64, LoadSignals)>,
    consecutive_lock_timeouts: u32,
    cooldown_left: u32,
}

impl LoadGovernor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-second rates against the previous probe. `None` on the first
    /// probe, on a non-advancing clock or after a stats reset.
    fn rates(&self, now: i64, signals: &LoadSignals) -> Option<LoadRates> {
        let (prev_at, prev) = self.prev.as_ref()?;
        let dt = (now - prev_at) as f64;
        if dt <= 0.0
            || signals.xact_total < prev.xact_total
            || signals.blocks_read_total < prev.blocks_read_total
        {
            return None;
        }
        Some(LoadRates {
            txn_per_sec: (signals.xact_total - prev.xact_total) as f64 / dt,
            blocks_per_sec: (signals.blocks_read_total - prev.blocks_read_total) as f64 / dt,
        })
    }

    /// Evaluates one probe and remembers it for the next rate computation.
    pub fn evaluate(&mut self, config: &Config, now: i64, signals: &LoadSignals) -> Decision {
        let ratio = signals.connection_ratio();
        let rates = self.rates(now, signals);
        self.prev = Some((now, signals.clone()));

        if ratio > config.shed_connection_ratio {
            return Decision::Shed {
                connection_ratio: ratio,
            };
        }
        if self.cooldown_left > 0 {
            let left = self.cooldown_left;
            self.cooldown_left -= 1;
            return Decision::Throttle(ThrottleReason::Breaker(left));
        }
        if ratio > config.throttle_connection_ratio {
            return Decision::Throttle(ThrottleReason::ConnectionRatio(ratio));
        }
        if let Some(rates) = rates {
            if rates.txn_per_sec > config.max_txn_rate {
                return Decision::Throttle(ThrottleReason::TxnRate(rates.txn_per_sec));
            }
            if rates.blocks_per_sec > config.max_block_io_rate {
                return Decision::Throttle(ThrottleReason::BlockIoRate(rates.blocks_per_sec));
            }
        }
        Decision::Proceed
    }

    /// Feeds back whether the finished cycle hit a lock timeout.
    /// Returns `true` when this report opened the breaker.
    pub fn record_cycle(&mut self, config: &Config, hit_lock_timeout: bool) -> bool {
        if !hit_lock_timeout {
            self.consecutive_lock_timeouts = 0;
            return false;
        }
        self.consecutive_lock_timeouts += 1;
        if self.consecutive_lock_timeouts >= config.breaker_failure_threshold {
            self.consecutive_lock_timeouts = 0;
            self.cooldown_left = config.breaker_cooldown_cycles;
            return true;
        }
        false
    }

    pub fn breaker_open(&self) -> bool {
        self.cooldown_left > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signals(active: i64, xact: i64, blocks: i64) -> LoadSignals {
        LoadSignals {
            active_connections: active,
            max_connections: 100,
            xact_total: xact,
            blocks_read_total: blocks,
        }
    }

    #[test]
    fn shed_above_threshold_throttle_between() {
        let config = Config::default();
        let mut gov = LoadGovernor::new();
        assert!(matches!(
            gov.evaluate(&config, 0, &signals(85, 0, 0)),
            Decision::Shed { .. }
        ));
        assert!(matches!(
            gov.evaluate(&config, 180, &signals(60, 0, 0)),
            Decision::Throttle(ThrottleReason::ConnectionRatio(_))
        ));
        assert_eq!(gov.evaluate(&config, 360, &signals(10, 0, 0)), Decision::Proceed);
        // Exactly at the threshold is not above it.
        assert!(!matches!(
            gov.evaluate(&config, 540, &signals(70, 0, 0)),
            Decision::Shed { .. }
        ));
    }

    #[test]
    fn rate_ceilings_throttle() {
        let config = Config::default();
        let mut gov = LoadGovernor::new();
        assert_eq!(gov.evaluate(&config, 0, &signals(10, 0, 0)), Decision::Proceed);
        assert!(matches!(
            gov.evaluate(&config, 10, &signals(10, 20_000, 0)),
            Decision::Throttle(ThrottleReason::TxnRate(r)) if r == 2000.0
        ));
        assert!(matches!(
            gov.evaluate(&config, 20, &signals(10, 20_000, 200_000)),
            Decision::Throttle(ThrottleReason::BlockIoRate(_))
        ));
        // Stats reset: no rate, no throttle.
        assert_eq!(gov.evaluate(&config, 30, &signals(10, 5, 5)), Decision::Proceed);
    }

    #[test]
    fn breaker_opens_after_repeated_lock_timeouts() {
        let config = Config {
            breaker_failure_threshold: 2,
            breaker_cooldown_cycles: 2,
            ..Config::default()
        };
        let mut gov = LoadGovernor::new();
        assert!(!gov.record_cycle(&config, true));
        assert!(!gov.record_cycle(&config, false));
        assert!(!gov.record_cycle(&config, true));
        assert!(gov.record_cycle(&config, true));
        assert!(gov.breaker_open());

        let quiet = signals(1, 0, 0);
        assert!(matches!(
            gov.evaluate(&config, 0, &quiet),
            Decision::Throttle(ThrottleReason::Breaker(2))
        ));
        assert!(matches!(
            gov.evaluate(&config, 1, &quiet),
            Decision::Throttle(ThrottleReason::Breaker(1))
        ));
        assert_eq!(gov.evaluate(&config, 2, &quiet), Decision::Proceed);
    }

    #[test]
    fn scope_matches_decision() {
        assert_eq!(Decision::Proceed.scope().len(), SampleKind::ALL.len());
        assert_eq!(
            Decision::Throttle(ThrottleReason::TxnRate(1.0)).scope(),
            &SampleKind::REDUCED
        );
        assert!(Decision::Shed { connection_ratio: 0.9 }.scope().is_empty());
    }
}
