//! `RTMetrics` — the aggregate the circuit breaker and rebalancer evaluate
//! their predicates against.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use serde::Serialize;

use super::counter::RollingCounter;
use super::histogram::RollingHistogram;
use super::percentiles::{value_at_quantile_ms, PercentileSet};
use crate::clock::Clock;

/// A point-in-time export of an [`RTMetrics`], for debug/status endpoints
/// embedding this crate might expose (diagnostics ambient
/// concern — this crate itself has none).
#[derive(Debug, Clone, Serialize)]
pub struct RtMetricsSnapshot {
    pub total_count: i64,
    pub network_error_count: i64,
    pub network_error_ratio: f64,
    pub latency: PercentileSet,
}

/// Default rolling-window shape: 10 buckets of 1s each for counters (a 10s
/// window matching the breaker's default `check_period`/`fallbackDuration`
/// scale), and 6 histogram buckets of 10s each (a 60s latency window).
const DEFAULT_COUNTER_BUCKETS: usize = 10;
const DEFAULT_COUNTER_RESOLUTION_MS: u64 = 1_000;
const DEFAULT_HIST_BUCKETS: usize = 6;
const DEFAULT_HIST_PERIOD_MS: u64 = 10_000;
const HIST_LOW_US: u64 = 1;
const HIST_HIGH_US: u64 = 60_000_000;
const HIST_SIGFIGS: u8 = 3;

/// Owns one counter for total requests, one for network errors, a dense
/// `status_code -> counter` map, and one rolling latency histogram.
/// `record()` keeps all four in lockstep.
pub struct RTMetrics {
    total: RollingCounter,
    net_errors: RollingCounter,
    status_codes: Mutex<HashMap<u16, Arc<RollingCounter>>>,
    latency: RollingHistogram,
    clock: Arc<dyn Clock>,
}

impl RTMetrics {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_shape(
            clock,
            DEFAULT_COUNTER_BUCKETS,
            DEFAULT_COUNTER_RESOLUTION_MS,
            DEFAULT_HIST_BUCKETS,
            Duration::from_millis(DEFAULT_HIST_PERIOD_MS),
        )
    }

    pub fn with_shape(
        clock: Arc<dyn Clock>,
        counter_buckets: usize,
        counter_resolution_ms: u64,
        hist_buckets: usize,
        hist_period: Duration,
    ) -> Self {
        Self {
            total: RollingCounter::new(clock.clone(), counter_buckets, counter_resolution_ms),
            net_errors: RollingCounter::new(clock.clone(), counter_buckets, counter_resolution_ms),
            status_codes: Mutex::new(HashMap::new()),
            latency: RollingHistogram::new(
                clock.clone(),
                HIST_LOW_US,
                HIST_HIGH_US,
                HIST_SIGFIGS,
                hist_period,
                hist_buckets,
            ),
            clock,
        }
    }

    /// Record one observation: increments `total`, conditionally
    /// `net_errors`, the matching status-code counter (created lazily), and
    /// the latency histogram, in that order, all under the same call.
    pub fn record(&self, status_code: u16, latency: Duration, is_network_error: bool) {
        self.total.inc(1);
        if is_network_error {
            self.net_errors.inc(1);
        }
        self.status_counter(status_code).inc(1);
        let us = latency.as_micros().min(u128::from(u64::MAX)) as u64;
        self.latency.record(us.max(1));
    }

    fn status_counter(&self, code: u16) -> Arc<RollingCounter> {
        let mut map = self.status_codes.lock();
        map.entry(code)
            .or_insert_with(|| {
                Arc::new(RollingCounter::new(
                    self.clock.clone(),
                    DEFAULT_COUNTER_BUCKETS,
                    DEFAULT_COUNTER_RESOLUTION_MS,
                ))
            })
            .clone()
    }

    pub fn total_count(&self) -> i64 {
        self.total.count()
    }

    pub fn network_error_count(&self) -> i64 {
        self.net_errors.count()
    }

    /// `NetworkErrorRatio()` — empty metrics return 0.
    pub fn network_error_ratio(&self) -> f64 {
        let total = self.total.count();
        if total == 0 {
            0.0
        } else {
            self.net_errors.count() as f64 / total as f64
        }
    }

    /// `LatencyAtQuantileMS(q)` — unknown quantile or empty metric is 0.
    pub fn latency_at_quantile_ms(&self, quantile: f64) -> f64 {
        value_at_quantile_ms(&self.latency.merged(), quantile)
    }

    /// Count of status codes in `[start, end)`.
    fn count_in_range(&self, start: u16, end: u16) -> i64 {
        let map = self.status_codes.lock();
        map.iter()
            .filter(|(code, _)| **code >= start && **code < end)
            .map(|(_, counter)| counter.count())
            .sum()
    }

    /// `ResponseCodeRatio(aStart, aEnd, bStart, bEnd)` — counts codes in
    /// `[aStart, aEnd)` over codes in `[bStart, bEnd)`; 0 when the
    /// denominator is 0.
    pub fn response_code_ratio(&self, a_start: u16, a_end: u16, b_start: u16, b_end: u16) -> f64 {
        let denom = self.count_in_range(b_start, b_end);
        if denom == 0 {
            0.0
        } else {
            self.count_in_range(a_start, a_end) as f64 / denom as f64
        }
    }

    /// Render a [`RtMetricsSnapshot`] as JSON, for ad-hoc logging or a
    /// status endpoint an embedding application exposes.
    pub fn snapshot_json(&self) -> Result<String, serde_json::Error> {
        let snapshot = RtMetricsSnapshot {
            total_count: self.total_count(),
            network_error_count: self.network_error_count(),
            network_error_ratio: self.network_error_ratio(),
            latency: PercentileSet::from_histogram(&self.latency.merged()),
        };
        serde_json::to_string(&snapshot)
    }

    pub fn reset(&self) {
        self.total.reset();
        self.net_errors.reset();
        self.status_codes.lock().clear();
        self.latency.reset();
    }
}
