//! Backend health meters: a rating in `[0,1]` — higher is
//! worse — derived from recent latency and error rate over a rolling
//! window, reusing the same rolling-metrics substrate the circuit breaker
//! uses.

use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::metrics::RTMetrics;

/// A backend's recent-performance signal. `rating()` close to 0 means
/// healthy, close to 1 means consistently erroring or slow.
pub trait Meter: Send + Sync {
    fn rating(&self) -> f64;
    fn is_ready(&self) -> bool;
    fn record(&self, status_code: u16, latency: Duration, is_network_error: bool);
}

/// Threshold (in ms) above which latency alone saturates the latency term
/// of [`RtMeter::rating`] — an unremarkable backend responding consistently
/// above this is treated as "as bad as a pure error backend".
const LATENCY_SATURATION_MS: f64 = 2000.0;

/// Minimum sample count before a meter is considered warmed up; below this
/// `is_ready()` is false and the rebalancer should not act on it yet.
const MIN_SAMPLES_READY: i64 = 5;

/// The default [`Meter`]: wraps an [`RTMetrics`] and blends network-error
/// ratio with normalized p95 latency.
pub struct RtMeter {
    metrics: RTMetrics,
}

impl RtMeter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            metrics: RTMetrics::new(clock),
        }
    }
}

impl Meter for RtMeter {
    fn rating(&self) -> f64 {
        let error_term = self.metrics.network_error_ratio();
        let p95_ms = self.metrics.latency_at_quantile_ms(95.0);
        let latency_term = (p95_ms / LATENCY_SATURATION_MS).min(1.0);
        (0.7 * error_term + 0.3 * latency_term).clamp(0.0, 1.0)
    }

    fn is_ready(&self) -> bool {
        self.metrics.total_count() >= MIN_SAMPLES_READY
    }

    fn record(&self, status_code: u16, latency: Duration, is_network_error: bool) {
        self.metrics.record(status_code, latency, is_network_error);
    }
}

/// A meter fixed to a constant rating, useful for tests that want to drive
/// the rebalancer's weight machine directly without feeding it samples.
pub struct FixedMeter {
    rating: std::sync::atomic::AtomicU64,
    ready: std::sync::atomic::AtomicBool,
}

impl FixedMeter {
    pub fn new(rating: f64) -> Self {
        Self {
            rating: std::sync::atomic::AtomicU64::new(rating.to_bits()),
            ready: std::sync::atomic::AtomicBool::new(true),
        }
    }

    pub fn set(&self, rating: f64) {
        self.rating
            .store(rating.to_bits(), std::sync::atomic::Ordering::SeqCst);
    }
}

impl Meter for FixedMeter {
    fn rating(&self) -> f64 {
        f64::from_bits(self.rating.load(std::sync::atomic::Ordering::SeqCst))
    }

    fn is_ready(&self) -> bool {
        self.ready.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn record(&self, _status_code: u16, _latency: Duration, _is_network_error: bool) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FrozenClock;

    #[test]
    fn healthy_backend_rates_low() {
        let meter = RtMeter::new(FrozenClock::new());
        for _ in 0..10 {
            meter.record(200, Duration::from_millis(5), false);
        }
        assert!(meter.rating() < 0.2);
    }

    #[test]
    fn erroring_backend_rates_high() {
        let meter = RtMeter::new(FrozenClock::new());
        for _ in 0..10 {
            meter.record(502, Duration::from_millis(5), true);
        }
        assert!(meter.rating() > 0.6);
    }

    #[test]
    fn fixed_meter_is_settable() {
        let meter = FixedMeter::new(0.1);
        assert!((meter.rating() - 0.1).abs() < 1e-9);
        meter.set(0.9);
        assert!((meter.rating() - 0.9).abs() < 1e-9);
    }
}
