//! `RollingHistogram` — a sliding window of HDR histograms that rotates
//! its write bucket every `period`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use hdrhistogram::Histogram;
use parking_lot::Mutex;

use crate::clock::Clock;

struct Inner {
    buckets: Vec<Histogram<u64>>,
    /// Index of the bucket currently receiving writes.
    write_idx: usize,
    last_roll: Instant,
}

/// A sequence of `buckets` HDR histograms rotating every `period`. The
/// current write bucket is advanced (and zeroed) when
/// `now - last_roll >= period`. `merged()` sums every bucket on demand, so
/// callers only pay the merge cost when they actually read quantiles.
pub struct RollingHistogram {
    clock: Arc<dyn Clock>,
    period: Duration,
    low: u64,
    high: u64,
    sigfigs: u8,
    inner: Mutex<Inner>,
}

impl RollingHistogram {
    pub fn new(
        clock: Arc<dyn Clock>,
        low: u64,
        high: u64,
        sigfigs: u8,
        period: Duration,
        buckets: usize,
    ) -> Self {
        assert!(buckets > 0, "buckets must be > 0");
        let make = || Histogram::<u64>::new_with_bounds(low, high, sigfigs).expect("valid bounds");
        let now = clock.now();
        Self {
            clock,
            period,
            low,
            high,
            sigfigs,
            inner: Mutex::new(Inner {
                buckets: (0..buckets).map(|_| make()).collect(),
                write_idx: 0,
                last_roll: now,
            }),
        }
    }

    fn fresh(&self) -> Histogram<u64> {
        Histogram::<u64>::new_with_bounds(self.low, self.high, self.sigfigs).expect("valid bounds")
    }

    /// Rotate to the next bucket (zeroing it) if `period` has elapsed since
    /// the last roll. May rotate through several buckets at once if more
    /// than one `period` has passed, clearing each in turn so stale data
    /// never lingers.
    fn maybe_roll(&self, inner: &mut Inner, now: Instant) {
        if self.period.is_zero() {
            return;
        }
        let n = inner.buckets.len();
        while now.saturating_duration_since(inner.last_roll) >= self.period {
            inner.write_idx = (inner.write_idx + 1) % n;
            inner.buckets[inner.write_idx] = self.fresh();
            inner.last_roll += self.period;
        }
    }

    pub fn record(&self, value: u64) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        self.maybe_roll(&mut inner, now);
        let idx = inner.write_idx;
        let _ = inner.buckets[idx].record(value);
    }

    /// Sum of every bucket's contents as of now (after rolling away any
    /// buckets whose period has fully elapsed).
    pub fn merged(&self) -> Histogram<u64> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        self.maybe_roll(&mut inner, now);
        let mut out = self.fresh();
        for h in &inner.buckets {
            out.add(h).expect("compatible bounds");
        }
        out
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        let now = self.clock.now();
        for h in inner.buckets.iter_mut() {
            *h = self.fresh();
        }
        inner.write_idx = 0;
        inner.last_roll = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FrozenClock;

    fn hist(clock: Arc<dyn Clock>) -> RollingHistogram {
        RollingHistogram::new(clock, 1, 60_000_000, 3, Duration::from_millis(500), 4)
    }

    #[test]
    fn records_and_merges() {
        let clock = FrozenClock::new();
        let h = hist(clock);
        h.record(100);
        h.record(200);
        let merged = h.merged();
        assert_eq!(merged.len(), 2);
        assert!(merged.value_at_percentile(50.0) >= 100);
    }

    #[test]
    fn rolls_and_clears_old_bucket() {
        let clock = FrozenClock::new();
        let h = hist(clock.clone());
        h.record(1_000_000);
        // advance past the entire 4-bucket window (4 * 500ms)
        clock.advance(Duration::from_millis(2100));
        h.record(10);
        let merged = h.merged();
        // old sample should have rolled out of every bucket by now
        assert_eq!(merged.len(), 1);
        assert_eq!(merged.value_at_percentile(50.0), 10);
    }

    #[test]
    fn reset_clears_all_buckets() {
        let clock = FrozenClock::new();
        let h = hist(clock);
        h.record(500);
        h.reset();
        assert_eq!(h.merged().len(), 0);
    }
}
