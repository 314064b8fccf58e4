//! `RollingCounter` — a fixed-window count over `buckets` slots of
//! `resolution` each.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::clock::Clock;

struct Inner {
    slots: Vec<i64>,
    /// Wall time the slot at `last_bucket` was last touched.
    slot_times: Vec<Instant>,
    last_bucket: usize,
}

/// Fixed-window counter over `buckets` slots of `resolution` each. The slot
/// for time `t` is `floor(t / resolution) mod buckets`; reads lazily zero
/// any slot whose recorded time is older than `now - buckets*resolution`
/// (the "lazy cleanup" invariant).
pub struct RollingCounter {
    clock: Arc<dyn Clock>,
    buckets: usize,
    resolution_ms: u64,
    epoch: Instant,
    inner: Mutex<Inner>,
}

impl RollingCounter {
    pub fn new(clock: Arc<dyn Clock>, buckets: usize, resolution_ms: u64) -> Self {
        assert!(buckets > 0, "buckets must be > 0");
        assert!(resolution_ms > 0, "resolution_ms must be > 0");
        let epoch = clock.now();
        Self {
            buckets,
            resolution_ms,
            epoch,
            inner: Mutex::new(Inner {
                slots: vec![0; buckets],
                slot_times: vec![epoch; buckets],
                last_bucket: 0,
            }),
            clock,
        }
    }

    fn period_index(&self, at: Instant) -> u64 {
        let elapsed_ms = at.saturating_duration_since(self.epoch).as_millis() as u64;
        elapsed_ms / self.resolution_ms
    }

    fn bucket_of(&self, period: u64) -> usize {
        (period as usize) % self.buckets
    }

    /// Zero every slot whose recorded time falls in a period strictly older
    /// than `now - buckets*resolution`, scanning backward from the current
    /// bucket.
    fn cleanup(&self, inner: &mut Inner, now: Instant) {
        let current_period = self.period_index(now);
        let window_start_period = current_period.saturating_sub(self.buckets as u64 - 1);

        for offset in 0..self.buckets {
            let idx = (current_period as usize + self.buckets - offset) % self.buckets;
            let slot_period = self.period_index(inner.slot_times[idx]);
            if inner.slots[idx] != 0 && slot_period < window_start_period {
                inner.slots[idx] = 0;
            }
        }
        inner.last_bucket = self.bucket_of(current_period);
    }

    pub fn inc(&self, n: i64) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        self.cleanup(&mut inner, now);
        let idx = self.bucket_of(self.period_index(now));
        inner.slots[idx] += n;
        inner.slot_times[idx] = now;
    }

    pub fn count(&self) -> i64 {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        self.cleanup(&mut inner, now);
        inner.slots.iter().sum()
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        let now = self.clock.now();
        inner.slots.iter_mut().for_each(|s| *s = 0);
        inner.slot_times.iter_mut().for_each(|t| *t = now);
        inner.last_bucket = self.bucket_of(self.period_index(now));
    }

    /// Independent copy reflecting the same cleanup as of the moment of
    /// cloning.
    pub fn clone_snapshot(&self) -> RollingCounter {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        self.cleanup(&mut inner, now);
        RollingCounter {
            clock: self.clock.clone(),
            buckets: self.buckets,
            resolution_ms: self.resolution_ms,
            epoch: self.epoch,
            inner: Mutex::new(Inner {
                slots: inner.slots.clone(),
                slot_times: inner.slot_times.clone(),
                last_bucket: inner.last_bucket,
            }),
        }
    }

    /// `append(other)` is defined as `inc(other.count())`.
    pub fn append(&self, other: &RollingCounter) {
        self.inc(other.count());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FrozenClock;

    #[test]
    fn counts_within_window() {
        let clock = FrozenClock::new();
        let c = RollingCounter::new(clock.clone(), 4, 1000);
        c.inc(1);
        c.inc(2);
        assert_eq!(c.count(), 3);
    }

    #[test]
    fn expires_old_buckets() {
        let clock = FrozenClock::new();
        let c = RollingCounter::new(clock.clone(), 4, 1000);
        c.inc(5);
        clock.advance(std::time::Duration::from_millis(4100));
        assert_eq!(c.count(), 0);
    }

    #[test]
    fn partial_expiry_keeps_recent_buckets() {
        let clock = FrozenClock::new();
        let c = RollingCounter::new(clock.clone(), 4, 1000);
        c.inc(5);
        clock.advance(std::time::Duration::from_millis(1000));
        c.inc(7);
        clock.advance(std::time::Duration::from_millis(1000));
        // first inc (t=0) is now 2 periods old, still within a 4-bucket
        // window of width 4000ms, so both contribute.
        assert_eq!(c.count(), 12);
    }

    #[test]
    fn clone_snapshot_is_independent() {
        let clock = FrozenClock::new();
        let c = RollingCounter::new(clock.clone(), 4, 1000);
        c.inc(3);
        let snap = c.clone_snapshot();
        c.inc(10);
        assert_eq!(snap.count(), 3);
        assert_eq!(c.count(), 13);
    }

    #[test]
    fn append_adds_counts() {
        let clock = FrozenClock::new();
        let a = RollingCounter::new(clock.clone(), 4, 1000);
        let b = RollingCounter::new(clock.clone(), 4, 1000);
        a.inc(4);
        b.inc(10);
        a.append(&b);
        assert_eq!(a.count(), 14);
    }

    #[test]
    fn reset_zeros_all_slots() {
        let clock = FrozenClock::new();
        let c = RollingCounter::new(clock.clone(), 4, 1000);
        c.inc(9);
        c.reset();
        assert_eq!(c.count(), 0);
    }
}
