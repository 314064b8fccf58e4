//! Token buckets and bucket sets.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// One rate period in a rate plan: `burst` tokens refill continuously at
/// `average_rate` tokens per `period`.
#[derive(Debug, Clone, Copy)]
pub struct Rate {
    pub period: Duration,
    pub average_rate: f64,
    pub burst: u64,
}

impl Rate {
    pub fn per_second(average_rate: f64, burst: u64) -> Self {
        Self {
            period: Duration::from_secs(1),
            average_rate,
            burst,
        }
    }
}

/// A single bucket's consume outcome that isn't satisfiable at all —
/// distinct from "satisfiable with a delay" ("if tokens >
/// any bucket's burst").
#[derive(Debug)]
pub struct ExceedsBurst {
    pub requested: u64,
    pub burst: u64,
}

/// One token bucket: continuous refill at one token per `time_per_token`,
/// capped at `burst`. `last_consumed` remembers the last `consume` amount so
/// a caller can [`rollback`](TokenBucket::rollback) it exactly once.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    period: Duration,
    time_per_token: f64,
    burst: f64,
    available_tokens: f64,
    last_refresh: Instant,
    last_consumed: f64,
    rolled_back: bool,
}

impl TokenBucket {
    pub fn new(rate: Rate, now: Instant) -> Self {
        let time_per_token = if rate.average_rate > 0.0 {
            rate.period.as_secs_f64() / rate.average_rate
        } else {
            f64::INFINITY
        };
        Self {
            period: rate.period,
            time_per_token,
            burst: rate.burst as f64,
            available_tokens: rate.burst as f64,
            last_refresh: now,
            last_consumed: 0.0,
            rolled_back: true,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    fn refill(&mut self, now: Instant) {
        if self.time_per_token.is_infinite() || now <= self.last_refresh {
            return;
        }
        let elapsed = now.duration_since(self.last_refresh).as_secs_f64();
        let minted = elapsed / self.time_per_token;
        self.available_tokens = (self.available_tokens + minted).min(self.burst);
        self.last_refresh = now;
    }

    /// Consume `amount` tokens as of `now`. Returns the delay the caller
    /// should wait before the bucket would have had enough tokens (zero if
    /// it already did), or an error if `amount` exceeds burst capacity and
    /// could never be satisfied regardless of wait.
    pub fn consume(&mut self, amount: u64, now: Instant) -> Result<Duration, ExceedsBurst> {
        self.refill(now);
        let amount_f = amount as f64;
        if amount_f > self.burst {
            self.last_consumed = 0.0;
            self.rolled_back = true;
            return Err(ExceedsBurst {
                requested: amount,
                burst: self.burst as u64,
            });
        }

        self.last_consumed = amount_f;
        self.rolled_back = false;
        self.available_tokens -= amount_f;

        if self.available_tokens >= 0.0 {
            Ok(Duration::ZERO)
        } else {
            let deficit = -self.available_tokens;
            Ok(Duration::from_secs_f64(deficit * self.time_per_token))
        }
    }

    /// Undo the last `consume`, restoring `available_tokens` by exactly
    /// `last_consumed`. Idempotent: a second call is a no-op.
    pub fn rollback(&mut self) {
        if self.rolled_back {
            return;
        }
        self.available_tokens = (self.available_tokens + self.last_consumed).min(self.burst);
        self.last_consumed = 0.0;
        self.rolled_back = true;
    }
}

/// Exactly one bucket per distinct period in the rate plan it was built
/// from.
pub struct BucketSet {
    buckets: HashMap<Duration, TokenBucket>,
    max_period: Duration,
}

/// The outcome of reserving `amount` tokens across every bucket in a set:
/// the largest delay any bucket reported, and the first "never satisfiable"
/// error encountered, matching the aggregation rule below.
pub struct ConsumeOutcome {
    pub delay: Duration,
    pub exceeds_burst: Option<ExceedsBurst>,
}

impl BucketSet {
    pub fn new(rates: &[Rate], now: Instant) -> Self {
        let mut buckets = HashMap::new();
        let mut max_period = Duration::ZERO;
        for rate in rates {
            max_period = max_period.max(rate.period);
            buckets.insert(rate.period, TokenBucket::new(*rate, now));
        }
        Self {
            buckets,
            max_period,
        }
    }

    pub fn max_period(&self) -> Duration {
        self.max_period
    }

    /// Reserve `amount` tokens against every bucket. If any bucket reports
    /// an unsatisfiable request or a nonzero delay, every bucket (including
    /// ones that succeeded) is rolled back.
    pub fn consume(&mut self, amount: u64, now: Instant) -> ConsumeOutcome {
        let mut max_delay = Duration::ZERO;
        let mut first_err = None;

        for bucket in self.buckets.values_mut() {
            match bucket.consume(amount, now) {
                Ok(delay) => max_delay = max_delay.max(delay),
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }

        if first_err.is_some() || max_delay > Duration::ZERO {
            for bucket in self.buckets.values_mut() {
                bucket.rollback();
            }
        }

        ConsumeOutcome {
            delay: max_delay,
            exceeds_burst: first_err,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_bucket_allows_burst_then_gates() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(Rate::per_second(1.0, 1), now);
        assert_eq!(bucket.consume(1, now).unwrap(), Duration::ZERO);
        let delay = bucket.consume(1, now).unwrap();
        assert!(delay > Duration::ZERO);
    }

    #[test]
    fn refill_restores_tokens_after_period() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(Rate::per_second(1.0, 1), now);
        bucket.consume(1, now).unwrap();
        let later = now + Duration::from_secs(1);
        assert_eq!(bucket.consume(1, later).unwrap(), Duration::ZERO);
    }

    #[test]
    fn exceeding_burst_is_unsatisfiable() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(Rate::per_second(1.0, 1), now);
        assert!(bucket.consume(5, now).is_err());
    }

    #[test]
    fn rollback_restores_exactly_once() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(Rate::per_second(1.0, 2), now);
        bucket.consume(2, now).unwrap();
        bucket.rollback();
        bucket.rollback();
        assert_eq!(bucket.consume(2, now).unwrap(), Duration::ZERO);
    }

    #[test]
    fn bucket_set_rolls_back_all_on_any_delay() {
        let now = Instant::now();
        let rates = [Rate::per_second(1.0, 1), Rate::per_second(100.0, 100)];
        let mut set = BucketSet::new(&rates, now);
        // first reservation exhausts the 1/s bucket
        let outcome = set.consume(1, now);
        assert_eq!(outcome.delay, Duration::ZERO);
        // second reservation must wait on the 1/s bucket; the 100/s bucket,
        // which had plenty of room, must be rolled back too
        let outcome = set.consume(1, now);
        assert!(outcome.delay > Duration::ZERO);
        // rolled back: consuming the big bucket alone still has full room
        let rates_big_only = [Rate::per_second(100.0, 100)];
        let mut big_only = BucketSet::new(&rates_big_only, now);
        for _ in 0..100 {
            assert_eq!(big_only.consume(1, now).delay, Duration::ZERO);
        }
    }

    #[test]
    fn max_period_is_the_largest_bucket_period() {
        let now = Instant::now();
        let rates = [
            Rate::per_second(1.0, 1),
            Rate {
                period: Duration::from_secs(60),
                average_rate: 100.0,
                burst: 100,
            },
        ];
        let set = BucketSet::new(&rates, now);
        assert_eq!(set.max_period(), Duration::from_secs(60));
    }
}
