//! Linear admission controller used while the breaker is Recovering
//! (the ratio-controller admission property).

use std::time::{Duration, Instant};

/// Equilibrium point the target ratio ramps up to by `start + duration`:
/// beyond it, the controller admits everything for the rest of the
/// recovery window.
pub const DEFAULT_TARGET_RATIO: f64 = 0.5;

/// Tracks how many requests have been admitted vs. denied since recovery
/// began, and decides each new request by projecting what the realized
/// ratio would become if it were admitted, against a target that ramps
/// linearly from 0 at `start` to `DEFAULT_TARGET_RATIO` at `start +
/// duration` (spec.md §3/§4.3: `target(t) = 0.5 * (t - start) / duration`,
/// clamped).
#[derive(Debug, Clone)]
pub struct RatioController {
    start: Instant,
    duration: Duration,
    allowed: u64,
    denied: u64,
}

impl RatioController {
    pub fn new(start: Instant, duration: Duration) -> Self {
        Self {
            start,
            duration,
            allowed: 0,
            denied: 0,
        }
    }

    /// Target ratio at `now`: 0 at `start`, ramping linearly to
    /// `DEFAULT_TARGET_RATIO` at `start + duration`, clamped at both ends.
    fn target(&self, now: Instant) -> f64 {
        if self.duration.is_zero() {
            return DEFAULT_TARGET_RATIO;
        }
        let elapsed = now.saturating_duration_since(self.start).as_secs_f64();
        (DEFAULT_TARGET_RATIO * elapsed / self.duration.as_secs_f64())
            .clamp(0.0, DEFAULT_TARGET_RATIO)
    }

    /// Decide whether to admit the next request as of `now`, updating
    /// internal counts.
    pub fn allow_request(&mut self, now: Instant) -> bool {
        let target = self.target(now);
        let total = self.allowed + self.denied;
        let projected = (self.allowed as f64 + 1.0) / (total as f64 + 1.0);
        if projected < target {
            self.allowed += 1;
            true
        } else {
            self.denied += 1;
            false
        }
    }

    pub fn realized_ratio(&self) -> f64 {
        let total = self.allowed + self.denied;
        if total == 0 {
            0.0
        } else {
            self.allowed as f64 / total as f64
        }
    }

    pub fn allowed(&self) -> u64 {
        self.allowed
    }

    pub fn denied(&self) -> u64 {
        self.denied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_until_target_ratio_then_gates_at_full_ramp() {
        let start = Instant::now();
        let duration = Duration::from_secs(10);
        let mut rc = RatioController::new(start, duration);
        let at_end = start + duration;
        let mut admitted = 0;
        for _ in 0..100 {
            if rc.allow_request(at_end) {
                admitted += 1;
            }
        }
        let realized = admitted as f64 / 100.0;
        let bound = 1.0 / (rc.allowed() + rc.denied()) as f64;
        assert!((realized - DEFAULT_TARGET_RATIO).abs() <= bound + 1e-9);
    }

    #[test]
    fn ramps_from_zero_at_start() {
        let start = Instant::now();
        let duration = Duration::from_secs(10);
        let mut rc = RatioController::new(start, duration);
        // at the very start of recovery, target ratio is ~0: the very
        // first request must be denied.
        assert!(!rc.allow_request(start));
    }

    #[test]
    fn admits_more_as_recovery_window_progresses() {
        let start = Instant::now();
        let duration = Duration::from_secs(10);

        let mut early = RatioController::new(start, duration);
        let early_admitted = (0..100)
            .filter(|_| early.allow_request(start + Duration::from_secs(1)))
            .count();

        let mut late = RatioController::new(start, duration);
        let late_admitted = (0..100)
            .filter(|_| late.allow_request(start + Duration::from_secs(9)))
            .count();

        assert!(late_admitted > early_admitted);
    }

    #[test]
    fn some_requests_pass_over_many_trials_at_full_ramp() {
        let start = Instant::now();
        let duration = Duration::from_secs(10);
        let mut rc = RatioController::new(start, duration);
        let admitted = (0..100)
            .filter(|_| rc.allow_request(start + duration))
            .count();
        assert!(admitted > 0);
    }

    #[test]
    fn zero_duration_ramps_instantly_to_target() {
        let start = Instant::now();
        let mut rc = RatioController::new(start, Duration::ZERO);
        let admitted = (0..50).filter(|_| rc.allow_request(start)).count();
        assert!(admitted > 0);
        assert!(admitted < 50);
    }
}
