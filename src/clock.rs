//! Process-wide time abstraction.
//!
//! Every component that needs "now", a sleep, a timer, or a periodic tick
//! goes through a [`Clock`] rather than `std::time`/`tokio::time` directly,
//! so tests can swap in a [`FrozenClock`] and drive state machines
//! deterministically instead of racing real wall time.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::oneshot;

/// A handle returned by [`Clock::schedule_after`]; dropping it does not
/// cancel the scheduled callback — callers that need cancellation compose
/// their own flag.
pub type ScheduleHandle = tokio::task::JoinHandle<()>;

/// Process-wide source of time. Implementations must be cheap to clone
/// (`Arc`-backed) since every middleware holds one.
pub trait Clock: Send + Sync {
    /// Current time according to this clock.
    fn now(&self) -> Instant;

    /// Sleep until `duration` has elapsed on this clock.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;

    /// Fire `f` once after `duration` has elapsed on this clock.
    fn schedule_after(&self, duration: Duration, f: Box<dyn FnOnce() + Send>) -> ScheduleHandle;
}

/// Real clock: delegates to `Instant`/`tokio::time` so callers cooperate
/// with the Tokio reactor instead of blocking a worker thread.
#[derive(Clone, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }

    fn schedule_after(&self, duration: Duration, f: Box<dyn FnOnce() + Send>) -> ScheduleHandle {
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            f();
        })
    }
}

/// One pending timer in a [`FrozenClock`].
struct PendingTimer {
    deadline: Instant,
    seq: u64,
    kind: TimerKind,
}

enum TimerKind {
    Wake(oneshot::Sender<()>),
    Callback(Box<dyn FnOnce() + Send>),
}

impl PartialEq for PendingTimer {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for PendingTimer {}

impl PartialOrd for PendingTimer {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingTimer {
    // BinaryHeap is a max-heap; we want the earliest deadline (and, within a
    // deadline, the lowest sequence number = earliest scheduled) popped
    // first, so reverse both comparisons.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct FrozenInner {
    now: Instant,
    pending: BinaryHeap<PendingTimer>,
    next_seq: u64,
}

/// Virtual clock for deterministic tests. Time only moves when [`advance`]
/// is called; pending timers fire in scheduling order among ties at the
/// same deadline.
///
/// [`advance`]: FrozenClock::advance
pub struct FrozenClock {
    inner: Mutex<FrozenInner>,
    // Notified every time a timer is enqueued, so `wait_for_scheduled` can
    // block without polling.
    scheduled: Condvar,
}

impl FrozenClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(FrozenInner {
                now: Instant::now(),
                pending: BinaryHeap::new(),
                next_seq: 0,
            }),
            scheduled: Condvar::new(),
        })
    }

    /// Advance virtual time by `duration`, firing every timer whose deadline
    /// is now at-or-before the new `now`, in scheduling order for ties.
    pub fn advance(&self, duration: Duration) {
        let new_now = {
            let mut inner = self.inner.lock();
            inner.now += duration;
            inner.now
        };

        loop {
            let due = {
                let mut inner = self.inner.lock();
                match inner.pending.peek() {
                    Some(t) if t.deadline <= new_now => inner.pending.pop(),
                    _ => None,
                }
            };
            match due {
                Some(timer) => match timer.kind {
                    TimerKind::Wake(tx) => {
                        let _ = tx.send(());
                    }
                    TimerKind::Callback(f) => f(),
                },
                None => break,
            }
        }
    }

    /// Block (on a blocking thread, via `parking_lot::Condvar`) until at
    /// least `n` timers are queued or `timeout` elapses. Intended for tests
    /// that need to know a component has armed its timer before calling
    /// `advance`.
    pub fn wait_for_scheduled(&self, n: usize, timeout: Duration) -> bool {
        let mut inner = self.inner.lock();
        let deadline = Instant::now() + timeout;
        while inner.pending.len() < n {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return inner.pending.len() >= n;
            }
            let result = self.scheduled.wait_for(&mut inner, remaining);
            if result.timed_out() && inner.pending.len() < n {
                return false;
            }
        }
        true
    }

    fn enqueue(&self, duration: Duration, kind: TimerKind) {
        let mut inner = self.inner.lock();
        let deadline = inner.now + duration;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.pending.push(PendingTimer {
            deadline,
            seq,
            kind,
        });
        drop(inner);
        self.scheduled.notify_all();
    }
}

impl Clock for FrozenClock {
    fn now(&self) -> Instant {
        self.inner.lock().now
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        if duration.is_zero() {
            return Box::pin(async {});
        }
        let (tx, rx) = oneshot::channel();
        self.enqueue(duration, TimerKind::Wake(tx));
        Box::pin(async move {
            let _ = rx.await;
        })
    }

    fn schedule_after(&self, duration: Duration, f: Box<dyn FnOnce() + Send>) -> ScheduleHandle {
        if duration.is_zero() {
            f();
            return tokio::spawn(async {});
        }
        self.enqueue(duration, TimerKind::Callback(f));
        tokio::spawn(async {})
    }
}

static GLOBAL: OnceLock<Mutex<Arc<dyn Clock>>> = OnceLock::new();

fn global_cell() -> &'static Mutex<Arc<dyn Clock>> {
    GLOBAL.get_or_init(|| Mutex::new(Arc::new(SystemClock::new())))
}

/// Process-wide default clock. Components may be constructed with an
/// explicit clock (preferred for unit tests); this accessor exists for
/// call sites that don't thread one through.
pub fn global() -> Arc<dyn Clock> {
    global_cell().lock().clone()
}

/// Swap the process-wide clock, e.g. to a [`FrozenClock`] for a test suite.
/// Tests that use this must not run concurrently with other frozen-clock
/// suites or with unrelated real-time code.
pub fn set_global(clock: Arc<dyn Clock>) {
    *global_cell().lock() = clock;
}

/// Monotonically increasing counter usable as a tie-breaker id generator
/// independent of the clock (used by a few components for FIFO ordering
/// that must survive clock resets in tests).
pub(crate) fn next_seq() -> u64 {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    SEQ.fetch_add(1, Ordering::Relaxed)
}
