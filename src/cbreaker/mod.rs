//! Circuit breaker middleware: a three-state machine
//! (Standby → Tripped → Recovering → Standby) evaluated against rolling
//! metrics through the shared predicate evaluator.

mod config;
mod ratio;

pub use config::{CircuitBreakerConfig, CircuitBreakerConfigBuilder, TransitionHook};
pub use ratio::RatioController;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::Body;
use http::{Request, Response};
use parking_lot::{Mutex, RwLock};
use tower::Service;
use tower_layer::Layer;
use tracing::error;

use crate::clock::{self, Clock};
use crate::error::ProxyError;
use crate::metrics::RTMetrics;
use crate::predicate::BreakerContext;

enum BreakerState {
    Standby,
    Tripped { until: Instant },
    Recovering { until: Instant, ratio: RatioController },
}

struct Shared {
    cfg: CircuitBreakerConfig,
    metrics: RTMetrics,
    clock: Arc<dyn Clock>,
    state: RwLock<BreakerState>,
    last_check: Mutex<Option<Instant>>,
}

#[derive(Clone)]
pub struct CircuitBreakerLayer {
    shared: Arc<Shared>,
}

impl CircuitBreakerLayer {
    pub fn new(cfg: CircuitBreakerConfig) -> Self {
        Self::with_clock(cfg, clock::global())
    }

    pub fn with_clock(cfg: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let metrics = RTMetrics::new(clock.clone());
        Self {
            shared: Arc::new(Shared {
                cfg,
                metrics,
                clock,
                state: RwLock::new(BreakerState::Standby),
                last_check: Mutex::new(None),
            }),
        }
    }
}

impl<S> Layer<S> for CircuitBreakerLayer {
    type Service = CircuitBreakerService<S>;

    fn layer(&self, next: S) -> Self::Service {
        CircuitBreakerService {
            next,
            shared: self.shared.clone(),
        }
    }
}

#[derive(Clone)]
pub struct CircuitBreakerService<S> {
    next: S,
    shared: Arc<Shared>,
}

impl<S> Service<Request<Body>> for CircuitBreakerService<S>
where
    S: Service<Request<Body>, Response = Response<Body>, Error = ProxyError> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = ProxyError;
    type Future = Pin<Box<dyn Future<Output = Result<Response<Body>, ProxyError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.next.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let shared = self.shared.clone();
        let mut next = self.next.clone();
        std::mem::swap(&mut next, &mut self.next);
        Box::pin(async move { run(next, shared, req).await })
    }
}

enum Decision {
    Admit,
    Fallback,
}

fn pre_call(shared: &Shared, now: Instant) -> Decision {
    {
        if let BreakerState::Standby = *shared.state.read() {
            return Decision::Admit;
        }
    }
    let mut state = shared.state.write();
    match &mut *state {
        BreakerState::Standby => Decision::Admit,
        BreakerState::Tripped { until } => {
            if now < *until {
                Decision::Fallback
            } else {
                let mut ratio = RatioController::new(now, shared.cfg.recovery_duration);
                let admit = ratio.allow_request(now);
                *state = BreakerState::Recovering {
                    until: now + shared.cfg.recovery_duration,
                    ratio,
                };
                if admit {
                    Decision::Admit
                } else {
                    Decision::Fallback
                }
            }
        }
        BreakerState::Recovering { until, ratio } => {
            if now > *until {
                *state = BreakerState::Standby;
                drop(state);
                fire(shared.cfg.on_standby.clone());
                Decision::Admit
            } else if ratio.allow_request(now) {
                Decision::Admit
            } else {
                Decision::Fallback
            }
        }
    }
}

fn maybe_trip(shared: &Shared, now: Instant) {
    {
        let mut last_check = shared.last_check.lock();
        let eligible = match *last_check {
            None => true,
            Some(t) => now.saturating_duration_since(t) >= shared.cfg.check_period,
        };
        if !eligible {
            return;
        }
        *last_check = Some(now);
    }

    let ctx = BreakerContext {
        metrics: &shared.metrics,
    };
    if !shared.cfg.tripping_predicate.eval(&ctx) {
        return;
    }

    let mut state = shared.state.write();
    if matches!(&*state, BreakerState::Tripped { .. }) {
        return;
    }
    *state = BreakerState::Tripped {
        until: now + shared.cfg.fallback_duration,
    };
    drop(state);
    shared.metrics.reset();
    fire(shared.cfg.on_tripped.clone());
}

fn fire(hook: Option<TransitionHook>) {
    if let Some(h) = hook {
        tokio::spawn(async move {
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| h())).is_err() {
                error!("circuit breaker transition hook panicked");
            }
        });
    }
}

fn classify(
    result: Result<Response<Body>, ProxyError>,
) -> (u16, bool, Option<Response<Body>>, Option<ProxyError>) {
    match result {
        Ok(resp) => (resp.status().as_u16(), false, Some(resp), None),
        Err(err) => {
            let is_network = matches!(err, ProxyError::Network { .. } | ProxyError::Io(_));
            (err.status_code().as_u16(), is_network, None, Some(err))
        }
    }
}

async fn run<S>(
    mut next: S,
    shared: Arc<Shared>,
    req: Request<Body>,
) -> Result<Response<Body>, ProxyError>
where
    S: Service<Request<Body>, Response = Response<Body>, Error = ProxyError> + Send,
    S::Future: Send,
{
    let now = shared.clock.now();
    match pre_call(&shared, now) {
        Decision::Fallback => {
            let err = ProxyError::CircuitOpen;
            Ok(shared.cfg.fallback_handler.handle(&req, &err))
        }
        Decision::Admit => {
            let start = shared.clock.now();
            let ready = std::future::poll_fn(|cx| next.poll_ready(cx))
                .await
                .map_err(|e| ProxyError::Internal(e.to_string()));
            let result = match ready {
                Ok(()) => next.call(req).await,
                Err(e) => Err(e),
            };
            let elapsed = shared.clock.now().saturating_duration_since(start);
            let (status_code, is_network, response, failure) = classify(result);
            shared.metrics.record(status_code, elapsed, is_network);
            maybe_trip(&shared, shared.clock.now());
            match response {
                Some(resp) => Ok(resp),
                None => Err(failure.expect("failure set whenever response is None")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FrozenClock;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Once;
    use std::time::Duration;

    static TRACING_INIT: Once = Once::new();

    /// State-transition logs are the main debugging aid for this module's
    /// tests when they fail intermittently; route them to the test harness
    /// instead of /dev/null.
    fn init_tracing() {
        TRACING_INIT.call_once(|| {
            let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        });
    }

    #[derive(Clone)]
    struct FixedStatusService {
        status: u16,
    }

    impl Service<Request<Body>> for FixedStatusService {
        type Response = Response<Body>;
        type Error = ProxyError;
        type Future =
            Pin<Box<dyn Future<Output = Result<Response<Body>, ProxyError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _req: Request<Body>) -> Self::Future {
            let status = self.status;
            Box::pin(async move {
                Ok(Response::builder()
                    .status(status)
                    .body(Body::empty())
                    .unwrap())
            })
        }
    }

    fn req() -> Request<Body> {
        Request::builder().body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn standby_admits_directly_and_records_metrics() {
        let clock = FrozenClock::new();
        let cfg = CircuitBreakerConfig::builder("NetworkErrorRatio() > 0.5")
            .build()
            .unwrap();
        let layer = CircuitBreakerLayer::with_clock(cfg, clock);
        let svc = layer.layer(FixedStatusService { status: 200 });
        let resp = run(svc.next, svc.shared, req()).await.unwrap();
        assert_eq!(resp.status(), 200);
    }

    #[tokio::test]
    async fn full_lifecycle_trips_recovers_and_returns_to_standby() {
        init_tracing();
        let clock = FrozenClock::new();
        let cfg = CircuitBreakerConfig::builder("NetworkErrorRatio() > 0.5")
            .fallback_duration(Duration::from_secs(10))
            .recovery_duration(Duration::from_secs(10))
            .check_period(Duration::from_millis(1))
            .build()
            .unwrap();
        let layer = CircuitBreakerLayer::with_clock(cfg, clock.clone());
        let svc = layer.layer(FixedStatusService { status: 502 });

        // seed the metrics so NetworkErrorRatio() > 0.5 once we observe a
        // network-mapped status; the helper service reports 502s which is
        // not itself a Network error per `classify`, so trip it directly by
        // feeding enough bad observations through `maybe_trip`.
        for _ in 0..10 {
            svc.shared.metrics.record(502, Duration::from_millis(1), true);
        }
        maybe_trip(&svc.shared, clock.now());
        assert!(matches!(
            *svc.shared.state.read(),
            BreakerState::Tripped { .. }
        ));

        // still tripped just before fallback_duration elapses
        clock.advance(Duration::from_secs(9));
        let resp = run(svc.next.clone(), svc.shared.clone(), req()).await.unwrap();
        assert_eq!(resp.status(), 503);

        // past fallback_duration: the next request transitions to
        // Recovering. The ratio controller's target ramps from 0 at the
        // start of the recovery window, so this very first request is
        // denied (target == 0 at t == start).
        clock.advance(Duration::from_millis(1002));
        let resp = run(svc.next.clone(), svc.shared.clone(), req()).await.unwrap();
        assert_eq!(resp.status(), 503);
        assert!(matches!(
            *svc.shared.state.read(),
            BreakerState::Recovering { .. }
        ));

        // 5s into the 10s recovery window: target ratio has ramped to
        // 0.25, so a fraction of requests now pass.
        clock.advance(Duration::from_secs(5));
        let mut allowed = 0;
        for _ in 0..100 {
            let resp = run(svc.next.clone(), svc.shared.clone(), req()).await.unwrap();
            if resp.status() == 502 {
                allowed += 1;
            }
        }
        assert!(allowed > 0);
        assert!(matches!(
            *svc.shared.state.read(),
            BreakerState::Recovering { .. }
        ));

        // past recovery_duration: back to Standby
        clock.advance(Duration::from_secs(11));
        let resp = run(svc.next.clone(), svc.shared.clone(), req()).await.unwrap();
        assert_eq!(resp.status(), 502);
        assert!(matches!(*svc.shared.state.read(), BreakerState::Standby));
    }

    #[tokio::test]
    async fn tripped_state_never_calls_next() {
        let clock = FrozenClock::new();
        let calls = Arc::new(AtomicU32::new(0));
        #[derive(Clone)]
        struct CountingService {
            calls: Arc<AtomicU32>,
        }
        impl Service<Request<Body>> for CountingService {
            type Response = Response<Body>;
            type Error = ProxyError;
            type Future =
                Pin<Box<dyn Future<Output = Result<Response<Body>, ProxyError>> + Send>>;
            fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
                Poll::Ready(Ok(()))
            }
            fn call(&mut self, _req: Request<Body>) -> Self::Future {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Ok(Response::builder().status(200).body(Body::empty()).unwrap()) })
            }
        }

        let cfg = CircuitBreakerConfig::builder("NetworkErrorRatio() > 0.5")
            .check_period(Duration::from_millis(1))
            .build()
            .unwrap();
        let layer = CircuitBreakerLayer::with_clock(cfg, clock.clone());
        let svc = layer.layer(CountingService { calls: calls.clone() });

        {
            let mut state = svc.shared.state.write();
            *state = BreakerState::Tripped {
                until: clock.now() + Duration::from_secs(10),
            };
        }

        for _ in 0..5 {
            let resp = run(svc.next.clone(), svc.shared.clone(), req()).await.unwrap();
            assert_eq!(resp.status(), 503);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
