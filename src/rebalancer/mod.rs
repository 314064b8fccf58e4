//! Adaptive rebalancer: an outer control loop that nudges a
//! round-robin's backend weights toward whichever backends are performing
//! best, along a finite-state weight ladder, with cascading-failure
//! protection.

mod config;
mod meter;

pub use config::{MeterFactory, RebalancerConfig, RebalancerConfigBuilder, DEFAULT_BACKOFF_DURATION};
pub use meter::{FixedMeter, Meter, RtMeter};

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use http::{Request, Response, Uri};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tower::Service;
use tower_layer::Layer;
use tracing::debug;

use crate::clock::{self, Clock};
use crate::error::ProxyError;
use crate::roundrobin::{
    backend_eq, build_target_uri, canonical, sticky_backend, Backend, RoundRobinConfig, RoundRobinCore,
    RoundRobinLayer,
};

/// Per-backend weight ladder; index 0 is the 1x baseline.
const WEIGHT_LEVELS: [u64; 7] = [1, 2, 4, 8, 16, 32, 64];

/// A backend is "bad" at or above this rating. Cascading protection
/// triggers when the median rating of every backend *except* the single
/// worst one is also at or above this — i.e. most of the pool is
/// struggling, not just one outlier, so adjusting weights would just
/// concentrate traffic on an equally-unhealthy backend (an open
/// question, resolved here as a named constant).
pub const CASCADE_BAD_RATING_THRESHOLD: f64 = 0.8;

struct BackendState {
    url: Uri,
    meter: Arc<dyn Meter>,
    level_idx: usize,
}

struct Shared {
    core: Arc<RoundRobinCore>,
    clock: Arc<dyn Clock>,
    cfg: Arc<RebalancerConfig>,
    states: Mutex<Vec<BackendState>>,
}

impl Shared {
    fn push_weights(&self, states: &[BackendState]) {
        let weights: Vec<(Uri, u64)> = states
            .iter()
            .map(|s| (s.url.clone(), WEIGHT_LEVELS[s.level_idx]))
            .collect();
        self.core.set_weights(&weights);
    }

    /// One control-loop iteration.
    fn tick(&self) {
        let mut states = self.states.lock();
        if states.len() < 2 {
            return;
        }

        let ratings: Vec<f64> = states.iter().map(|s| s.meter.rating()).collect();
        let worst_idx = ratings
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(i, _)| i)
            .expect("non-empty, checked above");

        let mut others: Vec<f64> = ratings
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != worst_idx)
            .map(|(_, r)| *r)
            .collect();
        others.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let median_others = if others.is_empty() {
            0.0
        } else if others.len() % 2 == 1 {
            others[others.len() / 2]
        } else {
            (others[others.len() / 2 - 1] + others[others.len() / 2]) / 2.0
        };

        if median_others >= CASCADE_BAD_RATING_THRESHOLD {
            debug!(median_others, "rebalancer: cascading failure detected, holding weights");
            return;
        }

        let worst_rating = ratings[worst_idx];
        for (i, state) in states.iter_mut().enumerate() {
            if i != worst_idx && ratings[i] < worst_rating {
                state.level_idx = (state.level_idx + 1).min(WEIGHT_LEVELS.len() - 1);
            } else {
                state.level_idx = state.level_idx.saturating_sub(1);
            }
        }

        self.push_weights(&states);
    }

    fn reset_all_to_baseline(&self, states: &mut [BackendState]) {
        for state in states.iter_mut() {
            state.level_idx = 0;
        }
        self.push_weights(states);
    }

    fn upsert(&self, url: Uri, original_weight: u64) {
        let mut states = self.states.lock();
        if let Some(existing) = states.iter_mut().find(|s| backend_eq(&s.url, &url)) {
            existing.url = url.clone();
        } else {
            states.push(BackendState {
                url: url.clone(),
                meter: (self.cfg.meter_factory)(self.clock.clone()),
                level_idx: 0,
            });
        }
        self.core.upsert(Backend::new(url, original_weight));
        self.reset_all_to_baseline(&mut states);
    }

    fn remove(&self, url: &Uri) {
        let mut states = self.states.lock();
        states.retain(|s| !backend_eq(&s.url, url));
        self.core.remove(url);
        self.reset_all_to_baseline(&mut states);
    }

    fn meter_for(&self, url: &Uri) -> Option<Arc<dyn Meter>> {
        self.states
            .lock()
            .iter()
            .find(|s| backend_eq(&s.url, url))
            .map(|s| s.meter.clone())
    }
}

/// Wraps a [`RoundRobinLayer`] and periodically shifts its weights toward
/// whichever backends are performing best. Request serving reuses the
/// round-robin's backend selection and URI rewriting, but times and
/// classifies every call itself so the outcome feeds back into the chosen
/// backend's [`Meter`] — that's what `tick` reads to decide which way to
/// shift weights.
#[derive(Clone)]
pub struct RebalancerLayer {
    rr: RoundRobinLayer,
    shared: Arc<Shared>,
}

impl RebalancerLayer {
    pub fn new(cfg: RebalancerConfig, backends: Vec<(Uri, u64)>) -> Self {
        Self::with_clock(cfg, backends, clock::global())
    }

    pub fn with_clock(mut cfg: RebalancerConfig, backends: Vec<(Uri, u64)>, clock: Arc<dyn Clock>) -> Self {
        let sticky_session = cfg.sticky_session.take();
        let cfg = Arc::new(cfg);
        let rr_servers: Vec<Backend> = backends
            .iter()
            .map(|(u, w)| Backend::new(u.clone(), *w))
            .collect();
        let rr_cfg = RoundRobinConfig {
            servers: rr_servers,
            sticky_session,
            error_handler: Arc::new(crate::error::DefaultErrorHandler),
            request_rewrite_listener: cfg.request_rewrite_listener.clone(),
        };
        let rr = RoundRobinLayer::new(rr_cfg);
        let core = rr.core();

        let states = backends
            .iter()
            .map(|(u, _)| BackendState {
                url: u.clone(),
                meter: (cfg.meter_factory)(clock.clone()),
                level_idx: 0,
            })
            .collect();

        let shared = Arc::new(Shared {
            core,
            clock: clock.clone(),
            cfg: cfg.clone(),
            states: Mutex::new(states),
        });

        spawn_backoff_loop(shared.clone());

        Self { rr, shared }
    }

    /// Drives one control-loop iteration immediately, bypassing the
    /// `backoff_duration` timer — the production path runs this from a
    /// background task spawned at construction.
    pub fn tick(&self) {
        self.shared.tick();
    }

    pub fn upsert_backend(&self, url: Uri, weight: u64) {
        self.shared.upsert(url, weight);
    }

    pub fn remove_backend(&self, url: &Uri) {
        self.shared.remove(url);
    }

    pub fn meter_for(&self, url: &Uri) -> Option<Arc<dyn Meter>> {
        self.shared.meter_for(url)
    }

    pub fn core(&self) -> Arc<RoundRobinCore> {
        self.shared.core.clone()
    }
}

fn spawn_backoff_loop(shared: Arc<Shared>) {
    tokio::spawn(async move {
        loop {
            let duration = shared.cfg.backoff_duration;
            shared.clock.sleep(duration).await;
            shared.tick();
        }
    });
}

impl<S> Layer<S> for RebalancerLayer {
    type Service = RebalancerService<S>;

    fn layer(&self, next: S) -> Self::Service {
        RebalancerService {
            next,
            rr_cfg: self.rr.config(),
            shared: self.shared.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RebalancerService<S> {
    next: S,
    rr_cfg: Arc<RoundRobinConfig>,
    shared: Arc<Shared>,
}

impl<S> Service<Request<Body>> for RebalancerService<S>
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
        let rr_cfg = self.rr_cfg.clone();
        let shared = self.shared.clone();
        let mut next = self.next.clone();
        std::mem::swap(&mut next, &mut self.next);
        Box::pin(async move { run(next, rr_cfg, shared, req).await })
    }
}

/// Mirrors the circuit breaker's own response classification: whether the
/// outcome counts as a network error for the chosen backend's meter.
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
    rr_cfg: Arc<RoundRobinConfig>,
    shared: Arc<Shared>,
    req: Request<Body>,
) -> Result<Response<Body>, ProxyError>
where
    S: Service<Request<Body>, Response = Response<Body>, Error = ProxyError> + Send,
    S::Future: Send,
{
    let core = &shared.core;
    let chosen = match sticky_backend(&rr_cfg, core, &req) {
        Some(b) => b,
        None => match core.next() {
            Ok(b) => b,
            Err(err) => return Ok(rr_cfg.error_handler.handle(&req, &err)),
        },
    };

    let (mut parts, body) = req.into_parts();
    let original_uri = parts.uri.clone();
    let new_uri = build_target_uri(&chosen.url, &original_uri)?;
    parts.uri = new_uri;
    let new_req = Request::from_parts(parts, body);

    if let Some(listener) = &rr_cfg.request_rewrite_listener {
        let probe_old = Request::builder().uri(original_uri.clone()).body(Body::empty()).unwrap();
        let probe_new = Request::builder().uri(new_req.uri().clone()).body(Body::empty()).unwrap();
        listener(&probe_old, &probe_new);
    }

    let cancel_token = new_req.extensions().get::<CancellationToken>().cloned();
    debug!(backend = %chosen.url, "rebalancer selected backend");
    let start = shared.clock.now();
    let result = match cancel_token {
        Some(token) => {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    let probe = Request::builder().uri(original_uri.clone()).body(Body::empty()).unwrap();
                    return Ok(rr_cfg.error_handler.handle(&probe, &ProxyError::Canceled));
                }
                result = next.call(new_req) => result,
            }
        }
        None => next.call(new_req).await,
    };
    let elapsed: Duration = shared.clock.now().saturating_duration_since(start);

    let (status_code, is_network, response, failure) = classify(result);
    if let Some(meter) = shared.meter_for(&chosen.url) {
        meter.record(status_code, elapsed, is_network);
    }

    let mut resp = match response {
        Some(resp) => resp,
        None => return Err(failure.expect("failure set whenever response is None")),
    };

    if let Some(sticky) = &rr_cfg.sticky_session {
        let value = sticky.codec.encode(&canonical(&chosen.url));
        if let Ok(header) = http::HeaderValue::from_str(&format!("{}={}; Path=/", sticky.cookie_name, value)) {
            resp.headers_mut().insert(http::header::SET_COOKIE, header);
        }
    }

    Ok(resp)
}
