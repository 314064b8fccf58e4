//! Concurrent-connection limiter: a per-source in-flight
//! counter with a hard cap, released on every exit path via a drop guard.

mod config;

pub use config::{ConnLimitConfig, ConnLimitConfigBuilder, ConnSourceExtractor, DEFAULT_TTL};

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use http::{Request, Response};
use tower::Service;
use tower_layer::Layer;

use crate::clock::{self, Clock};
use crate::error::ProxyError;
use crate::ttlmap::TtlMap;

#[derive(Clone)]
pub struct ConnLimitLayer {
    cfg: Arc<ConnLimitConfig>,
    clock: Arc<dyn Clock>,
    counts: Arc<TtlMap<String, AtomicU32>>,
}

impl ConnLimitLayer {
    pub fn new(cfg: ConnLimitConfig) -> Self {
        Self::with_clock(cfg, clock::global())
    }

    pub fn with_clock(cfg: ConnLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            cfg: Arc::new(cfg),
            clock,
            counts: Arc::new(TtlMap::new(DEFAULT_TTL, 0)),
        }
    }
}

impl<S> Layer<S> for ConnLimitLayer {
    type Service = ConnLimitService<S>;

    fn layer(&self, next: S) -> Self::Service {
        ConnLimitService {
            next,
            cfg: self.cfg.clone(),
            clock: self.clock.clone(),
            counts: self.counts.clone(),
        }
    }
}

#[derive(Clone)]
pub struct ConnLimitService<S> {
    next: S,
    cfg: Arc<ConnLimitConfig>,
    clock: Arc<dyn Clock>,
    counts: Arc<TtlMap<String, AtomicU32>>,
}

impl<S> Service<Request<Body>> for ConnLimitService<S>
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
        let cfg = self.cfg.clone();
        let clock = self.clock.clone();
        let counts = self.counts.clone();
        let mut next = self.next.clone();
        std::mem::swap(&mut next, &mut self.next);
        Box::pin(async move { run(next, cfg, clock, counts, req).await })
    }
}

/// Releases this source's in-flight slot on drop — covers success, error,
/// panic, and cancellation ("must use scoped acquisition
/// primitives"). Prunes the key once the count returns to zero so the map
/// doesn't grow unboundedly with one-shot sources.
struct ReleaseGuard {
    key: String,
    counts: Arc<TtlMap<String, AtomicU32>>,
    clock: Arc<dyn Clock>,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if let Some(counter) = self.counts.get(&self.key, self.clock.now()) {
            if counter.fetch_sub(1, Ordering::AcqRel) == 1 {
                self.counts.remove(&self.key);
            }
        }
    }
}

async fn run<S>(
    mut next: S,
    cfg: Arc<ConnLimitConfig>,
    clock: Arc<dyn Clock>,
    counts: Arc<TtlMap<String, AtomicU32>>,
    req: Request<Body>,
) -> Result<Response<Body>, ProxyError>
where
    S: Service<Request<Body>, Response = Response<Body>, Error = ProxyError> + Send,
    S::Future: Send,
{
    let key = match (cfg.extract)(&req) {
        Ok(k) => k,
        Err(err) => return Ok(cfg.error_handler.handle(&req, &err)),
    };

    let now = clock.now();
    let counter = match counts.get_or_insert(&key, now, || AtomicU32::new(0)) {
        Some(c) => c,
        None => {
            return Ok(cfg.error_handler.handle(
                &req,
                &ProxyError::Internal("connection limiter at capacity".into()),
            ))
        }
    };

    let previous = counter.fetch_add(1, Ordering::AcqRel);
    if previous >= cfg.max_connections {
        counter.fetch_sub(1, Ordering::AcqRel);
        return Ok(cfg
            .error_handler
            .handle(&req, &ProxyError::TooManyConnections));
    }

    let _guard = ReleaseGuard {
        key,
        counts,
        clock,
    };
    next.call(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FrozenClock;

    #[derive(Clone)]
    struct OkService;

    impl Service<Request<Body>> for OkService {
        type Response = Response<Body>;
        type Error = ProxyError;
        type Future =
            Pin<Box<dyn Future<Output = Result<Response<Body>, ProxyError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _req: Request<Body>) -> Self::Future {
            Box::pin(async { Ok(Response::builder().status(200).body(Body::empty()).unwrap()) })
        }
    }

    fn extractor() -> ConnSourceExtractor {
        Arc::new(|_req: &Request<Body>| Ok("only-source".to_string()))
    }

    fn req() -> Request<Body> {
        Request::builder().body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn rejects_once_max_connections_reached() {
        let clock = FrozenClock::new();
        let cfg = ConnLimitConfig::builder(1, extractor()).build().unwrap();
        let layer = ConnLimitLayer::with_clock(cfg, clock.clone());
        let svc = layer.layer(OkService);
        let counts = svc.counts.clone();
        let cfg = svc.cfg.clone();

        let key = "only-source".to_string();
        counts
            .get_or_insert(&key, clock.now(), || AtomicU32::new(0))
            .unwrap()
            .fetch_add(1, Ordering::AcqRel);

        let resp = run(OkService, cfg, svc.clock.clone(), counts, req())
            .await
            .unwrap();
        assert_eq!(resp.status(), http::StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn release_on_exit_prunes_zeroed_key() {
        let clock = FrozenClock::new();
        let cfg = ConnLimitConfig::builder(2, extractor()).build().unwrap();
        let layer = ConnLimitLayer::with_clock(cfg, clock);
        let svc = layer.layer(OkService);
        let resp = run(
            OkService,
            svc.cfg.clone(),
            svc.clock.clone(),
            svc.counts.clone(),
            req(),
        )
        .await
        .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(svc.counts.len(), 0);
    }
}
