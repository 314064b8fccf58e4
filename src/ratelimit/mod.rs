//! Rate limiter middleware: per-source multi-period token
//! buckets, TTL-evicted, with atomic multi-bucket reservation/rollback.

mod bucket;
mod config;

pub use bucket::{BucketSet, ConsumeOutcome, ExceedsBurst, Rate, TokenBucket};
pub use config::{RateExtractor, RateLimiterConfig, RateLimiterConfigBuilder, SourceExtractor};

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use http::{Request, Response};
use parking_lot::Mutex;
use tower::Service;
use tower_layer::Layer;
use tracing::debug;

use crate::clock::{self, Clock};
use crate::error::ProxyError;
use crate::ttlmap::TtlMap;

/// One bucket set per source key, with the TTL sized to `10 * max_period +
/// 1s` for whichever rate plan created it.
struct BucketSetSlot {
    set: Mutex<BucketSet>,
}

#[derive(Clone)]
pub struct RateLimiterLayer {
    cfg: Arc<RateLimiterConfig>,
    clock: Arc<dyn Clock>,
    store: Arc<TtlMap<String, BucketSetSlot>>,
}

impl RateLimiterLayer {
    pub fn new(cfg: RateLimiterConfig) -> Self {
        Self::with_clock(cfg, clock::global())
    }

    pub fn with_clock(cfg: RateLimiterConfig, clock: Arc<dyn Clock>) -> Self {
        let capacity = cfg.capacity;
        // The map's own `ttl` is a default only used if a store is ever
        // inserted without going through `store_for` (never happens); each
        // real insert sets its own expiry via `TtlMap::get_or_insert`'s
        // shared `ttl`, sized here to the *default* rate plan's max period.
        // Per-request rate overrides that imply a different horizon still
        // use this map; the 10x margin comfortably covers slower custom
        // plans too since TTL is a cleanup backstop, not a correctness
        // requirement.
        let default_max_period = cfg
            .default_rates
            .iter()
            .map(|r| r.period)
            .max()
            .unwrap_or(Duration::from_secs(1));
        let ttl = default_max_period * 10 + Duration::from_secs(1);
        Self {
            cfg: Arc::new(cfg),
            clock,
            store: Arc::new(TtlMap::new(ttl, capacity)),
        }
    }
}

impl<S> Layer<S> for RateLimiterLayer {
    type Service = RateLimiterService<S>;

    fn layer(&self, next: S) -> Self::Service {
        RateLimiterService {
            next,
            cfg: self.cfg.clone(),
            clock: self.clock.clone(),
            store: self.store.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RateLimiterService<S> {
    next: S,
    cfg: Arc<RateLimiterConfig>,
    clock: Arc<dyn Clock>,
    store: Arc<TtlMap<String, BucketSetSlot>>,
}

impl<S> Service<Request<Body>> for RateLimiterService<S>
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
        let store = self.store.clone();
        let mut next = self.next.clone();
        std::mem::swap(&mut next, &mut self.next);
        Box::pin(async move { run(next, cfg, clock, store, req).await })
    }
}

async fn run<S>(
    mut next: S,
    cfg: Arc<RateLimiterConfig>,
    clock: Arc<dyn Clock>,
    store: Arc<TtlMap<String, BucketSetSlot>>,
    req: Request<Body>,
) -> Result<Response<Body>, ProxyError>
where
    S: Service<Request<Body>, Response = Response<Body>, Error = ProxyError> + Send,
    S::Future: Send,
{
    let (source, amount) = match (cfg.extract)(&req) {
        Ok(v) => v,
        Err(err) => return Ok(cfg.error_handler.handle(&req, &err)),
    };

    let rates = match &cfg.extract_rates {
        Some(extract) => match extract(&req) {
            Ok(Some(r)) if !r.is_empty() => r,
            Ok(_) => cfg.default_rates.clone(),
            Err(err) => return Ok(cfg.error_handler.handle(&req, &err)),
        },
        None => cfg.default_rates.clone(),
    };

    let now = clock.now();
    let slot = store.get_or_insert(&source, now, || BucketSetSlot {
        set: Mutex::new(BucketSet::new(&rates, now)),
    });
    let slot = match slot {
        Some(s) => s,
        None => {
            return Ok(cfg.error_handler.handle(
                &req,
                &ProxyError::Internal("rate limiter at capacity".into()),
            ))
        }
    };

    let outcome = slot.set.lock().consume(amount, now);

    if let Some(exceeds) = outcome.exceeds_burst {
        debug!(
            source,
            requested = exceeds.requested,
            burst = exceeds.burst,
            "rate limit request exceeds bucket burst"
        );
        return Ok(cfg.error_handler.handle(
            &req,
            &ProxyError::Internal(format!(
                "requested amount {} exceeds burst capacity {}",
                exceeds.requested, exceeds.burst
            )),
        ));
    }

    if outcome.delay > Duration::ZERO {
        debug!(source, delay_ms = outcome.delay.as_millis() as u64, "rate limited");
        return Ok(cfg.error_handler.handle(
            &req,
            &ProxyError::RateLimited {
                retry_after: outcome.delay,
            },
        ));
    }

    next.call(req).await
}
