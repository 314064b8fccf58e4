//! Request/response buffering with retry-on-predicate.
//!
//! Wraps `next` so that:
//! 1. a request whose declared `Content-Length` already exceeds the
//!    configured max is rejected before `next` ever sees it (413),
//! 2. the request body is fully read into a [`MultiBuffer`] so it can be
//!    replayed verbatim across attempts,
//! 3. the response is buffered the same way, and handed to the retry
//!    predicate along with attempt count and network-error status,
//! 4. as long as the predicate says to retry (and attempts remain), the
//!    buffered request is rewound and sent to `next` again.

mod body;
mod config;

pub use body::MultiBuffer;
pub use config::{BufferConfig, BufferConfigBuilder, DEFAULT_MEM_BODY_BYTES};

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use http::{Request, Response};
use tokio_util::sync::CancellationToken;
use tower::Service;
use tower_layer::Layer;
use tracing::{debug, warn};

use crate::error::ProxyError;
use crate::predicate::RetryContext;

#[derive(Clone)]
pub struct BufferLayer {
    cfg: Arc<BufferConfig>,
}

impl BufferLayer {
    pub fn new(cfg: BufferConfig) -> Self {
        Self { cfg: Arc::new(cfg) }
    }
}

impl<S> Layer<S> for BufferLayer {
    type Service = BufferService<S>;

    fn layer(&self, next: S) -> Self::Service {
        BufferService {
            next,
            cfg: self.cfg.clone(),
        }
    }
}

#[derive(Clone)]
pub struct BufferService<S> {
    next: S,
    cfg: Arc<BufferConfig>,
}

impl<S> Service<Request<Body>> for BufferService<S>
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
        let mut next = self.next.clone();
        std::mem::swap(&mut next, &mut self.next);
        Box::pin(async move { run(next, cfg, req).await })
    }
}

fn content_length_exceeds(req: &Request<Body>, max: u64) -> bool {
    if max == 0 {
        return false;
    }
    req.headers()
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(|len| len > max)
        .unwrap_or(false)
}

/// 304 and other bodyless statuses, and gRPC trailers-only responses
/// (`Grpc-Status` present with no `Content-Length`), are passed through
/// without buffering — there is nothing meaningful to retry against.
fn response_bypasses_buffering(resp: &Response<Body>) -> bool {
    if resp.status() == http::StatusCode::NOT_MODIFIED {
        return true;
    }
    if resp.headers().contains_key("grpc-status") {
        return true;
    }
    false
}

async fn run<S>(
    mut next: S,
    cfg: Arc<BufferConfig>,
    req: Request<Body>,
) -> Result<Response<Body>, ProxyError>
where
    S: Service<Request<Body>, Response = Response<Body>, Error = ProxyError> + Send,
    S::Future: Send,
{
    if content_length_exceeds(&req, cfg.max_request_body_bytes) {
        let err = ProxyError::RequestTooLarge {
            limit: cfg.max_request_body_bytes,
            actual: req
                .headers()
                .get(http::header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok()),
        };
        return Ok(cfg.error_handler.handle(&req, &err));
    }

    let (parts, body) = req.into_parts();
    let method = parts.method.clone();
    let uri = parts.uri.clone();
    let version = parts.version;
    let headers = parts.headers.clone();
    let mut extensions = Some(parts.extensions);
    // Kept separately from `extensions` (which is handed to the first
    // attempt and then consumed) so every retry can still race against the
    // client's cancellation, not just the first attempt.
    let cancel_token = extensions
        .as_ref()
        .and_then(|ext| ext.get::<CancellationToken>())
        .cloned();
    let max_req = (cfg.max_request_body_bytes > 0).then_some(cfg.max_request_body_bytes);
    let probe_req = || {
        let mut r = Request::new(Body::empty());
        *r.method_mut() = method.clone();
        *r.uri_mut() = uri.clone();
        *r.headers_mut() = headers.clone();
        r
    };
    let buffered_req = match MultiBuffer::fill(body, cfg.mem_request_body_bytes, max_req).await {
        Ok(b) => b,
        Err(err) => return Ok(cfg.error_handler.handle(&probe_req(), &err)),
    };

    if cfg.verbose {
        debug!(bytes = buffered_req.total_len(), "buffered request body");
    }

    let mut attempts: u32 = 0;
    loop {
        attempts += 1;
        let attempt_body = buffered_req.to_body()?;
        let mut attempt_req = Request::new(attempt_body);
        *attempt_req.method_mut() = method.clone();
        *attempt_req.uri_mut() = uri.clone();
        *attempt_req.version_mut() = version;
        *attempt_req.headers_mut() = headers.clone();
        if let Some(ext) = extensions.take() {
            *attempt_req.extensions_mut() = ext;
        }
        if buffered_req.total_len() > 0 {
            attempt_req.headers_mut().insert(
                http::header::CONTENT_LENGTH,
                http::HeaderValue::from_str(&buffered_req.total_len().to_string())
                    .map_err(|e| ProxyError::Internal(e.to_string()))?,
            );
        }
        attempt_req.headers_mut().remove(http::header::TRANSFER_ENCODING);

        let outcome = std::future::poll_fn(|cx| next.poll_ready(cx))
            .await
            .map_err(|e| ProxyError::Internal(e.to_string()));
        let result = match outcome {
            Ok(()) => match &cancel_token {
                Some(token) => {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => Err(ProxyError::Canceled),
                        result = next.call(attempt_req) => result,
                    }
                }
                None => next.call(attempt_req).await,
            },
            Err(e) => Err(e),
        };

        let (is_network_error, response_code, response, failure) = match result {
            Ok(resp) => (false, resp.status().as_u16(), Some(resp), None),
            Err(err) => (
                matches!(err, ProxyError::Network { .. } | ProxyError::Io(_)),
                err.status_code().as_u16(),
                None,
                Some(err),
            ),
        };

        let should_retry = match &cfg.retry {
            Some(predicate) if attempts < cfg.max_attempts => {
                let ctx = RetryContext {
                    attempts,
                    response_code,
                    is_network_error,
                };
                predicate.eval(&ctx)
            }
            _ => false,
        };

        match response {
            Some(resp) if should_retry => {
                if cfg.verbose {
                    debug!(attempts, response_code, "retry predicate matched, retrying");
                }
                drop(resp);
                continue;
            }
            Some(resp) => {
                return match buffer_response(resp, &cfg).await {
                    Ok(resp) => Ok(resp),
                    Err(err @ ProxyError::ResponseTooLarge { .. }) => {
                        Ok(cfg.error_handler.handle(&probe_req(), &err))
                    }
                    Err(err) => Err(err),
                }
            }
            None if should_retry => {
                if cfg.verbose {
                    warn!(attempts, "attempt failed, retrying per predicate");
                }
                continue;
            }
            None => return Err(failure.expect("failure set whenever response is None")),
        }
    }
}

async fn buffer_response(
    resp: Response<Body>,
    cfg: &BufferConfig,
) -> Result<Response<Body>, ProxyError> {
    if response_bypasses_buffering(&resp) {
        return Ok(resp);
    }

    let (parts, body) = resp.into_parts();
    let max_resp = (cfg.max_response_body_bytes > 0).then_some(cfg.max_response_body_bytes);
    let buffered = match MultiBuffer::fill(body, cfg.mem_response_body_bytes, max_resp).await {
        Ok(b) => b,
        Err(ProxyError::RequestTooLarge { limit, actual }) => {
            return Err(ProxyError::ResponseTooLarge {
                limit: actual.unwrap_or(limit),
            })
        }
        Err(e) => return Err(e),
    };

    let mut response = Response::from_parts(parts, buffered.to_body()?);
    if buffered.total_len() > 0 {
        response.headers_mut().insert(
            http::header::CONTENT_LENGTH,
            http::HeaderValue::from_str(&buffered.total_len().to_string())
                .map_err(|e| ProxyError::Internal(e.to_string()))?,
        );
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Clone)]
    struct FlakyService {
        failures_remaining: Arc<AtomicU32>,
    }

    impl Service<Request<Body>> for FlakyService {
        type Response = Response<Body>;
        type Error = ProxyError;
        type Future =
            Pin<Box<dyn Future<Output = Result<Response<Body>, ProxyError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: Request<Body>) -> Self::Future {
            let failures = self.failures_remaining.clone();
            Box::pin(async move {
                let body = http_body_util::BodyExt::collect(req.into_body())
                    .await
                    .expect("test body collects cleanly")
                    .to_bytes();
                if failures.load(Ordering::SeqCst) > 0 {
                    failures.fetch_sub(1, Ordering::SeqCst);
                    return Ok(Response::builder()
                        .status(502)
                        .body(Body::from("bad gateway"))
                        .unwrap());
                }
                Ok(Response::builder()
                    .status(200)
                    .body(Body::from(body))
                    .unwrap())
            })
        }
    }

    fn retrying_config() -> BufferConfig {
        BufferConfig::builder()
            .retry("IsNetworkError() && Attempts() < 3 || ResponseCode() == 502 && Attempts() < 3")
            .max_attempts(3)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn succeeds_without_retry_when_upstream_is_healthy() {
        let svc = FlakyService {
            failures_remaining: Arc::new(AtomicU32::new(0)),
        };
        let cfg = Arc::new(retrying_config());
        let req = Request::builder()
            .body(Body::from("ping"))
            .unwrap();
        let resp = run(svc, cfg, req).await.unwrap();
        assert_eq!(resp.status(), 200);
    }

    #[tokio::test]
    async fn replays_identical_request_body_across_retries() {
        let svc = FlakyService {
            failures_remaining: Arc::new(AtomicU32::new(2)),
        };
        let cfg = Arc::new(retrying_config());
        let req = Request::builder()
            .body(Body::from("payload-xyz"))
            .unwrap();
        let resp = run(svc, cfg, req).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body = http_body_util::BodyExt::collect(resp.into_body())
            .await
            .unwrap()
            .to_bytes();
        assert_eq!(&body[..], b"payload-xyz");
    }

    #[tokio::test]
    async fn oversized_request_is_rejected_before_next_runs() {
        let svc = FlakyService {
            failures_remaining: Arc::new(AtomicU32::new(0)),
        };
        let cfg = Arc::new(
            BufferConfig::builder()
                .max_request_body_bytes(4)
                .build()
                .unwrap(),
        );
        let req = Request::builder()
            .header(http::header::CONTENT_LENGTH, "100")
            .body(Body::from("way too big"))
            .unwrap();
        let resp = run(svc, cfg, req).await.unwrap();
        assert_eq!(resp.status(), http::StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn not_modified_response_bypasses_buffering() {
        assert!(response_bypasses_buffering(
            &Response::builder()
                .status(304)
                .body(Body::empty())
                .unwrap()
        ));
    }

    #[derive(Clone)]
    struct HangingService;

    impl Service<Request<Body>> for HangingService {
        type Response = Response<Body>;
        type Error = ProxyError;
        type Future =
            Pin<Box<dyn Future<Output = Result<Response<Body>, ProxyError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _req: Request<Body>) -> Self::Future {
            Box::pin(std::future::pending())
        }
    }

    #[tokio::test]
    async fn canceled_token_short_circuits_a_hanging_attempt() {
        let token = CancellationToken::new();
        token.cancel();
        let mut req = Request::builder().body(Body::from("ping")).unwrap();
        req.extensions_mut().insert(token);

        let cfg = Arc::new(retrying_config());
        let err = run(HangingService, cfg, req).await.unwrap_err();
        assert!(matches!(err, ProxyError::Canceled));
    }
}
