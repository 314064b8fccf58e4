//! Weighted round-robin load balancer: GCD interleaving over
//! an ordered backend list, with pluggable sticky-session cookies.

mod config;
mod sticky;

pub use config::{Backend, RequestRewriteListener, RoundRobinConfig, RoundRobinConfigBuilder};
pub use sticky::{CookieCodec, EncryptedCodec, HashedCodec, RawCodec, StickySessionConfig};

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use http::{Request, Response, Uri};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tower::Service;
use tower_layer::Layer;
use tracing::debug;

use crate::error::ProxyError;

/// Backend URL equality: `(scheme, host, path)` only —
/// port and query are not significant.
pub fn backend_eq(a: &Uri, b: &Uri) -> bool {
    a.scheme_str().unwrap_or("http") == b.scheme_str().unwrap_or("http")
        && a.host().unwrap_or("") == b.host().unwrap_or("")
        && a.path() == b.path()
}

/// The canonical string identifying a backend for cookie encoding — the
/// same `(scheme, host, path)` triple `backend_eq` compares by, so a
/// resolved cookie always matches via plain string equality against the
/// current candidate list.
pub fn canonical(uri: &Uri) -> String {
    format!(
        "{}://{}{}",
        uri.scheme_str().unwrap_or("http"),
        uri.host().unwrap_or(""),
        if uri.path().is_empty() { "/" } else { uri.path() }
    )
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

struct Inner {
    servers: Vec<Backend>,
    index: i64,
    current_weight: u64,
}

/// The selection state shared between a [`RoundRobinLayer`] and, when
/// wrapped, a [`crate::rebalancer::RebalancerLayer`]: the server list, the
/// rotating index, and the weighted-interleaving threshold.
pub struct RoundRobinCore {
    inner: Mutex<Inner>,
}

impl RoundRobinCore {
    pub fn new(servers: Vec<Backend>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                servers,
                index: -1,
                current_weight: 0,
            }),
        }
    }

    pub fn servers(&self) -> Vec<Backend> {
        self.inner.lock().servers.clone()
    }

    /// Insert or update a backend's weight; resets the iterator.
    pub fn upsert(&self, backend: Backend) {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.servers.iter_mut().find(|s| backend_eq(&s.url, &backend.url)) {
            existing.weight = backend.weight;
        } else {
            inner.servers.push(backend);
        }
        inner.index = -1;
        inner.current_weight = 0;
    }

    /// Remove every backend matching `url`; resets the iterator.
    pub fn remove(&self, url: &Uri) {
        let mut inner = self.inner.lock();
        inner.servers.retain(|s| !backend_eq(&s.url, url));
        inner.index = -1;
        inner.current_weight = 0;
    }

    /// Replace every backend's weight in place (used by the rebalancer);
    /// resets the iterator.
    pub fn set_weights(&self, weights: &[(Uri, u64)]) {
        let mut inner = self.inner.lock();
        for server in inner.servers.iter_mut() {
            if let Some((_, w)) = weights.iter().find(|(u, _)| backend_eq(u, &server.url)) {
                server.weight = *w;
            }
        }
        inner.index = -1;
        inner.current_weight = 0;
    }

    /// Weighted GCD selection.
    pub fn next(&self) -> Result<Backend, ProxyError> {
        let mut inner = self.inner.lock();
        let n = inner.servers.len();
        if n == 0 {
            return Err(ProxyError::Internal("no backends configured".into()));
        }

        for _ in 0..=(n * 2) {
            let next_index = (inner.index + 1).rem_euclid(n as i64);
            inner.index = next_index;

            if next_index == 0 {
                let all_weights: Vec<u64> = inner.servers.iter().map(|s| s.weight).collect();
                let g = all_weights.iter().copied().fold(0u64, gcd);
                inner.current_weight = inner.current_weight.saturating_sub(g);
                if inner.current_weight == 0 {
                    let max_weight = all_weights.iter().copied().max().unwrap_or(0);
                    if max_weight == 0 {
                        return Err(ProxyError::Internal("all backend weights are zero".into()));
                    }
                    inner.current_weight = max_weight;
                }
            }

            let idx = next_index as usize;
            if inner.servers[idx].weight >= inner.current_weight {
                return Ok(inner.servers[idx].clone());
            }
        }

        Err(ProxyError::Internal("round-robin selection did not converge".into()))
    }

    pub fn find_by_canonical(&self, value: &str) -> Option<Backend> {
        self.inner
            .lock()
            .servers
            .iter()
            .find(|s| canonical(&s.url) == value)
            .cloned()
    }
}

#[derive(Clone)]
pub struct RoundRobinLayer {
    core: Arc<RoundRobinCore>,
    cfg: Arc<RoundRobinConfig>,
}

impl RoundRobinLayer {
    pub fn new(cfg: RoundRobinConfig) -> Self {
        let core = Arc::new(RoundRobinCore::new(cfg.servers.clone()));
        Self {
            core,
            cfg: Arc::new(cfg),
        }
    }

    pub fn core(&self) -> Arc<RoundRobinCore> {
        self.core.clone()
    }

    /// The config this layer was built from, so a wrapping layer (the
    /// rebalancer) can reuse backend selection and URI rewriting without
    /// duplicating it.
    pub(crate) fn config(&self) -> Arc<RoundRobinConfig> {
        self.cfg.clone()
    }

    pub fn upsert_server(&self, backend: Backend) {
        self.core.upsert(backend);
    }

    pub fn remove_server(&self, url: &Uri) {
        self.core.remove(url);
    }
}

impl<S> Layer<S> for RoundRobinLayer {
    type Service = RoundRobinService<S>;

    fn layer(&self, next: S) -> Self::Service {
        RoundRobinService {
            next,
            core: self.core.clone(),
            cfg: self.cfg.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RoundRobinService<S> {
    next: S,
    core: Arc<RoundRobinCore>,
    cfg: Arc<RoundRobinConfig>,
}

impl<S> Service<Request<Body>> for RoundRobinService<S>
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
        let core = self.core.clone();
        let cfg = self.cfg.clone();
        let mut next = self.next.clone();
        std::mem::swap(&mut next, &mut self.next);
        Box::pin(async move { run(next, core, cfg, req).await })
    }
}

pub(crate) fn sticky_backend(cfg: &RoundRobinConfig, core: &RoundRobinCore, req: &Request<Body>) -> Option<Backend> {
    let sticky = cfg.sticky_session.as_ref()?;
    let cookie_value = req
        .headers()
        .get(http::header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|cookies| find_cookie(cookies, &sticky.cookie_name))?;
    let candidates: Vec<String> = core.servers().iter().map(|s| canonical(&s.url)).collect();
    let resolved = sticky.codec.decode(&cookie_value, &candidates)?;
    core.find_by_canonical(&resolved)
}

fn find_cookie(header_value: &str, name: &str) -> Option<String> {
    header_value.split(';').find_map(|pair| {
        let (k, v) = pair.trim().split_once('=')?;
        (k == name).then(|| v.to_string())
    })
}

pub(crate) fn build_target_uri(backend: &Uri, original: &Uri) -> Result<Uri, ProxyError> {
    let scheme = backend.scheme_str().unwrap_or("http");
    let authority = backend
        .authority()
        .ok_or_else(|| ProxyError::Config("backend url missing authority".into()))?;
    let path_and_query = original
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    Uri::builder()
        .scheme(scheme)
        .authority(authority.clone())
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| ProxyError::Internal(e.to_string()))
}

async fn run<S>(
    mut next: S,
    core: Arc<RoundRobinCore>,
    cfg: Arc<RoundRobinConfig>,
    req: Request<Body>,
) -> Result<Response<Body>, ProxyError>
where
    S: Service<Request<Body>, Response = Response<Body>, Error = ProxyError> + Send,
    S::Future: Send,
{
    let chosen = match sticky_backend(&cfg, &core, &req) {
        Some(b) => b,
        None => match core.next() {
            Ok(b) => b,
            Err(err) => return Ok(cfg.error_handler.handle(&req, &err)),
        },
    };

    let (mut parts, body) = req.into_parts();
    let original_uri = parts.uri.clone();
    let new_uri = build_target_uri(&chosen.url, &original_uri)?;
    parts.uri = new_uri;
    let new_req = Request::from_parts(parts, body);

    if let Some(listener) = &cfg.request_rewrite_listener {
        let probe_old = Request::builder().uri(original_uri.clone()).body(Body::empty()).unwrap();
        let probe_new = Request::builder().uri(new_req.uri().clone()).body(Body::empty()).unwrap();
        listener(&probe_old, &probe_new);
    }

    let cancel_token = new_req.extensions().get::<CancellationToken>().cloned();
    debug!(backend = %chosen.url, "round-robin selected backend");
    let mut resp = match cancel_token {
        Some(token) => {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    let probe = Request::builder().uri(original_uri.clone()).body(Body::empty()).unwrap();
                    return Ok(cfg.error_handler.handle(&probe, &ProxyError::Canceled));
                }
                result = next.call(new_req) => result?,
            }
        }
        None => next.call(new_req).await?,
    };

    if let Some(sticky) = &cfg.sticky_session {
        let value = sticky.codec.encode(&canonical(&chosen.url));
        if let Ok(header) = http::HeaderValue::from_str(&format!("{}={}; Path=/", sticky.cookie_name, value)) {
            resp.headers_mut().insert(http::header::SET_COOKIE, header);
        }
    }

    Ok(resp)
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    #[test]
    fn weighted_selection_smooths_bursts() {
        // servers {a:3, b:2, z:0}; first six selections == [a,a,b,a,b,a]
        let core = RoundRobinCore::new(vec![
            Backend::new(uri("http://a.internal"), 3),
            Backend::new(uri("http://b.internal"), 2),
            Backend::new(uri("http://z.internal"), 0),
        ]);
        let picks: Vec<String> = (0..6)
            .map(|_| core.next().unwrap().url.host().unwrap().split('.').next().unwrap().to_string())
            .collect();
        assert_eq!(picks, vec!["a", "a", "b", "a", "b", "a"]);
    }

    #[test]
    fn all_zero_weights_errors() {
        let core = RoundRobinCore::new(vec![Backend::new(uri("http://a.internal"), 0)]);
        assert!(core.next().is_err());
    }

    #[test]
    fn upsert_resets_iterator_state() {
        let core = RoundRobinCore::new(vec![Backend::new(uri("http://a.internal"), 1)]);
        core.next().unwrap();
        core.upsert(Backend::new(uri("http://b.internal"), 1));
        assert_eq!(core.servers().len(), 2);
    }

    #[tokio::test]
    async fn sticky_cookie_pins_to_backend_until_removed() {
        let cfg = RoundRobinConfig::builder()
            .server(uri("http://a.internal"), 1)
            .server(uri("http://b.internal"), 1)
            .sticky_session(StickySessionConfig::raw("sticky"))
            .build()
            .unwrap();
        let layer = RoundRobinLayer::new(cfg);
        let svc = layer.layer(OkService);

        let req = Request::builder()
            .header(http::header::COOKIE, "sticky=http://a.internal/")
            .body(Body::empty())
            .unwrap();
        let resp = run(OkService, svc.core.clone(), svc.cfg.clone(), req)
            .await
            .unwrap();
        let cookie = resp.headers().get(http::header::SET_COOKIE).unwrap().to_str().unwrap();
        assert!(cookie.starts_with("sticky=http://a.internal"));

        layer.remove_server(&uri("http://a.internal"));

        let req2 = Request::builder()
            .header(http::header::COOKIE, "sticky=http://a.internal/")
            .body(Body::empty())
            .unwrap();
        let resp2 = run(OkService, svc.core.clone(), svc.cfg.clone(), req2)
            .await
            .unwrap();
        let cookie2 = resp2
            .headers()
            .get(http::header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(cookie2.starts_with("sticky=http://b.internal"));
    }

    #[tokio::test]
    async fn already_canceled_token_short_circuits_before_calling_next() {
        let cfg = RoundRobinConfig::builder()
            .server(uri("http://a.internal"), 1)
            .build()
            .unwrap();
        let core = Arc::new(RoundRobinCore::new(cfg.servers.clone()));
        let cfg = Arc::new(cfg);

        let token = CancellationToken::new();
        token.cancel();
        let mut req = Request::builder().body(Body::empty()).unwrap();
        req.extensions_mut().insert(token);

        let resp = run(OkService, core, cfg, req).await.unwrap();
        assert_eq!(resp.status(), 499);
    }
}
