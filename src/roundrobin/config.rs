//! Configuration for the round-robin load balancer.

use std::sync::Arc;

use axum::body::Body;
use http::{Request, Uri};

use super::sticky::StickySessionConfig;
use crate::error::{DefaultErrorHandler, ErrorHandler, ProxyError};

/// One backend and its weight. Weight `0` means "never selected unless
/// every backend is weight 0".
#[derive(Debug, Clone)]
pub struct Backend {
    pub url: Uri,
    pub weight: u64,
}

impl Backend {
    pub fn new(url: Uri, weight: u64) -> Self {
        Self { url, weight }
    }
}

/// Invoked after a backend is chosen and the request URI rewritten, with
/// the pre- and post-rewrite requests (the `requestRewriteListener` hook).
pub type RequestRewriteListener =
    Arc<dyn Fn(&Request<Body>, &Request<Body>) + Send + Sync>;

pub struct RoundRobinConfig {
    pub servers: Vec<Backend>,
    pub sticky_session: Option<StickySessionConfig>,
    pub error_handler: Arc<dyn ErrorHandler>,
    pub request_rewrite_listener: Option<RequestRewriteListener>,
}

impl RoundRobinConfig {
    pub fn builder() -> RoundRobinConfigBuilder {
        RoundRobinConfigBuilder::default()
    }
}

#[derive(Default)]
pub struct RoundRobinConfigBuilder {
    servers: Vec<Backend>,
    sticky_session: Option<StickySessionConfig>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    request_rewrite_listener: Option<RequestRewriteListener>,
}

impl RoundRobinConfigBuilder {
    pub fn server(mut self, url: Uri, weight: u64) -> Self {
        self.servers.push(Backend::new(url, weight));
        self
    }

    pub fn servers(mut self, servers: Vec<Backend>) -> Self {
        self.servers = servers;
        self
    }

    pub fn sticky_session(mut self, cfg: StickySessionConfig) -> Self {
        self.sticky_session = Some(cfg);
        self
    }

    pub fn error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = Some(handler);
        self
    }

    pub fn request_rewrite_listener(mut self, f: RequestRewriteListener) -> Self {
        self.request_rewrite_listener = Some(f);
        self
    }

    pub fn build(self) -> Result<RoundRobinConfig, ProxyError> {
        Ok(RoundRobinConfig {
            servers: self.servers,
            sticky_session: self.sticky_session,
            error_handler: self.error_handler.unwrap_or_else(|| Arc::new(DefaultErrorHandler)),
            request_rewrite_listener: self.request_rewrite_listener,
        })
    }
}
