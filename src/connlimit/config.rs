//! Configuration for the connection limiter.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use http::Request;

use crate::error::{DefaultErrorHandler, ErrorHandler, ProxyError};

/// How long an idle source entry is allowed to live in the backstop TTL map
/// before being swept, in case a release is ever missed (panics are caught
/// by the release guard, so this is a safety net, not the primary cleanup
/// path — that is "delete when count reaches zero").
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

pub type ConnSourceExtractor =
    Arc<dyn Fn(&Request<Body>) -> Result<String, ProxyError> + Send + Sync>;

pub struct ConnLimitConfig {
    pub max_connections: u32,
    pub extract: ConnSourceExtractor,
    pub error_handler: Arc<dyn ErrorHandler>,
}

impl ConnLimitConfig {
    pub fn builder(max_connections: u32, extract: ConnSourceExtractor) -> ConnLimitConfigBuilder {
        ConnLimitConfigBuilder {
            max_connections,
            extract,
            error_handler: None,
        }
    }
}

pub struct ConnLimitConfigBuilder {
    max_connections: u32,
    extract: ConnSourceExtractor,
    error_handler: Option<Arc<dyn ErrorHandler>>,
}

impl ConnLimitConfigBuilder {
    pub fn error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = Some(handler);
        self
    }

    pub fn build(self) -> Result<ConnLimitConfig, ProxyError> {
        if self.max_connections == 0 {
            return Err(ProxyError::Config("max_connections must be >= 1".into()));
        }
        Ok(ConnLimitConfig {
            max_connections: self.max_connections,
            extract: self.extract,
            error_handler: self.error_handler.unwrap_or_else(|| Arc::new(DefaultErrorHandler)),
        })
    }
}
