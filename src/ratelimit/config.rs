//! Configuration for the rate limiter.

use std::sync::Arc;

use axum::body::Body;
use http::Request;

use super::bucket::Rate;
use crate::error::{DefaultErrorHandler, ErrorHandler, ProxyError};

pub const DEFAULT_CAPACITY: usize = 65536;

/// Maps a request to `(source key, amount)`, e.g. client IP and a token
/// cost of 1 per request. Errors surface through the configured
/// [`ErrorHandler`] as a 500.
pub type SourceExtractor =
    Arc<dyn Fn(&Request<Body>) -> Result<(String, u64), ProxyError> + Send + Sync>;

/// Optional per-request override of the rate plan to apply, e.g. a premium
/// tier extracted from an API key. `Ok(None)` or an empty vec falls back to
/// `default_rates`.
pub type RateExtractor =
    Arc<dyn Fn(&Request<Body>) -> Result<Option<Vec<Rate>>, ProxyError> + Send + Sync>;

pub struct RateLimiterConfig {
    pub default_rates: Vec<Rate>,
    pub extract: SourceExtractor,
    pub extract_rates: Option<RateExtractor>,
    pub capacity: usize,
    pub error_handler: Arc<dyn ErrorHandler>,
}

impl RateLimiterConfig {
    pub fn builder(default_rates: Vec<Rate>, extract: SourceExtractor) -> RateLimiterConfigBuilder {
        RateLimiterConfigBuilder {
            default_rates,
            extract,
            extract_rates: None,
            capacity: None,
            error_handler: None,
        }
    }
}

pub struct RateLimiterConfigBuilder {
    default_rates: Vec<Rate>,
    extract: SourceExtractor,
    extract_rates: Option<RateExtractor>,
    capacity: Option<usize>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
}

impl RateLimiterConfigBuilder {
    pub fn extract_rates(mut self, f: RateExtractor) -> Self {
        self.extract_rates = Some(f);
        self
    }

    pub fn capacity(mut self, n: usize) -> Self {
        self.capacity = Some(n);
        self
    }

    pub fn error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = Some(handler);
        self
    }

    pub fn build(self) -> Result<RateLimiterConfig, ProxyError> {
        if self.default_rates.is_empty() {
            return Err(ProxyError::Config(
                "default_rates must be non-empty".into(),
            ));
        }
        Ok(RateLimiterConfig {
            default_rates: self.default_rates,
            extract: self.extract,
            extract_rates: self.extract_rates,
            capacity: self.capacity.unwrap_or(DEFAULT_CAPACITY),
            error_handler: self.error_handler.unwrap_or_else(|| Arc::new(DefaultErrorHandler)),
        })
    }
}
