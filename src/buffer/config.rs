//! Configuration for the buffer middleware.

use std::sync::Arc;

use crate::error::{DefaultErrorHandler, ErrorHandler, ProxyError};
use crate::predicate::{Predicate, RETRY_FUNCTIONS};

pub const DEFAULT_MEM_BODY_BYTES: u64 = 1024 * 1024; // 1 MiB

/// `0` means "no limit" everywhere in this config, matching the
/// invariant; a negative value has no representation in `u64` so it is
/// rejected structurally rather than at runtime.
pub struct BufferConfig {
    pub mem_request_body_bytes: u64,
    pub max_request_body_bytes: u64,
    pub mem_response_body_bytes: u64,
    pub max_response_body_bytes: u64,
    pub retry: Option<Predicate>,
    pub max_attempts: u32,
    pub error_handler: Arc<dyn ErrorHandler>,
    pub verbose: bool,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            mem_request_body_bytes: DEFAULT_MEM_BODY_BYTES,
            max_request_body_bytes: 0,
            mem_response_body_bytes: DEFAULT_MEM_BODY_BYTES,
            max_response_body_bytes: 0,
            retry: None,
            max_attempts: 1,
            error_handler: Arc::new(DefaultErrorHandler),
            verbose: false,
        }
    }
}

impl BufferConfig {
    pub fn builder() -> BufferConfigBuilder {
        BufferConfigBuilder::default()
    }
}

#[derive(Default)]
pub struct BufferConfigBuilder {
    cfg: PartialConfig,
}

#[derive(Default)]
struct PartialConfig {
    mem_request_body_bytes: Option<u64>,
    max_request_body_bytes: Option<u64>,
    mem_response_body_bytes: Option<u64>,
    max_response_body_bytes: Option<u64>,
    retry_expr: Option<String>,
    max_attempts: Option<u32>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    verbose: bool,
}

impl BufferConfigBuilder {
    pub fn mem_request_body_bytes(mut self, n: u64) -> Self {
        self.cfg.mem_request_body_bytes = Some(n);
        self
    }

    pub fn max_request_body_bytes(mut self, n: u64) -> Self {
        self.cfg.max_request_body_bytes = Some(n);
        self
    }

    pub fn mem_response_body_bytes(mut self, n: u64) -> Self {
        self.cfg.mem_response_body_bytes = Some(n);
        self
    }

    pub fn max_response_body_bytes(mut self, n: u64) -> Self {
        self.cfg.max_response_body_bytes = Some(n);
        self
    }

    /// The retry predicate expression, e.g. `"Attempts() < 3 && IsNetworkError()"`.
    /// Compiled (and validated) at `build()` time.
    pub fn retry(mut self, expr: impl Into<String>) -> Self {
        self.cfg.retry_expr = Some(expr.into());
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.cfg.max_attempts = Some(n);
        self
    }

    pub fn error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.cfg.error_handler = Some(handler);
        self
    }

    pub fn verbose(mut self, v: bool) -> Self {
        self.cfg.verbose = v;
        self
    }

    pub fn build(self) -> Result<BufferConfig, ProxyError> {
        let defaults = BufferConfig::default();
        let retry = self
            .cfg
            .retry_expr
            .map(|expr| Predicate::compile(&expr, &RETRY_FUNCTIONS))
            .transpose()?;
        let max_attempts = self.cfg.max_attempts.unwrap_or(if retry.is_some() { 3 } else { 1 });
        if max_attempts == 0 {
            return Err(ProxyError::Config("max_attempts must be >= 1".into()));
        }
        Ok(BufferConfig {
            mem_request_body_bytes: self
                .cfg
                .mem_request_body_bytes
                .unwrap_or(defaults.mem_request_body_bytes),
            max_request_body_bytes: self
                .cfg
                .max_request_body_bytes
                .unwrap_or(defaults.max_request_body_bytes),
            mem_response_body_bytes: self
                .cfg
                .mem_response_body_bytes
                .unwrap_or(defaults.mem_response_body_bytes),
            max_response_body_bytes: self
                .cfg
                .max_response_body_bytes
                .unwrap_or(defaults.max_response_body_bytes),
            retry,
            max_attempts,
            error_handler: self.cfg.error_handler.unwrap_or(defaults.error_handler),
            verbose: self.cfg.verbose,
        })
    }
}
