//! Shared error model and the error-handler contract.

use std::fmt;
use std::time::Duration;

use axum::body::Body;
use http::{Request, Response, StatusCode};

/// Everything a middleware in this crate can fail with, surfaced either as
/// an HTTP response (via an [`ErrorHandler`]) or, for configuration errors,
/// returned directly from a constructor.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("request body exceeds limit ({limit} bytes, got {actual:?})")]
    RequestTooLarge { limit: u64, actual: Option<u64> },

    #[error("response body exceeds limit ({limit} bytes)")]
    ResponseTooLarge { limit: u64 },

    #[error("source extraction failed: {0}")]
    Extraction(String),

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("too many concurrent connections for source")]
    TooManyConnections,

    #[error("circuit open")]
    CircuitOpen,

    #[error("request was canceled by the client")]
    Canceled,

    #[error("upstream I/O error: {0}")]
    Io(String),

    #[error("upstream network error (timeout={timeout}): {0}")]
    Network { source: String, timeout: bool },

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// The default status-code mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::Canceled => StatusCode::from_u16(499).unwrap(),
            ProxyError::RequestTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::ResponseTooLarge { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Extraction(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::TooManyConnections => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::CircuitOpen => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Io(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Network { timeout, .. } => {
                if *timeout {
                    StatusCode::GATEWAY_TIMEOUT
                } else {
                    StatusCode::BAD_GATEWAY
                }
            }
            ProxyError::Config(_) | ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Invoked whenever a middleware needs to turn a [`ProxyError`] into a
/// response instead of calling `next`. Middleware construction never fails
/// because of an error handler — this is purely a runtime hook.
pub trait ErrorHandler: Send + Sync {
    fn handle(&self, req: &Request<Body>, err: &ProxyError) -> Response<Body>;
}

/// The default status-code mapping, with `Retry-After` /
/// `X-Retry-In` attached for [`ProxyError::RateLimited`].
#[derive(Default, Clone, Copy)]
pub struct DefaultErrorHandler;

impl ErrorHandler for DefaultErrorHandler {
    fn handle(&self, _req: &Request<Body>, err: &ProxyError) -> Response<Body> {
        let status = err.status_code();
        let mut builder = Response::builder().status(status);

        if let ProxyError::RateLimited { retry_after } = err {
            let secs = retry_after.as_secs_f64().ceil() as u64;
            builder = builder
                .header("Retry-After", secs.to_string())
                .header("X-Retry-In", format!("{:.3}s", retry_after.as_secs_f64()));
        }

        builder
            .body(Body::from(err.to_string()))
            .unwrap_or_else(|_| {
                Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())
                    .expect("static response is well-formed")
            })
    }
}

impl<F> ErrorHandler for F
where
    F: Fn(&Request<Body>, &ProxyError) -> Response<Body> + Send + Sync,
{
    fn handle(&self, req: &Request<Body>, err: &ProxyError) -> Response<Body> {
        self(req, err)
    }
}

impl fmt::Debug for dyn ErrorHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ErrorHandler")
    }
}
