//! Configuration for the circuit breaker.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{DefaultErrorHandler, ErrorHandler, ProxyError};
use crate::predicate::{Predicate, BREAKER_FUNCTIONS};

pub const DEFAULT_FALLBACK_DURATION: Duration = Duration::from_secs(10);
pub const DEFAULT_RECOVERY_DURATION: Duration = Duration::from_secs(10);
pub const DEFAULT_CHECK_PERIOD: Duration = Duration::from_millis(100);

/// Fired on a Standby/Recovering → Tripped or Recovering → Standby
/// transition. Runs on a detached task; panics/errors are logged, never
/// surfaced to the caller.
pub type TransitionHook = Arc<dyn Fn() + Send + Sync>;

pub struct CircuitBreakerConfig {
    pub tripping_predicate: Predicate,
    pub fallback_duration: Duration,
    pub recovery_duration: Duration,
    pub check_period: Duration,
    pub on_tripped: Option<TransitionHook>,
    pub on_standby: Option<TransitionHook>,
    pub fallback_handler: Arc<dyn ErrorHandler>,
}

impl CircuitBreakerConfig {
    pub fn builder(expression: impl Into<String>) -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder {
            expression: expression.into(),
            fallback_duration: None,
            recovery_duration: None,
            check_period: None,
            on_tripped: None,
            on_standby: None,
            fallback_handler: None,
        }
    }
}

pub struct CircuitBreakerConfigBuilder {
    expression: String,
    fallback_duration: Option<Duration>,
    recovery_duration: Option<Duration>,
    check_period: Option<Duration>,
    on_tripped: Option<TransitionHook>,
    on_standby: Option<TransitionHook>,
    fallback_handler: Option<Arc<dyn ErrorHandler>>,
}

impl CircuitBreakerConfigBuilder {
    pub fn fallback_duration(mut self, d: Duration) -> Self {
        self.fallback_duration = Some(d);
        self
    }

    pub fn recovery_duration(mut self, d: Duration) -> Self {
        self.recovery_duration = Some(d);
        self
    }

    pub fn check_period(mut self, d: Duration) -> Self {
        self.check_period = Some(d);
        self
    }

    pub fn on_tripped(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_tripped = Some(Arc::new(f));
        self
    }

    pub fn on_standby(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_standby = Some(Arc::new(f));
        self
    }

    pub fn fallback_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.fallback_handler = Some(handler);
        self
    }

    pub fn build(self) -> Result<CircuitBreakerConfig, ProxyError> {
        let tripping_predicate = Predicate::compile(&self.expression, &BREAKER_FUNCTIONS)?;
        Ok(CircuitBreakerConfig {
            tripping_predicate,
            fallback_duration: self.fallback_duration.unwrap_or(DEFAULT_FALLBACK_DURATION),
            recovery_duration: self.recovery_duration.unwrap_or(DEFAULT_RECOVERY_DURATION),
            check_period: self.check_period.unwrap_or(DEFAULT_CHECK_PERIOD),
            on_tripped: self.on_tripped,
            on_standby: self.on_standby,
            fallback_handler: self.fallback_handler.unwrap_or_else(|| Arc::new(DefaultErrorHandler)),
        })
    }
}
