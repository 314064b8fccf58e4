//! Composable `tower` middleware for reverse proxies.
//!
//! Each module is an independent [`tower_layer::Layer`]/[`tower::Service`]
//! pair that can be stacked in any order with `tower::ServiceBuilder`:
//!
//! - [`buffer`] — request/response buffering with retry-on-predicate
//! - [`cbreaker`] — a per-route circuit breaker over rolling metrics
//! - [`ratelimit`] — per-source token-bucket rate limiting
//! - [`connlimit`] — per-source concurrent-connection limiting
//! - [`roundrobin`] — weighted round-robin load balancing with sticky
//!   sessions
//! - [`rebalancer`] — an adaptive weight controller wrapped around
//!   [`roundrobin`]
//!
//! [`clock`], [`metrics`], [`predicate`], and [`ttlmap`] are the shared
//! substrate the above build on: a process-wide virtual/real clock, rolling
//! counters and histograms, the small predicate language circuit-breaker
//! and buffer retry rules are written in, and a generic TTL-evicted map.

pub mod buffer;
pub mod cbreaker;
pub mod clock;
pub mod connlimit;
pub mod error;
pub mod metrics;
pub mod predicate;
pub mod ratelimit;
pub mod rebalancer;
pub mod roundrobin;
pub mod ttlmap;

pub use buffer::{BufferConfig, BufferConfigBuilder, BufferLayer};
pub use cbreaker::{CircuitBreakerConfig, CircuitBreakerConfigBuilder, CircuitBreakerLayer};
pub use clock::{Clock, FrozenClock, SystemClock};
pub use connlimit::{ConnLimitConfig, ConnLimitConfigBuilder, ConnLimitLayer};
pub use error::{DefaultErrorHandler, ErrorHandler, ProxyError};
pub use ratelimit::{RateLimiterConfig, RateLimiterConfigBuilder, RateLimiterLayer};
pub use rebalancer::{RebalancerConfig, RebalancerConfigBuilder, RebalancerLayer};
pub use roundrobin::{Backend, RoundRobinConfig, RoundRobinConfigBuilder, RoundRobinLayer};
