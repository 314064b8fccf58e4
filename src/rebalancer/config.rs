//! Configuration for the adaptive rebalancer.

use std::sync::Arc;
use std::time::Duration;

use super::meter::Meter;
use crate::clock::Clock;
use crate::error::ProxyError;
use crate::roundrobin::{RequestRewriteListener, StickySessionConfig};

pub const DEFAULT_BACKOFF_DURATION: Duration = Duration::from_secs(10);

/// Builds one meter per backend as it is registered.
pub type MeterFactory = Arc<dyn Fn(Arc<dyn Clock>) -> Arc<dyn Meter> + Send + Sync>;

pub struct RebalancerConfig {
    pub backoff_duration: Duration,
    pub meter_factory: MeterFactory,
    pub sticky_session: Option<StickySessionConfig>,
    pub request_rewrite_listener: Option<RequestRewriteListener>,
}

impl RebalancerConfig {
    pub fn builder(meter_factory: MeterFactory) -> RebalancerConfigBuilder {
        RebalancerConfigBuilder {
            backoff_duration: None,
            meter_factory,
            sticky_session: None,
            request_rewrite_listener: None,
        }
    }
}

pub struct RebalancerConfigBuilder {
    backoff_duration: Option<Duration>,
    meter_factory: MeterFactory,
    sticky_session: Option<StickySessionConfig>,
    request_rewrite_listener: Option<RequestRewriteListener>,
}

impl RebalancerConfigBuilder {
    pub fn backoff_duration(mut self, d: Duration) -> Self {
        self.backoff_duration = Some(d);
        self
    }

    pub fn sticky_session(mut self, cfg: StickySessionConfig) -> Self {
        self.sticky_session = Some(cfg);
        self
    }

    pub fn request_rewrite_listener(mut self, f: RequestRewriteListener) -> Self {
        self.request_rewrite_listener = Some(f);
        self
    }

    pub fn build(self) -> Result<RebalancerConfig, ProxyError> {
        Ok(RebalancerConfig {
            backoff_duration: self.backoff_duration.unwrap_or(DEFAULT_BACKOFF_DURATION),
            meter_factory: self.meter_factory,
            sticky_session: self.sticky_session,
            request_rewrite_listener: self.request_rewrite_listener,
        })
    }
}
