//! Rolling metrics substrate shared by the circuit breaker and the
//! rebalancer: fixed-window counters, sliding HDR-histogram windows,
//! and the `RTMetrics` aggregate built on top of both.

pub mod counter;
pub mod histogram;
pub mod percentiles;
pub mod rt;

pub use counter::RollingCounter;
pub use histogram::RollingHistogram;
pub use percentiles::PercentileSet;
pub use rt::{RTMetrics, RtMetricsSnapshot};
