//! Function tables and concrete [`super::PredicateContext`] implementations
//! for the two predicate families this crate defines: the circuit breaker's
//! tripping predicate and the buffer middleware's retry predicate.

use std::collections::HashMap;
use std::sync::OnceLock;

use super::PredicateContext;
use crate::metrics::RTMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnType {
    Num,
    Bool,
}

#[derive(Debug, Clone, Copy)]
pub struct FunctionSig {
    pub arity: usize,
    pub returns: ReturnType,
}

pub struct FunctionTable(HashMap<&'static str, FunctionSig>);

impl FunctionTable {
    pub fn get(&self, name: &str) -> Option<FunctionSig> {
        self.0.get(name).copied()
    }
}

/// `NetworkErrorRatio()`, `LatencyAtQuantileMS(q)`,
/// `ResponseCodeRatio(aStart, aEnd, bStart, bEnd)`.
pub static BREAKER_FUNCTIONS: OnceLockTable = OnceLockTable::new(|| {
    HashMap::from([
        (
            "NetworkErrorRatio",
            FunctionSig {
                arity: 0,
                returns: ReturnType::Num,
            },
        ),
        (
            "LatencyAtQuantileMS",
            FunctionSig {
                arity: 1,
                returns: ReturnType::Num,
            },
        ),
        (
            "ResponseCodeRatio",
            FunctionSig {
                arity: 4,
                returns: ReturnType::Num,
            },
        ),
    ])
});

/// `Attempts()`, `ResponseCode()`, `IsNetworkError()`.
pub static RETRY_FUNCTIONS: OnceLockTable = OnceLockTable::new(|| {
    HashMap::from([
        (
            "Attempts",
            FunctionSig {
                arity: 0,
                returns: ReturnType::Num,
            },
        ),
        (
            "ResponseCode",
            FunctionSig {
                arity: 0,
                returns: ReturnType::Num,
            },
        ),
        (
            "IsNetworkError",
            FunctionSig {
                arity: 0,
                returns: ReturnType::Bool,
            },
        ),
    ])
});

/// A lazily-built, process-wide constant [`FunctionTable`]. Exists only so
/// `BREAKER_FUNCTIONS`/`RETRY_FUNCTIONS` can be plain `static`s usable with
/// `&BREAKER_FUNCTIONS` at call sites, without a `lazy_static`-style macro
/// dependency.
pub struct OnceLockTable {
    init: fn() -> HashMap<&'static str, FunctionSig>,
    cell: OnceLock<FunctionTable>,
}

impl OnceLockTable {
    const fn new(init: fn() -> HashMap<&'static str, FunctionSig>) -> Self {
        Self {
            init,
            cell: OnceLock::new(),
        }
    }
}

impl std::ops::Deref for OnceLockTable {
    type Target = FunctionTable;
    fn deref(&self) -> &FunctionTable {
        self.cell.get_or_init(|| FunctionTable((self.init)()))
    }
}

/// Evaluates the breaker's tripping predicate against a shared
/// [`RTMetrics`].
pub struct BreakerContext<'a> {
    pub metrics: &'a RTMetrics,
}

impl PredicateContext for BreakerContext<'_> {
    fn call_num(&self, name: &str, args: &[f64]) -> f64 {
        match name {
            "NetworkErrorRatio" => self.metrics.network_error_ratio(),
            "LatencyAtQuantileMS" => {
                self.metrics.latency_at_quantile_ms(args.first().copied().unwrap_or(0.0))
            }
            "ResponseCodeRatio" => {
                let a_start = args.first().copied().unwrap_or(0.0) as u16;
                let a_end = args.get(1).copied().unwrap_or(0.0) as u16;
                let b_start = args.get(2).copied().unwrap_or(0.0) as u16;
                let b_end = args.get(3).copied().unwrap_or(0.0) as u16;
                self.metrics
                    .response_code_ratio(a_start, a_end, b_start, b_end)
            }
            _ => 0.0,
        }
    }

    fn call_bool(&self, _name: &str, _args: &[f64]) -> bool {
        false
    }
}

/// Evaluates the buffer middleware's retry predicate against one attempt's
/// outcome.
pub struct RetryContext {
    pub attempts: u32,
    pub response_code: u16,
    pub is_network_error: bool,
}

impl PredicateContext for RetryContext {
    fn call_num(&self, name: &str, _args: &[f64]) -> f64 {
        match name {
            "Attempts" => self.attempts as f64,
            "ResponseCode" => self.response_code as f64,
            _ => 0.0,
        }
    }

    fn call_bool(&self, name: &str, _args: &[f64]) -> bool {
        match name {
            "IsNetworkError" => self.is_network_error,
            _ => false,
        }
    }
}
