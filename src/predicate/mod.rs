//! Small, fixed-grammar predicate language.
//!
//! Surface area is deliberately tiny: boolean combinators `&&`/`||`,
//! comparisons `<,<=,==,>=,>`, and a handful of named function calls with
//! numeric-literal arguments (`NetworkErrorRatio()`,
//! `LatencyAtQuantileMS(95)`, `ResponseCodeRatio(500,600,200,600)` for the
//! circuit breaker; `Attempts()`, `ResponseCode()`, `IsNetworkError()` for
//! buffer retry). The tree is shared between both families; only the
//! function table and the context each expression is evaluated against
//! differ — the evaluator isn't shared across unrelated families unless
//! the input side is union-shaped, and here the union is the `Term`/`Expr`
//! tree itself, with typed leaves resolved per concrete `PredicateContext`
//! impl.

mod ast;
mod context;
mod lexer;
mod parser;

pub use ast::{CmpOp, Expr, Term};
pub use context::{
    BreakerContext, FunctionSig, FunctionTable, RetryContext, ReturnType, BREAKER_FUNCTIONS,
    RETRY_FUNCTIONS,
};

use crate::error::ProxyError;

/// A compiled predicate: an AST plus the function table it was validated
/// against, ready to be evaluated repeatedly without re-parsing.
#[derive(Debug, Clone)]
pub struct Predicate {
    expr: Expr,
}

impl Predicate {
    /// Parse and validate `source` against `table`. Validation failures
    /// (unknown function name, wrong arity, type mismatch) are
    /// configuration errors reported synchronously.
    pub fn compile(source: &str, table: &FunctionTable) -> Result<Self, ProxyError> {
        let tokens = lexer::lex(source).map_err(|e| ProxyError::Config(e.to_string()))?;
        let expr = parser::parse(&tokens).map_err(|e| ProxyError::Config(e.to_string()))?;
        ast::validate(&expr, table).map_err(|e| ProxyError::Config(e.to_string()))?;
        Ok(Self { expr })
    }

    pub fn eval(&self, ctx: &dyn PredicateContext) -> bool {
        ast::eval(&self.expr, ctx)
    }
}

/// Evaluation-side context: resolves a named function call with numeric
/// arguments into either a numeric or boolean result. Implementors
/// (`BreakerContext`, `RetryContext`) are expected to have already been
/// validated against the matching `FunctionTable`, so unknown names here
/// should be unreachable in practice — they fall back to 0/false rather
/// than panicking ("unknown quantile ... returns 0" for runtime
/// robustness).
pub trait PredicateContext {
    fn call_num(&self, name: &str, args: &[f64]) -> f64;
    fn call_bool(&self, name: &str, args: &[f64]) -> bool;
}
