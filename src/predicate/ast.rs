//! AST, static validation and evaluation for the predicate mini-language.

use std::fmt;

use super::context::{FunctionTable, ReturnType};
use super::PredicateContext;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CmpOp {
    Lt,
    Le,
    Eq,
    Ge,
    Gt,
}

impl CmpOp {
    fn apply(self, lhs: f64, rhs: f64) -> bool {
        match self {
            CmpOp::Lt => lhs < rhs,
            CmpOp::Le => lhs <= rhs,
            CmpOp::Eq => (lhs - rhs).abs() < f64::EPSILON,
            CmpOp::Ge => lhs >= rhs,
            CmpOp::Gt => lhs > rhs,
        }
    }
}

/// A leaf value: a numeric literal, or a named function call with numeric
/// arguments. Calls may resolve to a numeric or boolean result depending on
/// the function table they're validated against.
#[derive(Debug, Clone)]
pub enum Term {
    Number(f64),
    Call(String, Vec<f64>),
}

#[derive(Debug, Clone)]
pub enum Expr {
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cmp(Term, CmpOp, Term),
    /// A bare boolean-typed term used directly as a predicate, e.g.
    /// `IsNetworkError()`.
    Bare(Term),
}

#[derive(Debug)]
pub struct ValidationError(pub String);

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "predicate validation error: {}", self.0)
    }
}
impl std::error::Error for ValidationError {}

fn validate_term(term: &Term, table: &FunctionTable) -> Result<ReturnType, ValidationError> {
    match term {
        Term::Number(_) => Ok(ReturnType::Num),
        Term::Call(name, args) => {
            let sig = table.get(name).ok_or_else(|| {
                ValidationError(format!("unknown predicate function '{name}'"))
            })?;
            if sig.arity != args.len() {
                return Err(ValidationError(format!(
                    "'{name}' expects {} argument(s), got {}",
                    sig.arity,
                    args.len()
                )));
            }
            Ok(sig.returns)
        }
    }
}

pub fn validate(expr: &Expr, table: &FunctionTable) -> Result<(), ValidationError> {
    match expr {
        Expr::And(lhs, rhs) | Expr::Or(lhs, rhs) => {
            validate(lhs, table)?;
            validate(rhs, table)?;
            Ok(())
        }
        Expr::Cmp(lhs, _, rhs) => {
            let lt = validate_term(lhs, table)?;
            let rt = validate_term(rhs, table)?;
            if lt != ReturnType::Num || rt != ReturnType::Num {
                return Err(ValidationError(
                    "comparison operands must both be numeric".into(),
                ));
            }
            Ok(())
        }
        Expr::Bare(term) => {
            let rt = validate_term(term, table)?;
            if rt != ReturnType::Bool {
                return Err(ValidationError(
                    "bare predicate term must be boolean-valued".into(),
                ));
            }
            Ok(())
        }
    }
}

fn eval_num(term: &Term, ctx: &dyn PredicateContext) -> f64 {
    match term {
        Term::Number(n) => *n,
        Term::Call(name, args) => ctx.call_num(name, args),
    }
}

fn eval_bool(term: &Term, ctx: &dyn PredicateContext) -> bool {
    match term {
        Term::Number(n) => *n != 0.0,
        Term::Call(name, args) => ctx.call_bool(name, args),
    }
}

pub fn eval(expr: &Expr, ctx: &dyn PredicateContext) -> bool {
    match expr {
        Expr::And(lhs, rhs) => eval(lhs, ctx) && eval(rhs, ctx),
        Expr::Or(lhs, rhs) => eval(lhs, ctx) || eval(rhs, ctx),
        Expr::Cmp(lhs, op, rhs) => op.apply(eval_num(lhs, ctx), eval_num(rhs, ctx)),
        Expr::Bare(term) => eval_bool(term, ctx),
    }
}
