//! Recursive-descent parser producing an [`Expr`] tree.
//!
//! Grammar (precedence low to high):
//! ```text
//! expr       := or_expr
//! or_expr    := and_expr ( '||' and_expr )*
//! and_expr   := atom ( '&&' atom )*
//! atom       := '(' expr ')' | comparison
//! comparison := term ( cmp_op term )?
//! term       := number | call
//! call       := ident '(' ( number (',' number)* )? ')'
//! ```
//! A `comparison` with no operator must be a boolean-typed `call` (checked
//! during validation, not parsing, since the parser doesn't know function
//! types).

use std::fmt;

use super::ast::{CmpOp, Expr, Term};
use super::lexer::Token;

#[derive(Debug)]
pub struct ParseError(pub String);

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "predicate parse error: {}", self.0)
    }
}
impl std::error::Error for ParseError {}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&Token> {
        let t = self.tokens.get(self.pos);
        self.pos += 1;
        t
    }

    fn expect(&mut self, want: &Token) -> Result<(), ParseError> {
        match self.advance() {
            Some(t) if t == want => Ok(()),
            other => Err(ParseError(format!("expected {want:?}, got {other:?}"))),
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_and()?;
        while matches!(self.peek(), Some(Token::OrOr)) {
            self.advance();
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_atom()?;
        while matches!(self.peek(), Some(Token::AndAnd)) {
            self.advance();
            let rhs = self.parse_atom()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_atom(&mut self) -> Result<Expr, ParseError> {
        if matches!(self.peek(), Some(Token::LParen)) {
            self.advance();
            let inner = self.parse_expr()?;
            self.expect(&Token::RParen)?;
            return Ok(inner);
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let lhs = self.parse_term()?;
        let op = match self.peek() {
            Some(Token::Lt) => Some(CmpOp::Lt),
            Some(Token::Le) => Some(CmpOp::Le),
            Some(Token::Eq) => Some(CmpOp::Eq),
            Some(Token::Ge) => Some(CmpOp::Ge),
            Some(Token::Gt) => Some(CmpOp::Gt),
            _ => None,
        };
        match op {
            Some(op) => {
                self.advance();
                let rhs = self.parse_term()?;
                Ok(Expr::Cmp(lhs, op, rhs))
            }
            None => Ok(Expr::Bare(lhs)),
        }
    }

    fn parse_term(&mut self) -> Result<Term, ParseError> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(Term::Number(*n)),
            Some(Token::Ident(name)) => {
                let name = name.clone();
                self.expect(&Token::LParen)?;
                let mut args = Vec::new();
                if !matches!(self.peek(), Some(Token::RParen)) {
                    loop {
                        match self.advance() {
                            Some(Token::Number(n)) => args.push(*n),
                            other => {
                                return Err(ParseError(format!(
                                    "expected numeric argument, got {other:?}"
                                )))
                            }
                        }
                        if matches!(self.peek(), Some(Token::Comma)) {
                            self.advance();
                            continue;
                        }
                        break;
                    }
                }
                self.expect(&Token::RParen)?;
                Ok(Term::Call(name, args))
            }
            other => Err(ParseError(format!("expected term, got {other:?}"))),
        }
    }
}

pub fn parse(tokens: &[Token]) -> Result<Expr, ParseError> {
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expr()?;
    if parser.pos != tokens.len() {
        return Err(ParseError(format!(
            "unexpected trailing tokens at position {}",
            parser.pos
        )));
    }
    Ok(expr)
}

#[cfg(test)]
mod tests {
    use super::super::lexer::lex;
    use super::*;

    fn parse_str(s: &str) -> Expr {
        parse(&lex(s).unwrap()).unwrap()
    }

    #[test]
    fn parses_simple_comparison() {
        let expr = parse_str("NetworkErrorRatio() > 0.5");
        assert!(matches!(expr, Expr::Cmp(..)));
    }

    #[test]
    fn parses_parenthesized_or() {
        let expr = parse_str("(Attempts() < 3) || IsNetworkError()");
        assert!(matches!(expr, Expr::Or(..)));
    }

    #[test]
    fn parses_multi_arg_call() {
        let expr = parse_str("ResponseCodeRatio(500,600,200,600) >= 0.1");
        match expr {
            Expr::Cmp(Term::Call(name, args), CmpOp::Ge, Term::Number(n)) => {
                assert_eq!(name, "ResponseCodeRatio");
                assert_eq!(args, vec![500.0, 600.0, 200.0, 600.0]);
                assert_eq!(n, 0.1);
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn rejects_trailing_garbage() {
        let tokens = lex("Attempts() < 3 )").unwrap();
        assert!(parse(&tokens).is_err());
    }

    #[test]
    fn and_binds_tighter_than_or() {
        // a && b || c && d  parses as (a&&b) || (c&&d)
        let expr = parse_str("Attempts() < 1 && Attempts() < 2 || Attempts() < 3 && Attempts() < 4");
        assert!(matches!(expr, Expr::Or(..)));
        if let Expr::Or(lhs, rhs) = expr {
            assert!(matches!(*lhs, Expr::And(..)));
            assert!(matches!(*rhs, Expr::And(..)));
        }
    }
}
