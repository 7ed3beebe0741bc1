//! Pratt (top-down operator precedence) parser.
//!
//! Builds an [`Expr`] tree from a token stream. A bare identifier is either an opcode call
//! (`sin(440)`) when followed by `(`, or a variable reference (`freq`, optionally
//! `freq=440` to also declare its default) otherwise. Binding powers are centralized in
//! [`crate::constants`] so the emitter and any future pretty-printer read the same numbers the
//! parser used to build the tree.

use crate::compiler::lexer::{Lexer, Spanned, Token};
use crate::constants::{BP_ADDITIVE, BP_CALL, BP_MULTIPLICATIVE, BP_POWER, BP_PREFIX};
use crate::error::CompileDiagnostic;
use crate::opcode::Opcode;
use std::str::FromStr;

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Number(f32),
    /// A bare variable reference, with an optional default value declared at this occurrence
    /// (`name=value`). Only the first default seen for a given name is kept by the emitter.
    Var { name: String, default: Option<Box<Expr>> },
    WaveName(String),
    Neg(Box<Expr>),
    Call(Opcode, Vec<Expr>),
    /// A call to a name that isn't a builtin opcode. Arity isn't known until the emitter
    /// consults the extension catalog, so it's left unchecked here (§4.7).
    ExtCall(String, Vec<Expr>),
}

pub struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
}

impl Parser {
    pub fn parse(source: &str) -> Result<Expr, CompileDiagnostic> {
        let tokens = Lexer::new(source).tokenize()?;
        let mut parser = Self { tokens, pos: 0 };
        let expr = parser.parse_expr(0)?;
        parser.expect_eof()?;
        Ok(expr)
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos].token
    }

    fn position(&self) -> usize {
        self.tokens[self.pos].position
    }

    fn advance(&mut self) -> Token {
        let tok = self.tokens[self.pos].token.clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn expect_symbol(&mut self, c: char) -> Result<(), CompileDiagnostic> {
        match self.advance() {
            Token::Symbol(s) if s == c => Ok(()),
            other => Err(CompileDiagnostic::new(
                self.position(),
                format!("expected '{c}', found {other:?}"),
            )),
        }
    }

    fn expect_eof(&mut self) -> Result<(), CompileDiagnostic> {
        match self.peek() {
            Token::Eof => Ok(()),
            other => Err(CompileDiagnostic::new(
                self.position(),
                format!("unexpected trailing token {other:?}"),
            )),
        }
    }

    fn parse_expr(&mut self, min_bp: i32) -> Result<Expr, CompileDiagnostic> {
        let mut lhs = self.parse_nud()?;

        loop {
            let bp = match self.peek() {
                Token::Symbol('+') | Token::Symbol('-') => BP_ADDITIVE,
                Token::Symbol('*') | Token::Symbol('/') | Token::Symbol('%') => BP_MULTIPLICATIVE,
                Token::Symbol('^') => BP_POWER,
                _ => break,
            };
            if bp < min_bp {
                break;
            }

            let op_char = match self.advance() {
                Token::Symbol(c) => c,
                _ => unreachable!(),
            };

            // `^` binds right-to-left: parse the rhs at the same power so a chain of `^`
            // nests on the right rather than the left.
            let next_min = if op_char == '^' { bp } else { bp + 1 };
            let rhs = self.parse_expr(next_min)?;

            let opcode = match op_char {
                '+' => Opcode::Add,
                '-' => Opcode::Sub,
                '*' => Opcode::Mul,
                '/' => Opcode::Div,
                '%' => Opcode::Mod,
                '^' => Opcode::Pow,
                _ => unreachable!(),
            };
            lhs = Expr::Call(opcode, vec![lhs, rhs]);
        }

        Ok(lhs)
    }

    fn parse_nud(&mut self) -> Result<Expr, CompileDiagnostic> {
        let start = self.position();
        match self.advance() {
            Token::Number(n) => Ok(Expr::Number(n)),
            Token::Str(s) => Ok(Expr::WaveName(s)),
            Token::Symbol('-') => {
                let operand = self.parse_expr(BP_PREFIX)?;
                Ok(Expr::Neg(Box::new(operand)))
            }
            Token::Symbol('(') => {
                let inner = self.parse_expr(0)?;
                self.expect_symbol(')')?;
                Ok(inner)
            }
            Token::Ident(name) => self.parse_ident(start, name),
            other => Err(CompileDiagnostic::new(
                start,
                format!("unexpected token {other:?}"),
            )),
        }
    }

    fn parse_ident(&mut self, start: usize, name: String) -> Result<Expr, CompileDiagnostic> {
        if matches!(self.peek(), Token::Symbol('(')) {
            if let Ok(opcode) = Opcode::from_str(&name) {
                return self.parse_call(start, opcode);
            }
            let args = self.parse_arg_list()?;
            return Ok(Expr::ExtCall(name, args));
        }

        if matches!(self.peek(), Token::Symbol('=')) {
            self.advance();
            let default = self.parse_expr(BP_CALL)?;
            return Ok(Expr::Var {
                name,
                default: Some(Box::new(default)),
            });
        }

        Ok(Expr::Var { name, default: None })
    }

    fn parse_arg_list(&mut self) -> Result<Vec<Expr>, CompileDiagnostic> {
        self.expect_symbol('(')?;
        let mut args = Vec::new();
        if !matches!(self.peek(), Token::Symbol(')')) {
            loop {
                args.push(self.parse_expr(0)?);
                if matches!(self.peek(), Token::Symbol(',')) {
                    self.advance();
                    continue;
                }
                break;
            }
        }
        self.expect_symbol(')')?;
        Ok(args)
    }

    fn parse_call(&mut self, start: usize, opcode: Opcode) -> Result<Expr, CompileDiagnostic> {
        let args = self.parse_arg_list()?;

        let arity = opcode.arity();
        let count = args.len() as u8;
        if count < arity.min || count > arity.max {
            return Err(CompileDiagnostic::new(
                start,
                format!(
                    "'{opcode}' expects {}..{} argument(s), got {count}",
                    arity.min, arity.max
                ),
            ));
        }

        Ok(Expr::Call(opcode, args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_arithmetic_precedence() {
        // 1 + 2 * 3 should group as 1 + (2 * 3)
        let expr = Parser::parse("1 + 2 * 3").unwrap();
        assert_eq!(
            expr,
            Expr::Call(
                Opcode::Add,
                vec![Expr::Number(1.0), Expr::Call(Opcode::Mul, vec![Expr::Number(2.0), Expr::Number(3.0)])]
            )
        );
    }

    #[test]
    fn parses_call_with_default_variable() {
        let expr = Parser::parse("sin(hz=440)").unwrap();
        match expr {
            Expr::Call(Opcode::Sin, args) => {
                assert_eq!(args.len(), 1);
                match &args[0] {
                    Expr::Var { name, default: Some(d) } => {
                        assert_eq!(name, "hz");
                        assert_eq!(**d, Expr::Number(440.0));
                    }
                    other => panic!("expected default var, got {other:?}"),
                }
            }
            other => panic!("expected sin call, got {other:?}"),
        }
    }

    #[test]
    fn rejects_wrong_arity() {
        assert!(Parser::parse("adsr(0.1, 0.1)").is_err());
    }

    #[test]
    fn power_is_right_associative() {
        // 2^3^2 == 2^(3^2) == 2^9, not (2^3)^2
        let expr = Parser::parse("2^3^2").unwrap();
        assert_eq!(
            expr,
            Expr::Call(
                Opcode::Pow,
                vec![Expr::Number(2.0), Expr::Call(Opcode::Pow, vec![Expr::Number(3.0), Expr::Number(2.0)])]
            )
        );
    }
}
