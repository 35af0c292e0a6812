//! Recursive-descent parser for the selector dialect.
//!
//! Precedence, loosest first: `||`, `&&`, comparisons / `in`, unary
//! `!`/`-`, then postfix member/index/call.

use crate::ast::{BinOp, Expr, UnaryOp};
use crate::error::{SelectorError, SelectorResult};
use crate::lexer::{Token, tokenize};

/// Parse a selector source string into an expression tree.
pub fn parse(src: &str) -> SelectorResult<Expr> {
    let tokens = tokenize(src)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(SelectorError::Parse(format!(
            "trailing tokens after expression: {:?}",
            parser.tokens[parser.pos]
        )));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: &Token) -> SelectorResult<()> {
        match self.advance() {
            Some(ref token) if token == expected => Ok(()),
            other => Err(SelectorError::Parse(format!(
                "expected {expected:?}, found {other:?}"
            ))),
        }
    }

    fn parse_or(&mut self) -> SelectorResult<Expr> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Binary(BinOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> SelectorResult<Expr> {
        let mut left = self.parse_cmp()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let right = self.parse_cmp()?;
            left = Expr::Binary(BinOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_cmp(&mut self) -> SelectorResult<Expr> {
        let left = self.parse_unary()?;
        let op = match self.peek() {
            Some(Token::Eq) => BinOp::Eq,
            Some(Token::Ne) => BinOp::Ne,
            Some(Token::Lt) => BinOp::Lt,
            Some(Token::Le) => BinOp::Le,
            Some(Token::Gt) => BinOp::Gt,
            Some(Token::Ge) => BinOp::Ge,
            Some(Token::In) => BinOp::In,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_unary()?;
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    fn parse_unary(&mut self) -> SelectorResult<Expr> {
        match self.peek() {
            Some(Token::Not) => {
                self.advance();
                let inner = self.parse_unary()?;
                Ok(Expr::Unary(UnaryOp::Not, Box::new(inner)))
            }
            Some(Token::Minus) => {
                self.advance();
                let inner = self.parse_unary()?;
                Ok(Expr::Unary(UnaryOp::Neg, Box::new(inner)))
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> SelectorResult<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.advance();
                    let name = match self.advance() {
                        Some(Token::Ident(name)) => name,
                        other => {
                            return Err(SelectorError::Parse(format!(
                                "expected field name after '.', found {other:?}"
                            )));
                        }
                    };
                    if self.peek() == Some(&Token::LParen) {
                        self.advance();
                        let args = self.parse_args()?;
                        expr = Expr::Call {
                            recv: Box::new(expr),
                            method: name,
                            args,
                        };
                    } else {
                        expr = Expr::Member(Box::new(expr), name);
                    }
                }
                Some(Token::LBracket) => {
                    self.advance();
                    let index = self.parse_or()?;
                    self.expect(&Token::RBracket)?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_args(&mut self) -> SelectorResult<Vec<Expr>> {
        let mut args = Vec::new();
        if self.peek() == Some(&Token::RParen) {
            self.advance();
            return Ok(args);
        }
        loop {
            args.push(self.parse_or()?);
            match self.advance() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => return Ok(args),
                other => {
                    return Err(SelectorError::Parse(format!(
                        "expected ',' or ')' in argument list, found {other:?}"
                    )));
                }
            }
        }
    }

    fn parse_primary(&mut self) -> SelectorResult<Expr> {
        match self.advance() {
            Some(Token::Ident(name)) => Ok(Expr::Ident(name)),
            Some(Token::Str(s)) => Ok(Expr::Lit(serde_json::Value::String(s))),
            Some(Token::Int(n)) => Ok(Expr::Lit(serde_json::json!(n))),
            Some(Token::Float(f)) => Ok(Expr::Lit(serde_json::json!(f))),
            Some(Token::True) => Ok(Expr::Lit(serde_json::Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Lit(serde_json::Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Lit(serde_json::Value::Null)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if self.peek() == Some(&Token::RBracket) {
                    self.advance();
                } else {
                    loop {
                        items.push(self.parse_or()?);
                        match self.advance() {
                            Some(Token::Comma) => continue,
                            Some(Token::RBracket) => break,
                            other => {
                                return Err(SelectorError::Parse(format!(
                                    "expected ',' or ']' in list, found {other:?}"
                                )));
                            }
                        }
                    }
                }
                // Lists of literals fold to a literal array; anything else
                // is unsupported in this dialect.
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Expr::Lit(v) => values.push(v),
                        other => {
                            return Err(SelectorError::Parse(format!(
                                "list literals may only contain scalars, found {other:?}"
                            )));
                        }
                    }
                }
                Ok(Expr::Lit(serde_json::Value::Array(values)))
            }
            other => Err(SelectorError::Parse(format!(
                "unexpected token {other:?}"
            ))),
        }
    }
}
