//! Property predicates such as `(CLASS_STAR > 0.9) & (MAG_AUTO < 20)`.
//!
//! Grammar, lowest precedence first:
//!
//! ```text
//! or      := and ( ('|' | 'or') and )*
//! and     := not ( ('&' | 'and') not )*
//! not     := ('~' | 'not') not | cmp
//! cmp     := sum ( ('<' | '<=' | '>' | '>=' | '==' | '!=') sum )?
//! sum     := product ( ('+' | '-') product )*
//! product := unary ( ('*' | '/') unary )*
//! unary   := '-' unary | atom
//! atom    := number | identifier | '(' or ')'
//! ```
//!
//! Booleans evaluate to 1.0 / 0.0 so that comparisons and logic compose.

use std::collections::HashMap;

use regex::Regex;

use crate::error::{PsfError, Result};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Op(String),
    LParen,
    RParen,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Column(String),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let re = Regex::new(
        r"\s*(?:(?P<num>\d+\.?\d*(?:[eE][+-]?\d+)?|\.\d+(?:[eE][+-]?\d+)?)|(?P<ident>[A-Za-z_][A-Za-z0-9_]*)|(?P<op><=|>=|==|!=|&&|\|\||[<>&|~+\-*/])|(?P<lp>\()|(?P<rp>\)))",
    )
    .map_err(|e| PsfError::Config(e.to_string()))?;

    let mut tokens = Vec::new();
    let mut pos = 0;
    while pos < source.len() {
        if source[pos..].trim().is_empty() {
            break;
        }
        let caps = re
            .captures_at(source, pos)
            .filter(|c| c.get(0).map(|m| m.start()) == Some(pos))
            .ok_or_else(|| {
                PsfError::Config(format!("unexpected character in '{}' at {}", source, pos))
            })?;
        if let Some(m) = caps.name("num") {
            let value = m
                .as_str()
                .parse::<f64>()
                .map_err(|e| PsfError::Config(format!("bad number '{}': {}", m.as_str(), e)))?;
            tokens.push(Token::Number(value));
        } else if let Some(m) = caps.name("ident") {
            tokens.push(match m.as_str() {
                "and" => Token::Op("&".into()),
                "or" => Token::Op("|".into()),
                "not" => Token::Op("~".into()),
                other => Token::Ident(other.to_string()),
            });
        } else if let Some(m) = caps.name("op") {
            let op = match m.as_str() {
                "&&" => "&",
                "||" => "|",
                other => other,
            };
            tokens.push(Token::Op(op.to_string()));
        } else if caps.name("lp").is_some() {
            tokens.push(Token::LParen);
        } else if caps.name("rp").is_some() {
            tokens.push(Token::RParen);
        }
        pos = caps.get(0).map(|m| m.end()).unwrap_or(source.len());
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek_op(&self) -> Option<&str> {
        match self.tokens.get(self.pos) {
            Some(Token::Op(op)) => Some(op.as_str()),
            _ => None,
        }
    }

    fn error(&self, msg: &str) -> PsfError {
        PsfError::Config(format!("{} at token {}", msg, self.pos))
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_and()?;
        while self.peek_op() == Some("|") {
            self.pos += 1;
            let rhs = self.parse_and()?;
            lhs = Expr::Binary(BinaryOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_not()?;
        while self.peek_op() == Some("&") {
            self.pos += 1;
            let rhs = self.parse_not()?;
            lhs = Expr::Binary(BinaryOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if self.peek_op() == Some("~") {
            self.pos += 1;
            let inner = self.parse_not()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_cmp()
    }

    fn parse_cmp(&mut self) -> Result<Expr> {
        let lhs = self.parse_sum()?;
        let op = match self.peek_op() {
            Some("<") => BinaryOp::Lt,
            Some("<=") => BinaryOp::Le,
            Some(">") => BinaryOp::Gt,
            Some(">=") => BinaryOp::Ge,
            Some("==") => BinaryOp::Eq,
            Some("!=") => BinaryOp::Ne,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.parse_sum()?;
        Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    fn parse_sum(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_product()?;
        loop {
            let op = match self.peek_op() {
                Some("+") => BinaryOp::Add,
                Some("-") => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.parse_product()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_product(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek_op() {
                Some("*") => BinaryOp::Mul,
                Some("/") => BinaryOp::Div,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if self.peek_op() == Some("-") {
            self.pos += 1;
            let inner = self.parse_unary()?;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.parse_atom()
    }

    fn parse_atom(&mut self) -> Result<Expr> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| self.error("unexpected end of expression"))?;
        self.pos += 1;
        match token {
            Token::Number(v) => Ok(Expr::Number(v)),
            Token::Ident(name) => Ok(Expr::Column(name)),
            Token::LParen => {
                let inner = self.parse_or()?;
                match self.tokens.get(self.pos) {
                    Some(Token::RParen) => {
                        self.pos += 1;
                        Ok(inner)
                    }
                    _ => Err(self.error("missing ')'")),
                }
            }
            Token::RParen | Token::Op(_) => Err(self.error("unexpected token")),
        }
    }
}

fn truth(v: f64) -> f64 {
    if v != 0.0 && !v.is_nan() {
        1.0
    } else {
        0.0
    }
}

impl Expr {
    pub fn parse(source: &str) -> Result<Expr> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(PsfError::Config("empty expression".into()));
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(parser.error("trailing input"));
        }
        Ok(expr)
    }

    /// Column names referenced by the expression, in first-use order.
    pub fn columns(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns(&self, out: &mut Vec<String>) {
        match self {
            Expr::Number(_) => {}
            Expr::Column(name) => {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
            Expr::Neg(inner) | Expr::Not(inner) => inner.collect_columns(out),
            Expr::Binary(_, a, b) => {
                a.collect_columns(out);
                b.collect_columns(out);
            }
        }
    }

    pub fn eval(&self, row: &HashMap<String, f64>) -> Result<f64> {
        Ok(match self {
            Expr::Number(v) => *v,
            Expr::Column(name) => *row
                .get(name)
                .ok_or_else(|| PsfError::Config(format!("unknown column '{}'", name)))?,
            Expr::Neg(inner) => -inner.eval(row)?,
            Expr::Not(inner) => 1.0 - truth(inner.eval(row)?),
            Expr::Binary(op, a, b) => {
                let a = a.eval(row)?;
                let b = b.eval(row)?;
                let flag = |c: bool| if c { 1.0 } else { 0.0 };
                match op {
                    BinaryOp::Add => a + b,
                    BinaryOp::Sub => a - b,
                    BinaryOp::Mul => a * b,
                    BinaryOp::Div => a / b,
                    BinaryOp::Lt => flag(a < b),
                    BinaryOp::Le => flag(a <= b),
                    BinaryOp::Gt => flag(a > b),
                    BinaryOp::Ge => flag(a >= b),
                    BinaryOp::Eq => flag(a == b),
                    BinaryOp::Ne => flag(a != b),
                    BinaryOp::And => flag(truth(a) == 1.0 && truth(b) == 1.0),
                    BinaryOp::Or => flag(truth(a) == 1.0 || truth(b) == 1.0),
                }
            }
        })
    }

    pub fn matches(&self, row: &HashMap<String, f64>) -> Result<bool> {
        Ok(truth(self.eval(row)?) == 1.0)
    }
}
