//! Boolean expressions over a classifier snapshot.
//!
//! Snapshot fields are written as template placeholders and the rest of the
//! expression is a small comparison grammar:
//!
//! ```text
//! {{.IsSuccessful "server" "client"}} == true && {{.NumRunningJobs}} >= 2
//! ```
//!
//! Bare identifiers that are not `true`/`false` are string literals, so
//! `status == Failed` needs no quoting.

use crate::classifier::Classifier;
use crate::error::{Result, StagehandError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Peekable;
use std::str::Chars;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExprState(pub String);

impl ExprState {
    pub fn new(expr: impl Into<String>) -> Self {
        Self(expr.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Evaluate against `state`. An empty expression is true.
    pub fn evaluate(&self, state: &Classifier) -> Result<bool> {
        if self.is_empty() {
            return Ok(true);
        }

        let tokens = tokenize(&self.0).map_err(|reason| self.invalid(reason))?;
        let mut parser = Parser {
            expr: self,
            tokens,
            pos: 0,
            state,
        };

        let value = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(self.invalid(format!(
                "unexpected trailing token {:?}",
                parser.tokens[parser.pos]
            )));
        }

        match value {
            Value::Bool(b) => Ok(b),
            other => Err(self.invalid(format!("expression yields {other}, not a boolean"))),
        }
    }

    /// Check syntax and field names against an empty snapshot.
    pub fn validate(&self) -> Result<()> {
        self.evaluate(&Classifier::new()).map(|_| ())
    }

    fn invalid(&self, reason: impl Into<String>) -> StagehandError {
        StagehandError::InvalidExpression {
            expr: self.0.clone(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ExprState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Field { name: String, args: Vec<String> },
    Ident(String),
    Str(String),
    Number(f64),
    Op(Op),
    LParen,
    RParen,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Op {
    And,
    Or,
    Not,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

fn tokenize(input: &str) -> std::result::Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.peek().copied() {
        if ch.is_whitespace() {
            chars.next();
            continue;
        }

        match ch {
            '{' => {
                chars.next();
                if chars.next() != Some('{') {
                    return Err("expected '{{'".to_string());
                }
                tokens.push(read_field(&mut chars)?);
            }
            '"' | '\'' => {
                chars.next();
                tokens.push(Token::Str(read_quoted(&mut chars, ch)?));
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '&' | '|' => {
                chars.next();
                if chars.next() != Some(ch) {
                    return Err(format!("expected '{ch}{ch}'"));
                }
                tokens.push(Token::Op(if ch == '&' { Op::And } else { Op::Or }));
            }
            '=' => {
                chars.next();
                if chars.next() != Some('=') {
                    return Err("expected '=='".to_string());
                }
                tokens.push(Token::Op(Op::Eq));
            }
            '!' | '<' | '>' => {
                chars.next();
                let with_eq = chars.peek() == Some(&'=');
                if with_eq {
                    chars.next();
                }
                let op = match (ch, with_eq) {
                    ('!', true) => Op::Ne,
                    ('!', false) => Op::Not,
                    ('<', true) => Op::Le,
                    ('<', false) => Op::Lt,
                    ('>', true) => Op::Ge,
                    _ => Op::Gt,
                };
                tokens.push(Token::Op(op));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut raw = String::new();
                raw.push(c);
                chars.next();
                while let Some(d) = chars.peek().copied() {
                    if d.is_ascii_digit() || d == '.' {
                        raw.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let n: f64 = raw.parse().map_err(|_| format!("invalid number '{raw}'"))?;
                tokens.push(Token::Number(n));
            }
            c if is_ident_char(c) => {
                let mut word = String::new();
                while let Some(d) = chars.peek().copied() {
                    if is_ident_char(d) {
                        word.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(word));
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }

    Ok(tokens)
}

fn is_ident_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.')
}

fn read_quoted(chars: &mut Peekable<Chars<'_>>, quote: char) -> std::result::Result<String, String> {
    let mut value = String::new();
    while let Some(c) = chars.next() {
        if c == quote {
            return Ok(value);
        }
        if c == '\\' {
            match chars.next() {
                Some(escaped) => value.push(escaped),
                None => break,
            }
            continue;
        }
        value.push(c);
    }
    Err("unterminated string".to_string())
}

/// Reads `.Name "arg" ...}}` after the opening braces.
fn read_field(chars: &mut Peekable<Chars<'_>>) -> std::result::Result<Token, String> {
    skip_ws(chars);
    if chars.next() != Some('.') {
        return Err("placeholder must start with '.'".to_string());
    }

    let mut name = String::new();
    while let Some(c) = chars.peek().copied() {
        if c.is_ascii_alphanumeric() || c == '_' {
            name.push(c);
            chars.next();
        } else {
            break;
        }
    }
    if name.is_empty() {
        return Err("placeholder has no field name".to_string());
    }

    let mut args = Vec::new();
    loop {
        skip_ws(chars);
        match chars.next() {
            Some('}') => {
                if chars.next() != Some('}') {
                    return Err("expected '}}'".to_string());
                }
                return Ok(Token::Field { name, args });
            }
            Some(q @ ('"' | '\'')) => args.push(read_quoted(chars, q)?),
            Some(other) => return Err(format!("unexpected '{other}' in placeholder .{name}")),
            None => return Err(format!("unterminated placeholder .{name}")),
        }
    }
}

fn skip_ws(chars: &mut Peekable<Chars<'_>>) {
    while chars.peek().is_some_and(|c| c.is_whitespace()) {
        chars.next();
    }
}

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Bool(bool),
    Number(f64),
    Str(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "bool {b}"),
            Value::Number(n) => write!(f, "number {n}"),
            Value::Str(s) => write!(f, "string '{s}'"),
        }
    }
}

fn resolve(state: &Classifier, name: &str, args: &[String]) -> Result<Value> {
    let membership = match name {
        "IsPending" => Some(state.is_pending(args)),
        "IsRunning" => Some(state.is_running(args)),
        "IsSuccessful" => Some(state.is_successful(args)),
        "IsFailed" => Some(state.is_failed(args)),
        "IsTerminating" => Some(state.is_terminating(args)),
        _ => None,
    };
    if let Some(b) = membership {
        return Ok(Value::Bool(b));
    }

    let count = match name {
        "NumPendingJobs" => state.num_pending_jobs(),
        "NumRunningJobs" => state.num_running_jobs(),
        "NumSuccessfulJobs" => state.num_successful_jobs(),
        "NumFailedJobs" => state.num_failed_jobs(),
        "NumTerminatingJobs" => state.num_terminating_jobs(),
        "Count" => state.count(),
        _ => return Err(StagehandError::UnknownField(name.to_string())),
    };
    if !args.is_empty() {
        return Err(StagehandError::InvalidExpression {
            expr: format!("{{{{.{name}}}}}"),
            reason: format!("{name} takes no arguments"),
        });
    }
    Ok(Value::Number(count as f64))
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Recursive descent, evaluating as it goes:
///
/// ```text
/// or      := and ("||" and)*
/// and     := unary ("&&" unary)*
/// unary   := "!" unary | compare
/// compare := primary (cmp-op primary)?
/// primary := field | number | string | ident | "(" or ")"
/// ```
struct Parser<'a> {
    expr: &'a ExprState,
    tokens: Vec<Token>,
    pos: usize,
    state: &'a Classifier,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn eat_op(&mut self, op: Op) -> bool {
        if self.peek() == Some(&Token::Op(op)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn boolean(&self, v: Value, ctx: &str) -> Result<bool> {
        match v {
            Value::Bool(b) => Ok(b),
            other => Err(self.expr.invalid(format!("operand of {ctx} is {other}, not a boolean"))),
        }
    }

    fn parse_or(&mut self) -> Result<Value> {
        let mut acc = self.parse_and()?;
        while self.eat_op(Op::Or) {
            let lhs = self.boolean(acc, "'||'")?;
            let rhs = self.parse_and()?;
            let rhs = self.boolean(rhs, "'||'")?;
            acc = Value::Bool(lhs || rhs);
        }
        Ok(acc)
    }

    fn parse_and(&mut self) -> Result<Value> {
        let mut acc = self.parse_unary()?;
        while self.eat_op(Op::And) {
            let lhs = self.boolean(acc, "'&&'")?;
            let rhs = self.parse_unary()?;
            let rhs = self.boolean(rhs, "'&&'")?;
            acc = Value::Bool(lhs && rhs);
        }
        Ok(acc)
    }

    fn parse_unary(&mut self) -> Result<Value> {
        if self.eat_op(Op::Not) {
            let inner = self.parse_unary()?;
            return Ok(Value::Bool(!self.boolean(inner, "'!'")?));
        }
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> Result<Value> {
        let lhs = self.parse_primary()?;
        let op = match self.peek() {
            Some(Token::Op(op @ (Op::Eq | Op::Ne | Op::Lt | Op::Le | Op::Gt | Op::Ge))) => *op,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.parse_primary()?;
        self.compare(op, lhs, rhs).map(Value::Bool)
    }

    fn compare(&self, op: Op, lhs: Value, rhs: Value) -> Result<bool> {
        use std::cmp::Ordering;

        let ordering = match (&lhs, &rhs) {
            (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) if matches!(op, Op::Eq | Op::Ne) => Some(a.cmp(b)),
            _ => None,
        };
        let ordering = ordering
            .ok_or_else(|| self.expr.invalid(format!("cannot compare {lhs} with {rhs}")))?;

        Ok(match op {
            Op::Eq => ordering == Ordering::Equal,
            Op::Ne => ordering != Ordering::Equal,
            Op::Lt => ordering == Ordering::Less,
            Op::Le => ordering != Ordering::Greater,
            Op::Gt => ordering == Ordering::Greater,
            Op::Ge => ordering != Ordering::Less,
            Op::And | Op::Or | Op::Not => {
                return Err(self.expr.invalid("not a comparison operator"))
            }
        })
    }

    fn parse_primary(&mut self) -> Result<Value> {
        match self.advance() {
            Some(Token::Field { name, args }) => resolve(self.state, &name, &args),
            Some(Token::Number(n)) => Ok(Value::Number(n)),
            Some(Token::Str(s)) => Ok(Value::Str(s)),
            Some(Token::Ident(word)) => Ok(match word.as_str() {
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                _ => Value::Str(word),
            }),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(self.expr.invalid("missing ')'")),
                }
            }
            Some(tok) => Err(self.expr.invalid(format!("unexpected token {tok:?}"))),
            None => Err(self.expr.invalid("unexpected end of expression")),
        }
    }
}
