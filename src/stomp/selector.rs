//! Message selectors.
//!
//! A selector is a boolean expression over message headers, supplied with a
//! SUBSCRIBE frame and evaluated against every delivery offered to the
//! subscription. The grammar is the equality subset of JMS-style selectors:
//! identifiers, quoted string and numeric literals, `=`, `<>`, `AND`, `OR`,
//! `NOT`, and parentheses. Compilation happens once at subscribe time;
//! compile errors are fatal protocol errors.

use thiserror::Error;

use crate::stomp::frame::Frame;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("selector syntax error at offset {offset}: {message}")]
pub struct SelectorError {
    pub offset: usize,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Compiled form
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Header(String),
    Str(String),
    Num(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Cmp {
        left: Operand,
        op: CmpOp,
        right: Operand,
    },
}

/// A compiled selector, retaining the raw text for durable bindings.
#[derive(Debug, Clone, PartialEq)]
pub struct Selector {
    raw: String,
    expr: Expr,
}

impl Selector {
    pub fn parse(raw: &str) -> Result<Self, SelectorError> {
        let tokens = tokenize(raw)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expr()?;
        if parser.pos != parser.tokens.len() {
            let (offset, _) = parser.tokens[parser.pos];
            return Err(SelectorError {
                offset,
                message: "unexpected trailing input".to_string(),
            });
        }
        Ok(Self {
            raw: raw.to_string(),
            expr,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Evaluate against a frame's headers. Comparisons on absent headers are
    /// false, so a selector never matches a message missing the header it
    /// names.
    pub fn matches(&self, frame: &Frame) -> bool {
        eval(&self.expr, frame)
    }
}

fn eval(expr: &Expr, frame: &Frame) -> bool {
    match expr {
        Expr::And(a, b) => eval(a, frame) && eval(b, frame),
        Expr::Or(a, b) => eval(a, frame) || eval(b, frame),
        Expr::Not(inner) => !eval(inner, frame),
        Expr::Cmp { left, op, right } => {
            let (Some(left), Some(right)) = (resolve(left, frame), resolve(right, frame)) else {
                return false;
            };
            match (compare(&left, &right), op) {
                (Some(equal), CmpOp::Eq) => equal,
                (Some(equal), CmpOp::Ne) => !equal,
                (None, _) => false,
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Str(String),
    Num(f64),
}

fn resolve(operand: &Operand, frame: &Frame) -> Option<Value> {
    match operand {
        Operand::Header(name) => frame.get(name).map(|v| Value::Str(v.to_string())),
        Operand::Str(s) => Some(Value::Str(s.clone())),
        Operand::Num(n) => Some(Value::Num(*n)),
    }
}

fn compare(a: &Value, b: &Value) -> Option<bool> {
    match (a, b) {
        (Value::Num(x), Value::Num(y)) => Some(x == y),
        (Value::Str(x), Value::Str(y)) => Some(x == y),
        (Value::Num(n), Value::Str(s)) | (Value::Str(s), Value::Num(n)) => {
            s.trim().parse::<f64>().ok().map(|parsed| parsed == *n)
        }
    }
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Eq,
    Ne,
    LParen,
    RParen,
    And,
    Or,
    Not,
}

fn tokenize(raw: &str) -> Result<Vec<(usize, Token)>, SelectorError> {
    let bytes = raw.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '(' => {
                tokens.push((i, Token::LParen));
                i += 1;
            }
            ')' => {
                tokens.push((i, Token::RParen));
                i += 1;
            }
            '=' => {
                tokens.push((i, Token::Eq));
                i += 1;
            }
            '<' => {
                if bytes.get(i + 1) == Some(&b'>') {
                    tokens.push((i, Token::Ne));
                    i += 2;
                } else {
                    return Err(SelectorError {
                        offset: i,
                        message: "expected '<>'".to_string(),
                    });
                }
            }
            '\'' => {
                let start = i;
                i += 1;
                let mut out = String::new();
                loop {
                    match bytes.get(i) {
                        Some(b'\'') if bytes.get(i + 1) == Some(&b'\'') => {
                            out.push('\'');
                            i += 2;
                        }
                        Some(b'\'') => {
                            i += 1;
                            break;
                        }
                        Some(&b) => {
                            out.push(b as char);
                            i += 1;
                        }
                        None => {
                            return Err(SelectorError {
                                offset: start,
                                message: "unterminated string literal".to_string(),
                            })
                        }
                    }
                }
                tokens.push((start, Token::Str(out)));
            }
            '0'..='9' => {
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                    i += 1;
                }
                let text = &raw[start..i];
                let num = text.parse().map_err(|_| SelectorError {
                    offset: start,
                    message: format!("invalid number literal '{text}'"),
                })?;
                tokens.push((start, Token::Num(num)));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric()
                        || bytes[i] == b'_'
                        || bytes[i] == b'-'
                        || bytes[i] == b'.')
                {
                    i += 1;
                }
                let word = &raw[start..i];
                let token = match word.to_ascii_uppercase().as_str() {
                    "AND" => Token::And,
                    "OR" => Token::Or,
                    "NOT" => Token::Not,
                    _ => Token::Ident(word.to_string()),
                };
                tokens.push((start, token));
            }
            other => {
                return Err(SelectorError {
                    offset: i,
                    message: format!("unexpected character '{other}'"),
                })
            }
        }
    }
    if tokens.is_empty() {
        return Err(SelectorError {
            offset: 0,
            message: "empty selector".to_string(),
        });
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn error(&self, message: impl Into<String>) -> SelectorError {
        let offset = self
            .tokens
            .get(self.pos)
            .map(|(o, _)| *o)
            .unwrap_or_else(|| self.tokens.last().map(|(o, _)| *o + 1).unwrap_or(0));
        SelectorError {
            offset,
            message: message.into(),
        }
    }

    fn expr(&mut self) -> Result<Expr, SelectorError> {
        let mut left = self.and_expr()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, SelectorError> {
        let mut left = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, SelectorError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let inner = self.expr()?;
            if self.peek() != Some(&Token::RParen) {
                return Err(self.error("expected ')'"));
            }
            self.pos += 1;
            return Ok(inner);
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, SelectorError> {
        let left = self.operand()?;
        let op = match self.peek() {
            Some(Token::Eq) => CmpOp::Eq,
            Some(Token::Ne) => CmpOp::Ne,
            _ => return Err(self.error("expected '=' or '<>'")),
        };
        self.pos += 1;
        let right = self.operand()?;
        Ok(Expr::Cmp { left, op, right })
    }

    fn operand(&mut self) -> Result<Operand, SelectorError> {
        let operand = match self.peek() {
            Some(Token::Ident(name)) => Operand::Header(name.clone()),
            Some(Token::Str(s)) => Operand::Str(s.clone()),
            Some(Token::Num(n)) => Operand::Num(*n),
            _ => return Err(self.error("expected header name or literal")),
        };
        self.pos += 1;
        Ok(operand)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stomp::frame::command;

    fn message(headers: &[(&str, &str)]) -> Frame {
        let mut frame = Frame::new(command::MESSAGE);
        for (k, v) in headers {
            frame = frame.header(*k, *v);
        }
        frame
    }

    #[test]
    fn equality_on_string_header() {
        let selector = Selector::parse("color = 'red'").unwrap();
        assert!(selector.matches(&message(&[("color", "red")])));
        assert!(!selector.matches(&message(&[("color", "blue")])));
    }

    #[test]
    fn absent_header_never_matches() {
        let selector = Selector::parse("color = 'red'").unwrap();
        assert!(!selector.matches(&message(&[])));

        let selector = Selector::parse("color <> 'red'").unwrap();
        assert!(!selector.matches(&message(&[])));
    }

    #[test]
    fn numeric_comparison_parses_header_value() {
        let selector = Selector::parse("priority = 4").unwrap();
        assert!(selector.matches(&message(&[("priority", "4")])));
        assert!(selector.matches(&message(&[("priority", " 4.0 ")])));
        assert!(!selector.matches(&message(&[("priority", "high")])));
    }

    #[test]
    fn boolean_operators_and_precedence() {
        let selector = Selector::parse("a = '1' OR b = '2' AND c = '3'").unwrap();
        // AND binds tighter than OR.
        assert!(selector.matches(&message(&[("a", "1")])));
        assert!(selector.matches(&message(&[("b", "2"), ("c", "3")])));
        assert!(!selector.matches(&message(&[("b", "2")])));

        let selector = Selector::parse("(a = '1' OR b = '2') AND NOT c = '3'").unwrap();
        assert!(selector.matches(&message(&[("a", "1")])));
        assert!(!selector.matches(&message(&[("a", "1"), ("c", "3")])));
    }

    #[test]
    fn quoted_string_escapes() {
        let selector = Selector::parse("note = 'it''s'").unwrap();
        assert!(selector.matches(&message(&[("note", "it's")])));
    }

    #[test]
    fn syntax_errors_are_reported() {
        assert!(Selector::parse("").is_err());
        assert!(Selector::parse("color =").is_err());
        assert!(Selector::parse("color = 'red").is_err());
        assert!(Selector::parse("color ! 'red'").is_err());
        assert!(Selector::parse("(color = 'red'").is_err());
        assert!(Selector::parse("color = 'red' extra").is_err());
    }
}
