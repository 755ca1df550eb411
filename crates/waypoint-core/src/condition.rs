//! Sandboxed evaluator for CONDITIONAL edge expressions.
//!
//! The grammar is fixed and small:
//!
//! ```text
//! expr    := and (("or" | "||") and)*
//! and     := not (("and" | "&&") not)*
//! not     := ("not" | "!") not | compare
//! compare := operand (("==" | "!=" | "<" | "<=" | ">" | ">=" | "in" | "contains") operand)?
//! operand := literal | path | "(" expr ")"
//! path    := ident ("." ident | "[" (string | number) "]")*
//! ```
//!
//! Evaluation never executes code, never mutates the context and never fails:
//! unknown keys resolve to `null`, and type-mismatched comparisons are false.

use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;

/// Names bound by the executor that memory entries can never shadow.
pub const RESERVED_NAMES: [&str; 4] = ["output", "result", "true", "false"];

const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, Error, PartialEq)]
#[error("invalid condition at offset {offset}: {message}")]
pub struct ConditionError {
    pub offset: usize,
    pub message: String,
}

impl ConditionError {
    fn new(offset: usize, message: impl Into<String>) -> Self {
        Self {
            offset,
            message: message.into(),
        }
    }
}

/// A parsed condition, reusable across evaluations.
#[derive(Debug, Clone)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    pub fn parse(source: &str) -> Result<Self, ConditionError> {
        let tokens = lex(source)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let expr = parser.expr()?;
        if let Some((offset, tok)) = parser.tokens.get(parser.pos) {
            return Err(ConditionError::new(
                *offset,
                format!("unexpected trailing token {:?}", tok),
            ));
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn evaluate(&self, context: &HashMap<String, Value>) -> bool {
        truthy(&eval(&self.expr, context))
    }
}

/// Build the evaluation context for an edge leaving a node.
///
/// Non-reserved memory keys are merged first; `output`, `result`, `true` and
/// `false` are bound last.
pub fn build_context(
    memory: &HashMap<String, Value>,
    output: &HashMap<String, Value>,
) -> HashMap<String, Value> {
    let mut ctx: HashMap<String, Value> = memory
        .iter()
        .filter(|(k, _)| !RESERVED_NAMES.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let output_obj: serde_json::Map<String, Value> =
        output.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    let result = output_obj.get("result").cloned().unwrap_or(Value::Null);

    ctx.insert("output".into(), Value::Object(output_obj));
    ctx.insert("result".into(), result);
    ctx.insert("true".into(), Value::Bool(true));
    ctx.insert("false".into(), Value::Bool(false));
    ctx
}

/// Parse and evaluate in one step. Unparseable expressions are false.
pub fn evaluate_condition(expr: &str, context: &HashMap<String, Value>) -> bool {
    Condition::parse(expr)
        .map(|c| c.evaluate(context))
        .unwrap_or(false)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Str(String),
    Num(f64),
    Ident(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
    Minus,
    Cmp(CmpOp),
    And,
    Or,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    Contains,
}

#[derive(Debug, Clone)]
enum Segment {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Path { root: String, segments: Vec<Segment> },
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
}

fn lex(src: &str) -> Result<Vec<(usize, Token)>, ConditionError> {
    let chars: Vec<(usize, char)> = src.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (offset, c) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);
        match c {
            c if c.is_whitespace() => {
                i += 1;
            }
            '(' | ')' | '[' | ']' | '.' | '-' => {
                tokens.push((
                    offset,
                    match c {
                        '(' => Token::LParen,
                        ')' => Token::RParen,
                        '[' => Token::LBracket,
                        ']' => Token::RBracket,
                        '.' => Token::Dot,
                        _ => Token::Minus,
                    },
                ));
                i += 1;
            }
            '=' if next == Some('=') => {
                tokens.push((offset, Token::Cmp(CmpOp::Eq)));
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push((offset, Token::Cmp(CmpOp::Ne)));
                i += 2;
            }
            '!' => {
                tokens.push((offset, Token::Not));
                i += 1;
            }
            '<' | '>' => {
                let eq = next == Some('=');
                let op = match (c, eq) {
                    ('<', true) => CmpOp::Le,
                    ('<', false) => CmpOp::Lt,
                    (_, true) => CmpOp::Ge,
                    (_, false) => CmpOp::Gt,
                };
                tokens.push((offset, Token::Cmp(op)));
                i += if eq { 2 } else { 1 };
            }
            '&' if next == Some('&') => {
                tokens.push((offset, Token::And));
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push((offset, Token::Or));
                i += 2;
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    let Some(&(_, ch)) = chars.get(i) else {
                        return Err(ConditionError::new(offset, "unterminated string"));
                    };
                    i += 1;
                    match ch {
                        '\\' => {
                            let Some(&(_, esc)) = chars.get(i) else {
                                return Err(ConditionError::new(offset, "unterminated string"));
                            };
                            i += 1;
                            s.push(match esc {
                                'n' => '\n',
                                't' => '\t',
                                other => other,
                            });
                        }
                        ch if ch == quote => break,
                        ch => s.push(ch),
                    }
                }
                tokens.push((offset, Token::Str(s)));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].1.is_ascii_digit() || chars[i].1 == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().map(|(_, c)| c).collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| ConditionError::new(offset, format!("bad number '{}'", text)))?;
                tokens.push((offset, Token::Num(n)));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].1.is_alphanumeric() || chars[i].1 == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().map(|(_, c)| c).collect();
                let tok = match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "in" => Token::Cmp(CmpOp::In),
                    "contains" => Token::Cmp(CmpOp::Contains),
                    _ => Token::Ident(word),
                };
                tokens.push((offset, tok));
            }
            other => {
                return Err(ConditionError::new(
                    offset,
                    format!("unexpected character '{}'", other),
                ));
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|(o, _)| *o)
            .unwrap_or(0)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        tok
    }

    fn expect(&mut self, want: Token) -> Result<(), ConditionError> {
        let offset = self.offset();
        match self.advance() {
            Some(ref t) if *t == want => Ok(()),
            other => Err(ConditionError::new(
                offset,
                format!("expected {:?}, found {:?}", want, other),
            )),
        }
    }

    fn enter(&mut self) -> Result<(), ConditionError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ConditionError::new(self.offset(), "expression nested too deeply"));
        }
        Ok(())
    }

    fn expr(&mut self) -> Result<Expr, ConditionError> {
        self.enter()?;
        let mut lhs = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let rhs = self.and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        self.depth -= 1;
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, ConditionError> {
        let mut lhs = self.not()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let rhs = self.not()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn not(&mut self) -> Result<Expr, ConditionError> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            self.enter()?;
            let inner = self.not()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.compare()
    }

    fn compare(&mut self) -> Result<Expr, ConditionError> {
        let lhs = self.operand()?;
        if let Some(Token::Cmp(op)) = self.peek().cloned() {
            self.advance();
            let rhs = self.operand()?;
            return Ok(Expr::Compare(op, Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn operand(&mut self) -> Result<Expr, ConditionError> {
        let offset = self.offset();
        match self.advance() {
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Num(n)) => Ok(Expr::Literal(number(n))),
            Some(Token::Minus) => match self.advance() {
                Some(Token::Num(n)) => Ok(Expr::Literal(number(-n))),
                other => Err(ConditionError::new(
                    offset,
                    format!("expected number after '-', found {:?}", other),
                )),
            },
            Some(Token::LParen) => {
                let inner = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                _ => self.path(name),
            },
            other => Err(ConditionError::new(
                offset,
                format!("expected operand, found {:?}", other),
            )),
        }
    }

    fn path(&mut self, root: String) -> Result<Expr, ConditionError> {
        let mut segments = Vec::new();
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.advance();
                    let offset = self.offset();
                    match self.advance() {
                        Some(Token::Ident(key)) => segments.push(Segment::Key(key)),
                        other => {
                            return Err(ConditionError::new(
                                offset,
                                format!("expected key after '.', found {:?}", other),
                            ))
                        }
                    }
                }
                Some(Token::LBracket) => {
                    self.advance();
                    let offset = self.offset();
                    match self.advance() {
                        Some(Token::Str(key)) => segments.push(Segment::Key(key)),
                        Some(Token::Num(n)) if n >= 0.0 && n.fract() == 0.0 => {
                            segments.push(Segment::Index(n as usize))
                        }
                        other => {
                            return Err(ConditionError::new(
                                offset,
                                format!("expected key or index, found {:?}", other),
                            ))
                        }
                    }
                    self.expect(Token::RBracket)?;
                }
                _ => break,
            }
        }
        Ok(Expr::Path { root, segments })
    }
}

fn number(n: f64) -> Value {
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn eval(expr: &Expr, ctx: &HashMap<String, Value>) -> Value {
    match expr {
        Expr::Literal(v) => v.clone(),
        Expr::Path { root, segments } => {
            let mut current = match ctx.get(root) {
                Some(v) => v,
                None => return Value::Null,
            };
            for seg in segments {
                let next = match (seg, current) {
                    (Segment::Key(k), Value::Object(map)) => map.get(k),
                    (Segment::Index(i), Value::Array(items)) => items.get(*i),
                    _ => None,
                };
                match next {
                    Some(v) => current = v,
                    None => return Value::Null,
                }
            }
            current.clone()
        }
        Expr::Not(inner) => Value::Bool(!truthy(&eval(inner, ctx))),
        Expr::And(a, b) => Value::Bool(truthy(&eval(a, ctx)) && truthy(&eval(b, ctx))),
        Expr::Or(a, b) => Value::Bool(truthy(&eval(a, ctx)) || truthy(&eval(b, ctx))),
        Expr::Compare(op, a, b) => Value::Bool(compare(*op, &eval(a, ctx), &eval(b, ctx))),
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(op: CmpOp, a: &Value, b: &Value) -> bool {
    match op {
        CmpOp::Eq => loose_eq(a, b),
        CmpOp::Ne => !loose_eq(a, b),
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            let ord = match (a, b) {
                (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
                _ => match (a.as_f64(), b.as_f64()) {
                    (Some(x), Some(y)) => x.partial_cmp(&y),
                    _ => None,
                },
            };
            let Some(ord) = ord else { return false };
            match op {
                CmpOp::Lt => ord.is_lt(),
                CmpOp::Le => ord.is_le(),
                CmpOp::Gt => ord.is_gt(),
                _ => ord.is_ge(),
            }
        }
        CmpOp::In => member(a, b),
        CmpOp::Contains => member(b, a),
    }
}

/// Whether `needle` is an element of, substring of, or key in `haystack`.
fn member(needle: &Value, haystack: &Value) -> bool {
    match haystack {
        Value::Array(items) => items.iter().any(|v| loose_eq(v, needle)),
        Value::String(s) => needle.as_str().is_some_and(|n| s.contains(n)),
        Value::Object(map) => needle.as_str().is_some_and(|k| map.contains_key(k)),
        _ => false,
    }
}

pub fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}
