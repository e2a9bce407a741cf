//! Safe parser for the `qb` query expression language.
//!
//! The wire-level `qb=` parameter carries a small expression DSL
//! (`QB["age"].gt(18) & QB["status"].eq("active")`). This module parses it
//! with a hand-written lexer and recursive-descent parser over a closed
//! grammar: subscript access on the `QB` root, an allowlist of method calls,
//! the logical operators `& | ~`, comparison operators, and literals.
//! Anything outside that set is rejected. This is a security boundary — no
//! general-purpose evaluation happens here.

use crate::builder::{Cond, FieldRef, Qb, QueryBuilder};
use crate::condition::{SearchQuery, SortSpec};
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unexpected character {0:?} at offset {1}")]
    UnexpectedChar(char, usize),
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("invalid number literal {0:?}")]
    InvalidNumber(String),
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("unexpected token `{0}`")]
    UnexpectedToken(String),
    #[error("unknown identifier `{0}`; only QB expressions are accepted")]
    UnknownIdentifier(String),
    #[error("method `{0}` is not allowed")]
    MethodNotAllowed(String),
    #[error("attribute `{0}` is not allowed on QB")]
    AttributeNotAllowed(String),
    #[error("method `{method}` expects {expected} argument(s), got {got}")]
    Arity {
        method: String,
        expected: &'static str,
        got: usize,
    },
    #[error("invalid argument for `{0}`: {1}")]
    InvalidArgument(String, String),
    #[error("operands are not comparable in a QB expression")]
    BadComparison,
    #[error("expression does not produce a query")]
    NotAQuery,
}

pub type Result<T> = std::result::Result<T, ParseError>;

/// Methods callable anywhere in a QB expression. Closed set; extending it is
/// an API decision, not a convenience.
const ALLOWED_METHODS: &[&str] = &[
    "eq",
    "ne",
    "gt",
    "gte",
    "lt",
    "lte",
    "contains",
    "starts_with",
    "ends_with",
    "regex",
    "in_",
    "not_in",
    "between",
    "is_null",
    "is_not_null",
    "is_true",
    "is_false",
    "today",
    "yesterday",
    "this_week",
    "this_month",
    "this_year",
    "last_n_days",
    "length",
    "asc",
    "desc",
    "sort",
    "limit",
    "offset",
    "page",
    "first",
    "filter",
    "exclude",
];

/// Attributes callable on the `QB` root.
const ALLOWED_QB_ATTRS: &[&str] = &[
    "resource_id",
    "created_time",
    "updated_time",
    "created_by",
    "updated_by",
    "is_deleted",
    "all",
    "any",
];

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    True,
    False,
    Null,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Comma,
    Dot,
    Amp,
    Pipe,
    Tilde,
    Minus,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Ident(s) => s.clone(),
            Token::Str(_) => "string".into(),
            Token::Int(n) => n.to_string(),
            Token::Float(f) => f.to_string(),
            Token::True => "True".into(),
            Token::False => "False".into(),
            Token::Null => "None".into(),
            Token::LBracket => "[".into(),
            Token::RBracket => "]".into(),
            Token::LParen => "(".into(),
            Token::RParen => ")".into(),
            Token::Comma => ",".into(),
            Token::Dot => ".".into(),
            Token::Amp => "&".into(),
            Token::Pipe => "|".into(),
            Token::Tilde => "~".into(),
            Token::Minus => "-".into(),
            Token::EqEq => "==".into(),
            Token::NotEq => "!=".into(),
            Token::Lt => "<".into(),
            Token::Le => "<=".into(),
            Token::Gt => ">".into(),
            Token::Ge => ">=".into(),
        }
    }
}

fn lex(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let bytes = input.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '&' => {
                tokens.push(Token::Amp);
                i += 1;
            }
            '|' => {
                tokens.push(Token::Pipe);
                i += 1;
            }
            '~' => {
                tokens.push(Token::Tilde);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '+' => {
                // Unary plus is a no-op; only valid before a number.
                i += 1;
                if i >= bytes.len() || !(bytes[i] as char).is_ascii_digit() {
                    return Err(ParseError::UnexpectedChar('+', i.saturating_sub(1)));
                }
            }
            '=' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::EqEq);
                    i += 2;
                } else {
                    return Err(ParseError::UnexpectedChar('=', i));
                }
            }
            '!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::NotEq);
                    i += 2;
                } else {
                    return Err(ParseError::UnexpectedChar('!', i));
                }
            }
            '<' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut out = String::new();
                i += 1;
                loop {
                    if i >= bytes.len() {
                        return Err(ParseError::UnterminatedString);
                    }
                    let ch = input[i..].chars().next().ok_or(ParseError::UnterminatedString)?;
                    if ch == quote {
                        i += ch.len_utf8();
                        break;
                    }
                    if ch == '\\' {
                        i += 1;
                        let esc = input[i..].chars().next().ok_or(ParseError::UnterminatedString)?;
                        match esc {
                            'n' => out.push('\n'),
                            't' => out.push('\t'),
                            'r' => out.push('\r'),
                            '\\' => out.push('\\'),
                            '\'' => out.push('\''),
                            '"' => out.push('"'),
                            other => {
                                // Keep unknown escapes verbatim (regex
                                // patterns travel through here).
                                out.push('\\');
                                out.push(other);
                            }
                        }
                        i += esc.len_utf8();
                    } else {
                        out.push(ch);
                        i += ch.len_utf8();
                    }
                }
                tokens.push(Token::Str(out));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                let mut is_float = false;
                while i < bytes.len() {
                    let d = bytes[i] as char;
                    if d.is_ascii_digit() {
                        i += 1;
                    } else if d == '.' && !is_float && bytes.get(i + 1).is_some_and(|b| (*b as char).is_ascii_digit()) {
                        is_float = true;
                        i += 1;
                    } else if (d == 'e' || d == 'E')
                        && bytes.get(i + 1).is_some_and(|b| {
                            (*b as char).is_ascii_digit() || *b == b'-' || *b == b'+'
                        })
                    {
                        is_float = true;
                        i += 2;
                    } else {
                        break;
                    }
                }
                let text = &input[start..i];
                if is_float {
                    let value: f64 = text
                        .parse()
                        .map_err(|_| ParseError::InvalidNumber(text.to_string()))?;
                    tokens.push(Token::Float(value));
                } else {
                    let value: i64 = text
                        .parse()
                        .map_err(|_| ParseError::InvalidNumber(text.to_string()))?;
                    tokens.push(Token::Int(value));
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len() {
                    let d = bytes[i] as char;
                    if d.is_ascii_alphanumeric() || d == '_' {
                        i += 1;
                    } else {
                        break;
                    }
                }
                let word = &input[start..i];
                tokens.push(match word {
                    "True" | "true" => Token::True,
                    "False" | "false" => Token::False,
                    "None" | "null" => Token::Null,
                    _ => Token::Ident(word.to_string()),
                });
            }
            other => return Err(ParseError::UnexpectedChar(other, i)),
        }
    }

    Ok(tokens)
}

/// Intermediate value during evaluation.
#[derive(Debug, Clone)]
enum Qv {
    /// The `QB` root.
    Root,
    Field(FieldRef),
    Cond(CondVal),
    Query(QueryBuilder),
    Sort(SortSpec),
    Value(Value),
}

/// A condition plus the leaf field it came from, kept so chained comparisons
/// (`18 <= QB["age"] <= 65`) can extend it.
#[derive(Debug, Clone)]
struct CondVal {
    cond: Cond,
    chain: Option<FieldRef>,
}

impl CondVal {
    fn plain(cond: Cond) -> Self {
        CondVal { cond, chain: None }
    }
}

/// Parser for `qb` expressions. The clock used by the date helpers can be
/// pinned with [`QbParser::with_now`].
#[derive(Debug, Clone)]
pub struct QbParser {
    now: DateTime<Utc>,
}

impl Default for QbParser {
    fn default() -> Self {
        Self::new()
    }
}

impl QbParser {
    pub fn new() -> Self {
        QbParser { now: Utc::now() }
    }

    pub fn with_now(now: DateTime<Utc>) -> Self {
        QbParser { now }
    }

    pub fn parse(&self, input: &str) -> Result<SearchQuery> {
        let tokens = lex(input)?;
        let mut cursor = Cursor {
            tokens,
            pos: 0,
            now: self.now,
        };
        let value = cursor.parse_or()?;
        if cursor.pos != cursor.tokens.len() {
            return Err(ParseError::UnexpectedToken(
                cursor.tokens[cursor.pos].describe(),
            ));
        }
        match value {
            Qv::Query(q) => Ok(q.build()),
            Qv::Cond(c) => Ok(c.cond.build()),
            Qv::Field(f) => Ok(Cond::from(f).build()),
            _ => Err(ParseError::NotAQuery),
        }
    }
}

/// Parses a `qb` expression with the current wall clock.
pub fn parse_qb(input: &str) -> Result<SearchQuery> {
    QbParser::new().parse(input)
}

struct Cursor {
    tokens: Vec<Token>,
    pos: usize,
    now: DateTime<Utc>,
}

impl Cursor {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<Token> {
        let token = self.tokens.get(self.pos).cloned().ok_or(ParseError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(token)
    }

    fn expect(&mut self, expected: &Token) -> Result<()> {
        let token = self.next()?;
        if &token == expected {
            Ok(())
        } else {
            Err(ParseError::UnexpectedToken(token.describe()))
        }
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_or(&mut self) -> Result<Qv> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::Pipe) {
            let right = self.parse_and()?;
            let combined = to_cond(left)? | to_cond(right)?;
            left = Qv::Cond(CondVal::plain(combined));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Qv> {
        let mut left = self.parse_cmp()?;
        while self.eat(&Token::Amp) {
            let right = self.parse_cmp()?;
            let combined = to_cond(left)? & to_cond(right)?;
            left = Qv::Cond(CondVal::plain(combined));
        }
        Ok(left)
    }

    fn parse_cmp(&mut self) -> Result<Qv> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::EqEq) => CmpOp::Eq,
                Some(Token::NotEq) => CmpOp::Ne,
                Some(Token::Lt) => CmpOp::Lt,
                Some(Token::Le) => CmpOp::Le,
                Some(Token::Gt) => CmpOp::Gt,
                Some(Token::Ge) => CmpOp::Ge,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = apply_cmp(left, op, right)?;
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Qv> {
        if self.eat(&Token::Tilde) {
            let inner = self.parse_unary()?;
            return Ok(match inner {
                Qv::Field(f) => Qv::Cond(CondVal::plain(f.is_falsy())),
                other => Qv::Cond(CondVal::plain(!to_cond(other)?)),
            });
        }
        if self.eat(&Token::Minus) {
            let inner = self.parse_unary()?;
            return match inner {
                Qv::Value(Value::Number(n)) => {
                    let negated = if let Some(i) = n.as_i64() {
                        Value::from(-i)
                    } else if let Some(f) = n.as_f64() {
                        Value::from(-f)
                    } else {
                        return Err(ParseError::InvalidNumber(n.to_string()));
                    };
                    Ok(Qv::Value(negated))
                }
                _ => Err(ParseError::UnexpectedToken("-".into())),
            };
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Qv> {
        let mut value = self.parse_primary()?;
        loop {
            if self.eat(&Token::Dot) {
                let name = match self.next()? {
                    Token::Ident(name) => name,
                    other => return Err(ParseError::UnexpectedToken(other.describe())),
                };
                self.expect(&Token::LParen)?;
                let args = self.parse_args()?;
                value = self.apply_method(value, &name, args)?;
            } else if matches!(value, Qv::Root) && self.eat(&Token::LBracket) {
                let key = match self.next()? {
                    Token::Str(s) => s,
                    other => return Err(ParseError::UnexpectedToken(other.describe())),
                };
                self.expect(&Token::RBracket)?;
                value = Qv::Field(Qb::field(key));
            } else {
                break;
            }
        }
        Ok(value)
    }

    fn parse_args(&mut self) -> Result<Vec<Qv>> {
        let mut args = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.parse_or()?);
            if self.eat(&Token::Comma) {
                continue;
            }
            self.expect(&Token::RParen)?;
            return Ok(args);
        }
    }

    fn parse_primary(&mut self) -> Result<Qv> {
        match self.next()? {
            Token::Ident(name) if name == "QB" => Ok(Qv::Root),
            Token::Ident(name) => Err(ParseError::UnknownIdentifier(name)),
            Token::Str(s) => Ok(Qv::Value(Value::String(s))),
            Token::Int(n) => Ok(Qv::Value(Value::from(n))),
            Token::Float(f) => Ok(Qv::Value(Value::from(f))),
            Token::True => Ok(Qv::Value(Value::Bool(true))),
            Token::False => Ok(Qv::Value(Value::Bool(false))),
            Token::Null => Ok(Qv::Value(Value::Null)),
            Token::LParen => {
                let inner = self.parse_or()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Token::LBracket => {
                let mut items = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        let item = self.parse_or()?;
                        items.push(to_value(item, "list literal")?);
                        if self.eat(&Token::Comma) {
                            continue;
                        }
                        self.expect(&Token::RBracket)?;
                        break;
                    }
                }
                Ok(Qv::Value(Value::Array(items)))
            }
            other => Err(ParseError::UnexpectedToken(other.describe())),
        }
    }

    fn apply_method(&self, receiver: Qv, name: &str, args: Vec<Qv>) -> Result<Qv> {
        if let Qv::Root = receiver {
            return self.apply_root_attr(name, args);
        }
        if !ALLOWED_METHODS.contains(&name) {
            return Err(ParseError::MethodNotAllowed(name.to_string()));
        }
        match receiver {
            Qv::Field(field) => self.apply_field_method(field, name, args),
            Qv::Cond(cond) => self.apply_cond_method(cond, name, args),
            Qv::Query(query) => apply_query_method(query, name, args),
            _ => Err(ParseError::InvalidArgument(
                name.to_string(),
                "receiver does not support method calls".into(),
            )),
        }
    }

    fn apply_root_attr(&self, name: &str, args: Vec<Qv>) -> Result<Qv> {
        if !ALLOWED_QB_ATTRS.contains(&name) {
            return Err(ParseError::AttributeNotAllowed(name.to_string()));
        }
        match name {
            "resource_id" => expect_no_args(name, &args).map(|_| Qv::Field(Qb::resource_id())),
            "created_time" => expect_no_args(name, &args).map(|_| Qv::Field(Qb::created_time())),
            "updated_time" => expect_no_args(name, &args).map(|_| Qv::Field(Qb::updated_time())),
            "created_by" => expect_no_args(name, &args).map(|_| Qv::Field(Qb::created_by())),
            "updated_by" => expect_no_args(name, &args).map(|_| Qv::Field(Qb::updated_by())),
            "is_deleted" => expect_no_args(name, &args).map(|_| Qv::Field(Qb::is_deleted())),
            "all" => {
                let conds = args
                    .into_iter()
                    .map(to_cond)
                    .collect::<Result<Vec<_>>>()?;
                Ok(Qv::Cond(CondVal::plain(Qb::all(conds))))
            }
            "any" => {
                let conds = args
                    .into_iter()
                    .map(to_cond)
                    .collect::<Result<Vec<_>>>()?;
                Ok(Qv::Cond(CondVal::plain(Qb::any(conds))))
            }
            _ => Err(ParseError::AttributeNotAllowed(name.to_string())),
        }
    }

    fn apply_field_method(&self, field: FieldRef, name: &str, args: Vec<Qv>) -> Result<Qv> {
        let chained = |cond: Cond, field: &FieldRef| {
            Qv::Cond(CondVal {
                cond,
                chain: Some(field.clone()),
            })
        };
        match name {
            "eq" | "ne" | "gt" | "gte" | "lt" | "lte" | "contains" | "starts_with"
            | "ends_with" | "regex" => {
                let value = one_value(name, args)?;
                let cond = match name {
                    "eq" => field.eq(value),
                    "ne" => field.ne(value),
                    "gt" => field.gt(value),
                    "gte" => field.gte(value),
                    "lt" => field.lt(value),
                    "lte" => field.lte(value),
                    "contains" => field.contains(value),
                    "starts_with" => field.starts_with(value),
                    "ends_with" => field.ends_with(value),
                    _ => {
                        let pattern = value.as_str().ok_or_else(|| {
                            ParseError::InvalidArgument(name.into(), "expected a string".into())
                        })?;
                        field.regex(pattern)
                    }
                };
                Ok(chained(cond, &field))
            }
            "in_" | "not_in" => {
                let value = one_value(name, args)?;
                let items = match value {
                    Value::Array(items) => items,
                    _ => {
                        return Err(ParseError::InvalidArgument(
                            name.into(),
                            "expected a list".into(),
                        ))
                    }
                };
                let cond = if name == "in_" {
                    field.in_list(items)
                } else {
                    field.not_in(items)
                };
                Ok(Qv::Cond(CondVal::plain(cond)))
            }
            "between" => {
                let (min, max) = two_values(name, args)?;
                Ok(Qv::Cond(CondVal::plain(field.between(min, max))))
            }
            "is_null" => {
                let flag = optional_bool(name, args)?.unwrap_or(true);
                Ok(Qv::Cond(CondVal::plain(field.is_null(flag))))
            }
            "is_not_null" => {
                expect_no_args(name, &args)?;
                Ok(Qv::Cond(CondVal::plain(field.is_not_null())))
            }
            "is_true" => {
                expect_no_args(name, &args)?;
                Ok(Qv::Cond(CondVal::plain(field.is_true())))
            }
            "is_false" => {
                expect_no_args(name, &args)?;
                Ok(Qv::Cond(CondVal::plain(field.is_false())))
            }
            "today" => {
                let tz = optional_tz(name, args)?;
                Ok(Qv::Cond(CondVal::plain(field.today_at(self.now, tz))))
            }
            "yesterday" => {
                let tz = optional_tz(name, args)?;
                Ok(Qv::Cond(CondVal::plain(field.yesterday_at(self.now, tz))))
            }
            "this_week" => {
                let tz = optional_tz(name, args)?;
                Ok(Qv::Cond(CondVal::plain(field.this_week_at(self.now, tz))))
            }
            "this_month" => {
                let tz = optional_tz(name, args)?;
                Ok(Qv::Cond(CondVal::plain(field.this_month_at(self.now, tz))))
            }
            "this_year" => {
                let tz = optional_tz(name, args)?;
                Ok(Qv::Cond(CondVal::plain(field.this_year_at(self.now, tz))))
            }
            "last_n_days" => {
                let mut args = args.into_iter();
                let n = match args.next().map(|a| to_value(a, name)) {
                    Some(Ok(Value::Number(n))) => n.as_i64().ok_or_else(|| {
                        ParseError::InvalidArgument(name.into(), "expected an integer".into())
                    })?,
                    _ => {
                        return Err(ParseError::Arity {
                            method: name.into(),
                            expected: "1 or 2",
                            got: 0,
                        })
                    }
                };
                let tz = optional_tz(name, args.collect())?;
                Ok(Qv::Cond(CondVal::plain(
                    field.last_n_days_at(self.now, n, tz),
                )))
            }
            "length" => {
                expect_no_args(name, &args)?;
                Ok(Qv::Field(field.length()))
            }
            "asc" => {
                expect_no_args(name, &args)?;
                Ok(Qv::Sort(field.asc()))
            }
            "desc" => {
                expect_no_args(name, &args)?;
                Ok(Qv::Sort(field.desc()))
            }
            // Query-level methods coerce the bare field to its truthy form.
            "sort" | "limit" | "offset" | "page" | "first" | "filter" | "exclude" => {
                self.apply_cond_method(CondVal::plain(Cond::from(field)), name, args)
            }
            _ => Err(ParseError::MethodNotAllowed(name.to_string())),
        }
    }

    fn apply_cond_method(&self, cond: CondVal, name: &str, args: Vec<Qv>) -> Result<Qv> {
        match name {
            "filter" => {
                let conds = args
                    .into_iter()
                    .map(to_cond)
                    .collect::<Result<Vec<_>>>()?;
                Ok(Qv::Cond(CondVal::plain(cond.cond.filter(conds))))
            }
            "exclude" => {
                let conds = args
                    .into_iter()
                    .map(to_cond)
                    .collect::<Result<Vec<_>>>()?;
                Ok(Qv::Cond(CondVal::plain(cond.cond.exclude(conds))))
            }
            "sort" | "limit" | "offset" | "page" | "first" => {
                apply_query_method(QueryBuilder::from(cond.cond), name, args)
            }
            _ => Err(ParseError::InvalidArgument(
                name.to_string(),
                "not applicable to a condition".into(),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn flip(self) -> Self {
        match self {
            CmpOp::Eq => CmpOp::Eq,
            CmpOp::Ne => CmpOp::Ne,
            CmpOp::Lt => CmpOp::Gt,
            CmpOp::Le => CmpOp::Ge,
            CmpOp::Gt => CmpOp::Lt,
            CmpOp::Ge => CmpOp::Le,
        }
    }

    fn apply(self, field: &FieldRef, value: Value) -> Cond {
        match self {
            CmpOp::Eq => field.eq(value),
            CmpOp::Ne => field.ne(value),
            CmpOp::Lt => field.lt(value),
            CmpOp::Le => field.lte(value),
            CmpOp::Gt => field.gt(value),
            CmpOp::Ge => field.gte(value),
        }
    }
}

/// Chained comparisons AND together: `18 <= QB["age"] <= 65` is
/// `age >= 18 & age <= 65`.
fn apply_cmp(left: Qv, op: CmpOp, right: Qv) -> Result<Qv> {
    match (left, right) {
        (Qv::Field(field), Qv::Value(value)) => {
            let cond = op.apply(&field, value);
            Ok(Qv::Cond(CondVal {
                cond,
                chain: Some(field),
            }))
        }
        (Qv::Value(value), Qv::Field(field)) => {
            let cond = op.flip().apply(&field, value);
            Ok(Qv::Cond(CondVal {
                cond,
                chain: Some(field),
            }))
        }
        (Qv::Cond(prev), Qv::Value(value)) => {
            let field = prev.chain.clone().ok_or(ParseError::BadComparison)?;
            let cond = prev.cond & op.apply(&field, value);
            Ok(Qv::Cond(CondVal {
                cond,
                chain: Some(field),
            }))
        }
        (Qv::Value(value), Qv::Cond(prev)) => {
            let field = prev.chain.clone().ok_or(ParseError::BadComparison)?;
            let cond = prev.cond & op.flip().apply(&field, value);
            Ok(Qv::Cond(CondVal {
                cond,
                chain: Some(field),
            }))
        }
        _ => Err(ParseError::BadComparison),
    }
}

fn apply_query_method(query: QueryBuilder, name: &str, args: Vec<Qv>) -> Result<Qv> {
    match name {
        "sort" => {
            if args.is_empty() {
                return Err(ParseError::Arity {
                    method: name.into(),
                    expected: "at least 1",
                    got: 0,
                });
            }
            let mut query = query;
            for arg in args {
                let spec = match arg {
                    Qv::Sort(spec) => spec,
                    Qv::Value(Value::String(s)) => SortSpec::parse(&s),
                    _ => {
                        return Err(ParseError::InvalidArgument(
                            name.into(),
                            "expected a sort or a string".into(),
                        ))
                    }
                };
                query = query.sort(spec);
            }
            Ok(Qv::Query(query))
        }
        "limit" => {
            let n = one_u32(name, args)?;
            Ok(Qv::Query(query.limit(n)))
        }
        "offset" => {
            let n = one_u32(name, args)?;
            Ok(Qv::Query(query.offset(n)))
        }
        "page" => {
            let mut args = args.into_iter();
            let page = qv_u32(name, args.next().ok_or(ParseError::Arity {
                method: name.into(),
                expected: "1 or 2",
                got: 0,
            })?)?;
            let size = match args.next() {
                Some(arg) => qv_u32(name, arg)?,
                None => 20,
            };
            if args.next().is_some() {
                return Err(ParseError::Arity {
                    method: name.into(),
                    expected: "1 or 2",
                    got: 3,
                });
            }
            Ok(Qv::Query(query.page(page, size)))
        }
        "first" => {
            expect_no_args(name, &args)?;
            Ok(Qv::Query(query.first()))
        }
        _ => Err(ParseError::InvalidArgument(
            name.to_string(),
            "not applicable to a query".into(),
        )),
    }
}

fn to_cond(value: Qv) -> Result<Cond> {
    match value {
        Qv::Cond(c) => Ok(c.cond),
        Qv::Field(f) => Ok(Cond::from(f)),
        _ => Err(ParseError::BadComparison),
    }
}

fn to_value(value: Qv, context: &str) -> Result<Value> {
    match value {
        Qv::Value(v) => Ok(v),
        _ => Err(ParseError::InvalidArgument(
            context.to_string(),
            "expected a literal value".into(),
        )),
    }
}

fn expect_no_args(name: &str, args: &[Qv]) -> Result<()> {
    if args.is_empty() {
        Ok(())
    } else {
        Err(ParseError::Arity {
            method: name.to_string(),
            expected: "0",
            got: args.len(),
        })
    }
}

fn one_value(name: &str, args: Vec<Qv>) -> Result<Value> {
    let got = args.len();
    let mut args = args.into_iter();
    match (args.next(), args.next()) {
        (Some(arg), None) => to_value(arg, name),
        _ => Err(ParseError::Arity {
            method: name.to_string(),
            expected: "1",
            got,
        }),
    }
}

fn two_values(name: &str, args: Vec<Qv>) -> Result<(Value, Value)> {
    let got = args.len();
    let mut args = args.into_iter();
    match (args.next(), args.next(), args.next()) {
        (Some(a), Some(b), None) => Ok((to_value(a, name)?, to_value(b, name)?)),
        _ => Err(ParseError::Arity {
            method: name.to_string(),
            expected: "2",
            got,
        }),
    }
}

fn optional_bool(name: &str, args: Vec<Qv>) -> Result<Option<bool>> {
    let got = args.len();
    let mut args = args.into_iter();
    match (args.next(), args.next()) {
        (None, _) => Ok(None),
        (Some(Qv::Value(Value::Bool(b))), None) => Ok(Some(b)),
        (Some(_), None) => Err(ParseError::InvalidArgument(
            name.to_string(),
            "expected a boolean".into(),
        )),
        _ => Err(ParseError::Arity {
            method: name.to_string(),
            expected: "0 or 1",
            got,
        }),
    }
}

/// Timezone argument: an integer offset in hours, or a string like `"+8"`.
fn optional_tz(name: &str, args: Vec<Qv>) -> Result<Option<i32>> {
    let got = args.len();
    let mut args = args.into_iter();
    match (args.next(), args.next()) {
        (None, _) => Ok(None),
        (Some(Qv::Value(Value::Number(n))), None) => {
            let hours = n.as_i64().ok_or_else(|| {
                ParseError::InvalidArgument(name.to_string(), "expected an integer offset".into())
            })?;
            Ok(Some(hours as i32))
        }
        (Some(Qv::Value(Value::String(s))), None) => {
            let hours: i32 = s.trim_start_matches('+').parse().map_err(|_| {
                ParseError::InvalidArgument(
                    name.to_string(),
                    format!("invalid timezone offset {s:?}"),
                )
            })?;
            Ok(Some(hours))
        }
        (Some(_), None) => Err(ParseError::InvalidArgument(
            name.to_string(),
            "expected an integer offset".into(),
        )),
        _ => Err(ParseError::Arity {
            method: name.to_string(),
            expected: "0 or 1",
            got,
        }),
    }
}

fn qv_u32(name: &str, value: Qv) -> Result<u32> {
    match value {
        Qv::Value(Value::Number(n)) => n
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| {
                ParseError::InvalidArgument(
                    name.to_string(),
                    "expected a non-negative integer".into(),
                )
            }),
        _ => Err(ParseError::InvalidArgument(
            name.to_string(),
            "expected an integer".into(),
        )),
    }
}

fn one_u32(name: &str, args: Vec<Qv>) -> Result<u32> {
    let got = args.len();
    let mut args = args.into_iter();
    match (args.next(), args.next()) {
        (Some(arg), None) => qv_u32(name, arg),
        _ => Err(ParseError::Arity {
            method: name.to_string(),
            expected: "1",
            got,
        }),
    }
}
