//! Restricted formula language used by KPI expressions and style expressions.
//!
//! Formulas are parsed into an [`Expr`] tree and evaluated against a
//! [`Scope`]. Only the scope's bindings and the builtin aggregates
//! (`sum`, `avg`, `min`, `max`, `len`, `abs`) are reachable from a formula.

use crate::schema::AggregateKind;
use crate::value::{aggregate, arithmetic, compare, negate, Value};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("division by zero")]
    DivisionByZero,

    #[error("name '{0}' is not defined")]
    UndefinedName(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("type error: {0}")]
    TypeMismatch(String),

    #[error("no attribute '{0}'")]
    UnknownAttribute(String),

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("syntax error: {0}")]
    Syntax(String),
}

impl EvalError {
    /// Errors that may disappear once another KPI has been computed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EvalError::UndefinedName(_) | EvalError::InvalidValue(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Pow => "**",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }

    fn from_symbol(symbol: &str) -> Option<Self> {
        match symbol {
            "==" => Some(CompareOp::Eq),
            "!=" => Some(CompareOp::Ne),
            "<" => Some(CompareOp::Lt),
            "<=" => Some(CompareOp::Le),
            ">" => Some(CompareOp::Gt),
            ">=" => Some(CompareOp::Ge),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Text(String),
    Bool(bool),
    NoData,
    Name(String),
    Attribute(Box<Expr>, String),
    Call(String, Vec<Expr>),
    List(Vec<Expr>),
    Negate(Box<Expr>),
    Not(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Compare(CompareOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Conditional {
        condition: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
}

pub const KEYWORDS: &[&str] = &["and", "or", "not", "if", "else", "None", "True", "False"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Sum,
    Avg,
    Min,
    Max,
    Len,
    Abs,
}

impl Builtin {
    pub const NAMES: &'static [&'static str] = &["sum", "avg", "min", "max", "len", "abs"];

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sum" => Some(Builtin::Sum),
            "avg" => Some(Builtin::Avg),
            "min" => Some(Builtin::Min),
            "max" => Some(Builtin::Max),
            "len" => Some(Builtin::Len),
            "abs" => Some(Builtin::Abs),
            _ => None,
        }
    }

    fn call(self, args: Vec<Value>) -> Result<Value, EvalError> {
        let kind = match self {
            Builtin::Sum => AggregateKind::Sum,
            Builtin::Avg => AggregateKind::Avg,
            Builtin::Min => AggregateKind::Min,
            Builtin::Max => AggregateKind::Max,
            Builtin::Len => return Self::len(args),
            Builtin::Abs => return Self::abs(args),
        };
        match args.as_slice() {
            [Value::List(items)] => aggregate(kind, items),
            _ => aggregate(kind, &args),
        }
    }

    fn single(name: &str, mut args: Vec<Value>) -> Result<Value, EvalError> {
        if args.len() != 1 {
            return Err(EvalError::TypeMismatch(format!(
                "{}() takes exactly one argument ({} given)",
                name,
                args.len()
            )));
        }
        Ok(args.remove(0))
    }

    fn len(args: Vec<Value>) -> Result<Value, EvalError> {
        match Self::single("len", args)? {
            Value::List(items) => Ok(Value::Number(items.len() as f64)),
            Value::Record(fields) => Ok(Value::Number(fields.len() as f64)),
            Value::Text(s) => Ok(Value::Number(s.chars().count() as f64)),
            other => Err(EvalError::TypeMismatch(format!("len() of {}", other))),
        }
    }

    fn abs(args: Vec<Value>) -> Result<Value, EvalError> {
        match Self::single("abs", args)? {
            Value::None => Ok(Value::None),
            other => match other.as_f64() {
                Some(n) => Ok(Value::Number(n.abs())),
                None => Err(EvalError::TypeMismatch(format!("abs() of {}", other))),
            },
        }
    }
}

/// Name bindings visible to formulas during one evaluation pass.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    bindings: HashMap<String, Value>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.bindings.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.bindings.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

impl Extend<(String, Value)> for Scope {
    fn extend<T: IntoIterator<Item = (String, Value)>>(&mut self, iter: T) {
        self.bindings.extend(iter);
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Punct(&'static str),
}

const TWO_CHAR_PUNCT: &[&str] = &["**", "==", "!=", "<=", ">="];
const ONE_CHAR_PUNCT: &[&str] = &["+", "-", "*", "/", "%", "(", ")", "[", "]", ",", ".", "<", ">"];

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn tokenize(source: &str) -> Result<Vec<Token>, EvalError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            if i + 1 < chars.len() && chars[i] == '.' && chars[i + 1].is_ascii_digit() {
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
            }
            if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                let mut j = i + 1;
                if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                    j += 1;
                }
                if j < chars.len() && chars[j].is_ascii_digit() {
                    i = j;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
            }
            let text: String = chars[start..i].iter().collect();
            let number = text
                .parse::<f64>()
                .map_err(|_| EvalError::Syntax(format!("invalid number '{}'", text)))?;
            tokens.push(Token::Number(number));
            continue;
        }

        if is_ident_start(c) {
            let start = i;
            while i < chars.len() && is_ident_char(chars[i]) {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
            continue;
        }

        if c == '\'' || c == '"' {
            let quote = c;
            let mut text = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    None => return Err(EvalError::Syntax("unterminated string".to_string())),
                    Some(&ch) if ch == quote => {
                        i += 1;
                        break;
                    }
                    Some('\\') => {
                        let escaped = chars
                            .get(i + 1)
                            .ok_or_else(|| EvalError::Syntax("unterminated string".to_string()))?;
                        text.push(match escaped {
                            'n' => '\n',
                            't' => '\t',
                            other => *other,
                        });
                        i += 2;
                    }
                    Some(&ch) => {
                        text.push(ch);
                        i += 1;
                    }
                }
            }
            tokens.push(Token::Str(text));
            continue;
        }

        if i + 1 < chars.len() {
            let pair: String = chars[i..i + 2].iter().collect();
            if let Some(p) = TWO_CHAR_PUNCT.iter().find(|p| **p == pair) {
                tokens.push(Token::Punct(p));
                i += 2;
                continue;
            }
        }

        let single = c.to_string();
        match ONE_CHAR_PUNCT.iter().find(|p| **p == single) {
            Some(p) => {
                tokens.push(Token::Punct(p));
                i += 1;
            }
            None => {
                return Err(EvalError::Syntax(format!("unexpected character '{}'", c)));
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn at_punct(&self, punct: &str) -> bool {
        matches!(self.peek(), Some(Token::Punct(p)) if *p == punct)
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(name)) if name == keyword)
    }

    fn eat_punct(&mut self, punct: &str) -> bool {
        if self.at_punct(punct) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.at_keyword(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, punct: &str) -> Result<(), EvalError> {
        if self.eat_punct(punct) {
            Ok(())
        } else {
            Err(EvalError::Syntax(format!(
                "expected '{}', found {}",
                punct,
                self.describe_current()
            )))
        }
    }

    fn describe_current(&self) -> String {
        match self.peek() {
            None => "end of expression".to_string(),
            Some(Token::Number(n)) => format!("number {}", n),
            Some(Token::Str(s)) => format!("string '{}'", s),
            Some(Token::Ident(name)) => format!("'{}'", name),
            Some(Token::Punct(p)) => format!("'{}'", p),
        }
    }

    fn parse_conditional(&mut self) -> Result<Expr, EvalError> {
        let body = self.parse_or()?;
        if self.eat_keyword("if") {
            let condition = self.parse_or()?;
            if !self.eat_keyword("else") {
                return Err(EvalError::Syntax(format!(
                    "expected 'else', found {}",
                    self.describe_current()
                )));
            }
            let otherwise = self.parse_conditional()?;
            return Ok(Expr::Conditional {
                condition: Box::new(condition),
                then: Box::new(body),
                otherwise: Box::new(otherwise),
            });
        }
        Ok(body)
    }

    fn parse_or(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_and()?;
        while self.eat_keyword("or") {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_not()?;
        while self.eat_keyword("and") {
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, EvalError> {
        if self.eat_keyword("not") {
            let operand = self.parse_not()?;
            return Ok(Expr::Not(Box::new(operand)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, EvalError> {
        let left = self.parse_additive()?;
        let op = match self.peek() {
            Some(Token::Punct(p)) => CompareOp::from_symbol(p),
            _ => None,
        };
        match op {
            Some(op) => {
                self.pos += 1;
                let right = self.parse_additive()?;
                Ok(Expr::Compare(op, Box::new(left), Box::new(right)))
            }
            None => Ok(left),
        }
    }

    fn parse_additive(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_term()?;
        loop {
            let op = if self.eat_punct("+") {
                BinaryOp::Add
            } else if self.eat_punct("-") {
                BinaryOp::Sub
            } else {
                break;
            };
            let right = self.parse_term()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = if self.eat_punct("*") {
                BinaryOp::Mul
            } else if self.eat_punct("/") {
                BinaryOp::Div
            } else if self.eat_punct("%") {
                BinaryOp::Mod
            } else {
                break;
            };
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, EvalError> {
        if self.eat_punct("-") {
            let operand = self.parse_unary()?;
            return Ok(Expr::Negate(Box::new(operand)));
        }
        if self.eat_punct("+") {
            return self.parse_unary();
        }
        self.parse_power()
    }

    fn parse_power(&mut self) -> Result<Expr, EvalError> {
        let base = self.parse_postfix()?;
        if self.eat_punct("**") {
            let exponent = self.parse_unary()?;
            return Ok(Expr::Binary(BinaryOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn parse_postfix(&mut self) -> Result<Expr, EvalError> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.eat_punct(".") {
                match self.next() {
                    Some(Token::Ident(attr)) => {
                        expr = Expr::Attribute(Box::new(expr), attr);
                    }
                    _ => {
                        return Err(EvalError::Syntax(
                            "expected attribute name after '.'".to_string(),
                        ))
                    }
                }
            } else if self.at_punct("(") {
                let name = match &expr {
                    Expr::Name(name) => name.clone(),
                    _ => {
                        return Err(EvalError::Syntax(
                            "only builtin functions can be called".to_string(),
                        ))
                    }
                };
                self.pos += 1;
                let args = self.parse_sequence(")")?;
                expr = Expr::Call(name, args);
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_sequence(&mut self, close: &str) -> Result<Vec<Expr>, EvalError> {
        let mut items = Vec::new();
        if self.eat_punct(close) {
            return Ok(items);
        }
        loop {
            items.push(self.parse_conditional()?);
            if self.eat_punct(",") {
                if self.eat_punct(close) {
                    break;
                }
                continue;
            }
            self.expect_punct(close)?;
            break;
        }
        Ok(items)
    }

    fn parse_primary(&mut self) -> Result<Expr, EvalError> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Str(s)) => Ok(Expr::Text(s)),
            Some(Token::Ident(name)) => match name.as_str() {
                "None" => Ok(Expr::NoData),
                "True" => Ok(Expr::Bool(true)),
                "False" => Ok(Expr::Bool(false)),
                keyword if KEYWORDS.contains(&keyword) => Err(EvalError::Syntax(format!(
                    "unexpected keyword '{}'",
                    keyword
                ))),
                _ => Ok(Expr::Name(name)),
            },
            Some(Token::Punct("(")) => {
                let inner = self.parse_conditional()?;
                self.expect_punct(")")?;
                Ok(inner)
            }
            Some(Token::Punct("[")) => Ok(Expr::List(self.parse_sequence("]")?)),
            Some(Token::Punct(p)) => Err(EvalError::Syntax(format!("unexpected '{}'", p))),
            None => Err(EvalError::Syntax("unexpected end of expression".to_string())),
        }
    }
}

/// Parses a formula into an expression tree.
pub fn parse(source: &str) -> Result<Expr, EvalError> {
    let tokens = tokenize(source)?;
    if tokens.is_empty() {
        return Err(EvalError::Syntax("empty expression".to_string()));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_conditional()?;
    if parser.pos < parser.tokens.len() {
        return Err(EvalError::Syntax(format!(
            "unexpected {}",
            parser.describe_current()
        )));
    }
    Ok(expr)
}

/// `name.attr` pairs appearing in a formula, in textual order.
///
/// Only the token stream is inspected, so formulas still holding account
/// tokens can be scanned.
pub fn dotted_references(source: &str) -> Result<Vec<(String, String)>, EvalError> {
    let tokens = tokenize(source)?;
    let mut refs = Vec::new();
    for (i, window) in tokens.windows(3).enumerate() {
        if let [Token::Ident(base), Token::Punct("."), Token::Ident(attr)] = window {
            let preceded_by_dot = i > 0 && tokens[i - 1] == Token::Punct(".");
            if !preceded_by_dot {
                refs.push((base.clone(), attr.clone()));
            }
        }
    }
    Ok(refs)
}

impl Expr {
    /// Rewrites every `name.attr` node for which `rewrite` returns a new
    /// name into a plain name lookup.
    pub fn rewrite_attributes<F>(self, rewrite: &mut F) -> Expr
    where
        F: FnMut(&str, &str) -> Option<String>,
    {
        fn boxed<F>(e: Box<Expr>, rewrite: &mut F) -> Box<Expr>
        where
            F: FnMut(&str, &str) -> Option<String>,
        {
            Box::new(e.rewrite_attributes(rewrite))
        }

        match self {
            Expr::Attribute(base, attr) => {
                if let Expr::Name(name) = base.as_ref() {
                    if let Some(replacement) = rewrite(name, &attr) {
                        return Expr::Name(replacement);
                    }
                }
                Expr::Attribute(boxed(base, rewrite), attr)
            }
            Expr::Call(name, args) => Expr::Call(
                name,
                args.into_iter().map(|a| a.rewrite_attributes(rewrite)).collect(),
            ),
            Expr::List(items) => Expr::List(
                items.into_iter().map(|a| a.rewrite_attributes(rewrite)).collect(),
            ),
            Expr::Negate(inner) => Expr::Negate(boxed(inner, rewrite)),
            Expr::Not(inner) => Expr::Not(boxed(inner, rewrite)),
            Expr::Binary(op, l, r) => {
                let l = boxed(l, rewrite);
                Expr::Binary(op, l, boxed(r, rewrite))
            }
            Expr::Compare(op, l, r) => {
                let l = boxed(l, rewrite);
                Expr::Compare(op, l, boxed(r, rewrite))
            }
            Expr::And(l, r) => {
                let l = boxed(l, rewrite);
                Expr::And(l, boxed(r, rewrite))
            }
            Expr::Or(l, r) => {
                let l = boxed(l, rewrite);
                Expr::Or(l, boxed(r, rewrite))
            }
            Expr::Conditional {
                condition,
                then,
                otherwise,
            } => {
                let condition = boxed(condition, rewrite);
                let then = boxed(then, rewrite);
                Expr::Conditional {
                    condition,
                    then,
                    otherwise: boxed(otherwise, rewrite),
                }
            }
            leaf => leaf,
        }
    }

    pub fn evaluate(&self, scope: &Scope) -> Result<Value, EvalError> {
        match self {
            Expr::Number(n) => Ok(Value::Number(*n)),
            Expr::Text(s) => Ok(Value::Text(s.clone())),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::NoData => Ok(Value::None),
            Expr::Name(name) => scope
                .get(name)
                .cloned()
                .ok_or_else(|| EvalError::UndefinedName(name.clone())),
            Expr::Attribute(base, attr) => attribute(base.evaluate(scope)?, attr),
            Expr::Call(name, args) => {
                let builtin = Builtin::from_name(name)
                    .ok_or_else(|| EvalError::UnknownFunction(name.clone()))?;
                let values = args
                    .iter()
                    .map(|a| a.evaluate(scope))
                    .collect::<Result<Vec<_>, _>>()?;
                builtin.call(values)
            }
            Expr::List(items) => Ok(Value::List(
                items
                    .iter()
                    .map(|i| i.evaluate(scope))
                    .collect::<Result<Vec<_>, _>>()?,
            )),
            Expr::Negate(inner) => negate(&inner.evaluate(scope)?),
            Expr::Not(inner) => Ok(Value::Bool(!inner.evaluate(scope)?.truthy())),
            Expr::Binary(op, l, r) => arithmetic(*op, &l.evaluate(scope)?, &r.evaluate(scope)?),
            Expr::Compare(op, l, r) => compare(*op, &l.evaluate(scope)?, &r.evaluate(scope)?),
            Expr::And(l, r) => {
                let left = l.evaluate(scope)?;
                if left.truthy() {
                    r.evaluate(scope)
                } else {
                    Ok(left)
                }
            }
            Expr::Or(l, r) => {
                let left = l.evaluate(scope)?;
                if left.truthy() {
                    Ok(left)
                } else {
                    r.evaluate(scope)
                }
            }
            Expr::Conditional {
                condition,
                then,
                otherwise,
            } => {
                if condition.evaluate(scope)?.truthy() {
                    then.evaluate(scope)
                } else {
                    otherwise.evaluate(scope)
                }
            }
        }
    }
}

fn attribute(base: Value, attr: &str) -> Result<Value, EvalError> {
    match base {
        Value::None => Ok(Value::None),
        Value::Record(mut fields) => fields
            .remove(attr)
            .ok_or_else(|| EvalError::UnknownAttribute(attr.to_string())),
        Value::List(items) => items
            .into_iter()
            .map(|item| attribute(item, attr))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List),
        _ => Err(EvalError::UnknownAttribute(attr.to_string())),
    }
}

/// Parses and evaluates `source` in one step.
pub fn eval(source: &str, scope: &Scope) -> Result<Value, EvalError> {
    parse(source)?.evaluate(scope)
}
