//! Values flowing through KPI formulas.
//!
//! `Value::None` is the "no data" sentinel. It is distinct from zero: it
//! propagates through `+ - * % **`, makes any division by it fail, and is
//! skipped by the aggregate builtins.

use crate::expr::{BinaryOp, CompareOp, EvalError};
use crate::filter::FieldValue;
use crate::schema::AggregateKind;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    #[default]
    None,
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<Value>),
    Record(BTreeMap<String, Value>),
}

impl Value {
    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0,
            Value::Text(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Record(fields) => !fields.is_empty(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::Text(_) => "text",
            Value::List(_) => "list",
            Value::Record(_) => "record",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::Text(s) => write!(f, "{}", s),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Record(fields) => {
                write!(f, "{{")?;
                for (i, (name, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", name, value)?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<Option<f64>> for Value {
    fn from(value: Option<f64>) -> Self {
        value.map(Value::Number).unwrap_or(Value::None)
    }
}

impl From<&FieldValue> for Value {
    fn from(value: &FieldValue) -> Self {
        match value {
            FieldValue::Null => Value::None,
            FieldValue::Bool(b) => Value::Bool(*b),
            FieldValue::Number(n) => Value::Number(*n),
            FieldValue::Text(s) => Value::Text(s.clone()),
            FieldValue::Date(d) => Value::Text(d.format("%Y-%m-%d").to_string()),
            FieldValue::DateTime(dt) => Value::Text(dt.format("%Y-%m-%d %H:%M:%S").to_string()),
            FieldValue::List(items) => Value::List(items.iter().map(Value::from).collect()),
        }
    }
}

enum Operand {
    Absent,
    Num(f64),
}

fn operand(value: &Value, op: BinaryOp) -> Result<Operand, EvalError> {
    match value {
        Value::None => Ok(Operand::Absent),
        Value::Number(n) => Ok(Operand::Num(*n)),
        Value::Bool(b) => Ok(Operand::Num(if *b { 1.0 } else { 0.0 })),
        Value::Text(_) => Err(EvalError::TypeMismatch(format!(
            "unsupported text operand for '{}'",
            op.symbol()
        ))),
        Value::List(_) | Value::Record(_) => Err(EvalError::InvalidValue(format!(
            "{} can't be used as an operand of '{}'",
            value.kind(),
            op.symbol()
        ))),
    }
}

fn python_mod(a: f64, b: f64) -> f64 {
    let r = a % b;
    if r != 0.0 && (r < 0.0) != (b < 0.0) {
        r + b
    } else {
        r
    }
}

pub fn arithmetic(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, EvalError> {
    if let (BinaryOp::Add, Value::Text(a), Value::Text(b)) = (op, lhs, rhs) {
        return Ok(Value::Text(format!("{}{}", a, b)));
    }

    let a = operand(lhs, op)?;
    let b = operand(rhs, op)?;

    match op {
        BinaryOp::Div | BinaryOp::Mod => match (a, b) {
            (_, Operand::Absent) => Err(EvalError::DivisionByZero),
            (_, Operand::Num(d)) if d == 0.0 => Err(EvalError::DivisionByZero),
            (Operand::Absent, _) => Ok(Value::None),
            (Operand::Num(n), Operand::Num(d)) => Ok(Value::Number(if op == BinaryOp::Div {
                n / d
            } else {
                python_mod(n, d)
            })),
        },
        _ => match (a, b) {
            (Operand::Num(x), Operand::Num(y)) => Ok(Value::Number(match op {
                BinaryOp::Add => x + y,
                BinaryOp::Sub => x - y,
                BinaryOp::Mul => x * y,
                _ => x.powf(y),
            })),
            _ => Ok(Value::None),
        },
    }
}

pub fn negate(value: &Value) -> Result<Value, EvalError> {
    match value {
        Value::None => Ok(Value::None),
        other => match other.as_f64() {
            Some(n) => Ok(Value::Number(-n)),
            None => Err(EvalError::TypeMismatch(format!(
                "bad operand type for unary '-': {}",
                other.kind()
            ))),
        },
    }
}

/// Numeric view used by comparisons; "no data" compares as zero.
fn comparable_number(value: &Value) -> Option<f64> {
    match value {
        Value::None => Some(0.0),
        other => other.as_f64(),
    }
}

fn equals(lhs: &Value, rhs: &Value) -> bool {
    match (comparable_number(lhs), comparable_number(rhs)) {
        (Some(a), Some(b)) => a == b,
        _ => lhs == rhs,
    }
}

pub fn compare(op: CompareOp, lhs: &Value, rhs: &Value) -> Result<Value, EvalError> {
    let result = match op {
        CompareOp::Eq => equals(lhs, rhs),
        CompareOp::Ne => !equals(lhs, rhs),
        _ => {
            let ordering = match (lhs, rhs) {
                (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
                _ => match (comparable_number(lhs), comparable_number(rhs)) {
                    (Some(a), Some(b)) => a.partial_cmp(&b),
                    _ => {
                        return Err(EvalError::TypeMismatch(format!(
                            "'{}' not supported between {} and {}",
                            op.symbol(),
                            lhs.kind(),
                            rhs.kind()
                        )))
                    }
                },
            };
            match ordering {
                Some(Ordering::Less) => matches!(op, CompareOp::Lt | CompareOp::Le),
                Some(Ordering::Equal) => matches!(op, CompareOp::Le | CompareOp::Ge),
                Some(Ordering::Greater) => matches!(op, CompareOp::Gt | CompareOp::Ge),
                None => false,
            }
        }
    };
    Ok(Value::Bool(result))
}

/// No-data-aware aggregation: absent inputs are skipped, and the result is
/// absent when nothing is left to aggregate.
pub fn aggregate<'a, I>(kind: AggregateKind, values: I) -> Result<Value, EvalError>
where
    I: IntoIterator<Item = &'a Value>,
{
    let mut numbers = Vec::new();
    for value in values {
        match value {
            Value::None => continue,
            Value::Text(_) => {
                return Err(EvalError::TypeMismatch(format!(
                    "can't compute {} of text values",
                    kind.label()
                )))
            }
            Value::List(_) | Value::Record(_) => {
                return Err(EvalError::InvalidValue(format!(
                    "can't compute {} of {} values",
                    kind.label(),
                    value.kind()
                )))
            }
            other => {
                if let Some(n) = other.as_f64() {
                    numbers.push(n);
                }
            }
        }
    }

    if numbers.is_empty() {
        return Ok(Value::None);
    }

    let result = match kind {
        AggregateKind::Sum => numbers.iter().sum(),
        AggregateKind::Avg => numbers.iter().sum::<f64>() / numbers.len() as f64,
        AggregateKind::Min => numbers.iter().copied().fold(f64::INFINITY, f64::min),
        AggregateKind::Max => numbers.iter().copied().fold(f64::NEG_INFINITY, f64::max),
    };
    Ok(Value::Number(result))
}
