//! Record-selector filters understood by the ledger and record store.
//!
//! A [`Filter`] is a conjunction of conditions. Each condition is a
//! `(field, operator, value)` triple, or an `any` group holding alternative
//! filters (used by drill-down filters that span several account tokens).

use chrono::{NaiveDate, NaiveDateTime};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Number(f64),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Text(String),
    List(Vec<FieldValue>),
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Ordering between two scalar values of compatible kinds.
    /// Dates compare with datetimes at midnight.
    pub fn compare(&self, other: &FieldValue) -> Option<Ordering> {
        match (self, other) {
            (FieldValue::Number(a), FieldValue::Number(b)) => a.partial_cmp(b),
            (FieldValue::Text(a), FieldValue::Text(b)) => Some(a.cmp(b)),
            (FieldValue::Bool(a), FieldValue::Bool(b)) => Some(a.cmp(b)),
            (FieldValue::Date(a), FieldValue::Date(b)) => Some(a.cmp(b)),
            (FieldValue::DateTime(a), FieldValue::DateTime(b)) => Some(a.cmp(b)),
            (FieldValue::Date(a), FieldValue::DateTime(b)) => {
                a.and_hms_opt(0, 0, 0).map(|midnight| midnight.cmp(b))
            }
            (FieldValue::DateTime(a), FieldValue::Date(b)) => {
                b.and_hms_opt(0, 0, 0).map(|midnight| a.cmp(&midnight))
            }
            (FieldValue::Null, FieldValue::Null) => Some(Ordering::Equal),
            _ => None,
        }
    }

    fn loosely_equals(&self, other: &FieldValue) -> bool {
        match (self, other) {
            (FieldValue::List(a), FieldValue::List(b)) => a == b,
            _ => self.compare(other) == Some(Ordering::Equal),
        }
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Number(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Number(value as f64)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<NaiveDate> for FieldValue {
    fn from(value: NaiveDate) -> Self {
        FieldValue::Date(value)
    }
}

impl From<NaiveDateTime> for FieldValue {
    fn from(value: NaiveDateTime) -> Self {
        FieldValue::DateTime(value)
    }
}

impl<T: Into<FieldValue>> From<Vec<T>> for FieldValue {
    fn from(values: Vec<T>) -> Self {
        FieldValue::List(values.into_iter().map(Into::into).collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum Operator {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not in")]
    NotIn,
}

impl Operator {
    pub fn symbol(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "!=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::In => "in",
            Operator::NotIn => "not in",
        }
    }

    fn apply(&self, actual: &FieldValue, expected: &FieldValue) -> bool {
        match self {
            Operator::Eq => actual.loosely_equals(expected),
            Operator::Ne => !actual.loosely_equals(expected),
            Operator::Lt => actual.compare(expected) == Some(Ordering::Less),
            Operator::Le => matches!(
                actual.compare(expected),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Operator::Gt => actual.compare(expected) == Some(Ordering::Greater),
            Operator::Ge => matches!(
                actual.compare(expected),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Operator::In => match expected {
                FieldValue::List(items) => items.iter().any(|item| actual.loosely_equals(item)),
                other => actual.loosely_equals(other),
            },
            Operator::NotIn => !Operator::In.apply(actual, expected),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum Condition {
    Field {
        field: String,
        op: Operator,
        value: FieldValue,
    },
    Any {
        any: Vec<Filter>,
    },
}

impl Condition {
    pub fn field(field: impl Into<String>, op: Operator, value: impl Into<FieldValue>) -> Self {
        Condition::Field {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn matches<R: FieldLookup + ?Sized>(&self, record: &R) -> bool {
        match self {
            Condition::Field { field, op, value } => {
                let actual = record.field(field).unwrap_or(FieldValue::Null);
                op.apply(&actual, value)
            }
            Condition::Any { any } => any.iter().any(|filter| filter.matches(record)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct Filter {
    pub conditions: Vec<Condition>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn and(
        mut self,
        field: impl Into<String>,
        op: Operator,
        value: impl Into<FieldValue>,
    ) -> Self {
        self.conditions.push(Condition::field(field, op, value));
        self
    }

    pub fn push(&mut self, condition: Condition) {
        self.conditions.push(condition);
    }

    pub fn extend(&mut self, other: &Filter) {
        self.conditions.extend(other.conditions.iter().cloned());
    }

    /// A filter matching records selected by at least one of `alternatives`.
    pub fn any_of(alternatives: Vec<Filter>) -> Self {
        Self {
            conditions: vec![Condition::Any { any: alternatives }],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn matches<R: FieldLookup + ?Sized>(&self, record: &R) -> bool {
        self.conditions.iter().all(|c| c.matches(record))
    }
}

impl From<Vec<Condition>> for Filter {
    fn from(conditions: Vec<Condition>) -> Self {
        Self { conditions }
    }
}

/// Access to named fields of a record, for filter evaluation.
pub trait FieldLookup {
    fn field(&self, name: &str) -> Option<FieldValue>;
}

pub type Record = BTreeMap<String, FieldValue>;

impl FieldLookup for Record {
    fn field(&self, name: &str) -> Option<FieldValue> {
        self.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invoice(amount: f64, state: &str, date: NaiveDate) -> Record {
        let mut record = Record::new();
        record.insert("amount".to_string(), amount.into());
        record.insert("state".to_string(), state.into());
        record.insert("date".to_string(), date.into());
        record
    }

    #[test]
    fn test_conjunction_of_conditions() {
        let d = NaiveDate::from_ymd_opt(2024, 3, 14).unwrap();
        let record = invoice(120.0, "posted", d);

        let filter = Filter::new()
            .and("state", Operator::Eq, "posted")
            .and("date", Operator::Ge, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap())
            .and("date", Operator::Le, NaiveDate::from_ymd_opt(2024, 3, 31).unwrap());
        assert!(filter.matches(&record));

        let filter = filter.and("amount", Operator::Gt, 200.0);
        assert!(!filter.matches(&record));
    }

    #[test]
    fn test_in_and_any() {
        let d = NaiveDate::from_ymd_opt(2024, 3, 14).unwrap();
        let record = invoice(10.0, "draft", d);

        let filter = Filter::new().and("state", Operator::In, vec!["draft", "posted"]);
        assert!(filter.matches(&record));

        let filter = Filter::new().and("state", Operator::NotIn, vec!["draft"]);
        assert!(!filter.matches(&record));

        let any = Filter::any_of(vec![
            Filter::new().and("amount", Operator::Gt, 100.0),
            Filter::new().and("state", Operator::Eq, "draft"),
        ]);
        assert!(any.matches(&record));
    }

    #[test]
    fn test_missing_field_is_null() {
        let record = Record::new();
        assert!(Filter::new().and("partner", Operator::Eq, FieldValue::Null).matches(&record));
        assert!(!Filter::new().and("amount", Operator::Gt, 0.0).matches(&record));
    }

    #[test]
    fn test_date_against_datetime() {
        let mut record = Record::new();
        let stamp = NaiveDate::from_ymd_opt(2024, 3, 14)
            .unwrap()
            .and_hms_opt(23, 30, 0)
            .unwrap();
        record.insert("create_date".to_string(), stamp.into());

        let filter = Filter::new().and(
            "create_date",
            Operator::Lt,
            NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
        );
        assert!(filter.matches(&record));
    }

    #[test]
    fn test_filter_json_shape() {
        let filter = Filter::new().and("state", Operator::Eq, "posted");
        let json = serde_json::to_string(&filter).unwrap();
        assert_eq!(json, r#"[{"field":"state","op":"=","value":"posted"}]"#);

        let parsed: Filter = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, filter);
    }
}
