//! Data-source interfaces consumed by the engine.
//!
//! The engine never stores journal entries or business records itself: the
//! host provides them through [`Ledger`] and [`RecordStore`], using
//! [`Filter`]s as the selection language.

use crate::chart_of_accounts::ChartOfAccounts;
use crate::error::Result;
use crate::filter::{FieldLookup, FieldValue, Filter, Record};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Field names a ledger must understand in move-line filters.
pub mod fields {
    pub const ACCOUNT: &str = "account";
    pub const DATE: &str = "date";
    pub const PERIOD: &str = "period";
    pub const MOVE_STATE: &str = "move_state";
    pub const DEBIT: &str = "debit";
    pub const CREDIT: &str = "credit";
}

pub const POSTED: &str = "posted";

/// Debit and credit totals of one account over the selected move lines.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountTotals {
    pub account: String,
    pub debit: f64,
    pub credit: f64,
}

/// An accounting period of the ledger, e.g. a month of a fiscal year.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FiscalPeriod {
    pub name: String,
    pub date_start: NaiveDate,
    pub date_stop: NaiveDate,

    /// Opening/closing periods; never used to resolve relative periods.
    #[serde(default)]
    pub special: bool,
}

/// One journal item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveLine {
    pub account: String,
    pub date: NaiveDate,
    pub debit: f64,
    pub credit: f64,
    pub move_state: String,

    #[serde(default)]
    pub period: Option<String>,

    /// Host-specific fields (analytic account, partner, ...) usable in filters.
    #[serde(default)]
    pub extra: Record,
}

impl FieldLookup for MoveLine {
    fn field(&self, name: &str) -> Option<FieldValue> {
        match name {
            fields::ACCOUNT => Some(FieldValue::Text(self.account.clone())),
            fields::DATE => Some(FieldValue::Date(self.date)),
            fields::DEBIT => Some(FieldValue::Number(self.debit)),
            fields::CREDIT => Some(FieldValue::Number(self.credit)),
            fields::MOVE_STATE => Some(FieldValue::Text(self.move_state.clone())),
            fields::PERIOD => Some(
                self.period
                    .clone()
                    .map(FieldValue::Text)
                    .unwrap_or(FieldValue::Null),
            ),
            other => self.extra.get(other).cloned(),
        }
    }
}

pub trait Ledger {
    /// The chart of accounts below `root` (root included).
    fn accounts_under(&self, root: &str) -> Result<ChartOfAccounts>;

    /// Debit/credit totals grouped per account, for the lines matching
    /// `filter`. Accounts without matching lines are omitted.
    fn sum_move_lines(&self, filter: &Filter) -> Result<Vec<AccountTotals>>;

    /// Every period of an accounting entity, in any order.
    fn fiscal_periods(&self, company: &str) -> Result<Vec<FiscalPeriod>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    Date,
    DateTime,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInfo {
    pub kind: FieldKind,

    /// Computed fields can't be aggregated by the store.
    pub stored: bool,
}

/// Result of a grouped aggregation over all matching records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupTotals {
    pub count: usize,

    /// Sum per field; fields the store can't sum are absent.
    pub sums: BTreeMap<String, FieldValue>,
}

pub trait RecordStore {
    /// Fails with `ReportError::UnknownField` when the model has no such field.
    fn field_info(&self, model: &str, field: &str) -> Result<FieldInfo>;

    fn search_read(&self, model: &str, filter: &Filter, fields: &[String]) -> Result<Vec<Record>>;

    fn read_group(&self, model: &str, filter: &Filter, fields: &[String]) -> Result<GroupTotals>;
}
