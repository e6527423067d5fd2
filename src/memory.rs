//! In-memory [`Ledger`] and [`RecordStore`] implementations.

use crate::chart_of_accounts::{AccountEntry, ChartOfAccounts};
use crate::error::{ReportError, Result};
use crate::filter::{FieldValue, Filter, Record};
use crate::ledger::{
    AccountTotals, FieldInfo, FieldKind, FiscalPeriod, GroupTotals, Ledger, MoveLine, RecordStore,
    POSTED,
};
use crate::utils::last_day_of_month;
use chrono::NaiveDate;
use std::cell::Cell;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct MemoryLedger {
    accounts: Vec<AccountEntry>,
    lines: Vec<MoveLine>,
    periods: BTreeMap<String, Vec<FiscalPeriod>>,
    aggregations: Cell<usize>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_account(&mut self, code: &str, name: &str, parent_code: Option<&str>) -> &mut Self {
        self.accounts.push(AccountEntry::new(code, name, parent_code));
        self
    }

    pub fn add_line(&mut self, line: MoveLine) -> &mut Self {
        self.lines.push(line);
        self
    }

    /// Adds a posted line. Positive `amount` is a debit, negative a credit.
    pub fn post(&mut self, account: &str, date: NaiveDate, amount: f64) -> &mut Self {
        self.add_entry(account, date, amount, POSTED)
    }

    pub fn add_draft(&mut self, account: &str, date: NaiveDate, amount: f64) -> &mut Self {
        self.add_entry(account, date, amount, "draft")
    }

    fn add_entry(&mut self, account: &str, date: NaiveDate, amount: f64, state: &str) -> &mut Self {
        let period = self
            .periods
            .values()
            .flatten()
            .find(|p| !p.special && p.date_start <= date && date <= p.date_stop)
            .map(|p| p.name.clone());

        self.lines.push(MoveLine {
            account: account.to_string(),
            date,
            debit: amount.max(0.0),
            credit: (-amount).max(0.0),
            move_state: state.to_string(),
            period,
            extra: Record::new(),
        });
        self
    }

    pub fn add_period(&mut self, company: &str, period: FiscalPeriod) -> &mut Self {
        self.periods.entry(company.to_string()).or_default().push(period);
        self
    }

    /// Adds the twelve calendar months of `year`, named `MM/YYYY`.
    pub fn add_monthly_periods(&mut self, company: &str, year: i32) -> Result<&mut Self> {
        for month in 1..=12 {
            let date_start = NaiveDate::from_ymd_opt(year, month, 1)
                .ok_or_else(|| ReportError::DateError(format!("invalid year {}", year)))?;
            let date_stop = last_day_of_month(year, month)?;
            self.add_period(
                company,
                FiscalPeriod {
                    name: format!("{:02}/{}", month, year),
                    date_start,
                    date_stop,
                    special: false,
                },
            );
        }
        Ok(self)
    }

    /// Number of `sum_move_lines` calls served so far.
    pub fn aggregation_count(&self) -> usize {
        self.aggregations.get()
    }
}

impl Ledger for MemoryLedger {
    fn accounts_under(&self, root: &str) -> Result<ChartOfAccounts> {
        let chart = ChartOfAccounts::from_entries(root, &self.accounts);
        if chart.is_empty() {
            return Err(ReportError::Backend(format!("no account with code '{}'", root)));
        }
        Ok(chart)
    }

    fn sum_move_lines(&self, filter: &Filter) -> Result<Vec<AccountTotals>> {
        self.aggregations.set(self.aggregations.get() + 1);

        let mut totals: BTreeMap<&str, AccountTotals> = BTreeMap::new();
        for line in self.lines.iter().filter(|l| filter.matches(*l)) {
            let entry = totals.entry(line.account.as_str()).or_insert_with(|| AccountTotals {
                account: line.account.clone(),
                ..AccountTotals::default()
            });
            entry.debit += line.debit;
            entry.credit += line.credit;
        }
        Ok(totals.into_values().collect())
    }

    fn fiscal_periods(&self, company: &str) -> Result<Vec<FiscalPeriod>> {
        Ok(self.periods.get(company).cloned().unwrap_or_default())
    }
}

#[derive(Debug, Clone, Default)]
struct MemoryModel {
    fields: BTreeMap<String, FieldInfo>,
    records: Vec<Record>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    models: BTreeMap<String, MemoryModel>,
    grouped_reads: Cell<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_field(
        &mut self,
        model: &str,
        field: &str,
        kind: FieldKind,
        stored: bool,
    ) -> &mut Self {
        self.models
            .entry(model.to_string())
            .or_default()
            .fields
            .insert(field.to_string(), FieldInfo { kind, stored });
        self
    }

    pub fn add_record(&mut self, model: &str, record: Record) -> &mut Self {
        self.models.entry(model.to_string()).or_default().records.push(record);
        self
    }

    /// Number of `read_group` calls served so far.
    pub fn grouped_read_count(&self) -> usize {
        self.grouped_reads.get()
    }

    fn model(&self, model: &str) -> Result<&MemoryModel> {
        self.models
            .get(model)
            .ok_or_else(|| ReportError::Backend(format!("unknown model '{}'", model)))
    }

    fn matching<'a>(
        &'a self,
        model: &str,
        filter: &'a Filter,
    ) -> Result<impl Iterator<Item = &'a Record> + 'a> {
        Ok(self
            .model(model)?
            .records
            .iter()
            .filter(move |r| filter.matches(*r)))
    }
}

fn project(record: &Record, fields: &[String]) -> Record {
    fields
        .iter()
        .map(|f| (f.clone(), record.get(f).cloned().unwrap_or(FieldValue::Null)))
        .collect()
}

impl RecordStore for MemoryStore {
    fn field_info(&self, model: &str, field: &str) -> Result<FieldInfo> {
        self.model(model)?
            .fields
            .get(field)
            .copied()
            .ok_or_else(|| ReportError::UnknownField {
                model: model.to_string(),
                field: field.to_string(),
            })
    }

    fn search_read(&self, model: &str, filter: &Filter, fields: &[String]) -> Result<Vec<Record>> {
        Ok(self.matching(model, filter)?.map(|r| project(r, fields)).collect())
    }

    fn read_group(&self, model: &str, filter: &Filter, fields: &[String]) -> Result<GroupTotals> {
        self.grouped_reads.set(self.grouped_reads.get() + 1);

        let records: Vec<&Record> = self.matching(model, filter)?.collect();
        let mut sums = BTreeMap::new();
        for field in fields {
            let mut total: Option<f64> = None;
            let mut summable = true;
            for record in &records {
                match record.get(field) {
                    None | Some(FieldValue::Null) => {}
                    Some(FieldValue::Number(n)) => *total.get_or_insert(0.0) += n,
                    Some(_) => summable = false,
                }
            }
            if summable {
                sums.insert(field.clone(), total.map_or(FieldValue::Null, FieldValue::Number));
            }
        }

        Ok(GroupTotals {
            count: records.len(),
            sums,
        })
    }
}
