use crate::error::{ReportError, Result};
use crate::expr::Scope;
use crate::filter::{Condition, Filter, Operator, Record};
use crate::ledger::{FieldKind, RecordStore};
use crate::period::ResolvedPeriod;
use crate::schema::{AggregateKind, QueryDefinition};
use crate::utils::utc_midnight;
use crate::value::{aggregate, Value};
use chrono::FixedOffset;
use log::{debug, error};
use std::collections::BTreeMap;

fn record_value(record: &Record) -> Value {
    Value::Record(
        record
            .iter()
            .map(|(name, value)| (name.clone(), Value::from(value)))
            .collect(),
    )
}

/// Runs report queries against the record store for one period.
pub struct QueryFetcher<'a> {
    store: &'a dyn RecordStore,
    timezone: FixedOffset,
}

impl<'a> QueryFetcher<'a> {
    pub fn new(store: &'a dyn RecordStore, timezone: FixedOffset) -> Self {
        Self { store, timezone }
    }

    /// Declared filter, then the extra filter, then the date bounds. Date
    /// fields are bounded inclusively, datetime fields from local midnight
    /// of `date_from` to local midnight after `date_to`.
    pub fn build_filter(
        &self,
        query: &QueryDefinition,
        period: &ResolvedPeriod,
        extra_filter: Option<&Filter>,
    ) -> Result<Filter> {
        let mut filter = query.filter.clone();
        if let Some(extra) = extra_filter {
            filter.extend(extra);
        }

        let info = self.store.field_info(&query.model, &query.date_field)?;
        let field = query.date_field.as_str();
        if info.kind == FieldKind::Date {
            filter.push(Condition::field(field, Operator::Ge, period.date_from));
            filter.push(Condition::field(field, Operator::Le, period.date_to));
        } else {
            let from = utc_midnight(period.date_from, &self.timezone, 0)?;
            let to = utc_midnight(period.date_to, &self.timezone, 1)?;
            filter.push(Condition::field(field, Operator::Ge, from));
            filter.push(Condition::field(field, Operator::Lt, to));
        }
        Ok(filter)
    }

    pub fn fetch(
        &self,
        query: &QueryDefinition,
        period: &ResolvedPeriod,
        extra_filter: Option<&Filter>,
    ) -> Result<Value> {
        let filter = self.build_filter(query, period, extra_filter)?;

        let Some(kind) = query.aggregate else {
            let records = self.store.search_read(&query.model, &filter, &query.fields)?;
            debug!("Query '{}' returned {} record(s)", query.name, records.len());
            return Ok(Value::List(records.iter().map(record_value).collect()));
        };

        let mut all_stored = true;
        for field in &query.fields {
            all_stored &= self.store.field_info(&query.model, field)?.stored;
        }

        let mut result = BTreeMap::new();
        if kind == AggregateKind::Sum && all_stored {
            let totals = self.store.read_group(&query.model, &filter, &query.fields)?;
            result.insert("count".to_string(), Value::Number(totals.count as f64));
            for field in &query.fields {
                let value = match totals.sums.get(field) {
                    Some(sum) => Value::from(sum),
                    None => {
                        error!(
                            "Field {} not found in grouped totals of {}; not summable?",
                            field, query.model
                        );
                        Value::None
                    }
                };
                result.insert(field.clone(), value);
            }
        } else {
            let records = self.store.search_read(&query.model, &filter, &query.fields)?;
            result.insert("count".to_string(), Value::Number(records.len() as f64));
            for field in &query.fields {
                let values: Vec<Value> = records
                    .iter()
                    .map(|r| r.get(field).map(Value::from).unwrap_or_default())
                    .collect();
                let value = aggregate(kind, &values).map_err(|e| {
                    ReportError::definition(
                        format!("query '{}'", query.name),
                        format!("can't compute the {} of '{}': {}", kind.label(), field, e),
                    )
                })?;
                result.insert(field.clone(), value);
            }
        }
        Ok(Value::Record(result))
    }

    /// Binds the result of every query under its name.
    pub fn fetch_into(
        &self,
        queries: &[QueryDefinition],
        period: &ResolvedPeriod,
        extra_filters: &BTreeMap<String, Filter>,
        scope: &mut Scope,
    ) -> Result<()> {
        for query in queries {
            let value = self.fetch(query, period, extra_filters.get(&query.name))?;
            scope.insert(query.name.clone(), value);
        }
        Ok(())
    }
}
