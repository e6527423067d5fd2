use crate::error::Result;
use crate::ledger::{FiscalPeriod, Ledger};
use crate::schema::{InstancePeriod, PeriodType};
use crate::utils::{shift_days, week_start};
use chrono::NaiveDate;
use log::debug;
use serde::{Deserialize, Serialize};

/// Ledger periods covered by a fiscal-period column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FiscalSpan {
    pub period_from: String,
    pub period_to: String,
    pub periods: Vec<String>,
}

/// Concrete bounds of a valid period, both dates inclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedPeriod {
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    pub fiscal: Option<FiscalSpan>,
}

/// Resolves instance periods relative to a pivot date.
///
/// Fiscal periods are fetched from the ledger on first use only.
pub struct PeriodResolver<'a> {
    ledger: &'a dyn Ledger,
    company: &'a str,
    pivot: NaiveDate,
    fiscal_periods: Option<Vec<FiscalPeriod>>,
}

impl<'a> PeriodResolver<'a> {
    pub fn new(ledger: &'a dyn Ledger, company: &'a str, pivot: NaiveDate) -> Self {
        Self {
            ledger,
            company,
            pivot,
            fiscal_periods: None,
        }
    }

    pub fn pivot(&self) -> NaiveDate {
        self.pivot
    }

    /// Bounds of `period`, or `None` when it falls outside the ledger's
    /// fiscal periods.
    pub fn resolve(&mut self, period: &InstancePeriod) -> Result<Option<ResolvedPeriod>> {
        let offset = i64::from(period.offset);
        let duration = i64::from(period.duration);

        let resolved = match period.period_type {
            PeriodType::Day => {
                let date_from = shift_days(self.pivot, offset)?;
                Some(ResolvedPeriod {
                    date_from,
                    date_to: shift_days(date_from, duration - 1)?,
                    fiscal: None,
                })
            }
            PeriodType::Week => {
                let date_from = shift_days(week_start(self.pivot), 7 * offset)?;
                Some(ResolvedPeriod {
                    date_from,
                    date_to: shift_days(date_from, 7 * duration - 1)?,
                    fiscal: None,
                })
            }
            PeriodType::FiscalPeriod => self.resolve_fiscal(offset, duration)?,
        };

        if resolved.is_none() {
            debug!("Period '{}' is not valid for pivot date {}", period.name, self.pivot);
        }
        Ok(resolved)
    }

    fn resolve_fiscal(&mut self, offset: i64, duration: i64) -> Result<Option<ResolvedPeriod>> {
        if self.fiscal_periods.is_none() {
            let mut periods: Vec<FiscalPeriod> = self
                .ledger
                .fiscal_periods(self.company)?
                .into_iter()
                .filter(|p| !p.special)
                .collect();
            periods.sort_by_key(|p| p.date_start);
            self.fiscal_periods = Some(periods);
        }
        let periods = self.fiscal_periods.as_deref().unwrap_or(&[]);

        let pivot = self.pivot;
        let Some(current) = periods
            .iter()
            .position(|p| p.date_start <= pivot && pivot <= p.date_stop)
        else {
            return Ok(None);
        };

        let first = current as i64 + offset;
        let last = first + duration - 1;
        if first < 0 || last >= periods.len() as i64 {
            return Ok(None);
        }

        let span = &periods[first as usize..=last as usize];
        let (Some(start), Some(stop)) = (span.first(), span.last()) else {
            return Ok(None);
        };
        Ok(Some(ResolvedPeriod {
            date_from: start.date_start,
            date_to: stop.date_stop,
            fiscal: Some(FiscalSpan {
                period_from: start.name.clone(),
                period_to: stop.name.clone(),
                periods: span.iter().map(|p| p.name.clone()).collect(),
            }),
        }))
    }
}
