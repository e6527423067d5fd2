use crate::error::{ReportError, Result};
use chrono::format::{Item, StrftimeItems};
use chrono::{Datelike, Days, Duration, FixedOffset, NaiveDate, NaiveDateTime, TimeZone};
use std::fmt::Write;

pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Derives an identifier from free text: every non-word character becomes
/// `_`, a leading digit gets a `_` prefix, and the result is lowercased.
///
/// # Examples
/// - "Gross Margin %" -> "gross_margin__"
/// - "2024 Budget" -> "_2024_budget"
pub fn to_identifier(text: &str) -> String {
    let mut identifier = String::with_capacity(text.len() + 1);
    if text.starts_with(|c: char| c.is_ascii_digit()) {
        identifier.push('_');
    }
    for c in text.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            identifier.push(c.to_ascii_lowercase());
        } else {
            identifier.push('_');
        }
    }
    identifier
}

pub fn shift_days(date: NaiveDate, days: i64) -> Result<NaiveDate> {
    date.checked_add_signed(Duration::days(days)).ok_or_else(|| {
        ReportError::DateError(format!("{} shifted by {} days is out of range", date, days))
    })
}

/// Monday of the week containing `date`.
pub fn week_start(date: NaiveDate) -> NaiveDate {
    let from_monday = date.weekday().num_days_from_monday() as u64;
    date.checked_sub_days(Days::new(from_monday)).unwrap_or(date)
}

pub fn last_day_of_month(year: i32, month: u32) -> Result<NaiveDate> {
    let next_month = if month == 12 { 1 } else { month + 1 };
    let next_year = if month == 12 { year + 1 } else { year };

    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.checked_sub_days(Days::new(1)))
        .ok_or_else(|| ReportError::DateError(format!("invalid month {}-{}", year, month)))
}

/// UTC timestamp of local midnight at the start of `date + add_days`.
pub fn utc_midnight(
    date: NaiveDate,
    timezone: &FixedOffset,
    add_days: i64,
) -> Result<NaiveDateTime> {
    let day = shift_days(date, add_days)?;
    let local = day
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| ReportError::DateError(format!("no midnight on {}", day)))?;
    timezone
        .from_local_datetime(&local)
        .single()
        .map(|dt| dt.naive_utc())
        .ok_or_else(|| ReportError::DateError(format!("ambiguous local midnight on {}", day)))
}

/// Rejects strftime formats chrono cannot render.
pub fn check_date_format(format: &str) -> Result<()> {
    if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
        return Err(ReportError::DateError(format!("invalid date format '{}'", format)));
    }
    Ok(())
}

pub fn format_date(date: NaiveDate, format: &str) -> Result<String> {
    let mut out = String::new();
    write!(out, "{}", date.format(format))
        .map_err(|_| ReportError::DateError(format!("invalid date format '{}'", format)))?;
    Ok(out)
}
