use crate::error::{ReportError, Result};
use crate::utils::check_date_format;
use chrono::{FixedOffset, NaiveDate, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Number and date formatting conventions of the user's language.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(default)]
pub struct Locale {
    #[schemars(description = "Language code, e.g. 'en_US' or 'fr_BE'")]
    pub code: String,
    pub decimal_point: String,
    pub thousands_separator: String,

    #[schemars(description = "Size of digit groups in the integer part, 0 disables grouping")]
    pub grouping: usize,

    #[schemars(description = "strftime-style date format used in column headers")]
    pub date_format: String,
}

impl Default for Locale {
    fn default() -> Self {
        Self {
            code: "en_US".to_string(),
            decimal_point: ".".to_string(),
            thousands_separator: ",".to_string(),
            grouping: 3,
            date_format: "%m/%d/%Y".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(default)]
pub struct EngineSettings {
    pub locale: Locale,

    #[schemars(
        description = "User timezone as an offset from UTC in minutes. Used to turn period dates into datetime bounds."
    )]
    pub utc_offset_minutes: i32,
}

impl EngineSettings {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(json)?;
        settings.timezone()?;
        check_date_format(&settings.locale.date_format)?;
        Ok(settings)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn timezone(&self) -> Result<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).ok_or_else(|| {
            ReportError::DateError(format!(
                "invalid UTC offset of {} minutes",
                self.utc_offset_minutes
            ))
        })
    }

    /// Current date in the user's timezone.
    pub fn today(&self) -> Result<NaiveDate> {
        Ok(Utc::now().with_timezone(&self.timezone()?).date_naive())
    }
}
