use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Malformed account expression '{token}': {details}")]
    Compilation { token: String, details: String },

    #[error("Invalid definition for {context}: {details}")]
    InvalidDefinition { context: String, details: String },

    #[error("Invalid manual position (line {line}, column {column}): coordinates can't be negative")]
    InvalidPosition { line: i32, column: i32 },

    #[error("No report with code '{0}'")]
    ReportNotFound(String),

    #[error("No period named '{0}' in report instance")]
    UnknownPeriod(String),

    #[error("Report '{report}' referenced by '{referrer}' has no KPI named '{kpi}'")]
    MissingSubReportKpi {
        referrer: String,
        report: String,
        kpi: String,
    },

    #[error("Unknown field '{field}' on model '{model}'")]
    UnknownField { model: String, field: String },

    #[error("Data source error: {0}")]
    Backend(String),

    #[error("Date calculation error: {0}")]
    DateError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ReportError {
    pub(crate) fn definition(context: impl Into<String>, details: impl Into<String>) -> Self {
        Self::InvalidDefinition {
            context: context.into(),
            details: details.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ReportError>;
