//! # MIS Report Builder
//!
//! A management reporting engine: KPI formulas over ledger balances,
//! auxiliary record queries and other reports' KPIs, computed for several
//! periods and laid out as display grids with period comparisons.
//!
//! ## Core Concepts
//!
//! - **Report Template**: KPIs (named formulas), queries and optional default periods
//! - **Account Tokens**: `balp[70%]`, `crdi[400-409]`, `bal_512[journal = 'BNK']`,
//!   compiled into one batched ledger aggregation per period and mode
//! - **Report Instance**: a template computed for concrete periods relative to a pivot date
//! - **Fixpoint Evaluation**: KPIs may reference each other in any order; failed
//!   lookups are retried until no further progress is made
//! - **Cross-Report References**: `sales.revenue` reads KPI `revenue` of report
//!   `sales` for the same period
//!
//! ## Example
//!
//! ```rust,ignore
//! use mis_report_builder::*;
//! use chrono::NaiveDate;
//!
//! let mut ledger = MemoryLedger::new();
//! ledger
//!     .add_account("root", "Chart", None)
//!     .add_account("600", "Purchases", Some("root"))
//!     .add_account("700", "Sales", Some("root"));
//! ledger
//!     .post("700", NaiveDate::from_ymd_opt(2024, 3, 4).unwrap(), -1000.0)
//!     .post("600", NaiveDate::from_ymd_opt(2024, 3, 6).unwrap(), 300.0);
//!
//! let mut template = ReportTemplate::new("pl", "Profit and loss");
//! template.kpis = vec![
//!     KpiDefinition::new("revenue", "-balp[70%]"),
//!     KpiDefinition::new("cost", "balp[60%]"),
//!     KpiDefinition::new("margin", "revenue - cost"),
//! ];
//! let library = ReportLibrary::new().with(template);
//!
//! let mut instance = ReportInstance::new("March", "pl", "root");
//! instance.date = NaiveDate::from_ymd_opt(2024, 3, 31);
//! instance.periods = vec![InstancePeriod::new("march", PeriodType::Day, -30, 31)];
//!
//! let sections = compute_report(
//!     &library,
//!     &ledger,
//!     &MemoryStore::new(),
//!     &EngineSettings::default(),
//!     &instance,
//! )
//! .unwrap();
//! ```

pub mod aep;
pub mod assembler;
pub mod chart_of_accounts;
pub mod engine;
pub mod error;
pub mod expr;
pub mod filter;
pub mod ledger;
pub mod memory;
pub mod period;
pub mod query;
pub mod render;
pub mod schema;
pub mod settings;
pub mod utils;
pub mod value;

pub use aep::{AccountingExpressionProcessor, Balances, Mode};
pub use assembler::{
    ContentRow, Drilldown, GridCell, GridSection, HeaderColumn, HeaderRow, ReportEngine,
};
pub use chart_of_accounts::{AccountEntry, AccountSelector, ChartOfAccounts};
pub use engine::{
    EvaluationCache, EvaluationContext, KpiEvaluator, KpiResult, PeriodResults,
    DIVISION_BY_ZERO, EVALUATION_ERROR,
};
pub use error::{ReportError, Result};
pub use expr::{EvalError, Scope};
pub use filter::{Condition, FieldLookup, FieldValue, Filter, Operator, Record};
pub use ledger::{
    AccountTotals, FieldInfo, FieldKind, FiscalPeriod, GroupTotals, Ledger, MoveLine, RecordStore,
};
pub use memory::{MemoryLedger, MemoryStore};
pub use period::{FiscalSpan, PeriodResolver, ResolvedPeriod};
pub use query::QueryFetcher;
pub use render::{format_number, render, render_comparison};
pub use schema::*;
pub use settings::{EngineSettings, Locale};
pub use utils::*;
pub use value::Value;

use log::debug;

/// Validates the whole library, then computes `instance`.
pub fn compute_report(
    library: &ReportLibrary,
    ledger: &dyn Ledger,
    store: &dyn RecordStore,
    settings: &EngineSettings,
    instance: &ReportInstance,
) -> Result<Vec<GridSection>> {
    library.validate()?;
    debug!(
        "Library holds {} report(s); computing instance '{}'",
        library.reports().count(),
        instance.name
    );
    ReportEngine::new(library, ledger, store, settings).compute(instance)
}

/// Drill-down filter of `formula` for one period of `instance`.
pub fn drilldown(
    library: &ReportLibrary,
    ledger: &dyn Ledger,
    store: &dyn RecordStore,
    settings: &EngineSettings,
    instance: &ReportInstance,
    period: &str,
    formula: &str,
) -> Result<Option<Drilldown>> {
    ReportEngine::new(library, ledger, store, settings).drilldown(instance, period, formula)
}
