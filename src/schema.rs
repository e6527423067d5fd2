use crate::error::{ReportError, Result};
use crate::expr::{dotted_references, Builtin, KEYWORDS};
use crate::filter::Filter;
use crate::utils::is_identifier;
use chrono::NaiveDate;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, Default)]
#[serde(rename_all = "PascalCase")]
pub enum KpiType {
    #[default]
    #[schemars(description = "Numeric value rendered with the KPI divider, precision, prefix and suffix")]
    Numeric,

    #[schemars(description = "Ratio rendered as a percentage (0.25 is shown as 25 %)")]
    Percentage,

    #[schemars(description = "Free text rendered as-is")]
    Text,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, Default)]
#[serde(rename_all = "PascalCase")]
pub enum Divider {
    #[schemars(description = "Values are multiplied by 1,000,000 and labelled µ")]
    Micro,

    #[schemars(description = "Values are multiplied by 1,000 and labelled m")]
    Milli,

    #[default]
    #[schemars(description = "Values are shown unscaled")]
    Unit,

    #[schemars(description = "Values are divided by 1,000 and labelled k")]
    Thousand,

    #[schemars(description = "Values are divided by 1,000,000 and labelled M")]
    Million,
}

impl Divider {
    pub fn factor(&self) -> f64 {
        match self {
            Divider::Micro => 1e-6,
            Divider::Milli => 1e-3,
            Divider::Unit => 1.0,
            Divider::Thousand => 1e3,
            Divider::Million => 1e6,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Divider::Micro => "µ",
            Divider::Milli => "m",
            Divider::Unit => "",
            Divider::Thousand => "k",
            Divider::Million => "M",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, Default)]
#[serde(rename_all = "PascalCase")]
pub enum CompareMethod {
    #[schemars(description = "Absolute difference between the two periods")]
    Difference,

    #[default]
    #[schemars(description = "Relative change, as a percentage of the base period value")]
    Percentage,

    #[serde(rename = "None")]
    #[schemars(description = "No comparison is rendered")]
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct KpiDefinition {
    #[schemars(
        description = "Identifier of the KPI. Other formulas of the same report refer to it by this name, other reports as <report_code>.<name>."
    )]
    pub name: String,

    #[serde(default)]
    #[schemars(description = "Label shown in the report rows. Defaults to the name when empty.")]
    pub description: String,

    #[schemars(
        description = "Formula, e.g. 'balp[70%] - balp[60%]', 'revenue - cost', 'sum(invoices.amount)' or 'sales.revenue / 2'"
    )]
    pub expression: String,

    #[serde(default)]
    pub kpi_type: KpiType,

    #[serde(default)]
    pub divider: Divider,

    #[serde(default)]
    #[schemars(description = "Number of decimals shown")]
    pub decimals: u32,

    #[serde(default)]
    pub prefix: Option<String>,

    #[serde(default)]
    pub suffix: Option<String>,

    #[serde(default)]
    pub compare_method: CompareMethod,

    #[serde(default)]
    #[schemars(
        description = "Optional formula evaluated with the KPI values in scope, returning a style token, e.g. \"'color: red' if margin < 0 else None\""
    )]
    pub style_expression: Option<String>,

    #[serde(default)]
    #[schemars(description = "Style applied to the whole row")]
    pub default_style: Option<String>,

    #[serde(default = "default_kpi_sequence")]
    pub sequence: i32,

    #[serde(default)]
    #[schemars(description = "Start a new column group (a new header and section) at this KPI")]
    pub column_break: bool,

    #[serde(default)]
    #[schemars(
        description = "The KPI description is used as the caption of its column group and the KPI is not shown as a row"
    )]
    pub column_title: bool,

    #[serde(default)]
    #[schemars(description = "Computed and usable by other formulas, but not shown")]
    pub invisible: bool,
}

fn default_kpi_sequence() -> i32 {
    100
}

impl KpiDefinition {
    pub fn new(name: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            expression: expression.into(),
            kpi_type: KpiType::Numeric,
            divider: Divider::Unit,
            decimals: 0,
            prefix: None,
            suffix: None,
            compare_method: CompareMethod::Percentage,
            style_expression: None,
            default_style: None,
            sequence: default_kpi_sequence(),
            column_break: false,
            column_title: false,
            invisible: false,
        }
    }

    /// Switches the display kind and resets the settings that depend on it.
    pub fn with_type(mut self, kpi_type: KpiType) -> Self {
        self.kpi_type = kpi_type;
        self.divider = Divider::Unit;
        self.decimals = 0;
        self.compare_method = match kpi_type {
            KpiType::Numeric => CompareMethod::Percentage,
            KpiType::Percentage => CompareMethod::Difference,
            KpiType::Text => CompareMethod::Disabled,
        };
        self
    }

    pub fn caption(&self) -> &str {
        if self.description.is_empty() {
            &self.name
        } else {
            &self.description
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum AggregateKind {
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateKind {
    pub fn label(&self) -> &'static str {
        match self {
            AggregateKind::Sum => "sum",
            AggregateKind::Avg => "avg",
            AggregateKind::Min => "min",
            AggregateKind::Max => "max",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct QueryDefinition {
    #[schemars(description = "Name under which the result is visible to KPI formulas")]
    pub name: String,

    #[schemars(description = "Record type queried in the record store, e.g. 'sale.order'")]
    pub model: String,

    #[schemars(description = "Fields fetched (or aggregated) for each record")]
    pub fields: Vec<String>,

    #[serde(default)]
    #[schemars(
        description = "When set, a single record holding 'count' and the aggregate of each field is produced instead of the list of records"
    )]
    pub aggregate: Option<AggregateKind>,

    #[schemars(description = "Date or datetime field bounded to the period being computed")]
    pub date_field: String,

    #[serde(default)]
    pub filter: Filter,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum PeriodType {
    #[schemars(description = "Offset and duration are counted in days")]
    Day,

    #[schemars(description = "Offset and duration are counted in Monday-based weeks")]
    Week,

    #[schemars(description = "Offset and duration are counted in ledger fiscal periods")]
    FiscalPeriod,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct PeriodTemplate {
    pub name: String,
    pub period_type: PeriodType,

    #[schemars(description = "Shift relative to the pivot date, e.g. -1 for the previous day/week/period")]
    pub offset: i32,

    #[schemars(description = "Number of days/weeks/periods covered, at least 1")]
    pub duration: i32,

    #[serde(default)]
    pub sequence: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct ManualPosition {
    pub line: i32,
    pub column: i32,

    #[serde(default)]
    #[schemars(description = "Caption of a header cell (line 0) or a row label (column 0)")]
    pub name: Option<String>,

    #[serde(default)]
    #[schemars(description = "KPI displayed in an interior cell")]
    pub kpi: Option<String>,

    #[serde(default)]
    #[schemars(description = "Template period displayed in an interior cell")]
    pub period: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct ReportTemplate {
    #[schemars(description = "Identifier used by other reports to reference this report's KPIs")]
    pub code: String,

    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    pub kpis: Vec<KpiDefinition>,

    #[serde(default)]
    pub queries: Vec<QueryDefinition>,

    #[serde(default)]
    #[schemars(description = "Transpose the grid: periods become rows and KPIs become columns")]
    pub matrix: bool,

    #[serde(default)]
    #[schemars(description = "Lay the grid out from the explicit positions instead of one row per KPI")]
    pub manual_position: bool,

    #[serde(default)]
    #[schemars(description = "Default periods copied into new report instances")]
    pub periods: Vec<PeriodTemplate>,

    #[serde(default)]
    pub positions: Vec<ManualPosition>,
}

/// Checks that `name` can be bound in the formula scope.
pub(crate) fn check_scope_name(context: &str, name: &str) -> Result<()> {
    if !is_identifier(name) {
        return Err(ReportError::definition(
            context,
            format!("'{}' is not a valid identifier", name),
        ));
    }
    if name.starts_with("__") {
        return Err(ReportError::definition(
            context,
            format!("'{}' must not start with '__'", name),
        ));
    }
    if KEYWORDS.contains(&name) || Builtin::NAMES.contains(&name) {
        return Err(ReportError::definition(
            context,
            format!("'{}' is a reserved name", name),
        ));
    }
    Ok(())
}

impl ReportTemplate {
    pub fn new(code: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            name: name.into(),
            description: None,
            kpis: Vec::new(),
            queries: Vec::new(),
            matrix: false,
            manual_position: false,
            periods: Vec::new(),
            positions: Vec::new(),
        }
    }

    /// KPIs in evaluation and display order.
    pub fn sorted_kpis(&self) -> Vec<&KpiDefinition> {
        let mut kpis: Vec<&KpiDefinition> = self.kpis.iter().collect();
        kpis.sort_by_key(|k| k.sequence);
        kpis
    }

    pub fn kpi(&self, name: &str) -> Option<&KpiDefinition> {
        self.kpis.iter().find(|k| k.name == name)
    }

    pub fn query(&self, name: &str) -> Option<&QueryDefinition> {
        self.queries.iter().find(|q| q.name == name)
    }

    pub fn validate(&self) -> Result<()> {
        let context = format!("report '{}'", self.code);
        if !is_identifier(&self.code) {
            return Err(ReportError::definition(
                &context,
                "the report code must be a valid identifier",
            ));
        }

        let mut names = BTreeSet::new();
        for kpi in &self.kpis {
            check_scope_name(&context, &kpi.name)?;
            if !names.insert(kpi.name.as_str()) {
                return Err(ReportError::definition(
                    &context,
                    format!("duplicate KPI name '{}'", kpi.name),
                ));
            }
            if kpi.expression.trim().is_empty() {
                return Err(ReportError::definition(
                    &context,
                    format!("KPI '{}' has an empty expression", kpi.name),
                ));
            }
        }

        for query in &self.queries {
            check_scope_name(&context, &query.name)?;
            if !names.insert(query.name.as_str()) {
                return Err(ReportError::definition(
                    &context,
                    format!("query name '{}' is already used", query.name),
                ));
            }
            if query.fields.is_empty() {
                return Err(ReportError::definition(
                    &context,
                    format!("query '{}' has no fields", query.name),
                ));
            }
            if query.date_field.is_empty() {
                return Err(ReportError::definition(
                    &context,
                    format!("query '{}' has no date field", query.name),
                ));
            }
        }

        let mut period_names = BTreeSet::new();
        for period in &self.periods {
            if period.duration <= 0 {
                return Err(ReportError::definition(
                    &context,
                    format!("period '{}' must have a positive duration", period.name),
                ));
            }
            if !period_names.insert(period.name.as_str()) {
                return Err(ReportError::definition(
                    &context,
                    format!("duplicate period name '{}'", period.name),
                ));
            }
        }

        for position in &self.positions {
            if position.line < 0 || position.column < 0 {
                return Err(ReportError::InvalidPosition {
                    line: position.line,
                    column: position.column,
                });
            }
            if let Some(kpi) = &position.kpi {
                if self.kpi(kpi).is_none() {
                    return Err(ReportError::definition(
                        &context,
                        format!("position refers to unknown KPI '{}'", kpi),
                    ));
                }
            }
            if let Some(period) = &position.period {
                if !period_names.contains(period.as_str()) {
                    return Err(ReportError::definition(
                        &context,
                        format!("position refers to unknown period '{}'", period),
                    ));
                }
            }
        }

        Ok(())
    }

    pub fn generate_json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(ReportTemplate)
    }

    pub fn schema_as_json() -> std::result::Result<String, serde_json::Error> {
        let schema = Self::generate_json_schema();
        serde_json::to_string_pretty(&schema)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, Default)]
#[serde(rename_all = "PascalCase")]
pub enum TargetMove {
    #[default]
    #[schemars(description = "Only posted journal entries are aggregated")]
    Posted,

    #[schemars(description = "Draft and posted journal entries are aggregated")]
    All,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct InstancePeriod {
    #[schemars(description = "Column name, unique within the instance")]
    pub name: String,

    pub period_type: PeriodType,
    pub offset: i32,
    pub duration: i32,

    #[serde(default = "default_period_sequence")]
    pub sequence: i32,

    #[serde(default = "default_normalize_factor")]
    #[schemars(
        description = "Values are divided by this factor before being compared with another period, e.g. the number of days for per-day averages"
    )]
    pub normalize_factor: u32,

    #[serde(default)]
    #[schemars(description = "Names of the periods this one is compared with, each adding a comparison column")]
    pub compare_with: Vec<String>,

    #[serde(default)]
    #[schemars(description = "Template period this period was created from")]
    pub template_period: Option<String>,

    #[serde(default)]
    #[schemars(description = "Extra filter applied to every ledger aggregation of this period")]
    pub move_line_filter: Filter,

    #[serde(default)]
    #[schemars(description = "Extra filter per query name, applied to that query for this period")]
    pub query_filters: BTreeMap<String, Filter>,
}

fn default_period_sequence() -> i32 {
    100
}

fn default_normalize_factor() -> u32 {
    1
}

impl InstancePeriod {
    pub fn new(
        name: impl Into<String>,
        period_type: PeriodType,
        offset: i32,
        duration: i32,
    ) -> Self {
        Self {
            name: name.into(),
            period_type,
            offset,
            duration,
            sequence: default_period_sequence(),
            normalize_factor: default_normalize_factor(),
            compare_with: Vec::new(),
            template_period: None,
            move_line_filter: Filter::default(),
            query_filters: BTreeMap::new(),
        }
    }

    /// Key used to match manual grid positions.
    pub fn template_key(&self) -> &str {
        self.template_period.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct ReportInstance {
    pub name: String,

    #[schemars(description = "Code of the report template computed by this instance")]
    pub report: String,

    #[serde(default)]
    #[schemars(description = "Base date of the periods. Today is used when empty.")]
    pub date: Option<NaiveDate>,

    #[schemars(description = "Code of the chart-of-accounts root; account tokens only select accounts below it")]
    pub root_account: String,

    #[serde(default)]
    #[schemars(description = "Accounting entity whose fiscal periods are used")]
    pub company: String,

    #[serde(default)]
    pub target_move: TargetMove,

    pub periods: Vec<InstancePeriod>,
}

impl ReportInstance {
    pub fn new(
        name: impl Into<String>,
        report: impl Into<String>,
        root_account: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            report: report.into(),
            date: None,
            root_account: root_account.into(),
            company: String::new(),
            target_move: TargetMove::Posted,
            periods: Vec::new(),
        }
    }

    pub fn pivot_date(&self, today: NaiveDate) -> NaiveDate {
        self.date.unwrap_or(today)
    }

    /// Replaces the periods with one period per template period.
    pub fn with_template_periods(mut self, template: &ReportTemplate) -> Self {
        self.periods = template
            .periods
            .iter()
            .map(|p| InstancePeriod {
                sequence: p.sequence,
                template_period: Some(p.name.clone()),
                ..InstancePeriod::new(p.name.clone(), p.period_type, p.offset, p.duration)
            })
            .collect();
        self
    }

    pub fn period(&self, name: &str) -> Option<&InstancePeriod> {
        self.periods.iter().find(|p| p.name == name)
    }

    pub fn sorted_periods(&self) -> Vec<&InstancePeriod> {
        let mut periods: Vec<&InstancePeriod> = self.periods.iter().collect();
        periods.sort_by_key(|p| p.sequence);
        periods
    }

    pub fn validate(&self) -> Result<()> {
        let context = format!("report instance '{}'", self.name);
        let mut names = BTreeSet::new();
        for period in &self.periods {
            if period.duration <= 0 {
                return Err(ReportError::definition(
                    &context,
                    format!("period '{}' must have a positive duration", period.name),
                ));
            }
            if period.normalize_factor == 0 {
                return Err(ReportError::definition(
                    &context,
                    format!("period '{}' must have a positive normalize factor", period.name),
                ));
            }
            if !names.insert(period.name.as_str()) {
                return Err(ReportError::definition(
                    &context,
                    format!("duplicate period name '{}'", period.name),
                ));
            }
        }
        for period in &self.periods {
            for other in &period.compare_with {
                if !names.contains(other.as_str()) {
                    return Err(ReportError::UnknownPeriod(other.clone()));
                }
            }
        }
        Ok(())
    }
}

/// Report templates by code.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct ReportLibrary {
    reports: BTreeMap<String, ReportTemplate>,
}

impl ReportLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, template: ReportTemplate) {
        self.reports.insert(template.code.clone(), template);
    }

    pub fn with(mut self, template: ReportTemplate) -> Self {
        self.insert(template);
        self
    }

    pub fn get(&self, code: &str) -> Result<&ReportTemplate> {
        self.reports
            .get(code)
            .ok_or_else(|| ReportError::ReportNotFound(code.to_string()))
    }

    pub fn contains(&self, code: &str) -> bool {
        self.reports.contains_key(code)
    }

    pub fn reports(&self) -> impl Iterator<Item = &ReportTemplate> {
        self.reports.values()
    }

    /// Validates every template and every `<report>.<kpi>` reference.
    ///
    /// A dotted name whose left side is a query of the referring report is an
    /// attribute access, anything else must name a report and one of its KPIs.
    pub fn validate(&self) -> Result<()> {
        for template in self.reports.values() {
            template.validate()?;
            for kpi in &template.kpis {
                let refs = dotted_references(&kpi.expression).map_err(|e| {
                    ReportError::definition(
                        format!("KPI '{}.{}'", template.code, kpi.name),
                        e.to_string(),
                    )
                })?;
                for (base, attr) in refs {
                    if template.query(&base).is_some() {
                        continue;
                    }
                    let referenced = self.get(&base)?;
                    if referenced.kpi(&attr).is_none() {
                        return Err(ReportError::MissingSubReportKpi {
                            referrer: format!("{}.{}", template.code, kpi.name),
                            report: base,
                            kpi: attr,
                        });
                    }
                }
            }
        }
        Ok(())
    }
}
