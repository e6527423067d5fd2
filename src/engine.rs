use crate::aep::AccountingExpressionProcessor;
use crate::error::{ReportError, Result};
use crate::expr::{dotted_references, eval, parse, EvalError, Expr, Scope};
use crate::ledger::{Ledger, RecordStore};
use crate::period::ResolvedPeriod;
use crate::query::QueryFetcher;
use crate::render::render;
use crate::schema::{
    InstancePeriod, KpiDefinition, KpiType, ReportInstance, ReportLibrary, ReportTemplate,
};
use crate::settings::EngineSettings;
use crate::value::Value;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::Rc;

pub const DIVISION_BY_ZERO: &str = "#DIV/0";
pub const EVALUATION_ERROR: &str = "#ERR";

/// Computed value of one KPI for one period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiResult {
    /// The value, `None` for no data or a failed evaluation.
    #[serde(rename = "val")]
    pub value: Value,

    /// Display string, or `#ERR` / `#DIV/0`.
    #[serde(rename = "val_r")]
    pub rendered: String,

    /// Formula and, on failure, the error.
    #[serde(rename = "val_c")]
    pub comment: String,

    pub style: Option<String>,
    pub prefix: Option<String>,
    pub suffix: Option<String>,

    #[serde(rename = "dp")]
    pub decimals: u32,

    pub is_percentage: bool,
    pub kpi: String,
    pub period_id: String,

    #[serde(rename = "expr")]
    pub expression: String,

    /// The value comes from ledger accounts only and can be drilled into.
    pub drilldown: bool,

    /// Codes of the reports referenced by the formula.
    pub sub_report_ids: Vec<String>,
}

/// Results of one report for one period.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeriodResults {
    pub results: BTreeMap<String, KpiResult>,

    /// Number of fixpoint passes needed.
    pub passes: usize,
}

impl PeriodResults {
    pub fn get(&self, kpi: &str) -> Option<&KpiResult> {
        self.results.get(kpi)
    }

    pub fn values(&self) -> BTreeMap<String, Value> {
        self.results
            .iter()
            .map(|(name, result)| (name.clone(), result.value.clone()))
            .collect()
    }
}

/// Collaborators and definitions shared by every evaluation of one
/// report computation.
pub struct EvaluationContext<'a> {
    pub library: &'a ReportLibrary,
    pub ledger: &'a dyn Ledger,
    pub store: &'a dyn RecordStore,
    pub settings: &'a EngineSettings,
    pub instance: &'a ReportInstance,
}

#[derive(Debug, Clone)]
enum SubReportEntry {
    InProgress,
    Done(BTreeMap<String, Value>),
}

/// Memoized work of one top-level computation: compiled account tokens per
/// report and KPI values per (report code, period).
#[derive(Debug, Default)]
pub struct EvaluationCache {
    processors: HashMap<String, Rc<AccountingExpressionProcessor>>,
    sub_reports: HashMap<(String, String), SubReportEntry>,
}

impl EvaluationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn computed_reports(&self) -> usize {
        self.sub_reports
            .values()
            .filter(|e| matches!(e, SubReportEntry::Done(_)))
            .count()
    }
}

struct CompiledKpi<'t> {
    definition: &'t KpiDefinition,
    expression: std::result::Result<Expr, EvalError>,
    sub_reports: Vec<String>,
}

enum Outcome {
    Value(Value),
    DivisionByZero(EvalError),
    Retry(EvalError),
    Failed(EvalError),
}

pub struct KpiEvaluator<'a> {
    ctx: &'a EvaluationContext<'a>,
}

impl<'a> KpiEvaluator<'a> {
    pub fn new(ctx: &'a EvaluationContext<'a>) -> Self {
        Self { ctx }
    }

    /// The account-token processor of `template`, compiled once per
    /// computation.
    pub fn processor(
        &self,
        template: &ReportTemplate,
        cache: &mut EvaluationCache,
    ) -> Result<Rc<AccountingExpressionProcessor>> {
        if let Some(aep) = cache.processors.get(&template.code) {
            return Ok(Rc::clone(aep));
        }

        let mut aep = AccountingExpressionProcessor::new();
        for kpi in &template.kpis {
            aep.parse(&kpi.expression)?;
        }
        aep.finalize(self.ctx.ledger, &self.ctx.instance.root_account)?;
        debug!(
            "Compiled {} account token(s) for report '{}'",
            aep.token_count(),
            template.code
        );

        let aep = Rc::new(aep);
        cache.processors.insert(template.code.clone(), Rc::clone(&aep));
        Ok(aep)
    }

    fn compile<'t>(
        &self,
        template: &ReportTemplate,
        aep: &AccountingExpressionProcessor,
        kpi: &'t KpiDefinition,
    ) -> Result<CompiledKpi<'t>> {
        let substituted = aep.substitute(&kpi.expression)?;

        let references = match dotted_references(&substituted) {
            Ok(references) => references,
            Err(e) => {
                return Ok(CompiledKpi {
                    definition: kpi,
                    expression: Err(e),
                    sub_reports: Vec::new(),
                })
            }
        };

        let mut cross_references = BTreeSet::new();
        let mut sub_reports: Vec<String> = Vec::new();
        for (base, attr) in references {
            if template.query(&base).is_some() || !self.ctx.library.contains(&base) {
                continue;
            }
            let referenced = self.ctx.library.get(&base)?;
            if referenced.kpi(&attr).is_none() {
                return Err(ReportError::MissingSubReportKpi {
                    referrer: format!("{}.{}", template.code, kpi.name),
                    report: base,
                    kpi: attr,
                });
            }
            if !sub_reports.contains(&base) {
                sub_reports.push(base.clone());
            }
            cross_references.insert((base, attr));
        }

        let expression = parse(&substituted).map(|expr| {
            expr.rewrite_attributes(&mut |base: &str, attr: &str| {
                cross_references
                    .contains(&(base.to_string(), attr.to_string()))
                    .then(|| format!("{}.{}", base, attr))
            })
        });

        Ok(CompiledKpi {
            definition: kpi,
            expression,
            sub_reports,
        })
    }

    /// KPI values of report `code` for `period`, computing them on first
    /// use. `None` while that report is itself being computed higher up the
    /// call chain.
    fn sub_report_values(
        &self,
        code: &str,
        period: &InstancePeriod,
        resolved: &ResolvedPeriod,
        cache: &mut EvaluationCache,
    ) -> Result<Option<BTreeMap<String, Value>>> {
        let key = (code.to_string(), period.name.clone());
        match cache.sub_reports.get(&key) {
            Some(SubReportEntry::Done(values)) => return Ok(Some(values.clone())),
            Some(SubReportEntry::InProgress) => {
                debug!(
                    "Report '{}' is already being computed for period '{}'",
                    code, period.name
                );
                return Ok(None);
            }
            None => {}
        }

        let template = self.ctx.library.get(code)?;
        debug!("Computing sub-report '{}' for period '{}'", code, period.name);
        let results = self.evaluate(template, period, resolved, cache)?;
        Ok(Some(results.values()))
    }

    fn style(&self, kpi: &KpiDefinition, scope: &Scope) -> Option<String> {
        let expression = kpi.style_expression.as_deref()?;
        match eval(expression, scope) {
            Ok(Value::None) => None,
            Ok(Value::Text(style)) => Some(style),
            Ok(other) => Some(other.to_string()),
            Err(e) => {
                warn!(
                    "Error evaluating style expression '{}' of KPI '{}': {}",
                    expression, kpi.name, e
                );
                None
            }
        }
    }

    /// Evaluates every KPI of `template` for one period.
    ///
    /// KPIs failing on an undefined name are retried in further passes until
    /// a pass resolves nothing more.
    pub fn evaluate(
        &self,
        template: &ReportTemplate,
        period: &InstancePeriod,
        resolved: &ResolvedPeriod,
        cache: &mut EvaluationCache,
    ) -> Result<PeriodResults> {
        let cache_key = (template.code.clone(), period.name.clone());
        cache
            .sub_reports
            .insert(cache_key.clone(), SubReportEntry::InProgress);

        let instance = self.ctx.instance;
        let locale = &self.ctx.settings.locale;
        let aep = self.processor(template, cache)?;

        let mut scope = Scope::new();
        QueryFetcher::new(self.ctx.store, self.ctx.settings.timezone()?).fetch_into(
            &template.queries,
            resolved,
            &period.query_filters,
            &mut scope,
        )?;
        aep.compute_balances(
            self.ctx.ledger,
            resolved,
            instance.target_move,
            &period.move_line_filter,
        )?
        .bind(&mut scope);

        let compiled = template
            .sorted_kpis()
            .into_iter()
            .map(|kpi| self.compile(template, &aep, kpi))
            .collect::<Result<Vec<_>>>()?;

        let mut results = BTreeMap::new();
        let mut bound_sub_reports: BTreeSet<String> = BTreeSet::new();
        let mut compute_queue: Vec<usize> = (0..compiled.len()).collect();
        let mut passes = 0;

        loop {
            passes += 1;
            let mut retry_queue = Vec::new();

            for &index in &compute_queue {
                let kpi = &compiled[index];
                let definition = kpi.definition;

                for code in &kpi.sub_reports {
                    if bound_sub_reports.contains(code) {
                        continue;
                    }
                    if let Some(values) = self.sub_report_values(code, period, resolved, cache)? {
                        for (name, value) in values {
                            scope.insert(format!("{}.{}", code, name), value);
                        }
                        bound_sub_reports.insert(code.clone());
                    }
                }

                let outcome = match &kpi.expression {
                    Err(e) => Outcome::Failed(e.clone()),
                    Ok(expr) => match expr.evaluate(&scope) {
                        Ok(value) => Outcome::Value(value),
                        Err(e @ EvalError::DivisionByZero) => Outcome::DivisionByZero(e),
                        Err(e) if e.is_retryable() => Outcome::Retry(e),
                        Err(e) => Outcome::Failed(e),
                    },
                };

                let mut comment = format!("{} = {}", definition.name, definition.expression);
                let evaluated = matches!(outcome, Outcome::Value(_));
                let (value, rendered) = match outcome {
                    Outcome::Value(value) => {
                        scope.insert(definition.name.clone(), value.clone());
                        let rendered = render(definition, &value, locale);
                        (value, rendered)
                    }
                    Outcome::DivisionByZero(e) => {
                        scope.insert(definition.name.clone(), Value::None);
                        comment.push_str(&format!("\n\n{}", e));
                        (Value::None, DIVISION_BY_ZERO.to_string())
                    }
                    Outcome::Retry(e) => {
                        retry_queue.push(index);
                        comment.push_str(&format!("\n\n{}", e));
                        (Value::None, EVALUATION_ERROR.to_string())
                    }
                    Outcome::Failed(e) => {
                        comment.push_str(&format!("\n\n{}", e));
                        (Value::None, EVALUATION_ERROR.to_string())
                    }
                };

                // "no data" from the ledger stays drillable, failures do not
                let drilldown = evaluated
                    && kpi.sub_reports.is_empty()
                    && AccountingExpressionProcessor::has_account_reference(&definition.expression);

                results.insert(
                    definition.name.clone(),
                    KpiResult {
                        value,
                        rendered,
                        comment,
                        style: self.style(definition, &scope),
                        prefix: definition.prefix.clone(),
                        suffix: definition.suffix.clone(),
                        decimals: definition.decimals,
                        is_percentage: definition.kpi_type == KpiType::Percentage,
                        kpi: definition.name.clone(),
                        period_id: period.name.clone(),
                        expression: definition.expression.clone(),
                        drilldown,
                        sub_report_ids: kpi.sub_reports.clone(),
                    },
                );
            }

            if retry_queue.is_empty() {
                break;
            }
            if retry_queue.len() == compute_queue.len() {
                let unresolved: Vec<&str> = retry_queue
                    .iter()
                    .map(|i| compiled[*i].definition.name.as_str())
                    .collect();
                warn!(
                    "Report '{}', period '{}': unresolved KPIs (missing or cyclic dependency): {}",
                    template.code,
                    period.name,
                    unresolved.join(", ")
                );
                break;
            }
            compute_queue = retry_queue;
        }

        debug!(
            "Report '{}', period '{}': {} KPI(s) evaluated in {} pass(es)",
            template.code,
            period.name,
            results.len(),
            passes
        );

        let period_results = PeriodResults { results, passes };
        cache
            .sub_reports
            .insert(cache_key, SubReportEntry::Done(period_results.values()));
        Ok(period_results)
    }
}
