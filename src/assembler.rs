//! Report assembly: computes every valid period of a report instance and
//! lays the KPI results out as grid sections.

use crate::aep::AccountingExpressionProcessor;
use crate::engine::{EvaluationCache, EvaluationContext, KpiEvaluator, KpiResult, PeriodResults};
use crate::error::{ReportError, Result};
use crate::filter::Filter;
use crate::ledger::{Ledger, RecordStore};
use crate::period::{PeriodResolver, ResolvedPeriod};
use crate::render::render_comparison;
use crate::schema::{InstancePeriod, PeriodType, ReportInstance, ReportLibrary, ReportTemplate};
use crate::settings::{EngineSettings, Locale};
use crate::utils::format_date;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderColumn {
    pub name: String,
    pub date: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderRow {
    pub kpi_name: String,
    pub cols: Vec<HeaderColumn>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GridCell {
    Kpi(Box<KpiResult>),
    Comparison {
        #[serde(rename = "val_r")]
        rendered: String,
    },
    /// Manual grid position with nothing computed for it.
    Empty,
}

impl GridCell {
    pub fn rendered(&self) -> &str {
        match self {
            GridCell::Kpi(result) => &result.rendered,
            GridCell::Comparison { rendered } => rendered,
            GridCell::Empty => "",
        }
    }

    pub fn as_kpi(&self) -> Option<&KpiResult> {
        match self {
            GridCell::Kpi(result) => Some(result.as_ref()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentRow {
    pub kpi_name: String,
    pub kpi_unique_name: String,
    pub cols: Vec<GridCell>,
    pub default_style: Option<String>,
    pub column: usize,
}

/// One column-break group of the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridSection {
    pub header: Vec<HeaderRow>,
    pub content: Vec<ContentRow>,
}

impl GridSection {
    pub fn row(&self, kpi_unique_name: &str) -> Option<&ContentRow> {
        self.content.iter().find(|r| r.kpi_unique_name == kpi_unique_name)
    }

    /// Index of the header column named `name`.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.header
            .first()
            .and_then(|h| h.cols.iter().position(|c| c.name == name))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Drilldown {
    pub caption: String,
    pub filter: Filter,
}

fn date_caption(
    period: &InstancePeriod,
    resolved: &ResolvedPeriod,
    locale: &Locale,
) -> Result<String> {
    let (from, to) = match &resolved.fiscal {
        Some(span) => (span.period_from.clone(), span.period_to.clone()),
        None => (
            format_date(resolved.date_from, &locale.date_format)?,
            format_date(resolved.date_to, &locale.date_format)?,
        ),
    };
    if period.duration > 1 || period.period_type == PeriodType::Week {
        Ok(format!("from {} to {}", from, to))
    } else {
        Ok(from)
    }
}

struct ComputedPeriod<'i> {
    period: &'i InstancePeriod,
    resolved: ResolvedPeriod,
    results: PeriodResults,
}

/// Computes report instances against a ledger and a record store.
pub struct ReportEngine<'a> {
    library: &'a ReportLibrary,
    ledger: &'a dyn Ledger,
    store: &'a dyn RecordStore,
    settings: &'a EngineSettings,
}

impl<'a> ReportEngine<'a> {
    pub fn new(
        library: &'a ReportLibrary,
        ledger: &'a dyn Ledger,
        store: &'a dyn RecordStore,
        settings: &'a EngineSettings,
    ) -> Self {
        Self {
            library,
            ledger,
            store,
            settings,
        }
    }

    fn pivot_date(&self, instance: &ReportInstance) -> Result<chrono::NaiveDate> {
        Ok(instance.pivot_date(self.settings.today()?))
    }

    fn compute_periods<'i>(
        &self,
        template: &ReportTemplate,
        instance: &'i ReportInstance,
    ) -> Result<Vec<ComputedPeriod<'i>>> {
        let pivot = self.pivot_date(instance)?;
        let mut resolver = PeriodResolver::new(self.ledger, &instance.company, pivot);

        let mut valid = Vec::new();
        for period in instance.sorted_periods() {
            if let Some(resolved) = resolver.resolve(period)? {
                valid.push((period, resolved));
            }
        }
        info!(
            "Computing report '{}' for instance '{}': {} valid period(s), pivot date {}",
            template.code,
            instance.name,
            valid.len(),
            pivot
        );

        let ctx = EvaluationContext {
            library: self.library,
            ledger: self.ledger,
            store: self.store,
            settings: self.settings,
            instance,
        };
        let evaluator = KpiEvaluator::new(&ctx);
        let mut cache = EvaluationCache::new();

        let mut computed = Vec::with_capacity(valid.len());
        for (period, resolved) in valid {
            debug!(
                "Period '{}': {} to {}",
                period.name, resolved.date_from, resolved.date_to
            );
            let results = evaluator.evaluate(template, period, &resolved, &mut cache)?;
            computed.push(ComputedPeriod {
                period,
                resolved,
                results,
            });
        }
        Ok(computed)
    }

    /// Computes `instance` and returns one grid section per column-break
    /// group (a single section for manually positioned reports).
    pub fn compute(&self, instance: &ReportInstance) -> Result<Vec<GridSection>> {
        instance.validate()?;
        let template = self.library.get(&instance.report)?;
        template.validate()?;

        let computed = self.compute_periods(template, instance)?;
        let locale = &self.settings.locale;
        let kpis = template.sorted_kpis();

        let mut titles: Vec<String> = vec![String::new()];
        let mut rows: Vec<ContentRow> = Vec::with_capacity(kpis.len());
        let mut hidden: BTreeSet<String> = BTreeSet::new();
        let mut column = 0;
        for kpi in &kpis {
            if kpi.column_break {
                column += 1;
                titles.push(if kpi.column_title {
                    kpi.description.clone()
                } else {
                    String::new()
                });
            }
            if kpi.column_title || kpi.invisible {
                hidden.insert(kpi.name.clone());
            }
            rows.push(ContentRow {
                kpi_name: kpi.caption().to_string(),
                kpi_unique_name: kpi.name.clone(),
                cols: Vec::new(),
                default_style: kpi.default_style.clone(),
                column,
            });
        }

        let mut header_cols = Vec::new();
        for current in &computed {
            header_cols.push(HeaderColumn {
                name: current.period.name.clone(),
                date: date_caption(current.period, &current.resolved, locale)?,
            });
            for row in rows.iter_mut() {
                if let Some(result) = current.results.get(&row.kpi_unique_name) {
                    row.cols.push(GridCell::Kpi(Box::new(result.clone())));
                }
            }

            for other_name in &current.period.compare_with {
                let Some(other) = computed.iter().find(|c| &c.period.name == other_name) else {
                    continue;
                };
                header_cols.push(HeaderColumn {
                    name: format!("{} vs {}", current.period.name, other.period.name),
                    date: String::new(),
                });
                for (row, kpi) in rows.iter_mut().zip(&kpis) {
                    let value = current.results.get(&kpi.name).map(|r| &r.value);
                    let base = other.results.get(&kpi.name).map(|r| &r.value);
                    let rendered = match (value, base) {
                        (Some(value), Some(base)) => render_comparison(
                            kpi,
                            value,
                            base,
                            current.period.normalize_factor,
                            other.period.normalize_factor,
                            locale,
                        ),
                        _ => String::new(),
                    };
                    row.cols.push(GridCell::Comparison { rendered });
                }
            }
        }

        if template.manual_position {
            return Ok(vec![manual_grid(template, &computed)]);
        }

        let columns: BTreeSet<usize> = rows.iter().map(|r| r.column).collect();
        let mut sections: Vec<GridSection> = columns
            .into_iter()
            .map(|column| GridSection {
                header: vec![HeaderRow {
                    kpi_name: titles.get(column).cloned().unwrap_or_default(),
                    cols: header_cols.clone(),
                }],
                content: rows
                    .iter()
                    .filter(|r| r.column == column && !hidden.contains(&r.kpi_unique_name))
                    .cloned()
                    .collect(),
            })
            .collect();

        if template.matrix {
            sections = sections
                .into_iter()
                .filter(|s| !s.content.is_empty())
                .map(transpose)
                .collect();
        }
        Ok(sections)
    }

    /// Ledger filter selecting the move lines behind the account tokens of
    /// `formula` in period `period_name`. `None` when the formula has no
    /// account token or the period is not valid.
    pub fn drilldown(
        &self,
        instance: &ReportInstance,
        period_name: &str,
        formula: &str,
    ) -> Result<Option<Drilldown>> {
        let period = instance
            .period(period_name)
            .ok_or_else(|| ReportError::UnknownPeriod(period_name.to_string()))?;
        if !AccountingExpressionProcessor::has_account_reference(formula) {
            return Ok(None);
        }

        let pivot = self.pivot_date(instance)?;
        let mut resolver = PeriodResolver::new(self.ledger, &instance.company, pivot);
        let Some(resolved) = resolver.resolve(period)? else {
            return Ok(None);
        };

        let mut aep = AccountingExpressionProcessor::new();
        aep.parse(formula)?;
        aep.finalize(self.ledger, &instance.root_account)?;
        let filter = aep.drilldown_filter(
            formula,
            &resolved,
            instance.target_move,
            &period.move_line_filter,
        )?;

        Ok(filter.map(|filter| Drilldown {
            caption: format!("{} - {}", formula, period.name),
            filter,
        }))
    }
}

/// Periods become rows and KPIs become columns.
fn transpose(section: GridSection) -> GridSection {
    let lines = section
        .header
        .into_iter()
        .next()
        .map(|h| h.cols)
        .unwrap_or_default();
    let default_style = section.content.first().and_then(|r| r.default_style.clone());
    let column = section.content.first().map(|r| r.column).unwrap_or(0);

    let header = vec![HeaderRow {
        kpi_name: String::new(),
        cols: section
            .content
            .iter()
            .map(|row| HeaderColumn {
                name: row.kpi_name.clone(),
                date: String::new(),
            })
            .collect(),
    }];

    let content = lines
        .into_iter()
        .enumerate()
        .map(|(index, line)| ContentRow {
            kpi_unique_name: line.name.clone(),
            kpi_name: line.name,
            cols: section
                .content
                .iter()
                .map(|row| row.cols.get(index).cloned().unwrap_or(GridCell::Empty))
                .collect(),
            default_style: default_style.clone(),
            column,
        })
        .collect();

    GridSection { header, content }
}

/// Lays results out at explicit (line, column) positions. Line 0 holds
/// column captions and column 0 row labels.
fn manual_grid(template: &ReportTemplate, computed: &[ComputedPeriod<'_>]) -> GridSection {
    let mut titles: BTreeMap<i32, String> = BTreeMap::new();
    let mut labels: BTreeMap<i32, String> = BTreeMap::new();
    let mut cells: BTreeMap<(i32, i32), GridCell> = BTreeMap::new();
    let mut last_line = 0;
    let mut last_column = 0;

    for position in &template.positions {
        last_line = last_line.max(position.line);
        last_column = last_column.max(position.column);
        let caption = position.name.clone().unwrap_or_default();

        match (position.line, position.column) {
            (0, 0) => {}
            (0, column) => {
                titles.insert(column, caption);
            }
            (line, 0) => {
                labels.insert(line, caption);
            }
            (line, column) => {
                let (Some(kpi), Some(period)) = (&position.kpi, &position.period) else {
                    continue;
                };
                let found = computed
                    .iter()
                    .filter(|c| c.period.template_key() == period)
                    .find_map(|c| c.results.get(kpi));
                if let Some(result) = found {
                    cells.insert((line, column), GridCell::Kpi(Box::new(result.clone())));
                }
            }
        }
    }

    let default_style = template
        .sorted_kpis()
        .first()
        .and_then(|k| k.default_style.clone());

    let header = vec![HeaderRow {
        kpi_name: String::new(),
        cols: (1..=last_column)
            .map(|column| HeaderColumn {
                name: titles.get(&column).cloned().unwrap_or_default(),
                date: String::new(),
            })
            .collect(),
    }];

    let content = (1..=last_line)
        .map(|line| {
            let label = labels.get(&line).cloned().unwrap_or_default();
            ContentRow {
                kpi_unique_name: label.clone(),
                kpi_name: label,
                cols: (1..=last_column)
                    .map(|column| cells.remove(&(line, column)).unwrap_or(GridCell::Empty))
                    .collect(),
                default_style: default_style.clone(),
                column: 0,
            }
        })
        .collect();

    GridSection { header, content }
}
