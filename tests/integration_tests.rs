use chrono::NaiveDate;
use mis_report_builder::*;

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// Display string with `_` for the narrow no-break space, `~` for the
/// no-break space and `-` for the non-breaking hyphen.
fn shown(text: &str) -> String {
    text.replace('_', "\u{202F}")
        .replace('~', "\u{00A0}")
        .replace('-', "\u{2011}")
}

fn ledger() -> MemoryLedger {
    let mut ledger = MemoryLedger::new();
    ledger.add_monthly_periods("acme", 2024).unwrap();
    ledger
        .add_account("root", "Chart of accounts", None)
        .add_account("5", "Financial accounts", Some("root"))
        .add_account("512", "Bank", Some("5"))
        .add_account("6", "Expenses", Some("root"))
        .add_account("600", "Purchases", Some("6"))
        .add_account("7", "Income", Some("root"))
        .add_account("700", "Sales", Some("7"))
        .add_account("701", "Services", Some("7"));
    ledger
        .post("700", date(2024, 2, 10), -1450.0)
        .post("600", date(2024, 2, 20), 290.0)
        .post("700", date(2024, 3, 4), -1000.0)
        .post("701", date(2024, 3, 12), -300.0)
        .post("600", date(2024, 3, 13), 200.0)
        .post("700", date(2024, 3, 15), -500.0)
        .post("600", date(2024, 3, 15), 100.0)
        .post("512", date(2024, 3, 15), 400.0)
        .add_draft("700", date(2024, 3, 15), -999.0);
    ledger
}

fn kpi(name: &str, expression: &str, sequence: i32) -> KpiDefinition {
    KpiDefinition {
        sequence,
        ..KpiDefinition::new(name, expression)
    }
}

fn profit_and_loss() -> ReportTemplate {
    let mut template = ReportTemplate::new("pl", "Profit and loss");
    let mut revenue = kpi("revenue", "-balp[70%]", 2);
    revenue.description = "Revenue".to_string();
    template.kpis = vec![
        // defined before the KPIs it depends on
        kpi("margin", "revenue - cost", 1),
        revenue,
        kpi("cost", "balp[60%]", 3),
        kpi("margin_pct", "margin / revenue", 4).with_type(KpiType::Percentage),
    ];
    template
}

fn march_15(report: &str) -> ReportInstance {
    let mut instance = ReportInstance::new("March 15", report, "root");
    instance.company = "acme".to_string();
    instance.date = Some(date(2024, 3, 15));
    instance
}

fn period(
    name: &str,
    period_type: PeriodType,
    offset: i32,
    duration: i32,
    sequence: i32,
) -> InstancePeriod {
    InstancePeriod {
        sequence,
        ..InstancePeriod::new(name, period_type, offset, duration)
    }
}

fn cell<'s>(section: &'s GridSection, kpi: &str, column: &str) -> &'s GridCell {
    let index = section.column_index(column).unwrap();
    &section.row(kpi).unwrap().cols[index]
}

fn value(section: &GridSection, kpi: &str, column: &str) -> Value {
    cell(section, kpi, column).as_kpi().unwrap().value.clone()
}

#[test]
fn test_day_and_week_periods() {
    let ledger = ledger();
    let library = ReportLibrary::new().with(profit_and_loss());
    let mut instance = march_15("pl");
    instance.periods = vec![
        period("day", PeriodType::Day, 0, 1, 1),
        period("week", PeriodType::Week, 0, 1, 2),
        period("month to date", PeriodType::Day, -14, 15, 3),
    ];

    let sections = compute_report(
        &library,
        &ledger,
        &MemoryStore::new(),
        &EngineSettings::default(),
        &instance,
    )
    .unwrap();
    assert_eq!(sections.len(), 1);
    let section = &sections[0];

    let header = &section.header[0].cols;
    assert_eq!(header[0].date, "03/15/2024");
    assert_eq!(header[1].date, "from 03/11/2024 to 03/17/2024");
    assert_eq!(header[2].date, "from 03/01/2024 to 03/15/2024");

    assert_eq!(value(section, "revenue", "day"), Value::Number(500.0));
    assert_eq!(value(section, "cost", "day"), Value::Number(100.0));
    assert_eq!(value(section, "margin", "day"), Value::Number(400.0));
    assert_eq!(value(section, "revenue", "week"), Value::Number(800.0));
    assert_eq!(value(section, "margin", "week"), Value::Number(500.0));
    assert_eq!(value(section, "revenue", "month to date"), Value::Number(1800.0));

    assert_eq!(cell(section, "revenue", "day").rendered(), shown("_500~"));
    assert_eq!(cell(section, "margin_pct", "day").rendered(), shown("_80~%"));
    assert_eq!(section.row("revenue").unwrap().kpi_name, "Revenue");
    assert_eq!(section.row("margin").unwrap().kpi_name, "margin");
}

#[test]
fn test_target_move_all_includes_draft_entries() {
    let ledger = ledger();
    let library = ReportLibrary::new().with(profit_and_loss());
    let mut instance = march_15("pl");
    instance.target_move = TargetMove::All;
    instance.periods = vec![period("day", PeriodType::Day, 0, 1, 1)];

    let sections = compute_report(
        &library,
        &ledger,
        &MemoryStore::new(),
        &EngineSettings::default(),
        &instance,
    )
    .unwrap();
    assert_eq!(value(&sections[0], "revenue", "day"), Value::Number(1499.0));
}

#[test]
fn test_forward_references_and_per_kpi_failures() {
    let ledger = ledger();
    let mut template = ReportTemplate::new("fx", "Fixpoint");
    template.kpis = vec![
        kpi("doubled", "margin * 2", 1),
        kpi("margin", "revenue - cost", 2),
        kpi("revenue", "-balp[70%]", 3),
        kpi("cost", "balp[60%]", 4),
        kpi("ratio", "revenue / balp[99%]", 5),
        kpi("broken", "unknown_name + 1", 6),
    ];
    let library = ReportLibrary::new().with(template);
    let mut instance = march_15("fx");
    instance.periods = vec![period("day", PeriodType::Day, 0, 1, 1)];

    let sections = compute_report(
        &library,
        &ledger,
        &MemoryStore::new(),
        &EngineSettings::default(),
        &instance,
    )
    .unwrap();
    let section = &sections[0];

    assert_eq!(value(section, "doubled", "day"), Value::Number(800.0));

    let ratio = cell(section, "ratio", "day").as_kpi().unwrap();
    assert_eq!(ratio.rendered, DIVISION_BY_ZERO);
    assert_eq!(ratio.value, Value::None);

    let broken = cell(section, "broken", "day").as_kpi().unwrap();
    assert_eq!(broken.rendered, EVALUATION_ERROR);
    assert!(broken.comment.starts_with("broken = unknown_name + 1"));
    assert!(broken.comment.contains("unknown_name"));
}

#[test]
fn test_comparison_columns_use_normalize_factors() {
    let ledger = ledger();
    let mut template = profit_and_loss();
    for kpi in template.kpis.iter_mut().filter(|k| k.name == "cost") {
        kpi.compare_method = CompareMethod::Difference;
        kpi.decimals = 1;
    }
    let library = ReportLibrary::new().with(template);

    let mut march = period("march", PeriodType::FiscalPeriod, 0, 1, 1);
    march.normalize_factor = 31;
    march.compare_with = vec!["february".to_string()];
    let mut february = period("february", PeriodType::FiscalPeriod, -1, 1, 2);
    february.normalize_factor = 29;
    let mut instance = march_15("pl");
    instance.periods = vec![march, february];

    let sections = compute_report(
        &library,
        &ledger,
        &MemoryStore::new(),
        &EngineSettings::default(),
        &instance,
    )
    .unwrap();
    let section = &sections[0];

    let names: Vec<&str> = section.header[0].cols.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["march", "march vs february", "february"]);
    assert_eq!(section.header[0].cols[0].date, "03/2024");
    assert_eq!(section.header[0].cols[1].date, "");

    // 1800 / 31 days against 1450 / 29 days
    assert_eq!(
        cell(section, "revenue", "march vs february").rendered(),
        shown("_+16~%")
    );
    // 300 / 31 days against 290 / 29 days
    assert_eq!(
        cell(section, "cost", "march vs february").rendered(),
        shown("_-0.3~")
    );
    assert_eq!(value(section, "revenue", "february"), Value::Number(1450.0));
}

#[test]
fn test_matrix_report() {
    let ledger = ledger();
    let mut template = profit_and_loss();
    template.matrix = true;
    let library = ReportLibrary::new().with(template);
    let mut instance = march_15("pl");
    instance.periods = vec![
        period("day", PeriodType::Day, 0, 1, 1),
        period("week", PeriodType::Week, 0, 1, 2),
    ];

    let sections = compute_report(
        &library,
        &ledger,
        &MemoryStore::new(),
        &EngineSettings::default(),
        &instance,
    )
    .unwrap();
    let section = &sections[0];

    let names: Vec<&str> = section.header[0].cols.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["margin", "Revenue", "cost", "margin_pct"]);
    let rows: Vec<&str> = section.content.iter().map(|r| r.kpi_name.as_str()).collect();
    assert_eq!(rows, vec!["day", "week"]);
    assert_eq!(
        section.content[1].cols[1].as_kpi().unwrap().value,
        Value::Number(800.0)
    );
}

#[test]
fn test_manual_grid_cell_matches_computed_result() {
    let ledger = ledger();
    let mut template = ReportTemplate::new("grid", "Dashboard");
    template.kpis = vec![kpi("x", "-balp[70%]", 1), kpi("y", "balp[60%]", 2)];
    template.periods = vec![
        PeriodTemplate {
            name: "P1".to_string(),
            period_type: PeriodType::Day,
            offset: -1,
            duration: 1,
            sequence: 1,
        },
        PeriodTemplate {
            name: "P2".to_string(),
            period_type: PeriodType::Day,
            offset: 0,
            duration: 1,
            sequence: 2,
        },
    ];

    let mut manual = template.clone();
    manual.manual_position = true;
    manual.positions = vec![
        ManualPosition {
            line: 0,
            column: 3,
            name: Some("Today".to_string()),
            kpi: None,
            period: None,
        },
        ManualPosition {
            line: 2,
            column: 0,
            name: Some("Sales".to_string()),
            kpi: None,
            period: None,
        },
        ManualPosition {
            line: 2,
            column: 3,
            name: None,
            kpi: Some("x".to_string()),
            period: Some("P2".to_string()),
        },
        ManualPosition {
            line: 1,
            column: 1,
            name: None,
            kpi: Some("y".to_string()),
            period: Some("P1".to_string()),
        },
    ];

    let settings = EngineSettings::default();
    let store = MemoryStore::new();
    let instance = march_15("grid").with_template_periods(&template);

    let regular = compute_report(
        &ReportLibrary::new().with(template),
        &ledger,
        &store,
        &settings,
        &instance,
    )
    .unwrap();
    let sections = compute_report(
        &ReportLibrary::new().with(manual),
        &ledger,
        &store,
        &settings,
        &instance,
    )
    .unwrap();

    assert_eq!(sections.len(), 1);
    let grid = &sections[0];
    let titles: Vec<&str> = grid.header[0].cols.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(titles, vec!["", "", "Today"]);
    assert_eq!(grid.content.len(), 2);
    assert_eq!(grid.content[1].kpi_name, "Sales");

    // line 2, column 3
    assert_eq!(&grid.content[1].cols[2], cell(&regular[0], "x", "P2"));
    assert_eq!(
        grid.content[1].cols[2].as_kpi().unwrap().value,
        Value::Number(500.0)
    );
    assert_eq!(grid.content[1].cols[0], GridCell::Empty);
    // y has no entries on March 14
    assert_eq!(grid.content[0].cols[0].rendered(), "");
    assert_eq!(grid.content[0].cols[2], GridCell::Empty);
}

fn order_store() -> MemoryStore {
    let mut store = MemoryStore::new();
    store
        .add_field("sale.order", "date_order", FieldKind::Date, true)
        .add_field("sale.order", "amount", FieldKind::Other, true)
        .add_field("sale.order", "state", FieldKind::Other, true);
    for (day, amount, state) in [(15, 900.0, "sale"), (14, 100.0, "sale"), (15, 50.0, "cancel")] {
        let mut record = Record::new();
        record.insert("date_order".to_string(), date(2024, 3, day).into());
        record.insert("amount".to_string(), amount.into());
        record.insert("state".to_string(), state.into());
        store.add_record("sale.order", record);
    }
    store
}

#[test]
fn test_cross_report_references_and_queries() {
    let ledger = ledger();
    let store = order_store();

    let mut sales = ReportTemplate::new("sales", "Sales");
    sales.queries = vec![QueryDefinition {
        name: "orders".to_string(),
        model: "sale.order".to_string(),
        fields: vec!["amount".to_string()],
        aggregate: Some(AggregateKind::Sum),
        date_field: "date_order".to_string(),
        filter: Filter::new().and("state", Operator::Eq, "sale"),
    }];
    sales.kpis = vec![
        kpi("revenue", "-balp[70%]", 1),
        kpi("backlog", "orders.amount", 2),
        kpi("order_count", "orders.count", 3),
    ];

    let mut summary = ReportTemplate::new("summary", "Summary");
    summary.kpis = vec![
        kpi("coverage", "sales.backlog / sales.revenue", 1),
        kpi("direct", "-balp[70%]", 2),
    ];

    let library = ReportLibrary::new().with(sales).with(summary);
    let mut instance = march_15("summary");
    instance.periods = vec![period("day", PeriodType::Day, 0, 1, 1)];

    let sections =
        compute_report(&library, &ledger, &store, &EngineSettings::default(), &instance).unwrap();
    let section = &sections[0];

    let coverage = cell(section, "coverage", "day").as_kpi().unwrap();
    assert_eq!(coverage.value, Value::Number(1.8));
    assert_eq!(coverage.sub_report_ids, vec!["sales".to_string()]);
    assert!(!coverage.drilldown);
    assert!(cell(section, "direct", "day").as_kpi().unwrap().drilldown);

    let mut sales_instance = march_15("sales");
    sales_instance.periods = instance.periods.clone();
    let sections =
        compute_report(&library, &ledger, &store, &EngineSettings::default(), &sales_instance)
            .unwrap();
    assert_eq!(value(&sections[0], "backlog", "day"), Value::Number(900.0));
    assert_eq!(value(&sections[0], "order_count", "day"), Value::Number(1.0));
}

fn line(account: &str, day: u32, debit: f64, credit: f64, state: &str) -> MoveLine {
    MoveLine {
        account: account.to_string(),
        date: date(2024, 3, day),
        debit,
        credit,
        move_state: state.to_string(),
        period: Some("03/2024".to_string()),
        extra: Record::new(),
    }
}

#[test]
fn test_drilldown_filter_selects_contributing_lines() {
    let ledger = ledger();
    let library = ReportLibrary::new().with(profit_and_loss());
    let mut instance = march_15("pl");
    instance.periods = vec![period("day", PeriodType::Day, 0, 1, 1)];

    let formula = "crdp[70%] + balp[600]";
    let drilldown = mis_report_builder::drilldown(
        &library,
        &ledger,
        &MemoryStore::new(),
        &EngineSettings::default(),
        &instance,
        "day",
        formula,
    )
    .unwrap()
    .unwrap();
    assert_eq!(drilldown.caption, "crdp[70%] + balp[600] - day");

    let filter = &drilldown.filter;
    assert!(filter.matches(&line("700", 15, 0.0, 500.0, "posted")));
    assert!(filter.matches(&line("600", 15, 100.0, 0.0, "posted")));
    // debit-only sales lines do not contribute to credit totals
    assert!(!filter.matches(&line("700", 15, 20.0, 0.0, "posted")));
    assert!(!filter.matches(&line("700", 14, 0.0, 500.0, "posted")));
    assert!(!filter.matches(&line("700", 15, 0.0, 999.0, "draft")));
    assert!(!filter.matches(&line("512", 15, 400.0, 0.0, "posted")));

    let none = mis_report_builder::drilldown(
        &library,
        &ledger,
        &MemoryStore::new(),
        &EngineSettings::default(),
        &instance,
        "day",
        "revenue * 2",
    )
    .unwrap();
    assert!(none.is_none());
}

#[test]
fn test_json_definitions_and_locale() -> anyhow::Result<()> {
    let template: ReportTemplate = serde_json::from_str(
        r#"{
            "code": "pl",
            "name": "Profit and loss",
            "kpis": [
                {"name": "revenue", "description": "Revenue", "expression": "-balp[70%]", "decimals": 1},
                {
                    "name": "margin_pct",
                    "expression": "(revenue - balp[60%]) / revenue",
                    "kpi_type": "Percentage",
                    "decimals": 1,
                    "style_expression": "'bold' if margin_pct > 0.5 else None"
                }
            ],
            "periods": [
                {"name": "mtd", "period_type": "Day", "offset": -14, "duration": 15}
            ]
        }"#,
    )?;
    let instance: ReportInstance = serde_json::from_str(
        r#"{
            "name": "March",
            "report": "pl",
            "date": "2024-03-15",
            "root_account": "root",
            "company": "acme",
            "periods": [
                {"name": "mtd", "period_type": "Day", "offset": -14, "duration": 15}
            ]
        }"#,
    )?;
    let settings = EngineSettings::from_json_str(
        r#"{
            "locale": {
                "code": "fr_BE",
                "decimal_point": ",",
                "thousands_separator": ".",
                "date_format": "%d/%m/%Y"
            },
            "utc_offset_minutes": 60
        }"#,
    )?;

    let ledger = ledger();
    let library = ReportLibrary::new().with(template);
    let sections = compute_report(&library, &ledger, &MemoryStore::new(), &settings, &instance)?;
    let section = &sections[0];

    assert_eq!(section.header[0].cols[0].date, "from 01/03/2024 to 15/03/2024");
    assert_eq!(cell(section, "revenue", "mtd").rendered(), shown("_1.800,0~"));
    let margin = cell(section, "margin_pct", "mtd").as_kpi().unwrap();
    assert_eq!(margin.rendered, shown("_83,3~%"));
    assert_eq!(margin.style.as_deref(), Some("bold"));
    assert!(margin.is_percentage);

    let json = serde_json::to_value(&sections)?;
    let first = &json[0]["content"][0]["cols"][0];
    assert_eq!(first["val"], serde_json::json!(1800.0));
    assert_eq!(first["kpi"], "revenue");
    assert_eq!(first["dp"], 1);

    let schema = ReportTemplate::schema_as_json()?;
    assert!(schema.contains("KpiDefinition"));
    assert!(schema.contains("ManualPosition"));
    Ok(())
}

#[test]
fn test_out_of_range_fiscal_period_is_skipped() {
    let ledger = ledger();
    let library = ReportLibrary::new().with(profit_and_loss());
    let mut instance = march_15("pl");
    instance.date = Some(date(2024, 1, 10));
    instance.periods = vec![
        period("current", PeriodType::FiscalPeriod, 0, 1, 1),
        period("previous", PeriodType::FiscalPeriod, -1, 1, 2),
    ];
    instance.periods[0].compare_with = vec!["previous".to_string()];

    let sections = compute_report(
        &library,
        &ledger,
        &MemoryStore::new(),
        &EngineSettings::default(),
        &instance,
    )
    .unwrap();
    let names: Vec<&str> = sections[0].header[0].cols.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["current"]);
    assert_eq!(value(&sections[0], "revenue", "current"), Value::None);
}

#[test]
fn test_definition_errors_are_reported() {
    let ledger = ledger();
    let store = MemoryStore::new();
    let settings = EngineSettings::default();

    let mut summary = ReportTemplate::new("summary", "Summary");
    summary.kpis = vec![kpi("x", "pl.profit", 1)];
    let library = ReportLibrary::new().with(profit_and_loss()).with(summary);
    let mut instance = march_15("summary");
    instance.periods = vec![period("day", PeriodType::Day, 0, 1, 1)];
    assert!(matches!(
        compute_report(&library, &ledger, &store, &settings, &instance),
        Err(ReportError::MissingSubReportKpi { .. })
    ));

    let mut template = profit_and_loss();
    template.manual_position = true;
    template.positions = vec![ManualPosition {
        line: 1,
        column: -3,
        name: None,
        kpi: None,
        period: None,
    }];
    let library = ReportLibrary::new().with(template);
    let mut instance = march_15("pl");
    instance.periods = vec![period("day", PeriodType::Day, 0, 1, 1)];
    assert!(matches!(
        compute_report(&library, &ledger, &store, &settings, &instance),
        Err(ReportError::InvalidPosition { line: 1, column: -3 })
    ));

    let mut template = profit_and_loss();
    template.kpis.push(kpi("broken", "bal[700-600]", 9));
    let library = ReportLibrary::new().with(template);
    assert!(matches!(
        compute_report(&library, &ledger, &store, &settings, &instance),
        Err(ReportError::Compilation { .. })
    ));

    let mut instance = march_15("pl");
    let mut day = period("day", PeriodType::Day, 0, 1, 1);
    day.compare_with = vec!["missing".to_string()];
    instance.periods = vec![day];
    let library = ReportLibrary::new().with(profit_and_loss());
    assert!(matches!(
        compute_report(&library, &ledger, &store, &settings, &instance),
        Err(ReportError::UnknownPeriod(_))
    ));
}
