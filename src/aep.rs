//! Accounting expression processor.
//!
//! KPI formulas embed account tokens such as `balp[70%]`, `crdi[400-409]`
//! or `bal_512[journal = 'BNK']`. The processor collects every distinct
//! token of a report, resolves its selectors against the chart of accounts
//! once, and computes all balances of a period with one ledger aggregation
//! per distinct (mode, inline filter) combination.
//!
//! Tokens are replaced in formulas by private `__acc_<n>` names, bound in the
//! evaluation scope by [`Balances::bind`].

use crate::chart_of_accounts::AccountSelector;
use crate::error::{ReportError, Result};
use crate::expr::Scope;
use crate::filter::{Condition, FieldValue, Filter, Operator};
use crate::ledger::{fields, AccountTotals, Ledger, POSTED};
use crate::period::ResolvedPeriod;
use crate::schema::TargetMove;
use crate::value::Value;
use log::{debug, warn};
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceField {
    /// debit - credit
    Balance,
    Credit,
    Debit,
}

impl BalanceField {
    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "bal" => Some(BalanceField::Balance),
            "crd" => Some(BalanceField::Credit),
            "deb" => Some(BalanceField::Debit),
            _ => None,
        }
    }

    fn amount(&self, totals: &AccountTotals) -> f64 {
        match self {
            BalanceField::Balance => totals.debit - totals.credit,
            BalanceField::Credit => totals.credit,
            BalanceField::Debit => totals.debit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Mode {
    /// Lines of the period.
    Variation,
    /// Lines before the period.
    Initial,
    /// Lines up to the end of the period.
    Ending,
}

impl Mode {
    fn from_suffix(suffix: char) -> Option<Self> {
        match suffix {
            'p' => Some(Mode::Variation),
            'i' => Some(Mode::Initial),
            'e' => Some(Mode::Ending),
            _ => None,
        }
    }

    fn line_filter(&self, period: &ResolvedPeriod) -> Filter {
        match self {
            Mode::Variation => match &period.fiscal {
                Some(span) => Filter::new().and(fields::PERIOD, Operator::In, span.periods.clone()),
                None => Filter::new()
                    .and(fields::DATE, Operator::Ge, period.date_from)
                    .and(fields::DATE, Operator::Le, period.date_to),
            },
            Mode::Initial => Filter::new().and(fields::DATE, Operator::Lt, period.date_from),
            Mode::Ending => Filter::new().and(fields::DATE, Operator::Le, period.date_to),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct AccountToken {
    text: String,
    field: BalanceField,
    mode: Mode,
    selectors: Vec<AccountSelector>,
    inline_filter: Filter,
}

/// A token found in a formula, with its byte span.
#[derive(Debug, Clone)]
struct TokenMatch {
    start: usize,
    end: usize,
    token: AccountToken,
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn malformed(token: &str, details: impl Into<String>) -> ReportError {
    ReportError::Compilation {
        token: token.to_string(),
        details: details.into(),
    }
}

/// Splits `balp_700` / `crd` / `debe` into field, mode and short-form code.
fn split_head(word: &str) -> Option<(BalanceField, Mode, Option<&str>)> {
    if word.len() < 3 || !word.is_char_boundary(3) {
        return None;
    }
    let field = BalanceField::from_prefix(&word[..3])?;
    let rest = &word[3..];

    let (mode, rest) = match rest.chars().next() {
        None => return Some((field, Mode::Variation, None)),
        Some('_') => (Mode::Variation, rest),
        Some(c) => (Mode::from_suffix(c)?, &rest[1..]),
    };

    if rest.is_empty() {
        return Some((field, mode, None));
    }
    let code = rest.strip_prefix('_')?;
    if code.starts_with(|c: char| c.is_ascii_digit()) {
        Some((field, mode, Some(code)))
    } else {
        None
    }
}

/// Index of the `]` closing the bracket opened at `open`, skipping quoted text.
fn closing_bracket(chars: &[(usize, char)], open: usize) -> Option<usize> {
    let mut quote: Option<char> = None;
    let mut i = open + 1;
    while i < chars.len() {
        let c = chars[i].1;
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' => quote = Some(c),
            None if c == ']' => return Some(i),
            None if c == '[' => return None,
            None => {}
        }
        i += 1;
    }
    None
}

fn is_code(code: &str) -> bool {
    !code.is_empty() && code.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_selectors(token: &str, content: &str) -> Result<Vec<AccountSelector>> {
    if content.trim().is_empty() {
        return Ok(vec![AccountSelector::All]);
    }

    let mut selectors = Vec::new();
    for item in content.split(',') {
        let item = item.trim();
        if item.is_empty() {
            return Err(malformed(token, "empty account selector"));
        }

        let range = item
            .split_once("..")
            .or_else(|| item.split_once('-'))
            .map(|(from, to)| (from.trim(), to.trim()));

        let selector = match range {
            Some((from, to)) => {
                if !is_code(from) || !is_code(to) {
                    return Err(malformed(token, format!("invalid account range '{}'", item)));
                }
                let selector = AccountSelector::Range {
                    from: from.to_string(),
                    to: to.to_string(),
                };
                if !selector.is_well_formed() {
                    return Err(malformed(
                        token,
                        format!("range '{}' starts after it ends", item),
                    ));
                }
                selector
            }
            None if item.contains('%') => {
                if !item.chars().all(|c| c == '%' || c.is_ascii_alphanumeric() || c == '_') {
                    return Err(malformed(token, format!("invalid account pattern '{}'", item)));
                }
                AccountSelector::Pattern(item.to_string())
            }
            None => {
                if !is_code(item) {
                    return Err(malformed(token, format!("invalid account code '{}'", item)));
                }
                AccountSelector::Code(item.to_string())
            }
        };
        selectors.push(selector);
    }
    Ok(selectors)
}

/// Splits on commas outside quotes.
fn split_items(content: &str) -> Vec<&str> {
    let mut items = Vec::new();
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in content.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' => quote = Some(c),
            None if c == ',' => {
                items.push(&content[start..i]);
                start = i + 1;
            }
            None => {}
        }
    }
    items.push(&content[start..]);
    items
}

fn parse_filter_value(token: &str, text: &str) -> Result<FieldValue> {
    let text = text.trim();
    let quoted = text.len() >= 2
        && ((text.starts_with('\'') && text.ends_with('\''))
            || (text.starts_with('"') && text.ends_with('"')));
    if quoted {
        return Ok(FieldValue::Text(text[1..text.len() - 1].to_string()));
    }
    match text {
        "true" | "True" => return Ok(FieldValue::Bool(true)),
        "false" | "False" => return Ok(FieldValue::Bool(false)),
        _ => {}
    }
    text.parse::<f64>()
        .map(FieldValue::Number)
        .map_err(|_| malformed(token, format!("invalid filter value '{}'", text)))
}

fn parse_inline_filter(token: &str, content: &str) -> Result<Filter> {
    let mut filter = Filter::new();
    if content.trim().is_empty() {
        return Ok(filter);
    }

    for item in split_items(content) {
        let item = item.trim();
        let field_end = item
            .find(|c: char| !is_ident_char(c))
            .unwrap_or(item.len());
        let field = &item[..field_end];
        if field.is_empty() || !field.starts_with(is_ident_start) {
            return Err(malformed(token, format!("invalid filter item '{}'", item)));
        }

        let rest = item[field_end..].trim_start();
        let (op, value) = [
            ("==", Operator::Eq),
            ("!=", Operator::Ne),
            ("<=", Operator::Le),
            (">=", Operator::Ge),
            ("=", Operator::Eq),
            ("<", Operator::Lt),
            (">", Operator::Gt),
        ]
        .iter()
        .find_map(|(symbol, op)| rest.strip_prefix(symbol).map(|v| (*op, v)))
        .ok_or_else(|| malformed(token, format!("missing operator in '{}'", item)))?;

        filter.push(Condition::field(field, op, parse_filter_value(token, value)?));
    }
    Ok(filter)
}

/// Finds every account token in `formula`. Quoted text is skipped.
fn scan(formula: &str) -> Result<Vec<TokenMatch>> {
    let chars: Vec<(usize, char)> = formula.char_indices().collect();
    let offset = |i: usize| chars.get(i).map_or(formula.len(), |(o, _)| *o);

    let mut matches = Vec::new();
    let mut quote: Option<char> = None;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i].1;

        if let Some(q) = quote {
            if c == '\\' {
                i += 2;
                continue;
            }
            if c == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        if c == '\'' || c == '"' {
            quote = Some(c);
            i += 1;
            continue;
        }

        let at_boundary = i == 0 || {
            let prev = chars[i - 1].1;
            !(is_ident_char(prev) || prev == '.')
        };
        if !at_boundary || !is_ident_start(c) {
            i += 1;
            continue;
        }

        let start = i;
        let mut end = i;
        while end < chars.len() && is_ident_char(chars[end].1) {
            end += 1;
        }
        let word = &formula[offset(start)..offset(end)];

        let Some((field, mode, short_code)) = split_head(word) else {
            i = end;
            continue;
        };

        let next_is_bracket = chars.get(end).map(|(_, c)| *c) == Some('[');
        let selectors;
        let mut cursor = end;
        match short_code {
            Some(code) => {
                if !is_code(code) {
                    return Err(malformed(word, format!("invalid account code '{}'", code)));
                }
                selectors = vec![AccountSelector::Code(code.to_string())];
            }
            None if next_is_bracket => {
                let close = closing_bracket(&chars, end)
                    .ok_or_else(|| malformed(&formula[offset(start)..], "unbalanced brackets"))?;
                let text = &formula[offset(start)..offset(close + 1)];
                selectors = parse_selectors(text, &formula[offset(end + 1)..offset(close)])?;
                cursor = close + 1;
            }
            // a plain name such as `bal` or `debe`
            None => {
                i = end;
                continue;
            }
        }

        let mut inline_filter = Filter::new();
        if chars.get(cursor).map(|(_, c)| *c) == Some('[') {
            let close = closing_bracket(&chars, cursor)
                .ok_or_else(|| malformed(&formula[offset(start)..], "unbalanced brackets"))?;
            let text = &formula[offset(start)..offset(close + 1)];
            inline_filter = parse_inline_filter(text, &formula[offset(cursor + 1)..offset(close)])?;
            cursor = close + 1;
        }

        let (byte_start, byte_end) = (offset(start), offset(cursor));
        matches.push(TokenMatch {
            start: byte_start,
            end: byte_end,
            token: AccountToken {
                text: formula[byte_start..byte_end].to_string(),
                field,
                mode,
                selectors,
                inline_filter,
            },
        });
        i = cursor;
    }

    Ok(matches)
}

/// Account balances of one period, indexed like the processor's tokens.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Balances {
    values: Vec<Option<f64>>,
}

impl Balances {
    pub fn get(&self, index: usize) -> Option<f64> {
        self.values.get(index).copied().flatten()
    }

    pub fn bind(&self, scope: &mut Scope) {
        for (index, value) in self.values.iter().enumerate() {
            scope.insert(token_identifier(index), Value::from(*value));
        }
    }
}

fn token_identifier(index: usize) -> String {
    format!("__acc_{}", index)
}

#[derive(Debug, Clone, Default)]
pub struct AccountingExpressionProcessor {
    tokens: Vec<AccountToken>,
    index_by_text: HashMap<String, usize>,
    accounts: Vec<BTreeSet<String>>,
    finalized: bool,
}

impl AccountingExpressionProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `formula` contains at least one account token.
    pub fn has_account_reference(formula: &str) -> bool {
        scan(formula).map(|m| !m.is_empty()).unwrap_or(false)
    }

    /// Registers the account tokens of `formula`.
    pub fn parse(&mut self, formula: &str) -> Result<()> {
        for found in scan(formula)? {
            if !self.index_by_text.contains_key(&found.token.text) {
                self.index_by_text
                    .insert(found.token.text.clone(), self.tokens.len());
                self.tokens.push(found.token);
                self.finalized = false;
            }
        }
        Ok(())
    }

    /// Resolves the selectors of every registered token against the chart
    /// of accounts below `root_account`.
    pub fn finalize(&mut self, ledger: &dyn Ledger, root_account: &str) -> Result<()> {
        let chart = ledger.accounts_under(root_account)?;
        self.accounts = self
            .tokens
            .iter()
            .map(|token| {
                let codes = chart.select(&token.selectors);
                if codes.is_empty() {
                    warn!(
                        "Account token '{}' matches no account under '{}'",
                        token.text, root_account
                    );
                }
                codes
            })
            .collect();
        self.finalized = true;
        Ok(())
    }

    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    fn ensure_finalized(&self) -> Result<()> {
        if self.finalized {
            Ok(())
        } else {
            Err(malformed("", "account tokens were registered after finalize"))
        }
    }

    fn common_filter(target_move: TargetMove, extra_filter: &Filter) -> Filter {
        let mut filter = Filter::new();
        if target_move == TargetMove::Posted {
            filter.push(Condition::field(fields::MOVE_STATE, Operator::Eq, POSTED));
        }
        filter.extend(extra_filter);
        filter
    }

    /// Computes the balance of every token for one period, issuing one
    /// ledger aggregation per distinct (mode, inline filter) pair.
    pub fn compute_balances(
        &self,
        ledger: &dyn Ledger,
        period: &ResolvedPeriod,
        target_move: TargetMove,
        extra_filter: &Filter,
    ) -> Result<Balances> {
        self.ensure_finalized()?;

        let mut groups: Vec<((Mode, &Filter), Vec<usize>)> = Vec::new();
        for (index, token) in self.tokens.iter().enumerate() {
            if self.accounts[index].is_empty() {
                continue;
            }
            let key = (token.mode, &token.inline_filter);
            match groups.iter_mut().find(|(k, _)| *k == key) {
                Some((_, members)) => members.push(index),
                None => groups.push((key, vec![index])),
            }
        }

        let common = Self::common_filter(target_move, extra_filter);
        let mut values = vec![None; self.tokens.len()];

        for ((mode, inline_filter), members) in groups {
            let codes: BTreeSet<&String> = members
                .iter()
                .flat_map(|i| &self.accounts[*i])
                .collect();
            let mut filter = mode.line_filter(period);
            filter.push(Condition::field(
                fields::ACCOUNT,
                Operator::In,
                codes.into_iter().cloned().collect::<Vec<_>>(),
            ));
            filter.extend(inline_filter);
            filter.extend(&common);

            debug!(
                "Aggregating move lines for {} account token(s), mode {:?}",
                members.len(),
                mode
            );
            let totals: BTreeMap<String, AccountTotals> = ledger
                .sum_move_lines(&filter)?
                .into_iter()
                .map(|t| (t.account.clone(), t))
                .collect();

            for index in members {
                let token = &self.tokens[index];
                values[index] = self.accounts[index]
                    .iter()
                    .filter_map(|code| totals.get(code))
                    .map(|t| token.field.amount(t))
                    .fold(None, |acc: Option<f64>, amount| Some(acc.unwrap_or(0.0) + amount));
            }
        }

        Ok(Balances { values })
    }

    /// Replaces every account token of `formula` by the name its balance is
    /// bound to.
    pub fn substitute(&self, formula: &str) -> Result<String> {
        let mut output = String::with_capacity(formula.len());
        let mut last = 0;
        for found in scan(formula)? {
            let index = self
                .index_by_text
                .get(&found.token.text)
                .ok_or_else(|| malformed(&found.token.text, "account token was not registered"))?;
            output.push_str(&formula[last..found.start]);
            output.push_str(&token_identifier(*index));
            last = found.end;
        }
        output.push_str(&formula[last..]);
        Ok(output)
    }

    /// Filter selecting the move lines that contribute to the account
    /// tokens of `formula`, or `None` when it has no account token.
    pub fn drilldown_filter(
        &self,
        formula: &str,
        period: &ResolvedPeriod,
        target_move: TargetMove,
        extra_filter: &Filter,
    ) -> Result<Option<Filter>> {
        self.ensure_finalized()?;

        let mut alternatives: Vec<Filter> = Vec::new();
        for found in scan(formula)? {
            let index = *self
                .index_by_text
                .get(&found.token.text)
                .ok_or_else(|| malformed(&found.token.text, "account token was not registered"))?;
            let token = &self.tokens[index];

            let mut filter = token.mode.line_filter(period);
            filter.push(Condition::field(
                fields::ACCOUNT,
                Operator::In,
                self.accounts[index].iter().cloned().collect::<Vec<_>>(),
            ));
            match token.field {
                BalanceField::Credit => {
                    filter.push(Condition::field(fields::CREDIT, Operator::Ne, 0.0))
                }
                BalanceField::Debit => {
                    filter.push(Condition::field(fields::DEBIT, Operator::Ne, 0.0))
                }
                BalanceField::Balance => {}
            }
            filter.extend(&token.inline_filter);

            if !alternatives.contains(&filter) {
                alternatives.push(filter);
            }
        }

        let mut filter = match alternatives.len() {
            0 => return Ok(None),
            1 => alternatives.remove(0),
            _ => Filter::any_of(alternatives),
        };
        filter.extend(&Self::common_filter(target_move, extra_filter));
        Ok(Some(filter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::eval;
    use crate::memory::MemoryLedger;
    use chrono::NaiveDate;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn ledger() -> MemoryLedger {
        let mut ledger = MemoryLedger::new();
        ledger
            .add_account("root", "Chart", None)
            .add_account("512", "Bank", Some("root"))
            .add_account("600", "Purchases", Some("root"))
            .add_account("700", "Sales", Some("root"))
            .add_account("708", "Other sales", Some("root"));
        ledger
            .post("512", date(2023, 12, 31), 1000.0)
            .post("700", date(2024, 3, 1), -100.0)
            .post("708", date(2024, 3, 5), -20.0)
            .post("512", date(2024, 3, 5), 120.0)
            .post("600", date(2024, 3, 7), 30.0)
            .post("512", date(2024, 3, 7), -30.0)
            .add_draft("700", date(2024, 3, 8), -500.0);
        ledger
    }

    fn march() -> ResolvedPeriod {
        ResolvedPeriod {
            date_from: date(2024, 3, 1),
            date_to: date(2024, 3, 31),
            fiscal: None,
        }
    }

    #[test]
    fn test_split_head() {
        assert_eq!(split_head("bal"), Some((BalanceField::Balance, Mode::Variation, None)));
        assert_eq!(split_head("crdi"), Some((BalanceField::Credit, Mode::Initial, None)));
        assert_eq!(
            split_head("debe_512"),
            Some((BalanceField::Debit, Mode::Ending, Some("512")))
        );
        assert_eq!(
            split_head("bal_700"),
            Some((BalanceField::Balance, Mode::Variation, Some("700")))
        );
        assert_eq!(split_head("balance"), None);
        assert_eq!(split_head("bal_total"), None);
        assert_eq!(split_head("revenue"), None);
    }

    #[test]
    fn test_scan_finds_tokens_outside_strings() {
        let found = scan("balp[70%] - bal_600 + 'bal[1]' + so.bal_700 + balance").unwrap();
        let texts: Vec<&str> = found.iter().map(|m| m.token.text.as_str()).collect();
        assert_eq!(texts, vec!["balp[70%]", "bal_600"]);

        let found = scan("crd[700-708, 512][journal = 'BNK', amount >= 10]").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].token.selectors.len(), 2);
        assert_eq!(found[0].token.inline_filter.conditions.len(), 2);
    }

    #[test]
    fn test_malformed_tokens() {
        assert!(matches!(scan("bal[700"), Err(ReportError::Compilation { .. })));
        assert!(matches!(scan("bal[708-700]"), Err(ReportError::Compilation { .. })));
        assert!(matches!(scan("bal[700,,708]"), Err(ReportError::Compilation { .. })));
        assert!(matches!(scan("bal[7$0]"), Err(ReportError::Compilation { .. })));
        assert!(matches!(scan("bal[700][journal ~ 1]"), Err(ReportError::Compilation { .. })));
    }

    #[test]
    fn test_balances_are_batched() {
        let ledger = ledger();
        let mut aep = AccountingExpressionProcessor::new();
        aep.parse("-balp[700-708]").unwrap();
        aep.parse("balp[600] + bal[700]").unwrap();
        aep.parse("bale[512] - bali[512]").unwrap();
        aep.parse("balp[700-708]").unwrap();
        aep.finalize(&ledger, "root").unwrap();
        assert_eq!(aep.token_count(), 5);

        let balances = aep
            .compute_balances(&ledger, &march(), TargetMove::Posted, &Filter::new())
            .unwrap();
        // variation, initial and ending
        assert_eq!(ledger.aggregation_count(), 3);

        let mut scope = Scope::new();
        balances.bind(&mut scope);
        let value = |formula: &str| eval(&aep.substitute(formula).unwrap(), &scope).unwrap();

        assert_eq!(value("-balp[700-708]"), Value::Number(120.0));
        assert_eq!(value("balp[600] + bal[700]"), Value::Number(-70.0));
        assert_eq!(value("bale[512] - bali[512]"), Value::Number(90.0));
    }

    #[test]
    fn test_target_move_and_no_data() {
        let ledger = ledger();
        let mut aep = AccountingExpressionProcessor::new();
        aep.parse("bal[700]").unwrap();
        aep.parse("bal[999]").unwrap();
        aep.finalize(&ledger, "root").unwrap();

        let posted = aep
            .compute_balances(&ledger, &march(), TargetMove::Posted, &Filter::new())
            .unwrap();
        assert_eq!(posted.get(0), Some(-100.0));
        assert_eq!(posted.get(1), None);

        let all = aep
            .compute_balances(&ledger, &march(), TargetMove::All, &Filter::new())
            .unwrap();
        assert_eq!(all.get(0), Some(-600.0));

        let february = ResolvedPeriod {
            date_from: date(2024, 2, 1),
            date_to: date(2024, 2, 29),
            fiscal: None,
        };
        let empty = aep
            .compute_balances(&ledger, &february, TargetMove::Posted, &Filter::new())
            .unwrap();
        assert_eq!(empty.get(0), None);
    }

    #[test]
    fn test_substitute_requires_registration() {
        let aep = AccountingExpressionProcessor::new();
        assert_eq!(aep.substitute("revenue * 2").unwrap(), "revenue * 2");
        assert!(aep.substitute("bal[700]").is_err());
    }

    #[test]
    fn test_drilldown_filter() {
        let ledger = ledger();
        let formula = "crdp[700] + balp[600]";
        let mut aep = AccountingExpressionProcessor::new();
        aep.parse(formula).unwrap();
        aep.finalize(&ledger, "root").unwrap();

        let filter = aep
            .drilldown_filter(formula, &march(), TargetMove::Posted, &Filter::new())
            .unwrap()
            .unwrap();
        assert_eq!(filter.conditions.len(), 2);
        assert!(matches!(filter.conditions[0], Condition::Any { .. }));

        assert!(aep
            .drilldown_filter("revenue / 2", &march(), TargetMove::Posted, &Filter::new())
            .unwrap()
            .is_none());
        assert!(AccountingExpressionProcessor::has_account_reference(formula));
        assert!(!AccountingExpressionProcessor::has_account_reference("revenue / 2"));
    }
}
