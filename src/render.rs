//! Display strings for KPI values and period comparisons.

use crate::schema::{CompareMethod, KpiDefinition, KpiType};
use crate::settings::Locale;
use crate::value::Value;

const NARROW_NO_BREAK_SPACE: char = '\u{202F}';
const NO_BREAK_SPACE: char = '\u{00A0}';
const NON_BREAKING_HYPHEN: char = '\u{2011}';

fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    let rounded = (value * factor).round() / factor;
    if rounded == 0.0 {
        0.0
    } else {
        rounded
    }
}

fn group_digits(digits: &str, separator: &str, grouping: usize) -> String {
    if grouping == 0 || digits.len() <= grouping {
        return digits.to_string();
    }
    let mut grouped =
        String::with_capacity(digits.len() + digits.len() / grouping * separator.len());
    let head = digits.len() % grouping;
    if head > 0 {
        grouped.push_str(&digits[..head]);
    }
    for (i, chunk) in digits.as_bytes()[head..].chunks(grouping).enumerate() {
        if head > 0 || i > 0 {
            grouped.push_str(separator);
        }
        grouped.extend(chunk.iter().map(|b| *b as char));
    }
    grouped
}

/// Formats `value` with `decimals` decimals and the locale's separators.
/// With `explicit_sign`, positive values get a leading `+`.
pub fn format_number(value: f64, decimals: u32, locale: &Locale, explicit_sign: bool) -> String {
    let rounded = round_to(value, decimals);
    let text = format!("{:.*}", decimals as usize, rounded.abs());
    let (integer, fraction) = match text.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (text.as_str(), None),
    };

    let mut formatted = String::new();
    if rounded < 0.0 {
        formatted.push('-');
    } else if explicit_sign {
        formatted.push('+');
    }
    formatted.push_str(&group_digits(integer, &locale.thousands_separator, locale.grouping));
    if let Some(fraction) = fraction {
        formatted.push_str(&locale.decimal_point);
        formatted.push_str(fraction);
    }
    formatted
}

struct NumberStyle<'a> {
    divider: f64,
    divider_label: &'a str,
    decimals: u32,
    prefix: &'a str,
    suffix: &'a str,
}

impl NumberStyle<'_> {
    fn render(&self, value: f64, locale: &Locale, explicit_sign: bool) -> String {
        let number = format_number(value / self.divider, self.decimals, locale, explicit_sign);
        format!(
            "{}{}{}{}{}{}",
            self.prefix,
            NARROW_NO_BREAK_SPACE,
            number,
            NO_BREAK_SPACE,
            self.divider_label,
            self.suffix
        )
        .replace('-', &NON_BREAKING_HYPHEN.to_string())
    }

    /// Whether `value` shows as zero once scaled and rounded.
    fn is_zero(&self, value: f64) -> bool {
        round_to(value / self.divider, self.decimals) == 0.0
    }
}

fn kpi_style(kpi: &KpiDefinition) -> NumberStyle<'_> {
    NumberStyle {
        divider: kpi.divider.factor(),
        divider_label: kpi.divider.label(),
        decimals: kpi.decimals,
        prefix: kpi.prefix.as_deref().unwrap_or(""),
        suffix: kpi.suffix.as_deref().unwrap_or(""),
    }
}

fn percent_style(decimals: u32, suffix: &str) -> NumberStyle<'_> {
    NumberStyle {
        divider: 0.01,
        divider_label: "",
        decimals,
        prefix: "",
        suffix,
    }
}

/// Renders a KPI value. "No data" renders as an empty string.
pub fn render(kpi: &KpiDefinition, value: &Value, locale: &Locale) -> String {
    if value.is_none() {
        return String::new();
    }
    let number = match value {
        Value::Number(n) => *n,
        other => return other.to_string(),
    };
    match kpi.kpi_type {
        KpiType::Numeric => kpi_style(kpi).render(number, locale, false),
        KpiType::Percentage => percent_style(kpi.decimals, "%").render(number, locale, false),
        KpiType::Text => value.to_string(),
    }
}

/// Renders the change from `base` to `value`, each first divided by its
/// period's normalize factor. Returns an empty string when either side has
/// no data or the change rounds to zero.
pub fn render_comparison(
    kpi: &KpiDefinition,
    value: &Value,
    base: &Value,
    normalize_factor: u32,
    base_normalize_factor: u32,
    locale: &Locale,
) -> String {
    let (Value::Number(value), Value::Number(base)) = (value, base) else {
        return String::new();
    };

    match kpi.kpi_type {
        KpiType::Percentage => {
            let delta = value - base;
            let style = percent_style(kpi.decimals, "pp");
            if style.is_zero(delta) {
                return String::new();
            }
            style.render(delta, locale, true)
        }
        KpiType::Numeric => {
            let value = value / f64::from(normalize_factor.max(1));
            let base = base / f64::from(base_normalize_factor.max(1));
            match kpi.compare_method {
                CompareMethod::Difference => {
                    let delta = value - base;
                    let style = kpi_style(kpi);
                    if style.is_zero(delta) {
                        return String::new();
                    }
                    style.render(delta, locale, true)
                }
                CompareMethod::Percentage => {
                    if round_to(base, kpi.decimals) == 0.0 {
                        return String::new();
                    }
                    let delta = (value - base) / base.abs();
                    let style = percent_style(kpi.decimals, "%");
                    if style.is_zero(delta) {
                        return String::new();
                    }
                    style.render(delta, locale, true)
                }
                CompareMethod::Disabled => String::new(),
            }
        }
        KpiType::Text => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Divider;

    fn nbsp(text: &str) -> String {
        text.replace('_', &NARROW_NO_BREAK_SPACE.to_string())
            .replace('~', &NO_BREAK_SPACE.to_string())
            .replace('-', &NON_BREAKING_HYPHEN.to_string())
    }

    #[test]
    fn test_format_number() {
        let locale = Locale::default();
        assert_eq!(format_number(1234567.891, 2, &locale, false), "1,234,567.89");
        assert_eq!(format_number(-999.5, 0, &locale, false), "-1,000");
        assert_eq!(format_number(-0.004, 2, &locale, false), "0.00");
        assert_eq!(format_number(12.0, 0, &locale, true), "+12");
        assert_eq!(format_number(123456.0, 0, &locale, false), "123,456");

        let belgian = Locale {
            decimal_point: ",".to_string(),
            thousands_separator: ".".to_string(),
            ..Locale::default()
        };
        assert_eq!(format_number(1234.5, 1, &belgian, false), "1.234,5");
    }

    #[test]
    fn test_render_numeric() {
        let locale = Locale::default();
        let mut kpi = KpiDefinition::new("revenue", "bal[70%]");
        kpi.divider = Divider::Thousand;
        kpi.decimals = 1;
        kpi.prefix = Some("€".to_string());

        let first = render(&kpi, &Value::Number(-12345.0), &locale);
        assert_eq!(first, nbsp("€_-12.3~k"));
        // identical input, identical output
        assert_eq!(render(&kpi, &Value::Number(-12345.0), &locale), first);
        assert_eq!(render(&kpi, &Value::None, &locale), "");
    }

    #[test]
    fn test_render_percentage_and_text() {
        let locale = Locale::default();
        let mut kpi = KpiDefinition::new("margin", "a / b").with_type(KpiType::Percentage);
        kpi.decimals = 1;
        assert_eq!(render(&kpi, &Value::Number(0.1234), &locale), nbsp("_12.3~%"));

        let kpi = KpiDefinition::new("label", "'ok'").with_type(KpiType::Text);
        assert_eq!(render(&kpi, &Value::Text("ok".to_string()), &locale), "ok");
    }

    #[test]
    fn test_comparison_of_equal_or_missing_values_is_empty() {
        let locale = Locale::default();
        let kpi = KpiDefinition::new("revenue", "bal[70%]");
        assert_eq!(
            render_comparison(&kpi, &Value::Number(100.2), &Value::Number(100.0), 1, 1, &locale),
            ""
        );
        assert_eq!(
            render_comparison(&kpi, &Value::None, &Value::Number(100.0), 1, 1, &locale),
            ""
        );
        assert_eq!(
            render_comparison(&kpi, &Value::Number(100.0), &Value::None, 1, 1, &locale),
            ""
        );
        assert_eq!(
            render_comparison(&kpi, &Value::Number(5.0), &Value::Number(0.0), 1, 1, &locale),
            ""
        );
    }

    #[test]
    fn test_comparison_methods() {
        let locale = Locale::default();

        let kpi = KpiDefinition::new("revenue", "bal[70%]");
        assert_eq!(
            render_comparison(&kpi, &Value::Number(150.0), &Value::Number(100.0), 1, 1, &locale),
            nbsp("_+50~%")
        );

        let mut kpi = KpiDefinition::new("revenue", "bal[70%]");
        kpi.compare_method = CompareMethod::Difference;
        assert_eq!(
            render_comparison(&kpi, &Value::Number(80.0), &Value::Number(100.0), 1, 1, &locale),
            nbsp("_-20~")
        );
        // per-day averages: 310 over 31 days against 280 over 28 days
        assert_eq!(
            render_comparison(&kpi, &Value::Number(310.0), &Value::Number(280.0), 31, 28, &locale),
            ""
        );

        let kpi = KpiDefinition::new("margin", "a / b").with_type(KpiType::Percentage);
        assert_eq!(
            render_comparison(&kpi, &Value::Number(0.25), &Value::Number(0.2), 1, 1, &locale),
            nbsp("_+5~pp")
        );

        let kpi = KpiDefinition::new("label", "'x'").with_type(KpiType::Text);
        assert_eq!(
            render_comparison(&kpi, &Value::Number(2.0), &Value::Number(1.0), 1, 1, &locale),
            ""
        );
    }
}
