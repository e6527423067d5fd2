use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccountEntry {
    pub code: String,
    pub name: String,
    pub parent_code: Option<String>,
}

impl AccountEntry {
    pub fn new(
        code: impl Into<String>,
        name: impl Into<String>,
        parent_code: Option<&str>,
    ) -> Self {
        Self {
            code: code.into(),
            name: name.into(),
            parent_code: parent_code.map(str::to_string),
        }
    }
}

/// One item of an account token's selector list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AccountSelector {
    /// `bal[]`: every account of the chart.
    All,
    Code(String),
    /// `%` matches any run of characters.
    Pattern(String),
    Range { from: String, to: String },
}

/// Numeric codes compare by value, anything else lexicographically.
fn compare_codes(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

fn in_range(code: &str, from: &str, to: &str) -> bool {
    match (code.parse::<u64>(), from.parse::<u64>(), to.parse::<u64>()) {
        (Ok(c), Ok(f), Ok(t)) => f <= c && c <= t,
        _ => from <= code && code <= to,
    }
}

fn matches_pattern(pattern: &str, code: &str) -> bool {
    let parts: Vec<&str> = pattern.split('%').collect();
    if parts.len() == 1 {
        return pattern == code;
    }

    let first = parts[0];
    let last = parts[parts.len() - 1];
    if !code.starts_with(first) || code.len() < first.len() + last.len() || !code.ends_with(last) {
        return false;
    }

    let mut rest = &code[first.len()..code.len() - last.len()];
    for part in &parts[1..parts.len() - 1] {
        match rest.find(part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }
    true
}

impl AccountSelector {
    pub fn matches(&self, code: &str) -> bool {
        match self {
            AccountSelector::All => true,
            AccountSelector::Code(c) => c == code,
            AccountSelector::Pattern(p) => matches_pattern(p, code),
            AccountSelector::Range { from, to } => in_range(code, from, to),
        }
    }

    /// A range is malformed when its lower bound sorts after its upper bound.
    pub fn is_well_formed(&self) -> bool {
        match self {
            AccountSelector::Range { from, to } => compare_codes(from, to) != Ordering::Greater,
            _ => true,
        }
    }
}

/// The accounts below a chart root, root included.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChartOfAccounts {
    pub root_code: String,
    pub accounts: Vec<AccountEntry>,
}

impl ChartOfAccounts {
    /// Keeps `root_code` and every account that descends from it.
    pub fn from_entries(root_code: &str, entries: &[AccountEntry]) -> Self {
        let mut children: BTreeMap<&str, Vec<&AccountEntry>> = BTreeMap::new();
        for entry in entries {
            if let Some(parent) = &entry.parent_code {
                children.entry(parent.as_str()).or_default().push(entry);
            }
        }

        let mut accounts = Vec::new();
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&AccountEntry> =
            entries.iter().filter(|e| e.code == root_code).collect();
        while let Some(entry) = stack.pop() {
            if !seen.insert(entry.code.as_str()) {
                continue;
            }
            accounts.push(entry.clone());
            if let Some(kids) = children.get(entry.code.as_str()) {
                stack.extend(kids.iter().copied());
            }
        }

        accounts.sort_by(|a, b| {
            let key = |code: &str| code.parse::<u64>().map_or((1, 0), |n| (0, n));
            key(&a.code).cmp(&key(&b.code)).then_with(|| a.code.cmp(&b.code))
        });

        Self {
            root_code: root_code.to_string(),
            accounts,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn get(&self, code: &str) -> Option<&AccountEntry> {
        self.accounts.iter().find(|a| a.code == code)
    }

    /// Codes of the accounts matched by at least one selector.
    pub fn select(&self, selectors: &[AccountSelector]) -> BTreeSet<String> {
        self.accounts
            .iter()
            .filter(|a| selectors.iter().any(|s| s.matches(&a.code)))
            .map(|a| a.code.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries() -> Vec<AccountEntry> {
        vec![
            AccountEntry::new("root", "Chart", None),
            AccountEntry::new("6", "Expenses", Some("root")),
            AccountEntry::new("600", "Purchases", Some("6")),
            AccountEntry::new("610", "Services", Some("6")),
            AccountEntry::new("7", "Income", Some("root")),
            AccountEntry::new("700", "Sales", Some("7")),
            AccountEntry::new("708", "Other sales", Some("7")),
            AccountEntry::new("709", "Discounts", Some("7")),
            AccountEntry::new("other_root", "Other chart", None),
            AccountEntry::new("701", "Foreign sales", Some("other_root")),
        ]
    }

    #[test]
    fn test_chart_keeps_descendants_of_root() {
        let chart = ChartOfAccounts::from_entries("root", &entries());
        assert_eq!(chart.accounts.len(), 8);
        assert!(chart.get("701").is_none());
        assert!(chart.get("708").is_some());
        assert_eq!(chart.accounts[0].code, "6");
    }

    #[test]
    fn test_selectors() {
        let chart = ChartOfAccounts::from_entries("root", &entries());

        let range = AccountSelector::Range {
            from: "700".to_string(),
            to: "708".to_string(),
        };
        let codes: Vec<String> = chart.select(&[range]).into_iter().collect();
        assert_eq!(codes, vec!["700", "708"]);

        let codes = chart.select(&[AccountSelector::Pattern("6%".to_string())]);
        assert_eq!(codes.len(), 3);

        let codes = chart.select(&[AccountSelector::Code("610".to_string())]);
        assert_eq!(codes.len(), 1);

        assert_eq!(chart.select(&[AccountSelector::All]).len(), 8);
        assert!(chart.select(&[AccountSelector::Code("999".to_string())]).is_empty());
    }

    #[test]
    fn test_pattern_matching() {
        assert!(matches_pattern("70%", "700"));
        assert!(matches_pattern("7%8", "708"));
        assert!(!matches_pattern("7%8", "709"));
        assert!(matches_pattern("%0%", "700"));
        assert!(!matches_pattern("%0%", "6"));
    }

    #[test]
    fn test_range_well_formed() {
        let inverted = AccountSelector::Range {
            from: "708".to_string(),
            to: "700".to_string(),
        };
        assert!(!inverted.is_well_formed());

        let textual = AccountSelector::Range {
            from: "A10".to_string(),
            to: "B20".to_string(),
        };
        assert!(textual.is_well_formed());
        assert!(textual.matches("A5"));
        assert!(!textual.matches("C1"));
    }
}
