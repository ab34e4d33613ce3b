//! Employee counts from inline XBRL accounts.
//!
//! Facts are matched by the local part of their concept name, in
//! priority order, first as `ix:nonFraction` facts and then as plain
//! XBRL elements. Values outside `1..1_000_000` are rejected.

use std::sync::LazyLock;

use regex::Regex;

/// Employee concepts in lookup order.
const EMPLOYEE_CONCEPTS: &[&str] = &[
    "AverageNumberOfEmployees",
    "AverageNumberEmployeesDuringPeriod",
    "NumberOfEmployees",
    "EmployeesTotal",
    "DirectorsAndEmployees",
    "AverageNumberEmployeesDuringYear",
];

const MAX_EMPLOYEES: u64 = 1_000_000;

static NON_FRACTION: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?is)<ix:nonfraction\b([^>]*)>(.*?)</ix:nonfraction>").ok()
});

static NAME_ATTR: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"(?i)\bname\s*=\s*["']([^"']+)["']"#).ok());

static SCALE_ATTR: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"(?i)\bscale\s*=\s*["'](-?\d+)["']"#).ok());

static PLAIN_FACT: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?is)<(?:[\w-]+:)?(\w+)\b[^>]*>\s*([\d,\s]+)\s*</(?:[\w-]+:)?\w+\s*>").ok()
});

static TAG: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"<[^>]*>").ok());

/// Whether a downloaded document looks like (inline) XBRL.
pub fn is_ixbrl(document: &str) -> bool {
    let head: String = document.chars().take(2000).collect::<String>().to_lowercase();
    head.contains("<html xmlns") || head.contains("xbrl")
}

/// The reported employee count, if the document states one.
pub fn extract_employees(document: &str) -> Option<u64> {
    let facts = facts(document);
    EMPLOYEE_CONCEPTS.iter().find_map(|concept| {
        facts
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(concept))
            .map(|(_, value)| *value)
    })
}

/// Every numeric fact in the document as (local concept name, value), in
/// document order. Inline facts come before plain elements.
fn facts(document: &str) -> Vec<(String, u64)> {
    let mut found = Vec::new();

    if let (Some(fact_re), Some(name_re)) = (NON_FRACTION.as_ref(), NAME_ATTR.as_ref()) {
        for caps in fact_re.captures_iter(document) {
            let attrs = &caps[1];
            let Some(name) = name_re.captures(attrs).map(|c| local_name(&c[1]).to_string()) else {
                continue;
            };
            let scale = SCALE_ATTR
                .as_ref()
                .and_then(|re| re.captures(attrs))
                .and_then(|c| c[1].parse::<i32>().ok())
                .unwrap_or(0);
            if let Some(value) = parse_count(&strip_tags(&caps[2]), scale) {
                found.push((name, value));
            }
        }
    }

    if let Some(plain_re) = PLAIN_FACT.as_ref() {
        for caps in plain_re.captures_iter(document) {
            if let Some(value) = parse_count(&caps[2], 0) {
                found.push((caps[1].to_string(), value));
            }
        }
    }

    found
}

fn local_name(name: &str) -> &str {
    name.rsplit(':').next().unwrap_or(name)
}

fn strip_tags(text: &str) -> String {
    match TAG.as_ref() {
        Some(re) => re.replace_all(text, "").into_owned(),
        None => text.to_string(),
    }
}

fn parse_count(text: &str, scale: i32) -> Option<u64> {
    let digits: String = text
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ',')
        .collect();
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let base: u64 = digits.parse().ok()?;
    let value = match scale {
        0 => base,
        s if s > 0 => base.checked_mul(10u64.checked_pow(s.unsigned_abs())?)?,
        _ => return None,
    };
    (value > 0 && value < MAX_EMPLOYEES).then_some(value)
}
