//! Cell-text heuristics shared by the rule engine and the field mapper.

use crate::model::{CellValue, ColumnType};
use once_cell::sync::Lazy;
use regex::Regex;

static UNIT_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(单位|币种|计量|\bunits?\s*[:：]|\bcurrency\s*[:：]|\bin\s+(thousands|millions)\b)")
        .expect("valid regex")
});

static PERIOD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?ix)
        (19|20)\d{2}\s*年
        | \b(19|20)\d{2}[-/.](0?[1-9]|1[0-2])\b
        | \d{1,2}\s*月
        | 第?[一二三四1-4]\s*季度
        | \bQ[1-4]\b
        | \bFY\s*\d{2,4}\b
        | \bH[12]\b
        | 上半年 | 下半年
        | ^(19|20)\d{2}$
        | \b(jan(uary)?|feb(ruary)?|mar(ch)?|apr(il)?|may|june?|july?|aug(ust)?|sept?(ember)?|oct(ober)?|nov(ember)?|dec(ember)?)\b",
    )
    .expect("valid regex")
});

static MONTH_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?ix)
        (^|[^\d])(0?[1-9]|1[0-2])\s*月
        | \b(19|20)\d{2}[-/.]?(0[1-9]|1[0-2])\b
        | \b(jan(uary)?|feb(ruary)?|mar(ch)?|apr(il)?|may|june?|july?|aug(ust)?|sept?(ember)?|oct(ober)?|nov(ember)?|dec(ember)?)\b",
    )
    .expect("valid regex")
});

static DATE_VALUE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^((19|20)\d{2}[-/.]\d{1,2}([-/.]\d{1,2})?(\s+\d{1,2}:\d{2}(:\d{2})?)?|\d{1,2}/\d{1,2}/(19|20)\d{2}|(19|20)\d{2}\s*年\s*\d{1,2}\s*月(\s*\d{1,2}\s*日)?)$",
    )
    .expect("valid regex")
});

const CURRENCY_SYMBOLS: &[char] = &['¥', '￥', '$', '€', '£'];

/// Parse numeric text after stripping currency, percent and thousands symbols.
/// `(1,234)` is read as a negative number.
pub fn parse_numeric(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    let (negative, body) = match trimmed.strip_prefix('(').and_then(|s| s.strip_suffix(')')) {
        Some(inner) => (true, inner),
        None => (false, trimmed),
    };

    let cleaned: String = body
        .trim_end_matches('元')
        .chars()
        .filter(|c| !CURRENCY_SYMBOLS.contains(c) && *c != ',' && *c != '%' && !c.is_whitespace())
        .collect();
    if cleaned.is_empty() || !cleaned.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }

    let value: f64 = cleaned.parse().ok()?;
    if !value.is_finite() {
        return None;
    }
    Some(if negative { -value } else { value })
}

pub fn is_numeric(cell: &CellValue) -> bool {
    match cell {
        CellValue::Number(_) => true,
        CellValue::Text(s) => parse_numeric(s).is_some(),
        _ => false,
    }
}

pub fn has_unit_marker(text: &str) -> bool {
    UNIT_MARKER.is_match(text)
}

pub fn is_period(text: &str) -> bool {
    PERIOD.is_match(text.trim())
}

/// Month-grouping token such as `1月`, `2025-01` or `Jan`.
pub fn is_month_token(text: &str) -> bool {
    MONTH_TOKEN.is_match(text.trim())
}

pub fn is_date_value(text: &str) -> bool {
    DATE_VALUE.is_match(text.trim())
}

/// Type of a single non-empty value.
pub fn classify_value(cell: &CellValue) -> ColumnType {
    match cell {
        CellValue::Number(_) => ColumnType::Numeric,
        CellValue::Bool(_) | CellValue::Empty => ColumnType::Text,
        CellValue::Text(s) => {
            let s = s.trim();
            if is_date_value(s) {
                ColumnType::Date
            } else if s.ends_with('%') && parse_numeric(s).is_some() {
                ColumnType::Percentage
            } else if (s.contains(CURRENCY_SYMBOLS) || s.ends_with('元')) && parse_numeric(s).is_some() {
                ColumnType::Currency
            } else if parse_numeric(s).is_some() {
                ColumnType::Numeric
            } else {
                ColumnType::Text
            }
        }
    }
}

/// Majority type over the given samples; ties resolve toward the earlier sample.
pub fn infer_column_type(samples: &[CellValue]) -> ColumnType {
    let mut counts: Vec<(ColumnType, usize)> = Vec::new();
    for sample in samples.iter().filter(|c| !c.is_empty()) {
        let kind = classify_value(sample);
        match counts.iter_mut().find(|(k, _)| *k == kind) {
            Some((_, n)) => *n += 1,
            None => counts.push((kind, 1)),
        }
    }
    let mut best: Option<(ColumnType, usize)> = None;
    for (kind, n) in counts {
        if best.map(|(_, b)| n > b).unwrap_or(true) {
            best = Some((kind, n));
        }
    }
    best.map(|(k, _)| k).unwrap_or(ColumnType::Text)
}
