//! Dictionary matching of column names against the standard fields.

use super::dictionary::{self, StandardField};
use crate::patterns;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

/// Columns needed before a sheet counts as wide (one column per period).
const WIDE_FORMAT_MIN_PERIOD_COLUMNS: usize = 3;
const MIN_SYNONYM_CHARS: usize = 2;

static SEPARATORS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\s_\-/\\.,:;|()（）\[\]【】]+").expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchSource {
    ExactMatch,
    SynonymMatch,
}

#[derive(Debug, Clone)]
pub struct DictionaryMatch {
    pub field: &'static StandardField,
    pub confidence: f64,
    pub source: MatchSource,
}

/// Trim, lowercase and collapse separator runs into `_`.
pub fn normalize(name: &str) -> String {
    let lower = name.trim().to_lowercase();
    SEPARATORS
        .replace_all(&lower, "_")
        .trim_matches('_')
        .to_string()
}

/// Best dictionary match for a column name.
///
/// An exact synonym hit scores 1.0. Otherwise, containment in either direction
/// scores `0.5 + 0.4 * shorter / longer` by character count; the first field
/// wins a tie.
pub fn match_column(name: &str) -> Option<DictionaryMatch> {
    let normalized = normalize(name);
    if normalized.is_empty() {
        return None;
    }
    let name_chars = normalized.chars().count();
    let mut best: Option<DictionaryMatch> = None;

    for field in dictionary::standard_fields() {
        let candidates = std::iter::once(field.name)
            .chain(std::iter::once(field.label))
            .chain(field.synonyms.iter().copied());

        for candidate in candidates {
            let candidate = normalize(candidate);
            if candidate == normalized {
                return Some(DictionaryMatch {
                    field,
                    confidence: 1.0,
                    source: MatchSource::ExactMatch,
                });
            }

            let candidate_chars = candidate.chars().count();
            if candidate_chars.min(name_chars) < MIN_SYNONYM_CHARS {
                continue;
            }
            if !(normalized.contains(&candidate) || candidate.contains(&normalized)) {
                continue;
            }

            let overlap = candidate_chars.min(name_chars) as f64 / candidate_chars.max(name_chars) as f64;
            let confidence = 0.5 + 0.4 * overlap;
            if best.as_ref().map(|b| confidence > b.confidence).unwrap_or(true) {
                best = Some(DictionaryMatch {
                    field,
                    confidence,
                    source: MatchSource::SynonymMatch,
                });
            }
        }
    }

    best
}

/// Whether the column set repeats a time period across columns.
pub fn is_wide_format(columns: &[String]) -> bool {
    columns
        .iter()
        .filter(|c| patterns::is_month_token(c))
        .count()
        >= WIDE_FORMAT_MIN_PERIOD_COLUMNS
}
