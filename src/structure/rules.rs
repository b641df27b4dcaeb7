//! Deterministic header-region heuristics.
//!
//! Rows are classified one at a time, top-down, until the first data row.
//! Each classified header row contributes a confidence factor; the result's
//! confidence is the mean of those factors.

use crate::confidence;
use crate::model::{
    CellValue, ColumnInfo, DetectionMethod, DetectionResult, HeaderRow, HeaderRowKind,
    MergedCellRange, Rows,
};
use crate::patterns;
use std::collections::HashSet;
use tracing::debug;

const TITLE_FACTOR: f64 = 0.9;
const SUBTITLE_FACTOR: f64 = 0.85;
const PERIOD_FACTOR: f64 = 0.85;
const CATEGORY_FACTOR: f64 = 0.8;
const COLUMN_NAMES_FACTOR: f64 = 0.85;
const DEFAULT_BOUNDARY_FACTOR: f64 = 0.5;

/// Share of numeric cells that makes a row a data row.
const DATA_NUMERIC_RATIO: f64 = 0.3;
/// Rows whose first numeric row sits this deep are treated as complex layouts.
const DEEP_DATA_ROW: usize = 5;
const MAX_SAMPLE_VALUES: usize = 5;

pub struct RuleEngine {
    max_header_rows: usize,
}

/// Per-row measurements used by the classifier.
#[derive(Debug, Clone)]
struct RowStats {
    non_null: usize,
    fill_ratio: f64,
    uniqueness_ratio: f64,
    numeric_ratio: f64,
    numeric_count: usize,
}

impl RowStats {
    fn of(row: &[CellValue], width: usize) -> Self {
        let values: Vec<String> = row
            .iter()
            .filter(|c| !c.is_empty())
            .map(CellValue::text)
            .collect();
        let non_null = values.len();
        let distinct: HashSet<&str> = values.iter().map(String::as_str).collect();
        let numeric_count = row.iter().filter(|c| patterns::is_numeric(c)).count();

        Self {
            non_null,
            fill_ratio: ratio(non_null, width),
            uniqueness_ratio: ratio(distinct.len(), non_null),
            numeric_ratio: ratio(numeric_count, non_null),
            numeric_count,
        }
    }

    /// At least 30% numeric. A lone number in a wide row is not enough.
    fn is_data(&self, width: usize) -> bool {
        self.numeric_count > 0
            && self.numeric_ratio >= DATA_NUMERIC_RATIO
            && (self.non_null > 1 || width == 1)
    }
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// Outcome of the layout complexity pre-check.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Complexity {
    pub complex: bool,
    pub reasons: Vec<String>,
}

impl RuleEngine {
    pub fn new(max_header_rows: usize) -> Self {
        Self {
            max_header_rows: max_header_rows.max(1),
        }
    }

    /// Classify the header region and fix the data boundary.
    pub fn detect(&self, rows: &Rows, merged: &[MergedCellRange]) -> DetectionResult {
        let width = table_width(rows);
        if width == 0 {
            return DetectionResult::failed("sheet has no values");
        }
        let header_merges = self.header_merges(merged);

        let mut classified: Vec<(HeaderRow, Option<f64>)> = Vec::new();
        let mut data_row: Option<usize> = None;
        let mut first_column_names: Option<usize> = None;

        for (index, row) in rows.iter().enumerate().take(self.max_header_rows) {
            let in_row: Vec<&MergedCellRange> = header_merges
                .iter()
                .copied()
                .filter(|m| m.covers_row(index))
                .collect();
            let stats = RowStats::of(row, width);

            if stats.non_null == 0 {
                classified.push((header_row(index, row, HeaderRowKind::Unknown, &in_row), None));
                continue;
            }

            let (kind, factor) = classify_row(row, &stats, &in_row, width, first_column_names.is_some());
            if kind == HeaderRowKind::Data {
                data_row = Some(index);
                break;
            }
            if kind == HeaderRowKind::ColumnNames && first_column_names.is_none() {
                first_column_names = Some(index);
            }
            debug!("Row {} classified as {:?}", index, kind);
            classified.push((header_row(index, row, kind, &in_row), factor));
        }

        let mut factors = Vec::new();
        if data_row.is_none() {
            factors.push(DEFAULT_BOUNDARY_FACTOR);
        }
        let data_start_row = match (data_row, first_column_names) {
            (Some(index), _) => index,
            // No data row: the earliest plausible boundary wins.
            (None, Some(index)) => index + 1,
            (None, None) => 1.min(rows.len()),
        };

        classified.retain(|(row, _)| row.index < data_start_row);
        factors.extend(classified.iter().filter_map(|(_, f)| *f));
        let header_rows: Vec<HeaderRow> = classified.into_iter().map(|(row, _)| row).collect();
        let header_row_count = header_rows.iter().filter(|r| !r.is_empty).count();

        let columns = derive_columns(rows, &header_rows, merged, data_start_row);
        DetectionResult {
            method: DetectionMethod::Rule,
            confidence: confidence::mean_or(&factors, DEFAULT_BOUNDARY_FACTOR),
            header_row_count,
            data_start_row,
            header_rows,
            merged_cells: header_merges.into_iter().cloned().collect(),
            columns,
            note: None,
            error: None,
        }
    }

    /// Flag layouts the rules are known to get wrong.
    pub fn assess_complexity(&self, rows: &Rows, merged: &[MergedCellRange]) -> Complexity {
        let header_merges = self.header_merges(merged);
        let mut reasons = Vec::new();

        let vertical = header_merges.iter().filter(|m| m.row_span() >= 2).count();
        if vertical >= 2 {
            reasons.push(format!("{} header merges span multiple rows", vertical));
        }

        let horizontal = header_merges.iter().filter(|m| m.col_span() >= 2).count();
        if horizontal >= 3 {
            reasons.push(format!("{} header merges span multiple columns", horizontal));
        }

        let width = table_width(rows);
        let first_numeric = rows
            .iter()
            .take(self.max_header_rows)
            .position(|row| RowStats::of(row, width).is_data(width));
        let header_scan = first_numeric.unwrap_or(self.max_header_rows);
        if let Some((index, count)) = rows
            .iter()
            .take(header_scan)
            .enumerate()
            .map(|(i, row)| {
                let months = row
                    .iter()
                    .filter(|c| matches!(c, CellValue::Text(t) if patterns::is_month_token(t)))
                    .count();
                (i, months)
            })
            .find(|(_, months)| *months >= 3)
        {
            reasons.push(format!("row {} groups {} month columns", index, count));
        }

        if let Some(index) = first_numeric.filter(|i| *i >= DEEP_DATA_ROW) {
            reasons.push(format!("first numeric row at index {}", index));
        }

        Complexity {
            complex: !reasons.is_empty(),
            reasons,
        }
    }

    fn header_merges<'a>(&self, merged: &'a [MergedCellRange]) -> Vec<&'a MergedCellRange> {
        merged
            .iter()
            .filter(|m| m.min_row < self.max_header_rows)
            .collect()
    }
}

fn classify_row(
    row: &[CellValue],
    stats: &RowStats,
    merges: &[&MergedCellRange],
    width: usize,
    seen_column_names: bool,
) -> (HeaderRowKind, Option<f64>) {
    let texts: Vec<String> = row
        .iter()
        .filter_map(|c| match c {
            CellValue::Text(t) if !t.trim().is_empty() => Some(t.trim().to_string()),
            _ => None,
        })
        .collect();

    // Banner: one wide merge holding every value of the row.
    let wide: Vec<&&MergedCellRange> = merges.iter().filter(|m| m.col_span() * 2 >= width).collect();
    if let [banner] = wide.as_slice() {
        let inside = row
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.is_empty())
            .all(|(col, _)| (banner.min_col..=banner.max_col).contains(&col));
        if inside && stats.non_null <= 3 {
            return (HeaderRowKind::Title, Some(TITLE_FACTOR));
        }
    }

    if texts.iter().any(|t| patterns::has_unit_marker(t)) {
        return (HeaderRowKind::Subtitle, Some(SUBTITLE_FACTOR));
    }

    if stats.numeric_ratio < DATA_NUMERIC_RATIO && texts.iter().any(|t| patterns::is_period(t)) {
        return (HeaderRowKind::Period, Some(PERIOD_FACTOR));
    }

    // Unmerged banner: one lone text cell above any column-name row.
    if merges.is_empty() && stats.non_null == 1 && texts.len() == 1 && stats.numeric_count == 0 && !seen_column_names {
        return (HeaderRowKind::Title, Some(TITLE_FACTOR));
    }

    if !merges.is_empty()
        && merges.iter().all(|m| m.col_span() < width)
        && stats.fill_ratio <= 0.5
    {
        return (HeaderRowKind::Category, Some(CATEGORY_FACTOR));
    }

    if stats.is_data(width) {
        return (HeaderRowKind::Data, None);
    }

    if stats.fill_ratio >= 0.5 && stats.uniqueness_ratio >= 0.7 {
        return (HeaderRowKind::ColumnNames, Some(COLUMN_NAMES_FACTOR));
    }

    (HeaderRowKind::Unknown, None)
}

fn header_row(index: usize, row: &[CellValue], kind: HeaderRowKind, merges: &[&MergedCellRange]) -> HeaderRow {
    let summary = row
        .iter()
        .filter(|c| !c.is_empty())
        .map(CellValue::text)
        .collect::<Vec<_>>()
        .join(" | ");
    HeaderRow {
        index,
        kind,
        text_summary: summary.chars().take(120).collect(),
        is_empty: row.iter().all(CellValue::is_empty),
        merged_span_count: merges.len(),
    }
}

/// Widest row among the rows given.
pub fn table_width(rows: &Rows) -> usize {
    rows.iter().map(Vec::len).max().unwrap_or(0)
}

/// Index of the first row (within `limit`) whose non-empty cells are more than
/// `min_ratio` numeric.
pub fn first_numeric_row(rows: &Rows, min_ratio: f64, limit: usize) -> Option<usize> {
    let width = table_width(rows);
    rows.iter().take(limit).position(|row| {
        let stats = RowStats::of(row, width);
        stats.numeric_count > 0 && stats.numeric_ratio > min_ratio && (stats.non_null > 1 || width == 1)
    })
}

/// Flatten the header rows above `data_start_row` into one name per column and
/// collect sample values from the data region.
pub fn derive_columns(
    rows: &Rows,
    header_rows: &[HeaderRow],
    merged: &[MergedCellRange],
    data_start_row: usize,
) -> Vec<ColumnInfo> {
    let width = table_width(rows);
    let naming_rows: Vec<&HeaderRow> = header_rows
        .iter()
        .filter(|r| {
            r.index < data_start_row
                && !r.is_empty
                && !matches!(r.kind, HeaderRowKind::Title | HeaderRowKind::Subtitle)
        })
        .collect();

    let mut names: Vec<Vec<String>> = vec![Vec::new(); width];
    for header in naming_rows {
        let Some(row) = rows.get(header.index) else {
            continue;
        };
        let forward_fill = matches!(header.kind, HeaderRowKind::Category | HeaderRowKind::Period)
            && !merged.iter().any(|m| m.covers_row(header.index));
        let mut carried: Option<String> = None;

        for (col, parts) in names.iter_mut().enumerate() {
            let direct = row.get(col).filter(|c| !c.is_empty()).map(CellValue::text);
            let value = direct
                .clone()
                .or_else(|| merged_value(rows, merged, header.index, col))
                .or_else(|| if forward_fill { carried.clone() } else { None });
            if direct.is_some() {
                carried = direct;
            }
            if let Some(value) = value {
                if parts.last() != Some(&value) {
                    parts.push(value);
                }
            }
        }
    }

    names
        .into_iter()
        .enumerate()
        .map(|(index, parts)| {
            let samples: Vec<CellValue> = rows
                .iter()
                .skip(data_start_row)
                .filter_map(|row| row.get(index))
                .filter(|c| !c.is_empty())
                .take(MAX_SAMPLE_VALUES)
                .cloned()
                .collect();
            ColumnInfo {
                index,
                name: if parts.is_empty() {
                    format!("column_{}", index + 1)
                } else {
                    parts.join("_")
                },
                inferred_type: patterns::infer_column_type(&samples),
                sample_values: samples.iter().map(CellValue::text).collect(),
            }
        })
        .collect()
}

/// Value of the merged region covering `(row, col)`, read from its top-left cell.
fn merged_value(rows: &Rows, merged: &[MergedCellRange], row: usize, col: usize) -> Option<String> {
    let region = merged
        .iter()
        .find(|m| m.covers_row(row) && (m.min_col..=m.max_col).contains(&col))?;
    rows.get(region.min_row)
        .and_then(|r| r.get(region.min_col))
        .filter(|c| !c.is_empty())
        .map(CellValue::text)
        .or_else(|| region.value.clone())
}
