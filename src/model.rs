//! Result and input types for structure detection and field mapping.

use serde::{Deserialize, Serialize};

/// A single raw cell value. Formatting is never carried, only the value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Number(f64),
    Bool(bool),
    Text(String),
    Empty,
}

impl CellValue {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    /// Display text, empty string for empty cells.
    pub fn text(&self) -> String {
        match self {
            Self::Empty => String::new(),
            Self::Text(s) => s.trim().to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    n.to_string()
                }
            }
        }
    }
}

impl From<&str> for CellValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<f64> for CellValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<i64> for CellValue {
    fn from(n: i64) -> Self {
        Self::Number(n as f64)
    }
}

impl<T: Into<CellValue>> From<Option<T>> for CellValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Empty)
    }
}

/// Raw rows as read from a sheet.
pub type Rows = Vec<Vec<CellValue>>;

/// Role of a row inside the header region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderRowKind {
    Title,
    Subtitle,
    Period,
    Category,
    ColumnNames,
    Data,
    Unknown,
}

impl HeaderRowKind {
    /// Parse the labels used in LLM responses. Unrecognized labels become `Unknown`.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_lowercase().replace(['-', ' '], "_").as_str() {
            "title" => Self::Title,
            "subtitle" | "unit" => Self::Subtitle,
            "period" | "date" | "time" => Self::Period,
            "category" | "group" => Self::Category,
            "column_names" | "column_name" | "header" | "columns" => Self::ColumnNames,
            "data" => Self::Data,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderRow {
    pub index: usize,
    pub kind: HeaderRowKind,
    pub text_summary: String,
    pub is_empty: bool,
    pub merged_span_count: usize,
}

/// A merged cell region. Rows and columns are 0-based and inclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedCellRange {
    pub range_id: String,
    pub min_row: usize,
    pub max_row: usize,
    pub min_col: usize,
    pub max_col: usize,
    #[serde(default)]
    pub value: Option<String>,
}

impl MergedCellRange {
    pub fn new(min_row: usize, max_row: usize, min_col: usize, max_col: usize) -> Self {
        Self {
            range_id: a1_range(min_row, max_row, min_col, max_col),
            min_row,
            max_row,
            min_col,
            max_col,
            value: None,
        }
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn row_span(&self) -> usize {
        self.max_row - self.min_row + 1
    }

    pub fn col_span(&self) -> usize {
        self.max_col - self.min_col + 1
    }

    pub fn covers_row(&self, row: usize) -> bool {
        (self.min_row..=self.max_row).contains(&row)
    }
}

/// Spreadsheet-style label, e.g. `A1:C1`.
fn a1_range(min_row: usize, max_row: usize, min_col: usize, max_col: usize) -> String {
    format!(
        "{}{}:{}{}",
        column_letter(min_col),
        min_row + 1,
        column_letter(max_col),
        max_row + 1
    )
}

fn column_letter(mut col: usize) -> String {
    let mut out = Vec::new();
    loop {
        out.push(b'A' + (col % 26) as u8);
        if col < 26 {
            break;
        }
        col = col / 26 - 1;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Text,
    Numeric,
    Date,
    Percentage,
    Currency,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub index: usize,
    pub name: String,
    pub inferred_type: ColumnType,
    #[serde(default)]
    pub sample_values: Vec<String>,
}

/// Handlers of the structure escalation ladder, cheapest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    Rule,
    LlmFast,
    LlmVision,
    MultiModel,
}

impl std::str::FromStr for DetectionMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rule" => Ok(Self::Rule),
            "llm_fast" | "llm" => Ok(Self::LlmFast),
            "llm_vl" | "llm_vision" | "vision" => Ok(Self::LlmVision),
            "multi_model" => Ok(Self::MultiModel),
            other => Err(format!(
                "Unknown method: {}. Use rule, llm_fast, llm_vision or multi_model",
                other
            )),
        }
    }
}

impl DetectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rule => "rule",
            Self::LlmFast => "llm_fast",
            Self::LlmVision => "llm_vision",
            Self::MultiModel => "multi_model",
        }
    }
}

/// Header/data boundary of one sheet.
///
/// `header_row_count <= data_start_row` and `confidence` lies in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub method: DetectionMethod,
    pub confidence: f64,
    pub header_row_count: usize,
    pub data_start_row: usize,
    #[serde(default)]
    pub header_rows: Vec<HeaderRow>,
    #[serde(default)]
    pub merged_cells: Vec<MergedCellRange>,
    #[serde(default)]
    pub columns: Vec<ColumnInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DetectionResult {
    /// A genuinely failed result. Only produced when there is nothing to infer from.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            method: DetectionMethod::Rule,
            confidence: 0.0,
            header_row_count: 0,
            data_start_row: 0,
            header_rows: Vec::new(),
            merged_cells: Vec::new(),
            columns: Vec::new(),
            note: None,
            error: Some(error.into()),
        }
    }

    /// Append a degradation note, keeping earlier ones.
    pub fn push_note(&mut self, note: impl AsRef<str>) {
        let note = note.as_ref();
        self.note = Some(match self.note.take() {
            Some(existing) if !existing.is_empty() => format!("{}; {}", existing, note),
            _ => note.to_string(),
        });
    }

    /// Normalized column names, in column order.
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingMethod {
    Custom,
    LearnedRule,
    Rule,
    Llm,
    MultiModel,
}

/// Assignment of one source column to a standard business field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub original_column: String,
    pub standard_field: Option<String>,
    pub confidence: f64,
    pub method: MappingMethod,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub description: String,
}

impl FieldMapping {
    /// Mapping that could not be resolved by any layer.
    pub fn unmapped(original_column: impl Into<String>, method: MappingMethod) -> Self {
        Self {
            original_column: original_column.into(),
            standard_field: None,
            confidence: 0.0,
            method,
            category: String::new(),
            description: String::new(),
        }
    }
}

/// A user-supplied fix for one column of a cached analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserCorrection {
    pub column: String,
    pub standard_field: String,
}
