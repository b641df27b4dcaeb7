//! LLM structure detection: text prompt, vision prompt and review-and-correct prompt.
//!
//! Every call returns `Result<DetectionResult, DegradationReason>`. Responses are
//! checked against the rows they describe before they are trusted.

use crate::confidence;
use crate::error::DegradationReason;
use crate::llm::LlmInvoker;
use crate::model::{
    CellValue, DetectionMethod, DetectionResult, HeaderRow, HeaderRowKind, MergedCellRange, Rows,
};
use crate::openrouter::Message;
use crate::structure::render;
use crate::structure::rules::{self, first_numeric_row};
use serde::Deserialize;
use tracing::{debug, info, warn};

const PROMPT_MAX_ROWS: usize = 10;
const PROMPT_MAX_COLS: usize = 15;
const PROMPT_MAX_MERGES: usize = 15;
const CELL_TEXT_LIMIT: usize = 40;

/// Rows at least this numeric are data, whatever the model says.
const NUMERIC_OVERRIDE_RATIO: f64 = 0.4;
const OVERRIDE_PENALTY: f64 = 0.8;
/// Used when the model omits its own confidence.
const DEFAULT_MODEL_CONFIDENCE: f64 = 0.75;

const SYSTEM_PROMPT: &str = r#"You analyse the header region of spreadsheet tables. Tables may have titles, unit lines, period rows, grouped category rows and multi-level column headers above the data.

Row types:
- title: report title or banner
- subtitle: unit or currency line (e.g. "单位: 元", "Unit: USD")
- period: year / month / quarter labels
- category: grouping labels spanning several columns
- column_names: the row(s) naming each column
- data: first row of actual records

Row indices are 0-based. data_start_row is the index of the first data row. header_row_count counts the non-empty rows above it.

Return ONLY valid JSON:
{
  "header_row_count": 3,
  "data_start_row": 3,
  "confidence": 0.9,
  "header_rows": [{"index": 0, "type": "title", "description": "report title"}],
  "reasoning": "short explanation"
}"#;

#[derive(Debug, Deserialize)]
struct StructureResponse {
    header_row_count: usize,
    data_start_row: usize,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    header_rows: Vec<ResponseRow>,
    #[serde(default)]
    reasoning: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseRow {
    index: usize,
    #[serde(rename = "type", default)]
    kind: String,
}

/// Structure prompts over one [`LlmInvoker`].
#[derive(Clone)]
pub struct StructureLlm {
    invoker: LlmInvoker,
    fast_model: String,
    vision_model: String,
    enable_vision: bool,
}

impl StructureLlm {
    pub fn new(invoker: LlmInvoker, fast_model: String, vision_model: String, enable_vision: bool) -> Self {
        Self {
            invoker,
            fast_model,
            vision_model,
            enable_vision,
        }
    }

    /// Text-only detection with the fast model.
    pub async fn detect_text(
        &self,
        rows: &Rows,
        merged: &[MergedCellRange],
        sheet_label: &str,
    ) -> Result<DetectionResult, DegradationReason> {
        self.detect_with(&self.fast_model, rows, merged, sheet_label, DetectionMethod::LlmFast)
            .await
    }

    /// Detection with an arbitrary model, used by the voter.
    pub async fn detect_with(
        &self,
        model: &str,
        rows: &Rows,
        merged: &[MergedCellRange],
        sheet_label: &str,
        method: DetectionMethod,
    ) -> Result<DetectionResult, DegradationReason> {
        let messages = vec![
            Message::system(SYSTEM_PROMPT),
            Message::user(format!(
                "{}\n\nIdentify the header rows and the data start row.",
                sheet_sample(rows, merged, sheet_label)
            )),
        ];
        let response: StructureResponse = self.invoker.complete_json(model, messages).await?;
        let result = into_result(response, rows, merged, method)?;
        info!(
            "LLM {} structure: data_start_row={}, confidence={:.2}",
            model, result.data_start_row, result.confidence
        );
        Ok(result)
    }

    /// Detection with the vision model over a rendered grid of the region.
    pub async fn detect_vision(
        &self,
        rows: &Rows,
        merged: &[MergedCellRange],
        sheet_label: &str,
    ) -> Result<DetectionResult, DegradationReason> {
        if !self.enable_vision {
            return Err(DegradationReason::NoResult("vision layer disabled".to_string()));
        }
        let png = render::render_grid(rows, merged)?;
        debug!(
            "Rendered {} byte grid for {} (occupancy {:.2})",
            png.len(),
            sheet_label,
            render::occupancy(rows)
        );

        let text = format!(
            "{}\n\nThe image shows the same region as a grid: blue cells hold text, green cells hold numbers, white cells are empty and red outlines mark merged cells. Identify the header rows and the data start row.",
            sheet_sample(rows, merged, sheet_label)
        );
        let messages = vec![Message::system(SYSTEM_PROMPT), Message::user_with_png(text, &png)];
        let response: StructureResponse = self.invoker.complete_json(&self.vision_model, messages).await?;
        into_result(response, rows, merged, DetectionMethod::LlmVision)
    }

    /// Ask the fast model to confirm or correct `current`.
    pub async fn review(
        &self,
        rows: &Rows,
        merged: &[MergedCellRange],
        sheet_label: &str,
        current: &DetectionResult,
    ) -> Result<DetectionResult, DegradationReason> {
        let kinds = current
            .header_rows
            .iter()
            .map(|r| format!("row {}: {:?}", r.index, r.kind))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "{}\n\nA previous analysis concluded:\nheader_row_count = {}\ndata_start_row = {}\nconfidence = {:.2}\n{}\n\nReview this against the rows above. Confirm it if it is right, otherwise return the corrected analysis in the same JSON format.",
            sheet_sample(rows, merged, sheet_label),
            current.header_row_count,
            current.data_start_row,
            current.confidence,
            kinds
        );
        let messages = vec![Message::system(SYSTEM_PROMPT), Message::user(prompt)];
        let response: StructureResponse = self.invoker.complete_json(&self.fast_model, messages).await?;
        into_result(response, rows, merged, DetectionMethod::MultiModel)
    }
}

/// Bounded text rendering of the header region: at most 10 rows by 15 columns
/// plus up to 15 merged ranges.
pub fn sheet_sample(rows: &Rows, merged: &[MergedCellRange], sheet_label: &str) -> String {
    let mut out = format!("Sheet: \"{}\" ({} rows read)\n", sheet_label, rows.len());

    for (i, row) in rows.iter().take(PROMPT_MAX_ROWS).enumerate() {
        let cells: Vec<String> = row
            .iter()
            .take(PROMPT_MAX_COLS)
            .map(|c| match c {
                CellValue::Empty => "null".to_string(),
                other => truncate(&other.text(), CELL_TEXT_LIMIT),
            })
            .collect();
        out.push_str(&format!("Row {}: [{}]\n", i, cells.join(", ")));
    }

    let shown: Vec<&MergedCellRange> = merged
        .iter()
        .filter(|m| m.min_row < PROMPT_MAX_ROWS)
        .take(PROMPT_MAX_MERGES)
        .collect();
    if !shown.is_empty() {
        out.push_str("\nMerged cells:\n");
        for m in shown {
            out.push_str(&format!(
                "- {} (rows {}-{}, cols {}-{}){}\n",
                m.range_id,
                m.min_row,
                m.max_row,
                m.min_col,
                m.max_col,
                m.value
                    .as_deref()
                    .map(|v| format!(": {}", truncate(v, CELL_TEXT_LIMIT)))
                    .unwrap_or_default()
            ));
        }
    }
    out
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        text.to_string()
    } else {
        format!("{}…", text.chars().take(limit).collect::<String>())
    }
}

/// Validate a model answer against the rows and turn it into a result.
fn into_result(
    response: StructureResponse,
    rows: &Rows,
    merged: &[MergedCellRange],
    method: DetectionMethod,
) -> Result<DetectionResult, DegradationReason> {
    let mut data_start_row = response.data_start_row;
    let mut header_row_count = response.header_row_count;

    if data_start_row > rows.len() {
        return Err(DegradationReason::DimensionMismatch(format!(
            "data_start_row {} beyond {} rows",
            data_start_row,
            rows.len()
        )));
    }
    if header_row_count > data_start_row {
        return Err(DegradationReason::DimensionMismatch(format!(
            "header_row_count {} > data_start_row {}",
            header_row_count, data_start_row
        )));
    }

    let mut confidence = confidence::normalize(response.confidence.unwrap_or(DEFAULT_MODEL_CONFIDENCE));
    let mut note = None;

    if let Some(numeric_row) = first_numeric_row(rows, NUMERIC_OVERRIDE_RATIO, PROMPT_MAX_ROWS)
        .filter(|row| *row < data_start_row)
    {
        warn!(
            "Model placed data at row {} but row {} is numeric; overriding",
            data_start_row, numeric_row
        );
        note = Some(format!(
            "data_start_row {} overridden to numeric row {}",
            data_start_row, numeric_row
        ));
        data_start_row = numeric_row;
        header_row_count = header_row_count.min(numeric_row);
        confidence *= OVERRIDE_PENALTY;
    }

    if let Some(reasoning) = response.reasoning.as_deref().filter(|r| !r.is_empty()) {
        debug!("Model reasoning: {}", reasoning);
    }

    let header_rows: Vec<HeaderRow> = (0..data_start_row)
        .map(|index| {
            let kind = response
                .header_rows
                .iter()
                .find(|r| r.index == index)
                .map(|r| HeaderRowKind::from_label(&r.kind))
                .unwrap_or(if index + 1 == data_start_row {
                    HeaderRowKind::ColumnNames
                } else {
                    HeaderRowKind::Unknown
                });
            header_row_for(rows, merged, index, kind)
        })
        .collect();

    let columns = rules::derive_columns(rows, &header_rows, merged, data_start_row);
    Ok(DetectionResult {
        method,
        confidence: confidence::normalize(confidence),
        header_row_count,
        data_start_row,
        header_rows,
        merged_cells: merged
            .iter()
            .filter(|m| m.min_row < data_start_row)
            .cloned()
            .collect(),
        columns,
        note,
        error: None,
    })
}

fn header_row_for(rows: &Rows, merged: &[MergedCellRange], index: usize, kind: HeaderRowKind) -> HeaderRow {
    let row: &[CellValue] = rows.get(index).map(Vec::as_slice).unwrap_or(&[]);
    HeaderRow {
        index,
        kind,
        text_summary: row
            .iter()
            .filter(|c| !c.is_empty())
            .map(CellValue::text)
            .collect::<Vec<_>>()
            .join(" | ")
            .chars()
            .take(120)
            .collect(),
        is_empty: row.iter().all(CellValue::is_empty),
        merged_span_count: merged.iter().filter(|m| m.covers_row(index)).count(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InferenceConfig;
    use crate::llm::testing::ScriptedClient;
    use std::sync::Arc;

    fn budget_report() -> Rows {
        vec![
            vec![CellValue::from("总表"), CellValue::Empty, CellValue::Empty],
            vec![CellValue::from("单位: 元"), CellValue::Empty, CellValue::Empty],
            vec![CellValue::from("项目"), CellValue::from("预算"), CellValue::from("实际")],
            vec![CellValue::from("收入"), CellValue::from(100i64), CellValue::from(110i64)],
            vec![CellValue::from("成本"), CellValue::from(80i64), CellValue::from(95i64)],
        ]
    }

    fn structure_llm(client: Arc<ScriptedClient>) -> StructureLlm {
        let config = InferenceConfig::default();
        StructureLlm::new(
            LlmInvoker::new(client, &config),
            "fast".to_string(),
            "vision".to_string(),
            true,
        )
    }

    #[tokio::test]
    async fn test_text_detection() {
        let client = ScriptedClient::replies(&[r#"```json
{"header_row_count": 3, "data_start_row": 3, "confidence": 0.92,
 "header_rows": [{"index": 0, "type": "title"}, {"index": 1, "type": "subtitle"}, {"index": 2, "type": "column_names"}]}
```"#]);
        let result = structure_llm(client.clone())
            .detect_text(&budget_report(), &[], "Sheet1")
            .await
            .unwrap();

        assert_eq!(result.method, DetectionMethod::LlmFast);
        assert_eq!(result.data_start_row, 3);
        assert_eq!(result.header_rows[1].kind, HeaderRowKind::Subtitle);
        assert_eq!(result.column_names(), vec!["项目", "预算", "实际"]);
        assert!((result.confidence - 0.92).abs() < 1e-9);

        let request = &client.requests.lock()[0];
        assert_eq!(request.model, "fast");
        assert!(request.messages[1].text().contains("Row 2: [项目, 预算, 实际]"));
    }

    #[tokio::test]
    async fn test_numeric_row_overrides_late_boundary() {
        let client =
            ScriptedClient::replies(&[r#"{"header_row_count": 4, "data_start_row": 4, "confidence": 0.9}"#]);
        let result = structure_llm(client)
            .detect_text(&budget_report(), &[], "Sheet1")
            .await
            .unwrap();

        assert_eq!(result.data_start_row, 3);
        assert!(result.header_row_count <= 3);
        assert!((result.confidence - 0.72).abs() < 1e-9);
        assert!(result.note.unwrap().contains("overridden"));
    }

    #[tokio::test]
    async fn test_boundary_beyond_rows_is_mismatch() {
        let client = ScriptedClient::replies(&[r#"{"header_row_count": 2, "data_start_row": 40}"#]);
        let err = structure_llm(client)
            .detect_text(&budget_report(), &[], "Sheet1")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "dimension_mismatch");
    }

    #[tokio::test]
    async fn test_vision_sends_image() {
        let client = ScriptedClient::replies(&[r#"{"header_row_count": 3, "data_start_row": 3}"#]);
        let result = structure_llm(client.clone())
            .detect_vision(&budget_report(), &[], "Sheet1")
            .await
            .unwrap();

        assert_eq!(result.method, DetectionMethod::LlmVision);
        assert_eq!(result.confidence, DEFAULT_MODEL_CONFIDENCE);
        let request = &client.requests.lock()[0];
        assert_eq!(request.model, "vision");
        assert!(request.messages[1].has_image());
    }

    #[tokio::test]
    async fn test_vision_disabled_abstains_without_calling() {
        let client = ScriptedClient::replies(&[]);
        let config = InferenceConfig::default();
        let llm = StructureLlm::new(
            LlmInvoker::new(client.clone(), &config),
            "fast".to_string(),
            "vision".to_string(),
            false,
        );
        let err = llm.detect_vision(&budget_report(), &[], "Sheet1").await.unwrap_err();
        assert_eq!(err.kind(), "no_result");
        assert_eq!(client.call_count(), 0);
    }

    #[test]
    fn test_sample_is_bounded() {
        let wide: Rows = (0..30)
            .map(|r| (0..40).map(|c| CellValue::from(format!("r{}c{}", r, c).as_str())).collect())
            .collect();
        let merged: Vec<MergedCellRange> = (0..30).map(|c| MergedCellRange::new(0, 0, c, c + 1)).collect();

        let sample = sheet_sample(&wide, &merged, "wide");
        assert!(sample.contains("Row 9:"));
        assert!(!sample.contains("Row 10:"));
        assert!(sample.contains("r0c14"));
        assert!(!sample.contains("r0c15"));
        assert_eq!(sample.matches("\n- ").count(), PROMPT_MAX_MERGES);
    }
}
