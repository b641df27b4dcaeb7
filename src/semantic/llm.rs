//! Single-column field mapping through the LLM.

use super::dictionary;
use crate::confidence;
use crate::error::DegradationReason;
use crate::llm::LlmInvoker;
use crate::openrouter::Message;
use chrono::Datelike;
use serde::Deserialize;
use tracing::debug;

const MAX_SAMPLES: usize = 5;
const DEFAULT_MODEL_CONFIDENCE: f64 = 0.7;

#[derive(Debug, Deserialize)]
struct MappingResponse {
    #[serde(default)]
    standard_field: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

/// A validated model answer for one column.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmMapping {
    pub standard_field: String,
    pub confidence: f64,
    pub category: String,
    pub description: String,
}

#[derive(Clone)]
pub struct SemanticLlm {
    invoker: LlmInvoker,
}

impl SemanticLlm {
    pub fn new(invoker: LlmInvoker) -> Self {
        Self { invoker }
    }

    /// Map `column` to a standard field with `model`.
    ///
    /// A null or unknown field is an abstention, not a mapping.
    pub async fn map_column(
        &self,
        model: &str,
        column: &str,
        samples: &[String],
        context: Option<&str>,
    ) -> Result<LlmMapping, DegradationReason> {
        let messages = vec![
            Message::system(system_prompt()),
            Message::user(column_prompt(column, samples, context)),
        ];
        let response: MappingResponse = self.invoker.complete_json(model, messages).await?;

        let field = response
            .standard_field
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty() && f != "null")
            .ok_or_else(|| DegradationReason::NoResult(format!("model abstained on {}", column)))?;
        let known = dictionary::resolve(&field).ok_or_else(|| {
            DegradationReason::NoResult(format!("unknown field {} for {}", field, column))
        })?;

        debug!("LLM {} mapped {} -> {}", model, column, field);
        Ok(LlmMapping {
            confidence: confidence::normalize(response.confidence.unwrap_or(DEFAULT_MODEL_CONFIDENCE)),
            category: response
                .category
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| known.category.to_string()),
            description: response.description.unwrap_or_default(),
            standard_field: field,
        })
    }
}

fn system_prompt() -> String {
    let fields = dictionary::standard_fields()
        .iter()
        .map(|f| format!("- {} ({}, {}): {}", f.name, f.label, f.category, f.synonyms.join(", ")))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"You map spreadsheet column names to standard business fields.

Standard fields:
{}

Rules:
- Answer with one of the standard field names above, or null when none fits.
- Columns that carry a month (e.g. "1月_预算收入", "2025-03 Actual") must be named {{metric}}_{{YYYYMM}}, for example budget_amount_202501. Use the year from the context, or {} when none is given.
- confidence is between 0 and 1.

Return ONLY valid JSON:
{{"standard_field": "revenue", "confidence": 0.9, "category": "income", "description": "short explanation"}}"#,
        fields,
        chrono::Local::now().year()
    )
}

fn column_prompt(column: &str, samples: &[String], context: Option<&str>) -> String {
    let mut prompt = format!("Column name: \"{}\"\n", column);
    let shown: Vec<&str> = samples.iter().take(MAX_SAMPLES).map(String::as_str).collect();
    if !shown.is_empty() {
        prompt.push_str(&format!("Sample values: {}\n", shown.join(", ")));
    }
    if let Some(context) = context.filter(|c| !c.trim().is_empty()) {
        prompt.push_str(&format!("Context: {}\n", context.trim()));
    }
    prompt
}
