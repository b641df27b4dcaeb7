//! Column to standard-field mapping.
//!
//! Per column: custom mapping, learned mapping, dictionary, single-model LLM,
//! multi-model vote, then best effort. Each layer ends the ladder once its
//! confidence clears the semantic threshold. LLM answers above the learning
//! threshold are written back to the learned store.

pub mod dictionary;
pub mod llm;
pub mod matcher;

use crate::config::InferenceConfig;
use crate::confidence::ConfidenceGate;
use crate::learned::{LearnedMapping, LearnedStore};
use crate::llm::LlmInvoker;
use crate::model::{CellValue, FieldMapping, MappingMethod, Rows};
use crate::patterns;
use llm::{LlmMapping, SemanticLlm};
use matcher::DictionaryMatch;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

const MAX_SAMPLES: usize = 5;

pub struct FieldMapper {
    llm: SemanticLlm,
    learned: Arc<LearnedStore>,
    gate: ConfidenceGate,
    learning_threshold: f64,
    custom: HashMap<String, String>,
    fast_model: String,
    voter_models: Vec<String>,
    enable_multi_model: bool,
}

/// One vote in the semantic multi-model stage.
struct Ballot {
    field: String,
    confidence: f64,
    category: String,
    description: String,
}

impl From<&DictionaryMatch> for Ballot {
    fn from(m: &DictionaryMatch) -> Self {
        Self {
            field: m.field.name.to_string(),
            confidence: m.confidence,
            category: m.field.category.to_string(),
            description: m.field.label.to_string(),
        }
    }
}

impl From<LlmMapping> for Ballot {
    fn from(m: LlmMapping) -> Self {
        Self {
            field: m.standard_field,
            confidence: m.confidence,
            category: m.category,
            description: m.description,
        }
    }
}

impl FieldMapper {
    pub fn new(invoker: LlmInvoker, learned: Arc<LearnedStore>, config: &InferenceConfig) -> Self {
        Self {
            llm: SemanticLlm::new(invoker),
            learned,
            gate: ConfidenceGate::new(config.semantic_confidence_threshold),
            learning_threshold: config.learning_threshold,
            custom: config
                .custom_mappings
                .iter()
                .map(|(column, field)| (matcher::normalize(column), field.clone()))
                .collect(),
            fast_model: config.fast_model.clone(),
            voter_models: config.voter_models.clone(),
            enable_multi_model: config.enable_multi_model,
        }
    }

    /// Map every column. `sample_rows` are data rows aligned with `columns`.
    pub async fn map_fields(
        &self,
        columns: &[String],
        sample_rows: Option<&Rows>,
        context: Option<&str>,
    ) -> Vec<FieldMapping> {
        self.map_fields_reusing(columns, sample_rows, context, &HashMap::new())
            .await
    }

    /// Like [`map_fields`](Self::map_fields), but columns whose normalized name
    /// is in `reuse` take that mapping instead of climbing the ladder.
    pub async fn map_fields_reusing(
        &self,
        columns: &[String],
        sample_rows: Option<&Rows>,
        context: Option<&str>,
        reuse: &HashMap<String, FieldMapping>,
    ) -> Vec<FieldMapping> {
        let wide = matcher::is_wide_format(columns);
        if wide {
            info!("Wide-format columns detected; period columns go to the LLM");
        }

        let mut mappings = Vec::with_capacity(columns.len());
        for (index, column) in columns.iter().enumerate() {
            if let Some(previous) = reuse.get(&matcher::normalize(column)) {
                mappings.push(FieldMapping {
                    original_column: column.clone(),
                    ..previous.clone()
                });
                continue;
            }
            let samples = sample_rows
                .map(|rows| column_samples(rows, index))
                .unwrap_or_default();
            mappings.push(self.map_column(column, &samples, context, wide).await);
        }
        mappings
    }

    async fn map_column(
        &self,
        column: &str,
        samples: &[String],
        context: Option<&str>,
        wide: bool,
    ) -> FieldMapping {
        let normalized = matcher::normalize(column);

        if let Some(field) = self.custom.get(&normalized) {
            return custom_mapping(column, field);
        }

        if let Some(learned) = self.learned.get(column) {
            return FieldMapping {
                original_column: column.to_string(),
                standard_field: Some(learned.standard_field),
                confidence: learned.confidence,
                method: MappingMethod::LearnedRule,
                category: learned.category,
                description: learned.description,
            };
        }

        let period_column = wide && patterns::is_month_token(column);
        let dictionary = if period_column {
            debug!("Skipping dictionary for period column {}", column);
            None
        } else {
            matcher::match_column(column)
        };
        if let Some(m) = dictionary.as_ref().filter(|m| self.gate.passes(m.confidence)) {
            debug!("Dictionary {:?} {} -> {} ({:.2})", m.source, column, m.field.name, m.confidence);
            return dictionary_mapping(column, m);
        }

        let first = match self.llm.map_column(&self.fast_model, column, samples, context).await {
            Ok(m) if self.gate.passes(m.confidence) => {
                let mapping = ballot_mapping(column, m.into(), MappingMethod::Llm);
                self.learn(column, &mapping).await;
                return mapping;
            }
            Ok(m) => Some(m),
            Err(reason) => {
                warn!("LLM mapping for {} degraded: {}", column, reason);
                None
            }
        };

        let mut ballots: Vec<Ballot> = Vec::new();
        ballots.extend(dictionary.as_ref().map(Ballot::from));
        ballots.extend(first.map(Ballot::from));

        if self.enable_multi_model && !self.voter_models.is_empty() {
            for model in &self.voter_models {
                match self.llm.map_column(model, column, samples, context).await {
                    Ok(m) => ballots.push(m.into()),
                    Err(reason) => warn!("Voter {} on {} degraded: {}", model, column, reason),
                }
            }
            if ballots.len() >= 2 {
                if let Some(voted) = vote(column, &ballots) {
                    self.learn(column, &voted).await;
                    return voted;
                }
            }
        }

        // Best effort: the most confident ballot, earlier ballots winning ties.
        let best = ballots
            .into_iter()
            .enumerate()
            .max_by(|(ia, a), (ib, b)| a.confidence.total_cmp(&b.confidence).then(ib.cmp(ia)))
            .map(|(i, ballot)| (i == 0 && dictionary.is_some(), ballot));
        match best {
            Some((true, ballot)) => ballot_mapping(column, ballot, MappingMethod::Rule),
            Some((false, ballot)) => {
                let mapping = ballot_mapping(column, ballot, MappingMethod::Llm);
                self.learn(column, &mapping).await;
                mapping
            }
            None => FieldMapping::unmapped(column, MappingMethod::Rule),
        }
    }

    async fn learn(&self, column: &str, mapping: &FieldMapping) {
        let Some(field) = mapping.standard_field.clone() else {
            return;
        };
        if mapping.confidence < self.learning_threshold {
            return;
        }
        let learned = LearnedMapping {
            standard_field: field,
            confidence: mapping.confidence,
            category: mapping.category.clone(),
            description: mapping.description.clone(),
            source: mapping.method,
        };
        if let Err(e) = self.learned.add(column, learned).await {
            warn!("Could not store learned mapping for {}: {:#}", column, e);
        }
    }
}

/// Majority over ballots. Ties go to the earliest ballot (dictionary, fast
/// model, then voters in configured order). Confidence is the mean of the
/// agreement ratio and the winners' own mean confidence.
fn vote(column: &str, ballots: &[Ballot]) -> Option<FieldMapping> {
    let mut best: Option<(usize, usize)> = None;
    for (i, ballot) in ballots.iter().enumerate() {
        let count = ballots.iter().filter(|b| b.field == ballot.field).count();
        if best.map(|(_, c)| count > c).unwrap_or(true) {
            best = Some((i, count));
        }
    }
    let (winner, count) = best?;
    let field = &ballots[winner].field;
    let agreeing: Vec<f64> = ballots
        .iter()
        .filter(|b| &b.field == field)
        .map(|b| b.confidence)
        .collect();
    let agreement = count as f64 / ballots.len() as f64;
    let mean_confidence = agreeing.iter().sum::<f64>() / agreeing.len() as f64;

    info!(
        "Multi-model vote on {}: {} ({}/{} ballots)",
        column,
        field,
        count,
        ballots.len()
    );
    let winner = &ballots[winner];
    Some(FieldMapping {
        original_column: column.to_string(),
        standard_field: Some(winner.field.clone()),
        confidence: crate::confidence::normalize((agreement + mean_confidence) / 2.0),
        method: MappingMethod::MultiModel,
        category: winner.category.clone(),
        description: winner.description.clone(),
    })
}

fn custom_mapping(column: &str, field: &str) -> FieldMapping {
    let known = dictionary::resolve(field);
    FieldMapping {
        original_column: column.to_string(),
        standard_field: Some(field.to_string()),
        confidence: 1.0,
        method: MappingMethod::Custom,
        category: known.map(|f| f.category.to_string()).unwrap_or_default(),
        description: known.map(|f| f.label.to_string()).unwrap_or_default(),
    }
}

fn dictionary_mapping(column: &str, m: &DictionaryMatch) -> FieldMapping {
    ballot_mapping(column, Ballot::from(m), MappingMethod::Rule)
}

fn ballot_mapping(column: &str, ballot: Ballot, method: MappingMethod) -> FieldMapping {
    FieldMapping {
        original_column: column.to_string(),
        standard_field: Some(ballot.field),
        confidence: crate::confidence::normalize(ballot.confidence),
        method,
        category: ballot.category,
        description: ballot.description,
    }
}

/// First five non-empty values of a column.
pub fn column_samples(rows: &Rows, index: usize) -> Vec<String> {
    rows.iter()
        .filter_map(|row| row.get(index))
        .filter(|c| !c.is_empty())
        .take(MAX_SAMPLES)
        .map(CellValue::text)
        .collect()
}

/// Apply user corrections over computed mappings.
pub fn apply_corrections(
    mappings: &mut [FieldMapping],
    corrections: &[crate::model::UserCorrection],
) {
    for correction in corrections {
        let target = matcher::normalize(&correction.column);
        for mapping in mappings
            .iter_mut()
            .filter(|m| matcher::normalize(&m.original_column) == target)
        {
            *mapping = custom_mapping(&mapping.original_column, &correction.standard_field);
        }
    }
}
