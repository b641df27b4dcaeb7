//! Header/data boundary detection.
//!
//! The escalation ladder runs rule engine, fast LLM, vision LLM and the
//! multi-model voter in that order, stopping at the first result whose
//! confidence clears the structure threshold. Nothing here returns an error:
//! each layer that cannot answer leaves a note on the final result instead.

pub mod llm;
pub mod render;
pub mod rules;
pub mod vote;

use crate::config::InferenceConfig;
use crate::confidence::ConfidenceGate;
use crate::error::DegradationReason;
use crate::llm::LlmInvoker;
use crate::model::{DetectionMethod, DetectionResult, MergedCellRange, Rows};
use llm::StructureLlm;
use rules::RuleEngine;
use tracing::{info, warn};

pub struct StructureDetector {
    rules: RuleEngine,
    llm: StructureLlm,
    gate: ConfidenceGate,
    voter_models: Vec<String>,
    enable_multi_model: bool,
    max_self_correction_rounds: usize,
}

/// Degradations collected while climbing the ladder, rendered into the note.
#[derive(Default)]
struct Trail {
    entries: Vec<String>,
}

impl Trail {
    fn degraded(&mut self, method: DetectionMethod, reason: &DegradationReason) {
        warn!("Structure layer {} degraded: {}", method.as_str(), reason);
        self.entries
            .push(format!("{}: {} ({})", method.as_str(), reason.kind(), reason));
    }

    fn push(&mut self, entry: impl Into<String>) {
        self.entries.push(entry.into());
    }

    fn annotate(self, mut result: DetectionResult) -> DetectionResult {
        for entry in self.entries {
            result.push_note(entry);
        }
        result
    }
}

impl StructureDetector {
    pub fn new(invoker: LlmInvoker, config: &InferenceConfig) -> Self {
        Self {
            rules: RuleEngine::new(config.max_header_rows),
            llm: StructureLlm::new(
                invoker,
                config.fast_model.clone(),
                config.vision_model.clone(),
                config.enable_vision,
            ),
            gate: ConfidenceGate::new(config.structure_confidence_threshold),
            voter_models: config.voter_models.clone(),
            enable_multi_model: config.enable_multi_model,
            max_self_correction_rounds: config.max_self_correction_rounds,
        }
    }

    /// Detect the header region of `rows`, optionally forcing one handler.
    pub async fn detect(
        &self,
        rows: &Rows,
        merged: &[MergedCellRange],
        sheet_label: &str,
        forced: Option<DetectionMethod>,
    ) -> DetectionResult {
        if rules::table_width(rows) == 0 {
            return DetectionResult::failed(format!("sheet {} has no values", sheet_label));
        }

        match forced {
            Some(method) => self.run_forced(method, rows, merged, sheet_label).await,
            None => self.escalate(rows, merged, sheet_label).await,
        }
    }

    async fn escalate(&self, rows: &Rows, merged: &[MergedCellRange], sheet_label: &str) -> DetectionResult {
        let mut trail = Trail::default();
        let complexity = self.rules.assess_complexity(rows, merged);
        let rule = self.rules.detect(rows, merged);
        let rule_passed = self.gate.passes(rule.confidence);
        info!(
            "Rule engine on {}: data_start_row={}, confidence={:.2}, passed={}, complex={}",
            sheet_label, rule.data_start_row, rule.confidence, rule_passed, complexity.complex
        );

        if rule_passed && !complexity.complex {
            return rule;
        }
        if complexity.complex {
            trail.push(format!("complex layout: {}", complexity.reasons.join(", ")));
        }

        let mut contributors = vec![rule];

        match self.llm.detect_text(rows, merged, sheet_label).await {
            Ok(result) if self.gate.passes(result.confidence) => return trail.annotate(result),
            Ok(result) => contributors.push(result),
            Err(reason) => trail.degraded(DetectionMethod::LlmFast, &reason),
        }

        match self.llm.detect_vision(rows, merged, sheet_label).await {
            Ok(result) if self.gate.passes(result.confidence) => return trail.annotate(result),
            Ok(result) => contributors.push(result),
            Err(reason) => trail.degraded(DetectionMethod::LlmVision, &reason),
        }

        if self.enable_multi_model {
            if let Some(result) = self
                .multi_model(rows, merged, sheet_label, &mut contributors, &mut trail)
                .await
            {
                return trail.annotate(result);
            }
        }

        trail.annotate(best_effort(contributors))
    }

    /// Poll the voter models, tally every contributor and, if the vote is
    /// still unconvincing, run the self-correction rounds on it.
    async fn multi_model(
        &self,
        rows: &Rows,
        merged: &[MergedCellRange],
        sheet_label: &str,
        contributors: &mut Vec<DetectionResult>,
        trail: &mut Trail,
    ) -> Option<DetectionResult> {
        for model in &self.voter_models {
            match self
                .llm
                .detect_with(model, rows, merged, sheet_label, DetectionMethod::MultiModel)
                .await
            {
                Ok(result) => contributors.push(result),
                Err(reason) => {
                    trail.push(format!("voter {}: {}", model, reason.kind()));
                    warn!("Voter {} degraded: {}", model, reason);
                }
            }
        }

        if contributors.len() < 2 {
            trail.push(format!(
                "{}: too few contributors to vote",
                DetectionMethod::MultiModel.as_str()
            ));
            return None;
        }

        let voted = vote::tally(contributors)?;
        let passed = self.gate.passes(voted.confidence);
        info!(
            "Multi-model vote on {}: data_start_row={}, confidence={:.2}, passed={}",
            sheet_label, voted.data_start_row, voted.confidence, passed
        );
        if passed || self.max_self_correction_rounds == 0 {
            return Some(voted);
        }

        let (corrected, failures) = vote::self_correct(
            &self.llm,
            rows,
            merged,
            sheet_label,
            voted,
            self.max_self_correction_rounds,
        )
        .await;
        for reason in &failures {
            trail.push(format!("self_correction: {}", reason.kind()));
        }
        Some(corrected)
    }

    async fn run_forced(
        &self,
        method: DetectionMethod,
        rows: &Rows,
        merged: &[MergedCellRange],
        sheet_label: &str,
    ) -> DetectionResult {
        info!("Forced structure method {} on {}", method.as_str(), sheet_label);
        let mut trail = Trail::default();
        let rule = self.rules.detect(rows, merged);

        let outcome = match method {
            DetectionMethod::Rule => return rule,
            DetectionMethod::LlmFast => self.llm.detect_text(rows, merged, sheet_label).await,
            DetectionMethod::LlmVision => self.llm.detect_vision(rows, merged, sheet_label).await,
            DetectionMethod::MultiModel => {
                let mut contributors = vec![rule.clone()];
                match self.llm.detect_text(rows, merged, sheet_label).await {
                    Ok(result) => contributors.push(result),
                    Err(reason) => trail.degraded(DetectionMethod::LlmFast, &reason),
                }
                match self
                    .multi_model(rows, merged, sheet_label, &mut contributors, &mut trail)
                    .await
                {
                    Some(result) => Ok(result),
                    None => Err(DegradationReason::NoResult("vote unavailable".to_string())),
                }
            }
        };

        match outcome {
            Ok(result) => trail.annotate(result),
            Err(reason) => {
                trail.degraded(method, &reason);
                trail.annotate(rule)
            }
        }
    }
}

/// Highest-confidence contributor; ties keep the earlier (cheaper) one.
fn best_effort(contributors: Vec<DetectionResult>) -> DetectionResult {
    let mut best: Option<DetectionResult> = None;
    for candidate in contributors {
        if best
            .as_ref()
            .map(|b| candidate.confidence > b.confidence)
            .unwrap_or(true)
        {
            best = Some(candidate);
        }
    }
    best.unwrap_or_else(|| DetectionResult::failed("no structure layer produced a result"))
}
