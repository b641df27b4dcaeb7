//! Multi-model voting over structure results, plus bounded self-correction.

use crate::error::DegradationReason;
use crate::model::{DetectionMethod, DetectionResult, MergedCellRange, Rows};
use crate::structure::llm::StructureLlm;
use tracing::{debug, info, warn};

/// Most frequent value among `values`. Ties go to the value seen first.
/// Returns the winner and the fraction of values agreeing with it.
fn majority(values: &[usize]) -> Option<(usize, f64)> {
    let mut best: Option<(usize, usize)> = None;
    for value in values {
        let count = values.iter().filter(|v| *v == value).count();
        if best.map(|(_, c)| count > c).unwrap_or(true) {
            best = Some((*value, count));
        }
    }
    best.map(|(value, count)| (value, count as f64 / values.len() as f64))
}

/// Reconcile contributors given in priority order (rule first).
///
/// `header_row_count` and `data_start_row` are voted independently; the
/// confidence is the mean of both agreement ratios.
pub fn tally(contributors: &[DetectionResult]) -> Option<DetectionResult> {
    let boundaries: Vec<usize> = contributors.iter().map(|r| r.data_start_row).collect();
    let counts: Vec<usize> = contributors.iter().map(|r| r.header_row_count).collect();
    let (data_start_row, boundary_agreement) = majority(&boundaries)?;
    let (header_row_count, count_agreement) = majority(&counts)?;

    let base = contributors
        .iter()
        .find(|r| r.data_start_row == data_start_row)?;
    let confidence = (boundary_agreement + count_agreement) / 2.0;
    debug!(
        "Vote over {} contributors: data_start_row={} ({:.2}), header_row_count={} ({:.2})",
        contributors.len(),
        data_start_row,
        boundary_agreement,
        header_row_count,
        count_agreement
    );

    Some(DetectionResult {
        method: DetectionMethod::MultiModel,
        confidence,
        header_row_count: header_row_count.min(data_start_row),
        data_start_row,
        note: None,
        error: None,
        ..base.clone()
    })
}

/// Re-prompt up to `rounds` times with the running best guess.
///
/// A round that parses replaces the guess even if its confidence is lower;
/// failed rounds are returned as degradations and leave the guess unchanged.
pub async fn self_correct(
    llm: &StructureLlm,
    rows: &Rows,
    merged: &[MergedCellRange],
    sheet_label: &str,
    mut current: DetectionResult,
    rounds: usize,
) -> (DetectionResult, Vec<DegradationReason>) {
    let mut failures = Vec::new();

    for round in 1..=rounds {
        match llm.review(rows, merged, sheet_label, &current).await {
            Ok(corrected) => {
                info!(
                    "Self-correction round {}/{}: data_start_row {} -> {}, confidence {:.2} -> {:.2}",
                    round,
                    rounds,
                    current.data_start_row,
                    corrected.data_start_row,
                    current.confidence,
                    corrected.confidence
                );
                current = corrected;
            }
            Err(reason) => {
                warn!("Self-correction round {}/{} degraded: {}", round, rounds, reason);
                failures.push(reason);
            }
        }
    }

    (current, failures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InferenceConfig;
    use crate::llm::testing::{Scripted, ScriptedClient};
    use crate::llm::LlmInvoker;
    use crate::model::CellValue;

    fn result(method: DetectionMethod, header_row_count: usize, data_start_row: usize) -> DetectionResult {
        DetectionResult {
            method,
            confidence: 0.6,
            header_row_count,
            data_start_row,
            ..DetectionResult::failed("")
        }
    }

    #[test]
    fn test_majority_wins() {
        let voted = tally(&[
            result(DetectionMethod::Rule, 2, 3),
            result(DetectionMethod::LlmFast, 3, 3),
            result(DetectionMethod::MultiModel, 3, 3),
        ])
        .unwrap();

        assert_eq!(voted.method, DetectionMethod::MultiModel);
        assert_eq!(voted.data_start_row, 3);
        assert_eq!(voted.header_row_count, 3);
        assert!((voted.confidence - (1.0 + 2.0 / 3.0) / 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_tie_goes_to_rule() {
        let voted = tally(&[
            result(DetectionMethod::Rule, 2, 2),
            result(DetectionMethod::LlmFast, 4, 4),
        ])
        .unwrap();
        assert_eq!(voted.data_start_row, 2);
        assert_eq!(voted.header_row_count, 2);
        assert_eq!(voted.confidence, 0.5);
    }

    #[test]
    fn test_empty_vote() {
        assert!(tally(&[]).is_none());
    }

    #[tokio::test]
    async fn test_self_correction_keeps_most_recent_parse() {
        let client = ScriptedClient::new(vec![
            Scripted::Reply(r#"{"header_row_count": 1, "data_start_row": 1, "confidence": 0.95}"#.into()),
            Scripted::Reply("not json at all".into()),
        ]);
        let config = InferenceConfig {
            llm_max_retries: 0,
            ..InferenceConfig::default()
        };
        let llm = StructureLlm::new(
            LlmInvoker::new(client.clone(), &config),
            "fast".into(),
            "vision".into(),
            false,
        );
        let rows: Rows = vec![
            vec![CellValue::from("a"), CellValue::from("b")],
            vec![CellValue::from("x"), CellValue::from(1i64)],
        ];

        let (corrected, failures) =
            self_correct(&llm, &rows, &[], "s", result(DetectionMethod::Rule, 0, 0), 2).await;

        assert_eq!(corrected.data_start_row, 1);
        assert_eq!(corrected.method, DetectionMethod::MultiModel);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].kind(), "parse_failure");
        assert_eq!(client.call_count(), 2);
    }
}
