mod common;

use common::{quiet_config, service, Reply, ScriptedClient, BUDGET_REPORT};
use sheet_inference::{DetectionMethod, HeaderRowKind, InferenceConfig};

#[tokio::test]
async fn test_budget_report_detected_by_rules() {
    let client = ScriptedClient::texts(&[]);
    let inference = service(client.clone(), quiet_config());

    let result = inference
        .detect_structure(BUDGET_REPORT.as_bytes(), "budget.csv", 0, None, None)
        .await;

    assert_eq!(result.method, DetectionMethod::Rule);
    assert_eq!(result.data_start_row, 3);
    assert_eq!(result.header_row_count, 3);
    let kinds: Vec<_> = result.header_rows.iter().map(|r| r.kind).collect();
    assert_eq!(
        kinds,
        vec![HeaderRowKind::Title, HeaderRowKind::Subtitle, HeaderRowKind::ColumnNames]
    );
    assert!((result.confidence - (0.9 + 0.85 + 0.85) / 3.0).abs() < 1e-3);
    assert_eq!(result.column_names(), vec!["项目", "预算", "实际"]);
    assert_eq!(client.calls(), 0);
}

#[tokio::test]
async fn test_llm_timeout_keeps_rule_result() {
    let client = ScriptedClient::new(vec![Reply::Hang]);
    let config = InferenceConfig {
        structure_confidence_threshold: 0.95,
        ..quiet_config()
    };
    let inference = service(client.clone(), config);

    let result = inference
        .detect_structure(BUDGET_REPORT.as_bytes(), "budget.csv", 0, None, None)
        .await;

    assert_eq!(result.method, DetectionMethod::Rule);
    assert_eq!(result.data_start_row, 3);
    assert!((result.confidence - 0.8667).abs() < 1e-3);
    let note = result.note.expect("degradation note");
    assert!(note.contains("llm_fast: timeout"), "{}", note);
    assert!(result.error.is_none());
}

#[tokio::test]
async fn test_impossible_llm_boundary_is_rejected() {
    let client = ScriptedClient::texts(&[
        r#"{"header_row_count": 2, "data_start_row": 40, "confidence": 0.99}"#,
    ]);
    let config = InferenceConfig {
        structure_confidence_threshold: 0.95,
        enable_vision: false,
        enable_multi_model: false,
        ..quiet_config()
    };
    let inference = service(client, config);

    let result = inference
        .detect_structure(BUDGET_REPORT.as_bytes(), "budget.csv", 0, None, None)
        .await;

    assert_eq!(result.method, DetectionMethod::Rule);
    assert_eq!(result.data_start_row, 3);
    assert!(result.note.unwrap().contains("dimension_mismatch"));
}

#[tokio::test]
async fn test_wide_layout_escalates_to_llm() {
    let csv = "项目,1月,2月,3月\n,预算,预算,预算\n收入,1,2,3\n成本,4,5,6\n";
    let client = ScriptedClient::texts(&[
        "Sure:\n```json\n{\"header_row_count\": 2, \"data_start_row\": 2, \"confidence\": 0.9,}\n```",
    ]);
    let inference = service(client.clone(), quiet_config());

    let result = inference
        .detect_structure(csv.as_bytes(), "wide.csv", 0, None, None)
        .await;

    assert_eq!(result.method, DetectionMethod::LlmFast);
    assert_eq!(result.data_start_row, 2);
    assert!(result.note.unwrap().contains("complex layout"));
    assert_eq!(client.calls(), 1);
    assert_eq!(client.models(), vec![quiet_config().fast_model]);
}

#[tokio::test]
async fn test_results_stay_within_bounds() {
    let sheets = [
        BUDGET_REPORT,
        "a,b,c\n1,2,3\n",
        "only text\nmore text\n",
        "年度报表\n\n部门,人数\n销售,12\n",
        "1,2,3\n4,5,6\n",
    ];

    for (i, sheet) in sheets.iter().enumerate() {
        let inference = service(ScriptedClient::texts(&[]), quiet_config());
        let filename = format!("sheet{}.csv", i);
        for forced in [None, Some(DetectionMethod::Rule), Some(DetectionMethod::LlmFast)] {
            let result = inference
                .detect_structure(sheet.as_bytes(), &filename, 0, None, forced)
                .await;
            assert!(result.error.is_none(), "{}: {:?}", sheet, result.error);
            assert!((0.0..=1.0).contains(&result.confidence), "{}", sheet);
            assert!(result.header_row_count <= result.data_start_row, "{}", sheet);
        }
    }
}

#[tokio::test]
async fn test_unknown_extension_fails_softly() {
    let inference = service(ScriptedClient::texts(&[]), quiet_config());
    let result = inference
        .detect_structure(b"%PDF-1.7", "report.pdf", 0, None, None)
        .await;
    assert_eq!(result.confidence, 0.0);
    assert!(result.error.is_some());
}

#[tokio::test]
async fn test_split_json_objects_are_merged() {
    let client = ScriptedClient::texts(&[
        r#"Here is the result: {"header_row_count": 3}{"data_start_row": 3, "confidence": 0.97}"#,
    ]);
    let inference = service(client, quiet_config());

    let result = inference
        .detect_structure(
            BUDGET_REPORT.as_bytes(),
            "budget.csv",
            0,
            None,
            Some(DetectionMethod::LlmFast),
        )
        .await;

    assert_eq!(result.method, DetectionMethod::LlmFast);
    assert_eq!(result.data_start_row, 3);
    assert_eq!(result.confidence, 0.97);
    assert!(result.note.is_none());
}
