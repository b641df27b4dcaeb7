//! Error types.
//!
//! Inference layers never abort the pipeline. They return a
//! [`DegradationReason`] instead, which the escalation ladder reads as
//! "no result here, try the next layer".

use std::time::Duration;
use thiserror::Error;

/// Why a layer produced no usable result.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DegradationReason {
    /// The LLM response could not be recovered as JSON after every repair pass.
    #[error("unparsable response: {0}")]
    ParseFailure(String),

    /// The external call did not answer within its budget.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// A structural invariant was violated (e.g. header rows beyond the row count).
    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// The layer abstained on purpose (disabled, nothing to render, unknown field).
    #[error("no result: {0}")]
    NoResult(String),

    /// Transport or HTTP failure talking to the completion endpoint.
    #[error("upstream failure: {0}")]
    Upstream(String),
}

impl DegradationReason {
    /// Short machine-friendly label used in result notes and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ParseFailure(_) => "parse_failure",
            Self::Timeout(_) => "timeout",
            Self::DimensionMismatch(_) => "dimension_mismatch",
            Self::NoResult(_) => "no_result",
            Self::Upstream(_) => "upstream",
        }
    }
}

/// Errors raised at the spreadsheet reader boundary.
#[derive(Debug, Error)]
pub enum SheetError {
    #[error("unsupported file type: .{0} (supported: .csv, .xlsx, .xlsm, .xlsb)")]
    UnsupportedFormat(String),

    #[error("failed to open workbook: {0}")]
    Workbook(String),

    #[error("sheet index {index} out of range ({available} sheets)")]
    SheetIndex { index: usize, available: usize },

    #[error("failed to read CSV: {0}")]
    Csv(#[from] csv::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_labels() {
        assert_eq!(
            DegradationReason::Timeout(Duration::from_secs(3)).kind(),
            "timeout"
        );
        assert_eq!(
            DegradationReason::ParseFailure("x".into()).kind(),
            "parse_failure"
        );
    }

    #[test]
    fn test_display_includes_detail() {
        let reason = DegradationReason::DimensionMismatch("data_start_row 40 > 12 rows".into());
        assert_eq!(
            reason.to_string(),
            "dimension mismatch: data_start_row 40 > 12 rows"
        );
    }
}
