//! Fault-tolerant JSON recovery for LLM responses.
//!
//! Model output is treated as possibly malformed JSON embedded in prose or a
//! fenced code block. Recovery passes run in order, cheapest first:
//!
//! 1. direct parse of the extracted candidate
//! 2. trailing-comma repair (`,}` / `,]`)
//! 3. missing-comma repair between adjacent values (`}{` becomes `},{`)
//! 4. leading value: the first complete value when prose follows it
//! 5. truncation recovery: keep the prefix up to the last closing bracket at depth 0
//!
//! The passes run on a candidate starting at each opening bracket in turn.
//!
//! Adjacent top-level objects are merged into one object, later keys winning.

use crate::error::DegradationReason;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;

static TRAILING_COMMA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r",\s*([}\]])").expect("valid regex"));
static ADJACENT_OBJECTS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\}\s*\{").expect("valid regex"));
static ADJACENT_ARRAYS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\]\s*\[").expect("valid regex"));

/// Opening brackets tried as candidate starts before giving up.
const MAX_CANDIDATE_STARTS: usize = 16;

/// Recover a JSON value from raw model output.
///
/// Each opening bracket is tried as a candidate start, in order, so brackets in
/// the surrounding prose do not hide the answer.
pub fn recover_json(response: &str) -> Result<Value, DegradationReason> {
    let body = strip_fences(response);
    let starts: Vec<usize> = body
        .match_indices(['{', '['])
        .map(|(i, _)| i)
        .take(MAX_CANDIDATE_STARTS)
        .collect();
    if starts.is_empty() {
        return Err(DegradationReason::ParseFailure(format!(
            "no JSON found in: {}",
            preview(response)
        )));
    }

    for start in starts {
        let Some(candidate) = candidate_from(&body[start..]) else {
            continue;
        };
        if let Some(value) = repair(candidate) {
            return Ok(value);
        }
    }

    Err(DegradationReason::ParseFailure(format!(
        "all repair passes failed: {}",
        preview(body)
    )))
}

fn repair(candidate: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(candidate) {
        return Some(value);
    }

    let without_trailing = remove_trailing_commas(candidate);
    if let Ok(value) = serde_json::from_str::<Value>(&without_trailing) {
        tracing::debug!("Recovered JSON after trailing-comma repair");
        return Some(value);
    }

    if let Some(value) = repair_missing_commas(&without_trailing) {
        tracing::debug!("Recovered JSON after missing-comma repair");
        return Some(value);
    }

    if let Some(value) = first_value(&without_trailing) {
        tracing::debug!("Recovered leading JSON value followed by prose");
        return Some(value);
    }

    if let Some(value) = recover_truncated(&without_trailing) {
        tracing::debug!("Recovered JSON from truncated response");
        return Some(value);
    }

    None
}

/// Recover and deserialize into `T`. A structure mismatch is also a parse failure.
pub fn recover_as<T: DeserializeOwned>(response: &str) -> Result<T, DegradationReason> {
    let value = recover_json(response)?;
    serde_json::from_value(value)
        .map_err(|e| DegradationReason::ParseFailure(format!("JSON structure mismatch: {}", e)))
}

/// Contents of the first fenced block, or the whole response.
fn strip_fences(response: &str) -> &str {
    if response.contains("```json") {
        response
            .split("```json")
            .nth(1)
            .and_then(|s| s.split("```").next())
            .unwrap_or(response)
    } else if response.contains("```") {
        response.split("```").nth(1).unwrap_or(response)
    } else {
        response
    }
}

/// Slice from an opening bracket to the last closing one. When there is no
/// closing bracket (truncated output) the slice runs to the end.
fn candidate_from(tail: &str) -> Option<&str> {
    let end = tail.rfind(['}', ']']).map(|i| i + 1).unwrap_or(tail.len());
    let candidate = tail[..end].trim();
    if candidate.is_empty() {
        None
    } else {
        Some(candidate)
    }
}

/// The first complete value, ignoring whatever follows it.
fn first_value(text: &str) -> Option<Value> {
    serde_json::Deserializer::from_str(text)
        .into_iter::<Value>()
        .next()?
        .ok()
}

fn remove_trailing_commas(text: &str) -> String {
    TRAILING_COMMA.replace_all(text, "$1").into_owned()
}

fn repair_missing_commas(text: &str) -> Option<Value> {
    let objects_joined = ADJACENT_OBJECTS.replace_all(text, "},{");
    let joined = ADJACENT_ARRAYS.replace_all(&objects_joined, "],[");
    if joined == text {
        return None;
    }

    if let Ok(value) = serde_json::from_str::<Value>(&joined) {
        return Some(value);
    }

    // Several top-level values: wrap them into an array, then merge objects.
    let wrapped = format!("[{}]", joined);
    match serde_json::from_str::<Value>(&wrapped) {
        Ok(Value::Array(items)) => Some(merge_top_level(items)),
        _ => None,
    }
}

/// Merge an array of top-level objects into one object; other arrays stay as-is.
fn merge_top_level(items: Vec<Value>) -> Value {
    if !items.iter().all(Value::is_object) {
        return Value::Array(items);
    }
    let mut merged = serde_json::Map::new();
    for item in items {
        if let Value::Object(map) = item {
            merged.extend(map);
        }
    }
    Value::Object(merged)
}

fn recover_truncated(text: &str) -> Option<Value> {
    let scan = scan_brackets(text);

    if let Some(end) = scan.last_depth_zero_close {
        if let Ok(value) = serde_json::from_str::<Value>(&remove_trailing_commas(&text[..end])) {
            return Some(value);
        }
    }

    // Unterminated top-level array: keep complete elements and close it.
    if text.starts_with('[') {
        if let Some(end) = scan.last_depth_one_close {
            let repaired = format!("{}]", remove_trailing_commas(&text[..end]));
            if let Ok(value) = serde_json::from_str::<Value>(&repaired) {
                return Some(value);
            }
        }
    }

    None
}

struct BracketScan {
    /// Byte offset just past the last `}`/`]` that returned to depth 0.
    last_depth_zero_close: Option<usize>,
    /// Byte offset just past the last `}`/`]` that returned to depth 1.
    last_depth_one_close: Option<usize>,
}

fn scan_brackets(text: &str) -> BracketScan {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    let mut scan = BracketScan {
        last_depth_zero_close: None,
        last_depth_one_close: None,
    };

    for (i, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.saturating_sub(1);
                match depth {
                    0 => scan.last_depth_zero_close = Some(i + 1),
                    1 => scan.last_depth_one_close = Some(i + 1),
                    _ => {}
                }
            }
            _ => {}
        }
    }

    scan
}

fn preview(text: &str) -> String {
    text.chars().take(200).collect()
}
