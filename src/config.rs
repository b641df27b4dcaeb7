//! Inference configuration.
//!
//! Thresholds, model identifiers and layer switches. Loaded from a JSON file
//! and/or `SHEET_INFERENCE_*` environment variables; every field has a default.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_FAST_MODEL: &str = "google/gemini-2.5-flash";
const DEFAULT_VISION_MODEL: &str = "qwen/qwen2.5-vl-72b-instruct";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Minimum confidence for a structure layer to end the ladder.
    pub structure_confidence_threshold: f64,
    /// Minimum confidence for a mapping layer to end the ladder.
    pub semantic_confidence_threshold: f64,
    /// LLM mappings at or above this are written to the learned store.
    pub learning_threshold: f64,
    /// Results below this are not put into the schema cache.
    pub cache_min_confidence: f64,
    pub cache_ttl_seconds: u64,
    pub cache_max_entries: usize,
    /// Minimum Jaccard similarity for a header-set cache hit.
    pub similarity_threshold: f64,
    pub max_self_correction_rounds: usize,
    /// Rows scanned (and sent to the LLM) when looking for the header region.
    pub max_header_rows: usize,
    pub llm_timeout_seconds: u64,
    pub llm_max_retries: usize,
    pub llm_temperature: f32,
    pub llm_max_tokens: u32,
    pub fast_model: String,
    pub vision_model: String,
    /// Extra models consulted by the multi-model voter, in priority order.
    pub voter_models: Vec<String>,
    pub enable_vision: bool,
    pub enable_multi_model: bool,
    /// Column name to standard field overrides, applied before any inference.
    pub custom_mappings: HashMap<String, String>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            structure_confidence_threshold: 0.8,
            semantic_confidence_threshold: 0.7,
            learning_threshold: 0.7,
            cache_min_confidence: 0.7,
            cache_ttl_seconds: 3600,
            cache_max_entries: 100,
            similarity_threshold: 0.7,
            max_self_correction_rounds: 2,
            max_header_rows: 10,
            llm_timeout_seconds: 30,
            llm_max_retries: 1,
            llm_temperature: 0.1,
            llm_max_tokens: 2048,
            fast_model: DEFAULT_FAST_MODEL.to_string(),
            vision_model: DEFAULT_VISION_MODEL.to_string(),
            voter_models: vec!["deepseek/deepseek-chat".to_string()],
            enable_vision: true,
            enable_multi_model: true,
            custom_mappings: HashMap::new(),
        }
    }
}

impl InferenceConfig {
    /// Load a config from a JSON file. Missing fields fall back to defaults.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {:?}", path))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config: {:?}", path))?;
        info!("Loaded inference config from {:?}", path);
        Ok(config)
    }

    /// Defaults (or `SHEET_INFERENCE_CONFIG` file) overlaid with env variables.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var("SHEET_INFERENCE_CONFIG") {
            Ok(path) => Self::load_from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `SHEET_INFERENCE_*` overrides read through `lookup`.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parse<T: std::str::FromStr>(
            lookup: &dyn Fn(&str) -> Option<String>,
            key: &str,
            slot: &mut T,
        ) {
            if let Some(raw) = lookup(key) {
                match raw.trim().parse::<T>() {
                    Ok(v) => *slot = v,
                    Err(_) => warn!("Ignoring invalid value for {}: {:?}", key, raw),
                }
            }
        }

        parse(&lookup, "SHEET_INFERENCE_STRUCTURE_THRESHOLD", &mut self.structure_confidence_threshold);
        parse(&lookup, "SHEET_INFERENCE_SEMANTIC_THRESHOLD", &mut self.semantic_confidence_threshold);
        parse(&lookup, "SHEET_INFERENCE_LEARNING_THRESHOLD", &mut self.learning_threshold);
        parse(&lookup, "SHEET_INFERENCE_CACHE_MIN_CONFIDENCE", &mut self.cache_min_confidence);
        parse(&lookup, "SHEET_INFERENCE_CACHE_TTL_SECONDS", &mut self.cache_ttl_seconds);
        parse(&lookup, "SHEET_INFERENCE_CACHE_MAX_ENTRIES", &mut self.cache_max_entries);
        parse(&lookup, "SHEET_INFERENCE_SIMILARITY_THRESHOLD", &mut self.similarity_threshold);
        parse(&lookup, "SHEET_INFERENCE_MAX_SELF_CORRECTION_ROUNDS", &mut self.max_self_correction_rounds);
        parse(&lookup, "SHEET_INFERENCE_MAX_HEADER_ROWS", &mut self.max_header_rows);
        parse(&lookup, "SHEET_INFERENCE_LLM_TIMEOUT_SECONDS", &mut self.llm_timeout_seconds);
        parse(&lookup, "SHEET_INFERENCE_LLM_MAX_RETRIES", &mut self.llm_max_retries);
        parse(&lookup, "SHEET_INFERENCE_FAST_MODEL", &mut self.fast_model);
        parse(&lookup, "SHEET_INFERENCE_VISION_MODEL", &mut self.vision_model);
        parse(&lookup, "SHEET_INFERENCE_ENABLE_VISION", &mut self.enable_vision);
        parse(&lookup, "SHEET_INFERENCE_ENABLE_MULTI_MODEL", &mut self.enable_multi_model);

        if let Some(models) = lookup("SHEET_INFERENCE_VOTER_MODELS") {
            self.voter_models = models
                .split(',')
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty())
                .collect();
        }
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_seconds)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: InferenceConfig =
            serde_json::from_str(r#"{"learning_threshold": 0.6, "enable_vision": false}"#).unwrap();
        assert_eq!(config.learning_threshold, 0.6);
        assert!(!config.enable_vision);
        assert_eq!(config.cache_ttl_seconds, 3600);
        assert_eq!(config.max_header_rows, 10);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = InferenceConfig::default();
        let env: HashMap<&str, &str> = [
            ("SHEET_INFERENCE_STRUCTURE_THRESHOLD", "0.9"),
            ("SHEET_INFERENCE_ENABLE_MULTI_MODEL", "false"),
            ("SHEET_INFERENCE_CACHE_MAX_ENTRIES", "not-a-number"),
            ("SHEET_INFERENCE_VOTER_MODELS", "a/one, b/two,"),
        ]
        .into_iter()
        .collect();

        config.apply_env_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.structure_confidence_threshold, 0.9);
        assert!(!config.enable_multi_model);
        assert_eq!(config.cache_max_entries, 100);
        assert_eq!(config.voter_models, vec!["a/one", "b/two"]);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inference.json");
        std::fs::write(&path, r#"{"custom_mappings": {"营收": "revenue"}}"#).unwrap();

        let config = InferenceConfig::load_from_file(&path).unwrap();
        assert_eq!(config.custom_mappings.get("营收").map(String::as_str), Some("revenue"));
    }
}
