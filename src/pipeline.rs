//! `SchemaInference`: the service callers talk to.
//!
//! Composes the sheet reader, structure ladder, field mapper, schema cache and
//! learned store. Inference failures never surface as errors here; callers get
//! a result with a `note` or `error` field instead.

use crate::config::InferenceConfig;
use crate::error::SheetError;
use crate::learned::LearnedStore;
use crate::llm::LlmInvoker;
use crate::model::{DetectionMethod, DetectionResult, FieldMapping, MergedCellRange, Rows, UserCorrection};
use crate::openrouter::CompletionClient;
use crate::schema_cache::{CacheStats, CachedAnalysis, SchemaCache};
use crate::semantic::{self, matcher, FieldMapper};
use crate::sheet_reader;
use crate::structure::StructureDetector;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Data rows read below the header window for column samples.
const SAMPLE_ROWS: usize = 20;

/// Combined detection and mapping for one sheet.
#[derive(Debug, Clone, Serialize)]
pub struct SheetAnalysis {
    pub cache_key: String,
    pub detection: DetectionResult,
    pub mappings: Vec<FieldMapping>,
    /// Served from the exact-match cache.
    pub cached: bool,
    /// Set when mappings were reused from a similar cached sheet.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similar_to: Option<String>,
}

struct SheetSample {
    label: String,
    rows: Rows,
    merged: Vec<MergedCellRange>,
}

pub struct SchemaInference {
    config: InferenceConfig,
    invoker: LlmInvoker,
    structure: StructureDetector,
    mapper: FieldMapper,
    cache: SchemaCache,
    learned: Arc<LearnedStore>,
}

impl SchemaInference {
    pub fn new(
        client: Arc<dyn CompletionClient>,
        learned: Arc<LearnedStore>,
        config: InferenceConfig,
    ) -> Self {
        let invoker = LlmInvoker::new(client, &config);
        Self {
            structure: StructureDetector::new(invoker.clone(), &config),
            mapper: FieldMapper::new(invoker.clone(), learned.clone(), &config),
            cache: SchemaCache::new(&config),
            invoker,
            learned,
            config,
        }
    }

    /// Replace the schema cache, e.g. one with a test clock.
    pub fn with_cache(mut self, cache: SchemaCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    pub fn learned(&self) -> &Arc<LearnedStore> {
        &self.learned
    }

    /// Header/data boundary of one sheet.
    ///
    /// Unforced runs with the configured header window read and fill the
    /// exact-match cache; a forced method or a custom window always runs.
    pub async fn detect_structure(
        &self,
        file_bytes: &[u8],
        filename: &str,
        sheet_index: usize,
        max_header_rows: Option<usize>,
        forced: Option<DetectionMethod>,
    ) -> DetectionResult {
        let max_header_rows = max_header_rows.unwrap_or(self.config.max_header_rows);
        let use_cache = forced.is_none() && max_header_rows == self.config.max_header_rows;
        let key = SchemaCache::exact_key(file_bytes, sheet_index);
        if use_cache {
            if let Some(hit) = self.cache.get(&key) {
                info!("Schema cache hit for {} sheet {}", filename, sheet_index);
                return hit.detection;
            }
        }

        let sheet = match read_sheet(file_bytes, filename, sheet_index, max_header_rows) {
            Ok(sheet) => sheet,
            Err(e) => {
                warn!("Could not read {} sheet {}: {}", filename, sheet_index, e);
                return DetectionResult::failed(e.to_string());
            }
        };

        let detection = self
            .detector_for(max_header_rows)
            .detect(&sheet.rows, &sheet.merged, &sheet.label, forced)
            .await;
        if use_cache && self.cacheable(&detection) {
            self.cache.put(&key, CachedAnalysis::new(detection.clone(), None));
        }
        detection
    }

    /// Map column names to standard fields.
    pub async fn map_fields(
        &self,
        columns: &[String],
        sample_rows: Option<&Rows>,
        context: Option<&str>,
    ) -> Vec<FieldMapping> {
        self.mapper.map_fields(columns, sample_rows, context).await
    }

    /// Detection followed by mapping of the detected columns.
    pub async fn analyze_sheet(
        &self,
        file_bytes: &[u8],
        filename: &str,
        sheet_index: usize,
        context: Option<&str>,
    ) -> SheetAnalysis {
        let cache_key = SchemaCache::exact_key(file_bytes, sheet_index);
        let cached = self.cache.get(&cache_key);

        if let Some(CachedAnalysis {
            detection,
            mappings: Some(mut mappings),
            corrections,
        }) = cached.clone()
        {
            info!("Schema cache hit for {} sheet {}", filename, sheet_index);
            semantic::apply_corrections(&mut mappings, &corrections);
            return SheetAnalysis {
                cache_key,
                detection,
                mappings,
                cached: true,
                similar_to: None,
            };
        }

        let sheet = match read_sheet(file_bytes, filename, sheet_index, self.config.max_header_rows) {
            Ok(sheet) => sheet,
            Err(e) => {
                warn!("Could not read {} sheet {}: {}", filename, sheet_index, e);
                return SheetAnalysis {
                    cache_key,
                    detection: DetectionResult::failed(e.to_string()),
                    mappings: Vec::new(),
                    cached: false,
                    similar_to: None,
                };
            }
        };

        let detection = match cached {
            Some(hit) => hit.detection,
            None => {
                self.structure
                    .detect(&sheet.rows, &sheet.merged, &sheet.label, None)
                    .await
            }
        };
        if detection.error.is_some() {
            return SheetAnalysis {
                cache_key,
                detection,
                mappings: Vec::new(),
                cached: false,
                similar_to: None,
            };
        }

        let columns = detection.column_names();
        let data_rows: Rows = sheet
            .rows
            .iter()
            .skip(detection.data_start_row)
            .cloned()
            .collect();

        let similar = self.cache.find_similar(&columns).filter(|m| m.key != cache_key);
        let reusable: HashMap<String, FieldMapping> = similar
            .as_ref()
            .and_then(|m| m.analysis.mappings.clone())
            .unwrap_or_default()
            .into_iter()
            .map(|m| (matcher::normalize(&m.original_column), m))
            .collect();

        let mappings = self
            .mapper
            .map_fields_reusing(&columns, Some(&data_rows), context, &reusable)
            .await;
        if let Some(m) = &similar {
            info!(
                "Reused {} mappings from similar sheet {} ({:.2})",
                reusable.len(),
                m.key,
                m.similarity
            );
        }

        if self.cacheable(&detection) {
            self.cache.put(
                &cache_key,
                CachedAnalysis::new(detection.clone(), Some(mappings.clone())),
            );
        }

        SheetAnalysis {
            cache_key,
            detection,
            mappings,
            cached: false,
            similar_to: similar.map(|m| m.key),
        }
    }

    /// Attach a user correction to a cached analysis.
    pub fn record_correction(&self, cache_key: &str, column: &str, standard_field: &str) -> bool {
        let recorded = self.cache.add_correction(
            cache_key,
            UserCorrection {
                column: column.to_string(),
                standard_field: standard_field.to_string(),
            },
        );
        if recorded {
            info!("Recorded correction on {}: {} -> {}", cache_key, column, standard_field);
        }
        recorded
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn invalidate(&self, cache_key: &str) -> bool {
        self.cache.invalidate(cache_key)
    }

    pub fn clear_cache(&self) -> usize {
        self.cache.clear()
    }

    fn cacheable(&self, detection: &DetectionResult) -> bool {
        detection.error.is_none() && detection.confidence >= self.config.cache_min_confidence
    }

    fn detector_for(&self, max_header_rows: usize) -> StructureDetectorRef<'_> {
        if max_header_rows == self.config.max_header_rows {
            StructureDetectorRef::Shared(&self.structure)
        } else {
            let config = InferenceConfig {
                max_header_rows,
                ..self.config.clone()
            };
            StructureDetectorRef::Owned(Box::new(StructureDetector::new(self.invoker.clone(), &config)))
        }
    }
}

/// The shared detector, or a one-off with a different header window.
enum StructureDetectorRef<'a> {
    Shared(&'a StructureDetector),
    Owned(Box<StructureDetector>),
}

impl std::ops::Deref for StructureDetectorRef<'_> {
    type Target = StructureDetector;

    fn deref(&self) -> &StructureDetector {
        match self {
            Self::Shared(detector) => detector,
            Self::Owned(detector) => detector,
        }
    }
}

fn read_sheet(
    file_bytes: &[u8],
    filename: &str,
    sheet_index: usize,
    max_header_rows: usize,
) -> Result<SheetSample, SheetError> {
    let mut workbook = sheet_reader::open_workbook(filename, file_bytes)?;
    let label = workbook
        .sheet_names()
        .get(sheet_index)
        .cloned()
        .unwrap_or_else(|| format!("sheet {}", sheet_index));
    let rows = workbook.read_rows(sheet_index, max_header_rows + SAMPLE_ROWS)?;
    let merged = workbook.read_merged_ranges(sheet_index)?;
    Ok(SheetSample {
        label,
        rows,
        merged,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedClient;
    use crate::model::MappingMethod;

    const BUDGET_REPORT: &str = "总表,,\n单位: 元,,\n项目,预算,实际\n收入,100,110\n成本,80,95\n";

    fn service(client: Arc<ScriptedClient>) -> SchemaInference {
        SchemaInference::new(client, Arc::new(LearnedStore::in_memory()), InferenceConfig::default())
    }

    #[tokio::test]
    async fn test_detect_structure_caches() {
        let client = ScriptedClient::replies(&[]);
        let inference = service(client.clone());

        let first = inference
            .detect_structure(BUDGET_REPORT.as_bytes(), "report.csv", 0, None, None)
            .await;
        assert_eq!(first.data_start_row, 3);
        assert_eq!(inference.cache_stats().entries, 1);

        let second = inference
            .detect_structure(BUDGET_REPORT.as_bytes(), "report.csv", 0, None, None)
            .await;
        assert_eq!(first, second);
        assert_eq!(inference.cache_stats().hits, 1);
        assert_eq!(client.call_count(), 0);
    }

    #[tokio::test]
    async fn test_unreadable_input_is_failed_result() {
        let inference = service(ScriptedClient::replies(&[]));
        let result = inference
            .detect_structure(b"whatever", "notes.txt", 0, None, None)
            .await;
        assert!(result.error.unwrap().contains("unsupported"));

        let result = inference
            .detect_structure(BUDGET_REPORT.as_bytes(), "report.csv", 4, None, None)
            .await;
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn test_analyze_and_correct() {
        let inference = service(ScriptedClient::replies(&[]));
        let analysis = inference
            .analyze_sheet(BUDGET_REPORT.as_bytes(), "report.csv", 0, None)
            .await;

        assert!(!analysis.cached);
        let fields: Vec<_> = analysis
            .mappings
            .iter()
            .map(|m| m.standard_field.as_deref())
            .collect();
        assert_eq!(fields, vec![Some("item"), Some("budget_amount"), Some("actual_amount")]);

        assert!(inference.record_correction(&analysis.cache_key, "实际", "amount"));
        let again = inference
            .analyze_sheet(BUDGET_REPORT.as_bytes(), "report.csv", 0, None)
            .await;
        assert!(again.cached);
        assert_eq!(again.mappings[2].standard_field.as_deref(), Some("amount"));
        assert_eq!(again.mappings[2].method, MappingMethod::Custom);
    }

    #[tokio::test]
    async fn test_custom_header_window_bypasses_cache() {
        let inference = service(ScriptedClient::replies(&[]));
        inference
            .detect_structure(BUDGET_REPORT.as_bytes(), "report.csv", 0, Some(1), Some(DetectionMethod::Rule))
            .await;
        inference
            .detect_structure(BUDGET_REPORT.as_bytes(), "report.csv", 0, Some(1), None)
            .await;
        assert_eq!(inference.cache_stats().entries, 0);

        let result = inference
            .detect_structure(BUDGET_REPORT.as_bytes(), "report.csv", 0, None, None)
            .await;
        assert_eq!(result.data_start_row, 3);
        assert_eq!(inference.cache_stats().hits, 0);
        assert_eq!(inference.cache_stats().entries, 1);
    }

    #[tokio::test]
    async fn test_forced_method_bypasses_cache() {
        let inference = service(ScriptedClient::replies(&[]));
        inference
            .detect_structure(BUDGET_REPORT.as_bytes(), "report.csv", 0, None, Some(DetectionMethod::Rule))
            .await;
        assert_eq!(inference.cache_stats().entries, 0);
    }
}
