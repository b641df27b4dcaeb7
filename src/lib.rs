//! Sheet Inference - header/data boundary detection and field mapping for
//! messy spreadsheets, escalating from rules to LLMs only when needed.

pub mod confidence;
pub mod config;
pub mod error;
pub mod json_repair;
pub mod learned;
pub mod llm;
pub mod model;
pub mod openrouter;
pub mod patterns;
pub mod pipeline;
pub mod schema_cache;
pub mod semantic;
pub mod sheet_reader;
pub mod store;
pub mod structure;

pub use config::InferenceConfig;
pub use error::{DegradationReason, SheetError};
pub use learned::{LearnedMapping, LearnedStore};
pub use model::{
    CellValue, DetectionMethod, DetectionResult, FieldMapping, HeaderRowKind, MappingMethod,
    MergedCellRange, Rows, UserCorrection,
};
pub use openrouter::{CompletionClient, CompletionRequest, OpenRouterClient};
pub use pipeline::{SchemaInference, SheetAnalysis};
pub use schema_cache::{CacheStats, SchemaCache};
