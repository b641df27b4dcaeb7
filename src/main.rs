//! Sheet Inference - HTTP surface over the schema inference pipeline.

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use sheet_inference::learned::LearnedMapping;
use sheet_inference::schema_cache::CacheEntry;
use sheet_inference::{
    store, CacheStats, DetectionMethod, DetectionResult, FieldMapping, InferenceConfig,
    LearnedStore, MappingMethod, OpenRouterClient, Rows, SchemaInference, SheetAnalysis,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    inference: Arc<SchemaInference>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "sheet_inference=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = InferenceConfig::from_env()?;
    info!(
        "Inference config: fast={} vision={} voters={:?}",
        config.fast_model, config.vision_model, config.voter_models
    );

    let openrouter = OpenRouterClient::from_env()?;
    info!("OpenRouter client initialized");

    let learned = Arc::new(LearnedStore::new(store::from_env()?));
    learned.load().await?;

    let state = AppState {
        inference: Arc::new(SchemaInference::new(Arc::new(openrouter), learned, config)),
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/detect", post(detect_structure))
        .route("/map-fields", post(map_fields))
        .route("/analyze", post(analyze_sheet))
        .route("/corrections", post(record_correction))
        .route("/cache/stats", get(cache_stats))
        .route("/cache", delete(clear_cache))
        .route("/cache/:key", delete(invalidate_cache))
        .route(
            "/learned",
            get(list_learned).put(add_learned).delete(clear_learned),
        )
        .route("/learned/:column", delete(remove_learned))
        .layer(DefaultBodyLimit::max(50 * 1024 * 1024)) // 50MB
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
    info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> &'static str {
    "ok"
}

#[derive(Deserialize)]
struct DetectQuery {
    sheet_index: Option<usize>,
    max_header_rows: Option<usize>,
    method: Option<String>,
}

/// Upload a workbook and detect the header/data boundary of one sheet.
async fn detect_structure(
    State(state): State<AppState>,
    Query(query): Query<DetectQuery>,
    multipart: Multipart,
) -> Result<Json<DetectionResult>, (StatusCode, String)> {
    let forced = match query.method.as_deref() {
        None | Some("") | Some("auto") => None,
        Some(name) => Some(
            name.parse::<DetectionMethod>()
                .map_err(|e| (StatusCode::BAD_REQUEST, e))?,
        ),
    };

    let upload = read_upload(multipart).await?;
    let sheet_index = query.sheet_index.unwrap_or(0);
    info!(
        "Detecting {} sheet {} ({} bytes)",
        upload.filename,
        sheet_index,
        upload.data.len()
    );

    let result = state
        .inference
        .detect_structure(&upload.data, &upload.filename, sheet_index, query.max_header_rows, forced)
        .await;
    Ok(Json(result))
}

#[derive(Deserialize)]
struct MapFieldsRequest {
    columns: Vec<String>,
    #[serde(default)]
    sample_rows: Option<Rows>,
    #[serde(default)]
    context: Option<String>,
}

async fn map_fields(
    State(state): State<AppState>,
    Json(request): Json<MapFieldsRequest>,
) -> Result<Json<Vec<FieldMapping>>, (StatusCode, String)> {
    if request.columns.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "No columns given".to_string()));
    }
    let mappings = state
        .inference
        .map_fields(&request.columns, request.sample_rows.as_ref(), request.context.as_deref())
        .await;
    Ok(Json(mappings))
}

#[derive(Deserialize)]
struct AnalyzeQuery {
    sheet_index: Option<usize>,
    context: Option<String>,
}

/// Upload a workbook, detect its structure and map the detected columns.
async fn analyze_sheet(
    State(state): State<AppState>,
    Query(query): Query<AnalyzeQuery>,
    multipart: Multipart,
) -> Result<Json<SheetAnalysis>, (StatusCode, String)> {
    let upload = read_upload(multipart).await?;
    let analysis = state
        .inference
        .analyze_sheet(
            &upload.data,
            &upload.filename,
            query.sheet_index.unwrap_or(0),
            query.context.as_deref(),
        )
        .await;
    info!(
        "Analyzed {}: {} columns, cached={}",
        upload.filename,
        analysis.mappings.len(),
        analysis.cached
    );
    Ok(Json(analysis))
}

#[derive(Deserialize)]
struct CorrectionRequest {
    cache_key: String,
    column: String,
    standard_field: String,
}

async fn record_correction(
    State(state): State<AppState>,
    Json(request): Json<CorrectionRequest>,
) -> StatusCode {
    if state
        .inference
        .record_correction(&request.cache_key, &request.column, &request.standard_field)
    {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn cache_stats(State(state): State<AppState>) -> Json<CacheStats> {
    Json(state.inference.cache_stats())
}

async fn invalidate_cache(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> StatusCode {
    if state.inference.invalidate(&key) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

#[derive(Serialize)]
struct Cleared {
    removed: usize,
}

async fn clear_cache(State(state): State<AppState>) -> Json<Cleared> {
    Json(Cleared {
        removed: state.inference.clear_cache(),
    })
}

async fn list_learned(State(state): State<AppState>) -> Json<Vec<CacheEntry<LearnedMapping>>> {
    Json(state.inference.learned().list())
}

#[derive(Deserialize)]
struct LearnRequest {
    column: String,
    standard_field: String,
    #[serde(default)]
    category: String,
    #[serde(default)]
    description: String,
}

/// Teach a mapping by hand. Manual entries carry full confidence.
async fn add_learned(
    State(state): State<AppState>,
    Json(request): Json<LearnRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    let mapping = LearnedMapping {
        standard_field: request.standard_field,
        confidence: 1.0,
        category: request.category,
        description: request.description,
        source: MappingMethod::Custom,
    };
    state
        .inference
        .learned()
        .add(&request.column, mapping)
        .await
        .map_err(|e| {
            error!("Failed to learn mapping for {}: {:#}", request.column, e);
            (StatusCode::BAD_REQUEST, format!("Failed to learn mapping: {:#}", e))
        })?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_learned(
    State(state): State<AppState>,
    Path(column): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    let removed = state.inference.learned().remove(&column).await.map_err(internal)?;
    Ok(if removed {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    })
}

async fn clear_learned(
    State(state): State<AppState>,
) -> Result<Json<Cleared>, (StatusCode, String)> {
    let removed = state.inference.learned().clear().await.map_err(internal)?;
    Ok(Json(Cleared { removed }))
}

// ============================================================================
// Helper functions
// ============================================================================

struct Upload {
    filename: String,
    data: Vec<u8>,
}

/// Read the multipart `file` field.
async fn read_upload(mut multipart: Multipart) -> Result<Upload, (StatusCode, String)> {
    while let Some(field) = multipart.next_field().await.map_err(|e| {
        (StatusCode::BAD_REQUEST, format!("Multipart error: {}", e))
    })? {
        if field.name() == Some("file") {
            let filename = field.file_name().unwrap_or("upload.xlsx").to_string();
            let data = field.bytes().await.map_err(|e| {
                (StatusCode::BAD_REQUEST, format!("Failed to read file: {}", e))
            })?;
            if data.is_empty() {
                break;
            }
            return Ok(Upload {
                filename,
                data: data.to_vec(),
            });
        }
    }
    Err((StatusCode::BAD_REQUEST, "No file uploaded".to_string()))
}

fn internal(e: anyhow::Error) -> (StatusCode, String) {
    error!("Learned store failure: {:#}", e);
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e))
}
