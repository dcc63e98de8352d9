use axum::{
    Router,
    routing::{get, post},
    extract::State,
    Json,
    http::StatusCode,
};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{CorsLayer, Any};
use tower_http::trace::TraceLayer;
use axum::http::Method;
use anyhow::Result;
use chrono::Utc;
use tracing_subscriber::EnvFilter;

use kb_rag::eval::read_summary;
use kb_rag::models::{
    BuildIndexRequest, RecommendRequest, RecommendResponse, RetrieveRequest, RetrieveResponse,
};
use kb_rag::rag::index_manager::{IndexReport, IndexStatus};
use kb_rag::{Error, RagEngine, Settings};

struct AppState {
    engine: RagEngine,
    settings: Settings,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = std::env::var("RAG_CONFIG").ok().map(PathBuf::from);
    let settings = Settings::load(config_path.as_deref())?;

    tracing::info!("Knowledge base: {}", settings.paths.kb_dir.display());
    tracing::info!("Data directory: {}", settings.paths.data_dir.display());
    tracing::info!("Index backend: {:?}", settings.index.backend);

    let engine = RagEngine::from_settings(&settings).await?;
    tracing::info!("RAG engine initialized successfully");

    let bind = settings.server.bind.clone();
    let state = Arc::new(AppState { engine, settings });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    let app = Router::new()
        .route("/api/v1/retrieve", post(retrieve_handler))
        .route("/api/v1/recommend", post(recommend_handler))
        .route("/api/v1/index", post(build_index_handler))
        .route("/api/v1/index/status", get(index_status_handler))
        .route("/api/v1/metrics/summary", get(metrics_summary_handler))
        .route("/api/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!("Backend server listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;

    Ok(())
}

fn error_response(context: &str, e: Error) -> (StatusCode, String) {
    let status = match &e {
        Error::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        Error::IndexingInProgress => StatusCode::CONFLICT,
        Error::Provider { .. } => StatusCode::BAD_GATEWAY,
        Error::Config(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!("{} error: {}", context, e);
    } else {
        tracing::warn!("{} rejected: {}", context, e);
    }
    (status, format!("{} error: {}", context, e))
}

async fn retrieve_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RetrieveRequest>,
) -> Result<Json<RetrieveResponse>, (StatusCode, String)> {
    if request.query.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Query must not be empty".to_string()));
    }
    let k = request.k.unwrap_or(state.settings.retrieval.top_k);

    let outcome = state
        .engine
        .retrieve(&request.query, k)
        .await
        .map_err(|e| error_response("Retrieval", e))?;

    Ok(Json(outcome.into()))
}

async fn recommend_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RecommendRequest>,
) -> Result<Json<RecommendResponse>, (StatusCode, String)> {
    let k = request.k.unwrap_or(state.settings.recommendation.top_k);
    let alpha = request.alpha.unwrap_or(state.settings.recommendation.alpha);

    let recommendations = state
        .engine
        .recommend(&request.history, &request.current_query, k, alpha)
        .await
        .map_err(|e| error_response("Recommendation", e))?;

    Ok(Json(RecommendResponse { recommendations }))
}

async fn build_index_handler(
    State(state): State<Arc<AppState>>,
    request: Option<Json<BuildIndexRequest>>,
) -> Result<Json<IndexReport>, (StatusCode, String)> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let chunk_size = request.chunk_size.unwrap_or(state.settings.index.chunk_size);
    let chunk_overlap = request.chunk_overlap.unwrap_or(state.settings.index.chunk_overlap);

    let report = state
        .engine
        .build_index(chunk_size, chunk_overlap)
        .await
        .map_err(|e| error_response("Indexing", e))?;

    Ok(Json(report))
}

async fn index_status_handler(State(state): State<Arc<AppState>>) -> Json<IndexStatus> {
    Json(state.engine.index_status().await)
}

async fn metrics_summary_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let path = state.settings.metrics_summary_path();
    match read_summary(&path).await {
        Ok(Some(summary)) => Ok(Json(summary)),
        Ok(None) => Err((
            StatusCode::NOT_FOUND,
            "Metrics summary not found. Run rag-eval first.".to_string(),
        )),
        Err(e) => {
            tracing::error!("Failed to read {}: {}", path.display(), e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error reading metrics: {}", e),
            ))
        }
    }
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let status = state.engine.index_status().await;

    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "index": {
            "is_indexing": status.is_indexing,
            "last_indexed_at": status.last_indexed_at,
            "chunks": status.chunks,
            "model": status.model,
        }
    }))
}
