// Main entry point for the bubble detection / translation service

use bubble_translator::{
    core::{
        types::{OutboundMessage, WorkerMessage},
        Config, RouterError,
    },
    orchestration::{PipelineOrchestrator, RequestRouter},
    utils::Metrics,
};

use anyhow::Result;
use axum::{
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

/// Application state shared across handlers
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<PipelineOrchestrator>,
    router: RequestRouter,
    metrics: Metrics,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Arc::new(Config::new()?);

    // Initialize logging
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::new(format!(
        "bubble_translator={},ort=off",
        match config.log_level() {
            tracing::Level::TRACE => "trace",
            tracing::Level::DEBUG => "debug",
            tracing::Level::INFO => "info",
            tracing::Level::WARN => "warn",
            tracing::Level::ERROR => "error",
        }
    ));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("=== BUBBLE TRANSLATOR ===");
    info!(
        "Config: target={} conf={:.2} iou={:.2} ocr_slots={} translation_slots={} upscale=x{}",
        config.target_size(),
        config.confidence_threshold(),
        config.iou_threshold(),
        config.ocr_max_concurrent(),
        config.translation_max_concurrent(),
        config.upscale_factor()
    );

    let metrics = Metrics::new();

    info!("Initializing pipeline...");
    let orchestrator = Arc::new(PipelineOrchestrator::from_config(&config, metrics.clone())?);
    let router = RequestRouter::new(orchestrator.clone(), config.default_settings.clone());

    let state = AppState {
        orchestrator,
        router,
        metrics,
    };

    // Setup CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/stats", get(stats_endpoint))
        .route("/detect", post(detect_objects))
        .route("/settings", post(update_settings))
        .with_state(state)
        .layer(DefaultBodyLimit::max(64 * 1024 * 1024))
        .layer(cors);

    let addr = format!("{}:{}", config.server_host(), config.server_port());
    info!("{}", "=".repeat(70));
    info!("Server starting on http://{}", addr);
    info!("{}", "-".repeat(70));
    info!("Endpoints:");
    info!("  GET  /         - Root endpoint");
    info!("  GET  /health   - Health check");
    info!("  GET  /metrics  - Prometheus metrics");
    info!("  GET  /stats    - Detailed statistics");
    info!("  POST /detect   - detectObjects → detectionResults");
    info!("  POST /settings - updateSettings");
    info!("{}", "=".repeat(70));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn root() -> &'static str {
    "Bubble Translator - detection, recognition and translation service"
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.metrics.record_endpoint_request("/health");
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "model_loaded": state.orchestrator.model_loaded(),
        "worker_alive": state.router.worker_alive(),
        "pending_requests": state.router.pending_count(),
    }))
}

/// Prometheus metrics endpoint
async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4")],
        state.metrics.to_prometheus(),
    )
}

/// Detailed statistics endpoint (JSON)
async fn stats_endpoint(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    state.metrics.record_endpoint_request("/stats");

    let snapshot = serde_json::to_value(state.metrics.snapshot()).map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to serialize metrics: {}", e),
        )
    })?;

    let recognition = state.orchestrator.recognition();
    let translation = state.orchestrator.translation();
    let limiter_stats = |l: &bubble_translator::ConcurrencyLimiter| {
        serde_json::json!({
            "max_concurrent": l.max_concurrent(),
            "running": l.running(),
            "queued": l.queued(),
            "completed": l.completed(),
        })
    };
    let engines: Vec<String> = recognition
        .pool()
        .languages()
        .into_iter()
        .map(|(provider, language)| format!("{}:{}", provider.as_str(), language))
        .collect();

    Ok(Json(serde_json::json!({
        "metrics": snapshot,
        "limiters": {
            "recognition": limiter_stats(recognition.limiter()),
            "translation": limiter_stats(translation.limiter()),
        },
        "circuit_breakers": translation.breaker_stats(),
        "engines": engines,
        "translation_cache_entries": translation.cache().len(),
        "pending_requests": state.router.pending_count(),
        "workers_started": state.router.workers_started(),
    })))
}

fn router_error_status(e: &RouterError) -> StatusCode {
    match e {
        RouterError::DuplicateRequestId(_) => StatusCode::CONFLICT,
        RouterError::WorkerUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        RouterError::ResponseDropped(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// detectObjects endpoint
///
/// Body: `{ "action": "detectObjects", "imageData": ..., "requestId"?, "settings"? }`.
/// Pipeline failures still answer 200 with `detectionResults { requestId, error }`.
async fn detect_objects(
    State(state): State<AppState>,
    Json(message): Json<WorkerMessage>,
) -> Result<Json<OutboundMessage>, (StatusCode, String)> {
    state.metrics.record_endpoint_request("/detect");

    let WorkerMessage::DetectObjects {
        image_data,
        request_id,
        settings,
    } = message
    else {
        return Err((
            StatusCode::BAD_REQUEST,
            "expected action 'detectObjects'".to_string(),
        ));
    };

    let image = image_data
        .decode_async()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    info!(
        "Received detectObjects ({}x{}, id: {})",
        image.width,
        image.height,
        request_id.as_ref().map(|id| id.as_str()).unwrap_or("<generated>")
    );

    let results = state
        .router
        .submit(image, request_id, settings)
        .await
        .map_err(|e| {
            error!("Routing failed: {}", e);
            (router_error_status(&e), e.to_string())
        })?;

    if let Some(err) = &results.error {
        warn!("[{}] Request failed: {}", results.request_id, err);
    }

    Ok(Json(OutboundMessage::DetectionResults(results)))
}

/// updateSettings endpoint; fire-and-forget
async fn update_settings(
    State(state): State<AppState>,
    Json(message): Json<WorkerMessage>,
) -> Result<StatusCode, (StatusCode, String)> {
    state.metrics.record_endpoint_request("/settings");

    let WorkerMessage::UpdateSettings { settings } = message else {
        return Err((
            StatusCode::BAD_REQUEST,
            "expected action 'updateSettings'".to_string(),
        ));
    };

    state
        .router
        .update_settings(settings)
        .map_err(|e| (router_error_status(&e), e.to_string()))?;
    Ok(StatusCode::ACCEPTED)
}
