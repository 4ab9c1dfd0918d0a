pub mod error;
pub mod health;
pub mod metrics;
pub mod ocr;

use axum::extract::DefaultBodyLimit;
use axum::response::Html;
use axum::routing::{get, post};
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;

/// Webservice routes, without the Prometheus endpoint (it carries its own state).
pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        // Upload form (embedded at compile time)
        .route("/", get(|| async { Html(include_str!("../../static/index.html")) }))
        .route("/health", get(health::health_check))
        .route("/api/v1/status", get(health::dispatch_status))
        .route("/api/v1/ocr", post(ocr::submit_document))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        // Oversize uploads fail inside the multipart reader as an `ApiError`
        .layer(DefaultBodyLimit::max(max_upload_bytes))
}
