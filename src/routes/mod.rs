pub mod timetable;

use axum::{routing::get, Json, Router};
use serde_json::{json, Value};

/// Credential-free service routes.
pub fn service_routes() -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
}

async fn root() -> Json<Value> {
    Json(json!({"message": "Glasir timetable adapter"}))
}

async fn health() -> Json<Value> {
    Json(json!({"status": "healthy", "service": "glasir-api"}))
}
