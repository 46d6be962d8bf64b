use std::env;
use std::sync::Arc;

use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use glasir_api::routes;
use glasir_api::timetable_engine::{EngineConfig, TimetableEngine};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = EngineConfig::from_env();
    info!("upstream base url: {}", config.base_url);
    let engine = Arc::new(TimetableEngine::new(config).expect("engine construction failed"));

    let app = Router::new()
        .merge(routes::service_routes())
        .merge(routes::timetable::timetable_routes(engine))
        .layer(CorsLayer::permissive());

    let port: u16 = env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .expect("failed to bind listener");
    info!("glasir timetable adapter listening on port {port}");
    axum::serve(listener, app).await.expect("server error");
}
