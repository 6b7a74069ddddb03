use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::engine::Engine;

async fn healthz(axum::extract::State(engine): axum::extract::State<Arc<Engine>>) -> Json<serde_json::Value> {
    let (active, max) = engine.copy.stats();
    Json(serde_json::json!({
        "status": "ok",
        "active_transfers": active,
        "max_concurrent_processes": max,
    }))
}

/// The core's only HTTP surface: a health probe and the event-bus
/// WebSocket subscriber transport. Job/server CRUD and the dashboard are
/// the out-of-scope HTTP/UI layer (§1).
pub fn create_router(engine: Arc<Engine>) -> Router {
    let cors = if engine.config.cors_origin == "*" {
        CorsLayer::permissive()
    } else {
        let origin = engine.config.cors_origin.parse().expect("invalid CORS_ORIGIN");
        CorsLayer::new().allow_origin(AllowOrigin::exact(origin))
    };

    Router::new()
        .route("/healthz", get(healthz))
        .route("/ws", get(crate::ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(engine)
}
