use axum::{routing::get, Json, Router};
use serde_json::json;
use std::sync::Arc;

use crate::web::ws;
use crate::AppContext;

pub mod schedule;

pub fn router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(health))
        .with_state(ctx.clone())
        .nest("/schedule", schedule::schedule_router(ctx))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
