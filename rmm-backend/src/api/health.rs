//! Root and health check endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::state::AppState;
use crate::system::bytes_to_mb;

/// GET / - Service identity.
pub async fn root() -> Json<Value> {
    Json(json!({
        "name": "RunMyModel Backend",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running"
    }))
}

/// GET /health
pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "models_loaded": state.manager.loaded_count().await,
        "memory_usage_mb": bytes_to_mb(state.manager.memory_usage_bytes()).round() as u64
    }))
}
