//! HTTP API.

pub mod chat;
pub mod health;
pub mod models;
pub mod prompts;
pub mod system;

use std::sync::Arc;

use axum::routing::get;
use axum::{middleware, Router};
use tower_http::cors::CorsLayer;

use crate::logging::request_logger;
use crate::state::AppState;

/// Build the `/api` router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .merge(models::router())
        .merge(chat::router())
        .merge(prompts::router())
        .merge(system::router())
}

/// Build the complete application: root routes, `/api`, CORS and request logging.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(health::root))
        .route("/health", get(health::health))
        .nest("/api", router())
        .layer(middleware::from_fn(request_logger))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
