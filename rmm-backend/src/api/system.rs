//! System information endpoint.

use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;

use crate::state::AppState;
use crate::system::SystemInfo;

/// Build the system router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/system/info", get(system_info))
}

/// GET /api/system/info
async fn system_info() -> Json<SystemInfo> {
    Json(SystemInfo::collect())
}
