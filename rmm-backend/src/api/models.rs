//! Model management endpoints.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::catalog::ModelDescriptor;
use crate::engine::LoadParams;
use crate::error::Error;
use crate::manager::LoadOutcome;
use crate::state::AppState;

/// Build the models router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/models", get(list_models))
        .route("/models/loaded", get(list_loaded))
        .route("/models/load", post(load_model))
        .route("/models/unload", post(unload_model))
}

#[derive(Debug, Serialize)]
struct ModelsResponse {
    models: Vec<ModelEntry>,
    count: usize,
}

#[derive(Debug, Serialize)]
struct ModelEntry {
    name: String,
    path: String,
    size_mb: u64,
    quantization: Option<String>,
    loaded: bool,
}

impl From<ModelDescriptor> for ModelEntry {
    fn from(descriptor: ModelDescriptor) -> Self {
        Self {
            size_mb: descriptor.size_mb(),
            path: descriptor.path.display().to_string(),
            name: descriptor.name,
            quantization: descriptor.quantization,
            loaded: descriptor.loaded,
        }
    }
}

/// GET /api/models - Rescan the models directory and list what was found.
async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelsResponse> {
    let models: Vec<ModelEntry> = state
        .manager
        .refresh_catalog()
        .await
        .into_iter()
        .map(ModelEntry::from)
        .collect();

    Json(ModelsResponse {
        count: models.len(),
        models,
    })
}

#[derive(Debug, Serialize)]
struct LoadedResponse {
    loaded_models: Vec<String>,
    count: usize,
}

/// GET /api/models/loaded
async fn list_loaded(State(state): State<Arc<AppState>>) -> Json<LoadedResponse> {
    let loaded_models = state.manager.loaded_names().await;
    Json(LoadedResponse {
        count: loaded_models.len(),
        loaded_models,
    })
}

#[derive(Debug, Deserialize)]
struct LoadRequest {
    model_name: String,
    #[serde(default)]
    n_ctx: Option<u32>,
    #[serde(default)]
    n_gpu_layers: Option<i32>,
}

#[derive(Debug, Serialize)]
struct LoadResponse {
    success: bool,
    model: String,
    message: String,
}

/// POST /api/models/load - Every failure is reported as a 500.
async fn load_model(
    State(state): State<Arc<AppState>>,
    Json(request): Json<LoadRequest>,
) -> Response {
    let defaults = &state.config.defaults;
    let params = LoadParams {
        context_size: request.n_ctx.unwrap_or(defaults.context_size),
        gpu_layers: request.n_gpu_layers.unwrap_or(defaults.gpu_layers),
    };

    match state.manager.load(&request.model_name, params).await {
        Ok(outcome) => {
            let message = match outcome {
                LoadOutcome::Loaded => format!("Model {} loaded successfully", request.model_name),
                LoadOutcome::AlreadyLoaded => {
                    format!("Model {} already loaded", request.model_name)
                }
            };
            Json(LoadResponse {
                success: true,
                model: request.model_name,
                message,
            })
            .into_response()
        }
        Err(e) => {
            tracing::error!("Failed to load model {}: {}", request.model_name, e);
            e.into_response_with_status(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[derive(Debug, Deserialize)]
struct UnloadQuery {
    model_name: String,
}

#[derive(Debug, Serialize)]
struct UnloadResponse {
    success: bool,
    message: String,
}

/// POST /api/models/unload?model_name=... - 404 when the model is not loaded.
async fn unload_model(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UnloadQuery>,
) -> Response {
    if state.manager.unload(&query.model_name).await {
        Json(UnloadResponse {
            success: true,
            message: format!("Model {} unloaded", query.model_name),
        })
        .into_response()
    } else {
        Error::ModelNotLoaded(query.model_name).into_response_with_status(StatusCode::NOT_FOUND)
    }
}
