//! Prompt template and prompt architect endpoints.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::prompt::{PromptArchitect, PromptBlock, PromptTemplate, TemplateSummary};
use crate::state::AppState;

/// Directory under the prompts dir holding saved architect prompts.
const ARCHITECT_DIR: &str = "architect";

/// Build the prompts router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/prompts/templates", get(list_templates).post(save_template))
        .route("/prompts/templates/:template_id", get(get_template))
        .route("/prompts/build", post(build_prompt))
        .route("/prompts/architect/session", post(create_session))
        .route(
            "/prompts/architect/:session_id",
            get(get_session).delete(delete_session),
        )
        .route("/prompts/architect/:session_id/block", post(add_block))
        .route(
            "/prompts/architect/:session_id/block/:block_id",
            put(update_block).delete(remove_block),
        )
        .route("/prompts/architect/:session_id/variable", post(set_variable))
        .route("/prompts/architect/:session_id/reorder", post(reorder_blocks))
        .route("/prompts/architect/:session_id/save", post(save_session))
        .route("/prompts/architect/:session_id/load", post(load_session))
}

// ============================================================================
// Templates
// ============================================================================

#[derive(Debug, Deserialize)]
struct CategoryQuery {
    #[serde(default)]
    category: Option<String>,
}

#[derive(Debug, Serialize)]
struct TemplateListResponse {
    templates: Vec<TemplateSummary>,
    categories: Vec<String>,
    count: usize,
}

/// GET /api/prompts/templates?category=...
async fn list_templates(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CategoryQuery>,
) -> Json<TemplateListResponse> {
    let catalog = state.templates.read().await;
    let templates = catalog.list(query.category.as_deref());
    Json(TemplateListResponse {
        count: templates.len(),
        categories: catalog.categories(),
        templates,
    })
}

/// GET /api/prompts/templates/{id}
async fn get_template(
    State(state): State<Arc<AppState>>,
    Path(template_id): Path<String>,
) -> Result<Json<PromptTemplate>> {
    let catalog = state.templates.read().await;
    catalog
        .get(&template_id)
        .cloned()
        .map(Json)
        .ok_or(Error::TemplateNotFound(template_id))
}

/// POST /api/prompts/templates - Save a custom template.
async fn save_template(
    State(state): State<Arc<AppState>>,
    Json(template): Json<PromptTemplate>,
) -> Result<Json<Value>> {
    let id = state.templates.write().await.save_custom(template)?;
    Ok(Json(json!({ "success": true, "id": id })))
}

#[derive(Debug, Deserialize)]
struct BuildRequest {
    template_id: String,
    #[serde(default)]
    variables: BTreeMap<String, String>,
}

/// POST /api/prompts/build
async fn build_prompt(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BuildRequest>,
) -> Result<Json<Value>> {
    let catalog = state.templates.read().await;
    let prompt = catalog
        .build(&request.template_id, &request.variables)
        .ok_or(Error::TemplateNotFound(request.template_id))?;
    Ok(Json(json!({ "prompt": prompt })))
}

// ============================================================================
// Architect sessions
// ============================================================================

/// POST /api/prompts/architect/session
async fn create_session(State(state): State<Arc<AppState>>) -> Json<Value> {
    let session_id = state.sessions.create().await;
    Json(json!({ "session_id": session_id }))
}

#[derive(Debug, Serialize)]
struct SessionResponse {
    session_id: String,
    blocks: Vec<PromptBlock>,
    variables: BTreeMap<String, String>,
    prompt: String,
}

/// GET /api/prompts/architect/{session_id}
async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionResponse>> {
    let (blocks, variables, prompt) = state
        .sessions
        .with_session(&session_id, |architect| {
            (
                architect.blocks().to_vec(),
                architect.variables().clone(),
                architect.build(),
            )
        })
        .await?;

    Ok(Json(SessionResponse {
        session_id,
        blocks,
        variables,
        prompt,
    }))
}

/// DELETE /api/prompts/architect/{session_id}
async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>> {
    if state.sessions.delete(&session_id).await {
        Ok(Json(json!({ "success": true })))
    } else {
        Err(Error::SessionNotFound(session_id))
    }
}

#[derive(Debug, Deserialize)]
struct AddBlockRequest {
    #[serde(rename = "type")]
    block_type: String,
    content: String,
    #[serde(default)]
    variables: Vec<String>,
}

/// POST /api/prompts/architect/{session_id}/block
async fn add_block(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(request): Json<AddBlockRequest>,
) -> Result<Json<Value>> {
    let (block_id, prompt) = state
        .sessions
        .with_session(&session_id, |architect| {
            let id = architect.add_block(&request.block_type, &request.content, request.variables);
            (id, architect.build())
        })
        .await?;
    Ok(Json(json!({ "block_id": block_id, "prompt": prompt })))
}

#[derive(Debug, Deserialize)]
struct UpdateBlockQuery {
    content: String,
}

/// PUT /api/prompts/architect/{session_id}/block/{block_id}?content=...
async fn update_block(
    State(state): State<Arc<AppState>>,
    Path((session_id, block_id)): Path<(String, String)>,
    Query(query): Query<UpdateBlockQuery>,
) -> Result<Json<Value>> {
    let (success, prompt) = state
        .sessions
        .with_session(&session_id, |architect| {
            let success = architect.update_block(&block_id, &query.content);
            (success, architect.build())
        })
        .await?;
    Ok(Json(json!({ "success": success, "prompt": prompt })))
}

/// DELETE /api/prompts/architect/{session_id}/block/{block_id}
async fn remove_block(
    State(state): State<Arc<AppState>>,
    Path((session_id, block_id)): Path<(String, String)>,
) -> Result<Json<Value>> {
    let (success, prompt) = state
        .sessions
        .with_session(&session_id, |architect| {
            let success = architect.remove_block(&block_id);
            (success, architect.build())
        })
        .await?;
    Ok(Json(json!({ "success": success, "prompt": prompt })))
}

#[derive(Debug, Deserialize)]
struct VariableRequest {
    name: String,
    value: String,
}

/// POST /api/prompts/architect/{session_id}/variable
async fn set_variable(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(request): Json<VariableRequest>,
) -> Result<Json<Value>> {
    let prompt = state
        .sessions
        .with_session(&session_id, |architect| {
            architect.set_variable(&request.name, &request.value);
            architect.build()
        })
        .await?;
    Ok(Json(json!({ "prompt": prompt })))
}

/// POST /api/prompts/architect/{session_id}/reorder - Body is a JSON array of block ids.
async fn reorder_blocks(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(block_ids): Json<Vec<String>>,
) -> Result<Json<Value>> {
    let prompt = state
        .sessions
        .with_session(&session_id, |architect| {
            architect.reorder(&block_ids);
            architect.build()
        })
        .await?;
    Ok(Json(json!({ "prompt": prompt })))
}

#[derive(Debug, Deserialize)]
struct NamedPrompt {
    name: String,
}

/// File for saved prompt `name`. Rejects names that could escape the directory.
fn saved_prompt_path(state: &AppState, name: &str) -> Result<PathBuf> {
    let invalid = name.is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\\'])
        || name.contains("..");
    if invalid {
        return Err(Error::InvalidRequest(format!("Invalid prompt name: {:?}", name)));
    }

    Ok(state
        .config
        .paths
        .prompts_dir()
        .join(ARCHITECT_DIR)
        .join(format!("{}.json", name)))
}

/// POST /api/prompts/architect/{session_id}/save
async fn save_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(request): Json<NamedPrompt>,
) -> Result<Json<Value>> {
    let path = saved_prompt_path(&state, &request.name)?;
    let snapshot = state
        .sessions
        .with_session(&session_id, |architect| architect.clone())
        .await?;

    snapshot.save(&path)?;
    tracing::info!("Saved architect prompt {} to {}", request.name, path.display());

    Ok(Json(json!({ "success": true, "name": request.name })))
}

/// POST /api/prompts/architect/{session_id}/load - Replaces the session's blocks and variables.
async fn load_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(request): Json<NamedPrompt>,
) -> Result<Json<Value>> {
    let path = saved_prompt_path(&state, &request.name)?;
    if !path.is_file() {
        return Err(Error::TemplateNotFound(request.name));
    }
    let loaded = PromptArchitect::load(&path)?;

    let prompt = state
        .sessions
        .with_session(&session_id, |architect| {
            *architect = loaded;
            architect.build()
        })
        .await?;

    Ok(Json(json!({ "success": true, "prompt": prompt })))
}
