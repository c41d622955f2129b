//! Chat and raw completion endpoints.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use futures_util::StreamExt;
use rmm_common::{
    ChatCompletionRequest, ChatCompletionResponse, ChatMessage, CompletionRequest,
    CompletionResponse,
};

use crate::config::DefaultsConfig;
use crate::engine::SamplingParams;
use crate::error::{Error, Result};
use crate::generation::{generate, Generation, GenerationRequest};
use crate::state::AppState;
use crate::streaming;

/// Build the chat router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/chat/completions", post(chat_completions))
        .route("/completions", post(completions))
}

/// Flatten chat messages into a single prompt.
///
/// Each system, user or assistant message becomes `"<Role>: <content>\n\n"`;
/// other roles are skipped. The prompt ends with `"Assistant: "`.
pub fn build_chat_prompt(messages: &[ChatMessage]) -> String {
    let mut prompt = String::new();
    for message in messages {
        let label = match message.role.as_str() {
            "system" => "System",
            "user" => "User",
            "assistant" => "Assistant",
            _ => continue,
        };
        prompt.push_str(label);
        prompt.push_str(": ");
        prompt.push_str(message.content.as_deref().unwrap_or_default());
        prompt.push_str("\n\n");
    }
    prompt.push_str("Assistant: ");
    prompt
}

fn sampling(
    defaults: &DefaultsConfig,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    top_p: Option<f32>,
    top_k: Option<u32>,
) -> SamplingParams {
    SamplingParams {
        max_tokens: max_tokens.unwrap_or(defaults.max_tokens),
        temperature: temperature.unwrap_or(defaults.temperature),
        top_p: top_p.unwrap_or(defaults.top_p),
        top_k: top_k.unwrap_or(defaults.top_k),
    }
}

fn required_model(model: Option<String>) -> Result<String> {
    model
        .filter(|m| !m.is_empty())
        .ok_or_else(|| Error::InvalidRequest("model is required".to_string()))
}

/// POST /api/chat/completions - OpenAI-style chat completion, streamed by default.
async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<Response> {
    let model = required_model(request.model)?;
    tracing::debug!("Chat completion request for model: {}", model);

    let generation = generate(
        &state.manager,
        GenerationRequest {
            model: model.clone(),
            prompt: build_chat_prompt(&request.messages),
            sampling: sampling(
                &state.config.defaults,
                request.max_tokens,
                request.temperature,
                request.top_p,
                request.top_k,
            ),
            stream: request.stream.unwrap_or(true),
        },
    )
    .await?;

    match generation {
        Generation::Stream(fragments) => {
            let events = streaming::chat_events(fragments)
                .map(|event| Ok::<_, Infallible>(Event::default().data(event.to_data())));
            Ok(Sse::new(events).into_response())
        }
        Generation::Complete(text) => {
            let response = ChatCompletionResponse::new(
                model,
                ChatMessage::new("assistant", text),
                Some("stop".to_string()),
            );
            Ok(Json(response).into_response())
        }
    }
}

/// POST /api/completions - Raw prompt completion, streamed as plain text by default.
async fn completions(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CompletionRequest>,
) -> Result<Response> {
    let model = required_model(request.model)?;
    tracing::debug!("Completion request for model: {}", model);

    let generation = generate(
        &state.manager,
        GenerationRequest {
            model,
            prompt: request.prompt,
            sampling: sampling(
                &state.config.defaults,
                request.max_tokens,
                request.temperature,
                request.top_p,
                request.top_k,
            ),
            stream: request.stream.unwrap_or(true),
        },
    )
    .await?;

    match generation {
        Generation::Stream(fragments) => {
            let body = Body::from_stream(streaming::plain_text(fragments).map(Ok::<_, Infallible>));
            Ok((
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                body,
            )
                .into_response())
        }
        Generation::Complete(text) => Ok(Json(CompletionResponse { text }).into_response()),
    }
}
