//! Turns fragment streams into client-facing stream shapes.
//!
//! Two shapes exist: OpenAI-style chat events (rendered as SSE `data:`
//! payloads by the HTTP layer) and plain text for raw completions.

use futures_util::{stream, Stream, StreamExt};
use rmm_common::ChatCompletionChunk;
use serde_json::json;

use crate::engine::FragmentStream;

/// Marker payload that terminates a successful chat stream.
pub const DONE_MARKER: &str = "[DONE]";

/// One event of a chat completion stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatStreamEvent {
    /// A content fragment.
    Delta(String),
    /// Normal end of generation (`finish_reason: "stop"`).
    Stop,
    /// Generation failed; nothing follows.
    Error(String),
    /// The `[DONE]` terminator.
    Done,
}

impl ChatStreamEvent {
    /// The `data:` payload for this event.
    pub fn to_data(&self) -> String {
        match self {
            ChatStreamEvent::Delta(content) => chunk_json(&ChatCompletionChunk::delta(content)),
            ChatStreamEvent::Stop => chunk_json(&ChatCompletionChunk::stop()),
            ChatStreamEvent::Error(message) => json!({ "error": message }).to_string(),
            ChatStreamEvent::Done => DONE_MARKER.to_string(),
        }
    }

    /// The full SSE frame for this event.
    pub fn to_sse_frame(&self) -> String {
        format!("data: {}\n\n", self.to_data())
    }
}

fn chunk_json(chunk: &ChatCompletionChunk) -> String {
    serde_json::to_string(chunk).unwrap_or_default()
}

enum ChatState {
    Streaming(FragmentStream),
    Finishing,
    Finished,
}

/// Chat event stream: one delta per fragment, then stop and `[DONE]`.
///
/// An error item produces a single error event and ends the stream.
pub fn chat_events(fragments: FragmentStream) -> impl Stream<Item = ChatStreamEvent> + Send {
    stream::unfold(ChatState::Streaming(fragments), |state| async move {
        match state {
            ChatState::Streaming(mut fragments) => match fragments.next().await {
                Some(Ok(text)) => {
                    Some((ChatStreamEvent::Delta(text), ChatState::Streaming(fragments)))
                }
                Some(Err(e)) => {
                    tracing::warn!("Chat stream failed: {}", e);
                    Some((ChatStreamEvent::Error(e.message()), ChatState::Finished))
                }
                None => Some((ChatStreamEvent::Stop, ChatState::Finishing)),
            },
            ChatState::Finishing => Some((ChatStreamEvent::Done, ChatState::Finished)),
            ChatState::Finished => None,
        }
    })
}

/// Plain-text stream: fragments verbatim, `\n\n[ERROR: msg]` on failure.
pub fn plain_text(fragments: FragmentStream) -> impl Stream<Item = String> + Send {
    stream::unfold(Some(fragments), |state| async move {
        let mut fragments = state?;
        match fragments.next().await {
            Some(Ok(text)) => Some((text, Some(fragments))),
            Some(Err(e)) => {
                tracing::warn!("Completion stream failed: {}", e);
                Some((format!("\n\n[ERROR: {}]", e.message()), None))
            }
            None => None,
        }
    })
}
