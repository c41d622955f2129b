//! RunMyModel Common Types
//!
//! Wire types shared by the backend server and its clients.

pub mod chat;
pub mod completion;

pub use chat::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, Choice,
    ChunkChoice, Delta,
};
pub use completion::{CompletionRequest, CompletionResponse};
