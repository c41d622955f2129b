//! RunMyModel backend: local GGUF model lifecycle, OpenAI-style inference
//! API and prompt construction.

pub mod api;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod generation;
pub mod logging;
pub mod manager;
pub mod prompt;
pub mod state;
pub mod streaming;
pub mod system;

pub use error::{Error, Result};
