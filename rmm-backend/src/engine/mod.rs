//! Inference engine abstraction layer.
//!
//! A `ModelRuntime` turns a catalog entry into a live `ModelHandle`. The
//! lifecycle manager only ever talks to these traits, so the process-backed
//! llama-server runtime can be swapped for an in-process one (or a fake in
//! tests) without touching load/unload or the HTTP layer.

mod llama_server;

pub use llama_server::{LlamaServerHandle, LlamaServerRuntime};

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{future, Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::catalog::ModelDescriptor;
use crate::error::Result;

/// Lazily produced text fragments, in generation order.
///
/// The stream ends normally when generation finishes; an `Err` item reports
/// a failure and is always the last item.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Parameters used when instantiating an engine for a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadParams {
    pub context_size: u32,
    /// Layers offloaded to the GPU. Negative means all of them.
    pub gpu_layers: i32,
}

impl Default for LoadParams {
    fn default() -> Self {
        Self {
            context_size: 4096,
            gpu_layers: -1,
        }
    }
}

/// Sampling parameters, passed to the engine as-is.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Upper bound on produced fragments. Must be positive.
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
        }
    }
}

impl SamplingParams {
    /// Reject values the engine would misinterpret.
    pub fn validate(&self) -> Result<()> {
        use crate::error::Error;

        if self.max_tokens == 0 {
            return Err(Error::InvalidRequest(
                "max_tokens must be a positive integer".to_string(),
            ));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(Error::InvalidRequest(format!(
                "temperature must be >= 0, got {}",
                self.temperature
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(Error::InvalidRequest(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        Ok(())
    }
}

/// Drop empty fragments and stop after `max_tokens` of them.
pub fn bounded(fragments: FragmentStream, max_tokens: u32) -> FragmentStream {
    Box::pin(
        fragments
            .filter(|item| future::ready(!matches!(item, Ok(text) if text.is_empty())))
            .take(max_tokens as usize),
    )
}

/// A live, instantiated model.
///
/// Handles are not assumed to be safe for concurrent generation; callers
/// serialize access per model (see `LoadedModel::generation_lock`).
#[async_trait]
pub trait ModelHandle: Send + Sync {
    /// Start a generation and return its fragments.
    ///
    /// Errors returned here happen before any fragment is produced.
    async fn stream(&self, prompt: &str, sampling: &SamplingParams) -> Result<FragmentStream>;

    /// Run a generation to completion and return the full text.
    ///
    /// Concatenates exactly what [`bounded`] lets through, so the result
    /// matches a streamed generation with the same parameters.
    async fn complete(&self, prompt: &str, sampling: &SamplingParams) -> Result<String> {
        let mut fragments = bounded(self.stream(prompt, sampling).await?, sampling.max_tokens);
        let mut text = String::new();
        while let Some(fragment) = fragments.next().await {
            text.push_str(&fragment?);
        }
        Ok(text)
    }

    /// Release engine resources. Called exactly once, on unload.
    async fn release(&self);
}

/// Factory for model handles.
#[async_trait]
pub trait ModelRuntime: Send + Sync {
    /// Unique identifier for this runtime type (e.g., "llama_server").
    fn runtime_type(&self) -> &'static str;

    /// Instantiate an engine for `descriptor`.
    ///
    /// Failures are reported as `Error::EngineInit` carrying the engine's
    /// message; nothing is left running on failure.
    async fn instantiate(
        &self,
        descriptor: &ModelDescriptor,
        params: &LoadParams,
    ) -> Result<Box<dyn ModelHandle>>;
}
