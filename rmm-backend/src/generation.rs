//! Generation against a loaded model.

use std::sync::Arc;

use futures_util::{stream, StreamExt};
use tokio::sync::OwnedMutexGuard;

use crate::engine::{bounded, FragmentStream, SamplingParams};
use crate::error::{Error, Result};
use crate::manager::{LoadedModel, ModelManager};

/// A validated-on-use generation request.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub model: String,
    pub prompt: String,
    pub sampling: SamplingParams,
    pub stream: bool,
}

/// Output of [`generate`].
pub enum Generation {
    /// Full text of a non-streaming generation.
    Complete(String),
    /// Fragments of a streaming generation, pulled on demand.
    Stream(FragmentStream),
}

impl std::fmt::Debug for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Generation::Complete(text) => f.debug_tuple("Complete").field(text).finish(),
            Generation::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Run `request` against the model it names.
///
/// Fails with `ModelNotLoaded` before touching any engine when the model has
/// no loaded instance. A streaming generation keeps the model's generation
/// lock until its stream is exhausted or dropped.
pub async fn generate(manager: &ModelManager, request: GenerationRequest) -> Result<Generation> {
    request.sampling.validate()?;

    let model = manager
        .get(&request.model)
        .await
        .ok_or_else(|| Error::ModelNotLoaded(request.model.clone()))?;

    let guard = model.generation_lock.clone().lock_owned().await;

    tracing::debug!(
        "Generating with {} (stream: {}, max_tokens: {})",
        model.name,
        request.stream,
        request.sampling.max_tokens
    );

    if !request.stream {
        let text = model
            .handle
            .complete(&request.prompt, &request.sampling)
            .await?;
        return Ok(Generation::Complete(text));
    }

    let fragments = model
        .handle
        .stream(&request.prompt, &request.sampling)
        .await?;

    Ok(Generation::Stream(hold_while_streaming(
        bounded(fragments, request.sampling.max_tokens),
        model,
        guard,
    )))
}

struct Streaming {
    fragments: FragmentStream,
    _model: Arc<LoadedModel>,
    _guard: OwnedMutexGuard<()>,
}

/// Keep the model and its generation lock alive for the life of `fragments`.
fn hold_while_streaming(
    fragments: FragmentStream,
    model: Arc<LoadedModel>,
    guard: OwnedMutexGuard<()>,
) -> FragmentStream {
    let state = Streaming {
        fragments,
        _model: model,
        _guard: guard,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        let item = state.fragments.next().await?;
        Some((item, state))
    }))
}
