//! Prompt completion
//!
//! Streams one completion through the active session, turning each raw token
//! batch into text with the model's detokenizer.

use crate::inference::config::SamplingParams;
use crate::inference::error::GenError;
use crate::inference::handles::LoadedModel;
use crate::inference::runtime::{InferenceRuntime, NativeSession, PromptOptions, Token};

/// Runs `prompt` to completion and returns the full generated text.
///
/// `on_token` sees only the text of each new batch, never the running total.
/// A runtime failure is returned as-is; text already handed to `on_token`
/// stays delivered.
pub async fn generate<R: InferenceRuntime>(
    loaded: &LoadedModel<R>,
    prompt: &str,
    sampling: SamplingParams,
    mut on_token: Option<&mut (dyn FnMut(&str) + Send)>,
) -> Result<String, GenError> {
    let model = loaded.model();
    let mut text = String::new();
    let mut batches = 0usize;

    let mut on_tokens = |tokens: &[Token]| {
        batches += 1;
        let piece = model.detokenize(tokens);
        if piece.is_empty() {
            return;
        }
        text.push_str(&piece);
        if let Some(callback) = on_token.as_deref_mut() {
            callback(&piece);
        }
    };

    loaded
        .session()
        .session()
        .prompt(prompt, PromptOptions { sampling }, &mut on_tokens)
        .await
        .map_err(|e| {
            tracing::error!("Generation failed: {}", e);
            GenError::from(e)
        })?;

    tracing::debug!(
        "Generation finished: {} batches, {} bytes",
        batches,
        text.len()
    );
    Ok(text)
}
