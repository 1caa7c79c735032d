//! Context worker thread
//!
//! Each llama.cpp context is created on, used from and freed on one dedicated
//! thread. The async side sends [`ContextCommand`]s; generated tokens come back
//! as batches that always end on a UTF-8 character boundary.

use std::num::NonZeroU32;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use tokio::sync::{mpsc as async_mpsc, oneshot};

use crate::inference::config::SamplingParams;
use crate::inference::error::RuntimeError;
use crate::inference::runtime::Token;

/// Tokens decoded per `llama_decode` call while ingesting a prompt
const PROMPT_BATCH_SIZE: usize = 512;

/// Commands sent to a context worker
pub(super) enum ContextCommand {
    Prompt {
        text: String,
        seq_id: i32,
        sampling: SamplingParams,
        batch_tx: async_mpsc::UnboundedSender<Vec<Token>>,
        done_tx: oneshot::Sender<Result<(), RuntimeError>>,
    },
    Shutdown,
}

/// Handle to a running context worker
pub(super) struct ContextWorker {
    commands: Sender<ContextCommand>,
    handle: Option<JoinHandle<()>>,
}

impl ContextWorker {
    /// Starts a worker and waits until it has created its context.
    pub(super) async fn spawn(
        backend: Arc<LlamaBackend>,
        model: Arc<LlamaModel>,
        context_size: u32,
    ) -> Result<Self, RuntimeError> {
        let (command_tx, command_rx) = mpsc::channel::<ContextCommand>();
        let (ready_tx, ready_rx) = oneshot::channel();

        let handle = thread::Builder::new()
            .name(format!("llama-ctx-{context_size}"))
            .spawn(move || {
                context_thread_main(backend, model, context_size, ready_tx, command_rx);
            })
            .map_err(|e| RuntimeError::Worker(e.to_string()))?;

        match ready_rx.await {
            Ok(Ok(())) => Ok(Self {
                commands: command_tx,
                handle: Some(handle),
            }),
            Ok(Err(e)) => {
                join(handle).await?;
                Err(e)
            }
            Err(_) => {
                join(handle).await?;
                Err(RuntimeError::Worker(
                    "context worker exited before reporting".to_string(),
                ))
            }
        }
    }

    pub(super) fn sender(&self) -> Sender<ContextCommand> {
        self.commands.clone()
    }

    /// Stops the worker and waits for the context to be freed
    pub(super) async fn shutdown(mut self) -> Result<(), RuntimeError> {
        let _ = self.commands.send(ContextCommand::Shutdown);
        match self.handle.take() {
            Some(handle) => join(handle).await,
            None => Ok(()),
        }
    }
}

impl Drop for ContextWorker {
    fn drop(&mut self) {
        // Without shutdown() the thread is detached; it frees the context once
        // it sees this.
        if self.handle.is_some() {
            let _ = self.commands.send(ContextCommand::Shutdown);
        }
    }
}

async fn join(handle: JoinHandle<()>) -> Result<(), RuntimeError> {
    tokio::task::spawn_blocking(move || handle.join())
        .await
        .map_err(|e| RuntimeError::Worker(e.to_string()))?
        .map_err(|_| RuntimeError::Worker("context worker panicked".to_string()))
}

/// Worker thread main loop
///
/// Owns the `LlamaContext`; it is dropped when the loop ends.
fn context_thread_main(
    backend: Arc<LlamaBackend>,
    model: Arc<LlamaModel>,
    context_size: u32,
    ready_tx: oneshot::Sender<Result<(), RuntimeError>>,
    command_rx: Receiver<ContextCommand>,
) {
    let ctx_params = LlamaContextParams::default()
        .with_n_ctx(NonZeroU32::new(context_size))
        .with_n_batch(PROMPT_BATCH_SIZE as u32);

    let mut ctx = match model.new_context(&backend, ctx_params) {
        Ok(ctx) => ctx,
        Err(e) => {
            let _ = ready_tx.send(Err(RuntimeError::ContextCreate(format!(
                "context size {context_size}: {e}"
            ))));
            return;
        }
    };
    let _ = ready_tx.send(Ok(()));
    tracing::info!("Context worker started (context size {})", context_size);

    loop {
        match command_rx.recv() {
            Ok(ContextCommand::Prompt {
                text,
                seq_id,
                sampling,
                batch_tx,
                done_tx,
            }) => {
                let result = run_prompt(&mut ctx, &model, &text, seq_id, sampling, context_size, &batch_tx);
                drop(batch_tx);
                let _ = done_tx.send(result);
            }
            Ok(ContextCommand::Shutdown) => {
                tracing::info!("Context worker shutting down (context size {})", context_size);
                break;
            }
            Err(_) => {
                tracing::debug!("Command channel closed, context worker exiting");
                break;
            }
        }
    }
}

/// Runs one completion on the worker's context
fn run_prompt(
    ctx: &mut LlamaContext,
    model: &LlamaModel,
    text: &str,
    seq_id: i32,
    sampling: SamplingParams,
    context_size: u32,
    tx: &async_mpsc::UnboundedSender<Vec<Token>>,
) -> Result<(), RuntimeError> {
    let prompt = match build_chat_prompt(model, text) {
        Ok(chat_prompt) => chat_prompt,
        Err(error) => {
            tracing::warn!("Chat template not applied: {error}");
            text.to_string()
        }
    };

    // Sessions are single-shot; nothing from a previous prompt is kept.
    ctx.clear_kv_cache();

    let tokens = model
        .str_to_token(&prompt, AddBos::Always)
        .map_err(|e| RuntimeError::Tokenization(e.to_string()))?;
    if tokens.is_empty() {
        return Err(RuntimeError::Tokenization("prompt produced no tokens".to_string()));
    }
    if tokens.len() >= context_size as usize {
        return Err(RuntimeError::Inference(format!(
            "prompt is {} tokens, context holds {}",
            tokens.len(),
            context_size
        )));
    }
    tracing::debug!("Tokenized prompt into {} tokens", tokens.len());

    let mut batch = LlamaBatch::new(PROMPT_BATCH_SIZE, 1);
    let last = tokens.len() - 1;
    for (chunk_index, chunk) in tokens.chunks(PROMPT_BATCH_SIZE).enumerate() {
        batch.clear();
        for (offset, token) in chunk.iter().enumerate() {
            let pos = chunk_index * PROMPT_BATCH_SIZE + offset;
            batch
                .add(*token, pos as i32, &[seq_id], pos == last)
                .map_err(|e| RuntimeError::Inference(format!("Failed to add token to batch: {e}")))?;
        }
        ctx.decode(&mut batch)
            .map_err(|e| RuntimeError::Inference(format!("Failed to decode prompt: {e}")))?;
    }

    let mut sampler = build_sampler(sampling);
    let mut n_cur = tokens.len() as i32;
    let mut pending = PendingBatch::default();

    while n_cur < context_size as i32 {
        let token = sampler.sample(ctx, batch.n_tokens() - 1);
        sampler.accept(token);

        if model.is_eog_token(token) {
            tracing::debug!("End of generation token encountered");
            break;
        }

        let bytes = model
            .token_to_bytes(token, Special::Tokenize)
            .map_err(|e| RuntimeError::Inference(format!("Failed to convert token to bytes: {e}")))?;

        if let Some(ready) = pending.push(Token(token.0), &bytes) {
            if tx.send(ready).is_err() {
                tracing::debug!("Receiver dropped, stopping generation");
                return Ok(());
            }
        }

        batch.clear();
        batch
            .add(token, n_cur, &[seq_id], true)
            .map_err(|e| RuntimeError::Inference(format!("Failed to add token to batch: {e}")))?;
        ctx.decode(&mut batch)
            .map_err(|e| RuntimeError::Inference(format!("Failed to decode: {e}")))?;
        n_cur += 1;
    }

    if n_cur >= context_size as i32 {
        tracing::debug!("Context full after {} tokens, stopping generation", n_cur);
    }
    if let Some(rest) = pending.flush() {
        let _ = tx.send(rest);
    }
    Ok(())
}

fn build_chat_prompt(model: &LlamaModel, prompt: &str) -> Result<String, String> {
    let template = model
        .chat_template(None)
        .map_err(|e| format!("Failed to load chat template: {e}"))?;
    let user_message = LlamaChatMessage::new("user".to_string(), prompt.to_string())
        .map_err(|e| format!("Failed to build chat message: {e}"))?;
    model
        .apply_chat_template(&template, &[user_message], true)
        .map_err(|e| format!("Failed to apply chat template: {e}"))
}

fn build_sampler(sampling: SamplingParams) -> LlamaSampler {
    if sampling.temperature < 0.01 {
        // Use greedy sampling for very low temperature
        LlamaSampler::greedy()
    } else {
        LlamaSampler::chain_simple([
            LlamaSampler::top_k(sampling.top_k),
            LlamaSampler::top_p(sampling.top_p, 1),
            LlamaSampler::temp(sampling.temperature),
            LlamaSampler::dist(rand_seed()),
        ])
    }
}

/// Detokenizes a batch; undecodable tokens are skipped with a warning
pub(super) fn detokenize(model: &LlamaModel, tokens: &[Token]) -> String {
    let mut bytes = Vec::new();
    for token in tokens {
        match model.token_to_bytes(LlamaToken::new(token.0), Special::Tokenize) {
            Ok(piece) => bytes.extend_from_slice(&piece),
            Err(e) => tracing::warn!("Skipping token {}: {}", token.0, e),
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Tokens whose bytes do not yet form complete UTF-8
#[derive(Debug, Default)]
struct PendingBatch {
    tokens: Vec<Token>,
    bytes: Vec<u8>,
}

impl PendingBatch {
    /// Adds a token and returns the pending batch once it ends on a character
    /// boundary. Bytes that can never become valid UTF-8 are released too.
    fn push(&mut self, token: Token, bytes: &[u8]) -> Option<Vec<Token>> {
        self.tokens.push(token);
        self.bytes.extend_from_slice(bytes);
        match std::str::from_utf8(&self.bytes) {
            Ok(_) => self.flush(),
            Err(e) if e.error_len().is_some() => self.flush(),
            Err(_) => None,
        }
    }

    fn flush(&mut self) -> Option<Vec<Token>> {
        self.bytes.clear();
        if self.tokens.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.tokens))
        }
    }
}

/// Generates a random seed using system entropy
fn rand_seed() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() as u32
}
