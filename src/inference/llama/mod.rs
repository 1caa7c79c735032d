//! llama.cpp runtime
//!
//! Implements the runtime seam on top of `llama-cpp-2`.
//!
//! # Architecture
//!
//! `LlamaBackend` and `LlamaModel` can be shared across threads, so they live
//! behind `Arc`s and are created on the blocking pool. `LlamaContext` borrows its
//! model and holds raw pointers that are not `Send`, so every context gets a
//! dedicated worker thread that owns it for its whole life (see [`worker`]).
//! Sessions talk to that thread over channels.

pub mod gguf;
mod worker;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;

use async_trait::async_trait;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::LlamaModel;
use tokio::sync::{mpsc, oneshot};

use crate::inference::error::RuntimeError;
use crate::inference::runtime::{
    ContextParams, InferenceRuntime, ModelParams, NativeContext, NativeModel, NativeSession,
    PromptOptions, RuntimeProvider, Token,
};
use worker::{ContextCommand, ContextWorker};

/// Layer count passed to llama.cpp for "offload everything"
const ALL_GPU_LAYERS: u32 = i32::MAX as u32;

fn n_gpu_layers(gpu_layers: i32) -> u32 {
    u32::try_from(gpu_layers).unwrap_or(ALL_GPU_LAYERS)
}

fn join_error(e: tokio::task::JoinError) -> RuntimeError {
    RuntimeError::Worker(e.to_string())
}

/// Brings up the llama.cpp backend on first use
#[derive(Debug, Clone, Default)]
pub struct LlamaProvider {
    quiet_native_logs: bool,
}

impl LlamaProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Silences llama.cpp's own stderr logging
    pub fn quiet_native_logs(mut self, quiet: bool) -> Self {
        self.quiet_native_logs = quiet;
        self
    }
}

#[async_trait]
impl RuntimeProvider for LlamaProvider {
    type Runtime = LlamaRuntime;

    async fn init(&self) -> Result<LlamaRuntime, RuntimeError> {
        let quiet = self.quiet_native_logs;
        let backend = tokio::task::spawn_blocking(move || {
            let mut backend =
                LlamaBackend::init().map_err(|e| RuntimeError::BackendInit(e.to_string()))?;
            if quiet {
                backend.void_logs();
            }
            Ok::<_, RuntimeError>(backend)
        })
        .await
        .map_err(join_error)??;

        tracing::info!("LlamaBackend initialized");
        Ok(LlamaRuntime {
            backend: Arc::new(backend),
        })
    }
}

/// An initialized llama.cpp backend
pub struct LlamaRuntime {
    backend: Arc<LlamaBackend>,
}

#[async_trait]
impl InferenceRuntime for LlamaRuntime {
    type Model = LlamaModelHandle;
    type Context = LlamaContextHandle;
    type Sequence = LlamaSequence;
    type Session = LlamaSession;

    async fn load_model(&self, params: ModelParams) -> Result<LlamaModelHandle, RuntimeError> {
        let backend = Arc::clone(&self.backend);
        tokio::task::spawn_blocking(move || load_model_blocking(backend, &params))
            .await
            .map_err(join_error)?
    }

    fn create_session(&self, sequence: LlamaSequence) -> Result<LlamaSession, RuntimeError> {
        Ok(LlamaSession {
            commands: sequence.commands,
            seq_id: sequence.seq_id,
        })
    }
}

fn load_model_blocking(
    backend: Arc<LlamaBackend>,
    params: &ModelParams,
) -> Result<LlamaModelHandle, RuntimeError> {
    let path: &Path = &params.model_path;
    let header = gguf::read_header(path).map_err(|e| {
        tracing::error!("Rejected {}: {}", path.display(), e);
        RuntimeError::ModelValidation(e.to_string())
    })?;
    tracing::debug!(
        "GGUF v{} header ok for {:?} ({} tensors)",
        header.version,
        path,
        header.tensor_count
    );

    let model_params = LlamaModelParams::default().with_n_gpu_layers(n_gpu_layers(params.gpu_layers));
    let model = LlamaModel::load_from_file(&backend, path, &model_params).map_err(|e| {
        tracing::error!("llama.cpp could not load {}: {}", path.display(), e);
        RuntimeError::ModelLoad(format!("gpu layers {}: {e}", params.gpu_layers))
    })?;

    tracing::info!(
        "Model weights loaded: {} ({} params, {} vocab, {} training ctx, gpu layers {})",
        path.display(),
        model.n_params(),
        model.n_vocab(),
        model.n_ctx_train(),
        params.gpu_layers
    );

    Ok(LlamaModelHandle {
        backend,
        model: Some(Arc::new(model)),
    })
}

/// Loaded llama.cpp weights
pub struct LlamaModelHandle {
    backend: Arc<LlamaBackend>,
    model: Option<Arc<LlamaModel>>,
}

#[async_trait]
impl NativeModel for LlamaModelHandle {
    type Context = LlamaContextHandle;

    async fn create_context(&self, params: ContextParams) -> Result<LlamaContextHandle, RuntimeError> {
        let model = self
            .model
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| RuntimeError::ContextCreate("model already disposed".to_string()))?;

        let worker = ContextWorker::spawn(Arc::clone(&self.backend), model, params.context_size).await?;
        Ok(LlamaContextHandle {
            worker: Some(worker),
            sequence_taken: AtomicBool::new(false),
        })
    }

    fn detokenize(&self, tokens: &[Token]) -> String {
        match &self.model {
            Some(model) => worker::detokenize(model, tokens),
            None => String::new(),
        }
    }

    async fn dispose(&mut self) -> Result<(), RuntimeError> {
        let Some(model) = self.model.take() else {
            return Ok(());
        };
        let holders = Arc::strong_count(&model) - 1;
        if holders > 0 {
            tracing::warn!("Model still held by {} context worker(s); freed when they exit", holders);
        }
        tokio::task::spawn_blocking(move || drop(model))
            .await
            .map_err(join_error)?;
        tracing::debug!("Model weights released");
        Ok(())
    }
}

/// A llama.cpp context, owned by its worker thread
pub struct LlamaContextHandle {
    worker: Option<ContextWorker>,
    sequence_taken: AtomicBool,
}

#[async_trait]
impl NativeContext for LlamaContextHandle {
    type Sequence = LlamaSequence;

    /// Contexts are created with a single sequence; it can be handed out once.
    fn sequence(&self) -> Result<LlamaSequence, RuntimeError> {
        let worker = self
            .worker
            .as_ref()
            .ok_or_else(|| RuntimeError::Sequence("context already disposed".to_string()))?;
        if self.sequence_taken.swap(true, Ordering::SeqCst) {
            return Err(RuntimeError::Sequence("no sequences left".to_string()));
        }
        Ok(LlamaSequence {
            commands: worker.sender(),
            seq_id: 0,
        })
    }

    async fn dispose(&mut self) -> Result<(), RuntimeError> {
        match self.worker.take() {
            Some(worker) => worker.shutdown().await,
            None => Ok(()),
        }
    }
}

/// Sequence slot of a context
pub struct LlamaSequence {
    commands: Sender<ContextCommand>,
    seq_id: i32,
}

/// Prompts a context's sequence through its worker thread
pub struct LlamaSession {
    commands: Sender<ContextCommand>,
    seq_id: i32,
}

#[async_trait]
impl NativeSession for LlamaSession {
    async fn prompt(
        &self,
        text: &str,
        options: PromptOptions,
        on_tokens: &mut (dyn for<'t> FnMut(&'t [Token]) + Send),
    ) -> Result<(), RuntimeError> {
        let (batch_tx, mut batch_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();

        self.commands
            .send(ContextCommand::Prompt {
                text: text.to_string(),
                seq_id: self.seq_id,
                sampling: options.sampling,
                batch_tx,
                done_tx,
            })
            .map_err(|e| RuntimeError::Worker(e.to_string()))?;

        while let Some(batch) = batch_rx.recv().await {
            on_tokens(&batch);
        }

        done_rx
            .await
            .map_err(|_| RuntimeError::Worker("context worker exited during generation".to_string()))?
    }
}
