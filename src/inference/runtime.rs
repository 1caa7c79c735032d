//! Native inference runtime seam
//!
//! The engine never talks to llama.cpp directly. Everything it needs from a
//! native runtime is expressed by the traits below, with associated types tying
//! a runtime's model, context, sequence and session together.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::inference::config::SamplingParams;
use crate::inference::error::RuntimeError;

/// Opaque token id produced by a runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub i32);

/// Parameters for loading model weights
#[derive(Debug, Clone, PartialEq)]
pub struct ModelParams {
    pub model_path: PathBuf,
    /// -1 = all layers, 0 = CPU only
    pub gpu_layers: i32,
}

/// Parameters for creating a context on a loaded model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextParams {
    pub context_size: u32,
}

/// Per-prompt options
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PromptOptions {
    pub sampling: SamplingParams,
}

/// Lazily brings a runtime up on first use.
#[async_trait]
pub trait RuntimeProvider: Send + Sync + 'static {
    type Runtime: InferenceRuntime;

    async fn init(&self) -> Result<Self::Runtime, RuntimeError>;
}

/// Entry point into an initialized native runtime
#[async_trait]
pub trait InferenceRuntime: Send + Sync + 'static {
    type Model: NativeModel<Context = Self::Context>;
    type Context: NativeContext<Sequence = Self::Sequence>;
    type Sequence: Send + 'static;
    type Session: NativeSession;

    async fn load_model(&self, params: ModelParams) -> Result<Self::Model, RuntimeError>;

    /// Binds a new session to a context sequence
    fn create_session(&self, sequence: Self::Sequence) -> Result<Self::Session, RuntimeError>;
}

/// A loaded weight set
#[async_trait]
pub trait NativeModel: Send + Sync + 'static {
    type Context: NativeContext;

    async fn create_context(&self, params: ContextParams) -> Result<Self::Context, RuntimeError>;

    /// Converts a token batch to text
    fn detokenize(&self, tokens: &[Token]) -> String;

    async fn dispose(&mut self) -> Result<(), RuntimeError>;
}

/// A fixed-size working window derived from a model
#[async_trait]
pub trait NativeContext: Send + Sync + 'static {
    type Sequence: Send + 'static;

    fn sequence(&self) -> Result<Self::Sequence, RuntimeError>;

    async fn dispose(&mut self) -> Result<(), RuntimeError>;
}

/// The object prompts are submitted through
#[async_trait]
pub trait NativeSession: Send + Sync + 'static {
    /// Runs one completion, handing each raw token batch to `on_tokens` as it
    /// is produced. Resolves once generation has finished.
    async fn prompt(
        &self,
        text: &str,
        options: PromptOptions,
        on_tokens: &mut (dyn for<'t> FnMut(&'t [Token]) + Send),
    ) -> Result<(), RuntimeError>;
}
