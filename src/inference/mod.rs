//! LLM inference engine
//!
//! Model lifecycle, load strategy ladder and streaming generation, on top of a
//! native runtime abstracted by [`runtime`]. [`llama`] is the llama.cpp backend.

pub mod config;
pub mod engine;
pub mod error;
pub mod generation;
pub mod handles;
pub mod llama;
pub mod manager;
pub mod planner;
pub mod runtime;
pub mod streaming;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types for convenience
pub use config::{ConfigStore, LlmConfig, LlmConfigUpdate, SamplingParams, GPU_LAYERS_AUTO};
pub use engine::LlmEngine;
pub use error::{GenError, InitError, LoadError, RuntimeError};
pub use llama::{LlamaProvider, LlamaRuntime};
pub use manager::{ModelManager, ModelState};
pub use planner::{plan_attempts, FatalErrorPolicy, LoadAttempt};
pub use runtime::{InferenceRuntime, RuntimeProvider, Token};
pub use streaming::StreamToken;
