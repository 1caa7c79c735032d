//! Error types
//!
//! One enum per layer: the native runtime seam, initialization, loading and
//! generation.

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by a native inference runtime.
///
/// The message text matters: load failures are classified as recoverable or
/// fatal by inspecting it (see [`crate::inference::planner::classify_failure`]).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("Failed to initialize backend: {0}")]
    BackendInit(String),

    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Model validation failed: {0}")]
    ModelValidation(String),

    #[error("Failed to create context: {0}")]
    ContextCreate(String),

    #[error("Sequence unavailable: {0}")]
    Sequence(String),

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Worker thread error: {0}")]
    Worker(String),
}

/// The runtime could not be brought up.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum InitError {
    #[error("Inference runtime failed to initialize: {0}")]
    Backend(String),
}

impl From<RuntimeError> for InitError {
    fn from(e: RuntimeError) -> Self {
        InitError::Backend(e.to_string())
    }
}

/// Errors returned by `load_model`.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LoadError {
    #[error("Model file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error(transparent)]
    Init(#[from] InitError),

    #[error("Engine has been disposed; call initialize() first")]
    Disposed,

    #[error(
        "Failed to load model with context sizes {} down to {}: {last_error}",
        .tried_range.0,
        .tried_range.1
    )]
    ExhaustedStrategies {
        /// Message of the last underlying failure
        last_error: String,
        /// Largest and smallest context size actually attempted
        tried_range: (u32, u32),
    },
}

/// Errors returned by `generate_response`.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GenError {
    #[error("No model loaded")]
    NoModelLoaded,

    #[error("Generation failed: {0}")]
    Runtime(String),
}

impl From<RuntimeError> for GenError {
    fn from(e: RuntimeError) -> Self {
        GenError::Runtime(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausted_message_carries_range_and_cause() {
        let err = LoadError::ExhaustedStrategies {
            last_error: "out of memory".to_string(),
            tried_range: (5000, 2000),
        };
        let msg = err.to_string();
        assert!(msg.contains("5000"));
        assert!(msg.contains("2000"));
        assert!(msg.contains("out of memory"));
    }

    #[test]
    fn test_runtime_error_into_gen_error() {
        let err: GenError = RuntimeError::Inference("decode failed".to_string()).into();
        assert_eq!(
            err,
            GenError::Runtime("Inference failed: decode failed".to_string())
        );
    }
}
