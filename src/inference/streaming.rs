//! Streaming inference support
//!
//! Channel items produced by [`crate::inference::LlmEngine::generate_stream`].

/// Represents a token emitted during streaming inference.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamToken {
    /// Incremental generated text
    Token(String),
    /// Generation completed successfully
    Done,
    /// Generation failed; no more items follow
    Error(String),
}

impl StreamToken {
    /// Returns true for the final item of a stream
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamToken::Done | StreamToken::Error(_))
    }

    /// Extracts the text if this is a Token variant
    pub fn as_token(&self) -> Option<&str> {
        match self {
            StreamToken::Token(s) => Some(s),
            _ => None,
        }
    }
}
