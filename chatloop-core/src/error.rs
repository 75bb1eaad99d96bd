//! Error types for chatloop.

use thiserror::Error;

/// Main error type for generation.
#[derive(Error, Debug)]
pub enum ChatError {
    /// The model path or tag does not name a known family.
    #[error("Unsupported model: {0}")]
    UnsupportedModel(String),

    /// A forward pass of the inference engine failed.
    #[error("Engine execution error: {0}")]
    Engine(String),

    /// Every candidate probability collapsed to zero after top-k/top-p masking.
    #[error("Sampler received a degenerate distribution")]
    DegenerateDistribution,

    /// Sampling parameters outside their valid ranges.
    #[error("Invalid sampling parameters: {0}")]
    InvalidSampling(String),

    /// Graph metadata (ports, shapes, manifest) violates the named I/O contract.
    #[error("Graph error: {0}")]
    Graph(String),

    /// Tokenizer loading or encode/decode failures.
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ChatError {
    pub fn engine(e: impl std::fmt::Display) -> Self {
        ChatError::Engine(e.to_string())
    }
}

/// Result type alias for chatloop operations.
pub type Result<T> = std::result::Result<T, ChatError>;
