// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for candle-patch.

/// Errors that can occur while synchronizing or running a session.
///
/// A stale client write is deliberately absent: it is an expected race and
/// is reported as `accepted: false` on the sync response instead.
#[derive(Debug, thiserror::Error)]
pub enum MIError {
    /// Tensor operation or forward pass error (wraps candle).
    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),

    /// Hook lookup or dispatch error.
    #[error("hook error: {0}")]
    Hook(String),

    /// Malformed or out-of-range slice bounds.
    #[error("invalid slice: {0}")]
    InvalidSlice(String),

    /// An ablation could not be applied to the value it was invoked on.
    #[error("invalid ablation: {0}")]
    InvalidAblation(String),

    /// A patch could not be applied to the value it was invoked on.
    #[error("invalid patch: {0}")]
    InvalidPatch(String),

    /// The model collaborator failed to evaluate the prompt.
    #[error("evaluation failed: {0}")]
    Evaluation(String),

    /// Engine configuration parsing or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// Tokenizer error.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// JSON (de)serialization error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for candle-patch operations.
pub type Result<T> = std::result::Result<T, MIError>;
