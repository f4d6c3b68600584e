//! Error types for the seq2seq toolkit.

use thiserror::Error;

/// Main error type for seq2seq operations.
#[derive(Error, Debug)]
pub enum S2sError {
    /// Audio processing errors.
    #[error("Audio error: {0}")]
    Audio(String),

    /// Model construction or loading errors.
    #[error("Model error: {0}")]
    Model(String),

    /// Corpus and batching errors.
    #[error("Data error: {0}")]
    Data(String),

    /// Vocabulary errors.
    #[error("Vocab error: {0}")]
    Vocab(String),

    /// Inference and training-time numeric errors.
    #[error("Inference error: {0}")]
    Inference(String),

    /// Configuration errors.
    #[error("Config error: {0}")]
    Config(String),

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Candle tensor errors.
    #[error("Tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    /// JSON parsing errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for seq2seq operations.
pub type S2sResult<T> = Result<T, S2sError>;
