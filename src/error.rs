//! Error types for ddgan-rs.

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Candle tensor error.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// Invalid configuration. Raised at construction time, before any
    /// sampling work begins.
    #[error("config: {0}")]
    Config(String),

    /// Tensor shape or batch-size mismatch. Raised before entering the
    /// reverse loop — a failure mid-loop would leave a half-denoised sample.
    #[error("shape: {0}")]
    Shape(String),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}
