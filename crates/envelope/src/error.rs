//! Error types for envelope decoding

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("envelope decode error: {0}")]
    Decode(String),

    #[error("invalid DSN: {0}")]
    Dsn(String),

    #[error("item payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type EnvelopeResult<T> = Result<T, EnvelopeError>;
