//! Error types for the test harness

use thiserror::Error;

use probelab_envelope::EnvelopeError;

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("unknown bundle variant: {0:?} (set PW_BUNDLE to a known variant key)")]
    UnknownVariant(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("page build failed: {0}")]
    Build(String),

    #[error("loader generation failed: {0}")]
    Loader(String),

    #[error("asset registry error: {0}")]
    Asset(String),

    #[error("page server error: {0}")]
    Server(String),

    #[error("browser driver error: {0}")]
    Driver(String),

    #[error("timed out after {timeout_ms} ms waiting for envelope #{index} matching {what}")]
    WaitTimeout {
        what: String,
        index: usize,
        timeout_ms: u64,
    },

    #[error("captured request failed to decode: {0}")]
    Decode(#[from] EnvelopeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type HarnessResult<T> = Result<T, HarnessError>;
