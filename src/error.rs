//! Pipeline error taxonomy
//!
//! Every exit path from the extraction pipeline is one of these typed
//! outcomes, so the route layer can map each to a transport status
//! deterministically instead of probing error strings.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The byte buffer could not be decoded as a raster image.
    #[error("invalid image: {0}")]
    InvalidImage(String),

    /// A face was required but none was found in the image.
    #[error("no face detected in the image")]
    NoFaceDetected,

    /// A required capability provider failed to initialize or is missing.
    #[error("model unavailable: {capability}: {reason}")]
    ModelUnavailable { capability: String, reason: String },

    /// Recognizer output length disagrees with the configured dimensionality.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    EmbeddingDimensionMismatch { expected: usize, actual: usize },

    /// The identity key already holds an embedding (unique-per-face scheme).
    #[error("identity {0} is already registered")]
    DuplicateIdentity(i64),

    /// The embedding store failed; pipeline output is discarded, not retried.
    #[error("persistence failure: {0}")]
    Persistence(#[source] anyhow::Error),

    /// Inference failed mid-stage for a required capability.
    #[error("inference failure: {0}")]
    Inference(#[source] anyhow::Error),
}

impl PipelineError {
    pub fn model_unavailable(capability: &str, reason: impl std::fmt::Display) -> Self {
        Self::ModelUnavailable {
            capability: capability.to_string(),
            reason: reason.to_string(),
        }
    }
}
