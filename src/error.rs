//! Typed pipeline failures.
//!
//! Configuration and I/O seams return `anyhow::Result`. Anything a caller
//! has to branch on (mark a unit failed, move the document to `error`, back
//! off the dispatcher) is a [`PipelineError`] variant.

use thiserror::Error;

use crate::validator::ValidationResult;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Every active model failed once for the same request.
    #[error("all {attempts} configured models failed; last error: {last_error}")]
    ModelExhausted { attempts: usize, last_error: String },

    /// Output was produced but is structurally unacceptable.
    #[error("stage '{stage}' produced invalid JSON: {}", .result.summary())]
    Validation {
        stage: String,
        result: Box<ValidationResult>,
    },

    /// Chunk upload or remote processing exhausted its retries.
    #[error("chunk upload failed for document {document_id}: {message}")]
    Upload {
        document_id: String,
        message: String,
    },

    /// The atomic claim could not be performed.
    #[error("failed to claim next unit for document {document_id}: {message}")]
    Claim {
        document_id: String,
        message: String,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("no models configured")]
    NoModels,

    #[error("object storage error: {0}")]
    Storage(String),

    #[error("pdf error: {0}")]
    Pdf(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl PipelineError {
    /// Machine-readable error type used in unit error payloads and the HTTP API.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::ModelExhausted { .. } => "model_exhausted",
            PipelineError::Validation { .. } => "validation_failed",
            PipelineError::Upload { .. } => "upload_failed",
            PipelineError::Claim { .. } => "claim_failed",
            PipelineError::NotFound(_) => "not_found",
            PipelineError::InvalidState(_) => "invalid_state",
            PipelineError::NoModels => "no_models",
            PipelineError::Storage(_) => "storage_error",
            PipelineError::Pdf(_) => "pdf_error",
            PipelineError::Store(_) => "store_error",
        }
    }

    /// Short reason suitable for end users. Diagnostics stay in alerts.
    pub fn user_message(&self) -> String {
        match self {
            PipelineError::ModelExhausted { .. } => {
                "The analysis could not be completed by any available model.".to_string()
            }
            PipelineError::Validation { stage, .. } => {
                format!("The '{}' report came back incomplete.", stage)
            }
            PipelineError::Upload { .. } => {
                "The document could not be prepared for analysis.".to_string()
            }
            _ => "An internal error interrupted the analysis.".to_string(),
        }
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
