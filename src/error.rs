use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to load model artifact {path}: {reason}")]
    ModelArtifact { path: String, reason: String },

    #[error("model artifact is incompatible: {0}")]
    IncompatibleArtifact(String),

    #[error("failed to read transactions from {path}: {reason}")]
    Source { path: String, reason: String },

    #[error("{path} is missing required fields: {}", fields.join(", "))]
    MissingFields { path: String, fields: Vec<String> },

    /// Feature extractor and classifier disagree on the vector width.
    #[error("feature vector has {actual} dimensions but the classifier expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("review channel failed: {0}")]
    ReviewChannel(String),

    #[error("review is incomplete: {pending} description(s) still pending")]
    ReviewIncomplete { pending: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ClassifyError {
    pub(crate) fn artifact(path: &Path, reason: impl Into<String>) -> Self {
        Self::ModelArtifact {
            path: path.to_string_lossy().to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn source(path: &Path, reason: impl Into<String>) -> Self {
        Self::Source {
            path: path.to_string_lossy().to_string(),
            reason: reason.into(),
        }
    }

    /// Stable category used by the CLI error envelope.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::ModelArtifact { .. }
            | Self::IncompatibleArtifact(_)
            | Self::Source { .. }
            | Self::MissingFields { .. } => "STARTUP_ERROR",
            Self::DimensionMismatch { .. } => "DIMENSION_MISMATCH",
            Self::ReviewChannel(_) | Self::ReviewIncomplete { .. } => "REVIEW_ERROR",
            Self::Io(_) | Self::Csv(_) | Self::Json(_) => "IO_ERROR",
        }
    }
}
