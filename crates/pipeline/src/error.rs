use std::path::PathBuf;
use thiserror::Error;

/// Upload fields checked at intake
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("unknown format '{0}' (expected square, vertical or horizontal)")]
    InvalidFormat(String),
}

/// Everything that can stop an upload from becoming a finished video
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("job queue is full ({capacity} jobs waiting)")]
    QueueFull { capacity: usize },

    #[error("could not convert {path} to MP4: {detail}")]
    Conversion { path: PathBuf, detail: String },

    #[error("no closing clip configured for {municipality}")]
    MappingNotFound { municipality: String },

    #[error("closing clip not found at {path}")]
    AssetMissing { path: PathBuf },

    #[error("encoding failed: {detail}")]
    Encoding { detail: String },

    #[error("could not read video properties of {path}: {detail}")]
    Probe { path: PathBuf, detail: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Message shown to the client in the terminal progress event
    pub fn user_message(&self) -> String {
        match self {
            PipelineError::Conversion { .. } => "Error: the video could not be converted to MP4.".to_string(),
            PipelineError::MappingNotFound { municipality } => {
                format!("Error: no closing video found for {}", municipality)
            }
            PipelineError::AssetMissing { path } => {
                format!("Error: the closing video is not at {}", path.display())
            }
            other => format!("Error processing the video: {}", other),
        }
    }

    /// True for errors returned synchronously to the submitter
    pub fn is_rejection(&self) -> bool {
        matches!(self, PipelineError::Validation(_) | PipelineError::QueueFull { .. })
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
