use crate::naming::NamingError;
use std::path::PathBuf;
use thiserror::Error;

/// Failures of the on-disk photo and metadata stores
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed metadata record {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode metadata record {filename}: {source}")]
    Encode {
        filename: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Not found: {0}")]
    NotFound(String),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors surfaced by the ingestion and query operations
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<NamingError> for UploadError {
    fn from(e: NamingError) -> Self {
        UploadError::InvalidArgument(e.to_string())
    }
}

impl UploadError {
    /// Whether the caller caused the failure
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            UploadError::UnsupportedMediaType(_)
                | UploadError::InvalidArgument(_)
                | UploadError::NotFound(_)
        )
    }
}
