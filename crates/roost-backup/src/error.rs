//! Error types for backup operations.

use roost_error::CommonError;
use thiserror::Error;

/// Result type alias for backup operations.
pub type Result<T> = std::result::Result<T, BackupError>;

/// Errors that can occur while generating, restoring, or removing backups.
#[derive(Debug, Error)]
pub enum BackupError {
    /// Common errors shared across Roost crates.
    #[error(transparent)]
    Common(#[from] CommonError),

    /// The external restic process failed.
    #[error("restic: {0}")]
    Restic(String),

    /// A part upload to object storage failed after retries.
    #[error("upload of part {part} failed: {message}")]
    PartUpload { part: u32, message: String },
}

impl From<roost_remote::RemoteError> for BackupError {
    fn from(err: roost_remote::RemoteError) -> Self {
        Self::Common(err.into())
    }
}

impl From<std::io::Error> for BackupError {
    fn from(err: std::io::Error) -> Self {
        Self::Common(CommonError::Io(err))
    }
}

impl From<BackupError> for CommonError {
    fn from(err: BackupError) -> Self {
        match err {
            BackupError::Common(c) => c,
            other => CommonError::internal(other.to_string()),
        }
    }
}
