//! Error types for environment operations.

use roost_error::CommonError;
use thiserror::Error;

/// Result type alias for environment operations.
pub type Result<T> = std::result::Result<T, EnvError>;

/// Errors that can occur while driving a container runtime.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Common errors shared across Roost crates.
    #[error(transparent)]
    Common(#[from] CommonError),

    /// Error returned by the Docker Engine API.
    #[error("docker: {0}")]
    Docker(#[from] bollard::errors::Error),
}

impl EnvError {
    /// Creates a new not found error.
    #[must_use]
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::Common(CommonError::not_found(resource))
    }

    /// Creates a new invalid state error.
    #[must_use]
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::Common(CommonError::invalid_state(msg))
    }

    /// True when the underlying failure is a missing container or image.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Common(c) => c.is_not_found(),
            Self::Docker(bollard::errors::Error::DockerResponseServerError {
                status_code, ..
            }) => *status_code == 404,
            _ => false,
        }
    }
}

impl From<EnvError> for CommonError {
    fn from(err: EnvError) -> Self {
        match err {
            EnvError::Common(c) => c,
            EnvError::Docker(e) => CommonError::internal(format!("docker: {e}")),
        }
    }
}
