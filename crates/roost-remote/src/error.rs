//! Error types for Panel communication.

use roost_error::CommonError;
use thiserror::Error;

/// Result type alias for remote operations.
pub type Result<T> = std::result::Result<T, RemoteError>;

/// Errors from talking to the Panel.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Common errors shared across Roost crates.
    #[error(transparent)]
    Common(#[from] CommonError),

    /// The Panel answered with a non-success status.
    #[error("panel returned {status}: {message}")]
    Api { status: u16, message: String },
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            Self::Common(CommonError::remote_unavailable(err.to_string()))
        } else {
            Self::Common(CommonError::internal(format!("panel request: {err}")))
        }
    }
}

impl From<RemoteError> for CommonError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Common(c) => c,
            RemoteError::Api { status, message } => {
                CommonError::remote_unavailable(format!("panel returned {status}: {message}"))
            }
        }
    }
}
