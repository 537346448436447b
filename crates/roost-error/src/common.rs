//! Daemon-wide error taxonomy.

use thiserror::Error;

/// Errors that occur across multiple Roost crates.
///
/// Every caller-facing failure in the daemon reduces to one of these kinds.
/// Subsystem crates wrap this type with `#[from]` and add their own variants
/// only for failures that have no daemon-wide meaning.
#[derive(Debug, Error)]
pub enum CommonError {
    /// I/O error from the standard library.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A sandboxed path resolved to a location outside the server root.
    ///
    /// This is irrecoverable for the request that produced it: the path is
    /// attacker-controlled input and must not be retried with relaxed
    /// resolution.
    #[error("bad path resolution: {0}")]
    BadPathResolution(String),

    /// A disk operation would exceed the server's assigned quota.
    #[error("not enough disk space: {0}")]
    DiskSpace(String),

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// An operation that requires a directory was given something else.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// An operation that requires a regular file was given a directory.
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// Permission denied by the host filesystem or the container runtime.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Power action attempted while the server is suspended.
    #[error("server is suspended: {0}")]
    Suspended(String),

    /// Start attempted while the process is already running.
    #[error("server is already running")]
    AlreadyRunning,

    /// Stop attempted while the process is already offline.
    #[error("server is already stopped")]
    AlreadyStopped,

    /// A second exclusive operation was attempted while one is in progress.
    #[error("conflicting operation in progress: {0}")]
    Conflict(String),

    /// Operation requires a specific process state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Validation failure on caller-supplied input.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Integrity failure on a transferred or downloaded payload.
    #[error("checksum mismatch: {0}")]
    ChecksumMismatch(String),

    /// The Panel or a peer daemon could not be reached.
    #[error("remote unavailable: {0}")]
    RemoteUnavailable(String),

    /// The operation's context was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// Operation exceeded its allowed time limit.
    #[error("timeout: {0}")]
    Timeout(String),

    /// A catch-all for unexpected internal errors.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CommonError {
    /// Creates a new bad path resolution error.
    #[must_use]
    pub fn bad_path(path: impl Into<String>) -> Self {
        Self::BadPathResolution(path.into())
    }

    /// Creates a new disk space error.
    #[must_use]
    pub fn disk_space(msg: impl Into<String>) -> Self {
        Self::DiskSpace(msg.into())
    }

    /// Creates a new not found error.
    #[must_use]
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound(resource.into())
    }

    /// Creates a new already exists error.
    #[must_use]
    pub fn already_exists(resource: impl Into<String>) -> Self {
        Self::AlreadyExists(resource.into())
    }

    /// Creates a new suspended error.
    #[must_use]
    pub fn suspended(msg: impl Into<String>) -> Self {
        Self::Suspended(msg.into())
    }

    /// Creates a new conflict error.
    #[must_use]
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Creates a new invalid state error.
    #[must_use]
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Creates a new invalid input error.
    #[must_use]
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Creates a new checksum mismatch error.
    #[must_use]
    pub fn checksum_mismatch(msg: impl Into<String>) -> Self {
        Self::ChecksumMismatch(msg.into())
    }

    /// Creates a new remote unavailable error.
    #[must_use]
    pub fn remote_unavailable(msg: impl Into<String>) -> Self {
        Self::RemoteUnavailable(msg.into())
    }

    /// Creates a new timeout error.
    #[must_use]
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Creates a new internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns true if this is a bad path resolution error.
    #[must_use]
    pub const fn is_bad_path(&self) -> bool {
        matches!(self, Self::BadPathResolution(_))
    }

    /// Returns true if this is a disk space error.
    #[must_use]
    pub const fn is_disk_space(&self) -> bool {
        matches!(self, Self::DiskSpace(_))
    }

    /// Returns true if this is a not found error, including an underlying
    /// `NotFound` I/O error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Returns true if this is a conflict error.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Returns true if this is a cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Maps an errno from a sandboxed filesystem call to the matching error
    /// kind. `EXDEV` and `ELOOP` indicate the resolution walked out of the
    /// sandbox and are reported as bad path resolutions.
    #[must_use]
    pub fn from_errno(errno: i32, path: &str) -> Self {
        match errno {
            libc::EEXIST => Self::AlreadyExists(path.to_string()),
            libc::EISDIR => Self::IsADirectory(path.to_string()),
            libc::ENOTDIR => Self::NotADirectory(path.to_string()),
            libc::ENOENT => Self::NotFound(path.to_string()),
            libc::EACCES | libc::EPERM => Self::PermissionDenied(path.to_string()),
            libc::EXDEV | libc::ELOOP => Self::BadPathResolution(path.to_string()),
            libc::ENOSPC | libc::EDQUOT => Self::DiskSpace(path.to_string()),
            _ => Self::Io(std::io::Error::from_raw_os_error(errno)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: CommonError = io_err.into();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn bad_path_error() {
        let err = CommonError::bad_path("../etc/passwd");
        assert!(err.is_bad_path());
        assert_eq!(err.to_string(), "bad path resolution: ../etc/passwd");
    }

    #[test]
    fn errno_mapping() {
        assert!(matches!(
            CommonError::from_errno(libc::EXDEV, "a/b"),
            CommonError::BadPathResolution(_)
        ));
        assert!(matches!(
            CommonError::from_errno(libc::ENOENT, "a/b"),
            CommonError::NotFound(_)
        ));
        assert!(matches!(
            CommonError::from_errno(libc::ENOSPC, "a/b"),
            CommonError::DiskSpace(_)
        ));
    }

    #[test]
    fn conflict_error() {
        let err = CommonError::conflict("power action in progress");
        assert!(err.is_conflict());
        assert_eq!(
            err.to_string(),
            "conflicting operation in progress: power action in progress"
        );
    }
}
