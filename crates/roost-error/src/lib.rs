//! Common error types for Roost.
//!
//! This crate provides the daemon-wide error taxonomy shared across the
//! Roost crates. Crate-specific error enums wrap [`CommonError`] with
//! `#[error(transparent)]` so callers can always classify a failure by kind
//! regardless of which subsystem produced it:
//!
//! ```rust,ignore
//! use roost_error::CommonError;
//! use thiserror::Error;
//!
//! #[derive(Debug, Error)]
//! pub enum FsError {
//!     #[error(transparent)]
//!     Common(#[from] CommonError),
//!
//!     #[error("unrecognized archive format")]
//!     UnknownArchive,
//! }
//! ```

mod common;

pub use common::CommonError;

/// Result type alias using [`CommonError`].
pub type Result<T> = std::result::Result<T, CommonError>;
