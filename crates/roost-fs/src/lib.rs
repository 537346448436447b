//! Sandboxed, quota-enforcing filesystem for server data directories.
//!
//! Every server owns a [`Filesystem`] rooted at its data directory. All
//! operations take untrusted caller paths and resolve them with the
//! guarantee that the final file descriptor refers to a location beneath the
//! root after every symlink has been followed; anything that escapes is a
//! bad-path-resolution error. On Linux the resolution uses `openat2(2)` with
//! `RESOLVE_BENEATH`; elsewhere it falls back to a component-by-component
//! walk over directory-relative opens. In both cases the parent directory
//! descriptor is retained and the final operation is performed with an `*at`
//! call against it, which closes the race between resolution and use.
//!
//! A running byte counter enforces the server's disk quota: writes that
//! would overflow the limit fail before any bytes touch the disk.

mod archive;
mod compress;
mod fs;
mod ignore_set;
mod path;
mod search;
mod sys;
mod usage;
mod walk;

pub use archive::{Archive, CompressionLevel};
pub use compress::ArchiveFormat;
pub use fs::{FileInfo, Filesystem, DEFAULT_DIR_MODE, DEFAULT_FILE_MODE};
pub use ignore_set::IgnoreSet;
pub use search::{SearchOptions, SearchResult};
pub use walk::{DirEntry, WalkAction};

pub use roost_error::{CommonError, Result};
