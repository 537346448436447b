//! Backup adapters: archive a server's files to one of several storage
//! backends, restore them entry-by-entry through the caller's sandbox, and
//! report archive details (checksum, size, uploaded parts) to the Panel.

mod error;
mod local;
pub mod restic;
mod s3;

pub use error::{BackupError, Result};
pub use local::LocalBackup;
pub use restic::{ResticBackup, ResticSettings};
pub use s3::S3Backup;

use std::io::Read;

use async_trait::async_trait;
use roost_fs::Filesystem;
use roost_remote::BackupPart;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Storage backend tag, as the Panel names them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    Local,
    S3,
    Restic,
}

/// Identity shared by every adapter.
#[derive(Debug, Clone)]
pub struct BackupMeta {
    pub uuid: Uuid,
    pub server_uuid: Uuid,
    /// Raw caller-supplied ignore patterns, one per line, combined with the
    /// server root's `.ignore` file.
    pub ignore: String,
}

/// Details of a generated archive.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveDetails {
    pub checksum: String,
    pub checksum_type: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<BackupPart>,
}

/// Callback invoked for every entry while restoring: root-relative path,
/// entry metadata, and a reader positioned at the entry's contents.
pub type RestoreVisitor<'a> =
    &'a mut (dyn FnMut(&str, &RestoreEntry, &mut dyn Read) -> std::io::Result<()> + Send);

/// Metadata for one archive entry being restored.
#[derive(Debug, Clone)]
pub struct RestoreEntry {
    pub size: u64,
    pub mode: u32,
    pub mtime: Option<i64>,
    pub is_dir: bool,
    pub link_target: Option<String>,
}

impl RestoreEntry {
    /// Convenience view as the filesystem's own metadata shape.
    #[must_use]
    pub fn is_regular(&self) -> bool {
        !self.is_dir && self.link_target.is_none()
    }
}

/// A backup storage backend.
///
/// Adapters are cancel-safe at their await points; long blocking work
/// (archiving, hashing) runs on blocking threads.
#[async_trait]
pub trait BackupAdapter: Send + Sync {
    fn meta(&self) -> &BackupMeta;

    fn kind(&self) -> AdapterKind;

    /// Creates the archive from the server filesystem, honoring the ignore
    /// patterns, and returns its details. A failed generation leaves no
    /// partial file behind.
    async fn generate(&self, fs: &Filesystem) -> Result<ArchiveDetails>;

    /// Walks the archive, invoking `visit` for every entry. `reader`
    /// supplies the archive body for adapters that do not store it locally;
    /// the local adapter ignores it and reads its own file.
    async fn restore(&self, reader: Box<dyn Read + Send>, visit: RestoreVisitor<'_>)
        -> Result<()>;

    /// Removes the stored archive.
    async fn remove(&self) -> Result<()>;

    /// Opens the archive for streaming to a caller. Only meaningful for
    /// adapters that hold the archive on this node.
    async fn download(&self) -> Result<tokio::fs::File>;

    /// Details of the stored archive.
    async fn details(&self) -> Result<ArchiveDetails>;
}

/// Stats an archive produced by [`Filesystem`]-based adapters.
pub(crate) fn file_details(path: &std::path::Path) -> Result<ArchiveDetails> {
    use sha2::{Digest, Sha256};

    let mut file = std::fs::File::open(path).map_err(roost_error::CommonError::Io)?;
    let size = file
        .metadata()
        .map_err(roost_error::CommonError::Io)?
        .len();
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher).map_err(roost_error::CommonError::Io)?;
    Ok(ArchiveDetails {
        checksum: hex::encode(hasher.finalize()),
        checksum_type: "sha256".to_string(),
        size,
        parts: Vec::new(),
    })
}

/// Walks a tar(.gz) stream invoking the restore visitor. Detects gzip by
/// its magic bytes so uncompressed archives restore equally well. Shared
/// with the inbound transfer pipeline, which extracts the same wire format.
pub fn walk_archive(
    mut reader: Box<dyn Read + Send>,
    visit: RestoreVisitor<'_>,
) -> Result<()> {
    let mut magic = [0u8; 2];
    let n = read_exact_or_eof(&mut reader, &mut magic)?;
    let prefixed: Box<dyn Read + Send> = Box::new(std::io::Cursor::new(magic[..n].to_vec()).chain(reader));
    let body: Box<dyn Read> = if magic == [0x1f, 0x8b] {
        Box::new(flate2::read::GzDecoder::new(prefixed))
    } else {
        prefixed
    };

    let mut archive = tar::Archive::new(body);
    for entry in archive.entries().map_err(roost_error::CommonError::Io)? {
        let mut entry = entry.map_err(roost_error::CommonError::Io)?;
        let path = entry
            .path()
            .map_err(roost_error::CommonError::Io)?
            .to_string_lossy()
            .into_owned();
        let header = entry.header();
        let info = RestoreEntry {
            size: header.size().unwrap_or(0),
            mode: header.mode().unwrap_or(0o644) & 0o7777,
            mtime: header.mtime().ok().map(|m| m as i64),
            is_dir: header.entry_type() == tar::EntryType::Directory,
            link_target: entry
                .link_name()
                .ok()
                .flatten()
                .map(|l| l.to_string_lossy().into_owned()),
        };
        visit(&path, &info, &mut entry).map_err(roost_error::CommonError::Io)?;
    }
    Ok(())
}

fn read_exact_or_eof(reader: &mut dyn Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader
            .read(&mut buf[filled..])
            .map_err(roost_error::CommonError::Io)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Restores an entry into a server filesystem: the default visitor used by
/// both backup restoration and inbound transfers.
pub fn restore_entry_to_filesystem(
    fs: &Filesystem,
    path: &str,
    entry: &RestoreEntry,
    reader: &mut dyn Read,
) -> std::io::Result<()> {
    let to_io = |err: roost_error::CommonError| std::io::Error::other(err.to_string());

    if entry.is_dir {
        return fs.mkdir_all(path, 0o755).map_err(to_io);
    }
    if let Some(target) = &entry.link_target {
        // A pre-existing link is fine; resolution guards enforcement.
        let _ = fs.symlink(target, path);
        return Ok(());
    }
    fs.write_file(path, reader, entry.size, entry.mode)
        .map_err(to_io)?;
    if let Some(mtime) = entry.mtime {
        if let Some(ts) = chrono::DateTime::from_timestamp(mtime, 0) {
            fs.chtimes(path, None, Some(ts)).map_err(to_io)?;
        }
    }
    Ok(())
}
