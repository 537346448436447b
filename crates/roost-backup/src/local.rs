//! Local tar.gz backups under the node's backup directory.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use roost_error::CommonError;
use roost_fs::{Archive, CompressionLevel, Filesystem, IgnoreSet};
use roost_system::Rate;

use crate::error::{BackupError, Result};
use crate::{file_details, walk_archive, AdapterKind, ArchiveDetails, BackupAdapter, BackupMeta, RestoreVisitor};

/// A backup stored as `<base>/<server-uuid>/<backup-uuid>.tar.gz` on this
/// node.
#[derive(Debug)]
pub struct LocalBackup {
    meta: BackupMeta,
    base_dir: PathBuf,
    compression: CompressionLevel,
    /// Byte/second cap applied to archive reads and restore writes.
    rate: Option<Arc<Rate>>,
}

impl LocalBackup {
    #[must_use]
    pub fn new(meta: BackupMeta, base_dir: PathBuf, compression: CompressionLevel) -> Self {
        Self {
            meta,
            base_dir,
            compression,
            rate: None,
        }
    }

    /// Applies a read/write throughput cap.
    #[must_use]
    pub fn with_rate(mut self, rate: Arc<Rate>) -> Self {
        self.rate = Some(rate);
        self
    }

    /// Deterministic on-disk location of this backup.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.base_dir
            .join(self.meta.server_uuid.to_string())
            .join(format!("{}.tar.gz", self.meta.uuid))
    }

    /// Locates an existing local backup, failing when the archive is not on
    /// disk.
    pub fn locate(meta: BackupMeta, base_dir: PathBuf) -> Result<Self> {
        let backup = Self::new(meta, base_dir, CompressionLevel::default());
        let st = std::fs::metadata(backup.path())
            .map_err(|_| CommonError::not_found(format!("backup {}", backup.meta.uuid)))?;
        if st.is_dir() {
            return Err(BackupError::Common(CommonError::invalid_input(
                "invalid archive, is a directory",
            )));
        }
        Ok(backup)
    }
}

#[async_trait]
impl BackupAdapter for LocalBackup {
    fn meta(&self) -> &BackupMeta {
        &self.meta
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Local
    }

    async fn generate(&self, fs: &Filesystem) -> Result<ArchiveDetails> {
        let path = self.path();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(CommonError::Io)?;
        }

        let ignore = IgnoreSet::for_server(fs, &self.meta.ignore).map_err(BackupError::Common)?;
        let mut archive = Archive::new(fs).with_ignore(ignore);
        if let Some(rate) = &self.rate {
            archive = archive.with_rate(Arc::clone(rate));
        }

        tracing::info!(backup = %self.meta.uuid, path = %path.display(), "creating backup for server");
        // Archive::create removes the partial file on failure.
        let compression = self.compression;
        let result = tokio::task::block_in_place(|| archive.create(&path, compression));
        result.map_err(BackupError::Common)?;

        let details = tokio::task::spawn_blocking({
            let path = path.clone();
            move || file_details(&path)
        })
        .await
        .map_err(|e| CommonError::internal(e.to_string()))??;

        tracing::info!(backup = %self.meta.uuid, size = details.size, "created backup successfully");
        Ok(details)
    }

    async fn restore(
        &self,
        _reader: Box<dyn std::io::Read + Send>,
        visit: RestoreVisitor<'_>,
    ) -> Result<()> {
        let file = std::fs::File::open(self.path()).map_err(CommonError::Io)?;
        let reader: Box<dyn std::io::Read + Send> = match &self.rate {
            Some(rate) => Box::new(RateLimitedRead {
                inner: file,
                rate: Arc::clone(rate),
            }),
            None => Box::new(file),
        };
        tokio::task::block_in_place(|| walk_archive(reader, visit))
    }

    async fn remove(&self) -> Result<()> {
        let path = self.path();
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(CommonError::Io(err).into()),
        }
        // Prune the per-server directory once its last backup is gone.
        if let Some(parent) = path.parent() {
            if let Ok(mut entries) = tokio::fs::read_dir(parent).await {
                if entries.next_entry().await.map_err(CommonError::Io)?.is_none() {
                    let _ = tokio::fs::remove_dir(parent).await;
                }
            }
        }
        Ok(())
    }

    async fn download(&self) -> Result<tokio::fs::File> {
        tokio::fs::File::open(self.path())
            .await
            .map_err(|_| CommonError::not_found(format!("backup {}", self.meta.uuid)).into())
    }

    async fn details(&self) -> Result<ArchiveDetails> {
        let path = self.path();
        tokio::task::spawn_blocking(move || file_details(&path))
            .await
            .map_err(|e| CommonError::internal(e.to_string()))?
    }
}

struct RateLimitedRead<R> {
    inner: R,
    rate: Arc<Rate>,
}

impl<R: std::io::Read> std::io::Read for RateLimitedRead<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.rate.take_blocking(n as u64);
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Duration;
    use uuid::Uuid;

    fn server_fs(dir: &std::path::Path) -> Filesystem {
        let fs = Filesystem::new(dir.join("server"), 0, Duration::from_secs(3600)).unwrap();
        fs.write_file("world/level.dat", &mut Cursor::new(b"level".to_vec()), 5, 0o644)
            .unwrap();
        fs.write_file("cache/tmp.bin", &mut Cursor::new(b"junk".to_vec()), 4, 0o644)
            .unwrap();
        fs
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn generate_restore_roundtrip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let fs = server_fs(tmp.path());

        let meta = BackupMeta {
            uuid: Uuid::new_v4(),
            server_uuid: Uuid::new_v4(),
            ignore: "cache/\n".to_string(),
        };
        let backup = LocalBackup::new(meta, tmp.path().join("backups"), CompressionLevel::BestSpeed);

        let details = backup.generate(&fs).await.unwrap();
        assert_eq!(details.checksum_type, "sha256");
        assert_eq!(details.checksum.len(), 64);
        assert!(details.size > 0);
        assert!(backup.path().is_file());

        // Restore into a fresh filesystem.
        let target = Filesystem::new(tmp.path().join("restore"), 0, Duration::from_secs(3600)).unwrap();
        let mut visitor = |path: &str, entry: &crate::RestoreEntry, reader: &mut dyn std::io::Read| {
            crate::restore_entry_to_filesystem(&target, path, entry, reader)
        };
        backup
            .restore(Box::new(std::io::empty()), &mut visitor)
            .await
            .unwrap();

        assert_eq!(target.read("world/level.dat").unwrap(), b"level");
        // The ignored directory never made it into the archive.
        assert!(target.read("cache/tmp.bin").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn remove_prunes_empty_directory() {
        let tmp = tempfile::TempDir::new().unwrap();
        let meta = BackupMeta {
            uuid: Uuid::new_v4(),
            server_uuid: Uuid::new_v4(),
            ignore: String::new(),
        };
        let backup = LocalBackup::new(meta, tmp.path().join("backups"), CompressionLevel::None);
        std::fs::create_dir_all(backup.path().parent().unwrap()).unwrap();
        std::fs::write(backup.path(), b"archive").unwrap();

        backup.remove().await.unwrap();
        assert!(!backup.path().exists());
        assert!(!backup.path().parent().unwrap().exists());
    }

    #[tokio::test]
    async fn locate_missing_archive_fails() {
        let tmp = tempfile::TempDir::new().unwrap();
        let meta = BackupMeta {
            uuid: Uuid::new_v4(),
            server_uuid: Uuid::new_v4(),
            ignore: String::new(),
        };
        let err = LocalBackup::locate(meta, tmp.path().to_path_buf()).unwrap_err();
        assert!(matches!(err, BackupError::Common(e) if e.is_not_found()));
    }
}
