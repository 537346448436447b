//! S3 backups streamed through Panel-issued presigned multipart uploads.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use roost_error::CommonError;
use roost_fs::{Archive, CompressionLevel, Filesystem, IgnoreSet};
use roost_remote::{BackupPart, RemoteClient};
use roost_system::Rate;
use tokio::io::AsyncReadExt;

use crate::error::{BackupError, Result};
use crate::{file_details, walk_archive, AdapterKind, ArchiveDetails, BackupAdapter, BackupMeta, RestoreVisitor};

/// Attempts per part before the upload is failed.
const PART_ATTEMPTS: u32 = 3;

/// A backup uploaded to object storage with URLs the Panel presigns.
///
/// The archive is staged to the node's temp directory first so its exact
/// size is known when requesting part URLs, then streamed part-by-part.
pub struct S3Backup {
    meta: BackupMeta,
    remote: Arc<dyn RemoteClient>,
    tmp_dir: PathBuf,
    compression: CompressionLevel,
    rate: Option<Arc<Rate>>,
    client: reqwest::Client,
}

impl S3Backup {
    #[must_use]
    pub fn new(
        meta: BackupMeta,
        remote: Arc<dyn RemoteClient>,
        tmp_dir: PathBuf,
        compression: CompressionLevel,
    ) -> Self {
        Self {
            meta,
            remote,
            tmp_dir,
            compression,
            rate: None,
            client: reqwest::Client::new(),
        }
    }

    /// Applies a read throughput cap during archive generation.
    #[must_use]
    pub fn with_rate(mut self, rate: Arc<Rate>) -> Self {
        self.rate = Some(rate);
        self
    }

    fn staging_path(&self) -> PathBuf {
        self.tmp_dir.join(format!("{}.tar.gz", self.meta.uuid))
    }

    async fn upload_parts(&self, details: &ArchiveDetails) -> Result<Vec<BackupPart>> {
        let urls = self
            .remote
            .get_backup_remote_upload_urls(self.meta.uuid, details.size)
            .await?;

        let mut file = tokio::fs::File::open(self.staging_path())
            .await
            .map_err(CommonError::Io)?;
        let mut parts = Vec::with_capacity(urls.parts.len());
        let mut remaining = details.size;

        for (index, url) in urls.parts.iter().enumerate() {
            let part_number = index as u32 + 1;
            let part_len = remaining.min(urls.part_size);
            if part_len == 0 {
                break;
            }
            // Presigned part uploads cannot be streamed without a length, so
            // each part is buffered; part sizes are Panel-bounded.
            let mut buf = vec![0u8; part_len as usize];
            file.read_exact(&mut buf).await.map_err(CommonError::Io)?;
            remaining -= part_len;

            let etag = self.put_part(url, buf, part_number).await?;
            parts.push(BackupPart { etag, part_number });
        }
        Ok(parts)
    }

    async fn put_part(&self, url: &str, body: Vec<u8>, part_number: u32) -> Result<String> {
        let mut last_error = String::new();
        for attempt in 1..=PART_ATTEMPTS {
            let res = self
                .client
                .put(url)
                .header(reqwest::header::CONTENT_LENGTH, body.len())
                .body(body.clone())
                .send()
                .await;
            match res {
                Ok(res) if res.status().is_success() => {
                    let etag = res
                        .headers()
                        .get(reqwest::header::ETAG)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .trim_matches('"')
                        .to_string();
                    return Ok(etag);
                }
                Ok(res) => last_error = format!("status {}", res.status()),
                Err(err) => last_error = err.to_string(),
            }
            tracing::warn!(
                backup = %self.meta.uuid,
                part = part_number,
                attempt,
                error = %last_error,
                "part upload failed"
            );
        }
        Err(BackupError::PartUpload {
            part: part_number,
            message: last_error,
        })
    }
}

#[async_trait]
impl BackupAdapter for S3Backup {
    fn meta(&self) -> &BackupMeta {
        &self.meta
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::S3
    }

    async fn generate(&self, fs: &Filesystem) -> Result<ArchiveDetails> {
        let staging = self.staging_path();
        if let Some(parent) = staging.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(CommonError::Io)?;
        }

        let ignore = IgnoreSet::for_server(fs, &self.meta.ignore).map_err(BackupError::Common)?;
        let mut archive = Archive::new(fs).with_ignore(ignore);
        if let Some(rate) = &self.rate {
            archive = archive.with_rate(Arc::clone(rate));
        }
        let compression = self.compression;
        tokio::task::block_in_place(|| archive.create(&staging, compression))
            .map_err(BackupError::Common)?;

        let result = async {
            let mut details = tokio::task::spawn_blocking({
                let staging = staging.clone();
                move || file_details(&staging)
            })
            .await
            .map_err(|e| CommonError::internal(e.to_string()))??;

            details.parts = self.upload_parts(&details).await?;
            Ok::<_, BackupError>(details)
        }
        .await;

        // The staging file is removed on success and failure alike.
        let _ = tokio::fs::remove_file(&staging).await;
        result
    }

    async fn restore(
        &self,
        reader: Box<dyn std::io::Read + Send>,
        visit: RestoreVisitor<'_>,
    ) -> Result<()> {
        tokio::task::block_in_place(|| walk_archive(reader, visit))
    }

    async fn remove(&self) -> Result<()> {
        // Object lifecycle is owned by the Panel's storage configuration.
        Ok(())
    }

    async fn download(&self) -> Result<tokio::fs::File> {
        Err(CommonError::invalid_input(
            "s3 backups are downloaded through the panel, not the node",
        )
        .into())
    }

    async fn details(&self) -> Result<ArchiveDetails> {
        Err(CommonError::invalid_input(
            "s3 backup details are only available at generation time",
        )
        .into())
    }
}
