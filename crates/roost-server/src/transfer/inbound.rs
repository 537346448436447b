//! Inbound transfer: reconstruct a server from a peer's multipart stream.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use super::TransferStatus;
use crate::{CommonError, Manager, Result, Server};

/// Multipart field name of the main archive.
pub const ARCHIVE_FIELD: &str = "archive";
/// Field carrying the archive's lowercase hex SHA-256.
pub const ARCHIVE_CHECKSUM_FIELD: &str = "checksum_archive";
/// Field carrying the install log.
pub const INSTALL_LOGS_FIELD: &str = "install_logs";

/// State machine driven by the transfer-ingest endpoint. Parts arrive
/// strictly in wire order; any verification failure flips the whole
/// transfer onto the failure path, which removes everything written so far.
pub struct Incoming {
    manager: Arc<Manager>,
    server: Arc<Server>,
    archive_digest: Option<String>,
    archive_verified: bool,
    backup_digests: HashMap<String, String>,
    written_backups: Vec<PathBuf>,
}

impl Incoming {
    /// Allocates the inbound transfer for `uuid`: fetches the server's
    /// configuration from the Panel and registers a skeleton instance with
    /// the transferring flag held.
    pub async fn prepare(manager: Arc<Manager>, uuid: Uuid) -> Result<Self> {
        if let Some(existing) = manager.get(uuid) {
            if existing.is_transferring() {
                return Err(CommonError::conflict(
                    "a transfer for this server is already in flight",
                ));
            }
            return Err(CommonError::already_exists(format!("server {uuid}")));
        }

        let response = manager
            .remote()
            .get_server_configuration(uuid)
            .await
            .map_err(CommonError::from)?;
        let server = manager
            .init_server(roost_remote::RawServerData {
                uuid,
                settings: response.settings,
                process_configuration: response.process_configuration,
            })
            .await?;
        server.set_transferring(true);
        server.events().publish(
            roost_events::topic::TRANSFER_LOGS,
            serde_json::json!({
                "server_id": uuid.to_string(),
                "line": "Receiving server data from source node...",
            }),
        );

        Ok(Self {
            manager,
            server,
            archive_digest: None,
            archive_verified: false,
            backup_digests: HashMap::new(),
            written_backups: Vec::new(),
        })
    }

    #[must_use]
    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    /// Streams the `archive` part: extracted straight into the sandboxed
    /// filesystem while the bytes tee through a SHA-256 hasher.
    pub async fn receive_archive<R: AsyncRead + Unpin>(&mut self, mut body: R) -> Result<()> {
        let fs = Arc::clone(self.server.filesystem());
        let (tx, rx) = tokio::sync::mpsc::channel::<Vec<u8>>(16);

        let extraction = tokio::task::spawn_blocking(move || {
            let reader = ChannelReader {
                rx,
                buffer: Vec::new(),
                offset: 0,
            };
            let mut visitor =
                |path: &str, entry: &roost_backup::RestoreEntry, r: &mut dyn std::io::Read| {
                    roost_backup::restore_entry_to_filesystem(&fs, path, entry, r)
                };
            roost_backup::walk_archive(Box::new(reader), &mut visitor)
                .map_err(CommonError::from)
        });

        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 128 * 1024];
        let feed_result: Result<()> = async {
            loop {
                let n = body.read(&mut buf).await.map_err(CommonError::Io)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    // The extraction side failed; its error surfaces below.
                    break;
                }
            }
            Ok(())
        }
        .await;
        drop(tx);

        let extract_result = extraction
            .await
            .map_err(|e| CommonError::internal(e.to_string()))?;
        feed_result?;
        extract_result?;

        self.archive_digest = Some(hex::encode(hasher.finalize()));
        Ok(())
    }

    /// Verifies `checksum_archive` against the streamed digest. A mismatch
    /// is fatal for the transfer.
    pub fn verify_archive(&mut self, expected: &str) -> Result<()> {
        let Some(actual) = self.archive_digest.as_deref() else {
            return Err(CommonError::invalid_input(
                "checksum_archive received before the archive part",
            ));
        };
        if !actual.eq_ignore_ascii_case(expected.trim()) {
            return Err(CommonError::checksum_mismatch(format!(
                "archive digest {actual} does not match peer-declared {expected}"
            )));
        }
        self.archive_verified = true;
        Ok(())
    }

    /// Streams a `backup_<uuid>.tar.gz` part into the local backup
    /// directory, recording its digest for the paired checksum field.
    pub async fn receive_backup<R: AsyncRead + Unpin>(
        &mut self,
        field_name: &str,
        mut body: R,
    ) -> Result<()> {
        let backup_uuid = parse_backup_field(field_name)?;
        let dir = self
            .manager
            .node()
            .backup_dir
            .join(self.server.id().to_string());
        tokio::fs::create_dir_all(&dir).await.map_err(CommonError::Io)?;
        let path = dir.join(format!("{backup_uuid}.tar.gz"));

        let mut file = tokio::fs::File::create(&path).await.map_err(CommonError::Io)?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 128 * 1024];
        loop {
            let n = body.read(&mut buf).await.map_err(CommonError::Io)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            tokio::io::AsyncWriteExt::write_all(&mut file, &buf[..n])
                .await
                .map_err(CommonError::Io)?;
        }
        tokio::io::AsyncWriteExt::flush(&mut file)
            .await
            .map_err(CommonError::Io)?;

        self.written_backups.push(path);
        self.backup_digests
            .insert(field_name.to_string(), hex::encode(hasher.finalize()));
        Ok(())
    }

    /// Verifies a `checksum_backup_<uuid>.tar.gz` field. A mismatch is
    /// fatal.
    pub fn verify_backup(&mut self, checksum_field: &str, expected: &str) -> Result<()> {
        let backup_field = checksum_field
            .strip_prefix("checksum_")
            .ok_or_else(|| CommonError::invalid_input(format!("unexpected field {checksum_field}")))?;
        let Some(actual) = self.backup_digests.get(backup_field) else {
            return Err(CommonError::invalid_input(format!(
                "{checksum_field} received before its backup part"
            )));
        };
        if !actual.eq_ignore_ascii_case(expected.trim()) {
            return Err(CommonError::checksum_mismatch(format!(
                "backup {backup_field} digest {actual} does not match peer-declared {expected}"
            )));
        }
        Ok(())
    }

    /// Saves the install log; failures here never fail the transfer.
    pub async fn receive_install_log<R: AsyncRead + Unpin>(&mut self, mut body: R) {
        let path = self.manager.node().install_log_path(self.server.id());
        let result: std::io::Result<()> = async {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut file = tokio::fs::File::create(&path).await?;
            tokio::io::copy(&mut body, &mut file).await?;
            Ok(())
        }
        .await;
        if let Err(err) = result {
            tracing::warn!(server = %self.server.id(), error = %err, "failed to save transferred install logs");
        }
    }

    /// Completes the transfer: requires the archive to have verified, then
    /// clears the flag and reports success.
    pub async fn finish(self) -> Result<()> {
        if !self.archive_verified {
            return self
                .fail_with(CommonError::invalid_input(
                    "stream ended before the archive checksum was verified",
                ))
                .await;
        }

        self.server.set_transferring(false);
        if let Err(err) = self
            .manager
            .remote()
            .set_transfer_status(self.server.id(), true)
            .await
        {
            tracing::warn!(server = %self.server.id(), error = %err, "failed to report transfer success to panel");
        }
        self.server.events().publish(
            roost_events::topic::TRANSFER_STATUS,
            serde_json::json!({
                "server_id": self.server.id().to_string(),
                "status": TransferStatus::Completed,
            }),
        );
        Ok(())
    }

    /// Failure path: wipe everything this transfer wrote, deregister the
    /// skeleton, report failure, and publish the terminal status.
    pub async fn fail_with(self, err: CommonError) -> Result<()> {
        tracing::error!(server = %self.server.id(), error = %err, "inbound transfer failed, cleaning up");

        for path in &self.written_backups {
            let _ = tokio::fs::remove_file(path).await;
        }

        let uuid = self.server.id();
        if let Err(destroy_err) = self.server.destroy().await {
            tracing::warn!(server = %uuid, error = %destroy_err, "failed to remove partial server data");
        }
        self.manager.forget(uuid);

        if let Err(report) = self.manager.remote().set_transfer_status(uuid, false).await {
            tracing::warn!(server = %uuid, error = %report, "failed to report transfer failure to panel");
        }
        self.server.events().publish(
            roost_events::topic::TRANSFER_STATUS,
            serde_json::json!({
                "server_id": uuid.to_string(),
                "status": TransferStatus::Failed,
            }),
        );
        Err(err)
    }
}

/// Validates `backup_<uuid>.tar.gz` and extracts the UUID.
fn parse_backup_field(field: &str) -> Result<Uuid> {
    field
        .strip_prefix("backup_")
        .and_then(|rest| rest.strip_suffix(".tar.gz"))
        .and_then(|id| Uuid::parse_str(id).ok())
        .ok_or_else(|| CommonError::invalid_input(format!("malformed backup field name {field}")))
}

/// Blocking `Read` over chunks fed from the async side.
struct ChannelReader {
    rx: tokio::sync::mpsc::Receiver<Vec<u8>>,
    buffer: Vec<u8>,
    offset: usize,
}

impl std::io::Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.offset >= self.buffer.len() {
            match self.rx.blocking_recv() {
                Some(chunk) => {
                    self.buffer = chunk;
                    self.offset = 0;
                }
                None => return Ok(0),
            }
        }
        let n = (self.buffer.len() - self.offset).min(buf.len());
        buf[..n].copy_from_slice(&self.buffer[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::parse_backup_field;

    #[test]
    fn backup_field_names() {
        let id = uuid::Uuid::new_v4();
        assert_eq!(parse_backup_field(&format!("backup_{id}.tar.gz")).unwrap(), id);
        assert!(parse_backup_field("backup_nope.tar.gz").is_err());
        assert!(parse_backup_field("archive").is_err());
        assert!(parse_backup_field("backup_.tar.gz").is_err());
    }
}
