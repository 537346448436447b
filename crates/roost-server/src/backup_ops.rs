//! Backup orchestration on the server aggregate.

use std::sync::Arc;

use roost_backup::{ArchiveDetails, BackupAdapter};
use roost_events::topic;
use roost_remote::BackupRequest;
use serde_json::json;

use crate::{CommonError, Result, Server};

impl Server {
    /// Generates a backup with the given adapter, reports the result to the
    /// Panel, and publishes the terminal `backup completed` event. A failed
    /// generation leaves no partial archive behind (the adapters guarantee
    /// that).
    pub async fn backup(self: &Arc<Self>, adapter: Arc<dyn BackupAdapter>) -> Result<ArchiveDetails> {
        let backup_uuid = adapter.meta().uuid;
        let result = adapter.generate(self.filesystem()).await;

        let (successful, details) = match &result {
            Ok(details) => (true, Some(details)),
            Err(err) => {
                self.publish_error("backup generation failed", &CommonError::internal(err.to_string()));
                (false, None)
            }
        };

        let request = BackupRequest {
            checksum: details.map(|d| d.checksum.clone()).unwrap_or_default(),
            checksum_type: details
                .map(|d| d.checksum_type.clone())
                .unwrap_or_else(|| "sha256".to_string()),
            size: details.map(|d| d.size).unwrap_or_default(),
            successful,
            parts: details.map(|d| d.parts.clone()).unwrap_or_default(),
        };
        if let Err(err) = self.remote().set_backup_status(backup_uuid, &request).await {
            tracing::warn!(server = %self.id(), backup = %backup_uuid, error = %err, "failed to report backup status to panel");
        }

        self.events().publish(
            topic::BACKUP_COMPLETED,
            json!({
                "server_id": self.id().to_string(),
                "uuid": backup_uuid.to_string(),
                "successful": successful,
                "checksum": details.map(|d| d.checksum.clone()).unwrap_or_default(),
                "checksum_type": details.map(|d| d.checksum_type.clone()).unwrap_or_default(),
                "file_size": details.map(|d| d.size).unwrap_or_default(),
            }),
        );

        result.map_err(CommonError::from)
    }

    /// Restores a backup into this server's filesystem. The server must be
    /// offline; the restoring flag gates power actions for the duration and
    /// the terminal event and Panel report are always emitted.
    pub async fn restore_backup(
        self: &Arc<Self>,
        adapter: Arc<dyn BackupAdapter>,
        reader: Box<dyn std::io::Read + Send>,
        truncate: bool,
    ) -> Result<()> {
        if self.state() != roost_env::ProcessState::Offline {
            return Err(CommonError::invalid_state(
                "backups cannot be restored while the server is running",
            ));
        }
        if self.is_restoring() {
            return Err(CommonError::conflict("a restore is already in progress"));
        }
        self.set_restoring(true);

        let result = self.run_restore(&adapter, reader, truncate).await;
        self.set_restoring(false);

        let successful = result.is_ok();
        if let Err(err) = self
            .remote()
            .send_restoration_status(adapter.meta().uuid, successful)
            .await
        {
            tracing::warn!(server = %self.id(), error = %err, "failed to report restore status to panel");
        }
        self.events().publish(
            topic::BACKUP_RESTORE_COMPLETED,
            json!({
                "server_id": self.id().to_string(),
                "uuid": adapter.meta().uuid.to_string(),
                "successful": successful,
            }),
        );
        result
    }

    async fn run_restore(
        self: &Arc<Self>,
        adapter: &Arc<dyn BackupAdapter>,
        reader: Box<dyn std::io::Read + Send>,
        truncate: bool,
    ) -> Result<()> {
        if truncate {
            let fs = Arc::clone(self.filesystem());
            tokio::task::spawn_blocking(move || fs.truncate_root())
                .await
                .map_err(|e| CommonError::internal(e.to_string()))??;
        }

        let fs = Arc::clone(self.filesystem());
        let mut visitor =
            |path: &str, entry: &roost_backup::RestoreEntry, r: &mut dyn std::io::Read| {
                roost_backup::restore_entry_to_filesystem(&fs, path, entry, r)
            };
        adapter
            .restore(reader, &mut visitor)
            .await
            .map_err(CommonError::from)
    }
}
