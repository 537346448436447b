//! Restic-backed backups, wrapping the external `restic` binary.
//!
//! Unlike the archive adapters, restic backups are identified by a snapshot
//! id inside a shared repository rather than by an archive checksum. The
//! daemon shells out for every operation and treats the repository itself
//! as opaque.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use roost_error::CommonError;
use roost_fs::Filesystem;
use tokio::process::Command;

use crate::error::{BackupError, Result};
use crate::{AdapterKind, ArchiveDetails, BackupAdapter, BackupMeta, RestoreVisitor};

/// Repository-level settings from the daemon configuration.
#[derive(Debug, Clone)]
pub struct ResticSettings {
    pub repository: String,
    pub password_file: PathBuf,
    /// Extra environment variables (cloud credentials and the like).
    pub environment: Vec<(String, String)>,
}

/// A backup stored as a restic snapshot tagged with the backup UUID.
pub struct ResticBackup {
    meta: BackupMeta,
    settings: ResticSettings,
    /// Absolute host path of the server's data directory; snapshots are
    /// taken from and restored into this tree only.
    target: PathBuf,
}

impl ResticBackup {
    #[must_use]
    pub fn new(meta: BackupMeta, settings: ResticSettings, target: PathBuf) -> Self {
        Self {
            meta,
            settings,
            target,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("restic");
        cmd.arg("--repo")
            .arg(&self.settings.repository)
            .arg("--password-file")
            .arg(&self.settings.password_file)
            .arg("--json")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &self.settings.environment {
            cmd.env(key, value);
        }
        cmd
    }

    async fn run(&self, mut cmd: Command) -> Result<String> {
        let output = cmd
            .output()
            .await
            .map_err(|e| BackupError::Restic(format!("failed to spawn restic: {e}")))?;
        if !output.status.success() {
            return Err(BackupError::Restic(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Finds the snapshot id for this backup's tag.
    async fn snapshot_id(&self) -> Result<String> {
        let mut cmd = self.command();
        cmd.arg("snapshots").arg("--tag").arg(self.meta.uuid.to_string());
        let out = self.run(cmd).await?;
        let snapshots: serde_json::Value = serde_json::from_str(&out)
            .map_err(|e| BackupError::Restic(format!("unparseable snapshot list: {e}")))?;
        snapshots
            .as_array()
            .and_then(|list| list.last())
            .and_then(|snap| snap.get("short_id").or_else(|| snap.get("id")))
            .and_then(|id| id.as_str())
            .map(ToString::to_string)
            .ok_or_else(|| CommonError::not_found(format!("restic snapshot for {}", self.meta.uuid)).into())
    }
}

#[async_trait]
impl BackupAdapter for ResticBackup {
    fn meta(&self) -> &BackupMeta {
        &self.meta
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Restic
    }

    async fn generate(&self, fs: &Filesystem) -> Result<ArchiveDetails> {
        let mut cmd = self.command();
        cmd.arg("backup")
            .arg("--tag")
            .arg(self.meta.uuid.to_string())
            .arg(fs.path());
        for line in self.meta.ignore.lines() {
            let line = line.trim();
            if !line.is_empty() && !line.starts_with('#') && !line.starts_with('!') {
                cmd.arg("--exclude").arg(line);
            }
        }
        self.run(cmd).await?;

        let id = self.snapshot_id().await?;
        Ok(ArchiveDetails {
            checksum: id,
            checksum_type: "restic".to_string(),
            size: fs.cached_usage(),
            parts: Vec::new(),
        })
    }

    async fn restore(
        &self,
        _reader: Box<dyn std::io::Read + Send>,
        _visit: RestoreVisitor<'_>,
    ) -> Result<()> {
        let id = self.snapshot_id().await?;
        // Restic writes directly into the server's data directory; the
        // caller has already truncated it when a clean restore was
        // requested.
        let mut cmd = self.command();
        cmd.arg("restore").arg(&id).arg("--target").arg(&self.target);
        self.run(cmd).await?;
        Ok(())
    }

    async fn remove(&self) -> Result<()> {
        let id = self.snapshot_id().await?;
        let mut cmd = self.command();
        cmd.arg("forget").arg(&id).arg("--prune");
        self.run(cmd).await?;
        Ok(())
    }

    async fn download(&self) -> Result<tokio::fs::File> {
        Err(CommonError::invalid_input("restic backups cannot be downloaded as archives").into())
    }

    async fn details(&self) -> Result<ArchiveDetails> {
        let id = self.snapshot_id().await?;
        Ok(ArchiveDetails {
            checksum: id,
            checksum_type: "restic".to_string(),
            size: 0,
            parts: Vec::new(),
        })
    }
}
