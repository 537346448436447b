//! Panel API client.
//!
//! The daemon never trusts its own view of the world: server configuration,
//! installation scripts, backup upload targets, and audit trails all live on
//! the Panel. This crate defines the typed contract ([`RemoteClient`]) the
//! core consumes plus the HTTP implementation used in production.

mod client;
mod error;
mod types;

pub use client::HttpClient;
pub use error::{RemoteError, Result};
pub use types::{
    ActivityEvent, BackupPart, BackupRequest, BackupRemoteUploadResponse, InstallationScript,
    Pagination, ProcessConfiguration, RawServerData, ServerConfigurationResponse,
    StartupConfiguration,
};

use async_trait::async_trait;
use uuid::Uuid;

/// The Panel-facing contract consumed by the core.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Fetches every server assigned to this node, following pagination.
    async fn get_servers(&self) -> Result<Vec<RawServerData>>;

    /// Fetches the current configuration snapshot for one server.
    async fn get_server_configuration(&self, uuid: Uuid) -> Result<ServerConfigurationResponse>;

    /// Fetches the egg installation script for a server.
    async fn get_installation_script(&self, uuid: Uuid) -> Result<InstallationScript>;

    /// Reports the outcome of an installation run.
    async fn set_installation_status(&self, uuid: Uuid, successful: bool, reinstall: bool)
        -> Result<()>;

    /// Reports the outcome of an inbound or outbound transfer.
    async fn set_transfer_status(&self, uuid: Uuid, successful: bool) -> Result<()>;

    /// Requests presigned multipart upload URLs for an S3 backup.
    async fn get_backup_remote_upload_urls(
        &self,
        backup: Uuid,
        size: u64,
    ) -> Result<BackupRemoteUploadResponse>;

    /// Reports a completed (or failed) backup generation.
    async fn set_backup_status(&self, backup: Uuid, data: &BackupRequest) -> Result<()>;

    /// Reports a completed backup restoration.
    async fn send_restoration_status(&self, backup: Uuid, successful: bool) -> Result<()>;

    /// Ships a batch of queued activity records.
    async fn send_activity_logs(&self, activity: &[ActivityEvent]) -> Result<()>;
}
