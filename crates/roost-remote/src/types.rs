//! Wire types exchanged with the Panel.

use chrono::{DateTime, Utc};
use roost_env::StopConfig;
use roost_parser::ConfigurationFile;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One server as returned by the boot-time listing.
#[derive(Debug, Clone, Deserialize)]
pub struct RawServerData {
    pub uuid: Uuid,
    /// The full configuration snapshot, deserialized by the server layer.
    pub settings: Value,
    pub process_configuration: ProcessConfiguration,
}

/// Response for a single server's configuration fetch.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfigurationResponse {
    pub settings: Value,
    pub process_configuration: ProcessConfiguration,
}

/// Egg-defined process behavior.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessConfiguration {
    #[serde(default)]
    pub startup: StartupConfiguration,
    #[serde(default)]
    pub stop: StopConfig,
    #[serde(default)]
    pub configs: Vec<ConfigurationFile>,
}

/// Startup detection settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartupConfiguration {
    /// Console substrings that mark the server as fully started.
    #[serde(default)]
    pub done: Vec<String>,
    #[serde(default)]
    pub strip_ansi: bool,
}

/// Egg installation script details.
#[derive(Debug, Clone, Deserialize)]
pub struct InstallationScript {
    #[serde(default)]
    pub container_image: String,
    #[serde(default)]
    pub entrypoint: String,
    #[serde(default)]
    pub script: String,
}

/// Pagination envelope used by the boot listing.
#[derive(Debug, Clone, Deserialize)]
pub struct Pagination {
    pub current_page: u32,
    pub last_page: u32,
}

/// Presigned multipart upload description for an S3 backup.
#[derive(Debug, Clone, Deserialize)]
pub struct BackupRemoteUploadResponse {
    pub parts: Vec<String>,
    pub part_size: u64,
}

/// One uploaded S3 part.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupPart {
    pub etag: String,
    pub part_number: u32,
}

/// Completion report for a backup generation.
#[derive(Debug, Clone, Serialize)]
pub struct BackupRequest {
    pub checksum: String,
    pub checksum_type: String,
    pub size: u64,
    pub successful: bool,
    pub parts: Vec<BackupPart>,
}

/// One queued audit record shipped to the Panel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub user: Option<Uuid>,
    pub server: Uuid,
    pub event: String,
    pub metadata: Value,
    pub ip: String,
    pub timestamp: DateTime<Utc>,
}
