//! Daemon configuration.
//!
//! Loaded from multiple sources with the following priority:
//!
//! 1. Environment variables (`ROOST_*`)
//! 2. User configuration file (`~/.config/roost/config.toml`)
//! 3. System configuration file (`/etc/roost/config.toml`)
//! 4. Default values

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use roost_env::docker::{DockerSettings, RegistryAuth};
use roost_server::NodeSettings;
use serde::{Deserialize, Serialize};

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Enable debug logging.
    pub debug: bool,
    /// Panel connection settings.
    pub remote: RemoteConfig,
    /// HTTP API settings.
    pub api: ApiConfig,
    /// Node storage and process settings.
    pub system: SystemConfig,
    /// Docker settings.
    pub docker: DockerConfig,
    /// Console throttle settings.
    pub throttles: ThrottleConfig,
    /// Backup settings.
    pub backups: BackupConfig,
    /// Transfer settings.
    pub transfers: TransferConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debug: false,
            remote: RemoteConfig::default(),
            api: ApiConfig::default(),
            system: SystemConfig::default(),
            docker: DockerConfig::default(),
            throttles: ThrottleConfig::default(),
            backups: BackupConfig::default(),
            transfers: TransferConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Base URL of the Panel.
    pub url: String,
    pub token_id: String,
    pub token: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost".to_string(),
            token_id: String::new(),
            token: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    /// Maximum upload size in megabytes.
    pub upload_limit: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            upload_limit: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub root_directory: PathBuf,
    pub data_directory: PathBuf,
    pub backup_directory: PathBuf,
    pub log_directory: PathBuf,
    pub tmp_directory: PathBuf,
    /// Seconds between disk usage re-walks per server.
    pub disk_check_interval: u64,
    /// Seconds between activity flushes to the Panel.
    pub activity_send_interval: u64,
    /// Records per activity flush.
    pub activity_send_count: usize,
    /// Console lines retained per server.
    pub console_history: usize,
    /// WebSocket sessions allowed per server.
    pub websocket_limit: usize,
    pub user: UserConfig,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            root_directory: PathBuf::from("/var/lib/roost"),
            data_directory: PathBuf::from("/var/lib/roost/volumes"),
            backup_directory: PathBuf::from("/var/lib/roost/backups"),
            log_directory: PathBuf::from("/var/log/roost"),
            tmp_directory: PathBuf::from("/tmp/roost"),
            disk_check_interval: 150,
            activity_send_interval: 60,
            activity_send_count: 100,
            console_history: 150,
            websocket_limit: 30,
            user: UserConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    pub uid: u32,
    pub gid: u32,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self { uid: 988, gid: 988 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    pub network: DockerNetworkConfig,
    pub dns: Vec<String>,
    /// Size of the container /tmp tmpfs in megabytes.
    pub tmpfs_size: u64,
    pub log_max_size: String,
    pub log_max_files: String,
    /// Registry host -> credentials for private images.
    pub registries: HashMap<String, DockerRegistryConfig>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            network: DockerNetworkConfig::default(),
            dns: vec!["1.1.1.1".to_string(), "1.0.0.1".to_string()],
            tmpfs_size: 100,
            log_max_size: "5m".to_string(),
            log_max_files: "1".to_string(),
            registries: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerNetworkConfig {
    pub name: String,
    /// Gateway interface address, referenced by egg configs as
    /// `{{config.docker.network.interface}}`.
    pub interface: String,
}

impl Default for DockerNetworkConfig {
    fn default() -> Self {
        Self {
            name: "roost0".to_string(),
            interface: "172.18.0.1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerRegistryConfig {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub enabled: bool,
    /// Lines admitted per window.
    pub lines: u64,
    /// Window length in milliseconds.
    pub line_reset_interval: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lines: 2000,
            line_reset_interval: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Throughput cap in MiB/s for backup reads and restore writes; zero
    /// disables the cap.
    pub write_limit: u64,
    /// none | best_speed | best_compression
    pub compression_level: String,
    /// Restic repository location; empty disables the restic adapter.
    pub restic_repository: String,
    /// File holding the restic repository password.
    pub restic_password_file: PathBuf,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            write_limit: 0,
            compression_level: "best_speed".to_string(),
            restic_repository: String::new(),
            restic_password_file: PathBuf::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Concurrent remote-pull downloads per server.
    pub download_limit: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self { download_limit: 3 }
    }
}

impl Config {
    /// Loads configuration from files and environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be read or a value fails to
    /// deserialize.
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(system_config_path()))
            .merge(Toml::file(user_config_path()))
            .merge(Env::prefixed("ROOST_").split("_"))
            .extract()
    }

    /// Loads configuration from a specific file, still honoring the
    /// environment overrides.
    pub fn load_from(path: impl AsRef<std::path::Path>) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("ROOST_").split("_"))
            .extract()
    }

    /// The slice of this configuration the per-server core consumes.
    #[must_use]
    pub fn node_settings(&self) -> NodeSettings {
        NodeSettings {
            data_dir: self.system.data_directory.clone(),
            backup_dir: self.system.backup_directory.clone(),
            log_dir: self.system.log_directory.clone(),
            tmp_dir: self.system.tmp_directory.clone(),
            disk_check_interval: Duration::from_secs(self.system.disk_check_interval),
            throttle_lines: if self.throttles.enabled {
                self.throttles.lines
            } else {
                0
            },
            throttle_window: Duration::from_millis(self.throttles.line_reset_interval),
            console_history: self.system.console_history,
            backup_write_limit: self.backups.write_limit * 1024 * 1024,
            backup_compression: roost_fs::CompressionLevel::from_config(
                &self.backups.compression_level,
            ),
            websocket_limit: self.system.websocket_limit,
            download_limit: self.transfers.download_limit,
            network_mode: self.docker.network.name.clone(),
            config_json: serde_json::to_value(self).unwrap_or_default(),
        }
    }

    /// Docker settings for container environments.
    #[must_use]
    pub fn docker_settings(&self) -> DockerSettings {
        DockerSettings {
            network_name: self.docker.network.name.clone(),
            dns: self.docker.dns.clone(),
            tmpfs_size_mb: self.docker.tmpfs_size,
            log_max_size: self.docker.log_max_size.clone(),
            log_max_files: self.docker.log_max_files.clone(),
            container_user: format!("{}:{}", self.system.user.uid, self.system.user.gid),
            registries: self
                .docker
                .registries
                .iter()
                .map(|(host, auth)| {
                    (
                        host.clone(),
                        RegistryAuth {
                            username: auth.username.clone(),
                            password: auth.password.clone(),
                        },
                    )
                })
                .collect(),
        }
    }

    /// Path of the embedded activity store.
    #[must_use]
    pub fn activity_db_path(&self) -> PathBuf {
        self.system.root_directory.join("states/activity.db")
    }
}

fn user_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("~/.config"))
        .join("roost")
        .join("config.toml")
}

fn system_config_path() -> PathBuf {
    PathBuf::from("/etc/roost/config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.api.port, 8080);
        assert_eq!(config.throttles.lines, 2000);
        assert_eq!(config.transfers.download_limit, 3);
        assert_eq!(config.system.websocket_limit, 30);
        assert!(config.system.data_directory.ends_with("volumes"));
    }

    #[test]
    fn node_settings_reflect_throttle_toggle() {
        let mut config = Config::default();
        config.throttles.enabled = false;
        assert_eq!(config.node_settings().throttle_lines, 0);

        config.throttles.enabled = true;
        config.throttles.lines = 500;
        assert_eq!(config.node_settings().throttle_lines, 500);
    }

    #[test]
    fn config_json_lookup_matches_parser_expectations() {
        let config = Config::default();
        let json = config.node_settings().config_json;
        assert_eq!(json["docker"]["network"]["interface"], "172.18.0.1");
    }
}
