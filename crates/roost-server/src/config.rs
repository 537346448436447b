//! Server configuration snapshots and the node settings slice the core
//! consumes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use roost_env::{Allocations, ContainerSpec, Mount, ResourceLimits, StopConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Crash-detection parameters for one server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrashDetection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub detect_clean_exit_as_crash: bool,
    /// Minimum seconds between crashes before auto-restart is suppressed.
    #[serde(default = "default_crash_timeout")]
    pub timeout: u64,
}

impl Default for CrashDetection {
    fn default() -> Self {
        Self {
            enabled: true,
            detect_clean_exit_as_crash: false,
            timeout: default_crash_timeout(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_crash_timeout() -> u64 {
    60
}

/// Egg metadata relevant to the runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EggConfiguration {
    #[serde(default)]
    pub id: Option<Uuid>,
    /// Feature name -> console substrings that trigger a `feature match`
    /// event.
    #[serde(default)]
    pub features: HashMap<String, Vec<String>>,
}

/// Container image settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerSettings {
    #[serde(default)]
    pub image: String,
}

/// Display metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetaSettings {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// The Panel-issued configuration snapshot for one server.
///
/// Mutable at runtime only through [`crate::Server::update_configuration`],
/// which swaps the whole snapshot; readers clone an `Arc` and never observe
/// a partial update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfiguration {
    pub uuid: Uuid,
    #[serde(default)]
    pub meta: MetaSettings,
    #[serde(default)]
    pub suspended: bool,
    #[serde(default)]
    pub invocation: String,
    #[serde(default)]
    pub skip_egg_scripts: bool,
    #[serde(default)]
    pub environment: HashMap<String, Value>,
    #[serde(default)]
    pub allocations: Allocations,
    #[serde(default)]
    pub build: ResourceLimits,
    #[serde(default)]
    pub container: ContainerSettings,
    #[serde(default)]
    pub egg: EggConfiguration,
    #[serde(default)]
    pub crash_detection: CrashDetection,
    #[serde(default)]
    pub mounts: Vec<Mount>,
}

impl ServerConfiguration {
    /// Renders the environment map as `KEY=VALUE` pairs, adding the
    /// computed variables the process expects.
    #[must_use]
    pub fn environment_variables(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .environment
            .iter()
            .map(|(k, v)| format!("{k}={}", render(v)))
            .collect();
        out.push(format!("STARTUP={}", self.invocation));
        out.push(format!("SERVER_MEMORY={}", self.build.memory));
        out.push(format!("SERVER_IP={}", self.allocations.default_mapping.ip));
        out.push(format!("SERVER_PORT={}", self.allocations.default_mapping.port));
        out.sort();
        out
    }

    /// The startup invocation with `{{VAR}}` / `${VAR}` environment
    /// references substituted.
    #[must_use]
    pub fn processed_invocation(&self) -> String {
        let mut cmd = self.invocation.replace("{{", "${").replace("}}", "}");
        for (key, value) in &self.environment {
            cmd = cmd.replace(&format!("${{{key}}}"), &render(value));
        }
        cmd = cmd.replace("${SERVER_MEMORY}", &self.build.memory.to_string());
        cmd = cmd.replace("${SERVER_IP}", &self.allocations.default_mapping.ip);
        cmd = cmd.replace(
            "${SERVER_PORT}",
            &self.allocations.default_mapping.port.to_string(),
        );
        cmd
    }

    /// The environment map as plain strings for configuration-file name
    /// substitution.
    #[must_use]
    pub fn environment_strings(&self) -> HashMap<String, String> {
        self.environment
            .iter()
            .map(|(k, v)| (k.clone(), render(v)))
            .collect()
    }

    /// Builds the container spec handed to the environment, using the
    /// node's data directory layout.
    #[must_use]
    pub fn container_spec(&self, node: &NodeSettings, stop: StopConfig) -> ContainerSpec {
        ContainerSpec {
            uuid: self.uuid.to_string(),
            image: self.container.image.clone(),
            invocation: self.processed_invocation(),
            env: self.environment_variables(),
            limits: self.build.clone(),
            mounts: self.mounts.clone(),
            allocations: self.allocations.clone(),
            network_mode: node.network_mode.clone(),
            stop,
            data_path: node
                .data_dir
                .join(self.uuid.to_string())
                .to_string_lossy()
                .into_owned(),
        }
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// The slice of the daemon configuration the per-server core needs.
///
/// Handed to each server at construction and re-read at the start of each
/// power action, never reached into globally.
#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub data_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub log_dir: PathBuf,
    pub tmp_dir: PathBuf,
    /// How stale the cached disk usage may get before a re-walk.
    pub disk_check_interval: Duration,
    /// Console throttle: lines per window.
    pub throttle_lines: u64,
    pub throttle_window: Duration,
    /// Console history lines kept per server.
    pub console_history: usize,
    /// Backup read/write cap in bytes per second; zero disables.
    pub backup_write_limit: u64,
    pub backup_compression: roost_fs::CompressionLevel,
    /// WebSocket sessions allowed per server.
    pub websocket_limit: usize,
    /// Concurrent remote-pull downloads per server.
    pub download_limit: usize,
    /// Docker network mode for created containers.
    pub network_mode: String,
    /// The daemon configuration rendered as JSON, for `{{ config.* }}`
    /// lookups in configuration-file rewrites.
    pub config_json: Value,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/roost/volumes"),
            backup_dir: PathBuf::from("/var/lib/roost/backups"),
            log_dir: PathBuf::from("/var/log/roost"),
            tmp_dir: PathBuf::from("/tmp/roost"),
            disk_check_interval: Duration::from_secs(150),
            throttle_lines: 2000,
            throttle_window: Duration::from_millis(100),
            console_history: 150,
            backup_write_limit: 0,
            backup_compression: roost_fs::CompressionLevel::BestSpeed,
            websocket_limit: 30,
            download_limit: 3,
            network_mode: "roost0".to_string(),
            config_json: Value::Null,
        }
    }
}

impl NodeSettings {
    /// Install log location for a server.
    #[must_use]
    pub fn install_log_path(&self, uuid: Uuid) -> PathBuf {
        self.log_dir.join("install").join(format!("{uuid}.log"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserializes_panel_settings() {
        let raw = json!({
            "uuid": "0eb6ac7c-1b62-4950-b2c3-3a5e3b8c0d8f",
            "suspended": false,
            "invocation": "java -Xmx{{SERVER_MEMORY}}M -jar {{SERVER_JARFILE}}",
            "environment": { "SERVER_JARFILE": "server.jar", "EULA": true },
            "build": { "memory": 1024, "swap": 0, "disk": 10240, "io": 500, "cpu": 200 },
            "container": { "image": "ghcr.io/parkervcp/yolks:java_17" },
            "egg": { "features": { "eula": ["You need to agree to the EULA"] } }
        });
        let cfg: ServerConfiguration = serde_json::from_value(raw).unwrap();
        assert_eq!(cfg.build.memory, 1024);
        assert!(cfg.crash_detection.enabled);
        assert_eq!(cfg.crash_detection.timeout, 60);
        assert_eq!(
            cfg.processed_invocation(),
            "java -Xmx1024M -jar server.jar"
        );
        let env = cfg.environment_variables();
        assert!(env.contains(&"EULA=true".to_string()));
        assert!(env.contains(&"SERVER_MEMORY=1024".to_string()));
    }
}
