//! Container specification and resource sample types.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Callback type for console lines produced by the container.
pub type LogCallback = dyn Fn(&str) + Send + Sync;

/// How a server's process is asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StopType {
    /// Send a signal (value holds the signal name, default SIGTERM).
    #[default]
    Signal,
    /// Type a command on the process stdin (value holds the command).
    Command,
    /// Native runtime stop with its default signal.
    Stop,
}

/// Stop configuration from the server's egg.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StopConfig {
    #[serde(rename = "type")]
    pub kind: StopType,
    #[serde(default)]
    pub value: String,
}

/// Resource limits applied to the container, as configured by the Panel.
/// Memory values are megabytes, disk is megabytes, cpu is a percentage where
/// 100 is one full core.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResourceLimits {
    #[serde(default)]
    pub memory: i64,
    #[serde(default)]
    pub swap: i64,
    #[serde(default)]
    pub io: i64,
    #[serde(default)]
    pub cpu: i64,
    #[serde(default)]
    pub threads: String,
    #[serde(default)]
    pub disk: i64,
    #[serde(default)]
    pub oom_disabled: bool,
}

impl ResourceLimits {
    /// Hard memory limit in bytes, with the same headroom the scheduler
    /// grants the process itself (5% above the configured value).
    #[must_use]
    pub fn memory_limit_bytes(&self) -> i64 {
        if self.memory <= 0 {
            return 0;
        }
        self.memory * 1024 * 1024 * 105 / 100
    }

    /// Swap limit in bytes for the container: `-1` disables accounting,
    /// otherwise memory + swap.
    #[must_use]
    pub fn memory_swap_bytes(&self) -> i64 {
        if self.swap < 0 {
            return -1;
        }
        if self.memory <= 0 {
            return 0;
        }
        (self.memory + self.swap) * 1024 * 1024
    }

    /// CPU quota/period pair; zero cpu means unconstrained.
    #[must_use]
    pub fn cpu_quota(&self) -> (Option<i64>, Option<i64>) {
        if self.cpu <= 0 {
            return (None, None);
        }
        (Some(self.cpu * 1000), Some(100_000))
    }

    /// Disk quota in bytes; zero means unlimited.
    #[must_use]
    pub fn disk_bytes(&self) -> u64 {
        self.disk.max(0) as u64 * 1024 * 1024
    }
}

/// A bind mount into the container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mount {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

/// The network bindings a server receives.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Allocations {
    /// ip -> ports to bind.
    #[serde(default)]
    pub mappings: HashMap<String, Vec<u16>>,
    /// The allocation advertised to the process itself.
    #[serde(default)]
    pub default_mapping: DefaultMapping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultMapping {
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub port: u16,
}

impl Default for DefaultMapping {
    fn default() -> Self {
        Self {
            ip: "0.0.0.0".to_string(),
            port: 0,
        }
    }
}

/// Everything the environment needs to create a server's container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    /// Server UUID; doubles as the container name.
    pub uuid: String,
    pub image: String,
    /// The processed startup command.
    pub invocation: String,
    /// `KEY=VALUE` pairs.
    pub env: Vec<String>,
    pub limits: ResourceLimits,
    pub mounts: Vec<Mount>,
    pub allocations: Allocations,
    /// Docker network mode (the daemon network, `host`, or
    /// `container:<name>`; passed through unchanged).
    pub network_mode: String,
    pub stop: StopConfig,
    /// Absolute host path of the server data directory.
    pub data_path: String,
}

/// One resource usage sample from the runtime's stats stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct Stats {
    pub memory_bytes: u64,
    pub memory_limit_bytes: u64,
    /// Absolute CPU usage across all cores, where 100 is one core.
    pub cpu_absolute: f64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_limit_gets_headroom() {
        let limits = ResourceLimits {
            memory: 1024,
            ..Default::default()
        };
        assert_eq!(limits.memory_limit_bytes(), 1024i64 * 1024 * 1024 * 105 / 100);
        assert_eq!(limits.memory_swap_bytes(), 1024 * 1024 * 1024);
    }

    #[test]
    fn unlimited_when_zero() {
        let limits = ResourceLimits::default();
        assert_eq!(limits.memory_limit_bytes(), 0);
        assert_eq!(limits.cpu_quota(), (None, None));
    }

    #[test]
    fn negative_swap_disables_accounting() {
        let limits = ResourceLimits {
            memory: 512,
            swap: -1,
            ..Default::default()
        };
        assert_eq!(limits.memory_swap_bytes(), -1);
    }

    #[test]
    fn stop_config_deserializes_from_egg_shape() {
        let cfg: StopConfig = serde_json::from_str(r#"{"type":"command","value":"stop"}"#).unwrap();
        assert_eq!(cfg.kind, StopType::Command);
        assert_eq!(cfg.value, "stop");
    }
}
