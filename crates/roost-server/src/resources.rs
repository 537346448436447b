//! The per-server resource usage record and its wire form.

use std::sync::RwLock;

use roost_env::{ProcessState, Stats};
use serde::Serialize;

/// Network counters split out the way the event stream reports them.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct NetworkUsage {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// The resource record published on the `stats` topic. Field names and
/// shapes are fixed wire format.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceUsage {
    pub memory_bytes: u64,
    pub memory_limit_bytes: u64,
    pub cpu_absolute: f64,
    pub network: NetworkUsage,
    /// Milliseconds since the container started.
    pub uptime: u64,
    pub state: ProcessState,
    pub disk_bytes: u64,
}

impl Default for ResourceUsage {
    fn default() -> Self {
        Self {
            memory_bytes: 0,
            memory_limit_bytes: 0,
            cpu_absolute: 0.0,
            network: NetworkUsage::default(),
            uptime: 0,
            state: ProcessState::Offline,
            disk_bytes: 0,
        }
    }
}

/// Holder keeping the latest sample. The state field is read from the
/// environment at snapshot time, so readers never block a stats writer.
#[derive(Debug, Default)]
pub(crate) struct ResourceHolder {
    inner: RwLock<ResourceUsage>,
}

impl ResourceHolder {
    pub(crate) fn update(&self, stats: Stats, disk_bytes: u64, uptime: u64) {
        let mut usage = self.inner.write().expect("resource record poisoned");
        usage.memory_bytes = stats.memory_bytes;
        usage.memory_limit_bytes = stats.memory_limit_bytes;
        usage.cpu_absolute = stats.cpu_absolute;
        usage.network = NetworkUsage {
            rx_bytes: stats.network_rx_bytes,
            tx_bytes: stats.network_tx_bytes,
        };
        usage.disk_bytes = disk_bytes;
        usage.uptime = uptime;
    }

    pub(crate) fn reset(&self) {
        *self.inner.write().expect("resource record poisoned") = ResourceUsage::default();
    }

    pub(crate) fn snapshot(&self, state: ProcessState) -> ResourceUsage {
        let mut usage = self
            .inner
            .read()
            .expect("resource record poisoned")
            .clone();
        usage.state = state;
        usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_is_exact() {
        let holder = ResourceHolder::default();
        holder.update(
            Stats {
                memory_bytes: 1024,
                memory_limit_bytes: 2048,
                cpu_absolute: 12.5,
                network_rx_bytes: 10,
                network_tx_bytes: 20,
            },
            4096,
            1500,
        );
        let usage = holder.snapshot(ProcessState::Running);
        let value = serde_json::to_value(&usage).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "memory_bytes": 1024,
                "memory_limit_bytes": 2048,
                "cpu_absolute": 12.5,
                "network": { "rx_bytes": 10, "tx_bytes": 20 },
                "uptime": 1500,
                "state": "running",
                "disk_bytes": 4096
            })
        );
    }
}
