//! Process state tracking.

use std::sync::RwLock;

use roost_events::{topic, Bus};
use serde::{Deserialize, Serialize};

/// The four power states a server process moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    #[default]
    Offline,
    Starting,
    Running,
    Stopping,
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Offline => write!(f, "offline"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
        }
    }
}

impl ProcessState {
    #[must_use]
    pub fn is_running(self) -> bool {
        matches!(self, Self::Running | Self::Starting)
    }
}

/// The single writer-ordered holder of a server's process state.
///
/// Reads never block writers for long: the lock is held only to copy the
/// enum. Setting a new value publishes a `status` event, but only when the
/// value actually changed.
pub struct StateHolder {
    server_id: String,
    bus: Bus,
    state: RwLock<ProcessState>,
}

impl StateHolder {
    #[must_use]
    pub fn new(server_id: String, bus: Bus) -> Self {
        Self {
            server_id,
            bus,
            state: RwLock::new(ProcessState::Offline),
        }
    }

    #[must_use]
    pub fn get(&self) -> ProcessState {
        *self.state.read().expect("state lock poisoned")
    }

    pub fn set(&self, new: ProcessState) {
        let changed = {
            let mut state = self.state.write().expect("state lock poisoned");
            let changed = *state != new;
            *state = new;
            changed
        };
        if changed {
            self.bus.publish_json(
                topic::STATUS,
                &serde_json::json!({ "server_id": self.server_id, "state": new }),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publishes_only_on_change() {
        let bus = Bus::new();
        let mut rx = bus.channel(8);
        let holder = StateHolder::new("s1".into(), bus);

        holder.set(ProcessState::Starting);
        holder.set(ProcessState::Starting);
        holder.set(ProcessState::Running);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.data["state"], "starting");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.data["state"], "running");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ProcessState::Stopping).unwrap(),
            "\"stopping\""
        );
    }
}
