//! Console sinks: ring-buffered history plus bus publication.

use std::sync::RwLock;

use roost_system::Ring;
use serde_json::json;

use crate::{topic, Bus};

/// Default number of console lines retained per server.
pub const DEFAULT_HISTORY_LINES: usize = 150;

/// A line sink that keeps the most recent output in a ring buffer and
/// mirrors every pushed line onto the bus.
pub struct ConsoleSink {
    bus: Bus,
    topic: &'static str,
    history: RwLock<Ring<String>>,
    server_id: String,
}

impl ConsoleSink {
    #[must_use]
    pub fn new(bus: Bus, topic: &'static str, capacity: usize, server_id: String) -> Self {
        Self {
            bus,
            topic,
            history: RwLock::new(Ring::new(capacity)),
            server_id,
        }
    }

    /// Appends a line to the history (evicting the oldest when full) and
    /// publishes it.
    pub fn push(&self, line: &str) {
        {
            let mut history = self.history.write().expect("console history poisoned");
            history.push(line.to_string());
        }
        self.bus.publish(
            self.topic,
            json!({ "server_id": self.server_id, "line": line }),
        );
    }

    /// Returns a point-in-time copy of the last `n` lines, oldest first.
    #[must_use]
    pub fn snapshot(&self, n: usize) -> Vec<String> {
        self.history
            .read()
            .expect("console history poisoned")
            .last(n)
    }

    /// Number of buffered lines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.history.read().expect("console history poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops the buffered history, e.g. after a server reinstall.
    pub fn clear(&self) {
        self.history
            .write()
            .expect("console history poisoned")
            .clear();
    }
}

/// The pair of sinks every server carries: live console output and
/// installation output.
pub struct SinkPool {
    log: ConsoleSink,
    install: ConsoleSink,
}

impl SinkPool {
    #[must_use]
    pub fn new(bus: &Bus, history_lines: usize, server_id: &str) -> Self {
        Self {
            log: ConsoleSink::new(
                bus.clone(),
                topic::CONSOLE_OUTPUT,
                history_lines,
                server_id.to_string(),
            ),
            install: ConsoleSink::new(
                bus.clone(),
                topic::INSTALL_OUTPUT,
                history_lines,
                server_id.to_string(),
            ),
        }
    }

    #[must_use]
    pub fn log(&self) -> &ConsoleSink {
        &self.log
    }

    #[must_use]
    pub fn install(&self) -> &ConsoleSink {
        &self.install
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_buffers_and_publishes() {
        let bus = Bus::new();
        let mut rx = bus.channel(8);
        let sink = ConsoleSink::new(bus, topic::CONSOLE_OUTPUT, 3, "a1".into());

        for i in 0..5 {
            sink.push(&format!("line {i}"));
        }

        assert_eq!(sink.snapshot(10), vec!["line 2", "line 3", "line 4"]);

        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.topic, topic::CONSOLE_OUTPUT);
        assert_eq!(ev.data["server_id"], "a1");
        assert_eq!(ev.data["line"], "line 0");
    }

    #[test]
    fn snapshot_limits_to_requested_count() {
        let bus = Bus::new();
        let sink = ConsoleSink::new(bus, topic::CONSOLE_OUTPUT, 150, "a1".into());
        for i in 0..20 {
            sink.push(&i.to_string());
        }
        let snap = sink.snapshot(4);
        assert_eq!(snap, vec!["16", "17", "18", "19"]);
    }
}
