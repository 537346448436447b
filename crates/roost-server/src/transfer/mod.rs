//! Node-to-node server transfers.
//!
//! The outbound side archives the server's files plus selected backups and
//! streams them as one multipart body to the peer daemon; the inbound side
//! reconstructs the server while verifying a SHA-256 checksum for every
//! part. Field names and ordering on the wire are fixed:
//! `archive`, `checksum_archive`, `backup_<uuid>.tar.gz`,
//! `checksum_backup_<uuid>.tar.gz`, and finally `install_logs`.

mod inbound;
mod outbound;

pub use inbound::Incoming;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use roost_events::topic;
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::Server;

/// Lifecycle of a transfer, on either side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

/// Upload progress over a known total.
#[derive(Debug, Default)]
pub struct Progress {
    written: AtomicU64,
    total: AtomicU64,
}

impl Progress {
    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Release);
    }

    pub fn add_total(&self, n: u64) {
        self.total.fetch_add(n, Ordering::AcqRel);
    }

    pub fn add(&self, n: u64) {
        self.written.fetch_add(n, Ordering::AcqRel);
    }

    #[must_use]
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Acquire)
    }

    /// Renders `[==>   ] 42.31%` with the given bar width.
    #[must_use]
    pub fn bar(&self, width: usize) -> String {
        let total = self.total.load(Ordering::Acquire);
        let written = self.written();
        let fraction = if total == 0 {
            0.0
        } else {
            (written as f64 / total as f64).min(1.0)
        };
        let filled = (fraction * width as f64).round() as usize;
        let mut bar = String::with_capacity(width + 12);
        bar.push('[');
        for i in 0..width {
            bar.push(if i + 1 < filled {
                '='
            } else if i + 1 == filled {
                '>'
            } else {
                ' '
            });
        }
        bar.push_str(&format!("] {:.2}%", fraction * 100.0));
        bar
    }
}

/// A per-server singleton while in flight.
pub struct Transfer {
    server: Arc<Server>,
    peer_url: String,
    token: String,
    backups: Vec<Uuid>,
    status: RwLock<TransferStatus>,
    pub cancel: CancellationToken,
    progress: Progress,
}

impl Transfer {
    #[must_use]
    pub fn new(server: Arc<Server>, peer_url: String, token: String, backups: Vec<Uuid>) -> Arc<Self> {
        Arc::new(Self {
            server,
            peer_url,
            token,
            backups,
            status: RwLock::new(TransferStatus::Pending),
            cancel: CancellationToken::new(),
            progress: Progress::default(),
        })
    }

    #[must_use]
    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    #[must_use]
    pub fn status(&self) -> TransferStatus {
        *self.status.read().expect("transfer status poisoned")
    }

    pub(crate) fn set_status(&self, status: TransferStatus) {
        *self.status.write().expect("transfer status poisoned") = status;
        self.server.events().publish(
            topic::TRANSFER_STATUS,
            json!({
                "server_id": self.server.id().to_string(),
                "status": status,
            }),
        );
    }

    /// Publishes a progress/status line on the `transfer logs` topic.
    pub(crate) fn send_message(&self, message: &str) {
        self.server.events().publish(
            topic::TRANSFER_LOGS,
            json!({
                "server_id": self.server.id().to_string(),
                "line": message,
            }),
        );
    }

    #[must_use]
    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    /// Requests cancellation; the multipart loops observe the token at
    /// their next suspension point and unwind through the failure path.
    pub fn request_cancellation(&self) {
        self.set_status(TransferStatus::Cancelled);
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::Progress;

    #[test]
    fn bar_rendering() {
        let progress = Progress::default();
        progress.set_total(200);
        progress.add(100);
        let bar = progress.bar(10);
        assert!(bar.starts_with('['), "{bar}");
        assert!(bar.ends_with("50.00%"), "{bar}");
    }

    #[test]
    fn bar_with_unknown_total() {
        let progress = Progress::default();
        progress.add(10);
        assert!(progress.bar(10).ends_with("0.00%"));
    }
}
