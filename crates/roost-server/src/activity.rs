//! Queued activity records.
//!
//! Audit events are written to a small embedded store and shipped to the
//! Panel in batches by a cron in the daemon binary. SFTP events are grouped
//! and flushed separately from the general stream, so the store exposes two
//! dequeue views over one table.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use redb::{Database, ReadableTable, TableDefinition};
use roost_remote::ActivityEvent;
use serde_json::Value;
use uuid::Uuid;

use crate::{CommonError, Result};

/// Auto-increment id -> JSON-serialized [`ActivityEvent`].
const ACTIVITY: TableDefinition<'static, u64, &'static [u8]> = TableDefinition::new("activity");

/// Event-name prefix identifying the SFTP family.
pub const SFTP_EVENT_PREFIX: &str = "server:sftp.";

/// Hard cap on ids per delete, a parameter-count constraint of the
/// underlying store's batch API.
pub const MAX_DELETE_BATCH: usize = 32_000;

/// Node-wide queue of audit events awaiting delivery to the Panel.
pub struct ActivityStore {
    db: Database,
    next_id: AtomicU64,
}

impl ActivityStore {
    /// Opens (or creates) the store at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)
            .map_err(|e| CommonError::internal(format!("activity store: {e}")))?;

        // Seed the id counter past whatever survived the last run.
        let next = {
            let txn = db
                .begin_read()
                .map_err(|e| CommonError::internal(format!("activity store: {e}")))?;
            match txn.open_table(ACTIVITY) {
                Ok(table) => table
                    .last()
                    .map_err(|e| CommonError::internal(format!("activity store: {e}")))?
                    .map(|(key, _)| key.value() + 1)
                    .unwrap_or(1),
                Err(redb::TableError::TableDoesNotExist(_)) => 1,
                Err(e) => return Err(CommonError::internal(format!("activity store: {e}"))),
            }
        };

        Ok(Self {
            db,
            next_id: AtomicU64::new(next),
        })
    }

    /// Enqueues one event.
    pub fn push(&self, event: &ActivityEvent) -> Result<()> {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let bytes = serde_json::to_vec(event)
            .map_err(|e| CommonError::internal(format!("activity encode: {e}")))?;

        let txn = self
            .db
            .begin_write()
            .map_err(|e| CommonError::internal(format!("activity store: {e}")))?;
        {
            let mut table = txn
                .open_table(ACTIVITY)
                .map_err(|e| CommonError::internal(format!("activity store: {e}")))?;
            table
                .insert(id, bytes.as_slice())
                .map_err(|e| CommonError::internal(format!("activity store: {e}")))?;
        }
        txn.commit()
            .map_err(|e| CommonError::internal(format!("activity store: {e}")))?;
        Ok(())
    }

    /// Convenience constructor + enqueue.
    pub fn record(
        &self,
        server: Uuid,
        user: Option<Uuid>,
        event: &str,
        ip: &str,
        metadata: Value,
    ) -> Result<()> {
        self.push(&ActivityEvent {
            user,
            server,
            event: event.to_string(),
            metadata,
            ip: ip.to_string(),
            timestamp: Utc::now(),
        })
    }

    /// Dequeues up to `max` events for the general flush, skipping the SFTP
    /// family. Returns (ids, events); the ids are passed back to
    /// [`ActivityStore::remove`] after a successful ship.
    pub fn dequeue_general(&self, max: usize) -> Result<(Vec<u64>, Vec<ActivityEvent>)> {
        self.dequeue(max, |event| !event.event.starts_with(SFTP_EVENT_PREFIX))
    }

    /// Dequeues up to `max` SFTP-family events.
    pub fn dequeue_sftp(&self, max: usize) -> Result<(Vec<u64>, Vec<ActivityEvent>)> {
        self.dequeue(max, |event| event.event.starts_with(SFTP_EVENT_PREFIX))
    }

    fn dequeue(
        &self,
        max: usize,
        want: impl Fn(&ActivityEvent) -> bool,
    ) -> Result<(Vec<u64>, Vec<ActivityEvent>)> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| CommonError::internal(format!("activity store: {e}")))?;
        let table = match txn.open_table(ACTIVITY) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok((Vec::new(), Vec::new())),
            Err(e) => return Err(CommonError::internal(format!("activity store: {e}"))),
        };

        let mut ids = Vec::new();
        let mut events = Vec::new();
        for item in table
            .iter()
            .map_err(|e| CommonError::internal(format!("activity store: {e}")))?
        {
            if ids.len() >= max {
                break;
            }
            let (key, value) =
                item.map_err(|e| CommonError::internal(format!("activity store: {e}")))?;
            let Ok(event) = serde_json::from_slice::<ActivityEvent>(value.value()) else {
                // A corrupt record is dropped rather than wedging the queue.
                ids.push(key.value());
                continue;
            };
            if want(&event) {
                ids.push(key.value());
                events.push(event);
            }
        }
        Ok((ids, events))
    }

    /// Deletes shipped records, chunked under the store's batch cap.
    pub fn remove(&self, ids: &[u64]) -> Result<()> {
        for chunk in ids.chunks(MAX_DELETE_BATCH) {
            let txn = self
                .db
                .begin_write()
                .map_err(|e| CommonError::internal(format!("activity store: {e}")))?;
            {
                let mut table = txn
                    .open_table(ACTIVITY)
                    .map_err(|e| CommonError::internal(format!("activity store: {e}")))?;
                for id in chunk {
                    table
                        .remove(*id)
                        .map_err(|e| CommonError::internal(format!("activity store: {e}")))?;
                }
            }
            txn.commit()
                .map_err(|e| CommonError::internal(format!("activity store: {e}")))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ActivityStore) {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = ActivityStore::open(&tmp.path().join("activity.db")).unwrap();
        (tmp, store)
    }

    #[test]
    fn queue_roundtrip() {
        let (_tmp, store) = store();
        let server = Uuid::new_v4();
        store
            .record(server, None, "server:power.start", "10.0.0.1", serde_json::json!({}))
            .unwrap();
        store
            .record(server, None, "server:sftp.write", "10.0.0.1", serde_json::json!({"files": ["a"]}))
            .unwrap();

        let (ids, events) = store.dequeue_general(100).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "server:power.start");

        let (sftp_ids, sftp_events) = store.dequeue_sftp(100).unwrap();
        assert_eq!(sftp_events.len(), 1);
        assert_eq!(sftp_events[0].event, "server:sftp.write");

        store.remove(&ids).unwrap();
        store.remove(&sftp_ids).unwrap();
        let (ids, _) = store.dequeue_general(100).unwrap();
        assert!(ids.is_empty());
        let (ids, _) = store.dequeue_sftp(100).unwrap();
        assert!(ids.is_empty());
    }

    #[test]
    fn ids_survive_reopen() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("activity.db");
        {
            let store = ActivityStore::open(&path).unwrap();
            store
                .record(Uuid::new_v4(), None, "server:console.command", "::1", serde_json::json!({}))
                .unwrap();
        }
        let store = ActivityStore::open(&path).unwrap();
        store
            .record(Uuid::new_v4(), None, "server:power.stop", "::1", serde_json::json!({}))
            .unwrap();
        let (ids, events) = store.dequeue_general(100).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(ids.len(), 2);
        assert!(ids[0] < ids[1]);
    }
}
