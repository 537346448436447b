//! Background crons: the activity flush.

use std::sync::Arc;
use std::time::Duration;

use roost_remote::RemoteClient;
use roost_server::activity::ActivityStore;

/// Periodically ships queued activity to the Panel. The general stream and
/// the SFTP stream flush on the same tick but as separate batches; records
/// are only deleted after the Panel accepted them.
pub fn spawn_activity_flush(
    store: Arc<ActivityStore>,
    remote: Arc<dyn RemoteClient>,
    interval: Duration,
    batch: usize,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            flush(&store, &remote, batch, false).await;
            flush(&store, &remote, batch, true).await;
        }
    });
}

async fn flush(store: &ActivityStore, remote: &Arc<dyn RemoteClient>, batch: usize, sftp: bool) {
    let dequeued = if sftp {
        store.dequeue_sftp(batch)
    } else {
        store.dequeue_general(batch)
    };
    let (ids, events) = match dequeued {
        Ok(result) => result,
        Err(err) => {
            tracing::error!(error = %err, "failed to read queued activity");
            return;
        }
    };
    if ids.is_empty() {
        return;
    }

    if let Err(err) = remote.send_activity_logs(&events).await {
        // Leave the records queued; the next tick retries them.
        tracing::warn!(error = %err, count = events.len(), "failed to ship activity to panel");
        return;
    }
    if let Err(err) = store.remove(&ids) {
        tracing::error!(error = %err, "failed to prune shipped activity records");
    }
}
