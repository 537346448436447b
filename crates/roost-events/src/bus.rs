//! Topic-addressed pub/sub with bounded, lossy delivery.

use std::sync::{Arc, RwLock};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

/// A single event on a server's bus: a topic plus an opaque JSON payload.
#[derive(Debug, Clone)]
pub struct Event {
    pub topic: String,
    pub data: Value,
}

impl Event {
    #[must_use]
    pub fn new(topic: impl Into<String>, data: Value) -> Self {
        Self {
            topic: topic.into(),
            data,
        }
    }
}

/// Per-server event bus.
///
/// Subscribers register the sending half of a bounded mpsc channel. Publish
/// walks a snapshot of the subscriber list and `try_send`s to each: a full
/// channel drops that one delivery, a closed channel silently removes the
/// subscription. Within a topic, deliveries a subscriber does receive arrive
/// in publish order; nothing is guaranteed across topics or subscribers.
#[derive(Clone, Default)]
pub struct Bus {
    subscribers: Arc<RwLock<Vec<mpsc::Sender<Event>>>>,
}

impl Bus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a delivery target.
    pub fn subscribe(&self, tx: mpsc::Sender<Event>) {
        self.subscribers
            .write()
            .expect("bus subscriber list poisoned")
            .push(tx);
    }

    /// Creates a bounded channel of `capacity` and registers its sender,
    /// returning the receiving half.
    #[must_use]
    pub fn channel(&self, capacity: usize) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.subscribe(tx);
        rx
    }

    /// Removes a delivery target. After this returns no further deliveries
    /// will be attempted on the channel.
    pub fn unsubscribe(&self, tx: &mpsc::Sender<Event>) {
        self.subscribers
            .write()
            .expect("bus subscriber list poisoned")
            .retain(|s| !s.same_channel(tx));
    }

    /// Publishes an event to every current subscriber without blocking.
    pub fn publish(&self, topic: &str, data: Value) {
        self.publish_event(Event::new(topic, data));
    }

    /// Serializes `payload` and publishes it on `topic`.
    ///
    /// Serialization failures are impossible for the payload types used on
    /// the bus (plain structs and strings); a failure is reported as a null
    /// payload rather than a panic.
    pub fn publish_json<T: Serialize>(&self, topic: &str, payload: &T) {
        let data = serde_json::to_value(payload).unwrap_or(Value::Null);
        self.publish(topic, data);
    }

    fn publish_event(&self, event: Event) {
        // Snapshot under the read lock; deliveries happen outside of it.
        let targets: Vec<mpsc::Sender<Event>> = self
            .subscribers
            .read()
            .expect("bus subscriber list poisoned")
            .clone();

        let mut saw_closed = false;
        for tx in &targets {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Slow subscriber: this delivery is dropped for them only.
                }
                Err(mpsc::error::TrySendError::Closed(_)) => saw_closed = true,
            }
        }

        if saw_closed {
            self.subscribers
                .write()
                .expect("bus subscriber list poisoned")
                .retain(|s| !s.is_closed());
        }
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .expect("bus subscriber list poisoned")
            .len()
    }

    /// Drops every subscription. Used when a server is deleted.
    pub fn close(&self) {
        self.subscribers
            .write()
            .expect("bus subscriber list poisoned")
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let bus = Bus::new();
        let mut rx = bus.channel(16);

        for i in 0..5 {
            bus.publish("status", json!(i));
        }

        for i in 0..5 {
            let ev = rx.recv().await.unwrap();
            assert_eq!(ev.topic, "status");
            assert_eq!(ev.data, json!(i));
        }
    }

    #[tokio::test]
    async fn full_channel_drops_without_blocking() {
        let bus = Bus::new();
        let mut rx = bus.channel(8);

        // A burst far beyond the channel capacity must not block the
        // publisher; the subscriber sees at most its capacity.
        for i in 0..1000 {
            bus.publish("stats", json!(i));
        }

        let mut received = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            received.push(ev.data.as_i64().unwrap());
        }
        assert_eq!(received.len(), 8);
        // Whatever made it through is still ordered.
        let mut sorted = received.clone();
        sorted.sort_unstable();
        assert_eq!(received, sorted);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = Bus::new();
        let (tx, mut rx) = mpsc::channel(4);
        bus.subscribe(tx.clone());
        bus.unsubscribe(&tx);

        bus.publish("status", json!("running"));
        drop(tx);
        assert!(rx.try_recv().is_err());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn closed_receiver_is_pruned_on_next_publish() {
        let bus = Bus::new();
        let rx = bus.channel(4);
        drop(rx);

        bus.publish("status", json!("offline"));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn other_subscribers_unaffected_by_full_channel() {
        let bus = Bus::new();
        let mut small = bus.channel(1);
        let mut large = bus.channel(64);

        for i in 0..10 {
            bus.publish("stats", json!(i));
        }

        let mut n = 0;
        while large.try_recv().is_ok() {
            n += 1;
        }
        assert_eq!(n, 10);
        assert_eq!(small.try_recv().unwrap().data, json!(0));
    }
}
