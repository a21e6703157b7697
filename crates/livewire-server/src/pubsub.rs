//! Topic-based broadcast into live sockets.
//!
//! The in-process bus delivers at-least-once to every subscriber in the
//! process; a pluggable backend can extend delivery across nodes with
//! best-effort semantics. Ordering within a topic from a single publisher
//! is preserved in-process.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

/// A pub/sub transport the live server can broadcast through.
///
/// Implementations must deliver to in-process subscribers at least once and
/// may deliver across processes best-effort. Publish failures are the
/// backend's to log; subscribers proceed as if no event occurred.
pub trait PubSubBackend: Send + Sync + 'static {
    /// Publishes a payload to every subscriber of `topic`.
    fn publish(&self, topic: &str, payload: Value);

    /// Subscribes to `topic`. Dropping the receiver unsubscribes.
    fn subscribe(&self, topic: &str) -> mpsc::UnboundedReceiver<Value>;
}

/// Handle to a pub/sub bus, cheap to clone into sockets and handlers.
#[derive(Clone)]
pub struct PubSub {
    backend: Arc<dyn PubSubBackend>,
}

impl PubSub {
    /// Creates a bus backed by the in-process [`LocalBus`].
    pub fn in_process() -> Self {
        Self::with_backend(Arc::new(LocalBus::default()))
    }

    /// Creates a bus over a custom backend, e.g. a distributed broker.
    pub fn with_backend(backend: Arc<dyn PubSubBackend>) -> Self {
        Self { backend }
    }

    /// Publishes a payload to every subscriber of `topic`.
    pub fn publish(&self, topic: &str, payload: Value) {
        self.backend.publish(topic, payload);
    }

    /// Subscribes to `topic`.
    pub fn subscribe(&self, topic: &str) -> mpsc::UnboundedReceiver<Value> {
        self.backend.subscribe(topic)
    }
}

impl Default for PubSub {
    fn default() -> Self {
        Self::in_process()
    }
}

type SubscriberMap = HashMap<String, Vec<mpsc::UnboundedSender<Value>>>;

/// In-process bus: a copy-on-write subscriber map.
///
/// The map is rebuilt on subscribe and on pruning; publishers read a
/// snapshot through the `Arc` and never hold the lock while delivering.
#[derive(Default)]
pub struct LocalBus {
    topics: RwLock<Arc<SubscriberMap>>,
}

impl LocalBus {
    fn snapshot(&self) -> Arc<SubscriberMap> {
        self.topics.read().expect("subscriber map lock poisoned").clone()
    }

    /// Rebuilds the map without closed senders on `topic`.
    fn prune(&self, topic: &str) {
        let mut guard = self.topics.write().expect("subscriber map lock poisoned");
        let mut rebuilt: SubscriberMap = (**guard).clone();
        if let Some(senders) = rebuilt.get_mut(topic) {
            senders.retain(|tx| !tx.is_closed());
            if senders.is_empty() {
                rebuilt.remove(topic);
            }
        }
        *guard = Arc::new(rebuilt);
    }
}

impl PubSubBackend for LocalBus {
    fn publish(&self, topic: &str, payload: Value) {
        let snapshot = self.snapshot();
        let Some(senders) = snapshot.get(topic) else {
            return;
        };
        let mut dead = false;
        for tx in senders {
            if tx.send(payload.clone()).is_err() {
                dead = true;
            }
        }
        if dead {
            debug!(%topic, "pruning closed subscribers");
            self.prune(topic);
        }
    }

    fn subscribe(&self, topic: &str) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut guard = self.topics.write().expect("subscriber map lock poisoned");
        let mut rebuilt: SubscriberMap = (**guard).clone();
        rebuilt.entry(topic.to_string()).or_default().push(tx);
        *guard = Arc::new(rebuilt);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn delivers_to_every_subscriber_in_order() {
        let bus = PubSub::in_process();
        let mut a = bus.subscribe("room:1");
        let mut b = bus.subscribe("room:1");

        bus.publish("room:1", json!({ "n": 1 }));
        bus.publish("room:1", json!({ "n": 2 }));

        assert_eq!(a.recv().await, Some(json!({ "n": 1 })));
        assert_eq!(a.recv().await, Some(json!({ "n": 2 })));
        assert_eq!(b.recv().await, Some(json!({ "n": 1 })));
        assert_eq!(b.recv().await, Some(json!({ "n": 2 })));
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = PubSub::in_process();
        let mut a = bus.subscribe("room:1");
        let mut b = bus.subscribe("room:2");

        bus.publish("room:2", json!("only b"));
        assert_eq!(b.recv().await, Some(json!("only b")));
        assert!(a.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_subscribers_do_not_break_delivery() {
        let bus = PubSub::in_process();
        let gone = bus.subscribe("room:1");
        let mut alive = bus.subscribe("room:1");
        drop(gone);

        bus.publish("room:1", json!("still here"));
        bus.publish("room:1", json!("and again"));
        assert_eq!(alive.recv().await, Some(json!("still here")));
        assert_eq!(alive.recv().await, Some(json!("and again")));
    }
}
