use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::broadcast;

const TOPIC_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay channel closed")]
    Closed,
    #[error("relay unreachable: {0}")]
    Unreachable(String),
    #[error("relay transport error: {0}")]
    Transport(String),
}

pub type RelayResult<T> = Result<T, RelayError>;

/// Topic-addressed publish/subscribe relay.
///
/// Delivery is ordered within a topic and reaches current subscribers only;
/// nothing is stored for subscribers that join later.
pub trait Relay: Send + Sync {
    fn subscribe(&self, topic: &str) -> RelayResult<Subscription>;
    fn publish(&self, topic: &str, payload: Bytes) -> RelayResult<()>;
}

/// A live membership in one topic. Dropping it leaves the topic.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    rx: broadcast::Receiver<RelayMessage>,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, rx: broadcast::Receiver<RelayMessage>) -> Self {
        Self {
            topic: topic.into(),
            rx,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Waits for the next message on the topic. Messages overrun by a slow
    /// reader are skipped.
    pub async fn recv(&mut self) -> RelayResult<RelayMessage> {
        loop {
            match self.rx.recv().await {
                Ok(message) => return Ok(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        target = "relay.bus",
                        topic = %self.topic,
                        skipped,
                        "subscriber lagged; dropping overrun messages"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return Err(RelayError::Closed),
            }
        }
    }
}

/// In-process relay for tests and single-process deployments.
#[derive(Debug)]
pub struct LocalRelay {
    topics: parking_lot::RwLock<HashMap<String, broadcast::Sender<RelayMessage>>>,
    reachable: AtomicBool,
}

impl Default for LocalRelay {
    fn default() -> Self {
        Self {
            topics: parking_lot::RwLock::new(HashMap::new()),
            reachable: AtomicBool::new(true),
        }
    }
}

impl LocalRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates losing (or regaining) the connection to the relay.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Forgets a topic; its current subscribers see [`RelayError::Closed`].
    pub fn drop_topic(&self, topic: &str) {
        self.topics.write().remove(topic);
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    fn ensure_reachable(&self) -> RelayResult<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RelayError::Unreachable("local relay offline".into()))
        }
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<RelayMessage> {
        if let Some(sender) = self.topics.read().get(topic) {
            return sender.clone();
        }
        let mut guard = self.topics.write();
        guard
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }
}

impl Relay for LocalRelay {
    fn subscribe(&self, topic: &str) -> RelayResult<Subscription> {
        self.ensure_reachable()?;
        Ok(Subscription::new(topic, self.sender_for(topic).subscribe()))
    }

    fn publish(&self, topic: &str, payload: Bytes) -> RelayResult<()> {
        self.ensure_reachable()?;
        let sender = self.sender_for(topic);
        let message = RelayMessage {
            topic: topic.to_string(),
            payload,
        };
        if sender.send(message).is_err() {
            tracing::trace!(target = "relay.bus", topic, "no subscribers; message dropped");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_timeout::tokio_timeout_test;

    #[tokio_timeout_test(5)]
    async fn local_relay_round_trip() {
        let relay = LocalRelay::new();
        let mut sub = relay.subscribe("signaling:bob").expect("subscribe ok");
        relay
            .publish("signaling:bob", Bytes::from_static(b"ping"))
            .expect("publish ok");
        let msg = sub.recv().await.expect("receive ok");
        assert_eq!(msg.topic, "signaling:bob");
        assert_eq!(msg.payload, Bytes::from_static(b"ping"));
    }

    #[tokio_timeout_test(5)]
    async fn preserves_order_within_topic() {
        let relay = LocalRelay::new();
        let mut sub = relay.subscribe("t").expect("subscribe ok");
        for i in 0..10u8 {
            relay.publish("t", Bytes::from(vec![i])).expect("publish ok");
        }
        for i in 0..10u8 {
            assert_eq!(sub.recv().await.expect("msg").payload[0], i);
        }
    }

    #[tokio_timeout_test(5)]
    async fn messages_without_subscribers_are_lost() {
        let relay = LocalRelay::new();
        relay
            .publish("signaling:carol", Bytes::from_static(b"early"))
            .expect("publish to empty topic still succeeds");
        let mut sub = relay.subscribe("signaling:carol").expect("subscribe ok");
        relay
            .publish("signaling:carol", Bytes::from_static(b"late"))
            .expect("publish ok");
        assert_eq!(sub.recv().await.expect("msg").payload, Bytes::from_static(b"late"));
    }

    #[test]
    fn unreachable_relay_rejects_subscribe_and_publish() {
        let relay = LocalRelay::new();
        relay.set_reachable(false);
        assert!(matches!(relay.subscribe("t"), Err(RelayError::Unreachable(_))));
        assert!(matches!(
            relay.publish("t", Bytes::new()),
            Err(RelayError::Unreachable(_))
        ));
        relay.set_reachable(true);
        assert!(relay.subscribe("t").is_ok());
    }

    #[test]
    fn dropping_subscription_leaves_topic() {
        let relay = LocalRelay::new();
        let sub = relay.subscribe("t").expect("subscribe ok");
        let again = relay.subscribe("t").expect("subscribe is idempotent");
        assert_eq!(relay.subscriber_count("t"), 2);
        drop(sub);
        assert_eq!(relay.subscriber_count("t"), 1);
        drop(again);
        assert_eq!(relay.subscriber_count("t"), 0);
    }

    #[tokio_timeout_test(5)]
    async fn dropped_topic_closes_subscribers() {
        let relay = LocalRelay::new();
        let mut sub = relay.subscribe("t").expect("subscribe ok");
        relay.drop_topic("t");
        assert!(matches!(sub.recv().await, Err(RelayError::Closed)));
        assert_eq!(relay.subscriber_count("t"), 0);
    }
}
