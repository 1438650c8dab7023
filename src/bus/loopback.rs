//! In-process `Bus` implementation: a per-topic broadcast channel. Used for
//! single-node deployments and for tests that need the origin-filter
//! guarantee (I3) without a real message queue.

use super::{Bus, BusHandler, Envelope};
use crate::error::CoreError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const TOPIC_CAPACITY: usize = 256;

pub struct LoopbackBus {
    node_name: String,
    channels: Arc<DashMap<String, broadcast::Sender<Envelope>>>,
    readers: DashMap<String, JoinHandle<()>>,
}

impl LoopbackBus {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            channels: Arc::new(DashMap::new()),
            readers: DashMap::new(),
        }
    }

    /// Another node attached to the same in-process "network": shares the
    /// underlying topic channels but keeps its own origin tag and reader
    /// set, so publishes from one are visible to the other (minus the
    /// origin-filter) without a real message queue. Used to exercise
    /// cross-node flows in integration tests.
    pub fn peer(&self, node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            channels: self.channels.clone(),
            readers: DashMap::new(),
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Envelope> {
        self.channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl Bus for LoopbackBus {
    async fn publish(&self, topic: &str, body: serde_json::Value) {
        let envelope = Envelope {
            origin: self.node_name.clone(),
            msg_body: body,
        };
        // Fire-and-forget: no subscribers is not an error.
        let _ = self.sender(topic).send(envelope);
    }

    async fn subscribe(&self, topic: &str, handler: BusHandler) -> Result<(), CoreError> {
        let mut rx = self.sender(topic).subscribe();
        let node_name = self.node_name.clone();

        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => {
                        if envelope.origin == node_name {
                            continue; // origin filter (I3): dropped, not delivered
                        }
                        handler(envelope.msg_body).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        if let Some(old) = self.readers.insert(topic.to_string(), task) {
            old.abort();
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) {
        if let Some((_, task)) = self.readers.remove(topic) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;
    use std::time::Duration;

    #[tokio::test]
    async fn self_origin_is_filtered() {
        let bus = LoopbackBus::new("node-a");
        let received = StdArc::new(AtomicUsize::new(0));
        let received_clone = received.clone();

        bus.subscribe(
            "jane",
            StdArc::new(move |_body| {
                let received = received_clone.clone();
                Box::pin(async move {
                    received.fetch_add(1, Ordering::SeqCst);
                    true
                })
            }),
        )
        .await
        .unwrap();

        bus.publish("jane", serde_json::json!({"type": "privmsg"})).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(received.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn remote_origin_is_delivered() {
        let bus_a = LoopbackBus::new("node-a");
        // Share the underlying channel by publishing from a second bus with
        // the same sender map would require a shared transport; here we
        // simulate a remote publish by constructing the envelope directly.
        let received = StdArc::new(AtomicUsize::new(0));
        let received_clone = received.clone();

        bus_a
            .subscribe(
                "jane",
                StdArc::new(move |_body| {
                    let received = received_clone.clone();
                    Box::pin(async move {
                        received.fetch_add(1, Ordering::SeqCst);
                        true
                    })
                }),
            )
            .await
            .unwrap();

        let envelope = Envelope {
            origin: "node-b".to_string(),
            msg_body: serde_json::json!({"type": "privmsg"}),
        };
        let _ = bus_a.sender("jane").send(envelope);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(received.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = LoopbackBus::new("node-a");
        let received = StdArc::new(AtomicUsize::new(0));
        let received_clone = received.clone();

        bus.subscribe(
            "jane",
            StdArc::new(move |_body| {
                let received = received_clone.clone();
                Box::pin(async move {
                    received.fetch_add(1, Ordering::SeqCst);
                    true
                })
            }),
        )
        .await
        .unwrap();
        bus.unsubscribe("jane").await;

        let envelope = Envelope {
            origin: "node-b".to_string(),
            msg_body: serde_json::json!({"type": "privmsg"}),
        };
        let _ = bus.sender("jane").send(envelope);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(received.load(Ordering::SeqCst), 0);
    }
}
