//! Change-feed emulation.
//!
//! SQLite has no server-pushed change streams, so `observeGroupState` /
//! `observeGroupMeta` are emulated with a per-document broadcast channel:
//! every write that touches a `GroupState` or `Group` row publishes a
//! [`ChangeEvent`](super::models::ChangeEvent) to that document's channel
//! after the write commits. Subscribers get an async `Stream`: re-calling
//! `observe*` opens a fresh receiver (restartable), dropping the stream
//! stops delivery (cancellable), and a lagged receiver surfaces as one
//! `StorageUnavailable` item before the stream ends (disconnect semantics).

use crate::error::CoreError;
use crate::store::models::ChangeEvent;
use dashmap::DashMap;
use futures_util::Stream;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

const FEED_CAPACITY: usize = 64;

pub struct ChangeFeedHub<T: Clone + Send + 'static> {
    channels: DashMap<String, broadcast::Sender<ChangeEvent<T>>>,
}

impl<T: Clone + Send + 'static> Default for ChangeFeedHub<T> {
    fn default() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }
}

impl<T: Clone + Send + 'static> ChangeFeedHub<T> {
    fn sender(&self, id: &str) -> broadcast::Sender<ChangeEvent<T>> {
        self.channels
            .entry(id.to_string())
            .or_insert_with(|| broadcast::channel(FEED_CAPACITY).0)
            .clone()
    }

    /// Publish a change. Silently a no-op if nobody is subscribed.
    pub fn publish(&self, id: &str, event: ChangeEvent<T>) {
        let tx = self.sender(id);
        let _ = tx.send(event);
    }

    /// Subscribe to changes for one document id. Each call opens an
    /// independent receiver; closing (dropping) the returned stream is the
    /// cancellation mechanism.
    pub fn observe(&self, id: &str) -> impl Stream<Item = Result<ChangeEvent<T>, CoreError>> + use<T> {
        let rx = self.sender(id).subscribe();
        BroadcastStream::new(rx).map(|res| {
            res.map_err(|_lagged| {
                CoreError::StorageUnavailable(
                    "change feed lagged and was disconnected".to_string(),
                )
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt as _;

    #[tokio::test]
    async fn publish_then_observe_round_trips() {
        let hub: ChangeFeedHub<i32> = ChangeFeedHub::default();
        let mut stream = Box::pin(hub.observe("g1"));

        hub.publish(
            "g1",
            ChangeEvent {
                old_val: None,
                new_val: Some(7),
            },
        );

        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.new_val, Some(7));
    }

    #[tokio::test]
    async fn reobserve_after_drop_gets_fresh_stream() {
        let hub: ChangeFeedHub<i32> = ChangeFeedHub::default();
        {
            let _stream = Box::pin(hub.observe("g1"));
            // dropped here; cancellation is just dropping the stream
        }
        let mut stream = Box::pin(hub.observe("g1"));
        hub.publish(
            "g1",
            ChangeEvent {
                old_val: Some(1),
                new_val: Some(2),
            },
        );
        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.old_val, Some(1));
    }
}
