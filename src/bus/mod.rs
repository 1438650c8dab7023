//! Pub/sub fabric over a topic-based message queue.
//!
//! `Bus` is a small capability trait, in the same shape as `HistoryProvider`
//! trait-plus-variants. [`LoopbackBus`] is an in-process implementation used
//! for single-node runs and tests; [`NsqBus`] is the real transport, speaking
//! the NSQ HTTP control plane and TCP wire protocol.

mod loopback;
mod nsq;
mod protocol;

pub use loopback::LoopbackBus;
pub use nsq::NsqBus;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Wire envelope: every publish is wrapped with the publishing node's name
/// so consumers can filter self-echo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub origin: String,
    pub msg_body: serde_json::Value,
}

/// A subscriber callback. Returns `true` to acknowledge the message, `false`
/// to let the transport requeue it. Never invoked for a message whose
/// `origin` equals the subscribing node's name — the `Bus` filters those
/// before the handler ever sees them.
pub type BusHandler =
    Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, bool> + Send + Sync + 'static>;

#[async_trait]
pub trait Bus: Send + Sync {
    /// Wrap `body` in an `Envelope`, encode as JSON, and hand it to the
    /// transport. Fire-and-forget: transport errors are logged, not
    /// returned.
    async fn publish(&self, topic: &str, body: serde_json::Value);

    /// Ensure the topic (and this node's consumer channel) exist, then start
    /// a reader that calls `handler` for every message not originating from
    /// this node.
    async fn subscribe(&self, topic: &str, handler: BusHandler) -> Result<(), crate::error::CoreError>;

    /// Close and forget the reader for `topic`.
    async fn unsubscribe(&self, topic: &str);
}
