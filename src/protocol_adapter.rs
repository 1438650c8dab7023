//! The contract the IRC wire layer implements and hands to the core. The
//! core never parses IRC; it calls these methods with structured events and
//! trusts the adapter to serialize them to the wire.

use crate::error::CoreError;
use crate::store::models::GroupMeta;
use async_trait::async_trait;

#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    fn name(&self) -> &str;
    fn hostname(&self) -> &str;

    /// A message addressed to this session, either a direct message
    /// (`recipient == self.name()`) or a channel message (`recipient` is the
    /// group name).
    async fn receive(&self, sender_name: &str, recipient: &str, text: &str) -> Result<(), CoreError>;

    async fn user_joined(&self, group: &str, nick: &str, hostname: &str);

    async fn user_left(&self, group: &str, nick: &str, reason: Option<&str>);

    async fn group_meta_update(&self, group: &str, meta: &GroupMeta);
}

/// A stub session installed on proxy users: it has no real wire connection,
/// so every call is a no-op that just logs the receipt.
pub struct StubAdapter {
    name: String,
    hostname: String,
}

impl StubAdapter {
    pub fn new(name: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hostname: hostname.into(),
        }
    }
}

#[async_trait]
impl ProtocolAdapter for StubAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn hostname(&self) -> &str {
        &self.hostname
    }

    async fn receive(&self, sender_name: &str, recipient: &str, text: &str) -> Result<(), CoreError> {
        tracing::debug!(proxy = %self.name, sender = %sender_name, recipient, text, "proxy receive");
        Ok(())
    }

    async fn user_joined(&self, group: &str, nick: &str, hostname: &str) {
        tracing::debug!(proxy = %self.name, group, nick, hostname, "proxy user_joined");
    }

    async fn user_left(&self, group: &str, nick: &str, reason: Option<&str>) {
        tracing::debug!(proxy = %self.name, group, nick, reason, "proxy user_left");
    }

    async fn group_meta_update(&self, group: &str, meta: &GroupMeta) {
        tracing::debug!(proxy = %self.name, group, ?meta, "proxy group_meta_update");
    }
}

#[cfg(test)]
pub mod test_support {
    //! A recording adapter for integration tests against `SharedUser` /
    //! `SharedGroup`.

    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Event {
        Receive {
            sender: String,
            recipient: String,
            text: String,
        },
        Joined {
            group: String,
            nick: String,
        },
        Left {
            group: String,
            nick: String,
            reason: Option<String>,
        },
        MetaUpdate {
            group: String,
            topic: Option<String>,
        },
    }

    pub struct RecordingAdapter {
        name: String,
        hostname: String,
        pub events: Mutex<Vec<Event>>,
        pub fail_receive: std::sync::atomic::AtomicBool,
    }

    impl RecordingAdapter {
        pub fn new(name: impl Into<String>, hostname: impl Into<String>) -> Self {
            Self {
                name: name.into(),
                hostname: hostname.into(),
                events: Mutex::new(Vec::new()),
                fail_receive: std::sync::atomic::AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl ProtocolAdapter for RecordingAdapter {
        fn name(&self) -> &str {
            &self.name
        }

        fn hostname(&self) -> &str {
            &self.hostname
        }

        async fn receive(&self, sender_name: &str, recipient: &str, text: &str) -> Result<(), CoreError> {
            if self.fail_receive.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(CoreError::ProtocolMismatch("forced test failure".into()));
            }
            self.events.lock().push(Event::Receive {
                sender: sender_name.to_string(),
                recipient: recipient.to_string(),
                text: text.to_string(),
            });
            Ok(())
        }

        async fn user_joined(&self, group: &str, nick: &str, _hostname: &str) {
            self.events.lock().push(Event::Joined {
                group: group.to_string(),
                nick: nick.to_string(),
            });
        }

        async fn user_left(&self, group: &str, nick: &str, reason: Option<&str>) {
            self.events.lock().push(Event::Left {
                group: group.to_string(),
                nick: nick.to_string(),
                reason: reason.map(|s| s.to_string()),
            });
        }

        async fn group_meta_update(&self, group: &str, meta: &GroupMeta) {
            self.events.lock().push(Event::MetaUpdate {
                group: group.to_string(),
                topic: meta.topic.clone(),
            });
        }
    }
}
