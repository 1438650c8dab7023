//! Per-channel controller on one node: local member cache, meta cache,
//! topic subscription, local multicast.

use crate::bus::Bus;
use crate::error::CoreError;
use crate::message::{BusMessage, MessageSender};
use crate::shared_user::SharedUser;
use crate::store::models::{ChangeEvent, Group, GroupMeta, GroupState};
use crate::store::Store;
use crate::validation::normalize;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::warn;

struct SharedGroupInner {
    users: HashMap<String, i64>,
    local_sessions: HashMap<String, Arc<SharedUser>>,
    meta: GroupMeta,
    state_observer: Option<JoinHandle<()>>,
    meta_observer: Option<JoinHandle<()>>,
}

pub struct SharedGroup {
    name: String,
    store: Arc<Store>,
    bus: Arc<dyn Bus>,
    inner: Mutex<SharedGroupInner>,
}

impl Drop for SharedGroup {
    fn drop(&mut self) {
        // Cancellation is closing the change-feed's underlying connection;
        // dropping the observer tasks' JoinHandles aborts them.
        let mut inner = self.inner.lock();
        if let Some(t) = inner.state_observer.take() {
            t.abort();
        }
        if let Some(t) = inner.meta_observer.take() {
            t.abort();
        }
    }
}

impl SharedGroup {
    /// Subscribes to the group's Bus topic, loads meta/state from the
    /// Store, and launches the `observeMeta` / `observeState` tasks.
    pub async fn new(name: impl Into<String>, store: Arc<Store>, bus: Arc<dyn Bus>) -> Result<Arc<Self>, CoreError> {
        let name = normalize(&name.into());
        let looked_up = store.lookup_group(&name).await?;
        let (meta, users) = match looked_up {
            Some(g) => (g.group.meta, g.users),
            None => (GroupMeta::default(), HashMap::new()),
        };

        let shared = Arc::new(Self {
            name: name.clone(),
            store: store.clone(),
            bus: bus.clone(),
            inner: Mutex::new(SharedGroupInner {
                users,
                local_sessions: HashMap::new(),
                meta,
                state_observer: None,
                meta_observer: None,
            }),
        });

        let weak: Weak<Self> = Arc::downgrade(&shared);
        bus.subscribe(
            &name,
            Arc::new(move |body| {
                let weak = weak.clone();
                Box::pin(async move {
                    match weak.upgrade() {
                        Some(group) => group.receive_remote(body).await,
                        None => true,
                    }
                })
            }),
        )
        .await?;

        shared.spawn_observers();

        Ok(shared)
    }

    fn spawn_observers(self: &Arc<Self>) {
        let weak_state: Weak<Self> = Arc::downgrade(self);
        let mut state_stream = Box::pin(self.store.observe_group_state(&self.name));
        let state_task = tokio::spawn(async move {
            while let Some(event) = state_stream.next().await {
                let Some(this) = weak_state.upgrade() else { break };
                match event {
                    Ok(ChangeEvent { new_val: Some(state), .. }) => {
                        this.inner.lock().users = state.users;
                    }
                    Ok(ChangeEvent { new_val: None, .. }) => {
                        this.inner.lock().users.clear();
                    }
                    Err(e) => {
                        warn!(group = %this.name, error = %e, "group state feed disconnected");
                        break;
                    }
                }
            }
        });

        let weak_meta: Weak<Self> = Arc::downgrade(self);
        let mut meta_stream = Box::pin(self.store.observe_group_meta(&self.name));
        let meta_task = tokio::spawn(async move {
            while let Some(event) = meta_stream.next().await {
                let Some(this) = weak_meta.upgrade() else { break };
                match event {
                    Ok(ChangeEvent { new_val: Some(group), .. }) => {
                        this.inner.lock().meta = group.meta.clone();
                        this.notify_meta_update(&group).await;
                    }
                    Ok(ChangeEvent { new_val: None, .. }) => {}
                    Err(e) => {
                        warn!(group = %this.name, error = %e, "group meta feed disconnected");
                        break;
                    }
                }
            }
        });

        let mut inner = self.inner.lock();
        inner.state_observer = Some(state_task);
        inner.meta_observer = Some(meta_task);
    }

    async fn notify_meta_update(&self, group: &Group) {
        let sessions: Vec<_> = self.inner.lock().local_sessions.values().cloned().collect();
        for session in sessions {
            session.notify_group_meta_update(&self.name, &group.meta).await;
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn meta(&self) -> GroupMeta {
        self.inner.lock().meta.clone()
    }

    /// Union membership, authoritative cluster-wide.
    pub fn iterusers(&self) -> HashMap<String, i64> {
        self.inner.lock().users.clone()
    }

    /// True once the last local member has parted. Callers holding this
    /// group out of a realm's cache should dispose of it when this flips.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().local_sessions.is_empty()
    }

    /// Unsubscribes from the group's Bus topic and stops the change-feed
    /// observer tasks. Called once `local_sessions` goes empty; idempotent,
    /// since `Drop` would otherwise abort the same (already-`None`) handles.
    async fn dispose(&self) {
        self.bus.unsubscribe(&self.name).await;
        let mut inner = self.inner.lock();
        if let Some(t) = inner.state_observer.take() {
            t.abort();
        }
        if let Some(t) = inner.meta_observer.take() {
            t.abort();
        }
    }

    pub async fn add(self: &Arc<Self>, session: Arc<SharedUser>, hostname: &str) -> Result<(), CoreError> {
        let nick = session.name().to_string();
        {
            let mut inner = self.inner.lock();
            if inner.local_sessions.contains_key(&nick) {
                return Ok(());
            }
            inner.local_sessions.insert(nick.clone(), session);
        }

        self.notify_add(&nick, hostname).await;

        let msg = BusMessage::Join {
            sender: MessageSender {
                name: nick,
                hostname: hostname.to_string(),
            },
        };
        self.bus.publish(&self.name, serde_json::to_value(&msg).unwrap()).await;
        Ok(())
    }

    pub async fn remove(self: &Arc<Self>, session: &Arc<SharedUser>, reason: Option<&str>) -> Result<(), CoreError> {
        let nick = session.name().to_string();
        let (removed, now_empty) = {
            let mut inner = self.inner.lock();
            let removed = inner.local_sessions.remove(&nick);
            (removed, inner.local_sessions.is_empty())
        };
        if removed.is_none() {
            warn!(group = %self.name, nick = %nick, "remove called for session not present");
            return Ok(());
        }

        self.notify_remove(&nick, reason).await;

        let msg = BusMessage::Part {
            sender: MessageSender {
                name: nick,
                hostname: String::new(),
            },
            reason: reason.map(|s| s.to_string()),
        };
        self.bus.publish(&self.name, serde_json::to_value(&msg).unwrap()).await;

        if now_empty {
            self.dispose().await;
        }
        Ok(())
    }

    async fn notify_add(&self, nick: &str, hostname: &str) {
        let others: Vec<_> = self
            .inner
            .lock()
            .local_sessions
            .iter()
            .filter(|(n, _)| n.as_str() != nick)
            .map(|(_, s)| s.clone())
            .collect();
        for session in others {
            session.notify_user_joined(&self.name, nick, hostname).await;
        }
    }

    async fn notify_remove(&self, nick: &str, reason: Option<&str>) {
        let others: Vec<_> = self
            .inner
            .lock()
            .local_sessions
            .iter()
            .filter(|(n, _)| n.as_str() != nick)
            .map(|(_, s)| s.clone())
            .collect();
        for session in others {
            session.notify_user_left(&self.name, nick, reason).await;
        }
    }

    /// Multicasts `text` from `sender_name` to every local session except
    /// the sender. A session whose delivery errors is removed from the group
    /// with the error as the part reason.
    pub async fn receive(self: &Arc<Self>, sender_name: &str, text: &str) -> Result<(), CoreError> {
        let targets: Vec<_> = self
            .inner
            .lock()
            .local_sessions
            .iter()
            .filter(|(n, _)| n.as_str() != sender_name)
            .map(|(_, s)| s.clone())
            .collect();

        for session in targets {
            if let Err(e) = session.notify_group_message(&self.name, sender_name, text).await {
                warn!(group = %self.name, nick = %session.name(), error = %e, "delivery failed, removing session");
                let _ = self.remove(&session, Some(&e.to_string())).await;
            }
        }
        Ok(())
    }

    /// Dispatches on `msg_body.type`. `privmsg` fans out locally with no
    /// republish; `join`/`part` only notify local sessions.
    async fn receive_remote(self: &Arc<Self>, body: serde_json::Value) -> bool {
        match serde_json::from_value::<BusMessage>(body) {
            Ok(BusMessage::Privmsg { sender, text, .. }) => {
                let _ = self.receive(&sender.name, &text).await;
            }
            Ok(BusMessage::Join { sender }) => {
                self.notify_add(&sender.name, &sender.hostname).await;
            }
            Ok(BusMessage::Part { sender, reason }) => {
                self.notify_remove(&sender.name, reason.as_deref()).await;
            }
            Err(e) => warn!(group = %self.name, error = %e, "malformed message on group topic"),
        }
        true
    }

    /// Write-through topic update; the change feed drives the in-memory
    /// update and local notifications.
    pub async fn set_metadata(&self, topic: &str, author: &str) -> Result<(), CoreError> {
        self.store.set_group_topic(&self.name, topic, author).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LoopbackBus;
    use crate::protocol_adapter::test_support::RecordingAdapter;
    use crate::store::models::GroupType;
    use std::time::Duration;

    async fn fixture() -> (Arc<Store>, Arc<dyn Bus>) {
        let store = Arc::new(Store::connect(":memory:").await.unwrap());
        let bus: Arc<dyn Bus> = Arc::new(LoopbackBus::new("node-a"));
        (store, bus)
    }

    #[tokio::test]
    async fn add_notifies_existing_members_and_not_self() {
        let (store, bus) = fixture().await;
        store.create_group("general", GroupType::Public).await.unwrap();
        let group = SharedGroup::new("general", store.clone(), bus.clone()).await.unwrap();

        let john = SharedUser::new("john", store.clone(), bus.clone()).await.unwrap();
        let john_mind = Arc::new(RecordingAdapter::new("john", "node-a"));
        john.logged_in(john_mind.clone(), Duration::from_secs(3600)).await.unwrap();
        group.add(john.clone(), "node-a").await.unwrap();
        assert!(john_mind.events.lock().is_empty()); // alone, nobody to notify

        let jane = SharedUser::new("jane", store.clone(), bus.clone()).await.unwrap();
        let jane_mind = Arc::new(RecordingAdapter::new("jane", "node-a"));
        jane.logged_in(jane_mind.clone(), Duration::from_secs(3600)).await.unwrap();
        group.add(jane.clone(), "node-a").await.unwrap();

        let events = john_mind.events.lock();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn receive_excludes_sender() {
        let (store, bus) = fixture().await;
        store.create_group("general", GroupType::Public).await.unwrap();
        let group = SharedGroup::new("general", store.clone(), bus.clone()).await.unwrap();

        let john = SharedUser::new("john", store.clone(), bus.clone()).await.unwrap();
        let john_mind = Arc::new(RecordingAdapter::new("john", "node-a"));
        john.logged_in(john_mind.clone(), Duration::from_secs(3600)).await.unwrap();
        group.add(john.clone(), "node-a").await.unwrap();

        group.receive("john", "hi").await.unwrap();
        assert!(john_mind.events.lock().is_empty());
    }

    #[tokio::test]
    async fn failed_delivery_removes_session() {
        let (store, bus) = fixture().await;
        store.create_group("general", GroupType::Public).await.unwrap();
        let group = SharedGroup::new("general", store.clone(), bus.clone()).await.unwrap();

        let john = SharedUser::new("john", store.clone(), bus.clone()).await.unwrap();
        let john_mind = Arc::new(RecordingAdapter::new("john", "node-a"));
        john_mind.fail_receive.store(true, std::sync::atomic::Ordering::SeqCst);
        john.logged_in(john_mind.clone(), Duration::from_secs(3600)).await.unwrap();
        group.add(john.clone(), "node-a").await.unwrap();

        let jane = SharedUser::new("jane", store.clone(), bus.clone()).await.unwrap();
        let jane_mind = Arc::new(RecordingAdapter::new("jane", "node-a"));
        jane.logged_in(jane_mind.clone(), Duration::from_secs(3600)).await.unwrap();
        group.add(jane.clone(), "node-a").await.unwrap();

        group.receive("jane", "hi").await.unwrap();
        assert!(!group.inner.lock().local_sessions.contains_key("john"));
    }
}
