//! Per-logged-in-user controller: owns the session heartbeat, the user's
//! own Bus topic, and message send fan-out.

use crate::bus::Bus;
use crate::error::CoreError;
use crate::message::{BusMessage, MessageSender};
use crate::protocol_adapter::ProtocolAdapter;
use crate::store::Store;
use crate::validation::normalize;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::warn;

struct SharedUserInner {
    mind: Option<Arc<dyn ProtocolAdapter>>,
    groups: HashSet<String>,
    last_message: Option<i64>,
    session_heartbeat: Option<JoinHandle<()>>,
    group_heartbeat: Option<JoinHandle<()>>,
}

impl Default for SharedUserInner {
    fn default() -> Self {
        Self {
            mind: None,
            groups: HashSet::new(),
            last_message: None,
            session_heartbeat: None,
            group_heartbeat: None,
        }
    }
}

pub struct SharedUser {
    name: String,
    store: Arc<Store>,
    bus: Arc<dyn Bus>,
    /// True for a real, locally-hosted session (`new`); false for a proxy
    /// standing in for a nick whose session lives on another node (`proxy`).
    /// A proxy's `mind` is always `Some` (a `StubAdapter`), so this is what
    /// actually distinguishes "logged in here" from "just a cache entry".
    local: bool,
    inner: Mutex<SharedUserInner>,
}

impl SharedUser {
    /// Constructs a full, locally-hosted `SharedUser` and subscribes it to
    /// its own topic with `receive_remote` as handler.
    pub async fn new(
        nick: impl Into<String>,
        store: Arc<Store>,
        bus: Arc<dyn Bus>,
    ) -> Result<Arc<Self>, CoreError> {
        let name = normalize(&nick.into());
        let shared = Arc::new(Self {
            name: name.clone(),
            store,
            bus: bus.clone(),
            local: true,
            inner: Mutex::new(SharedUserInner::default()),
        });

        let weak: Weak<Self> = Arc::downgrade(&shared);
        bus.subscribe(
            &name,
            Arc::new(move |body| {
                let weak = weak.clone();
                Box::pin(async move {
                    match weak.upgrade() {
                        Some(user) => user.receive_remote(body).await,
                        None => true,
                    }
                })
            }),
        )
        .await?;

        Ok(shared)
    }

    /// A placeholder for a nickname whose client connection lives on another
    /// node: same object shape, but with a stub session that only logs
    /// receipt, and no Bus subscription of its own (the owning node's
    /// `SharedUser` already has one).
    pub fn proxy(nick: impl Into<String>, hostname: &str, store: Arc<Store>, bus: Arc<dyn Bus>) -> Arc<Self> {
        let name = normalize(&nick.into());
        let stub = Arc::new(crate::protocol_adapter::StubAdapter::new(name.clone(), hostname.to_string()));
        Arc::new(Self {
            name,
            store,
            bus,
            local: false,
            inner: Mutex::new(SharedUserInner {
                mind: Some(stub),
                ..Default::default()
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_bound(&self) -> bool {
        self.inner.lock().mind.is_some()
    }

    /// True only for a real local session bound via `logged_in`; a proxy
    /// always has a stub `mind` and so is never "logged in" by this check,
    /// even though `is_bound()` is true for it.
    pub fn is_logged_in(&self) -> bool {
        self.local && self.inner.lock().mind.is_some()
    }

    /// True for a real, locally-hosted session; false for a proxy cache
    /// entry standing in for a nick whose session lives elsewhere.
    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn joined_groups(&self) -> Vec<String> {
        self.inner.lock().groups.iter().cloned().collect()
    }

    /// Binds the protocol session, heartbeats immediately, and starts the
    /// session and group-presence heartbeat timers.
    pub async fn logged_in(
        self: &Arc<Self>,
        session: Arc<dyn ProtocolAdapter>,
        heartbeat_period: Duration,
    ) -> Result<(), CoreError> {
        {
            let mut inner = self.inner.lock();
            inner.mind = Some(session);
        }

        self.store.heartbeat_user_session(&self.name).await?;

        let store = self.store.clone();
        let name = self.name.clone();
        let session_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_period);
            loop {
                ticker.tick().await;
                if let Err(e) = store.heartbeat_user_session(&name).await {
                    warn!(user = %name, error = %e, "session heartbeat failed");
                }
            }
        });

        let store = self.store.clone();
        let weak: Weak<Self> = Arc::downgrade(self);
        let group_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_period);
            loop {
                ticker.tick().await;
                let Some(this) = weak.upgrade() else { break };
                for group in this.joined_groups() {
                    if let Err(e) = store.heartbeat_user_in_group(&this.name, &group).await {
                        warn!(user = %this.name, group = %group, error = %e, "group presence heartbeat failed");
                    }
                }
            }
        });

        let mut inner = self.inner.lock();
        if let Some(old) = inner.session_heartbeat.replace(session_task) {
            old.abort();
        }
        if let Some(old) = inner.group_heartbeat.replace(group_task) {
            old.abort();
        }
        drop(inner);
        Ok(())
    }

    /// Stops the timers, parts every joined group, and deletes the session
    /// row. `realm` is needed to resolve joined group names to controllers:
    /// cross-references are names, resolved on demand rather than held.
    pub async fn logout(self: &Arc<Self>, realm: &crate::realm::Realm) -> Result<(), CoreError> {
        {
            let mut inner = self.inner.lock();
            if let Some(task) = inner.session_heartbeat.take() {
                task.abort();
            }
            if let Some(task) = inner.group_heartbeat.take() {
                task.abort();
            }
        }

        for group in self.joined_groups() {
            self.leave(realm, &group, Some("logout")).await?;
        }

        self.store.remove_user_session(&self.name).await?;
        self.inner.lock().mind = None;
        Ok(())
    }

    /// Publishes on `recipient`'s topic and delivers to the local shard
    /// directly, synchronously within the sender's call, rather than
    /// round-tripping the queue.
    pub async fn send(self: &Arc<Self>, recipient: &Arc<SharedUser>, text: &str) -> Result<(), CoreError> {
        let msg = BusMessage::Privmsg {
            sender: MessageSender {
                name: self.name.clone(),
                hostname: self.hostname(),
            },
            recipient: recipient.name.clone(),
            text: text.to_string(),
        };
        self.bus
            .publish(&recipient.name, serde_json::to_value(&msg).unwrap())
            .await;
        self.store.touch_last_message(&self.name).await?;
        self.inner.lock().last_message = Some(chrono::Utc::now().timestamp());

        recipient.receive_local(&self.name, text).await;
        Ok(())
    }

    /// Dispatches on `msg_body.type`; only `privmsg` is meaningful to a
    /// user topic. Acknowledges unconditionally.
    async fn receive_remote(self: &Arc<Self>, body: serde_json::Value) -> bool {
        match serde_json::from_value::<BusMessage>(body) {
            Ok(BusMessage::Privmsg { sender, text, .. }) => {
                self.receive_local(&sender.name, &text).await;
            }
            Ok(_) => {} // join/part are not meaningful on a user topic
            Err(e) => warn!(user = %self.name, error = %e, "malformed message on user topic"),
        }
        true
    }

    async fn receive_local(&self, sender_name: &str, text: &str) {
        let mind = self.inner.lock().mind.clone();
        if let Some(mind) = mind
            && let Err(e) = mind.receive(sender_name, &self.name, text).await
        {
            warn!(user = %self.name, error = %e, "protocol session rejected delivery");
        }
    }

    /// Relays a channel message from `SharedGroup::receive` to the bound
    /// protocol session; propagates the adapter's error so the group can
    /// remove a misbehaving session.
    pub async fn notify_group_message(&self, group: &str, sender_name: &str, text: &str) -> Result<(), CoreError> {
        let mind = self.inner.lock().mind.clone();
        match mind {
            Some(mind) => mind.receive(sender_name, group, text).await,
            None => Ok(()),
        }
    }

    pub async fn notify_user_joined(&self, group: &str, nick: &str, hostname: &str) {
        let mind = self.inner.lock().mind.clone();
        if let Some(mind) = mind {
            mind.user_joined(group, nick, hostname).await;
        }
    }

    pub async fn notify_user_left(&self, group: &str, nick: &str, reason: Option<&str>) {
        let mind = self.inner.lock().mind.clone();
        if let Some(mind) = mind {
            mind.user_left(group, nick, reason).await;
        }
    }

    pub async fn notify_group_meta_update(&self, group: &str, meta: &crate::store::models::GroupMeta) {
        let mind = self.inner.lock().mind.clone();
        if let Some(mind) = mind {
            mind.group_meta_update(group, meta).await;
        }
    }

    fn hostname(&self) -> String {
        self.inner
            .lock()
            .mind
            .as_ref()
            .map(|m| m.hostname().to_string())
            .unwrap_or_default()
    }

    /// Joins `group`: delegates to the group's `add`, records membership
    /// locally, and heartbeats presence in the Store.
    pub async fn join(self: &Arc<Self>, realm: &crate::realm::Realm, group: &str) -> Result<(), CoreError> {
        let group_handle = realm.get_group(group).await?;
        let hostname = self.hostname();
        group_handle.add(self.clone(), &hostname).await?;
        self.inner.lock().groups.insert(normalize(group));
        self.store.heartbeat_user_in_group(&self.name, group).await
    }

    /// Leaves `group`: delegates to the group's `remove`, then updates local
    /// membership and the Store.
    pub async fn leave(
        self: &Arc<Self>,
        realm: &crate::realm::Realm,
        group: &str,
        reason: Option<&str>,
    ) -> Result<(), CoreError> {
        if let Some(group_handle) = realm.lookup_group(group) {
            group_handle.remove(self, reason).await?;
            if group_handle.is_empty() {
                realm.dispose_group(group);
            }
        }
        self.inner.lock().groups.remove(&normalize(group));
        self.store.remove_user_from_group(&self.name, group).await
    }
}
