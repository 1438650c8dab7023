//! End-to-end login, join, message-fanout, and topic-propagation scenarios,
//! exercised against a shared in-memory Store and per-node `LoopbackBus`
//! peers standing in for the message queue.
//!
//! `slircd_core::protocol_adapter::test_support` is `#[cfg(test)]`-gated and
//! so isn't visible from an external integration-test binary; this file
//! defines its own minimal recording adapter instead.

use async_trait::async_trait;
use parking_lot::Mutex;
use slircd_core::bus::{Bus, LoopbackBus};
use slircd_core::credentials::{CredentialResolver, Credentials};
use slircd_core::error::CoreError;
use slircd_core::protocol_adapter::ProtocolAdapter;
use slircd_core::realm::Realm;
use slircd_core::store::models::GroupMeta;
use slircd_core::store::Store;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Receive { sender: String, text: String },
    Joined { nick: String },
    Left { nick: String, reason: Option<String> },
    MetaUpdate { topic: Option<String> },
}

struct RecordingAdapter {
    name: String,
    hostname: String,
    events: Mutex<Vec<Event>>,
}

impl RecordingAdapter {
    fn new(name: &str, hostname: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            hostname: hostname.to_string(),
            events: Mutex::new(Vec::new()),
        })
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
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

    async fn receive(&self, sender_name: &str, _recipient: &str, text: &str) -> Result<(), CoreError> {
        self.events.lock().push(Event::Receive {
            sender: sender_name.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn user_joined(&self, _group: &str, nick: &str, _hostname: &str) {
        self.events.lock().push(Event::Joined { nick: nick.to_string() });
    }

    async fn user_left(&self, _group: &str, nick: &str, reason: Option<&str>) {
        self.events.lock().push(Event::Left {
            nick: nick.to_string(),
            reason: reason.map(|s| s.to_string()),
        });
    }

    async fn group_meta_update(&self, _group: &str, meta: &GroupMeta) {
        self.events.lock().push(Event::MetaUpdate {
            topic: meta.topic.clone(),
        });
    }
}

async fn shared_store() -> Arc<Store> {
    Arc::new(Store::connect(":memory:").await.unwrap())
}

fn realm_on(node: &str, store: Arc<Store>, bus: Arc<dyn Bus>) -> Realm {
    Realm::new(node, store, bus, true, true, 30, Duration::from_secs(3600))
}

#[tokio::test]
async fn anonymous_login_creates_unregistered_user_and_fresh_session() {
    let store = shared_store().await;
    let bus: Arc<dyn Bus> = Arc::new(LoopbackBus::new("node-a"));
    let realm = realm_on("node-a", store.clone(), bus);

    let resolver = CredentialResolver::new(&store, true, 30);
    let nick = resolver
        .resolve(&Credentials {
            nick: "anonuser".into(),
            password: None,
        })
        .await
        .unwrap();
    assert_eq!(nick, "anonuser");

    let mind = RecordingAdapter::new("anonuser", "node-a");
    let user = realm.request_avatar(&nick, mind).await.unwrap();
    assert_eq!(user.name(), "anonuser");

    let looked_up = store.lookup_user("anonuser").await.unwrap().unwrap();
    assert!(!looked_up.user.registered);

    let session = store.lookup_user_session("anonuser").await.unwrap().unwrap();
    let now = chrono::Utc::now().timestamp();
    assert!(session.is_fresh(now, 30));
}

#[tokio::test]
async fn duplicate_nick_is_rejected_as_already_logged_in() {
    let store = shared_store().await;
    let bus_a: Arc<dyn Bus> = Arc::new(LoopbackBus::new("node-a"));

    let resolver = CredentialResolver::new(&store, true, 30);
    resolver
        .resolve(&Credentials {
            nick: "anonuser".into(),
            password: None,
        })
        .await
        .unwrap();

    let realm_a = realm_on("node-a", store.clone(), bus_a);
    let mind_a = RecordingAdapter::new("anonuser", "node-a");
    realm_a.request_avatar("anonuser", mind_a).await.unwrap();

    // node B's resolver consults the same shared Store and sees a fresh
    // session (the immediate heartbeat from `logged_in`): the login
    // attempt must fail before it ever reaches a Realm.
    let resolver_b = CredentialResolver::new(&store, true, 30);
    let err = resolver_b
        .resolve(&Credentials {
            nick: "anonuser".into(),
            password: None,
        })
        .await;
    assert!(matches!(err, Err(CoreError::AlreadyLoggedIn(_))));
}

#[tokio::test]
async fn cross_node_channel_message_reaches_remote_member_not_sender() {
    let store = shared_store().await;
    let network = LoopbackBus::new("node-a");
    let bus_a: Arc<dyn Bus> = Arc::new(network.peer("node-a"));
    let bus_b: Arc<dyn Bus> = Arc::new(network.peer("node-b"));

    let realm_a = realm_on("node-a", store.clone(), bus_a);
    let realm_b = realm_on("node-b", store.clone(), bus_b);

    let john_mind = RecordingAdapter::new("john", "node-a");
    realm_a.request_avatar("john", john_mind.clone()).await.unwrap();
    let jane_mind = RecordingAdapter::new("jane", "node-b");
    realm_b.request_avatar("jane", jane_mind.clone()).await.unwrap();

    let john = realm_a.lookup_user("john").await.unwrap();
    john.join(&realm_a, "t").await.unwrap();
    let jane = realm_b.lookup_user("jane").await.unwrap();
    jane.join(&realm_b, "t").await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;

    let group_a = realm_a.lookup_group("t").unwrap();
    group_a.receive("john", "hi").await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(jane_mind
        .events()
        .iter()
        .any(|e| matches!(e, Event::Receive { sender, text } if sender == "john" && text == "hi")));
    assert!(!john_mind.events().iter().any(|e| matches!(e, Event::Receive { .. })));
}

#[tokio::test]
async fn join_propagates_to_existing_local_member() {
    let store = shared_store().await;
    let bus: Arc<dyn Bus> = Arc::new(LoopbackBus::new("node-a"));
    let realm = realm_on("node-a", store.clone(), bus);

    let john_mind = RecordingAdapter::new("john", "node-a");
    realm.request_avatar("john", john_mind.clone()).await.unwrap();
    let john = realm.lookup_user("john").await.unwrap();
    john.join(&realm, "t").await.unwrap();

    let jane_mind = RecordingAdapter::new("jane", "node-a");
    realm.request_avatar("jane", jane_mind).await.unwrap();
    let jane = realm.lookup_user("jane").await.unwrap();
    jane.join(&realm, "t").await.unwrap();

    let joins: Vec<_> = john_mind
        .events()
        .into_iter()
        .filter(|e| matches!(e, Event::Joined { nick } if nick == "jane"))
        .collect();
    assert_eq!(joins.len(), 1);

    let group = realm.lookup_group("t").unwrap();
    assert!(group.iterusers().contains_key("jane"));
}

#[tokio::test]
async fn topic_set_converges_to_remote_group() {
    let store = shared_store().await;
    let network = LoopbackBus::new("node-a");
    let bus_a: Arc<dyn Bus> = Arc::new(network.peer("node-a"));
    let bus_b: Arc<dyn Bus> = Arc::new(network.peer("node-b"));

    let realm_a = realm_on("node-a", store.clone(), bus_a);
    let realm_b = realm_on("node-b", store.clone(), bus_b);

    let john_mind = RecordingAdapter::new("john", "node-a");
    realm_a.request_avatar("john", john_mind).await.unwrap();
    let john = realm_a.lookup_user("john").await.unwrap();
    john.join(&realm_a, "t").await.unwrap();

    let jane_mind = RecordingAdapter::new("jane", "node-b");
    realm_b.request_avatar("jane", jane_mind.clone()).await.unwrap();
    let jane = realm_b.lookup_user("jane").await.unwrap();
    jane.join(&realm_b, "t").await.unwrap();

    let group_a = realm_a.lookup_group("t").unwrap();
    group_a.set_metadata("hi", "john").await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;

    let group_b = realm_b.lookup_group("t").unwrap();
    assert_eq!(group_b.meta().topic.as_deref(), Some("hi"));

    assert!(jane_mind
        .events()
        .iter()
        .any(|e| matches!(e, Event::MetaUpdate { topic } if topic.as_deref() == Some("hi"))));
}

#[tokio::test]
async fn logout_parts_all_groups_and_propagates_to_remote_member() {
    let store = shared_store().await;
    let network = LoopbackBus::new("node-a");
    let bus_a: Arc<dyn Bus> = Arc::new(network.peer("node-a"));
    let bus_b: Arc<dyn Bus> = Arc::new(network.peer("node-b"));

    let realm_a = realm_on("node-a", store.clone(), bus_a);
    let realm_b = realm_on("node-b", store.clone(), bus_b);

    let john_mind = RecordingAdapter::new("john", "node-a");
    realm_a.request_avatar("john", john_mind).await.unwrap();
    let john = realm_a.lookup_user("john").await.unwrap();
    john.join(&realm_a, "t").await.unwrap();

    let jane_mind = RecordingAdapter::new("jane", "node-b");
    realm_b.request_avatar("jane", jane_mind.clone()).await.unwrap();
    let jane = realm_b.lookup_user("jane").await.unwrap();
    jane.join(&realm_b, "t").await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;

    john.logout(&realm_a).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(jane_mind
        .events()
        .iter()
        .any(|e| matches!(e, Event::Left { nick, reason } if nick == "john" && reason.as_deref() == Some("logout"))));

    // The group's last local member on node A parted, so node A's directory
    // must have disposed of its `SharedGroup` entry rather than leaking it.
    assert!(realm_a.lookup_group("t").is_none());

    let session = store.lookup_user_session("john").await.unwrap();
    assert!(session.is_none());
}

#[tokio::test]
async fn store_connects_to_an_on_disk_sqlite_fixture() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("slircd-test.db");
    let store = Store::connect(path.to_str().unwrap()).await.unwrap();

    store
        .create_user("diskuser", None, None, false, Default::default())
        .await
        .unwrap();
    let looked_up = store.lookup_user("diskuser").await.unwrap().unwrap();
    assert_eq!(looked_up.user.id, "diskuser");

    drop(store);
    assert!(path.exists());
}
