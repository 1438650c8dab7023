//! Directory of local users and groups; lookups that promote remote
//! identities to proxies; factory for controllers; login orchestration.

use crate::bus::Bus;
use crate::error::CoreError;
use crate::protocol_adapter::ProtocolAdapter;
use crate::shared_group::SharedGroup;
use crate::shared_user::SharedUser;
use crate::store::models::GroupType;
use crate::store::Store;
use crate::validation::normalize;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

pub struct Realm {
    hostname: String,
    store: Arc<Store>,
    bus: Arc<dyn Bus>,
    users: DashMap<String, Arc<SharedUser>>,
    groups: DashMap<String, Arc<SharedGroup>>,
    create_user_on_request: bool,
    create_group_on_request: bool,
    session_ttl_secs: i64,
    heartbeat_period: Duration,
}

impl Realm {
    pub fn new(
        hostname: impl Into<String>,
        store: Arc<Store>,
        bus: Arc<dyn Bus>,
        create_user_on_request: bool,
        create_group_on_request: bool,
        session_ttl_secs: i64,
        heartbeat_period: Duration,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            store,
            bus,
            users: DashMap::new(),
            groups: DashMap::new(),
            create_user_on_request,
            create_group_on_request,
            session_ttl_secs,
            heartbeat_period,
        }
    }

    /// Resolves or creates the `SharedUser` for `nick`, binds `session` to
    /// it, and starts its heartbeat timers. Fails `AlreadyLoggedIn` if a
    /// real local session is already bound (credential resolution should
    /// normally have caught this first; this is a second guard at the
    /// materialization boundary). A cached proxy for `nick` does not count:
    /// its stub session only means the nick was looked up before, not that
    /// it's logged in on this node.
    pub async fn request_avatar(
        &self,
        nick: &str,
        session: Arc<dyn ProtocolAdapter>,
    ) -> Result<Arc<SharedUser>, CoreError> {
        let nick = normalize(nick);

        // Only a real local entry can already be logged in; a cached proxy
        // (`is_local() == false`) is just a lookup artifact and must not
        // block — or be reused for — a genuine local login.
        let existing_local = self.users.get(&nick).filter(|u| u.is_local()).map(|u| u.clone());

        if let Some(existing) = &existing_local
            && existing.is_logged_in()
        {
            return Err(CoreError::AlreadyLoggedIn(nick));
        }

        let user = match existing_local {
            Some(u) => u,
            None => {
                let u = SharedUser::new(nick.clone(), self.store.clone(), self.bus.clone()).await?;
                self.users.insert(nick.clone(), u.clone());
                u
            }
        };

        user.logged_in(session, self.heartbeat_period).await?;
        Ok(user)
    }

    /// Local `SharedUser` if present; otherwise a proxy materialized from a
    /// Store row with a fresh session; otherwise `NoSuchUser`.
    pub async fn lookup_user(&self, nick: &str) -> Result<Arc<SharedUser>, CoreError> {
        let nick = normalize(nick);

        if let Some(user) = self.users.get(&nick) {
            return Ok(user.clone());
        }

        let looked_up = self.store.lookup_user(&nick).await?;
        let Some(looked_up) = looked_up else {
            return Err(CoreError::NoSuchUser(nick));
        };

        let now = chrono::Utc::now().timestamp();
        let session_is_fresh = looked_up
            .session
            .map(|s| s.is_fresh(now, self.session_ttl_secs))
            .unwrap_or(false);
        if !session_is_fresh {
            return Err(CoreError::NoSuchUser(nick));
        }

        let proxy = SharedUser::proxy(nick.clone(), &self.hostname, self.store.clone(), self.bus.clone());
        self.users.insert(nick, proxy.clone());
        Ok(proxy)
    }

    /// Local only: does not materialize remote groups.
    pub fn lookup_group(&self, name: &str) -> Option<Arc<SharedGroup>> {
        self.groups.get(&normalize(name)).map(|g| g.clone())
    }

    /// If `create_group_on_request`, attempts `create_group` first,
    /// recovering `DuplicateGroup` into a lookup; otherwise a plain lookup.
    pub async fn get_group(&self, name: &str) -> Result<Arc<SharedGroup>, CoreError> {
        let id = normalize(name);
        if self.create_group_on_request {
            match self.create_group(&id).await {
                Ok(group) => Ok(group),
                Err(CoreError::DuplicateGroup(_)) => {
                    self.lookup_group(&id).ok_or_else(|| CoreError::NoSuchGroup(id))
                }
                Err(e) => Err(e),
            }
        } else {
            self.lookup_group(&id).ok_or_else(|| CoreError::NoSuchGroup(id))
        }
    }

    /// Ensures a Group row exists (type `public`) and constructs a
    /// `SharedGroup`. `DuplicateGroup` if already materialized locally.
    pub async fn create_group(&self, name: &str) -> Result<Arc<SharedGroup>, CoreError> {
        let id = normalize(name);
        if self.groups.contains_key(&id) {
            return Err(CoreError::DuplicateGroup(id));
        }

        self.store.create_group(&id, GroupType::Public).await?;
        let group = SharedGroup::new(id.clone(), self.store.clone(), self.bus.clone()).await?;
        self.groups.insert(id, group.clone());
        Ok(group)
    }

    /// Drops this node's `SharedGroup` entry once its last local member has
    /// parted (the group itself already unsubscribed and stopped its
    /// observer tasks inside `SharedGroup::remove`). A no-op if the group
    /// isn't cached, isn't actually empty, or has gained a new local member
    /// since the caller last checked.
    pub fn dispose_group(&self, name: &str) {
        let id = normalize(name);
        if let Some(group) = self.groups.get(&id)
            && !group.is_empty()
        {
            return;
        }
        self.groups.remove(&id);
    }

    /// Constructs a `SharedUser` without a Store write: creation of the row
    /// itself happens through the credential path.
    pub async fn create_user(&self, nick: &str) -> Result<Arc<SharedUser>, CoreError> {
        let id = normalize(nick);
        if self.users.contains_key(&id) {
            return Err(CoreError::DuplicateUser(id));
        }
        let user = SharedUser::new(id.clone(), self.store.clone(), self.bus.clone()).await?;
        self.users.insert(id, user.clone());
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LoopbackBus;
    use crate::protocol_adapter::test_support::RecordingAdapter;

    async fn realm() -> Realm {
        let store = Arc::new(Store::connect(":memory:").await.unwrap());
        let bus: Arc<dyn Bus> = Arc::new(LoopbackBus::new("node-a"));
        Realm::new("node-a", store, bus, true, true, 30, Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn request_avatar_then_second_request_is_already_logged_in() {
        let realm = realm().await;
        let mind = Arc::new(RecordingAdapter::new("jane", "node-a"));
        realm.request_avatar("jane", mind.clone()).await.unwrap();

        let mind2 = Arc::new(RecordingAdapter::new("jane", "node-a"));
        let err = realm.request_avatar("jane", mind2).await;
        assert!(matches!(err, Err(CoreError::AlreadyLoggedIn(_))));
    }

    #[tokio::test]
    async fn cached_proxy_does_not_block_a_real_local_login() {
        let realm = realm().await;
        realm
            .store
            .create_user("jane", None, None, false, Default::default())
            .await
            .unwrap();
        realm.store.heartbeat_user_session("jane").await.unwrap();

        // Materializes a proxy: `is_bound()` is true (stub mind) but
        // `is_logged_in()` must be false, since nothing ever bound a real
        // session here.
        let proxy = realm.lookup_user("jane").await.unwrap();
        assert!(proxy.is_bound());
        assert!(!proxy.is_logged_in());

        let mind = Arc::new(RecordingAdapter::new("jane", "node-a"));
        let user = realm.request_avatar("jane", mind).await.unwrap();
        assert!(user.is_logged_in());

        let mind2 = Arc::new(RecordingAdapter::new("jane", "node-a"));
        let err = realm.request_avatar("jane", mind2).await;
        assert!(matches!(err, Err(CoreError::AlreadyLoggedIn(_))));
    }

    #[tokio::test]
    async fn get_group_creates_then_recovers_duplicate() {
        let realm = realm().await;
        let g1 = realm.get_group("general").await.unwrap();
        let g2 = realm.get_group("general").await.unwrap();
        assert_eq!(g1.name(), g2.name());
    }

    #[tokio::test]
    async fn lookup_user_missing_is_no_such_user() {
        let realm = realm().await;
        let err = realm.lookup_user("ghost").await;
        assert!(matches!(err, Err(CoreError::NoSuchUser(_))));
    }
}
