//! Strongly typed forms of the Store's documents. Rows are decoded into
//! these at the Store boundary; nothing outside this module touches the
//! underlying SQL row shapes or JSON blobs directly.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// A directory entry. `registered = false` marks a lazily created anonymous
/// reservation whose password is meaningless.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: Option<String>,
    pub password: Option<String>,
    pub registered: bool,
    pub permissions: HashMap<String, HashSet<String>>,
}

/// Existence of this row means the nickname is currently owned by some node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserSession {
    pub session_start: i64,
    pub last_heartbeat: i64,
    pub last_message: Option<i64>,
}

impl UserSession {
    /// A session is fresh if its heartbeat is within `ttl_secs` of `now`.
    pub fn is_fresh(&self, now: i64, ttl_secs: i64) -> bool {
        now - self.last_heartbeat < ttl_secs
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupType {
    Public,
    Private,
}

impl GroupType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
        }
    }
}

impl std::str::FromStr for GroupType {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(Self::Public),
            "private" => Ok(Self::Private),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GroupMeta {
    pub topic: Option<String>,
    pub topic_author: Option<String>,
    pub topic_time: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMessage {
    pub sender: String,
    pub time: i64,
    pub text: String,
}

/// Metadata is authoritative in the store; membership lives in
/// [`GroupState`] so roster churn doesn't rewrite this document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub group_type: GroupType,
    pub meta: GroupMeta,
    pub messages: Vec<GroupMessage>,
}

/// Hot presence: a nickname with a fresh heartbeat is a member; a stale entry
/// is garbage to be swept.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GroupState {
    pub users: HashMap<String, i64>,
}

/// Result of `Store::lookup_user`: the directory row joined with its current
/// session and the channels whose `GroupState` lists the nick.
#[derive(Debug, Clone)]
pub struct UserLookup {
    pub user: User,
    pub session: Option<UserSession>,
    pub channels: Vec<String>,
}

/// Result of `Store::lookup_group` / `Store::list_groups`: the group joined
/// with its state's membership.
#[derive(Debug, Clone)]
pub struct GroupLookup {
    pub group: Group,
    pub users: HashMap<String, i64>,
}

/// A change-feed entry: the document before and after a write. Either side
/// may be `None` (`old_val = None` on insert, `new_val = None` on delete).
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent<T> {
    pub old_val: Option<T>,
    pub new_val: Option<T>,
}
