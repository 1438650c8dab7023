//! Group and GroupState operations, including the change-feed emulation
//! wired up in `changefeed.rs`.

use super::{map_sqlx_err, now, Store};
use crate::error::CoreError;
use crate::store::models::{ChangeEvent, Group, GroupLookup, GroupMessage, GroupMeta, GroupState, GroupType};
use crate::validation::normalize;
use futures_util::Stream;
use std::collections::HashMap;
use std::str::FromStr;

#[derive(sqlx::FromRow)]
struct GroupRow {
    id: String,
    name: String,
    #[sqlx(rename = "type")]
    group_type: String,
    topic: Option<String>,
    topic_author: Option<String>,
    topic_time: Option<i64>,
    messages: String,
}

impl GroupRow {
    fn into_group(self) -> Group {
        Group {
            id: self.id,
            name: self.name,
            group_type: GroupType::from_str(&self.group_type).unwrap_or(GroupType::Public),
            meta: GroupMeta {
                topic: self.topic,
                topic_author: self.topic_author,
                topic_time: self.topic_time,
            },
            messages: serde_json::from_str(&self.messages).unwrap_or_default(),
        }
    }
}

async fn load_state_users(pool: &sqlx::SqlitePool, id: &str) -> Result<HashMap<String, i64>, CoreError> {
    let row: Option<(String,)> = sqlx::query_as("SELECT users FROM group_states WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(map_sqlx_err)?;
    Ok(row
        .map(|(j,)| serde_json::from_str(&j).unwrap_or_default())
        .unwrap_or_default())
}

impl Store {
    /// Creates both the `Group` (empty meta/messages) and its `GroupState`.
    /// Idempotent: returns `Ok(false)` if the group already existed.
    pub async fn create_group(&self, name: &str, group_type: GroupType) -> Result<bool, CoreError> {
        let id = normalize(name);
        let result = sqlx::query(
            "INSERT INTO groups (id, name, type, messages) VALUES (?, ?, ?, '[]') \
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(&id)
        .bind(name)
        .bind(group_type.as_str())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        if result.rows_affected() > 0 {
            sqlx::query("INSERT INTO group_states (id, users) VALUES (?, '{}') ON CONFLICT(id) DO NOTHING")
                .bind(&id)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_err)?;
        }

        Ok(result.rows_affected() > 0)
    }

    pub async fn lookup_group(&self, name: &str) -> Result<Option<GroupLookup>, CoreError> {
        let id = normalize(name);
        let row: Option<GroupRow> = sqlx::query_as(
            "SELECT id, name, type, topic, topic_author, topic_time, messages FROM groups WHERE id = ?",
        )
        .bind(&id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        let Some(row) = row else { return Ok(None) };
        let users = load_state_users(&self.pool, &id).await?;
        Ok(Some(GroupLookup {
            group: row.into_group(),
            users,
        }))
    }

    /// All groups of type `public`, joined with their users.
    pub async fn list_groups(&self) -> Result<Vec<GroupLookup>, CoreError> {
        let rows: Vec<GroupRow> = sqlx::query_as(
            "SELECT id, name, type, topic, topic_author, topic_time, messages FROM groups WHERE type = 'public'",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id.clone();
            let users = load_state_users(&self.pool, &id).await?;
            out.push(GroupLookup {
                group: row.into_group(),
                users,
            });
        }
        Ok(out)
    }

    pub async fn delete_group(&self, name: &str) -> Result<(), CoreError> {
        let id = normalize(name);
        sqlx::query("DELETE FROM groups WHERE id = ?")
            .bind(&id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        sqlx::query("DELETE FROM group_states WHERE id = ?")
            .bind(&id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(())
    }

    /// Updates `meta`, setting `topic_time = now`, and notifies
    /// `observeGroupMeta` subscribers.
    pub async fn set_group_topic(
        &self,
        name: &str,
        topic: &str,
        author: &str,
    ) -> Result<(), CoreError> {
        let id = normalize(name);
        let old = self.lookup_group(&id).await?.map(|g| g.group);

        let t = now();
        sqlx::query("UPDATE groups SET topic = ?, topic_author = ?, topic_time = ? WHERE id = ?")
            .bind(topic)
            .bind(author)
            .bind(t)
            .bind(&id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        let new = self.lookup_group(&id).await?.map(|g| g.group);
        self.meta_feeds.publish(
            &id,
            ChangeEvent {
                old_val: old,
                new_val: new,
            },
        );
        Ok(())
    }

    pub async fn add_message(&self, group: &str, sender: &str, text: &str) -> Result<(), CoreError> {
        let id = normalize(group);
        let row: Option<(String,)> = sqlx::query_as("SELECT messages FROM groups WHERE id = ?")
            .bind(&id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        let Some((messages_json,)) = row else {
            return Err(CoreError::NoSuchGroup(id));
        };

        let mut messages: Vec<GroupMessage> =
            serde_json::from_str(&messages_json).unwrap_or_default();
        messages.push(GroupMessage {
            sender: sender.to_string(),
            time: now(),
            text: text.to_string(),
        });
        let messages_json = serde_json::to_string(&messages).unwrap_or_else(|_| "[]".to_string());

        sqlx::query("UPDATE groups SET messages = ? WHERE id = ?")
            .bind(&messages_json)
            .bind(&id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(())
    }

    /// Lazily creates a private group named `min(a,b)+":"+max(a,b)` and
    /// appends the message.
    pub async fn private_message(&self, a: &str, b: &str, text: &str) -> Result<(), CoreError> {
        let (a, b) = (normalize(a), normalize(b));
        let name = if a < b {
            format!("{}:{}", a, b)
        } else {
            format!("{}:{}", b, a)
        };
        self.create_group(&name, GroupType::Private).await?;
        self.add_message(&name, &a, text).await
    }

    /// Creates `GroupState` if missing and sets `users[nick] = now`, merging
    /// with any existing entries. Notifies `observeGroupState` subscribers.
    pub async fn heartbeat_user_in_group(&self, nick: &str, group: &str) -> Result<(), CoreError> {
        let nick = normalize(nick);
        let id = normalize(group);

        sqlx::query("INSERT INTO group_states (id, users) VALUES (?, '{}') ON CONFLICT(id) DO NOTHING")
            .bind(&id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        let old = self.load_group_state(&id).await?;
        let mut users = old.users.clone();
        users.insert(nick, now());
        let users_json = serde_json::to_string(&users).unwrap_or_else(|_| "{}".to_string());

        sqlx::query("UPDATE group_states SET users = ? WHERE id = ?")
            .bind(&users_json)
            .bind(&id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        self.state_feeds.publish(
            &id,
            ChangeEvent {
                old_val: Some(old),
                new_val: Some(GroupState { users }),
            },
        );
        Ok(())
    }

    /// Deletes key `nick` from `users`.
    pub async fn remove_user_from_group(&self, nick: &str, group: &str) -> Result<(), CoreError> {
        let nick = normalize(nick);
        let id = normalize(group);

        let old = self.load_group_state(&id).await?;
        if !old.users.contains_key(&nick) {
            return Ok(());
        }
        let mut users = old.users.clone();
        users.remove(&nick);
        let users_json = serde_json::to_string(&users).unwrap_or_else(|_| "{}".to_string());

        sqlx::query("UPDATE group_states SET users = ? WHERE id = ?")
            .bind(&users_json)
            .bind(&id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        self.state_feeds.publish(
            &id,
            ChangeEvent {
                old_val: Some(old),
                new_val: Some(GroupState { users }),
            },
        );
        Ok(())
    }

    async fn load_group_state(&self, id: &str) -> Result<GroupState, CoreError> {
        Ok(GroupState {
            users: load_state_users(&self.pool, id).await?,
        })
    }

    /// Lazy sequence of `{old_val, new_val}` for the named group's
    /// `GroupState`; restartable by re-calling, cancellable by dropping the
    /// returned stream.
    pub fn observe_group_state(
        &self,
        name: &str,
    ) -> impl Stream<Item = Result<ChangeEvent<GroupState>, CoreError>> {
        self.state_feeds.observe(&normalize(name))
    }

    /// Analogous to [`Store::observe_group_state`] for the `Group` document.
    pub fn observe_group_meta(
        &self,
        name: &str,
    ) -> impl Stream<Item = Result<ChangeEvent<Group>, CoreError>> {
        self.meta_feeds.observe(&normalize(name))
    }
}
