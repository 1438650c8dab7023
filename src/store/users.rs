//! User and UserSession operations.

use super::{map_sqlx_err, now, Store};
use crate::error::CoreError;
use crate::store::models::{User, UserLookup, UserSession};
use crate::validation::{is_valid_email, is_valid_password, is_valid_nick, normalize};
use std::collections::{HashMap, HashSet};

#[derive(sqlx::FromRow)]
struct UserRow {
    id: String,
    email: Option<String>,
    password: Option<String>,
    registered: i64,
    permissions: String,
}

impl UserRow {
    fn into_user(self) -> User {
        User {
            id: self.id,
            email: self.email,
            password: self.password,
            registered: self.registered != 0,
            permissions: serde_json::from_str(&self.permissions).unwrap_or_default(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    session_start: i64,
    last_heartbeat: i64,
    last_message: Option<i64>,
}

impl From<SessionRow> for UserSession {
    fn from(r: SessionRow) -> Self {
        UserSession {
            session_start: r.session_start,
            last_heartbeat: r.last_heartbeat,
            last_message: r.last_message,
        }
    }
}

impl Store {
    /// Idempotent: if the row already exists this is a no-op and returns
    /// `Ok(false)`; `Ok(true)` means a new row was created.
    pub async fn create_user(
        &self,
        nick: &str,
        email: Option<&str>,
        password: Option<&str>,
        registered: bool,
        permissions: HashMap<String, HashSet<String>>,
    ) -> Result<bool, CoreError> {
        let id = normalize(nick);
        let perms_json = serde_json::to_string(&permissions).unwrap_or_else(|_| "{}".to_string());
        let result = sqlx::query(
            "INSERT INTO users (id, email, password, registered, permissions) \
             VALUES (?, ?, ?, ?, ?) ON CONFLICT(id) DO NOTHING",
        )
        .bind(&id)
        .bind(email)
        .bind(password)
        .bind(registered as i64)
        .bind(&perms_json)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(result.rows_affected() > 0)
    }

    /// The directory row joined with its current session and the channels
    /// whose `GroupState` lists the nick.
    pub async fn lookup_user(&self, nick: &str) -> Result<Option<UserLookup>, CoreError> {
        let id = normalize(nick);
        let row: Option<UserRow> =
            sqlx::query_as("SELECT id, email, password, registered, permissions FROM users WHERE id = ?")
                .bind(&id)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx_err)?;

        let Some(row) = row else { return Ok(None) };
        let user = row.into_user();
        let session = self.lookup_user_session(&id).await?;

        let channels: Vec<(String,)> = sqlx::query_as(
            "SELECT id FROM group_states WHERE json_extract(users, '$.' || ?) IS NOT NULL",
        )
        .bind(&id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(Some(UserLookup {
            user,
            session,
            channels: channels.into_iter().map(|(c,)| c).collect(),
        }))
    }

    /// Validates nick/email/password and flips `registered = true`. Fails
    /// with `InvalidField` for any input that doesn't match the section 4.1
    /// regexes.
    pub async fn register_user(
        &self,
        nick: &str,
        email: &str,
        password: &str,
    ) -> Result<(), CoreError> {
        if !is_valid_nick(nick) {
            return Err(CoreError::InvalidField {
                field: "nick",
                value: nick.to_string(),
            });
        }
        if !is_valid_email(email) {
            return Err(CoreError::InvalidField {
                field: "email",
                value: email.to_string(),
            });
        }
        if !is_valid_password(password) {
            return Err(CoreError::InvalidField {
                field: "password",
                value: "<redacted>".to_string(),
            });
        }

        let id = normalize(nick);
        let hash = crate::credentials::hash_password(password.to_string())
            .await
            .map_err(|e| CoreError::StorageUnavailable(e.to_string()))?;

        sqlx::query(
            "UPDATE users SET email = ?, password = ?, registered = 1 WHERE id = ?",
        )
        .bind(email)
        .bind(&hash)
        .bind(&id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(())
    }

    pub async fn delete_user(&self, nick: &str) -> Result<(), CoreError> {
        let id = normalize(nick);
        sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(&id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(())
    }

    /// Appends `flag` into `permissions[channel]`.
    pub async fn set_permission(
        &self,
        nick: &str,
        channel: &str,
        flag: &str,
    ) -> Result<(), CoreError> {
        let id = normalize(nick);
        let channel = normalize(channel);
        let row: Option<(String,)> = sqlx::query_as("SELECT permissions FROM users WHERE id = ?")
            .bind(&id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        let Some((perms_json,)) = row else {
            return Err(CoreError::NoSuchUser(id));
        };

        let mut perms: HashMap<String, HashSet<String>> =
            serde_json::from_str(&perms_json).unwrap_or_default();
        perms.entry(channel).or_default().insert(flag.to_string());
        let perms_json = serde_json::to_string(&perms).unwrap_or_else(|_| "{}".to_string());

        sqlx::query("UPDATE users SET permissions = ? WHERE id = ?")
            .bind(&perms_json)
            .bind(&id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(())
    }

    /// Insert with `session_start = last_heartbeat = now` if absent, else
    /// refresh `last_heartbeat`.
    pub async fn heartbeat_user_session(&self, nick: &str) -> Result<(), CoreError> {
        let id = normalize(nick);
        let t = now();
        sqlx::query(
            "INSERT INTO user_sessions (id, session_start, last_heartbeat) VALUES (?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET last_heartbeat = excluded.last_heartbeat",
        )
        .bind(&id)
        .bind(t)
        .bind(t)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    /// Touches `last_message` on the session row; called from
    /// `SharedUser::send`.
    pub async fn touch_last_message(&self, nick: &str) -> Result<(), CoreError> {
        let id = normalize(nick);
        let t = now();
        sqlx::query("UPDATE user_sessions SET last_message = ? WHERE id = ?")
            .bind(t)
            .bind(&id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(())
    }

    pub async fn lookup_user_session(&self, nick: &str) -> Result<Option<UserSession>, CoreError> {
        let id = normalize(nick);
        let row: Option<SessionRow> = sqlx::query_as(
            "SELECT session_start, last_heartbeat, last_message FROM user_sessions WHERE id = ?",
        )
        .bind(&id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(row.map(Into::into))
    }

    pub async fn remove_user_session(&self, nick: &str) -> Result<(), CoreError> {
        let id = normalize(nick);
        sqlx::query("DELETE FROM user_sessions WHERE id = ?")
            .bind(&id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(())
    }
}
