//! Credential resolution: maps (username, password) to an avatar nickname
//! under a session/anonymous/registered policy. Password hashing and
//! verification run Argon2 off the async runtime via `spawn_blocking`.

use crate::error::CoreError;
use crate::store::Store;
use crate::validation::normalize;
use argon2::password_hash::{rand_core::OsRng, SaltString};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};

/// Hash a password using default Argon2 settings, off the async runtime.
pub async fn hash_password(password: String) -> Result<String, argon2::password_hash::Error> {
    tokio::task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut OsRng);
        Ok(Argon2::default()
            .hash_password(password.as_bytes(), &salt)?
            .to_string())
    })
    .await
    .expect("spawn_blocking failed")
}

/// Verify a password against a stored Argon2 hash, off the async runtime.
pub async fn verify_password(
    password: String,
    hash: String,
) -> Result<bool, argon2::password_hash::Error> {
    tokio::task::spawn_blocking(move || {
        let parsed = PasswordHash::new(&hash)?;
        Ok(Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok())
    })
    .await
    .expect("spawn_blocking failed")
}

/// Credentials supplied by a connecting client.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub nick: String,
    pub password: Option<String>,
}

/// Resolves credentials against the Store under the session/anonymous/
/// registered decision table.
pub struct CredentialResolver<'a> {
    store: &'a Store,
    create_on_request: bool,
    session_ttl_secs: i64,
}

impl<'a> CredentialResolver<'a> {
    pub fn new(store: &'a Store, create_on_request: bool, session_ttl_secs: i64) -> Self {
        Self {
            store,
            create_on_request,
            session_ttl_secs,
        }
    }

    /// Returns the resolved nickname on success.
    pub async fn resolve(&self, credentials: &Credentials) -> Result<String, CoreError> {
        let nick = normalize(&credentials.nick);
        let looked_up = self.store.lookup_user(&nick).await?;

        let Some(looked_up) = looked_up else {
            // missing user row
            if !self.create_on_request {
                return Err(CoreError::Unauthorized);
            }
            self.store
                .create_user(&nick, None, None, false, Default::default())
                .await?;
            return Ok(nick);
        };

        let now = chrono::Utc::now().timestamp();
        let session_is_fresh = looked_up
            .session
            .map(|s| s.is_fresh(now, self.session_ttl_secs))
            .unwrap_or(false);

        if session_is_fresh {
            return Err(CoreError::AlreadyLoggedIn(nick));
        }

        if !looked_up.user.registered {
            // anonymous reuse: stale or absent session, not registered
            return Ok(nick);
        }

        let Some(stored_hash) = looked_up.user.password.clone() else {
            return Err(CoreError::Unauthorized);
        };
        let supplied = credentials.password.clone().unwrap_or_default();
        let matches = verify_password(supplied, stored_hash)
            .await
            .unwrap_or(false);

        if matches {
            Ok(nick)
        } else {
            Err(CoreError::Unauthorized)
        }
    }
}
