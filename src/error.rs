//! Unified error taxonomy for the distribution layer.
//!
//! A single `CoreError` enum that the protocol adapter maps to IRC numerics.
//! Store and bus transport failures are wrapped rather than discarded so the
//! adapter can distinguish a transient outage from a directory outcome.

use thiserror::Error;

/// Errors surfaced by the distribution layer to the protocol adapter.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("bad or missing credentials")]
    Unauthorized,

    #[error("{0} is currently logged in elsewhere")]
    AlreadyLoggedIn(String),

    #[error("no such user: {0}")]
    NoSuchUser(String),

    #[error("no such group: {0}")]
    NoSuchGroup(String),

    #[error("user already exists: {0}")]
    DuplicateUser(String),

    #[error("group already exists: {0}")]
    DuplicateGroup(String),

    #[error("invalid field {field}: {value}")]
    InvalidField { field: &'static str, value: String },

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("bus unavailable: {0}")]
    BusUnavailable(String),

    #[error("malformed bus message: {0}")]
    ProtocolMismatch(String),
}

impl CoreError {
    /// Stable label for metrics/log fields, in the same `error_code()`
    /// convention as `HandlerError` / `ChannelError`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::AlreadyLoggedIn(_) => "already_logged_in",
            Self::NoSuchUser(_) => "no_such_user",
            Self::NoSuchGroup(_) => "no_such_group",
            Self::DuplicateUser(_) => "duplicate_user",
            Self::DuplicateGroup(_) => "duplicate_group",
            Self::InvalidField { .. } => "invalid_field",
            Self::StorageUnavailable(_) => "storage_unavailable",
            Self::BusUnavailable(_) => "bus_unavailable",
            Self::ProtocolMismatch(_) => "protocol_mismatch",
        }
    }

    /// True for errors that represent a degraded-but-alive condition (the
    /// caller may retry later) rather than a rejected request.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_) | Self::BusUnavailable(_))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(CoreError::Unauthorized.code(), "unauthorized");
        assert_eq!(
            CoreError::AlreadyLoggedIn("jane".into()).code(),
            "already_logged_in"
        );
    }

    #[test]
    fn transience_classification() {
        assert!(CoreError::StorageUnavailable("down".into()).is_transient());
        assert!(CoreError::BusUnavailable("down".into()).is_transient());
        assert!(!CoreError::Unauthorized.is_transient());
    }
}
