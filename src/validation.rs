//! Field validation regexes shared by the Store and Credentials resolver.
//!
//! The password pattern is intentionally identical to the nickname pattern;
//! this looks overly restrictive but is left as-is pending a product
//! decision (see DESIGN.md).

use regex::Regex;
use std::sync::LazyLock;

static NICK_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{3,64}$").unwrap());

static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_.+-]+@[a-zA-Z0-9-]+\.[a-zA-Z0-9-.]+$").unwrap());

static PASSWORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{6,64}$").unwrap());

/// Also used as the channel name pattern: a channel name is a nickname-shaped
/// string.
pub fn is_valid_nick(s: &str) -> bool {
    NICK_RE.is_match(s)
}

pub fn is_valid_channel(s: &str) -> bool {
    NICK_RE.is_match(s)
}

pub fn is_valid_email(s: &str) -> bool {
    EMAIL_RE.is_match(s)
}

pub fn is_valid_password(s: &str) -> bool {
    PASSWORD_RE.is_match(s)
}

/// Lowercase a nickname or channel name at a lookup boundary.
pub fn normalize(s: &str) -> String {
    s.to_lowercase()
}
