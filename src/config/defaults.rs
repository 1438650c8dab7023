//! Default values for config fields, one named function per
//! `#[serde(default = "...")]` site.

pub fn default_heartbeat_period_secs() -> u64 {
    10
}

pub fn default_session_ttl_secs() -> u64 {
    // 3x heartbeat period; see DESIGN.md for the reasoning.
    30
}

pub fn default_lookupd_timeout_secs() -> u64 {
    5
}

pub fn default_nsq_poll_interval_secs() -> u64 {
    15
}

pub fn default_port() -> u16 {
    6667
}

pub fn default_db_path() -> String {
    "slircd.sqlite".to_string()
}

pub fn default_true() -> bool {
    true
}
