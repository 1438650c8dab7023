//! Tracing setup for the process entry point.

use crate::config::NodeConfig;

/// Initialize the global `tracing` subscriber. `verbose` selects `debug`
/// level; otherwise `info`. Safe to call once per process.
pub fn init(node: &NodeConfig) {
    let default_level = if node.verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init();
}
