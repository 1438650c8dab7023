//! slircd-core — distribution-layer daemon for a clustered IRC service.
//!
//! This binary wires up the Store, Bus, and Realm and then idles: the IRC
//! wire protocol, TCP listener, and connection handling are an external
//! collaborator (see [`slircd_core::protocol_adapter`]) that this process
//! does not implement. Running the binary directly is useful for smoke
//! testing a Realm against a loopback Bus; a real deployment embeds
//! `slircd_core` as a library behind the wire-protocol layer.

use slircd_core::bus::{Bus, LoopbackBus, NsqBus};
use slircd_core::config::Config;
use slircd_core::realm::Realm;
use slircd_core::store::Store;
use slircd_core::telemetry;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

fn resolve_config_path() -> String {
    std::env::args().nth(1).unwrap_or_else(|| "config.toml".to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = resolve_config_path();
    let config = if Path::new(&config_path).exists() {
        Config::load(&config_path).map_err(|e| {
            eprintln!("ERROR: failed to load config from {}: {}", config_path, e);
            e
        })?
    } else {
        eprintln!("No config file at {}, pass hostname via SLIRCD_HOSTNAME", config_path);
        std::process::exit(1);
    };

    telemetry::init(&config.node);

    info!(hostname = %config.node.hostname, port = config.node.port, "starting slircd-core");

    let store = Arc::new(Store::connect(&config.db.path).await?);
    info!(path = %config.db.path, "store connected");

    let bus: Arc<dyn Bus> = if config.bus.nsqd_tcp_address.is_empty() {
        info!("no nsqd_tcp_address configured, using in-process loopback bus");
        Arc::new(LoopbackBus::new(config.node.hostname.clone()))
    } else {
        Arc::new(NsqBus::new(config.node.hostname.clone(), config.bus.clone()))
    };

    let realm = Arc::new(Realm::new(
        config.node.hostname.clone(),
        store.clone(),
        bus.clone(),
        config.realm.user_on_request,
        config.realm.group_on_request,
        config.heartbeat.session_ttl_secs as i64,
        Duration::from_secs(config.heartbeat.period_secs),
    ));
    info!("realm initialized");

    // The wire-protocol layer normally drives the realm from here by
    // accepting TCP connections, resolving credentials, and calling
    // `realm.request_avatar`. Absent that layer, idle and let the
    // heartbeat/observer tasks already spawned inside the realm's users
    // and groups keep running.
    let mut shutdown = Box::pin(tokio::signal::ctrl_c());
    tokio::select! {
        res = &mut shutdown => {
            if let Err(e) = res {
                error!(error = %e, "failed to install signal handler");
            }
            info!("received shutdown signal");
        }
    }

    let _ = realm;
    Ok(())
}
