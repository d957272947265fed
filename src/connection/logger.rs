// Connection logger
use iroh::Watcher;
use iroh::endpoint::{ConnectionType, Endpoint};

/// Log which path (direct, relayed or both) carries the peer channel.
pub fn log_connection_details(endpoint: &Endpoint, remote_id: iroh::PublicKey, context: &str) {
    let Some(mut watcher) = endpoint.conn_type(remote_id) else {
        tracing::info!(peer = %remote_id, mode = "unknown", "{}", context);
        return;
    };
    match watcher.get() {
        ConnectionType::Direct(addr) => {
            tracing::info!(peer = %remote_id, mode = "direct", %addr, "{}", context)
        }
        ConnectionType::Relay(url) => {
            tracing::info!(peer = %remote_id, mode = "relay", %url, "{}", context)
        }
        ConnectionType::Mixed(addr, url) => {
            tracing::info!(peer = %remote_id, mode = "mixed", %addr, %url, "{}", context)
        }
        ConnectionType::None => tracing::info!(peer = %remote_id, mode = "none", "{}", context),
    }
}
