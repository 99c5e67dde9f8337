use std::sync::Arc;
use tabmesh_channels::{ChannelProvider, DialerProvider, PeerHost, PortDiscoverer};
use tabmesh_core::{Config, Paths};
use tabmesh_rpc::BrowserProcedures;
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::inventory::StaticInventoryPeer;

pub async fn run(name: Option<String>, peer_id: Option<String>) -> anyhow::Result<()> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;

    let peer_id = peer_id
        .or_else(|| config.peer.peer_id.clone())
        .unwrap_or_else(|| {
            let mut id = uuid::Uuid::new_v4().simple().to_string();
            id.truncate(8);
            format!("peer-{}", id)
        });
    let name = name.unwrap_or_else(|| config.peer.name.clone());

    let discoverer = PortDiscoverer::from_config(&config.discovery)?;
    let dialer = DialerProvider::new(config.discovery.host.clone(), Some(discoverer.clone()))?;
    let procedures = BrowserProcedures::new(Arc::new(StaticInventoryPeer::new(peer_id.clone(), name)));
    let host = Arc::new(PeerHost::new(Arc::new(procedures), Arc::new(dialer.clone())));

    let (shutdown_tx, _) = broadcast::channel::<()>(4);

    let host_handle = {
        let host = host.clone();
        let events = dialer.subscribe();
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move { host.run(events, shutdown).await })
    };
    let dialer_handle = {
        let dialer = dialer.clone();
        let discovery = discoverer.subscribe();
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move { dialer.run(discovery, shutdown).await })
    };
    discoverer.start();

    println!();
    println!("tabmesh peer '{}'", peer_id);
    println!(
        "  Scanning {} ports {}-{}",
        config.discovery.host, config.discovery.port_range_start, config.discovery.port_range_end
    );
    println!();

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    discoverer.stop();
    let _ = shutdown_tx.send(());

    for (name, handle) in [("dialer", dialer_handle), ("peer_host", host_handle)] {
        if let Err(e) = handle.await {
            warn!(task = name, error = %e, "Task ended abnormally");
        }
    }
    Ok(())
}
