use std::sync::Arc;
use tabmesh_channels::server::{bind_in_range, serve};
use tabmesh_channels::{ChannelProvider, ChannelRegistry, ListenerProvider, ListenerState};
use tabmesh_core::{Config, Paths};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, warn};

pub async fn run(host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;
    let host = host.unwrap_or_else(|| config.server.host.clone());

    let listener = match port.or(config.server.port) {
        Some(port) => TcpListener::bind((host.as_str(), port)).await?,
        None => bind_in_range(&host, config.discovery.ports()).await?,
    };
    let addr = listener.local_addr()?;
    if !config.discovery.ports().contains(&addr.port()) {
        warn!(
            port = addr.port(),
            "Listening outside the discovery range; peers will not find this listener"
        );
    }

    let provider = ListenerProvider::new();
    let registry = ChannelRegistry::new(Arc::new(provider.clone()), &config.rpc);
    let (shutdown_tx, _) = broadcast::channel::<()>(4);

    let registry_handle = {
        let registry = registry.clone();
        let events = provider.subscribe();
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move { registry.run(events, shutdown).await })
    };

    let state = ListenerState {
        provider,
        registry,
    };
    let http_shutdown = shutdown_tx.subscribe();
    let http_handle = tokio::spawn(async move {
        if let Err(e) = serve(listener, state, http_shutdown).await {
            warn!(error = %e, "Listener exited with error");
        }
    });

    println!();
    println!("tabmesh listener on http://{}", addr);
    println!("  Announce: ws://{}/v1/announce", addr);
    println!("  Peers:    http://{}/v1/peers", addr);
    println!();

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());

    for (name, handle) in [("http_server", http_handle), ("registry", registry_handle)] {
        if let Err(e) = handle.await {
            warn!(task = name, error = %e, "Task ended abnormally");
        }
    }
    Ok(())
}
