//! Directory of connected peers.
//!
//! Each connected channel gets its own [`RpcClient`]. The peer's identity is
//! fetched once per channel; afterwards the peer is reachable by id. When a
//! peer reconnects the newest channel wins the mapping.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tabmesh_core::config::RpcConfig;
use tabmesh_core::{ChannelId, Error, Result, TabKey, WindowKey};
use tabmesh_rpc::{CallRequest, PeerClient, PeerInfo, ProcedurePath, RpcClient, IDENTITY_PROCEDURE};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::provider::{ChannelProvider, ProviderEvent};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    pub peer_id: String,
    pub channel_id: ChannelId,
    pub name: String,
    pub version: String,
    pub tab_count: usize,
    pub procedures: Vec<String>,
    pub connected_at: DateTime<Utc>,
}

struct PeerEntry {
    channel_id: ChannelId,
    info: PeerInfo,
    connected_at: DateTime<Utc>,
}

struct RegistryInner {
    provider: Arc<dyn ChannelProvider>,
    // Lock order: clients before peers.
    clients: Mutex<HashMap<ChannelId, Arc<RpcClient>>>,
    peers: Mutex<HashMap<String, PeerEntry>>,
    call_timeout: Option<Duration>,
    identity_timeout: Duration,
}

#[derive(Clone)]
pub struct ChannelRegistry {
    inner: Arc<RegistryInner>,
}

impl ChannelRegistry {
    pub fn new(provider: Arc<dyn ChannelProvider>, config: &RpcConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                provider,
                clients: Mutex::new(HashMap::new()),
                peers: Mutex::new(HashMap::new()),
                call_timeout: config.call_timeout(),
                identity_timeout: config.identity_timeout(),
            }),
        }
    }

    /// Consume provider events until shutdown. Identity fetches run on their
    /// own tasks so a slow peer never delays other connections.
    pub async fn run(
        &self,
        mut events: mpsc::UnboundedReceiver<ProviderEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!("Channel registry started");
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        debug!("Provider event stream ended");
                        break;
                    };
                    match event {
                        ProviderEvent::Connected(id) => {
                            if let Some(client) = self.attach(&id) {
                                let registry = self.clone();
                                tokio::spawn(async move {
                                    registry.identify(id, client).await;
                                });
                            }
                        }
                        ProviderEvent::Disconnected(id) => self.on_disconnected(&id),
                    }
                }
                _ = shutdown.recv() => {
                    info!("Channel registry shutting down");
                    break;
                }
            }
        }
        self.clear();
    }

    /// Register a channel and wait for its identity.
    pub async fn on_connected(&self, id: &ChannelId) -> Result<()> {
        let client = self
            .attach(id)
            .ok_or_else(|| Error::NotFound(format!("channel {} is not available", id)))?;
        self.identify(id.clone(), client).await;
        Ok(())
    }

    fn attach(&self, id: &ChannelId) -> Option<Arc<RpcClient>> {
        let channel = match self.inner.provider.get_message_channel(id) {
            Ok(channel) => channel,
            Err(e) => {
                warn!(channel_id = %id, error = %e, "Connected channel vanished before registration");
                return None;
            }
        };
        let client = Arc::new(RpcClient::with_timeout(self.inner.call_timeout));
        if let Err(e) = client.bind_channel(channel) {
            warn!(channel_id = %id, error = %e, "Failed to bind rpc client");
            return None;
        }
        if let Some(previous) = self.inner.clients.lock().insert(id.clone(), client.clone()) {
            previous.unbind_channel();
        }
        debug!(channel_id = %id, "Channel registered");
        Some(client)
    }

    async fn identify(&self, id: ChannelId, client: Arc<RpcClient>) {
        let request = CallRequest::new(IDENTITY_PROCEDURE.path());
        let info = match client
            .call_with_deadline(request, self.inner.identity_timeout)
            .await
            .and_then(|value| Ok(serde_json::from_value::<PeerInfo>(value)?))
        {
            Ok(info) => info,
            Err(e) => {
                warn!(channel_id = %id, error = %e, "Identity fetch failed; channel unreachable by peer id");
                return;
            }
        };

        let clients = self.inner.clients.lock();
        let still_current = clients
            .get(&id)
            .map(|current| Arc::ptr_eq(current, &client))
            .unwrap_or(false);
        if !still_current {
            debug!(channel_id = %id, "Channel closed during identity fetch");
            return;
        }
        let peer_id = info.peer_id.clone();
        let previous = self.inner.peers.lock().insert(
            peer_id.clone(),
            PeerEntry {
                channel_id: id.clone(),
                info,
                connected_at: Utc::now(),
            },
        );
        drop(clients);

        match previous {
            Some(old) if old.channel_id != id => {
                info!(peer_id = %peer_id, channel_id = %id, replaced = %old.channel_id, "Peer reconnected")
            }
            _ => info!(peer_id = %peer_id, channel_id = %id, "Peer identified"),
        }
    }

    pub fn on_disconnected(&self, id: &ChannelId) {
        let mut clients = self.inner.clients.lock();
        let Some(client) = clients.remove(id) else {
            return;
        };
        let abandoned = client.unbind_channel();
        let mut peers = self.inner.peers.lock();
        let before = peers.len();
        peers.retain(|_, entry| &entry.channel_id != id);
        let removed = before - peers.len();
        drop(peers);
        drop(clients);
        info!(channel_id = %id, peers_removed = removed, abandoned_calls = abandoned, "Channel unregistered");
    }

    fn clear(&self) {
        let mut clients = self.inner.clients.lock();
        for (_, client) in clients.drain() {
            client.unbind_channel();
        }
        self.inner.peers.lock().clear();
    }

    pub fn get_rpc_client_by_browser_id(&self, peer_id: &str) -> Result<Arc<RpcClient>> {
        let clients = self.inner.clients.lock();
        let peers = self.inner.peers.lock();
        peers
            .get(peer_id)
            .and_then(|entry| clients.get(&entry.channel_id))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no connected peer with id '{}'", peer_id)))
    }

    pub fn get_rpc_client(&self, id: &ChannelId) -> Result<Arc<RpcClient>> {
        self.inner
            .clients
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("unknown channel {}", id)))
    }

    pub fn peer_client(&self, peer_id: &str) -> Result<PeerClient> {
        let rpc = self.get_rpc_client_by_browser_id(peer_id)?;
        Ok(PeerClient::new(peer_id, rpc))
    }

    /// Route by tab key: the key's peer id picks the channel.
    pub fn peer_client_for_tab(&self, tab: &TabKey) -> Result<PeerClient> {
        self.peer_client(&tab.peer_id)
    }

    pub fn peer_client_for_window(&self, window: &WindowKey) -> Result<PeerClient> {
        self.peer_client(&window.peer_id)
    }

    pub fn peer_info(&self, peer_id: &str) -> Option<PeerInfo> {
        self.inner.peers.lock().get(peer_id).map(|e| e.info.clone())
    }

    pub fn peers(&self) -> Vec<PeerSummary> {
        let mut peers: Vec<PeerSummary> = self
            .inner
            .peers
            .lock()
            .iter()
            .map(|(peer_id, entry)| PeerSummary {
                peer_id: peer_id.clone(),
                channel_id: entry.channel_id.clone(),
                name: entry.info.name.clone(),
                version: entry.info.version.clone(),
                tab_count: entry.info.tab_count(),
                procedures: entry.info.procedures.clone(),
                connected_at: entry.connected_at,
            })
            .collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        peers
    }

    pub fn channel_count(&self) -> usize {
        self.inner.clients.lock().len()
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers.lock().len()
    }
}
