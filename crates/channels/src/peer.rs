//! Peer side: serve a procedure table on every channel a provider opens.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tabmesh_core::ChannelId;
use tabmesh_rpc::{Procedures, RpcServer};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::provider::{ChannelProvider, ProviderEvent};

pub struct PeerHost<P: Procedures> {
    procedures: Arc<P>,
    provider: Arc<dyn ChannelProvider>,
    servers: Mutex<HashMap<ChannelId, RpcServer<P>>>,
}

impl<P: Procedures> PeerHost<P> {
    pub fn new(procedures: Arc<P>, provider: Arc<dyn ChannelProvider>) -> Self {
        Self {
            procedures,
            provider,
            servers: Mutex::new(HashMap::new()),
        }
    }

    /// Start an rpc server on the channel. Defers arrive on its incoming
    /// port; resolves leave on its outgoing port.
    pub fn on_connected(&self, id: &ChannelId) {
        let channel = match self.provider.get_message_channel(id) {
            Ok(channel) => channel,
            Err(e) => {
                warn!(channel_id = %id, error = %e, "Channel vanished before serving");
                return;
            }
        };
        let server = RpcServer::from_arc(self.procedures.clone());
        if let Err(e) = server.start_listen(channel) {
            warn!(channel_id = %id, error = %e, "Failed to serve channel");
            return;
        }
        self.servers.lock().insert(id.clone(), server);
        info!(channel_id = %id, "Serving procedures");
    }

    pub fn on_disconnected(&self, id: &ChannelId) {
        if let Some(server) = self.servers.lock().remove(id) {
            server.stop_listen();
            debug!(channel_id = %id, "Stopped serving");
        }
    }

    pub async fn run(
        &self,
        mut events: mpsc::UnboundedReceiver<ProviderEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(ProviderEvent::Connected(id)) => self.on_connected(&id),
                        Some(ProviderEvent::Disconnected(id)) => self.on_disconnected(&id),
                        None => break,
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
        for (_, server) in self.servers.lock().drain() {
            server.stop_listen();
        }
    }

    pub fn serving_count(&self) -> usize {
        self.servers.lock().len()
    }
}
