//! Listener-side channel provider. Never dials: channels appear when a
//! dialer posts an open request over one of its announce links.

use std::sync::{Arc, Weak};
use tabmesh_core::{AnnounceFrame, ChannelId, EventEmitter, LinkId, ResolveMessage, Result};
use tabmesh_rpc::MessageChannel;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::multiplexer::Multiplexer;
use crate::provider::{ChannelProvider, ProviderEvent};

#[derive(Clone)]
pub struct ListenerProvider {
    mux: Arc<Multiplexer>,
    events: Arc<EventEmitter<ProviderEvent>>,
}

impl ListenerProvider {
    /// A link whose frame queue is gone is detached as soon as a defer fails
    /// to reach it, with `Disconnected` for each of its channels.
    pub fn new() -> Self {
        let events: Arc<EventEmitter<ProviderEvent>> = Arc::new(EventEmitter::new());
        let lost_events = events.clone();
        let mux = Arc::new_cyclic(|mux: &Weak<Multiplexer>| {
            let mux = mux.clone();
            Multiplexer::with_link_lost(move |link_id: &LinkId| {
                if let Some(mux) = mux.upgrade() {
                    let closed = mux.detach_link(link_id);
                    report_detached(&lost_events, link_id, &closed);
                }
            })
        });
        Self { mux, events }
    }

    pub fn multiplexer(&self) -> &Multiplexer {
        &self.mux
    }

    pub fn attach_link(&self) -> (LinkId, mpsc::UnboundedReceiver<AnnounceFrame>) {
        let (link_id, rx) = self.mux.attach_link();
        info!(link_id = %link_id, "Announce link opened");
        (link_id, rx)
    }

    /// Drop a link; every channel it carried is reported disconnected.
    pub fn detach_link(&self, link_id: &LinkId) -> usize {
        let closed = self.mux.detach_link(link_id);
        report_detached(&self.events, link_id, &closed);
        closed.len()
    }

    /// Handle an open request. Rejects malformed ids, unknown links and ids
    /// already in use.
    pub fn open_channel(&self, link_id: &str, channel_id: &str) -> Result<ChannelId> {
        let link_id = LinkId::parse(link_id)?;
        let channel_id = ChannelId::parse(channel_id)?;
        self.mux.open(&link_id, channel_id.clone())?;
        info!(channel_id = %channel_id, link_id = %link_id, "Channel opened");
        self.events.emit(ProviderEvent::Connected(channel_id.clone()));
        Ok(channel_id)
    }

    pub fn close_channel(&self, channel_id: &str) -> Result<()> {
        let channel_id = ChannelId::parse(channel_id)?;
        self.mux.close(&channel_id)?;
        info!(channel_id = %channel_id, "Channel closed");
        self.events.emit(ProviderEvent::Disconnected(channel_id));
        Ok(())
    }

    pub fn deliver_resolve(&self, channel_id: &str, message: ResolveMessage) -> Result<()> {
        let channel_id = ChannelId::parse(channel_id)?;
        let id = message.id.clone();
        if self.mux.deliver_resolve(&channel_id, message)? == 0 {
            warn!(channel_id = %channel_id, call_id = %id, "Resolve arrived with no client bound");
        }
        Ok(())
    }
}

impl Default for ListenerProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn report_detached(events: &EventEmitter<ProviderEvent>, link_id: &LinkId, closed: &[ChannelId]) {
    if closed.is_empty() {
        return;
    }
    info!(link_id = %link_id, channels = closed.len(), "Announce link closed");
    for id in closed {
        events.emit(ProviderEvent::Disconnected(id.clone()));
    }
}

impl ChannelProvider for ListenerProvider {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ProviderEvent> {
        self.events.subscribe()
    }

    fn get_message_channel(&self, id: &ChannelId) -> Result<MessageChannel> {
        self.mux.channel(id)
    }

    fn channel_ids(&self) -> Vec<ChannelId> {
        self.mux.channel_ids()
    }
}
