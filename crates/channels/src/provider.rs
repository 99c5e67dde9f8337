use tabmesh_core::{ChannelId, Result};
use tabmesh_rpc::MessageChannel;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    Connected(ChannelId),
    Disconnected(ChannelId),
}

impl ProviderEvent {
    pub fn channel_id(&self) -> &ChannelId {
        match self {
            ProviderEvent::Connected(id) | ProviderEvent::Disconnected(id) => id,
        }
    }
}

/// Source of live message channels.
///
/// A provider turns a reachable peer into a [`MessageChannel`] and reports its
/// lifecycle. Every `Connected(id)` is followed by at most one
/// `Disconnected(id)`, and `get_message_channel` fails for ids that are not
/// currently connected.
pub trait ChannelProvider: Send + Sync + 'static {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ProviderEvent>;

    fn get_message_channel(&self, id: &ChannelId) -> Result<MessageChannel>;

    fn channel_ids(&self) -> Vec<ChannelId>;
}
