//! Session layer for the listener side.
//!
//! One announce link carries any number of logical channels. The multiplexer
//! owns two maps, `linkId -> frame sender` and `channelId -> channel state`,
//! and knows nothing about the transport that drains the frame queues.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tabmesh_core::{AnnounceFrame, ChannelId, Error, LinkId, ResolveMessage, Result};
use tabmesh_rpc::{MessageChannel, Subscription};
use tokio::sync::mpsc;
use tracing::{debug, warn};

type FrameSender = mpsc::UnboundedSender<AnnounceFrame>;
type LinkLostHook = Arc<dyn Fn(&LinkId) + Send + Sync>;

struct MuxChannel {
    link_id: LinkId,
    channel: MessageChannel,
    _forward: Subscription,
}

#[derive(Default)]
struct MuxState {
    links: HashMap<LinkId, FrameSender>,
    channels: HashMap<ChannelId, MuxChannel>,
}

#[derive(Default)]
pub struct Multiplexer {
    state: Mutex<MuxState>,
    on_link_lost: Option<LinkLostHook>,
}

impl Multiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// `on_link_lost` runs, outside the multiplexer lock, when a defer can no
    /// longer be queued on a link because its transport has gone away.
    pub fn with_link_lost<F>(on_link_lost: F) -> Self
    where
        F: Fn(&LinkId) + Send + Sync + 'static,
    {
        Self {
            state: Mutex::default(),
            on_link_lost: Some(Arc::new(on_link_lost)),
        }
    }

    /// Register a new physical link. The returned queue starts with the
    /// `hello` frame carrying the link id.
    pub fn attach_link(&self) -> (LinkId, mpsc::UnboundedReceiver<AnnounceFrame>) {
        let link_id = LinkId::generate();
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(AnnounceFrame::Hello {
            link_id: link_id.clone(),
        });
        self.state.lock().links.insert(link_id.clone(), tx);
        debug!(link_id = %link_id, "Link attached");
        (link_id, rx)
    }

    /// Remove a link and every channel riding on it.
    pub fn detach_link(&self, link_id: &LinkId) -> Vec<ChannelId> {
        let mut state = self.state.lock();
        if state.links.remove(link_id).is_none() {
            return Vec::new();
        }
        let ids: Vec<ChannelId> = state
            .channels
            .iter()
            .filter(|(_, c)| &c.link_id == link_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            state.channels.remove(id);
        }
        debug!(link_id = %link_id, channels = ids.len(), "Link detached");
        ids
    }

    /// Allocate a channel on `link_id`. Defers emitted on the channel's
    /// outgoing port are queued on the link as `defer` frames.
    pub fn open(&self, link_id: &LinkId, channel_id: ChannelId) -> Result<MessageChannel> {
        let mut state = self.state.lock();
        let Some(sender) = state.links.get(link_id).cloned() else {
            return Err(Error::NotFound(format!("unknown link {}", link_id)));
        };
        if state.channels.contains_key(&channel_id) {
            return Err(Error::Channel(format!("channel {} already exists", channel_id)));
        }

        let channel = MessageChannel::new();
        let frame_channel_id = channel_id.clone();
        let frame_link_id = link_id.clone();
        let on_link_lost = self.on_link_lost.clone();
        let forward = channel.outgoing().subscribe_defer(move |message| {
            let frame = AnnounceFrame::Defer {
                channel_id: frame_channel_id.clone(),
                message,
            };
            if sender.send(frame).is_err() {
                warn!(channel_id = %frame_channel_id, link_id = %frame_link_id, "Link gone, defer dropped");
                if let Some(lost) = &on_link_lost {
                    lost(&frame_link_id);
                }
            }
        });

        state.channels.insert(
            channel_id,
            MuxChannel {
                link_id: link_id.clone(),
                channel: channel.clone(),
                _forward: forward,
            },
        );
        Ok(channel)
    }

    /// Remove a channel and tell its link with a `closed` frame.
    pub fn close(&self, channel_id: &ChannelId) -> Result<()> {
        let mut state = self.state.lock();
        let removed = state
            .channels
            .remove(channel_id)
            .ok_or_else(|| Error::NotFound(format!("unknown channel {}", channel_id)))?;
        if let Some(sender) = state.links.get(&removed.link_id) {
            let _ = sender.send(AnnounceFrame::Closed {
                channel_id: channel_id.clone(),
            });
        }
        Ok(())
    }

    /// Hand a resolve posted by the peer to the channel's incoming port.
    pub fn deliver_resolve(&self, channel_id: &ChannelId, message: ResolveMessage) -> Result<usize> {
        let channel = self.channel(channel_id)?;
        Ok(channel.incoming().emit(message))
    }

    pub fn channel(&self, channel_id: &ChannelId) -> Result<MessageChannel> {
        self.state
            .lock()
            .channels
            .get(channel_id)
            .map(|c| c.channel.clone())
            .ok_or_else(|| Error::NotFound(format!("unknown channel {}", channel_id)))
    }

    pub fn channel_ids(&self) -> Vec<ChannelId> {
        self.state.lock().channels.keys().cloned().collect()
    }

    pub fn link_of(&self, channel_id: &ChannelId) -> Option<LinkId> {
        self.state
            .lock()
            .channels
            .get(channel_id)
            .map(|c| c.link_id.clone())
    }

    pub fn link_count(&self) -> usize {
        self.state.lock().links.len()
    }

    pub fn channel_count(&self) -> usize {
        self.state.lock().channels.len()
    }
}
