//! Message channels: two named event ports, independent of any transport.
//!
//! A [`MessageChannel`] is what both RPC ends attach to. The client end emits
//! `defer` on `outgoing` and listens for `resolve` on `incoming`; the server
//! end does the opposite. [`MessageChannel::reverse`] swaps the two ports over
//! the same shared state, so one pipe can serve both roles.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tabmesh_core::{DeferMessage, ResolveMessage};
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Defer,
    Resolve,
}

impl MessageKind {
    pub fn name(&self) -> &'static str {
        match self {
            MessageKind::Defer => "defer",
            MessageKind::Resolve => "resolve",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    Defer(DeferMessage),
    Resolve(ResolveMessage),
}

impl ChannelMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            ChannelMessage::Defer(_) => MessageKind::Defer,
            ChannelMessage::Resolve(_) => MessageKind::Resolve,
        }
    }
}

impl From<DeferMessage> for ChannelMessage {
    fn from(msg: DeferMessage) -> Self {
        ChannelMessage::Defer(msg)
    }
}

impl From<ResolveMessage> for ChannelMessage {
    fn from(msg: ResolveMessage) -> Self {
        ChannelMessage::Resolve(msg)
    }
}

type Handler = Arc<dyn Fn(ChannelMessage) + Send + Sync>;

struct PortInner {
    next_id: AtomicU64,
    handlers: Mutex<HashMap<MessageKind, Vec<(u64, Handler)>>>,
    attached: Notify,
}

impl PortInner {
    fn remove(&self, kind: MessageKind, id: u64) -> bool {
        let mut handlers = self.handlers.lock();
        let Some(list) = handlers.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(hid, _)| *hid != id);
        before != list.len()
    }
}

/// One direction of a channel.
#[derive(Clone)]
pub struct EventPort {
    inner: Arc<PortInner>,
}

impl EventPort {
    fn new() -> Self {
        Self {
            inner: Arc::new(PortInner {
                next_id: AtomicU64::new(1),
                handlers: Mutex::new(HashMap::new()),
                attached: Notify::new(),
            }),
        }
    }

    /// Deliver `message` to every handler subscribed to its kind.
    ///
    /// Handlers run on the caller's task, outside the port lock, so they may
    /// emit or unsubscribe themselves. Returns the number of handlers invoked.
    pub fn emit(&self, message: impl Into<ChannelMessage>) -> usize {
        let message = message.into();
        let handlers: Vec<Handler> = {
            let handlers = self.inner.handlers.lock();
            handlers
                .get(&message.kind())
                .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
                .unwrap_or_default()
        };
        for handler in &handlers {
            handler(message.clone());
        }
        handlers.len()
    }

    pub fn subscribe<F>(&self, kind: MessageKind, handler: F) -> Subscription
    where
        F: Fn(ChannelMessage) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .handlers
            .lock()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        self.inner.attached.notify_waiters();
        Subscription {
            port: Arc::downgrade(&self.inner),
            kind,
            id,
            active: true,
        }
    }

    pub fn subscribe_defer<F>(&self, handler: F) -> Subscription
    where
        F: Fn(DeferMessage) + Send + Sync + 'static,
    {
        self.subscribe(MessageKind::Defer, move |msg| {
            if let ChannelMessage::Defer(defer) = msg {
                handler(defer);
            }
        })
    }

    pub fn subscribe_resolve<F>(&self, handler: F) -> Subscription
    where
        F: Fn(ResolveMessage) + Send + Sync + 'static,
    {
        self.subscribe(MessageKind::Resolve, move |msg| {
            if let ChannelMessage::Resolve(resolve) = msg {
                handler(resolve);
            }
        })
    }

    pub fn listener_count(&self, kind: MessageKind) -> usize {
        self.inner
            .handlers
            .lock()
            .get(&kind)
            .map(|list| list.len())
            .unwrap_or(0)
    }

    /// Wait until at least one handler of `kind` is subscribed, for at most
    /// `within`. Returns false on timeout.
    pub async fn wait_for_listener(&self, kind: MessageKind, within: Duration) -> bool {
        let wait = async {
            loop {
                let attached = self.inner.attached.notified();
                if self.listener_count(kind) > 0 {
                    return;
                }
                attached.await;
            }
        };
        tokio::time::timeout(within, wait).await.is_ok()
    }

    pub fn same_port(&self, other: &EventPort) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Handle to one subscribed handler. Dropping it unsubscribes.
pub struct Subscription {
    port: Weak<PortInner>,
    kind: MessageKind,
    id: u64,
    active: bool,
}

impl Subscription {
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Remove the handler. Returns false if it was already gone.
    pub fn unsubscribe(mut self) -> bool {
        self.release()
    }

    fn release(&mut self) -> bool {
        if !self.active {
            return false;
        }
        self.active = false;
        match self.port.upgrade() {
            Some(port) => port.remove(self.kind, self.id),
            None => false,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("active", &self.active)
            .finish()
    }
}

/// A bidirectional pair of event ports.
#[derive(Clone)]
pub struct MessageChannel {
    incoming: EventPort,
    outgoing: EventPort,
}

impl MessageChannel {
    pub fn new() -> Self {
        Self {
            incoming: EventPort::new(),
            outgoing: EventPort::new(),
        }
    }

    pub fn incoming(&self) -> &EventPort {
        &self.incoming
    }

    pub fn outgoing(&self) -> &EventPort {
        &self.outgoing
    }

    /// The same channel seen from the other end.
    pub fn reverse(&self) -> Self {
        Self {
            incoming: self.outgoing.clone(),
            outgoing: self.incoming.clone(),
        }
    }
}

impl Default for MessageChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn defer(id: &str) -> DeferMessage {
        DeferMessage {
            id: id.to_string(),
            procedure: "peer.getInfo".to_string(),
            args: vec![],
            extra_args: Default::default(),
        }
    }

    #[test]
    fn test_emit_only_reaches_matching_kind() {
        let channel = MessageChannel::new();
        let defers = Arc::new(AtomicUsize::new(0));
        let counter = defers.clone();
        let _sub = channel.incoming().subscribe_defer(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(channel.incoming().emit(defer("1")), 1);
        assert_eq!(channel.incoming().emit(ResolveMessage::ok("1", json!(null))), 0);
        assert_eq!(channel.outgoing().emit(defer("2")), 0);
        assert_eq!(defers.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_and_drop_remove_handler() {
        let channel = MessageChannel::new();
        let port = channel.incoming();

        let sub = port.subscribe(MessageKind::Defer, |_| {});
        assert_eq!(port.listener_count(MessageKind::Defer), 1);
        assert!(sub.unsubscribe());
        assert_eq!(port.listener_count(MessageKind::Defer), 0);

        {
            let _scoped = port.subscribe(MessageKind::Resolve, |_| {});
            assert_eq!(port.listener_count(MessageKind::Resolve), 1);
        }
        assert_eq!(port.listener_count(MessageKind::Resolve), 0);
    }

    #[test]
    fn test_reverse_shares_ports() {
        let channel = MessageChannel::new();
        let reversed = channel.reverse();
        assert!(reversed.incoming().same_port(channel.outgoing()));
        assert!(reversed.outgoing().same_port(channel.incoming()));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = reversed.incoming().subscribe_defer(move |msg| sink.lock().push(msg.id));

        channel.outgoing().emit(defer("a"));
        assert_eq!(*seen.lock(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_wait_for_listener_wakes_on_subscribe() {
        let channel = MessageChannel::new();
        let port = channel.incoming().clone();
        assert!(!port.wait_for_listener(MessageKind::Defer, Duration::from_millis(20)).await);

        let waiter = tokio::spawn({
            let port = port.clone();
            async move { port.wait_for_listener(MessageKind::Defer, Duration::from_secs(2)).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _resolve_only = port.subscribe(MessageKind::Resolve, |_| {});
        let _sub = port.subscribe(MessageKind::Defer, |_| {});
        assert!(waiter.await.unwrap());
        assert!(port.wait_for_listener(MessageKind::Defer, Duration::from_millis(1)).await);
    }

    #[test]
    fn test_handler_may_emit_reentrantly() {
        let channel = MessageChannel::new();
        let echo = channel.clone();
        let _sub = channel.incoming().subscribe_defer(move |msg| {
            echo.incoming().emit(ResolveMessage::ok(msg.id, json!(true)));
        });
        let resolved = Arc::new(AtomicUsize::new(0));
        let counter = resolved.clone();
        let _resolve_sub = channel.incoming().subscribe_resolve(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        channel.incoming().emit(defer("x"));
        assert_eq!(resolved.load(Ordering::SeqCst), 1);
    }
}
