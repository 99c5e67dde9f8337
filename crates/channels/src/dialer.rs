//! Dialer-side channel provider.
//!
//! For every listener the discoverer reports online, the dialer opens one
//! announce link (`GET /v1/announce` upgraded to a WebSocket) and registers
//! logical channels on it with `POST /v1/channels`. Defers pushed down the
//! link are routed to the owning channel; resolves go back as
//! `POST /v1/channels/:id/resolve`. Any transport failure tears down the
//! whole link and makes the port discoverable again.

use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tabmesh_core::message::OpenChannelRequest;
use tabmesh_core::{AnnounceFrame, ChannelId, DeferMessage, Error, EventEmitter, LinkId, ResolveMessage, Result};
use tabmesh_rpc::{MessageChannel, MessageKind, ProcedureError, Subscription};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::discovery::{DiscoveryEvent, PortDiscoverer};
use crate::provider::{ChannelProvider, ProviderEvent};

type LinkStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const SERVE_TIMEOUT: Duration = Duration::from_secs(5);

struct DialerLink {
    link_id: LinkId,
    reader: JoinHandle<()>,
}

struct DialerChannel {
    port: u16,
    channel: MessageChannel,
    _resolve: Subscription,
    /// Defers that arrived before a server attached. Non-empty only while a
    /// drain task is waiting.
    backlog: Vec<DeferMessage>,
}

enum DeferRoute {
    Deliver(MessageChannel, DeferMessage),
    Drain(MessageChannel),
    Queued,
    Unknown,
}

struct DialerInner {
    host: String,
    http: reqwest::Client,
    discoverer: Option<PortDiscoverer>,
    serve_timeout: Duration,
    links: Mutex<HashMap<u16, DialerLink>>,
    channels: Mutex<HashMap<ChannelId, DialerChannel>>,
    events: EventEmitter<ProviderEvent>,
}

#[derive(Clone)]
pub struct DialerProvider {
    inner: Arc<DialerInner>,
}

impl DialerProvider {
    /// `discoverer`, when given, is told to forget ports whose link failed.
    pub fn new(host: impl Into<String>, discoverer: Option<PortDiscoverer>) -> Result<Self> {
        Self::with_serve_timeout(host, discoverer, SERVE_TIMEOUT)
    }

    /// `serve_timeout` bounds how long a defer waits for a server to attach
    /// to its channel before it is answered as unavailable.
    pub fn with_serve_timeout(
        host: impl Into<String>,
        discoverer: Option<PortDiscoverer>,
        serve_timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Http(format!("failed to build http client: {}", e)))?;
        Ok(Self {
            inner: Arc::new(DialerInner {
                host: host.into(),
                http,
                discoverer,
                serve_timeout,
                links: Mutex::new(HashMap::new()),
                channels: Mutex::new(HashMap::new()),
                events: EventEmitter::new(),
            }),
        })
    }

    fn base_url(&self, port: u16) -> String {
        format!("http://{}:{}", self.inner.host, port)
    }

    pub fn link_id(&self, port: u16) -> Option<LinkId> {
        self.inner.links.lock().get(&port).map(|l| l.link_id.clone())
    }

    pub fn link_count(&self) -> usize {
        self.inner.links.lock().len()
    }

    pub fn channel_count(&self) -> usize {
        self.inner.channels.lock().len()
    }

    /// Open the announce link to the listener on `port`. Reuses a live link.
    pub async fn connect(&self, port: u16) -> Result<LinkId> {
        if let Some(link_id) = self.link_id(port) {
            return Ok(link_id);
        }

        let raw = format!("ws://{}:{}/v1/announce", self.inner.host, port);
        let url = url::Url::parse(&raw)
            .map_err(|e| Error::Validation(format!("invalid announce url {}: {}", raw, e)))?;
        let (mut stream, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url))
            .await
            .map_err(|_| Error::Timeout(format!("announce link to port {} not established", port)))?
            .map_err(|e| Error::Transport(format!("announce link to port {} failed: {}", port, e)))?;

        let link_id = tokio::time::timeout(CONNECT_TIMEOUT, read_hello(&mut stream))
            .await
            .map_err(|_| Error::Timeout(format!("no hello from port {}", port)))??;

        // The reader waits until the link is registered, so frames never
        // race ahead of the map insert.
        let (ready_tx, ready_rx) = oneshot::channel();
        let reader = tokio::spawn(self.clone().read_link(port, link_id.clone(), stream, ready_rx));
        let previous = self.inner.links.lock().insert(
            port,
            DialerLink {
                link_id: link_id.clone(),
                reader,
            },
        );
        if let Some(old) = previous {
            old.reader.abort();
        }
        let _ = ready_tx.send(());

        info!(port, link_id = %link_id, "Announce link established");
        Ok(link_id)
    }

    async fn read_link(self, port: u16, link_id: LinkId, mut stream: LinkStream, ready: oneshot::Receiver<()>) {
        if ready.await.is_err() {
            return;
        }
        loop {
            match stream.next().await {
                Some(Ok(WsMessage::Text(text))) => self.handle_frame(&text),
                Some(Ok(WsMessage::Close(_))) | None => {
                    info!(port, link_id = %link_id, "Announce link closed by listener");
                    break;
                }
                Some(Err(e)) => {
                    warn!(port, link_id = %link_id, error = %e, "Announce link read error");
                    break;
                }
                Some(Ok(_)) => {}
            }
        }
        self.drop_link_if(port, &link_id);
    }

    fn handle_frame(&self, text: &str) {
        let frame: AnnounceFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Malformed announce frame");
                return;
            }
        };
        match frame {
            AnnounceFrame::Defer { channel_id, message } => match self.route_defer(&channel_id, message) {
                DeferRoute::Deliver(channel, message) => {
                    let call_id = message.id.clone();
                    if channel.incoming().emit(message) == 0 {
                        reject_unserved(&channel, call_id);
                    }
                }
                DeferRoute::Drain(channel) => {
                    debug!(channel_id = %channel_id, "Defer queued until a server attaches");
                    tokio::spawn(self.clone().drain_backlog(channel_id, channel));
                }
                DeferRoute::Queued => {}
                DeferRoute::Unknown => debug!(channel_id = %channel_id, "Defer for unknown channel"),
            },
            AnnounceFrame::Closed { channel_id } => {
                if self.release_channel(&channel_id) {
                    info!(channel_id = %channel_id, "Channel closed by listener");
                }
            }
            AnnounceFrame::Hello { link_id } => debug!(link_id = %link_id, "Ignoring repeated hello"),
        }
    }

    fn route_defer(&self, id: &ChannelId, message: DeferMessage) -> DeferRoute {
        let mut channels = self.inner.channels.lock();
        let Some(entry) = channels.get_mut(id) else {
            return DeferRoute::Unknown;
        };
        if entry.backlog.is_empty() && entry.channel.incoming().listener_count(MessageKind::Defer) > 0 {
            return DeferRoute::Deliver(entry.channel.clone(), message);
        }
        entry.backlog.push(message);
        if entry.backlog.len() == 1 {
            DeferRoute::Drain(entry.channel.clone())
        } else {
            DeferRoute::Queued
        }
    }

    /// Hand queued defers to the server once one attaches; answer them with
    /// an `UNAVAILABLE` failure if none does in time.
    async fn drain_backlog(self, id: ChannelId, channel: MessageChannel) {
        let served = channel
            .incoming()
            .wait_for_listener(MessageKind::Defer, self.inner.serve_timeout)
            .await;
        let backlog = match self.inner.channels.lock().get_mut(&id) {
            Some(entry) => std::mem::take(&mut entry.backlog),
            None => return,
        };
        if !served {
            warn!(channel_id = %id, pending = backlog.len(), "No server attached to channel");
        }
        for message in backlog {
            let call_id = message.id.clone();
            if channel.incoming().emit(message) == 0 {
                reject_unserved(&channel, call_id);
            }
        }
    }

    /// Register a new logical channel on the link to `port`.
    pub async fn open_channel(&self, port: u16) -> Result<ChannelId> {
        let link_id = self
            .link_id(port)
            .ok_or_else(|| Error::NotFound(format!("no announce link on port {}", port)))?;
        let id = ChannelId::generate();
        let channel = MessageChannel::new();

        let weak = Arc::downgrade(&self.inner);
        let resolve_url = format!("{}/v1/channels/{}/resolve", self.base_url(port), id);
        let resolve = channel.outgoing().subscribe_resolve(move |msg| {
            let weak = weak.clone();
            let url = resolve_url.clone();
            tokio::spawn(post_resolve(weak, port, url, msg));
        });

        self.inner.channels.lock().insert(
            id.clone(),
            DialerChannel {
                port,
                channel,
                _resolve: resolve,
                backlog: Vec::new(),
            },
        );
        // Hosts attach before the listener can push the first defer.
        self.inner.events.emit(ProviderEvent::Connected(id.clone()));

        let body = OpenChannelRequest {
            link_id: link_id.to_string(),
            channel_id: id.to_string(),
        };
        let response = self
            .inner
            .http
            .post(format!("{}/v1/channels", self.base_url(port)))
            .json(&body)
            .send()
            .await;
        match response {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => {
                self.release_channel(&id);
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                return Err(Error::Http(format!("open channel rejected ({}): {}", status, text)));
            }
            Err(e) => {
                self.release_channel(&id);
                self.drop_link(port);
                return Err(Error::Transport(format!("open channel on port {} failed: {}", port, e)));
            }
        }

        info!(port, channel_id = %id, "Channel opened");
        Ok(id)
    }

    /// Ask the listener to close the channel, then release it locally.
    pub async fn close_channel(&self, id: &ChannelId) -> Result<()> {
        let port = self
            .inner
            .channels
            .lock()
            .get(id)
            .map(|c| c.port)
            .ok_or_else(|| Error::NotFound(format!("unknown channel {}", id)))?;

        let url = format!("{}/v1/channels/{}", self.base_url(port), id);
        match self.inner.http.delete(url).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => debug!(channel_id = %id, status = %resp.status(), "Close rejected by listener"),
            Err(e) => warn!(channel_id = %id, error = %e, "Close request failed"),
        }
        self.release_channel(id);
        Ok(())
    }

    /// Forget a channel; emits `Disconnected` only for the call that
    /// actually removed it.
    fn release_channel(&self, id: &ChannelId) -> bool {
        let removed = self.inner.channels.lock().remove(id).is_some();
        if removed {
            self.inner.events.emit(ProviderEvent::Disconnected(id.clone()));
        }
        removed
    }

    /// Tear down the link on `port` and every channel riding on it.
    pub fn drop_link(&self, port: u16) {
        let link = self.inner.links.lock().remove(&port);
        if let Some(link) = link {
            link.reader.abort();
        }
        self.release_port(port);
    }

    fn drop_link_if(&self, port: u16, link_id: &LinkId) {
        {
            let mut links = self.inner.links.lock();
            match links.get(&port) {
                Some(link) if &link.link_id == link_id => {
                    links.remove(&port);
                }
                _ => return,
            }
        }
        self.release_port(port);
    }

    fn release_port(&self, port: u16) {
        let closed: Vec<ChannelId> = {
            let mut channels = self.inner.channels.lock();
            let ids: Vec<ChannelId> = channels
                .iter()
                .filter(|(_, c)| c.port == port)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &ids {
                channels.remove(id);
            }
            ids
        };
        for id in &closed {
            self.inner.events.emit(ProviderEvent::Disconnected(id.clone()));
        }
        if let Some(discoverer) = &self.inner.discoverer {
            discoverer.forget(port);
        }
        if !closed.is_empty() {
            info!(port, channels = closed.len(), "Link dropped");
        }
    }

    async fn connect_and_open(&self, port: u16) -> Result<ChannelId> {
        self.connect(port).await?;
        self.open_channel(port).await
    }

    /// Follow discovery events until shutdown: one link and one channel per
    /// online listener. Each port attaches on its own task, so a stalled
    /// listener never holds up the others.
    pub async fn run(
        &self,
        mut discovery: mpsc::UnboundedReceiver<DiscoveryEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!(host = %self.inner.host, "Dialer started");
        let mut attaching: HashMap<u16, JoinHandle<()>> = HashMap::new();
        loop {
            tokio::select! {
                event = discovery.recv() => {
                    attaching.retain(|_, task| !task.is_finished());
                    match event {
                        Some(DiscoveryEvent::Online(port)) => {
                            if attaching.contains_key(&port) {
                                debug!(port, "Attach already in progress");
                                continue;
                            }
                            attaching.insert(port, tokio::spawn(self.clone().attach(port)));
                        }
                        Some(DiscoveryEvent::Offline(port)) => {
                            if let Some(task) = attaching.remove(&port) {
                                task.abort();
                            }
                            self.drop_link(port);
                        }
                        None => break,
                    }
                }
                _ = shutdown.recv() => {
                    info!("Dialer shutting down");
                    break;
                }
            }
        }
        for (_, task) in attaching {
            task.abort();
        }
        self.shutdown().await;
    }

    async fn attach(self, port: u16) {
        if let Err(e) = self.connect_and_open(port).await {
            warn!(port, error = %e, "Failed to attach to listener");
            if let Some(discoverer) = &self.inner.discoverer {
                discoverer.forget(port);
            }
        }
    }

    /// Close every channel politely, then drop all links.
    pub async fn shutdown(&self) {
        let ids: Vec<ChannelId> = self.inner.channels.lock().keys().cloned().collect();
        for id in ids {
            let _ = self.close_channel(&id).await;
        }
        let ports: Vec<u16> = self.inner.links.lock().keys().copied().collect();
        for port in ports {
            self.drop_link(port);
        }
    }
}

async fn read_hello(stream: &mut LinkStream) -> Result<LinkId> {
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(WsMessage::Text(text)) => {
                return match serde_json::from_str::<AnnounceFrame>(&text)? {
                    AnnounceFrame::Hello { link_id } => Ok(link_id),
                    other => Err(Error::Transport(format!("expected hello, got {:?}", other))),
                };
            }
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => return Err(Error::Transport(format!("announce link read failed: {}", e))),
        }
    }
    Err(Error::Transport("announce link closed before hello".to_string()))
}

fn reject_unserved(channel: &MessageChannel, call_id: String) {
    warn!(call_id = %call_id, "Defer arrived with no server attached");
    let error = ProcedureError::new(ProcedureError::UNAVAILABLE, "No server attached to channel");
    channel.outgoing().emit(ResolveMessage::err(call_id, error.to_value()));
}

async fn post_resolve(inner: Weak<DialerInner>, port: u16, url: String, msg: ResolveMessage) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let call_id = msg.id.clone();
    let failed = match inner.http.post(&url).json(&msg).send().await {
        Ok(resp) if resp.status().is_success() => false,
        Ok(resp) if resp.status() == reqwest::StatusCode::NOT_FOUND => {
            // The listener already forgot the channel; a closed frame follows.
            debug!(call_id = %call_id, "Resolve for channel the listener no longer knows");
            false
        }
        Ok(resp) => {
            warn!(call_id = %call_id, status = %resp.status(), "Resolve rejected");
            false
        }
        Err(e) => {
            warn!(port, call_id = %call_id, error = %e, "Resolve send failed");
            true
        }
    };
    if failed {
        DialerProvider { inner }.drop_link(port);
    }
}

impl ChannelProvider for DialerProvider {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ProviderEvent> {
        self.inner.events.subscribe()
    }

    fn get_message_channel(&self, id: &ChannelId) -> Result<MessageChannel> {
        self.inner
            .channels
            .lock()
            .get(id)
            .map(|c| c.channel.clone())
            .ok_or_else(|| Error::NotFound(format!("unknown channel {}", id)))
    }

    fn channel_ids(&self) -> Vec<ChannelId> {
        self.inner.channels.lock().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::ListenerProvider;
    use crate::peer::PeerHost;
    use crate::registry::ChannelRegistry;
    use crate::server::{serve, ListenerState};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tabmesh_core::config::RpcConfig;
    use tabmesh_rpc::{BrowserPeer, BrowserProcedures, CallRequest, PeerInfo, RpcClient, RpcServer};

    async fn serve_listener() -> (u16, ListenerProvider, ChannelRegistry, broadcast::Sender<()>) {
        let provider = ListenerProvider::new();
        let registry = ChannelRegistry::new(Arc::new(provider.clone()), &RpcConfig::default());
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = broadcast::channel(4);
        let state = ListenerState {
            provider: provider.clone(),
            registry: registry.clone(),
        };
        tokio::spawn(async move { serve(listener, state, rx).await });
        (port, provider, registry, tx)
    }

    async fn spawn_listener() -> (u16, ListenerProvider, broadcast::Sender<()>) {
        let (port, provider, _registry, tx) = serve_listener().await;
        (port, provider, tx)
    }

    async fn spawn_listener_with_registry() -> (u16, ListenerProvider, ChannelRegistry, broadcast::Sender<()>) {
        let (port, provider, registry, tx) = serve_listener().await;
        let events = provider.subscribe();
        let shutdown = tx.subscribe();
        let runner = registry.clone();
        tokio::spawn(async move { runner.run(events, shutdown).await });
        (port, provider, registry, tx)
    }

    /// Answers `peer.getInfo` with a fresh peer id per call.
    #[derive(Default)]
    struct CountingPeer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl BrowserPeer for CountingPeer {
        async fn get_info(&self) -> std::result::Result<PeerInfo, ProcedureError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(PeerInfo {
                peer_id: format!("peer-{}", n),
                name: "counting".to_string(),
                version: "0.1.0".to_string(),
                procedures: vec![],
                windows: vec![],
            })
        }
    }

    async fn wait_until<F: Fn() -> bool>(check: F, within: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        while tokio::time::Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ProviderEvent>) -> ProviderEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no provider event")
            .expect("event stream closed")
    }

    #[tokio::test]
    async fn test_channels_share_one_link() {
        let (port, listener, _shutdown) = spawn_listener().await;
        let dialer = DialerProvider::new("127.0.0.1", None).unwrap();

        let link = dialer.connect(port).await.unwrap();
        assert_eq!(dialer.connect(port).await.unwrap(), link);

        let a = dialer.open_channel(port).await.unwrap();
        let b = dialer.open_channel(port).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(dialer.link_count(), 1);
        assert_eq!(listener.multiplexer().link_of(&a), Some(link.clone()));
        assert_eq!(listener.multiplexer().link_of(&b), Some(link));
    }

    #[tokio::test]
    async fn test_listener_close_reaches_dialer_once() {
        let (port, listener, _shutdown) = spawn_listener().await;
        let dialer = DialerProvider::new("127.0.0.1", None).unwrap();
        let mut events = dialer.subscribe();

        dialer.connect(port).await.unwrap();
        let id = dialer.open_channel(port).await.unwrap();
        assert_eq!(next_event(&mut events).await, ProviderEvent::Connected(id.clone()));

        listener.close_channel(id.as_str()).unwrap();
        assert_eq!(next_event(&mut events).await, ProviderEvent::Disconnected(id.clone()));
        assert!(dialer.get_message_channel(&id).is_err());
        assert!(dialer.close_channel(&id).await.is_err());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_drop_link_disconnects_every_channel() {
        let (port, _listener, _shutdown) = spawn_listener().await;
        let dialer = DialerProvider::new("127.0.0.1", None).unwrap();
        let mut events = dialer.subscribe();

        dialer.connect(port).await.unwrap();
        dialer.open_channel(port).await.unwrap();
        dialer.open_channel(port).await.unwrap();
        next_event(&mut events).await;
        next_event(&mut events).await;

        dialer.drop_link(port);
        for _ in 0..2 {
            assert!(matches!(next_event(&mut events).await, ProviderEvent::Disconnected(_)));
        }
        assert_eq!(dialer.channel_count(), 0);
        assert_eq!(dialer.link_count(), 0);
        assert!(dialer.open_channel(port).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_served_channels_are_identified() {
        let (port, _listener, registry, shutdown) = spawn_listener_with_registry().await;
        let dialer = DialerProvider::new("127.0.0.1", None).unwrap();
        let host = Arc::new(PeerHost::new(
            Arc::new(BrowserProcedures::new(Arc::new(CountingPeer::default()))),
            Arc::new(dialer.clone()),
        ));
        {
            let host = host.clone();
            let events = dialer.subscribe();
            let shutdown = shutdown.subscribe();
            tokio::spawn(async move { host.run(events, shutdown).await });
        }

        dialer.connect(port).await.unwrap();
        let mut opened = Vec::new();
        for n in 1..=10 {
            opened.push(dialer.open_channel(port).await.unwrap());
            let identified = wait_until(|| registry.peer_count() == n, Duration::from_secs(2)).await;
            assert!(identified, "channel {} was never identified", n);
        }

        let mut seen: Vec<ChannelId> = registry.peers().into_iter().map(|p| p.channel_id).collect();
        seen.sort();
        opened.sort();
        assert_eq!(seen, opened);
        assert_eq!(host.serving_count(), 10);
    }

    #[tokio::test]
    async fn test_defer_waits_for_late_server() {
        let (port, listener, _shutdown) = spawn_listener().await;
        let dialer = DialerProvider::new("127.0.0.1", None).unwrap();
        dialer.connect(port).await.unwrap();
        let id = dialer.open_channel(port).await.unwrap();

        let client = RpcClient::new();
        client.bind_channel(listener.get_message_channel(&id).unwrap()).unwrap();
        let call = tokio::spawn(async move { client.call(CallRequest::new("peer.getInfo")).await });

        // Give the defer time to reach the dialer before anything serves it.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let server = RpcServer::new(BrowserProcedures::new(Arc::new(CountingPeer::default())));
        server.start_listen(dialer.get_message_channel(&id).unwrap()).unwrap();

        let info = call.await.unwrap().unwrap();
        assert_eq!(info["peerId"], "peer-0");
    }

    #[tokio::test]
    async fn test_unserved_defer_is_rejected() {
        let channel = MessageChannel::new();
        let serve_timeout = Duration::from_millis(100);
        let dialer = DialerProvider::with_serve_timeout("127.0.0.1", None, serve_timeout).unwrap();
        let id = ChannelId::generate();
        let answers = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = answers.clone();
        let resolve = channel.outgoing().subscribe_resolve(move |msg| sink.lock().push(msg));
        dialer.inner.channels.lock().insert(
            id.clone(),
            DialerChannel {
                port: 1,
                channel: channel.clone(),
                _resolve: resolve,
                backlog: Vec::new(),
            },
        );

        let frame = serde_json::json!({
            "type": "defer",
            "channelId": id.as_str(),
            "message": {"id": "1-c-peer.getInfo", "procedure": "peer.getInfo", "args": []},
        });
        dialer.handle_frame(&frame.to_string());
        assert!(answers.lock().is_empty());

        tokio::time::sleep(serve_timeout * 3).await;
        let answers = answers.lock();
        assert_eq!(answers.len(), 1);
        assert!(!answers[0].is_ok);
        assert_eq!(answers[0].id, "1-c-peer.getInfo");
        assert_eq!(answers[0].result["code"], ProcedureError::UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_stalled_listener_does_not_block_others() {
        // Accepts connections but never answers the WebSocket handshake.
        let stalled = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let stalled_port = stalled.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = stalled.accept().await {
                held.push(socket);
            }
        });
        let (port, _listener, shutdown) = spawn_listener().await;

        let dialer = DialerProvider::new("127.0.0.1", None).unwrap();
        let mut events = dialer.subscribe();
        let (discovery_tx, discovery_rx) = mpsc::unbounded_channel();
        {
            let dialer = dialer.clone();
            let shutdown = shutdown.subscribe();
            tokio::spawn(async move { dialer.run(discovery_rx, shutdown).await });
        }

        discovery_tx.send(DiscoveryEvent::Online(stalled_port)).unwrap();
        discovery_tx.send(DiscoveryEvent::Online(port)).unwrap();
        let connected = tokio::time::timeout(CONNECT_TIMEOUT / 2, events.recv())
            .await
            .expect("healthy listener waited behind the stalled one")
            .unwrap();
        let id = match connected {
            ProviderEvent::Connected(id) => id,
            other => panic!("expected a connected event, got {:?}", other),
        };
        assert!(dialer.get_message_channel(&id).is_ok());
        assert!(dialer.link_id(port).is_some());
        assert!(dialer.link_id(stalled_port).is_none());
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let vacant = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = vacant.local_addr().unwrap().port();
        drop(vacant);

        let dialer = DialerProvider::new("127.0.0.1", None).unwrap();
        assert!(dialer.connect(port).await.is_err());
        assert_eq!(dialer.link_count(), 0);
    }
}
