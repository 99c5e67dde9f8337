//! Port discovery: find listeners by scanning a bounded local port range.
//!
//! There is no address book. Every cycle probes each port of the range, and
//! only transitions are reported: a port that stays reachable emits `Online`
//! once, and `Offline` once when it stops answering.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;
use tabmesh_core::config::{DiscoveryConfig, MAX_PORT_RANGE};
use tabmesh_core::{Error, EventEmitter, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Online(u16),
    Offline(u16),
}

impl DiscoveryEvent {
    pub fn port(&self) -> u16 {
        match self {
            DiscoveryEvent::Online(port) | DiscoveryEvent::Offline(port) => *port,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    Idle,
    Discovering,
}

/// Reachability check for one port.
#[async_trait]
pub trait Probe: Send + Sync + 'static {
    async fn is_reachable(&self, port: u16) -> bool;
}

/// `GET http://<host>:<port>/`; any HTTP response counts as reachable.
pub struct HttpProbe {
    client: reqwest::Client,
    host: String,
}

impl HttpProbe {
    pub fn new(host: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Http(format!("failed to build probe client: {}", e)))?;
        Ok(Self {
            client,
            host: host.into(),
        })
    }

    fn url(&self, port: u16) -> String {
        format!("http://{}:{}/", self.host, port)
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn is_reachable(&self, port: u16) -> bool {
        match self.client.get(self.url(port)).send().await {
            Ok(_) => true,
            Err(e) => {
                debug!(port, error = %e, "Probe failed");
                false
            }
        }
    }
}

struct DiscovererInner {
    ports: RangeInclusive<u16>,
    interval: Duration,
    probe_timeout: Duration,
    probe: Arc<dyn Probe>,
    known: Mutex<BTreeSet<u16>>,
    events: EventEmitter<DiscoveryEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct PortDiscoverer {
    inner: Arc<DiscovererInner>,
}

impl PortDiscoverer {
    pub fn new(
        ports: RangeInclusive<u16>,
        interval: Duration,
        probe_timeout: Duration,
        probe: Arc<dyn Probe>,
    ) -> Result<Self> {
        if ports.is_empty() {
            return Err(Error::Config(format!(
                "empty discovery range {}-{}",
                ports.start(),
                ports.end()
            )));
        }
        if ports.end() - ports.start() >= MAX_PORT_RANGE {
            return Err(Error::Config(format!(
                "discovery range {}-{} exceeds {} ports",
                ports.start(),
                ports.end(),
                MAX_PORT_RANGE
            )));
        }
        if interval.is_zero() {
            return Err(Error::Config("scan interval must be positive".to_string()));
        }
        Ok(Self {
            inner: Arc::new(DiscovererInner {
                ports,
                interval,
                probe_timeout,
                probe,
                known: Mutex::new(BTreeSet::new()),
                events: EventEmitter::new(),
                task: Mutex::new(None),
            }),
        })
    }

    pub fn from_config(config: &DiscoveryConfig) -> Result<Self> {
        let probe = HttpProbe::new(config.host.clone(), config.probe_timeout())?;
        Self::new(
            config.ports(),
            config.scan_interval(),
            config.probe_timeout(),
            Arc::new(probe),
        )
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<DiscoveryEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> DiscoveryState {
        match self.inner.task.lock().as_ref() {
            Some(task) if !task.is_finished() => DiscoveryState::Discovering,
            _ => DiscoveryState::Idle,
        }
    }

    /// Ports reachable as of the last completed scan.
    pub fn known_ports(&self) -> Vec<u16> {
        self.inner.known.lock().iter().copied().collect()
    }

    /// Drop `port` from the reachable set so the next scan reports it again.
    pub fn forget(&self, port: u16) -> bool {
        self.inner.known.lock().remove(&port)
    }

    /// Probe the whole range once and emit the transitions.
    pub async fn scan_once(&self) -> Vec<DiscoveryEvent> {
        let inner = &self.inner;
        let probes = inner.ports.clone().map(|port| {
            let probe = inner.probe.clone();
            let limit = inner.probe_timeout;
            async move {
                let reachable = tokio::time::timeout(limit, probe.is_reachable(port))
                    .await
                    .unwrap_or(false);
                (port, reachable)
            }
        });
        let reachable: BTreeSet<u16> = futures::future::join_all(probes)
            .await
            .into_iter()
            .filter(|(_, ok)| *ok)
            .map(|(port, _)| port)
            .collect();

        let events: Vec<DiscoveryEvent> = {
            let mut known = inner.known.lock();
            let events = reachable
                .difference(&known)
                .map(|p| DiscoveryEvent::Online(*p))
                .chain(known.difference(&reachable).map(|p| DiscoveryEvent::Offline(*p)))
                .collect();
            *known = reachable;
            events
        };

        for event in &events {
            match event {
                DiscoveryEvent::Online(port) => info!(port, "Listener online"),
                DiscoveryEvent::Offline(port) => info!(port, "Listener offline"),
            }
            inner.events.emit(*event);
        }
        events
    }

    /// Idle -> Discovering. Returns false if already discovering.
    pub fn start(&self) -> bool {
        let mut task = self.inner.task.lock();
        if matches!(task.as_ref(), Some(t) if !t.is_finished()) {
            return false;
        }
        let this = self.clone();
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.inner.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                this.scan_once().await;
            }
        }));
        info!(
            start = *self.inner.ports.start(),
            end = *self.inner.ports.end(),
            interval_ms = self.inner.interval.as_millis() as u64,
            "Port discovery started"
        );
        true
    }

    /// Discovering -> Idle. The reachable set is kept, so a restart only
    /// reports changes since the last scan.
    pub fn stop(&self) -> bool {
        match self.inner.task.lock().take() {
            Some(task) => {
                task.abort();
                info!("Port discovery stopped");
                true
            }
            None => false,
        }
    }
}
