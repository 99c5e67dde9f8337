//! Calling end of an RPC pair.
//!
//! Every call gets a unique id and a pending continuation. A resolve that
//! arrives on the bound channel settles the matching continuation once; later
//! duplicates are ignored. Calls end on resolution, on their deadline, or when
//! the channel is unbound.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tabmesh_core::{DeferMessage, Error, ExtraArgs, ResolveMessage, Result};
use tokio::sync::oneshot;
use tracing::debug;

use crate::channel::{MessageChannel, Subscription};

/// Deadline applied when the caller does not pick one.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

type PendingTable = Arc<Mutex<HashMap<String, oneshot::Sender<ResolveMessage>>>>;

#[derive(Debug, Clone)]
pub struct CallRequest {
    pub method: String,
    pub args: Vec<Value>,
    pub extra_args: ExtraArgs,
}

impl CallRequest {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            args: Vec::new(),
            extra_args: ExtraArgs::default(),
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_extra_args(mut self, extra_args: ExtraArgs) -> Self {
        self.extra_args = extra_args;
        self
    }
}

struct Binding {
    channel: MessageChannel,
    _subscription: Subscription,
}

/// Removes the pending entry if the call future is dropped before settling.
struct PendingGuard {
    pending: PendingTable,
    id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

pub struct RpcClient {
    client_id: String,
    seq: AtomicU64,
    pending: PendingTable,
    binding: Mutex<Option<Binding>>,
    default_timeout: Option<Duration>,
}

impl RpcClient {
    pub fn new() -> Self {
        Self::with_timeout(Some(DEFAULT_CALL_TIMEOUT))
    }

    /// `None` disables the default deadline; callers then rely on
    /// [`RpcClient::call_with_deadline`] or on unbinding.
    pub fn with_timeout(default_timeout: Option<Duration>) -> Self {
        let mut client_id = uuid::Uuid::new_v4().simple().to_string();
        client_id.truncate(12);
        Self {
            client_id,
            seq: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
            binding: Mutex::new(None),
            default_timeout,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn is_bound(&self) -> bool {
        self.binding.lock().is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Start consuming `resolve` events from the channel's incoming port.
    pub fn bind_channel(&self, channel: MessageChannel) -> Result<()> {
        let mut binding = self.binding.lock();
        if binding.is_some() {
            return Err(Error::Channel(format!(
                "rpc client {} is already bound",
                self.client_id
            )));
        }

        let pending = self.pending.clone();
        let subscription = channel.incoming().subscribe_resolve(move |msg| {
            let waiter = pending.lock().remove(&msg.id);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(msg);
                }
                None => debug!(id = %msg.id, "Ignoring resolve for unknown or settled call"),
            }
        });

        *binding = Some(Binding {
            channel,
            _subscription: subscription,
        });
        Ok(())
    }

    /// Stop listening and reject every call still waiting with
    /// [`Error::Unbound`]. Returns how many calls were abandoned.
    pub fn unbind_channel(&self) -> usize {
        let binding = self.binding.lock().take();
        if binding.is_none() {
            return 0;
        }
        drop(binding);

        let abandoned: Vec<_> = self.pending.lock().drain().collect();
        if !abandoned.is_empty() {
            debug!(client_id = %self.client_id, count = abandoned.len(), "Abandoning pending calls on unbind");
        }
        abandoned.len()
    }

    pub async fn call(&self, request: CallRequest) -> Result<Value> {
        self.call_inner(request, self.default_timeout).await
    }

    pub async fn call_with_deadline(&self, request: CallRequest, deadline: Duration) -> Result<Value> {
        self.call_inner(request, Some(deadline)).await
    }

    fn next_call_id(&self, method: &str) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}-{}", seq, self.client_id, method)
    }

    async fn call_inner(&self, request: CallRequest, deadline: Option<Duration>) -> Result<Value> {
        let channel = self
            .binding
            .lock()
            .as_ref()
            .map(|b| b.channel.clone())
            .ok_or_else(|| {
                Error::Unbound(format!("cannot call '{}': client is not bound", request.method))
            })?;

        let id = self.next_call_id(&request.method);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id.clone(), tx);
        let _guard = PendingGuard {
            pending: self.pending.clone(),
            id: id.clone(),
        };

        let delivered = channel.outgoing().emit(DeferMessage {
            id: id.clone(),
            procedure: request.method.clone(),
            args: request.args,
            extra_args: request.extra_args,
        });
        if delivered == 0 {
            return Err(Error::Transport(format!(
                "no transport attached to carry call '{}'",
                request.method
            )));
        }
        debug!(id = %id, "Call dispatched");

        let outcome = match deadline {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    return Err(Error::Timeout(format!(
                        "call '{}' got no resolution within {:?}",
                        request.method, limit
                    )))
                }
            },
            None => rx.await,
        };

        let resolve = outcome
            .map_err(|_| Error::Unbound(format!("call '{}' abandoned: channel unbound", id)))?;
        if resolve.is_ok {
            Ok(resolve.result)
        } else {
            Err(Error::Remote(resolve.result))
        }
    }
}

impl Default for RpcClient {
    fn default() -> Self {
        Self::new()
    }
}
