//! Serving end of an RPC pair.
//!
//! A procedure table is a closed set of named operations: the table's
//! `Procedure` type maps wire dot-paths onto variants, and `invoke` matches on
//! them exhaustively. Every incoming defer runs on its own task and produces
//! exactly one resolve; nothing a procedure does escapes the message loop.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tabmesh_core::{DeferMessage, Error, ExtraArgs, ResolveMessage, Result};
use tracing::{debug, error, warn};

use crate::channel::{MessageChannel, Subscription};

/// Failure payload carried in the `result` of an `isOk: false` resolve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ProcedureError {
    pub code: String,
    pub message: String,
}

impl ProcedureError {
    pub const NOT_FOUND: &'static str = "NOT_FOUND";
    pub const BAD_ARGS: &'static str = "BAD_ARGS";
    pub const UNSUPPORTED: &'static str = "UNSUPPORTED";
    pub const FAILED: &'static str = "FAILED";
    pub const INTERNAL: &'static str = "INTERNAL";
    pub const UNAVAILABLE: &'static str = "UNAVAILABLE";

    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn not_found(path: &str) -> Self {
        Self::new(Self::NOT_FOUND, format!("Procedure not found: {}", path))
    }

    pub fn bad_args(message: impl Into<String>) -> Self {
        Self::new(Self::BAD_ARGS, message)
    }

    pub fn unsupported(path: &str) -> Self {
        Self::new(Self::UNSUPPORTED, format!("Procedure not supported by this peer: {}", path))
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(Self::FAILED, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Self::INTERNAL, message)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Recover a procedure error from a remote failure payload.
    pub fn from_remote(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

/// Closed set of procedures addressable by dot-path.
pub trait ProcedurePath: Sized + Copy + Send + Sync + 'static {
    fn from_path(path: &str) -> Option<Self>;
    fn path(&self) -> &'static str;
    fn all() -> &'static [Self];
}

#[async_trait]
pub trait Procedures: Send + Sync + 'static {
    type Procedure: ProcedurePath;

    async fn invoke(
        &self,
        procedure: Self::Procedure,
        args: Vec<Value>,
        extra_args: ExtraArgs,
    ) -> std::result::Result<Value, ProcedureError>;
}

/// Resolve one defer against a procedure table.
pub async fn dispatch<P: Procedures>(procedures: &P, msg: DeferMessage) -> ResolveMessage {
    let Some(procedure) = P::Procedure::from_path(&msg.procedure) else {
        debug!(procedure = %msg.procedure, "Unknown procedure");
        return ResolveMessage::err(msg.id, ProcedureError::not_found(&msg.procedure).to_value());
    };

    match procedures.invoke(procedure, msg.args, msg.extra_args).await {
        Ok(result) => ResolveMessage::ok(msg.id, result),
        Err(e) => {
            debug!(procedure = %msg.procedure, error = %e, "Procedure failed");
            ResolveMessage::err(msg.id, e.to_value())
        }
    }
}

pub struct RpcServer<P: Procedures> {
    procedures: Arc<P>,
    listening: Mutex<Option<Subscription>>,
}

impl<P: Procedures> RpcServer<P> {
    pub fn new(procedures: P) -> Self {
        Self::from_arc(Arc::new(procedures))
    }

    pub fn from_arc(procedures: Arc<P>) -> Self {
        Self {
            procedures,
            listening: Mutex::new(None),
        }
    }

    pub fn procedures(&self) -> &Arc<P> {
        &self.procedures
    }

    pub fn is_listening(&self) -> bool {
        self.listening.lock().is_some()
    }

    /// Serve `defer` events arriving on the channel's incoming port, answering
    /// on its outgoing port. Must be called from within a tokio runtime.
    pub fn start_listen(&self, channel: MessageChannel) -> Result<()> {
        let mut listening = self.listening.lock();
        if listening.is_some() {
            return Err(Error::Channel("rpc server is already listening".to_string()));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Other(format!("rpc server needs a tokio runtime: {}", e)))?;

        let procedures = self.procedures.clone();
        let outgoing = channel.outgoing().clone();
        let subscription = channel.incoming().subscribe_defer(move |msg| {
            let procedures = procedures.clone();
            let outgoing = outgoing.clone();
            let inner = runtime.clone();
            runtime.spawn(async move {
                let id = msg.id.clone();
                let path = msg.procedure.clone();
                // Inner task so a panicking procedure still yields a resolve.
                let resolve = match inner.spawn(async move { dispatch(procedures.as_ref(), msg).await }).await {
                    Ok(resolve) => resolve,
                    Err(e) => {
                        error!(procedure = %path, error = %e, "Procedure task aborted");
                        ResolveMessage::err(
                            id,
                            ProcedureError::internal(format!("procedure '{}' aborted", path)).to_value(),
                        )
                    }
                };
                if outgoing.emit(resolve) == 0 {
                    warn!(procedure = %path, "Resolve dropped: no transport attached");
                }
            });
        });

        *listening = Some(subscription);
        Ok(())
    }

    /// Stop serving. Calls already running still emit their resolve.
    pub fn stop_listen(&self) -> bool {
        self.listening.lock().take().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{CallRequest, RpcClient};
    use serde_json::json;
    use std::time::Duration;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum MathProcedure {
        Add,
        Fail,
        Sleep,
        Panic,
    }

    impl ProcedurePath for MathProcedure {
        fn from_path(path: &str) -> Option<Self> {
            Self::all().iter().copied().find(|p| p.path() == path)
        }

        fn path(&self) -> &'static str {
            match self {
                MathProcedure::Add => "math.add",
                MathProcedure::Fail => "math.fail",
                MathProcedure::Sleep => "math.sleep",
                MathProcedure::Panic => "math.panic",
            }
        }

        fn all() -> &'static [Self] {
            &[
                MathProcedure::Add,
                MathProcedure::Fail,
                MathProcedure::Sleep,
                MathProcedure::Panic,
            ]
        }
    }

    struct Math;

    #[async_trait]
    impl Procedures for Math {
        type Procedure = MathProcedure;

        async fn invoke(
            &self,
            procedure: MathProcedure,
            args: Vec<Value>,
            _extra_args: ExtraArgs,
        ) -> std::result::Result<Value, ProcedureError> {
            match procedure {
                MathProcedure::Add => {
                    let sum: i64 = args.iter().filter_map(|v| v.as_i64()).sum();
                    Ok(json!(sum))
                }
                MathProcedure::Fail => Err(ProcedureError::failed("division by zero")),
                MathProcedure::Sleep => {
                    let ms = args.first().and_then(|v| v.as_u64()).unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(json!("slept"))
                }
                MathProcedure::Panic => panic!("procedure panicked on purpose"),
            }
        }
    }

    fn loopback() -> (Arc<RpcClient>, RpcServer<Math>) {
        let channel = MessageChannel::new();
        let client = Arc::new(RpcClient::with_timeout(Some(Duration::from_secs(5))));
        client.bind_channel(channel.clone()).unwrap();
        let server = RpcServer::new(Math);
        server.start_listen(channel.reverse()).unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_call_round_trip_over_reversed_channel() {
        let (client, _server) = loopback();
        let result = client
            .call(CallRequest::new("math.add").with_args(vec![json!(2), json!(3)]))
            .await
            .unwrap();
        assert_eq!(result, json!(5));
    }

    #[tokio::test]
    async fn test_unknown_procedure_names_missing_path() {
        let (client, server) = loopback();
        let err = client.call(CallRequest::new("math.divide")).await.unwrap_err();
        let remote = match &err {
            Error::Remote(value) => ProcedureError::from_remote(value).unwrap(),
            other => panic!("unexpected error {:?}", other),
        };
        assert_eq!(remote.code, ProcedureError::NOT_FOUND);
        assert!(remote.message.contains("math.divide"));
        assert!(server.is_listening());
    }

    #[tokio::test]
    async fn test_procedure_error_becomes_failed_resolve() {
        let (client, _server) = loopback();
        let err = client.call(CallRequest::new("math.fail")).await.unwrap_err();
        assert_eq!(err.remote_message(), Some("division by zero"));
    }

    #[tokio::test]
    async fn test_panicking_procedure_does_not_stop_server() {
        let (client, _server) = loopback();
        let err = client.call(CallRequest::new("math.panic")).await.unwrap_err();
        let remote = match err {
            Error::Remote(value) => ProcedureError::from_remote(&value).unwrap(),
            other => panic!("unexpected error {:?}", other),
        };
        assert_eq!(remote.code, ProcedureError::INTERNAL);

        let ok = client
            .call(CallRequest::new("math.add").with_args(vec![json!(1)]))
            .await
            .unwrap();
        assert_eq!(ok, json!(1));
    }

    #[tokio::test]
    async fn test_slow_call_does_not_block_fast_one() {
        let (client, _server) = loopback();
        let slow = {
            let c = client.clone();
            tokio::spawn(async move {
                c.call(CallRequest::new("math.sleep").with_args(vec![json!(300)]))
                    .await
            })
        };
        let fast = tokio::time::timeout(
            Duration::from_millis(200),
            client.call(CallRequest::new("math.add").with_args(vec![json!(4), json!(4)])),
        )
        .await
        .expect("fast call blocked behind slow call")
        .unwrap();
        assert_eq!(fast, json!(8));
        assert_eq!(slow.await.unwrap().unwrap(), json!("slept"));
    }

    #[tokio::test]
    async fn test_stop_listen_detaches_server() {
        let (client, server) = loopback();
        assert!(server.stop_listen());
        assert!(!server.stop_listen());
        let err = client.call(CallRequest::new("math.add")).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[test]
    fn test_start_listen_outside_runtime_fails() {
        let server = RpcServer::new(Math);
        assert!(server.start_listen(MessageChannel::new()).is_err());
    }
}
