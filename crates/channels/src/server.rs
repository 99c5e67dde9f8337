//! HTTP/WebSocket surface of the listener.
//!
//! `GET /` answers discovery probes, `GET /v1/announce` is the push link to a
//! dialer, and the `/v1/channels` mutations carry everything the dialer sends
//! back. `/v1/peers` exposes the registry for operators.

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path as AxumPath, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use std::ops::RangeInclusive;
use tabmesh_core::message::{OpenChannelRequest, PeerCallRequest, ProbeResponse, SERVICE_NAME};
use tabmesh_core::{Error, ResolveMessage, Result};
use tabmesh_rpc::CallRequest;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::listener::ListenerProvider;
use crate::registry::ChannelRegistry;

#[derive(Clone)]
pub struct ListenerState {
    pub provider: ListenerProvider,
    pub registry: ChannelRegistry,
}

struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Validation(_) | Error::InvalidKey(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Channel(_) => StatusCode::CONFLICT,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::Unbound(_) | Error::Transport(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

pub fn router(state: ListenerState) -> Router {
    Router::new()
        .route("/", get(handle_probe))
        .route("/v1/announce", get(handle_announce))
        .route("/v1/channels", post(handle_channel_open))
        .route("/v1/channels/:id", delete(handle_channel_close))
        .route("/v1/channels/:id/resolve", post(handle_channel_resolve))
        .route("/v1/peers", get(handle_peers))
        .route("/v1/peers/:peer_id/call", post(handle_peer_call))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind the first free port of `ports` on `host`.
pub async fn bind_in_range(host: &str, ports: RangeInclusive<u16>) -> Result<TcpListener> {
    let (start, end) = (*ports.start(), *ports.end());
    for port in ports {
        match TcpListener::bind((host, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => debug!(port, error = %e, "Port unavailable"),
        }
    }
    Err(Error::Other(format!("no free port on {} in {}-{}", host, start, end)))
}

/// Serve until the shutdown signal fires.
pub async fn serve(
    listener: TcpListener,
    state: ListenerState,
    shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(addr = %addr, "Listener serving");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let mut rx = shutdown;
            let _ = rx.recv().await;
        })
        .await?;
    info!("Listener stopped");
    Ok(())
}

async fn handle_probe() -> impl IntoResponse {
    Json(ProbeResponse {
        service: SERVICE_NAME.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn handle_announce(ws: WebSocketUpgrade, State(state): State<ListenerState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_announce_link(socket, state))
}

async fn handle_announce_link(socket: WebSocket, state: ListenerState) {
    let (link_id, mut frames) = state.provider.attach_link();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Failed to encode announce frame");
                    continue;
                }
            };
            if let Err(e) = ws_sender.send(WsMessage::Text(text)).await {
                warn!(error = %e, "Announce link send failed");
                break;
            }
        }
    });

    // The link is push-only; inbound traffic is limited to control frames.
    let recv_link_id = link_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(link_id = %recv_link_id, error = %e, "Announce link receive error");
                    break;
                }
            }
        }
    });

    // Either half ending takes the whole link down.
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
    state.provider.detach_link(&link_id);
}

async fn handle_channel_open(
    State(state): State<ListenerState>,
    Json(req): Json<OpenChannelRequest>,
) -> ApiResult<impl IntoResponse> {
    let id = state.provider.open_channel(&req.link_id, &req.channel_id)?;
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "channelId": id }))))
}

async fn handle_channel_close(
    State(state): State<ListenerState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<StatusCode> {
    state.provider.close_channel(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_channel_resolve(
    State(state): State<ListenerState>,
    AxumPath(id): AxumPath<String>,
    Json(msg): Json<ResolveMessage>,
) -> ApiResult<StatusCode> {
    state.provider.deliver_resolve(&id, msg)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_peers(State(state): State<ListenerState>) -> impl IntoResponse {
    Json(state.registry.peers())
}

async fn handle_peer_call(
    State(state): State<ListenerState>,
    AxumPath(peer_id): AxumPath<String>,
    Json(req): Json<PeerCallRequest>,
) -> ApiResult<impl IntoResponse> {
    let client = state.registry.get_rpc_client_by_browser_id(&peer_id)?;
    let request = CallRequest::new(req.procedure)
        .with_args(req.args)
        .with_extra_args(req.extra_args);
    let body = match client.call(request).await {
        Ok(result) => serde_json::json!({ "isOk": true, "result": result }),
        Err(Error::Remote(result)) => serde_json::json!({ "isOk": false, "result": result }),
        Err(e) => return Err(e.into()),
    };
    Ok(Json(body))
}
