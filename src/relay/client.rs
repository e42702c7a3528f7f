//! `/cdp` socket handling: admission, per-client reader/writer tasks, and
//! command dispatch.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use axum::extract::{ConnectInfo, Path, Query, State, WebSocketUpgrade};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::relay::admission::{self, Denial};
use crate::relay::protocol::{ClientCommand, CloseReason};
use crate::relay::state::{generate_client_id, ClientHandle, Relay};

pub(crate) async fn cdp_upgrade(
    State(relay): State<Arc<Relay>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    admit(relay, peer, &query, &headers, ws, None).await
}

pub(crate) async fn cdp_upgrade_with_id(
    State(relay): State<Arc<Relay>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(client_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    admit(relay, peer, &query, &headers, ws, Some(client_id)).await
}

async fn admit(
    relay: Arc<Relay>,
    peer: SocketAddr,
    query: &HashMap<String, String>,
    headers: &HeaderMap,
    ws: WebSocketUpgrade,
    client_id: Option<String>,
) -> Response {
    if relay.is_draining() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    let token = query
        .get("token")
        .map(String::as_str)
        .or_else(|| bearer_token(headers));

    match admission::check_client(&relay.config.auth, peer.ip(), origin, token) {
        Ok(()) => {}
        Err(Denial::Unauthorized) => {
            warn!(%peer, "Rejected CDP upgrade: missing or invalid bearer token");
            return (StatusCode::UNAUTHORIZED, "Missing or invalid bearer token").into_response();
        }
        Err(Denial::BadOrigin) => {
            warn!(%peer, origin = origin.unwrap_or("<none>"), "Rejected CDP upgrade: forbidden origin");
            return (StatusCode::FORBIDDEN, "Forbidden origin").into_response();
        }
    }

    let client_id = client_id.unwrap_or_else(generate_client_id);
    if relay.clients.lock().await.contains_key(&client_id) {
        return (StatusCode::CONFLICT, "Client id already connected").into_response();
    }

    ws.on_upgrade(move |socket| handle_client_socket(socket, relay, client_id))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

async fn handle_client_socket(socket: WebSocket, relay: Arc<Relay>, client_id: String) {
    let (tx, rx) = mpsc::channel(relay.config.limits.write_queue_capacity);
    let (close_tx, close_rx) = oneshot::channel();
    let handle = ClientHandle {
        tx,
        close_tx: Some(close_tx),
        attached_sessions: HashSet::new(),
    };
    if !relay.register_client(&client_id, handle).await {
        // Lost a race with another upgrade claiming the same id.
        let mut socket = socket;
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: 1008,
                reason: Utf8Bytes::from_static("client id already connected"),
            })))
            .await;
        return;
    }
    info!(client = %client_id, "CDP client connected");

    let (ws_tx, mut ws_rx) = socket.split();
    let writer = tokio::spawn(write_frames(
        ws_tx,
        rx,
        close_rx,
        relay.config.limits.drain_grace_ms,
    ));

    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                relay.handle_client_command(&client_id, text.as_str()).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(client = %client_id, error = %e, "Client websocket error");
                break;
            }
        }
    }

    relay.remove_client(&client_id).await;
    let _ = writer.await;
    info!(client = %client_id, "CDP client disconnected");
}

impl Relay {
    /// Dispatch one inbound client frame: intercepted methods are answered
    /// from the target table, everything else goes upstream. Malformed
    /// frames are logged and dropped; the socket stays open.
    pub(crate) async fn handle_client_command(self: &Arc<Self>, client_id: &str, raw: &str) {
        let cmd: ClientCommand = match serde_json::from_str(raw) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!(client = %client_id, error = %e, "Dropping malformed CDP frame");
                return;
            }
        };
        debug!(client = %client_id, method = %cmd.method, "Client command");

        if self.intercept(client_id, &cmd).await {
            return;
        }
        self.forward(
            Some(client_id),
            cmd.id.clone(),
            &cmd.method,
            &cmd.params,
            cmd.session_id.as_deref(),
        )
        .await;
    }
}

/// Writer half shared by both socket kinds: frames come off the bounded
/// queue in order; a close signal drains what is already queued (bounded by
/// the grace period) and then sends the close frame.
pub(crate) async fn write_frames(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<String>,
    mut close_rx: oneshot::Receiver<CloseReason>,
    drain_grace_ms: u64,
) {
    loop {
        tokio::select! {
            biased;
            reason = &mut close_rx => {
                let drain = async {
                    while let Ok(frame) = rx.try_recv() {
                        if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                            return;
                        }
                    }
                };
                let _ = tokio::time::timeout(Duration::from_millis(drain_grace_ms), drain).await;
                if let Ok(reason) = reason {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code: reason.code,
                            reason: Utf8Bytes::from_static(reason.reason),
                        })))
                        .await;
                }
                break;
            }
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            }
        }
    }
}
