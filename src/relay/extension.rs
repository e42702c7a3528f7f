//! `/extension` socket handling: the single privileged upstream.
//!
//! At most one extension socket is current. A newly accepted one
//! supersedes its predecessor, which is closed and has its in-flight
//! requests failed. Frames from the extension are processed in receive
//! order on this one reader task, so clients observe session events before
//! the response they precede.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::relay::admission;
use crate::relay::client::write_frames;
use crate::relay::protocol::{self, CloseReason, ExtensionFrame};
use crate::relay::state::{ExtensionSlot, Relay};

pub(crate) async fn extension_upgrade(
    State(relay): State<Arc<Relay>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if relay.is_draining() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    if !admission::extension_origin_allowed(origin, &relay.config.auth.extension_origins) {
        warn!(
            origin = origin.unwrap_or("<none>"),
            "Rejected extension upgrade: forbidden origin"
        );
        return (StatusCode::FORBIDDEN, "Forbidden origin").into_response();
    }
    ws.on_upgrade(move |socket| handle_extension_socket(socket, relay))
}

async fn handle_extension_socket(socket: WebSocket, relay: Arc<Relay>) {
    let epoch = relay.next_epoch();
    let (tx, rx) = mpsc::channel(relay.config.limits.write_queue_capacity);
    let (close_tx, close_rx) = oneshot::channel();

    let previous = {
        let mut slot = relay.extension.lock().await;
        slot.replace(ExtensionSlot {
            tx,
            close_tx: Some(close_tx),
            epoch,
        })
    };
    if let Some(mut previous) = previous {
        info!(old_epoch = previous.epoch, "Superseding extension connection");
        if let Some(close) = previous.close_tx.take() {
            let _ = close.send(CloseReason::SUPERSEDED);
        }
        relay.extension_lost(previous.epoch).await;
    }
    info!(epoch, "Extension connected");

    // Announce whatever the table already holds (nothing, right after a
    // swap) to the connected clients.
    for (target, _) in relay.target_snapshot().await {
        if let Ok(target) = serde_json::to_value(target) {
            relay
                .broadcast_to_clients(protocol::event_frame(
                    "Target.targetCreated",
                    json!({ "targetInfo": target }),
                    None,
                ))
                .await;
        }
    }

    // Ask the extension to start reporting target lifecycle. The response
    // is discarded on arrival.
    relay
        .forward(
            None,
            Value::Null,
            "Target.setDiscoverTargets",
            &json!({ "discover": true }),
            None,
        )
        .await;

    let (ws_tx, mut ws_rx) = socket.split();
    let writer = tokio::spawn(write_frames(
        ws_tx,
        rx,
        close_rx,
        relay.config.limits.drain_grace_ms,
    ));

    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => relay.handle_extension_frame(text.as_str()).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Extension websocket error");
                break;
            }
        }
    }

    // No-op when a newer connection superseded this one; its accept path
    // already ran the loss sequence for this epoch.
    relay.drop_extension(epoch, None).await;
    let _ = writer.await;
    info!(epoch, "Extension disconnected");
}

impl Relay {
    /// Demultiplex one extension frame: responses feed the correlator,
    /// events update the target table and fan out to clients.
    pub(crate) async fn handle_extension_frame(&self, raw: &str) {
        match ExtensionFrame::parse(raw) {
            Err(e) => warn!(error = %e, "Dropping malformed extension frame"),
            Ok(ExtensionFrame::Response { id, result, error }) => {
                self.complete_pending(id, result, error).await;
            }
            Ok(ExtensionFrame::Event {
                method,
                params,
                session_id,
            }) => {
                self.apply_target_event(&method, &params).await;
                let frame = protocol::event_frame(&method, params, session_id.as_deref());
                match session_id {
                    None => self.broadcast_to_clients(frame).await,
                    Some(session_id) => self.send_to_attached(&session_id, frame).await,
                }
            }
        }
    }

    /// Empty the slot if it still holds `epoch`, then run the loss
    /// sequence. Safe to call from every exit path; only the first caller
    /// for a given epoch does anything.
    pub(crate) async fn drop_extension(&self, epoch: u64, reason: Option<CloseReason>) {
        let slot = {
            let mut extension = self.extension.lock().await;
            if extension.as_ref().map(|slot| slot.epoch) == Some(epoch) {
                extension.take()
            } else {
                None
            }
        };
        let Some(mut slot) = slot else {
            return;
        };
        if let (Some(close), Some(reason)) = (slot.close_tx.take(), reason) {
            let _ = close.send(reason);
        }
        self.extension_lost(epoch).await;
    }

    /// The loss sequence for a departed epoch: fail its in-flight
    /// requests, close every client session, clear the target table.
    pub(crate) async fn extension_lost(&self, epoch: u64) {
        self.fail_pending_for_epoch(epoch).await;
        self.close_all_clients(CloseReason::EXTENSION_GONE).await;
        self.clear_targets().await;
    }
}
