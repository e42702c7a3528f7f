//! Shared registries of the relay: the extension slot, the client
//! registry, the target table, and the pending-request table.
//!
//! Each registry sits behind its own lock and critical sections never
//! nest across registries, with one exception: dropping a client while
//! its registry lock is held defers pending-request cleanup until after
//! the lock is released.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use rand::Rng;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use crate::config::Config;
use crate::relay::protocol::{CloseReason, TargetInfo};

/// One per in-flight command forwarded to the extension. Exactly one of
/// {response, timeout, epoch-failure} completes it; completion removes the
/// entry and aborts the timer.
pub struct PendingRequest {
    /// Originating client, or `None` for relay-issued commands.
    pub client_id: Option<String>,
    /// The id the client used; restored on the response frame.
    pub client_msg_id: Value,
    pub method: String,
    pub session_id: Option<String>,
    /// Extension connect-epoch at dispatch time.
    pub epoch: u64,
    pub timeout: tokio::task::AbortHandle,
}

/// The single privileged upstream socket.
pub struct ExtensionSlot {
    pub tx: mpsc::Sender<String>,
    pub close_tx: Option<oneshot::Sender<CloseReason>>,
    pub epoch: u64,
}

/// A connected CDP client.
pub struct ClientHandle {
    pub tx: mpsc::Sender<String>,
    pub close_tx: Option<oneshot::Sender<CloseReason>>,
    /// Session ids this client has attached to via `Target.attachToTarget`.
    pub attached_sessions: HashSet<String>,
}

/// A row of the target table, keyed by `targetId` in [`Relay::targets`].
pub struct TargetEntry {
    pub info: TargetInfo,
    /// Session the extension attached at target-creation time, if any.
    pub session_id: Option<String>,
}

/// Process-wide relay state. Handlers share it behind an `Arc`.
pub struct Relay {
    pub config: Config,
    pub(crate) extension: Mutex<Option<ExtensionSlot>>,
    pub(crate) clients: Mutex<HashMap<String, ClientHandle>>,
    pub(crate) targets: Mutex<HashMap<String, TargetEntry>>,
    pub(crate) pending: Mutex<HashMap<u64, PendingRequest>>,
    next_relay_id: AtomicU64,
    next_epoch: AtomicU64,
    draining: AtomicBool,
}

impl Relay {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            extension: Mutex::new(None),
            clients: Mutex::new(HashMap::new()),
            targets: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            next_relay_id: AtomicU64::new(0),
            next_epoch: AtomicU64::new(0),
            draining: AtomicBool::new(false),
        }
    }

    /// Allocate a relay-local request id. Never reused within a process.
    pub(crate) fn next_relay_id(&self) -> u64 {
        self.next_relay_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Allocate a connect-epoch for a new extension socket.
    pub(crate) fn next_epoch(&self) -> u64 {
        self.next_epoch.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn start_draining(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub async fn extension_connected(&self) -> bool {
        self.extension.lock().await.is_some()
    }

    /// Queue a frame to one client. A client whose queue is full is dropped
    /// with `SLOW_CONSUMER` instead of blocking the broker; a client that
    /// already disconnected swallows the frame.
    pub(crate) async fn send_to_client(&self, client_id: &str, frame: String) {
        let dropped = {
            let mut clients = self.clients.lock().await;
            let result = match clients.get(client_id) {
                Some(handle) => handle.tx.try_send(frame),
                None => {
                    debug!(client = %client_id, "Dropping frame for disconnected client");
                    return;
                }
            };
            match result {
                Ok(()) => false,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(client = %client_id, "Client write queue full, dropping client");
                    if let Some(mut handle) = clients.remove(client_id) {
                        if let Some(close) = handle.close_tx.take() {
                            let _ = close.send(CloseReason::SLOW_CONSUMER);
                        }
                    }
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    clients.remove(client_id);
                    true
                }
            }
        };
        if dropped {
            self.cancel_pending_for_client(client_id).await;
        }
    }

    /// Queue a frame to every connected client (target lifecycle events).
    pub(crate) async fn broadcast_to_clients(&self, frame: String) {
        self.fan_out(frame, |_| true).await;
    }

    /// Queue a frame to every client attached to `session_id`.
    pub(crate) async fn send_to_attached(&self, session_id: &str, frame: String) {
        self.fan_out(frame, |handle| {
            handle.attached_sessions.contains(session_id)
        })
        .await;
    }

    async fn fan_out<F>(&self, frame: String, select: F)
    where
        F: Fn(&ClientHandle) -> bool,
    {
        let overflowed = {
            let mut clients = self.clients.lock().await;
            let mut overflowed = Vec::new();
            for (id, handle) in clients.iter() {
                if !select(handle) {
                    continue;
                }
                if handle.tx.try_send(frame.clone()).is_err() {
                    overflowed.push(id.clone());
                }
            }
            for id in &overflowed {
                warn!(client = %id, "Client write queue full, dropping client");
                if let Some(mut handle) = clients.remove(id) {
                    if let Some(close) = handle.close_tx.take() {
                        let _ = close.send(CloseReason::SLOW_CONSUMER);
                    }
                }
            }
            overflowed
        };
        for id in overflowed {
            self.cancel_pending_for_client(&id).await;
        }
    }

    /// Register a client. Returns `false` when the id is already taken.
    pub(crate) async fn register_client(&self, client_id: &str, handle: ClientHandle) -> bool {
        let mut clients = self.clients.lock().await;
        if clients.contains_key(client_id) {
            return false;
        }
        clients.insert(client_id.to_string(), handle);
        true
    }

    /// Remove a client after its socket closed. Pending requests it
    /// originated are cancelled; responses that later arrive are dropped.
    pub(crate) async fn remove_client(&self, client_id: &str) {
        self.clients.lock().await.remove(client_id);
        self.cancel_pending_for_client(client_id).await;
    }

    /// Mark `session_id` as attached by `client_id`.
    pub(crate) async fn mark_attached(&self, client_id: &str, session_id: &str) {
        let mut clients = self.clients.lock().await;
        if let Some(handle) = clients.get_mut(client_id) {
            handle.attached_sessions.insert(session_id.to_string());
        }
    }

    /// Close every client session. Queued frames drain before the close
    /// frame goes out (bounded by the drain grace period).
    pub(crate) async fn close_all_clients(&self, reason: CloseReason) {
        let mut clients = self.clients.lock().await;
        for (id, handle) in clients.iter_mut() {
            debug!(client = %id, code = reason.code, "Closing client session");
            if let Some(close) = handle.close_tx.take() {
                let _ = close.send(reason);
            }
        }
        clients.clear();
    }

    /// Drop pending entries originated by a departed client. No error frame
    /// is produced: the socket is gone. The forwarded command itself is not
    /// recalled; the extension's eventual response will find no entry and
    /// be discarded.
    pub(crate) async fn cancel_pending_for_client(&self, client_id: &str) {
        let mut pending = self.pending.lock().await;
        pending.retain(|relay_id, entry| {
            if entry.client_id.as_deref() == Some(client_id) {
                debug!(relay_id, method = %entry.method, "Cancelling pending request of departed client");
                entry.timeout.abort();
                false
            } else {
                true
            }
        });
    }
}

/// Opaque client id: `c-` plus 16 hex characters, unique for the process
/// lifetime.
pub fn generate_client_id() -> String {
    let bytes: [u8; 8] = rand::thread_rng().gen();
    let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    format!("c-{}", hex)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn relay() -> Relay {
        Relay::new(Config::default())
    }

    fn handle(capacity: usize) -> (ClientHandle, mpsc::Receiver<String>, oneshot::Receiver<CloseReason>) {
        let (tx, rx) = mpsc::channel(capacity);
        let (close_tx, close_rx) = oneshot::channel();
        (
            ClientHandle {
                tx,
                close_tx: Some(close_tx),
                attached_sessions: HashSet::new(),
            },
            rx,
            close_rx,
        )
    }

    #[tokio::test]
    async fn relay_ids_are_monotonic() {
        let relay = relay();
        let a = relay.next_relay_id();
        let b = relay.next_relay_id();
        assert!(b > a);
    }

    #[tokio::test]
    async fn duplicate_client_id_is_rejected() {
        let relay = relay();
        let (h1, _rx1, _c1) = handle(4);
        let (h2, _rx2, _c2) = handle(4);
        assert!(relay.register_client("c-1", h1).await);
        assert!(!relay.register_client("c-1", h2).await);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_client() {
        let relay = relay();
        let (h1, mut rx1, _c1) = handle(4);
        let (h2, mut rx2, _c2) = handle(4);
        relay.register_client("c-1", h1).await;
        relay.register_client("c-2", h2).await;

        relay.broadcast_to_clients("{\"method\":\"Target.targetCreated\"}".into()).await;
        assert!(rx1.recv().await.is_some());
        assert!(rx2.recv().await.is_some());
    }

    #[tokio::test]
    async fn session_events_only_reach_attached_clients() {
        let relay = relay();
        let (h1, mut rx1, _c1) = handle(4);
        let (h2, mut rx2, _c2) = handle(4);
        relay.register_client("c-1", h1).await;
        relay.register_client("c-2", h2).await;
        relay.mark_attached("c-1", "S1").await;

        relay.send_to_attached("S1", "{}".into()).await;
        assert!(rx1.recv().await.is_some());
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn slow_consumer_is_dropped_with_close_reason() {
        let relay = relay();
        let (h, _rx, close_rx) = handle(1);
        relay.register_client("c-slow", h).await;

        relay.send_to_client("c-slow", "one".into()).await;
        relay.send_to_client("c-slow", "two".into()).await;

        assert!(relay.clients.lock().await.get("c-slow").is_none());
        assert_eq!(close_rx.await.unwrap(), CloseReason::SLOW_CONSUMER);
    }

    #[tokio::test]
    async fn cancel_pending_only_touches_the_departed_client() {
        let relay = relay();
        let noop = tokio::spawn(async {});
        let noop2 = tokio::spawn(async {});
        relay.pending.lock().await.insert(
            1,
            PendingRequest {
                client_id: Some("c-1".into()),
                client_msg_id: json!(1),
                method: "Page.enable".into(),
                session_id: None,
                epoch: 1,
                timeout: noop.abort_handle(),
            },
        );
        relay.pending.lock().await.insert(
            2,
            PendingRequest {
                client_id: Some("c-2".into()),
                client_msg_id: json!(2),
                method: "Page.enable".into(),
                session_id: None,
                epoch: 1,
                timeout: noop2.abort_handle(),
            },
        );

        relay.cancel_pending_for_client("c-1").await;
        let pending = relay.pending.lock().await;
        assert!(!pending.contains_key(&1));
        assert!(pending.contains_key(&2));
    }

    #[test]
    fn client_ids_look_opaque_and_unique() {
        let a = generate_client_id();
        let b = generate_client_id();
        assert!(a.starts_with("c-"));
        assert_eq!(a.len(), 18);
        assert_ne!(a, b);
    }
}
