//! Request correlation between client sockets and the extension.
//!
//! Every forwarded command gets a fresh relay-local id and a table entry;
//! the entry is completed by exactly one of: the extension's response, the
//! per-request timer, or the bulk failure that runs when the extension's
//! epoch ends. Whichever fires first takes the entry out of the table, so
//! the later ones find nothing and do nothing.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::relay::protocol::{self, CdpError};
use crate::relay::state::{PendingRequest, Relay};

impl Relay {
    /// Forward a command to the extension on behalf of `client_id`
    /// (or the relay itself, when `client_id` is `None`).
    pub(crate) async fn forward(
        self: &Arc<Self>,
        client_id: Option<&str>,
        client_msg_id: Value,
        method: &str,
        params: &Value,
        session_id: Option<&str>,
    ) {
        let slot = {
            let extension = self.extension.lock().await;
            extension.as_ref().map(|s| (s.tx.clone(), s.epoch))
        };
        let Some((tx, epoch)) = slot else {
            if let Some(client_id) = client_id {
                self.send_to_client(
                    client_id,
                    protocol::error_frame(
                        &client_msg_id,
                        session_id,
                        &CdpError::server("Extension not connected"),
                    ),
                )
                .await;
            }
            return;
        };

        let relay_id = self.next_relay_id();
        let timeout_ms = self.config.limits.request_timeout_ms;
        let timer = tokio::spawn({
            let relay = Arc::clone(self);
            async move {
                tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
                relay.expire_pending(relay_id).await;
            }
        });

        // Insert before dispatch so a fast response always finds the entry.
        self.pending.lock().await.insert(
            relay_id,
            PendingRequest {
                client_id: client_id.map(str::to_owned),
                client_msg_id,
                method: method.to_string(),
                session_id: session_id.map(str::to_owned),
                epoch,
                timeout: timer.abort_handle(),
            },
        );

        let frame = protocol::extension_request_frame(relay_id, method, params, session_id);
        match tx.try_send(frame) {
            Ok(()) => {}
            Err(tokio::sync::mpsc::error::TrySendError::Full(_)) => {
                // The extension cannot keep up; dropping it fails this entry
                // along with every other one of its epoch.
                warn!("Extension write queue full, dropping extension");
                self.drop_extension(epoch, Some(protocol::CloseReason::SLOW_CONSUMER))
                    .await;
            }
            Err(tokio::sync::mpsc::error::TrySendError::Closed(_)) => {
                if let Some(entry) = self.pending.lock().await.remove(&relay_id) {
                    entry.timeout.abort();
                    if let Some(client_id) = entry.client_id {
                        self.send_to_client(
                            &client_id,
                            protocol::error_frame(
                                &entry.client_msg_id,
                                entry.session_id.as_deref(),
                                &CdpError::server("Extension not connected"),
                            ),
                        )
                        .await;
                    }
                }
            }
        }
    }

    /// Deliver an extension response to whoever is still waiting for it.
    /// Late responses (after a timeout, disconnect, or epoch failure) find
    /// no entry and are discarded.
    pub(crate) async fn complete_pending(
        &self,
        relay_id: u64,
        result: Option<Value>,
        error: Option<CdpError>,
    ) {
        let entry = self.pending.lock().await.remove(&relay_id);
        let Some(entry) = entry else {
            debug!(relay_id, "Discarding late or unknown extension response");
            return;
        };
        entry.timeout.abort();

        let Some(client_id) = entry.client_id else {
            debug!(relay_id, method = %entry.method, "Internal request completed");
            return;
        };

        let frame = match error {
            Some(error) => {
                protocol::error_frame(&entry.client_msg_id, entry.session_id.as_deref(), &error)
            }
            None => protocol::response_frame(
                &entry.client_msg_id,
                entry.session_id.as_deref(),
                result.unwrap_or(Value::Null),
            ),
        };
        self.send_to_client(&client_id, frame).await;
    }

    /// Timer path: fires once per entry unless a response won the race.
    pub(crate) async fn expire_pending(&self, relay_id: u64) {
        let entry = self.pending.lock().await.remove(&relay_id);
        let Some(entry) = entry else {
            return;
        };
        let timeout_ms = self.config.limits.request_timeout_ms;
        warn!(relay_id, method = %entry.method, timeout_ms, "Extension request timed out");
        if let Some(client_id) = entry.client_id {
            self.send_to_client(
                &client_id,
                protocol::error_frame(
                    &entry.client_msg_id,
                    entry.session_id.as_deref(),
                    &CdpError::server(format!(
                        "Extension request timeout after {}ms: {}",
                        timeout_ms, entry.method
                    )),
                ),
            )
            .await;
        }
    }

    /// Fail every pending request dispatched to the given extension epoch.
    pub(crate) async fn fail_pending_for_epoch(&self, epoch: u64) {
        self.fail_pending_where(|entry| entry.epoch == epoch).await;
    }

    /// Fail every pending request, regardless of epoch (shutdown path).
    pub(crate) async fn fail_all_pending(&self) {
        self.fail_pending_where(|_| true).await;
    }

    async fn fail_pending_where<F>(&self, select: F)
    where
        F: Fn(&PendingRequest) -> bool,
    {
        let failed: Vec<PendingRequest> = {
            let mut pending = self.pending.lock().await;
            let ids: Vec<u64> = pending
                .iter()
                .filter(|(_, entry)| select(entry))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id))
                .collect()
        };

        for entry in failed {
            entry.timeout.abort();
            let Some(client_id) = entry.client_id else {
                continue;
            };
            self.send_to_client(
                &client_id,
                protocol::error_frame(
                    &entry.client_msg_id,
                    entry.session_id.as_deref(),
                    &CdpError::server("Extension not connected"),
                ),
            )
            .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::relay::state::ClientHandle;
    use serde_json::json;
    use std::collections::HashSet;
    use tokio::sync::{mpsc, oneshot};

    async fn relay_with_client(
        capacity: usize,
    ) -> (Arc<Relay>, mpsc::Receiver<String>) {
        let relay = Arc::new(Relay::new(Config::default()));
        let (tx, rx) = mpsc::channel(capacity);
        let (close_tx, _close_rx) = oneshot::channel();
        relay
            .register_client(
                "c-test",
                ClientHandle {
                    tx,
                    close_tx: Some(close_tx),
                    attached_sessions: HashSet::new(),
                },
            )
            .await;
        (relay, rx)
    }

    #[tokio::test]
    async fn forward_without_extension_replies_not_connected() {
        let (relay, mut rx) = relay_with_client(4).await;
        relay
            .forward(Some("c-test"), json!(5), "Page.enable", &json!({}), None)
            .await;
        let frame: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["id"], 5);
        assert_eq!(frame["error"]["message"], "Extension not connected");
        assert!(relay.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn response_restores_the_client_id() {
        let (relay, mut rx) = relay_with_client(4).await;
        let noop = tokio::spawn(async {});
        relay.pending.lock().await.insert(
            41,
            PendingRequest {
                client_id: Some("c-test".into()),
                client_msg_id: json!(7),
                method: "Page.navigate".into(),
                session_id: Some("S1".into()),
                epoch: 1,
                timeout: noop.abort_handle(),
            },
        );

        relay
            .complete_pending(41, Some(json!({"frameId": "F"})), None)
            .await;
        let frame: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["id"], 7);
        assert_eq!(frame["result"]["frameId"], "F");
        assert_eq!(frame["sessionId"], "S1");
        assert!(relay.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn late_response_is_discarded() {
        let (relay, mut rx) = relay_with_client(4).await;
        relay.complete_pending(999, Some(json!({})), None).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn expiry_names_the_method_and_deadline() {
        let (relay, mut rx) = relay_with_client(4).await;
        let noop = tokio::spawn(async {});
        relay.pending.lock().await.insert(
            9,
            PendingRequest {
                client_id: Some("c-test".into()),
                client_msg_id: json!(9),
                method: "Page.navigate".into(),
                session_id: None,
                epoch: 1,
                timeout: noop.abort_handle(),
            },
        );

        relay.expire_pending(9).await;
        let frame: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(
            frame["error"]["message"],
            "Extension request timeout after 30000ms: Page.navigate"
        );

        // A second expiry for the same id is a no-op.
        relay.expire_pending(9).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn epoch_failure_spares_other_epochs() {
        let (relay, mut rx) = relay_with_client(4).await;
        for (relay_id, epoch) in [(1u64, 1u64), (2, 2)] {
            let noop = tokio::spawn(async {});
            relay.pending.lock().await.insert(
                relay_id,
                PendingRequest {
                    client_id: Some("c-test".into()),
                    client_msg_id: json!(relay_id),
                    method: "Page.enable".into(),
                    session_id: None,
                    epoch,
                    timeout: noop.abort_handle(),
                },
            );
        }

        relay.fail_pending_for_epoch(1).await;
        let frame: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["id"], 1);
        assert_eq!(frame["error"]["message"], "Extension not connected");
        assert!(rx.try_recv().is_err());
        assert!(relay.pending.lock().await.contains_key(&2));
    }
}
