//! CDP methods the relay answers itself.
//!
//! These are browser-scoped queries the extension should not have to
//! answer once per client; everything else passes through untouched. The
//! answers come from the target table, which tracks what the extension has
//! reported so far.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use crate::relay::protocol::{self, CdpError, ClientCommand};
use crate::relay::state::Relay;

impl Relay {
    /// Answer `cmd` locally if it is one of the intercepted methods.
    /// Returns `false` when the command must be forwarded instead.
    pub(crate) async fn intercept(self: &Arc<Self>, client_id: &str, cmd: &ClientCommand) -> bool {
        match cmd.method.as_str() {
            "Target.getTargets" => {
                let targets: Vec<Value> = self
                    .target_snapshot()
                    .await
                    .into_iter()
                    .filter_map(|(info, _)| serde_json::to_value(info).ok())
                    .collect();
                self.respond(client_id, cmd, json!({ "targetInfos": targets }))
                    .await;
            }
            "Target.getTargetInfo" => {
                let info = match cmd.params.get("targetId").and_then(Value::as_str) {
                    Some(target_id) => self
                        .target_entry(target_id)
                        .await
                        .and_then(|(info, _)| serde_json::to_value(info).ok()),
                    None => None,
                };
                // Unknown targets answer with null, never an error.
                self.respond(
                    client_id,
                    cmd,
                    json!({ "targetInfo": info.unwrap_or(Value::Null) }),
                )
                .await;
            }
            "Target.setDiscoverTargets" => {
                self.respond(client_id, cmd, json!({})).await;
                let discover = cmd
                    .params
                    .get("discover")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if discover {
                    // Announce pre-existing targets, the way Chrome does.
                    for (info, _) in self.target_snapshot().await {
                        let Ok(info) = serde_json::to_value(info) else {
                            continue;
                        };
                        self.send_to_client(
                            client_id,
                            protocol::event_frame(
                                "Target.targetCreated",
                                json!({ "targetInfo": info }),
                                None,
                            ),
                        )
                        .await;
                    }
                }
            }
            "Target.attachToTarget" => {
                self.attach_to_target(client_id, cmd).await;
            }
            "Browser.getVersion" => {
                self.respond(
                    client_id,
                    cmd,
                    json!({
                        "protocolVersion": "1.3",
                        "product": "Chrome/CDP-Relay",
                        "revision": env!("CARGO_PKG_VERSION"),
                        "userAgent": concat!("cdp-relay/", env!("CARGO_PKG_VERSION")),
                        "jsVersion": "V8"
                    }),
                )
                .await;
            }
            _ => return false,
        }
        true
    }

    /// `Target.attachToTarget`: hand out the session the extension bound
    /// at target-creation time, and synthesise the `attachedToTarget`
    /// event the client expects ahead of the response.
    async fn attach_to_target(self: &Arc<Self>, client_id: &str, cmd: &ClientCommand) {
        let target_id = cmd
            .params
            .get("targetId")
            .and_then(Value::as_str)
            .unwrap_or("");
        if target_id.is_empty() {
            self.respond_error(
                client_id,
                cmd,
                "targetId is required for Target.attachToTarget",
            )
            .await;
            return;
        }

        let session_id = match self.target_entry(target_id).await {
            Some((_, Some(session_id))) => session_id,
            _ => {
                self.respond_error(
                    client_id,
                    cmd,
                    &format!("Target {} not found in connected targets", target_id),
                )
                .await;
                return;
            }
        };

        debug!(client = %client_id, target_id, session_id = %session_id, "Client attached to target");
        self.mark_attached(client_id, &session_id).await;

        if let Some((info, _)) = self.target_entry(target_id).await {
            if let Ok(info) = serde_json::to_value(info) {
                self.send_to_client(
                    client_id,
                    protocol::event_frame(
                        "Target.attachedToTarget",
                        json!({
                            "sessionId": session_id,
                            "targetInfo": info,
                            "waitingForDebugger": false
                        }),
                        None,
                    ),
                )
                .await;
            }
        }

        self.respond(client_id, cmd, json!({ "sessionId": session_id }))
            .await;
    }

    async fn respond(&self, client_id: &str, cmd: &ClientCommand, result: Value) {
        self.send_to_client(
            client_id,
            protocol::response_frame(&cmd.id, cmd.session_id.as_deref(), result),
        )
        .await;
    }

    async fn respond_error(&self, client_id: &str, cmd: &ClientCommand, message: &str) {
        self.send_to_client(
            client_id,
            protocol::error_frame(
                &cmd.id,
                cmd.session_id.as_deref(),
                &CdpError::server(message),
            ),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::relay::state::ClientHandle;
    use std::collections::HashSet;
    use tokio::sync::{mpsc, oneshot};

    async fn relay_with_client() -> (Arc<Relay>, mpsc::Receiver<String>) {
        let relay = Arc::new(Relay::new(Config::default()));
        let (tx, rx) = mpsc::channel(16);
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

    fn command(raw: &str) -> ClientCommand {
        serde_json::from_str(raw).unwrap()
    }

    async fn next(rx: &mut mpsc::Receiver<String>) -> Value {
        serde_json::from_str(&rx.recv().await.unwrap()).unwrap()
    }

    async fn seed_attached_target(relay: &Relay, target_id: &str, session_id: &str) {
        relay
            .apply_target_event(
                "Target.attachedToTarget",
                &json!({
                    "sessionId": session_id,
                    "targetInfo": {
                        "targetId": target_id,
                        "type": "page",
                        "title": "t",
                        "url": "about:blank",
                        "attached": true
                    }
                }),
            )
            .await;
    }

    #[tokio::test]
    async fn get_targets_on_empty_table() {
        let (relay, mut rx) = relay_with_client().await;
        let handled = relay
            .intercept("c-test", &command(r#"{"id":1,"method":"Target.getTargets"}"#))
            .await;
        assert!(handled);
        let frame = next(&mut rx).await;
        assert_eq!(frame["id"], 1);
        assert_eq!(frame["result"]["targetInfos"], json!([]));
    }

    #[tokio::test]
    async fn get_target_info_answers_null_for_unknown_targets() {
        let (relay, mut rx) = relay_with_client().await;
        relay
            .intercept(
                "c-test",
                &command(r#"{"id":2,"method":"Target.getTargetInfo","params":{"targetId":"GHOST"}}"#),
            )
            .await;
        let frame = next(&mut rx).await;
        assert_eq!(frame["result"]["targetInfo"], Value::Null);
        assert!(frame.get("error").is_none());

        relay
            .intercept(
                "c-test",
                &command(r#"{"id":3,"method":"Target.getTargetInfo"}"#),
            )
            .await;
        let frame = next(&mut rx).await;
        assert_eq!(frame["result"]["targetInfo"], Value::Null);
    }

    #[tokio::test]
    async fn attach_requires_a_target_id() {
        let (relay, mut rx) = relay_with_client().await;
        for raw in [
            r#"{"id":10,"method":"Target.attachToTarget","params":{}}"#,
            r#"{"id":10,"method":"Target.attachToTarget","params":{"targetId":null}}"#,
            r#"{"id":10,"method":"Target.attachToTarget","params":{"targetId":""}}"#,
        ] {
            relay.intercept("c-test", &command(raw)).await;
            let frame = next(&mut rx).await;
            assert_eq!(
                frame["error"]["message"],
                "targetId is required for Target.attachToTarget"
            );
        }
    }

    #[tokio::test]
    async fn attach_to_unknown_target_names_the_id() {
        let (relay, mut rx) = relay_with_client().await;
        relay
            .intercept(
                "c-test",
                &command(r#"{"id":11,"method":"Target.attachToTarget","params":{"targetId":"GHOST"}}"#),
            )
            .await;
        let frame = next(&mut rx).await;
        assert_eq!(
            frame["error"]["message"],
            "Target GHOST not found in connected targets"
        );
    }

    #[tokio::test]
    async fn attach_emits_event_before_response() {
        let (relay, mut rx) = relay_with_client().await;
        seed_attached_target(&relay, "T1", "S1").await;

        relay
            .intercept(
                "c-test",
                &command(r#"{"id":4,"method":"Target.attachToTarget","params":{"targetId":"T1"}}"#),
            )
            .await;

        let event = next(&mut rx).await;
        assert_eq!(event["method"], "Target.attachedToTarget");
        assert_eq!(event["params"]["sessionId"], "S1");
        assert_eq!(event["params"]["targetInfo"]["targetId"], "T1");

        let response = next(&mut rx).await;
        assert_eq!(response["id"], 4);
        assert_eq!(response["result"]["sessionId"], "S1");

        // The client is now routed session-scoped events.
        relay.send_to_attached("S1", "{\"method\":\"x\"}".into()).await;
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn set_discover_targets_replays_known_targets() {
        let (relay, mut rx) = relay_with_client().await;
        seed_attached_target(&relay, "T1", "S1").await;

        relay
            .intercept(
                "c-test",
                &command(
                    r#"{"id":5,"method":"Target.setDiscoverTargets","params":{"discover":true}}"#,
                ),
            )
            .await;

        let ack = next(&mut rx).await;
        assert_eq!(ack["id"], 5);
        assert_eq!(ack["result"], json!({}));

        let replay = next(&mut rx).await;
        assert_eq!(replay["method"], "Target.targetCreated");
        assert_eq!(replay["params"]["targetInfo"]["targetId"], "T1");
    }

    #[tokio::test]
    async fn browser_get_version_is_synthesised() {
        let (relay, mut rx) = relay_with_client().await;
        relay
            .intercept("c-test", &command(r#"{"id":6,"method":"Browser.getVersion"}"#))
            .await;
        let frame = next(&mut rx).await;
        assert_eq!(frame["result"]["protocolVersion"], "1.3");
        assert!(frame["result"]["userAgent"]
            .as_str()
            .unwrap()
            .starts_with("cdp-relay/"));
    }

    #[tokio::test]
    async fn unrelated_methods_are_not_intercepted() {
        let (relay, _rx) = relay_with_client().await;
        assert!(
            !relay
                .intercept("c-test", &command(r#"{"id":8,"method":"Page.navigate"}"#))
                .await
        );
        assert!(
            !relay
                .intercept(
                    "c-test",
                    &command(r#"{"id":9,"method":"Target.setAutoAttach"}"#)
                )
                .await
        );
    }
}
