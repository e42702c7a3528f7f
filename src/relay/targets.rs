//! Target table maintenance.
//!
//! The table mirrors what the extension reports through `Target.*` events
//! and is the source of truth for the locally-answered `Target.*` methods.
//! It is mutated only from the extension reader task, before the event
//! fans out to clients.

use serde_json::Value;
use tracing::debug;

use crate::relay::protocol::TargetInfo;
use crate::relay::state::{Relay, TargetEntry};

impl Relay {
    /// Apply a `Target.*` event to the table. Non-target events and events
    /// with unusable payloads are ignored.
    pub(crate) async fn apply_target_event(&self, method: &str, params: &Value) {
        match method {
            "Target.targetCreated" | "Target.targetInfoChanged" => {
                let Some(info) = parse_target_info(params) else {
                    return;
                };
                let mut targets = self.targets.lock().await;
                let session_id = targets
                    .get(&info.target_id)
                    .and_then(|entry| entry.session_id.clone());
                debug!(target_id = %info.target_id, %method, "Target table upsert");
                targets.insert(info.target_id.clone(), TargetEntry { info, session_id });
            }
            "Target.attachedToTarget" => {
                let Some(info) = parse_target_info(params) else {
                    return;
                };
                let session_id = params
                    .get("sessionId")
                    .and_then(Value::as_str)
                    .map(str::to_owned);
                debug!(
                    target_id = %info.target_id,
                    session_id = session_id.as_deref().unwrap_or(""),
                    "Target attached"
                );
                self.targets
                    .lock()
                    .await
                    .insert(info.target_id.clone(), TargetEntry { info, session_id });
            }
            "Target.detachedFromTarget" => {
                let Some(session_id) = params.get("sessionId").and_then(Value::as_str) else {
                    return;
                };
                let mut targets = self.targets.lock().await;
                for entry in targets.values_mut() {
                    if entry.session_id.as_deref() == Some(session_id) {
                        entry.session_id = None;
                    }
                }
            }
            "Target.targetDestroyed" => {
                let Some(target_id) = params.get("targetId").and_then(Value::as_str) else {
                    return;
                };
                debug!(target_id, "Target destroyed");
                self.targets.lock().await.remove(target_id);
            }
            _ => {}
        }
    }

    /// Snapshot of the table: `(info, sessionId)` pairs with the `attached`
    /// flag reflecting whether a session is currently bound.
    pub(crate) async fn target_snapshot(&self) -> Vec<(TargetInfo, Option<String>)> {
        let targets = self.targets.lock().await;
        targets
            .values()
            .map(|entry| {
                let mut info = entry.info.clone();
                info.attached = entry.session_id.is_some();
                (info, entry.session_id.clone())
            })
            .collect()
    }

    /// Look up one target; same `attached` normalisation as the snapshot.
    pub(crate) async fn target_entry(
        &self,
        target_id: &str,
    ) -> Option<(TargetInfo, Option<String>)> {
        let targets = self.targets.lock().await;
        targets.get(target_id).map(|entry| {
            let mut info = entry.info.clone();
            info.attached = entry.session_id.is_some();
            (info, entry.session_id.clone())
        })
    }

    pub(crate) async fn clear_targets(&self) {
        self.targets.lock().await.clear();
    }
}

fn parse_target_info(params: &Value) -> Option<TargetInfo> {
    let info = params.get("targetInfo")?;
    match serde_json::from_value(info.clone()) {
        Ok(info) => Some(info),
        Err(e) => {
            debug!(error = %e, "Ignoring target event with unusable targetInfo");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use serde_json::json;

    fn relay() -> Relay {
        Relay::new(Config::default())
    }

    fn page(target_id: &str, url: &str) -> Value {
        json!({
            "targetId": target_id,
            "type": "page",
            "title": "t",
            "url": url,
            "attached": false
        })
    }

    #[tokio::test]
    async fn created_then_changed_then_destroyed() {
        let relay = relay();
        relay
            .apply_target_event(
                "Target.targetCreated",
                &json!({ "targetInfo": page("T1", "about:blank") }),
            )
            .await;
        assert_eq!(relay.target_snapshot().await.len(), 1);

        relay
            .apply_target_event(
                "Target.targetInfoChanged",
                &json!({ "targetInfo": page("T1", "https://example.com") }),
            )
            .await;
        let (info, _) = relay.target_entry("T1").await.unwrap();
        assert_eq!(info.url, "https://example.com");

        relay
            .apply_target_event("Target.targetDestroyed", &json!({ "targetId": "T1" }))
            .await;
        assert!(relay.target_entry("T1").await.is_none());
    }

    #[tokio::test]
    async fn attach_records_the_session_and_detach_clears_it() {
        let relay = relay();
        relay
            .apply_target_event(
                "Target.attachedToTarget",
                &json!({ "sessionId": "S1", "targetInfo": page("T1", "about:blank") }),
            )
            .await;
        let (info, session) = relay.target_entry("T1").await.unwrap();
        assert!(info.attached);
        assert_eq!(session.as_deref(), Some("S1"));

        relay
            .apply_target_event("Target.detachedFromTarget", &json!({ "sessionId": "S1" }))
            .await;
        let (info, session) = relay.target_entry("T1").await.unwrap();
        assert!(!info.attached);
        assert!(session.is_none());
    }

    #[tokio::test]
    async fn info_change_preserves_the_recorded_session() {
        let relay = relay();
        relay
            .apply_target_event(
                "Target.attachedToTarget",
                &json!({ "sessionId": "S1", "targetInfo": page("T1", "about:blank") }),
            )
            .await;
        relay
            .apply_target_event(
                "Target.targetInfoChanged",
                &json!({ "targetInfo": page("T1", "https://example.com") }),
            )
            .await;
        let (_, session) = relay.target_entry("T1").await.unwrap();
        assert_eq!(session.as_deref(), Some("S1"));
    }

    #[tokio::test]
    async fn malformed_payloads_are_ignored() {
        let relay = relay();
        relay
            .apply_target_event("Target.targetCreated", &json!({}))
            .await;
        relay
            .apply_target_event("Target.targetCreated", &json!({ "targetInfo": { "type": "page" } }))
            .await;
        assert!(relay.target_snapshot().await.is_empty());
    }
}
