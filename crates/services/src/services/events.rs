//! In-process pub/sub with typed channels and wildcard subscription.
//!
//! Every payload carries a `type` discriminator and an ISO 8601
//! `timestamp`. Wildcard subscribers receive `(event_name, payload)`.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use db::models::EntityKind;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use strum_macros::{Display, EnumString};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

/// Where a synchronized change originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SyncSource {
    Markdown,
    Jsonl,
    Database,
}

pub mod names {
    use db::models::EntityKind;

    pub const ENTITY_SYNC: &str = "entity_sync";
    pub const ISSUE_STATUS_CHANGED: &str = "issue:status_changed";
    pub const RELATIONSHIP_CREATED: &str = "relationship:created";
    pub const FEEDBACK_CREATED: &str = "feedback:created";

    /// `filesystem:{spec|issue}_{created|updated}`
    pub fn filesystem(kind: EntityKind, action: &str) -> String {
        format!("filesystem:{kind}_{action}")
    }

    /// `execution:{created|started|updated|completed|failed|paused|cancelled}`
    pub fn execution(action: &str) -> String {
        format!("execution:{action}")
    }
}

struct BusInner {
    channels: DashMap<String, broadcast::Sender<Value>>,
    wildcard: broadcast::Sender<(String, Value)>,
}

#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (wildcard, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(BusInner { channels: DashMap::new(), wildcard }),
        }
    }

    fn channel(&self, event: &str) -> broadcast::Sender<Value> {
        self.inner
            .channels
            .entry(event.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Publish on the typed channel and the wildcard channel. Payloads get
    /// the `type` discriminator and `timestamp` stamped here.
    pub fn emit(&self, event: &str, payload: Value) {
        let mut payload = match payload {
            Value::Object(map) => Value::Object(map),
            Value::Null => json!({}),
            other => json!({ "data": other }),
        };
        if let Value::Object(map) = &mut payload {
            map.insert("type".to_string(), Value::String(event.to_string()));
            map.insert("timestamp".to_string(), Value::String(Utc::now().to_rfc3339()));
        }

        // send errors just mean nobody is listening
        let _ = self.channel(event).send(payload.clone());
        let _ = self.inner.wildcard.send((event.to_string(), payload));
    }

    pub fn subscribe(&self, event: &str) -> broadcast::Receiver<Value> {
        self.channel(event).subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<(String, Value)> {
        self.inner.wildcard.subscribe()
    }

    /// The watcher/sync pipeline's per-entity event.
    pub fn emit_entity_sync(
        &self,
        kind: EntityKind,
        id: &str,
        action: &str,
        source: SyncSource,
        snapshot: Option<Value>,
    ) {
        let mut payload = json!({
            "kind": kind.to_string(),
            "id": id,
            "action": action,
            "source": source.to_string(),
        });
        if let (Value::Object(map), Some(snapshot)) = (&mut payload, snapshot) {
            map.insert("entity_snapshot".to_string(), snapshot);
        }
        self.emit(names::ENTITY_SYNC, payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn typed_and_wildcard_delivery() {
        let bus = EventBus::new();
        let mut typed = bus.subscribe("issue:status_changed");
        let mut all = bus.subscribe_all();

        bus.emit(names::ISSUE_STATUS_CHANGED, json!({"id": "ISSUE-001", "status": "closed"}));

        let payload = typed.recv().await.unwrap();
        assert_eq!(payload["type"], "issue:status_changed");
        assert_eq!(payload["id"], "ISSUE-001");
        assert!(payload["timestamp"].as_str().unwrap().contains('T'));

        let (name, payload) = all.recv().await.unwrap();
        assert_eq!(name, "issue:status_changed");
        assert_eq!(payload["status"], "closed");
    }

    #[tokio::test]
    async fn subscribers_only_see_their_channel() {
        let bus = EventBus::new();
        let mut typed = bus.subscribe("execution:started");
        bus.emit(&names::execution("completed"), json!({}));
        bus.emit(&names::execution("started"), json!({"execution_id": "x"}));

        let payload = typed.recv().await.unwrap();
        assert_eq!(payload["type"], "execution:started");
    }

    #[test]
    fn event_name_builders() {
        assert_eq!(names::filesystem(EntityKind::Spec, "created"), "filesystem:spec_created");
        assert_eq!(names::filesystem(EntityKind::Issue, "updated"), "filesystem:issue_updated");
        assert_eq!(names::execution("failed"), "execution:failed");
    }
}
