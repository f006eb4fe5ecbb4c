//! Wire shape of the agent subprocess stream.
//!
//! Agents emit newline-delimited JSON events tagged by a `sessionUpdate`
//! kind. The set of kinds is open: anything unrecognized is preserved as
//! [`SessionUpdate::Unknown`] and never treated as an error.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Key carrying the event kind on every stream event.
pub const KIND_FIELD: &str = "sessionUpdate";

/// Kinds folded into `session_notification` records rather than tracked as
/// message or tool-call state.
const NOTIFICATION_KINDS: &[&str] = &[
    "available_commands_update",
    "current_mode_update",
    "compaction_started",
    "compaction_completed",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContentBlock {
    Block { text: String },
    Plain(String),
}

impl ContentBlock {
    pub fn text(&self) -> &str {
        match self {
            ContentBlock::Block { text } => text,
            ContentBlock::Plain(text) => text,
        }
    }
}

impl Default for ContentBlock {
    fn default() -> Self {
        ContentBlock::Plain(String::new())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl ToolCallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ToolCallStatus::Completed | ToolCallStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallEvent {
    pub tool_call_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: ToolCallStatus,
    #[serde(default)]
    pub raw_input: Option<Value>,
    #[serde(default)]
    pub content: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallUpdateEvent {
    pub tool_call_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub status: Option<ToolCallStatus>,
    #[serde(default)]
    pub raw_input: Option<Value>,
    #[serde(default)]
    pub raw_output: Option<Value>,
    #[serde(default)]
    pub content: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanEntry {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub priority: Option<String>,
}

#[derive(Debug, Clone)]
pub enum SessionUpdate {
    AgentMessageChunk { content: ContentBlock },
    AgentThoughtChunk { content: ContentBlock },
    UserMessageChunk { content: ContentBlock },
    ToolCall(ToolCallEvent),
    ToolCallUpdate(ToolCallUpdateEvent),
    Plan { entries: Vec<PlanEntry> },
    /// Session-info class events (compaction markers, mode/command updates).
    Notification { kind: String, payload: Value },
    /// Anything with a kind this version does not know about.
    Unknown { kind: String, payload: Value },
}

impl SessionUpdate {
    /// Interpret one stream event. Returns `None` when the value carries no
    /// `sessionUpdate` kind at all (not an event for us).
    pub fn from_value(value: Value) -> Option<SessionUpdate> {
        let kind = value.get(KIND_FIELD)?.as_str()?.to_string();

        let content_of = |value: &Value| -> ContentBlock {
            value
                .get("content")
                .cloned()
                .and_then(|c| serde_json::from_value(c).ok())
                .unwrap_or_default()
        };

        let update = match kind.as_str() {
            "agent_message_chunk" => SessionUpdate::AgentMessageChunk { content: content_of(&value) },
            "agent_thought_chunk" => SessionUpdate::AgentThoughtChunk { content: content_of(&value) },
            "user_message_chunk" => SessionUpdate::UserMessageChunk { content: content_of(&value) },
            "tool_call" => match serde_json::from_value::<ToolCallEvent>(value.clone()) {
                Ok(event) => SessionUpdate::ToolCall(event),
                Err(_) => SessionUpdate::Unknown { kind, payload: value },
            },
            "tool_call_update" => {
                match serde_json::from_value::<ToolCallUpdateEvent>(value.clone()) {
                    Ok(event) => SessionUpdate::ToolCallUpdate(event),
                    Err(_) => SessionUpdate::Unknown { kind, payload: value },
                }
            }
            "plan" => {
                let entries = value
                    .get("entries")
                    .cloned()
                    .and_then(|e| serde_json::from_value(e).ok())
                    .unwrap_or_default();
                SessionUpdate::Plan { entries }
            }
            k if NOTIFICATION_KINDS.contains(&k) => {
                SessionUpdate::Notification { kind, payload: value }
            }
            _ => SessionUpdate::Unknown { kind, payload: value },
        };
        Some(update)
    }
}
