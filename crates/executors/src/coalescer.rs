//! Folds the streaming agent events into complete, storable records.
//!
//! Storage and transport consume the same coalesced output; the raw stream
//! is only ever kept as debug logging.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::{
    KIND_FIELD, PlanEntry, SessionUpdate, ToolCallEvent, ToolCallStatus, ToolCallUpdateEvent,
};

/// Keys stripped from a notification payload before it is stored.
const NOTIFICATION_METADATA_KEYS: &[&str] = &[KIND_FIELD, "meta", "_meta", "sessionId"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    AgentMessage,
    AgentThought,
    UserMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoalescedEvent {
    MessageComplete {
        kind: MessageKind,
        content: String,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    },
    ToolCallComplete {
        tool_call_id: String,
        title: String,
        status: ToolCallStatus,
        raw_input: Option<Value>,
        raw_output: Option<Value>,
        content: Option<Value>,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    },
    Plan {
        entries: Vec<PlanEntry>,
    },
    SessionNotification {
        kind: String,
        payload: Value,
    },
}

#[derive(Debug)]
struct TextAccumulation {
    kind: MessageKind,
    chunks: Vec<String>,
    started_at: DateTime<Utc>,
}

#[derive(Debug)]
struct OpenToolCall {
    title: String,
    status: ToolCallStatus,
    raw_input: Option<Value>,
    raw_output: Option<Value>,
    content: Option<Value>,
    started_at: DateTime<Utc>,
}

/// At most one in-flight text accumulation plus a map of in-flight tool
/// calls keyed by `tool_call_id`.
#[derive(Debug, Default)]
pub struct Coalescer {
    pending_text: Option<TextAccumulation>,
    tool_calls: HashMap<String, OpenToolCall>,
}

impl Coalescer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, update: SessionUpdate) -> Vec<CoalescedEvent> {
        match update {
            SessionUpdate::AgentMessageChunk { content } => {
                self.push_chunk(MessageKind::AgentMessage, content.text())
            }
            SessionUpdate::AgentThoughtChunk { content } => {
                self.push_chunk(MessageKind::AgentThought, content.text())
            }
            SessionUpdate::UserMessageChunk { content } => {
                self.push_chunk(MessageKind::UserMessage, content.text())
            }
            SessionUpdate::ToolCall(event) => self.open_tool_call(event),
            SessionUpdate::ToolCallUpdate(event) => self.update_tool_call(event),
            SessionUpdate::Plan { entries } => {
                let mut out = self.drain_text();
                out.push(CoalescedEvent::Plan { entries });
                out
            }
            SessionUpdate::Notification { kind, payload } => {
                let mut out = self.drain_text();
                out.push(CoalescedEvent::SessionNotification {
                    kind,
                    payload: strip_metadata(payload),
                });
                out
            }
            SessionUpdate::Unknown { kind, .. } => {
                tracing::debug!("ignoring unknown session update kind: {kind}");
                Vec::new()
            }
        }
    }

    /// End of prompt: drain pending text and any still-open tool calls.
    /// Open tool calls here are abnormal but not fatal.
    pub fn flush(&mut self) -> Vec<CoalescedEvent> {
        let mut out = self.drain_text();
        if !self.tool_calls.is_empty() {
            tracing::warn!(
                "flushing {} tool call(s) that never reached a terminal status",
                self.tool_calls.len()
            );
        }
        let mut open: Vec<(String, OpenToolCall)> = self.tool_calls.drain().collect();
        open.sort_by_key(|(_, call)| call.started_at);
        for (tool_call_id, call) in open {
            out.push(complete_tool_call(tool_call_id, call));
        }
        out
    }

    pub fn reset(&mut self) {
        self.pending_text = None;
        self.tool_calls.clear();
    }

    fn push_chunk(&mut self, kind: MessageKind, text: &str) -> Vec<CoalescedEvent> {
        let mut out = Vec::new();
        match &mut self.pending_text {
            Some(accum) if accum.kind == kind => {
                accum.chunks.push(text.to_string());
            }
            _ => {
                out.extend(self.drain_text());
                self.pending_text = Some(TextAccumulation {
                    kind,
                    chunks: vec![text.to_string()],
                    started_at: Utc::now(),
                });
            }
        }
        out
    }

    fn open_tool_call(&mut self, event: ToolCallEvent) -> Vec<CoalescedEvent> {
        let mut out = self.drain_text();
        let call = OpenToolCall {
            title: event.title,
            status: event.status,
            raw_input: event.raw_input,
            raw_output: None,
            content: event.content,
            started_at: Utc::now(),
        };
        if event.status.is_terminal() {
            out.push(complete_tool_call(event.tool_call_id, call));
        } else {
            self.tool_calls.insert(event.tool_call_id, call);
        }
        out
    }

    fn update_tool_call(&mut self, event: ToolCallUpdateEvent) -> Vec<CoalescedEvent> {
        let ToolCallUpdateEvent { tool_call_id, title, status, raw_input, raw_output, content } =
            event;

        let Some(call) = self.tool_calls.get_mut(&tool_call_id) else {
            tracing::debug!("tool_call_update for unknown id {tool_call_id}");
            return Vec::new();
        };

        if let Some(title) = title {
            call.title = title;
        }
        if let Some(status) = status {
            call.status = status;
        }
        if raw_input.is_some() {
            call.raw_input = raw_input;
        }
        if raw_output.is_some() {
            call.raw_output = raw_output;
        }
        if content.is_some() {
            call.content = content;
        }

        let terminal = call.status.is_terminal();
        if terminal && let Some(call) = self.tool_calls.remove(&tool_call_id) {
            vec![complete_tool_call(tool_call_id, call)]
        } else {
            Vec::new()
        }
    }

    fn drain_text(&mut self) -> Vec<CoalescedEvent> {
        let Some(accum) = self.pending_text.take() else {
            return Vec::new();
        };
        vec![CoalescedEvent::MessageComplete {
            kind: accum.kind,
            content: accum.chunks.concat(),
            started_at: accum.started_at,
            completed_at: Utc::now(),
        }]
    }
}

fn complete_tool_call(tool_call_id: String, call: OpenToolCall) -> CoalescedEvent {
    CoalescedEvent::ToolCallComplete {
        tool_call_id,
        title: call.title,
        status: call.status,
        raw_input: call.raw_input,
        raw_output: call.raw_output,
        content: call.content,
        started_at: call.started_at,
        completed_at: Utc::now(),
    }
}

fn strip_metadata(payload: Value) -> Value {
    match payload {
        Value::Object(mut map) => {
            for key in NOTIFICATION_METADATA_KEYS {
                map.remove(*key);
            }
            Value::Object(map)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn push_raw(coalescer: &mut Coalescer, value: Value) -> Vec<CoalescedEvent> {
        coalescer.push(SessionUpdate::from_value(value).unwrap())
    }

    #[test]
    fn chunks_of_one_kind_fold_into_one_message() {
        let mut c = Coalescer::new();
        assert!(push_raw(&mut c, json!({"sessionUpdate": "agent_message_chunk", "content": "Hel"})).is_empty());
        assert!(push_raw(&mut c, json!({"sessionUpdate": "agent_message_chunk", "content": "lo"})).is_empty());

        let out = c.flush();
        assert_eq!(out.len(), 1);
        match &out[0] {
            CoalescedEvent::MessageComplete { kind, content, .. } => {
                assert_eq!(*kind, MessageKind::AgentMessage);
                assert_eq!(content, "Hello");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn kind_switch_flushes_previous_accumulation() {
        let mut c = Coalescer::new();
        push_raw(&mut c, json!({"sessionUpdate": "agent_thought_chunk", "content": "thinking"}));
        let out =
            push_raw(&mut c, json!({"sessionUpdate": "agent_message_chunk", "content": "answer"}));
        assert_eq!(out.len(), 1);
        match &out[0] {
            CoalescedEvent::MessageComplete { kind, content, .. } => {
                assert_eq!(*kind, MessageKind::AgentThought);
                assert_eq!(content, "thinking");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn tool_call_lifecycle_emits_on_terminal_status() {
        let mut c = Coalescer::new();
        push_raw(&mut c, json!({"sessionUpdate": "agent_message_chunk", "content": "running"}));

        // opening a tool call flushes pending text
        let out = push_raw(
            &mut c,
            json!({"sessionUpdate": "tool_call", "tool_call_id": "t1", "title": "read file", "raw_input": {"path": "a.rs"}}),
        );
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], CoalescedEvent::MessageComplete { .. }));

        // a non-terminal update emits nothing
        let out = push_raw(
            &mut c,
            json!({"sessionUpdate": "tool_call_update", "tool_call_id": "t1", "status": "in_progress"}),
        );
        assert!(out.is_empty());

        let out = push_raw(
            &mut c,
            json!({"sessionUpdate": "tool_call_update", "tool_call_id": "t1", "status": "completed", "raw_output": {"ok": true}}),
        );
        assert_eq!(out.len(), 1);
        match &out[0] {
            CoalescedEvent::ToolCallComplete { tool_call_id, title, status, raw_output, .. } => {
                assert_eq!(tool_call_id, "t1");
                assert_eq!(title, "read file");
                assert_eq!(*status, ToolCallStatus::Completed);
                assert_eq!(raw_output.as_ref().unwrap(), &json!({"ok": true}));
            }
            other => panic!("unexpected: {other:?}"),
        }

        // terminal entries are removed from the in-flight map
        assert!(c.flush().is_empty());
    }

    #[test]
    fn notifications_strip_metadata_and_flush_text() {
        let mut c = Coalescer::new();
        push_raw(&mut c, json!({"sessionUpdate": "agent_message_chunk", "content": "x"}));
        let out = push_raw(
            &mut c,
            json!({"sessionUpdate": "compaction_started", "reason": "context", "meta": {"ts": 1}}),
        );
        assert_eq!(out.len(), 2);
        match &out[1] {
            CoalescedEvent::SessionNotification { kind, payload } => {
                assert_eq!(kind, "compaction_started");
                assert_eq!(payload, &json!({"reason": "context"}));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn plan_emits_triples() {
        let mut c = Coalescer::new();
        let out = push_raw(
            &mut c,
            json!({"sessionUpdate": "plan", "entries": [
                {"content": "write tests", "status": "pending", "priority": "high"},
                {"content": "refactor", "status": "pending"}
            ]}),
        );
        assert_eq!(out.len(), 1);
        match &out[0] {
            CoalescedEvent::Plan { entries } => {
                assert_eq!(entries.len(), 2);
                assert_eq!(entries[0].content, "write tests");
                assert_eq!(entries[0].priority.as_deref(), Some("high"));
                assert_eq!(entries[1].priority, None);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn flush_drains_still_open_tool_calls() {
        let mut c = Coalescer::new();
        push_raw(&mut c, json!({"sessionUpdate": "tool_call", "tool_call_id": "t1", "title": "a"}));
        push_raw(&mut c, json!({"sessionUpdate": "tool_call", "tool_call_id": "t2", "title": "b"}));
        let out = c.flush();
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|e| matches!(e, CoalescedEvent::ToolCallComplete { .. })));
    }

    #[test]
    fn reset_clears_all_state() {
        let mut c = Coalescer::new();
        push_raw(&mut c, json!({"sessionUpdate": "agent_message_chunk", "content": "x"}));
        push_raw(&mut c, json!({"sessionUpdate": "tool_call", "tool_call_id": "t1", "title": "a"}));
        c.reset();
        assert!(c.flush().is_empty());
    }
}
