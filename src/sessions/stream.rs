//! Wire types for the session event pipeline.
//!
//! Three families of frames flow through the system:
//!
//! - [`AssistantFrame`] — raw NDJSON emitted by the assistant subprocess into
//!   `out.jsonl`. Parsed into a tagged union; anything unrecognized becomes
//!   [`AssistantFrame::Unknown`] and triggers no transformation.
//! - [`StreamItem`] — the normalized UI event schema. Written back into
//!   `out.jsonl` wrapped as [`UiFrame`] and forwarded verbatim to observers.
//! - [`ServerFrame`] — server-originated control frames. Delivered only over
//!   the live observer stream, never persisted.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Normalized UI frames ────────────────────────────────────────────────────

/// Lifecycle of a thought block as it streams in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThoughtStatus {
    Loading,
    Ready,
}

/// Observable state machine of a tool invocation: `running` →
/// `completed` | `failed`. The frame `id` is reused on update so observers
/// can upsert in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallStatus {
    Running,
    Completed,
    Failed,
}

/// One item of the session's UI timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamItem {
    UserMessage {
        text: String,
        id: String,
        timestamp: String,
    },
    AssistantMessage {
        text: String,
        id: String,
        timestamp: String,
    },
    /// Incremental chunk of an in-progress assistant message. Always carries
    /// `id = "delta"`; buffering into readable clusters is UI policy.
    TextDelta {
        text: String,
        id: String,
        timestamp: String,
    },
    Thought {
        text: String,
        id: String,
        timestamp: String,
        status: ThoughtStatus,
    },
    ToolCall {
        name: String,
        input: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        status: ToolCallStatus,
        id: String,
        timestamp: String,
    },
    Notification {
        subject: String,
        id: String,
        timestamp: String,
    },
    System {
        text: String,
        id: String,
        timestamp: String,
    },
    Error {
        text: String,
        id: String,
        timestamp: String,
    },
}

impl StreamItem {
    /// The stable frame id, used for observer-side upsert and import dedup.
    pub fn id(&self) -> &str {
        match self {
            Self::UserMessage { id, .. }
            | Self::AssistantMessage { id, .. }
            | Self::TextDelta { id, .. }
            | Self::Thought { id, .. }
            | Self::ToolCall { id, .. }
            | Self::Notification { id, .. }
            | Self::System { id, .. }
            | Self::Error { id, .. } => id,
        }
    }
}

/// Envelope for normalized frames persisted in `out.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiFrame {
    StreamItem { item: StreamItem },
}

impl UiFrame {
    /// Serialize to a single NDJSON line (no trailing newline).
    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Parse an `out.jsonl` line; `None` if it is not a normalized frame.
    pub fn parse(line: &str) -> Option<Self> {
        serde_json::from_str(line).ok()
    }

    /// Parse and unwrap the inner [`StreamItem`], if this is one.
    pub fn parse_item(line: &str) -> Option<StreamItem> {
        match Self::parse(line) {
            Some(Self::StreamItem { item }) => Some(item),
            None => None,
        }
    }
}

// ─── Server control frames ───────────────────────────────────────────────────

/// Client-visible agent status. Runtime statuses collapse onto this: `busy`
/// maps to `thinking`, `sleeping` maps to `idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Thinking,
    Error,
}

/// Frames delivered only over the live observer stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    HistorySnapshot { items: Vec<StreamItem> },
    StreamItem { item: StreamItem },
    AgentStatus { status: AgentStatus },
    ChatTitleUpdate { title: String },
    UnreadCleared,
    ContextCleared,
    PlanModeEntered,
}

impl ServerFrame {
    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

// ─── Raw assistant frames ────────────────────────────────────────────────────

/// A content block inside a raw assistant message.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    #[serde(alias = "thought")]
    Thinking {
        #[serde(default, alias = "text")]
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        content: Value,
    },
    #[serde(other)]
    Other,
}

/// Message content as the assistant tool writes it: either a plain string or
/// an array of typed blocks.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// The `message` object of a raw assistant/user frame.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub content: Option<RawContent>,
}

/// Payload of a `content_block_delta` frame.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Delta {
    #[serde(default)]
    pub text: Option<String>,
}

/// A raw NDJSON frame from the assistant subprocess.
///
/// The `Unknown` variant is the catch-all: any line that fails to parse into
/// one of the known shapes maps onto it and is ignored by the transform
/// pipeline (machine noise).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantFrame {
    Assistant {
        #[serde(default)]
        message: RawMessage,
    },
    User {
        #[serde(default)]
        message: RawMessage,
    },
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        message: Option<Value>,
    },
    ContentBlockDelta {
        #[serde(default)]
        delta: Delta,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        content: Value,
    },
    Result {
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        result: Option<String>,
    },
    Error {
        #[serde(default)]
        message: Option<Value>,
    },
    #[serde(other)]
    Unknown,
}

impl AssistantFrame {
    /// Parse a raw `out.jsonl` line. Lines that are not valid JSON or carry a
    /// shape we do not recognize come back as [`Self::Unknown`].
    pub fn parse(line: &str) -> Self {
        serde_json::from_str(line).unwrap_or(Self::Unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stream_item_tagging() {
        let item = StreamItem::UserMessage {
            text: "hello".into(),
            id: "u1".into(),
            timestamp: "2026-01-01T00:00:00Z".into(),
        };
        let line = UiFrame::StreamItem { item }.to_line();
        let v: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["type"], "stream_item");
        assert_eq!(v["item"]["kind"], "user_message");
        assert_eq!(v["item"]["text"], "hello");
    }

    #[test]
    fn test_tool_call_omits_absent_result() {
        let item = StreamItem::ToolCall {
            name: "Read".into(),
            input: json!({"file_path": "/tmp/x"}),
            result: None,
            status: ToolCallStatus::Running,
            id: "t1".into(),
            timestamp: "2026-01-01T00:00:00Z".into(),
        };
        let line = UiFrame::StreamItem { item }.to_line();
        let v: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["item"]["status"], "running");
        assert!(v["item"].get("result").is_none());
    }

    #[test]
    fn test_ui_frame_roundtrip() {
        let line = r#"{"type":"stream_item","item":{"kind":"notification","subject":"done","id":"n1","timestamp":"2026-01-01T00:00:00Z"}}"#;
        let item = UiFrame::parse_item(line).unwrap();
        assert_eq!(item.id(), "n1");
        assert!(matches!(item, StreamItem::Notification { ref subject, .. } if subject == "done"));
    }

    #[test]
    fn test_raw_frame_not_a_ui_frame() {
        assert!(UiFrame::parse(r#"{"type":"assistant","message":{"content":[]}}"#).is_none());
    }

    #[test]
    fn test_assistant_frame_init() {
        let frame = AssistantFrame::parse(
            r#"{"type":"system","subtype":"init","session_id":"abc-123"}"#,
        );
        match frame {
            AssistantFrame::System {
                subtype,
                session_id,
                ..
            } => {
                assert_eq!(subtype.as_deref(), Some("init"));
                assert_eq!(session_id.as_deref(), Some("abc-123"));
            }
            other => panic!("expected system frame, got {other:?}"),
        }
    }

    #[test]
    fn test_assistant_frame_blocks() {
        let frame = AssistantFrame::parse(
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hi"},{"type":"tool_use","id":"t1","name":"Bash","input":{"command":"ls"}}]}}"#,
        );
        let AssistantFrame::Assistant { message } = frame else {
            panic!("expected assistant frame");
        };
        let Some(RawContent::Blocks(blocks)) = message.content else {
            panic!("expected block content");
        };
        assert_eq!(blocks.len(), 2);
        assert!(matches!(blocks[0], ContentBlock::Text { ref text } if text == "hi"));
        assert!(matches!(blocks[1], ContentBlock::ToolUse { ref name, .. } if name == "Bash"));
    }

    #[test]
    fn test_assistant_frame_thought_alias() {
        let frame = AssistantFrame::parse(
            r#"{"type":"assistant","message":{"content":[{"type":"thought","text":"pondering"}]}}"#,
        );
        let AssistantFrame::Assistant { message } = frame else {
            panic!("expected assistant frame");
        };
        let Some(RawContent::Blocks(blocks)) = message.content else {
            panic!("expected block content");
        };
        assert!(
            matches!(blocks[0], ContentBlock::Thinking { ref thinking } if thinking == "pondering")
        );
    }

    #[test]
    fn test_assistant_frame_unknown() {
        assert!(matches!(
            AssistantFrame::parse(r#"{"type":"ping"}"#),
            AssistantFrame::Unknown
        ));
        assert!(matches!(
            AssistantFrame::parse("not json at all"),
            AssistantFrame::Unknown
        ));
    }

    #[test]
    fn test_server_frame_shapes() {
        let v: Value =
            serde_json::from_str(&ServerFrame::AgentStatus { status: AgentStatus::Thinking }.to_line())
                .unwrap();
        assert_eq!(v["type"], "agent_status");
        assert_eq!(v["status"], "thinking");

        let v: Value = serde_json::from_str(&ServerFrame::UnreadCleared.to_line()).unwrap();
        assert_eq!(v["type"], "unread_cleared");

        let v: Value =
            serde_json::from_str(&ServerFrame::HistorySnapshot { items: vec![] }.to_line()).unwrap();
        assert_eq!(v["type"], "history_snapshot");
        assert!(v["items"].as_array().unwrap().is_empty());
    }
}
