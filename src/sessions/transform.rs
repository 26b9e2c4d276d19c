//! Raw-frame → UI-frame transformation.
//!
//! Exactly one [`Transformer`]-driven watcher runs per session (created
//! lazily by `observe`, released by refcount). It tails `out.jsonl` from its
//! current end, ignores lines that are already normalized `stream_item`
//! frames, and maps everything else through the [`AssistantFrame`] union:
//!
//! - `system/init` captures the remote session id (metadata + `resume_id`)
//! - assistant content blocks become `assistant_message` / `thought` /
//!   `tool_call` frames, with `::notify` directive extraction
//! - `content_block_delta` becomes `text_delta`
//! - `tool_result` becomes a follow-up `tool_call` on the same id
//! - `result` / `error` / `system:error` mark turn completion
//!
//! Emitted frames are appended back into `out.jsonl`, where observer tails
//! pick them up; the watcher itself skips them on its next pass.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, warn};
use uuid::Uuid;

use super::stream::{
    AssistantFrame, ContentBlock, RawContent, StreamItem, ThoughtStatus, ToolCallStatus, UiFrame,
};
use super::SessionEngine;
use crate::util::iso_now;

/// Poll cadence of the `out.jsonl` tail.
const TAIL_INTERVAL: Duration = Duration::from_millis(100);

// ─── Noise filter ────────────────────────────────────────────────────────────

/// How a multi-pattern rule set combines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    Any,
    All,
}

enum NoisePattern {
    Regex(Regex),
    /// Fallback when the pattern does not compile as a regex.
    Substring(String),
}

impl NoisePattern {
    fn matches(&self, text: &str) -> bool {
        match self {
            Self::Regex(re) => re.is_match(text),
            Self::Substring(s) => text.contains(s.as_str()),
        }
    }
}

/// Drops text-bearing frames whose text matches the configured rules.
/// Fixed at engine construction.
pub struct NoiseFilter {
    patterns: Vec<NoisePattern>,
    mode: MatchMode,
}

impl NoiseFilter {
    pub fn new(patterns: &[String], mode: MatchMode) -> Self {
        let patterns = patterns
            .iter()
            .map(|p| match Regex::new(p) {
                Ok(re) => NoisePattern::Regex(re),
                Err(_) => NoisePattern::Substring(p.clone()),
            })
            .collect();
        Self { patterns, mode }
    }

    pub fn empty() -> Self {
        Self {
            patterns: Vec::new(),
            mode: MatchMode::Any,
        }
    }

    /// True when the frame should be dropped.
    pub fn is_noise(&self, text: &str) -> bool {
        if self.patterns.is_empty() {
            return false;
        }
        match self.mode {
            MatchMode::Any => self.patterns.iter().any(|p| p.matches(text)),
            MatchMode::All => self.patterns.iter().all(|p| p.matches(text)),
        }
    }
}

// ─── Transformer ─────────────────────────────────────────────────────────────

/// Everything a single raw line produced.
#[derive(Default)]
pub struct TransformOutput {
    pub items: Vec<StreamItem>,
    /// Remote session id from a `system/init` frame.
    pub captured_session_id: Option<String>,
    /// A turn-terminator frame was seen.
    pub turn_completed: bool,
    /// The terminator carried an error.
    pub turn_errored: bool,
    /// A notification-style tool fired; the session now awaits an ack.
    pub notification_fired: bool,
}

/// Stateful frame mapper. The tool-call table pairs `tool_result` frames with
/// the `tool_use` block that started them so the follow-up frame reuses the
/// original name and input.
pub struct Transformer {
    noise: std::sync::Arc<NoiseFilter>,
    notify_re: Regex,
    tools: HashMap<String, (String, Value)>,
}

impl Transformer {
    #[allow(clippy::missing_panics_doc)] // static pattern, cannot fail
    pub fn new(noise: std::sync::Arc<NoiseFilter>) -> Self {
        Self {
            noise,
            notify_re: Regex::new(r"^::notify (.+)$").expect("static notify pattern"),
            tools: HashMap::new(),
        }
    }

    /// Transform one `out.jsonl` line. Lines that are already normalized, or
    /// that parse as unknown frames, produce nothing.
    pub fn transform_line(&mut self, line: &str) -> TransformOutput {
        let mut out = TransformOutput::default();
        if UiFrame::parse(line).is_some() {
            return out;
        }

        match AssistantFrame::parse(line) {
            AssistantFrame::System {
                subtype,
                session_id,
                message,
            } => match subtype.as_deref() {
                Some("init") => out.captured_session_id = session_id,
                Some("error") => {
                    self.push_error(&mut out, message.as_ref());
                    out.turn_completed = true;
                    out.turn_errored = true;
                }
                _ => {}
            },
            AssistantFrame::Assistant { message } => {
                if let Some(RawContent::Blocks(blocks)) = message.content {
                    self.map_blocks(
                        &blocks,
                        message.id.as_deref(),
                        ToolCallStatus::Running,
                        &mut out,
                    );
                }
            }
            AssistantFrame::ContentBlockDelta { delta } => {
                if let Some(text) = delta.text {
                    if !text.is_empty() && !self.noise.is_noise(&text) {
                        out.items.push(StreamItem::TextDelta {
                            text,
                            id: "delta".to_string(),
                            timestamp: iso_now(),
                        });
                    }
                }
            }
            AssistantFrame::ToolResult {
                tool_use_id,
                is_error,
                content,
            } => {
                if let Some(item) = self.tool_follow_up(&tool_use_id, is_error, content) {
                    out.items.push(item);
                }
            }
            // The assistant echoes tool results as `user` frames carrying
            // `tool_result` content blocks.
            AssistantFrame::User { message } => {
                if let Some(RawContent::Blocks(blocks)) = message.content {
                    for block in blocks {
                        if let ContentBlock::ToolResult {
                            tool_use_id,
                            is_error,
                            content,
                        } = block
                        {
                            if let Some(item) =
                                self.tool_follow_up(&tool_use_id, is_error, content)
                            {
                                out.items.push(item);
                            }
                        }
                    }
                }
            }
            AssistantFrame::Result { is_error, result } => {
                if is_error {
                    let text = result.unwrap_or_else(|| "assistant reported an error".to_string());
                    out.items.push(StreamItem::Error {
                        text,
                        id: Uuid::new_v4().to_string(),
                        timestamp: iso_now(),
                    });
                }
                out.turn_completed = true;
                out.turn_errored = is_error;
            }
            AssistantFrame::Error { message } => {
                self.push_error(&mut out, message.as_ref());
                out.turn_completed = true;
                out.turn_errored = true;
            }
            AssistantFrame::Unknown => {}
        }

        out
    }

    /// Map assistant content blocks into normalized frames. Shared by the
    /// live pipeline (`tool_status = Running`) and the vault importer
    /// (`tool_status = Completed`).
    pub fn map_blocks(
        &mut self,
        blocks: &[ContentBlock],
        base_id: Option<&str>,
        tool_status: ToolCallStatus,
        out: &mut TransformOutput,
    ) {
        let base = base_id
            .map(ToString::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        for (idx, block) in blocks.iter().enumerate() {
            let frame_id = if idx == 0 {
                base.clone()
            } else {
                format!("{base}-{idx}")
            };
            match block {
                ContentBlock::Text { text } => {
                    if text.is_empty() {
                        continue;
                    }
                    let (cleaned, subject) = self.extract_notification(text);
                    if !cleaned.is_empty() && !self.noise.is_noise(&cleaned) {
                        out.items.push(StreamItem::AssistantMessage {
                            text: cleaned,
                            id: frame_id.clone(),
                            timestamp: iso_now(),
                        });
                    }
                    // Fires even when the cleaned text came out empty. The id
                    // derives from the source block so the `::notify` path and
                    // the notification-tool path can never double-fire.
                    if let Some(subject) = subject {
                        if !self.noise.is_noise(&subject) {
                            out.items.push(StreamItem::Notification {
                                subject,
                                id: format!("{frame_id}-notify"),
                                timestamp: iso_now(),
                            });
                        }
                    }
                }
                ContentBlock::Thinking { thinking } => {
                    if thinking.is_empty() || self.noise.is_noise(thinking) {
                        continue;
                    }
                    out.items.push(StreamItem::Thought {
                        text: thinking.clone(),
                        id: frame_id,
                        timestamp: iso_now(),
                        status: ThoughtStatus::Ready,
                    });
                }
                ContentBlock::ToolUse { id, name, input } => {
                    self.tools.insert(id.clone(), (name.clone(), input.clone()));
                    out.items.push(StreamItem::ToolCall {
                        name: name.clone(),
                        input: input.clone(),
                        result: None,
                        status: tool_status,
                        id: id.clone(),
                        timestamp: iso_now(),
                    });
                    if is_notification_tool(name) {
                        let subject = notification_subject(input, name);
                        if !self.noise.is_noise(&subject) {
                            out.items.push(StreamItem::Notification {
                                subject,
                                id: format!("{id}-notify"),
                                timestamp: iso_now(),
                            });
                        }
                        out.notification_fired = true;
                    }
                }
                ContentBlock::ToolResult {
                    tool_use_id,
                    is_error,
                    content,
                } => {
                    if let Some(item) =
                        self.tool_follow_up(tool_use_id, *is_error, content.clone())
                    {
                        out.items.push(item);
                    }
                }
                ContentBlock::Other => {}
            }
        }
    }

    /// Strip `::notify <subject>` directive lines from a text block.
    ///
    /// Returns the cleaned text (matching lines removed, surrounding
    /// whitespace trimmed) and the subject of the last matching line.
    pub fn extract_notification(&self, text: &str) -> (String, Option<String>) {
        let mut subject = None;
        let mut kept: Vec<&str> = Vec::new();
        for line in text.lines() {
            if let Some(caps) = self.notify_re.captures(line) {
                subject = Some(caps[1].trim().to_string());
            } else {
                kept.push(line);
            }
        }
        match subject {
            None => (text.to_string(), None),
            Some(s) => (kept.join("\n").trim().to_string(), Some(s)),
        }
    }

    /// Build the follow-up `tool_call` frame for a finished tool, reusing the
    /// id so observers upsert in place.
    fn tool_follow_up(
        &mut self,
        tool_use_id: &str,
        is_error: bool,
        content: Value,
    ) -> Option<StreamItem> {
        let Some((name, input)) = self.tools.get(tool_use_id).cloned() else {
            debug!("tool_result for unknown tool_use_id {tool_use_id}, skipping");
            return None;
        };
        Some(StreamItem::ToolCall {
            name,
            input,
            result: Some(content),
            status: if is_error {
                ToolCallStatus::Failed
            } else {
                ToolCallStatus::Completed
            },
            id: tool_use_id.to_string(),
            timestamp: iso_now(),
        })
    }

    fn push_error(&self, out: &mut TransformOutput, message: Option<&Value>) {
        let text = match message {
            Some(Value::String(s)) => s.clone(),
            Some(v) => v.to_string(),
            None => "assistant reported an error".to_string(),
        };
        out.items.push(StreamItem::Error {
            text,
            id: Uuid::new_v4().to_string(),
            timestamp: iso_now(),
        });
    }
}

/// Whether a tool name identifies a notification-style tool. MCP-style names
/// are matched on their last `__` segment.
fn is_notification_tool(name: &str) -> bool {
    let last = name.rsplit("__").next().unwrap_or(name);
    matches!(
        last.to_ascii_lowercase().as_str(),
        "notify" | "notification" | "send_notification"
    )
}

/// Best-effort subject for a notification tool call.
fn notification_subject(input: &Value, name: &str) -> String {
    for key in ["subject", "message", "title"] {
        if let Some(s) = input.get(key).and_then(Value::as_str) {
            return s.to_string();
        }
    }
    name.to_string()
}

// ─── Watcher task ────────────────────────────────────────────────────────────

/// Tail `out.jsonl` from its current end, transforming raw frames and driving
/// turn-completion transitions. Runs until aborted by the engine.
pub(super) async fn run_watcher(engine: SessionEngine, session_id: String) {
    let Some(handle) = engine.handle(&session_id).await else {
        return;
    };
    let path = handle.journal().output_path();
    let mut offset = tokio::fs::metadata(&path).await.map_or(0, |m| m.len());
    let mut carry = String::new();
    let mut transformer = Transformer::new(engine.noise_filter());

    let mut tick = tokio::time::interval(TAIL_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tick.tick().await;
        for line in read_new_lines(&path, &mut offset, &mut carry).await {
            let out = transformer.transform_line(&line);
            for item in out.items {
                let frame = UiFrame::StreamItem { item };
                if let Err(e) = handle.journal().append_output(&frame.to_line()).await {
                    warn!("Session {session_id}: failed to append transformed frame: {e}");
                }
            }
            if let Some(sid) = out.captured_session_id {
                engine.capture_remote_session_id(&session_id, &sid).await;
            }
            if out.notification_fired {
                engine.mark_awaiting_ack(&session_id).await;
            }
            if out.turn_completed {
                engine.complete_turn(&session_id, out.turn_errored).await;
            }
        }
    }
}

/// Incremental read of complete lines past `offset`, carrying any partial
/// trailing line to the next call.
#[allow(clippy::cast_possible_truncation)]
pub(super) async fn read_new_lines(
    path: &Path,
    offset: &mut u64,
    carry: &mut String,
) -> Vec<String> {
    let Ok(mut file) = tokio::fs::File::open(path).await else {
        return Vec::new();
    };
    let len = match file.metadata().await {
        Ok(m) => m.len(),
        Err(_) => return Vec::new(),
    };
    if len <= *offset {
        return Vec::new();
    }
    if file.seek(SeekFrom::Start(*offset)).await.is_err() {
        return Vec::new();
    }
    let mut buf = Vec::with_capacity((len - *offset) as usize);
    if file.read_to_end(&mut buf).await.is_err() {
        return Vec::new();
    }
    *offset += buf.len() as u64;
    carry.push_str(&String::from_utf8_lossy(&buf));

    let mut lines = Vec::new();
    while let Some(pos) = carry.find('\n') {
        let line: String = carry.drain(..=pos).collect();
        let trimmed = line.trim_end();
        if !trimmed.is_empty() {
            lines.push(trimmed.to_string());
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn transformer() -> Transformer {
        Transformer::new(std::sync::Arc::new(NoiseFilter::empty()))
    }

    #[test]
    fn test_init_captures_session_id() {
        let mut tf = transformer();
        let out = tf.transform_line(r#"{"type":"system","subtype":"init","session_id":"r-1"}"#);
        assert_eq!(out.captured_session_id.as_deref(), Some("r-1"));
        assert!(out.items.is_empty());
        assert!(!out.turn_completed);
    }

    #[test]
    fn test_already_normalized_lines_are_skipped() {
        let mut tf = transformer();
        let out = tf.transform_line(
            r#"{"type":"stream_item","item":{"kind":"user_message","text":"hi","id":"u1","timestamp":"t"}}"#,
        );
        assert!(out.items.is_empty());
    }

    #[test]
    fn test_unknown_frames_are_ignored() {
        let mut tf = transformer();
        assert!(tf.transform_line(r#"{"type":"rate_limit_info"}"#).items.is_empty());
        assert!(tf.transform_line("garbage").items.is_empty());
    }

    #[test]
    fn test_text_block_becomes_assistant_message() {
        let mut tf = transformer();
        let out = tf.transform_line(
            r#"{"type":"assistant","message":{"id":"m1","content":[{"type":"text","text":"hello there"}]}}"#,
        );
        assert_eq!(out.items.len(), 1);
        match &out.items[0] {
            StreamItem::AssistantMessage { text, id, .. } => {
                assert_eq!(text, "hello there");
                assert_eq!(id, "m1");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_notify_extraction_cleans_and_fires() {
        let mut tf = transformer();
        let out = tf.transform_line(
            r#"{"type":"assistant","message":{"id":"m1","content":[{"type":"text","text":"Build finished.\n::notify build done\nAll green."}]}}"#,
        );
        let msg = out
            .items
            .iter()
            .find_map(|i| match i {
                StreamItem::AssistantMessage { text, .. } => Some(text.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(msg, "Build finished.\nAll green.");

        let subject = out
            .items
            .iter()
            .find_map(|i| match i {
                StreamItem::Notification { subject, .. } => Some(subject.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(subject, "build done");
    }

    #[test]
    fn test_notify_last_line_wins() {
        let tf = transformer();
        let (cleaned, subject) =
            tf.extract_notification("::notify first\nmiddle\n::notify second");
        assert_eq!(cleaned, "middle");
        assert_eq!(subject.as_deref(), Some("second"));
    }

    #[test]
    fn test_notify_fires_on_empty_cleaned_text() {
        let mut tf = transformer();
        let out = tf.transform_line(
            r#"{"type":"assistant","message":{"id":"m1","content":[{"type":"text","text":"::notify lonely"}]}}"#,
        );
        assert!(out
            .items
            .iter()
            .all(|i| !matches!(i, StreamItem::AssistantMessage { .. })));
        assert!(out
            .items
            .iter()
            .any(|i| matches!(i, StreamItem::Notification { subject, .. } if subject == "lonely")));
    }

    #[test]
    fn test_notify_requires_line_anchor() {
        let tf = transformer();
        let (cleaned, subject) = tf.extract_notification("see ::notify not-a-directive");
        assert_eq!(cleaned, "see ::notify not-a-directive");
        assert!(subject.is_none());
    }

    #[test]
    fn test_thinking_block_becomes_thought() {
        let mut tf = transformer();
        let out = tf.transform_line(
            r#"{"type":"assistant","message":{"id":"m1","content":[{"type":"thinking","thinking":"hmm"}]}}"#,
        );
        assert!(matches!(
            &out.items[0],
            StreamItem::Thought { text, status: ThoughtStatus::Ready, .. } if text == "hmm"
        ));
    }

    #[test]
    fn test_tool_use_then_result_upserts_by_id() {
        let mut tf = transformer();
        let first = tf.transform_line(
            r#"{"type":"assistant","message":{"id":"m1","content":[{"type":"tool_use","id":"t1","name":"Bash","input":{"command":"ls"}}]}}"#,
        );
        assert!(matches!(
            &first.items[0],
            StreamItem::ToolCall { status: ToolCallStatus::Running, id, .. } if id == "t1"
        ));

        let second =
            tf.transform_line(r#"{"type":"tool_result","tool_use_id":"t1","content":"ok"}"#);
        match &second.items[0] {
            StreamItem::ToolCall {
                name,
                status,
                result,
                id,
                ..
            } => {
                assert_eq!(name, "Bash");
                assert_eq!(*status, ToolCallStatus::Completed);
                assert_eq!(result, &Some(json!("ok")));
                assert_eq!(id, "t1");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_tool_result_inside_user_frame() {
        let mut tf = transformer();
        tf.transform_line(
            r#"{"type":"assistant","message":{"id":"m1","content":[{"type":"tool_use","id":"t2","name":"Read","input":{}}]}}"#,
        );
        let out = tf.transform_line(
            r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t2","is_error":true,"content":"boom"}]}}"#,
        );
        assert!(matches!(
            &out.items[0],
            StreamItem::ToolCall { status: ToolCallStatus::Failed, id, .. } if id == "t2"
        ));
    }

    #[test]
    fn test_result_for_unknown_tool_is_skipped() {
        let mut tf = transformer();
        let out =
            tf.transform_line(r#"{"type":"tool_result","tool_use_id":"nope","content":"x"}"#);
        assert!(out.items.is_empty());
    }

    #[test]
    fn test_notification_tool_fires_and_flags_ack() {
        let mut tf = transformer();
        let out = tf.transform_line(
            r#"{"type":"assistant","message":{"id":"m1","content":[{"type":"tool_use","id":"t3","name":"mcp__desktop__notify","input":{"subject":"ready for review"}}]}}"#,
        );
        assert!(out.notification_fired);
        assert!(out.items.iter().any(|i| matches!(
            i,
            StreamItem::Notification { subject, id, .. }
                if subject == "ready for review" && id == "t3-notify"
        )));
    }

    #[test]
    fn test_delta_becomes_text_delta() {
        let mut tf = transformer();
        let out = tf
            .transform_line(r#"{"type":"content_block_delta","delta":{"text":"par"}}"#);
        assert!(matches!(
            &out.items[0],
            StreamItem::TextDelta { text, id, .. } if text == "par" && id == "delta"
        ));
    }

    #[test]
    fn test_result_completes_turn() {
        let mut tf = transformer();
        let out = tf.transform_line(r#"{"type":"result","subtype":"success","is_error":false}"#);
        assert!(out.turn_completed);
        assert!(!out.turn_errored);
        assert!(out.items.is_empty());
    }

    #[test]
    fn test_error_result_surfaces_text() {
        let mut tf = transformer();
        let out = tf
            .transform_line(r#"{"type":"result","is_error":true,"result":"quota exceeded"}"#);
        assert!(out.turn_completed);
        assert!(out.turn_errored);
        assert!(matches!(
            &out.items[0],
            StreamItem::Error { text, .. } if text == "quota exceeded"
        ));
    }

    #[test]
    fn test_system_error_completes_turn() {
        let mut tf = transformer();
        let out = tf.transform_line(
            r#"{"type":"system","subtype":"error","message":"backend unavailable"}"#,
        );
        assert!(out.turn_completed);
        assert!(out.turn_errored);
        assert!(matches!(
            &out.items[0],
            StreamItem::Error { text, .. } if text == "backend unavailable"
        ));
    }

    #[test]
    fn test_noise_filter_any_mode() {
        let noise = NoiseFilter::new(&["spinner".to_string()], MatchMode::Any);
        let mut tf = Transformer::new(std::sync::Arc::new(noise));
        let out = tf.transform_line(
            r#"{"type":"assistant","message":{"id":"m1","content":[{"type":"text","text":"spinner frame 3"}]}}"#,
        );
        assert!(out.items.is_empty());
    }

    #[test]
    fn test_noise_filter_all_mode_requires_every_pattern() {
        let noise = NoiseFilter::new(
            &["alpha".to_string(), "beta".to_string()],
            MatchMode::All,
        );
        assert!(noise.is_noise("alpha and beta"));
        assert!(!noise.is_noise("alpha only"));
    }

    #[test]
    fn test_noise_filter_regex_pattern() {
        let noise = NoiseFilter::new(&[r"^\[debug]".to_string()], MatchMode::Any);
        assert!(noise.is_noise("[debug] verbose line"));
        assert!(!noise.is_noise("prefixed [debug] line"));
    }

    #[tokio::test]
    async fn test_read_new_lines_carries_partial() {
        use tokio::io::AsyncWriteExt;

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("out.jsonl");
        let mut file = tokio::fs::File::create(&path).await.unwrap();
        file.write_all(b"one\ntwo\npar").await.unwrap();
        file.flush().await.unwrap();

        let mut offset = 0;
        let mut carry = String::new();
        let lines = read_new_lines(&path, &mut offset, &mut carry).await;
        assert_eq!(lines, vec!["one", "two"]);
        assert_eq!(carry, "par");

        file.write_all(b"tial\n").await.unwrap();
        file.flush().await.unwrap();
        let lines = read_new_lines(&path, &mut offset, &mut carry).await;
        assert_eq!(lines, vec!["partial"]);
        assert!(carry.is_empty());
    }
}
