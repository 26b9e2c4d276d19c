//! Per-session append-only journals and the mutable metadata document.
//!
//! Each session owns a directory `sessions/<id>/` holding:
//!
//! - `in.jsonl` — append-only log of user inputs (one [`InputEntry`] per line)
//! - `out.jsonl` — append-only log of raw assistant frames interleaved with
//!   normalized `stream_item` frames
//! - `metadata.json` — small mutable document, single writer per process,
//!   serialized through a per-session lock and written atomically
//!   (temp file + rename on the same filesystem)
//! - `input.fifo` — the named pipe the supervisor reads
//! - `resume_id` — last captured remote assistant session id (plain text)
//!
//! Appends are whole-line `O_APPEND` writes, so lines from concurrent writers
//! (engine, transform watcher, supervisor redirect) never interleave.

use std::path::{Path, PathBuf};

use nix::sys::stat::Mode;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::util::{iso_now, now_ms};

/// Session lifecycle status, persisted in metadata and overlaid with the
/// live runtime value by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Sleeping,
    Idle,
    Busy,
    Error,
}

/// Origin of an input entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    User,
    System,
    Command,
}

/// One line of `in.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputEntry {
    pub id: String,
    #[serde(rename = "clientId")]
    pub client_id: String,
    #[serde(rename = "type")]
    pub kind: InputKind,
    pub text: String,
    /// ISO-8601, assigned by the server at append time.
    pub timestamp: String,
}

/// The `metadata.json` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub session_id: String,
    /// Remote assistant session id captured from the init frame. Once set it
    /// never regresses (forward compare-and-set only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claude_session_id: Option<String>,
    pub project_path: String,
    pub model: String,
    pub status: SessionStatus,
    /// Epoch milliseconds of the last metadata write.
    pub last_seen: u64,
    /// Id of the last `in.jsonl` entry delivered to the subprocess.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_processed_input_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_result_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_viewed_at: Option<u64>,
}

impl SessionMetadata {
    /// Default document for a session that has never persisted metadata.
    pub fn synthesize(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            claude_session_id: None,
            project_path: String::new(),
            model: String::new(),
            status: SessionStatus::Sleeping,
            last_seen: now_ms(),
            last_processed_input_id: None,
            last_result_at: None,
            last_viewed_at: None,
        }
    }

    /// `hasUnread ⇔ lastResultAt set ∧ (lastViewedAt unset ∨ lastResultAt >
    /// lastViewedAt)`.
    pub fn has_unread(&self) -> bool {
        match (self.last_result_at, self.last_viewed_at) {
            (Some(result), Some(viewed)) => result > viewed,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

/// Partial metadata update merged over the current document by
/// [`SessionJournal::update_metadata`]. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct MetadataPatch {
    pub claude_session_id: Option<String>,
    pub project_path: Option<String>,
    pub model: Option<String>,
    pub status: Option<SessionStatus>,
    pub last_processed_input_id: Option<String>,
    pub last_result_at: Option<u64>,
    pub last_viewed_at: Option<u64>,
}

/// Journal handle for one session directory.
///
/// Appends go straight to the filesystem; only metadata writes are funneled
/// through the internal lock.
pub struct SessionJournal {
    session_id: String,
    dir: PathBuf,
    meta_lock: Mutex<()>,
}

impl SessionJournal {
    pub fn new(sessions_root: &Path, session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            dir: sessions_root.join(session_id),
            meta_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn input_path(&self) -> PathBuf {
        self.dir.join("in.jsonl")
    }

    pub fn output_path(&self) -> PathBuf {
        self.dir.join("out.jsonl")
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join("metadata.json")
    }

    pub fn fifo_path(&self) -> PathBuf {
        self.dir.join("input.fifo")
    }

    pub fn resume_id_path(&self) -> PathBuf {
        self.dir.join("resume_id")
    }

    /// Idempotent: create the session directory, empty journals, and the
    /// input FIFO if absent.
    pub async fn ensure_storage(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir).await?;
        for path in [self.input_path(), self.output_path()] {
            fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
        }
        let fifo = self.fifo_path();
        if !fifo.exists() {
            match nix::unistd::mkfifo(&fifo, Mode::from_bits_truncate(0o644)) {
                Ok(()) | Err(nix::errno::Errno::EEXIST) => {}
                Err(e) => return Err(std::io::Error::from_raw_os_error(e as i32)),
            }
        }
        Ok(())
    }

    /// Append one input entry, assigning id and server timestamp. Returns the
    /// full entry as written.
    pub async fn append_input(
        &self,
        client_id: &str,
        kind: InputKind,
        text: &str,
    ) -> std::io::Result<InputEntry> {
        let entry = InputEntry {
            id: Uuid::new_v4().to_string(),
            client_id: client_id.to_string(),
            kind,
            text: text.to_string(),
            timestamp: iso_now(),
        };
        let line = serde_json::to_string(&entry)?;
        append_line(&self.input_path(), &line).await?;
        Ok(entry)
    }

    /// Append an already-serialized NDJSON line to `out.jsonl`. A trailing
    /// newline is added if the caller did not supply one.
    pub async fn append_output(&self, raw: &str) -> std::io::Result<()> {
        append_line(&self.output_path(), raw.trim_end_matches('\n')).await
    }

    /// Read the current metadata document; `None` if absent or unparseable.
    pub async fn get_metadata(&self) -> Option<SessionMetadata> {
        let content = fs::read_to_string(self.metadata_path()).await.ok()?;
        match serde_json::from_str(&content) {
            Ok(meta) => Some(meta),
            Err(e) => {
                warn!("Session {}: corrupt metadata.json: {e}", self.session_id);
                None
            }
        }
    }

    /// Read-merge-write the metadata document under the per-session lock.
    ///
    /// The current document (or a synthesized default) is merged with the
    /// patch, `lastSeen` is refreshed, and the result is written to a
    /// random-suffix temp file in the same directory, then renamed over the
    /// target. Concurrent callers observe serialized last-writer-wins
    /// semantics; the lock is released on every path.
    pub async fn update_metadata(&self, patch: MetadataPatch) -> std::io::Result<SessionMetadata> {
        let _guard = self.meta_lock.lock().await;

        let mut meta = self
            .get_metadata()
            .await
            .unwrap_or_else(|| SessionMetadata::synthesize(&self.session_id));

        if let Some(v) = patch.claude_session_id {
            meta.claude_session_id = Some(v);
        }
        if let Some(v) = patch.project_path {
            meta.project_path = v;
        }
        if let Some(v) = patch.model {
            meta.model = v;
        }
        if let Some(v) = patch.status {
            meta.status = v;
        }
        if let Some(v) = patch.last_processed_input_id {
            meta.last_processed_input_id = Some(v);
        }
        if let Some(v) = patch.last_result_at {
            meta.last_result_at = Some(v);
        }
        if let Some(v) = patch.last_viewed_at {
            meta.last_viewed_at = Some(v);
        }
        meta.last_seen = now_ms();

        fs::create_dir_all(&self.dir).await?;
        let tmp = self
            .dir
            .join(format!(".metadata.json.{}", Uuid::new_v4().simple()));
        let serialized = serde_json::to_string_pretty(&meta)?;
        fs::write(&tmp, serialized).await?;
        fs::rename(&tmp, self.metadata_path()).await?;

        Ok(meta)
    }

    /// Finite snapshot of `out.jsonl` as raw lines.
    pub async fn read_output_history(&self) -> Vec<String> {
        self.read_output_with_len().await.0
    }

    /// Snapshot of `out.jsonl` lines plus the byte length consumed, so a tail
    /// can start exactly where the snapshot ended. A trailing partial line
    /// (an append in flight) is excluded from both.
    pub async fn read_output_with_len(&self) -> (Vec<String>, u64) {
        let Ok(content) = fs::read_to_string(self.output_path()).await else {
            return (Vec::new(), 0);
        };
        let complete = match content.rfind('\n') {
            Some(pos) => &content[..=pos],
            None => return (Vec::new(), 0),
        };
        let len = complete.len() as u64;
        let lines = complete
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(ToString::to_string)
            .collect();
        (lines, len)
    }

    /// Parsed `in.jsonl` history. Corrupt lines are skipped, never fatal.
    pub async fn read_input_history(&self) -> Vec<InputEntry> {
        let Ok(content) = fs::read_to_string(self.input_path()).await else {
            return Vec::new();
        };
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| match serde_json::from_str(l) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("Session {}: skipping corrupt input line: {e}", self.session_id);
                    None
                }
            })
            .collect()
    }

    /// Read the persisted resume id, if any.
    pub async fn read_resume_id(&self) -> Option<String> {
        let content = fs::read_to_string(self.resume_id_path()).await.ok()?;
        let trimmed = content.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    /// Persist the remote session id for the supervisor's next `--resume`.
    pub async fn write_resume_id(&self, id: &str) -> std::io::Result<()> {
        fs::write(self.resume_id_path(), format!("{id}\n")).await
    }
}

/// Whole-line append with `O_APPEND` semantics. The newline is part of the
/// same buffer so a single `write` carries the complete line and concurrent
/// appenders never interleave.
async fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    let mut buf = Vec::with_capacity(line.len() + 1);
    buf.extend_from_slice(line.as_bytes());
    buf.push(b'\n');
    file.write_all(&buf).await?;
    file.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn journal(dir: &TempDir) -> SessionJournal {
        SessionJournal::new(dir.path(), "s1")
    }

    #[tokio::test]
    async fn test_ensure_storage_idempotent() {
        let dir = TempDir::new().unwrap();
        let j = journal(&dir);
        j.ensure_storage().await.unwrap();
        j.ensure_storage().await.unwrap();
        assert!(j.input_path().exists());
        assert!(j.output_path().exists());
        assert!(j.fifo_path().exists());
    }

    #[tokio::test]
    async fn test_append_input_assigns_id_and_timestamp() {
        let dir = TempDir::new().unwrap();
        let j = journal(&dir);
        j.ensure_storage().await.unwrap();

        let a = j.append_input("client-1", InputKind::User, "hello").await.unwrap();
        let b = j.append_input("client-1", InputKind::User, "world").await.unwrap();
        assert_ne!(a.id, b.id);
        assert!(a.timestamp.contains('T'));

        let history = j.read_input_history().await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].text, "hello");
        assert_eq!(history[1].text, "world");
    }

    #[tokio::test]
    async fn test_input_history_skips_corrupt_lines() {
        let dir = TempDir::new().unwrap();
        let j = journal(&dir);
        j.ensure_storage().await.unwrap();
        j.append_input("c", InputKind::User, "ok").await.unwrap();
        tokio::fs::OpenOptions::new()
            .append(true)
            .open(j.input_path())
            .await
            .unwrap()
            .write_all(b"{not json\n")
            .await
            .unwrap();
        j.append_input("c", InputKind::User, "also ok").await.unwrap();

        let history = j.read_input_history().await;
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn test_append_output_is_append_only() {
        let dir = TempDir::new().unwrap();
        let j = journal(&dir);
        j.ensure_storage().await.unwrap();

        j.append_output(r#"{"type":"x"}"#).await.unwrap();
        let (first, len1) = j.read_output_with_len().await;
        j.append_output("{\"type\":\"y\"}\n").await.unwrap();
        let (second, len2) = j.read_output_with_len().await;

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 2);
        assert_eq!(second[0], first[0]);
        assert!(len2 > len1);
    }

    #[tokio::test]
    async fn test_metadata_merge_and_atomicity() {
        let dir = TempDir::new().unwrap();
        let j = journal(&dir);
        j.ensure_storage().await.unwrap();

        assert!(j.get_metadata().await.is_none());

        j.update_metadata(MetadataPatch {
            project_path: Some("/tmp/p".into()),
            model: Some("sonnet".into()),
            status: Some(SessionStatus::Idle),
            ..MetadataPatch::default()
        })
        .await
        .unwrap();

        j.update_metadata(MetadataPatch {
            last_processed_input_id: Some("in-1".into()),
            ..MetadataPatch::default()
        })
        .await
        .unwrap();

        let meta = j.get_metadata().await.unwrap();
        assert_eq!(meta.project_path, "/tmp/p");
        assert_eq!(meta.model, "sonnet");
        assert_eq!(meta.status, SessionStatus::Idle);
        assert_eq!(meta.last_processed_input_id.as_deref(), Some("in-1"));

        // No temp files left behind
        let mut entries = tokio::fs::read_dir(j.dir()).await.unwrap();
        while let Some(e) = entries.next_entry().await.unwrap() {
            let name = e.file_name().to_string_lossy().to_string();
            assert!(!name.starts_with(".metadata.json."), "leftover temp: {name}");
        }
    }

    #[tokio::test]
    async fn test_metadata_concurrent_updates_serialize() {
        let dir = TempDir::new().unwrap();
        let j = std::sync::Arc::new(journal(&dir));
        j.ensure_storage().await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let j = std::sync::Arc::clone(&j);
            handles.push(tokio::spawn(async move {
                j.update_metadata(MetadataPatch {
                    last_processed_input_id: Some(format!("in-{i}")),
                    ..MetadataPatch::default()
                })
                .await
                .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        // Last writer wins; the document is intact
        let meta = j.get_metadata().await.unwrap();
        assert!(meta.last_processed_input_id.unwrap().starts_with("in-"));
    }

    #[test]
    fn test_has_unread_law() {
        let mut meta = SessionMetadata::synthesize("s");
        assert!(!meta.has_unread());

        meta.last_result_at = Some(100);
        assert!(meta.has_unread());

        meta.last_viewed_at = Some(100);
        assert!(!meta.has_unread());

        meta.last_result_at = Some(200);
        assert!(meta.has_unread());

        meta.last_viewed_at = Some(300);
        assert!(!meta.has_unread());
    }

    #[tokio::test]
    async fn test_resume_id_roundtrip() {
        let dir = TempDir::new().unwrap();
        let j = journal(&dir);
        j.ensure_storage().await.unwrap();

        assert!(j.read_resume_id().await.is_none());
        j.write_resume_id("remote-abc").await.unwrap();
        assert_eq!(j.read_resume_id().await.as_deref(), Some("remote-abc"));
    }
}
