//! Hydration importer: merges the assistant tool's own on-disk session logs
//! into a session's `out.jsonl`.
//!
//! The vault is a directory of per-project subdirectories (project path
//! slugged with hyphens), each holding `<sessionId>.jsonl` logs. Import is
//! read-only on the vault side, append-only on ours, and idempotent: frames
//! are deduplicated by the vault entry's `uuid` (or `message.id`), so calling
//! it repeatedly — or concurrently with the live pipeline — adds nothing new.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tokio::fs;
use tracing::{debug, warn};

use super::journal::SessionJournal;
use super::stream::{RawContent, StreamItem, ToolCallStatus, UiFrame};
use super::transform::Transformer;
use crate::util::{iso_now, project_slug};

/// One line of a vault session log. Anything else is skipped.
#[derive(Debug, Deserialize)]
struct VaultEntry {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(rename = "isSidechain", default)]
    is_sidechain: bool,
    #[serde(default)]
    message: Option<VaultMessage>,
}

#[derive(Debug, Deserialize)]
struct VaultMessage {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    content: Option<RawContent>,
}

/// Locate the vault directory for a project path: its name must equal or
/// contain the hyphen slug of the path.
pub async fn find_vault_dir(vault_root: &Path, project_path: &str) -> Option<PathBuf> {
    let slug = project_slug(project_path);
    let mut read_dir = fs::read_dir(vault_root).await.ok()?;
    while let Ok(Some(entry)) = read_dir.next_entry().await {
        if !entry.file_type().await.is_ok_and(|t| t.is_dir()) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name == slug || name.contains(&slug) {
            return Some(entry.path());
        }
    }
    None
}

/// Merge unseen vault entries into the session's `out.jsonl` as normalized
/// frames.
///
/// Returns `true` iff the vault log existed or any frame was emitted.
pub async fn hydrate(
    journal: &SessionJournal,
    transformer: &mut Transformer,
    vault_root: &Path,
    project_path: &str,
    session_id: &str,
    remote_session_id: Option<&str>,
) -> std::io::Result<bool> {
    let Some(vault_dir) = find_vault_dir(vault_root, project_path).await else {
        return Ok(false);
    };

    let log_name = remote_session_id.unwrap_or(session_id);
    let log_path = vault_dir.join(format!("{log_name}.jsonl"));
    let Ok(content) = fs::read_to_string(&log_path).await else {
        return Ok(false);
    };

    // Ids already present in normalized frames; vault entries that map onto
    // them are skipped.
    let mut known: HashSet<String> = journal
        .read_output_history()
        .await
        .iter()
        .filter_map(|l| UiFrame::parse_item(l))
        .map(|item| item.id().to_string())
        .collect();

    let mut emitted = false;
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        let entry: VaultEntry = match serde_json::from_str(line) {
            Ok(e) => e,
            Err(e) => {
                debug!("vault {}: skipping unparseable line: {e}", log_path.display());
                continue;
            }
        };
        if entry.is_sidechain {
            continue;
        }

        for item in entry_to_items(&entry, transformer) {
            if known.contains(item.id()) {
                continue;
            }
            known.insert(item.id().to_string());
            let frame = UiFrame::StreamItem { item };
            journal.append_output(&frame.to_line()).await?;
            emitted = true;
        }
    }

    if emitted {
        debug!("hydrated session {session_id} from {}", log_path.display());
    }
    Ok(true)
}

/// Map one vault entry onto normalized frames, using the same block mapping
/// as the live pipeline but with tool calls marked completed (the vault is a
/// record of finished history).
fn entry_to_items(entry: &VaultEntry, transformer: &mut Transformer) -> Vec<StreamItem> {
    let base_id = entry
        .uuid
        .clone()
        .or_else(|| entry.message.as_ref().and_then(|m| m.id.clone()));
    let Some(base_id) = base_id else {
        return Vec::new();
    };
    let Some(message) = &entry.message else {
        return Vec::new();
    };

    match entry.kind.as_deref() {
        Some("user") => match &message.content {
            Some(RawContent::Text(text)) if !text.is_empty() => vec![StreamItem::UserMessage {
                text: text.clone(),
                id: base_id,
                timestamp: iso_now(),
            }],
            Some(RawContent::Blocks(blocks)) => {
                // Tool results ride along in user entries; plain text blocks
                // are the user turn itself.
                let mut out = super::transform::TransformOutput::default();
                transformer.map_blocks(blocks, Some(&base_id), ToolCallStatus::Completed, &mut out);
                out.items
                    .into_iter()
                    .map(|item| match item {
                        StreamItem::AssistantMessage { text, id, timestamp } => {
                            StreamItem::UserMessage { text, id, timestamp }
                        }
                        other => other,
                    })
                    .collect()
            }
            _ => Vec::new(),
        },
        Some("assistant") => match &message.content {
            Some(RawContent::Blocks(blocks)) => {
                let mut out = super::transform::TransformOutput::default();
                transformer.map_blocks(blocks, Some(&base_id), ToolCallStatus::Completed, &mut out);
                out.items
            }
            Some(RawContent::Text(text)) if !text.is_empty() => {
                vec![StreamItem::AssistantMessage {
                    text: text.clone(),
                    id: base_id,
                    timestamp: iso_now(),
                }]
            }
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

/// Warn-once helper used by callers that treat hydration as best-effort.
pub async fn hydrate_best_effort(
    journal: &SessionJournal,
    transformer: &mut Transformer,
    vault_root: &Path,
    project_path: &str,
    session_id: &str,
    remote_session_id: Option<&str>,
) -> bool {
    match hydrate(
        journal,
        transformer,
        vault_root,
        project_path,
        session_id,
        remote_session_id,
    )
    .await
    {
        Ok(found) => found,
        Err(e) => {
            warn!("Session {session_id}: vault hydration failed: {e}");
            false
        }
    }
}
