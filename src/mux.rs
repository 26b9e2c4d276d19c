//! Terminal-multiplexer adapter.
//!
//! Each session's supervisor loop lives inside a detached tmux session named
//! deterministically from the session id, which is what lets assistant
//! processes survive server restarts. The engine only ever talks to the
//! multiplexer through the [`Multiplexer`] trait so tests can substitute a
//! fake.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::supervisor;

/// Prefix for all tmux sessions owned by this server.
const MUX_PREFIX: &str = "abridge-";

/// Deterministic tmux session name for a session id.
pub fn mux_name(session_id: &str) -> String {
    format!("{MUX_PREFIX}{session_id}")
}

/// Result of matching live tmux sessions against on-disk session directories.
#[derive(Debug, Default, Clone)]
pub struct ReconcileReport {
    /// Session ids with both a live tmux session and a `sessions/<id>/` dir.
    pub alive: Vec<String>,
    /// Session ids with a live tmux session but no directory.
    pub orphaned: Vec<String>,
}

/// Lifecycle operations on the multiplexer hosting supervisor loops.
#[async_trait]
pub trait Multiplexer: Send + Sync {
    async fn session_exists(&self, session_id: &str) -> bool;

    /// Start a detached multiplexer session running the supervisor loop.
    async fn create_session(
        &self,
        session_id: &str,
        session_dir: &Path,
        model: &str,
        project_dir: &Path,
    ) -> Result<(), String>;

    /// Send an attention signal (terminal interrupt) into the session. Only
    /// the inner assistant process reacts; the supervisor loop ignores it.
    async fn send_interrupt(&self, session_id: &str) -> Result<(), String>;

    /// Hard-terminate the multiplexer session.
    async fn kill_session(&self, session_id: &str) -> Result<(), String>;

    /// Match live multiplexer sessions against `sessions/<id>/` directories.
    async fn reconcile_sessions(&self, sessions_root: &Path) -> ReconcileReport;
}

/// tmux-backed implementation.
pub struct TmuxMux {
    assistant_bin: String,
}

impl TmuxMux {
    pub fn new(assistant_bin: &str) -> Self {
        Self {
            assistant_bin: assistant_bin.to_string(),
        }
    }

    async fn tmux(args: &[&str]) -> Result<std::process::Output, String> {
        Command::new("tmux")
            .args(args)
            .output()
            .await
            .map_err(|e| format!("tmux {}: {e}", args.first().unwrap_or(&"")))
    }
}

#[async_trait]
impl Multiplexer for TmuxMux {
    async fn session_exists(&self, session_id: &str) -> bool {
        Self::tmux(&["has-session", "-t", &mux_name(session_id)])
            .await
            .is_ok_and(|out| out.status.success())
    }

    async fn create_session(
        &self,
        session_id: &str,
        session_dir: &Path,
        model: &str,
        project_dir: &Path,
    ) -> Result<(), String> {
        let script = supervisor::write_script(session_dir)
            .await
            .map_err(|e| format!("write supervisor script: {e}"))?;

        let name = mux_name(session_id);
        let script = script.to_string_lossy().into_owned();
        let session_dir = session_dir.to_string_lossy().into_owned();
        let project_dir = project_dir.to_string_lossy().into_owned();
        let out = Self::tmux(&[
            "new-session",
            "-d",
            "-s",
            &name,
            "sh",
            &script,
            &session_dir,
            model,
            &project_dir,
            &self.assistant_bin,
        ])
        .await?;

        if out.status.success() {
            debug!("tmux session {name} created");
            Ok(())
        } else {
            Err(format!(
                "tmux new-session {name}: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            ))
        }
    }

    async fn send_interrupt(&self, session_id: &str) -> Result<(), String> {
        let name = mux_name(session_id);
        let out = Self::tmux(&["send-keys", "-t", &name, "C-c"]).await?;
        if out.status.success() {
            Ok(())
        } else {
            Err(format!(
                "tmux send-keys {name}: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            ))
        }
    }

    async fn kill_session(&self, session_id: &str) -> Result<(), String> {
        let name = mux_name(session_id);
        let out = Self::tmux(&["kill-session", "-t", &name]).await?;
        if out.status.success() {
            Ok(())
        } else {
            Err(format!(
                "tmux kill-session {name}: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            ))
        }
    }

    async fn reconcile_sessions(&self, sessions_root: &Path) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let Ok(out) = Self::tmux(&["list-sessions", "-F", "#{session_name}"]).await else {
            warn!("tmux unavailable, treating all sessions as dead");
            return report;
        };
        if !out.status.success() {
            // "no server running" — nothing alive.
            return report;
        }

        for line in String::from_utf8_lossy(&out.stdout).lines() {
            let Some(session_id) = line.trim().strip_prefix(MUX_PREFIX) else {
                continue;
            };
            let dir: PathBuf = sessions_root.join(session_id);
            if dir.is_dir() {
                report.alive.push(session_id.to_string());
            } else {
                report.orphaned.push(session_id.to_string());
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mux_name_is_deterministic() {
        assert_eq!(mux_name("abc"), "abridge-abc");
        assert_eq!(mux_name("abc"), mux_name("abc"));
    }

    #[test]
    fn test_mux_name_strip_roundtrip() {
        let name = mux_name("f9d2");
        assert_eq!(name.strip_prefix(MUX_PREFIX), Some("f9d2"));
    }
}
