//! Session lifecycle management for assistant subprocesses.
//!
//! [`SessionEngine`] is the single authority for creating, waking, feeding,
//! observing, and destroying sessions. Each session wraps an assistant CLI
//! process hosted by a supervisor loop inside a tmux session, wired to the
//! server through a named pipe and a pair of append-only journals:
//!
//! - **Submit** appends the input to `in.jsonl`, echoes a `user_message`
//!   frame into `out.jsonl`, and delivers over the FIFO — or queues when a
//!   turn is in flight.
//! - **Observe** hydrates history from the assistant's own vault, snapshots
//!   the timeline, and tails `out.jsonl` live.
//! - **Reconcile** reattaches to tmux sessions that survived a server
//!   restart and resumes any inputs that were never delivered.
//! - **Reap** hibernates sessions idle for too long; the tmux side stays
//!   alive for later reconnection.
//!
//! ## Concurrency
//!
//! The registry map is behind an `RwLock` with short critical sections. All
//! per-session runtime state (status, FIFO writer, wake/delivery flags,
//! watcher refcount) lives in a per-session `Mutex`, so every status
//! transition is serialized per session. Transitions are announced on the
//! [`StatusBus`]; nothing outside this module mutates status.

pub mod bus;
pub mod journal;
pub mod pipe;
pub mod stream;
pub mod transform;
pub mod vault;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::mux::Multiplexer;
use crate::util::now_ms;
use bus::{BusEvent, StatusBus};
use journal::{InputEntry, InputKind, MetadataPatch, SessionJournal, SessionMetadata, SessionStatus};
use pipe::PipeWriter;
use stream::{AgentStatus, ServerFrame, StreamItem, UiFrame};
use transform::{NoiseFilter, Transformer};

/// Delay before the queue is re-entered after a turn terminator, so inputs
/// submitted at the same instant can settle into `in.jsonl` first.
const TURN_SETTLE_DELAY: Duration = Duration::from_millis(100);

/// How long `interrupt` waits for a turn terminator before forcing `idle`.
const INTERRUPT_FALLBACK: Duration = Duration::from_secs(3);

/// Cadence of the observer re-hydration tick.
const REHYDRATE_INTERVAL: Duration = Duration::from_secs(10);

/// Poll cadence of the per-observer `out.jsonl` tail.
const OBSERVER_TAIL_INTERVAL: Duration = Duration::from_millis(100);

/// Engine-level settings, fixed at construction.
pub struct EngineConfig {
    /// Root directory holding one subdirectory per session.
    pub sessions_root: PathBuf,
    /// The assistant tool's own vault of per-project session logs.
    pub vault_root: PathBuf,
    /// Model used when a session has none persisted.
    pub default_model: String,
    /// Deadline for the FIFO open during wake.
    pub wake_timeout: Duration,
    /// Idle threshold after which the reaper hibernates a session.
    pub reap_idle: Duration,
    /// Reaper cadence.
    pub reap_interval: Duration,
    /// Text-frame noise rules.
    pub noise: Arc<NoiseFilter>,
}

/// Session summary returned by `GET /api/agents` and [`SessionEngine::get_state`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub project_path: String,
    pub model: String,
    /// Live runtime status when the session is loaded, else the persisted one.
    pub status: SessionStatus,
    pub last_seen: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claude_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_result_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_viewed_at: Option<u64>,
    pub has_unread: bool,
    /// Whether the engine currently holds the session's FIFO writer.
    pub active: bool,
}

/// A live transform watcher plus the number of observers sharing it.
struct WatcherEntry {
    refs: usize,
    task: JoinHandle<()>,
}

/// Mutable per-session runtime state. Only ever touched under the handle's
/// mutex.
struct SessionRuntime {
    status: SessionStatus,
    writer: Option<PipeWriter>,
    last_activity: Instant,
    /// A wake is in flight; concurrent wakes wait instead of racing.
    waking: bool,
    /// An input delivery is in flight; gates double delivery.
    delivering: bool,
    /// A notification-style tool fired and no ack has arrived yet. While
    /// set, turn terminators leave the status untouched.
    awaiting_ack: bool,
    watcher: Option<WatcherEntry>,
}

impl SessionRuntime {
    fn new() -> Self {
        Self {
            status: SessionStatus::Sleeping,
            writer: None,
            last_activity: Instant::now(),
            waking: false,
            delivering: false,
            awaiting_ack: false,
            watcher: None,
        }
    }
}

/// One registered session: journal handle plus runtime state.
pub struct SessionHandle {
    id: String,
    journal: SessionJournal,
    state: Mutex<SessionRuntime>,
}

impl SessionHandle {
    fn new(sessions_root: &Path, id: &str) -> Self {
        Self {
            id: id.to_string(),
            journal: SessionJournal::new(sessions_root, id),
            state: Mutex::new(SessionRuntime::new()),
        }
    }

    pub(crate) fn journal(&self) -> &SessionJournal {
        &self.journal
    }
}

struct EngineInner {
    cfg: EngineConfig,
    mux: Arc<dyn Multiplexer>,
    bus: StatusBus,
    registry: RwLock<HashMap<String, Arc<SessionHandle>>>,
}

/// Cloneable engine facade — all clones share the same inner state.
#[derive(Clone)]
pub struct SessionEngine {
    inner: Arc<EngineInner>,
}

impl SessionEngine {
    pub fn new(cfg: EngineConfig, mux: Arc<dyn Multiplexer>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                cfg,
                mux,
                bus: StatusBus::new(),
                registry: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn sessions_root(&self) -> &Path {
        &self.inner.cfg.sessions_root
    }

    pub(crate) fn noise_filter(&self) -> Arc<NoiseFilter> {
        Arc::clone(&self.inner.cfg.noise)
    }

    /// Deliver a server control frame (title update, advisory marker) to the
    /// session's live observers.
    pub fn publish_control(&self, session_id: &str, frame: ServerFrame) {
        self.inner.bus.emit_control(session_id, frame);
    }

    pub(crate) async fn handle(&self, id: &str) -> Option<Arc<SessionHandle>> {
        self.inner.registry.read().await.get(id).cloned()
    }

    async fn handle_or_create(&self, id: &str) -> std::io::Result<Arc<SessionHandle>> {
        if let Some(handle) = self.handle(id).await {
            return Ok(handle);
        }
        let handle = Arc::new(SessionHandle::new(&self.inner.cfg.sessions_root, id));
        handle.journal.ensure_storage().await?;
        let mut registry = self.inner.registry.write().await;
        Ok(Arc::clone(
            registry.entry(id.to_string()).or_insert(handle),
        ))
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────────

    /// Upsert session metadata and wake the supervisor harness.
    pub async fn create(
        &self,
        id: &str,
        project_path: &str,
        model: Option<&str>,
        resume_session_id: Option<&str>,
    ) -> Result<SessionSummary, String> {
        let handle = self.handle_or_create(id).await.map_err(|e| e.to_string())?;

        let model = model
            .map(ToString::to_string)
            .unwrap_or_else(|| self.inner.cfg.default_model.clone());
        handle
            .journal
            .update_metadata(MetadataPatch {
                project_path: Some(project_path.to_string()),
                model: Some(model),
                claude_session_id: resume_session_id.map(ToString::to_string),
                ..MetadataPatch::default()
            })
            .await
            .map_err(|e| e.to_string())?;
        if let Some(resume) = resume_session_id {
            handle
                .journal
                .write_resume_id(resume)
                .await
                .map_err(|e| e.to_string())?;
        }

        self.ensure_awake(&handle)
            .await
            .map_err(|e| format!("wake failed: {e}"))?;

        self.get_state(id)
            .await
            .ok_or_else(|| format!("Session {id} vanished after create"))
    }

    /// Record a user input and deliver it now, or queue it behind the
    /// in-flight turn. Returns once the input is durable.
    pub async fn submit(
        &self,
        id: &str,
        client_id: &str,
        text: &str,
    ) -> Result<InputEntry, String> {
        let handle = self.handle_or_create(id).await.map_err(|e| e.to_string())?;

        let entry = handle
            .journal
            .append_input(client_id, InputKind::User, text)
            .await
            .map_err(|e| e.to_string())?;

        // The echo frame is the single source of truth for the user turn in
        // history; observers render it immediately from the tail.
        let echo = StreamItem::UserMessage {
            text: entry.text.clone(),
            id: entry.id.clone(),
            timestamp: entry.timestamp.clone(),
        };
        handle
            .journal
            .append_output(&UiFrame::StreamItem { item: echo }.to_line())
            .await
            .map_err(|e| e.to_string())?;

        {
            let mut st = handle.state.lock().await;
            // Any user input acknowledges a pending notification.
            st.awaiting_ack = false;
            if st.status == SessionStatus::Busy || st.waking || st.delivering {
                return Ok(entry);
            }
        }

        self.process_next_input(id).await;
        Ok(entry)
    }

    /// Persisted metadata overlaid with live runtime status.
    pub async fn get_state(&self, id: &str) -> Option<SessionSummary> {
        let live = self.handle(id).await;
        let meta = match &live {
            Some(h) => h.journal.get_metadata().await,
            None => {
                SessionJournal::new(&self.inner.cfg.sessions_root, id)
                    .get_metadata()
                    .await
            }
        }?;

        let (status, active) = match &live {
            Some(h) => {
                let st = h.state.lock().await;
                (st.status, st.writer.is_some())
            }
            None => (meta.status, false),
        };

        let has_unread = meta.has_unread();

        Some(SessionSummary {
            session_id: meta.session_id,
            project_path: meta.project_path,
            model: meta.model,
            status,
            last_seen: meta.last_seen,
            claude_session_id: meta.claude_session_id,
            last_result_at: meta.last_result_at,
            last_viewed_at: meta.last_viewed_at,
            has_unread,
            active,
        })
    }

    /// Every session with a directory under the sessions root, newest first.
    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        let mut out = Vec::new();
        let Ok(mut read_dir) = tokio::fs::read_dir(&self.inner.cfg.sessions_root).await else {
            return out;
        };
        while let Ok(Some(entry)) = read_dir.next_entry().await {
            if !entry.file_type().await.is_ok_and(|t| t.is_dir()) {
                continue;
            }
            let id = entry.file_name().to_string_lossy().to_string();
            if let Some(summary) = self.get_state(&id).await {
                out.push(summary);
            }
        }
        out.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        out
    }

    /// Ids whose FIFO writer is currently open.
    pub async fn list_active_sessions(&self) -> Vec<String> {
        let handles: Vec<_> = self.inner.registry.read().await.values().cloned().collect();
        let mut out = Vec::new();
        for handle in handles {
            if handle.state.lock().await.writer.is_some() {
                out.push(handle.id.clone());
            }
        }
        out
    }

    /// Soft-cancel the in-flight turn: attention-signal the assistant and
    /// close the FIFO writer so it sees EOF. If no turn terminator arrives
    /// within three seconds, status is forced back to `idle` and the queue
    /// re-entered.
    pub async fn interrupt(&self, id: &str) -> Result<(), String> {
        let handle = self
            .handle(id)
            .await
            .ok_or_else(|| format!("Session {id} not found"))?;

        self.inner.mux.send_interrupt(id).await?;

        {
            let mut st = handle.state.lock().await;
            st.writer = None;
            if st.status == SessionStatus::Error {
                st.status = SessionStatus::Idle;
                drop(st);
                self.inner.bus.emit_status(id, SessionStatus::Idle);
                let _ = handle
                    .journal
                    .update_metadata(MetadataPatch {
                        status: Some(SessionStatus::Idle),
                        ..MetadataPatch::default()
                    })
                    .await;
            }
        }

        let engine = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(INTERRUPT_FALLBACK).await;
            let Some(handle) = engine.handle(&id).await else {
                return;
            };
            let forced = {
                let mut st = handle.state.lock().await;
                if st.status == SessionStatus::Busy {
                    st.status = SessionStatus::Idle;
                    true
                } else {
                    false
                }
            };
            if forced {
                info!("Session {id}: no turn terminator after interrupt, forcing idle");
                engine.inner.bus.emit_status(&id, SessionStatus::Idle);
                let _ = handle
                    .journal
                    .update_metadata(MetadataPatch {
                        status: Some(SessionStatus::Idle),
                        ..MetadataPatch::default()
                    })
                    .await;
                engine.process_next_input(&id).await;
            }
        });

        Ok(())
    }

    /// Terminal for the session: kills the watcher regardless of refcount,
    /// kills the tmux session, and optionally removes the on-disk directory.
    pub async fn destroy(&self, id: &str, delete_files: bool) -> Result<(), String> {
        let handle = self.inner.registry.write().await.remove(id);
        if let Some(handle) = handle {
            let mut st = handle.state.lock().await;
            st.writer = None;
            if let Some(w) = st.watcher.take() {
                w.task.abort();
            }
        }

        if let Err(e) = self.inner.mux.kill_session(id).await {
            warn!("Session {id}: kill multiplexer failed: {e}");
        }

        if delete_files {
            let dir = self.inner.cfg.sessions_root.join(id);
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                warn!("Session {id}: remove {} failed: {e}", dir.display());
            }
        }

        info!("Session {id} destroyed (delete_files={delete_files})");
        Ok(())
    }

    /// Reattach to multiplexer sessions that survived a restart and resume
    /// delivery of inputs recorded but never processed. Multiplexer sessions
    /// without a directory are killed.
    pub async fn reconcile(&self) {
        let report = self
            .inner
            .mux
            .reconcile_sessions(&self.inner.cfg.sessions_root)
            .await;

        for id in &report.orphaned {
            info!("Killing orphaned multiplexer session {id}");
            if let Err(e) = self.inner.mux.kill_session(id).await {
                warn!("Session {id}: kill orphan failed: {e}");
            }
        }

        for id in &report.alive {
            if let Err(e) = self.reattach(id).await {
                warn!("Session {id}: reconcile failed: {e}");
            }
        }

        info!(
            "Reconciled {} alive session(s), {} orphan(s)",
            report.alive.len(),
            report.orphaned.len()
        );
    }

    async fn reattach(&self, id: &str) -> Result<(), String> {
        let handle = self.handle_or_create(id).await.map_err(|e| e.to_string())?;
        self.ensure_awake(&handle).await.map_err(|e| e.to_string())?;

        let meta = handle
            .journal
            .get_metadata()
            .await
            .unwrap_or_else(|| SessionMetadata::synthesize(id));
        let inputs = handle.journal.read_input_history().await;
        if next_input(&inputs, meta.last_processed_input_id.as_deref()).is_some() {
            self.process_next_input(id).await;
        }
        Ok(())
    }

    /// Graceful stop: close all FIFO writers (supervisors see EOF, their
    /// inner subprocesses exit) and kill all transform watchers. The
    /// multiplexer sessions survive for the next reconcile.
    pub async fn stop(&self) {
        let handles: Vec<_> = self.inner.registry.read().await.values().cloned().collect();
        for handle in handles {
            let mut st = handle.state.lock().await;
            st.writer = None;
            if let Some(w) = st.watcher.take() {
                w.task.abort();
            }
        }
        info!("Engine stopped; multiplexer sessions left alive for reconnection");
    }

    /// Background task hibernating sessions with no activity for longer than
    /// the configured idle threshold.
    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(engine.inner.cfg.reap_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                engine.reap_idle().await;
            }
        })
    }

    async fn reap_idle(&self) {
        let handles: Vec<_> = self.inner.registry.read().await.values().cloned().collect();
        for handle in handles {
            let hibernate = {
                let mut st = handle.state.lock().await;
                if st.writer.is_some() && st.last_activity.elapsed() >= self.inner.cfg.reap_idle {
                    st.writer = None;
                    st.status = SessionStatus::Sleeping;
                    true
                } else {
                    false
                }
            };
            if hibernate {
                info!("Session {}: idle, hibernating", handle.id);
                self.inner.bus.emit_status(&handle.id, SessionStatus::Sleeping);
                let _ = handle
                    .journal
                    .update_metadata(MetadataPatch {
                        status: Some(SessionStatus::Sleeping),
                        ..MetadataPatch::default()
                    })
                    .await;
            }
        }
    }

    // ─── Wake & delivery ─────────────────────────────────────────────────────

    /// Single-flight wake: ensure the supervisor harness exists and the FIFO
    /// writer is open. Concurrent callers wait for the in-flight wake.
    pub(crate) async fn ensure_awake(&self, handle: &Arc<SessionHandle>) -> std::io::Result<()> {
        loop {
            {
                let mut st = handle.state.lock().await;
                if st.writer.is_some() {
                    return Ok(());
                }
                if !st.waking {
                    st.waking = true;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let result = self.wake(handle).await;

        let mut st = handle.state.lock().await;
        st.waking = false;
        match result {
            Ok(writer) => {
                st.writer = Some(writer);
                st.status = SessionStatus::Idle;
                st.last_activity = Instant::now();
                drop(st);
                self.inner.bus.emit_status(&handle.id, SessionStatus::Idle);
                let _ = handle
                    .journal
                    .update_metadata(MetadataPatch {
                        status: Some(SessionStatus::Idle),
                        ..MetadataPatch::default()
                    })
                    .await;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn wake(&self, handle: &Arc<SessionHandle>) -> std::io::Result<PipeWriter> {
        handle.journal.ensure_storage().await?;

        let meta = handle
            .journal
            .get_metadata()
            .await
            .unwrap_or_else(|| SessionMetadata::synthesize(&handle.id));
        let project = if meta.project_path.is_empty() {
            std::env::current_dir()?.to_string_lossy().into_owned()
        } else {
            meta.project_path
        };
        let model = if meta.model.is_empty() {
            self.inner.cfg.default_model.clone()
        } else {
            meta.model
        };

        if !self.inner.mux.session_exists(&handle.id).await {
            self.inner
                .mux
                .create_session(&handle.id, handle.journal.dir(), &model, Path::new(&project))
                .await
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        }

        PipeWriter::open(&handle.journal.fifo_path(), self.inner.cfg.wake_timeout).await
    }

    /// Deliver the next unprocessed `in.jsonl` entry, if any. Exactly-once:
    /// the delivery flag and the `busy` gate keep concurrent callers out, and
    /// `lastProcessedInputId` is only advanced after an accepted write.
    pub(crate) async fn process_next_input(&self, id: &str) {
        let Some(handle) = self.handle(id).await else {
            return;
        };
        {
            let mut st = handle.state.lock().await;
            if st.delivering || st.status == SessionStatus::Busy {
                return;
            }
            st.delivering = true;
        }

        let result = self.deliver_next(&handle).await;

        handle.state.lock().await.delivering = false;
        if let Err(e) = result {
            warn!("Session {id}: input delivery failed: {e}");
        }
    }

    async fn deliver_next(&self, handle: &Arc<SessionHandle>) -> Result<(), String> {
        let id = handle.id.clone();
        let meta = handle
            .journal
            .get_metadata()
            .await
            .unwrap_or_else(|| SessionMetadata::synthesize(&id));
        let inputs = handle.journal.read_input_history().await;
        let Some(entry) = next_input(&inputs, meta.last_processed_input_id.as_deref()) else {
            return Ok(());
        };
        let entry = entry.clone();

        eprintln!("DBG before ensure_awake");
        self.ensure_awake(handle).await.map_err(|e| e.to_string())?;
        eprintln!("DBG after ensure_awake");

        {
            let mut st = handle.state.lock().await;
            st.status = SessionStatus::Busy;
            st.last_activity = Instant::now();
        }
        self.inner.bus.emit_status(&id, SessionStatus::Busy);
        let _ = handle
            .journal
            .update_metadata(MetadataPatch {
                status: Some(SessionStatus::Busy),
                ..MetadataPatch::default()
            })
            .await;

        let frame = serde_json::json!({
            "type": "user",
            "message": { "role": "user", "content": entry.text },
            "session_id": meta.claude_session_id.as_deref().unwrap_or("default"),
            "parent_tool_use_id": null,
        })
        .to_string();

        eprintln!("DBG before write_to_pipe");
        let first = self.write_to_pipe(handle, &frame).await;
        eprintln!("DBG after write_to_pipe: {:?}", first.is_ok());
        let delivered = match first {
            Ok(()) => true,
            Err(e) => {
                // Transient broken pipe while the supervisor restarts the
                // assistant: reconnect and retry exactly once.
                warn!("Session {id}: pipe write failed ({e}), reconnecting once");
                handle.state.lock().await.writer = None;
                match self.ensure_awake(handle).await {
                    Ok(()) => self.write_to_pipe(handle, &frame).await.is_ok(),
                    Err(_) => false,
                }
            }
        };

        if delivered {
            handle.state.lock().await.last_activity = Instant::now();
            handle
                .journal
                .update_metadata(MetadataPatch {
                    last_processed_input_id: Some(entry.id.clone()),
                    ..MetadataPatch::default()
                })
                .await
                .map_err(|e| e.to_string())?;
            Ok(())
        } else {
            {
                let mut st = handle.state.lock().await;
                st.writer = None;
                st.status = SessionStatus::Sleeping;
            }
            self.inner.bus.emit_status(&id, SessionStatus::Sleeping);
            let _ = handle
                .journal
                .update_metadata(MetadataPatch {
                    status: Some(SessionStatus::Sleeping),
                    ..MetadataPatch::default()
                })
                .await;
            Err("pipe write failed after reconnect".to_string())
        }
    }

    async fn write_to_pipe(&self, handle: &Arc<SessionHandle>, line: &str) -> std::io::Result<()> {
        let mut st = handle.state.lock().await;
        match st.writer.as_mut() {
            Some(writer) => writer.write_line(line).await,
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "no FIFO writer",
            )),
        }
    }

    // ─── Watcher-driven transitions ──────────────────────────────────────────

    /// Called by the transform watcher when a turn terminator is observed.
    pub(crate) async fn complete_turn(&self, id: &str, errored: bool) {
        let Some(handle) = self.handle(id).await else {
            return;
        };

        let new_status = {
            let mut st = handle.state.lock().await;
            st.last_activity = Instant::now();
            if st.awaiting_ack {
                None
            } else {
                let status = if errored {
                    SessionStatus::Error
                } else {
                    SessionStatus::Idle
                };
                st.status = status;
                Some(status)
            }
        };

        let mut patch = MetadataPatch {
            last_result_at: Some(now_ms()),
            ..MetadataPatch::default()
        };
        if let Some(status) = new_status {
            patch.status = Some(status);
        }
        let _ = handle.journal.update_metadata(patch).await;
        if let Some(status) = new_status {
            self.inner.bus.emit_status(id, status);
        }

        let engine = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(TURN_SETTLE_DELAY).await;
            engine.process_next_input(&id).await;
        });
    }

    /// Called by the transform watcher on a `system/init` frame. The captured
    /// id only moves forward: identical captures are no-ops, newer ones
    /// replace the stored value and the `resume_id` file.
    pub(crate) async fn capture_remote_session_id(&self, id: &str, remote: &str) {
        let Some(handle) = self.handle(id).await else {
            return;
        };
        let current = handle
            .journal
            .get_metadata()
            .await
            .and_then(|m| m.claude_session_id);
        if current.as_deref() == Some(remote) {
            return;
        }
        let _ = handle
            .journal
            .update_metadata(MetadataPatch {
                claude_session_id: Some(remote.to_string()),
                ..MetadataPatch::default()
            })
            .await;
        if let Err(e) = handle.journal.write_resume_id(remote).await {
            warn!("Session {id}: failed to persist resume id: {e}");
        }
    }

    /// Called by the transform watcher when a notification-style tool fires.
    pub(crate) async fn mark_awaiting_ack(&self, id: &str) {
        if let Some(handle) = self.handle(id).await {
            handle.state.lock().await.awaiting_ack = true;
        }
    }

    // ─── Observation ─────────────────────────────────────────────────────────

    /// Attach a read-only observer. The returned channel yields
    /// newline-terminated JSON lines in the contract order: one
    /// `agent_status`, one `history_snapshot`, then live frames. Dropping the
    /// receiver cancels the observer and releases the shared watcher.
    pub async fn observe(
        &self,
        id: &str,
        offset: usize,
    ) -> Result<mpsc::Receiver<String>, String> {
        let handle = self.handle_or_create(id).await.map_err(|e| e.to_string())?;
        let (tx, rx) = mpsc::channel(256);
        let engine = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            engine.run_observer(&handle, &id, offset, tx).await;
            engine.release_watcher(&id).await;
        });
        Ok(rx)
    }

    async fn acquire_watcher(&self, handle: &Arc<SessionHandle>) {
        let mut st = handle.state.lock().await;
        if let Some(w) = st.watcher.as_mut() {
            w.refs += 1;
            return;
        }
        let task = tokio::spawn(transform::run_watcher(self.clone(), handle.id.clone()));
        st.watcher = Some(WatcherEntry { refs: 1, task });
    }

    async fn release_watcher(&self, id: &str) {
        let Some(handle) = self.handle(id).await else {
            return;
        };
        let mut st = handle.state.lock().await;
        if let Some(w) = st.watcher.as_mut() {
            w.refs = w.refs.saturating_sub(1);
            if w.refs == 0 {
                if let Some(w) = st.watcher.take() {
                    w.task.abort();
                }
            }
        }
    }

    async fn hydrate_once(&self, handle: &Arc<SessionHandle>, id: &str) {
        let Some(meta) = handle.journal.get_metadata().await else {
            return;
        };
        if meta.project_path.is_empty() {
            return;
        }
        let mut transformer = Transformer::new(self.noise_filter());
        vault::hydrate_best_effort(
            &handle.journal,
            &mut transformer,
            &self.inner.cfg.vault_root,
            &meta.project_path,
            id,
            meta.claude_session_id.as_deref(),
        )
        .await;
    }

    #[allow(clippy::too_many_lines)]
    async fn run_observer(
        &self,
        handle: &Arc<SessionHandle>,
        id: &str,
        offset: usize,
        tx: mpsc::Sender<String>,
    ) {
        self.hydrate_once(handle, id).await;
        if let Err(e) = self.ensure_awake(handle).await {
            warn!("Session {id}: observer wake failed: {e}");
        }

        self.acquire_watcher(handle).await;

        // Subscribe before the snapshot so no transition lands in the gap.
        let mut bus_rx = self.inner.bus.subscribe();

        let status = handle.state.lock().await.status;
        if tx
            .send(ServerFrame::AgentStatus { status: agent_status(status) }.to_line())
            .await
            .is_err()
        {
            return;
        }

        let (lines, mut tail_offset) = handle.journal.read_output_with_len().await;
        let items: Vec<StreamItem> = lines
            .iter()
            .filter_map(|l| UiFrame::parse_item(l))
            .skip(offset)
            .collect();
        if tx
            .send(ServerFrame::HistorySnapshot { items }.to_line())
            .await
            .is_err()
        {
            return;
        }

        // First viewer since the last result clears the unread marker.
        if let Some(meta) = handle.journal.get_metadata().await {
            if meta.has_unread() {
                let _ = handle
                    .journal
                    .update_metadata(MetadataPatch {
                        last_viewed_at: Some(now_ms()),
                        ..MetadataPatch::default()
                    })
                    .await;
                if tx.send(ServerFrame::UnreadCleared.to_line()).await.is_err() {
                    return;
                }
            }
        }

        let out_path = handle.journal.output_path();
        let mut carry = String::new();
        let mut tail_tick = tokio::time::interval(OBSERVER_TAIL_INTERVAL);
        tail_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut rehydrate_tick = tokio::time::interval_at(
            tokio::time::Instant::now() + REHYDRATE_INTERVAL,
            REHYDRATE_INTERVAL,
        );
        rehydrate_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tail_tick.tick() => {
                    for line in
                        transform::read_new_lines(&out_path, &mut tail_offset, &mut carry).await
                    {
                        // Raw frames on the tail belong to the transform
                        // watcher; observers forward normalized lines only.
                        if UiFrame::parse_item(&line).is_some()
                            && tx.send(line).await.is_err()
                        {
                            return;
                        }
                    }
                }
                event = bus_rx.recv() => {
                    match event {
                        Ok(event) if event.session_id() == id => {
                            let line = match event {
                                BusEvent::Status { status, .. } => {
                                    ServerFrame::AgentStatus { status: agent_status(status) }
                                        .to_line()
                                }
                                BusEvent::Control { frame, .. } => frame.to_line(),
                            };
                            if tx.send(line).await.is_err() {
                                return;
                            }
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Session {id}: observer lagged {n} status events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    }
                }
                _ = rehydrate_tick.tick() => {
                    self.hydrate_once(handle, id).await;
                }
            }
        }
    }
}

/// Map a runtime status onto the client-visible tristate.
fn agent_status(status: SessionStatus) -> AgentStatus {
    match status {
        SessionStatus::Busy => AgentStatus::Thinking,
        SessionStatus::Error => AgentStatus::Error,
        SessionStatus::Sleeping | SessionStatus::Idle => AgentStatus::Idle,
    }
}

/// The entry immediately after `last` in append order, or the first entry
/// when nothing has been processed. An unknown `last` id yields nothing
/// rather than guessing and risking a duplicate delivery.
fn next_input<'a>(inputs: &'a [InputEntry], last: Option<&str>) -> Option<&'a InputEntry> {
    match last {
        None => inputs.first(),
        Some(last_id) => {
            let pos = inputs.iter().position(|e| e.id == last_id)?;
            inputs.get(pos + 1)
        }
    }
}
