//! Session monitoring service — tails transcripts and the hook event log.
//!
//! A single background loop that, every poll interval:
//!   1. reads new `events.jsonl` lines from the persisted offset and emits
//!      them as typed [`HookEvent`]s;
//!   2. reloads the session map, prunes dead windows, and diffs it against
//!      the previous cycle (session replaced / window removed / added);
//!   3. detects live tmux windows not yet known to the map;
//!   4. reads new transcript entries per session (byte offset for JSONL
//!      providers, message count for whole-file providers) and emits one
//!      [`NewMessage`] per lowered entry.
//!
//! All output flows through one event channel; the monitor knows nothing
//! about Telegram. Loop errors back off exponentially (2 s → 30 s) and
//! never kill the loop.

pub mod state;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::events::{HookEvent, HookEventKind, MonitorEvent, NewMessage, NewWindowEvent};
use crate::provider::{AgentProvider, provider_by_name};
use crate::session::{SessionManager, SessionMapEntry};
use crate::tmux::WindowControl;
use crate::util::read_cwd_from_jsonl;
use state::{MonitorState, TrackedSession};

/// Exponential backoff bounds for loop errors.
const BACKOFF_MIN: Duration = Duration::from_secs(2);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
enum CycleError {
    #[error(transparent)]
    Tmux(#[from] crate::tmux::TmuxError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A transcript file found by the projects-directory scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: String,
    pub file_path: PathBuf,
}

/// Shared record of when each session's transcript last grew. The status
/// poller reads it for its idle heuristic.
#[derive(Clone, Default)]
pub struct ActivityTracker {
    inner: Arc<Mutex<HashMap<String, Instant>>>,
}

impl ActivityTracker {
    pub fn record(&self, session_id: &str) {
        self.inner
            .lock()
            .expect("activity lock poisoned")
            .insert(session_id.to_string(), Instant::now());
    }

    pub fn last_activity(&self, session_id: &str) -> Option<Instant> {
        self.inner
            .lock()
            .expect("activity lock poisoned")
            .get(session_id)
            .copied()
    }

    fn remove(&self, session_id: &str) {
        self.inner
            .lock()
            .expect("activity lock poisoned")
            .remove(session_id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct FileMeta {
    mtime: SystemTime,
    size: u64,
}

/// Watches agent transcripts and the hook event log for changes.
pub struct SessionMonitor {
    poll_interval: Duration,
    events_file: PathBuf,
    projects_path: PathBuf,
    default_provider: String,
    session_manager: Arc<SessionManager>,
    tmux: Arc<dyn WindowControl>,
    tx: mpsc::UnboundedSender<MonitorEvent>,
    state: MonitorState,
    /// session_id → (tool_use_id → tool_name), carried across cycles.
    pending_tools: HashMap<String, HashMap<String, String>>,
    last_session_map: HashMap<String, SessionMapEntry>,
    /// In-memory (mtime, size) cache for quick change detection.
    file_meta: HashMap<String, FileMeta>,
    /// Window ids already announced via NewWindowEvent.
    announced_windows: HashSet<String>,
    activity: ActivityTracker,
}

impl SessionMonitor {
    /// Build a monitor. Returns the monitor, the event stream, and a
    /// cloneable activity handle for the status poller.
    pub fn new(
        config: &Config,
        session_manager: Arc<SessionManager>,
        tmux: Arc<dyn WindowControl>,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<MonitorEvent>,
        ActivityTracker,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let activity = ActivityTracker::default();
        let monitor = Self {
            poll_interval: config.monitor_poll_interval,
            events_file: config.events_file(),
            projects_path: config.claude_projects_path.clone(),
            default_provider: config.provider_name.clone(),
            session_manager,
            tmux,
            tx,
            state: MonitorState::load(config.monitor_state_file()),
            pending_tools: HashMap::new(),
            last_session_map: HashMap::new(),
            file_meta: HashMap::new(),
            announced_windows: HashSet::new(),
            activity: activity.clone(),
        };
        (monitor, rx, activity)
    }

    /// Run the poll loop until `shutdown` flips to true. Saves state on
    /// the way out.
    pub async fn run(mut self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        tracing::info!(
            "Session monitor started, polling every {:?}",
            self.poll_interval
        );
        self.cleanup_stale_sessions().await;
        self.last_session_map = self.session_manager.load_session_map().await;

        let mut error_streak = 0u32;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let delay = match self.poll_cycle().await {
                Ok(()) => {
                    error_streak = 0;
                    self.poll_interval
                }
                Err(e) => {
                    tracing::warn!("Monitor loop error: {e}");
                    let backoff = backoff_delay(error_streak);
                    error_streak = error_streak.saturating_add(1);
                    backoff
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {}
            }
        }

        self.state.save();
        tracing::info!("Session monitor stopped and state saved");
    }

    /// Remove tracked sessions that no longer appear in the session map
    /// (startup cleanup).
    async fn cleanup_stale_sessions(&mut self) {
        let current_map = self.session_manager.load_session_map().await;
        let active: HashSet<&str> = current_map
            .values()
            .map(|entry| entry.session_id.as_str())
            .collect();
        let stale: Vec<String> = self
            .state
            .tracked_session_ids()
            .into_iter()
            .filter(|sid| !active.contains(sid.as_str()))
            .collect();
        if !stale.is_empty() {
            tracing::info!("Startup cleanup: removing {} stale sessions", stale.len());
            for sid in stale {
                self.untrack_session(&sid);
            }
            self.state.save_if_dirty();
        }
    }

    fn untrack_session(&mut self, session_id: &str) {
        self.state.remove_session(session_id);
        self.file_meta.remove(session_id);
        self.pending_tools.remove(session_id);
        self.activity.remove(session_id);
    }

    fn emit(&self, event: MonitorEvent) {
        // A closed receiver only happens at shutdown.
        let _ = self.tx.send(event);
    }

    async fn poll_cycle(&mut self) -> Result<(), CycleError> {
        // Hook events first: lower latency than transcript polling.
        self.read_hook_events().await;

        let current_map = self.session_manager.load_session_map().await;
        self.diff_session_map(&current_map);

        let windows = self.tmux.list_windows().await?;
        let live_ids: HashSet<String> = windows.iter().map(|w| w.window_id.clone()).collect();
        self.session_manager.prune_session_map(&live_ids).await;
        self.announced_windows.retain(|wid| live_ids.contains(wid));

        // Live windows the session map does not know yet (agent not
        // started, or a provider without hooks).
        let bound = self.session_manager.bound_window_ids();
        for window in &windows {
            if current_map.contains_key(&window.window_id)
                || bound.contains(&window.window_id)
                || self.announced_windows.contains(&window.window_id)
            {
                continue;
            }
            self.announced_windows.insert(window.window_id.clone());
            self.emit(MonitorEvent::Window(NewWindowEvent {
                window_id: window.window_id.clone(),
                session_id: String::new(),
                window_name: window.window_name.clone(),
                cwd: window.cwd.clone(),
            }));
        }

        self.check_for_updates(&current_map, &windows).await;
        self.state.save_if_dirty();
        Ok(())
    }

    /// Compare the session map to the previous cycle: untrack replaced and
    /// removed sessions, announce added windows.
    fn diff_session_map(&mut self, current: &HashMap<String, SessionMapEntry>) {
        let mut to_remove: Vec<String> = Vec::new();

        for (window_id, old) in &self.last_session_map {
            match current.get(window_id) {
                Some(new) if new.session_id != old.session_id => {
                    tracing::info!(
                        "Window {window_id} session changed: {} -> {}",
                        old.session_id,
                        new.session_id
                    );
                    to_remove.push(old.session_id.clone());
                }
                None => {
                    tracing::info!(
                        "Window {window_id} removed, untracking session {}",
                        old.session_id
                    );
                    to_remove.push(old.session_id.clone());
                }
                _ => {}
            }
        }
        for sid in to_remove {
            if !sid.is_empty() {
                self.untrack_session(&sid);
            }
        }

        for (window_id, entry) in current {
            if self.last_session_map.contains_key(window_id) {
                continue;
            }
            if !entry.provider_name.is_empty() {
                self.session_manager
                    .set_window_provider(window_id, &entry.provider_name);
            }
            self.emit(MonitorEvent::Window(NewWindowEvent {
                window_id: window_id.clone(),
                session_id: entry.session_id.clone(),
                window_name: entry.window_name.clone(),
                cwd: entry.cwd.clone(),
            }));
        }

        self.last_session_map = current.clone();
    }

    /// Read new lines from `events.jsonl` and emit them as hook events.
    ///
    /// Only fully written lines (newline-terminated) are consumed; a
    /// partial tail is retried next cycle. Malformed complete lines are
    /// skipped while still advancing the offset. Truncation resets to 0.
    async fn read_hook_events(&mut self) {
        let Ok(meta) = tokio::fs::metadata(&self.events_file).await else {
            return;
        };
        let size = meta.len();
        let mut offset = self.state.events_offset();
        if offset > size {
            tracing::info!("events.jsonl truncated ({size} < {offset}), resetting offset");
            offset = 0;
        }
        if offset == size {
            self.state.set_events_offset(offset);
            return;
        }

        let buf = match read_from_offset(&self.events_file, offset).await {
            Ok(buf) => buf,
            Err(e) => {
                tracing::debug!("Could not read events file: {e}");
                return;
            }
        };

        let mut consumed = 0usize;
        while let Some(pos) = buf[consumed..].iter().position(|&b| b == b'\n') {
            let line_bytes = &buf[consumed..consumed + pos];
            consumed += pos + 1;

            let Ok(line) = std::str::from_utf8(line_bytes) else {
                tracing::debug!("Skipping non-UTF8 event line");
                continue;
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
                tracing::debug!("Skipping malformed event line");
                continue;
            };
            let Some(kind) = value
                .get("event")
                .and_then(|e| e.as_str())
                .and_then(HookEventKind::from_name)
            else {
                continue;
            };
            let event = HookEvent {
                kind,
                window_key: value
                    .get("window_key")
                    .and_then(|w| w.as_str())
                    .unwrap_or("")
                    .to_string(),
                session_id: value
                    .get("session_id")
                    .and_then(|s| s.as_str())
                    .unwrap_or("")
                    .to_string(),
                data: value.get("data").cloned().unwrap_or_default(),
                timestamp: value.get("ts").and_then(|t| t.as_f64()).unwrap_or(0.0),
            };
            self.emit(MonitorEvent::Hook(event));
        }
        self.state.set_events_offset(offset + consumed as u64);
    }

    fn provider_for_window(&self, window_id: &str) -> &'static dyn AgentProvider {
        let name = self.session_manager.get_window_provider(window_id);
        if name.is_empty() {
            provider_by_name(&self.default_provider)
        } else {
            provider_by_name(&name)
        }
    }

    /// Check all mapped sessions for new transcript entries.
    async fn check_for_updates(
        &mut self,
        current_map: &HashMap<String, SessionMapEntry>,
        windows: &[crate::tmux::TmuxWindow],
    ) {
        let mut sid_to_wid: HashMap<String, String> = HashMap::new();
        let mut direct: Vec<(String, PathBuf)> = Vec::new();
        let mut fallback_ids: HashSet<String> = HashSet::new();

        for (window_id, entry) in current_map {
            if entry.session_id.is_empty() {
                continue;
            }
            sid_to_wid.insert(entry.session_id.clone(), window_id.clone());
            if !entry.transcript_path.is_empty() {
                let path = PathBuf::from(&entry.transcript_path);
                if path.exists() {
                    direct.push((entry.session_id.clone(), path));
                    continue;
                }
            }
            fallback_ids.insert(entry.session_id.clone());
        }

        for (session_id, path) in direct {
            let window_id = sid_to_wid.get(&session_id).cloned().unwrap_or_default();
            self.process_session_file(&session_id, &path, &window_id)
                .await;
        }

        if fallback_ids.is_empty() {
            return;
        }
        let active_cwds: HashSet<String> = windows
            .iter()
            .map(|w| normalize_path(&w.cwd))
            .collect();
        if active_cwds.is_empty() {
            return;
        }
        let projects_path = self.projects_path.clone();
        let found = tokio::task::spawn_blocking(move || {
            scan_projects_sync(&projects_path, &active_cwds)
        })
        .await
        .unwrap_or_default();

        for info in found {
            if !fallback_ids.contains(&info.session_id) {
                continue;
            }
            let window_id = sid_to_wid
                .get(&info.session_id)
                .cloned()
                .unwrap_or_default();
            self.process_session_file(&info.session_id, &info.file_path, &window_id)
                .await;
        }
    }

    /// Process one transcript file: initialize tracking, detect changes,
    /// read the delta, lower it, and emit messages.
    async fn process_session_file(&mut self, session_id: &str, path: &Path, window_id: &str) {
        let provider = self.provider_for_window(window_id);
        let incremental = provider.capabilities().supports_incremental_read;

        let Some(tracked) = self.state.get_session(session_id).cloned() else {
            // New session: start past existing content so history does not
            // replay into the topic.
            let meta = file_meta(path);
            let initial_offset = if incremental {
                meta.map(|m| m.size).unwrap_or(0)
            } else {
                let path = path.to_path_buf();
                tokio::task::spawn_blocking(move || provider.read_transcript_file(&path, 0).1)
                    .await
                    .unwrap_or(0)
            };
            self.state.update_session(
                session_id,
                TrackedSession {
                    file_path: path.to_string_lossy().into_owned(),
                    last_byte_offset: initial_offset,
                },
            );
            if let Some(meta) = meta {
                self.file_meta.insert(session_id.to_string(), meta);
            }
            tracing::debug!("Started tracking session {session_id}");
            return;
        };

        let Some(current) = file_meta(path) else {
            return;
        };
        let cached = self.file_meta.get(session_id).copied();
        let unchanged = match cached {
            Some(cached) if incremental => {
                current.mtime <= cached.mtime && current.size <= tracked.last_byte_offset
            }
            // Whole-file providers track a message count, so only mtime is
            // a meaningful change signal.
            Some(cached) => current.mtime <= cached.mtime,
            None => false,
        };
        if unchanged {
            return;
        }

        let (entries, new_offset) = if incremental {
            read_new_jsonl_entries(provider, path, tracked.last_byte_offset).await
        } else {
            let path_buf = path.to_path_buf();
            let offset = tracked.last_byte_offset;
            tokio::task::spawn_blocking(move || provider.read_transcript_file(&path_buf, offset))
                .await
                .unwrap_or((Vec::new(), tracked.last_byte_offset))
        };
        self.file_meta.insert(session_id.to_string(), current);
        self.state.update_session(
            session_id,
            TrackedSession {
                file_path: tracked.file_path,
                last_byte_offset: new_offset,
            },
        );

        if entries.is_empty() {
            return;
        }
        self.activity.record(session_id);

        let pending = self.pending_tools.entry(session_id.to_string()).or_default();
        let messages = provider.parse_transcript_entries(&entries, pending);
        if pending.is_empty() {
            self.pending_tools.remove(session_id);
        }

        for message in messages {
            if message.text.is_empty() {
                continue;
            }
            self.emit(MonitorEvent::Message(NewMessage {
                session_id: session_id.to_string(),
                text: message.text,
                role: message.role,
                content_type: message.content_type,
                tool_use_id: message.tool_use_id,
                tool_name: message.tool_name,
            }));
        }
    }
}

fn backoff_delay(error_streak: u32) -> Duration {
    let factor = 2u32.saturating_pow(error_streak.min(8));
    (BACKOFF_MIN * factor).min(BACKOFF_MAX)
}

fn file_meta(path: &Path) -> Option<FileMeta> {
    let meta = std::fs::metadata(path).ok()?;
    Some(FileMeta {
        mtime: meta.modified().ok()?,
        size: meta.len(),
    })
}

async fn read_from_offset(path: &Path, offset: u64) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await?;
    Ok(buf)
}

/// Read new JSONL entries from `offset`, advancing only past lines that
/// parsed. A non-empty line that fails to parse is likely a partial write:
/// reading stops there and retries next cycle. Truncation resets to 0.
async fn read_new_jsonl_entries(
    provider: &dyn AgentProvider,
    path: &Path,
    mut offset: u64,
) -> (Vec<serde_json::Value>, u64) {
    let size = match tokio::fs::metadata(path).await {
        Ok(meta) => meta.len(),
        Err(_) => return (Vec::new(), offset),
    };
    if size < offset {
        tracing::info!(
            "Transcript {} truncated ({size} < {offset}), resetting offset",
            path.display()
        );
        offset = 0;
    }

    let buf = match read_from_offset(path, offset).await {
        Ok(buf) => buf,
        Err(e) => {
            tracing::debug!("Error reading transcript {}: {e}", path.display());
            return (Vec::new(), offset);
        }
    };

    let mut entries = Vec::new();
    let mut safe_offset = offset;
    let mut consumed = 0usize;
    while let Some(pos) = buf[consumed..].iter().position(|&b| b == b'\n') {
        let line_bytes = &buf[consumed..consumed + pos];
        let line_len = (pos + 1) as u64;
        consumed += pos + 1;

        let parsed = std::str::from_utf8(line_bytes)
            .ok()
            .and_then(|line| provider.parse_transcript_line(line));
        match parsed {
            Some(entry) => {
                entries.push(entry);
                safe_offset += line_len;
            }
            None => {
                if line_bytes.iter().all(|b| b.is_ascii_whitespace()) {
                    safe_offset += line_len;
                } else {
                    tracing::debug!("Partial JSONL line, will retry next cycle");
                    break;
                }
            }
        }
    }
    (entries, safe_offset)
}

fn normalize_path(path: &str) -> String {
    std::fs::canonicalize(path)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| path.to_string())
}

/// Scan the projects directory for transcript files belonging to active
/// working directories. Reads `sessions-index.json` when present and
/// falls back to bare `*.jsonl` files.
fn scan_projects_sync(projects_path: &Path, active_cwds: &HashSet<String>) -> Vec<SessionInfo> {
    let mut sessions = Vec::new();
    let Ok(project_dirs) = std::fs::read_dir(projects_path) else {
        return sessions;
    };

    for project_dir in project_dirs.flatten() {
        let dir_path = project_dir.path();
        if !dir_path.is_dir() {
            continue;
        }

        let mut indexed_ids: HashSet<String> = HashSet::new();
        let mut original_path = String::new();

        let index_file = dir_path.join("sessions-index.json");
        if let Ok(content) = std::fs::read_to_string(&index_file) {
            match serde_json::from_str::<serde_json::Value>(&content) {
                Ok(index) => {
                    original_path = index
                        .get("originalPath")
                        .and_then(|p| p.as_str())
                        .unwrap_or("")
                        .to_string();
                    let entries = index
                        .get("entries")
                        .and_then(|e| e.as_array())
                        .cloned()
                        .unwrap_or_default();
                    for entry in entries {
                        let session_id = entry
                            .get("sessionId")
                            .and_then(|s| s.as_str())
                            .unwrap_or("");
                        let full_path =
                            entry.get("fullPath").and_then(|p| p.as_str()).unwrap_or("");
                        if session_id.is_empty() || full_path.is_empty() {
                            continue;
                        }
                        let project_path = entry
                            .get("projectPath")
                            .and_then(|p| p.as_str())
                            .unwrap_or(&original_path);
                        if !active_cwds.contains(&normalize_path(project_path)) {
                            continue;
                        }
                        indexed_ids.insert(session_id.to_string());
                        let file_path = PathBuf::from(full_path);
                        if file_path.exists() {
                            sessions.push(SessionInfo {
                                session_id: session_id.to_string(),
                                file_path,
                            });
                        }
                    }
                }
                Err(e) => tracing::debug!("Error reading index {}: {e}", index_file.display()),
            }
        }

        // Bare .jsonl files not covered by the index.
        let Ok(files) = std::fs::read_dir(&dir_path) else {
            continue;
        };
        for file in files.flatten() {
            let path = file.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Some(session_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if indexed_ids.contains(session_id) {
                continue;
            }
            let project_path = if original_path.is_empty() {
                read_cwd_from_jsonl(&path)
            } else {
                original_path.clone()
            };
            if project_path.is_empty() || !active_cwds.contains(&normalize_path(&project_path)) {
                continue;
            }
            sessions.push(SessionInfo {
                session_id: session_id.to_string(),
                file_path: path,
            });
        }
    }
    sessions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmux::{FakeWindowControl, TmuxWindow};

    const SID: &str = "0195c5bc-6a2c-4890-a1b2-c3d4e5f60718";
    const SID2: &str = "0195c5bc-6a2c-4890-a1b2-c3d4e5f60719";

    struct Fixture {
        dir: tempfile::TempDir,
        monitor: SessionMonitor,
        rx: mpsc::UnboundedReceiver<MonitorEvent>,
        fake: Arc<FakeWindowControl>,
    }

    fn fixture(windows: Vec<TmuxWindow>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        // Config::from_env needs the bot env; build the monitor directly.
        let session_manager = Arc::new(SessionManager::new(
            dir.path().join("state.json"),
            dir.path().join("session_map.json"),
            "ccbot".to_string(),
        ));
        let fake = Arc::new(FakeWindowControl::with_windows(windows));
        let (tx, rx) = mpsc::unbounded_channel();
        let activity = ActivityTracker::default();
        let monitor = SessionMonitor {
            poll_interval: Duration::from_secs(2),
            events_file: dir.path().join("events.jsonl"),
            projects_path: dir.path().join("projects"),
            default_provider: "claude".to_string(),
            session_manager,
            tmux: fake.clone(),
            tx,
            state: MonitorState::load(dir.path().join("monitor_state.json")),
            pending_tools: HashMap::new(),
            last_session_map: HashMap::new(),
            file_meta: HashMap::new(),
            announced_windows: HashSet::new(),
            activity: activity.clone(),
        };
        Fixture {
            dir,
            monitor,
            rx,
            fake,
        }
    }

    fn window(id: &str, name: &str, cwd: &str) -> TmuxWindow {
        TmuxWindow {
            window_id: id.to_string(),
            window_name: name.to_string(),
            cwd: cwd.to_string(),
            pane_current_command: "claude".to_string(),
        }
    }

    fn write_session_map(dir: &Path, entries: &[(&str, &str, &str)]) {
        let mut map = serde_json::Map::new();
        for (wid, sid, transcript) in entries {
            map.insert(
                format!("ccbot:{wid}"),
                serde_json::json!({
                    "session_id": sid,
                    "cwd": "/tmp/proj",
                    "window_name": "proj",
                    "transcript_path": transcript,
                    "provider_name": "claude",
                }),
            );
        }
        std::fs::write(
            dir.join("session_map.json"),
            serde_json::to_string(&map).unwrap(),
        )
        .unwrap();
    }

    fn append_event_line(dir: &Path, event: &str, window_key: &str) {
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("events.jsonl"))
            .unwrap();
        writeln!(
            f,
            r#"{{"ts":1.0,"event":"{event}","window_key":"{window_key}","session_id":"{SID}","data":{{}}}}"#
        )
        .unwrap();
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<MonitorEvent>) -> Vec<MonitorEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn assistant_line(text: &str) -> String {
        serde_json::to_string(&serde_json::json!({
            "type": "assistant",
            "message": {"content": [{"type": "text", "text": text}]},
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_hook_events_read_in_order_once() {
        let mut fx = fixture(vec![]);
        append_event_line(fx.dir.path(), "SubagentStart", "ccbot:@1");
        append_event_line(fx.dir.path(), "Stop", "ccbot:@1");

        fx.monitor.poll_cycle().await.unwrap();
        let events = drain(&mut fx.rx);
        let kinds: Vec<HookEventKind> = events
            .iter()
            .filter_map(|e| match e {
                MonitorEvent::Hook(h) => Some(h.kind),
                _ => None,
            })
            .collect();
        assert_eq!(
            kinds,
            [HookEventKind::SubagentStart, HookEventKind::Stop]
        );

        // Second cycle: nothing new, nothing re-emitted.
        fx.monitor.poll_cycle().await.unwrap();
        assert!(
            drain(&mut fx.rx)
                .iter()
                .all(|e| !matches!(e, MonitorEvent::Hook(_)))
        );

        // A later append is picked up from the saved offset.
        append_event_line(fx.dir.path(), "Notification", "ccbot:@1");
        fx.monitor.poll_cycle().await.unwrap();
        let events = drain(&mut fx.rx);
        assert!(events.iter().any(|e| matches!(
            e,
            MonitorEvent::Hook(h) if h.kind == HookEventKind::Notification
        )));
    }

    #[tokio::test]
    async fn test_hook_events_offset_survives_restart() {
        let mut fx = fixture(vec![]);
        append_event_line(fx.dir.path(), "Stop", "ccbot:@1");
        fx.monitor.poll_cycle().await.unwrap();
        drain(&mut fx.rx);
        fx.monitor.state.save();

        // New monitor over the same state dir: the event is not replayed.
        let dir = fx.dir;
        let session_manager = Arc::new(SessionManager::new(
            dir.path().join("state.json"),
            dir.path().join("session_map.json"),
            "ccbot".to_string(),
        ));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut monitor = SessionMonitor {
            poll_interval: Duration::from_secs(2),
            events_file: dir.path().join("events.jsonl"),
            projects_path: dir.path().join("projects"),
            default_provider: "claude".to_string(),
            session_manager,
            tmux: Arc::new(FakeWindowControl::default()),
            tx,
            state: MonitorState::load(dir.path().join("monitor_state.json")),
            pending_tools: HashMap::new(),
            last_session_map: HashMap::new(),
            file_meta: HashMap::new(),
            announced_windows: HashSet::new(),
            activity: ActivityTracker::default(),
        };
        monitor.poll_cycle().await.unwrap();
        assert!(
            drain(&mut rx)
                .iter()
                .all(|e| !matches!(e, MonitorEvent::Hook(_)))
        );
    }

    #[tokio::test]
    async fn test_hook_events_partial_line_retried() {
        use std::io::Write;
        let mut fx = fixture(vec![]);
        let events_path = fx.dir.path().join("events.jsonl");
        // One complete line plus a partial tail without newline.
        let mut f = std::fs::File::create(&events_path).unwrap();
        writeln!(
            f,
            r#"{{"ts":1.0,"event":"Stop","window_key":"ccbot:@1","session_id":"{SID}","data":{{}}}}"#
        )
        .unwrap();
        write!(f, r#"{{"ts":2.0,"event":"Notif"#).unwrap();
        drop(f);

        fx.monitor.poll_cycle().await.unwrap();
        let first: Vec<_> = drain(&mut fx.rx);
        assert_eq!(
            first
                .iter()
                .filter(|e| matches!(e, MonitorEvent::Hook(_)))
                .count(),
            1
        );

        // Complete the tail; only the finished line is emitted.
        let mut f = std::fs::OpenOptions::new()
            .append(true)
            .open(&events_path)
            .unwrap();
        writeln!(
            f,
            r#"ication","window_key":"ccbot:@1","session_id":"{SID}","data":{{}}}}"#
        )
        .unwrap();
        drop(f);

        fx.monitor.poll_cycle().await.unwrap();
        let second = drain(&mut fx.rx);
        let kinds: Vec<HookEventKind> = second
            .iter()
            .filter_map(|e| match e {
                MonitorEvent::Hook(h) => Some(h.kind),
                _ => None,
            })
            .collect();
        assert_eq!(kinds, [HookEventKind::Notification]);
    }

    #[tokio::test]
    async fn test_new_transcript_initializes_without_replay() {
        let mut fx = fixture(vec![window("@1", "proj", "/tmp/proj")]);
        let transcript = fx.dir.path().join("t.jsonl");
        std::fs::write(&transcript, format!("{}\n", assistant_line("old message"))).unwrap();
        write_session_map(fx.dir.path(), &[("@1", SID, transcript.to_str().unwrap())]);

        fx.monitor.poll_cycle().await.unwrap();
        let events = drain(&mut fx.rx);
        // The pre-existing content is not replayed as messages.
        assert!(
            events
                .iter()
                .all(|e| !matches!(e, MonitorEvent::Message(_)))
        );
    }

    #[tokio::test]
    async fn test_transcript_delta_emitted_in_order() {
        let mut fx = fixture(vec![window("@1", "proj", "/tmp/proj")]);
        let transcript = fx.dir.path().join("t.jsonl");
        std::fs::write(&transcript, "").unwrap();
        write_session_map(fx.dir.path(), &[("@1", SID, transcript.to_str().unwrap())]);

        fx.monitor.poll_cycle().await.unwrap();
        drain(&mut fx.rx);

        let mut content = String::new();
        content.push_str(&assistant_line("first"));
        content.push('\n');
        content.push_str(&assistant_line("second"));
        content.push('\n');
        std::fs::write(&transcript, &content).unwrap();

        fx.monitor.poll_cycle().await.unwrap();
        let texts: Vec<String> = drain(&mut fx.rx)
            .into_iter()
            .filter_map(|e| match e {
                MonitorEvent::Message(m) => Some(m.text),
                _ => None,
            })
            .collect();
        assert_eq!(texts, ["first", "second"]);
    }

    #[tokio::test]
    async fn test_truncation_resets_offset() {
        let mut fx = fixture(vec![window("@1", "proj", "/tmp/proj")]);
        let transcript = fx.dir.path().join("t.jsonl");
        let old_content = format!("{}\n", assistant_line("a long old message body"));
        std::fs::write(&transcript, &old_content).unwrap();
        write_session_map(fx.dir.path(), &[("@1", SID, transcript.to_str().unwrap())]);

        fx.monitor.poll_cycle().await.unwrap();
        drain(&mut fx.rx);
        let tracked = fx.monitor.state.get_session(SID).unwrap();
        assert_eq!(tracked.last_byte_offset, old_content.len() as u64);

        // /clear truncates the file; a short new message follows.
        std::fs::write(&transcript, format!("{}\n", assistant_line("new"))).unwrap();
        fx.monitor.poll_cycle().await.unwrap();
        let texts: Vec<String> = drain(&mut fx.rx)
            .into_iter()
            .filter_map(|e| match e {
                MonitorEvent::Message(m) => Some(m.text),
                _ => None,
            })
            .collect();
        assert_eq!(texts, ["new"]);
    }

    #[tokio::test]
    async fn test_partial_transcript_line_not_consumed() {
        use std::io::Write;
        let mut fx = fixture(vec![window("@1", "proj", "/tmp/proj")]);
        let transcript = fx.dir.path().join("t.jsonl");
        std::fs::write(&transcript, "").unwrap();
        write_session_map(fx.dir.path(), &[("@1", SID, transcript.to_str().unwrap())]);
        fx.monitor.poll_cycle().await.unwrap();
        drain(&mut fx.rx);

        // A half-written line (with trailing newline but broken JSON).
        let mut f = std::fs::OpenOptions::new()
            .append(true)
            .open(&transcript)
            .unwrap();
        writeln!(f, r#"{{"type":"assistant","message":"#).unwrap();
        drop(f);

        fx.monitor.poll_cycle().await.unwrap();
        drain(&mut fx.rx);
        // Offset did not move past the unparseable line.
        assert_eq!(fx.monitor.state.get_session(SID).unwrap().last_byte_offset, 0);
    }

    #[tokio::test]
    async fn test_session_replacement_untracks_old() {
        let mut fx = fixture(vec![window("@1", "proj", "/tmp/proj")]);
        let transcript = fx.dir.path().join("t.jsonl");
        std::fs::write(&transcript, "").unwrap();
        write_session_map(fx.dir.path(), &[("@1", SID, transcript.to_str().unwrap())]);
        fx.monitor.poll_cycle().await.unwrap();
        assert!(fx.monitor.state.get_session(SID).is_some());

        // Same window, new session id (e.g. /clear + restart).
        let transcript2 = fx.dir.path().join("t2.jsonl");
        std::fs::write(&transcript2, "").unwrap();
        write_session_map(fx.dir.path(), &[("@1", SID2, transcript2.to_str().unwrap())]);
        fx.monitor.poll_cycle().await.unwrap();

        assert!(fx.monitor.state.get_session(SID).is_none());
        assert!(fx.monitor.state.get_session(SID2).is_some());
    }

    #[tokio::test]
    async fn test_new_window_events() {
        let mut fx = fixture(vec![window("@9", "fresh", "/tmp/new")]);

        fx.monitor.poll_cycle().await.unwrap();
        let events = drain(&mut fx.rx);
        let new_windows: Vec<&NewWindowEvent> = events
            .iter()
            .filter_map(|e| match e {
                MonitorEvent::Window(w) => Some(w),
                _ => None,
            })
            .collect();
        assert_eq!(new_windows.len(), 1);
        assert_eq!(new_windows[0].window_id, "@9");
        assert_eq!(new_windows[0].session_id, "");

        // Announced once, not repeated.
        fx.monitor.poll_cycle().await.unwrap();
        assert!(
            drain(&mut fx.rx)
                .iter()
                .all(|e| !matches!(e, MonitorEvent::Window(_)))
        );
        let _ = &fx.fake;
    }

    #[tokio::test]
    async fn test_mapped_window_sets_provider() {
        let mut fx = fixture(vec![window("@1", "proj", "/tmp/proj")]);
        let transcript = fx.dir.path().join("t.jsonl");
        std::fs::write(&transcript, "").unwrap();
        write_session_map(fx.dir.path(), &[("@1", SID, transcript.to_str().unwrap())]);

        fx.monitor.poll_cycle().await.unwrap();
        assert_eq!(fx.monitor.session_manager.get_window_provider("@1"), "claude");
        let events = drain(&mut fx.rx);
        assert!(events.iter().any(|e| matches!(
            e,
            MonitorEvent::Window(w) if w.window_id == "@1" && w.session_id == SID
        )));
    }

    #[test]
    fn test_backoff_delay_bounds() {
        assert_eq!(backoff_delay(0), Duration::from_secs(2));
        assert_eq!(backoff_delay(1), Duration::from_secs(4));
        assert_eq!(backoff_delay(3), Duration::from_secs(16));
        assert_eq!(backoff_delay(4), Duration::from_secs(30));
        assert_eq!(backoff_delay(20), Duration::from_secs(30));
    }

    #[test]
    fn test_scan_projects_indexed_and_bare() {
        let dir = tempfile::tempdir().unwrap();
        let proj_dir = dir.path().join("projects").join("-tmp-proj");
        std::fs::create_dir_all(&proj_dir).unwrap();

        let cwd = dir.path().join("cwd");
        std::fs::create_dir_all(&cwd).unwrap();
        let cwd_str = normalize_path(cwd.to_str().unwrap());

        let indexed = proj_dir.join("indexed.jsonl");
        std::fs::write(&indexed, "").unwrap();
        std::fs::write(
            proj_dir.join("sessions-index.json"),
            serde_json::to_string(&serde_json::json!({
                "originalPath": cwd_str,
                "entries": [
                    {"sessionId": "indexed", "fullPath": indexed.to_str().unwrap(),
                     "projectPath": cwd_str},
                ],
            }))
            .unwrap(),
        )
        .unwrap();
        std::fs::write(
            proj_dir.join("bare.jsonl"),
            format!(r#"{{"type":"user","cwd":"{cwd_str}"}}"#),
        )
        .unwrap();

        let active: HashSet<String> = [cwd_str].into();
        let mut found = scan_projects_sync(&dir.path().join("projects"), &active);
        found.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        let ids: Vec<&str> = found.iter().map(|s| s.session_id.as_str()).collect();
        assert_eq!(ids, ["bare", "indexed"]);
    }

    #[test]
    fn test_scan_projects_skips_inactive_cwds() {
        let dir = tempfile::tempdir().unwrap();
        let proj_dir = dir.path().join("projects").join("-other");
        std::fs::create_dir_all(&proj_dir).unwrap();
        std::fs::write(
            proj_dir.join("s.jsonl"),
            r#"{"type":"user","cwd":"/somewhere/else"}"#,
        )
        .unwrap();

        let active: HashSet<String> = ["/tmp/active".to_string()].into();
        assert!(scan_projects_sync(&dir.path().join("projects"), &active).is_empty());
    }
}
