//! Session manager — topic↔window bindings, window metadata, user prefs.
//!
//! The single owner of bot-side state: thread bindings, window states,
//! display names, group chat overrides, `/history` cursors, and directory
//! favorites. Everything is held in memory and persisted lazily to
//! `state.json` through [`StatePersistence`]; the hook↔monitor contract
//! file `session_map.json` is read (and pruned) here as well.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::persistence::StatePersistence;
use crate::util::atomic_write_json;

/// Maximum entries kept in a user's recently-used directory list.
pub const MRU_DIR_LIMIT: usize = 10;

/// Per-window notification verbosity, cycled from the status keyboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationMode {
    #[default]
    All,
    ErrorsOnly,
    Muted,
}

impl NotificationMode {
    /// Next mode in the cycle: all → errors_only → muted → all.
    pub fn next(self) -> Self {
        match self {
            NotificationMode::All => NotificationMode::ErrorsOnly,
            NotificationMode::ErrorsOnly => NotificationMode::Muted,
            NotificationMode::Muted => NotificationMode::All,
        }
    }

    /// Whether routine status messages should be suppressed.
    pub fn suppresses_status(self) -> bool {
        !matches!(self, NotificationMode::All)
    }

    /// Label shown on the notify button.
    pub fn label(self) -> &'static str {
        match self {
            NotificationMode::All => "🔔 All",
            NotificationMode::ErrorsOnly => "⚠ Errors",
            NotificationMode::Muted => "🔕 Muted",
        }
    }
}

/// Persisted metadata for one tmux window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowState {
    #[serde(default)]
    pub window_name: String,
    #[serde(default)]
    pub cwd: String,
    /// Provider running in this window; empty falls back to the default.
    #[serde(default)]
    pub provider_name: String,
    #[serde(default)]
    pub notification_mode: NotificationMode,
}

/// One entry of `session_map.json`, keyed by `"<tmux_session>:<window_id>"`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMapEntry {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub window_name: String,
    #[serde(default)]
    pub transcript_path: String,
    #[serde(default)]
    pub provider_name: String,
}

/// Per-user starred and recently-used directories.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirFavorites {
    #[serde(default)]
    pub starred: Vec<String>,
    #[serde(default)]
    pub mru: Vec<String>,
}

/// All persisted bot state (`state.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct State {
    #[serde(default)]
    pub(crate) window_states: HashMap<String, WindowState>,
    /// user_id → thread_id → window_id. One binding per topic per user.
    #[serde(default)]
    pub(crate) thread_bindings: HashMap<u64, HashMap<i32, String>>,
    /// user_id → thread_id → chat_id, for topics in shared groups.
    #[serde(default)]
    pub(crate) group_chat_ids: HashMap<u64, HashMap<i32, i64>>,
    #[serde(default)]
    pub(crate) window_display_names: HashMap<String, String>,
    /// user_id → window_id → transcript byte offset for `/history`.
    #[serde(default)]
    pub(crate) user_window_offsets: HashMap<u64, HashMap<String, u64>>,
    #[serde(default)]
    pub(crate) user_dir_favorites: HashMap<u64, DirFavorites>,
}

/// Parse the raw session map, keeping entries under `prefix` and re-keying
/// them by window id (`"ccbot:@5"` → `"@5"`).
pub fn parse_session_map(
    raw: &serde_json::Value,
    prefix: &str,
) -> HashMap<String, SessionMapEntry> {
    let mut map = HashMap::new();
    let Some(object) = raw.as_object() else {
        return map;
    };
    for (key, value) in object {
        let Some(window_id) = key.strip_prefix(prefix) else {
            continue;
        };
        if let Ok(entry) = serde_json::from_value::<SessionMapEntry>(value.clone()) {
            map.insert(window_id.to_string(), entry);
        }
    }
    map
}

/// Owner of all binding and preference state.
pub struct SessionManager {
    state: Arc<RwLock<State>>,
    persistence: StatePersistence,
    session_map: RwLock<HashMap<String, SessionMapEntry>>,
    session_map_file: PathBuf,
    tmux_session_name: String,
}

impl SessionManager {
    /// Load state from `state_file` (empty on first run) and set up lazy
    /// persistence.
    pub fn new(state_file: PathBuf, session_map_file: PathBuf, tmux_session_name: String) -> Self {
        let state: State = {
            let loader = StatePersistence::new(state_file.clone(), || serde_json::Value::Null);
            let raw = loader.load();
            if raw.is_null() {
                State::default()
            } else {
                match serde_json::from_value(raw) {
                    Ok(state) => state,
                    Err(e) => {
                        tracing::warn!("Failed to deserialize state, starting fresh: {e}");
                        State::default()
                    }
                }
            }
        };
        let state = Arc::new(RwLock::new(state));
        let persistence = {
            let state = Arc::clone(&state);
            StatePersistence::new(state_file, move || {
                let snapshot = state.read().expect("state lock poisoned").clone();
                serde_json::to_value(snapshot).unwrap_or(serde_json::Value::Null)
            })
        };
        Self {
            state,
            persistence,
            session_map: RwLock::new(HashMap::new()),
            session_map_file,
            tmux_session_name,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, State> {
        self.state.read().expect("state lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, State> {
        self.state.write().expect("state lock poisoned")
    }

    /// Flush pending writes. Call on shutdown.
    pub fn flush(&self) {
        self.persistence.flush();
    }

    /// Re-resolve persisted window IDs against the live tmux window list.
    /// Call once on startup, before any polling begins.
    pub fn migrate_windows(&self, live_windows: &[crate::window_resolver::LiveWindow]) {
        let changed = {
            let mut state = self.write();
            crate::window_resolver::resolve_stale_ids(live_windows, &mut state)
        };
        if changed {
            self.persistence.schedule_save();
        }
    }

    // ── Thread bindings ─────────────────────────────────────────────────

    /// Bind a topic to a window, replacing any existing binding for that
    /// topic. The previously bound window is left alive.
    pub fn bind_thread(
        &self,
        user_id: u64,
        thread_id: i32,
        window_id: &str,
        display_name: Option<&str>,
    ) {
        {
            let mut state = self.write();
            state
                .thread_bindings
                .entry(user_id)
                .or_default()
                .insert(thread_id, window_id.to_string());
            if let Some(name) = display_name {
                state
                    .window_display_names
                    .insert(window_id.to_string(), name.to_string());
            }
        }
        self.persistence.schedule_save();
    }

    /// Remove a topic's binding. Returns the window it pointed at.
    pub fn unbind_thread(&self, user_id: u64, thread_id: i32) -> Option<String> {
        let removed = {
            let mut state = self.write();
            let bindings = state.thread_bindings.get_mut(&user_id)?;
            let removed = bindings.remove(&thread_id);
            if bindings.is_empty() {
                state.thread_bindings.remove(&user_id);
            }
            removed
        };
        if removed.is_some() {
            self.persistence.schedule_save();
        }
        removed
    }

    /// The window bound to a topic, if any.
    pub fn get_thread_binding(&self, user_id: u64, thread_id: i32) -> Option<String> {
        self.read()
            .thread_bindings
            .get(&user_id)?
            .get(&thread_id)
            .cloned()
    }

    /// Snapshot of all bindings as (user_id, thread_id, window_id).
    pub fn iter_thread_bindings(&self) -> Vec<(u64, i32, String)> {
        self.read()
            .thread_bindings
            .iter()
            .flat_map(|(user, threads)| {
                threads
                    .iter()
                    .map(|(thread, wid)| (*user, *thread, wid.clone()))
            })
            .collect()
    }

    /// Window ids referenced by at least one binding.
    pub fn bound_window_ids(&self) -> HashSet<String> {
        self.read()
            .thread_bindings
            .values()
            .flat_map(|threads| threads.values().cloned())
            .collect()
    }

    // ── Chat resolution ─────────────────────────────────────────────────

    /// Remember which group chat a user's topic lives in.
    pub fn set_group_chat_id(&self, user_id: u64, thread_id: i32, chat_id: i64) {
        self.write()
            .group_chat_ids
            .entry(user_id)
            .or_default()
            .insert(thread_id, chat_id);
        self.persistence.schedule_save();
    }

    /// Chat to send to for a topic: the stored group chat, else the user's
    /// private chat (chat id == user id for private chats).
    pub fn resolve_chat_id(&self, user_id: u64, thread_id: i32) -> i64 {
        self.read()
            .group_chat_ids
            .get(&user_id)
            .and_then(|threads| threads.get(&thread_id))
            .copied()
            .unwrap_or(user_id as i64)
    }

    // ── Window metadata ─────────────────────────────────────────────────

    pub fn get_window_state(&self, window_id: &str) -> Option<WindowState> {
        self.read().window_states.get(window_id).cloned()
    }

    /// Create or update a window's metadata.
    pub fn upsert_window_state(&self, window_id: &str, window_name: &str, cwd: &str) {
        {
            let mut state = self.write();
            let ws = state.window_states.entry(window_id.to_string()).or_default();
            ws.window_name = window_name.to_string();
            if !cwd.is_empty() {
                ws.cwd = cwd.to_string();
            }
            state
                .window_display_names
                .insert(window_id.to_string(), window_name.to_string());
        }
        self.persistence.schedule_save();
    }

    pub fn set_window_provider(&self, window_id: &str, provider_name: &str) {
        {
            let mut state = self.write();
            state
                .window_states
                .entry(window_id.to_string())
                .or_default()
                .provider_name = provider_name.to_string();
        }
        self.persistence.schedule_save();
    }

    /// Provider name for a window; empty means "use the default".
    pub fn get_window_provider(&self, window_id: &str) -> String {
        self.read()
            .window_states
            .get(window_id)
            .map(|ws| ws.provider_name.clone())
            .unwrap_or_default()
    }

    pub fn get_notification_mode(&self, window_id: &str) -> NotificationMode {
        self.read()
            .window_states
            .get(window_id)
            .map(|ws| ws.notification_mode)
            .unwrap_or_default()
    }

    /// Advance the window's notification mode; returns the new mode.
    pub fn cycle_notification_mode(&self, window_id: &str) -> NotificationMode {
        let mode = {
            let mut state = self.write();
            let ws = state.window_states.entry(window_id.to_string()).or_default();
            ws.notification_mode = ws.notification_mode.next();
            ws.notification_mode
        };
        self.persistence.schedule_save();
        mode
    }

    /// Display name for a window, falling back to the id.
    pub fn get_display_name(&self, window_id: &str) -> String {
        self.read()
            .window_display_names
            .get(window_id)
            .cloned()
            .unwrap_or_else(|| window_id.to_string())
    }

    pub fn set_display_name(&self, window_id: &str, name: &str) {
        {
            let mut state = self.write();
            state
                .window_display_names
                .insert(window_id.to_string(), name.to_string());
            if let Some(ws) = state.window_states.get_mut(window_id) {
                ws.window_name = name.to_string();
            }
        }
        self.persistence.schedule_save();
    }

    /// Drop all state for a window (kill / topic deletion path).
    pub fn forget_window(&self, window_id: &str) {
        {
            let mut state = self.write();
            state.window_states.remove(window_id);
            state.window_display_names.remove(window_id);
            for offsets in state.user_window_offsets.values_mut() {
                offsets.remove(window_id);
            }
        }
        self.persistence.schedule_save();
    }

    // ── /history cursors ────────────────────────────────────────────────

    pub fn get_user_window_offset(&self, user_id: u64, window_id: &str) -> u64 {
        self.read()
            .user_window_offsets
            .get(&user_id)
            .and_then(|offsets| offsets.get(window_id))
            .copied()
            .unwrap_or(0)
    }

    pub fn set_user_window_offset(&self, user_id: u64, window_id: &str, offset: u64) {
        self.write()
            .user_window_offsets
            .entry(user_id)
            .or_default()
            .insert(window_id.to_string(), offset);
        self.persistence.schedule_save();
    }

    // ── Directory favorites ─────────────────────────────────────────────

    pub fn get_dir_favorites(&self, user_id: u64) -> DirFavorites {
        self.read()
            .user_dir_favorites
            .get(&user_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Toggle a starred directory; returns true when now starred.
    pub fn toggle_star_dir(&self, user_id: u64, path: &str) -> bool {
        let starred = {
            let mut state = self.write();
            let favorites = state.user_dir_favorites.entry(user_id).or_default();
            if let Some(pos) = favorites.starred.iter().position(|p| p == path) {
                favorites.starred.remove(pos);
                false
            } else {
                favorites.starred.push(path.to_string());
                true
            }
        };
        self.persistence.schedule_save();
        starred
    }

    /// Record a directory as recently used (front of a bounded FIFO).
    pub fn record_mru_dir(&self, user_id: u64, path: &str) {
        {
            let mut state = self.write();
            let favorites = state.user_dir_favorites.entry(user_id).or_default();
            favorites.mru.retain(|p| p != path);
            favorites.mru.insert(0, path.to_string());
            favorites.mru.truncate(MRU_DIR_LIMIT);
        }
        self.persistence.schedule_save();
    }

    // ── Session map (hook ↔ monitor contract) ───────────────────────────

    /// Reload `session_map.json`, keeping entries for our tmux session and
    /// re-keying by window id. Returns the parsed map.
    pub async fn load_session_map(&self) -> HashMap<String, SessionMapEntry> {
        let map = match tokio::fs::read_to_string(&self.session_map_file).await {
            Ok(content) => match serde_json::from_str::<serde_json::Value>(&content) {
                Ok(raw) => parse_session_map(&raw, &format!("{}:", self.tmux_session_name)),
                Err(e) => {
                    tracing::warn!("Malformed session_map.json, ignoring: {e}");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        *self.session_map.write().expect("session map lock poisoned") = map.clone();
        map
    }

    /// Session id for a window, from the last loaded session map.
    pub fn get_session_id_for_window(&self, window_id: &str) -> Option<String> {
        self.session_map
            .read()
            .expect("session map lock poisoned")
            .get(window_id)
            .map(|entry| entry.session_id.clone())
            .filter(|sid| !sid.is_empty())
    }

    /// Window id currently associated with a session id.
    pub fn get_window_for_session(&self, session_id: &str) -> Option<String> {
        self.session_map
            .read()
            .expect("session map lock poisoned")
            .iter()
            .find(|(_, entry)| entry.session_id == session_id)
            .map(|(wid, _)| wid.clone())
    }

    /// Remove session-map entries for windows that no longer exist; the
    /// shared file is rewritten under its lock when anything was pruned.
    pub async fn prune_session_map(&self, live_ids: &HashSet<String>) {
        let pruned: Vec<String> = {
            let mut map = self.session_map.write().expect("session map lock poisoned");
            let dead: Vec<String> = map
                .keys()
                .filter(|wid| !live_ids.contains(*wid))
                .cloned()
                .collect();
            for wid in &dead {
                map.remove(wid);
            }
            dead
        };
        if pruned.is_empty() {
            return;
        }
        tracing::debug!("Pruning {} dead session_map entries", pruned.len());

        let map_file = self.session_map_file.clone();
        let prefix = format!("{}:", self.tmux_session_name);
        let result = tokio::task::spawn_blocking(move || {
            prune_session_map_file(&map_file, &prefix, &pruned)
        })
        .await;
        match result {
            Ok(Err(e)) => tracing::warn!("Failed to prune session_map.json: {e}"),
            Err(e) => tracing::warn!("Session map prune task failed: {e}"),
            Ok(Ok(())) => {}
        }
    }
}

/// Remove the given window keys from `session_map.json` under the shared
/// advisory lock used by the hook writer.
fn prune_session_map_file(
    map_file: &std::path::Path,
    prefix: &str,
    dead_window_ids: &[String],
) -> std::io::Result<()> {
    if !map_file.exists() {
        return Ok(());
    }
    let lock_path = map_file.with_extension("lock");
    let lock_file = std::fs::File::create(&lock_path)?;
    FileExt::lock_exclusive(&lock_file)?;

    let result = (|| -> std::io::Result<()> {
        let content = std::fs::read_to_string(map_file)?;
        let Ok(mut raw) = serde_json::from_str::<serde_json::Value>(&content) else {
            return Ok(()); // Corrupt map is the hook writer's problem to rebuild.
        };
        let Some(object) = raw.as_object_mut() else {
            return Ok(());
        };
        let before = object.len();
        object.retain(|key, _| {
            match key.strip_prefix(prefix) {
                Some(wid) => !dead_window_ids.iter().any(|dead| dead == wid),
                None => true, // Entries of other tmux sessions are not ours.
            }
        });
        if object.len() != before {
            atomic_write_json(map_file, &raw)?;
        }
        Ok(())
    })();

    let _ = FileExt::unlock(&lock_file);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(dir: &std::path::Path) -> SessionManager {
        SessionManager::new(
            dir.join("state.json"),
            dir.join("session_map.json"),
            "ccbot".to_string(),
        )
    }

    #[test]
    fn test_bind_thread_replaces_existing() {
        let dir = tempfile::tempdir().unwrap();
        let sm = manager(dir.path());

        sm.bind_thread(1, 42, "@1", Some("proj"));
        sm.bind_thread(1, 42, "@2", Some("other"));

        assert_eq!(sm.get_thread_binding(1, 42).as_deref(), Some("@2"));
        assert_eq!(sm.iter_thread_bindings().len(), 1);
    }

    #[test]
    fn test_one_window_multiple_users() {
        let dir = tempfile::tempdir().unwrap();
        let sm = manager(dir.path());

        sm.bind_thread(1, 42, "@1", None);
        sm.bind_thread(2, 99, "@1", None);

        assert_eq!(sm.bound_window_ids().len(), 1);
        assert_eq!(sm.iter_thread_bindings().len(), 2);
    }

    #[test]
    fn test_unbind_thread() {
        let dir = tempfile::tempdir().unwrap();
        let sm = manager(dir.path());

        sm.bind_thread(1, 42, "@1", None);
        assert_eq!(sm.unbind_thread(1, 42).as_deref(), Some("@1"));
        assert_eq!(sm.get_thread_binding(1, 42), None);
        assert_eq!(sm.unbind_thread(1, 42), None);
    }

    #[test]
    fn test_resolve_chat_id_group_override() {
        let dir = tempfile::tempdir().unwrap();
        let sm = manager(dir.path());

        assert_eq!(sm.resolve_chat_id(12345, 42), 12345);
        sm.set_group_chat_id(12345, 42, -100999);
        assert_eq!(sm.resolve_chat_id(12345, 42), -100999);
        // Other threads still resolve to the private chat.
        assert_eq!(sm.resolve_chat_id(12345, 43), 12345);
    }

    #[test]
    fn test_notification_mode_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let sm = manager(dir.path());

        assert_eq!(sm.get_notification_mode("@1"), NotificationMode::All);
        assert_eq!(sm.cycle_notification_mode("@1"), NotificationMode::ErrorsOnly);
        assert_eq!(sm.cycle_notification_mode("@1"), NotificationMode::Muted);
        assert_eq!(sm.cycle_notification_mode("@1"), NotificationMode::All);
    }

    #[test]
    fn test_mru_bounded_and_deduped() {
        let dir = tempfile::tempdir().unwrap();
        let sm = manager(dir.path());

        for i in 0..15 {
            sm.record_mru_dir(1, &format!("/proj/{i}"));
        }
        sm.record_mru_dir(1, "/proj/3");

        let favorites = sm.get_dir_favorites(1);
        assert_eq!(favorites.mru.len(), MRU_DIR_LIMIT);
        assert_eq!(favorites.mru[0], "/proj/3");
        assert_eq!(favorites.mru.iter().filter(|p| *p == "/proj/3").count(), 1);
    }

    #[test]
    fn test_toggle_star() {
        let dir = tempfile::tempdir().unwrap();
        let sm = manager(dir.path());

        assert!(sm.toggle_star_dir(1, "/proj/a"));
        assert!(!sm.toggle_star_dir(1, "/proj/a"));
        assert!(sm.get_dir_favorites(1).starred.is_empty());
    }

    #[test]
    fn test_state_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        {
            let sm = manager(dir.path());
            sm.bind_thread(12345, 42, "@5", Some("myproj"));
            sm.set_group_chat_id(12345, 42, -100999);
            sm.set_window_provider("@5", "codex");
            sm.cycle_notification_mode("@5");
            sm.flush();
        }

        let sm = manager(dir.path());
        assert_eq!(sm.get_thread_binding(12345, 42).as_deref(), Some("@5"));
        assert_eq!(sm.resolve_chat_id(12345, 42), -100999);
        assert_eq!(sm.get_window_provider("@5"), "codex");
        assert_eq!(sm.get_notification_mode("@5"), NotificationMode::ErrorsOnly);
        assert_eq!(sm.get_display_name("@5"), "myproj");
    }

    #[test]
    fn test_parse_session_map_prefix_filter() {
        let raw = serde_json::json!({
            "ccbot:@1": {"session_id": "s1", "cwd": "/a"},
            "ccbot:@2": {"session_id": "s2", "cwd": "/b", "provider_name": "codex"},
            "other:@9": {"session_id": "s9", "cwd": "/c"},
        });
        let map = parse_session_map(&raw, "ccbot:");
        assert_eq!(map.len(), 2);
        assert_eq!(map["@1"].session_id, "s1");
        assert_eq!(map["@2"].provider_name, "codex");
        assert!(!map.contains_key("@9"));
    }

    #[tokio::test]
    async fn test_load_and_prune_session_map() {
        let dir = tempfile::tempdir().unwrap();
        let sm = manager(dir.path());
        std::fs::write(
            dir.path().join("session_map.json"),
            serde_json::to_string(&serde_json::json!({
                "ccbot:@1": {"session_id": "s1", "cwd": "/a"},
                "ccbot:@2": {"session_id": "s2", "cwd": "/b"},
                "other:@3": {"session_id": "s3", "cwd": "/c"},
            }))
            .unwrap(),
        )
        .unwrap();

        let map = sm.load_session_map().await;
        assert_eq!(map.len(), 2);
        assert_eq!(sm.get_session_id_for_window("@1").as_deref(), Some("s1"));

        let live: HashSet<String> = [String::from("@1")].into();
        sm.prune_session_map(&live).await;
        assert_eq!(sm.get_session_id_for_window("@2"), None);

        // The file keeps @1 and the foreign session's entry.
        let content = std::fs::read_to_string(dir.path().join("session_map.json")).unwrap();
        let raw: serde_json::Value = serde_json::from_str(&content).unwrap();
        let object = raw.as_object().unwrap();
        assert!(object.contains_key("ccbot:@1"));
        assert!(!object.contains_key("ccbot:@2"));
        assert!(object.contains_key("other:@3"));
    }
}
