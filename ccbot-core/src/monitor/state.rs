//! Monitor bookkeeping persisted across restarts.
//!
//! Tracks one entry per transcript file (byte offset for JSONL providers,
//! message count for whole-file providers) plus the reader offset into
//! `events.jsonl`, so a restart resumes where the last run stopped instead
//! of replaying history.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::util::atomic_write_json;

/// Tracking for one transcript file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedSession {
    pub file_path: String,
    /// Byte offset for incremental-read providers; message count for
    /// whole-file providers. Never retreats except on detected truncation
    /// or session replacement.
    pub last_byte_offset: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PersistedState {
    #[serde(default)]
    sessions: HashMap<String, TrackedSession>,
    #[serde(default)]
    events_offset: u64,
}

/// Monitor state with lazy dirty-flag saving.
pub struct MonitorState {
    state_file: PathBuf,
    sessions: HashMap<String, TrackedSession>,
    events_offset: u64,
    dirty: bool,
}

impl MonitorState {
    /// Load from `state_file`; missing or corrupt files start empty.
    ///
    /// Accepts both the current format (`{sessions, events_offset}`) and
    /// the legacy flat map of session entries.
    pub fn load(state_file: PathBuf) -> Self {
        let raw = std::fs::read_to_string(&state_file).unwrap_or_default();
        let persisted = parse_state(&raw);
        Self {
            state_file,
            sessions: persisted.sessions,
            events_offset: persisted.events_offset,
            dirty: false,
        }
    }

    pub fn get_session(&self, session_id: &str) -> Option<&TrackedSession> {
        self.sessions.get(session_id)
    }

    pub fn update_session(&mut self, session_id: &str, tracked: TrackedSession) {
        self.sessions.insert(session_id.to_string(), tracked);
        self.dirty = true;
    }

    pub fn remove_session(&mut self, session_id: &str) {
        if self.sessions.remove(session_id).is_some() {
            self.dirty = true;
        }
    }

    pub fn tracked_session_ids(&self) -> Vec<String> {
        self.sessions.keys().cloned().collect()
    }

    pub fn events_offset(&self) -> u64 {
        self.events_offset
    }

    pub fn set_events_offset(&mut self, offset: u64) {
        if self.events_offset != offset {
            self.events_offset = offset;
            self.dirty = true;
        }
    }

    /// Write to disk when anything changed since the last save.
    pub fn save_if_dirty(&mut self) {
        if !self.dirty {
            return;
        }
        self.save();
    }

    /// Unconditional write (shutdown path).
    pub fn save(&mut self) {
        let persisted = PersistedState {
            sessions: self.sessions.clone(),
            events_offset: self.events_offset,
        };
        match atomic_write_json(&self.state_file, &persisted) {
            Ok(()) => self.dirty = false,
            Err(e) => tracing::error!(
                "Failed to save monitor state to {}: {e}",
                self.state_file.display()
            ),
        }
    }

}

fn parse_state(raw: &str) -> PersistedState {
    if raw.trim().is_empty() {
        return PersistedState::default();
    }
    if let Ok(state) = serde_json::from_str::<PersistedState>(raw)
        && (!state.sessions.is_empty() || state.events_offset > 0 || raw.contains("\"sessions\""))
    {
        return state;
    }
    // Legacy flat format: {session_id: {file_path, last_byte_offset}}.
    match serde_json::from_str::<HashMap<String, TrackedSession>>(raw) {
        Ok(sessions) => PersistedState {
            sessions,
            events_offset: 0,
        },
        Err(e) => {
            tracing::warn!("Malformed monitor state, starting fresh: {e}");
            PersistedState::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor_state.json");

        let mut state = MonitorState::load(path.clone());
        state.update_session(
            "s1",
            TrackedSession {
                file_path: "/tmp/s1.jsonl".to_string(),
                last_byte_offset: 1024,
            },
        );
        state.set_events_offset(77);
        state.save_if_dirty();

        let reloaded = MonitorState::load(path);
        assert_eq!(
            reloaded.get_session("s1").unwrap().last_byte_offset,
            1024
        );
        assert_eq!(reloaded.events_offset(), 77);
    }

    #[test]
    fn test_legacy_flat_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor_state.json");
        std::fs::write(
            &path,
            r#"{"s1": {"file_path": "/tmp/a.jsonl", "last_byte_offset": 10}}"#,
        )
        .unwrap();

        let state = MonitorState::load(path);
        assert_eq!(state.get_session("s1").unwrap().last_byte_offset, 10);
        assert_eq!(state.events_offset(), 0);
    }

    #[test]
    fn test_corrupt_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor_state.json");
        std::fs::write(&path, "{ nope").unwrap();

        let state = MonitorState::load(path);
        assert!(state.tracked_session_ids().is_empty());
    }

    #[test]
    fn test_save_if_dirty_skips_clean() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor_state.json");
        let mut state = MonitorState::load(path);
        state.save_if_dirty();
        assert!(!state.state_file.exists());
    }
}
