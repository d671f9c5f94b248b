//! Window ID resolution and startup migration.
//!
//! tmux window IDs (`@12`) are stable while the server lives but change
//! across server restarts. On startup every persisted window ID is checked
//! against the live window list: dead IDs are re-resolved by display name
//! to a live window, old-format entries (display names used as keys) are
//! migrated to IDs, and unresolvable entries are dropped.

use std::collections::{HashMap, HashSet};

use crate::session::State;
use crate::tmux::TmuxWindow;

/// Minimal view of a live tmux window used for resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveWindow {
    pub window_id: String,
    pub window_name: String,
}

impl From<&TmuxWindow> for LiveWindow {
    fn from(w: &TmuxWindow) -> Self {
        Self {
            window_id: w.window_id.clone(),
            window_name: w.window_name.clone(),
        }
    }
}

/// Check if a key looks like a tmux window ID (`@0`, `@12`).
pub fn is_window_id(key: &str) -> bool {
    key.len() > 1 && key.starts_with('@') && key[1..].chars().all(|c| c.is_ascii_digit())
}

/// Map a persisted key to a live window ID, or `None` to drop it.
///
/// A live ID passes through; a dead ID re-resolves through its display
/// name; an old-format name key resolves directly by name.
fn resolve_key(
    key: &str,
    display_names: &HashMap<String, String>,
    live_by_name: &HashMap<String, String>,
    live_ids: &HashSet<String>,
) -> Option<String> {
    if is_window_id(key) {
        if live_ids.contains(key) {
            return Some(key.to_string());
        }
        let display = display_names.get(key).map(String::as_str).unwrap_or(key);
        return live_by_name.get(display).cloned();
    }
    live_by_name.get(key).cloned()
}

/// Re-resolve all persisted window IDs against live tmux windows.
///
/// Mutates the state in place; returns true when anything changed (so the
/// caller can schedule a save).
pub(crate) fn resolve_stale_ids(live_windows: &[LiveWindow], state: &mut State) -> bool {
    let live_by_name: HashMap<String, String> = live_windows
        .iter()
        .map(|w| (w.window_name.clone(), w.window_id.clone()))
        .collect();
    let live_ids: HashSet<String> = live_windows.iter().map(|w| w.window_id.clone()).collect();

    let display_names = state.window_display_names.clone();
    let mut changed = false;

    // Window states: re-key, carrying display names along.
    let old_states = std::mem::take(&mut state.window_states);
    for (key, mut ws) in old_states {
        match resolve_key(&key, &display_names, &live_by_name, &live_ids) {
            Some(new_key) => {
                if new_key != key {
                    tracing::debug!("Re-resolved window state {key} -> {new_key}");
                    let display = if is_window_id(&key) {
                        display_names.get(&key).cloned().unwrap_or_else(|| key.clone())
                    } else {
                        key.clone()
                    };
                    ws.window_name = display.clone();
                    state.window_display_names.insert(new_key.clone(), display);
                    state.window_display_names.remove(&key);
                    changed = true;
                }
                state.window_states.insert(new_key, ws);
            }
            None => {
                tracing::debug!("Dropping stale window state: {key}");
                state.window_display_names.remove(&key);
                changed = true;
            }
        }
    }

    // Thread bindings.
    for bindings in state.thread_bindings.values_mut() {
        let old = std::mem::take(bindings);
        for (thread_id, key) in old {
            match resolve_key(&key, &display_names, &live_by_name, &live_ids) {
                Some(new_key) => {
                    if new_key != key {
                        tracing::debug!("Re-resolved thread binding {key} -> {new_key}");
                        let display = display_names.get(&key).cloned().unwrap_or(key);
                        state.window_display_names.insert(new_key.clone(), display);
                        changed = true;
                    }
                    bindings.insert(thread_id, new_key);
                }
                None => {
                    tracing::debug!("Dropping stale thread binding: thread={thread_id}");
                    changed = true;
                }
            }
        }
    }
    state.thread_bindings.retain(|_, bindings| !bindings.is_empty());

    // /history offsets.
    for offsets in state.user_window_offsets.values_mut() {
        let old = std::mem::take(offsets);
        for (key, offset) in old {
            match resolve_key(&key, &display_names, &live_by_name, &live_ids) {
                Some(new_key) => {
                    if new_key != key {
                        changed = true;
                    }
                    offsets.insert(new_key, offset);
                }
                None => changed = true,
            }
        }
    }

    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::WindowState;

    fn live(entries: &[(&str, &str)]) -> Vec<LiveWindow> {
        entries
            .iter()
            .map(|(id, name)| LiveWindow {
                window_id: (*id).to_string(),
                window_name: (*name).to_string(),
            })
            .collect()
    }

    fn state_with_binding(window_id: &str, display: &str) -> State {
        let mut state = State::default();
        state
            .thread_bindings
            .entry(1)
            .or_default()
            .insert(42, window_id.to_string());
        state
            .window_display_names
            .insert(window_id.to_string(), display.to_string());
        state.window_states.insert(
            window_id.to_string(),
            WindowState {
                window_name: display.to_string(),
                cwd: "/proj".to_string(),
                ..WindowState::default()
            },
        );
        state
    }

    #[test]
    fn test_is_window_id() {
        assert!(is_window_id("@0"));
        assert!(is_window_id("@12"));
        assert!(!is_window_id("@"));
        assert!(!is_window_id("@1a"));
        assert!(!is_window_id("myproject"));
    }

    #[test]
    fn test_live_id_untouched() {
        let mut state = state_with_binding("@5", "proj");
        let changed = resolve_stale_ids(&live(&[("@5", "proj")]), &mut state);
        assert!(!changed);
        assert_eq!(state.thread_bindings[&1][&42], "@5");
    }

    #[test]
    fn test_stale_id_reresolved_by_name() {
        let mut state = state_with_binding("@5", "proj");
        // Server restarted: same window name, new id.
        let changed = resolve_stale_ids(&live(&[("@2", "proj")]), &mut state);
        assert!(changed);
        assert_eq!(state.thread_bindings[&1][&42], "@2");
        assert!(state.window_states.contains_key("@2"));
        assert!(!state.window_states.contains_key("@5"));
        assert_eq!(state.window_display_names["@2"], "proj");
    }

    #[test]
    fn test_unresolvable_binding_dropped() {
        let mut state = state_with_binding("@5", "gone");
        let changed = resolve_stale_ids(&live(&[("@2", "unrelated")]), &mut state);
        assert!(changed);
        assert!(state.thread_bindings.is_empty());
        assert!(state.window_states.is_empty());
    }

    #[test]
    fn test_old_format_name_key_migrated() {
        let mut state = State::default();
        state
            .thread_bindings
            .entry(1)
            .or_default()
            .insert(7, "myproj".to_string());

        let changed = resolve_stale_ids(&live(&[("@3", "myproj")]), &mut state);
        assert!(changed);
        assert_eq!(state.thread_bindings[&1][&7], "@3");
    }

    #[test]
    fn test_offsets_follow_window() {
        let mut state = state_with_binding("@5", "proj");
        state
            .user_window_offsets
            .entry(1)
            .or_default()
            .insert("@5".to_string(), 1024);

        resolve_stale_ids(&live(&[("@2", "proj")]), &mut state);
        assert_eq!(state.user_window_offsets[&1]["@2"], 1024);
    }
}
