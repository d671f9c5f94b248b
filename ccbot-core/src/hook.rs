//! Hook subcommand — agent lifecycle event capture.
//!
//! Invoked as `ccbot hook` by the agent each time a hook fires. Reads the
//! payload from stdin, resolves the tmux window from `TMUX_PANE`, and:
//!   - on `SessionStart`, upserts `session_map.json` under an exclusive
//!     file lock (plus appends a log event);
//!   - on every other handled event, appends one JSON line to
//!     `events.jsonl` under an exclusive lock.
//!
//! Invalid payloads are dropped silently and the process exits 0 — a hook
//! must never block the agent. This module must not require the bot's
//! config (no `TELEGRAM_BOT_TOKEN` inside tmux panes); it resolves paths
//! through [`crate::config::ccbot_dir`] only.
//!
//! Also owns hook installation into `~/.claude/settings.json`
//! (`--install` / `--uninstall` / `--status`).

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

use fs2::FileExt;
use serde_json::{Value, json};
use thiserror::Error;

use crate::config::ccbot_dir;
use crate::events::HookEventKind;
use crate::provider::is_valid_session_id;
use crate::util::atomic_write_json;

/// Substring marking our entries in the agent's hook config.
const HOOK_COMMAND_MARKER: &str = "ccbot hook";

/// The command installed for each hook event.
const HOOK_COMMAND: &str = "ccbot hook";

/// Hook subprocess timeout written into the agent settings.
const HOOK_TIMEOUT_SECS: u64 = 5;

/// Errors from hook install/uninstall (event processing never errors out).
#[derive(Debug, Error)]
pub enum HookError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Path of the agent settings file hooks are installed into.
pub fn claude_settings_file() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join(".claude")
        .join("settings.json")
}

// ── Event processing ────────────────────────────────────────────────────

/// Process one hook invocation: read the payload from `input`, validate,
/// and record it. Always returns cleanly; failures are logged and dropped.
pub fn process_hook_event(input: &mut dyn Read) {
    let mut raw = String::new();
    if input.read_to_string(&mut raw).is_err() {
        tracing::warn!("Failed to read hook payload from stdin");
        return;
    }
    let Ok(payload) = serde_json::from_str::<Value>(&raw) else {
        tracing::warn!("Hook payload is not valid JSON");
        return;
    };

    let pane_id = std::env::var("TMUX_PANE").unwrap_or_default();
    process_hook_payload(&payload, &pane_id, &ccbot_dir(), resolve_pane_via_tmux);
}

/// Resolved location of the pane a hook fired in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaneLocation {
    pub tmux_session: String,
    pub window_id: String,
    pub window_name: String,
}

impl PaneLocation {
    /// `"<tmux_session>:<window_id>"`.
    pub fn window_key(&self) -> String {
        format!("{}:{}", self.tmux_session, self.window_id)
    }
}

/// Ask tmux which window hosts the given pane.
fn resolve_pane_via_tmux(pane_id: &str) -> Option<PaneLocation> {
    let output = Command::new("tmux")
        .args([
            "display-message",
            "-t",
            pane_id,
            "-p",
            "#{session_name}\t#{window_id}\t#{window_name}",
        ])
        .output()
        .ok()?;
    if !output.status.success() {
        tracing::warn!("tmux display-message failed for pane {pane_id}");
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut parts = stdout.trim().splitn(3, '\t');
    Some(PaneLocation {
        tmux_session: parts.next()?.to_string(),
        window_id: parts.next()?.to_string(),
        window_name: parts.next()?.to_string(),
    })
}

/// Validated, pane-resolved hook handling. Separated from I/O for tests.
pub fn process_hook_payload(
    payload: &Value,
    pane_id: &str,
    state_dir: &Path,
    resolve_pane: impl Fn(&str) -> Option<PaneLocation>,
) {
    let session_id = payload
        .get("session_id")
        .and_then(|s| s.as_str())
        .unwrap_or("");
    let event_name = payload
        .get("hook_event_name")
        .and_then(|e| e.as_str())
        .unwrap_or("");
    if session_id.is_empty() || event_name.is_empty() {
        tracing::debug!("Empty session_id or event, ignoring");
        return;
    }
    let Some(kind) = HookEventKind::from_name(event_name) else {
        tracing::debug!("Ignoring unhandled hook event: {event_name}");
        return;
    };

    let cwd = payload.get("cwd").and_then(|c| c.as_str()).unwrap_or("");
    if !is_valid_session_id(session_id) {
        tracing::warn!("Invalid session_id format, dropping event");
        return;
    }
    if !cwd.is_empty() && !Path::new(cwd).is_absolute() {
        tracing::warn!("cwd is not absolute, dropping event");
        return;
    }

    if pane_id.is_empty() {
        tracing::warn!("TMUX_PANE not set, cannot determine window");
        return;
    }
    let Some(pane) = resolve_pane(pane_id) else {
        return;
    };
    let window_key = pane.window_key();

    if kind == HookEventKind::SessionStart {
        let transcript_path = payload
            .get("transcript_path")
            .and_then(|p| p.as_str())
            .unwrap_or("");
        if let Err(e) = update_session_map(
            state_dir,
            &pane,
            session_id,
            cwd,
            transcript_path,
            "claude",
        ) {
            tracing::error!("Failed to update session_map: {e}");
        }
        let data = json!({
            "cwd": cwd,
            "transcript_path": transcript_path,
            "window_name": pane.window_name,
        });
        if let Err(e) = append_event(state_dir, kind, session_id, &window_key, &data) {
            tracing::error!("Failed to append event: {e}");
        }
        return;
    }

    let data = extract_event_data(kind, payload);
    if let Err(e) = append_event(state_dir, kind, session_id, &window_key, &data) {
        tracing::error!("Failed to append event: {e}");
    }
}

/// Event-type-specific `data` payload for the log line.
fn extract_event_data(kind: HookEventKind, payload: &Value) -> Value {
    let field = |name: &str| payload.get(name).cloned().unwrap_or(Value::String(String::new()));
    match kind {
        HookEventKind::Notification => json!({
            "tool_name": field("tool_name"),
            "message": field("message"),
        }),
        HookEventKind::Stop => json!({
            "stop_reason": field("stop_reason"),
            "num_turns": payload.get("num_turns").cloned().unwrap_or(json!(0)),
        }),
        HookEventKind::SubagentStart | HookEventKind::SubagentStop => json!({
            "subagent_id": field("subagent_id"),
            "name": field("name"),
            "description": field("description"),
        }),
        HookEventKind::TeammateIdle => json!({
            "name": field("name"),
        }),
        HookEventKind::TaskCompleted => json!({
            "description": field("description"),
        }),
        HookEventKind::SessionStart => json!({}),
    }
}

/// Append one compact JSON line to `events.jsonl` under an exclusive lock.
pub fn append_event(
    state_dir: &Path,
    kind: HookEventKind,
    session_id: &str,
    window_key: &str,
    data: &Value,
) -> std::io::Result<()> {
    std::fs::create_dir_all(state_dir)?;
    let events_file = state_dir.join("events.jsonl");

    let line = serde_json::to_string(&json!({
        "ts": unix_time(),
        "event": kind.as_str(),
        "window_key": window_key,
        "session_id": session_id,
        "data": data,
    }))?;

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&events_file)?;
    FileExt::lock_exclusive(&file)?;
    let result = writeln!(file, "{line}");
    let _ = FileExt::unlock(&file);
    result
}

fn unix_time() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Upsert the `session_map.json` entry for a window under the shared lock,
/// removing any stale entry keyed by the old `"<session>:<window_name>"`
/// format.
fn update_session_map(
    state_dir: &Path,
    pane: &PaneLocation,
    session_id: &str,
    cwd: &str,
    transcript_path: &str,
    provider_name: &str,
) -> std::io::Result<()> {
    std::fs::create_dir_all(state_dir)?;
    let map_file = state_dir.join("session_map.json");
    let lock_path = map_file.with_extension("lock");
    let lock_file = std::fs::File::create(&lock_path)?;
    FileExt::lock_exclusive(&lock_file)?;

    let result = (|| -> std::io::Result<()> {
        let mut map: serde_json::Map<String, Value> = match std::fs::read_to_string(&map_file) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|_| {
                tracing::warn!("Failed to read existing session_map, starting fresh");
                serde_json::Map::new()
            }),
            Err(_) => serde_json::Map::new(),
        };

        let window_key = pane.window_key();
        map.insert(
            window_key.clone(),
            json!({
                "session_id": session_id,
                "cwd": cwd,
                "window_name": pane.window_name,
                "transcript_path": transcript_path,
                "provider_name": provider_name,
            }),
        );

        let old_key = format!("{}:{}", pane.tmux_session, pane.window_name);
        if old_key != window_key && map.remove(&old_key).is_some() {
            tracing::info!("Removed old-format session_map key: {old_key}");
        }

        atomic_write_json(&map_file, &Value::Object(map))?;
        tracing::info!("Updated session_map: {window_key} -> session_id={session_id}");
        Ok(())
    })();

    let _ = FileExt::unlock(&lock_file);
    result
}

// ── Hook installation ───────────────────────────────────────────────────

fn has_ccbot_hook(settings: &Value, event_type: &str) -> bool {
    settings
        .get("hooks")
        .and_then(|h| h.get(event_type))
        .and_then(|e| e.as_array())
        .is_some_and(|entries| {
            entries.iter().any(|entry| {
                entry
                    .get("hooks")
                    .and_then(|h| h.as_array())
                    .is_some_and(|inner| {
                        inner.iter().any(|h| {
                            h.get("command")
                                .and_then(|c| c.as_str())
                                .is_some_and(|c| c.contains(HOOK_COMMAND_MARKER))
                        })
                    })
            })
        })
}

/// Per-event installation status.
pub fn installed_events(settings: &Value) -> Vec<(HookEventKind, bool)> {
    HookEventKind::ALL
        .into_iter()
        .map(|kind| (kind, has_ccbot_hook(settings, kind.as_str())))
        .collect()
}

fn load_settings(settings_file: &Path) -> Result<Value, HookError> {
    if !settings_file.exists() {
        return Ok(json!({}));
    }
    let content = std::fs::read_to_string(settings_file).map_err(|source| HookError::Read {
        path: settings_file.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| HookError::Parse {
        path: settings_file.to_path_buf(),
        source,
    })
}

fn save_settings(settings_file: &Path, settings: &Value) -> Result<(), HookError> {
    if let Some(parent) = settings_file.parent() {
        std::fs::create_dir_all(parent).map_err(|source| HookError::Write {
            path: settings_file.to_path_buf(),
            source,
        })?;
    }
    let content = format!(
        "{}\n",
        serde_json::to_string_pretty(settings).unwrap_or_else(|_| "{}".to_string())
    );
    std::fs::write(settings_file, content).map_err(|source| HookError::Write {
        path: settings_file.to_path_buf(),
        source,
    })
}

/// Install ccbot hooks for all handled event types. Idempotent.
///
/// Returns (newly installed, already present).
pub fn install_hooks(settings_file: &Path) -> Result<(usize, usize), HookError> {
    let mut settings = load_settings(settings_file)?;
    if !settings.is_object() {
        settings = json!({});
    }

    let mut installed = 0usize;
    let mut already = 0usize;

    for kind in HookEventKind::ALL {
        if has_ccbot_hook(&settings, kind.as_str()) {
            already += 1;
            continue;
        }

        let mut hook_config = json!({
            "type": "command",
            "command": HOOK_COMMAND,
            "timeout": HOOK_TIMEOUT_SECS,
        });
        if kind.is_async() {
            hook_config["async"] = json!(true);
        }

        let hooks = settings
            .as_object_mut()
            .expect("settings is an object")
            .entry("hooks")
            .or_insert_with(|| json!({}));
        let event_hooks = hooks
            .as_object_mut()
            .map(|h| h.entry(kind.as_str()).or_insert_with(|| json!([])));
        if let Some(Value::Array(entries)) = event_hooks {
            match entries.first_mut().and_then(|e| e.get_mut("hooks")) {
                Some(Value::Array(inner)) => inner.push(hook_config),
                _ => entries.push(json!({"hooks": [hook_config]})),
            }
            installed += 1;
        }
    }

    if installed > 0 {
        save_settings(settings_file, &settings)?;
    }
    Ok((installed, already))
}

/// Remove all ccbot hook entries. Idempotent.
///
/// Returns true when anything was removed.
pub fn uninstall_hooks(settings_file: &Path) -> Result<bool, HookError> {
    if !settings_file.exists() {
        return Ok(false);
    }
    let mut settings = load_settings(settings_file)?;
    let mut removed = false;

    if let Some(hooks) = settings.get_mut("hooks").and_then(|h| h.as_object_mut()) {
        for kind in HookEventKind::ALL {
            let Some(Value::Array(entries)) = hooks.get_mut(kind.as_str()) else {
                continue;
            };
            for entry in entries.iter_mut() {
                if let Some(Value::Array(inner)) = entry.get_mut("hooks") {
                    let before = inner.len();
                    inner.retain(|h| {
                        !h.get("command")
                            .and_then(|c| c.as_str())
                            .is_some_and(|c| c.contains(HOOK_COMMAND_MARKER))
                    });
                    removed |= inner.len() != before;
                }
            }
            entries.retain(|entry| {
                entry
                    .get("hooks")
                    .and_then(|h| h.as_array())
                    .is_none_or(|inner| !inner.is_empty())
            });
        }
    }

    if removed {
        save_settings(settings_file, &settings)?;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SID: &str = "0195c5bc-6a2c-4890-a1b2-c3d4e5f60718";

    fn fake_pane(_pane: &str) -> Option<PaneLocation> {
        Some(PaneLocation {
            tmux_session: "ccbot".to_string(),
            window_id: "@7".to_string(),
            window_name: "myproj".to_string(),
        })
    }

    fn payload(event: &str) -> Value {
        json!({
            "session_id": SID,
            "cwd": "/tmp/proj",
            "hook_event_name": event,
            "transcript_path": "/tmp/t.jsonl",
            "stop_reason": "end_turn",
            "num_turns": 3,
        })
    }

    fn read_events(dir: &Path) -> Vec<Value> {
        let content = std::fs::read_to_string(dir.join("events.jsonl")).unwrap_or_default();
        content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_session_start_updates_map_and_log() {
        let dir = tempfile::tempdir().unwrap();
        process_hook_payload(&payload("SessionStart"), "%1", dir.path(), fake_pane);

        let map: Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("session_map.json")).unwrap(),
        )
        .unwrap();
        let entry = &map["ccbot:@7"];
        assert_eq!(entry["session_id"], SID);
        assert_eq!(entry["cwd"], "/tmp/proj");
        assert_eq!(entry["provider_name"], "claude");

        let events = read_events(dir.path());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["event"], "SessionStart");
        assert_eq!(events[0]["window_key"], "ccbot:@7");
    }

    #[test]
    fn test_session_start_removes_old_format_key() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("session_map.json"),
            serde_json::to_string(&json!({
                "ccbot:myproj": {"session_id": "old", "cwd": "/x"},
            }))
            .unwrap(),
        )
        .unwrap();

        process_hook_payload(&payload("SessionStart"), "%1", dir.path(), fake_pane);

        let map: Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("session_map.json")).unwrap(),
        )
        .unwrap();
        assert!(map.get("ccbot:myproj").is_none());
        assert!(map.get("ccbot:@7").is_some());
    }

    #[test]
    fn test_stop_event_appends_data() {
        let dir = tempfile::tempdir().unwrap();
        process_hook_payload(&payload("Stop"), "%1", dir.path(), fake_pane);

        let events = read_events(dir.path());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["event"], "Stop");
        assert_eq!(events[0]["data"]["stop_reason"], "end_turn");
        assert_eq!(events[0]["data"]["num_turns"], 3);
        assert!(!dir.path().join("session_map.json").exists());
    }

    #[test]
    fn test_invalid_session_id_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = payload("Stop");
        p["session_id"] = json!("not-a-uuid");
        process_hook_payload(&p, "%1", dir.path(), fake_pane);
        assert!(read_events(dir.path()).is_empty());
    }

    #[test]
    fn test_relative_cwd_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = payload("SessionStart");
        p["cwd"] = json!("relative/dir");
        process_hook_payload(&p, "%1", dir.path(), fake_pane);
        assert!(read_events(dir.path()).is_empty());
    }

    #[test]
    fn test_unhandled_event_ignored() {
        let dir = tempfile::tempdir().unwrap();
        process_hook_payload(&payload("PreToolUse"), "%1", dir.path(), fake_pane);
        assert!(read_events(dir.path()).is_empty());
    }

    #[test]
    fn test_missing_pane_dropped() {
        let dir = tempfile::tempdir().unwrap();
        process_hook_payload(&payload("Stop"), "", dir.path(), fake_pane);
        assert!(read_events(dir.path()).is_empty());
    }

    #[test]
    fn test_events_preserve_order() {
        let dir = tempfile::tempdir().unwrap();
        for event in ["SubagentStart", "Notification", "SubagentStop", "Stop"] {
            process_hook_payload(&payload(event), "%1", dir.path(), fake_pane);
        }
        let events: Vec<String> = read_events(dir.path())
            .iter()
            .map(|e| e["event"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(events, ["SubagentStart", "Notification", "SubagentStop", "Stop"]);
    }

    #[test]
    fn test_install_hooks_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let settings = dir.path().join("settings.json");

        let (installed, already) = install_hooks(&settings).unwrap();
        assert_eq!(installed, HookEventKind::ALL.len());
        assert_eq!(already, 0);

        let (installed, already) = install_hooks(&settings).unwrap();
        assert_eq!(installed, 0);
        assert_eq!(already, HookEventKind::ALL.len());
    }

    #[test]
    fn test_install_preserves_foreign_hooks() {
        let dir = tempfile::tempdir().unwrap();
        let settings_file = dir.path().join("settings.json");
        std::fs::write(
            &settings_file,
            serde_json::to_string(&json!({
                "hooks": {"Stop": [{"hooks": [{"type": "command", "command": "other-tool"}]}]},
            }))
            .unwrap(),
        )
        .unwrap();

        install_hooks(&settings_file).unwrap();

        let settings = load_settings(&settings_file).unwrap();
        let stop_hooks = settings["hooks"]["Stop"][0]["hooks"].as_array().unwrap();
        assert_eq!(stop_hooks.len(), 2);
        assert_eq!(stop_hooks[0]["command"], "other-tool");
        assert_eq!(stop_hooks[1]["command"], HOOK_COMMAND);
    }

    #[test]
    fn test_subagent_hooks_marked_async() {
        let dir = tempfile::tempdir().unwrap();
        let settings_file = dir.path().join("settings.json");
        install_hooks(&settings_file).unwrap();

        let settings = load_settings(&settings_file).unwrap();
        assert_eq!(
            settings["hooks"]["SubagentStart"][0]["hooks"][0]["async"],
            json!(true)
        );
        assert!(settings["hooks"]["Stop"][0]["hooks"][0].get("async").is_none());
    }

    #[test]
    fn test_uninstall_hooks() {
        let dir = tempfile::tempdir().unwrap();
        let settings_file = dir.path().join("settings.json");
        install_hooks(&settings_file).unwrap();

        assert!(uninstall_hooks(&settings_file).unwrap());
        let settings = load_settings(&settings_file).unwrap();
        for (_, installed) in installed_events(&settings) {
            assert!(!installed);
        }

        // Second uninstall is a no-op.
        assert!(!uninstall_hooks(&settings_file).unwrap());
    }
}
