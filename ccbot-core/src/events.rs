//! Typed events flowing from the session monitor to its subscribers.
//!
//! The monitor publishes [`MonitorEvent`]s on an unbounded channel; the
//! Telegram frontend routes them to the status poller and message queue.
//! This is the seam that keeps the monitor free of any Telegram knowledge.

use serde::{Deserialize, Serialize};

/// Hook event types ccbot handles. Everything else in the event log is
/// ignored by the reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookEventKind {
    SessionStart,
    Notification,
    Stop,
    SubagentStart,
    SubagentStop,
    TeammateIdle,
    TaskCompleted,
}

impl HookEventKind {
    /// All handled kinds, in the order they are installed as hooks.
    pub const ALL: [HookEventKind; 7] = [
        HookEventKind::SessionStart,
        HookEventKind::Notification,
        HookEventKind::Stop,
        HookEventKind::SubagentStart,
        HookEventKind::SubagentStop,
        HookEventKind::TeammateIdle,
        HookEventKind::TaskCompleted,
    ];

    /// Wire name as it appears in hook payloads and `events.jsonl`.
    pub fn as_str(self) -> &'static str {
        match self {
            HookEventKind::SessionStart => "SessionStart",
            HookEventKind::Notification => "Notification",
            HookEventKind::Stop => "Stop",
            HookEventKind::SubagentStart => "SubagentStart",
            HookEventKind::SubagentStop => "SubagentStop",
            HookEventKind::TeammateIdle => "TeammateIdle",
            HookEventKind::TaskCompleted => "TaskCompleted",
        }
    }

    /// Parse a wire name. Unknown names (e.g. `PreToolUse`) return `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }

    /// Whether this hook should be installed with `async: true` so it
    /// never blocks the agent.
    pub fn is_async(self) -> bool {
        matches!(self, HookEventKind::SubagentStart | HookEventKind::SubagentStop)
    }
}

/// One line of the append-only event log.
#[derive(Debug, Clone, PartialEq)]
pub struct HookEvent {
    pub kind: HookEventKind,
    /// `"<tmux_session>:<window_id>"`, e.g. `"ccbot:@5"`.
    pub window_key: String,
    pub session_id: String,
    /// Event-specific payload (`tool_name`/`message`, `stop_reason`/`num_turns`, …).
    pub data: serde_json::Value,
    /// Unix timestamp written by the hook.
    pub timestamp: f64,
}

impl HookEvent {
    /// Extract the window id from the window key (`"ccbot:@5"` → `"@5"`).
    pub fn window_id(&self) -> Option<&str> {
        self.window_key.rsplit_once(':').map(|(_, id)| id)
    }
}

/// A new transcript message detected by the monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub session_id: String,
    pub text: String,
    pub role: crate::provider::MessageRole,
    pub content_type: crate::provider::ContentType,
    pub tool_use_id: Option<String>,
    pub tool_name: Option<String>,
}

/// A new tmux window detected via session-map changes or a live-window scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewWindowEvent {
    pub window_id: String,
    /// Empty until the agent's hook fires.
    pub session_id: String,
    pub window_name: String,
    pub cwd: String,
}

/// Everything the monitor can emit.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    Message(NewMessage),
    Window(NewWindowEvent),
    Hook(HookEvent),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_roundtrip() {
        for kind in HookEventKind::ALL {
            assert_eq!(HookEventKind::from_name(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn test_unknown_kind_rejected() {
        assert_eq!(HookEventKind::from_name("PreToolUse"), None);
        assert_eq!(HookEventKind::from_name("ConfigChange"), None);
        assert_eq!(HookEventKind::from_name(""), None);
    }

    #[test]
    fn test_async_events() {
        assert!(HookEventKind::SubagentStart.is_async());
        assert!(HookEventKind::SubagentStop.is_async());
        assert!(!HookEventKind::SessionStart.is_async());
        assert!(!HookEventKind::Stop.is_async());
    }

    #[test]
    fn test_window_id_extraction() {
        let event = HookEvent {
            kind: HookEventKind::Stop,
            window_key: "ccbot:@5".to_string(),
            session_id: String::new(),
            data: serde_json::Value::Null,
            timestamp: 0.0,
        };
        assert_eq!(event.window_id(), Some("@5"));
    }
}
