//! Google Gemini CLI provider.
//!
//! Gemini persists whole-file JSON chat transcripts (not JSONL), so the
//! monitor re-reads the file and tracks progress by message count instead
//! of byte offset. Terminal state is mirrored into the tmux pane title via
//! OSC (`Working: ✦`, `Action Required: ✋`, `Ready: ◇`), which is checked
//! before the pane text.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::config::provider_command_override;
use crate::terminal_parser::{
    self, GEMINI_UI_PATTERNS, UiPattern, extract_interactive_content,
};

use super::{
    AgentMessage, AgentProvider, CommandSource, ContentType, DiscoveredCommand, MessageRole,
    ProviderCapabilities, ProviderError, SessionStartEvent, StatusUpdate, validate_resume_id,
};

/// Gemini CLI built-in slash commands.
const GEMINI_BUILTINS: &[(&str, &str)] = &[
    ("/clear", "Clear screen and chat context"),
    ("/model", "Switch model mid-session"),
    ("/compress", "Summarize chat context to save tokens"),
    ("/copy", "Copy last response to clipboard"),
    ("/help", "Display available commands"),
    ("/mcp", "List MCP servers and tools"),
    ("/stats", "Show session statistics"),
    ("/resume", "Browse and select previous sessions"),
    ("/directories", "Manage accessible directories"),
];

/// AgentProvider implementation for Google Gemini CLI.
pub struct GeminiProvider {
    caps: ProviderCapabilities,
}

impl GeminiProvider {
    pub(super) fn new() -> Self {
        Self {
            caps: ProviderCapabilities {
                name: "gemini",
                launch_command: provider_command_override("gemini")
                    .unwrap_or_else(|| "gemini".to_string()),
                supports_hook: false,
                supports_resume: true,
                supports_continue: true,
                supports_incremental_read: false,
                uses_pane_title: true,
                builtin_commands: GEMINI_BUILTINS,
            },
        }
    }
}

fn message_role(entry: &serde_json::Value) -> Option<MessageRole> {
    match entry.get("role").and_then(|r| r.as_str())? {
        "user" => Some(MessageRole::User),
        "model" | "assistant" => Some(MessageRole::Assistant),
        _ => None,
    }
}

/// Concatenate the text parts of a Gemini chat message.
fn parts_text(entry: &serde_json::Value) -> String {
    match entry.get("parts") {
        Some(serde_json::Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join(""),
        _ => entry
            .get("content")
            .and_then(|c| c.as_str())
            .unwrap_or("")
            .to_string(),
    }
}

/// First function call / response in a message's parts, if any.
fn function_part(entry: &serde_json::Value) -> Option<(ContentType, String)> {
    let parts = entry.get("parts")?.as_array()?;
    for part in parts {
        if let Some(call) = part.get("functionCall") {
            let name = call.get("name").and_then(|n| n.as_str()).unwrap_or("tool");
            return Some((ContentType::ToolUse, name.to_string()));
        }
        if let Some(resp) = part.get("functionResponse") {
            let name = resp.get("name").and_then(|n| n.as_str()).unwrap_or("tool");
            return Some((ContentType::ToolResult, name.to_string()));
        }
    }
    None
}

impl AgentProvider for GeminiProvider {
    fn capabilities(&self) -> &ProviderCapabilities {
        &self.caps
    }

    fn make_launch_args(
        &self,
        resume_id: Option<&str>,
        use_continue: bool,
    ) -> Result<String, ProviderError> {
        if let Some(id) = resume_id {
            validate_resume_id(id)?;
            return Ok(format!("--resume {id}"));
        }
        if use_continue {
            return Ok("--resume latest".to_string());
        }
        Ok(String::new())
    }

    fn parse_hook_payload(&self, _payload: &serde_json::Value) -> Option<SessionStartEvent> {
        // Gemini has no SessionStart hook.
        None
    }

    fn parse_transcript_line(&self, _line: &str) -> Option<serde_json::Value> {
        // Whole-file provider: transcripts are not line-oriented.
        None
    }

    fn read_transcript_file(&self, path: &Path, offset: u64) -> (Vec<serde_json::Value>, u64) {
        let Ok(content) = std::fs::read_to_string(path) else {
            return (Vec::new(), offset);
        };
        let Ok(root) = serde_json::from_str::<serde_json::Value>(&content) else {
            // Mid-write or corrupt file: do not advance the message count.
            tracing::debug!("Unparseable transcript {}, will retry", path.display());
            return (Vec::new(), offset);
        };
        let messages = root
            .get("messages")
            .and_then(|m| m.as_array())
            .cloned()
            .unwrap_or_default();
        let total = messages.len() as u64;
        if total < offset {
            // Transcript replaced or cleared: replay from the start.
            return (messages, total);
        }
        let new = messages[offset as usize..].to_vec();
        (new, total)
    }

    fn parse_transcript_entries(
        &self,
        entries: &[serde_json::Value],
        _pending_tools: &mut HashMap<String, String>,
    ) -> Vec<AgentMessage> {
        let mut messages = Vec::new();
        for entry in entries {
            let Some(role) = message_role(entry) else {
                continue;
            };
            if let Some((content_type, tool_name)) = function_part(entry) {
                messages.push(AgentMessage {
                    text: tool_name.clone(),
                    role,
                    content_type,
                    tool_use_id: None,
                    tool_name: Some(tool_name),
                });
                continue;
            }
            let text = parts_text(entry);
            if !text.is_empty() {
                messages.push(AgentMessage::text(role, text));
            }
        }
        messages
    }

    fn parse_terminal_status(&self, pane_text: &str, pane_title: &str) -> Option<StatusUpdate> {
        // Pane title is authoritative when present.
        if pane_title.starts_with("Action Required") {
            let content = extract_interactive_content(pane_text, &GEMINI_UI_PATTERNS)
                .map(|ui| ui.content)
                .unwrap_or_else(|| pane_title.to_string());
            return Some(StatusUpdate::interactive(
                content,
                "PermissionPrompt".to_string(),
            ));
        }
        if pane_title.starts_with("Working") {
            return Some(StatusUpdate::status(
                pane_title.to_string(),
                "…working".to_string(),
            ));
        }
        if pane_title.starts_with("Ready") {
            return None;
        }
        // No informative title: fall back to pane-text pattern matching.
        extract_interactive_content(pane_text, &GEMINI_UI_PATTERNS)
            .map(|ui| StatusUpdate::interactive(ui.content, ui.name))
    }

    fn ui_patterns(&self) -> &[UiPattern] {
        &GEMINI_UI_PATTERNS
    }

    fn extract_bash_output(&self, pane_text: &str, command: &str) -> Option<String> {
        terminal_parser::extract_bash_output(pane_text, command)
    }

    fn is_user_transcript_entry(&self, entry: &serde_json::Value) -> bool {
        entry.get("role").and_then(|r| r.as_str()) == Some("user")
    }

    fn parse_history_entry(&self, entry: &serde_json::Value) -> Option<AgentMessage> {
        let role = message_role(entry)?;
        let text = parts_text(entry);
        (!text.is_empty()).then(|| AgentMessage::text(role, text))
    }

    fn discover_commands(&self, _base_dir: &Path) -> Vec<DiscoveredCommand> {
        GEMINI_BUILTINS
            .iter()
            .map(|(name, desc)| DiscoveredCommand {
                name: (*name).to_string(),
                description: (*desc).to_string(),
                source: CommandSource::Builtin,
            })
            .collect()
    }

    fn projects_dir(&self) -> Option<PathBuf> {
        Some(dirs::home_dir()?.join(".gemini").join("tmp"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> GeminiProvider {
        GeminiProvider::new()
    }

    fn write_transcript(dir: &Path, messages: serde_json::Value) -> PathBuf {
        let path = dir.join("chat.json");
        std::fs::write(
            &path,
            serde_json::to_string(&serde_json::json!({"messages": messages})).unwrap(),
        )
        .unwrap();
        path
    }

    #[test]
    fn test_launch_args_resume_and_latest() {
        assert_eq!(
            provider().make_launch_args(Some("s1"), false).unwrap(),
            "--resume s1"
        );
        assert_eq!(
            provider().make_launch_args(None, true).unwrap(),
            "--resume latest"
        );
    }

    #[test]
    fn test_read_transcript_tracks_message_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_transcript(
            dir.path(),
            serde_json::json!([
                {"role": "user", "parts": [{"text": "hi"}]},
                {"role": "model", "parts": [{"text": "hello"}]},
            ]),
        );

        let (entries, count) = provider().read_transcript_file(&path, 0);
        assert_eq!(entries.len(), 2);
        assert_eq!(count, 2);

        // Only messages past the count are returned on the next read.
        let path = write_transcript(
            dir.path(),
            serde_json::json!([
                {"role": "user", "parts": [{"text": "hi"}]},
                {"role": "model", "parts": [{"text": "hello"}]},
                {"role": "model", "parts": [{"text": "more"}]},
            ]),
        );
        let (entries, count) = provider().read_transcript_file(&path, 2);
        assert_eq!(entries.len(), 1);
        assert_eq!(count, 3);
    }

    #[test]
    fn test_read_transcript_unparseable_keeps_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat.json");
        std::fs::write(&path, "{ mid-write garbage").unwrap();

        let (entries, count) = provider().read_transcript_file(&path, 5);
        assert!(entries.is_empty());
        assert_eq!(count, 5);
    }

    #[test]
    fn test_parse_entries_roles_and_tools() {
        let entries = vec![
            serde_json::json!({"role": "user", "parts": [{"text": "run it"}]}),
            serde_json::json!({"role": "model", "parts": [
                {"functionCall": {"name": "run_shell_command"}},
            ]}),
            serde_json::json!({"role": "model", "parts": [{"text": "done"}]}),
        ];
        let mut pending = HashMap::new();
        let msgs = provider().parse_transcript_entries(&entries, &mut pending);
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0].role, MessageRole::User);
        assert_eq!(msgs[1].content_type, ContentType::ToolUse);
        assert_eq!(msgs[1].tool_name.as_deref(), Some("run_shell_command"));
        assert_eq!(msgs[2].text, "done");
    }

    #[test]
    fn test_pane_title_working() {
        let status = provider().parse_terminal_status("", "Working: ✦").unwrap();
        assert!(!status.is_interactive);
        assert_eq!(status.display_label, "…working");
    }

    #[test]
    fn test_pane_title_action_required() {
        let pane = "Action Required: approve command\n  rm -rf build\n(esc to cancel)";
        let status = provider()
            .parse_terminal_status(pane, "Action Required: ✋")
            .unwrap();
        assert!(status.is_interactive);
        assert_eq!(status.ui_type.as_deref(), Some("PermissionPrompt"));
        assert!(status.raw_text.contains("rm -rf build"));
    }

    #[test]
    fn test_pane_title_ready_is_no_status() {
        assert!(provider().parse_terminal_status("anything", "Ready: ◇").is_none());
    }
}
