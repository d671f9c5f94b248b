//! OpenAI Codex CLI provider.
//!
//! Codex shares the tmux launch model but has no hook mechanism, uses
//! subcommand resume syntax (`resume <id>` / `resume --last`), and its
//! Rust TUI has no characterized interactive-UI patterns — only generic
//! spinner detection applies.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::config::provider_command_override;
use crate::terminal_parser::{
    self, UiPattern, format_status_display, parse_status_line,
};

use super::{
    AgentMessage, AgentProvider, CommandSource, ContentType, DiscoveredCommand, MessageRole,
    ProviderCapabilities, ProviderError, SessionStartEvent, StatusUpdate, parse_jsonl_line,
    validate_resume_id,
};

/// Codex CLI built-in slash commands.
const CODEX_BUILTINS: &[(&str, &str)] = &[
    ("/exit", "Close session"),
    ("/model", "Switch model or reasoning level"),
    ("/status", "Show session ID"),
    ("/mode", "Switch approval mode"),
];

/// AgentProvider implementation for OpenAI Codex CLI.
pub struct CodexProvider {
    caps: ProviderCapabilities,
}

impl CodexProvider {
    pub(super) fn new() -> Self {
        Self {
            caps: ProviderCapabilities {
                name: "codex",
                launch_command: provider_command_override("codex")
                    .unwrap_or_else(|| "codex".to_string()),
                supports_hook: false,
                supports_resume: true,
                supports_continue: true,
                supports_incremental_read: true,
                uses_pane_title: false,
                builtin_commands: CODEX_BUILTINS,
            },
        }
    }
}

/// Extract text and track tool_use/tool_result from content blocks.
fn extract_content(
    content: &serde_json::Value,
    pending: &mut HashMap<String, String>,
) -> (String, ContentType) {
    match content {
        serde_json::Value::String(s) => (s.clone(), ContentType::Text),
        serde_json::Value::Array(blocks) => {
            let mut text = String::new();
            let mut content_type = ContentType::Text;
            for block in blocks {
                match block.get("type").and_then(|t| t.as_str()) {
                    Some("text") => {
                        if let Some(t) = block.get("text").and_then(|t| t.as_str()) {
                            text.push_str(t);
                        }
                    }
                    Some("tool_use") => {
                        if let Some(id) = block.get("id").and_then(|i| i.as_str()) {
                            let name = block
                                .get("name")
                                .and_then(|n| n.as_str())
                                .unwrap_or("unknown");
                            pending.insert(id.to_string(), name.to_string());
                            content_type = ContentType::ToolUse;
                        }
                    }
                    Some("tool_result") => {
                        if let Some(id) = block.get("tool_use_id").and_then(|i| i.as_str()) {
                            pending.remove(id);
                        }
                        content_type = ContentType::ToolResult;
                    }
                    _ => {}
                }
            }
            (text, content_type)
        }
        _ => (String::new(), ContentType::Text),
    }
}

fn entry_role(entry: &serde_json::Value) -> Option<MessageRole> {
    match entry.get("type").and_then(|t| t.as_str())? {
        "user" => Some(MessageRole::User),
        "assistant" => Some(MessageRole::Assistant),
        _ => None,
    }
}

impl AgentProvider for CodexProvider {
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
            return Ok(format!("resume {id}"));
        }
        if use_continue {
            return Ok("resume --last".to_string());
        }
        Ok(String::new())
    }

    fn parse_hook_payload(&self, _payload: &serde_json::Value) -> Option<SessionStartEvent> {
        // Codex has no SessionStart hook.
        None
    }

    fn parse_transcript_line(&self, line: &str) -> Option<serde_json::Value> {
        parse_jsonl_line(line)
    }

    fn parse_transcript_entries(
        &self,
        entries: &[serde_json::Value],
        pending_tools: &mut HashMap<String, String>,
    ) -> Vec<AgentMessage> {
        let mut messages = Vec::new();
        for entry in entries {
            let Some(role) = entry_role(entry) else {
                continue;
            };
            let Some(content) = entry.get("message").and_then(|m| m.get("content")) else {
                continue;
            };
            let (text, content_type) = extract_content(content, pending_tools);
            if !text.is_empty() {
                messages.push(AgentMessage {
                    text,
                    role,
                    content_type,
                    tool_use_id: None,
                    tool_name: None,
                });
            }
        }
        messages
    }

    fn parse_terminal_status(&self, pane_text: &str, _pane_title: &str) -> Option<StatusUpdate> {
        let raw = parse_status_line(pane_text, None)?;
        let label = format_status_display(&raw);
        Some(StatusUpdate::status(raw, label))
    }

    fn ui_patterns(&self) -> &[UiPattern] {
        // Codex TUI patterns are not characterized.
        &[]
    }

    fn extract_bash_output(&self, pane_text: &str, command: &str) -> Option<String> {
        terminal_parser::extract_bash_output(pane_text, command)
    }

    fn is_user_transcript_entry(&self, entry: &serde_json::Value) -> bool {
        entry.get("type").and_then(|t| t.as_str()) == Some("user")
    }

    fn parse_history_entry(&self, entry: &serde_json::Value) -> Option<AgentMessage> {
        let role = entry_role(entry)?;
        let content = entry.get("message").and_then(|m| m.get("content"))?;
        let text = match content {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Array(blocks) => blocks
                .iter()
                .filter_map(|b| {
                    (b.get("type").and_then(|t| t.as_str()) == Some("text"))
                        .then(|| b.get("text").and_then(|t| t.as_str()))
                        .flatten()
                })
                .collect::<Vec<_>>()
                .join(""),
            _ => return None,
        };
        (!text.is_empty()).then(|| AgentMessage::text(role, text))
    }

    fn discover_commands(&self, _base_dir: &Path) -> Vec<DiscoveredCommand> {
        CODEX_BUILTINS
            .iter()
            .map(|(name, desc)| DiscoveredCommand {
                name: (*name).to_string(),
                description: (*desc).to_string(),
                source: CommandSource::Builtin,
            })
            .collect()
    }

    fn projects_dir(&self) -> Option<PathBuf> {
        Some(dirs::home_dir()?.join(".codex").join("sessions"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> CodexProvider {
        CodexProvider::new()
    }

    #[test]
    fn test_launch_args_resume_subcommand_syntax() {
        assert_eq!(
            provider().make_launch_args(Some("abc123"), false).unwrap(),
            "resume abc123"
        );
    }

    #[test]
    fn test_launch_args_continue_maps_to_resume_last() {
        assert_eq!(
            provider().make_launch_args(None, true).unwrap(),
            "resume --last"
        );
    }

    #[test]
    fn test_launch_args_rejects_bad_id() {
        assert!(provider().make_launch_args(Some("a b"), false).is_err());
    }

    #[test]
    fn test_no_hook_payload() {
        let payload = serde_json::json!({
            "session_id": "0195c5bc-6a2c-4890-a1b2-c3d4e5f60718",
            "hook_event_name": "SessionStart",
        });
        assert!(provider().parse_hook_payload(&payload).is_none());
    }

    #[test]
    fn test_transcript_tool_tracking() {
        let mut pending = HashMap::new();
        let entries = vec![
            serde_json::json!({"type": "assistant", "message": {"content": [
                {"type": "tool_use", "id": "t1", "name": "shell"},
                {"type": "text", "text": "running"},
            ]}}),
            serde_json::json!({"type": "user", "message": {"content": [
                {"type": "tool_result", "tool_use_id": "t1"},
                {"type": "text", "text": "done"},
            ]}}),
        ];
        let msgs = provider().parse_transcript_entries(&entries, &mut pending);
        assert_eq!(msgs.len(), 2);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_parse_terminal_status_requires_spinner() {
        assert!(provider().parse_terminal_status("plain shell output", "").is_none());
        let pane = format!("✶ Compiling\n{}", "─".repeat(30));
        let status = provider().parse_terminal_status(&pane, "").unwrap();
        assert_eq!(status.display_label, "…building");
    }

    #[test]
    fn test_discover_commands_static() {
        let found = provider().discover_commands(Path::new("/tmp"));
        assert_eq!(found.len(), CODEX_BUILTINS.len());
        assert!(found.iter().all(|c| c.source == CommandSource::Builtin));
    }
}
