//! Claude Code provider.
//!
//! The only provider with a hook mechanism: `SessionStart` payloads are
//! validated here. Transcripts are JSONL under `~/.claude/projects`, one
//! JSON object per line with content blocks (text, thinking, tool_use,
//! tool_result). Terminal UI patterns live in
//! [`crate::terminal_parser::CLAUDE_UI_PATTERNS`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use uuid::Uuid;

use crate::config::provider_command_override;
use crate::events::HookEventKind;
use crate::terminal_parser::{
    self, CLAUDE_UI_PATTERNS, UiPattern, extract_interactive_content, format_status_display,
    parse_status_line,
};

use super::{
    AgentMessage, AgentProvider, CommandSource, ContentType, DiscoveredCommand, MessageRole,
    ProviderCapabilities, ProviderError, SessionStartEvent, StatusUpdate, parse_jsonl_line,
    validate_resume_id,
};

/// Claude Code built-in slash commands.
const CLAUDE_BUILTINS: &[(&str, &str)] = &[
    ("/clear", "Clear conversation history"),
    ("/compact", "Compact conversation context"),
    ("/config", "Open config panel"),
    ("/cost", "Show token usage for the session"),
    ("/exit", "Close session"),
    ("/memory", "Edit memory files"),
    ("/model", "Switch model"),
    ("/resume", "Resume a previous session"),
    ("/status", "Show session status"),
];

/// Maximum characters of tool input shown in a tool-use message.
const TOOL_INPUT_PREVIEW: usize = 120;

/// AgentProvider implementation for Claude Code.
pub struct ClaudeProvider {
    caps: ProviderCapabilities,
}

impl ClaudeProvider {
    pub(super) fn new() -> Self {
        Self {
            caps: ProviderCapabilities {
                name: "claude",
                launch_command: provider_command_override("claude")
                    .unwrap_or_else(|| "claude".to_string()),
                supports_hook: true,
                supports_resume: true,
                supports_continue: true,
                supports_incremental_read: true,
                uses_pane_title: false,
                builtin_commands: CLAUDE_BUILTINS,
            },
        }
    }
}

/// Validate a session id: canonical hyphenated UUID form.
pub(crate) fn is_valid_session_id(session_id: &str) -> bool {
    session_id.len() == 36 && Uuid::try_parse(session_id).is_ok()
}

/// Lower one content block to an AgentMessage, updating pending tools.
fn lower_block(
    block: &serde_json::Value,
    role: MessageRole,
    pending: &mut HashMap<String, String>,
) -> Option<AgentMessage> {
    match block.get("type").and_then(|t| t.as_str())? {
        "text" => {
            let text = block.get("text").and_then(|t| t.as_str())?;
            (!text.is_empty()).then(|| AgentMessage::text(role, text))
        }
        "thinking" => {
            let text = block.get("thinking").and_then(|t| t.as_str())?;
            (!text.is_empty()).then(|| AgentMessage {
                text: text.to_string(),
                role,
                content_type: ContentType::Thinking,
                tool_use_id: None,
                tool_name: None,
            })
        }
        "tool_use" => {
            let id = block.get("id").and_then(|i| i.as_str())?;
            let name = block
                .get("name")
                .and_then(|n| n.as_str())
                .unwrap_or("unknown");
            pending.insert(id.to_string(), name.to_string());
            Some(AgentMessage {
                text: format_tool_use(name, block.get("input")),
                role,
                content_type: ContentType::ToolUse,
                tool_use_id: Some(id.to_string()),
                tool_name: Some(name.to_string()),
            })
        }
        "tool_result" => {
            let tool_use_id = block.get("tool_use_id").and_then(|i| i.as_str());
            let tool_name = tool_use_id.and_then(|id| pending.remove(id));
            let text = flatten_result_content(block.get("content"));
            (!text.is_empty()).then(|| AgentMessage {
                text,
                role,
                content_type: ContentType::ToolResult,
                tool_use_id: tool_use_id.map(str::to_string),
                tool_name,
            })
        }
        _ => None,
    }
}

/// Render a tool-use block as `Name: <salient input>`.
fn format_tool_use(name: &str, input: Option<&serde_json::Value>) -> String {
    let detail = input.and_then(|i| {
        ["command", "file_path", "pattern", "url", "description"]
            .iter()
            .find_map(|key| i.get(key).and_then(|v| v.as_str()))
    });
    match detail {
        Some(d) => {
            let short: String = d.chars().take(TOOL_INPUT_PREVIEW).collect();
            format!("{name}: {short}")
        }
        None => name.to_string(),
    }
}

/// Flatten a tool_result content field (string or list of text blocks).
fn flatten_result_content(content: Option<&serde_json::Value>) -> String {
    match content {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| {
                (b.get("type").and_then(|t| t.as_str()) == Some("text"))
                    .then(|| b.get("text").and_then(|t| t.as_str()))
                    .flatten()
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn entry_role(entry: &serde_json::Value) -> Option<MessageRole> {
    match entry.get("type").and_then(|t| t.as_str())? {
        "user" => Some(MessageRole::User),
        "assistant" => Some(MessageRole::Assistant),
        _ => None,
    }
}

/// Synthetic user entries the agent writes for its own bookkeeping.
fn is_meta_entry(entry: &serde_json::Value) -> bool {
    entry.get("isMeta").and_then(|m| m.as_bool()).unwrap_or(false)
}

/// Local-command echoes wrapped in XML-ish tags, not real user text.
fn is_local_command_text(text: &str) -> bool {
    text.starts_with("<local-command") || text.starts_with("<command-name>")
}

impl AgentProvider for ClaudeProvider {
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
            return Ok("--continue".to_string());
        }
        Ok(String::new())
    }

    fn parse_hook_payload(&self, payload: &serde_json::Value) -> Option<SessionStartEvent> {
        let session_id = payload.get("session_id").and_then(|s| s.as_str())?;
        let cwd = payload.get("cwd").and_then(|c| c.as_str()).unwrap_or("");
        let event = payload.get("hook_event_name").and_then(|e| e.as_str())?;

        if !is_valid_session_id(session_id) {
            return None;
        }
        if !cwd.is_empty() && !Path::new(cwd).is_absolute() {
            return None;
        }
        if HookEventKind::from_name(event) != Some(HookEventKind::SessionStart) {
            return None;
        }

        Some(SessionStartEvent {
            session_id: session_id.to_string(),
            cwd: cwd.to_string(),
            transcript_path: payload
                .get("transcript_path")
                .and_then(|p| p.as_str())
                .unwrap_or("")
                .to_string(),
        })
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
            if is_meta_entry(entry) {
                continue;
            }
            let content = entry.get("message").and_then(|m| m.get("content"));
            match content {
                Some(serde_json::Value::String(text)) => {
                    if !text.is_empty() && !is_local_command_text(text) {
                        messages.push(AgentMessage::text(role, text.clone()));
                    }
                }
                Some(serde_json::Value::Array(blocks)) => {
                    for block in blocks {
                        if let Some(msg) = lower_block(block, role, pending_tools) {
                            messages.push(msg);
                        }
                    }
                }
                _ => {}
            }
        }
        messages
    }

    fn parse_terminal_status(&self, pane_text: &str, _pane_title: &str) -> Option<StatusUpdate> {
        if let Some(ui) = extract_interactive_content(pane_text, &CLAUDE_UI_PATTERNS) {
            return Some(StatusUpdate::interactive(ui.content, ui.name));
        }
        let raw = parse_status_line(pane_text, None)?;
        let label = format_status_display(&raw);
        Some(StatusUpdate::status(raw, label))
    }

    fn ui_patterns(&self) -> &[UiPattern] {
        &CLAUDE_UI_PATTERNS
    }

    fn extract_bash_output(&self, pane_text: &str, command: &str) -> Option<String> {
        terminal_parser::extract_bash_output(pane_text, command)
    }

    fn is_user_transcript_entry(&self, entry: &serde_json::Value) -> bool {
        if entry_role(entry) != Some(MessageRole::User) || is_meta_entry(entry) {
            return false;
        }
        match entry.get("message").and_then(|m| m.get("content")) {
            Some(serde_json::Value::String(text)) => !is_local_command_text(text),
            Some(serde_json::Value::Array(blocks)) => blocks
                .iter()
                .any(|b| b.get("type").and_then(|t| t.as_str()) == Some("text")),
            _ => false,
        }
    }

    fn parse_history_entry(&self, entry: &serde_json::Value) -> Option<AgentMessage> {
        let role = entry_role(entry)?;
        if is_meta_entry(entry) {
            return None;
        }
        let text = match entry.get("message").and_then(|m| m.get("content"))? {
            serde_json::Value::String(s) => {
                if is_local_command_text(s) {
                    return None;
                }
                s.clone()
            }
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

    fn discover_commands(&self, base_dir: &Path) -> Vec<DiscoveredCommand> {
        let mut commands: Vec<DiscoveredCommand> = CLAUDE_BUILTINS
            .iter()
            .map(|(name, desc)| DiscoveredCommand {
                name: (*name).to_string(),
                description: (*desc).to_string(),
                source: CommandSource::Builtin,
            })
            .collect();

        let claude_dir = base_dir.join(".claude");
        scan_command_dir(&claude_dir.join("commands"), None, &mut commands);
        scan_skills_dir(&claude_dir.join("skills"), &mut commands);
        commands
    }

    fn projects_dir(&self) -> Option<PathBuf> {
        Some(dirs::home_dir()?.join(".claude").join("projects"))
    }
}

/// Scan a `commands/` directory: `foo.md` → `/foo`, `ns/foo.md` → `/ns:foo`.
fn scan_command_dir(dir: &Path, namespace: Option<&str>, out: &mut Vec<DiscoveredCommand>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            // One level of namespacing only.
            if namespace.is_none()
                && let Some(ns) = path.file_name().and_then(|n| n.to_str())
            {
                scan_command_dir(&path, Some(ns), out);
            }
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some("md") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let name = match namespace {
            Some(ns) => format!("/{ns}:{stem}"),
            None => format!("/{stem}"),
        };
        out.push(DiscoveredCommand {
            name,
            description: read_frontmatter_description(&path).unwrap_or_default(),
            source: CommandSource::Command,
        });
    }
}

/// Scan a `skills/` directory: `skills/<name>/SKILL.md` → `/<name>`.
fn scan_skills_dir(dir: &Path, out: &mut Vec<DiscoveredCommand>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let skill_file = entry.path().join("SKILL.md");
        if !skill_file.is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        out.push(DiscoveredCommand {
            name: format!("/{name}"),
            description: read_frontmatter_description(&skill_file).unwrap_or_default(),
            source: CommandSource::Skill,
        });
    }
}

/// Pull `description:` out of a markdown file's YAML frontmatter.
fn read_frontmatter_description(path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    let mut lines = content.lines();
    if lines.next()?.trim() != "---" {
        return None;
    }
    for line in lines {
        if line.trim() == "---" {
            break;
        }
        if let Some(rest) = line.strip_prefix("description:") {
            return Some(rest.trim().trim_matches('"').to_string());
        }
    }
    None
}
