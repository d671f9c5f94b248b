//! Agent CLI provider abstraction.
//!
//! A provider normalizes one terminal agent (Claude Code, OpenAI Codex,
//! Google Gemini) behind a single interface: launch arguments, transcript
//! parsing, terminal status detection, and command discovery. Providers are
//! stateless singletons resolved through [`provider_by_name`]; per-window
//! resolution reads the window's persisted provider name and falls back to
//! the default.

mod claude;
mod codex;
mod gemini;
mod registry;

pub use claude::ClaudeProvider;
pub(crate) use claude::is_valid_session_id;
pub use codex::CodexProvider;
pub use gemini::GeminiProvider;
pub use registry::{available_providers, detect_provider, provider_by_name};

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::terminal_parser::UiPattern;

/// Error type for provider operations.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// A resume ID contained characters outside `[\w-]`.
    #[error("invalid resume id: {0:?}")]
    InvalidResumeId(String),
}

/// Who authored a transcript message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// What kind of content a transcript message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Text,
    Thinking,
    ToolUse,
    ToolResult,
}

impl ContentType {
    /// Whether adjacent outbound messages of this type may be merged.
    pub fn is_mergeable(self) -> bool {
        matches!(self, ContentType::Text | ContentType::Thinking)
    }
}

/// A single parsed message from an agent's transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentMessage {
    pub text: String,
    pub role: MessageRole,
    pub content_type: ContentType,
    pub tool_use_id: Option<String>,
    pub tool_name: Option<String>,
}

impl AgentMessage {
    /// Plain text message shorthand.
    pub fn text(role: MessageRole, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            role,
            content_type: ContentType::Text,
            tool_use_id: None,
            tool_name: None,
        }
    }
}

/// Emitted when a provider session starts, parsed from a hook payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStartEvent {
    pub session_id: String,
    pub cwd: String,
    pub transcript_path: String,
}

/// Parsed terminal state from an agent's pane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    /// Original text after the spinner, or the extracted UI region.
    pub raw_text: String,
    /// Short label like `…reading`, or the UI name.
    pub display_label: String,
    pub is_interactive: bool,
    /// UI pattern name when `is_interactive` (e.g. `PermissionPrompt`).
    pub ui_type: Option<String>,
}

impl StatusUpdate {
    pub(crate) fn status(raw_text: String, display_label: String) -> Self {
        Self {
            raw_text,
            display_label,
            is_interactive: false,
            ui_type: None,
        }
    }

    pub(crate) fn interactive(content: String, ui_type: String) -> Self {
        Self {
            raw_text: content,
            display_label: ui_type.clone(),
            is_interactive: true,
            ui_type: Some(ui_type),
        }
    }
}

/// Where a discovered command comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandSource {
    Builtin,
    Skill,
    Command,
}

/// A slash command the provider understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredCommand {
    pub name: String,
    pub description: String,
    pub source: CommandSource,
}

/// Declares what features a provider supports. Immutable after
/// construction — providers hand out a reference to a fixed instance.
#[derive(Debug, Clone)]
pub struct ProviderCapabilities {
    /// Registry name (`claude`, `codex`, `gemini`).
    pub name: &'static str,
    /// Binary to launch, after the `CCBOT_<NAME>_COMMAND` override.
    pub launch_command: String,
    /// Whether the CLI fires lifecycle hooks ccbot can install.
    pub supports_hook: bool,
    pub supports_resume: bool,
    pub supports_continue: bool,
    /// JSONL transcripts read incrementally by byte offset; whole-file
    /// JSON transcripts re-read entirely and track a message count.
    pub supports_incremental_read: bool,
    /// Whether terminal status also lives in the tmux pane title (OSC).
    pub uses_pane_title: bool,
    /// Built-in slash commands: (name, description).
    pub builtin_commands: &'static [(&'static str, &'static str)],
}

/// Interface every agent CLI provider implements.
///
/// All operations are pure with respect to process state; the only I/O is
/// [`AgentProvider::read_transcript_file`] and command discovery, both
/// invoked from blocking contexts by the monitor.
pub trait AgentProvider: Send + Sync {
    fn capabilities(&self) -> &ProviderCapabilities;

    /// Build the CLI argument string for launching the agent.
    ///
    /// Empty string for a fresh session.
    ///
    /// # Errors
    ///
    /// Rejects resume IDs not matching `[\w-]+`.
    fn make_launch_args(
        &self,
        resume_id: Option<&str>,
        use_continue: bool,
    ) -> Result<String, ProviderError>;

    /// Parse a hook's stdin JSON into a [`SessionStartEvent`].
    ///
    /// Returns `None` when the payload is invalid or the provider has no
    /// hook mechanism. Only Claude returns `Some`.
    fn parse_hook_payload(&self, payload: &serde_json::Value) -> Option<SessionStartEvent>;

    /// Parse one raw transcript line into a structured entry.
    ///
    /// Returns `None` for empty, partial, or non-object lines.
    fn parse_transcript_line(&self, line: &str) -> Option<serde_json::Value>;

    /// Lower raw entries to [`AgentMessage`]s.
    ///
    /// `pending_tools` maps tool-use IDs to tool names and is carried
    /// across calls so a later `tool_result` can name the tool it
    /// resolves.
    fn parse_transcript_entries(
        &self,
        entries: &[serde_json::Value],
        pending_tools: &mut HashMap<String, String>,
    ) -> Vec<AgentMessage>;

    /// Whole-file transcript read (providers with
    /// `supports_incremental_read == false`).
    ///
    /// `offset` is a message count; returns the entries past it plus the
    /// new count. On an unparseable file the count must NOT advance.
    fn read_transcript_file(&self, _path: &Path, offset: u64) -> (Vec<serde_json::Value>, u64) {
        (Vec::new(), offset)
    }

    /// Regex-based fallback parse of pane text (and, for providers with
    /// `uses_pane_title`, the OSC-set pane title).
    fn parse_terminal_status(&self, pane_text: &str, pane_title: &str) -> Option<StatusUpdate>;

    /// Interactive-UI delimiter patterns for this provider's terminal
    /// renderer. Empty when none are characterized.
    fn ui_patterns(&self) -> &[UiPattern];

    /// Extract `!` shell-command output from a captured pane.
    fn extract_bash_output(&self, pane_text: &str, command: &str) -> Option<String>;

    /// Whether a transcript entry is a user-authored message (for
    /// `/history` rendering).
    fn is_user_transcript_entry(&self, entry: &serde_json::Value) -> bool;

    /// Parse one transcript entry for `/history` display.
    fn parse_history_entry(&self, entry: &serde_json::Value) -> Option<AgentMessage>;

    /// Discover available commands/skills for a project directory.
    fn discover_commands(&self, base_dir: &Path) -> Vec<DiscoveredCommand>;

    /// Root directory of this provider's transcript store, for the
    /// monitor's scan fallback.
    fn projects_dir(&self) -> Option<PathBuf>;
}

/// Validate a resume ID: alphanumerics, hyphens, underscores only.
pub(crate) fn validate_resume_id(resume_id: &str) -> Result<(), ProviderError> {
    if !resume_id.is_empty()
        && resume_id
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        Ok(())
    } else {
        Err(ProviderError::InvalidResumeId(resume_id.to_string()))
    }
}

/// Parse one JSONL line into a JSON object. Shared by all JSONL providers.
pub(crate) fn parse_jsonl_line(line: &str) -> Option<serde_json::Value> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    serde_json::from_str::<serde_json::Value>(line)
        .ok()
        .filter(serde_json::Value::is_object)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_resume_id_accepts_uuid_like() {
        assert!(validate_resume_id("abc123-def_456").is_ok());
        assert!(validate_resume_id("0195c5bc-6a2c-7890-a1b2-c3d4e5f60718").is_ok());
    }

    #[test]
    fn test_validate_resume_id_rejects_shell_metacharacters() {
        assert!(validate_resume_id("abc; rm -rf /").is_err());
        assert!(validate_resume_id("$(whoami)").is_err());
        assert!(validate_resume_id("a b").is_err());
        assert!(validate_resume_id("").is_err());
    }

    #[test]
    fn test_parse_jsonl_line() {
        assert!(parse_jsonl_line(r#"{"type":"user"}"#).is_some());
        assert!(parse_jsonl_line("").is_none());
        assert!(parse_jsonl_line("   ").is_none());
        assert!(parse_jsonl_line(r#"{"truncat"#).is_none());
        assert!(parse_jsonl_line("[1,2,3]").is_none());
    }

    #[test]
    fn test_mergeable_content_types() {
        assert!(ContentType::Text.is_mergeable());
        assert!(ContentType::Thinking.is_mergeable());
        assert!(!ContentType::ToolUse.is_mergeable());
        assert!(!ContentType::ToolResult.is_mergeable());
    }
}
