//! Provider registry — name → singleton resolution and auto-detection.

use std::sync::LazyLock;

use super::{AgentProvider, ClaudeProvider, CodexProvider, GeminiProvider};

static CLAUDE: LazyLock<ClaudeProvider> = LazyLock::new(ClaudeProvider::new);
static CODEX: LazyLock<CodexProvider> = LazyLock::new(CodexProvider::new);
static GEMINI: LazyLock<GeminiProvider> = LazyLock::new(GeminiProvider::new);

/// Registered provider names.
pub fn available_providers() -> [&'static str; 3] {
    ["claude", "codex", "gemini"]
}

/// Resolve a provider by name. Unknown or empty names fall back to Claude.
pub fn provider_by_name(name: &str) -> &'static dyn AgentProvider {
    match name.trim().to_lowercase().as_str() {
        "codex" => &*CODEX,
        "gemini" => &*GEMINI,
        "claude" => &*CLAUDE,
        other => {
            if !other.is_empty() {
                tracing::debug!("Unknown provider {other:?}, falling back to claude");
            }
            &*CLAUDE
        }
    }
}

/// Detect a provider from a pane's current command.
///
/// Matches the command basename case-insensitively, allowing versioned
/// or wrapped variants like `claude-wrapper` or `codex-v2`.
pub fn detect_provider(pane_current_command: &str) -> Option<&'static str> {
    let basename = pane_current_command
        .trim()
        .rsplit('/')
        .next()?
        .to_lowercase();
    available_providers()
        .into_iter()
        .find(|name| basename == *name || basename.starts_with(&format!("{name}-")))
}
