//! Discovered provider-command forwarding.
//!
//! Provider CLIs expose slash commands (builtins, skills, custom
//! commands). Their names are sanitized into Telegram-compatible command
//! names (`committing-code` → `committing_code`, `spec:work` →
//! `spec_work`); an unknown `/command` in a bound topic is resolved back
//! to its original form and typed into the window.

use std::collections::HashMap;

use ccbot_core::provider::{AgentProvider, DiscoveredCommand};

/// Maximum length of a Telegram bot command name.
const TELEGRAM_COMMAND_MAX: usize = 32;

/// Commands the bot itself owns; discovered names may not shadow them.
const BOT_NATIVE_COMMANDS: [&str; 4] = ["new", "sessions", "resume", "history"];

/// Sanitize a provider command name for Telegram: lowercase `[a-z0-9_]`,
/// capped length, leading slash dropped.
pub fn sanitize_command_name(name: &str) -> String {
    name.trim_start_matches('/')
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                c
            } else {
                '_'
            }
        })
        .take(TELEGRAM_COMMAND_MAX)
        .collect()
}

/// Build the sanitized → original lookup for a window's commands.
///
/// First discovery wins on collision; bot-native names are excluded.
pub fn build_command_map(commands: &[DiscoveredCommand]) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for command in commands {
        let sanitized = sanitize_command_name(&command.name);
        if sanitized.is_empty() || BOT_NATIVE_COMMANDS.contains(&sanitized.as_str()) {
            continue;
        }
        map.entry(sanitized).or_insert_with(|| command.name.clone());
    }
    map
}

/// Resolve a `/command` message to the original provider command, if the
/// provider knows it for this working directory.
pub fn resolve_provider_command(
    provider: &'static dyn AgentProvider,
    cwd: &str,
    text: &str,
) -> Option<String> {
    let without_slash = text.strip_prefix('/')?;
    // First word only; the rest is arguments passed through.
    let (name, args) = match without_slash.split_once(char::is_whitespace) {
        Some((name, args)) => (name, args.trim()),
        None => (without_slash, ""),
    };
    // Strip a possible @botname suffix.
    let name = name.split('@').next().unwrap_or(name);

    let discovered = provider.discover_commands(std::path::Path::new(cwd));
    let map = build_command_map(&discovered);
    let original = map.get(&sanitize_command_name(name))?;

    let command = original.strip_prefix('/').unwrap_or(original);
    if args.is_empty() {
        Some(format!("/{command}"))
    } else {
        Some(format!("/{command} {args}"))
    }
}
