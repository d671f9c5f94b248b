//! Application configuration loaded from environment variables.
//!
//! The bot reads everything from the environment (`TELEGRAM_BOT_TOKEN`,
//! `ALLOWED_USERS`, tmux and polling settings) once at startup. The hook
//! subcommand must stay constructible without the bot token — hooks run
//! inside tmux panes where bot env vars are not set — so config-directory
//! resolution lives in free functions that `hook` uses directly.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Environment variable naming the config directory (default `~/.ccbot`).
pub const CCBOT_DIR_ENV: &str = "CCBOT_DIR";

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing or empty.
    #[error("{var} environment variable is required")]
    MissingVar {
        /// Name of the missing variable.
        var: &'static str,
    },

    /// An environment variable holds a value that cannot be parsed.
    #[error("invalid {var}: {reason}")]
    InvalidVar {
        /// Name of the offending variable.
        var: &'static str,
        /// Human-readable description of the parse failure.
        reason: String,
    },
}

/// Resolve the config directory from `CCBOT_DIR` or default `~/.ccbot`.
pub fn ccbot_dir() -> PathBuf {
    match std::env::var(CCBOT_DIR_ENV) {
        Ok(raw) if !raw.is_empty() => PathBuf::from(raw),
        _ => dirs::home_dir().unwrap_or_default().join(".ccbot"),
    }
}

/// Resolve the tmux session name from `TMUX_SESSION_NAME` or default `ccbot`.
pub fn tmux_session_name() -> String {
    std::env::var("TMUX_SESSION_NAME").unwrap_or_else(|_| "ccbot".to_string())
}

/// Per-provider launch command override (`CCBOT_CLAUDE_COMMAND` etc.).
///
/// Returns `None` when the variable is unset or empty.
pub fn provider_command_override(provider_name: &str) -> Option<String> {
    let var = format!("CCBOT_{}_COMMAND", provider_name.to_uppercase());
    match std::env::var(var) {
        Ok(v) if !v.is_empty() => Some(v),
        _ => None,
    }
}

/// Application configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Telegram bot API token. Never logged.
    pub telegram_bot_token: String,
    /// Telegram user IDs allowed to talk to the bot.
    pub allowed_users: HashSet<u64>,
    /// Name of the tmux session hosting all agent windows.
    pub tmux_session_name: String,
    /// Directory holding all state files (`~/.ccbot` by default).
    pub config_dir: PathBuf,
    /// Session monitor poll interval.
    pub monitor_poll_interval: Duration,
    /// Minutes before a `done` topic is auto-closed (0 disables).
    pub autoclose_done_minutes: u64,
    /// Minutes before a `dead` topic is auto-closed (0 disables).
    pub autoclose_dead_minutes: u64,
    /// Default provider name (`claude` unless overridden).
    pub provider_name: String,
    /// Optional single Telegram group this instance is restricted to.
    pub group_id: Option<i64>,
    /// Claude Code transcript root (`~/.claude/projects`).
    pub claude_projects_path: PathBuf,
}

impl Config {
    /// Load configuration from the environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingVar`] when `TELEGRAM_BOT_TOKEN` or
    /// `ALLOWED_USERS` is absent, and [`ConfigError::InvalidVar`] when a
    /// numeric variable fails to parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let telegram_bot_token = std::env::var("TELEGRAM_BOT_TOKEN")
            .ok()
            .filter(|t| !t.is_empty())
            .ok_or(ConfigError::MissingVar {
                var: "TELEGRAM_BOT_TOKEN",
            })?;

        let allowed_raw =
            std::env::var("ALLOWED_USERS")
                .ok()
                .filter(|v| !v.is_empty())
                .ok_or(ConfigError::MissingVar {
                    var: "ALLOWED_USERS",
                })?;
        let allowed_users = parse_allowed_users(&allowed_raw)?;

        let monitor_poll_interval = parse_env_f64("MONITOR_POLL_INTERVAL", 2.0)?;

        Ok(Self {
            telegram_bot_token,
            allowed_users,
            tmux_session_name: tmux_session_name(),
            config_dir: ccbot_dir(),
            monitor_poll_interval: Duration::from_secs_f64(monitor_poll_interval),
            autoclose_done_minutes: parse_env_u64("AUTOCLOSE_DONE_MINUTES", 30)?,
            autoclose_dead_minutes: parse_env_u64("AUTOCLOSE_DEAD_MINUTES", 10)?,
            provider_name: std::env::var("CCBOT_PROVIDER").unwrap_or_else(|_| "claude".to_string()),
            group_id: parse_env_opt_i64("CCBOT_GROUP_ID")?,
            claude_projects_path: dirs::home_dir()
                .unwrap_or_default()
                .join(".claude")
                .join("projects"),
        })
    }

    /// Check if a user is in the allow-list.
    pub fn is_user_allowed(&self, user_id: u64) -> bool {
        self.allowed_users.contains(&user_id)
    }

    /// Path of the bot's own persisted state.
    pub fn state_file(&self) -> PathBuf {
        self.config_dir.join("state.json")
    }

    /// Path of the hook ↔ monitor shared session map.
    pub fn session_map_file(&self) -> PathBuf {
        self.config_dir.join("session_map.json")
    }

    /// Path of the monitor's transcript-offset state.
    pub fn monitor_state_file(&self) -> PathBuf {
        self.config_dir.join("monitor_state.json")
    }

    /// Path of the append-only hook event log.
    pub fn events_file(&self) -> PathBuf {
        self.config_dir.join("events.jsonl")
    }
}

fn parse_allowed_users(raw: &str) -> Result<HashSet<u64>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u64>().map_err(|e| ConfigError::InvalidVar {
                var: "ALLOWED_USERS",
                reason: format!("{s:?}: {e}; expected comma-separated Telegram user IDs"),
            })
        })
        .collect()
}

fn parse_env_f64(var: &'static str, default: f64) -> Result<f64, ConfigError> {
    match std::env::var(var) {
        Ok(v) if !v.is_empty() => v.parse::<f64>().map_err(|e| ConfigError::InvalidVar {
            var,
            reason: e.to_string(),
        }),
        _ => Ok(default),
    }
}

fn parse_env_u64(var: &'static str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(var) {
        Ok(v) if !v.is_empty() => v.parse::<u64>().map_err(|e| ConfigError::InvalidVar {
            var,
            reason: e.to_string(),
        }),
        _ => Ok(default),
    }
}

fn parse_env_opt_i64(var: &'static str) -> Result<Option<i64>, ConfigError> {
    match std::env::var(var) {
        Ok(v) if !v.is_empty() => v
            .parse::<i64>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidVar {
                var,
                reason: e.to_string(),
            }),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_allowed_users_valid() {
        let users = parse_allowed_users("123, 456,789").unwrap();
        assert_eq!(users.len(), 3);
        assert!(users.contains(&123));
        assert!(users.contains(&456));
        assert!(users.contains(&789));
    }

    #[test]
    fn test_parse_allowed_users_trailing_comma() {
        let users = parse_allowed_users("123,").unwrap();
        assert_eq!(users.len(), 1);
    }

    #[test]
    fn test_parse_allowed_users_non_numeric() {
        let err = parse_allowed_users("123,abc").unwrap_err();
        assert!(err.to_string().contains("ALLOWED_USERS"));
    }

    #[test]
    fn test_provider_command_override_unset() {
        assert_eq!(provider_command_override("nonexistent-provider"), None);
    }
}
