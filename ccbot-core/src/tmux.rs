//! tmux adapter — the only side channel to the tmux server.
//!
//! Thin wrapper over the `tmux` CLI via `tokio::process`. Windows are
//! addressed by their server-assigned IDs (`@12`), which stay stable for
//! the life of the server. Dead windows, transient capture failures, and
//! kill-after-death are all non-fatal: callers get `Ok(None)` or a clean
//! no-op rather than an error.

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

/// Errors from tmux subprocess calls.
#[derive(Debug, Error)]
pub enum TmuxError {
    /// The tmux binary could not be spawned at all.
    #[error("failed to run tmux: {0}")]
    Spawn(#[from] std::io::Error),

    /// tmux exited non-zero.
    #[error("tmux {command} failed: {stderr}")]
    CommandFailed {
        /// The tmux subcommand that failed.
        command: String,
        /// Captured stderr, trimmed.
        stderr: String,
    },
}

/// One live tmux window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TmuxWindow {
    pub window_id: String,
    pub window_name: String,
    pub cwd: String,
    pub pane_current_command: String,
}

/// One pane of a window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TmuxPaneInfo {
    pub pane_id: String,
    pub active: bool,
}

/// The window operations the core needs, behind a trait so the monitor
/// and poller can be exercised with fakes.
#[async_trait]
pub trait WindowControl: Send + Sync {
    async fn list_windows(&self) -> Result<Vec<TmuxWindow>, TmuxError>;

    /// `Ok(None)` when the window no longer exists.
    async fn find_window_by_id(&self, window_id: &str) -> Result<Option<TmuxWindow>, TmuxError>;

    /// Create a window running a shell in `cwd` and type the agent launch
    /// command into it (so the shell survives agent exit). Returns the new
    /// window.
    async fn create_window(
        &self,
        cwd: &Path,
        window_name: Option<&str>,
        launch_command: &str,
        agent_args: &str,
        start_agent: bool,
    ) -> Result<TmuxWindow, TmuxError>;

    /// Type text into a window's active pane.
    async fn send_keys(
        &self,
        window_id: &str,
        text: &str,
        enter: bool,
        literal: bool,
    ) -> Result<(), TmuxError>;

    /// Inject a key (`Up`, `Down`, `Enter`, `Escape`, `Space`, `Tab`) into
    /// a specific pane.
    async fn send_keys_to_pane(
        &self,
        pane_id: &str,
        key: &str,
        enter: bool,
        literal: bool,
    ) -> Result<(), TmuxError>;

    /// Raw pane capture with escape sequences (`-e`), or `None` on a
    /// transient failure.
    async fn capture_pane(&self, window_id: &str) -> Result<Option<String>, TmuxError>;

    async fn capture_pane_by_id(&self, pane_id: &str) -> Result<Option<String>, TmuxError>;

    /// OSC-set pane title (empty when unset).
    async fn get_pane_title(&self, window_id: &str) -> Result<String, TmuxError>;

    async fn list_panes(&self, window_id: &str) -> Result<Vec<TmuxPaneInfo>, TmuxError>;

    /// Idempotent: killing an already-dead window is Ok.
    async fn kill_window(&self, window_id: &str) -> Result<(), TmuxError>;
}

/// Production [`WindowControl`] over the `tmux` binary.
pub struct TmuxAdapter {
    session_name: String,
}

const LIST_WINDOWS_FORMAT: &str =
    "#{window_id}\t#{window_name}\t#{pane_current_path}\t#{pane_current_command}";

impl TmuxAdapter {
    pub fn new(session_name: impl Into<String>) -> Self {
        Self {
            session_name: session_name.into(),
        }
    }

    /// Run one tmux command, returning trimmed stdout.
    async fn run(&self, args: &[&str]) -> Result<String, TmuxError> {
        let output = Command::new("tmux").args(args).output().await?;
        if !output.status.success() {
            return Err(TmuxError::CommandFailed {
                command: args.first().unwrap_or(&"").to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .trim_end_matches('\n')
            .to_string())
    }

    /// Ensure the bot's tmux session exists, creating it detached if not.
    pub async fn get_or_create_session(&self) -> Result<(), TmuxError> {
        let target = format!("={}", self.session_name);
        if self.run(&["has-session", "-t", &target]).await.is_ok() {
            return Ok(());
        }
        self.run(&[
            "new-session",
            "-d",
            "-s",
            &self.session_name,
            "-n",
            "__main__",
        ])
        .await?;
        tracing::info!("Created tmux session '{}'", self.session_name);
        Ok(())
    }

    /// Recover from a lost server: recreate the session if it is gone.
    /// Called after connection-level failures; errors here are final.
    pub async fn reset_server(&self) -> Result<(), TmuxError> {
        tracing::warn!("Resetting tmux server connection");
        self.get_or_create_session().await
    }

    /// Whether the tmux binary is available at all (startup check).
    pub async fn tmux_available() -> bool {
        Command::new("tmux")
            .arg("-V")
            .output()
            .await
            .map(|o| o.status.success())
            .is_ok_and(|ok| ok)
    }

    fn parse_window_line(line: &str) -> Option<TmuxWindow> {
        let mut parts = line.splitn(4, '\t');
        Some(TmuxWindow {
            window_id: parts.next()?.to_string(),
            window_name: parts.next()?.to_string(),
            cwd: parts.next()?.to_string(),
            pane_current_command: parts.next().unwrap_or("").to_string(),
        })
    }
}

#[async_trait]
impl WindowControl for TmuxAdapter {
    async fn list_windows(&self) -> Result<Vec<TmuxWindow>, TmuxError> {
        let target = format!("{}:", self.session_name);
        let output = self
            .run(&["list-windows", "-t", &target, "-F", LIST_WINDOWS_FORMAT])
            .await?;
        Ok(output
            .lines()
            .filter_map(TmuxAdapter::parse_window_line)
            .filter(|w| w.window_name != "__main__")
            .collect())
    }

    async fn find_window_by_id(&self, window_id: &str) -> Result<Option<TmuxWindow>, TmuxError> {
        let windows = self.list_windows().await?;
        Ok(windows.into_iter().find(|w| w.window_id == window_id))
    }

    async fn create_window(
        &self,
        cwd: &Path,
        window_name: Option<&str>,
        launch_command: &str,
        agent_args: &str,
        start_agent: bool,
    ) -> Result<TmuxWindow, TmuxError> {
        let target = format!("{}:", self.session_name);
        let cwd_str = cwd.to_string_lossy();
        let mut args: Vec<&str> = vec![
            "new-window",
            "-d",
            "-t",
            &target,
            "-c",
            &cwd_str,
            "-P",
            "-F",
            LIST_WINDOWS_FORMAT,
        ];
        if let Some(name) = window_name {
            args.push("-n");
            args.push(name);
        }
        let output = self.run(&args).await?;
        let window = TmuxAdapter::parse_window_line(&output).ok_or_else(|| {
            TmuxError::CommandFailed {
                command: "new-window".to_string(),
                stderr: format!("unexpected output: {output}"),
            }
        })?;

        if start_agent {
            let command = if agent_args.is_empty() {
                launch_command.to_string()
            } else {
                format!("{launch_command} {agent_args}")
            };
            self.send_keys(&window.window_id, &command, true, true)
                .await?;
        }
        Ok(window)
    }

    async fn send_keys(
        &self,
        window_id: &str,
        text: &str,
        enter: bool,
        literal: bool,
    ) -> Result<(), TmuxError> {
        if literal {
            self.run(&["send-keys", "-t", window_id, "-l", "--", text])
                .await?;
        } else {
            self.run(&["send-keys", "-t", window_id, text]).await?;
        }
        if enter {
            self.run(&["send-keys", "-t", window_id, "Enter"]).await?;
        }
        Ok(())
    }

    async fn send_keys_to_pane(
        &self,
        pane_id: &str,
        key: &str,
        enter: bool,
        literal: bool,
    ) -> Result<(), TmuxError> {
        if literal {
            self.run(&["send-keys", "-t", pane_id, "-l", "--", key])
                .await?;
        } else {
            self.run(&["send-keys", "-t", pane_id, key]).await?;
        }
        if enter {
            self.run(&["send-keys", "-t", pane_id, "Enter"]).await?;
        }
        Ok(())
    }

    async fn capture_pane(&self, window_id: &str) -> Result<Option<String>, TmuxError> {
        match self.run(&["capture-pane", "-p", "-e", "-t", window_id]).await {
            Ok(text) => Ok(Some(text)),
            Err(e) => {
                tracing::debug!("capture-pane failed for {window_id}: {e}");
                Ok(None)
            }
        }
    }

    async fn capture_pane_by_id(&self, pane_id: &str) -> Result<Option<String>, TmuxError> {
        match self.run(&["capture-pane", "-p", "-e", "-t", pane_id]).await {
            Ok(text) => Ok(Some(text)),
            Err(e) => {
                tracing::debug!("capture-pane failed for pane {pane_id}: {e}");
                Ok(None)
            }
        }
    }

    async fn get_pane_title(&self, window_id: &str) -> Result<String, TmuxError> {
        self.run(&["display-message", "-p", "-t", window_id, "#{pane_title}"])
            .await
    }

    async fn list_panes(&self, window_id: &str) -> Result<Vec<TmuxPaneInfo>, TmuxError> {
        let output = self
            .run(&[
                "list-panes",
                "-t",
                window_id,
                "-F",
                "#{pane_id}\t#{?pane_active,1,0}",
            ])
            .await?;
        Ok(output
            .lines()
            .filter_map(|line| {
                let (pane_id, active) = line.split_once('\t')?;
                Some(TmuxPaneInfo {
                    pane_id: pane_id.to_string(),
                    active: active == "1",
                })
            })
            .collect())
    }

    async fn kill_window(&self, window_id: &str) -> Result<(), TmuxError> {
        match self.run(&["kill-window", "-t", window_id]).await {
            Ok(_) => Ok(()),
            // Killing a window that already died is a no-op.
            Err(TmuxError::CommandFailed { stderr, .. }) if stderr.contains("can't find") => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// In-memory [`WindowControl`] fake for tests.
#[cfg(any(test, feature = "test-fakes"))]
#[derive(Default)]
pub struct FakeWindowControl {
    pub windows: std::sync::Mutex<Vec<TmuxWindow>>,
    pub captures: std::sync::Mutex<std::collections::HashMap<String, String>>,
    pub sent_keys: std::sync::Mutex<Vec<(String, String)>>,
    pub killed: std::sync::Mutex<Vec<String>>,
}

#[cfg(any(test, feature = "test-fakes"))]
impl FakeWindowControl {
    pub fn with_windows(windows: Vec<TmuxWindow>) -> Self {
        Self {
            windows: std::sync::Mutex::new(windows),
            ..Self::default()
        }
    }
}

#[cfg(any(test, feature = "test-fakes"))]
#[async_trait]
impl WindowControl for FakeWindowControl {
    async fn list_windows(&self) -> Result<Vec<TmuxWindow>, TmuxError> {
        Ok(self.windows.lock().unwrap().clone())
    }

    async fn find_window_by_id(&self, window_id: &str) -> Result<Option<TmuxWindow>, TmuxError> {
        Ok(self
            .windows
            .lock()
            .unwrap()
            .iter()
            .find(|w| w.window_id == window_id)
            .cloned())
    }

    async fn create_window(
        &self,
        cwd: &Path,
        window_name: Option<&str>,
        _launch_command: &str,
        _agent_args: &str,
        _start_agent: bool,
    ) -> Result<TmuxWindow, TmuxError> {
        let mut windows = self.windows.lock().unwrap();
        let window = TmuxWindow {
            window_id: format!("@{}", windows.len() + 1),
            window_name: window_name.unwrap_or("win").to_string(),
            cwd: cwd.to_string_lossy().into_owned(),
            pane_current_command: "bash".to_string(),
        };
        windows.push(window.clone());
        Ok(window)
    }

    async fn send_keys(
        &self,
        window_id: &str,
        text: &str,
        _enter: bool,
        _literal: bool,
    ) -> Result<(), TmuxError> {
        self.sent_keys
            .lock()
            .unwrap()
            .push((window_id.to_string(), text.to_string()));
        Ok(())
    }

    async fn send_keys_to_pane(
        &self,
        pane_id: &str,
        key: &str,
        _enter: bool,
        _literal: bool,
    ) -> Result<(), TmuxError> {
        self.sent_keys
            .lock()
            .unwrap()
            .push((pane_id.to_string(), key.to_string()));
        Ok(())
    }

    async fn capture_pane(&self, window_id: &str) -> Result<Option<String>, TmuxError> {
        Ok(self.captures.lock().unwrap().get(window_id).cloned())
    }

    async fn capture_pane_by_id(&self, pane_id: &str) -> Result<Option<String>, TmuxError> {
        Ok(self.captures.lock().unwrap().get(pane_id).cloned())
    }

    async fn get_pane_title(&self, _window_id: &str) -> Result<String, TmuxError> {
        Ok(String::new())
    }

    async fn list_panes(&self, window_id: &str) -> Result<Vec<TmuxPaneInfo>, TmuxError> {
        Ok(vec![TmuxPaneInfo {
            pane_id: format!("%{}", window_id.trim_start_matches('@')),
            active: true,
        }])
    }

    async fn kill_window(&self, window_id: &str) -> Result<(), TmuxError> {
        self.windows
            .lock()
            .unwrap()
            .retain(|w| w.window_id != window_id);
        self.killed.lock().unwrap().push(window_id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_window_line() {
        let line = "@3\tmyproj\t/home/u/proj\tclaude";
        let w = TmuxAdapter::parse_window_line(line).unwrap();
        assert_eq!(w.window_id, "@3");
        assert_eq!(w.window_name, "myproj");
        assert_eq!(w.cwd, "/home/u/proj");
        assert_eq!(w.pane_current_command, "claude");
    }

    #[test]
    fn test_parse_window_line_name_with_spaces() {
        let line = "@3\tmy proj\t/home/u/my proj\tbash";
        let w = TmuxAdapter::parse_window_line(line).unwrap();
        assert_eq!(w.window_name, "my proj");
    }

    #[test]
    fn test_parse_window_line_truncated() {
        assert!(TmuxAdapter::parse_window_line("@3\tname").is_none());
    }

    #[tokio::test]
    async fn test_fake_create_and_kill() {
        let fake = FakeWindowControl::default();
        let w = fake
            .create_window(Path::new("/tmp"), Some("t"), "claude", "", true)
            .await
            .unwrap();
        assert!(fake.find_window_by_id(&w.window_id).await.unwrap().is_some());

        fake.kill_window(&w.window_id).await.unwrap();
        assert!(fake.find_window_by_id(&w.window_id).await.unwrap().is_none());
        // Idempotent.
        fake.kill_window(&w.window_id).await.unwrap();
    }
}
