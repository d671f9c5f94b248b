//! Directory browser — pick a working directory and provider for a new
//! window.
//!
//! Telegram callback data is capped at 64 bytes, far too small for paths,
//! so the browser keeps per-user state (current directory + listed
//! entries) and callbacks carry indices into it. Starred and
//! recently-used directories get shortcut rows.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use teloxide::prelude::*;
use teloxide::types::{ChatId, InlineKeyboardButton, InlineKeyboardMarkup};

use ccbot_core::provider::available_providers;

use crate::app::App;
use crate::format::truncate;
use crate::queue::to_thread_id;

/// Subdirectories listed per page.
const MAX_DIR_ENTRIES: usize = 12;

/// A user's in-flight browser session.
#[derive(Debug, Clone)]
pub struct BrowserState {
    pub current: PathBuf,
    /// Listed entries, indexed by the `dir:o:N` callbacks.
    pub entries: Vec<PathBuf>,
    /// Shortcut rows, indexed by the `dir:f:N` callbacks.
    pub shortcuts: Vec<PathBuf>,
    /// Where the picked window will be bound.
    pub thread_id: i32,
    /// Chosen directory, set before provider selection.
    pub selected: Option<PathBuf>,
}

/// List immediate subdirectories, hidden ones excluded, sorted by name.
fn list_subdirs(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| !n.starts_with('.'))
        })
        .collect();
    dirs.sort();
    dirs.truncate(MAX_DIR_ENTRIES);
    dirs
}

fn dir_label(path: &Path) -> String {
    truncate(
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("(root)"),
        28,
    )
}

/// Build the browser keyboard for a state and remember its indices.
fn build_keyboard(state: &BrowserState, starred: &[String]) -> InlineKeyboardMarkup {
    let mut rows: Vec<Vec<InlineKeyboardButton>> = Vec::new();

    for (i, shortcut) in state.shortcuts.iter().enumerate() {
        let star = if starred.iter().any(|s| Path::new(s) == shortcut) {
            "⭐"
        } else {
            "🕘"
        };
        rows.push(vec![InlineKeyboardButton::callback(
            format!("{star} {}", truncate(&shortcut.to_string_lossy(), 40)),
            format!("dir:f:{i}"),
        )]);
    }

    for (i, entry) in state.entries.iter().enumerate() {
        rows.push(vec![InlineKeyboardButton::callback(
            format!("📁 {}", dir_label(entry)),
            format!("dir:o:{i}"),
        )]);
    }

    rows.push(vec![
        InlineKeyboardButton::callback("⬆ Up", "dir:up".to_string()),
        InlineKeyboardButton::callback("⭐ Star", "dir:star".to_string()),
        InlineKeyboardButton::callback("✓ Use this", "dir:sel".to_string()),
    ]);
    InlineKeyboardMarkup::new(rows)
}

/// Open (or re-render) the directory browser in a topic.
pub async fn open_browser(
    bot: &Bot,
    app: &Arc<App>,
    user_id: u64,
    thread_id: i32,
    start_dir: Option<PathBuf>,
) {
    let favorites = app.session_manager.get_dir_favorites(user_id);
    let current = start_dir
        .or_else(|| {
            app.browser
                .lock()
                .expect("browser lock poisoned")
                .get(&user_id)
                .map(|s| s.current.clone())
        })
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("/"));

    let mut shortcuts: Vec<PathBuf> = favorites.starred.iter().map(PathBuf::from).collect();
    for mru in &favorites.mru {
        let path = PathBuf::from(mru);
        if !shortcuts.contains(&path) {
            shortcuts.push(path);
        }
        if shortcuts.len() >= 6 {
            break;
        }
    }

    let state = BrowserState {
        entries: list_subdirs(&current),
        shortcuts,
        current: current.clone(),
        thread_id,
        selected: None,
    };
    let keyboard = build_keyboard(&state, &favorites.starred);
    app.browser
        .lock()
        .expect("browser lock poisoned")
        .insert(user_id, state);

    let chat_id = app.session_manager.resolve_chat_id(user_id, thread_id);
    let text = format!("📂 Pick a working directory\n{}", current.display());
    let result = bot
        .send_message(ChatId(chat_id), text)
        .message_thread_id(to_thread_id(thread_id))
        .reply_markup(keyboard)
        .await;
    if let Err(e) = result {
        tracing::warn!("Failed to open directory browser: {e}");
    }
}

/// Provider picker shown after a directory is chosen.
fn provider_keyboard() -> InlineKeyboardMarkup {
    let row: Vec<_> = available_providers()
        .into_iter()
        .map(|name| {
            let mut label = name.to_string();
            if let Some(first) = label.get_mut(0..1) {
                first.make_ascii_uppercase();
            }
            InlineKeyboardButton::callback(label, format!("prov:{name}"))
        })
        .collect();
    InlineKeyboardMarkup::new(vec![row])
}

/// Handle a `dir:*` callback. Returns the new text and keyboard for the
/// edited browser message.
pub fn handle_dir_callback(
    app: &Arc<App>,
    user_id: u64,
    data: &str,
) -> Option<(String, InlineKeyboardMarkup)> {
    let mut browser = app.browser.lock().expect("browser lock poisoned");
    let state = browser.get_mut(&user_id)?;

    match data.split(':').collect::<Vec<_>>().as_slice() {
        ["dir", "o", idx] => {
            let target = state.entries.get(idx.parse::<usize>().ok()?)?.clone();
            state.current = target;
            state.entries = list_subdirs(&state.current);
        }
        ["dir", "f", idx] => {
            let target = state.shortcuts.get(idx.parse::<usize>().ok()?)?.clone();
            state.current = target;
            state.entries = list_subdirs(&state.current);
        }
        ["dir", "up"] => {
            if let Some(parent) = state.current.parent() {
                state.current = parent.to_path_buf();
                state.entries = list_subdirs(&state.current);
            }
        }
        ["dir", "star"] => {
            let path = state.current.to_string_lossy().into_owned();
            drop(browser);
            app.session_manager.toggle_star_dir(user_id, &path);
            browser = app.browser.lock().expect("browser lock poisoned");
        }
        ["dir", "sel"] => {
            let selected = state.current.clone();
            state.selected = Some(selected.clone());
            return Some((
                format!("📂 {}\n\nPick a provider:", selected.display()),
                provider_keyboard(),
            ));
        }
        _ => return None,
    }

    let state = browser.get(&user_id)?;
    let starred = app.session_manager.get_dir_favorites(user_id).starred;
    Some((
        format!("📂 Pick a working directory\n{}", state.current.display()),
        build_keyboard(state, &starred),
    ))
}

/// Finish the flow: create the window, bind it, replay pending text.
pub async fn handle_provider_pick(
    bot: &Bot,
    app: &Arc<App>,
    user_id: u64,
    provider_name: &str,
) -> Option<String> {
    let (cwd, thread_id) = {
        let browser = app.browser.lock().expect("browser lock poisoned");
        let state = browser.get(&user_id)?;
        (state.selected.clone()?, state.thread_id)
    };

    let provider = ccbot_core::provider::provider_by_name(provider_name);
    let launch_command = provider.capabilities().launch_command.clone();
    let window_name = cwd
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("session")
        .to_string();

    let window = match app
        .tmux
        .create_window(&cwd, Some(&window_name), &launch_command, "", true)
        .await
    {
        Ok(window) => window,
        Err(e) => return Some(format!("❌ Failed to create window: {e}")),
    };

    let cwd_str = cwd.to_string_lossy().into_owned();
    app.session_manager
        .bind_thread(user_id, thread_id, &window.window_id, Some(&window.window_name));
    app.session_manager
        .upsert_window_state(&window.window_id, &window.window_name, &cwd_str);
    app.session_manager
        .set_window_provider(&window.window_id, provider.capabilities().name);
    app.session_manager.record_mru_dir(user_id, &cwd_str);
    app.browser.lock().expect("browser lock poisoned").remove(&user_id);

    // Replay the message that opened the browser, if any.
    let pending = app
        .pending_texts
        .lock()
        .expect("pending texts lock poisoned")
        .remove(&(user_id, thread_id));
    if let Some(text) = pending {
        // Give the agent a moment to accept input.
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        if let Err(e) = app.tmux.send_keys(&window.window_id, &text, true, true).await {
            tracing::warn!("Failed to replay pending text: {e}");
        }
    }

    let chat_id = app.session_manager.resolve_chat_id(user_id, thread_id);
    crate::topic::update_topic_emoji(
        bot,
        &app.poller.topic_emojis,
        chat_id,
        thread_id,
        crate::topic::TopicState::Active,
    )
    .await;

    Some(format!(
        "✳ Started {} in {}",
        provider.capabilities().name,
        cwd.display()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_subdirs_filters_hidden_and_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("visible")).unwrap();
        std::fs::create_dir(dir.path().join(".hidden")).unwrap();
        std::fs::write(dir.path().join("file.txt"), "x").unwrap();

        let subdirs = list_subdirs(dir.path());
        assert_eq!(subdirs.len(), 1);
        assert!(subdirs[0].ends_with("visible"));
    }

    #[test]
    fn test_list_subdirs_sorted_and_bounded() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..20 {
            std::fs::create_dir(dir.path().join(format!("d{i:02}"))).unwrap();
        }
        let subdirs = list_subdirs(dir.path());
        assert_eq!(subdirs.len(), MAX_DIR_ENTRIES);
        assert!(subdirs[0].ends_with("d00"));
    }

    #[test]
    fn test_provider_keyboard_covers_registry() {
        let keyboard = provider_keyboard();
        assert_eq!(keyboard.inline_keyboard[0].len(), available_providers().len());
    }
}
