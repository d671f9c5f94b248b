//! Interactive-UI mode — mirrors a terminal selection UI into an editable
//! Telegram message with a key-pad keyboard.
//!
//! When the status poller (or a Notification hook) detects an interactive
//! region in the pane, the topic enters interactive mode: the extracted
//! region is posted as a code block with arrow/Enter/Space/Tab/Esc/Refresh
//! buttons. Button taps inject raw keys into the pane and re-render the
//! region into the same message.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use teloxide::prelude::*;
use teloxide::types::{ChatId, InlineKeyboardButton, InlineKeyboardMarkup, MessageId, ParseMode};

use ccbot_core::ScreenBuffer;

use crate::app::App;
use crate::format::code_block;
use crate::queue::to_thread_id;

/// Delay between a key injection and the refresh capture, giving the CLI
/// time to redraw.
pub const KEY_REFRESH_DELAY: Duration = Duration::from_millis(500);

/// One topic currently mirroring an interactive UI.
#[derive(Debug, Clone)]
struct InteractiveUi {
    window_id: String,
    message: Option<(i64, MessageId)>,
    last_content: String,
}

/// Registry of topics in interactive mode, keyed by (user, thread).
#[derive(Default)]
pub struct InteractiveRegistry {
    sessions: Mutex<HashMap<(u64, i32), InteractiveUi>>,
}

impl InteractiveRegistry {
    /// Window the user is interacting with in this topic, if any.
    pub fn window(&self, user_id: u64, thread_id: i32) -> Option<String> {
        self.sessions
            .lock()
            .expect("interactive lock poisoned")
            .get(&(user_id, thread_id))
            .map(|ui| ui.window_id.clone())
    }

    /// Enter interactive mode before rendering, so the status poller does
    /// not race the first render.
    pub fn enter(&self, user_id: u64, thread_id: i32, window_id: &str) {
        self.sessions
            .lock()
            .expect("interactive lock poisoned")
            .insert(
                (user_id, thread_id),
                InteractiveUi {
                    window_id: window_id.to_string(),
                    message: None,
                    last_content: String::new(),
                },
            );
    }

    pub fn clear(&self, user_id: u64, thread_id: i32) -> Option<(i64, MessageId)> {
        self.sessions
            .lock()
            .expect("interactive lock poisoned")
            .remove(&(user_id, thread_id))
            .and_then(|ui| ui.message)
    }

    fn record_render(
        &self,
        user_id: u64,
        thread_id: i32,
        message: (i64, MessageId),
        content: &str,
    ) {
        if let Some(ui) = self
            .sessions
            .lock()
            .expect("interactive lock poisoned")
            .get_mut(&(user_id, thread_id))
        {
            ui.message = Some(message);
            ui.last_content = content.to_string();
        }
    }

    fn state(&self, user_id: u64, thread_id: i32) -> Option<(Option<(i64, MessageId)>, String)> {
        self.sessions
            .lock()
            .expect("interactive lock poisoned")
            .get(&(user_id, thread_id))
            .map(|ui| (ui.message, ui.last_content.clone()))
    }
}

/// Arrow/confirm key-pad attached to the interactive message.
fn keypad(window_id: &str) -> InlineKeyboardMarkup {
    let key = |label: &str, code: &str| {
        InlineKeyboardButton::callback(label.to_string(), format!("ik:{code}:{window_id}"))
    };
    InlineKeyboardMarkup::new(vec![
        vec![key("↑", "u"), key("↓", "d"), key("⏎", "e")],
        vec![key("␣", "s"), key("⇥", "t"), key("Esc", "x"), key("↻", "r")],
    ])
}

/// Capture the pane and extract the current interactive region.
async fn extract_ui(app: &App, window_id: &str) -> Option<String> {
    let pane_text = app.tmux.capture_pane(window_id).await.ok()??;
    let provider = app.provider_for_window(window_id);

    let mut buffer = ScreenBuffer::default();
    buffer.feed(&pane_text);
    let rendered = buffer.display().join("\n");

    ccbot_core::terminal_parser::extract_interactive_content(&rendered, provider.ui_patterns())
        .map(|ui| ui.content)
}

/// Render (or refresh) the interactive UI message for a topic.
///
/// Returns false when no interactive region is visible — the caller
/// should leave (or not enter) interactive mode.
pub async fn render_interactive_ui(
    bot: &Bot,
    app: &Arc<App>,
    user_id: u64,
    window_id: &str,
    thread_id: i32,
) -> bool {
    let Some(content) = extract_ui(app, window_id).await else {
        return false;
    };

    let Some((message, last_content)) = app.interactive.state(user_id, thread_id) else {
        return false;
    };
    if content == last_content {
        return true;
    }

    let chat_id = app.session_manager.resolve_chat_id(user_id, thread_id);
    let text = code_block(&content);

    match message {
        Some((message_chat, message_id)) => {
            let result = bot
                .edit_message_text(ChatId(message_chat), message_id, text)
                .parse_mode(ParseMode::MarkdownV2)
                .reply_markup(keypad(window_id))
                .await;
            match result {
                Ok(_) => {
                    app.interactive
                        .record_render(user_id, thread_id, (message_chat, message_id), &content);
                }
                Err(e) => tracing::debug!("Interactive UI edit failed: {e}"),
            }
        }
        None => {
            let result = bot
                .send_message(ChatId(chat_id), text)
                .message_thread_id(to_thread_id(thread_id))
                .parse_mode(ParseMode::MarkdownV2)
                .reply_markup(keypad(window_id))
                .await;
            match result {
                Ok(sent) => {
                    app.interactive
                        .record_render(user_id, thread_id, (chat_id, sent.id), &content);
                }
                Err(e) => tracing::debug!("Interactive UI send failed: {e}"),
            }
        }
    }
    true
}

/// Delete the interactive message and leave interactive mode.
pub async fn clear_interactive_message(bot: &Bot, app: &App, user_id: u64, thread_id: i32) {
    if let Some((chat_id, message_id)) = app.interactive.clear(user_id, thread_id)
        && let Err(e) = bot.delete_message(ChatId(chat_id), message_id).await
    {
        tracing::debug!("Failed to delete interactive message: {e}");
    }
}

/// Translate a keypad code to the tmux key name.
pub fn key_for_code(code: &str) -> Option<&'static str> {
    match code {
        "u" => Some("Up"),
        "d" => Some("Down"),
        "e" => Some("Enter"),
        "s" => Some("Space"),
        "t" => Some("Tab"),
        "x" => Some("Escape"),
        _ => None,
    }
}

/// Handle a keypad tap: inject the key into the window's active pane,
/// wait for the redraw, and refresh the UI message. `"r"` refreshes only.
pub async fn handle_interactive_key(
    bot: &Bot,
    app: &Arc<App>,
    user_id: u64,
    window_id: &str,
    thread_id: i32,
    code: &str,
) {
    if let Some(key) = key_for_code(code) {
        let panes = app.tmux.list_panes(window_id).await.unwrap_or_default();
        let Some(pane) = panes.iter().find(|p| p.active).or(panes.first()) else {
            return;
        };
        if let Err(e) = app
            .tmux
            .send_keys_to_pane(&pane.pane_id, key, false, false)
            .await
        {
            tracing::debug!("Failed to send key {key} to {window_id}: {e}");
            return;
        }
    } else if code != "r" {
        return;
    }

    tokio::time::sleep(KEY_REFRESH_DELAY).await;
    if !render_interactive_ui(bot, app, user_id, window_id, thread_id).await {
        // The UI closed in response to the key (Enter/Esc).
        clear_interactive_message(bot, app, user_id, thread_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_enter_and_clear() {
        let registry = InteractiveRegistry::default();
        assert_eq!(registry.window(1, 42), None);

        registry.enter(1, 42, "@5");
        assert_eq!(registry.window(1, 42).as_deref(), Some("@5"));
        // A different topic is independent.
        assert_eq!(registry.window(1, 43), None);

        assert_eq!(registry.clear(1, 42), None); // No message rendered yet.
        assert_eq!(registry.window(1, 42), None);
    }

    #[test]
    fn test_registry_records_message() {
        let registry = InteractiveRegistry::default();
        registry.enter(1, 42, "@5");
        registry.record_render(1, 42, (-100, MessageId(7)), "content");

        let (message, content) = registry.state(1, 42).unwrap();
        assert_eq!(message, Some((-100, MessageId(7))));
        assert_eq!(content, "content");
        assert_eq!(registry.clear(1, 42), Some((-100, MessageId(7))));
    }

    #[test]
    fn test_key_mapping() {
        assert_eq!(key_for_code("u"), Some("Up"));
        assert_eq!(key_for_code("x"), Some("Escape"));
        assert_eq!(key_for_code("r"), None);
        assert_eq!(key_for_code("z"), None);
    }
}
