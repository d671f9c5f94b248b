//! Dead-window recovery: the one-shot notification and its keyboard.
//!
//! When a bound window disappears between polls, the topic gets a single
//! recovery message with Resume / Restart / New session / Kill buttons
//! (plus the implicit "send a message to recover" affordance handled by
//! the text dispatcher).

use std::path::Path;
use std::sync::Arc;

use teloxide::prelude::*;
use teloxide::types::{ChatId, InlineKeyboardButton, InlineKeyboardMarkup, ParseMode};

use crate::app::App;
use crate::format::escape_markdown_v2;
use crate::queue::to_thread_id;
use crate::topic::{TopicState, update_topic_emoji};

/// Build the recovery keyboard for a dead window.
pub fn build_recovery_keyboard(window_id: &str) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![
        vec![
            InlineKeyboardButton::callback("▶ Resume", format!("rec:res:{window_id}")),
            InlineKeyboardButton::callback("↻ Restart", format!("rec:rst:{window_id}")),
        ],
        vec![
            InlineKeyboardButton::callback("✳ New session", format!("rec:new:{window_id}")),
            InlineKeyboardButton::callback("✕ Kill", format!("rec:kill:{window_id}")),
        ],
    ])
}

/// Send the one-shot dead-window notification. Returns true when sent.
pub async fn send_dead_window_notification(
    bot: &Bot,
    app: &Arc<App>,
    user_id: u64,
    thread_id: i32,
    window_id: &str,
) -> bool {
    let chat_id = app.session_manager.resolve_chat_id(user_id, thread_id);
    let display = app.session_manager.get_display_name(window_id);
    let cwd = app
        .session_manager
        .get_window_state(window_id)
        .map(|ws| ws.cwd)
        .unwrap_or_default();

    let dir_exists = !cwd.is_empty() && Path::new(&cwd).is_dir();
    let (text, keyboard) = if dir_exists {
        (
            format!(
                "⚠ Session `{}` ended\\.\n📂 `{}`\n\nTap a button or send a message to recover\\.",
                escape_markdown_v2(&display),
                escape_markdown_v2(&cwd),
            ),
            Some(build_recovery_keyboard(window_id)),
        )
    } else {
        (
            format!("⚠ Session `{}` ended\\.", escape_markdown_v2(&display)),
            None,
        )
    };

    let mut request = bot
        .send_message(ChatId(chat_id), text)
        .parse_mode(ParseMode::MarkdownV2)
        .message_thread_id(to_thread_id(thread_id));
    if let Some(keyboard) = keyboard {
        request = request.reply_markup(keyboard);
    }
    match request.await {
        Ok(_) => true,
        Err(e) => {
            tracing::debug!("Failed to send recovery notification: {e}");
            false
        }
    }
}

/// Which recovery action a callback requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    Resume,
    Restart,
    NewSession,
    Kill,
}

impl RecoveryAction {
    pub fn parse(code: &str) -> Option<Self> {
        match code {
            "res" => Some(RecoveryAction::Resume),
            "rst" => Some(RecoveryAction::Restart),
            "new" => Some(RecoveryAction::NewSession),
            "kill" => Some(RecoveryAction::Kill),
            _ => None,
        }
    }
}

/// Execute a recovery action for a dead window's topic.
pub async fn handle_recovery(
    bot: &Bot,
    app: &Arc<App>,
    user_id: u64,
    thread_id: i32,
    window_id: &str,
    action: RecoveryAction,
) {
    let chat_id = app.session_manager.resolve_chat_id(user_id, thread_id);

    match action {
        RecoveryAction::Kill => {
            app.session_manager.unbind_thread(user_id, thread_id);
            app.session_manager.forget_window(window_id);
            app.queue.forget_window(user_id, window_id);
            app.poller.clear_topic_state(user_id, thread_id, window_id);
            crate::topic::close_topic(bot, chat_id, thread_id).await;
        }
        RecoveryAction::Resume | RecoveryAction::Restart | RecoveryAction::NewSession => {
            let cwd = app
                .session_manager
                .get_window_state(window_id)
                .map(|ws| ws.cwd)
                .unwrap_or_default();
            if cwd.is_empty() || !Path::new(&cwd).is_dir() {
                let _ = bot
                    .send_message(ChatId(chat_id), "❌ Working directory no longer exists")
                    .message_thread_id(to_thread_id(thread_id))
                    .await;
                return;
            }

            let provider = app.provider_for_window(window_id);
            let use_continue = action == RecoveryAction::Resume;
            let agent_args = match provider.make_launch_args(None, use_continue) {
                Ok(args) => args,
                Err(e) => {
                    tracing::warn!("Launch args failed: {e}");
                    String::new()
                }
            };
            // NewSession starts clean; Resume/Restart reuse the old cwd.
            let agent_args = if action == RecoveryAction::NewSession {
                String::new()
            } else {
                agent_args
            };

            let display = app.session_manager.get_display_name(window_id);
            match app
                .tmux
                .create_window(
                    Path::new(&cwd),
                    Some(&display),
                    &provider.capabilities().launch_command,
                    &agent_args,
                    true,
                )
                .await
            {
                Ok(window) => {
                    let provider_name = provider.capabilities().name.to_string();
                    app.session_manager.unbind_thread(user_id, thread_id);
                    app.session_manager.forget_window(window_id);
                    app.queue.forget_window(user_id, window_id);
                    app.poller.clear_topic_state(user_id, thread_id, window_id);
                    app.session_manager.bind_thread(
                        user_id,
                        thread_id,
                        &window.window_id,
                        Some(&window.window_name),
                    );
                    app.session_manager
                        .upsert_window_state(&window.window_id, &window.window_name, &cwd);
                    app.session_manager
                        .set_window_provider(&window.window_id, &provider_name);
                    update_topic_emoji(
                        bot,
                        &app.poller.topic_emojis,
                        chat_id,
                        thread_id,
                        TopicState::Active,
                    )
                    .await;
                    let _ = bot
                        .send_message(ChatId(chat_id), "✳ Session recovered")
                        .message_thread_id(to_thread_id(thread_id))
                        .await;
                }
                Err(e) => {
                    let _ = bot
                        .send_message(ChatId(chat_id), format!("❌ Failed to create window: {e}"))
                        .message_thread_id(to_thread_id(thread_id))
                        .await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovery_action_parse() {
        assert_eq!(RecoveryAction::parse("res"), Some(RecoveryAction::Resume));
        assert_eq!(RecoveryAction::parse("kill"), Some(RecoveryAction::Kill));
        assert_eq!(RecoveryAction::parse("nope"), None);
    }

    #[test]
    fn test_keyboard_callback_data() {
        let keyboard = build_recovery_keyboard("@5");
        let rows = keyboard.inline_keyboard;
        assert_eq!(rows.len(), 2);
        let data: Vec<String> = rows
            .iter()
            .flatten()
            .filter_map(|b| match &b.kind {
                teloxide::types::InlineKeyboardButtonKind::CallbackData(d) => Some(d.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(data, ["rec:res:@5", "rec:rst:@5", "rec:new:@5", "rec:kill:@5"]);
    }
}
