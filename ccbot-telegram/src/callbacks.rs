//! Callback-query demux — routes button taps by data prefix.
//!
//! Every handler re-checks that the tapping user actually owns the target
//! window before acting on it.

use std::sync::Arc;

use teloxide::prelude::*;
use teloxide::types::{CallbackQuery, InputFile};

use crate::app::App;
use crate::recovery::{RecoveryAction, handle_recovery};
use crate::{browser, dashboard, interactive, resume_picker};

/// Does this user have any binding to the window?
fn user_owns_window(app: &App, user_id: u64, window_id: &str) -> bool {
    app.session_manager
        .iter_thread_bindings()
        .into_iter()
        .any(|(uid, _, wid)| uid == user_id && wid == window_id)
}

/// Handle an inline keyboard button tap.
pub async fn handle_callback(bot: Bot, q: CallbackQuery, app: Arc<App>) -> ResponseResult<()> {
    let user_id = q.from.id.0;
    if !app.config.is_user_allowed(user_id) {
        return Ok(()); // Silent drop.
    }

    // Dismiss the loading spinner immediately.
    bot.answer_callback_query(q.id.clone()).await?;

    let Some(data) = q.data.as_deref().filter(|d| !d.is_empty()) else {
        return Ok(());
    };
    let Some(message) = q.regular_message() else {
        tracing::warn!("Callback query without message, skipping");
        return Ok(());
    };
    let chat_id = message.chat.id;
    let message_id = message.id;
    let thread_id = message.thread_id.map(|t| t.0.0);

    let parts: Vec<&str> = data.splitn(3, ':').collect();
    match parts.as_slice() {
        // Interactive UI key-pad: ik:<code>:<window_id>
        ["ik", code, window_id] => {
            let Some(thread_id) = thread_id else {
                return Ok(());
            };
            if !user_owns_window(&app, user_id, window_id) {
                return Ok(());
            }
            interactive::handle_interactive_key(&bot, &app, user_id, window_id, thread_id, code)
                .await;
        }

        // Status keyboard: Esc into the pane.
        ["esc", window_id] => {
            if !user_owns_window(&app, user_id, window_id) {
                return Ok(());
            }
            let panes = app.tmux.list_panes(window_id).await.unwrap_or_default();
            if let Some(pane) = panes.iter().find(|p| p.active).or(panes.first())
                && let Err(e) = app
                    .tmux
                    .send_keys_to_pane(&pane.pane_id, "Escape", false, false)
                    .await
            {
                tracing::debug!("Failed to send Escape: {e}");
            }
        }

        // Status keyboard: pane snapshot uploaded as a document.
        ["shot", window_id] => {
            if !user_owns_window(&app, user_id, window_id) {
                return Ok(());
            }
            if let Ok(Some(pane_text)) = app.tmux.capture_pane(window_id).await {
                let mut buffer = ccbot_core::ScreenBuffer::default();
                buffer.feed(&pane_text);
                let rendered = buffer.display().join("\n");
                let name = app.session_manager.get_display_name(window_id);
                let mut request = bot.send_document(
                    chat_id,
                    InputFile::memory(rendered.into_bytes()).file_name(format!("{name}.txt")),
                );
                if let Some(thread_id) = thread_id {
                    request = request.message_thread_id(crate::queue::to_thread_id(thread_id));
                }
                if let Err(e) = request.await {
                    tracing::debug!("Failed to upload screenshot: {e}");
                }
            }
        }

        // Status keyboard: cycle notification mode.
        ["notif", window_id] => {
            if !user_owns_window(&app, user_id, window_id) {
                return Ok(());
            }
            let mode = app.session_manager.cycle_notification_mode(window_id);
            // The query was already answered; a toast here is best-effort.
            let _ = bot
                .answer_callback_query(q.id.clone())
                .text(format!("Notifications: {}", mode.label()))
                .await;
        }

        // Status keyboard: resend the recalled command.
        ["recall", window_id] => {
            if !user_owns_window(&app, user_id, window_id) {
                return Ok(());
            }
            if let Some(command) = app.queue.last_command(window_id)
                && let Err(e) = app.tmux.send_keys(window_id, &command, true, true).await
            {
                tracing::debug!("Failed to resend command: {e}");
            }
        }

        // Recovery keyboard: rec:<action>:<window_id>
        ["rec", action, window_id] => {
            let Some(thread_id) = thread_id else {
                return Ok(());
            };
            if !user_owns_window(&app, user_id, window_id) {
                return Ok(());
            }
            if let Some(action) = RecoveryAction::parse(action) {
                handle_recovery(&bot, &app, user_id, thread_id, window_id, action).await;
                let _ = bot
                    .edit_message_reply_markup(chat_id, message_id)
                    .await;
            }
        }

        // Resume picker: res:p:<page> / res:s:<index>
        ["res", "p", page] => {
            if let Some(page) = page.parse::<usize>().ok()
                && let Some(keyboard) = resume_picker::handle_resume_page(&app, user_id, page)
                && let Err(e) = bot
                    .edit_message_reply_markup(chat_id, message_id)
                    .reply_markup(keyboard)
                    .await
            {
                tracing::debug!("Failed to flip resume page: {e}");
            }
        }
        ["res", "s", index] => {
            let Some(thread_id) = thread_id else {
                return Ok(());
            };
            if let Ok(index) = index.parse::<usize>() {
                let reply =
                    resume_picker::handle_resume_pick(&app, user_id, thread_id, index).await;
                let _ = bot.edit_message_text(chat_id, message_id, reply).await;
            }
        }

        // Directory browser and provider pick.
        ["dir", ..] => {
            if let Some((text, keyboard)) = browser::handle_dir_callback(&app, user_id, data) {
                let _ = bot
                    .edit_message_text(chat_id, message_id, text)
                    .reply_markup(keyboard)
                    .await;
            }
        }
        ["prov", provider_name] => {
            if let Some(reply) =
                browser::handle_provider_pick(&bot, &app, user_id, provider_name).await
            {
                let _ = bot.edit_message_text(chat_id, message_id, reply).await;
            }
        }

        // Session dashboard.
        ["dash", "refresh"] => {
            let (text, keyboard) = dashboard::build_dashboard(&app, user_id).await;
            let _ = bot
                .edit_message_text(chat_id, message_id, text)
                .reply_markup(keyboard)
                .await;
        }
        ["dash", "kill", window_id] => {
            let reply = dashboard::handle_dashboard_kill(&app, user_id, window_id).await;
            let _ = bot.edit_message_text(chat_id, message_id, reply).await;
        }

        _ => {
            tracing::debug!("Unknown callback data: {data}");
        }
    }
    Ok(())
}
