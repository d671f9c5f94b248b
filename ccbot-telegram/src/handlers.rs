//! Inbound text handler — routes topic messages to their tmux windows.
//!
//! Text in a bound topic becomes keystrokes. `!`-prefixed text starts a
//! transient capture task that posts the shell output back. Text in an
//! unbound topic opens the directory browser with the text stored for
//! replay. Text in a topic whose window died recovers the session with
//! the provider's continue mechanism.

use std::sync::Arc;
use std::time::Duration;

use teloxide::prelude::*;
use teloxide::types::{ChatId, Message as TgMessage, ParseMode};

use crate::app::App;
use crate::cc_commands::resolve_provider_command;
use crate::commands::thread_of;
use crate::format::code_block;
use crate::interactive::render_interactive_ui;
use crate::queue::to_thread_id;
use crate::recovery::{RecoveryAction, handle_recovery};

/// How long to wait before capturing `!` command output.
const BASH_CAPTURE_DELAY: Duration = Duration::from_secs(2);

/// Refresh delay after typing into an interactive UI.
const INTERACTIVE_REFRESH_DELAY: Duration = Duration::from_millis(500);

/// Handle a non-command text message.
pub async fn handle_message(bot: Bot, msg: TgMessage, app: Arc<App>) -> ResponseResult<()> {
    let user_id = msg.from.as_ref().map(|u| u.id.0).unwrap_or(0);
    let chat_id = msg.chat.id.0;
    if !app.is_update_allowed(user_id, chat_id) {
        return Ok(()); // Silent drop.
    }
    let Some(text) = msg.text().map(str::to_string) else {
        return Ok(());
    };

    let Some(thread_id) = thread_of(&msg) else {
        bot.send_message(
            msg.chat.id,
            "Sessions live in forum topics. Create a topic and send your message there.",
        )
        .await?;
        return Ok(());
    };

    if chat_id != user_id as i64 {
        app.session_manager.set_group_chat_id(user_id, thread_id, chat_id);
    }

    match app.session_manager.get_thread_binding(user_id, thread_id) {
        Some(window_id) => {
            let window = app
                .tmux
                .find_window_by_id(&window_id)
                .await
                .ok()
                .flatten();
            match window {
                Some(_) => {
                    forward_text(&bot, &app, user_id, thread_id, &window_id, &text).await;
                }
                None => {
                    // The "send a message to recover" affordance: recover
                    // with continue, then replay the text.
                    app.pending_texts
                        .lock()
                        .expect("pending texts lock poisoned")
                        .insert((user_id, thread_id), text);
                    handle_recovery(&bot, &app, user_id, thread_id, &window_id, RecoveryAction::Resume)
                        .await;
                    replay_pending(&app, user_id, thread_id).await;
                }
            }
        }
        None => {
            // Unbound topic: stash the text and open the browser.
            app.pending_texts
                .lock()
                .expect("pending texts lock poisoned")
                .insert((user_id, thread_id), text);
            crate::browser::open_browser(&bot, &app, user_id, thread_id, None).await;
        }
    }
    Ok(())
}

/// Replay stashed text into the freshly bound window, if recovery bound
/// one.
async fn replay_pending(app: &Arc<App>, user_id: u64, thread_id: i32) {
    let pending = app
        .pending_texts
        .lock()
        .expect("pending texts lock poisoned")
        .remove(&(user_id, thread_id));
    let (Some(text), Some(window_id)) = (
        pending,
        app.session_manager.get_thread_binding(user_id, thread_id),
    ) else {
        return;
    };
    tokio::time::sleep(Duration::from_secs(2)).await;
    if let Err(e) = app.tmux.send_keys(&window_id, &text, true, true).await {
        tracing::warn!("Failed to replay text after recovery: {e}");
    }
}

/// Forward text to a live bound window.
async fn forward_text(
    bot: &Bot,
    app: &Arc<App>,
    user_id: u64,
    thread_id: i32,
    window_id: &str,
    text: &str,
) {
    // Unknown slash commands map back to provider commands.
    let outgoing = if text.starts_with('/') {
        let cwd = app
            .session_manager
            .get_window_state(window_id)
            .map(|ws| ws.cwd)
            .unwrap_or_default();
        let provider = app.provider_for_window(window_id);
        resolve_provider_command(provider, &cwd, text).unwrap_or_else(|| text.to_string())
    } else {
        text.to_string()
    };

    if let Err(e) = app.tmux.send_keys(window_id, &outgoing, true, true).await {
        tracing::warn!("Failed to send keys to {window_id}: {e}");
        let chat_id = app.session_manager.resolve_chat_id(user_id, thread_id);
        let _ = bot
            .send_message(ChatId(chat_id), "❌ Failed to reach the session")
            .message_thread_id(to_thread_id(thread_id))
            .await;
        return;
    }

    if outgoing.starts_with('/') || outgoing.starts_with('!') {
        app.queue.record_command(window_id, &outgoing);
    }

    if let Some(command) = outgoing.strip_prefix('!') {
        spawn_bash_capture(bot, app, user_id, thread_id, window_id, command.trim());
    }

    // Typing into an interactive UI: refresh its mirror after the CLI
    // redraws.
    if app
        .interactive
        .window(user_id, thread_id)
        .is_some_and(|active| active == window_id)
    {
        let bot = bot.clone();
        let app = Arc::clone(app);
        let window_id = window_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(INTERACTIVE_REFRESH_DELAY).await;
            render_interactive_ui(&bot, &app, user_id, &window_id, thread_id).await;
        });
    }
}

/// Start the transient task that waits for `!` output and posts it back.
/// One per topic; a newer command cancels the previous capture.
fn spawn_bash_capture(
    bot: &Bot,
    app: &Arc<App>,
    user_id: u64,
    thread_id: i32,
    window_id: &str,
    command: &str,
) {
    let bot = bot.clone();
    let task_app = Arc::clone(app);
    let window_id = window_id.to_string();
    let command = command.to_string();
    let generation = app.next_bash_task_generation();

    let task = tokio::spawn(async move {
        tokio::time::sleep(BASH_CAPTURE_DELAY).await;

        let output = match task_app.tmux.capture_pane(&window_id).await {
            Ok(Some(pane_text)) => {
                let provider = task_app.provider_for_window(&window_id);
                provider.extract_bash_output(&pane_text, &command)
            }
            _ => None,
        };
        if let Some(output) = output {
            let chat_id = task_app.session_manager.resolve_chat_id(user_id, thread_id);
            let _ = bot
                .send_message(ChatId(chat_id), code_block(&output))
                .parse_mode(ParseMode::MarkdownV2)
                .message_thread_id(to_thread_id(thread_id))
                .await;
        }

        // Only evict ourselves if a newer capture has not replaced us.
        task_app.evict_bash_task(user_id, thread_id, generation);
    });

    app.register_bash_task(user_id, thread_id, generation, task.abort_handle());
}
