//! `/sessions` — live dashboard of the user's bindings.

use std::sync::Arc;

use teloxide::prelude::*;
use teloxide::types::{ChatId, InlineKeyboardButton, InlineKeyboardMarkup};

use crate::app::App;
use crate::format::truncate;
use crate::queue::to_thread_id;

/// Render the dashboard text and per-window action buttons.
pub async fn build_dashboard(app: &Arc<App>, user_id: u64) -> (String, InlineKeyboardMarkup) {
    let bindings: Vec<(i32, String)> = app
        .session_manager
        .iter_thread_bindings()
        .into_iter()
        .filter(|(uid, _, _)| *uid == user_id)
        .map(|(_, thread_id, window_id)| (thread_id, window_id))
        .collect();

    if bindings.is_empty() {
        return (
            "No active sessions. Use /new to start one.".to_string(),
            InlineKeyboardMarkup::new(Vec::<Vec<InlineKeyboardButton>>::new()),
        );
    }

    let live = app.tmux.list_windows().await.unwrap_or_default();
    let mut lines = vec![format!("Active sessions ({}):", bindings.len())];
    let mut rows = Vec::new();

    for (_thread_id, window_id) in &bindings {
        let display = app.session_manager.get_display_name(window_id);
        let window = live.iter().find(|w| w.window_id == *window_id);
        let (mark, detail) = match window {
            Some(w) => {
                let provider = app.session_manager.get_window_provider(window_id);
                let provider = if provider.is_empty() {
                    app.config.provider_name.clone()
                } else {
                    provider
                };
                ("🟢", format!("{provider} · {}", w.cwd))
            }
            None => ("🔴", "window gone".to_string()),
        };
        lines.push(format!("{mark} {display} — {detail}"));
        rows.push(vec![InlineKeyboardButton::callback(
            format!("✕ Kill {}", truncate(&display, 24)),
            format!("dash:kill:{window_id}"),
        )]);
    }
    rows.push(vec![InlineKeyboardButton::callback(
        "↻ Refresh",
        "dash:refresh".to_string(),
    )]);

    (lines.join("\n"), InlineKeyboardMarkup::new(rows))
}

/// Send the dashboard into a chat.
pub async fn show_dashboard(
    bot: &Bot,
    app: &Arc<App>,
    user_id: u64,
    chat_id: i64,
    thread_id: Option<i32>,
) {
    let (text, keyboard) = build_dashboard(app, user_id).await;
    let mut request = bot
        .send_message(ChatId(chat_id), text)
        .reply_markup(keyboard);
    if let Some(thread_id) = thread_id {
        request = request.message_thread_id(to_thread_id(thread_id));
    }
    if let Err(e) = request.await {
        tracing::warn!("Failed to send dashboard: {e}");
    }
}

/// Kill a window from the dashboard. Verifies ownership first.
pub async fn handle_dashboard_kill(app: &Arc<App>, user_id: u64, window_id: &str) -> String {
    let owned: Vec<(u64, i32, String)> = app
        .session_manager
        .iter_thread_bindings()
        .into_iter()
        .filter(|(uid, _, wid)| *uid == user_id && wid == window_id)
        .collect();
    if owned.is_empty() {
        return "❌ That window is not bound to any of your topics".to_string();
    }

    if let Err(e) = app.tmux.kill_window(window_id).await {
        return format!("❌ Failed to kill window: {e}");
    }
    for (uid, thread_id, wid) in owned {
        app.session_manager.unbind_thread(uid, thread_id);
        app.queue.forget_window(uid, &wid);
        app.poller.clear_topic_state(uid, thread_id, &wid);
    }
    app.session_manager.forget_window(window_id);
    format!("✕ Killed {}", app.session_manager.get_display_name(window_id))
}
