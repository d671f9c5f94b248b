//! `/resume` — paginated picker over past sessions for the topic's cwd.

use std::path::Path;
use std::sync::Arc;

use teloxide::prelude::*;
use teloxide::types::{ChatId, InlineKeyboardButton, InlineKeyboardMarkup};

use ccbot_core::resume::{ResumeSession, list_resumable_sessions};

use crate::app::App;
use crate::format::truncate;
use crate::queue::to_thread_id;

/// Sessions shown per page.
pub const PAGE_SIZE: usize = 5;

/// Build the picker keyboard for one page.
pub fn build_resume_keyboard(sessions: &[ResumeSession], page: usize) -> InlineKeyboardMarkup {
    let start = page * PAGE_SIZE;
    let mut rows: Vec<Vec<InlineKeyboardButton>> = sessions
        .iter()
        .enumerate()
        .skip(start)
        .take(PAGE_SIZE)
        .map(|(i, session)| {
            let date = session.updated_at.format("%m-%d %H:%M");
            let preview = if session.preview.is_empty() {
                session.session_id.chars().take(8).collect::<String>()
            } else {
                truncate(&session.preview, 28)
            };
            vec![InlineKeyboardButton::callback(
                format!("{date} · {preview}"),
                format!("res:s:{i}"),
            )]
        })
        .collect();

    let mut nav = Vec::new();
    if page > 0 {
        nav.push(InlineKeyboardButton::callback(
            "‹ Prev",
            format!("res:p:{}", page - 1),
        ));
    }
    if start + PAGE_SIZE < sessions.len() {
        nav.push(InlineKeyboardButton::callback(
            "Next ›",
            format!("res:p:{}", page + 1),
        ));
    }
    if !nav.is_empty() {
        rows.push(nav);
    }
    InlineKeyboardMarkup::new(rows)
}

/// Show the resume picker in a bound topic.
pub async fn show_resume_picker(bot: &Bot, app: &Arc<App>, user_id: u64, thread_id: i32) {
    let chat_id = app.session_manager.resolve_chat_id(user_id, thread_id);
    let Some(window_id) = app.session_manager.get_thread_binding(user_id, thread_id) else {
        let _ = bot
            .send_message(ChatId(chat_id), "❌ No session bound to this topic. Use /new first.")
            .message_thread_id(to_thread_id(thread_id))
            .await;
        return;
    };

    let cwd = app
        .session_manager
        .get_window_state(&window_id)
        .map(|ws| ws.cwd)
        .unwrap_or_default();
    if cwd.is_empty() {
        let _ = bot
            .send_message(ChatId(chat_id), "❌ Unknown working directory for this session")
            .message_thread_id(to_thread_id(thread_id))
            .await;
        return;
    }

    let projects_dir = app.config.claude_projects_path.clone();
    let cwd_for_scan = cwd.clone();
    let sessions = tokio::task::spawn_blocking(move || {
        list_resumable_sessions(&projects_dir, &cwd_for_scan)
    })
    .await
    .unwrap_or_default();

    if sessions.is_empty() {
        let _ = bot
            .send_message(ChatId(chat_id), format!("No past sessions found for {cwd}"))
            .message_thread_id(to_thread_id(thread_id))
            .await;
        return;
    }

    let keyboard = build_resume_keyboard(&sessions, 0);
    app.resume_picks
        .lock()
        .expect("resume picks lock poisoned")
        .insert(user_id, sessions);

    let _ = bot
        .send_message(ChatId(chat_id), "Resume a session:")
        .message_thread_id(to_thread_id(thread_id))
        .reply_markup(keyboard)
        .await;
}

/// Handle `res:p:<page>` — return the re-rendered keyboard.
pub fn handle_resume_page(app: &App, user_id: u64, page: usize) -> Option<InlineKeyboardMarkup> {
    let picks = app.resume_picks.lock().expect("resume picks lock poisoned");
    let sessions = picks.get(&user_id)?;
    Some(build_resume_keyboard(sessions, page))
}

/// Handle `res:s:<idx>` — create a resume window and rebind the topic.
pub async fn handle_resume_pick(
    app: &Arc<App>,
    user_id: u64,
    thread_id: i32,
    index: usize,
) -> String {
    let session = {
        let picks = app.resume_picks.lock().expect("resume picks lock poisoned");
        picks.get(&user_id).and_then(|s| s.get(index)).cloned()
    };
    let Some(session) = session else {
        return "❌ That session is no longer available".to_string();
    };

    let old_window = app.session_manager.get_thread_binding(user_id, thread_id);
    let provider = match old_window.as_deref() {
        Some(window_id) => app.provider_for_window(window_id),
        None => ccbot_core::provider::provider_by_name(&app.config.provider_name),
    };

    let agent_args = match provider.make_launch_args(Some(&session.session_id), false) {
        Ok(args) => args,
        Err(e) => return format!("❌ {e}"),
    };

    let window_name = Path::new(&session.cwd)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("resumed")
        .to_string();
    let window = match app
        .tmux
        .create_window(
            Path::new(&session.cwd),
            Some(&window_name),
            &provider.capabilities().launch_command,
            &agent_args,
            true,
        )
        .await
    {
        Ok(window) => window,
        Err(e) => return format!("❌ Failed to create window: {e}"),
    };

    // Replace the existing binding; the old window stays alive subject to
    // the unbound TTL.
    if let Some(old) = old_window {
        app.queue.forget_window(user_id, &old);
        app.poller.clear_topic_state(user_id, thread_id, &old);
    }
    app.session_manager
        .bind_thread(user_id, thread_id, &window.window_id, Some(&window.window_name));
    app.session_manager
        .upsert_window_state(&window.window_id, &window.window_name, &session.cwd);
    app.session_manager
        .set_window_provider(&window.window_id, provider.capabilities().name);
    app.resume_picks
        .lock()
        .expect("resume picks lock poisoned")
        .remove(&user_id);

    format!("▶ Resumed session in {}", session.cwd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::path::PathBuf;

    fn session(n: usize) -> ResumeSession {
        ResumeSession {
            session_id: format!("session-{n}"),
            file_path: PathBuf::from(format!("/tmp/s{n}.jsonl")),
            cwd: "/tmp/proj".to_string(),
            updated_at: Utc::now(),
            preview: format!("task {n}"),
        }
    }

    #[test]
    fn test_first_page_buttons() {
        let sessions: Vec<ResumeSession> = (0..2).map(session).collect();
        let keyboard = build_resume_keyboard(&sessions, 0);
        // Two session buttons, no nav row.
        assert_eq!(keyboard.inline_keyboard.len(), 2);
    }

    #[test]
    fn test_pagination_rows() {
        let sessions: Vec<ResumeSession> = (0..12).map(session).collect();

        let page0 = build_resume_keyboard(&sessions, 0);
        assert_eq!(page0.inline_keyboard.len(), PAGE_SIZE + 1);
        let nav: Vec<&str> = page0.inline_keyboard[PAGE_SIZE]
            .iter()
            .map(|b| b.text.as_str())
            .collect();
        assert_eq!(nav, ["Next ›"]);

        let page2 = build_resume_keyboard(&sessions, 2);
        // Two sessions left plus a prev-only nav row.
        assert_eq!(page2.inline_keyboard.len(), 3);
        let nav: Vec<&str> = page2.inline_keyboard[2]
            .iter()
            .map(|b| b.text.as_str())
            .collect();
        assert_eq!(nav, ["‹ Prev"]);
    }

    #[test]
    fn test_selection_carries_absolute_index() {
        let sessions: Vec<ResumeSession> = (0..12).map(session).collect();
        let page1 = build_resume_keyboard(&sessions, 1);
        let first = &page1.inline_keyboard[0][0];
        if let teloxide::types::InlineKeyboardButtonKind::CallbackData(data) = &first.kind {
            assert_eq!(data, "res:s:5");
        } else {
            panic!("expected callback button");
        }
    }
}
