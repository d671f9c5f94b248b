//! Monitor event router — the subscriber side of the event bus.
//!
//! Consumes the session monitor's typed events and fans them out:
//! transcript messages go to the per-user queues, new windows get topics,
//! hook events drive the status poller's state machine (instant done,
//! interactive mode on Notification, subagent tracking).

use std::sync::Arc;
use std::time::Duration;

use teloxide::prelude::*;
use teloxide::types::ChatId;
use tokio::sync::mpsc;

use ccbot_core::provider::ContentType;
use ccbot_core::session::NotificationMode;
use ccbot_core::{HookEvent, HookEventKind, MonitorEvent, NewMessage, NewWindowEvent};

use crate::app::{App, SubagentInfo};
use crate::format::{code_block, escape_markdown_v2, truncate};
use crate::interactive::render_interactive_ui;
use crate::topic::{TopicState, update_topic_emoji};

/// Settling delay before rendering the UI a Notification hook announced,
/// so the CLI has redrawn by the time the pane is captured.
const NOTIFICATION_RENDER_DELAY: Duration = Duration::from_millis(300);

/// Longest tool result forwarded verbatim.
const TOOL_RESULT_MAX: usize = 1000;

/// Consume monitor events until the channel closes or shutdown flips.
pub async fn run_event_router(
    bot: Bot,
    app: Arc<App>,
    mut rx: mpsc::UnboundedReceiver<MonitorEvent>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(event) => route_event(&bot, &app, event).await,
                    None => break,
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::info!("Event router stopped");
}

async fn route_event(bot: &Bot, app: &Arc<App>, event: MonitorEvent) {
    match event {
        MonitorEvent::Message(message) => route_new_message(app, message),
        MonitorEvent::Window(window) => route_new_window(bot, app, window).await,
        MonitorEvent::Hook(hook) => route_hook_event(bot, app, hook).await,
    }
}

/// Users bound to the window, as (user_id, thread_id).
fn users_for_window(app: &App, window_id: &str) -> Vec<(u64, i32)> {
    app.session_manager
        .iter_thread_bindings()
        .into_iter()
        .filter(|(_, _, wid)| wid == window_id)
        .map(|(user_id, thread_id, _)| (user_id, thread_id))
        .collect()
}

/// Render one transcript message for Telegram.
fn render_message(message: &NewMessage) -> String {
    match message.content_type {
        ContentType::Text => escape_markdown_v2(&message.text),
        ContentType::Thinking => format!("💭 _{}_", escape_markdown_v2(&message.text)),
        ContentType::ToolUse => format!("🔧 `{}`", escape_markdown_v2(&message.text)),
        ContentType::ToolResult => code_block(&truncate(&message.text, TOOL_RESULT_MAX)),
    }
}

/// Whether a message passes the window's notification mode.
fn passes_notification_mode(mode: NotificationMode, message: &NewMessage) -> bool {
    match mode {
        NotificationMode::All => true,
        NotificationMode::Muted => false,
        NotificationMode::ErrorsOnly => {
            message.content_type == ContentType::ToolResult
                && message.text.to_lowercase().contains("error")
        }
    }
}

fn route_new_message(app: &Arc<App>, message: NewMessage) {
    // Only assistant-side traffic is forwarded; the user's own words came
    // from Telegram in the first place.
    if message.role == ccbot_core::provider::MessageRole::User
        && message.content_type != ContentType::ToolResult
    {
        return;
    }
    let Some(window_id) = app
        .session_manager
        .get_window_for_session(&message.session_id)
    else {
        return;
    };
    let mode = app.session_manager.get_notification_mode(&window_id);
    if !passes_notification_mode(mode, &message) {
        return;
    }

    let rendered = render_message(&message);
    for (user_id, thread_id) in users_for_window(app, &window_id) {
        app.queue.enqueue_content(
            user_id,
            &window_id,
            Some(thread_id),
            rendered.clone(),
            message.content_type,
        );
    }
}

/// A window appeared outside the normal `/new` flow (external tmux
/// window, or a hook fired in a window we had not bound yet): create a
/// topic for it when a forum group is configured.
async fn route_new_window(bot: &Bot, app: &Arc<App>, window: NewWindowEvent) {
    app.session_manager
        .upsert_window_state(&window.window_id, &window.window_name, &window.cwd);

    let Some(group_id) = app.config.group_id else {
        tracing::debug!(
            "New window {} with no group configured; waiting for manual bind",
            window.window_id
        );
        return;
    };
    if !users_for_window(app, &window.window_id).is_empty() {
        return; // Already bound (normal /new flow).
    }

    let name = if window.window_name.is_empty() {
        window.window_id.clone()
    } else {
        window.window_name.clone()
    };
    let topic = match bot.create_forum_topic(ChatId(group_id), name.clone()).await {
        Ok(topic) => topic,
        Err(e) => {
            tracing::warn!("Failed to create topic for window {}: {e}", window.window_id);
            return;
        }
    };
    let thread_id = topic.thread_id.0.0;

    for user_id in app.config.allowed_users.iter().copied() {
        app.session_manager
            .bind_thread(user_id, thread_id, &window.window_id, Some(&name));
        app.session_manager
            .set_group_chat_id(user_id, thread_id, group_id);
    }
    update_topic_emoji(
        bot,
        &app.poller.topic_emojis,
        group_id,
        thread_id,
        TopicState::Active,
    )
    .await;
    tracing::info!(
        "Created topic {thread_id} for window {} ({name})",
        window.window_id
    );
}

async fn route_hook_event(bot: &Bot, app: &Arc<App>, event: HookEvent) {
    let Some(window_id) = event.window_id().map(str::to_string) else {
        return;
    };
    let users = users_for_window(app, &window_id);
    if users.is_empty() {
        tracing::debug!("No users bound for hook event window_key={}", event.window_key);
        return;
    }

    match event.kind {
        HookEventKind::Notification => {
            handle_notification(bot, app, &window_id, &users).await;
        }
        HookEventKind::Stop => {
            handle_stop(bot, app, &window_id, &users, &event).await;
        }
        HookEventKind::SubagentStart => {
            let info = SubagentInfo {
                subagent_id: data_str(&event, "subagent_id"),
                name: data_str(&event, "name"),
                description: data_str(&event, "description"),
            };
            let mut subagents = app.subagents.lock().expect("subagents lock poisoned");
            let entries = subagents.entry(window_id.clone()).or_default();
            entries.push(info);
            tracing::info!("Subagent started: window={window_id}, count={}", entries.len());
        }
        HookEventKind::SubagentStop => {
            let subagent_id = data_str(&event, "subagent_id");
            let mut subagents = app.subagents.lock().expect("subagents lock poisoned");
            if let Some(entries) = subagents.get_mut(&window_id) {
                entries.retain(|a| a.subagent_id != subagent_id);
                if entries.is_empty() {
                    subagents.remove(&window_id);
                }
            }
        }
        HookEventKind::TeammateIdle => {
            let name = data_str(&event, "name");
            let text = if name.is_empty() {
                "💤 Teammate idle".to_string()
            } else {
                format!("💤 Teammate idle: {name}")
            };
            notify_users(app, &window_id, &users, text);
        }
        HookEventKind::TaskCompleted => {
            let description = data_str(&event, "description");
            let text = if description.is_empty() {
                "✅ Task completed".to_string()
            } else {
                format!("✅ Task completed: {description}")
            };
            notify_users(app, &window_id, &users, text);
        }
        HookEventKind::SessionStart => {
            // The monitor already folded this into the session map.
        }
    }
}

fn data_str(event: &HookEvent, key: &str) -> String {
    event
        .data
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

fn notify_users(app: &Arc<App>, window_id: &str, users: &[(u64, i32)], text: String) {
    let mode = app.session_manager.get_notification_mode(window_id);
    if mode != NotificationMode::All {
        return;
    }
    for (user_id, thread_id) in users {
        app.queue.enqueue_content(
            *user_id,
            window_id,
            Some(*thread_id),
            escape_markdown_v2(&text),
            ContentType::ToolUse,
        );
    }
}

/// Notification hook: the CLI is asking for input. Enter interactive
/// mode (if not already there) after a settling delay.
async fn handle_notification(bot: &Bot, app: &Arc<App>, window_id: &str, users: &[(u64, i32)]) {
    for (user_id, thread_id) in users {
        if app
            .interactive
            .window(*user_id, *thread_id)
            .is_some_and(|active| active == window_id)
        {
            continue;
        }
        app.interactive.enter(*user_id, *thread_id, window_id);
        tokio::time::sleep(NOTIFICATION_RENDER_DELAY).await;
        if !render_interactive_ui(bot, app, *user_id, window_id, *thread_id).await {
            app.interactive.clear(*user_id, *thread_id);
        }
    }
}

/// Stop hook: instant done — no need to wait for the poller to notice.
async fn handle_stop(
    bot: &Bot,
    app: &Arc<App>,
    window_id: &str,
    users: &[(u64, i32)],
    event: &HookEvent,
) {
    let stop_reason = data_str(event, "stop_reason");
    tracing::info!("Hook stop: window={window_id}, stop_reason={stop_reason}");

    app.poller.clear_seen_status(window_id);
    for (user_id, thread_id) in users {
        let chat_id = app.session_manager.resolve_chat_id(*user_id, *thread_id);
        update_topic_emoji(
            bot,
            &app.poller.topic_emojis,
            chat_id,
            *thread_id,
            TopicState::Done,
        )
        .await;
        app.poller.start_autoclose(*user_id, *thread_id, TopicState::Done);
        app.queue
            .enqueue_status(*user_id, window_id, Some(*thread_id), None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(content_type: ContentType, text: &str) -> NewMessage {
        NewMessage {
            session_id: "s".to_string(),
            text: text.to_string(),
            role: ccbot_core::provider::MessageRole::Assistant,
            content_type,
            tool_use_id: None,
            tool_name: None,
        }
    }

    #[test]
    fn test_render_escapes_text() {
        let rendered = render_message(&message(ContentType::Text, "a_b"));
        assert_eq!(rendered, r"a\_b");
    }

    #[test]
    fn test_render_tool_result_code_block() {
        let rendered = render_message(&message(ContentType::ToolResult, "output"));
        assert!(rendered.starts_with("```"));
    }

    #[test]
    fn test_notification_mode_gate() {
        let text = message(ContentType::Text, "hi");
        let error = message(ContentType::ToolResult, "Error: it broke");
        let ok_result = message(ContentType::ToolResult, "all good");

        assert!(passes_notification_mode(NotificationMode::All, &text));
        assert!(!passes_notification_mode(NotificationMode::Muted, &text));
        assert!(!passes_notification_mode(NotificationMode::Muted, &error));
        assert!(passes_notification_mode(NotificationMode::ErrorsOnly, &error));
        assert!(!passes_notification_mode(NotificationMode::ErrorsOnly, &ok_result));
        assert!(!passes_notification_mode(NotificationMode::ErrorsOnly, &text));
    }
}
