//! Outbound message queue — per-user FIFO with merging and a rate floor.
//!
//! Every Telegram send for a user flows through one queue drained by a
//! dedicated consumer task, which gives per-topic ordering for free.
//! Adjacent mergeable content tasks for the same window are coalesced up
//! to [`MERGE_MAX_LENGTH`]; every send waits on a per-chat rate limiter.
//!
//! Status updates are special-cased: each window keeps one editable
//! status message per user, created on first update, edited when the text
//! changes, and deleted when a `None` update arrives.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ccbot_core::provider::ContentType;
use ccbot_core::session::SessionManager;
use teloxide::prelude::*;
use teloxide::types::{ChatId, InlineKeyboardButton, InlineKeyboardMarkup, MessageId, ThreadId};
use tokio::sync::Notify;

use crate::format;
use crate::send::{SendOutcome, send_with_fallback};

/// Maximum combined text length of one merged send.
pub const MERGE_MAX_LENGTH: usize = 4000;

/// Minimum interval between sends to one chat (the rate floor).
pub const MESSAGE_SEND_INTERVAL: Duration = Duration::from_millis(50);

/// Separator inserted between merged parts.
const MERGE_SEPARATOR: &str = "\n\n";

/// What a queued task does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Content,
    StatusUpdate,
}

/// One queued outbound operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTask {
    pub kind: TaskKind,
    pub window_id: String,
    pub thread_id: Option<i32>,
    /// Message texts; empty parts on a status task clear the status
    /// message.
    pub parts: Vec<String>,
    pub content_type: Option<ContentType>,
}

impl MessageTask {
    fn is_mergeable(&self) -> bool {
        self.kind == TaskKind::Content
            && self
                .content_type
                .is_some_and(ContentType::is_mergeable)
    }

    fn text_len(&self) -> usize {
        self.parts.iter().map(String::len).sum()
    }
}

/// Pop the next task, merging an eligible run of followers into it.
///
/// Merged tasks must share the window, carry mergeable content, and stay
/// within [`MERGE_MAX_LENGTH`] in total. The first non-mergeable task
/// breaks the chain and stays queued.
pub fn pop_merged(queue: &mut VecDeque<MessageTask>) -> Option<MessageTask> {
    let mut task = queue.pop_front()?;
    if !task.is_mergeable() {
        return Some(task);
    }
    let mut total = task.text_len();
    while let Some(next) = queue.front() {
        if !next.is_mergeable() || next.window_id != task.window_id {
            break;
        }
        let added = next.text_len() + MERGE_SEPARATOR.len();
        if total + added > MERGE_MAX_LENGTH {
            break;
        }
        let next = queue.pop_front().expect("front exists");
        task.parts.extend(next.parts);
        total += added;
    }
    Some(task)
}

struct UserQueue {
    tasks: Mutex<VecDeque<MessageTask>>,
    notify: Notify,
}

struct StatusMessage {
    chat_id: i64,
    message_id: MessageId,
    text: String,
}

/// Per-user outbound queues plus the shared send-side state.
pub struct MessageQueue {
    bot: Bot,
    session_manager: Arc<SessionManager>,
    /// Back-reference handed to spawned consumer tasks.
    self_ref: std::sync::Weak<MessageQueue>,
    users: Mutex<HashMap<u64, Arc<UserQueue>>>,
    /// chat_id → reserved time of the next allowed send.
    rate: Mutex<HashMap<i64, Instant>>,
    /// (user_id, window_id) → live status message.
    status_messages: Mutex<HashMap<(u64, String), StatusMessage>>,
    /// window_id → recently sent commands, newest first (recall button).
    command_history: Mutex<HashMap<String, Vec<String>>>,
}

impl MessageQueue {
    pub fn new(bot: Bot, session_manager: Arc<SessionManager>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            bot,
            session_manager,
            self_ref: weak.clone(),
            users: Mutex::new(HashMap::new()),
            rate: Mutex::new(HashMap::new()),
            status_messages: Mutex::new(HashMap::new()),
            command_history: Mutex::new(HashMap::new()),
        })
    }

    /// Queue a content message for a user's topic.
    pub fn enqueue_content(
        &self,
        user_id: u64,
        window_id: &str,
        thread_id: Option<i32>,
        text: String,
        content_type: ContentType,
    ) {
        self.enqueue(
            user_id,
            MessageTask {
                kind: TaskKind::Content,
                window_id: window_id.to_string(),
                thread_id,
                parts: vec![text],
                content_type: Some(content_type),
            },
        );
    }

    /// Queue a status update; `None` clears the window's status message.
    pub fn enqueue_status(
        &self,
        user_id: u64,
        window_id: &str,
        thread_id: Option<i32>,
        status: Option<String>,
    ) {
        self.enqueue(
            user_id,
            MessageTask {
                kind: TaskKind::StatusUpdate,
                window_id: window_id.to_string(),
                thread_id,
                parts: status.map(|s| vec![s]).unwrap_or_default(),
                content_type: None,
            },
        );
    }

    /// Whether the user's queue currently has work (the poller skips
    /// status parsing while content is in flight).
    pub fn is_busy(&self, user_id: u64) -> bool {
        let users = self.users.lock().expect("queue registry lock poisoned");
        users
            .get(&user_id)
            .is_some_and(|q| !q.tasks.lock().expect("task lock poisoned").is_empty())
    }

    /// Record a command for the status keyboard's recall row.
    pub fn record_command(&self, window_id: &str, command: &str) {
        let mut history = self.command_history.lock().expect("history lock poisoned");
        let entries = history.entry(window_id.to_string()).or_default();
        entries.retain(|c| c != command);
        entries.insert(0, command.to_string());
        entries.truncate(5);
    }

    /// Most recent command sent to a window, if any.
    pub fn last_command(&self, window_id: &str) -> Option<String> {
        self.command_history
            .lock()
            .expect("history lock poisoned")
            .get(window_id)
            .and_then(|entries| entries.first().cloned())
    }

    /// Drop per-window send state (window killed or rebound).
    pub fn forget_window(&self, user_id: u64, window_id: &str) {
        self.status_messages
            .lock()
            .expect("status lock poisoned")
            .remove(&(user_id, window_id.to_string()));
        self.command_history
            .lock()
            .expect("history lock poisoned")
            .remove(window_id);
    }

    fn enqueue(&self, user_id: u64, task: MessageTask) {
        let queue = {
            let mut users = self.users.lock().expect("queue registry lock poisoned");
            match users.get(&user_id) {
                Some(queue) => Arc::clone(queue),
                None => {
                    let queue = Arc::new(UserQueue {
                        tasks: Mutex::new(VecDeque::new()),
                        notify: Notify::new(),
                    });
                    users.insert(user_id, Arc::clone(&queue));
                    let registry = self
                        .self_ref
                        .upgrade()
                        .expect("queue registry outlives consumers");
                    let consumer_queue = Arc::clone(&queue);
                    tokio::spawn(async move {
                        registry.consume(user_id, consumer_queue).await;
                    });
                    queue
                }
            }
        };
        queue
            .tasks
            .lock()
            .expect("task lock poisoned")
            .push_back(task);
        queue.notify.notify_one();
    }

    /// Consumer loop for one user, alive for the process lifetime.
    async fn consume(self: Arc<Self>, user_id: u64, queue: Arc<UserQueue>) {
        loop {
            let task = {
                let mut tasks = queue.tasks.lock().expect("task lock poisoned");
                pop_merged(&mut tasks)
            };
            let Some(task) = task else {
                queue.notify.notified().await;
                continue;
            };
            match task.kind {
                TaskKind::Content => self.send_content(user_id, &task).await,
                TaskKind::StatusUpdate => self.apply_status(user_id, &task).await,
            }
        }
    }

    /// Wait for the chat's rate floor, reserving this send's slot.
    async fn rate_limit(&self, chat_id: i64) {
        let reserved = {
            let mut rate = self.rate.lock().expect("rate lock poisoned");
            let now = Instant::now();
            let slot = match rate.get(&chat_id) {
                Some(prev) => (*prev + MESSAGE_SEND_INTERVAL).max(now),
                None => now,
            };
            rate.insert(chat_id, slot);
            slot
        };
        let wait = reserved.saturating_duration_since(Instant::now());
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    async fn send_content(&self, user_id: u64, task: &MessageTask) {
        let chat_id = self
            .session_manager
            .resolve_chat_id(user_id, task.thread_id.unwrap_or(0));
        let text = task.parts.join(MERGE_SEPARATOR);

        for chunk in format::chunk_message(&text) {
            self.rate_limit(chat_id).await;
            let outcome = send_with_fallback(
                &self.bot,
                chat_id,
                task.thread_id,
                chunk,
                None,
            )
            .await;
            if let SendOutcome::Failed(e) = outcome {
                tracing::warn!("Failed to send content to chat {chat_id}: {e}");
            }
        }
    }

    /// Create, edit, or delete the window's status message.
    async fn apply_status(&self, user_id: u64, task: &MessageTask) {
        let key = (user_id, task.window_id.clone());
        let chat_id = self
            .session_manager
            .resolve_chat_id(user_id, task.thread_id.unwrap_or(0));

        let new_text = task.parts.first().cloned();
        let existing = {
            let status = self.status_messages.lock().expect("status lock poisoned");
            status
                .get(&key)
                .map(|s| (s.chat_id, s.message_id, s.text.clone()))
        };

        match (new_text, existing) {
            (None, Some((old_chat, message_id, _))) => {
                self.rate_limit(old_chat).await;
                if let Err(e) = self.bot.delete_message(ChatId(old_chat), message_id).await {
                    tracing::debug!("Failed to delete status message: {e}");
                }
                self.status_messages
                    .lock()
                    .expect("status lock poisoned")
                    .remove(&key);
            }
            (None, None) => {}
            (Some(text), Some((old_chat, message_id, old_text))) => {
                if text == old_text {
                    return;
                }
                self.rate_limit(old_chat).await;
                let keyboard = self.status_keyboard(&task.window_id);
                let edit = self
                    .bot
                    .edit_message_text(ChatId(old_chat), message_id, text.clone())
                    .reply_markup(keyboard)
                    .await;
                match edit {
                    Ok(_) => {
                        if let Some(status) = self
                            .status_messages
                            .lock()
                            .expect("status lock poisoned")
                            .get_mut(&key)
                        {
                            status.text = text;
                        }
                    }
                    Err(e) => {
                        tracing::debug!("Status edit failed, recreating: {e}");
                        self.status_messages
                            .lock()
                            .expect("status lock poisoned")
                            .remove(&key);
                        self.create_status_message(user_id, task, chat_id, text).await;
                    }
                }
            }
            (Some(text), None) => {
                self.create_status_message(user_id, task, chat_id, text).await;
            }
        }
    }

    async fn create_status_message(
        &self,
        user_id: u64,
        task: &MessageTask,
        chat_id: i64,
        text: String,
    ) {
        self.rate_limit(chat_id).await;
        let keyboard = self.status_keyboard(&task.window_id);
        let outcome = send_with_fallback(
            &self.bot,
            chat_id,
            task.thread_id,
            &text,
            Some(keyboard),
        )
        .await;
        if let SendOutcome::Sent(message_id) = outcome {
            self.status_messages
                .lock()
                .expect("status lock poisoned")
                .insert(
                    (user_id, task.window_id.clone()),
                    StatusMessage {
                        chat_id,
                        message_id,
                        text,
                    },
                );
        }
    }

    /// Inline keyboard attached to status messages: Esc, Screenshot,
    /// notification-mode cycle, and a recall row for the last command.
    fn status_keyboard(&self, window_id: &str) -> InlineKeyboardMarkup {
        let mode = self.session_manager.get_notification_mode(window_id);
        let mut rows = vec![vec![
            InlineKeyboardButton::callback("⎋ Esc", format!("esc:{window_id}")),
            InlineKeyboardButton::callback("📸", format!("shot:{window_id}")),
            InlineKeyboardButton::callback(mode.label(), format!("notif:{window_id}")),
        ]];
        if let Some(command) = self.last_command(window_id) {
            rows.push(vec![InlineKeyboardButton::callback(
                format!("↻ {}", format::truncate(&command, 30)),
                format!("recall:{window_id}"),
            )]);
        }
        InlineKeyboardMarkup::new(rows)
    }
}

/// Convert a stored thread id into teloxide's wrapper.
pub fn to_thread_id(thread_id: i32) -> ThreadId {
    ThreadId(MessageId(thread_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content(window: &str, text: &str, content_type: ContentType) -> MessageTask {
        MessageTask {
            kind: TaskKind::Content,
            window_id: window.to_string(),
            thread_id: Some(1),
            parts: vec![text.to_string()],
            content_type: Some(content_type),
        }
    }

    fn status(window: &str, text: Option<&str>) -> MessageTask {
        MessageTask {
            kind: TaskKind::StatusUpdate,
            window_id: window.to_string(),
            thread_id: Some(1),
            parts: text.map(|t| vec![t.to_string()]).unwrap_or_default(),
            content_type: None,
        }
    }

    #[test]
    fn test_merge_adjacent_text() {
        let mut queue: VecDeque<MessageTask> = [
            content("@1", "first", ContentType::Text),
            content("@1", "second", ContentType::Thinking),
            content("@1", "third", ContentType::Text),
        ]
        .into();

        let merged = pop_merged(&mut queue).unwrap();
        assert_eq!(merged.parts, ["first", "second", "third"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_merge_stops_at_tool_use() {
        let mut queue: VecDeque<MessageTask> = [
            content("@1", "a", ContentType::Text),
            content("@1", "tool", ContentType::ToolUse),
            content("@1", "b", ContentType::Text),
        ]
        .into();

        let merged = pop_merged(&mut queue).unwrap();
        assert_eq!(merged.parts, ["a"]);
        // Chain broken: the tool task and everything after stay queued in
        // order.
        assert_eq!(queue.len(), 2);
        assert_eq!(queue[0].content_type, Some(ContentType::ToolUse));
        assert_eq!(queue[1].parts, ["b"]);
    }

    #[test]
    fn test_merge_respects_window_boundary() {
        let mut queue: VecDeque<MessageTask> = [
            content("@1", "a", ContentType::Text),
            content("@2", "b", ContentType::Text),
        ]
        .into();

        let merged = pop_merged(&mut queue).unwrap();
        assert_eq!(merged.parts, ["a"]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_merge_respects_length_cap() {
        let big = "x".repeat(MERGE_MAX_LENGTH - 100);
        let mut queue: VecDeque<MessageTask> = [
            content("@1", &big, ContentType::Text),
            content("@1", &"y".repeat(200), ContentType::Text),
        ]
        .into();

        let merged = pop_merged(&mut queue).unwrap();
        assert_eq!(merged.parts.len(), 1);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_merge_skips_status_tasks() {
        let mut queue: VecDeque<MessageTask> =
            [status("@1", Some("…working")), content("@1", "a", ContentType::Text)].into();

        let first = pop_merged(&mut queue).unwrap();
        assert_eq!(first.kind, TaskKind::StatusUpdate);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_merge_tool_first_passes_through() {
        let mut queue: VecDeque<MessageTask> = [
            content("@1", "tool", ContentType::ToolResult),
            content("@1", "after", ContentType::Text),
        ]
        .into();

        let first = pop_merged(&mut queue).unwrap();
        assert_eq!(first.parts, ["tool"]);
        assert_eq!(queue.len(), 1);
    }
}
