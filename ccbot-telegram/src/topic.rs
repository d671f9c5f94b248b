//! Forum-topic helpers: emoji state, rename sync, close.

use std::collections::HashMap;
use std::sync::Mutex;

use teloxide::prelude::*;
use teloxide::types::ChatId;

use crate::queue::to_thread_id;

/// Topic lifecycle state, shown as the topic icon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicState {
    Active,
    Idle,
    Done,
    Dead,
}

impl TopicState {
    /// Free Telegram custom-emoji ID used as the topic icon.
    fn icon_custom_emoji_id(self) -> &'static str {
        match self {
            TopicState::Active => "5379748062124056162",
            TopicState::Idle => "5418085807791545980",
            TopicState::Done => "5237699328843200968",
            TopicState::Dead => "5312526098750498030",
        }
    }
}

/// Cache of the last icon set per topic, to skip redundant edits.
pub type TopicEmojiCache = Mutex<HashMap<(i64, i32), TopicState>>;

/// Set a topic's icon for the given state. No-op when unchanged.
pub async fn update_topic_emoji(
    bot: &Bot,
    cache: &TopicEmojiCache,
    chat_id: i64,
    thread_id: i32,
    state: TopicState,
) {
    {
        let mut cache = cache.lock().expect("topic emoji cache poisoned");
        if cache.get(&(chat_id, thread_id)) == Some(&state) {
            return;
        }
        cache.insert((chat_id, thread_id), state);
    }
    let result = bot
        .edit_forum_topic(ChatId(chat_id), to_thread_id(thread_id))
        .icon_custom_emoji_id(teloxide::types::CustomEmojiId(
            state.icon_custom_emoji_id().to_string(),
        ))
        .await;
    if let Err(e) = result {
        tracing::debug!("Failed to set topic emoji for thread {thread_id}: {e}");
    }
}

/// Drop the cached emoji state for a topic (unbind / deletion path).
pub fn clear_topic_emoji(cache: &TopicEmojiCache, chat_id: i64, thread_id: i32) {
    cache
        .lock()
        .expect("topic emoji cache poisoned")
        .remove(&(chat_id, thread_id));
}

/// Rename a forum topic after a tmux window rename.
pub async fn rename_topic(bot: &Bot, chat_id: i64, thread_id: i32, name: &str) {
    let result = bot
        .edit_forum_topic(ChatId(chat_id), to_thread_id(thread_id))
        .name(name.to_string())
        .await;
    if let Err(e) = result {
        tracing::debug!("Failed to rename topic thread {thread_id}: {e}");
    }
}

/// Close a topic. Closing an already-closed topic is a no-op.
pub async fn close_topic(bot: &Bot, chat_id: i64, thread_id: i32) {
    let result = bot
        .close_forum_topic(ChatId(chat_id), to_thread_id(thread_id))
        .await;
    match result {
        Ok(_) => tracing::info!("Closed topic: chat={chat_id} thread={thread_id}"),
        Err(e) => tracing::debug!("Failed to close topic thread {thread_id}: {e}"),
    }
}
