//! Low-level outbound sends: MarkdownV2 with plaintext fallback, and
//! `RetryAfter` handled as a value at the send boundary.

use teloxide::prelude::*;
use teloxide::types::{ChatId, InlineKeyboardMarkup, MessageId, ParseMode};

use crate::format::strip_backslashes;
use crate::queue::to_thread_id;

/// Result of one send attempt after fallback handling.
pub enum SendOutcome {
    Sent(MessageId),
    Failed(teloxide::RequestError),
}

/// Send text as MarkdownV2; on a parse rejection retry once as plaintext
/// with escape backslashes stripped. A 429 is honored by sleeping for the
/// server-provided delay and retrying once.
pub async fn send_with_fallback(
    bot: &Bot,
    chat_id: i64,
    thread_id: Option<i32>,
    text: &str,
    keyboard: Option<InlineKeyboardMarkup>,
) -> SendOutcome {
    match try_send(bot, chat_id, thread_id, text, keyboard.clone(), true).await {
        Ok(message_id) => SendOutcome::Sent(message_id),
        Err(teloxide::RequestError::RetryAfter(seconds)) => {
            tracing::warn!(
                "Rate limited by Telegram, sleeping {}s",
                seconds.duration().as_secs()
            );
            tokio::time::sleep(seconds.duration()).await;
            match try_send(bot, chat_id, thread_id, text, keyboard, true).await {
                Ok(message_id) => SendOutcome::Sent(message_id),
                Err(e) => SendOutcome::Failed(e),
            }
        }
        Err(teloxide::RequestError::Api(_)) => {
            // Markdown parse rejection: deliver as plaintext instead of
            // dropping the message.
            let plain = strip_backslashes(text);
            match try_send(bot, chat_id, thread_id, &plain, keyboard, false).await {
                Ok(message_id) => SendOutcome::Sent(message_id),
                Err(e) => SendOutcome::Failed(e),
            }
        }
        Err(e) => SendOutcome::Failed(e),
    }
}

async fn try_send(
    bot: &Bot,
    chat_id: i64,
    thread_id: Option<i32>,
    text: &str,
    keyboard: Option<InlineKeyboardMarkup>,
    markdown: bool,
) -> Result<MessageId, teloxide::RequestError> {
    let mut request = bot.send_message(ChatId(chat_id), text);
    if markdown {
        request = request.parse_mode(ParseMode::MarkdownV2);
    }
    if let Some(thread_id) = thread_id {
        request = request.message_thread_id(to_thread_id(thread_id));
    }
    if let Some(keyboard) = keyboard {
        request = request.reply_markup(keyboard);
    }
    let message = request.await?;
    Ok(message.id)
}

/// Whether an API error reports that the forum topic no longer exists.
pub fn is_topic_gone(error: &teloxide::RequestError) -> bool {
    match error {
        teloxide::RequestError::Api(api) => {
            let text = api.to_string().to_uppercase();
            text.contains("TOPIC_ID_INVALID") || text.contains("TOPIC_DELETED")
        }
        _ => false,
    }
}
