//! Bot slash commands: `/new`, `/sessions`, `/resume`, `/history`.

use std::sync::Arc;

use teloxide::prelude::*;
use teloxide::types::Message as TgMessage;
use teloxide::utils::command::BotCommands;

use crate::app::App;
use crate::{browser, dashboard, history, resume_picker};

/// All slash commands the bot itself handles. Anything else in a bound
/// topic is treated as a provider command.
#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase", description = "Available commands:")]
pub enum Command {
    #[command(description = "Start a new session")]
    New,
    #[command(description = "Show the session dashboard")]
    Sessions,
    #[command(description = "Resume a past session in this topic")]
    Resume,
    #[command(description = "Show conversation history")]
    History,
}

/// Entry point for slash commands: authorization, then dispatch.
pub async fn handle_command(
    bot: Bot,
    msg: TgMessage,
    cmd: Command,
    app: Arc<App>,
) -> ResponseResult<()> {
    let user_id = msg.from.as_ref().map(|u| u.id.0).unwrap_or(0);
    let chat_id = msg.chat.id.0;
    if !app.is_update_allowed(user_id, chat_id) {
        return Ok(()); // Silent drop.
    }

    let thread_id = msg.thread_id.map(|t| t.0.0);
    if let Some(thread_id) = thread_id
        && chat_id != user_id as i64
    {
        app.session_manager.set_group_chat_id(user_id, thread_id, chat_id);
    }

    match cmd {
        Command::Sessions => {
            dashboard::show_dashboard(&bot, &app, user_id, chat_id, thread_id).await;
        }
        Command::New => match thread_id {
            Some(thread_id) => browser::open_browser(&bot, &app, user_id, thread_id, None).await,
            None => reply_topic_required(&bot, &msg).await?,
        },
        Command::Resume => match thread_id {
            Some(thread_id) => {
                resume_picker::show_resume_picker(&bot, &app, user_id, thread_id).await;
            }
            None => reply_topic_required(&bot, &msg).await?,
        },
        Command::History => match thread_id {
            Some(thread_id) => history::show_history(&bot, &app, user_id, thread_id).await,
            None => reply_topic_required(&bot, &msg).await?,
        },
    }
    Ok(())
}

async fn reply_topic_required(bot: &Bot, msg: &TgMessage) -> ResponseResult<()> {
    let mut request = bot.send_message(
        msg.chat.id,
        "This command works inside a forum topic. Open or create a topic first.",
    );
    if let Some(thread) = msg.thread_id {
        request = request.message_thread_id(thread);
    }
    request.await?;
    Ok(())
}

/// Helper for handlers that need the raw thread id.
pub fn thread_of(msg: &TgMessage) -> Option<i32> {
    msg.thread_id.map(|t| t.0.0)
}
