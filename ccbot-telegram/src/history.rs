//! `/history` — page through a window's transcript with a per-user cursor.
//!
//! Each user keeps a byte offset per window; every `/history` call renders
//! the next slice of user-visible entries and advances the cursor.

use std::path::PathBuf;
use std::sync::Arc;

use teloxide::prelude::*;
use teloxide::types::ChatId;

use crate::app::App;
use crate::format::{chunk_message, truncate};
use crate::queue::to_thread_id;

/// Entries rendered per `/history` invocation.
const HISTORY_PAGE_ENTRIES: usize = 10;

/// Maximum characters per rendered entry.
const HISTORY_ENTRY_MAX: usize = 300;

/// Render the next history page for the topic's window.
pub async fn show_history(bot: &Bot, app: &Arc<App>, user_id: u64, thread_id: i32) {
    let chat_id = app.session_manager.resolve_chat_id(user_id, thread_id);
    let Some(window_id) = app.session_manager.get_thread_binding(user_id, thread_id) else {
        let _ = bot
            .send_message(ChatId(chat_id), "❌ No session bound to this topic")
            .message_thread_id(to_thread_id(thread_id))
            .await;
        return;
    };

    let Some(transcript_path) = transcript_for_window(app, &window_id) else {
        let _ = bot
            .send_message(ChatId(chat_id), "No transcript found for this session yet")
            .message_thread_id(to_thread_id(thread_id))
            .await;
        return;
    };

    let offset = app.session_manager.get_user_window_offset(user_id, &window_id);
    let provider = app.provider_for_window(&window_id);

    let (rendered, new_offset) = {
        let path = transcript_path.clone();
        tokio::task::spawn_blocking(move || {
            render_history_page(provider, &path, offset)
        })
        .await
        .unwrap_or((Vec::new(), offset))
    };

    if rendered.is_empty() {
        let _ = bot
            .send_message(ChatId(chat_id), "No further history")
            .message_thread_id(to_thread_id(thread_id))
            .await;
        return;
    }

    app.session_manager
        .set_user_window_offset(user_id, &window_id, new_offset);

    let text = rendered.join("\n\n");
    for chunk in chunk_message(&text) {
        let _ = bot
            .send_message(ChatId(chat_id), chunk)
            .message_thread_id(to_thread_id(thread_id))
            .await;
    }
}

fn transcript_for_window(app: &App, window_id: &str) -> Option<PathBuf> {
    let session_id = app.session_manager.get_session_id_for_window(window_id)?;
    // The monitor's tracked file path is authoritative; fall back to the
    // conventional per-project location via a scan.
    let projects = &app.config.claude_projects_path;
    let dirs = std::fs::read_dir(projects).ok()?;
    for dir in dirs.flatten() {
        let candidate = dir.path().join(format!("{session_id}.jsonl"));
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}

/// Read entries from `offset`, render up to a page of user-visible ones.
/// Returns the rendered lines and the new byte offset.
fn render_history_page(
    provider: &'static dyn ccbot_core::provider::AgentProvider,
    path: &PathBuf,
    offset: u64,
) -> (Vec<String>, u64) {
    let Ok(content) = std::fs::read(path) else {
        return (Vec::new(), offset);
    };
    let mut offset = offset;
    if (content.len() as u64) < offset {
        offset = 0;
    }

    let mut rendered = Vec::new();
    let mut consumed = offset as usize;
    let buf = &content[offset as usize..];
    let mut cursor = 0usize;

    while rendered.len() < HISTORY_PAGE_ENTRIES {
        let Some(pos) = buf[cursor..].iter().position(|&b| b == b'\n') else {
            break;
        };
        let line_bytes = &buf[cursor..cursor + pos];
        cursor += pos + 1;
        consumed += pos + 1;

        let Some(entry) = std::str::from_utf8(line_bytes)
            .ok()
            .and_then(|line| provider.parse_transcript_line(line))
        else {
            continue;
        };
        // History pages through the user's own prompts.
        if !provider.is_user_transcript_entry(&entry) {
            continue;
        }
        let Some(message) = provider.parse_history_entry(&entry) else {
            continue;
        };
        rendered.push(format!("👤 {}", truncate(&message.text, HISTORY_ENTRY_MAX)));
    }

    (rendered, consumed as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccbot_core::provider::provider_by_name;

    fn write_transcript(lines: &[serde_json::Value]) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.jsonl");
        let content: String = lines
            .iter()
            .map(|l| format!("{l}\n"))
            .collect();
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    fn user_entry(text: &str) -> serde_json::Value {
        serde_json::json!({"type": "user", "message": {"content": text}})
    }

    fn assistant_entry(text: &str) -> serde_json::Value {
        serde_json::json!({
            "type": "assistant",
            "message": {"content": [{"type": "text", "text": text}]},
        })
    }

    #[test]
    fn test_history_renders_user_entries_and_advances() {
        let provider = provider_by_name("claude");
        let (_dir, path) = write_transcript(&[
            user_entry("first"),
            assistant_entry("a reply"),
            user_entry("second"),
        ]);

        let (rendered, offset) = render_history_page(provider, &path, 0);
        assert_eq!(rendered.len(), 2);
        assert!(rendered[0].contains("first"));
        assert!(rendered[1].contains("second"));

        // Cursor advanced to EOF: nothing further.
        let (rendered, _) = render_history_page(provider, &path, offset);
        assert!(rendered.is_empty());
    }

    #[test]
    fn test_history_offset_reset_on_truncation() {
        let provider = provider_by_name("claude");
        let (_dir, path) = write_transcript(&[user_entry("only")]);

        let (rendered, _) = render_history_page(provider, &path, 99_999);
        assert_eq!(rendered.len(), 1);
    }
}
