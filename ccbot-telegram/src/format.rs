//! Outbound text formatting: MarkdownV2 escaping and message chunking.

/// Telegram's maximum message length in characters.
pub const TELEGRAM_MSG_LIMIT: usize = 4096;

/// Characters MarkdownV2 requires escaping outside code spans.
const MDV2_SPECIAL: &str = r"_*[]()~`>#+-=|{}.!";

/// Escape text for MarkdownV2.
pub fn escape_markdown_v2(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    for c in text.chars() {
        if MDV2_SPECIAL.contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Remove escape backslashes for the plaintext fallback send.
pub fn strip_backslashes(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\'
            && chars
                .peek()
                .is_some_and(|next| MDV2_SPECIAL.contains(*next))
        {
            continue;
        }
        out.push(c);
    }
    out
}

/// Render a block of terminal or transcript text as a MarkdownV2 code
/// block (content needs only `` ` `` and `\` escaped inside).
pub fn code_block(text: &str) -> String {
    let escaped = text.replace('\\', r"\\").replace('`', r"\`");
    format!("```\n{escaped}\n```")
}

/// Largest index ≤ `limit` that falls on a char boundary.
fn floor_char_boundary(text: &str, limit: usize) -> usize {
    if limit >= text.len() {
        return text.len();
    }
    let mut idx = limit;
    while idx > 0 && !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Split a message into chunks within Telegram's length limit.
///
/// Splitting priority: paragraph boundary, newline, space, hard split.
pub fn chunk_message(text: &str) -> Vec<&str> {
    if text.len() <= TELEGRAM_MSG_LIMIT {
        return vec![text];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while remaining.len() > TELEGRAM_MSG_LIMIT {
        let limit = floor_char_boundary(remaining, TELEGRAM_MSG_LIMIT);
        let slice = &remaining[..limit];

        let split_at = slice
            .rfind("\n\n")
            .or_else(|| slice.rfind('\n'))
            .or_else(|| slice.rfind(' '))
            .map(|pos| pos + 1)
            .unwrap_or(limit);

        let (chunk, rest) = remaining.split_at(split_at);
        chunks.push(chunk);
        remaining = rest.trim_start_matches('\n');
    }

    if !remaining.is_empty() {
        chunks.push(remaining);
    }
    chunks
}

/// Truncate to at most `max` characters, appending `…` when shortened.
pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_markdown_v2() {
        assert_eq!(escape_markdown_v2("a_b*c.d"), r"a\_b\*c\.d");
        assert_eq!(escape_markdown_v2("plain text"), "plain text");
    }

    #[test]
    fn test_strip_backslashes_only_escapes() {
        assert_eq!(strip_backslashes(r"a\_b\.c"), "a_b.c");
        // A backslash before a non-special char is real content.
        assert_eq!(strip_backslashes(r"C:\new"), r"C:\new");
    }

    #[test]
    fn test_chunk_short_message() {
        assert_eq!(chunk_message("hello"), vec!["hello"]);
    }

    #[test]
    fn test_chunk_long_message_preserves_content() {
        let text = "a".repeat(10_000);
        let chunks = chunk_message(&text);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.len() <= TELEGRAM_MSG_LIMIT);
        }
        assert_eq!(chunks.join(""), text);
    }

    #[test]
    fn test_chunk_prefers_paragraph_boundary() {
        let text = format!("{}\n\n{}", "a".repeat(3000), "b".repeat(3000));
        let chunks = chunk_message(&text);
        assert!(chunks.len() >= 2);
        assert!(chunks[0].trim_end().chars().all(|c| c == 'a'));
    }

    #[test]
    fn test_chunk_multibyte_safety() {
        let text = "привет мир ".repeat(500);
        let chunks = chunk_message(&text);
        assert!(chunks.len() >= 2);
        for chunk in chunks {
            assert!(chunk.len() <= TELEGRAM_MSG_LIMIT);
            let _ = chunk.chars().count(); // Would panic on a split codepoint.
        }
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghij", 5), "abcd…");
    }

    #[test]
    fn test_code_block_escapes_backticks() {
        let block = code_block("echo `hi`");
        assert!(block.starts_with("```\n"));
        assert!(block.contains(r"\`hi\`"));
    }
}
