//! VT100 screen buffer — renders raw tmux captures into clean text rows.
//!
//! Feeds raw pane captures (with ANSI/CSI escape sequences) into a `vt100`
//! virtual terminal, producing rendered lines stripped of control codes.
//! The terminal parser operates on these rendered lines rather than the raw
//! byte stream, which makes status and interactive-UI detection robust
//! against cursor-movement redraws.

/// Default screen width used when the real pane size is unknown.
pub const DEFAULT_COLUMNS: u16 = 200;
/// Default screen height used when the real pane size is unknown.
pub const DEFAULT_ROWS: u16 = 50;

/// Virtual terminal screen backed by a `vt100::Parser`.
pub struct ScreenBuffer {
    parser: vt100::Parser,
    rows: u16,
    columns: u16,
}

impl ScreenBuffer {
    /// Create a screen with the given dimensions (no scrollback).
    pub fn new(columns: u16, rows: u16) -> Self {
        Self {
            parser: vt100::Parser::new(rows, columns, 0),
            rows,
            columns,
        }
    }

    /// Screen width in cells.
    pub fn columns(&self) -> u16 {
        self.columns
    }

    /// Screen height in cells.
    pub fn rows(&self) -> u16 {
        self.rows
    }

    /// Feed raw terminal text (with ANSI escapes) into the screen.
    ///
    /// tmux `capture-pane` output uses bare `\n` line endings, but the
    /// emulator treats `\n` as "move down" without returning to column 0,
    /// so newlines are normalized to `\r\n` before processing.
    pub fn feed(&mut self, raw_text: &str) {
        let mut normalized = Vec::with_capacity(raw_text.len() + 64);
        let mut prev = 0u8;
        for &b in raw_text.as_bytes() {
            if b == b'\n' && prev != b'\r' {
                normalized.push(b'\r');
            }
            normalized.push(b);
            prev = b;
        }
        self.parser.process(&normalized);
    }

    /// Rendered lines with trailing whitespace stripped.
    pub fn display(&self) -> Vec<String> {
        let screen = self.parser.screen();
        let mut lines = Vec::with_capacity(self.rows as usize);
        for row in 0..self.rows {
            let mut line = String::with_capacity(self.columns as usize);
            for col in 0..self.columns {
                match screen.cell(row, col) {
                    Some(cell) => {
                        let contents = cell.contents();
                        if contents.is_empty() {
                            line.push(' ');
                        } else {
                            line.push_str(&contents);
                        }
                    }
                    None => line.push(' '),
                }
            }
            lines.push(line.trim_end().to_string());
        }
        lines
    }

    /// Cursor row (Y position) on the virtual screen.
    pub fn cursor_row(&self) -> u16 {
        self.parser.screen().cursor_position().0
    }

    /// Clear all screen state for reuse.
    pub fn reset(&mut self) {
        self.parser = vt100::Parser::new(self.rows, self.columns, 0);
    }
}

impl Default for ScreenBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_COLUMNS, DEFAULT_ROWS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_plain_lines() {
        let mut buf = ScreenBuffer::new(40, 10);
        buf.feed("hello\nworld\n");
        let lines = buf.display();
        assert_eq!(lines[0], "hello");
        assert_eq!(lines[1], "world");
    }

    #[test]
    fn test_feed_strips_ansi_colors() {
        let mut buf = ScreenBuffer::new(40, 10);
        buf.feed("\x1b[31mred text\x1b[0m\nplain");
        let lines = buf.display();
        assert_eq!(lines[0], "red text");
        assert_eq!(lines[1], "plain");
    }

    #[test]
    fn test_trailing_whitespace_stripped() {
        let mut buf = ScreenBuffer::new(40, 10);
        buf.feed("abc   \n");
        assert_eq!(buf.display()[0], "abc");
    }

    #[test]
    fn test_cursor_row_advances() {
        let mut buf = ScreenBuffer::new(40, 10);
        buf.feed("one\ntwo\nthree");
        assert_eq!(buf.cursor_row(), 2);
    }

    #[test]
    fn test_reset_clears_content() {
        let mut buf = ScreenBuffer::new(40, 10);
        buf.feed("something");
        buf.reset();
        assert!(buf.display().iter().all(|l| l.is_empty()));
    }

    #[test]
    fn test_carriage_return_overwrite() {
        let mut buf = ScreenBuffer::new(40, 10);
        buf.feed("aaaa\rbb");
        assert_eq!(buf.display()[0], "bbaa");
    }
}
