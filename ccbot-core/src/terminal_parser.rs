//! Terminal output parser — detects agent UI elements in rendered pane text.
//!
//! Operates on rendered line grids (see [`crate::screen_buffer`]) to detect:
//!   - interactive UIs (plan confirmations, permission prompts, selection
//!     menus) via [`UiPattern`] top/bottom delimiter matching;
//!   - the one-line spinner status agents render above a separator row;
//!   - the bottom "chrome" block (prompt + status bar) so `!` command output
//!     can be extracted cleanly.
//!
//! All agent text patterns live here. Supporting a new UI type or a changed
//! agent version means editing the pattern tables, nothing else.

use std::sync::LazyLock;

use regex::Regex;

/// Minimum consecutive `─` characters to recognize a separator row.
const MIN_SEPARATOR_WIDTH: usize = 20;

/// Maximum length of a chrome line (prompt, status bar) between separators.
/// Longer lines are considered actual output content.
const MAX_CHROME_LINE_LENGTH: usize = 80;

/// Content extracted from an interactive UI region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InteractiveUiContent {
    /// The extracted display content (both boundary lines included).
    pub content: String,
    /// Pattern name that matched (e.g. `ExitPlanMode`).
    pub name: String,
}

/// A text-marker pair that delimits an interactive UI region.
///
/// Extraction scans lines top-down: the first line matching any `top`
/// pattern marks the start, the first subsequent line matching any `bottom`
/// pattern marks the end. Both boundary lines are included. `top` and
/// `bottom` hold alternatives — any single match is sufficient, which
/// accommodates wording changes across agent versions.
pub struct UiPattern {
    /// Descriptive label reported in [`InteractiveUiContent::name`].
    pub name: &'static str,
    pub top: Vec<Regex>,
    /// Empty means "extend to the last non-blank line".
    pub bottom: Vec<Regex>,
    /// Minimum lines between top and bottom (inclusive).
    pub min_gap: usize,
    /// Expand upward by up to this many non-blank lines to include the
    /// prompt text preceding the matched region.
    pub context_above: usize,
}

impl UiPattern {
    fn new(name: &'static str, top: &[&str], bottom: &[&str]) -> Self {
        Self {
            name,
            top: compile_all(top),
            bottom: compile_all(bottom),
            min_gap: 2,
            context_above: 0,
        }
    }

    fn min_gap(mut self, gap: usize) -> Self {
        self.min_gap = gap;
        self
    }

    fn context_above(mut self, lines: usize) -> Self {
        self.context_above = lines;
        self
    }
}

fn compile_all(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(p).expect("static UI pattern must compile"))
        .collect()
}

/// Claude Code UI patterns, in declaration order — first match wins.
///
/// The final structural pattern catches selection UIs by the Ink cursor
/// glyph `❯` plus a common action hint, regardless of prompt wording.
pub static CLAUDE_UI_PATTERNS: LazyLock<Vec<UiPattern>> = LazyLock::new(|| {
    vec![
        UiPattern::new(
            "ExitPlanMode",
            &[
                r"^\s*Would you like to proceed\?",
                r"^\s*Claude has written up a plan",
            ],
            &[r"^\s*ctrl-g to edit in ", r"^\s*Esc to (cancel|exit)"],
        ),
        // Multi-tab question UI: the bottom delimiter varies by tab, so the
        // region extends to the last non-blank line.
        UiPattern::new("AskUserQuestion", &[r"^\s*←\s+[☐✔☒]"], &[]).min_gap(1),
        UiPattern::new("AskUserQuestion", &[r"^\s*[☐✔☒]"], &[r"^\s*Enter to select"]).min_gap(1),
        UiPattern::new(
            "PermissionPrompt",
            &[r"^\s*Do you want to proceed\?"],
            &[r"^\s*Esc to cancel"],
        )
        .context_above(2),
        UiPattern::new(
            "RestoreCheckpoint",
            &[r"^\s*Restore the code"],
            &[r"^\s*Enter to continue"],
        ),
        UiPattern::new(
            "Settings",
            &[r"^\s*Settings:"],
            &[r"Esc to cancel", r"^\s*Type to filter"],
        ),
        UiPattern::new("SelectModel", &[r"^\s*Select model"], &[r"Enter to confirm"]),
        UiPattern::new(
            "Selection",
            &[r"^\s*❯"],
            &[r"Esc to cancel", r"Enter to confirm", r"ctrl-g to edit"],
        )
        .min_gap(1)
        .context_above(2),
    ]
});

/// Gemini CLI UI patterns.
pub static GEMINI_UI_PATTERNS: LazyLock<Vec<UiPattern>> = LazyLock::new(|| {
    vec![
        UiPattern::new("PermissionPrompt", &[r"Action Required"], &[r"\(esc"]).min_gap(1),
    ]
});

static RE_LONG_DASH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^─{5,}$").expect("static pattern must compile"));

/// Replace lines of 5+ `─` characters with exactly `─────`.
fn shorten_separators(text: &str) -> String {
    text.lines()
        .map(|line| {
            if RE_LONG_DASH.is_match(line.trim()) {
                "─────"
            } else {
                line
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn try_extract(lines: &[&str], pattern: &UiPattern) -> Option<InteractiveUiContent> {
    let mut top_idx: Option<usize> = None;
    let mut bottom_idx: Option<usize> = None;

    for (i, line) in lines.iter().enumerate() {
        match top_idx {
            None => {
                if pattern.top.iter().any(|p| p.is_match(line)) {
                    top_idx = Some(i);
                }
            }
            Some(_) => {
                if !pattern.bottom.is_empty() && pattern.bottom.iter().any(|p| p.is_match(line)) {
                    bottom_idx = Some(i);
                    break;
                }
            }
        }
    }

    let mut top_idx = top_idx?;

    // No bottom patterns: use the last non-blank line as the boundary.
    if pattern.bottom.is_empty() {
        bottom_idx = lines
            .iter()
            .enumerate()
            .skip(top_idx + 1)
            .rev()
            .find(|(_, l)| !l.trim().is_empty())
            .map(|(i, _)| i);
    }

    let bottom_idx = bottom_idx?;
    if bottom_idx - top_idx < pattern.min_gap {
        return None;
    }

    // Expand upward over preceding prompt text.
    let mut remaining = pattern.context_above;
    while remaining > 0 && top_idx > 0 && !lines[top_idx - 1].trim().is_empty() {
        top_idx -= 1;
        remaining -= 1;
    }

    let content = lines[top_idx..=bottom_idx].join("\n");
    Some(InteractiveUiContent {
        content: shorten_separators(content.trim_end()),
        name: pattern.name.to_string(),
    })
}

/// Extract content from an interactive UI in rendered pane lines.
///
/// Tries each pattern in declaration order; first match wins. Returns
/// `None` if no recognizable interactive UI is found.
pub fn extract_interactive_content(
    pane_text: &str,
    patterns: &[UiPattern],
) -> Option<InteractiveUiContent> {
    if pane_text.is_empty() {
        return None;
    }
    let lines: Vec<&str> = pane_text.trim().split('\n').collect();
    patterns.iter().find_map(|p| try_extract(&lines, p))
}

// ── Status line parsing ─────────────────────────────────────────────────

/// Spinner characters Claude Code uses in its status line (fast path).
const STATUS_SPINNERS: [char; 6] = ['·', '✻', '✽', '✶', '✳', '✢'];

/// Known non-spinner symbols that would otherwise pass the block check.
/// `❯` is the prompt cursor, never a spinner.
const NON_SPINNER_CHARS: &str = "─│┌┐└┘├┤┬┴┼═║╔╗╚╝╠╣╦╩╬>|❯⏵";

/// Check if a character is likely a spinner glyph.
///
/// Two-tier approach: the known spinner set first, then a Unicode block
/// check (symbol blocks U+2190–U+2BFF and emoji, plus the Braille block
/// U+2800–U+28FF used by braille spinners) with box-drawing excluded.
pub fn is_likely_spinner(c: char) -> bool {
    if STATUS_SPINNERS.contains(&c) {
        return true;
    }
    if NON_SPINNER_CHARS.contains(c) {
        return false;
    }
    let cp = c as u32;
    // Box drawing U+2500–U+257F is chrome, never a spinner.
    if (0x2500..=0x257F).contains(&cp) {
        return false;
    }
    // Braille patterns U+2800–U+28FF.
    if (0x2800..=0x28FF).contains(&cp) {
        return true;
    }
    // Arrows, math operators, misc technical, geometric shapes, misc
    // symbols, dingbats — the symbol blocks spinner glyphs come from.
    (0x2190..=0x2BFF).contains(&cp) || (0x1F300..=0x1FAFF).contains(&cp)
}

/// Check if a line is a chrome separator (all `─`, wide enough).
fn is_separator(line: &str) -> bool {
    let stripped = line.trim();
    stripped.chars().count() >= MIN_SEPARATOR_WIDTH && stripped.chars().all(|c| c == '─')
}

/// Extract the raw status line from rendered pane lines.
///
/// The status sits above a chrome separator, possibly with a blank line in
/// between. Separators are scanned bottom-up; when `pane_rows` is given the
/// scan is limited to the bottom 40% of the screen (minimum 16 lines).
/// Returns the text after the spinner glyph.
pub fn parse_status_line(pane_text: &str, pane_rows: Option<usize>) -> Option<String> {
    if pane_text.is_empty() {
        return None;
    }
    let lines: Vec<&str> = pane_text.trim().split('\n').collect();

    let scan_start = match pane_rows {
        Some(rows) => {
            let scan_limit = ((rows * 2) / 5).max(16);
            lines.len().saturating_sub(scan_limit)
        }
        None => 0,
    };

    for i in (scan_start..lines.len()).rev() {
        if !is_separator(lines[i]) {
            continue;
        }
        // Check up to two lines above the separator, skipping blanks.
        for offset in 1..=2usize {
            let Some(j) = i.checked_sub(offset) else {
                break;
            };
            if j < scan_start {
                break;
            }
            let candidate = lines[j].trim();
            if candidate.is_empty() {
                continue;
            }
            let mut chars = candidate.chars();
            let first = chars.next()?;
            if is_likely_spinner(first) {
                let rest = chars.as_str().trim();
                if !rest.is_empty() {
                    return Some(rest.to_string());
                }
            }
            // Non-blank, non-spinner: stop looking above this separator.
            break;
        }
    }
    None
}

/// Keyword → short label table for status display.
///
/// Checked against the first word first, then the whole string, so
/// "Writing tests" maps to "…writing" rather than "…testing".
const STATUS_KEYWORDS: [(&str, &str); 34] = [
    ("think", "…thinking"),
    ("reason", "…thinking"),
    ("test", "…testing"),
    ("read", "…reading"),
    ("edit", "…editing"),
    ("writ", "…writing"),
    ("search", "…searching"),
    ("grep", "…searching"),
    ("glob", "…searching"),
    ("install", "…installing"),
    ("runn", "…running"),
    ("bash", "…running"),
    ("execut", "…running"),
    ("compil", "…building"),
    ("build", "…building"),
    ("lint", "…linting"),
    ("format", "…formatting"),
    ("deploy", "…deploying"),
    ("fetch", "…fetching"),
    ("download", "…downloading"),
    ("upload", "…uploading"),
    ("commit", "…committing"),
    ("push", "…pushing"),
    ("pull", "…pulling"),
    ("clone", "…cloning"),
    ("debug", "…debugging"),
    ("delet", "…deleting"),
    ("creat", "…creating"),
    ("check", "…checking"),
    ("updat", "…updating"),
    ("analyz", "…analyzing"),
    ("analys", "…analyzing"),
    ("pars", "…parsing"),
    ("verif", "…verifying"),
];

/// Convert a raw status line into a short display label.
pub fn format_status_display(raw_status: &str) -> String {
    let lower = raw_status.to_lowercase();
    let first_word = lower.split_whitespace().next().unwrap_or("");
    for (keyword, label) in STATUS_KEYWORDS {
        if first_word.contains(keyword) {
            return label.to_string();
        }
    }
    for (keyword, label) in STATUS_KEYWORDS {
        if lower.contains(keyword) {
            return label.to_string();
        }
    }
    "…working".to_string()
}

// ── Pane chrome stripping & bash output extraction ──────────────────────

/// Find the topmost separator row of the agent's bottom chrome.
///
/// Walks separator rows from the bottom up; a separator joins the chrome
/// block when everything between it and the current boundary is short
/// chrome text (prompt, status bar) or blank.
pub fn find_chrome_boundary(lines: &[&str]) -> Option<usize> {
    let separator_indices: Vec<usize> = lines
        .iter()
        .enumerate()
        .rev()
        .filter(|(_, l)| is_separator(l))
        .map(|(i, _)| i)
        .collect();

    let mut boundary = *separator_indices.first()?;

    for &idx in &separator_indices[1..] {
        let gap_is_chrome = lines[idx + 1..boundary]
            .iter()
            .all(|l| l.trim().is_empty() || l.trim().chars().count() <= MAX_CHROME_LINE_LENGTH);
        if gap_is_chrome {
            boundary = idx;
        } else {
            break;
        }
    }
    Some(boundary)
}

/// Strip the agent's bottom chrome (prompt area + status bar).
pub fn strip_pane_chrome<'a>(lines: &[&'a str]) -> Vec<&'a str> {
    match find_chrome_boundary(lines) {
        Some(boundary) => lines[..boundary].to_vec(),
        None => lines.to_vec(),
    }
}

/// Extract `!` command output from a captured pane.
///
/// Searches from the bottom for the `! <command>` echo line and returns
/// that line plus everything below it, chrome stripped. Matches on the
/// first 10 characters of the command in case the echo is truncated.
pub fn extract_bash_output(pane_text: &str, command: &str) -> Option<String> {
    let all_lines: Vec<&str> = pane_text.lines().collect();
    let lines = strip_pane_chrome(&all_lines);

    let match_prefix: String = command.chars().take(10).collect();
    let cmd_idx = lines.iter().rposition(|l| {
        let stripped = l.trim();
        stripped.starts_with(&format!("! {match_prefix}"))
            || stripped.starts_with(&format!("!{match_prefix}"))
    })?;

    let mut output: Vec<&str> = lines[cmd_idx..].to_vec();
    while output.last().is_some_and(|l| l.trim().is_empty()) {
        output.pop();
    }
    if output.is_empty() {
        return None;
    }
    Some(output.join("\n").trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEP: &str = "────────────────────────────────────────";

    #[test]
    fn test_spinner_fast_path() {
        for c in STATUS_SPINNERS {
            assert!(is_likely_spinner(c), "expected spinner: {c}");
        }
    }

    #[test]
    fn test_spinner_braille() {
        assert!(is_likely_spinner('⠋'));
        assert!(is_likely_spinner('⣷'));
    }

    #[test]
    fn test_spinner_rejects_box_drawing() {
        assert!(!is_likely_spinner('─'));
        assert!(!is_likely_spinner('│'));
        assert!(!is_likely_spinner('┌'));
    }

    #[test]
    fn test_spinner_rejects_letters() {
        assert!(!is_likely_spinner('a'));
        assert!(!is_likely_spinner('0'));
    }

    #[test]
    fn test_parse_status_line_basic() {
        let pane = format!("some output\n\n✻ Thinking about the plan…\n{SEP}\n❯");
        assert_eq!(
            parse_status_line(&pane, None).as_deref(),
            Some("Thinking about the plan…")
        );
    }

    #[test]
    fn test_parse_status_line_blank_between() {
        let pane = format!("✶ Running tests\n\n{SEP}\n❯\n{SEP}");
        assert_eq!(
            parse_status_line(&pane, None).as_deref(),
            Some("Running tests")
        );
    }

    #[test]
    fn test_parse_status_line_none_without_spinner() {
        let pane = format!("regular output\nmore output\n{SEP}\n❯");
        assert_eq!(parse_status_line(&pane, None), None);
    }

    #[test]
    fn test_parse_status_line_scan_window() {
        // Spinner far above the bottom 40% of a 50-row pane is ignored.
        let mut lines = vec!["✻ Old status".to_string(), SEP.to_string()];
        lines.extend(std::iter::repeat_n("filler".to_string(), 40));
        let pane = lines.join("\n");
        assert_eq!(parse_status_line(&pane, Some(50)), None);
    }

    #[test]
    fn test_format_status_display_first_word_priority() {
        assert_eq!(format_status_display("Writing tests"), "…writing");
        assert_eq!(format_status_display("Testing the build"), "…testing");
    }

    #[test]
    fn test_format_status_display_fallback_whole_string() {
        assert_eq!(format_status_display("Now compiling everything"), "…building");
    }

    #[test]
    fn test_format_status_display_unknown() {
        assert_eq!(format_status_display("Bamboozling"), "…working");
    }

    #[test]
    fn test_extract_exit_plan_mode() {
        let pane = "\
Claude output here

Would you like to proceed?

  1. Yes
  2. No

Esc to cancel";
        let result = extract_interactive_content(pane, &CLAUDE_UI_PATTERNS).unwrap();
        assert_eq!(result.name, "ExitPlanMode");
        assert!(result.content.starts_with("Would you like to proceed?"));
        assert!(result.content.ends_with("Esc to cancel"));
    }

    #[test]
    fn test_extract_min_gap_rejected() {
        // Top and bottom adjacent — below the default min gap of 2.
        let pane = "Would you like to proceed?\nEsc to cancel";
        assert!(extract_interactive_content(pane, &CLAUDE_UI_PATTERNS).is_none());
    }

    #[test]
    fn test_extract_ask_user_question_no_bottom() {
        let pane = "\
question header
←  ☐ Option A
  ☐ Option B
  ☐ Option C";
        let result = extract_interactive_content(pane, &CLAUDE_UI_PATTERNS).unwrap();
        assert_eq!(result.name, "AskUserQuestion");
        assert!(result.content.ends_with("Option C"));
    }

    #[test]
    fn test_extract_first_pattern_wins() {
        let pane = "\
Would you like to proceed?

Do you want to proceed?

more text
Esc to cancel";
        let result = extract_interactive_content(pane, &CLAUDE_UI_PATTERNS).unwrap();
        assert_eq!(result.name, "ExitPlanMode");
    }

    #[test]
    fn test_extract_structural_catch_all() {
        let pane = "\
Pick a thing

❯ 1. First choice
  2. Second choice

Enter to confirm · Esc to cancel";
        let result = extract_interactive_content(pane, &CLAUDE_UI_PATTERNS).unwrap();
        assert_eq!(result.name, "Selection");
        // context_above pulls in the prompt line? It is separated by a blank,
        // so expansion stops at the blank line.
        assert!(result.content.starts_with("❯ 1. First choice"));
    }

    #[test]
    fn test_extract_context_above_expansion() {
        let pane = "\
Claude wants to run: rm -rf build
Do you want to proceed?

  1. Yes
  2. No

Esc to cancel";
        let result = extract_interactive_content(pane, &CLAUDE_UI_PATTERNS).unwrap();
        assert_eq!(result.name, "PermissionPrompt");
        assert!(result.content.starts_with("Claude wants to run"));
    }

    #[test]
    fn test_extract_gemini_permission_prompt() {
        let pane = "\
Action Required: approve shell command
  ls -la
(esc to cancel)";
        let result = extract_interactive_content(pane, &GEMINI_UI_PATTERNS).unwrap();
        assert_eq!(result.name, "PermissionPrompt");
    }

    #[test]
    fn test_long_separators_collapsed() {
        let pane = format!("Would you like to proceed?\n{SEP}\nchoices\n\nEsc to cancel");
        let result = extract_interactive_content(&pane, &CLAUDE_UI_PATTERNS).unwrap();
        assert!(result.content.contains("\n─────\n"));
        assert!(!result.content.contains(SEP));
    }

    #[test]
    fn test_find_chrome_boundary() {
        let lines = vec!["real output", SEP, "❯", SEP, "  [Opus] Context: 34%"];
        assert_eq!(find_chrome_boundary(&lines), Some(1));
    }

    #[test]
    fn test_chrome_boundary_stops_at_content() {
        let long_content = "x".repeat(120);
        let lines = vec![SEP, long_content.as_str(), SEP, "❯"];
        // The long line between separators is content, not chrome.
        assert_eq!(find_chrome_boundary(&lines), Some(2));
    }

    #[test]
    fn test_extract_bash_output() {
        let pane = format!(
            "older output\n! ls -la\n⎿ total 16\n⎿ drwxr-xr-x .\n\n{SEP}\n❯\n{SEP}"
        );
        let out = extract_bash_output(&pane, "ls -la").unwrap();
        assert!(out.starts_with("! ls -la"));
        assert!(out.contains("total 16"));
        assert!(!out.contains('❯'));
    }

    #[test]
    fn test_extract_bash_output_truncated_echo() {
        let pane = "! very-long-comm\noutput line";
        let out = extract_bash_output(pane, "very-long-command --with-flags").unwrap();
        assert!(out.contains("output line"));
    }

    #[test]
    fn test_extract_bash_output_missing() {
        assert_eq!(extract_bash_output("no echo here", "ls"), None);
    }
}
