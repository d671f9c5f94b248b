//! Terminal status polling for thread-bound windows.
//!
//! A 1 s background loop that, for every binding:
//!   - probes topic existence every 60 s and cleans up deleted topics;
//!   - announces dead windows once, with a recovery keyboard;
//!   - syncs tmux window renames to topic titles;
//!   - parses the pane (screen buffer first, provider regex fallback) for
//!     interactive UIs and spinner status lines;
//!   - drives the topic emoji state machine (active/idle/done/dead) with
//!     the startup grace window, transcript-activity heuristic, and shell
//!     detection;
//!   - arms and fires the done/dead auto-close timers, the idle status
//!     auto-clear, and the unbound-window TTL.
//!
//! Loop errors back off exponentially (2 s → 30 s) and never kill the
//! loop.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use teloxide::prelude::*;
use teloxide::types::{ChatAction, ChatId};

use ccbot_core::provider::StatusUpdate;
use ccbot_core::screen_buffer::{DEFAULT_ROWS, ScreenBuffer};
use ccbot_core::session::NotificationMode;
use ccbot_core::terminal_parser::{
    extract_interactive_content, format_status_display, parse_status_line,
};

use crate::app::App;
use crate::interactive::{clear_interactive_message, render_interactive_ui};
use crate::queue::to_thread_id;
use crate::recovery::send_dead_window_notification;
use crate::send::is_topic_gone;
use crate::topic::{TopicEmojiCache, TopicState, clear_topic_emoji, rename_topic, update_topic_emoji};

/// Polling frequency; rate limiting happens at the send layer.
pub const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Topic existence probe frequency.
const TOPIC_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Typing indicator refresh (Telegram expires it after ~5 s).
const TYPING_INTERVAL: Duration = Duration::from_secs(4);

/// How long "✓ Ready" stays up before it is cleared.
const IDLE_CLEAR_DELAY: Duration = Duration::from_secs(10);

/// Recent-transcript-write window treated as "agent is active".
const ACTIVITY_THRESHOLD: Duration = Duration::from_secs(10);

/// Grace period after launch before a silent window counts as idle.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Status message text for an idle-but-alive agent.
pub const IDLE_STATUS_TEXT: &str = "✓ Ready";

const BACKOFF_MIN: Duration = Duration::from_secs(2);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Shell commands indicating the agent exited and the shell is back.
const SHELL_COMMANDS: [&str; 8] = ["bash", "zsh", "fish", "sh", "dash", "tcsh", "csh", "ksh"];

/// Check if the pane is running a plain shell (agent has exited).
pub fn is_shell_prompt(pane_current_command: &str) -> bool {
    let cmd = pane_current_command
        .trim()
        .rsplit('/')
        .next()
        .unwrap_or("");
    SHELL_COMMANDS.contains(&cmd)
}

/// All mutable poller bookkeeping, shared with the hook-event router.
#[derive(Default)]
pub struct PollerState {
    /// Topics already notified about a dead window.
    dead_notified: Mutex<HashSet<(u64, i32, String)>>,
    /// (user, thread) → (state, entered-at) for done/dead auto-close.
    autoclose: Mutex<HashMap<(u64, i32), (TopicState, Instant)>>,
    /// Unbound live windows → first-seen-unbound time.
    unbound_timers: Mutex<HashMap<String, Instant>>,
    /// Windows that have shown at least one status line.
    has_seen_status: Mutex<HashSet<String>>,
    /// Windows in their startup grace period.
    startup_times: Mutex<HashMap<String, Instant>>,
    /// (user, thread) → (window, idle-entered-at) for the ✓ Ready clear.
    idle_clear: Mutex<HashMap<(u64, i32), (String, Instant)>>,
    /// Windows whose idle status was already cleared.
    idle_cleared: Mutex<HashSet<String>>,
    /// Typing indicator throttle.
    last_typing: Mutex<HashMap<(u64, i32), Instant>>,
    /// Per-window screen buffers for ANSI-aware parsing.
    screen_buffers: Mutex<HashMap<String, ScreenBuffer>>,
    /// Last emoji set per topic.
    pub topic_emojis: TopicEmojiCache,
}

impl PollerState {
    /// Mark a topic as done/dead for auto-close. Re-arming with the same
    /// state keeps the original deadline.
    pub fn start_autoclose(&self, user_id: u64, thread_id: i32, state: TopicState) {
        let mut timers = self.autoclose.lock().expect("autoclose lock poisoned");
        let entry = timers.entry((user_id, thread_id));
        match entry {
            std::collections::hash_map::Entry::Occupied(mut slot) => {
                if slot.get().0 != state {
                    slot.insert((state, Instant::now()));
                }
            }
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert((state, Instant::now()));
            }
        }
    }

    pub fn clear_autoclose(&self, user_id: u64, thread_id: i32) {
        self.autoclose
            .lock()
            .expect("autoclose lock poisoned")
            .remove(&(user_id, thread_id));
    }

    /// Forget startup/status tracking for a window (Stop hook, cleanup).
    pub fn clear_seen_status(&self, window_id: &str) {
        self.has_seen_status
            .lock()
            .expect("seen status lock poisoned")
            .remove(window_id);
        self.startup_times
            .lock()
            .expect("startup lock poisoned")
            .remove(window_id);
        self.idle_cleared
            .lock()
            .expect("idle cleared lock poisoned")
            .remove(window_id);
    }

    /// Full per-topic cleanup on unbind or topic deletion.
    pub fn clear_topic_state(&self, user_id: u64, thread_id: i32, window_id: &str) {
        self.dead_notified
            .lock()
            .expect("dead notified lock poisoned")
            .retain(|(u, t, _)| !(*u == user_id && *t == thread_id));
        self.clear_autoclose(user_id, thread_id);
        self.idle_clear
            .lock()
            .expect("idle clear lock poisoned")
            .remove(&(user_id, thread_id));
        self.last_typing
            .lock()
            .expect("typing lock poisoned")
            .remove(&(user_id, thread_id));
        self.clear_seen_status(window_id);
        self.screen_buffers
            .lock()
            .expect("screen buffers lock poisoned")
            .remove(window_id);
    }

    fn mark_seen_status(&self, window_id: &str) {
        self.has_seen_status
            .lock()
            .expect("seen status lock poisoned")
            .insert(window_id.to_string());
        self.startup_times
            .lock()
            .expect("startup lock poisoned")
            .remove(window_id);
        self.idle_cleared
            .lock()
            .expect("idle cleared lock poisoned")
            .remove(window_id);
    }

    fn cancel_idle_clear(&self, user_id: u64, thread_id: i32) {
        self.idle_clear
            .lock()
            .expect("idle clear lock poisoned")
            .remove(&(user_id, thread_id));
    }
}

/// Run the status polling loop until shutdown.
pub async fn run_status_poller(
    bot: Bot,
    app: Arc<App>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    tracing::info!("Status polling started (interval {STATUS_POLL_INTERVAL:?})");
    let mut last_topic_check = Instant::now() - TOPIC_CHECK_INTERVAL;
    let mut error_streak = 0u32;

    loop {
        if *shutdown.borrow() {
            break;
        }
        let delay = match poll_cycle(&bot, &app, &mut last_topic_check).await {
            Ok(()) => {
                error_streak = 0;
                STATUS_POLL_INTERVAL
            }
            Err(e) => {
                tracing::warn!("Status poll loop error: {e}");
                let factor = 2u32.saturating_pow(error_streak.min(8));
                error_streak = error_streak.saturating_add(1);
                (BACKOFF_MIN * factor).min(BACKOFF_MAX)
            }
        };
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {}
        }
    }
    tracing::info!("Status polling stopped");
}

async fn poll_cycle(
    bot: &Bot,
    app: &Arc<App>,
    last_topic_check: &mut Instant,
) -> Result<(), ccbot_core::TmuxError> {
    if last_topic_check.elapsed() >= TOPIC_CHECK_INTERVAL {
        *last_topic_check = Instant::now();
        probe_topics(bot, app).await;
    }

    for (user_id, thread_id, window_id) in app.session_manager.iter_thread_bindings() {
        // Already announced dead: skip until recovery or auto-close.
        let already_dead = app
            .poller
            .dead_notified
            .lock()
            .expect("dead notified lock poisoned")
            .contains(&(user_id, thread_id, window_id.clone()));
        if already_dead {
            continue;
        }

        match app.tmux.find_window_by_id(&window_id).await? {
            None => {
                handle_dead_window(bot, app, user_id, thread_id, &window_id).await;
            }
            Some(window) => {
                // Don't fight the queue for the rate floor while content
                // is draining.
                if app.queue.is_busy(user_id) {
                    continue;
                }
                update_status_message(bot, app, user_id, thread_id, &window).await;
            }
        }
    }

    check_autoclose_timers(bot, app).await;
    check_idle_clear_timers(app).await;
    check_unbound_window_ttl(app).await;
    Ok(())
}

/// Probe each bound topic with a no-op call; clean up deleted topics.
async fn probe_topics(bot: &Bot, app: &Arc<App>) {
    for (user_id, thread_id, window_id) in app.session_manager.iter_thread_bindings() {
        let chat_id = app.session_manager.resolve_chat_id(user_id, thread_id);
        let result = bot
            .unpin_all_forum_topic_messages(ChatId(chat_id), to_thread_id(thread_id))
            .await;
        let Err(error) = result else {
            continue;
        };
        if !is_topic_gone(&error) {
            tracing::debug!("Topic probe error for {window_id}: {error}");
            continue;
        }
        // Topic deleted by the user: kill the window and unbind.
        if let Err(e) = app.tmux.kill_window(&window_id).await {
            tracing::debug!("Failed to kill window {window_id}: {e}");
        }
        app.session_manager.unbind_thread(user_id, thread_id);
        app.session_manager.forget_window(&window_id);
        app.queue.forget_window(user_id, &window_id);
        app.poller.clear_topic_state(user_id, thread_id, &window_id);
        clear_topic_emoji(&app.poller.topic_emojis, chat_id, thread_id);
        tracing::info!(
            "Topic deleted: killed window {window_id}, unbound thread {thread_id} for user {user_id}"
        );
    }
}

/// Announce a dead window once: recovery keyboard, dead emoji, timer.
async fn handle_dead_window(
    bot: &Bot,
    app: &Arc<App>,
    user_id: u64,
    thread_id: i32,
    window_id: &str,
) {
    app.poller.clear_seen_status(window_id);
    let chat_id = app.session_manager.resolve_chat_id(user_id, thread_id);
    update_topic_emoji(bot, &app.poller.topic_emojis, chat_id, thread_id, TopicState::Dead).await;
    app.poller.start_autoclose(user_id, thread_id, TopicState::Dead);

    if send_dead_window_notification(bot, app, user_id, thread_id, window_id).await {
        app.poller
            .dead_notified
            .lock()
            .expect("dead notified lock poisoned")
            .insert((user_id, thread_id, window_id.to_string()));
    }
}

/// Parse the pane through a cached screen buffer; provider regex fallback.
async fn parse_pane_status(app: &App, window_id: &str, pane_text: &str) -> Option<StatusUpdate> {
    let provider = app.provider_for_window(window_id);

    let rendered = {
        let mut buffers = app
            .poller
            .screen_buffers
            .lock()
            .expect("screen buffers lock poisoned");
        let buffer = buffers
            .entry(window_id.to_string())
            .or_insert_with(ScreenBuffer::default);
        buffer.reset();
        buffer.feed(pane_text);
        buffer.display().join("\n")
    };

    // Interactive UI takes precedence over the status line.
    if let Some(ui) = extract_interactive_content(&rendered, provider.ui_patterns()) {
        return Some(StatusUpdate {
            raw_text: ui.content,
            display_label: ui.name.clone(),
            is_interactive: true,
            ui_type: Some(ui.name),
        });
    }
    if let Some(raw) = parse_status_line(&rendered, Some(DEFAULT_ROWS as usize)) {
        let label = format_status_display(&raw);
        return Some(StatusUpdate {
            raw_text: raw,
            display_label: label,
            is_interactive: false,
            ui_type: None,
        });
    }

    // Screen-based parsing found nothing: provider regex fallback, with
    // the pane title for providers that mirror state there.
    let pane_title = if provider.capabilities().uses_pane_title {
        app.tmux
            .get_pane_title(window_id)
            .await
            .unwrap_or_default()
    } else {
        String::new()
    };
    provider.parse_terminal_status(&rendered, &pane_title)
}

async fn send_typing_throttled(bot: &Bot, app: &App, user_id: u64, thread_id: i32) {
    {
        let mut typing = app.poller.last_typing.lock().expect("typing lock poisoned");
        let now = Instant::now();
        match typing.get(&(user_id, thread_id)) {
            Some(last) if now.duration_since(*last) < TYPING_INTERVAL => return,
            _ => typing.insert((user_id, thread_id), now),
        };
    }
    let chat_id = app.session_manager.resolve_chat_id(user_id, thread_id);
    let _ = bot
        .send_chat_action(ChatId(chat_id), ChatAction::Typing)
        .message_thread_id(to_thread_id(thread_id))
        .await;
}

/// Poll one bound window: rename sync, UI detection, status, emoji.
async fn update_status_message(
    bot: &Bot,
    app: &Arc<App>,
    user_id: u64,
    thread_id: i32,
    window: &ccbot_core::TmuxWindow,
) {
    let window_id = window.window_id.clone();
    let chat_id = app.session_manager.resolve_chat_id(user_id, thread_id);

    // Rename sync: tmux window name is the source of truth.
    let stored_name = app.session_manager.get_display_name(&window_id);
    if stored_name != window.window_name && stored_name != window_id {
        app.session_manager
            .set_display_name(&window_id, &window.window_name);
        rename_topic(bot, chat_id, thread_id, &window.window_name).await;
        tracing::info!("Window renamed: {stored_name} -> {}", window.window_name);
    }

    let Ok(Some(pane_text)) = app.tmux.capture_pane(&window_id).await else {
        // Transient capture failure: keep the existing status.
        return;
    };

    let status = parse_pane_status(app, &window_id, &pane_text).await;

    let interactive_window = app.interactive.window(user_id, thread_id);
    let mut check_new_ui = true;
    match interactive_window {
        Some(active) if active == window_id => {
            if status.as_ref().is_some_and(|s| s.is_interactive) {
                // Still showing: the user is interacting, leave it alone.
                return;
            }
            // UI gone: leave interactive mode, don't re-enter this cycle.
            clear_interactive_message(bot, app, user_id, thread_id).await;
            check_new_ui = false;
        }
        Some(_) => {
            // Interactive mode points at a different window; stale.
            clear_interactive_message(bot, app, user_id, thread_id).await;
        }
        None => {}
    }

    if check_new_ui && status.as_ref().is_some_and(|s| s.is_interactive) {
        app.interactive.enter(user_id, thread_id, &window_id);
        if !render_interactive_ui(bot, app, user_id, &window_id, thread_id).await {
            app.interactive.clear(user_id, thread_id);
        }
        return;
    }

    let notif_mode = app.session_manager.get_notification_mode(&window_id);
    let status_label = status
        .as_ref()
        .filter(|s| !s.is_interactive)
        .map(|s| s.display_label.clone());

    match status_label {
        Some(label) => {
            app.poller.mark_seen_status(&window_id);
            app.poller.cancel_idle_clear(user_id, thread_id);
            send_typing_throttled(bot, app, user_id, thread_id).await;
            if !notif_mode.suppresses_status() {
                let display = decorate_status(app, &window_id, &label);
                app.queue
                    .enqueue_status(user_id, &window_id, Some(thread_id), Some(display));
            }
            update_topic_emoji(
                bot,
                &app.poller.topic_emojis,
                chat_id,
                thread_id,
                TopicState::Active,
            )
            .await;
            app.poller.clear_autoclose(user_id, thread_id);
        }
        None => {
            handle_no_status(
                bot,
                app,
                user_id,
                thread_id,
                &window_id,
                &window.pane_current_command,
                notif_mode,
            )
            .await;
        }
    }
}

/// Append the subagent count to a status label when subagents are active.
fn decorate_status(app: &App, window_id: &str, label: &str) -> String {
    let count = app
        .subagents
        .lock()
        .expect("subagents lock poisoned")
        .get(window_id)
        .map(Vec::len)
        .unwrap_or(0);
    if count > 0 {
        format!("{label} (+{count} subagents)")
    } else {
        label.to_string()
    }
}

/// No provider-detected status: transcript heuristic, then shell / idle /
/// startup-grace resolution.
async fn handle_no_status(
    bot: &Bot,
    app: &Arc<App>,
    user_id: u64,
    thread_id: i32,
    window_id: &str,
    pane_current_command: &str,
    notif_mode: NotificationMode,
) {
    let chat_id = app.session_manager.resolve_chat_id(user_id, thread_id);

    // Recent transcript writes mean the agent is working even without a
    // spinner on screen.
    let recently_active = app
        .session_manager
        .get_session_id_for_window(window_id)
        .and_then(|sid| app.activity.last_activity(&sid))
        .is_some_and(|at| at.elapsed() < ACTIVITY_THRESHOLD);
    if recently_active {
        app.poller.mark_seen_status(window_id);
        app.poller.cancel_idle_clear(user_id, thread_id);
        send_typing_throttled(bot, app, user_id, thread_id).await;
        update_topic_emoji(
            bot,
            &app.poller.topic_emojis,
            chat_id,
            thread_id,
            TopicState::Active,
        )
        .await;
        app.poller.clear_autoclose(user_id, thread_id);
        return;
    }

    if is_shell_prompt(pane_current_command) {
        app.poller
            .startup_times
            .lock()
            .expect("startup lock poisoned")
            .remove(window_id);
        update_topic_emoji(
            bot,
            &app.poller.topic_emojis,
            chat_id,
            thread_id,
            TopicState::Done,
        )
        .await;
        app.poller.start_autoclose(user_id, thread_id, TopicState::Done);
        app.poller.cancel_idle_clear(user_id, thread_id);
        app.queue
            .enqueue_status(user_id, window_id, Some(thread_id), None);
        return;
    }

    let has_seen = app
        .poller
        .has_seen_status
        .lock()
        .expect("seen status lock poisoned")
        .contains(window_id);
    if has_seen {
        transition_to_idle(bot, app, user_id, thread_id, window_id, chat_id, notif_mode).await;
        return;
    }

    let startup_elapsed = {
        let mut startup = app
            .poller
            .startup_times
            .lock()
            .expect("startup lock poisoned");
        match startup.get(window_id) {
            Some(since) => Some(since.elapsed()),
            None => {
                // First poll without status: start the grace window.
                startup.insert(window_id.to_string(), Instant::now());
                None
            }
        }
    };

    if startup_elapsed.is_some_and(|elapsed| elapsed >= STARTUP_TIMEOUT) {
        app.poller.mark_seen_status(window_id);
        transition_to_idle(bot, app, user_id, thread_id, window_id, chat_id, notif_mode).await;
    } else {
        // Startup grace: treat as active.
        send_typing_throttled(bot, app, user_id, thread_id).await;
        update_topic_emoji(
            bot,
            &app.poller.topic_emojis,
            chat_id,
            thread_id,
            TopicState::Active,
        )
        .await;
        app.poller.clear_autoclose(user_id, thread_id);
    }
}

async fn transition_to_idle(
    bot: &Bot,
    app: &Arc<App>,
    user_id: u64,
    thread_id: i32,
    window_id: &str,
    chat_id: i64,
    notif_mode: NotificationMode,
) {
    app.poller
        .startup_times
        .lock()
        .expect("startup lock poisoned")
        .remove(window_id);
    update_topic_emoji(
        bot,
        &app.poller.topic_emojis,
        chat_id,
        thread_id,
        TopicState::Idle,
    )
    .await;
    app.poller.clear_autoclose(user_id, thread_id);
    app.poller
        .last_typing
        .lock()
        .expect("typing lock poisoned")
        .remove(&(user_id, thread_id));

    let already_cleared = app
        .poller
        .idle_cleared
        .lock()
        .expect("idle cleared lock poisoned")
        .contains(window_id);
    if already_cleared {
        return;
    }

    if notif_mode.suppresses_status() {
        app.queue
            .enqueue_status(user_id, window_id, Some(thread_id), None);
        return;
    }

    app.queue.enqueue_status(
        user_id,
        window_id,
        Some(thread_id),
        Some(IDLE_STATUS_TEXT.to_string()),
    );
    // The clear countdown starts on the first idle transition and is not
    // reset by later cycles.
    app.poller
        .idle_clear
        .lock()
        .expect("idle clear lock poisoned")
        .entry((user_id, thread_id))
        .or_insert_with(|| (window_id.to_string(), Instant::now()));
}

/// Close topics whose done/dead timers expired.
async fn check_autoclose_timers(bot: &Bot, app: &Arc<App>) {
    let expired: Vec<(u64, i32)> = {
        let timers = app.poller.autoclose.lock().expect("autoclose lock poisoned");
        timers
            .iter()
            .filter(|(_, (state, entered))| {
                let timeout_minutes = match state {
                    TopicState::Done => app.config.autoclose_done_minutes,
                    TopicState::Dead => app.config.autoclose_dead_minutes,
                    _ => return false,
                };
                timeout_minutes > 0
                    && entered.elapsed() >= Duration::from_secs(timeout_minutes * 60)
            })
            .map(|(key, _)| *key)
            .collect()
    };

    for (user_id, thread_id) in expired {
        app.poller.clear_autoclose(user_id, thread_id);
        let chat_id = app.session_manager.resolve_chat_id(user_id, thread_id);
        crate::topic::close_topic(bot, chat_id, thread_id).await;
    }
}

/// Delete idle status messages whose display time expired.
async fn check_idle_clear_timers(app: &Arc<App>) {
    let expired: Vec<(u64, i32, String)> = {
        let timers = app.poller.idle_clear.lock().expect("idle clear lock poisoned");
        timers
            .iter()
            .filter(|(_, (_, entered))| entered.elapsed() >= IDLE_CLEAR_DELAY)
            .map(|((user, thread), (window, _))| (*user, *thread, window.clone()))
            .collect()
    };
    for (user_id, thread_id, window_id) in expired {
        app.poller.cancel_idle_clear(user_id, thread_id);
        app.poller
            .idle_cleared
            .lock()
            .expect("idle cleared lock poisoned")
            .insert(window_id.clone());
        app.queue
            .enqueue_status(user_id, &window_id, Some(thread_id), None);
    }
}

/// Kill unbound live windows whose TTL (the done timeout) expired.
async fn check_unbound_window_ttl(app: &Arc<App>) {
    let timeout_minutes = app.config.autoclose_done_minutes;
    if timeout_minutes == 0 {
        return;
    }
    let timeout = Duration::from_secs(timeout_minutes * 60);

    let bound = app.session_manager.bound_window_ids();
    let Ok(live_windows) = app.tmux.list_windows().await else {
        return;
    };
    let live_ids: HashSet<String> = live_windows.iter().map(|w| w.window_id.clone()).collect();

    let expired: Vec<String> = {
        let mut timers = app
            .poller
            .unbound_timers
            .lock()
            .expect("unbound timers lock poisoned");
        // Rebound or vanished windows lose their timers.
        timers.retain(|wid, _| live_ids.contains(wid) && !bound.contains(wid));
        for wid in &live_ids {
            if !bound.contains(wid) {
                timers.entry(wid.clone()).or_insert_with(Instant::now);
            }
        }
        timers
            .iter()
            .filter(|(_, first_seen)| first_seen.elapsed() >= timeout)
            .map(|(wid, _)| wid.clone())
            .collect()
    };

    for window_id in expired {
        app.poller
            .unbound_timers
            .lock()
            .expect("unbound timers lock poisoned")
            .remove(&window_id);
        if let Err(e) = app.tmux.kill_window(&window_id).await {
            tracing::debug!("Failed to auto-kill unbound window {window_id}: {e}");
        } else {
            tracing::info!("Auto-killed unbound window {window_id} (TTL expired)");
        }
        app.session_manager.forget_window(&window_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_shell_prompt() {
        assert!(is_shell_prompt("bash"));
        assert!(is_shell_prompt("/usr/bin/zsh"));
        assert!(is_shell_prompt("  fish "));
        assert!(!is_shell_prompt("claude"));
        assert!(!is_shell_prompt("node"));
        assert!(!is_shell_prompt(""));
    }

    #[test]
    fn test_autoclose_rearm_keeps_deadline() {
        let state = PollerState::default();
        state.start_autoclose(1, 42, TopicState::Done);
        let first = state.autoclose.lock().unwrap()[&(1, 42)].1;

        state.start_autoclose(1, 42, TopicState::Done);
        assert_eq!(state.autoclose.lock().unwrap()[&(1, 42)].1, first);

        // A different state restarts the countdown.
        state.start_autoclose(1, 42, TopicState::Dead);
        assert_eq!(state.autoclose.lock().unwrap()[&(1, 42)].0, TopicState::Dead);
    }

    #[test]
    fn test_clear_topic_state_scoped_to_topic() {
        let state = PollerState::default();
        state
            .dead_notified
            .lock()
            .unwrap()
            .extend([(1, 42, "@1".to_string()), (1, 43, "@2".to_string())]);
        state.start_autoclose(1, 42, TopicState::Done);

        state.clear_topic_state(1, 42, "@1");

        assert!(!state.dead_notified.lock().unwrap().contains(&(1, 42, "@1".to_string())));
        assert!(state.dead_notified.lock().unwrap().contains(&(1, 43, "@2".to_string())));
        assert!(state.autoclose.lock().unwrap().is_empty());
    }
}
