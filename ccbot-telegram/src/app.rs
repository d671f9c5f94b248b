//! Shared application state, constructed once in the composition root and
//! injected into every handler.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ccbot_core::monitor::ActivityTracker;
use ccbot_core::provider::{AgentProvider, provider_by_name};
use ccbot_core::resume::ResumeSession;
use ccbot_core::session::SessionManager;
use ccbot_core::tmux::WindowControl;
use ccbot_core::Config;

use crate::browser::BrowserState;
use crate::interactive::InteractiveRegistry;
use crate::queue::MessageQueue;
use crate::status_poller::PollerState;

/// One active subagent, tracked per window for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubagentInfo {
    pub subagent_id: String,
    pub name: String,
    pub description: String,
}

/// Everything handlers need, behind one `Arc`.
pub struct App {
    pub config: Config,
    pub session_manager: Arc<SessionManager>,
    pub tmux: Arc<dyn WindowControl>,
    pub queue: Arc<MessageQueue>,
    pub interactive: InteractiveRegistry,
    pub activity: ActivityTracker,
    pub poller: PollerState,
    /// Text sent into an unbound topic, replayed after window creation.
    pub pending_texts: Mutex<HashMap<(u64, i32), String>>,
    /// Per-user directory browser state.
    pub browser: Mutex<HashMap<u64, BrowserState>>,
    /// Per-user `/resume` picker results.
    pub resume_picks: Mutex<HashMap<u64, Vec<ResumeSession>>>,
    /// One transient bash-capture task per topic; newer cancels older.
    /// The generation number lets a finished task evict only itself.
    pub bash_tasks: Mutex<HashMap<(u64, i32), (u64, tokio::task::AbortHandle)>>,
    pub bash_task_seq: std::sync::atomic::AtomicU64,
    /// window_id → active subagents.
    pub subagents: Mutex<HashMap<String, Vec<SubagentInfo>>>,
}

impl App {
    /// Provider for a window: its persisted provider, else the default.
    pub fn provider_for_window(&self, window_id: &str) -> &'static dyn AgentProvider {
        let name = self.session_manager.get_window_provider(window_id);
        if name.is_empty() {
            provider_by_name(&self.config.provider_name)
        } else {
            provider_by_name(&name)
        }
    }

    /// Allow-list plus optional group restriction.
    pub fn is_update_allowed(&self, user_id: u64, chat_id: i64) -> bool {
        if !self.config.is_user_allowed(user_id) {
            return false;
        }
        match self.config.group_id {
            // Private chats are always fine; foreign groups are not.
            Some(group_id) => chat_id == group_id || chat_id == user_id as i64,
            None => true,
        }
    }

    /// Allocate a generation number for a new bash capture task.
    pub fn next_bash_task_generation(&self) -> u64 {
        self.bash_task_seq
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            + 1
    }

    /// Register a topic's bash capture task, aborting any predecessor.
    pub fn register_bash_task(
        &self,
        user_id: u64,
        thread_id: i32,
        generation: u64,
        handle: tokio::task::AbortHandle,
    ) {
        let mut tasks = self.bash_tasks.lock().expect("bash tasks lock poisoned");
        if let Some((_, old)) = tasks.insert((user_id, thread_id), (generation, handle)) {
            old.abort();
        }
    }

    /// Evict a finished bash task only if it still owns the slot, so a
    /// replacement registered in the meantime is never evicted.
    pub fn evict_bash_task(&self, user_id: u64, thread_id: i32, generation: u64) {
        let mut tasks = self.bash_tasks.lock().expect("bash tasks lock poisoned");
        if tasks
            .get(&(user_id, thread_id))
            .is_some_and(|(stored, _)| *stored == generation)
        {
            tasks.remove(&(user_id, thread_id));
        }
    }
}
