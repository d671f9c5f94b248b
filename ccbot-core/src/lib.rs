//! ccbot core library.
//!
//! Domain logic for the Telegram ↔ terminal-agent bridge: configuration,
//! terminal parsing, the provider abstraction over agent CLIs, session
//! bindings and persistence, the hook writer, and the session monitor.
//! Everything here is Telegram-free; the `ccbot-telegram` crate owns the
//! bot surface.

pub mod config;
pub mod events;
pub mod hook;
pub mod monitor;
pub mod persistence;
pub mod provider;
pub mod resume;
pub mod screen_buffer;
pub mod session;
pub mod terminal_parser;
pub mod tmux;
pub mod util;
pub mod window_resolver;

pub use config::{Config, ConfigError};
pub use events::{HookEvent, HookEventKind, MonitorEvent, NewMessage, NewWindowEvent};
pub use monitor::{ActivityTracker, SessionMonitor};
pub use provider::{
    AgentMessage, AgentProvider, ContentType, DiscoveredCommand, MessageRole,
    ProviderCapabilities, SessionStartEvent, StatusUpdate, provider_by_name,
};
pub use screen_buffer::ScreenBuffer;
pub use session::{NotificationMode, SessionManager, SessionMapEntry, WindowState};
pub use tmux::{TmuxAdapter, TmuxError, TmuxWindow, WindowControl};
