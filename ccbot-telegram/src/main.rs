//! ccbot — Telegram bridge for terminal agent CLIs in tmux.
//!
//! Binds Telegram forum topics one-to-one to tmux windows running agent
//! CLIs (Claude Code, Codex, Gemini). User messages become keystrokes;
//! agent output streams back through the session monitor and the per-user
//! message queues.
//!
//! Subcommands: `run` (default, the bot) and `hook` (invoked by the
//! agent's lifecycle hooks; see `ccbot-core::hook`).

mod app;
mod browser;
mod callbacks;
mod cc_commands;
mod commands;
mod dashboard;
mod format;
mod handlers;
mod history;
mod interactive;
mod queue;
mod recovery;
mod resume_picker;
mod router;
mod send;
mod status_poller;
mod topic;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use clap::{Parser, Subcommand};
use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;
use tracing_subscriber::prelude::*;

use ccbot_core::monitor::SessionMonitor;
use ccbot_core::session::SessionManager;
use ccbot_core::tmux::{TmuxAdapter, WindowControl};
use ccbot_core::window_resolver::LiveWindow;
use ccbot_core::{Config, hook};

use app::App;
use queue::MessageQueue;

/// ccbot — Telegram bridge for terminal agent CLIs in tmux
#[derive(Parser)]
#[command(name = "ccbot", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run the Telegram bot (default).
    Run,
    /// Process an agent hook event from stdin, or manage hook installation.
    Hook {
        /// Install ccbot hooks into the agent's settings.
        #[arg(long)]
        install: bool,
        /// Remove ccbot hooks from the agent's settings.
        #[arg(long)]
        uninstall: bool,
        /// Show per-event installation status.
        #[arg(long)]
        status: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Cmd::Run) {
        Cmd::Hook {
            install,
            uninstall,
            status,
        } => run_hook(install, uninstall, status),
        Cmd::Run => run_bot(),
    }
}

/// The hook subcommand is synchronous and must exit 0 on event input so
/// it never blocks the agent.
fn run_hook(install: bool, uninstall: bool, status: bool) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let settings_file = hook::claude_settings_file();
    if install {
        let (installed, already) = hook::install_hooks(&settings_file)?;
        println!(
            "Hooks installed in {}: {installed} new, {already} already present",
            settings_file.display()
        );
        return Ok(());
    }
    if uninstall {
        if hook::uninstall_hooks(&settings_file)? {
            println!("Hooks uninstalled from {}", settings_file.display());
        } else {
            println!("Hook not installed — nothing to uninstall.");
        }
        return Ok(());
    }
    if status {
        let settings = std::fs::read_to_string(&settings_file)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or(serde_json::Value::Null);
        let mut all_installed = true;
        for (kind, installed) in hook::installed_events(&settings) {
            let mark = if installed { "installed" } else { "MISSING" };
            println!("  {}: {mark}", kind.as_str());
            all_installed &= installed;
        }
        if !all_installed {
            std::process::exit(1);
        }
        return Ok(());
    }

    hook::process_hook_event(&mut std::io::stdin().lock());
    Ok(())
}

/// Default tracing directives for the bot.
const DEFAULT_DIRECTIVES: &[&str] = &["ccbot=info", "ccbot_core=info"];

fn default_env_filter() -> anyhow::Result<tracing_subscriber::EnvFilter> {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    if let Ok(level) = std::env::var("CCBOT_LOG_LEVEL") {
        filter = filter.add_directive(format!("ccbot={}", level.to_lowercase()).parse()?);
        filter = filter.add_directive(format!("ccbot_core={}", level.to_lowercase()).parse()?);
    } else {
        for directive in DEFAULT_DIRECTIVES {
            filter = filter.add_directive(directive.parse()?);
        }
    }
    Ok(filter)
}

/// Initialize tracing: stdout always, plus a rolling file under the
/// config dir. Returns the non-blocking writer guard, held for the
/// process lifetime.
fn init_tracing(
    config: &Config,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let log_dir = config.config_dir.join("logs");
    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!(
            "Warning: failed to create log directory '{}': {e}. Logging to stdout only.",
            log_dir.display()
        );
        tracing_subscriber::fmt()
            .with_env_filter(default_env_filter()?)
            .init();
        return Ok(None);
    }

    let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix("ccbot")
        .filename_suffix("log")
        .max_log_files(7)
        .build(&log_dir)
        .context("Failed to create rolling file appender")?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(default_env_filter()?)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .init();
    Ok(Some(guard))
}

#[tokio::main]
async fn run_bot() -> anyhow::Result<()> {
    // Config first; tracing lands under the config dir.
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}\n");
            eprintln!("Required environment:");
            eprintln!("  TELEGRAM_BOT_TOKEN=your_bot_token   (from @BotFather)");
            eprintln!("  ALLOWED_USERS=123456789             (your Telegram user id)");
            std::process::exit(1);
        }
    };
    let _guard = init_tracing(&config)?;
    tracing::info!("Starting ccbot");

    // Missing tmux is fatal at startup; everything depends on it.
    if !TmuxAdapter::tmux_available().await {
        anyhow::bail!("tmux binary not found in PATH — install tmux and retry");
    }

    let tmux = Arc::new(TmuxAdapter::new(config.tmux_session_name.clone()));
    tmux.get_or_create_session()
        .await
        .context("Failed to create tmux session")?;
    tracing::info!("Tmux session '{}' ready", config.tmux_session_name);

    let session_manager = Arc::new(SessionManager::new(
        config.state_file(),
        config.session_map_file(),
        config.tmux_session_name.clone(),
    ));

    // Startup migration: re-resolve persisted window ids against live
    // windows before any polling begins.
    let live_windows = tmux.list_windows().await.unwrap_or_default();
    let live: Vec<LiveWindow> = live_windows.iter().map(LiveWindow::from).collect();
    session_manager.migrate_windows(&live);
    session_manager.load_session_map().await;

    let bot = Bot::new(config.telegram_bot_token.clone());
    let queue = MessageQueue::new(bot.clone(), Arc::clone(&session_manager));

    let tmux_control: Arc<dyn WindowControl> = tmux.clone();
    let (monitor, monitor_rx, activity) =
        SessionMonitor::new(&config, Arc::clone(&session_manager), tmux_control.clone());

    let app = Arc::new(App {
        config,
        session_manager: Arc::clone(&session_manager),
        tmux: tmux_control,
        queue,
        interactive: Default::default(),
        activity,
        poller: Default::default(),
        pending_texts: Mutex::new(HashMap::new()),
        browser: Mutex::new(HashMap::new()),
        resume_picks: Mutex::new(HashMap::new()),
        bash_tasks: Mutex::new(HashMap::new()),
        bash_task_seq: Default::default(),
        subagents: Mutex::new(HashMap::new()),
    });

    // Background loops, all answering to one shutdown signal.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let monitor_handle = tokio::spawn(monitor.run(shutdown_rx.clone()));
    let poller_handle = tokio::spawn(status_poller::run_status_poller(
        bot.clone(),
        Arc::clone(&app),
        shutdown_rx.clone(),
    ));
    let router_handle = tokio::spawn(router::run_event_router(
        bot.clone(),
        Arc::clone(&app),
        monitor_rx,
        shutdown_rx,
    ));

    // The bot's own identity is required for filter_command parsing.
    let me = bot.get_me().await.context("Failed to fetch bot identity")?;

    // Register slash commands for the Telegram autocomplete UI.
    if let Err(e) = bot
        .set_my_commands(commands::Command::bot_commands())
        .await
    {
        tracing::warn!("Failed to register bot commands: {e}");
    }

    let handler = dptree::entry()
        .branch(
            Update::filter_message()
                .branch(
                    dptree::entry()
                        .filter_command::<commands::Command>()
                        .endpoint(commands::handle_command),
                )
                .branch(dptree::entry().endpoint(handlers::handle_message)),
        )
        .branch(Update::filter_callback_query().endpoint(callbacks::handle_callback));

    tracing::info!("Dispatcher ready — polling for updates");
    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![me, Arc::clone(&app)])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    // Soft shutdown: stop the loops, wait for them, flush state.
    tracing::info!("Dispatcher stopped — shutting down");
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        let _ = monitor_handle.await;
        let _ = poller_handle.await;
        let _ = router_handle.await;
    })
    .await;
    session_manager.flush();
    tracing::info!("Shutdown complete");
    Ok(())
}
