use anyhow::Context;
use clap::Parser;
use lantern_core::Project;
use lantern_sync::bridge::{run_window_bridge, BridgeConfig};
use lantern_sync::config::{
    resolve_bridge_socket_path, resolve_log_dir, resolve_log_stdout, SyncConfig,
};
use lantern_sync::dispatch::{ActionDispatcher, WindowCommand, WINDOW_COMMAND_USAGE};
use lantern_sync::hooks::{LogFollower, SyncHooks};
use lantern_sync::logging::init_logging;
use lantern_sync::store::{ChangeKind, EntityKind, Store, StoreChange};
use lantern_sync::SyncContext;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "lantern-window")]
struct Args {
    /// Daemon base URL; falls back to LANTERN_DAEMON_URL.
    #[arg(long, default_value = "")]
    daemon_url: String,
    /// Tray bridge socket; falls back to LANTERN_BRIDGE_SOCK.
    #[arg(long, default_value = "")]
    bridge_sock: String,
    #[arg(long, default_value = "")]
    log_dir: String,
    #[arg(long)]
    log_stdout: bool,
    /// Stream this project's logs into the store.
    #[arg(long, default_value = "")]
    follow_logs: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let log_dir = resolve_log_dir(&args.log_dir);
    let _log_guard = init_logging(&log_dir, "window", args.log_stdout || resolve_log_stdout());

    let config = SyncConfig::resolve(&args.daemon_url).context("invalid daemon url")?;
    let store = Store::new();
    let ctx = SyncContext::new(config.clone(), store.clone())
        .context("failed to build daemon client")?;
    info!(
        event = "window_start",
        daemon = %config.daemon_url,
        socket = %config.socket_url
    );

    let dispatcher = ActionDispatcher::new(ctx.clone());
    let hooks = SyncHooks::activate(&ctx);
    debug!(event = "window_hooks", hooks = ?hooks.names());
    let mut follower = LogFollower::default();
    let follow = args.follow_logs.trim();
    if !follow.is_empty() {
        follower.follow(&ctx, Some(follow));
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut bridge_config = BridgeConfig::new(
        resolve_bridge_socket_path(&args.bridge_sock),
        format!("window-{}", std::process::id()),
    );
    bridge_config.action_timeout = config.action_timeout;
    let bridge_task = tokio::spawn(run_window_bridge(
        bridge_config,
        dispatcher.clone(),
        shutdown_rx.clone(),
    ));
    let changes_task = tokio::spawn(log_store_changes(store, shutdown_rx));

    let (line_tx, mut line_rx) = mpsc::channel::<String>(16);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line_tx.send(line).await.is_err() {
                break;
            }
        }
    });

    let mut stdin_open = true;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for ctrl-c")?;
                break;
            }
            line = line_rx.recv(), if stdin_open => {
                let Some(line) = line else {
                    // keep syncing until ctrl-c
                    stdin_open = false;
                    continue;
                };
                if let Step::Quit = on_command(&ctx, &dispatcher, &mut follower, &line) {
                    break;
                }
            }
        }
    }
    info!(event = "window_shutdown");

    let _ = shutdown_tx.send(true);
    follower.follow(&ctx, None);
    hooks.deactivate();
    ctx.channels.disconnect_socket();
    let _ = bridge_task.await;
    let _ = changes_task.await;
    Ok(())
}

enum Step {
    Continue,
    Quit,
}

/// Log following and quitting stay local; everything else goes to the daemon
/// through the dispatcher, whose outcome shows up as a toast.
fn on_command(
    ctx: &SyncContext,
    dispatcher: &ActionDispatcher,
    follower: &mut LogFollower,
    line: &str,
) -> Step {
    let words: Vec<&str> = line.split_whitespace().collect();
    match words.as_slice() {
        [] => {}
        ["quit"] | ["q"] => return Step::Quit,
        ["logs"] => follower.follow(ctx, None),
        ["logs", project] => follower.follow(ctx, Some(*project)),
        _ => match line.parse::<WindowCommand>() {
            Ok(command) => {
                info!(event = "window_command", command = ?command);
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move {
                    if let Err(err) = dispatcher.run_command(&command).await {
                        debug!(event = "window_command_failed", command = ?command, error = %err);
                    }
                });
            }
            Err(err) => {
                println!("{err}");
                println!("{WINDOW_COMMAND_USAGE} | logs [project] | quit");
            }
        },
    }
    Step::Continue
}

async fn log_store_changes(store: Arc<Store>, mut shutdown: watch::Receiver<bool>) {
    let mut changes = store.subscribe();
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            change = changes.recv() => {
                match change {
                    Ok(change) => log_change(&store, change),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(event = "store_changes_lagged", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }
}

fn log_change(store: &Store, change: StoreChange) {
    match change.kind {
        ChangeKind::ToastAdded(toast) => {
            info!(event = "toast", kind = toast.kind.as_str(), message = %toast.message);
        }
        ChangeKind::Connectivity(connected) => {
            info!(event = "daemon_connectivity", connected);
        }
        ChangeKind::Replaced(EntityKind::Project) => {
            info!(event = "projects_loaded", count = store.all::<Project>().len());
        }
        ChangeKind::Upserted(EntityKind::Project, name)
        | ChangeKind::Patched(EntityKind::Project, name) => {
            if let Some(project) = store.project(&name) {
                info!(event = "project_status", project = %name, status = %project.status);
            }
        }
        ChangeKind::LogAppended(_) => {}
        other => {
            debug!(event = "store_change", revision = change.revision, kind = ?other);
        }
    }
}
