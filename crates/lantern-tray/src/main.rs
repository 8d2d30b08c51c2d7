use anyhow::Context;
use clap::Parser;
use lantern_sync::api::DaemonClient;
use lantern_sync::bridge::{ActionOutcome, BridgeConfig, TrayBridge, TrayBridgeEvent};
use lantern_sync::config::{
    resolve_bridge_socket_path, resolve_log_dir, resolve_log_stdout, SyncConfig,
};
use lantern_sync::connectivity::{notice_for, run_watcher, ConnectivityChange};
use lantern_sync::logging::init_logging;
use lantern_sync::tray::{
    activatable_items, build_tray_menu, fetch_tray_lists, render_menu_text, MenuAction, MenuItem,
    TRAY_TOOLTIP,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "lantern-tray")]
struct Args {
    /// Daemon base URL; falls back to LANTERN_DAEMON_URL.
    #[arg(long, default_value = "")]
    daemon_url: String,
    /// Bridge socket to host; falls back to LANTERN_BRIDGE_SOCK.
    #[arg(long, default_value = "")]
    bridge_sock: String,
    #[arg(long, default_value = "")]
    log_dir: String,
    #[arg(long)]
    log_stdout: bool,
}

enum Step {
    Continue,
    Quit,
}

struct TrayApp {
    api: DaemonClient,
    bridge: TrayBridge,
    menu: Vec<MenuItem>,
    first_probe: bool,
}

impl TrayApp {
    async fn rebuild(&mut self, announce: bool) {
        let (projects, services) = fetch_tray_lists(&self.api).await;
        let menu = build_tray_menu(&projects, &services);
        let changed = menu != self.menu;
        self.menu = menu;
        if announce || changed {
            print!("{}", render_menu_text(&self.menu));
        }
    }

    async fn on_connectivity(&mut self, change: ConnectivityChange) {
        if let Some(notice) = notice_for(change, self.first_probe) {
            println!("Lantern: {notice}");
        }
        self.first_probe = false;
        self.bridge
            .broadcast_daemon_status(change.is_connected())
            .await;
    }

    async fn on_bridge_event(&mut self, event: TrayBridgeEvent) {
        match event {
            TrayBridgeEvent::ActionSettled {
                kind,
                name,
                outcome,
                ..
            } => match outcome {
                ActionOutcome::Succeeded => self.rebuild(true).await,
                ActionOutcome::Failed(error) => println!("{kind} {name} failed: {error}"),
                ActionOutcome::Abandoned => println!("{kind} {name}: no answer from the window"),
            },
            TrayBridgeEvent::RefreshRequested => self.rebuild(false).await,
            TrayBridgeEvent::WindowConnected => info!(event = "tray_window_connected"),
            TrayBridgeEvent::WindowDisconnected => info!(event = "tray_window_disconnected"),
        }
    }

    async fn on_command(&mut self, line: &str) -> Step {
        let line = line.trim();
        match line {
            "" => Step::Continue,
            "menu" => {
                print!("{}", render_menu_text(&self.menu));
                Step::Continue
            }
            "quit" | "q" => Step::Quit,
            other => {
                let Ok(index) = other.parse::<usize>() else {
                    println!("commands: menu | <number> | quit");
                    return Step::Continue;
                };
                let items = activatable_items(&self.menu);
                let Some((label, action)) = index.checked_sub(1).and_then(|i| items.get(i)) else {
                    println!("no menu item {index}");
                    return Step::Continue;
                };
                info!(event = "tray_menu_selected", item = %label);
                match action {
                    MenuAction::OpenDashboard => {
                        self.bridge.request_refresh(Some("open_dashboard")).await;
                        println!("Dashboard: bring the lantern-window process to front");
                        Step::Continue
                    }
                    MenuAction::OpenUrl(url) => {
                        println!("{url}");
                        Step::Continue
                    }
                    MenuAction::Dispatch(kind, name) => {
                        let action_id = self.bridge.send_action(*kind, name).await;
                        println!("{kind} {name} sent ({action_id})");
                        Step::Continue
                    }
                    MenuAction::Quit => Step::Quit,
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let log_dir = resolve_log_dir(&args.log_dir);
    let _log_guard = init_logging(&log_dir, "tray", args.log_stdout || resolve_log_stdout());

    let config = SyncConfig::resolve(&args.daemon_url).context("invalid daemon url")?;
    let api = DaemonClient::new(&config).context("failed to build daemon client")?;
    let mut bridge_config = BridgeConfig::new(
        resolve_bridge_socket_path(&args.bridge_sock),
        format!("tray-{}", std::process::id()),
    );
    bridge_config.action_timeout = config.action_timeout;
    let socket_path = bridge_config.socket_path.clone();
    let bridge = TrayBridge::new(bridge_config);
    let mut bridge_events = bridge.subscribe();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server_task = tokio::spawn(bridge.clone().run(shutdown_rx.clone()));

    let (conn_tx, mut conn_rx) = mpsc::channel::<ConnectivityChange>(16);
    let watcher_task = tokio::spawn(run_watcher(
        api.clone(),
        config.probe_interval,
        conn_tx,
        shutdown_rx,
    ));

    let (line_tx, mut line_rx) = mpsc::channel::<String>(16);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line_tx.send(line).await.is_err() {
                break;
            }
        }
    });

    info!(
        event = "tray_start",
        daemon = %config.daemon_url,
        socket = %socket_path.display()
    );
    println!("{TRAY_TOOLTIP}");

    let mut app = TrayApp {
        api,
        bridge,
        menu: Vec::new(),
        first_probe: true,
    };
    app.rebuild(true).await;

    let mut ticker = tokio::time::interval(config.tray_poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    let mut stdin_open = true;

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    warn!(event = "tray_signal_error", error = %err);
                }
                break;
            }
            _ = ticker.tick() => app.rebuild(false).await,
            Some(change) = conn_rx.recv() => app.on_connectivity(change).await,
            event = bridge_events.recv() => {
                match event {
                    Ok(event) => app.on_bridge_event(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(event = "tray_bridge_events_lagged", skipped);
                        app.rebuild(false).await;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            line = line_rx.recv(), if stdin_open => {
                let Some(line) = line else {
                    // keep serving the bridge until ctrl-c
                    stdin_open = false;
                    continue;
                };
                if let Step::Quit = app.on_command(&line).await {
                    break;
                }
            }
        }
    }

    info!(event = "tray_shutdown");
    let _ = shutdown_tx.send(true);
    let _ = watcher_task.await;
    server_task
        .await
        .context("bridge task panicked")?
        .context("bridge socket failed")?;
    Ok(())
}
