mod support;

use lantern_core::{LogStream, Project, ProjectStatus, Service, ToastKind};
use lantern_sync::api::DaemonClient;
use lantern_sync::config::SyncConfig;
use lantern_sync::dispatch::{ActionDispatcher, ActionError, WindowCommand};
use lantern_sync::hooks::{
    activate_logs, activate_projects, activate_system_health, refresh_projects, LogFollower,
    SyncHooks, PROJECT_LOBBY, SYSTEM_HEALTH,
};
use lantern_sync::socket::ChannelEvent;
use lantern_sync::tray::{build_tray_menu, fetch_tray_lists, render_menu_text, NO_PROJECTS};
use serde_json::json;
use std::time::Duration;
use support::{project, service, wait_until, MockDaemon};
use url::Url;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn activate_shows_starting_then_running() {
    let daemon = MockDaemon::start(vec![project("blog", "stopped")], vec![]).await;
    daemon.set_action_delay(Duration::from_millis(300));
    let ctx = daemon.context();
    let store = ctx.store.clone();
    let hooks = SyncHooks::activate(&ctx);

    wait_until("projects loaded", || store.is_loaded::<Project>()).await;
    assert_eq!(
        store.project("blog").expect("blog").status,
        ProjectStatus::Stopped
    );

    let dispatcher = ActionDispatcher::new(ctx.clone());
    let mut completions = dispatcher.completions();
    let action = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.activate_project("blog").await })
    };

    wait_until("optimistic starting", || {
        store.project("blog").map(|p| p.status) == Some(ProjectStatus::Starting)
    })
    .await;

    let project = action.await.expect("join").expect("activate");
    assert_eq!(project.status, ProjectStatus::Running);
    assert_eq!(
        store.project("blog").expect("blog").status,
        ProjectStatus::Running
    );

    let toasts = store.toasts();
    assert!(toasts
        .iter()
        .any(|t| t.kind == ToastKind::Success && t.message == "Project \"blog\" activated"));

    let done = completions.recv().await.expect("completion");
    assert_eq!(done.action, "activate");
    assert_eq!(done.target.as_deref(), Some("blog"));

    hooks.deactivate();
    ctx.channels.disconnect_socket();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn daemon_conflict_marks_error_with_one_verbatim_toast() {
    let daemon = MockDaemon::start(vec![project("blog", "stopped")], vec![]).await;
    daemon.fail_next(
        "activate",
        "blog",
        409,
        json!({"error": "conflict", "message": "port in use"}),
    );
    let ctx = daemon.context();
    assert!(refresh_projects(ctx.clone()).await);

    let dispatcher = ActionDispatcher::new(ctx.clone());
    let err = dispatcher
        .activate_project("blog")
        .await
        .expect_err("conflict");
    assert_eq!(err.to_string(), "port in use");

    assert_eq!(
        ctx.store.project("blog").expect("blog").status,
        ProjectStatus::Error
    );
    let toasts = ctx.store.toasts();
    assert_eq!(toasts.len(), 1);
    assert_eq!(toasts[0].kind, ToastKind::Error);
    assert_eq!(toasts[0].message, "port in use");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn status_change_for_unknown_project_is_ignored() {
    let daemon = MockDaemon::start(vec![project("blog", "stopped")], vec![]).await;
    let ctx = daemon.context();
    let store = ctx.store.clone();
    ctx.channels.connect();
    let handle = activate_projects(&ctx);

    wait_until("projects loaded", || store.is_loaded::<Project>()).await;
    wait_until("lobby joined", || daemon.saw_frame(PROJECT_LOBBY, "phx_join")).await;

    daemon.push(
        PROJECT_LOBBY,
        "status_change",
        json!({"name": "ghost", "status": "running"}),
    );
    daemon.push(
        PROJECT_LOBBY,
        "status_change",
        json!({"name": "blog", "status": "running"}),
    );

    wait_until("blog running", || {
        store.project("blog").map(|p| p.status) == Some(ProjectStatus::Running)
    })
    .await;
    assert!(store.project("ghost").is_none());
    assert_eq!(store.all::<Project>().len(), 1);

    handle.deactivate();
    wait_until("lobby left", || daemon.saw_frame(PROJECT_LOBBY, "phx_leave")).await;
    ctx.channels.disconnect_socket();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shared_topic_is_left_only_after_last_consumer() {
    let daemon = MockDaemon::start(vec![], vec![]).await;
    let ctx = daemon.context();
    let channels = ctx.channels.clone();
    channels.connect();

    let first = channels.join_channel("project:blog", json!({}));
    let mut events = first.events();
    let second = channels.join_channel("project:blog", json!({}));
    assert!(std::sync::Arc::ptr_eq(&first, &second));

    let joined = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("joined in time")
        .expect("event");
    assert_eq!(joined, ChannelEvent::Joined { rejoin: false });
    assert!(first.is_joined());

    daemon.push("project:blog", "log_line", json!({"line": "hello"}));
    let message = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("message in time")
        .expect("event");
    assert_eq!(
        message,
        ChannelEvent::Message {
            event: "log_line".to_string(),
            payload: json!({"line": "hello"}),
        }
    );

    assert!(channels.leave_channel("project:blog"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!daemon.saw_frame("project:blog", "phx_leave"));

    assert!(channels.leave_channel("project:blog"));
    wait_until("server-side leave", || {
        daemon.saw_frame("project:blog", "phx_leave")
    })
    .await;
    let joins = daemon
        .frames()
        .iter()
        .filter(|(topic, event)| topic == "project:blog" && event == "phx_join")
        .count();
    assert_eq!(joins, 1);

    channels.disconnect_socket();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn log_hook_normalizes_bare_lines() {
    let daemon = MockDaemon::start(vec![project("blog", "running")], vec![]).await;
    let ctx = daemon.context();
    ctx.channels.connect();

    let disabled = activate_logs(&ctx, "blog", false);
    assert!(disabled.topics().is_empty());

    let handle = activate_logs(&ctx, "blog", true);
    wait_until("log topic joined", || {
        daemon.saw_frame("project:blog", "phx_join")
    })
    .await;

    daemon.push("project:blog", "log_line", json!({"line": ""}));
    daemon.push("project:blog", "log_line", json!({"line": "GET / 200"}));
    daemon.push(
        "project:blog",
        "log",
        json!({"timestamp": "2026-03-01T10:00:00Z", "stream": "stderr", "line": "warn"}),
    );

    wait_until("two log lines", || ctx.store.logs("blog").len() == 2).await;
    let logs = ctx.store.logs("blog");
    assert_eq!(logs[0].line, "GET / 200");
    assert_eq!(logs[0].stream, LogStream::Stdout);
    assert_eq!(logs[1].stream, LogStream::Stderr);

    handle.deactivate();
    ctx.channels.disconnect_socket();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn health_hook_polls_and_accepts_pushes() {
    let daemon = MockDaemon::start(vec![], vec![]).await;
    let ctx = daemon.context();
    ctx.channels.connect();
    let handle = activate_system_health(&ctx);

    wait_until("initial health poll", || ctx.store.health().is_some()).await;
    assert_eq!(ctx.store.daemon_connected(), Some(true));
    assert!(ctx.store.health().expect("health").is_all_ok());

    wait_until("health topic joined", || {
        daemon.saw_frame(SYSTEM_HEALTH, "phx_join")
    })
    .await;
    daemon.push(
        SYSTEM_HEALTH,
        "health_update",
        json!({"caddy": {"status": "error", "message": "bind failed"}}),
    );
    wait_until("pushed health", || {
        ctx.store
            .health()
            .map(|h| !h.is_all_ok())
            .unwrap_or(false)
    })
    .await;

    handle.deactivate();
    ctx.channels.disconnect_socket();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn service_actions_upsert_or_toast() {
    let daemon = MockDaemon::start(vec![], vec![service("mysql", "stopped")]).await;
    let ctx = daemon.context();
    let dispatcher = ActionDispatcher::new(ctx.clone());

    let started = dispatcher.start_service("mysql").await.expect("start");
    assert!(started.is_running());
    assert!(ctx.store.get::<Service>("mysql").expect("mysql").is_running());

    daemon.fail_next(
        "service_stop",
        "mysql",
        500,
        json!({"error": "internal", "message": "container busy"}),
    );
    let err = dispatcher.stop_service("mysql").await.expect_err("busy");
    assert_eq!(err.to_string(), "container busy");
    assert!(ctx.store.get::<Service>("mysql").expect("mysql").is_running());
    assert!(ctx
        .store
        .toasts()
        .iter()
        .any(|t| t.kind == ToastKind::Error && t.message == "container busy"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tray_lists_fall_back_to_placeholders_when_unreachable() {
    let daemon = MockDaemon::start(vec![project("blog", "running")], vec![]).await;
    let ctx = daemon.context();
    let (projects, services) = fetch_tray_lists(&ctx.api).await;
    assert_eq!(projects.len(), 1);
    assert!(services.is_empty());

    let offline = SyncConfig::new(Url::parse("http://127.0.0.1:9").expect("url"));
    let api = DaemonClient::new(&offline).expect("client");
    let (projects, services) = fetch_tray_lists(&api).await;
    assert!(projects.is_empty());
    let menu = build_tray_menu(&projects, &services);
    assert!(render_menu_text(&menu).contains(NO_PROJECTS));
}

async fn loaded_dispatcher(daemon: &MockDaemon) -> ActionDispatcher {
    let ctx = daemon.context();
    assert!(refresh_projects(ctx.clone()).await);
    ActionDispatcher::new(ctx)
}

async fn run(dispatcher: &ActionDispatcher, line: &str) -> Result<(), ActionError> {
    let command: WindowCommand = line.parse().expect("command");
    dispatcher.run_command(&command).await
}

fn project_names(dispatcher: &ActionDispatcher) -> Vec<String> {
    dispatcher
        .context()
        .store
        .all::<Project>()
        .into_iter()
        .map(|p| p.name)
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rename_keeps_list_position() {
    let daemon = MockDaemon::start(
        vec![
            project("blog", "running"),
            project("shop", "stopped"),
            project("api", "stopped"),
        ],
        vec![],
    )
    .await;
    let dispatcher = loaded_dispatcher(&daemon).await;
    let store = dispatcher.context().store.clone();
    store.append_log(
        "shop",
        lantern_core::LogEntry {
            timestamp: "2026-03-01T10:00:00Z".to_string(),
            stream: LogStream::Stdout,
            line: "booted".to_string(),
        },
    );

    run(&dispatcher, "rename shop store").await.expect("rename");

    assert_eq!(project_names(&dispatcher), vec!["blog", "store", "api"]);
    assert!(store.project("shop").is_none());
    assert_eq!(store.project("store").expect("store").domain, "store.test");
    assert_eq!(store.logs("store").len(), 1);
    assert!(!store.has_logs("shop"));
    assert!(daemon.requests().contains(&"PATCH shop".to_string()));
    assert!(store
        .toasts()
        .iter()
        .any(|t| t.kind == ToastKind::Success && t.message == "Project renamed to \"store\""));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hidden_project_cannot_be_activated_until_unhidden() {
    let daemon = MockDaemon::start(vec![project("blog", "stopped")], vec![]).await;
    let dispatcher = loaded_dispatcher(&daemon).await;
    let store = dispatcher.context().store.clone();

    run(&dispatcher, "hide blog").await.expect("hide");
    assert!(!store.project("blog").expect("blog").is_enabled());

    let err = run(&dispatcher, "start blog").await.expect_err("refused");
    assert_eq!(err, ActionError::Hidden("blog".to_string()));
    assert_eq!(daemon.count_requests("POST activate blog"), 0);
    assert_eq!(store.project("blog").expect("blog").status, ProjectStatus::Stopped);

    run(&dispatcher, "unhide blog").await.expect("unhide");
    run(&dispatcher, "start blog").await.expect("start");
    assert_eq!(store.project("blog").expect("blog").status, ProjectStatus::Running);
    assert_eq!(daemon.count_requests("POST activate blog"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delete_removes_project_from_store() {
    let daemon = MockDaemon::start(
        vec![project("blog", "stopped"), project("shop", "running")],
        vec![],
    )
    .await;
    let dispatcher = loaded_dispatcher(&daemon).await;
    let store = dispatcher.context().store.clone();

    run(&dispatcher, "delete blog").await.expect("delete");

    assert!(store.project("blog").is_none());
    assert_eq!(project_names(&dispatcher), vec!["shop"]);
    assert_eq!(daemon.project_names(), vec!["shop"]);
    assert!(store
        .toasts()
        .iter()
        .any(|t| t.message == "Project \"blog\" removed"));

    let err = run(&dispatcher, "delete ghost").await.expect_err("missing");
    assert_eq!(err.to_string(), "project ghost not found");
    assert_eq!(project_names(&dispatcher), vec!["shop"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_scan_leaves_a_toast_and_the_list() {
    let daemon = MockDaemon::start(vec![project("blog", "running")], vec![]).await;
    let dispatcher = loaded_dispatcher(&daemon).await;
    let store = dispatcher.context().store.clone();
    daemon.fail_next(
        "scan",
        "",
        500,
        json!({"error": "internal", "message": "projects directory unreadable"}),
    );

    let err = run(&dispatcher, "scan").await.expect_err("scan failed");
    assert_eq!(err.to_string(), "projects directory unreadable");
    assert_eq!(project_names(&dispatcher), vec!["blog"]);
    let toasts = store.toasts();
    assert_eq!(toasts.len(), 1);
    assert_eq!(toasts[0].kind, ToastKind::Error);
    assert_eq!(toasts[0].message, "projects directory unreadable");

    run(&dispatcher, "scan").await.expect("scan");
    assert_eq!(daemon.count_requests("POST scan"), 2);
    assert!(store
        .toasts()
        .iter()
        .any(|t| t.kind == ToastKind::Success && t.message == "Project scan complete"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_health_check_and_shutdown_reach_the_daemon() {
    let daemon = MockDaemon::start(vec![project("blog", "stopped")], vec![]).await;
    let dispatcher = loaded_dispatcher(&daemon).await;
    let store = dispatcher.context().store.clone();
    let mut completions = dispatcher.completions();

    run(&dispatcher, "restart blog").await.expect("restart");
    assert_eq!(store.project("blog").expect("blog").status, ProjectStatus::Running);
    let done = completions.recv().await.expect("completion");
    assert_eq!(done.action, "restart");

    run(&dispatcher, "health blog").await.expect("health check");
    let health = store.project_health("blog").expect("health");
    assert_eq!(health.latency_ms, Some(7));
    assert_eq!(daemon.count_requests("POST health check blog"), 1);

    run(&dispatcher, "shutdown").await.expect("shutdown");
    assert_eq!(daemon.count_requests("POST shutdown"), 1);
    assert!(store
        .toasts()
        .iter()
        .any(|t| t.kind == ToastKind::Info && t.message == "Daemon is shutting down"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn following_a_project_fetches_its_health() {
    let daemon = MockDaemon::start(vec![project("blog", "running")], vec![]).await;
    let ctx = daemon.context();
    ctx.channels.connect();
    let mut follower = LogFollower::default();

    follower.follow(&ctx, Some("blog"));
    assert_eq!(follower.following(), Some("blog"));
    wait_until("project health fetched", || {
        ctx.store
            .project_health("blog")
            .map(|h| h.latency_ms == Some(12))
            .unwrap_or(false)
    })
    .await;
    assert_eq!(daemon.count_requests("GET health blog"), 1);

    follower.follow(&ctx, None);
    ctx.channels.disconnect_socket();
}
