//! Per-kind coordinators: initial fetch, topic subscription, periodic
//! backstop polling. Every result lands in the [`Store`].
//!
//! Fetches run as detached tasks, so deactivating a hook stops its timers and
//! subscriptions but lets an already-issued request finish and write.

use crate::api::ApiError;
use crate::socket::{ChannelEvent, ChannelManager};
use crate::store::{now_timestamp, status_patch, Store};
use crate::SyncContext;
use lantern_core::{HealthStatus, LogEntry, LogStream, Project, ProjectStatus, Service};
use serde::Deserialize;
use serde_json::{json, Value};
use std::future::Future;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub const PROJECT_LOBBY: &str = "project:lobby";
pub const SERVICES_LOBBY: &str = "services:lobby";
pub const SYSTEM_HEALTH: &str = "system:health";

pub fn project_topic(name: &str) -> String {
    format!("project:{name}")
}

/// Owns a hook's tasks and topics. Dropping it deactivates the hook.
pub struct HookHandle {
    name: String,
    tasks: Vec<JoinHandle<()>>,
    topics: Vec<String>,
    channels: Option<ChannelManager>,
}

impl HookHandle {
    fn new(name: impl Into<String>, channels: &ChannelManager) -> Self {
        Self {
            name: name.into(),
            tasks: Vec::new(),
            topics: Vec::new(),
            channels: Some(channels.clone()),
        }
    }

    fn inert(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tasks: Vec::new(),
            topics: Vec::new(),
            channels: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    pub fn deactivate(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.tasks.is_empty() && self.channels.is_none() {
            return;
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(channels) = self.channels.take() {
            for topic in self.topics.drain(..) {
                channels.leave_channel(&topic);
            }
        }
        debug!(event = "hook_deactivated", hook = %self.name);
    }
}

impl Drop for HookHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn detach<F>(fetch: F)
where
    F: Future<Output = bool> + Send + 'static,
{
    tokio::spawn(async move {
        let _ = fetch.await;
    });
}

fn fetch_failed(kind: &str, err: &ApiError) {
    // transport failures surface through the connectivity indicator only
    if err.is_transport() {
        debug!(event = "sync_fetch_unreachable", kind = kind, error = %err);
    } else {
        warn!(event = "sync_fetch_failed", kind = kind, error = %err);
    }
}

pub async fn refresh_projects(ctx: SyncContext) -> bool {
    match ctx.api.list_projects().await {
        Ok(projects) => {
            ctx.store.replace_all(projects);
            true
        }
        Err(err) => {
            fetch_failed("projects", &err);
            false
        }
    }
}

pub async fn refresh_services(ctx: SyncContext) -> bool {
    match ctx.api.list_services().await {
        Ok(services) => {
            ctx.store.replace_all(services);
            true
        }
        Err(err) => {
            fetch_failed("services", &err);
            false
        }
    }
}

pub async fn refresh_system_health(ctx: SyncContext) -> bool {
    match ctx.api.system_health().await {
        Ok(health) => {
            ctx.store.set_health(health);
            ctx.store.set_daemon_connected(true);
            true
        }
        Err(err) => {
            if err.is_transport() {
                ctx.store.set_daemon_connected(false);
            }
            fetch_failed("system_health", &err);
            false
        }
    }
}

pub async fn refresh_project_health(ctx: SyncContext) -> bool {
    match ctx.api.all_project_health().await {
        Ok(health) => {
            ctx.store.replace_project_health(health);
            true
        }
        Err(err) => {
            fetch_failed("project_health", &err);
            false
        }
    }
}

/// One project's health, fetched when its detail view opens rather than
/// waiting for the next poll.
pub async fn refresh_one_project_health(ctx: SyncContext, name: String) -> bool {
    match ctx.api.project_health(&name).await {
        Ok(health) => {
            ctx.store.set_project_health(&name, health);
            true
        }
        Err(err) => {
            fetch_failed("project_health", &err);
            false
        }
    }
}

#[derive(Debug, Deserialize)]
struct StatusChange {
    #[serde(alias = "project")]
    name: String,
    status: ProjectStatus,
}

#[derive(Debug, Deserialize)]
struct ProjectUpdated {
    project: Project,
}

#[derive(Debug, Deserialize)]
struct ProjectsChanged {
    projects: Vec<Project>,
}

#[derive(Debug, Deserialize)]
struct ServiceUpdated {
    service: Service,
}

fn decode<T: serde::de::DeserializeOwned>(topic: &str, event: &str, payload: &Value) -> Option<T> {
    match serde_json::from_value(payload.clone()) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(event = "sync_payload_malformed", topic = topic, msg_event = event, error = %err);
            None
        }
    }
}

/// Applies one `project:lobby` push. Deltas only touch known projects; full
/// snapshots may create them. Returns whether the store was written.
pub fn apply_project_event(store: &Store, event: &str, payload: &Value) -> bool {
    match event {
        "status_change" => {
            let Some(change) = decode::<StatusChange>(PROJECT_LOBBY, event, payload) else {
                return false;
            };
            store.patch::<Project>(&change.name, &status_patch(change.status))
        }
        "project_updated" => {
            let Some(update) = decode::<ProjectUpdated>(PROJECT_LOBBY, event, payload) else {
                return false;
            };
            store.upsert(update.project);
            true
        }
        "projects_changed" => {
            let Some(update) = decode::<ProjectsChanged>(PROJECT_LOBBY, event, payload) else {
                return false;
            };
            store.replace_all(update.projects);
            true
        }
        other => {
            debug!(event = "sync_event_ignored", topic = PROJECT_LOBBY, msg_event = other);
            false
        }
    }
}

pub fn apply_service_event(store: &Store, event: &str, payload: &Value) -> bool {
    if event != "service_updated" {
        debug!(event = "sync_event_ignored", topic = SERVICES_LOBBY, msg_event = event);
        return false;
    }
    let Some(update) = decode::<ServiceUpdated>(SERVICES_LOBBY, event, payload) else {
        return false;
    };
    store.upsert(update.service);
    true
}

pub fn apply_health_event(store: &Store, event: &str, payload: &Value) -> bool {
    if event != "health_update" {
        return false;
    }
    let Some(health) = decode::<HealthStatus>(SYSTEM_HEALTH, event, payload) else {
        return false;
    };
    store.set_health(health);
    store.set_daemon_connected(true);
    true
}

/// A log push, normalized at the channel boundary. The daemon sends either a
/// complete entry or just `{line}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogPayload {
    Entry(LogEntry),
    Line(String),
}

impl LogPayload {
    pub fn parse(event: &str, payload: &Value) -> Option<Self> {
        if event != "log" && event != "log_line" {
            return None;
        }
        if let Ok(entry) = serde_json::from_value::<LogEntry>(payload.clone()) {
            return Some(LogPayload::Entry(entry));
        }
        payload
            .get("line")
            .and_then(Value::as_str)
            .map(|line| LogPayload::Line(line.to_string()))
    }

    /// Bare lines are stamped now and attributed to stdout; empty lines are
    /// dropped.
    pub fn into_entry(self) -> Option<LogEntry> {
        match self {
            LogPayload::Entry(entry) => Some(entry),
            LogPayload::Line(line) if line.is_empty() => None,
            LogPayload::Line(line) => Some(LogEntry {
                timestamp: now_timestamp(),
                stream: LogStream::Stdout,
                line,
            }),
        }
    }
}

pub fn apply_log_event(store: &Store, project: &str, event: &str, payload: &Value) -> bool {
    let Some(entry) = LogPayload::parse(event, payload).and_then(LogPayload::into_entry) else {
        return false;
    };
    store.append_log(project, entry);
    true
}

/// Forwards one subscription's events into `apply` until the subscription
/// closes. `on_rejoin` runs after every reconnect or after the queue lagged.
fn spawn_channel_pump<A, R>(
    topic: String,
    mut events: tokio::sync::broadcast::Receiver<ChannelEvent>,
    apply: A,
    on_rejoin: R,
) -> JoinHandle<()>
where
    A: Fn(&str, &Value) + Send + 'static,
    R: Fn() + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ChannelEvent::Message { event, payload }) => apply(&event, &payload),
                Ok(ChannelEvent::Joined { rejoin }) => {
                    if rejoin {
                        on_rejoin();
                    }
                }
                Ok(ChannelEvent::JoinFailed { reason }) => {
                    warn!(event = "hook_join_failed", topic = %topic, reason = %reason);
                }
                Ok(ChannelEvent::Interrupted) => {
                    debug!(event = "hook_channel_interrupted", topic = %topic);
                }
                Ok(ChannelEvent::Closed) | Err(RecvError::Closed) => break,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(event = "hook_channel_lagged", topic = %topic, skipped);
                    on_rejoin();
                }
            }
        }
    })
}

fn spawn_poller<F, Fut>(period: Duration, tick: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            detach(tick());
        }
    })
}

pub fn activate_projects(ctx: &SyncContext) -> HookHandle {
    let mut handle = HookHandle::new("projects", &ctx.channels);
    let subscription = ctx.channels.join_channel(PROJECT_LOBBY, json!({}));
    handle.topics.push(PROJECT_LOBBY.to_string());
    let events = subscription.events();

    detach(refresh_projects(ctx.clone()));

    let store = ctx.store.clone();
    let refetch = ctx.clone();
    handle.tasks.push(spawn_channel_pump(
        PROJECT_LOBBY.to_string(),
        events,
        move |event, payload| {
            apply_project_event(&store, event, payload);
        },
        move || detach(refresh_projects(refetch.clone())),
    ));
    info!(event = "hook_activated", hook = "projects");
    handle
}

pub fn activate_services(ctx: &SyncContext) -> HookHandle {
    let mut handle = HookHandle::new("services", &ctx.channels);
    let subscription = ctx.channels.join_channel(SERVICES_LOBBY, json!({}));
    handle.topics.push(SERVICES_LOBBY.to_string());
    let events = subscription.events();

    detach(refresh_services(ctx.clone()));

    let store = ctx.store.clone();
    let refetch = ctx.clone();
    handle.tasks.push(spawn_channel_pump(
        SERVICES_LOBBY.to_string(),
        events,
        move |event, payload| {
            apply_service_event(&store, event, payload);
        },
        move || detach(refresh_services(refetch.clone())),
    ));
    info!(event = "hook_activated", hook = "services");
    handle
}

/// System health: pushed on `system:health`, polled as a backstop.
pub fn activate_system_health(ctx: &SyncContext) -> HookHandle {
    let mut handle = HookHandle::new("system_health", &ctx.channels);
    let subscription = ctx.channels.join_channel(SYSTEM_HEALTH, json!({}));
    handle.topics.push(SYSTEM_HEALTH.to_string());
    let events = subscription.events();

    let poll = ctx.clone();
    handle.tasks.push(spawn_poller(ctx.config.system_health_interval, move || {
        refresh_system_health(poll.clone())
    }));

    let store = ctx.store.clone();
    handle.tasks.push(spawn_channel_pump(
        SYSTEM_HEALTH.to_string(),
        events,
        move |event, payload| {
            apply_health_event(&store, event, payload);
        },
        || {},
    ));
    info!(event = "hook_activated", hook = "system_health");
    handle
}

/// Per-project health has no topic; it is polling only.
pub fn activate_project_health(ctx: &SyncContext) -> HookHandle {
    let mut handle = HookHandle::new("project_health", &ctx.channels);
    let poll = ctx.clone();
    handle.tasks.push(spawn_poller(ctx.config.project_health_interval, move || {
        refresh_project_health(poll.clone())
    }));
    info!(event = "hook_activated", hook = "project_health");
    handle
}

/// Live log stream for one project. A disabled hook subscribes to nothing.
pub fn activate_logs(ctx: &SyncContext, project: &str, enabled: bool) -> HookHandle {
    let name = format!("logs:{project}");
    if !enabled {
        return HookHandle::inert(name);
    }
    let mut handle = HookHandle::new(name, &ctx.channels);
    let topic = project_topic(project);
    let subscription = ctx.channels.join_channel(&topic, json!({}));
    handle.topics.push(topic.clone());
    let events = subscription.events();

    let store = ctx.store.clone();
    let project = project.to_string();
    handle.tasks.push(spawn_channel_pump(
        topic,
        events,
        move |event, payload| {
            apply_log_event(&store, &project, event, payload);
        },
        || {},
    ));
    handle
}

/// Keeps exactly one project's log stream live, and refreshes that project's
/// health when it becomes the followed one.
#[derive(Default)]
pub struct LogFollower {
    current: Option<(String, HookHandle)>,
}

impl LogFollower {
    pub fn following(&self) -> Option<&str> {
        self.current.as_ref().map(|(project, _)| project.as_str())
    }

    pub fn follow(&mut self, ctx: &SyncContext, project: Option<&str>) {
        if self.following() == project {
            return;
        }
        if let Some((previous, handle)) = self.current.take() {
            handle.deactivate();
            debug!(event = "log_follow_stopped", project = %previous);
        }
        if let Some(project) = project {
            let handle = activate_logs(ctx, project, true);
            detach(refresh_one_project_health(ctx.clone(), project.to_string()));
            self.current = Some((project.to_string(), handle));
            info!(event = "log_follow_started", project = project);
        }
    }
}

/// The always-on hooks of the window process.
pub struct SyncHooks {
    handles: Vec<HookHandle>,
}

impl SyncHooks {
    pub fn activate(ctx: &SyncContext) -> Self {
        ctx.channels.connect();
        Self {
            handles: vec![
                activate_projects(ctx),
                activate_services(ctx),
                activate_system_health(ctx),
                activate_project_health(ctx),
            ],
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.handles.iter().map(HookHandle::name).collect()
    }

    pub fn deactivate(self) {
        for handle in self.handles {
            handle.deactivate();
        }
    }
}

/// Re-fetches both entity lists, e.g. when the tray asks for a refresh.
pub async fn refresh_lists(ctx: &SyncContext) {
    let (projects, services) = tokio::join!(
        refresh_projects(ctx.clone()),
        refresh_services(ctx.clone())
    );
    debug!(event = "sync_lists_refreshed", projects, services);
}
