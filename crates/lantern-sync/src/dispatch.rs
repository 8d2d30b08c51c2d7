//! User-initiated mutations: precondition, optimistic status, request,
//! reconcile. Failures end as a toast and a status, never as a panic.

use crate::api::{ApiError, ProjectUpdate};
use crate::store::status_patch;
use crate::SyncContext;
use lantern_core::bridge_ipc::ActionKind;
use lantern_core::{Project, ProjectHealthStatus, ProjectStatus, Service, ToastKind};
use std::str::FromStr;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, warn};

pub const HIDDEN_PROJECT_MESSAGE: &str = "This project is hidden. Unhide it before starting.";

const COMPLETION_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    #[error("This project is hidden. Unhide it before starting.")]
    Hidden(String),
    #[error(transparent)]
    Api(#[from] ApiError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectVerb {
    Activate,
    Deactivate,
    Restart,
}

impl ProjectVerb {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectVerb::Activate => "activate",
            ProjectVerb::Deactivate => "deactivate",
            ProjectVerb::Restart => "restart",
        }
    }

    fn pending_status(&self) -> ProjectStatus {
        match self {
            ProjectVerb::Activate | ProjectVerb::Restart => ProjectStatus::Starting,
            ProjectVerb::Deactivate => ProjectStatus::Stopping,
        }
    }

    fn past_tense(&self) -> &'static str {
        match self {
            ProjectVerb::Activate => "activated",
            ProjectVerb::Deactivate => "deactivated",
            ProjectVerb::Restart => "restarted",
        }
    }

    fn starts_project(&self) -> bool {
        !matches!(self, ProjectVerb::Deactivate)
    }
}

/// One line of the window's command surface, e.g. `rename blog shop`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowCommand {
    Activate(String),
    Deactivate(String),
    Restart(String),
    StartService(String),
    StopService(String),
    Scan,
    Rename { from: String, to: String },
    Hide(String),
    Unhide(String),
    Delete(String),
    CheckHealth(String),
    Shutdown,
}

pub const WINDOW_COMMAND_USAGE: &str = "commands: start|stop|restart|hide|unhide|delete|health <project> \
| service-start|service-stop <service> | rename <project> <new-name> | scan | shutdown";

impl FromStr for WindowCommand {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let command = match words.as_slice() {
            ["start", name] => WindowCommand::Activate(name.to_string()),
            ["stop", name] => WindowCommand::Deactivate(name.to_string()),
            ["restart", name] => WindowCommand::Restart(name.to_string()),
            ["service-start", name] => WindowCommand::StartService(name.to_string()),
            ["service-stop", name] => WindowCommand::StopService(name.to_string()),
            ["scan"] => WindowCommand::Scan,
            ["rename", from, to] => WindowCommand::Rename {
                from: from.to_string(),
                to: to.to_string(),
            },
            ["hide", name] => WindowCommand::Hide(name.to_string()),
            ["unhide", name] => WindowCommand::Unhide(name.to_string()),
            ["delete", name] => WindowCommand::Delete(name.to_string()),
            ["health", name] => WindowCommand::CheckHealth(name.to_string()),
            ["shutdown"] => WindowCommand::Shutdown,
            _ => return Err(format!("unknown command: {}", line.trim())),
        };
        Ok(command)
    }
}

/// Published after every action that reached the daemon and succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionCompleted {
    pub action: &'static str,
    pub target: Option<String>,
}

#[derive(Clone)]
pub struct ActionDispatcher {
    ctx: SyncContext,
    completions: broadcast::Sender<ActionCompleted>,
}

impl ActionDispatcher {
    pub fn new(ctx: SyncContext) -> Self {
        let (completions, _) = broadcast::channel(COMPLETION_QUEUE_CAPACITY);
        Self { ctx, completions }
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    pub fn completions(&self) -> broadcast::Receiver<ActionCompleted> {
        self.completions.subscribe()
    }

    fn complete(&self, action: &'static str, target: Option<&str>) {
        let _ = self.completions.send(ActionCompleted {
            action,
            target: target.map(str::to_string),
        });
    }

    fn fail(&self, action: &str, target: &str, err: &ApiError) {
        warn!(event = "action_failed", action = action, target = target, error = %err);
        self.ctx.store.add_toast(ToastKind::Error, err.to_string());
    }

    pub async fn activate_project(&self, name: &str) -> Result<Project, ActionError> {
        self.run_project_verb(name, ProjectVerb::Activate).await
    }

    pub async fn deactivate_project(&self, name: &str) -> Result<Project, ActionError> {
        self.run_project_verb(name, ProjectVerb::Deactivate).await
    }

    pub async fn restart_project(&self, name: &str) -> Result<Project, ActionError> {
        self.run_project_verb(name, ProjectVerb::Restart).await
    }

    pub async fn run_project_verb(
        &self,
        name: &str,
        verb: ProjectVerb,
    ) -> Result<Project, ActionError> {
        let store = &self.ctx.store;
        if verb.starts_project() {
            if let Some(project) = store.project(name) {
                if !project.is_enabled() {
                    store.add_toast(ToastKind::Warning, HIDDEN_PROJECT_MESSAGE);
                    info!(event = "action_refused_hidden", action = verb.as_str(), target = name);
                    return Err(ActionError::Hidden(name.to_string()));
                }
            }
        }

        store.patch::<Project>(name, &status_patch(verb.pending_status()));

        let api = &self.ctx.api;
        let result = match verb {
            ProjectVerb::Activate => api.activate_project(name).await,
            ProjectVerb::Deactivate => api.deactivate_project(name).await,
            ProjectVerb::Restart => api.restart_project(name).await,
        };

        match result {
            Ok(project) => {
                store.upsert(project.clone());
                store.add_toast(
                    ToastKind::Success,
                    format!("Project \"{name}\" {}", verb.past_tense()),
                );
                info!(event = "action_succeeded", action = verb.as_str(), target = name, status = %project.status);
                self.complete(verb.as_str(), Some(name));
                Ok(project)
            }
            Err(err) => {
                store.patch::<Project>(name, &status_patch(ProjectStatus::Error));
                self.fail(verb.as_str(), name, &err);
                Err(err.into())
            }
        }
    }

    pub async fn start_service(&self, name: &str) -> Result<Service, ActionError> {
        self.run_service_verb(name, true).await
    }

    pub async fn stop_service(&self, name: &str) -> Result<Service, ActionError> {
        self.run_service_verb(name, false).await
    }

    async fn run_service_verb(&self, name: &str, start: bool) -> Result<Service, ActionError> {
        let (action, done) = if start {
            ("service_start", "started")
        } else {
            ("service_stop", "stopped")
        };
        let result = if start {
            self.ctx.api.start_service(name).await
        } else {
            self.ctx.api.stop_service(name).await
        };
        match result {
            Ok(service) => {
                self.ctx.store.upsert(service.clone());
                self.ctx
                    .store
                    .add_toast(ToastKind::Success, format!("Service \"{name}\" {done}"));
                info!(event = "action_succeeded", action = action, target = name, status = %service.status);
                self.complete(action, Some(name));
                Ok(service)
            }
            Err(err) => {
                self.fail(action, name, &err);
                Err(err.into())
            }
        }
    }

    pub async fn scan_projects(&self) -> Result<Vec<Project>, ActionError> {
        match self.ctx.api.scan_projects().await {
            Ok(projects) => {
                self.ctx.store.replace_all(projects.clone());
                self.ctx
                    .store
                    .add_toast(ToastKind::Success, "Project scan complete");
                info!(event = "action_succeeded", action = "scan", count = projects.len());
                self.complete("scan", None);
                Ok(projects)
            }
            Err(err) => {
                self.fail("scan", "", &err);
                Err(err.into())
            }
        }
    }

    pub async fn rename_project(&self, name: &str, new_name: &str) -> Result<Project, ActionError> {
        let update = ProjectUpdate {
            new_name: Some(new_name.to_string()),
            ..ProjectUpdate::default()
        };
        match self.ctx.api.patch_project(name, &update).await {
            Ok(project) => {
                self.ctx.store.rename(name, project.clone());
                self.ctx.store.add_toast(
                    ToastKind::Success,
                    format!("Project renamed to \"{}\"", project.name),
                );
                info!(event = "action_succeeded", action = "rename", target = name, renamed = %project.name);
                self.complete("rename", Some(&project.name));
                Ok(project)
            }
            Err(err) => {
                self.fail("rename", name, &err);
                Err(err.into())
            }
        }
    }

    pub async fn set_project_hidden(&self, name: &str, hidden: bool) -> Result<Project, ActionError> {
        let update = ProjectUpdate {
            enabled: Some(!hidden),
            ..ProjectUpdate::default()
        };
        match self.ctx.api.patch_project(name, &update).await {
            Ok(project) => {
                self.ctx.store.upsert(project.clone());
                let verb = if hidden { "hidden" } else { "unhidden" };
                self.ctx
                    .store
                    .add_toast(ToastKind::Success, format!("Project \"{name}\" {verb}"));
                info!(event = "action_succeeded", action = "set_hidden", target = name, hidden);
                self.complete("set_hidden", Some(name));
                Ok(project)
            }
            Err(err) => {
                self.fail("set_hidden", name, &err);
                Err(err.into())
            }
        }
    }

    pub async fn delete_project(&self, name: &str) -> Result<(), ActionError> {
        match self.ctx.api.delete_project(name).await {
            Ok(deleted) => {
                self.ctx.store.remove::<Project>(&deleted.deleted);
                self.ctx
                    .store
                    .add_toast(ToastKind::Success, format!("Project \"{name}\" removed"));
                info!(event = "action_succeeded", action = "delete", target = name);
                self.complete("delete", Some(name));
                Ok(())
            }
            Err(err) => {
                self.fail("delete", name, &err);
                Err(err.into())
            }
        }
    }

    /// Forces an immediate health check; the result is stored, not toasted.
    pub async fn check_project_health(
        &self,
        name: &str,
    ) -> Result<ProjectHealthStatus, ActionError> {
        match self.ctx.api.check_project_health(name).await {
            Ok(health) => {
                self.ctx.store.set_project_health(name, health.clone());
                Ok(health)
            }
            Err(err) => {
                self.fail("health_check", name, &err);
                Err(err.into())
            }
        }
    }

    pub async fn shutdown_daemon(&self) -> Result<(), ActionError> {
        match self.ctx.api.shutdown().await {
            Ok(_) => {
                info!(event = "daemon_shutdown_requested");
                self.ctx
                    .store
                    .add_toast(ToastKind::Info, "Daemon is shutting down");
                Ok(())
            }
            Err(err) => {
                self.fail("shutdown", "", &err);
                Err(err.into())
            }
        }
    }

    pub async fn run_command(&self, command: &WindowCommand) -> Result<(), ActionError> {
        match command {
            WindowCommand::Activate(name) => self.activate_project(name).await.map(|_| ()),
            WindowCommand::Deactivate(name) => self.deactivate_project(name).await.map(|_| ()),
            WindowCommand::Restart(name) => self.restart_project(name).await.map(|_| ()),
            WindowCommand::StartService(name) => self.start_service(name).await.map(|_| ()),
            WindowCommand::StopService(name) => self.stop_service(name).await.map(|_| ()),
            WindowCommand::Scan => self.scan_projects().await.map(|_| ()),
            WindowCommand::Rename { from, to } => self.rename_project(from, to).await.map(|_| ()),
            WindowCommand::Hide(name) => self.set_project_hidden(name, true).await.map(|_| ()),
            WindowCommand::Unhide(name) => self.set_project_hidden(name, false).await.map(|_| ()),
            WindowCommand::Delete(name) => self.delete_project(name).await,
            WindowCommand::CheckHealth(name) => {
                self.check_project_health(name).await.map(|_| ())
            }
            WindowCommand::Shutdown => self.shutdown_daemon().await,
        }
    }

    /// Runs a verb raised from the tray through the same flow as an in-window
    /// action.
    pub async fn run_tray_action(&self, kind: ActionKind, name: &str) -> Result<(), ActionError> {
        match kind {
            ActionKind::ProjectStart => self.activate_project(name).await.map(|_| ()),
            ActionKind::ProjectStop => self.deactivate_project(name).await.map(|_| ()),
            ActionKind::ServiceStart => self.start_service(name).await.map(|_| ()),
            ActionKind::ServiceStop => self.stop_service(name).await.map(|_| ()),
        }
    }
}
