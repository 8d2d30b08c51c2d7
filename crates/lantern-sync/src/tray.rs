//! Tray menu projection. The menu is a pure function of the two lists the
//! tray fetches itself; it never reads the window's store.

use crate::api::DaemonClient;
use lantern_core::bridge_ipc::ActionKind;
use lantern_core::{Project, ProjectStatus, Service};
use std::fmt::Write as _;
use tracing::debug;

pub const TRAY_TOOLTIP: &str = "Lantern - Dev Environment Manager";
pub const NO_PROJECTS: &str = "No projects detected";
pub const NO_SERVICES: &str = "No services available";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MenuAction {
    OpenDashboard,
    OpenUrl(String),
    Dispatch(ActionKind, String),
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MenuItem {
    Action {
        label: String,
        enabled: bool,
        checked: Option<bool>,
        action: Option<MenuAction>,
    },
    Submenu {
        label: String,
        items: Vec<MenuItem>,
    },
    Separator,
}

impl MenuItem {
    fn action(label: impl Into<String>, action: MenuAction) -> Self {
        MenuItem::Action {
            label: label.into(),
            enabled: true,
            checked: None,
            action: Some(action),
        }
    }

    fn placeholder(label: &str) -> Self {
        MenuItem::Action {
            label: label.to_string(),
            enabled: false,
            checked: None,
            action: None,
        }
    }

    pub fn label(&self) -> Option<&str> {
        match self {
            MenuItem::Action { label, .. } | MenuItem::Submenu { label, .. } => Some(label),
            MenuItem::Separator => None,
        }
    }
}

fn project_item(project: &Project) -> MenuItem {
    let running = project.status == ProjectStatus::Running;
    let url = format!("https://{}", project.domain);
    let toggle = if running {
        MenuItem::action("Stop", MenuAction::Dispatch(ActionKind::ProjectStop, project.name.clone()))
    } else {
        MenuItem::action(
            "Start",
            MenuAction::Dispatch(ActionKind::ProjectStart, project.name.clone()),
        )
    };
    MenuItem::Submenu {
        label: format!("{} ({})", project.name, project.status),
        items: vec![
            MenuItem::Action {
                label: format!("Open {url}"),
                enabled: running,
                checked: None,
                action: Some(MenuAction::OpenUrl(url)),
            },
            toggle,
        ],
    }
}

fn service_item(service: &Service) -> MenuItem {
    let running = service.is_running();
    let kind = if running {
        ActionKind::ServiceStop
    } else {
        ActionKind::ServiceStart
    };
    MenuItem::Action {
        label: service.name.clone(),
        enabled: true,
        checked: Some(running),
        action: Some(MenuAction::Dispatch(kind, service.name.clone())),
    }
}

pub fn build_tray_menu(projects: &[Project], services: &[Service]) -> Vec<MenuItem> {
    let project_items = if projects.is_empty() {
        vec![MenuItem::placeholder(NO_PROJECTS)]
    } else {
        projects.iter().map(project_item).collect()
    };
    let service_items = if services.is_empty() {
        vec![MenuItem::placeholder(NO_SERVICES)]
    } else {
        services.iter().map(service_item).collect()
    };

    vec![
        MenuItem::action("Open Dashboard", MenuAction::OpenDashboard),
        MenuItem::Separator,
        MenuItem::Submenu {
            label: "Projects".to_string(),
            items: project_items,
        },
        MenuItem::Separator,
        MenuItem::Submenu {
            label: "Services".to_string(),
            items: service_items,
        },
        MenuItem::Separator,
        MenuItem::action("Quit Lantern", MenuAction::Quit),
    ]
}

/// Enabled items carrying an action, depth-first, in display order. The
/// index here is the number shown by [`render_menu_text`].
pub fn activatable_items(menu: &[MenuItem]) -> Vec<(String, MenuAction)> {
    let mut out = Vec::new();
    collect_activatable(menu, &mut out);
    out
}

fn collect_activatable(items: &[MenuItem], out: &mut Vec<(String, MenuAction)>) {
    for item in items {
        match item {
            MenuItem::Action {
                label,
                enabled: true,
                action: Some(action),
                ..
            } => out.push((label.clone(), action.clone())),
            MenuItem::Submenu { items, .. } => collect_activatable(items, out),
            _ => {}
        }
    }
}

pub fn render_menu_text(menu: &[MenuItem]) -> String {
    let mut out = String::new();
    let mut counter = 0usize;
    render_level(menu, 0, &mut counter, &mut out);
    out
}

fn render_level(items: &[MenuItem], depth: usize, counter: &mut usize, out: &mut String) {
    let indent = "  ".repeat(depth);
    for item in items {
        match item {
            MenuItem::Separator => {
                let _ = writeln!(out, "{indent}----");
            }
            MenuItem::Submenu { label, items } => {
                let _ = writeln!(out, "{indent}{label}");
                render_level(items, depth + 1, counter, out);
            }
            MenuItem::Action {
                label,
                enabled,
                checked,
                action,
            } => {
                let mark = match checked {
                    Some(true) => "[x] ",
                    Some(false) => "[ ] ",
                    None => "",
                };
                if *enabled && action.is_some() {
                    *counter += 1;
                    let _ = writeln!(out, "{indent}{counter:>2}) {mark}{label}");
                } else {
                    let _ = writeln!(out, "{indent}    {mark}{label} (disabled)");
                }
            }
        }
    }
}

/// Fetches both lists for a rebuild; a failed fetch counts as empty.
pub async fn fetch_tray_lists(api: &DaemonClient) -> (Vec<Project>, Vec<Service>) {
    let (projects, services) = tokio::join!(api.list_projects(), api.list_services());
    let projects = projects.unwrap_or_else(|err| {
        debug!(event = "tray_projects_fetch_failed", error = %err);
        Vec::new()
    });
    let services = services.unwrap_or_else(|err| {
        debug!(event = "tray_services_fetch_failed", error = %err);
        Vec::new()
    });
    (projects, services)
}
