//! The single in-memory view of daemon state held by the window process.
//!
//! Writes are applied in call order (last applied write wins) and every
//! mutation is broadcast to subscribers before the mutating call returns.

use chrono::Utc;
use lantern_core::{
    HealthStatus, LogEntry, Project, ProjectHealthStatus, ProjectStatus, Service, Toast, ToastKind,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

pub const MAX_LOG_ENTRIES: usize = 1000;
pub const TOAST_TTL: Duration = Duration::from_secs(5);
const CHANGE_QUEUE_CAPACITY: usize = 1024;

/// Shallow field set merged into an entity by [`Store::patch`].
pub type Patch = Map<String, Value>;

pub fn status_patch(status: ProjectStatus) -> Patch {
    let mut patch = Patch::new();
    patch.insert("status".to_string(), Value::String(status.as_str().to_string()));
    patch
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Project,
    Service,
}

pub trait Entity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: EntityKind;

    fn name(&self) -> &str;
    fn table(tables: &EntityTables) -> &EntityTable<Self>;
    fn table_mut(tables: &mut EntityTables) -> &mut EntityTable<Self>;
}

impl Entity for Project {
    const KIND: EntityKind = EntityKind::Project;

    fn name(&self) -> &str {
        &self.name
    }

    fn table(tables: &EntityTables) -> &EntityTable<Self> {
        &tables.projects
    }

    fn table_mut(tables: &mut EntityTables) -> &mut EntityTable<Self> {
        &mut tables.projects
    }
}

impl Entity for Service {
    const KIND: EntityKind = EntityKind::Service;

    fn name(&self) -> &str {
        &self.name
    }

    fn table(tables: &EntityTables) -> &EntityTable<Self> {
        &tables.services
    }

    fn table_mut(tables: &mut EntityTables) -> &mut EntityTable<Self> {
        &mut tables.services
    }
}

/// Name-keyed rows in daemon order. At most one row per name.
#[derive(Debug, Clone)]
pub struct EntityTable<T> {
    rows: Vec<T>,
    loaded: bool,
}

impl<T> Default for EntityTable<T> {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            loaded: false,
        }
    }
}

impl<T: Entity> EntityTable<T> {
    pub fn rows(&self) -> &[T] {
        &self.rows
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        self.rows.iter().find(|row| row.name() == name)
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.rows.iter().position(|row| row.name() == name)
    }

    fn replace_all(&mut self, items: Vec<T>) {
        let mut rows: Vec<T> = Vec::with_capacity(items.len());
        for item in items {
            match rows.iter().position(|row| row.name() == item.name()) {
                Some(idx) => rows[idx] = item,
                None => rows.push(item),
            }
        }
        self.rows = rows;
        self.loaded = true;
    }

    fn upsert(&mut self, item: T) {
        match self.position(item.name()) {
            Some(idx) => self.rows[idx] = item,
            None => self.rows.push(item),
        }
    }

    fn patch(&mut self, name: &str, patch: &Patch) -> Result<bool, serde_json::Error> {
        let Some(idx) = self.position(name) else {
            return Ok(false);
        };
        let merged = merge_fields(&self.rows[idx], patch)?;
        self.rows[idx] = merged;
        Ok(true)
    }

    fn remove(&mut self, name: &str) -> Option<T> {
        self.position(name).map(|idx| self.rows.remove(idx))
    }
}

#[derive(Debug, Clone, Default)]
pub struct EntityTables {
    projects: EntityTable<Project>,
    services: EntityTable<Service>,
}

fn merge_fields<T: Entity>(current: &T, patch: &Patch) -> Result<T, serde_json::Error> {
    let mut value = serde_json::to_value(current)?;
    if let Value::Object(fields) = &mut value {
        for (key, field) in patch {
            // renames go through Store::rename so the key never changes in place
            if key == "name" {
                continue;
            }
            fields.insert(key.clone(), field.clone());
        }
    }
    serde_json::from_value(value)
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChangeKind {
    Replaced(EntityKind),
    Upserted(EntityKind, String),
    Patched(EntityKind, String),
    Removed(EntityKind, String),
    Renamed {
        kind: EntityKind,
        from: String,
        to: String,
    },
    Health,
    ProjectHealth(Option<String>),
    LogAppended(String),
    LogsCleared(String),
    ToastAdded(Toast),
    ToastDismissed(String),
    Connectivity(bool),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreChange {
    pub revision: u64,
    pub kind: ChangeKind,
}

/// Consistent copy of everything except log buffers.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    pub revision: u64,
    pub projects: Vec<Project>,
    pub projects_loaded: bool,
    pub services: Vec<Service>,
    pub services_loaded: bool,
    pub health: Option<HealthStatus>,
    pub project_health: BTreeMap<String, ProjectHealthStatus>,
    pub toasts: Vec<Toast>,
    pub daemon_connected: Option<bool>,
}

impl StoreSnapshot {
    pub fn project(&self, name: &str) -> Option<&Project> {
        self.projects.iter().find(|p| p.name == name)
    }

    pub fn service(&self, name: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.name == name)
    }
}

#[derive(Default)]
struct StoreState {
    revision: u64,
    tables: EntityTables,
    health: Option<HealthStatus>,
    project_health: BTreeMap<String, ProjectHealthStatus>,
    logs: HashMap<String, VecDeque<LogEntry>>,
    toasts: Vec<Toast>,
    daemon_connected: Option<bool>,
}

pub struct Store {
    state: Mutex<StoreState>,
    changes: broadcast::Sender<StoreChange>,
    toast_ttl: Duration,
}

impl Store {
    pub fn new() -> Arc<Self> {
        Self::with_toast_ttl(TOAST_TTL)
    }

    pub fn with_toast_ttl(toast_ttl: Duration) -> Arc<Self> {
        let (changes, _) = broadcast::channel(CHANGE_QUEUE_CAPACITY);
        Arc::new(Self {
            state: Mutex::new(StoreState::default()),
            changes,
            toast_ttl,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn commit(&self, state: &mut StoreState, kind: ChangeKind) {
        state.revision += 1;
        // nobody listening is fine
        let _ = self.changes.send(StoreChange {
            revision: state.revision,
            kind,
        });
    }

    pub fn revision(&self) -> u64 {
        self.lock().revision
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        let state = self.lock();
        StoreSnapshot {
            revision: state.revision,
            projects: state.tables.projects.rows.clone(),
            projects_loaded: state.tables.projects.loaded,
            services: state.tables.services.rows.clone(),
            services_loaded: state.tables.services.loaded,
            health: state.health.clone(),
            project_health: state.project_health.clone(),
            toasts: state.toasts.clone(),
            daemon_connected: state.daemon_connected,
        }
    }

    pub fn all<T: Entity>(&self) -> Vec<T> {
        T::table(&self.lock().tables).rows.clone()
    }

    pub fn get<T: Entity>(&self, name: &str) -> Option<T> {
        T::table(&self.lock().tables).get(name).cloned()
    }

    pub fn is_loaded<T: Entity>(&self) -> bool {
        T::table(&self.lock().tables).loaded
    }

    pub fn project(&self, name: &str) -> Option<Project> {
        self.get::<Project>(name)
    }

    pub fn service(&self, name: &str) -> Option<Service> {
        self.get::<Service>(name)
    }

    pub fn replace_all<T: Entity>(&self, items: Vec<T>) {
        let mut state = self.lock();
        T::table_mut(&mut state.tables).replace_all(items);
        self.commit(&mut state, ChangeKind::Replaced(T::KIND));
    }

    pub fn upsert<T: Entity>(&self, item: T) {
        let name = item.name().to_string();
        let mut state = self.lock();
        T::table_mut(&mut state.tables).upsert(item);
        self.commit(&mut state, ChangeKind::Upserted(T::KIND, name));
    }

    /// Returns `false` when `name` is absent; absent entities are never
    /// recreated by a patch.
    pub fn patch<T: Entity>(&self, name: &str, patch: &Patch) -> bool {
        let mut state = self.lock();
        match T::table_mut(&mut state.tables).patch(name, patch) {
            Ok(true) => {
                self.commit(&mut state, ChangeKind::Patched(T::KIND, name.to_string()));
                true
            }
            Ok(false) => {
                debug!(event = "store_patch_absent", kind = ?T::KIND, entity = name);
                false
            }
            Err(err) => {
                warn!(event = "store_patch_rejected", kind = ?T::KIND, entity = name, error = %err);
                false
            }
        }
    }

    pub fn remove<T: Entity>(&self, name: &str) -> Option<T> {
        let mut state = self.lock();
        let removed = T::table_mut(&mut state.tables).remove(name);
        if removed.is_some() {
            if T::KIND == EntityKind::Project {
                state.logs.remove(name);
                state.project_health.remove(name);
            }
            self.commit(&mut state, ChangeKind::Removed(T::KIND, name.to_string()));
        }
        removed
    }

    /// Delete-old plus insert-new in one critical section.
    pub fn rename<T: Entity>(&self, from: &str, item: T) {
        let to = item.name().to_string();
        let mut state = self.lock();
        let table = T::table_mut(&mut state.tables);
        match table.position(from) {
            Some(idx) => {
                table.rows.remove(idx);
                if let Some(existing) = table.position(&to) {
                    table.rows.remove(existing);
                }
                let idx = idx.min(table.rows.len());
                table.rows.insert(idx, item);
            }
            None => table.upsert(item),
        }
        if T::KIND == EntityKind::Project && from != to {
            if let Some(logs) = state.logs.remove(from) {
                state.logs.insert(to.clone(), logs);
            }
            if let Some(health) = state.project_health.remove(from) {
                state.project_health.insert(to.clone(), health);
            }
        }
        self.commit(
            &mut state,
            ChangeKind::Renamed {
                kind: T::KIND,
                from: from.to_string(),
                to,
            },
        );
    }

    pub fn health(&self) -> Option<HealthStatus> {
        self.lock().health.clone()
    }

    pub fn set_health(&self, health: HealthStatus) {
        let mut state = self.lock();
        state.health = Some(health);
        self.commit(&mut state, ChangeKind::Health);
    }

    pub fn project_health(&self, name: &str) -> Option<ProjectHealthStatus> {
        self.lock().project_health.get(name).cloned()
    }

    pub fn replace_project_health(&self, health: BTreeMap<String, ProjectHealthStatus>) {
        let mut state = self.lock();
        state.project_health = health;
        self.commit(&mut state, ChangeKind::ProjectHealth(None));
    }

    pub fn set_project_health(&self, name: &str, health: ProjectHealthStatus) {
        let mut state = self.lock();
        state.project_health.insert(name.to_string(), health);
        self.commit(&mut state, ChangeKind::ProjectHealth(Some(name.to_string())));
    }

    pub fn logs(&self, project: &str) -> Vec<LogEntry> {
        self.lock()
            .logs
            .get(project)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_logs(&self, project: &str) -> bool {
        self.lock().logs.contains_key(project)
    }

    pub fn append_log(&self, project: &str, entry: LogEntry) {
        let mut state = self.lock();
        let entries = state.logs.entry(project.to_string()).or_default();
        while entries.len() >= MAX_LOG_ENTRIES {
            entries.pop_front();
        }
        entries.push_back(entry);
        self.commit(&mut state, ChangeKind::LogAppended(project.to_string()));
    }

    pub fn clear_logs(&self, project: &str) {
        let mut state = self.lock();
        if state.logs.remove(project).is_some() {
            self.commit(&mut state, ChangeKind::LogsCleared(project.to_string()));
        }
    }

    pub fn toasts(&self) -> Vec<Toast> {
        self.lock().toasts.clone()
    }

    /// Records a toast and, inside a tokio runtime, schedules its expiry.
    pub fn add_toast(self: &Arc<Self>, kind: ToastKind, message: impl Into<String>) -> String {
        let toast = Toast {
            id: Uuid::new_v4().to_string(),
            kind,
            message: message.into(),
        };
        let id = toast.id.clone();
        {
            let mut state = self.lock();
            state.toasts.push(toast.clone());
            self.commit(&mut state, ChangeKind::ToastAdded(toast));
        }

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let store = Arc::downgrade(self);
            let ttl = self.toast_ttl;
            let expired = id.clone();
            runtime.spawn(async move {
                tokio::time::sleep(ttl).await;
                if let Some(store) = store.upgrade() {
                    store.dismiss_toast(&expired);
                }
            });
        }
        id
    }

    pub fn dismiss_toast(&self, id: &str) -> bool {
        let mut state = self.lock();
        let before = state.toasts.len();
        state.toasts.retain(|toast| toast.id != id);
        if state.toasts.len() == before {
            return false;
        }
        self.commit(&mut state, ChangeKind::ToastDismissed(id.to_string()));
        true
    }

    pub fn daemon_connected(&self) -> Option<bool> {
        self.lock().daemon_connected
    }

    /// Only an actual change is recorded.
    pub fn set_daemon_connected(&self, connected: bool) -> bool {
        let mut state = self.lock();
        if state.daemon_connected == Some(connected) {
            return false;
        }
        state.daemon_connected = Some(connected);
        self.commit(&mut state, ChangeKind::Connectivity(connected));
        true
    }
}

pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339()
}
