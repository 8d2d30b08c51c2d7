//! HTTP client for the daemon's JSON API.

use crate::config::SyncConfig;
use lantern_core::{
    ApiErrorBody, ApiResponse, HealthStatus, Project, ProjectHealthStatus, Service,
};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("daemon unreachable: {0}")]
    Transport(String),
    /// Display is the daemon's `message`, shown to the user as-is.
    #[error("{message}")]
    Daemon {
        status: u16,
        code: String,
        message: String,
    },
    #[error("unexpected daemon payload: {0}")]
    Decode(String),
    #[error("invalid daemon url: {0}")]
    Url(String),
}

impl ApiError {
    pub fn is_transport(&self) -> bool {
        matches!(self, ApiError::Transport(_))
    }

    fn from_response(status: StatusCode, body: &[u8]) -> Self {
        let fallback = || ApiErrorBody {
            error: "unknown".to_string(),
            message: status
                .canonical_reason()
                .unwrap_or_default()
                .to_string(),
        };
        let parsed = serde_json::from_slice::<ApiErrorBody>(body).unwrap_or_else(|_| fallback());
        let message = if parsed.message.trim().is_empty() {
            format!("HTTP {}", status.as_u16())
        } else {
            parsed.message
        };
        ApiError::Daemon {
            status: status.as_u16(),
            code: parsed.error,
            message,
        }
    }
}

/// Body for `PATCH /api/projects/:name`.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ProjectUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Deleted {
    pub deleted: String,
}

#[derive(Clone)]
pub struct DaemonClient {
    http: reqwest::Client,
    base: Url,
    probe_timeout: Duration,
}

impl DaemonClient {
    pub fn new(config: &SyncConfig) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| ApiError::Transport(err.to_string()))?;
        Ok(Self {
            http,
            base: config.daemon_url.clone(),
            probe_timeout: config.probe_timeout,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Builds `/api/<segments...>`, percent-encoding each segment.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base.clone();
        url.set_query(None);
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| ApiError::Url(self.base.to_string()))?;
            path.pop_if_empty().push("api").extend(segments);
        }
        Ok(url)
    }

    fn request(&self, method: Method, segments: &[&str]) -> Result<RequestBuilder, ApiError> {
        Ok(self.http.request(method, self.endpoint(segments)?))
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ApiError> {
        let response = request
            .send()
            .await
            .map_err(|err| ApiError::Transport(err.to_string()))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| ApiError::Transport(err.to_string()))?;
        if !status.is_success() {
            let err = ApiError::from_response(status, &body);
            debug!(event = "daemon_request_failed", status = status.as_u16(), error = %err);
            return Err(err);
        }
        let envelope: ApiResponse<T> =
            serde_json::from_slice(&body).map_err(|err| ApiError::Decode(err.to_string()))?;
        Ok(envelope.data)
    }

    async fn get<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T, ApiError> {
        self.send(self.request(Method::GET, segments)?).await
    }

    async fn post<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T, ApiError> {
        self.send(self.request(Method::POST, segments)?).await
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>, ApiError> {
        self.get(&["projects"]).await
    }

    pub async fn scan_projects(&self) -> Result<Vec<Project>, ApiError> {
        self.post(&["projects", "scan"]).await
    }

    pub async fn activate_project(&self, name: &str) -> Result<Project, ApiError> {
        self.post(&["projects", name, "activate"]).await
    }

    pub async fn deactivate_project(&self, name: &str) -> Result<Project, ApiError> {
        self.post(&["projects", name, "deactivate"]).await
    }

    pub async fn restart_project(&self, name: &str) -> Result<Project, ApiError> {
        self.post(&["projects", name, "restart"]).await
    }

    pub async fn patch_project(
        &self,
        name: &str,
        update: &ProjectUpdate,
    ) -> Result<Project, ApiError> {
        let request = self.request(Method::PATCH, &["projects", name])?.json(update);
        self.send(request).await
    }

    pub async fn delete_project(&self, name: &str) -> Result<Deleted, ApiError> {
        self.send(self.request(Method::DELETE, &["projects", name])?)
            .await
    }

    pub async fn list_services(&self) -> Result<Vec<Service>, ApiError> {
        self.get(&["services"]).await
    }

    pub async fn start_service(&self, name: &str) -> Result<Service, ApiError> {
        self.post(&["services", name, "start"]).await
    }

    pub async fn stop_service(&self, name: &str) -> Result<Service, ApiError> {
        self.post(&["services", name, "stop"]).await
    }

    pub async fn system_health(&self) -> Result<HealthStatus, ApiError> {
        self.get(&["system", "health"]).await
    }

    pub async fn all_project_health(
        &self,
    ) -> Result<BTreeMap<String, ProjectHealthStatus>, ApiError> {
        self.get(&["health"]).await
    }

    pub async fn project_health(&self, name: &str) -> Result<ProjectHealthStatus, ApiError> {
        self.get(&["projects", name, "health"]).await
    }

    pub async fn check_project_health(&self, name: &str) -> Result<ProjectHealthStatus, ApiError> {
        self.post(&["projects", name, "health", "check"]).await
    }

    pub async fn shutdown(&self) -> Result<serde_json::Value, ApiError> {
        self.post(&["system", "shutdown"]).await
    }

    /// Liveness probe: only a 200 within the probe timeout counts as up.
    pub async fn probe(&self) -> bool {
        let request = match self.request(Method::GET, &["system", "health"]) {
            Ok(request) => request.timeout(self.probe_timeout),
            Err(_) => return false,
        };
        match request.send().await {
            Ok(response) => response.status() == StatusCode::OK,
            Err(err) => {
                debug!(event = "daemon_probe_failed", error = %err);
                false
            }
        }
    }
}
