use std::env;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

pub const DEFAULT_DAEMON_URL: &str = "http://127.0.0.1:4777";
pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Timing knobs shared by hooks, the channel manager and the tray side.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub daemon_url: Url,
    pub socket_url: Url,
    pub request_timeout: Duration,
    pub probe_timeout: Duration,
    pub probe_interval: Duration,
    pub system_health_interval: Duration,
    pub project_health_interval: Duration,
    pub tray_poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub action_timeout: Duration,
}

impl SyncConfig {
    pub fn new(daemon_url: Url) -> Self {
        let socket_url = socket_url_for(&daemon_url);
        Self {
            daemon_url,
            socket_url,
            request_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(3),
            probe_interval: Duration::from_secs(10),
            system_health_interval: Duration::from_secs(15),
            project_health_interval: Duration::from_secs(30),
            tray_poll_interval: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            action_timeout: DEFAULT_ACTION_TIMEOUT,
        }
    }

    /// Flags win over `LANTERN_*` variables, which win over defaults.
    pub fn resolve(daemon_flag: &str) -> Result<Self, url::ParseError> {
        let daemon_url = resolve_daemon_url(daemon_flag)?;
        let mut config = Self::new(daemon_url);
        if let Some(socket_url) = resolve_socket_url()? {
            config.socket_url = socket_url;
        }
        config.action_timeout = resolve_action_timeout();
        Ok(config)
    }
}

/// `http://host:port` -> `ws://host:port/socket/websocket?vsn=2.0.0`.
pub fn socket_url_for(daemon_url: &Url) -> Url {
    let mut url = daemon_url.clone();
    let scheme = if daemon_url.scheme() == "https" {
        "wss"
    } else {
        "ws"
    };
    let _ = url.set_scheme(scheme);
    url.set_path("/socket/websocket");
    url.set_query(Some(&format!("vsn={}", lantern_core::phoenix::PHOENIX_VSN)));
    url
}

pub fn parse_bool_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

pub fn resolve_daemon_url(flag: &str) -> Result<Url, url::ParseError> {
    if !flag.trim().is_empty() {
        return Url::parse(flag.trim());
    }
    if let Some(value) = non_empty_var("LANTERN_DAEMON_URL") {
        return Url::parse(value.trim());
    }
    Url::parse(DEFAULT_DAEMON_URL)
}

fn resolve_socket_url() -> Result<Option<Url>, url::ParseError> {
    non_empty_var("LANTERN_SOCKET_URL")
        .map(|value| Url::parse(value.trim()))
        .transpose()
}

pub fn resolve_action_timeout() -> Duration {
    non_empty_var("LANTERN_ACTION_TIMEOUT_SECS")
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_ACTION_TIMEOUT)
}

pub fn resolve_bridge_socket_path(flag: &str) -> PathBuf {
    if !flag.trim().is_empty() {
        return PathBuf::from(flag.trim());
    }
    if let Some(value) = non_empty_var("LANTERN_BRIDGE_SOCK") {
        return PathBuf::from(value);
    }
    let runtime_dir = if let Some(value) = non_empty_var("XDG_RUNTIME_DIR") {
        PathBuf::from(value)
    } else if let Some(uid) = non_empty_var("UID") {
        PathBuf::from(format!("/run/user/{uid}"))
    } else {
        PathBuf::from("/tmp")
    };
    runtime_dir.join("lantern").join("bridge.sock")
}

pub fn resolve_log_dir(flag: &str) -> PathBuf {
    if !flag.trim().is_empty() {
        return PathBuf::from(flag.trim());
    }
    if let Some(value) = non_empty_var("LANTERN_LOG_DIR") {
        return PathBuf::from(value);
    }
    if let Some(value) = non_empty_var("XDG_STATE_HOME") {
        return PathBuf::from(value).join("lantern").join("logs");
    }
    if let Some(value) = non_empty_var("HOME") {
        return PathBuf::from(value)
            .join(".local")
            .join("state")
            .join("lantern")
            .join("logs");
    }
    PathBuf::from(".lantern/logs")
}

pub fn resolve_log_stdout() -> bool {
    env::var("LANTERN_LOG_STDOUT")
        .ok()
        .and_then(|value| parse_bool_flag(&value))
        .unwrap_or(false)
}

pub fn resolve_log_level() -> String {
    non_empty_var("LANTERN_LOG_LEVEL").unwrap_or_else(|| "info".to_string())
}

/// Doubling backoff capped at ten seconds, used for the bridge reconnect loop.
pub fn next_backoff(current: Duration) -> Duration {
    let next = current + current;
    if next > Duration::from_secs(10) {
        Duration::from_secs(10)
    } else {
        next
    }
}
