pub mod api;
pub mod bridge;
pub mod config;
pub mod connectivity;
pub mod dispatch;
pub mod hooks;
pub mod logging;
pub mod socket;
pub mod store;
pub mod tray;

use api::{ApiError, DaemonClient};
use config::SyncConfig;
use socket::{ChannelManager, SocketConfig};
use std::sync::Arc;
use store::Store;

/// Everything a hook or the dispatcher needs, passed explicitly.
#[derive(Clone)]
pub struct SyncContext {
    pub store: Arc<Store>,
    pub api: DaemonClient,
    pub channels: ChannelManager,
    pub config: SyncConfig,
}

impl SyncContext {
    pub fn new(config: SyncConfig, store: Arc<Store>) -> Result<Self, ApiError> {
        let api = DaemonClient::new(&config)?;
        let channels = ChannelManager::new(SocketConfig {
            url: config.socket_url.clone(),
            heartbeat_interval: config.heartbeat_interval,
        });
        Ok(Self {
            store,
            api,
            channels,
            config,
        })
    }
}
