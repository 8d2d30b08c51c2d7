//! Edge-triggered daemon liveness tracking.

use crate::api::DaemonClient;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityChange {
    Connected,
    Disconnected,
}

impl ConnectivityChange {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectivityChange::Connected)
    }
}

pub const DAEMON_NOT_RUNNING: &str =
    "Daemon is not running. Start it with: sudo systemctl start lantern";

/// User-facing notice for a change. The very first observation is only
/// announced when the daemon is down.
pub fn notice_for(change: ConnectivityChange, first: bool) -> Option<&'static str> {
    match (change, first) {
        (ConnectivityChange::Connected, true) => None,
        (ConnectivityChange::Disconnected, true) => Some(DAEMON_NOT_RUNNING),
        (ConnectivityChange::Connected, false) => Some("Daemon connected"),
        (ConnectivityChange::Disconnected, false) => Some("Daemon connection lost"),
    }
}

/// Starts unknown, so the very first observation always reports.
#[derive(Debug, Default, Clone)]
pub struct ConnectivityTracker {
    last: Option<bool>,
}

impl ConnectivityTracker {
    pub fn observe(&mut self, reachable: bool) -> Option<ConnectivityChange> {
        if self.last == Some(reachable) {
            return None;
        }
        self.last = Some(reachable);
        Some(if reachable {
            ConnectivityChange::Connected
        } else {
            ConnectivityChange::Disconnected
        })
    }

    pub fn current(&self) -> Option<bool> {
        self.last
    }
}

/// Probes the daemon every `interval` until `shutdown` flips to true, sending
/// only state changes to `tx`.
pub async fn run_watcher(
    client: DaemonClient,
    interval: Duration,
    tx: mpsc::Sender<ConnectivityChange>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tracker = ConnectivityTracker::default();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let reachable = client.probe().await;
                if let Some(change) = tracker.observe(reachable) {
                    if change.is_connected() {
                        info!(event = "daemon_connected", url = %client.base_url());
                    } else {
                        warn!(event = "daemon_disconnected", url = %client.base_url());
                    }
                    if tx.send(change).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}
