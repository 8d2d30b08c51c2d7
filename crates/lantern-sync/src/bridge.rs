//! Tray <-> window action bridge over a Unix socket owned by the tray.
//!
//! The tray raises `tray_action` commands and waits for exactly one
//! `action_result` per `actionId`. Commands that outlive the action timeout
//! settle as [`ActionOutcome::Abandoned`]; acknowledgments that arrive after
//! that are dropped.

use crate::config::{next_backoff, DEFAULT_ACTION_TIMEOUT};
use crate::dispatch::ActionDispatcher;
use crate::hooks::refresh_lists;
use chrono::Utc;
use lantern_core::bridge_ipc::{
    encode_frame, ActionKind, ActionResultPayload, BridgeEnvelope, BridgeMsg, BridgeRole,
    DaemonStatusPayload, HelloPayload, NdjsonFrameDecoder, RefreshPayload,
    TrayActionPayload, DEFAULT_MAX_FRAME_BYTES, PROTOCOL_VERSION,
};
use std::{
    collections::{HashMap, VecDeque},
    io,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
#[cfg(unix)]
use std::{fs, os::unix::fs::PermissionsExt};
use thiserror::Error;
#[cfg(unix)]
use tokio::net::{
    unix::{OwnedReadHalf, OwnedWriteHalf},
    UnixListener, UnixStream,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::{broadcast, mpsc, watch, Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const WINDOW_NOT_CONNECTED: &str = "main window is not connected";
pub const WINDOW_DISCONNECTED: &str = "main window disconnected";

const EVENT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("bridge io error: {0}")]
    Io(#[from] io::Error),
    #[error("bridge peer closed the connection")]
    Closed,
}

#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub socket_path: PathBuf,
    pub client_id: String,
    pub action_timeout: Duration,
    pub write_timeout: Duration,
    pub queue_capacity: usize,
}

impl BridgeConfig {
    pub fn new(socket_path: PathBuf, client_id: impl Into<String>) -> Self {
        Self {
            socket_path,
            client_id: client_id.into(),
            action_timeout: DEFAULT_ACTION_TIMEOUT,
            write_timeout: Duration::from_secs(2),
            queue_capacity: 64,
        }
    }
}

fn envelope(sender_id: &str, msg: BridgeMsg) -> BridgeEnvelope {
    BridgeEnvelope {
        version: PROTOCOL_VERSION,
        sender_id: sender_id.to_string(),
        timestamp: Utc::now().to_rfc3339(),
        msg,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Succeeded,
    Failed(String),
    /// No acknowledgment within the action timeout.
    Abandoned,
}

impl ActionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ActionOutcome::Succeeded)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrayBridgeEvent {
    WindowConnected,
    WindowDisconnected,
    ActionSettled {
        action_id: String,
        kind: ActionKind,
        name: String,
        outcome: ActionOutcome,
    },
    RefreshRequested,
}

struct WindowConn {
    conn_id: String,
    sender: mpsc::Sender<BridgeEnvelope>,
}

struct PendingAction {
    kind: ActionKind,
    name: String,
    timer: Option<JoinHandle<()>>,
}

struct TrayBridgeInner {
    config: BridgeConfig,
    conn_counter: AtomicU64,
    window: RwLock<Option<WindowConn>>,
    pending: Mutex<HashMap<String, PendingAction>>,
    daemon_connected: RwLock<Option<bool>>,
    events: broadcast::Sender<TrayBridgeEvent>,
}

/// Origin side of the bridge, hosted by the tray process.
#[derive(Clone)]
pub struct TrayBridge {
    inner: Arc<TrayBridgeInner>,
}

impl TrayBridge {
    pub fn new(config: BridgeConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_QUEUE_CAPACITY);
        Self {
            inner: Arc::new(TrayBridgeInner {
                config,
                conn_counter: AtomicU64::new(0),
                window: RwLock::new(None),
                pending: Mutex::new(HashMap::new()),
                daemon_connected: RwLock::new(None),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrayBridgeEvent> {
        self.inner.events.subscribe()
    }

    pub async fn is_window_connected(&self) -> bool {
        self.inner.window.read().await.is_some()
    }

    pub async fn pending_actions(&self) -> usize {
        self.inner.pending.lock().await.len()
    }

    fn emit(&self, event: TrayBridgeEvent) {
        let _ = self.inner.events.send(event);
    }

    async fn window_sender(&self) -> Option<mpsc::Sender<BridgeEnvelope>> {
        self.inner
            .window
            .read()
            .await
            .as_ref()
            .map(|conn| conn.sender.clone())
    }

    /// Sends a verb to the window and returns its action id. The outcome is
    /// reported later as [`TrayBridgeEvent::ActionSettled`].
    pub async fn send_action(&self, kind: ActionKind, name: &str) -> String {
        let action_id = Uuid::new_v4().to_string();
        let Some(sender) = self.window_sender().await else {
            warn!(event = "bridge_action_no_window", action_id = %action_id, kind = %kind, target = name);
            self.emit(TrayBridgeEvent::ActionSettled {
                action_id: action_id.clone(),
                kind,
                name: name.to_string(),
                outcome: ActionOutcome::Failed(WINDOW_NOT_CONNECTED.to_string()),
            });
            return action_id;
        };

        // registered before sending so a fast acknowledgment finds it; the
        // timer settles through the same lock, so it cannot run ahead of the
        // insert
        {
            let mut pending = self.inner.pending.lock().await;
            let bridge = self.clone();
            let timeout = self.inner.config.action_timeout;
            let timer_id = action_id.clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                bridge.settle(&timer_id, ActionOutcome::Abandoned).await;
            });
            pending.insert(
                action_id.clone(),
                PendingAction {
                    kind,
                    name: name.to_string(),
                    timer: Some(timer),
                },
            );
        }

        let command = envelope(
            &self.inner.config.client_id,
            BridgeMsg::TrayAction(TrayActionPayload {
                action_id: action_id.clone(),
                kind,
                name: name.to_string(),
            }),
        );
        info!(event = "bridge_action_sent", action_id = %action_id, kind = %kind, target = name);
        if sender.send(command).await.is_err() {
            self.settle(&action_id, ActionOutcome::Failed(WINDOW_NOT_CONNECTED.to_string()))
                .await;
        }
        action_id
    }

    /// Resolves a pending action exactly once. Returns false for unknown or
    /// already-settled ids.
    async fn settle(&self, action_id: &str, outcome: ActionOutcome) -> bool {
        let Some(mut pending) = self.inner.pending.lock().await.remove(action_id) else {
            debug!(event = "bridge_late_ack_dropped", action_id = action_id);
            return false;
        };
        if outcome != ActionOutcome::Abandoned {
            if let Some(timer) = pending.timer.take() {
                timer.abort();
            }
        }
        match &outcome {
            ActionOutcome::Succeeded => {
                info!(event = "bridge_action_succeeded", action_id = action_id, kind = %pending.kind, target = %pending.name);
            }
            ActionOutcome::Failed(error) => {
                warn!(event = "bridge_action_failed", action_id = action_id, kind = %pending.kind, target = %pending.name, error = %error);
            }
            ActionOutcome::Abandoned => {
                warn!(event = "bridge_action_abandoned", action_id = action_id, kind = %pending.kind, target = %pending.name);
            }
        }
        self.emit(TrayBridgeEvent::ActionSettled {
            action_id: action_id.to_string(),
            kind: pending.kind,
            name: pending.name,
            outcome,
        });
        true
    }

    async fn abandon_all(&self) {
        let ids: Vec<String> = self.inner.pending.lock().await.keys().cloned().collect();
        for action_id in ids {
            self.settle(&action_id, ActionOutcome::Failed(WINDOW_DISCONNECTED.to_string()))
                .await;
        }
    }

    /// Records the daemon state and forwards it to the window, if any.
    pub async fn broadcast_daemon_status(&self, connected: bool) {
        *self.inner.daemon_connected.write().await = Some(connected);
        if let Some(sender) = self.window_sender().await {
            let msg = envelope(
                &self.inner.config.client_id,
                BridgeMsg::DaemonStatus(DaemonStatusPayload { connected }),
            );
            let _ = sender.send(msg).await;
        }
    }

    pub async fn request_refresh(&self, reason: Option<&str>) {
        if let Some(sender) = self.window_sender().await {
            let msg = envelope(
                &self.inner.config.client_id,
                BridgeMsg::Refresh(RefreshPayload {
                    reason: reason.map(str::to_string),
                }),
            );
            let _ = sender.send(msg).await;
        }
    }

    fn next_conn_id(&self) -> String {
        let id = self.inner.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("bridge-conn-{id}")
    }
}

#[cfg(not(unix))]
impl TrayBridge {
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let _ = shutdown.changed().await;
        Ok(())
    }
}

#[cfg(unix)]
impl TrayBridge {
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let socket_path = self.inner.config.socket_path.clone();
        if let Some(parent) = socket_path.parent() {
            fs::create_dir_all(parent)?;
            let _ = fs::set_permissions(parent, fs::Permissions::from_mode(0o700));
        }
        if socket_path.exists() {
            let _ = fs::remove_file(&socket_path);
        }

        let listener = UnixListener::bind(&socket_path)?;
        let _ = fs::set_permissions(&socket_path, fs::Permissions::from_mode(0o600));

        info!(
            event = "bridge_start",
            socket = %socket_path.display(),
            action_timeout_ms = self.inner.config.action_timeout.as_millis() as u64
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accept = listener.accept() => {
                    match accept {
                        Ok((stream, _addr)) => {
                            let bridge = self.clone();
                            tokio::spawn(async move {
                                bridge.handle_connection(stream).await;
                            });
                        }
                        Err(err) => {
                            warn!(event = "bridge_accept_error", error = %err);
                        }
                    }
                }
            }
        }

        let _ = fs::remove_file(&socket_path);
        info!(event = "bridge_stop");
        Ok(())
    }

    async fn handle_connection(self, stream: UnixStream) {
        let conn_id = self.next_conn_id();
        let (reader_half, writer_half) = stream.into_split();
        let mut reader = FrameReader::new(reader_half);

        let hello = match reader.next().await {
            Ok(Some(hello)) => hello,
            Ok(None) => return,
            Err(err) => {
                warn!(event = "bridge_read_error", conn_id = %conn_id, error = %err);
                return;
            }
        };
        if hello.version > PROTOCOL_VERSION {
            warn!(event = "bridge_unsupported_version", conn_id = %conn_id, version = hello.version);
            return;
        }
        let BridgeMsg::Hello(payload) = hello.msg else {
            warn!(event = "bridge_expected_hello", conn_id = %conn_id);
            return;
        };
        if payload.role != BridgeRole::Window {
            warn!(event = "bridge_invalid_role", conn_id = %conn_id, client_id = %payload.client_id);
            return;
        }

        let (tx, rx) = mpsc::channel::<BridgeEnvelope>(self.inner.config.queue_capacity);
        let write_timeout = self.inner.config.write_timeout;
        let conn_for_writer = conn_id.clone();
        let writer_task = tokio::spawn(async move {
            writer_loop(conn_for_writer, writer_half, rx, write_timeout).await;
        });

        let replaced = self.inner.window.write().await.replace(WindowConn {
            conn_id: conn_id.clone(),
            sender: tx.clone(),
        });
        if let Some(previous) = replaced {
            info!(event = "bridge_window_replaced", previous = %previous.conn_id, conn_id = %conn_id);
        }
        info!(event = "bridge_window_connected", conn_id = %conn_id, client_id = %payload.client_id);
        self.emit(TrayBridgeEvent::WindowConnected);

        let known_status = *self.inner.daemon_connected.read().await;
        if let Some(connected) = known_status {
            let msg = envelope(
                &self.inner.config.client_id,
                BridgeMsg::DaemonStatus(DaemonStatusPayload { connected }),
            );
            let _ = tx.send(msg).await;
        }

        loop {
            let frame = match reader.next().await {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(err) => {
                    warn!(event = "bridge_read_error", conn_id = %conn_id, error = %err);
                    break;
                }
            };
            if frame.version > PROTOCOL_VERSION {
                warn!(event = "bridge_skip_version", conn_id = %conn_id, version = frame.version);
                continue;
            }
            match frame.msg {
                BridgeMsg::ActionResult(result) => {
                    let outcome = if result.success {
                        ActionOutcome::Succeeded
                    } else {
                        ActionOutcome::Failed(
                            result.error.unwrap_or_else(|| "action failed".to_string()),
                        )
                    };
                    self.settle(&result.action_id, outcome).await;
                }
                BridgeMsg::Refresh(payload) => {
                    debug!(event = "bridge_refresh_received", conn_id = %conn_id, reason = ?payload.reason);
                    self.emit(TrayBridgeEvent::RefreshRequested);
                }
                other => {
                    debug!(event = "bridge_unexpected_message", conn_id = %conn_id, kind = other.kind());
                }
            }
        }

        let mut window = self.inner.window.write().await;
        let current = window
            .as_ref()
            .map(|conn| conn.conn_id == conn_id)
            .unwrap_or(false);
        if current {
            *window = None;
        }
        drop(window);
        writer_task.abort();

        if current {
            info!(event = "bridge_window_disconnected", conn_id = %conn_id);
            self.abandon_all().await;
            self.emit(TrayBridgeEvent::WindowDisconnected);
        }
    }
}

#[cfg(unix)]
async fn writer_loop(
    conn_id: String,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<BridgeEnvelope>,
    write_timeout: Duration,
) {
    while let Some(envelope) = rx.recv().await {
        let frame = match encode_frame(&envelope, DEFAULT_MAX_FRAME_BYTES) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "bridge_encode_error", conn_id = %conn_id, error = %err);
                continue;
            }
        };
        let send = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        };
        match tokio::time::timeout(write_timeout, send).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(event = "bridge_write_error", conn_id = %conn_id, error = %err);
                break;
            }
            Err(_) => {
                warn!(event = "bridge_write_timeout", conn_id = %conn_id);
                break;
            }
        }
    }
}

/// Whole envelopes off one socket half. The frame limit applies while
/// buffering, so a peer that never sends a newline cannot grow the buffer
/// past one frame.
#[cfg(unix)]
struct FrameReader {
    reader: OwnedReadHalf,
    decoder: NdjsonFrameDecoder<BridgeEnvelope>,
    ready: VecDeque<BridgeEnvelope>,
    chunk: Vec<u8>,
}

#[cfg(unix)]
impl FrameReader {
    fn new(reader: OwnedReadHalf) -> Self {
        Self {
            reader,
            decoder: NdjsonFrameDecoder::new(DEFAULT_MAX_FRAME_BYTES),
            ready: VecDeque::new(),
            chunk: vec![0; 8192],
        }
    }

    /// `Ok(None)` once the peer closed. Safe to use as a `select!` branch:
    /// decoded frames are kept across cancelled reads.
    async fn next(&mut self) -> io::Result<Option<BridgeEnvelope>> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Ok(Some(frame));
            }
            let read = self.reader.read(&mut self.chunk).await?;
            if read == 0 {
                return Ok(None);
            }
            let report = self.decoder.push_chunk(&self.chunk[..read]);
            for err in report.errors {
                warn!(event = "bridge_decode_error", error = %err);
            }
            self.ready.extend(report.frames);
        }
    }
}

#[cfg(not(unix))]
pub async fn run_window_bridge(
    _config: BridgeConfig,
    _dispatcher: ActionDispatcher,
    mut shutdown: watch::Receiver<bool>,
) {
    let _ = shutdown.changed().await;
}

/// Window side: keeps a connection to the tray socket, runs tray verbs
/// through the dispatcher and answers each with one `action_result`.
#[cfg(unix)]
pub async fn run_window_bridge(
    config: BridgeConfig,
    dispatcher: ActionDispatcher,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = Duration::from_secs(1);

    loop {
        if *shutdown.borrow() {
            break;
        }
        let connect = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            connect = UnixStream::connect(&config.socket_path) => connect,
        };
        match connect {
            Ok(stream) => {
                backoff = Duration::from_secs(1);
                info!(event = "bridge_connected", socket = %config.socket_path.display());
                match serve_window_connection(&config, &dispatcher, stream, &mut shutdown).await {
                    Ok(()) => break,
                    Err(err) => {
                        warn!(event = "bridge_connection_lost", error = %err);
                    }
                }
            }
            Err(err) => {
                debug!(event = "bridge_connect_error", socket = %config.socket_path.display(), error = %err);
            }
        }

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = next_backoff(backoff);
    }
    info!(event = "bridge_window_stop");
}

/// Returns `Ok(())` on shutdown and an error when the tray went away.
#[cfg(unix)]
async fn serve_window_connection(
    config: &BridgeConfig,
    dispatcher: &ActionDispatcher,
    stream: UnixStream,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), BridgeError> {
    let (reader_half, writer_half) = stream.into_split();
    let (tx, rx) = mpsc::channel::<BridgeEnvelope>(config.queue_capacity);
    let writer_task = tokio::spawn(writer_loop(
        config.client_id.clone(),
        writer_half,
        rx,
        config.write_timeout,
    ));

    let hello = envelope(
        &config.client_id,
        BridgeMsg::Hello(HelloPayload {
            client_id: config.client_id.clone(),
            role: BridgeRole::Window,
        }),
    );
    tx.send(hello).await.map_err(|_| BridgeError::Closed)?;

    let mut completions = dispatcher.completions();
    let mut reader = FrameReader::new(reader_half);

    let result = loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break Ok(());
                }
            }
            completed = completions.recv() => {
                match completed {
                    Ok(done) => {
                        let msg = envelope(
                            &config.client_id,
                            BridgeMsg::Refresh(RefreshPayload { reason: Some(done.action.to_string()) }),
                        );
                        let _ = tx.send(msg).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break Ok(()),
                }
            }
            frame = reader.next() => {
                match frame {
                    Ok(Some(frame)) if frame.version > PROTOCOL_VERSION => {
                        debug!(event = "bridge_skip_version", version = frame.version);
                    }
                    Ok(Some(frame)) => handle_tray_message(config, dispatcher, &tx, frame.msg),
                    Ok(None) => break Err(BridgeError::Closed),
                    Err(err) => break Err(BridgeError::Io(err)),
                }
            }
        }
    };

    drop(tx);
    let _ = tokio::time::timeout(config.write_timeout, writer_task).await;
    result
}

#[cfg(unix)]
fn handle_tray_message(
    config: &BridgeConfig,
    dispatcher: &ActionDispatcher,
    tx: &mpsc::Sender<BridgeEnvelope>,
    msg: BridgeMsg,
) {
    match msg {
        BridgeMsg::TrayAction(action) => {
            let dispatcher = dispatcher.clone();
            let tx = tx.clone();
            let sender_id = config.client_id.clone();
            tokio::spawn(async move {
                info!(event = "bridge_action_received", action_id = %action.action_id, kind = %action.kind, target = %action.name);
                let result = dispatcher.run_tray_action(action.kind, &action.name).await;
                let ack = ActionResultPayload {
                    action_id: action.action_id,
                    success: result.is_ok(),
                    error: result.err().map(|err| err.to_string()),
                };
                let _ = tx
                    .send(envelope(&sender_id, BridgeMsg::ActionResult(ack)))
                    .await;
            });
        }
        BridgeMsg::DaemonStatus(status) => {
            dispatcher
                .context()
                .store
                .set_daemon_connected(status.connected);
        }
        BridgeMsg::Refresh(_) => {
            let ctx = dispatcher.context().clone();
            tokio::spawn(async move {
                refresh_lists(&ctx).await;
            });
        }
        other => {
            debug!(event = "bridge_unexpected_message", kind = other.kind());
        }
    }
}
