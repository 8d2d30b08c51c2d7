//! Process-wide pub/sub connection to the daemon.
//!
//! One actor task owns the websocket; [`ChannelManager`] handles are cheap
//! clones that talk to it over an unbounded command queue. Topics are joined
//! once and shared between consumers, each consumer holding one reference.

use futures_util::{SinkExt, StreamExt};
use lantern_core::phoenix::{
    PhoenixMessage, EVENT_CLOSE, EVENT_ERROR, EVENT_REPLY, PHOENIX_TOPIC,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

/// Delay before reconnect attempt 1, 2, 3 and 4+.
pub const RECONNECT_SCHEDULE_MS: [u64; 4] = [1_000, 2_000, 5_000, 10_000];
const CHANNEL_EVENT_CAPACITY: usize = 256;

pub fn reconnect_after(tries: u32) -> Duration {
    let idx = (tries.max(1) as usize - 1).min(RECONNECT_SCHEDULE_MS.len() - 1);
    Duration::from_millis(RECONNECT_SCHEDULE_MS[idx])
}

#[derive(Debug, Default, Clone)]
pub struct ReconnectSchedule {
    tries: u32,
}

impl ReconnectSchedule {
    pub fn next_delay(&mut self) -> Duration {
        self.tries = self.tries.saturating_add(1);
        reconnect_after(self.tries)
    }

    pub fn reset(&mut self) {
        self.tries = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.tries
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// `rejoin` is set for every successful join after the first one.
    Joined { rejoin: bool },
    JoinFailed { reason: Value },
    Message { event: String, payload: Value },
    /// Transport dropped or the server errored the channel; a rejoin follows
    /// the next successful reconnect.
    Interrupted,
    /// The subscription is gone for good.
    Closed,
}

#[derive(Debug)]
pub struct ChannelSubscription {
    topic: String,
    params: Value,
    joined: AtomicBool,
    events: broadcast::Sender<ChannelEvent>,
}

impl ChannelSubscription {
    fn new(topic: &str, params: Value) -> Self {
        let (events, _) = broadcast::channel(CHANNEL_EVENT_CAPACITY);
        Self {
            topic: topic.to_string(),
            params,
            joined: AtomicBool::new(false),
            events,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_joined(&self) -> bool {
        self.joined.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }
}

#[derive(Clone, Debug)]
pub struct SocketConfig {
    pub url: Url,
    pub heartbeat_interval: Duration,
}

enum SocketCommand {
    Join(Arc<ChannelSubscription>),
    Leave(String),
    Shutdown,
}

struct Registration {
    subscription: Arc<ChannelSubscription>,
    consumers: usize,
}

#[derive(Default)]
struct Registry {
    commands: Option<mpsc::UnboundedSender<SocketCommand>>,
    channels: HashMap<String, Registration>,
}

struct ManagerInner {
    config: SocketConfig,
    registry: Mutex<Registry>,
    state: Arc<watch::Sender<SocketState>>,
}

#[derive(Clone)]
pub struct ChannelManager {
    inner: Arc<ManagerInner>,
}

impl ChannelManager {
    pub fn new(config: SocketConfig) -> Self {
        let (state, _) = watch::channel(SocketState::Idle);
        Self {
            inner: Arc::new(ManagerInner {
                config,
                registry: Mutex::new(Registry::default()),
                state: Arc::new(state),
            }),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> watch::Receiver<SocketState> {
        self.inner.state.subscribe()
    }

    /// Starts the socket actor unless one is already running. Must be called
    /// from within a tokio runtime.
    pub fn connect(&self) {
        let mut registry = self.registry();
        self.ensure_connected(&mut registry);
    }

    fn ensure_connected(&self, registry: &mut Registry) -> mpsc::UnboundedSender<SocketCommand> {
        if let Some(commands) = &registry.commands {
            if !commands.is_closed() {
                return commands.clone();
            }
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = SocketActor {
            config: self.inner.config.clone(),
            commands: rx,
            channels: HashMap::new(),
            next_ref: 0,
            state: self.inner.state.clone(),
        };
        tokio::spawn(actor.run());
        for registration in registry.channels.values() {
            let _ = tx.send(SocketCommand::Join(registration.subscription.clone()));
        }
        registry.commands = Some(tx.clone());
        tx
    }

    /// Returns the live subscription for `topic`, creating and joining it on
    /// first use. Each call adds one consumer reference.
    pub fn join_channel(&self, topic: &str, params: Value) -> Arc<ChannelSubscription> {
        let mut registry = self.registry();
        if let Some(registration) = registry.channels.get_mut(topic) {
            registration.consumers += 1;
            debug!(
                event = "channel_join_shared",
                topic = topic,
                consumers = registration.consumers
            );
            return registration.subscription.clone();
        }

        let commands = self.ensure_connected(&mut registry);
        let subscription = Arc::new(ChannelSubscription::new(topic, params));
        registry.channels.insert(
            topic.to_string(),
            Registration {
                subscription: subscription.clone(),
                consumers: 1,
            },
        );
        let _ = commands.send(SocketCommand::Join(subscription.clone()));
        subscription
    }

    /// Drops one consumer reference; the topic is left once none remain.
    /// Returns whether the subscription was torn down. Unknown topics are a
    /// no-op.
    pub fn leave_channel(&self, topic: &str) -> bool {
        let mut registry = self.registry();
        let Some(registration) = registry.channels.get_mut(topic) else {
            debug!(event = "channel_leave_unknown", topic = topic);
            return false;
        };
        registration.consumers = registration.consumers.saturating_sub(1);
        if registration.consumers > 0 {
            return false;
        }

        if let Some(registration) = registry.channels.remove(topic) {
            registration.subscription.joined.store(false, Ordering::SeqCst);
            registration.subscription.emit(ChannelEvent::Closed);
        }
        if let Some(commands) = &registry.commands {
            let _ = commands.send(SocketCommand::Leave(topic.to_string()));
        }
        true
    }

    pub fn consumers(&self, topic: &str) -> usize {
        self.registry()
            .channels
            .get(topic)
            .map(|registration| registration.consumers)
            .unwrap_or(0)
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<_> = self.registry().channels.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Closes the socket and forgets every channel.
    pub fn disconnect_socket(&self) {
        let mut registry = self.registry();
        if let Some(commands) = registry.commands.take() {
            let _ = commands.send(SocketCommand::Shutdown);
        }
        for (_, registration) in registry.channels.drain() {
            registration.subscription.joined.store(false, Ordering::SeqCst);
            registration.subscription.emit(ChannelEvent::Closed);
        }
        self.inner.state.send_replace(SocketState::Idle);
        info!(event = "socket_disconnect_requested");
    }
}

struct ActiveChannel {
    subscription: Arc<ChannelSubscription>,
    join_ref: Option<String>,
    joins: u32,
}

enum LoopExit {
    Dropped,
    Shutdown,
}

struct SocketActor {
    config: SocketConfig,
    commands: mpsc::UnboundedReceiver<SocketCommand>,
    channels: HashMap<String, ActiveChannel>,
    next_ref: u64,
    state: Arc<watch::Sender<SocketState>>,
}

type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    Message,
>;

impl SocketActor {
    fn make_ref(&mut self) -> String {
        self.next_ref += 1;
        self.next_ref.to_string()
    }

    async fn run(mut self) {
        let mut schedule = ReconnectSchedule::default();
        loop {
            self.state.send_replace(SocketState::Connecting);
            match connect_async(self.config.url.as_str()).await {
                Ok((ws, _)) => {
                    schedule.reset();
                    self.state.send_replace(SocketState::Connected);
                    info!(event = "socket_connected", url = %self.config.url);
                    let exit = self.serve(ws).await;
                    self.mark_interrupted();
                    if matches!(exit, LoopExit::Shutdown) {
                        break;
                    }
                    self.state.send_replace(SocketState::Disconnected);
                }
                Err(err) => {
                    self.state.send_replace(SocketState::Disconnected);
                    warn!(event = "socket_connect_error", url = %self.config.url, error = %err);
                }
            }

            let delay = schedule.next_delay();
            debug!(
                event = "socket_reconnect_scheduled",
                attempt = schedule.attempts(),
                delay_ms = delay.as_millis() as u64
            );
            if !self.wait_backoff(delay).await {
                break;
            }
        }
        self.state.send_replace(SocketState::Idle);
        info!(event = "socket_actor_stopped");
    }

    async fn wait_backoff(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = self.commands.recv() => match command {
                    Some(SocketCommand::Join(subscription)) => {
                        self.channels.insert(subscription.topic.clone(), ActiveChannel {
                            subscription,
                            join_ref: None,
                            joins: 0,
                        });
                    }
                    Some(SocketCommand::Leave(topic)) => {
                        self.channels.remove(&topic);
                    }
                    Some(SocketCommand::Shutdown) | None => return false,
                }
            }
        }
    }

    async fn serve(
        &mut self,
        ws: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) -> LoopExit {
        let (mut sink, mut stream) = ws.split();

        let topics: Vec<String> = self.channels.keys().cloned().collect();
        for topic in topics {
            if self.send_join(&mut sink, &topic).await.is_err() {
                return LoopExit::Dropped;
            }
        }

        let period = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pending_heartbeat: Option<String> = None;

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(SocketCommand::Join(subscription)) => {
                        let topic = subscription.topic.clone();
                        self.channels.insert(topic.clone(), ActiveChannel {
                            subscription,
                            join_ref: None,
                            joins: 0,
                        });
                        if self.send_join(&mut sink, &topic).await.is_err() {
                            return LoopExit::Dropped;
                        }
                    }
                    Some(SocketCommand::Leave(topic)) => {
                        if let Some(channel) = self.channels.remove(&topic) {
                            if let Some(join_ref) = channel.join_ref {
                                let msg_ref = self.make_ref();
                                let leave = PhoenixMessage::leave(&topic, &join_ref, &msg_ref);
                                if send_message(&mut sink, &leave).await.is_err() {
                                    return LoopExit::Dropped;
                                }
                            }
                            info!(event = "channel_left", topic = %topic);
                        }
                    }
                    Some(SocketCommand::Shutdown) | None => {
                        let _ = sink.send(Message::Close(None)).await;
                        return LoopExit::Shutdown;
                    }
                },
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        self.handle_frame(&text, &mut pending_heartbeat);
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        warn!(event = "socket_closed_by_peer");
                        return LoopExit::Dropped;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(event = "socket_read_error", error = %err);
                        return LoopExit::Dropped;
                    }
                },
                _ = heartbeat.tick() => {
                    if let Some(missed) = pending_heartbeat.take() {
                        warn!(event = "socket_heartbeat_timeout", heartbeat_ref = %missed);
                        return LoopExit::Dropped;
                    }
                    let msg_ref = self.make_ref();
                    if send_message(&mut sink, &PhoenixMessage::heartbeat(&msg_ref)).await.is_err() {
                        return LoopExit::Dropped;
                    }
                    pending_heartbeat = Some(msg_ref);
                }
            }
        }
    }

    async fn send_join(&mut self, sink: &mut WsSink, topic: &str) -> Result<(), ()> {
        let join_ref = self.make_ref();
        let Some(channel) = self.channels.get_mut(topic) else {
            return Ok(());
        };
        channel.join_ref = Some(join_ref.clone());
        let join = PhoenixMessage::join(topic, channel.subscription.params.clone(), &join_ref);
        debug!(event = "channel_join_sent", topic = topic, join_ref = %join_ref);
        send_message(sink, &join).await
    }

    fn handle_frame(&mut self, text: &str, pending_heartbeat: &mut Option<String>) {
        let message = match PhoenixMessage::decode(text) {
            Ok(message) => message,
            Err(err) => {
                warn!(event = "socket_frame_decode_error", error = %err);
                return;
            }
        };

        if message.topic == PHOENIX_TOPIC {
            if message.is_reply() && message.msg_ref == *pending_heartbeat {
                *pending_heartbeat = None;
            }
            return;
        }

        let Some(channel) = self.channels.get_mut(&message.topic) else {
            debug!(event = "socket_frame_unrouted", topic = %message.topic, msg_event = %message.event);
            return;
        };
        if message.join_ref.is_some() && message.join_ref != channel.join_ref {
            debug!(event = "socket_frame_stale", topic = %message.topic, msg_event = %message.event);
            return;
        }

        match message.event.as_str() {
            EVENT_REPLY => {
                if message.msg_ref.is_none() || message.msg_ref != channel.join_ref {
                    return;
                }
                let Some(reply) = message.reply() else {
                    return;
                };
                if reply.is_ok() {
                    let rejoin = channel.joins > 0;
                    channel.joins += 1;
                    channel.subscription.joined.store(true, Ordering::SeqCst);
                    info!(event = "channel_joined", topic = %message.topic, rejoin);
                    channel.subscription.emit(ChannelEvent::Joined { rejoin });
                } else {
                    warn!(
                        event = "channel_join_failed",
                        topic = %message.topic,
                        reason = %reply.response
                    );
                    channel.subscription.emit(ChannelEvent::JoinFailed {
                        reason: reply.response,
                    });
                }
            }
            EVENT_ERROR => {
                warn!(event = "channel_errored", topic = %message.topic);
                channel.subscription.joined.store(false, Ordering::SeqCst);
                channel.subscription.emit(ChannelEvent::Interrupted);
            }
            EVENT_CLOSE => {
                info!(event = "channel_closed_by_server", topic = %message.topic);
                channel.subscription.joined.store(false, Ordering::SeqCst);
                channel.join_ref = None;
                channel.subscription.emit(ChannelEvent::Interrupted);
            }
            _ => {
                channel.subscription.emit(ChannelEvent::Message {
                    event: message.event.clone(),
                    payload: message.payload,
                });
            }
        }
    }

    fn mark_interrupted(&mut self) {
        for channel in self.channels.values_mut() {
            channel.join_ref = None;
            if channel.subscription.joined.swap(false, Ordering::SeqCst) {
                channel.subscription.emit(ChannelEvent::Interrupted);
            }
        }
    }
}

async fn send_message(sink: &mut WsSink, message: &PhoenixMessage) -> Result<(), ()> {
    let text = match message.encode() {
        Ok(text) => text,
        Err(err) => {
            warn!(event = "socket_frame_encode_error", error = %err);
            return Ok(());
        }
    };
    sink.send(Message::Text(text)).await.map_err(|err| {
        warn!(event = "socket_write_error", error = %err);
    })
}
