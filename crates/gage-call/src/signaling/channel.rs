//! The signaling channel actor.
//!
//! One task owns the socket, the heartbeat timer, the reconnect timer and
//! the attempt guard. Everything else talks to it through a
//! [`SignalingHandle`]: commands in over an mpsc queue, messages out over a
//! broadcast, status out over a watch.

use super::attempt::{AttemptDecision, AttemptOrigin, AttemptState};
use super::message::{JoinGroupPayload, MessageType, SignalMessage};
use super::socket::{CLOSE_ABNORMAL, CLOSE_NORMAL, Frame, SocketConnector, SocketPair};
use super::{ConnectionKey, ConnectionStatus};
use crate::backoff::BackoffPolicy;
use crate::health::{HealthMonitor, HealthSnapshot};
use chrono::{DateTime, Utc};
use gage_common::CallResult;
use gage_common::config::{HealthConfig, SignalingConfig};
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, error::Elapsed};
use uuid::Uuid;

/// Why we closed the socket ourselves. The tag travels as the close reason,
/// and a peer closing with one of these tags is treated as intentional too.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Manual,
    Teardown,
    Cleanup,
    Timeout,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::Manual => "manual_disconnect",
            CloseReason::Teardown => "component_teardown",
            CloseReason::Cleanup => "cleanup",
            CloseReason::Timeout => "connection_timeout",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "manual_disconnect" => Some(CloseReason::Manual),
            "component_teardown" => Some(CloseReason::Teardown),
            "cleanup" => Some(CloseReason::Cleanup),
            "connection_timeout" => Some(CloseReason::Timeout),
            _ => None,
        }
    }
}

/// Whether a closure should be left alone rather than reconnected.
pub fn is_clean_close(code: u16, reason: &str) -> bool {
    code == CLOSE_NORMAL || CloseReason::from_tag(reason).is_some()
}

/// What collaborators see of the connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStatus {
    pub status: ConnectionStatus,
    /// Consecutive reconnect attempts since the last successful open.
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub health: HealthSnapshot,
}

enum Command {
    Connect,
    Send {
        message: SignalMessage,
        reply: oneshot::Sender<bool>,
    },
    Teardown {
        reason: CloseReason,
        done: oneshot::Sender<()>,
    },
}

/// Cheap, cloneable handle to a running channel.
#[derive(Clone)]
pub struct SignalingHandle {
    key: ConnectionKey,
    instance_id: Arc<str>,
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<SignalMessage>,
    status: watch::Receiver<ChannelStatus>,
}

impl SignalingHandle {
    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    /// Identifies this channel instance in outgoing envelopes.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Every inbound message of a known type, in arrival order.
    pub fn subscribe(&self) -> broadcast::Receiver<SignalMessage> {
        self.events.subscribe()
    }

    pub fn status(&self) -> ChannelStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ChannelStatus> {
        self.status.clone()
    }

    /// True once the actor has exited.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Ask the channel to connect. No-op when open, connecting, or within
    /// the debounce window of the previous attempt.
    pub async fn connect(&self) {
        let _ = self.commands.send(Command::Connect).await;
    }

    /// Send one message. Returns `false` if the socket is not open.
    pub async fn send(&self, kind: MessageType, payload: Value) -> bool {
        let message = self.envelope(kind, payload);
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Send { message, reply })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Close the socket, cancel every timer and stop the actor. Idempotent.
    pub async fn teardown(&self, reason: CloseReason) {
        let (done, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Teardown { reason, done })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    pub fn envelope(&self, kind: MessageType, payload: Value) -> SignalMessage {
        SignalMessage::new(
            kind,
            &self.key.user,
            &self.key.group_id,
            payload,
            self.instance_id.as_ref(),
        )
    }
}

/// Spawn a channel actor. It stays idle until [`SignalingHandle::connect`].
pub fn spawn_channel(
    key: ConnectionKey,
    config: SignalingConfig,
    health: HealthConfig,
    connector: Arc<dyn SocketConnector>,
) -> (SignalingHandle, JoinHandle<()>) {
    let instance_id: Arc<str> = Uuid::new_v4().to_string().into();
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (events, _) = broadcast::channel(config.event_buffer.max(1));
    let (status_tx, status_rx) = watch::channel(ChannelStatus::default());
    let (outcomes_tx, outcomes_rx) = mpsc::channel(8);

    let actor = ChannelActor {
        key: key.clone(),
        instance_id: Arc::clone(&instance_id),
        policy: BackoffPolicy::from_config(&config),
        attempt: AttemptState::new(config.debounce()),
        health: HealthMonitor::new(health),
        config,
        connector,
        commands: cmd_rx,
        outcomes_tx,
        outcomes_rx,
        attempt_id: 0,
        socket: None,
        heartbeat: None,
        reconnect_at: None,
        attempts: 0,
        last_attempt_at: None,
        status: ConnectionStatus::Disconnected,
        events: events.clone(),
        status_tx,
    };
    let task = tokio::spawn(actor.run());

    let handle = SignalingHandle {
        key,
        instance_id,
        commands: cmd_tx,
        events,
        status: status_rx,
    };
    (handle, task)
}

// ----------------------------------------------------------------------------
// Actor
// ----------------------------------------------------------------------------

struct OpenSocket {
    outbound: mpsc::Sender<Frame>,
    inbound: mpsc::Receiver<Frame>,
    opened_at: Instant,
}

struct ConnectOutcome {
    id: u64,
    result: Result<CallResult<SocketPair>, Elapsed>,
}

struct ChannelActor {
    key: ConnectionKey,
    instance_id: Arc<str>,
    config: SignalingConfig,
    connector: Arc<dyn SocketConnector>,
    policy: BackoffPolicy,
    health: HealthMonitor,
    attempt: AttemptState,
    commands: mpsc::Receiver<Command>,
    outcomes_tx: mpsc::Sender<ConnectOutcome>,
    outcomes_rx: mpsc::Receiver<ConnectOutcome>,
    /// Bumped per physical attempt; outcomes carrying an older id are stale.
    attempt_id: u64,
    socket: Option<OpenSocket>,
    heartbeat: Option<Interval>,
    reconnect_at: Option<Instant>,
    attempts: u32,
    last_attempt_at: Option<DateTime<Utc>>,
    status: ConnectionStatus,
    events: broadcast::Sender<SignalMessage>,
    status_tx: watch::Sender<ChannelStatus>,
}

impl ChannelActor {
    async fn run(mut self) {
        tracing::debug!(key = %self.key, instance = %self.instance_id, "Signaling channel started");

        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Connect) => self.start_attempt(AttemptOrigin::External),
                    Some(Command::Send { message, reply }) => {
                        let sent = self.send(&message).await;
                        let _ = reply.send(sent);
                    }
                    Some(Command::Teardown { reason, done }) => {
                        self.shutdown(reason).await;
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        self.shutdown(CloseReason::Cleanup).await;
                        break;
                    }
                },
                Some(outcome) = self.outcomes_rx.recv() => self.on_outcome(outcome).await,
                frame = next_frame(&mut self.socket) => self.on_frame(frame),
                _ = next_tick(&mut self.heartbeat) => self.on_heartbeat().await,
                _ = sleep_until(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.start_attempt(AttemptOrigin::Reconnect);
                }
            }
        }

        tracing::debug!(key = %self.key, instance = %self.instance_id, "Signaling channel stopped");
    }

    fn start_attempt(&mut self, origin: AttemptOrigin) {
        if self.socket.is_some() {
            tracing::debug!(key = %self.key, "Connect ignored: already open");
            return;
        }
        match self.attempt.request(Instant::now(), origin) {
            AttemptDecision::Start => {}
            AttemptDecision::AlreadyInFlight => {
                tracing::debug!(key = %self.key, "Connect ignored: attempt in flight");
                return;
            }
            AttemptDecision::Debounced => {
                tracing::debug!(key = %self.key, "Connect ignored: debounced");
                return;
            }
        }

        if origin == AttemptOrigin::External {
            self.attempts = 0;
            self.reconnect_at = None;
        }

        self.attempt_id += 1;
        self.last_attempt_at = Some(Utc::now());
        self.set_status(ConnectionStatus::Connecting);
        tracing::info!(key = %self.key, attempt = self.attempts, "Connecting signaling channel");

        let id = self.attempt_id;
        let connector = Arc::clone(&self.connector);
        let url = self.config.url.clone();
        let timeout = self.config.connect_timeout();
        let outcomes = self.outcomes_tx.clone();
        tokio::spawn(async move {
            let result = tokio::time::timeout(timeout, connector.connect(&url)).await;
            let _ = outcomes.send(ConnectOutcome { id, result }).await;
        });
    }

    async fn on_outcome(&mut self, outcome: ConnectOutcome) {
        if outcome.id != self.attempt_id || !self.attempt.in_flight() {
            tracing::debug!(key = %self.key, "Discarding stale connect outcome");
            return;
        }
        self.attempt.finish();

        match outcome.result {
            Ok(Ok(pair)) => self.on_open(pair).await,
            Ok(Err(e)) => {
                tracing::warn!(key = %self.key, "Signaling connect failed: {e}");
                self.health.record_unclean_close();
                self.set_status(ConnectionStatus::Error);
                self.schedule_reconnect();
            }
            Err(_) => {
                tracing::warn!(
                    key = %self.key,
                    timeout_ms = self.config.connect_timeout_ms,
                    "Signaling connect timed out"
                );
                self.health.record_unclean_close();
                self.set_status(ConnectionStatus::Timeout);
                self.schedule_reconnect();
            }
        }
    }

    async fn on_open(&mut self, pair: SocketPair) {
        let now = Instant::now();
        self.health.connection_opened(now);
        self.socket = Some(OpenSocket {
            outbound: pair.outbound,
            inbound: pair.inbound,
            opened_at: now,
        });
        self.attempts = 0;
        self.reconnect_at = None;

        let period = self.config.heartbeat_interval();
        let mut heartbeat = tokio::time::interval_at(now + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.heartbeat = Some(heartbeat);

        self.set_status(ConnectionStatus::Connected);
        tracing::info!(key = %self.key, "Signaling channel connected");

        let join = self.envelope(
            MessageType::JoinCallGroup,
            json!(JoinGroupPayload {
                group_id: self.key.group_id.clone(),
                username: self.key.user.clone(),
            }),
        );
        if !self.send(&join).await {
            tracing::warn!(key = %self.key, "Failed to send JOIN_CALL_GROUP");
        }
    }

    fn on_frame(&mut self, frame: Option<Frame>) {
        match frame {
            Some(Frame::Text(text)) => self.on_text(&text),
            Some(Frame::Close { code, reason }) => self.on_close(code, &reason),
            None => self.on_close(CLOSE_ABNORMAL, ""),
        }
    }

    fn on_text(&mut self, text: &str) {
        let message: SignalMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(key = %self.key, "Dropping malformed signaling frame: {e}");
                return;
            }
        };

        if matches!(message.kind, MessageType::Pong | MessageType::Ping) {
            tracing::trace!(key = %self.key, kind = %message.kind, "Heartbeat frame");
        } else if !message.kind.is_known() {
            tracing::debug!(key = %self.key, kind = %message.kind, "Ignoring unknown message type");
        } else {
            // No subscribers is fine.
            let _ = self.events.send(message);
        }
    }

    fn on_close(&mut self, code: u16, reason: &str) {
        let Some(socket) = self.socket.take() else {
            return;
        };
        self.heartbeat = None;
        self.health.connection_closed(socket.opened_at, Instant::now());

        if is_clean_close(code, reason) {
            tracing::info!(key = %self.key, code, reason, "Signaling channel closed");
            self.set_status(ConnectionStatus::Disconnected);
            return;
        }

        tracing::warn!(key = %self.key, code, reason, "Signaling channel dropped");
        self.health.record_unclean_close();
        self.set_status(ConnectionStatus::Disconnected);
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        if self.policy.exhausted(self.attempts + 1) {
            tracing::error!(
                key = %self.key,
                attempts = self.attempts,
                "Giving up on signaling after max reconnect attempts"
            );
            self.set_status(ConnectionStatus::Failed);
            return;
        }

        self.attempts += 1;
        let delay = self.policy.next_delay(self.attempts, &self.health);
        self.reconnect_at = Some(Instant::now() + delay);
        tracing::info!(
            key = %self.key,
            attempt = self.attempts,
            delay_ms = delay.as_millis() as u64,
            instability = self.health.instability_count(),
            "Signaling reconnect scheduled"
        );
        self.publish_status();
    }

    async fn on_heartbeat(&mut self) {
        self.health.tick(Instant::now());
        let ping = self.envelope(MessageType::Ping, json!({}));
        if !self.send(&ping).await {
            tracing::debug!(key = %self.key, "Heartbeat not sent");
        }
        self.publish_status();
    }

    async fn send(&self, message: &SignalMessage) -> bool {
        let Some(socket) = &self.socket else {
            return false;
        };
        let text = match serde_json::to_string(message) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(key = %self.key, "Failed to encode {}: {e}", message.kind);
                return false;
            }
        };
        socket.outbound.send(Frame::Text(text)).await.is_ok()
    }

    async fn shutdown(&mut self, reason: CloseReason) {
        self.reconnect_at = None;
        self.heartbeat = None;
        self.attempt.cancel();
        self.attempt_id += 1;

        if let Some(socket) = self.socket.take() {
            let _ = socket
                .outbound
                .send(Frame::Close {
                    code: CLOSE_NORMAL,
                    reason: reason.as_str().to_owned(),
                })
                .await;
            self.health.connection_closed(socket.opened_at, Instant::now());
        }

        self.set_status(ConnectionStatus::Disconnected);
        tracing::info!(key = %self.key, reason = reason.as_str(), "Signaling channel torn down");
    }

    fn envelope(&self, kind: MessageType, payload: Value) -> SignalMessage {
        SignalMessage::new(
            kind,
            &self.key.user,
            &self.key.group_id,
            payload,
            self.instance_id.as_ref(),
        )
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        self.status = status;
        self.publish_status();
    }

    fn publish_status(&self) {
        let next = ChannelStatus {
            status: self.status,
            attempts: self.attempts,
            last_attempt_at: self.last_attempt_at,
            health: self.health.snapshot(),
        };
        self.status_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

async fn next_frame(socket: &mut Option<OpenSocket>) -> Option<Frame> {
    match socket {
        Some(socket) => socket.inbound.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_tick(heartbeat: &mut Option<Interval>) -> Instant {
    match heartbeat {
        Some(interval) => interval.tick().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
