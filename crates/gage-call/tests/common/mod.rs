//! Shared fakes for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use gage_call::controller::{CallBackends, CallController};
use gage_call::media::TrackKind;
use gage_call::session::CallSnapshot;
use gage_call::sfu::{ConsumerParams, RouterCapabilities, SfuControl, TransportParams};
use gage_call::signaling::message::{MessageType, SignalMessage};
use gage_call::signaling::{ConnectionKey, Frame, SignalingHandle, SocketConnector, SocketPair, spawn_channel};
use gage_call::synthetic::{SyntheticDevices, SyntheticEngine};
use gage_common::config::{CallConfig, HealthConfig, SignalingConfig};
use gage_common::{CallError, CallResult};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

pub const GROUP: &str = "calibration-lab";
pub const REMOTE_INSTANCE: &str = "remote-instance";

/// Route `tracing` output through the test harness. `RUST_LOG` applies.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gage_call=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

// ----------------------------------------------------------------------------
// In-memory socket
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectBehavior {
    Accept,
    Refuse,
    /// Never completes; the channel's connect timeout has to fire.
    Hang,
}

/// The server's end of an accepted in-memory socket.
pub struct ServerSide {
    pub to_client: mpsc::Sender<Frame>,
    pub from_client: mpsc::Receiver<Frame>,
}

impl ServerSide {
    pub async fn inject(&self, message: &SignalMessage) {
        let text = serde_json::to_string(message).unwrap();
        self.to_client.send(Frame::Text(text)).await.unwrap();
    }

    pub async fn inject_raw(&self, text: &str) {
        self.to_client.send(Frame::Text(text.to_owned())).await.unwrap();
    }

    pub async fn close(&self, code: u16, reason: &str) {
        let _ = self
            .to_client
            .send(Frame::Close {
                code,
                reason: reason.to_owned(),
            })
            .await;
    }

    /// Next non-heartbeat message the client sent.
    pub async fn next_message(&mut self) -> SignalMessage {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(120), self.from_client.recv())
                .await
                .expect("timed out waiting for a client frame")
                .expect("client closed the socket");
            match frame {
                Frame::Text(text) => {
                    let message: SignalMessage = serde_json::from_str(&text).unwrap();
                    if message.kind != MessageType::Ping {
                        return message;
                    }
                }
                Frame::Close { code, reason } => panic!("unexpected close {code} {reason}"),
            }
        }
    }

    /// Skip messages until one of `kind` arrives.
    pub async fn expect(&mut self, kind: MessageType) -> SignalMessage {
        loop {
            let message = self.next_message().await;
            if message.kind == kind {
                return message;
            }
        }
    }

    pub async fn next_frame(&mut self) -> Frame {
        tokio::time::timeout(Duration::from_secs(120), self.from_client.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("client closed the socket")
    }
}

pub struct MemoryConnector {
    script: Mutex<VecDeque<ConnectBehavior>>,
    fallback: ConnectBehavior,
    attempts: AtomicUsize,
    accepted: mpsc::UnboundedSender<ServerSide>,
}

impl MemoryConnector {
    pub fn new(fallback: ConnectBehavior) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerSide>) {
        let (accepted, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            attempts: AtomicUsize::new(0),
            accepted,
        });
        (connector, rx)
    }

    /// Behaviors for the next attempts, before falling back.
    pub fn script(&self, behaviors: &[ConnectBehavior]) {
        self.script.lock().unwrap().extend(behaviors.iter().copied());
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SocketConnector for MemoryConnector {
    async fn connect(&self, _url: &str) -> CallResult<SocketPair> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let behavior = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback);

        match behavior {
            ConnectBehavior::Accept => {
                let (to_client, inbound) = mpsc::channel(64);
                let (outbound, from_client) = mpsc::channel(64);
                let _ = self.accepted.send(ServerSide {
                    to_client,
                    from_client,
                });
                Ok(SocketPair { outbound, inbound })
            }
            ConnectBehavior::Refuse => {
                Err(CallError::SignalingUnavailable("connection refused".into()))
            }
            ConnectBehavior::Hang => std::future::pending().await,
        }
    }
}

// ----------------------------------------------------------------------------
// Fake SFU
// ----------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeSfu {
    next_id: AtomicUsize,
    pub consume_calls: Mutex<Vec<String>>,
    pub produce_calls: Mutex<Vec<TrackKind>>,
    pub connect_calls: AtomicUsize,
    /// peer id → receive transport ids created for it.
    recv_transports: Mutex<HashMap<String, Vec<String>>>,
    send_transports: Mutex<Vec<String>>,
    producer_kinds: Mutex<HashMap<String, TrackKind>>,
    fail_consume_once: Mutex<HashSet<String>>,
    fail_produce: AtomicUsize,
    fail_send_transport: AtomicBool,
    send_transport_delay: Mutex<Option<Duration>>,
}

impl FakeSfu {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_producer_kind(&self, producer_id: &str, kind: TrackKind) {
        self.producer_kinds
            .lock()
            .unwrap()
            .insert(producer_id.to_owned(), kind);
    }

    pub fn fail_consume_once(&self, producer_id: &str) {
        self.fail_consume_once
            .lock()
            .unwrap()
            .insert(producer_id.to_owned());
    }

    /// The next `n` produce calls fail.
    pub fn fail_produce(&self, n: usize) {
        self.fail_produce.store(n, Ordering::SeqCst);
    }

    pub fn fail_send_transport(&self) {
        self.fail_send_transport.store(true, Ordering::SeqCst);
    }

    /// Hold every send transport request for `delay`.
    pub fn delay_send_transport(&self, delay: Duration) {
        *self.send_transport_delay.lock().unwrap() = Some(delay);
    }

    pub fn consume_count(&self, producer_id: &str) -> usize {
        self.consume_calls
            .lock()
            .unwrap()
            .iter()
            .filter(|p| *p == producer_id)
            .count()
    }

    pub fn recv_transports_for(&self, peer: &str) -> Vec<String> {
        self.recv_transports
            .lock()
            .unwrap()
            .get(peer)
            .cloned()
            .unwrap_or_default()
    }

    pub fn send_transports(&self) -> Vec<String> {
        self.send_transports.lock().unwrap().clone()
    }

    fn id(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn transport(&self, id: String) -> TransportParams {
        TransportParams {
            id,
            ice_parameters: json!({ "usernameFragment": "frag", "password": "pw" }),
            ice_candidates: json!([]),
            dtls_parameters: json!({ "role": "auto" }),
        }
    }
}

#[async_trait]
impl SfuControl for FakeSfu {
    async fn router_capabilities(&self) -> CallResult<RouterCapabilities> {
        Ok(RouterCapabilities {
            rtp_capabilities: json!({ "codecs": [{ "mimeType": "audio/opus" }, { "mimeType": "video/VP8" }] }),
        })
    }

    async fn create_send_transport(&self) -> CallResult<TransportParams> {
        let delay = *self.send_transport_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_send_transport.load(Ordering::SeqCst) {
            return Err(CallError::Api {
                status: 500,
                message: "router unavailable".into(),
            });
        }
        let id = self.id("send");
        self.send_transports.lock().unwrap().push(id.clone());
        Ok(self.transport(id))
    }

    async fn create_recv_transport(&self, peer_id: &str) -> CallResult<TransportParams> {
        let id = self.id(&format!("recv-{peer_id}"));
        self.recv_transports
            .lock()
            .unwrap()
            .entry(peer_id.to_owned())
            .or_default()
            .push(id.clone());
        Ok(self.transport(id))
    }

    async fn connect_transport(&self, _transport_id: &str, _dtls: &Value) -> CallResult<()> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn produce(&self, _transport_id: &str, kind: TrackKind, _rtp: &Value) -> CallResult<String> {
        self.produce_calls.lock().unwrap().push(kind);
        let remaining = self.fail_produce.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_produce.store(remaining - 1, Ordering::SeqCst);
            return Err(CallError::Api {
                status: 400,
                message: "unsupported encoding".into(),
            });
        }
        Ok(self.id(&format!("producer-{kind}")))
    }

    async fn consume(
        &self,
        _transport_id: &str,
        producer_id: &str,
        _rtp_capabilities: &Value,
    ) -> CallResult<ConsumerParams> {
        self.consume_calls.lock().unwrap().push(producer_id.to_owned());
        if self.fail_consume_once.lock().unwrap().remove(producer_id) {
            return Err(CallError::Api {
                status: 404,
                message: "producer not found".into(),
            });
        }
        let kind = self
            .producer_kinds
            .lock()
            .unwrap()
            .get(producer_id)
            .copied()
            .unwrap_or(TrackKind::Audio);
        Ok(ConsumerParams {
            id: self.id("consumer"),
            producer_id: producer_id.to_owned(),
            kind,
            rtp_parameters: json!({}),
        })
    }
}

// ----------------------------------------------------------------------------
// Controller harness
// ----------------------------------------------------------------------------

pub struct Harness {
    pub controller: CallController,
    pub server: ServerSide,
    pub signaling: SignalingHandle,
    pub sfu: Arc<FakeSfu>,
    pub engine: Arc<SyntheticEngine>,
    pub devices: Arc<SyntheticDevices>,
    pub connector: Arc<MemoryConnector>,
}

pub async fn harness(user: &str) -> Harness {
    harness_with_devices(user, SyntheticDevices::new()).await
}

/// A connected controller for `user` in [`GROUP`], with the server side of
/// its socket past the JOIN_CALL_GROUP handshake.
pub async fn harness_with_devices(user: &str, devices: SyntheticDevices) -> Harness {
    init_tracing();
    let (connector, mut accepted) = MemoryConnector::new(ConnectBehavior::Accept);
    let (signaling, _task) = spawn_channel(
        ConnectionKey::new(GROUP, user),
        SignalingConfig::default(),
        HealthConfig::default(),
        connector.clone(),
    );

    let sfu = FakeSfu::new();
    let engine = Arc::new(SyntheticEngine::new());
    let devices = Arc::new(devices);
    let controller = CallController::new(
        signaling.clone(),
        CallBackends {
            devices: devices.clone(),
            sfu: sfu.clone(),
            engine: engine.clone(),
        },
        CallConfig::default(),
    );

    signaling.connect().await;
    let mut server = accepted.recv().await.expect("socket accepted");
    let join = server.expect(MessageType::JoinCallGroup).await;
    assert_eq!(join.sender, user);

    Harness {
        controller,
        server,
        signaling,
        sfu,
        engine,
        devices,
        connector,
    }
}

/// An envelope as another group member's client would send it.
pub fn remote(kind: MessageType, sender: &str, payload: Value) -> SignalMessage {
    SignalMessage::new(kind, sender, GROUP, payload, REMOTE_INSTANCE)
}

pub fn new_producer(sender: &str, producer_id: &str, kind: TrackKind) -> SignalMessage {
    remote(
        MessageType::NewProducer,
        sender,
        json!({ "producerId": producer_id, "kind": kind }),
    )
}

/// Wait until a snapshot satisfies `predicate`.
pub async fn wait_for<F>(rx: &mut watch::Receiver<CallSnapshot>, predicate: F) -> CallSnapshot
where
    F: FnMut(&CallSnapshot) -> bool,
{
    tokio::time::timeout(Duration::from_secs(120), rx.wait_for(predicate))
        .await
        .expect("timed out waiting for call state")
        .expect("controller dropped")
        .clone()
}
