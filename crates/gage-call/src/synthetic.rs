//! Headless media devices and engine.
//!
//! No audio or video is produced; tracks are just handles with a live flag.
//! The engine still runs the full connect handshake through
//! [`ConnectRequest`]s, so a call placed with these backends exercises the
//! same control-plane traffic as a real client.

use crate::engine::{
    ConnectRequest, EngineTransport, PeerEngine, ProduceOptions, TransportConnectionState,
    TransportDirection,
};
use crate::media::{MediaBundle, MediaConstraints, MediaDevices, MediaTrack, TrackKind};
use crate::sfu::{ConsumerParams, RouterCapabilities, TransportParams};
use async_trait::async_trait;
use gage_common::{CallError, CallResult};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

// ----------------------------------------------------------------------------
// Devices
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFailure {
    PermissionDenied,
    Unavailable,
}

/// Capture backend that always hands out fresh synthetic tracks.
#[derive(Debug, Default)]
pub struct SyntheticDevices {
    failure: Option<DeviceFailure>,
    captures: AtomicUsize,
}

impl SyntheticDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(failure: DeviceFailure) -> Self {
        Self {
            failure: Some(failure),
            captures: AtomicUsize::new(0),
        }
    }

    /// Number of successful captures so far.
    pub fn capture_count(&self) -> usize {
        self.captures.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn get_user_media(&self, constraints: &MediaConstraints) -> CallResult<MediaBundle> {
        match self.failure {
            Some(DeviceFailure::PermissionDenied) => {
                return Err(CallError::PermissionDenied("NotAllowedError".into()));
            }
            Some(DeviceFailure::Unavailable) => {
                return Err(CallError::DeviceUnavailable("NotFoundError".into()));
            }
            None => {}
        }

        let mut tracks = vec![MediaTrack::new(TrackKind::Audio, "Synthetic microphone")];
        if let Some(video) = &constraints.video {
            tracks.push(MediaTrack::new(
                TrackKind::Video,
                format!("Synthetic camera {}x{}", video.ideal_width, video.ideal_height),
            ));
        }
        self.captures.fetch_add(1, Ordering::Relaxed);
        Ok(MediaBundle::new(tracks))
    }
}

// ----------------------------------------------------------------------------
// Engine
// ----------------------------------------------------------------------------

/// Engine that records every transport it creates.
#[derive(Default)]
pub struct SyntheticEngine {
    transports: Mutex<Vec<Arc<SyntheticTransport>>>,
    loads: AtomicUsize,
}

impl SyntheticEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every transport created so far, in creation order.
    pub fn transports(&self) -> Vec<Arc<SyntheticTransport>> {
        self.transports
            .lock()
            .map(|t| t.clone())
            .unwrap_or_default()
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }

    fn register(&self, transport: SyntheticTransport) -> Arc<SyntheticTransport> {
        let transport = Arc::new(transport);
        if let Ok(mut all) = self.transports.lock() {
            all.push(Arc::clone(&transport));
        }
        transport
    }
}

#[async_trait]
impl PeerEngine for SyntheticEngine {
    async fn load(&self, capabilities: &RouterCapabilities) -> CallResult<Value> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        Ok(capabilities.rtp_capabilities.clone())
    }

    async fn create_send_transport(
        &self,
        params: TransportParams,
    ) -> CallResult<Arc<dyn EngineTransport>> {
        Ok(self.register(SyntheticTransport::new(params, TransportDirection::Send)))
    }

    async fn create_recv_transport(
        &self,
        params: TransportParams,
    ) -> CallResult<Arc<dyn EngineTransport>> {
        Ok(self.register(SyntheticTransport::new(params, TransportDirection::Recv)))
    }
}

pub struct SyntheticTransport {
    id: String,
    direction: TransportDirection,
    state: Mutex<TransportConnectionState>,
    requests_tx: Mutex<Option<mpsc::Sender<ConnectRequest>>>,
    requests_rx: Mutex<Option<mpsc::Receiver<ConnectRequest>>>,
    /// Serializes the one-time connect handshake.
    handshake: tokio::sync::Mutex<bool>,
    tracks: Mutex<Vec<MediaTrack>>,
    closed: AtomicBool,
}

impl SyntheticTransport {
    fn new(params: TransportParams, direction: TransportDirection) -> Self {
        let (tx, rx) = mpsc::channel(4);
        Self {
            id: params.id,
            direction,
            state: Mutex::new(TransportConnectionState::New),
            requests_tx: Mutex::new(Some(tx)),
            requests_rx: Mutex::new(Some(rx)),
            handshake: tokio::sync::Mutex::new(false),
            tracks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Tracks produced or consumed over this transport.
    pub fn tracks(&self) -> Vec<MediaTrack> {
        self.tracks.lock().map(|t| t.clone()).unwrap_or_default()
    }

    fn set_state(&self, state: TransportConnectionState) {
        if let Ok(mut current) = self.state.lock() {
            *current = state;
        }
    }

    fn ensure_open(&self) -> CallResult<()> {
        if self.is_closed() {
            return Err(CallError::TransportNegotiationFailed(format!(
                "transport {} is closed",
                self.id
            )));
        }
        Ok(())
    }

    async fn ensure_connected(&self) -> CallResult<()> {
        let mut connected = self.handshake.lock().await;
        if *connected {
            return Ok(());
        }

        let unbridged = self.requests_rx.lock().map(|rx| rx.is_some()).unwrap_or(true);
        let sender = self.requests_tx.lock().ok().and_then(|tx| tx.clone());
        let Some(sender) = sender.filter(|_| !unbridged) else {
            return Err(CallError::TransportNegotiationFailed(format!(
                "transport {} has no connect handler",
                self.id
            )));
        };

        self.set_state(TransportConnectionState::Connecting);
        let dtls = json!({ "role": "client", "fingerprints": [{ "algorithm": "sha-256", "value": "synthetic" }] });
        let (request, reply) = ConnectRequest::new(self.id.clone(), dtls);
        if sender.send(request).await.is_err() {
            self.set_state(TransportConnectionState::Failed);
            return Err(CallError::TransportNegotiationFailed("connect handler gone".into()));
        }

        match reply.await {
            Ok(Ok(())) => {
                *connected = true;
                self.set_state(TransportConnectionState::Connected);
                Ok(())
            }
            Ok(Err(reason)) => {
                self.set_state(TransportConnectionState::Failed);
                Err(CallError::TransportNegotiationFailed(reason))
            }
            Err(_) => {
                self.set_state(TransportConnectionState::Failed);
                Err(CallError::TransportNegotiationFailed("connect request dropped".into()))
            }
        }
    }

    fn keep(&self, track: &MediaTrack) {
        if let Ok(mut tracks) = self.tracks.lock() {
            tracks.push(track.clone());
        }
    }
}

#[async_trait]
impl EngineTransport for SyntheticTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn direction(&self) -> TransportDirection {
        self.direction
    }

    fn connection_state(&self) -> TransportConnectionState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(TransportConnectionState::Failed)
    }

    fn take_connect_requests(&self) -> Option<mpsc::Receiver<ConnectRequest>> {
        self.requests_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    async fn produce(&self, track: &MediaTrack, options: ProduceOptions) -> CallResult<Value> {
        self.ensure_open()?;
        if self.direction != TransportDirection::Send {
            return Err(CallError::TransportNegotiationFailed(
                "cannot produce on a receive transport".into(),
            ));
        }
        self.ensure_connected().await?;
        self.keep(track);

        let mime = match track.kind() {
            TrackKind::Audio => "audio/opus",
            TrackKind::Video => "video/VP8",
        };
        let mut encoding = json!({ "ssrc": rand_ssrc() });
        if let Some(max) = options.max_bitrate {
            encoding["maxBitrate"] = json!(max);
        }
        Ok(json!({
            "mid": track.id(),
            "codecs": [{ "mimeType": mime }],
            "encodings": [encoding],
        }))
    }

    async fn consume(&self, params: &ConsumerParams) -> CallResult<MediaTrack> {
        self.ensure_open()?;
        if self.direction != TransportDirection::Recv {
            return Err(CallError::TransportNegotiationFailed(
                "cannot consume on a send transport".into(),
            ));
        }
        self.ensure_connected().await?;
        let track = MediaTrack::new(params.kind, format!("remote {}", params.producer_id));
        self.keep(&track);
        Ok(track)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(mut tx) = self.requests_tx.lock() {
            tx.take();
        }
        for track in self.tracks() {
            track.stop();
        }
        self.set_state(TransportConnectionState::Closed);
        tracing::debug!(transport = %self.id, direction = %self.direction, "Transport closed");
    }
}

fn rand_ssrc() -> u32 {
    use rand::Rng;
    rand::rng().random()
}
