//! Local WebRTC engine seam.
//!
//! The engine owns the client half of every transport: ICE/DTLS state, RTP
//! encoding, track plumbing. It never talks to the SFU itself. When a
//! transport needs its DTLS handshake completed it emits a [`ConnectRequest`]
//! on a channel, and the negotiator answers it after round-tripping the
//! control plane.

use crate::media::{MediaTrack, TrackKind};
use crate::sfu::{ConsumerParams, RouterCapabilities, TransportParams};
use async_trait::async_trait;
use gage_common::CallResult;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

impl std::fmt::Display for TransportDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportDirection::Send => write!(f, "send"),
            TransportDirection::Recv => write!(f, "recv"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportConnectionState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

/// A transport asking for its server side to be connected.
#[derive(Debug)]
pub struct ConnectRequest {
    pub transport_id: String,
    pub dtls_parameters: Value,
    reply: oneshot::Sender<Result<(), String>>,
}

impl ConnectRequest {
    pub fn new(
        transport_id: impl Into<String>,
        dtls_parameters: Value,
    ) -> (Self, oneshot::Receiver<Result<(), String>>) {
        let (reply, rx) = oneshot::channel();
        let request = Self {
            transport_id: transport_id.into(),
            dtls_parameters,
            reply,
        };
        (request, rx)
    }

    /// The server accepted the DTLS parameters.
    pub fn resolve(self) {
        let _ = self.reply.send(Ok(()));
    }

    pub fn reject(self, reason: impl Into<String>) {
        let _ = self.reply.send(Err(reason.into()));
    }
}

/// Encoding knobs passed to [`EngineTransport::produce`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProduceOptions {
    /// `None` leaves the encoder unconstrained.
    pub max_bitrate: Option<u32>,
}

impl ProduceOptions {
    pub fn unconstrained() -> Self {
        Self::default()
    }
}

/// One client-side transport.
#[async_trait]
pub trait EngineTransport: Send + Sync {
    /// Server-issued id, mirrored from [`TransportParams::id`].
    fn id(&self) -> &str;

    fn direction(&self) -> TransportDirection;

    fn connection_state(&self) -> TransportConnectionState;

    /// The stream of connect requests. Yields `Some` exactly once.
    fn take_connect_requests(&self) -> Option<mpsc::Receiver<ConnectRequest>>;

    /// Start sending `track`; returns the RTP parameters to hand to the SFU.
    async fn produce(&self, track: &MediaTrack, options: ProduceOptions) -> CallResult<Value>;

    /// Start receiving the producer described by `params`.
    async fn consume(&self, params: &ConsumerParams) -> CallResult<MediaTrack>;

    /// Close the transport and everything flowing over it. Idempotent.
    fn close(&self);
}

/// Factory for transports, loaded once per call attempt.
#[async_trait]
pub trait PeerEngine: Send + Sync {
    /// Load router capabilities; returns the local receive capabilities sent
    /// along with every consume request.
    async fn load(&self, capabilities: &RouterCapabilities) -> CallResult<Value>;

    async fn create_send_transport(
        &self,
        params: TransportParams,
    ) -> CallResult<Arc<dyn EngineTransport>>;

    async fn create_recv_transport(
        &self,
        params: TransportParams,
    ) -> CallResult<Arc<dyn EngineTransport>>;
}

/// Default encoder ceiling for a track kind.
pub fn default_max_bitrate(kind: TrackKind, video: u32, audio: u32) -> u32 {
    match kind {
        TrackKind::Video => video,
        TrackKind::Audio => audio,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_connect_request_reply_reaches_transport() {
        let (request, rx) = ConnectRequest::new("t-1", json!({ "role": "client" }));
        assert_eq!(request.transport_id, "t-1");
        request.reject("dtls mismatch");
        assert_eq!(rx.await.unwrap(), Err("dtls mismatch".to_string()));
    }

    #[test]
    fn test_bitrate_by_kind() {
        assert_eq!(default_max_bitrate(TrackKind::Video, 1_500_000, 64_000), 1_500_000);
        assert_eq!(default_max_bitrate(TrackKind::Audio, 1_500_000, 64_000), 64_000);
    }
}
