//! Transport negotiation: control-plane round trips glued to the local engine.
//!
//! A negotiator lives for exactly one call attempt. Router capabilities are
//! fetched and loaded into the engine the first time anything needs them and
//! reused for every transport and consume of that attempt.

use crate::engine::{EngineTransport, PeerEngine, ProduceOptions, default_max_bitrate};
use crate::media::MediaTrack;
use crate::sfu::{ConsumerParams, SfuControl};
use gage_common::config::CallConfig;
use gage_common::{CallError, CallResult};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::OnceCell;

pub struct TransportNegotiator {
    sfu: Arc<dyn SfuControl>,
    engine: Arc<dyn PeerEngine>,
    config: CallConfig,
    /// Local receive capabilities, after the engine loaded the router's.
    capabilities: OnceCell<Value>,
}

impl TransportNegotiator {
    pub fn new(sfu: Arc<dyn SfuControl>, engine: Arc<dyn PeerEngine>, config: CallConfig) -> Self {
        Self {
            sfu,
            engine,
            config,
            capabilities: OnceCell::new(),
        }
    }

    /// Fetch router capabilities and load them into the engine, once.
    pub async fn load(&self) -> CallResult<&Value> {
        self.capabilities
            .get_or_try_init(|| async {
                let router = self.sfu.router_capabilities().await?;
                let local = self.engine.load(&router).await?;
                tracing::debug!("Router capabilities loaded");
                Ok::<_, CallError>(local)
            })
            .await
            .map_err(negotiation_failed)
    }

    pub async fn create_send_transport(&self) -> CallResult<Arc<dyn EngineTransport>> {
        self.load().await?;
        let params = self
            .sfu
            .create_send_transport()
            .await
            .map_err(negotiation_failed)?;
        let transport = self
            .engine
            .create_send_transport(params)
            .await
            .map_err(negotiation_failed)?;
        self.bridge_connect_requests(&transport);
        tracing::info!(transport = %transport.id(), "Send transport created");
        Ok(transport)
    }

    /// Create the receive transport carrying `peer_id`'s media.
    pub async fn create_recv_transport(&self, peer_id: &str) -> CallResult<Arc<dyn EngineTransport>> {
        self.load().await?;
        let params = self
            .sfu
            .create_recv_transport(peer_id)
            .await
            .map_err(negotiation_failed)?;
        let transport = self
            .engine
            .create_recv_transport(params)
            .await
            .map_err(negotiation_failed)?;
        self.bridge_connect_requests(&transport);
        tracing::info!(transport = %transport.id(), peer = %peer_id, "Receive transport created");
        Ok(transport)
    }

    /// Publish `track` over `transport`. Returns the server-issued producer id.
    ///
    /// The first attempt uses the configured bitrate ceiling; if that fails
    /// the track is retried once unconstrained.
    pub async fn publish(
        &self,
        transport: &Arc<dyn EngineTransport>,
        track: &MediaTrack,
    ) -> CallResult<String> {
        let kind = track.kind();
        let constrained = ProduceOptions {
            max_bitrate: Some(default_max_bitrate(
                kind,
                self.config.video_max_bitrate,
                self.config.audio_max_bitrate,
            )),
        };

        match self.produce_once(transport, track, constrained).await {
            Ok(id) => Ok(id),
            Err(first) => {
                tracing::warn!(kind = %kind, "Produce failed ({first}), retrying without bitrate limit");
                self.produce_once(transport, track, ProduceOptions::unconstrained())
                    .await
                    .map_err(|e| CallError::ProducerPublishFailed {
                        kind: kind.to_string(),
                        message: e.to_string(),
                    })
            }
        }
    }

    /// Consume `producer_id` over `transport`.
    pub async fn subscribe(
        &self,
        transport: &Arc<dyn EngineTransport>,
        producer_id: &str,
    ) -> CallResult<(ConsumerParams, MediaTrack)> {
        let failed = |e: CallError| CallError::ConsumerSubscribeFailed {
            producer_id: producer_id.to_string(),
            message: e.to_string(),
        };

        let capabilities = self.load().await.map_err(failed)?;
        let params = self
            .sfu
            .consume(transport.id(), producer_id, capabilities)
            .await
            .map_err(failed)?;
        let track = transport.consume(&params).await.map_err(failed)?;
        tracing::info!(
            producer = %producer_id,
            consumer = %params.id,
            kind = %params.kind,
            "Consumer created"
        );
        Ok((params, track))
    }

    // ── Internal ──────────────────────────────────────────────────────────────

    async fn produce_once(
        &self,
        transport: &Arc<dyn EngineTransport>,
        track: &MediaTrack,
        options: ProduceOptions,
    ) -> CallResult<String> {
        let rtp_parameters = transport.produce(track, options).await?;
        let id = self
            .sfu
            .produce(transport.id(), track.kind(), &rtp_parameters)
            .await?;
        tracing::info!(producer = %id, kind = %track.kind(), "Producer created");
        Ok(id)
    }

    /// Answer the transport's connect requests from the control plane. The
    /// task ends when the transport drops its request sender.
    fn bridge_connect_requests(&self, transport: &Arc<dyn EngineTransport>) {
        let Some(mut requests) = transport.take_connect_requests() else {
            return;
        };
        let sfu = Arc::clone(&self.sfu);
        tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                let transport_id = request.transport_id.clone();
                match sfu
                    .connect_transport(&transport_id, &request.dtls_parameters)
                    .await
                {
                    Ok(()) => {
                        tracing::debug!(transport = %transport_id, "Transport connected");
                        request.resolve();
                    }
                    Err(e) => {
                        tracing::warn!(transport = %transport_id, "Transport connect failed: {e}");
                        request.reject(e.to_string());
                    }
                }
            }
        });
    }
}

fn negotiation_failed(e: CallError) -> CallError {
    match e {
        CallError::TransportNegotiationFailed(_) => e,
        other => CallError::TransportNegotiationFailed(other.to_string()),
    }
}
