//! SFU control plane — the HTTP endpoints that create and wire up transports.
//!
//! Every call is scoped to one group and one username. Paths:
//!
//! ```text
//! GET  /sfu/{group}/router-capabilities?username=U
//! POST /sfu/{group}/transports/send
//! POST /sfu/{group}/transports/recv
//! POST /sfu/{group}/transports/{id}/connect
//! POST /sfu/{group}/transports/{id}/produce
//! POST /sfu/{group}/transports/{id}/consume
//! ```

use crate::media::TrackKind;
use async_trait::async_trait;
use gage_common::config::SfuConfig;
use gage_common::{CallError, CallResult};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;
use url::Url;

/// What the router can send and receive, handed to the local engine once per
/// call attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterCapabilities {
    pub rtp_capabilities: Value,
}

/// Server half of a freshly created transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    pub id: String,
    #[serde(default)]
    pub ice_parameters: Value,
    #[serde(default)]
    pub ice_candidates: Value,
    #[serde(default)]
    pub dtls_parameters: Value,
}

/// Server answer to a consume request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerParams {
    pub id: String,
    pub producer_id: String,
    pub kind: TrackKind,
    #[serde(default)]
    pub rtp_parameters: Value,
}

#[derive(Deserialize)]
struct ProduceResponse {
    id: String,
}

/// The SFU operations the negotiator relies on.
#[async_trait]
pub trait SfuControl: Send + Sync {
    async fn router_capabilities(&self) -> CallResult<RouterCapabilities>;

    async fn create_send_transport(&self) -> CallResult<TransportParams>;

    /// `peer_id` is the remote participant whose media this transport carries.
    async fn create_recv_transport(&self, peer_id: &str) -> CallResult<TransportParams>;

    async fn connect_transport(&self, transport_id: &str, dtls_parameters: &Value) -> CallResult<()>;

    /// Returns the server-issued producer id.
    async fn produce(
        &self,
        transport_id: &str,
        kind: TrackKind,
        rtp_parameters: &Value,
    ) -> CallResult<String>;

    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: &Value,
    ) -> CallResult<ConsumerParams>;
}

/// reqwest-backed [`SfuControl`].
#[derive(Clone)]
pub struct HttpSfuControl {
    client: Client,
    base_url: Url,
    group_id: String,
    username: String,
}

impl HttpSfuControl {
    pub fn new(
        config: &SfuConfig,
        group_id: impl Into<String>,
        username: impl Into<String>,
    ) -> CallResult<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| CallError::InvalidUrl(format!("{}: {e}", config.base_url)))?;
        if base_url.cannot_be_a_base() {
            return Err(CallError::InvalidUrl(config.base_url.clone()));
        }

        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(CallError::Http)?;

        Ok(Self {
            client,
            base_url,
            group_id: group_id.into(),
            username: username.into(),
        })
    }

    // ── Internal ──────────────────────────────────────────────────────────────

    fn endpoint(&self, segments: &[&str]) -> CallResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| CallError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .push("sfu")
            .push(&self.group_id)
            .extend(segments);
        Ok(url)
    }

    /// Send a request and map non-2xx responses to [`CallError::Api`].
    async fn execute(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
    ) -> CallResult<reqwest::Response> {
        tracing::debug!(%method, %url, "SFU request");
        let mut req = self.client.request(method, url);
        if let Some(b) = body {
            req = req.json(b);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let message = resp
                .json::<Value>()
                .await
                .ok()
                .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_owned))
                .unwrap_or_else(|| status.to_string());
            return Err(CallError::Api { status: status.as_u16(), message });
        }
        Ok(resp)
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
    ) -> CallResult<T> {
        let resp = self.execute(method, url, body).await?;
        Ok(resp.json::<T>().await?)
    }

    async fn post<T: DeserializeOwned>(&self, segments: &[&str], body: Value) -> CallResult<T> {
        let url = self.endpoint(segments)?;
        self.request(Method::POST, url, Some(&body)).await
    }
}

#[async_trait]
impl SfuControl for HttpSfuControl {
    async fn router_capabilities(&self) -> CallResult<RouterCapabilities> {
        let mut url = self.endpoint(&["router-capabilities"])?;
        url.query_pairs_mut().append_pair("username", &self.username);
        self.request(Method::GET, url, None).await
    }

    async fn create_send_transport(&self) -> CallResult<TransportParams> {
        self.post(&["transports", "send"], json!({ "username": self.username }))
            .await
    }

    async fn create_recv_transport(&self, peer_id: &str) -> CallResult<TransportParams> {
        self.post(
            &["transports", "recv"],
            json!({ "username": self.username, "peerId": peer_id }),
        )
        .await
    }

    async fn connect_transport(&self, transport_id: &str, dtls_parameters: &Value) -> CallResult<()> {
        // Only the status matters; the body may be empty.
        let url = self.endpoint(&["transports", transport_id, "connect"])?;
        let body = json!({ "username": self.username, "dtlsParameters": dtls_parameters });
        self.execute(Method::POST, url, Some(&body)).await?;
        Ok(())
    }

    async fn produce(
        &self,
        transport_id: &str,
        kind: TrackKind,
        rtp_parameters: &Value,
    ) -> CallResult<String> {
        let resp: ProduceResponse = self
            .post(
                &["transports", transport_id, "produce"],
                json!({
                    "username": self.username,
                    "kind": kind,
                    "rtpParameters": rtp_parameters,
                }),
            )
            .await?;
        Ok(resp.id)
    }

    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: &Value,
    ) -> CallResult<ConsumerParams> {
        self.post(
            &["transports", transport_id, "consume"],
            json!({
                "username": self.username,
                "producerId": producer_id,
                "rtpCapabilities": rtp_capabilities,
            }),
        )
        .await
    }
}
