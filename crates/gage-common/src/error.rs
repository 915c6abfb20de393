//! Centralized error type for the gage call core.
//!
//! Uses `thiserror` for ergonomic error definitions. The first group of variants
//! is the call failure taxonomy; how far each one propagates is decided by the
//! caller (a media failure aborts a join, a consumer failure only drops a track).

/// Core error type used across all gage call crates.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    // === Media acquisition ===
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    // === Signaling ===
    #[error("Signaling unavailable: {0}")]
    SignalingUnavailable(String),

    // === Transport negotiation ===
    #[error("Transport negotiation failed: {0}")]
    TransportNegotiationFailed(String),

    #[error("Failed to publish {kind} track: {message}")]
    ProducerPublishFailed { kind: String, message: String },

    #[error("Failed to consume producer {producer_id}: {message}")]
    ConsumerSubscribeFailed { producer_id: String, message: String },

    // === Session ===
    #[error("Invalid call state: cannot {action} while {state}")]
    InvalidState { action: &'static str, state: String },

    /// The call this work belonged to has already ended.
    #[error("Call ended before the operation completed")]
    Superseded,

    // === Control plane ===
    #[error("SFU error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    // === Infrastructure ===
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl CallError {
    /// Error code string for programmatic handling by collaborators.
    pub fn error_code(&self) -> &str {
        match self {
            Self::PermissionDenied(_) => "PERMISSION_DENIED",
            Self::DeviceUnavailable(_) => "DEVICE_UNAVAILABLE",
            Self::SignalingUnavailable(_) => "SIGNALING_UNAVAILABLE",
            Self::TransportNegotiationFailed(_) => "TRANSPORT_NEGOTIATION_FAILED",
            Self::ProducerPublishFailed { .. } => "PRODUCER_PUBLISH_FAILED",
            Self::ConsumerSubscribeFailed { .. } => "CONSUMER_SUBSCRIBE_FAILED",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::Superseded => "SUPERSEDED",
            Self::Api { .. } => "SFU_ERROR",
            Self::Http(_) => "HTTP_ERROR",
            Self::InvalidUrl(_) => "INVALID_URL",
            Self::WebSocket(_) => "WEBSOCKET_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
        }
    }

    /// Message suitable for showing to the person placing the call.
    pub fn user_message(&self) -> String {
        match self {
            Self::PermissionDenied(_) => {
                "Camera or microphone access was denied. Allow access and try again.".to_string()
            }
            Self::DeviceUnavailable(_) => {
                "No usable camera or microphone was found.".to_string()
            }
            Self::SignalingUnavailable(_) => "Not connected to the call server.".to_string(),
            Self::TransportNegotiationFailed(_) | Self::Api { .. } | Self::Http(_) => {
                "Could not establish the media connection.".to_string()
            }
            other => other.to_string(),
        }
    }

    /// Whether the failure came from local media capture.
    pub fn is_media_failure(&self) -> bool {
        matches!(self, Self::PermissionDenied(_) | Self::DeviceUnavailable(_))
    }
}

/// Convenience type alias for Results using CallError.
pub type CallResult<T> = Result<T, CallError>;
