//! Signaling envelope and payload types.
//!
//! Every frame on the call socket, in either direction, is one JSON envelope:
//!
//! ```json
//! { "type": "NEW_PRODUCER", "sender": "alice", "groupId": "calibration-lab",
//!   "payload": { "producerId": "p-1", "kind": "video" },
//!   "timestamp": "2026-10-16T09:00:00Z", "instanceId": "6f0c…" }
//! ```

use crate::media::{CallKind, TrackKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message types understood by the call core. Anything else is kept as
/// [`MessageType::Other`] and ignored downstream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    JoinCallGroup,
    Ping,
    Pong,
    CallStarted,
    UserJoinedCall,
    UserLeftCall,
    CallEnded,
    NewProducer,
    IndividualCallStarted,
    IndividualCallAccepted,
    IndividualCallDeclined,
    IndividualCallCanceled,
    Other(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::JoinCallGroup => "JOIN_CALL_GROUP",
            Self::Ping => "PING",
            Self::Pong => "PONG",
            Self::CallStarted => "CALL_STARTED",
            Self::UserJoinedCall => "USER_JOINED_CALL",
            Self::UserLeftCall => "USER_LEFT_CALL",
            Self::CallEnded => "CALL_ENDED",
            Self::NewProducer => "NEW_PRODUCER",
            Self::IndividualCallStarted => "INDIVIDUAL_CALL_STARTED",
            Self::IndividualCallAccepted => "INDIVIDUAL_CALL_ACCEPTED",
            Self::IndividualCallDeclined => "INDIVIDUAL_CALL_DECLINED",
            Self::IndividualCallCanceled => "INDIVIDUAL_CALL_CANCELED",
            Self::Other(raw) => raw,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Other(_))
    }
}

impl From<String> for MessageType {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "JOIN_CALL_GROUP" => Self::JoinCallGroup,
            "PING" => Self::Ping,
            "PONG" => Self::Pong,
            "CALL_STARTED" => Self::CallStarted,
            "USER_JOINED_CALL" => Self::UserJoinedCall,
            "USER_LEFT_CALL" => Self::UserLeftCall,
            "CALL_ENDED" => Self::CallEnded,
            "NEW_PRODUCER" => Self::NewProducer,
            "INDIVIDUAL_CALL_STARTED" => Self::IndividualCallStarted,
            "INDIVIDUAL_CALL_ACCEPTED" => Self::IndividualCallAccepted,
            "INDIVIDUAL_CALL_DECLINED" => Self::IndividualCallDeclined,
            "INDIVIDUAL_CALL_CANCELED" => Self::IndividualCallCanceled,
            _ => Self::Other(raw),
        }
    }
}

impl From<MessageType> for String {
    fn from(kind: MessageType) -> Self {
        kind.as_str().to_owned()
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The wire envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub group_id: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Identifies the channel instance that produced the message, so a client
    /// can recognise its own echoes.
    #[serde(default)]
    pub instance_id: String,
}

impl SignalMessage {
    pub fn new(
        kind: MessageType,
        sender: impl Into<String>,
        group_id: impl Into<String>,
        payload: Value,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            sender: sender.into(),
            group_id: group_id.into(),
            payload,
            timestamp: Utc::now(),
            instance_id: instance_id.into(),
        }
    }

    /// Decode the payload into a typed struct.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

// ----------------------------------------------------------------------------
// Payloads
// ----------------------------------------------------------------------------

/// `JOIN_CALL_GROUP`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinGroupPayload {
    pub group_id: String,
    pub username: String,
}

/// `CALL_STARTED` / `USER_JOINED_CALL`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallPayload {
    #[serde(default)]
    pub call_kind: CallKind,
}

/// `NEW_PRODUCER`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProducerPayload {
    pub producer_id: String,
    pub kind: TrackKind,
}

/// `INDIVIDUAL_CALL_*`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndividualCallPayload {
    /// The user being called (or, for replies, the original caller).
    pub target: String,
    #[serde(default)]
    pub call_kind: CallKind,
}
