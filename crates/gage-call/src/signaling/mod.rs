//! Signaling: one persistent WebSocket per (group, user).
//!
//! ```text
//!   ConnectionManager ──open(key)──▶ channel actor ──owns──▶ socket pump
//!          │                              │
//!          └── SignalingHandle ◀──────────┴── broadcast<SignalMessage>, watch<ChannelStatus>
//! ```

pub mod attempt;
pub mod channel;
pub mod manager;
pub mod message;
pub mod socket;

pub use channel::{ChannelStatus, CloseReason, SignalingHandle, spawn_channel};
pub use manager::ConnectionManager;
pub use message::{MessageType, SignalMessage};
pub use socket::{Frame, SocketConnector, SocketPair, TungsteniteConnector};

use serde::Serialize;

/// Registry key: a user's presence in one chat group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionKey {
    pub group_id: String,
    pub user: String,
}

impl ConnectionKey {
    pub fn new(group_id: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            user: user.into(),
        }
    }
}

impl std::fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.group_id, self.user)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
    Timeout,
    /// Reconnect attempts exhausted; only an explicit connect restarts.
    Failed,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error => "error",
            ConnectionStatus::Timeout => "timeout",
            ConnectionStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}
