//! # gage-call
//!
//! Real-time call orchestration for gage team chat: signaling over a
//! persistent WebSocket, SFU transport negotiation, media publish/subscribe,
//! and the call session state machine that ties them together.
//!
//! ```text
//!   ConnectionManager ─▶ SignalingHandle ─broadcast─▶ CallController
//!                                                        │
//!                          MediaAcquisition ◀────────────┤
//!                          TransportNegotiator ◀─────────┤──▶ SfuControl (HTTP)
//!                          ProducerConsumerRegistry ◀────┘──▶ PeerEngine
//! ```

pub mod backoff;
pub mod controller;
pub mod engine;
pub mod health;
pub mod media;
pub mod negotiator;
pub mod registry;
pub mod session;
pub mod sfu;
pub mod signaling;
pub mod synthetic;

pub use controller::{CallBackends, CallController};
pub use media::{CallKind, TrackKind};
pub use session::{CallSnapshot, CallState};
pub use signaling::{ConnectionKey, ConnectionManager, ConnectionStatus, SignalingHandle};
