//! Call session state and the snapshot exposed to UI collaborators.

use crate::health::HealthSnapshot;
use crate::media::{CallKind, MediaBundle, TrackKind};
use crate::negotiator::TransportNegotiator;
use crate::registry::{ProducerConsumerRegistry, TeardownReport};
use crate::signaling::ConnectionStatus;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    #[default]
    Idle,
    /// We started the call and are waiting for someone to join.
    Calling,
    /// Someone else started a call; we have not answered.
    Ringing,
    /// Answered or joining; media setup in progress.
    Connecting,
    Connected,
}

impl CallState {
    /// States in which this client has (or is acquiring) call resources.
    pub fn in_call(self) -> bool {
        matches!(self, CallState::Calling | CallState::Connecting | CallState::Connected)
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CallState::Idle => "idle",
            CallState::Calling => "calling",
            CallState::Ringing => "ringing",
            CallState::Connecting => "connecting",
            CallState::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// Summary of one media bundle for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleView {
    pub bundle_id: String,
    pub tracks: Vec<TrackView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackView {
    pub id: String,
    pub kind: TrackKind,
    pub label: String,
    pub live: bool,
}

impl From<&MediaBundle> for BundleView {
    fn from(bundle: &MediaBundle) -> Self {
        Self {
            bundle_id: bundle.id().to_owned(),
            tracks: bundle
                .tracks()
                .iter()
                .map(|t| TrackView {
                    id: t.id().to_owned(),
                    kind: t.kind(),
                    label: t.label().to_owned(),
                    live: t.is_live(),
                })
                .collect(),
        }
    }
}

/// Everything a UI needs to render the call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSnapshot {
    pub state: CallState,
    pub call_kind: CallKind,
    pub in_call: bool,
    pub is_initiator: bool,
    /// Who started the call we are ringing for or joined.
    pub caller: Option<String>,
    /// Set for 1:1 calls: the other party.
    pub peer: Option<String>,
    /// In join order.
    pub participants: Vec<String>,
    pub local_media: Option<BundleView>,
    pub remote_media: BTreeMap<String, BundleView>,
    pub signaling: ConnectionStatus,
    pub health: HealthSnapshot,
    pub last_error: Option<String>,
}

/// One active or attempted call. All fields are owned by the controller and
/// only mutated under its lock.
#[derive(Default)]
pub struct CallSession {
    pub state: CallState,
    pub call_kind: CallKind,
    pub is_initiator: bool,
    pub caller: Option<String>,
    pub peer: Option<String>,
    pub participants: Vec<String>,
    pub local_media: Option<MediaBundle>,
    pub remote_media: BTreeMap<String, MediaBundle>,
    pub registry: ProducerConsumerRegistry,
    pub negotiator: Option<Arc<TransportNegotiator>>,
    /// Our presence was broadcast, so leaving must be announced too.
    pub announced: bool,
    pub last_error: Option<String>,
    /// Bumped on every new attempt and every teardown. Async work captures
    /// it and must see it unchanged before committing.
    pub epoch: u64,
}

impl CallSession {
    /// Start a new attempt; returns its epoch.
    pub fn begin_attempt(&mut self, negotiator: TransportNegotiator) -> u64 {
        self.epoch += 1;
        self.negotiator = Some(Arc::new(negotiator));
        self.announced = false;
        self.last_error = None;
        self.epoch
    }

    pub fn is_current(&self, epoch: u64) -> bool {
        self.epoch == epoch && self.state != CallState::Idle
    }

    /// Returns `true` if the participant was new. The first participant moves
    /// an outbound call from `calling` to `connected`.
    pub fn add_participant(&mut self, participant_id: &str) -> bool {
        if self.has_participant(participant_id) {
            return false;
        }
        self.participants.push(participant_id.to_owned());
        if self.state == CallState::Calling {
            self.state = CallState::Connected;
        }
        true
    }

    pub fn has_participant(&self, participant_id: &str) -> bool {
        self.participants.iter().any(|p| p == participant_id)
    }

    /// Drop a participant and everything received from them.
    pub fn remove_participant(&mut self, participant_id: &str) -> bool {
        let before = self.participants.len();
        self.participants.retain(|p| p != participant_id);
        let removed = self.participants.len() != before;

        let resources = self.registry.remove_participant(participant_id);
        for consumer in &resources.consumers {
            consumer.track.stop();
        }
        if let Some(transport) = resources.transport {
            transport.close();
        }
        if let Some(bundle) = self.remote_media.remove(participant_id) {
            bundle.stop();
        }
        removed
    }

    /// Release every resource and return to idle. The last error survives so
    /// the UI can show why the call ended.
    pub fn teardown(&mut self) -> TeardownReport {
        self.epoch += 1;

        // Producers share tracks with the local bundle; count before closing.
        let local_live = self
            .local_media
            .as_ref()
            .map_or(0, |local| local.live_tracks().count());

        let mut report = self.registry.drain().close();
        for bundle in self.remote_media.values() {
            bundle.stop();
        }
        if let Some(local) = self.local_media.take() {
            local.stop();
        }
        report.local_tracks_stopped = local_live;

        let epoch = self.epoch;
        let last_error = self.last_error.take();
        *self = CallSession {
            epoch,
            last_error,
            ..CallSession::default()
        };
        report
    }

    pub fn snapshot(&self, signaling: ConnectionStatus, health: HealthSnapshot) -> CallSnapshot {
        CallSnapshot {
            state: self.state,
            call_kind: self.call_kind,
            in_call: self.state.in_call(),
            is_initiator: self.is_initiator,
            caller: self.caller.clone(),
            peer: self.peer.clone(),
            participants: self.participants.clone(),
            local_media: self.local_media.as_ref().map(BundleView::from),
            remote_media: self
                .remote_media
                .iter()
                .map(|(id, bundle)| (id.clone(), BundleView::from(bundle)))
                .collect(),
            signaling,
            health,
            last_error: self.last_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaTrack;

    #[test]
    fn test_participants_keep_join_order() {
        let mut session = CallSession::default();
        assert!(session.add_participant("bob"));
        assert!(session.add_participant("alice"));
        assert!(!session.add_participant("bob"));
        assert_eq!(session.participants, vec!["bob", "alice"]);
    }

    #[test]
    fn test_first_participant_connects_outbound_call() {
        let mut session = CallSession {
            state: CallState::Calling,
            is_initiator: true,
            ..CallSession::default()
        };
        session.add_participant("bob");
        assert_eq!(session.state, CallState::Connected);

        let mut answering = CallSession {
            state: CallState::Connecting,
            ..CallSession::default()
        };
        answering.add_participant("bob");
        assert_eq!(answering.state, CallState::Connecting);
    }

    #[test]
    fn test_teardown_stops_media_and_bumps_epoch() {
        let mut session = CallSession {
            state: CallState::Connected,
            epoch: 4,
            ..CallSession::default()
        };
        let mic = MediaTrack::new(TrackKind::Audio, "mic");
        session.local_media = Some(MediaBundle::new(vec![mic.clone()]));
        let remote = MediaTrack::new(TrackKind::Video, "bob cam");
        session
            .remote_media
            .insert("bob".into(), MediaBundle::new(vec![remote.clone()]));
        session.add_participant("bob");
        session.last_error = Some("declined".into());

        let report = session.teardown();
        assert_eq!(report.local_tracks_stopped, 1);
        assert!(!mic.is_live());
        assert!(!remote.is_live());
        assert_eq!(session.state, CallState::Idle);
        assert!(session.participants.is_empty());
        assert!(!session.is_current(4));
        assert_eq!(session.epoch, 5);
        assert_eq!(session.last_error.as_deref(), Some("declined"));
    }

    #[test]
    fn test_snapshot_reports_in_call() {
        let session = CallSession {
            state: CallState::Calling,
            call_kind: CallKind::Video,
            is_initiator: true,
            ..CallSession::default()
        };
        let snapshot = session.snapshot(ConnectionStatus::Connected, HealthSnapshot::default());
        assert!(snapshot.in_call);
        assert!(snapshot.is_initiator);
        assert_eq!(snapshot.call_kind, CallKind::Video);
    }
}
