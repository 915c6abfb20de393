//! Call session state machine.
//!
//! ```text
//!   outbound:  idle ──start──▶ calling ──someone joins──▶ connected
//!   inbound:   idle ──CALL_STARTED──▶ ringing ──accept──▶ connecting ──setup ok──▶ connected
//!   any state ──hang up / decline / cancel / CALL_ENDED──▶ idle
//! ```
//!
//! The controller owns one [`CallSession`] behind a mutex that is never held
//! across network I/O. Setup and consume work capture the session epoch and
//! re-check it after every suspension point, so a teardown that lands while
//! they are in flight wins and their late results are discarded.

use crate::engine::PeerEngine;
use crate::media::{CallKind, MediaAcquisition, MediaBundle, MediaDevices, MediaTrack, TrackKind};
use crate::negotiator::TransportNegotiator;
use crate::registry::{ConsumerRecord, ProducerRecord, TeardownReport};
use crate::session::{CallSession, CallSnapshot, CallState};
use crate::sfu::SfuControl;
use crate::signaling::SignalingHandle;
use crate::signaling::message::{
    CallPayload, IndividualCallPayload, MessageType, NewProducerPayload, SignalMessage,
};
use gage_common::config::CallConfig;
use gage_common::{CallError, CallResult};
use serde_json::{Value, json};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, MutexGuard, broadcast, watch};
use tokio::task::JoinHandle;

/// The pluggable pieces a controller drives.
#[derive(Clone)]
pub struct CallBackends {
    pub devices: Arc<dyn MediaDevices>,
    pub sfu: Arc<dyn SfuControl>,
    pub engine: Arc<dyn PeerEngine>,
}

/// Entry point for collaborators: start, join, answer and end calls in one
/// group, and observe the result through [`CallSnapshot`]s.
pub struct CallController {
    inner: Arc<Inner>,
    events_task: JoinHandle<()>,
}

struct Inner {
    user: String,
    group_id: String,
    signaling: SignalingHandle,
    media: MediaAcquisition,
    sfu: Arc<dyn SfuControl>,
    engine: Arc<dyn PeerEngine>,
    config: CallConfig,
    session: Mutex<CallSession>,
    snapshots: watch::Sender<CallSnapshot>,
}

impl CallController {
    /// Attach a controller to an existing signaling channel. Inbound messages
    /// are processed from this point on, in arrival order.
    pub fn new(signaling: SignalingHandle, backends: CallBackends, config: CallConfig) -> Self {
        let key = signaling.key().clone();
        let status = signaling.status();
        let (snapshots, _) = watch::channel(CallSnapshot {
            signaling: status.status,
            health: status.health,
            ..CallSnapshot::default()
        });

        let events = signaling.subscribe();
        let status_rx = signaling.watch_status();
        let inner = Arc::new(Inner {
            user: key.user,
            group_id: key.group_id,
            media: MediaAcquisition::new(backends.devices),
            sfu: backends.sfu,
            engine: backends.engine,
            signaling,
            config,
            session: Mutex::new(CallSession::default()),
            snapshots,
        });
        let events_task = tokio::spawn(run_events(Arc::downgrade(&inner), events, status_rx));

        Self { inner, events_task }
    }

    /// Start a group call and wait in `calling` for others to join.
    pub async fn start_call(&self, kind: CallKind) -> CallResult<()> {
        self.inner.start(kind, None).await
    }

    /// Ring one user in the group.
    pub async fn start_individual_call(&self, target: &str, kind: CallKind) -> CallResult<()> {
        self.inner.start(kind, Some(target.to_owned())).await
    }

    /// Join a group call that is already running.
    pub async fn join_call(&self, kind: CallKind) -> CallResult<()> {
        self.inner.join(kind).await
    }

    /// Answer the call we are ringing for.
    pub async fn accept(&self) -> CallResult<()> {
        self.inner.accept().await
    }

    pub async fn decline(&self) -> CallResult<()> {
        self.inner.decline().await
    }

    /// Withdraw a call we started before anyone joined.
    pub async fn cancel(&self) -> CallResult<TeardownReport> {
        self.inner.cancel().await
    }

    /// Leave the call; everyone else stays in it.
    pub async fn hang_up(&self) -> CallResult<TeardownReport> {
        self.inner.hang_up().await
    }

    /// End the call for everyone.
    pub async fn end_call(&self) -> CallResult<TeardownReport> {
        self.inner.end_call().await
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.inner.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.inner.snapshots.subscribe()
    }

    pub fn signaling(&self) -> &SignalingHandle {
        &self.inner.signaling
    }
}

impl Drop for CallController {
    fn drop(&mut self) {
        self.events_task.abort();
    }
}

async fn run_events(
    inner: Weak<Inner>,
    mut events: broadcast::Receiver<SignalMessage>,
    mut status: watch::Receiver<crate::signaling::ChannelStatus>,
) {
    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(message) => {
                    let Some(inner) = inner.upgrade() else { break };
                    inner.handle(message).await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Call event loop lagged behind signaling");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let Some(inner) = inner.upgrade() else { break };
                inner.publish().await;
            }
        }
    }
    tracing::debug!("Call event loop stopped");
}

fn invalid(action: &'static str, state: CallState) -> CallError {
    CallError::InvalidState {
        action,
        state: state.to_string(),
    }
}

impl Inner {
    // ── Outbound operations ───────────────────────────────────────────────────

    async fn start(&self, kind: CallKind, target: Option<String>) -> CallResult<()> {
        let epoch = {
            let mut s = self.session.lock().await;
            if s.state != CallState::Idle {
                return Err(invalid("start a call", s.state));
            }
            let epoch = s.begin_attempt(self.negotiator());
            s.state = CallState::Calling;
            s.call_kind = kind;
            s.is_initiator = true;
            s.caller = Some(self.user.clone());
            s.peer = target.clone();
            self.publish_locked(&s);
            epoch
        };

        tracing::info!(
            group = %self.group_id,
            user = %self.user,
            kind = %kind,
            target = target.as_deref().unwrap_or("*"),
            "Starting call"
        );
        let announcement = match target {
            Some(target) => (
                MessageType::IndividualCallStarted,
                json!(IndividualCallPayload { target, call_kind: kind }),
            ),
            None => (MessageType::CallStarted, json!(CallPayload { call_kind: kind })),
        };
        self.run_setup(epoch, kind, announcement).await
    }

    async fn join(&self, kind: CallKind) -> CallResult<()> {
        let epoch = {
            let mut s = self.session.lock().await;
            if s.state != CallState::Idle {
                return Err(invalid("join a call", s.state));
            }
            let epoch = s.begin_attempt(self.negotiator());
            s.state = CallState::Connecting;
            s.call_kind = kind;
            s.is_initiator = false;
            self.publish_locked(&s);
            epoch
        };

        tracing::info!(group = %self.group_id, user = %self.user, kind = %kind, "Joining call");
        let announcement = (
            MessageType::UserJoinedCall,
            json!(CallPayload { call_kind: kind }),
        );
        self.run_setup(epoch, kind, announcement).await
    }

    async fn accept(&self) -> CallResult<()> {
        let (epoch, kind, announcement) = {
            let mut s = self.session.lock().await;
            if s.state != CallState::Ringing {
                return Err(invalid("accept", s.state));
            }
            let epoch = s.begin_attempt(self.negotiator());
            s.state = CallState::Connecting;
            s.is_initiator = false;
            let caller = s.caller.clone().unwrap_or_default();
            s.add_participant(&caller);
            let kind = s.call_kind;
            let announcement = if s.peer.is_some() {
                (
                    MessageType::IndividualCallAccepted,
                    json!(IndividualCallPayload { target: caller, call_kind: kind }),
                )
            } else {
                (MessageType::UserJoinedCall, json!(CallPayload { call_kind: kind }))
            };
            self.publish_locked(&s);
            (epoch, kind, announcement)
        };

        tracing::info!(group = %self.group_id, user = %self.user, kind = %kind, "Accepting call");
        self.run_setup(epoch, kind, announcement).await
    }

    async fn decline(&self) -> CallResult<()> {
        let reply = {
            let mut s = self.session.lock().await;
            if s.state != CallState::Ringing {
                return Err(invalid("decline", s.state));
            }
            let reply = match (&s.peer, &s.caller) {
                (Some(_), Some(caller)) => Some(json!(IndividualCallPayload {
                    target: caller.clone(),
                    call_kind: s.call_kind,
                })),
                _ => None,
            };
            s.teardown();
            self.publish_locked(&s);
            reply
        };

        tracing::info!(group = %self.group_id, user = %self.user, "Call declined");
        if let Some(payload) = reply {
            self.send(MessageType::IndividualCallDeclined, payload).await;
        }
        Ok(())
    }

    async fn cancel(&self) -> CallResult<TeardownReport> {
        let (report, message) = {
            let mut s = self.session.lock().await;
            if s.state != CallState::Calling || !s.is_initiator {
                return Err(invalid("cancel", s.state));
            }
            let message = match &s.peer {
                Some(peer) => (
                    MessageType::IndividualCallCanceled,
                    json!(IndividualCallPayload {
                        target: peer.clone(),
                        call_kind: s.call_kind,
                    }),
                ),
                None => (MessageType::CallEnded, json!({})),
            };
            let report = s.teardown();
            self.publish_locked(&s);
            (report, message)
        };

        tracing::info!(group = %self.group_id, user = %self.user, "Call canceled");
        self.send(message.0, message.1).await;
        Ok(report)
    }

    async fn hang_up(&self) -> CallResult<TeardownReport> {
        let mut s = self.session.lock().await;
        let state = s.state;
        match state {
            CallState::Idle => return Ok(TeardownReport::default()),
            CallState::Ringing => {
                drop(s);
                return self.decline().await.map(|()| TeardownReport::default());
            }
            _ => {}
        }

        let announced = s.announced;
        let report = s.teardown();
        self.publish_locked(&s);
        drop(s);

        tracing::info!(group = %self.group_id, user = %self.user, ?report, "Left call");
        if announced {
            self.send(MessageType::UserLeftCall, json!({})).await;
        }
        Ok(report)
    }

    async fn end_call(&self) -> CallResult<TeardownReport> {
        let mut s = self.session.lock().await;
        let state = s.state;
        match state {
            CallState::Idle => return Ok(TeardownReport::default()),
            CallState::Ringing => {
                drop(s);
                return self.decline().await.map(|()| TeardownReport::default());
            }
            _ => {}
        }

        let report = s.teardown();
        self.publish_locked(&s);
        drop(s);

        tracing::info!(group = %self.group_id, user = %self.user, ?report, "Ended call");
        self.send(MessageType::CallEnded, json!({})).await;
        Ok(report)
    }

    // ── Setup ─────────────────────────────────────────────────────────────────

    async fn run_setup(
        &self,
        epoch: u64,
        kind: CallKind,
        announcement: (MessageType, Value),
    ) -> CallResult<()> {
        let result = self.setup(epoch, kind, announcement).await;
        if let Err(e) = &result {
            self.abort(epoch, e).await;
            return result;
        }

        let mut s = self.session.lock().await;
        if !s.is_current(epoch) {
            return Err(CallError::Superseded);
        }
        if s.state == CallState::Connecting {
            s.state = CallState::Connected;
        }
        tracing::info!(group = %self.group_id, user = %self.user, state = %s.state, "Call media ready");
        self.publish_locked(&s);
        Ok(())
    }

    /// acquire media → announce → send transport → publish.
    async fn setup(
        &self,
        epoch: u64,
        kind: CallKind,
        (announce_kind, announce_payload): (MessageType, Value),
    ) -> CallResult<()> {
        let previous = self.current(epoch).await?.local_media.take();
        let bundle = self.media.acquire(kind, previous).await?;

        let negotiator = {
            let mut s = self.session.lock().await;
            if !s.is_current(epoch) {
                bundle.stop();
                return Err(CallError::Superseded);
            }
            s.local_media = Some(bundle.clone());
            self.publish_locked(&s);
            s.negotiator.clone().ok_or(CallError::Superseded)?
        };

        if !self.signaling.send(announce_kind.clone(), announce_payload).await {
            return Err(CallError::SignalingUnavailable(format!(
                "could not send {announce_kind}"
            )));
        }
        match self.current(epoch).await {
            Ok(mut s) => s.announced = true,
            Err(e) => {
                // Torn down while the announcement was in flight; the
                // teardown saw nothing to retract.
                self.send(MessageType::UserLeftCall, json!({})).await;
                return Err(e);
            }
        }

        let transport = negotiator.create_send_transport().await?;
        {
            let mut s = self.session.lock().await;
            if !s.is_current(epoch) {
                transport.close();
                return Err(CallError::Superseded);
            }
            s.registry.set_send_transport(Arc::clone(&transport));
        }

        let tracks: Vec<MediaTrack> = bundle
            .live_tracks()
            .filter(|t| t.kind() == TrackKind::Audio || kind.wants_video())
            .cloned()
            .collect();
        for track in tracks {
            match negotiator.publish(&transport, &track).await {
                Ok(producer_id) => {
                    self.current(epoch).await?.registry.add_producer(ProducerRecord {
                        producer_id: producer_id.clone(),
                        kind: track.kind(),
                        track: track.clone(),
                    });
                    self.announce_producer(&producer_id, track.kind()).await;
                }
                Err(e) => {
                    tracing::warn!(
                        group = %self.group_id,
                        kind = %track.kind(),
                        "Continuing without track: {e}"
                    );
                }
            }
        }
        Ok(())
    }

    /// Unwind a failed setup back to idle.
    async fn abort(&self, epoch: u64, error: &CallError) {
        if matches!(error, CallError::Superseded) {
            tracing::debug!(group = %self.group_id, "Setup superseded by teardown");
            return;
        }

        let mut s = self.session.lock().await;
        if s.epoch != epoch {
            return;
        }
        tracing::warn!(
            group = %self.group_id,
            user = %self.user,
            code = error.error_code(),
            "Call setup failed: {error}"
        );
        let announced = s.announced;
        s.last_error = Some(error.user_message());
        let report = s.teardown();
        self.publish_locked(&s);
        drop(s);

        tracing::debug!(?report, "Released partial call resources");
        if announced {
            self.send(MessageType::UserLeftCall, json!({})).await;
        }
    }

    // ── Inbound events ────────────────────────────────────────────────────────

    async fn handle(self: &Arc<Self>, message: SignalMessage) {
        if message.instance_id == self.signaling.instance_id() {
            tracing::trace!(kind = %message.kind, "Ignoring own echo");
            return;
        }
        if !message.group_id.is_empty() && message.group_id != self.group_id {
            tracing::debug!(kind = %message.kind, group = %message.group_id, "Ignoring message for another group");
            return;
        }
        if message.kind != MessageType::CallEnded && message.sender == self.user {
            tracing::debug!(kind = %message.kind, "Ignoring message from our other session");
            return;
        }

        let sender = message.sender.as_str();
        match message.kind {
            MessageType::CallStarted => self.on_call_started(sender, &message).await,
            MessageType::UserJoinedCall => self.on_user_joined(sender).await,
            MessageType::UserLeftCall => self.on_user_left(sender).await,
            MessageType::CallEnded => self.on_call_ended(sender).await,
            MessageType::NewProducer => self.on_new_producer(sender, &message).await,
            MessageType::IndividualCallStarted => self.on_individual_started(sender, &message).await,
            MessageType::IndividualCallAccepted => {
                if self.addressed_to_us(&message) && self.is_peer(sender).await {
                    self.on_user_joined(sender).await;
                }
            }
            MessageType::IndividualCallDeclined => self.on_individual_declined(sender, &message).await,
            MessageType::IndividualCallCanceled => self.on_individual_canceled(sender, &message).await,
            _ => tracing::debug!(kind = %message.kind, "Ignoring signaling message"),
        }
    }

    async fn on_call_started(&self, sender: &str, message: &SignalMessage) {
        let kind = message
            .payload_as::<CallPayload>()
            .map(|p| p.call_kind)
            .unwrap_or_default();

        let mut s = self.session.lock().await;
        let state = s.state;
        match state {
            CallState::Idle => {
                s.state = CallState::Ringing;
                s.call_kind = kind;
                s.caller = Some(sender.to_owned());
                s.peer = None;
                s.is_initiator = false;
                s.last_error = None;
                tracing::info!(group = %self.group_id, caller = %sender, kind = %kind, "Incoming call");
                self.publish_locked(&s);
            }
            state if state.in_call() && s.is_initiator => {
                drop(s);
                self.on_user_joined(sender).await;
            }
            _ => tracing::debug!(caller = %sender, "Ignoring CALL_STARTED while busy"),
        }
    }

    async fn on_user_joined(&self, sender: &str) {
        let producers: Vec<(String, TrackKind)> = {
            let mut s = self.session.lock().await;
            if !s.state.in_call() {
                tracing::debug!(participant = %sender, "Ignoring join outside a call");
                return;
            }
            if s.add_participant(sender) {
                tracing::info!(group = %self.group_id, participant = %sender, "Participant joined");
            }
            self.publish_locked(&s);
            s.registry
                .producers()
                .map(|p| (p.producer_id.clone(), p.kind))
                .collect()
        };

        // Late joiners missed our original announcements.
        for (producer_id, kind) in producers {
            self.announce_producer(&producer_id, kind).await;
        }
    }

    async fn on_user_left(&self, sender: &str) {
        let mut s = self.session.lock().await;
        let state = s.state;
        match state {
            CallState::Ringing if s.caller.as_deref() == Some(sender) => {
                tracing::info!(caller = %sender, "Caller left before we answered");
                s.teardown();
            }
            state if state.in_call() => {
                if s.remove_participant(sender) {
                    tracing::info!(group = %self.group_id, participant = %sender, "Participant left");
                }
                if s.peer.as_deref() == Some(sender) {
                    tracing::info!(peer = %sender, "Peer hung up, ending call");
                    s.teardown();
                }
            }
            _ => return,
        }
        self.publish_locked(&s);
    }

    async fn on_call_ended(&self, sender: &str) {
        let mut s = self.session.lock().await;
        if s.state == CallState::Idle {
            return;
        }
        let report = s.teardown();
        tracing::info!(group = %self.group_id, by = %sender, ?report, "Call ended remotely");
        self.publish_locked(&s);
    }

    async fn on_new_producer(self: &Arc<Self>, sender: &str, message: &SignalMessage) {
        let payload: NewProducerPayload = match message.payload_as() {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(participant = %sender, "Malformed NEW_PRODUCER: {e}");
                return;
            }
        };

        let epoch = {
            let mut s = self.session.lock().await;
            if !s.state.in_call() {
                tracing::debug!(producer = %payload.producer_id, "Ignoring producer outside a call");
                return;
            }
            if !s.registry.mark_seen(&payload.producer_id) {
                tracing::debug!(producer = %payload.producer_id, "Producer already consumed");
                return;
            }
            if s.add_participant(sender) {
                self.publish_locked(&s);
            }
            s.epoch
        };

        let inner = Arc::clone(self);
        let participant = sender.to_owned();
        tokio::spawn(async move {
            // Give the remote producer a moment to settle on the server.
            tokio::time::sleep(inner.config.consume_delay()).await;
            inner.consume(epoch, &participant, &payload).await;
        });
    }

    async fn on_individual_started(&self, sender: &str, message: &SignalMessage) {
        let Ok(payload) = message.payload_as::<IndividualCallPayload>() else {
            tracing::debug!(caller = %sender, "Malformed INDIVIDUAL_CALL_STARTED");
            return;
        };
        if payload.target != self.user {
            return;
        }

        let mut s = self.session.lock().await;
        if s.state != CallState::Idle {
            tracing::debug!(caller = %sender, state = %s.state, "Ignoring individual call while busy");
            return;
        }
        s.state = CallState::Ringing;
        s.call_kind = payload.call_kind;
        s.caller = Some(sender.to_owned());
        s.peer = Some(sender.to_owned());
        s.is_initiator = false;
        s.last_error = None;
        tracing::info!(group = %self.group_id, caller = %sender, kind = %payload.call_kind, "Incoming individual call");
        self.publish_locked(&s);
    }

    async fn on_individual_declined(&self, sender: &str, message: &SignalMessage) {
        if !self.addressed_to_us(message) {
            return;
        }
        let mut s = self.session.lock().await;
        if !(s.is_initiator && s.state.in_call() && s.peer.as_deref() == Some(sender)) {
            return;
        }
        s.last_error = Some(format!("{sender} declined the call"));
        s.teardown();
        tracing::info!(group = %self.group_id, peer = %sender, "Individual call declined");
        self.publish_locked(&s);
    }

    async fn on_individual_canceled(&self, sender: &str, message: &SignalMessage) {
        if !self.addressed_to_us(message) {
            return;
        }
        let mut s = self.session.lock().await;
        if s.state != CallState::Ringing || s.caller.as_deref() != Some(sender) {
            return;
        }
        s.teardown();
        tracing::info!(group = %self.group_id, caller = %sender, "Individual call canceled");
        self.publish_locked(&s);
    }

    // ── Consume ───────────────────────────────────────────────────────────────

    async fn consume(&self, epoch: u64, participant: &str, payload: &NewProducerPayload) {
        let negotiator = {
            let s = self.session.lock().await;
            match (&s.negotiator, s.is_current(epoch)) {
                (Some(n), true) if s.has_participant(participant) => Arc::clone(n),
                (_, true) => {
                    tracing::debug!(participant = %participant, producer = %payload.producer_id, "Participant left before consume");
                    return;
                }
                _ => return,
            }
        };

        match self
            .try_consume(epoch, &negotiator, participant, &payload.producer_id)
            .await
        {
            Ok(()) => {}
            Err(CallError::Superseded) => {
                tracing::debug!(producer = %payload.producer_id, "Consume discarded after teardown or leave");
            }
            Err(e) => {
                tracing::warn!(
                    participant = %participant,
                    producer = %payload.producer_id,
                    kind = %payload.kind,
                    "Consume failed: {e}"
                );
                let mut s = self.session.lock().await;
                if s.is_current(epoch) {
                    s.registry.forget(&payload.producer_id);
                }
            }
        }
    }

    async fn try_consume(
        &self,
        epoch: u64,
        negotiator: &TransportNegotiator,
        participant: &str,
        producer_id: &str,
    ) -> CallResult<()> {
        let transport = self.recv_transport(epoch, negotiator, participant).await?;
        let (params, track) = negotiator.subscribe(&transport, producer_id).await?;

        let mut s = self.session.lock().await;
        let still_owned = s.is_current(epoch)
            && s.has_participant(participant)
            && s.registry
                .recv_transport(participant)
                .is_some_and(|t| t.id() == transport.id());
        if !still_owned {
            track.stop();
            return Err(CallError::Superseded);
        }

        s.registry.add_consumer(ConsumerRecord {
            consumer_id: params.id,
            producer_id: producer_id.to_owned(),
            kind: params.kind,
            participant_id: participant.to_owned(),
            track: track.clone(),
        });
        s.remote_media
            .entry(participant.to_owned())
            .or_insert_with(|| MediaBundle::new(Vec::new()))
            .upsert_track(track);
        self.publish_locked(&s);
        Ok(())
    }

    /// The participant's receive transport, created on first use. If two
    /// consumes race to create it, the first one registered wins. Nothing is
    /// registered for a participant who left in the meantime.
    async fn recv_transport(
        &self,
        epoch: u64,
        negotiator: &TransportNegotiator,
        participant: &str,
    ) -> CallResult<Arc<dyn crate::engine::EngineTransport>> {
        if let Some(existing) = self.current(epoch).await?.registry.recv_transport(participant) {
            return Ok(Arc::clone(existing));
        }

        let created = negotiator.create_recv_transport(participant).await?;
        let mut s = self.session.lock().await;
        if !s.is_current(epoch) || !s.has_participant(participant) {
            created.close();
            return Err(CallError::Superseded);
        }
        let winner = s
            .registry
            .insert_recv_transport(participant, Arc::clone(&created));
        if winner.id() != created.id() {
            created.close();
        }
        Ok(winner)
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn negotiator(&self) -> TransportNegotiator {
        TransportNegotiator::new(
            Arc::clone(&self.sfu),
            Arc::clone(&self.engine),
            self.config.clone(),
        )
    }

    /// Lock the session if `epoch` is still the live attempt.
    async fn current(&self, epoch: u64) -> CallResult<MutexGuard<'_, CallSession>> {
        let s = self.session.lock().await;
        if s.is_current(epoch) {
            Ok(s)
        } else {
            Err(CallError::Superseded)
        }
    }

    fn addressed_to_us(&self, message: &SignalMessage) -> bool {
        message
            .payload_as::<IndividualCallPayload>()
            .is_ok_and(|p| p.target == self.user)
    }

    async fn is_peer(&self, sender: &str) -> bool {
        let s = self.session.lock().await;
        s.is_initiator && s.peer.as_deref() == Some(sender)
    }

    async fn announce_producer(&self, producer_id: &str, kind: TrackKind) {
        let payload = json!(NewProducerPayload {
            producer_id: producer_id.to_owned(),
            kind,
        });
        if !self.signaling.send(MessageType::NewProducer, payload).await {
            tracing::warn!(producer = %producer_id, "Could not announce producer");
        }
    }

    async fn send(&self, kind: MessageType, payload: Value) {
        if !self.signaling.send(kind.clone(), payload).await {
            tracing::warn!(group = %self.group_id, "Could not send {kind}");
        }
    }

    async fn publish(&self) {
        let s = self.session.lock().await;
        self.publish_locked(&s);
    }

    fn publish_locked(&self, session: &CallSession) {
        let status = self.signaling.status();
        self.snapshots
            .send_replace(session.snapshot(status.status, status.health));
    }
}
