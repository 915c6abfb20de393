//! Bookkeeping for everything a call session has published or subscribed.
//!
//! The registry only tracks handles; it never talks to the network. Closing
//! is done by whoever drains it, in dependency order: consumers and
//! producers before the transports that carry them.

use crate::engine::EngineTransport;
use crate::media::{MediaTrack, TrackKind};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct ProducerRecord {
    pub producer_id: String,
    pub kind: TrackKind,
    pub track: MediaTrack,
}

#[derive(Debug, Clone)]
pub struct ConsumerRecord {
    pub consumer_id: String,
    pub producer_id: String,
    pub kind: TrackKind,
    pub participant_id: String,
    pub track: MediaTrack,
}

/// Handles removed for one departed participant.
#[derive(Default)]
pub struct ParticipantResources {
    pub consumers: Vec<ConsumerRecord>,
    pub transport: Option<Arc<dyn EngineTransport>>,
}

/// Everything a session owned, ready to be closed.
#[derive(Default)]
pub struct DrainedResources {
    pub consumers: Vec<ConsumerRecord>,
    pub producers: Vec<ProducerRecord>,
    pub recv_transports: Vec<Arc<dyn EngineTransport>>,
    pub send_transport: Option<Arc<dyn EngineTransport>>,
}

/// Counts of what a teardown closed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    pub consumers_closed: usize,
    pub producers_closed: usize,
    pub recv_transports_closed: usize,
    pub send_transport_closed: bool,
    pub local_tracks_stopped: usize,
}

impl DrainedResources {
    /// Close everything in dependency order.
    pub fn close(self) -> TeardownReport {
        let mut report = TeardownReport::default();

        for consumer in &self.consumers {
            consumer.track.stop();
            report.consumers_closed += 1;
        }
        for producer in &self.producers {
            producer.track.stop();
            report.producers_closed += 1;
        }
        for transport in &self.recv_transports {
            transport.close();
            report.recv_transports_closed += 1;
        }
        if let Some(transport) = &self.send_transport {
            transport.close();
            report.send_transport_closed = true;
        }
        report
    }
}

#[derive(Default)]
pub struct ProducerConsumerRegistry {
    send_transport: Option<Arc<dyn EngineTransport>>,
    producers: BTreeMap<TrackKind, ProducerRecord>,
    /// Keyed by producer id.
    consumers: HashMap<String, ConsumerRecord>,
    /// Producer ids that have been (or are being) consumed.
    seen: HashSet<String>,
    /// Keyed by participant id.
    recv_transports: HashMap<String, Arc<dyn EngineTransport>>,
}

impl ProducerConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // === Dedup ===

    /// Claim `producer_id` for consumption. Returns `false` if it was already
    /// claimed.
    pub fn mark_seen(&mut self, producer_id: &str) -> bool {
        self.seen.insert(producer_id.to_owned())
    }

    /// Release a claim after a failed consume so the producer can be retried.
    pub fn forget(&mut self, producer_id: &str) {
        self.seen.remove(producer_id);
    }

    pub fn is_seen(&self, producer_id: &str) -> bool {
        self.seen.contains(producer_id)
    }

    // === Send side ===

    pub fn send_transport(&self) -> Option<&Arc<dyn EngineTransport>> {
        self.send_transport.as_ref()
    }

    /// Returns the transport it replaced, if any.
    pub fn set_send_transport(
        &mut self,
        transport: Arc<dyn EngineTransport>,
    ) -> Option<Arc<dyn EngineTransport>> {
        self.send_transport.replace(transport)
    }

    /// At most one producer per kind; returns the displaced record.
    pub fn add_producer(&mut self, record: ProducerRecord) -> Option<ProducerRecord> {
        self.producers.insert(record.kind, record)
    }

    pub fn producers(&self) -> impl Iterator<Item = &ProducerRecord> {
        self.producers.values()
    }

    // === Receive side ===

    pub fn recv_transport(&self, participant_id: &str) -> Option<&Arc<dyn EngineTransport>> {
        self.recv_transports.get(participant_id)
    }

    /// Store `transport` for `participant_id` unless one already exists.
    /// Returns the transport that ended up registered.
    pub fn insert_recv_transport(
        &mut self,
        participant_id: &str,
        transport: Arc<dyn EngineTransport>,
    ) -> Arc<dyn EngineTransport> {
        Arc::clone(
            self.recv_transports
                .entry(participant_id.to_owned())
                .or_insert(transport),
        )
    }

    pub fn add_consumer(&mut self, record: ConsumerRecord) {
        self.consumers.insert(record.producer_id.clone(), record);
    }

    pub fn consumer(&self, producer_id: &str) -> Option<&ConsumerRecord> {
        self.consumers.get(producer_id)
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    pub fn recv_transport_count(&self) -> usize {
        self.recv_transports.len()
    }

    /// Detach everything belonging to `participant_id`. Seen entries for its
    /// producers stay, so late duplicates of old announcements are ignored.
    pub fn remove_participant(&mut self, participant_id: &str) -> ParticipantResources {
        let producer_ids: Vec<String> = self
            .consumers
            .values()
            .filter(|c| c.participant_id == participant_id)
            .map(|c| c.producer_id.clone())
            .collect();
        let consumers = producer_ids
            .iter()
            .filter_map(|id| self.consumers.remove(id))
            .collect();

        ParticipantResources {
            consumers,
            transport: self.recv_transports.remove(participant_id),
        }
    }

    /// Take every handle, leaving the registry empty.
    pub fn drain(&mut self) -> DrainedResources {
        self.seen.clear();
        DrainedResources {
            consumers: self.consumers.drain().map(|(_, c)| c).collect(),
            producers: std::mem::take(&mut self.producers).into_values().collect(),
            recv_transports: self.recv_transports.drain().map(|(_, t)| t).collect(),
            send_transport: self.send_transport.take(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.send_transport.is_none()
            && self.producers.is_empty()
            && self.consumers.is_empty()
            && self.recv_transports.is_empty()
    }
}
