//! Connection attempt guard.
//!
//! "Already connecting" and "tried too recently" are the same question asked
//! at different times, so they live in one small state machine.

use std::time::Duration;
use tokio::time::Instant;

/// Who asked for the attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOrigin {
    /// A collaborator called `connect()`. Subject to the debounce window.
    External,
    /// The backoff timer fired.
    Reconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptDecision {
    Start,
    AlreadyInFlight,
    Debounced,
}

#[derive(Debug, Clone)]
pub struct AttemptState {
    debounce: Duration,
    in_flight: bool,
    last_started: Option<Instant>,
}

impl AttemptState {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            in_flight: false,
            last_started: None,
        }
    }

    /// Decide whether a physical attempt may start now. On `Start` the
    /// attempt is recorded as in flight.
    pub fn request(&mut self, now: Instant, origin: AttemptOrigin) -> AttemptDecision {
        if self.in_flight {
            return AttemptDecision::AlreadyInFlight;
        }
        if origin == AttemptOrigin::External {
            if let Some(last) = self.last_started {
                if now.saturating_duration_since(last) < self.debounce {
                    return AttemptDecision::Debounced;
                }
            }
        }
        self.in_flight = true;
        self.last_started = Some(now);
        AttemptDecision::Start
    }

    /// The in-flight attempt settled (opened, failed, or timed out).
    pub fn finish(&mut self) {
        self.in_flight = false;
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    /// Forget any in-flight attempt; the debounce window still applies.
    pub fn cancel(&mut self) {
        self.in_flight = false;
    }
}
