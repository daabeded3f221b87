//! Duplicate-call guard: a per-session, per-tool sliding window counter plus
//! an exclusive handoff-in-flight flag per session.

use dashmap::{DashMap, DashSet};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::{GuardConfig, SessionKey};
use tokio::time::Instant;
use tracing::{debug, warn};

pub const CIRCUIT_BREAKER: &str = "circuit-breaker";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Blocked(String),
}

impl Verdict {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Verdict::Blocked(_))
    }
}

pub struct CallGuard {
    window: Duration,
    threshold: usize,
    calls: DashMap<(SessionKey, String), VecDeque<Instant>>,
    in_flight: DashSet<SessionKey>,
}

impl CallGuard {
    pub fn new(window: Duration, threshold: usize) -> Self {
        Self {
            window,
            threshold,
            calls: DashMap::new(),
            in_flight: DashSet::new(),
        }
    }

    pub fn from_config(config: &GuardConfig) -> Self {
        Self::new(config.window(), config.threshold)
    }

    pub fn allow(&self, session: &SessionKey, tool: &str) -> Verdict {
        self.allow_at(session, tool, Instant::now())
    }

    /// Record a call at `now`. Blocked calls are recorded too, so a model that
    /// keeps retrying stays blocked until it backs off for a full window.
    pub fn allow_at(&self, session: &SessionKey, tool: &str, now: Instant) -> Verdict {
        let mut stamps = self
            .calls
            .entry((session.clone(), tool.to_string()))
            .or_default();
        while let Some(oldest) = stamps.front() {
            if now.saturating_duration_since(*oldest) > self.window {
                stamps.pop_front();
            } else {
                break;
            }
        }
        stamps.push_back(now);
        while stamps.len() > self.threshold + 1 {
            stamps.pop_front();
        }

        if stamps.len() > self.threshold {
            warn!(session = %session, tool, count = stamps.len(), "Call blocked by circuit breaker");
            Verdict::Blocked(CIRCUIT_BREAKER.to_string())
        } else {
            Verdict::Allowed
        }
    }

    pub fn is_handoff_in_flight(&self, session: &SessionKey) -> bool {
        self.in_flight.contains(session)
    }

    /// Returns false if a handoff was already in flight.
    pub fn mark_handoff_in_flight(&self, session: &SessionKey) -> bool {
        self.in_flight.insert(session.clone())
    }

    pub fn clear_handoff_in_flight(&self, session: &SessionKey) {
        self.in_flight.remove(session);
    }

    /// Atomic test-and-set. The flag clears when the returned guard drops.
    pub fn try_mark_handoff_in_flight(self: &Arc<Self>, session: &SessionKey) -> Option<InFlightGuard> {
        if self.mark_handoff_in_flight(session) {
            Some(InFlightGuard {
                guard: Arc::clone(self),
                session: session.clone(),
            })
        } else {
            debug!(session = %session, "Handoff already in flight");
            None
        }
    }

    /// Drop all state for a session.
    pub fn forget(&self, session: &SessionKey) {
        self.calls.retain(|(s, _), _| s != session);
        self.in_flight.remove(session);
    }

    pub fn tracked_keys(&self) -> usize {
        self.calls.len()
    }
}

/// Holds a session's handoff-in-flight flag.
#[must_use = "the in-flight flag clears as soon as this guard is dropped"]
pub struct InFlightGuard {
    guard: Arc<CallGuard>,
    session: SessionKey,
}

impl InFlightGuard {
    pub fn session(&self) -> &SessionKey {
        &self.session
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.guard.clear_handoff_in_flight(&self.session);
    }
}
