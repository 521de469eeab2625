use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::{EntityId, EntityState};
use crate::error::ControlPlaneError;

/// Unique identifier for a listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Creates a new random subscription id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which entities a listener (or a feed connection) wants events for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "values", rename_all = "snake_case")]
pub enum EntityFilter {
    /// Every entity.
    All,
    /// Exactly these entities.
    Entities(BTreeSet<EntityId>),
    /// Every entity in these domains.
    Domains(BTreeSet<String>),
}

impl EntityFilter {
    /// Filter for an explicit set of entities.
    #[must_use]
    pub fn entities(ids: impl IntoIterator<Item = EntityId>) -> Self {
        Self::Entities(ids.into_iter().collect())
    }

    /// Filter for whole domains.
    #[must_use]
    pub fn domains<S: Into<String>>(domains: impl IntoIterator<Item = S>) -> Self {
        Self::Domains(domains.into_iter().map(Into::into).collect())
    }

    /// Returns true if `entity_id` passes the filter.
    #[must_use]
    pub fn matches(&self, entity_id: &EntityId) -> bool {
        match self {
            Self::All => true,
            Self::Entities(ids) => ids.contains(entity_id),
            Self::Domains(domains) => domains.contains(entity_id.domain()),
        }
    }

    /// Entities named explicitly by the filter; empty for domain and catch-all filters.
    pub fn named(&self) -> impl Iterator<Item = &EntityId> {
        let ids = match self {
            Self::Entities(ids) => Some(ids),
            _ => None,
        };
        ids.into_iter().flatten()
    }
}

/// How an envelope came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeOrigin {
    /// Pushed by the event feed.
    Live,
    /// Produced by a one-shot state read after a reconnect or a gap.
    Resync,
}

/// One observed state change, as delivered to listeners.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub entity_id: EntityId,
    pub state: EntityState,
    pub observed_at: DateTime<Utc>,
    /// Increments on every (re)connect; sequence numbers are scoped to it.
    pub connection_epoch: u64,
    /// Feed sequence number; for resync envelopes the last live sequence seen.
    pub sequence: u64,
    pub origin: EnvelopeOrigin,
}

/// What a listener receives.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedSignal {
    /// A state observation (live or resync).
    Event(EventEnvelope),

    /// Events were missed on the current connection. Resync envelopes follow.
    SequenceGap {
        /// Connection the gap was seen on.
        connection_epoch: u64,
        /// Sequence number that should have come next.
        expected: u64,
        /// Sequence number that arrived instead.
        received: u64,
    },

    /// The feed has failed to reconnect `attempts` times in a row. Retries continue.
    Degraded {
        /// Consecutive failed attempts.
        attempts: u32,
        /// Last connection error.
        last_error: String,
    },

    /// The feed is live again after a reconnect.
    Recovered {
        /// Epoch of the new connection.
        connection_epoch: u64,
    },

    /// The feed has stopped for good.
    Fatal {
        /// The error that stopped it.
        error: ControlPlaneError,
    },
}

impl FeedSignal {
    /// The envelope, if this is an event.
    #[must_use]
    pub const fn envelope(&self) -> Option<&EventEnvelope> {
        match self {
            Self::Event(env) => Some(env),
            _ => None,
        }
    }

    fn entity(&self) -> Option<&EntityId> {
        self.envelope().map(|e| &e.entity_id)
    }

    /// Returns true if a listener with `filter` should receive this signal.
    ///
    /// Health signals go to every listener.
    #[must_use]
    pub fn is_for(&self, filter: &EntityFilter) -> bool {
        self.entity().map_or(true, |id| filter.matches(id))
    }
}

/// Connection health as seen by the subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "health", rename_all = "snake_case")]
pub enum FeedHealth {
    /// First connection not yet established.
    Connecting,
    /// Connected and subscribed.
    Live {
        /// Current connection epoch.
        epoch: u64,
    },
    /// Connection lost; retrying.
    Reconnecting {
        /// Consecutive failed attempts so far.
        attempt: u32,
    },
    /// Retries exceeded the configured limit; still retrying.
    Degraded {
        /// Consecutive failed attempts so far.
        attempt: u32,
    },
    /// Stopped after a fatal error.
    Failed,
}

impl FeedHealth {
    /// Returns true while the feed is connected.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        matches!(self, Self::Live { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> EntityId {
        EntityId::parse(s).unwrap()
    }

    #[test]
    fn filter_matching() {
        let f = EntityFilter::entities([id("light.a"), id("switch.b")]);
        assert!(f.matches(&id("light.a")));
        assert!(!f.matches(&id("light.c")));
        assert_eq!(f.named().count(), 2);

        let d = EntityFilter::domains(["cover"]);
        assert!(d.matches(&id("cover.garage")));
        assert!(!d.matches(&id("light.garage")));
        assert_eq!(d.named().count(), 0);

        assert!(EntityFilter::All.matches(&id("sensor.x")));
    }

    #[test]
    fn health_signals_reach_every_listener() {
        let f = EntityFilter::entities([id("light.a")]);
        let gap = FeedSignal::SequenceGap {
            connection_epoch: 1,
            expected: 3,
            received: 5,
        };
        assert!(gap.is_for(&f));

        let other = FeedSignal::Event(EventEnvelope {
            entity_id: id("light.b"),
            state: EntityState::new("on"),
            observed_at: Utc::now(),
            connection_epoch: 1,
            sequence: 6,
            origin: EnvelopeOrigin::Live,
        });
        assert!(!other.is_for(&f));
    }

    #[test]
    fn filter_serde_shape() {
        let f = EntityFilter::domains(["light"]);
        let json = serde_json::to_string(&f).unwrap();
        assert_eq!(json, r#"{"kind":"domains","values":["light"]}"#);
        let all: EntityFilter = serde_json::from_str(r#"{"kind":"all"}"#).unwrap();
        assert_eq!(all, EntityFilter::All);
    }
}
