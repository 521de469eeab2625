//! Control-plane contracts.
//!
//! The engine talks to the remote smart-home system over two decoupled
//! channels: synchronous service calls (plus one-shot state reads) and a push
//! event feed. Both are abstracted here so that a real client, a recorded
//! fixture or the in-memory [`memory::SimulatedHome`] can sit behind them.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::entity::{EntityId, EntityState};
use crate::error::ControlPlaneError;
use crate::subscriber::EntityFilter;

/// In-memory control plane for tests and embedded use.
pub mod memory;

/// One synchronous control-plane call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCall {
    /// Service domain, e.g. `light`.
    pub domain: String,
    /// Service name, e.g. `turn_on`.
    pub service: String,
    /// Entities the call applies to.
    pub targets: Vec<EntityId>,
    /// Service data (without the targets).
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl ServiceCall {
    /// `domain.service` label for logs.
    #[must_use]
    pub fn label(&self) -> String {
        format!("{}.{}", self.domain, self.service)
    }
}

/// Acknowledgment of an accepted call.
///
/// Acceptance only means the control plane took the request. It says
/// nothing about whether the device changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallAck {
    /// Control-plane context id for the call, if it reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    /// When the control plane accepted the call.
    pub acknowledged_at: DateTime<Utc>,
}

impl CallAck {
    /// Acknowledgment stamped now.
    #[must_use]
    pub fn now(context_id: Option<String>) -> Self {
        Self {
            context_id,
            acknowledged_at: Utc::now(),
        }
    }
}

/// Synchronous side of the control plane.
///
/// Implementations must be safe to call from several threads at once; the
/// dispatcher issues parallel calls for bulk intents.
pub trait ControlPlane: Send + Sync {
    /// Issue a service call.
    ///
    /// # Errors
    /// - `Rejected` / `InvalidTarget`: the call was refused
    /// - `Authentication`: credentials refused (fatal)
    /// - `Connection`: transport failure
    fn call_service(&self, call: &ServiceCall) -> Result<CallAck, ControlPlaneError>;

    /// One-shot read of an entity's current state. `Ok(None)` if it does not exist.
    fn get_state(&self, entity_id: &EntityId) -> Result<Option<EntityState>, ControlPlaneError>;
}

/// Raw state-change notification as delivered by a feed connection.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub entity_id: EntityId,
    pub new_state: EntityState,
    /// Monotonic per connection; a jump greater than one means missed events.
    pub sequence: u64,
    pub fired_at: DateTime<Utc>,
}

/// Message read from a feed connection.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    /// An entity changed state.
    StateChanged(RawEvent),
    /// Reply to a liveness ping.
    Pong,
}

/// A live connection to the event feed.
pub trait FeedConnection: Send {
    /// Subscribe the connection to state changes matching `filter`.
    fn subscribe(&mut self, filter: &EntityFilter) -> Result<(), ControlPlaneError>;

    /// Send a liveness ping; the answer arrives later as [`FeedMessage::Pong`].
    fn ping(&mut self) -> Result<(), ControlPlaneError>;

    /// Wait up to `timeout` for the next message. `Ok(None)` on timeout.
    fn next_message(&mut self, timeout: Duration) -> Result<Option<FeedMessage>, ControlPlaneError>;
}

/// Factory for feed connections.
pub trait EventFeed: Send + Sync {
    /// Open and authenticate a new connection.
    fn connect(&self) -> Result<Box<dyn FeedConnection>, ControlPlaneError>;
}

/// Failure to turn a reference into canonical ids.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("no entity matches '{reference}'")]
    NotFound { reference: String },

    #[error("'{reference}' is ambiguous ({} candidates)", candidates.len())]
    Ambiguous {
        reference: String,
        candidates: Vec<EntityId>,
    },
}

/// Converts free-text or ambiguous references into canonical entity ids.
///
/// Fuzzy search lives outside this crate; the engine consumes only this
/// contract.
pub trait EntityResolver: Send + Sync {
    /// Resolve one reference to one or more canonical ids.
    fn resolve(&self, reference: &str) -> Result<Vec<EntityId>, ResolutionError>;
}

/// Resolver that accepts canonical ids verbatim and nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct CanonicalResolver;

impl EntityResolver for CanonicalResolver {
    fn resolve(&self, reference: &str) -> Result<Vec<EntityId>, ResolutionError> {
        EntityId::parse(reference)
            .map(|id| vec![id])
            .map_err(|_| ResolutionError::NotFound {
                reference: reference.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Compile-time test: ensure traits are object-safe
    fn _assert_control_plane_object_safe(_: &dyn ControlPlane) {}
    fn _assert_event_feed_object_safe(_: &dyn EventFeed) {}
    fn _assert_feed_connection_object_safe(_: &dyn FeedConnection) {}
    fn _assert_resolver_object_safe(_: &dyn EntityResolver) {}

    #[test]
    fn canonical_resolver_accepts_only_ids() {
        let r = CanonicalResolver;
        assert_eq!(
            r.resolve("light.kitchen").unwrap(),
            vec![EntityId::parse("light.kitchen").unwrap()]
        );
        assert!(matches!(
            r.resolve("the kitchen light"),
            Err(ResolutionError::NotFound { .. })
        ));
    }

    #[test]
    fn ambiguous_error_display() {
        let err = ResolutionError::Ambiguous {
            reference: "kitchen".to_string(),
            candidates: vec![
                EntityId::parse("light.kitchen").unwrap(),
                EntityId::parse("switch.kitchen").unwrap(),
            ],
        };
        assert!(err.to_string().contains("2 candidates"));
    }
}
