//! # devconfirm - Command Dispatch and State Confirmation
//!
//! devconfirm sends commands to a smart-home control plane and then proves
//! they took effect. A call being accepted only means the hub queued it; the
//! device may still be asleep, unreachable, or rounding the value. The engine
//! watches the hub's event feed and reports, per entity, whether the state the
//! command asked for was actually observed.
//!
//! ## Core Concepts
//!
//! - **Intent**: one or more entity commands dispatched as a single operation
//! - **Predicate**: the observable state that proves a command worked
//! - **Event subscriber**: one ordered, self-healing path from the feed to every listener
//! - **Operation record**: per-entity outcomes plus an aggregate status, tracked
//!   until every entity settles or the deadline passes
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use devconfirm::{Action, ConfirmEngine, EngineConfig, EntityId, EntityState, Intent};
//! use devconfirm::control::memory::SimulatedHome;
//!
//! let kitchen = EntityId::parse("light.kitchen")?;
//! let home = SimulatedHome::new().with_entity(&kitchen, EntityState::new("off"));
//! let engine = ConfirmEngine::start(Arc::new(home.clone()), Arc::new(home), EngineConfig::default())?;
//!
//! let intent = Intent::single(kitchen, Action::On);
//! let result = engine.dispatch_and_wait(&intent, Some(Duration::from_secs(5)), true)?;
//! assert_eq!(result.status(), devconfirm::OperationStatus::Confirmed);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod entity;
pub mod error;
pub mod intent;
pub mod predicate;

// Configuration and logging
pub mod config;
pub mod telemetry;

// Control plane seam, feed, dispatch and tracking
pub mod control;
pub mod dispatch;
pub mod engine;
pub mod subscriber;
pub mod tracker;

// Re-export primary types at crate root for convenience
pub use config::{DispatcherConfig, EngineConfig, PredicateConfig, SubscriberConfig, TrackerConfig};
pub use control::{
    CallAck, CanonicalResolver, ControlPlane, EntityResolver, EventFeed, FeedConnection, FeedMessage, RawEvent,
    ResolutionError, ServiceCall,
};
pub use dispatch::{CommandDispatcher, DispatchOutcome, DispatchReport, EntityDispatch};
pub use engine::{BulkEntry, BulkStatus, BulkSummary, CancelAck, ConfirmEngine, OperationResult, ShutdownReport};
pub use entity::{EntityId, EntityState};
pub use error::{ConfirmError, ConfirmResult, ControlPlaneError, ExecutionError, ValidationError};
pub use intent::{Action, DispatchMode, EntityCommand, Intent};
pub use predicate::{CommandPlan, PredicateTable, StatePredicate};
pub use subscriber::{
    EntityFilter, EnvelopeOrigin, EventEnvelope, EventSubscriber, FeedHealth, FeedSignal, Subscription,
    SubscriptionId,
};
pub use tracker::{
    ConfirmationSource, CorrelationId, EntityOutcome, EntityReport, OperationSnapshot, OperationStatus,
    OutcomeCounts, ResolutionReason,
};
