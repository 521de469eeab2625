//! Operation tracking.
//!
//! Each dispatched operation gets an [`OperationRecord`] and its own tracker
//! thread. The thread is the record's only writer: it evaluates cached states,
//! live and resync envelopes against the per-entity predicates, handles
//! cancellation, and resolves the record at the deadline or when the feed is
//! lost. Everyone else reads snapshots through the registry.

mod record;
mod registry;
mod worker;

pub use record::{
    ConfirmationSource, CorrelationId, EntityOutcome, EntityReport, OperationRecord, OperationSnapshot,
    OperationStatus, OutcomeCounts, ResolutionReason, TargetSeed,
};

pub(crate) use record::duration_ms;
pub(crate) use registry::{OperationHandle, OperationRegistry, TrackerCommand};
pub(crate) use worker::TrackerTask;
