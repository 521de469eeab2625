//! The confirmation engine.
//!
//! [`ConfirmEngine`] is the tracker service: an explicitly owned object that
//! starts the event subscriber and the retention sweeper, dispatches intents,
//! spawns one tracker per operation and answers status, wait and cancel
//! requests. Dropping it drains like [`ConfirmEngine::shutdown`] with no grace.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, tick, unbounded, Receiver, Sender};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::control::{CanonicalResolver, ControlPlane, EntityResolver, EventFeed, ResolutionError};
use crate::dispatch::{CommandDispatcher, DispatchReport};
use crate::error::{ConfirmError, ConfirmResult, ExecutionError, ValidationError};
use crate::intent::{Action, EntityCommand, Intent};
use crate::predicate::PredicateTable;
use crate::subscriber::{EntityFilter, EventSubscriber, FeedHealth};
use crate::tracker::{
    duration_ms, CorrelationId, OperationHandle, OperationRecord, OperationRegistry, OperationSnapshot, OperationStatus,
    ResolutionReason, TrackerCommand, TrackerTask,
};

/// Extra time a waiting caller allows past the deadline for the tracker to finish.
const WAIT_SLACK: Duration = Duration::from_secs(1);

/// Result of [`ConfirmEngine::dispatch_and_wait`].
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationResult {
    pub correlation_id: CorrelationId,
    /// Entities in the intent.
    pub total_operations: usize,
    /// Entities whose call the control plane accepted.
    pub successful_commands: usize,
    /// Entities whose call failed.
    pub failed_commands: usize,
    /// Whether the caller blocked until resolution.
    pub waited: bool,
    pub dispatch: DispatchReport,
    /// Final snapshot when `waited`, otherwise the snapshot right after dispatch.
    pub operation: OperationSnapshot,
}

impl OperationResult {
    /// Status of the operation at the time of the snapshot.
    #[must_use]
    pub const fn status(&self) -> OperationStatus {
        self.operation.status
    }
}

/// Answer to a cancellation request.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CancelAck {
    pub correlation_id: CorrelationId,
    pub status: OperationStatus,
    /// False when the operation was already terminal.
    pub cancelled: bool,
}

/// One line of a bulk status query.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkEntry {
    pub correlation_id: CorrelationId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<OperationSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Counts over a bulk status query.
///
/// `completed` counts confirmed operations; `failed` counts failed, timed out
/// and cancelled ones.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BulkSummary {
    pub total: usize,
    pub completed: usize,
    pub partial: usize,
    pub failed: usize,
    pub pending: usize,
    pub unknown: usize,
}

/// Result of [`ConfirmEngine::get_bulk_status`].
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkStatus {
    pub summary: BulkSummary,
    /// In request order.
    pub operations: Vec<BulkEntry>,
}

/// What [`ConfirmEngine::shutdown`] did.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Pending operations that resolved on their own within the grace period.
    pub drained: usize,
    /// Pending operations cancelled when the grace period ran out.
    pub cancelled: usize,
}

/// Command dispatch and state confirmation service.
pub struct ConfirmEngine {
    cfg: EngineConfig,
    control: Arc<dyn ControlPlane>,
    resolver: Arc<dyn EntityResolver>,
    subscriber: EventSubscriber,
    dispatcher: CommandDispatcher,
    registry: Arc<OperationRegistry>,
    trackers: Mutex<Vec<JoinHandle<()>>>,
    gc: Mutex<Option<(Sender<()>, JoinHandle<()>)>>,
    shutting_down: AtomicBool,
}

impl std::fmt::Debug for ConfirmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfirmEngine")
            .field("cfg", &self.cfg)
            .field("health", &self.subscriber.health())
            .field("shutting_down", &self.shutting_down.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ConfirmEngine {
    /// Starts an engine that accepts canonical entity ids only.
    ///
    /// # Errors
    /// `Validation(InvalidConfig)` if `cfg` does not validate.
    pub fn start(control: Arc<dyn ControlPlane>, feed: Arc<dyn EventFeed>, cfg: EngineConfig) -> ConfirmResult<Self> {
        Self::with_resolver(control, feed, Arc::new(CanonicalResolver), cfg)
    }

    /// Starts an engine with a custom entity resolver.
    pub fn with_resolver(
        control: Arc<dyn ControlPlane>,
        feed: Arc<dyn EventFeed>,
        resolver: Arc<dyn EntityResolver>,
        cfg: EngineConfig,
    ) -> ConfirmResult<Self> {
        cfg.validate()?;

        let subscriber = EventSubscriber::start(feed, Arc::clone(&control), cfg.subscriber.clone());
        let dispatcher = CommandDispatcher::new(
            Arc::clone(&control),
            PredicateTable::new(cfg.predicates.clone()),
            subscriber.state_cache(),
            cfg.dispatcher.clone(),
        );
        let registry = Arc::new(OperationRegistry::new(cfg.tracker.retention()));
        let gc = spawn_gc(Arc::clone(&registry), cfg.tracker.gc_interval())?;

        info!(
            default_timeout_ms = cfg.tracker.default_timeout_ms,
            retention_ms = cfg.tracker.retention_ms,
            "confirmation engine started"
        );

        Ok(Self {
            cfg,
            control,
            resolver,
            subscriber,
            dispatcher,
            registry,
            trackers: Mutex::new(Vec::new()),
            gc: Mutex::new(Some(gc)),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Dispatches `intent` and tracks it until every entity settles or the
    /// timeout passes.
    ///
    /// With `wait` the call blocks until the operation resolves; otherwise it
    /// returns right after dispatch and the caller polls
    /// [`Self::get_operation_status`] with the returned correlation id.
    ///
    /// # Errors
    /// - `Validation`: empty intent, duplicate target, zero or oversized timeout
    /// - `ControlPlane(Authentication)`: credentials refused
    /// - `Execution(ShuttingDown)`: engine is draining
    pub fn dispatch_and_wait(&self, intent: &Intent, timeout: Option<Duration>, wait: bool) -> ConfirmResult<OperationResult> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(ExecutionError::ShuttingDown.into());
        }
        let timeout = self.cfg.tracker.effective_timeout(timeout)?;
        intent.validate()?;
        if let Some(err) = self.subscriber.fatal_error() {
            return Err(err.into());
        }

        let report = self.dispatcher.dispatch(intent)?;
        let correlation_id = report.correlation_id;
        let record = OperationRecord::new(correlation_id, report.seeds(), timeout);
        let watched = record.watched();

        let (subscription, feed_lost) = if watched.is_empty() {
            (None, None)
        } else {
            match self.subscriber.subscribe(EntityFilter::entities(watched)) {
                Ok(sub) => {
                    let lost = matches!(self.subscriber.health(), FeedHealth::Degraded { .. })
                        .then_some(ResolutionReason::FeedDegraded);
                    (Some(sub), lost)
                }
                Err(err) => {
                    warn!(%correlation_id, error = %err, "could not listen for confirmations");
                    (None, Some(ResolutionReason::FeedFailed))
                }
            }
        };

        let (control_tx, control_rx) = unbounded::<TrackerCommand>();
        let (done_tx, done_rx) = bounded::<()>(0);
        let handle = OperationHandle {
            record: Arc::new(RwLock::new(record)),
            control: control_tx,
            done: done_rx,
        };
        self.registry.insert(correlation_id, handle.clone())?;

        let join = TrackerTask {
            record: Arc::clone(&handle.record),
            subscription,
            feed_lost,
            commands: control_rx,
            control: Arc::clone(&self.control),
            done: done_tx,
        }
        .spawn()?;
        self.track(join);

        if wait {
            wait_done(&handle, timeout + WAIT_SLACK);
        }
        let operation = handle.snapshot()?;

        Ok(OperationResult {
            correlation_id,
            total_operations: report.entities.len(),
            successful_commands: report.acknowledged(),
            failed_commands: report.rejected(),
            waited: wait,
            dispatch: report,
            operation,
        })
    }

    /// Resolves free-text references, then dispatches `action` on every match.
    ///
    /// # Errors
    /// `Validation(UnresolvedReference)` if any reference fails to resolve;
    /// otherwise as [`Self::dispatch_and_wait`].
    pub fn resolve_and_dispatch(
        &self,
        references: &[&str],
        action: &Action,
        parameters: &Map<String, Value>,
        timeout: Option<Duration>,
        wait: bool,
    ) -> ConfirmResult<OperationResult> {
        let mut seen = HashSet::new();
        let mut intent = Intent::new();
        for reference in references {
            let ids = self.resolver.resolve(reference).map_err(|err| unresolved(reference, &err))?;
            for entity_id in ids {
                if seen.insert(entity_id.clone()) {
                    let mut command = EntityCommand::new(entity_id, action.clone());
                    command.parameters = parameters.clone();
                    intent = intent.command(command);
                }
            }
        }
        self.dispatch_and_wait(&intent, timeout, wait)
    }

    /// Non-blocking snapshot of an operation.
    ///
    /// Repeated calls without intervening events return identical snapshots
    /// apart from `elapsed_ms` while pending.
    ///
    /// # Errors
    /// `Execution(UnknownOperation)` for ids never issued or already purged.
    pub fn get_operation_status(&self, id: CorrelationId) -> ConfirmResult<OperationSnapshot> {
        self.registry.snapshot(id)
    }

    /// Blocks up to `max_wait` for an operation to resolve, then snapshots it.
    pub fn wait_operation(&self, id: CorrelationId, max_wait: Duration) -> ConfirmResult<OperationSnapshot> {
        let handle = self.registry.handle(id)?;
        wait_done(&handle, max_wait);
        handle.snapshot()
    }

    /// Cancels a pending operation.
    ///
    /// Pending entities become `cancelled` and later events are ignored.
    /// Commands already sent are not rolled back. Cancelling a terminal
    /// operation changes nothing and reports `cancelled: false`.
    pub fn cancel_operation(&self, id: CorrelationId) -> ConfirmResult<CancelAck> {
        let handle = self.registry.handle(id)?;
        let cancelled = request_cancel(&handle, ResolutionReason::Cancelled);
        let status = handle.snapshot()?.status;
        debug!(correlation_id = %id, %status, cancelled, "cancel requested");
        Ok(CancelAck {
            correlation_id: id,
            status,
            cancelled,
        })
    }

    /// Snapshots several operations at once, with summary counts.
    #[must_use]
    pub fn get_bulk_status(&self, ids: &[CorrelationId]) -> BulkStatus {
        let mut summary = BulkSummary {
            total: ids.len(),
            ..BulkSummary::default()
        };
        let operations = ids
            .iter()
            .map(|&correlation_id| match self.registry.snapshot(correlation_id) {
                Ok(snapshot) => {
                    match snapshot.status {
                        OperationStatus::Pending => summary.pending += 1,
                        OperationStatus::Confirmed => summary.completed += 1,
                        OperationStatus::Partial => summary.partial += 1,
                        OperationStatus::Failed | OperationStatus::TimedOut | OperationStatus::Cancelled => {
                            summary.failed += 1;
                        }
                    }
                    BulkEntry {
                        correlation_id,
                        operation: Some(snapshot),
                        error: None,
                    }
                }
                Err(err) => {
                    summary.unknown += 1;
                    BulkEntry {
                        correlation_id,
                        operation: None,
                        error: Some(err.to_string()),
                    }
                }
            })
            .collect();

        BulkStatus { summary, operations }
    }

    /// Event feed health.
    #[must_use]
    pub fn health(&self) -> FeedHealth {
        self.subscriber.health()
    }

    /// The event subscriber, for diagnostics and direct listening.
    #[must_use]
    pub const fn subscriber(&self) -> &EventSubscriber {
        &self.subscriber
    }

    /// Configuration the engine was started with.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    /// Stops accepting work, waits up to `grace` for pending operations,
    /// cancels the rest, then stops the sweeper and the subscriber.
    ///
    /// Only the first call does anything.
    pub fn shutdown(&self, grace: Duration) -> ConfirmResult<ShutdownReport> {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return Ok(ShutdownReport::default());
        }
        let deadline = Instant::now() + grace;
        let pending = self.registry.pending()?;
        info!(pending = pending.len(), grace_ms = duration_ms(grace), "confirmation engine shutting down");

        let mut report = ShutdownReport::default();
        for (id, handle) in pending {
            wait_done(&handle, deadline.saturating_duration_since(Instant::now()));
            if handle.is_terminal()? {
                report.drained += 1;
            } else if request_cancel(&handle, ResolutionReason::Shutdown) {
                debug!(correlation_id = %id, "cancelled at shutdown");
                report.cancelled += 1;
            } else {
                report.drained += 1;
            }
        }

        let trackers = std::mem::take(&mut *self.trackers.lock().unwrap_or_else(PoisonError::into_inner));
        for join in trackers {
            if join.join().is_err() {
                warn!("tracker thread panicked");
            }
        }

        if let Some((stop, join)) = self.gc.lock().unwrap_or_else(PoisonError::into_inner).take() {
            drop(stop);
            if join.join().is_err() {
                warn!("retention sweeper panicked");
            }
        }

        self.subscriber.shutdown();
        info!(drained = report.drained, cancelled = report.cancelled, "confirmation engine stopped");
        Ok(report)
    }

    fn track(&self, join: JoinHandle<()>) {
        let mut trackers = self.trackers.lock().unwrap_or_else(PoisonError::into_inner);
        trackers.retain(|j| !j.is_finished());
        trackers.push(join);
    }
}

impl Drop for ConfirmEngine {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown(Duration::ZERO) {
            warn!(error = %err, "engine shutdown failed");
        }
    }
}

fn unresolved(reference: &str, err: &ResolutionError) -> ConfirmError {
    ValidationError::UnresolvedReference {
        reference: reference.to_string(),
        reason: err.to_string(),
    }
    .into()
}

/// Blocks until the tracker exits or `budget` passes.
fn wait_done(handle: &OperationHandle, budget: Duration) {
    let _ = handle.done.recv_timeout(budget);
}

/// Asks the owning tracker to cancel. Returns true if this request changed the record.
fn request_cancel(handle: &OperationHandle, reason: ResolutionReason) -> bool {
    let (reply_tx, reply_rx) = bounded(1);
    if handle
        .control
        .send(TrackerCommand::Cancel { reason, reply: reply_tx })
        .is_err()
    {
        return false;
    }
    // `done` only disconnects, once the tracker has exited.
    select! {
        recv(reply_rx) -> changed => changed.unwrap_or(false),
        recv(handle.done) -> _ => reply_rx.try_recv().unwrap_or(false),
    }
}

fn spawn_gc(registry: Arc<OperationRegistry>, interval: Duration) -> ConfirmResult<(Sender<()>, JoinHandle<()>)> {
    let (stop_tx, stop_rx) = bounded::<()>(1);
    let join = thread::Builder::new()
        .name("devconfirm-gc".to_string())
        .spawn(move || gc_loop(&registry, interval, &stop_rx))
        .map_err(|e| ConfirmError::internal(format!("failed to spawn retention sweeper: {e}")))?;
    Ok((stop_tx, join))
}

fn gc_loop(registry: &OperationRegistry, interval: Duration, stop_rx: &Receiver<()>) {
    let ticker = tick(interval);
    loop {
        select! {
            recv(stop_rx) -> _ => return,
            recv(ticker) -> _ => {
                if let Err(err) = registry.purge_expired() {
                    warn!(error = %err, "retention sweep failed");
                }
            },
        }
    }
}
