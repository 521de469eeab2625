use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::entity::{EntityId, EntityState};
use crate::error::{ConfirmError, ConfirmResult, ExecutionError};

use super::envelope::{EntityFilter, FeedSignal, SubscriptionId};
use super::worker::ControlMsg;

/// A listener registration on the event subscriber.
///
/// Signals arrive in feed order on an unbounded queue, so a slow reader never
/// loses events. Dropping the handle unregisters it.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    filter: EntityFilter,
    rx: Receiver<FeedSignal>,
    initial: Vec<(EntityId, EntityState)>,
    control_tx: Sender<ControlMsg>,
    unregistered: AtomicBool,
}

impl Subscription {
    pub(crate) fn new(
        id: SubscriptionId,
        filter: EntityFilter,
        rx: Receiver<FeedSignal>,
        initial: Vec<(EntityId, EntityState)>,
        control_tx: Sender<ControlMsg>,
    ) -> Self {
        Self {
            id,
            filter,
            rx,
            initial,
            control_tx,
            unregistered: AtomicBool::new(false),
        }
    }

    /// The id backing this subscription.
    #[must_use]
    pub const fn id(&self) -> SubscriptionId {
        self.id
    }

    /// The filter this subscription was registered with.
    #[must_use]
    pub const fn filter(&self) -> &EntityFilter {
        &self.filter
    }

    /// Cached states of the named entities at the instant of registration.
    ///
    /// Everything after that instant arrives on the stream, so evaluating these
    /// first and then the stream never misses a change.
    #[must_use]
    pub fn initial_states(&self) -> &[(EntityId, EntityState)] {
        &self.initial
    }

    /// Takes the initial states, leaving an empty list.
    pub fn take_initial_states(&mut self) -> Vec<(EntityId, EntityState)> {
        std::mem::take(&mut self.initial)
    }

    /// The underlying receiver, for use in `select!`.
    #[must_use]
    pub const fn receiver(&self) -> &Receiver<FeedSignal> {
        &self.rx
    }

    /// Best-effort explicit unregistration. Non-blocking and idempotent.
    pub fn unsubscribe(&self) {
        if self.unregistered.swap(true, Ordering::AcqRel) {
            return;
        }

        let _ = self.control_tx.try_send(ControlMsg::Unregister { subscription_id: self.id });
    }

    /// Receive the next signal (blocking).
    pub fn recv(&self) -> ConfirmResult<FeedSignal> {
        self.rx.recv().map_err(|_| disconnected())
    }

    /// Receive the next signal with a timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> ConfirmResult<FeedSignal> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => ConfirmError::Execution(ExecutionError::Timeout {
                duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
            RecvTimeoutError::Disconnected => disconnected(),
        })
    }

    /// Non-blocking receive. `Ok(None)` when nothing is queued.
    pub fn try_recv(&self) -> ConfirmResult<Option<FeedSignal>> {
        match self.rx.try_recv() {
            Ok(signal) => Ok(Some(signal)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(disconnected()),
        }
    }
}

fn disconnected() -> ConfirmError {
    ConfirmError::Execution(ExecutionError::Disconnected {
        path: "subscription".to_string(),
    })
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // Best-effort: do not block on shutdown.
        self.unsubscribe();
    }
}
