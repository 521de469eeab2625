use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use chrono::{DateTime, Utc};
use crossbeam_channel::{at, never, select, Receiver, Sender};
use tracing::{debug, error, info, warn};

use crate::control::ControlPlane;
use crate::entity::{EntityId, EntityState};
use crate::error::{lock_err, ConfirmError, ConfirmResult};
use crate::subscriber::{EnvelopeOrigin, FeedSignal, Subscription};

use super::record::{duration_ms, ConfirmationSource, OperationRecord, OperationStatus, ResolutionReason};
use super::registry::TrackerCommand;

/// One operation's waiting loop. Owns the only write access to its record.
pub(crate) struct TrackerTask {
    pub record: Arc<RwLock<OperationRecord>>,
    pub subscription: Option<Subscription>,
    /// Set when the feed was already unusable at dispatch.
    pub feed_lost: Option<ResolutionReason>,
    pub commands: Receiver<TrackerCommand>,
    pub control: Arc<dyn ControlPlane>,
    pub done: Sender<()>,
}

enum Step {
    Continue,
    Finished,
}

impl TrackerTask {
    /// Spawns `devconfirm-tracker-<id>`.
    pub fn spawn(self) -> ConfirmResult<JoinHandle<()>> {
        let name = {
            let record = self.record.read().map_err(|_| lock_err("operation record"))?;
            format!("devconfirm-tracker-{}", record.correlation_id().short())
        };
        thread::Builder::new()
            .name(name)
            .spawn(move || self.run())
            .map_err(|e| ConfirmError::internal(format!("failed to spawn tracker: {e}")))
    }

    fn run(mut self) {
        if let Err(err) = self.drive() {
            error!(error = %err, "tracker stopped on error");
        }
        self.log_resolution();
        // Dropping the subscription unregisters it; dropping `done` wakes waiters.
    }

    fn drive(&mut self) -> ConfirmResult<()> {
        let deadline = self.read(OperationRecord::deadline)?;

        if let Some(mut sub) = self.subscription.take() {
            let initial = sub.take_initial_states();
            self.subscription = Some(sub);
            for (entity_id, state) in initial {
                let at = state.last_changed;
                if self.observe(&entity_id, &state, ConfirmationSource::CachedState, at)?.is_none() {
                    return Ok(());
                }
            }
        }
        if self.settle()? {
            return Ok(());
        }
        if let Some(reason) = self.feed_lost {
            warn!(?reason, "no live feed at dispatch; reconciling and resolving early");
            self.reconcile_and_expire(reason)?;
            return Ok(());
        }

        loop {
            let feed = self.subscription.as_ref().map_or_else(never, |s| s.receiver().clone());
            let step = select! {
                recv(feed) -> signal => match signal {
                    Ok(signal) => self.on_signal(signal)?,
                    Err(_) => {
                        warn!("event subscriber went away; cancelling operation");
                        self.write(|r| r.cancel(ResolutionReason::Shutdown))??;
                        Step::Finished
                    }
                },
                recv(self.commands) -> cmd => match cmd {
                    Ok(TrackerCommand::Cancel { reason, reply }) => {
                        let changed = self.write(|r| r.cancel(reason))??;
                        let _ = reply.send(changed);
                        Step::Finished
                    }
                    Err(_) => {
                        self.write(|r| r.cancel(ResolutionReason::Shutdown))??;
                        Step::Finished
                    }
                },
                recv(at(deadline)) -> _ => {
                    self.write(|r| r.expire(ResolutionReason::DeadlineReached))??;
                    Step::Finished
                },
            };
            if matches!(step, Step::Finished) {
                return Ok(());
            }
        }
    }

    fn on_signal(&self, signal: FeedSignal) -> ConfirmResult<Step> {
        match signal {
            FeedSignal::Event(env) => {
                let source = match env.origin {
                    EnvelopeOrigin::Live => ConfirmationSource::Event,
                    EnvelopeOrigin::Resync => ConfirmationSource::Resync,
                };
                let Some(changed) = self.observe(&env.entity_id, &env.state, source, env.observed_at)? else {
                    return Ok(Step::Finished);
                };
                if changed {
                    debug!(entity = %env.entity_id, state = %env.state.state, ?source, "entity outcome changed");
                }
                Ok(if self.settle()? { Step::Finished } else { Step::Continue })
            }
            FeedSignal::SequenceGap { .. } | FeedSignal::Recovered { .. } => Ok(Step::Continue),
            FeedSignal::Degraded { attempts, .. } => {
                warn!(attempts, "event feed degraded; reconciling and resolving early");
                self.reconcile_and_expire(ResolutionReason::FeedDegraded)?;
                Ok(Step::Finished)
            }
            FeedSignal::Fatal { error } => {
                warn!(error = %error, "event feed failed; reconciling and resolving early");
                self.reconcile_and_expire(ResolutionReason::FeedFailed)?;
                Ok(Step::Finished)
            }
        }
    }

    /// One direct read per pending entity, then resolve without waiting further.
    fn reconcile_and_expire(&self, reason: ResolutionReason) -> ConfirmResult<()> {
        let pending = self.read(OperationRecord::pending)?;
        let observed: Vec<(EntityId, EntityState)> = pending
            .into_iter()
            .filter_map(|id| match self.control.get_state(&id) {
                Ok(state) => state.map(|s| (id, s)),
                Err(err) => {
                    debug!(entity = %id, error = %err, "reconciliation read failed");
                    None
                }
            })
            .collect();

        self.write(|r| {
            if r.is_overdue(Instant::now()) {
                return r.expire(ResolutionReason::DeadlineReached);
            }
            let now = Utc::now();
            for (id, state) in &observed {
                r.observe(id, state, ConfirmationSource::Reconciliation, now);
            }
            r.expire(reason)
        })??;
        Ok(())
    }

    /// Evaluates one observation, unless the deadline has passed.
    ///
    /// Past the deadline the record expires instead and `None` is returned.
    fn observe(
        &self,
        entity_id: &EntityId,
        state: &EntityState,
        source: ConfirmationSource,
        at: DateTime<Utc>,
    ) -> ConfirmResult<Option<bool>> {
        let observed = self.write(|r| {
            if r.is_overdue(Instant::now()) {
                r.expire(ResolutionReason::DeadlineReached).map(|_| None)
            } else {
                Ok(Some(r.observe(entity_id, state, source, at)))
            }
        })??;
        if observed.is_none() {
            debug!(entity = %entity_id, ?source, "observation arrived after the deadline; ignored");
        }
        Ok(observed)
    }

    fn settle(&self) -> ConfirmResult<bool> {
        Ok(self.write(OperationRecord::try_settle)??.is_some())
    }

    fn read<T>(&self, f: impl FnOnce(&OperationRecord) -> T) -> ConfirmResult<T> {
        let record = self.record.read().map_err(|_| lock_err("operation record"))?;
        Ok(f(&record))
    }

    fn write<T>(&self, f: impl FnOnce(&mut OperationRecord) -> T) -> ConfirmResult<T> {
        let mut record = self.record.write().map_err(|_| lock_err("operation record"))?;
        Ok(f(&mut record))
    }

    fn log_resolution(&self) {
        let Ok(record) = self.record.read() else {
            return;
        };
        let counts = record.snapshot().counts;
        let elapsed_ms = duration_ms(record.elapsed());
        let correlation_id = record.correlation_id();
        let status = record.status();
        let reason = record.reason();
        match status {
            OperationStatus::Confirmed => info!(%correlation_id, %status, ?reason, elapsed_ms, total = counts.total, "operation resolved"),
            OperationStatus::Pending => error!(%correlation_id, elapsed_ms, "tracker exited with operation pending"),
            _ => warn!(
                %correlation_id,
                %status,
                ?reason,
                elapsed_ms,
                confirmed = counts.confirmed,
                total = counts.total,
                "operation resolved"
            ),
        }
    }
}

impl std::fmt::Debug for TrackerTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackerTask").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crossbeam_channel::{bounded, unbounded};

    use crate::control::memory::SimulatedHome;
    use crate::control::CallAck;
    use crate::predicate::StatePredicate;
    use crate::subscriber::{EntityFilter, EventEnvelope, SubscriptionId};
    use crate::tracker::{CorrelationId, EntityOutcome, TargetSeed};

    fn id(s: &str) -> EntityId {
        EntityId::parse(s).unwrap()
    }

    struct Harness {
        task: TrackerTask,
        record: Arc<RwLock<OperationRecord>>,
        signals: Sender<FeedSignal>,
        _commands: Sender<TrackerCommand>,
        _done: Receiver<()>,
    }

    fn harness(
        home: &SimulatedHome,
        timeout: Duration,
        initial: Vec<(EntityId, EntityState)>,
        feed_lost: Option<ResolutionReason>,
    ) -> Harness {
        let target = id("light.a");
        let seed = TargetSeed::Awaiting {
            predicate: StatePredicate::state("on"),
            ack: CallAck::now(None),
        };
        let record = Arc::new(RwLock::new(OperationRecord::new(
            CorrelationId::new(),
            vec![(target.clone(), seed)],
            timeout,
        )));
        let (signals, signal_rx) = unbounded();
        let (control_tx, _) = unbounded();
        let subscription = Subscription::new(
            SubscriptionId::new(),
            EntityFilter::entities([target]),
            signal_rx,
            initial,
            control_tx,
        );
        let (commands_tx, commands) = unbounded();
        let (done, done_rx) = bounded(0);

        Harness {
            task: TrackerTask {
                record: Arc::clone(&record),
                subscription: Some(subscription),
                feed_lost,
                commands,
                control: Arc::new(home.clone()),
                done,
            },
            record,
            signals,
            _commands: commands_tx,
            _done: done_rx,
        }
    }

    fn turned_on(origin: EnvelopeOrigin) -> FeedSignal {
        FeedSignal::Event(EventEnvelope {
            entity_id: id("light.a"),
            state: EntityState::new("on"),
            observed_at: Utc::now(),
            connection_epoch: 1,
            sequence: 1,
            origin,
        })
    }

    fn assert_timed_out(record: &RwLock<OperationRecord>) {
        let record = record.read().unwrap();
        assert_eq!(record.status(), OperationStatus::TimedOut);
        assert_eq!(record.reason(), Some(ResolutionReason::DeadlineReached));
        assert_eq!(record.outcome(&id("light.a")), Some(&EntityOutcome::Unconfirmed));
    }

    #[test]
    fn matching_event_before_the_deadline_confirms() {
        let home = SimulatedHome::new();
        let h = harness(&home, Duration::from_secs(5), Vec::new(), None);
        h.signals.send(turned_on(EnvelopeOrigin::Live)).unwrap();
        h.task.run();

        let record = h.record.read().unwrap();
        assert_eq!(record.status(), OperationStatus::Confirmed);
        assert!(record.outcome(&id("light.a")).unwrap().is_confirmed());
    }

    #[test]
    fn events_queued_past_the_deadline_never_confirm() {
        let home = SimulatedHome::new();
        // The select picks among ready branches at random; repeat to cover both orders.
        for origin in [EnvelopeOrigin::Live, EnvelopeOrigin::Resync].repeat(20) {
            let h = harness(&home, Duration::from_millis(1), Vec::new(), None);
            thread::sleep(Duration::from_millis(5));
            h.signals.send(turned_on(origin)).unwrap();
            h.task.run();
            assert_timed_out(&h.record);
        }
    }

    #[test]
    fn cached_state_past_the_deadline_does_not_confirm() {
        let home = SimulatedHome::new();
        let initial = vec![(id("light.a"), EntityState::new("on"))];
        let h = harness(&home, Duration::from_millis(1), initial, None);
        thread::sleep(Duration::from_millis(5));
        h.task.run();
        assert_timed_out(&h.record);
    }

    #[test]
    fn reconciliation_past_the_deadline_does_not_confirm() {
        let home = SimulatedHome::new().with_entity(&id("light.a"), EntityState::new("on"));
        let h = harness(&home, Duration::from_millis(1), Vec::new(), Some(ResolutionReason::FeedDegraded));
        thread::sleep(Duration::from_millis(5));
        h.task.run();
        assert_timed_out(&h.record);
    }

    #[test]
    fn reconciliation_before_the_deadline_confirms() {
        let home = SimulatedHome::new().with_entity(&id("light.a"), EntityState::new("on"));
        let h = harness(&home, Duration::from_secs(5), Vec::new(), Some(ResolutionReason::FeedDegraded));
        h.task.run();

        let record = h.record.read().unwrap();
        assert_eq!(record.status(), OperationStatus::Confirmed);
        assert!(matches!(
            record.outcome(&id("light.a")),
            Some(EntityOutcome::Confirmed {
                source: ConfirmationSource::Reconciliation,
                ..
            })
        ));
    }
}
