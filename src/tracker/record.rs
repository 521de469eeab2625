use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::control::CallAck;
use crate::entity::{EntityId, EntityState};
use crate::error::ExecutionError;
use crate::predicate::StatePredicate;

/// Identifier returned by dispatch and used for status queries and cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Creates a new random correlation id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub(crate) fn short(&self) -> String {
        let mut s = self.0.simple().to_string();
        s.truncate(8);
        s
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CorrelationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Overall status of an operation.
///
/// `Pending` is the only non-terminal status. Every other status is final.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    /// Every entity reached its expected state.
    Confirmed,
    /// Some entities confirmed, some did not.
    Partial,
    /// No entity confirmed and none is still pending.
    Failed,
    /// The deadline passed with nothing confirmed.
    TimedOut,
    Cancelled,
}

impl OperationStatus {
    /// Returns true for every status except `Pending`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Snake-case name, as serialized.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }

    /// Validates a status change.
    ///
    /// The only legal moves are `Pending` to a terminal status.
    ///
    /// # Errors
    /// `IllegalTransition` for anything else, including terminal to terminal.
    pub fn transition(self, to: Self) -> Result<Self, ExecutionError> {
        if self == Self::Pending && to.is_terminal() {
            Ok(to)
        } else {
            Err(ExecutionError::IllegalTransition { from: self, to })
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What produced the observation that confirmed an entity.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationSource {
    /// Last-known state handed over at registration.
    CachedState,
    Event,
    Resync,
    /// Read issued by the tracker after the feed degraded.
    Reconciliation,
}

/// Per-entity outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EntityOutcome {
    /// Waiting for an observation that satisfies the predicate.
    Pending,
    /// Last observation satisfied the predicate.
    Confirmed {
        /// Where that observation came from.
        source: ConfirmationSource,
        /// When it was observed.
        at: DateTime<Utc>,
    },
    /// The call for this entity failed before any waiting started.
    Failed {
        /// Why.
        reason: String,
    },
    /// The operation ended before the entity was confirmed.
    Unconfirmed,
    /// The operation was cancelled while the entity was pending.
    Cancelled,
}

impl EntityOutcome {
    /// Returns true while the entity still waits.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    /// Returns true if the entity is confirmed.
    #[must_use]
    pub const fn is_confirmed(&self) -> bool {
        matches!(self, Self::Confirmed { .. })
    }
}

/// Why an operation reached its terminal status.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionReason {
    /// No entity was left pending.
    AllSettled,
    DeadlineReached,
    Cancelled,
    /// The event feed stopped reconnecting within its retry budget.
    FeedDegraded,
    /// The event feed failed permanently.
    FeedFailed,
    Shutdown,
}

/// How one target enters a new record.
#[derive(Debug, Clone, PartialEq)]
pub enum TargetSeed {
    /// The call was accepted; wait for `predicate`.
    Awaiting {
        /// Expected state.
        predicate: StatePredicate,
        /// Control-plane acknowledgment.
        ack: CallAck,
    },
    /// The call failed; the entity starts out `failed`.
    Rejected {
        /// Why.
        reason: String,
    },
}

/// Tally of entity outcomes.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub total: usize,
    pub confirmed: usize,
    pub pending: usize,
    pub failed: usize,
    pub unconfirmed: usize,
    pub cancelled: usize,
}

impl OutcomeCounts {
    fn tally<'a>(outcomes: impl IntoIterator<Item = &'a EntityOutcome>) -> Self {
        outcomes.into_iter().fold(Self::default(), |mut c, o| {
            c.total += 1;
            match o {
                EntityOutcome::Pending => c.pending += 1,
                EntityOutcome::Confirmed { .. } => c.confirmed += 1,
                EntityOutcome::Failed { .. } => c.failed += 1,
                EntityOutcome::Unconfirmed => c.unconfirmed += 1,
                EntityOutcome::Cancelled => c.cancelled += 1,
            }
            c
        })
    }
}

/// One entity's line in a snapshot.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityReport {
    pub entity_id: EntityId,
    pub outcome: EntityOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<StatePredicate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_observed: Option<EntityState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<CallAck>,
}

/// Point-in-time copy of an operation record.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationSnapshot {
    pub correlation_id: CorrelationId,
    pub status: OperationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<ResolutionReason>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    pub timeout_ms: u64,
    pub elapsed_ms: u64,
    /// In target order.
    pub entities: Vec<EntityReport>,
    pub counts: OutcomeCounts,
}

impl OperationSnapshot {
    /// Report for one entity.
    #[must_use]
    pub fn entity(&self, entity_id: &EntityId) -> Option<&EntityReport> {
        self.entities.iter().find(|e| e.entity_id == *entity_id)
    }

    /// Outcome for one entity.
    #[must_use]
    pub fn outcome(&self, entity_id: &EntityId) -> Option<&EntityOutcome> {
        self.entity(entity_id).map(|e| &e.outcome)
    }
}

/// Status once nothing is pending: all confirmed, none confirmed, or a mix.
fn settle_status(counts: &OutcomeCounts) -> OperationStatus {
    if counts.confirmed == counts.total {
        OperationStatus::Confirmed
    } else if counts.confirmed == 0 {
        OperationStatus::Failed
    } else {
        OperationStatus::Partial
    }
}

/// Everything known about one dispatched operation.
///
/// The outcome map always has exactly the targets as keys: construction
/// creates one entry per target and every later change updates an existing
/// entry. Status changes go through [`OperationStatus::transition`], so a
/// terminal record never changes again.
#[derive(Debug, Clone)]
pub struct OperationRecord {
    correlation_id: CorrelationId,
    targets: Vec<EntityId>,
    expectations: BTreeMap<EntityId, StatePredicate>,
    acks: BTreeMap<EntityId, CallAck>,
    outcomes: BTreeMap<EntityId, EntityOutcome>,
    last_observed: BTreeMap<EntityId, EntityState>,
    status: OperationStatus,
    reason: Option<ResolutionReason>,
    created_at: DateTime<Utc>,
    created_mono: Instant,
    timeout: Duration,
    resolved_at: Option<DateTime<Utc>>,
    resolved_mono: Option<Instant>,
}

impl OperationRecord {
    /// Creates a pending record. A repeated target keeps its first seed.
    #[must_use]
    pub fn new(correlation_id: CorrelationId, seeds: Vec<(EntityId, TargetSeed)>, timeout: Duration) -> Self {
        let mut targets = Vec::with_capacity(seeds.len());
        let mut expectations = BTreeMap::new();
        let mut acks = BTreeMap::new();
        let mut outcomes = BTreeMap::new();

        for (entity_id, seed) in seeds {
            if outcomes.contains_key(&entity_id) {
                continue;
            }
            let outcome = match seed {
                TargetSeed::Awaiting { predicate, ack } => {
                    expectations.insert(entity_id.clone(), predicate);
                    acks.insert(entity_id.clone(), ack);
                    EntityOutcome::Pending
                }
                TargetSeed::Rejected { reason } => EntityOutcome::Failed { reason },
            };
            outcomes.insert(entity_id.clone(), outcome);
            targets.push(entity_id);
        }

        Self {
            correlation_id,
            targets,
            expectations,
            acks,
            outcomes,
            last_observed: BTreeMap::new(),
            status: OperationStatus::Pending,
            reason: None,
            created_at: Utc::now(),
            created_mono: Instant::now(),
            timeout,
            resolved_at: None,
            resolved_mono: None,
        }
    }

    #[must_use]
    pub const fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    #[must_use]
    pub const fn status(&self) -> OperationStatus {
        self.status
    }

    #[must_use]
    pub const fn reason(&self) -> Option<ResolutionReason> {
        self.reason
    }

    /// Targets in dispatch order.
    #[must_use]
    pub fn targets(&self) -> &[EntityId] {
        &self.targets
    }

    #[must_use]
    pub fn outcome(&self, entity_id: &EntityId) -> Option<&EntityOutcome> {
        self.outcomes.get(entity_id)
    }

    /// Outcome keys, sorted.
    pub fn outcome_keys(&self) -> impl Iterator<Item = &EntityId> {
        self.outcomes.keys()
    }

    /// Entities that have an expectation and are watched for events.
    #[must_use]
    pub fn watched(&self) -> Vec<EntityId> {
        self.targets
            .iter()
            .filter(|id| self.expectations.contains_key(*id))
            .cloned()
            .collect()
    }

    /// Entities still pending, in target order.
    #[must_use]
    pub fn pending(&self) -> Vec<EntityId> {
        self.targets
            .iter()
            .filter(|id| self.outcomes.get(*id).is_some_and(EntityOutcome::is_pending))
            .cloned()
            .collect()
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Monotonic instant at which the operation times out.
    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.created_mono + self.timeout
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns true once `now` has reached the deadline.
    #[must_use]
    pub fn is_overdue(&self, now: Instant) -> bool {
        now >= self.deadline()
    }

    /// Returns true once the record has been terminal for at least `retention`.
    #[must_use]
    pub fn is_expired(&self, retention: Duration, now: Instant) -> bool {
        self.resolved_mono
            .is_some_and(|t| now.saturating_duration_since(t) >= retention)
    }

    /// Evaluates an observation. Returns true if the entity's outcome changed.
    ///
    /// A matching observation confirms a pending entity. While the operation
    /// is pending, a non-matching observation returns a confirmed entity to
    /// pending. Observations after resolution, and for entities without an
    /// expectation, are ignored.
    pub fn observe(
        &mut self,
        entity_id: &EntityId,
        state: &EntityState,
        source: ConfirmationSource,
        at: DateTime<Utc>,
    ) -> bool {
        if self.is_terminal() {
            return false;
        }
        let Some(predicate) = self.expectations.get(entity_id) else {
            return false;
        };
        let satisfied = predicate.is_satisfied_by(state);
        self.last_observed.insert(entity_id.clone(), state.clone());

        let Some(outcome) = self.outcomes.get_mut(entity_id) else {
            return false;
        };
        if outcome.is_pending() && satisfied {
            *outcome = EntityOutcome::Confirmed { source, at };
            true
        } else if outcome.is_confirmed() && !satisfied {
            *outcome = EntityOutcome::Pending;
            true
        } else {
            false
        }
    }

    /// Resolves the record if no entity is pending. Returns the new status, if any.
    pub fn try_settle(&mut self) -> Result<Option<OperationStatus>, ExecutionError> {
        if self.is_terminal() {
            return Ok(None);
        }
        let counts = OutcomeCounts::tally(self.outcomes.values());
        if counts.pending > 0 {
            return Ok(None);
        }
        let status = settle_status(&counts);
        self.resolve(status, ResolutionReason::AllSettled)?;
        Ok(Some(status))
    }

    /// Ends waiting: pending entities become `unconfirmed`.
    ///
    /// With anything confirmed the result is `partial`. Otherwise it is
    /// `timed_out` at the deadline and `failed` when the feed was lost. A
    /// record with nothing pending settles normally instead. Already-terminal
    /// records are returned unchanged.
    pub fn expire(&mut self, reason: ResolutionReason) -> Result<OperationStatus, ExecutionError> {
        if let Some(status) = self.try_settle()? {
            return Ok(status);
        }
        if self.is_terminal() {
            return Ok(self.status);
        }

        for outcome in self.outcomes.values_mut() {
            if outcome.is_pending() {
                *outcome = EntityOutcome::Unconfirmed;
            }
        }
        let counts = OutcomeCounts::tally(self.outcomes.values());
        let status = if counts.confirmed > 0 {
            OperationStatus::Partial
        } else if reason == ResolutionReason::DeadlineReached {
            OperationStatus::TimedOut
        } else {
            OperationStatus::Failed
        };
        self.resolve(status, reason)?;
        Ok(status)
    }

    /// Cancels a pending record. Returns false if it was already terminal.
    ///
    /// Pending entities become `cancelled`; confirmed and failed entities keep
    /// their outcome.
    pub fn cancel(&mut self, reason: ResolutionReason) -> Result<bool, ExecutionError> {
        if self.is_terminal() {
            return Ok(false);
        }
        for outcome in self.outcomes.values_mut() {
            if outcome.is_pending() {
                *outcome = EntityOutcome::Cancelled;
            }
        }
        self.resolve(OperationStatus::Cancelled, reason)?;
        Ok(true)
    }

    fn resolve(&mut self, to: OperationStatus, reason: ResolutionReason) -> Result<(), ExecutionError> {
        self.status = self.status.transition(to)?;
        self.reason = Some(reason);
        self.resolved_at = Some(Utc::now());
        self.resolved_mono = Some(Instant::now());
        Ok(())
    }

    /// Milliseconds from creation to resolution, or to now while pending.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.resolved_mono
            .unwrap_or_else(Instant::now)
            .saturating_duration_since(self.created_mono)
    }

    /// Copies the record into a serializable snapshot.
    #[must_use]
    pub fn snapshot(&self) -> OperationSnapshot {
        let entities = self
            .targets
            .iter()
            .map(|id| EntityReport {
                entity_id: id.clone(),
                outcome: self.outcomes.get(id).cloned().unwrap_or(EntityOutcome::Pending),
                expected: self.expectations.get(id).cloned(),
                last_observed: self.last_observed.get(id).cloned(),
                ack: self.acks.get(id).cloned(),
            })
            .collect();

        OperationSnapshot {
            correlation_id: self.correlation_id,
            status: self.status,
            reason: self.reason,
            created_at: self.created_at,
            resolved_at: self.resolved_at,
            timeout_ms: duration_ms(self.timeout),
            elapsed_ms: duration_ms(self.elapsed()),
            entities,
            counts: OutcomeCounts::tally(self.outcomes.values()),
        }
    }
}

pub(crate) fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> EntityId {
        EntityId::parse(s).unwrap()
    }

    fn awaiting(state: &str) -> TargetSeed {
        TargetSeed::Awaiting {
            predicate: StatePredicate::state(state),
            ack: CallAck::now(None),
        }
    }

    fn record(seeds: Vec<(&str, TargetSeed)>) -> OperationRecord {
        OperationRecord::new(
            CorrelationId::new(),
            seeds.into_iter().map(|(e, s)| (id(e), s)).collect(),
            Duration::from_secs(5),
        )
    }

    fn see(r: &mut OperationRecord, entity: &str, state: &str) -> bool {
        r.observe(&id(entity), &EntityState::new(state), ConfirmationSource::Event, Utc::now())
    }

    #[test]
    fn transition_only_from_pending() {
        assert_eq!(
            OperationStatus::Pending.transition(OperationStatus::Confirmed).unwrap(),
            OperationStatus::Confirmed
        );
        assert!(OperationStatus::Pending.transition(OperationStatus::Pending).is_err());
        assert!(OperationStatus::Confirmed.transition(OperationStatus::Partial).is_err());
        assert!(OperationStatus::TimedOut.transition(OperationStatus::Cancelled).is_err());
    }

    #[test]
    fn all_confirmed_resolves_confirmed() {
        let mut r = record(vec![("light.a", awaiting("on")), ("light.b", awaiting("on"))]);
        assert!(see(&mut r, "light.a", "on"));
        assert_eq!(r.try_settle().unwrap(), None);
        assert!(see(&mut r, "light.b", "on"));
        assert_eq!(r.try_settle().unwrap(), Some(OperationStatus::Confirmed));
        assert_eq!(r.reason(), Some(ResolutionReason::AllSettled));
    }

    #[test]
    fn rejected_plus_confirmed_is_partial() {
        let mut r = record(vec![
            ("light.a", awaiting("on")),
            (
                "light.b",
                TargetSeed::Rejected {
                    reason: "device_unavailable".to_string(),
                },
            ),
        ]);
        see(&mut r, "light.a", "on");
        assert_eq!(r.try_settle().unwrap(), Some(OperationStatus::Partial));
    }

    #[test]
    fn all_rejected_settles_failed_immediately() {
        let mut r = record(vec![(
            "lock.front",
            TargetSeed::Rejected {
                reason: "no".to_string(),
            },
        )]);
        assert_eq!(r.try_settle().unwrap(), Some(OperationStatus::Failed));
    }

    #[test]
    fn confirmation_is_revoked_by_later_mismatch() {
        let mut r = record(vec![("switch.a", awaiting("on")), ("switch.b", awaiting("on"))]);
        see(&mut r, "switch.a", "on");
        assert!(r.outcome(&id("switch.a")).unwrap().is_confirmed());
        see(&mut r, "switch.a", "off");
        assert!(r.outcome(&id("switch.a")).unwrap().is_pending());
    }

    #[test]
    fn deadline_with_nothing_confirmed_times_out() {
        let mut r = record(vec![("light.a", awaiting("on"))]);
        see(&mut r, "light.a", "off");
        assert_eq!(r.expire(ResolutionReason::DeadlineReached).unwrap(), OperationStatus::TimedOut);
        assert_eq!(r.outcome(&id("light.a")), Some(&EntityOutcome::Unconfirmed));
    }

    #[test]
    fn deadline_with_some_confirmed_is_partial() {
        let mut r = record(vec![("light.a", awaiting("on")), ("light.b", awaiting("on"))]);
        see(&mut r, "light.a", "on");
        assert_eq!(r.expire(ResolutionReason::DeadlineReached).unwrap(), OperationStatus::Partial);
    }

    #[test]
    fn lost_feed_without_confirmations_fails() {
        let mut r = record(vec![("light.a", awaiting("on"))]);
        assert_eq!(r.expire(ResolutionReason::FeedDegraded).unwrap(), OperationStatus::Failed);
        assert_eq!(r.reason(), Some(ResolutionReason::FeedDegraded));
    }

    #[test]
    fn terminal_record_ignores_everything() {
        let mut r = record(vec![("light.a", awaiting("on"))]);
        assert!(r.cancel(ResolutionReason::Cancelled).unwrap());
        assert_eq!(r.status(), OperationStatus::Cancelled);
        assert_eq!(r.outcome(&id("light.a")), Some(&EntityOutcome::Cancelled));

        assert!(!see(&mut r, "light.a", "on"));
        assert!(!r.cancel(ResolutionReason::Cancelled).unwrap());
        assert_eq!(r.expire(ResolutionReason::DeadlineReached).unwrap(), OperationStatus::Cancelled);
        assert_eq!(r.status(), OperationStatus::Cancelled);
    }

    #[test]
    fn snapshot_keeps_target_order_and_counts() {
        let mut r = record(vec![
            ("switch.z", awaiting("on")),
            ("switch.a", awaiting("on")),
            ("switch.a", awaiting("off")),
        ]);
        assert_eq!(r.targets().len(), 2);
        see(&mut r, "switch.a", "on");
        let snap = r.snapshot();
        assert_eq!(snap.entities[0].entity_id, id("switch.z"));
        assert_eq!(snap.counts.total, 2);
        assert_eq!(snap.counts.confirmed, 1);
        assert_eq!(snap.counts.pending, 1);
        assert_eq!(snap.entity(&id("switch.a")).unwrap().last_observed.as_ref().unwrap().state, "on");
    }

    #[test]
    fn expiry_is_measured_from_resolution() {
        let mut r = record(vec![("light.a", awaiting("on"))]);
        let now = Instant::now();
        assert!(!r.is_expired(Duration::ZERO, now));
        r.cancel(ResolutionReason::Cancelled).unwrap();
        assert!(r.is_expired(Duration::ZERO, Instant::now()));
        assert!(!r.is_expired(Duration::from_secs(60), Instant::now()));
    }

    #[test]
    fn overdue_from_the_deadline_on() {
        let r = record(vec![("light.a", awaiting("on"))]);
        assert!(!r.is_overdue(Instant::now()));
        assert!(r.is_overdue(r.deadline()));
    }

    #[test]
    fn duration_ms_saturates() {
        assert_eq!(duration_ms(Duration::from_millis(1_500)), 1_500);
        assert_eq!(duration_ms(Duration::MAX), u64::MAX);
    }

    #[test]
    fn correlation_id_parses_display() {
        let a = CorrelationId::new();
        let b: CorrelationId = a.to_string().parse().unwrap();
        assert_eq!(a, b);
        assert!("not-a-uuid".parse::<CorrelationId>().is_err());
    }
}
