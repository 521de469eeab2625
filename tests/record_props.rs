//! Property tests for operation record invariants.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::Utc;
use proptest::prelude::*;

use devconfirm::tracker::{OperationRecord, TargetSeed};
use devconfirm::{
    CallAck, ConfirmationSource, CorrelationId, EntityId, EntityOutcome, EntityState, OperationStatus,
    ResolutionReason, StatePredicate,
};

#[derive(Debug, Clone)]
enum Step {
    Observe { target: usize, on: bool },
    Settle,
    Expire(ResolutionReason),
    Cancel,
}

fn arb_entity() -> impl Strategy<Value = EntityId> {
    (prop::sample::select(vec!["light", "switch", "fan"]), "[a-z][a-z0-9_]{0,6}")
        .prop_map(|(domain, object)| EntityId::parse(&format!("{domain}.{object}")).unwrap())
}

fn arb_seed() -> impl Strategy<Value = (EntityId, TargetSeed)> {
    (arb_entity(), any::<bool>()).prop_map(|(id, accepted)| {
        let seed = if accepted {
            TargetSeed::Awaiting {
                predicate: StatePredicate::state("on"),
                ack: CallAck::now(None),
            }
        } else {
            TargetSeed::Rejected {
                reason: "device_unavailable".to_string(),
            }
        };
        (id, seed)
    })
}

fn arb_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        6 => (0usize..8, any::<bool>()).prop_map(|(target, on)| Step::Observe { target, on }),
        2 => Just(Step::Settle),
        1 => prop::sample::select(vec![
            ResolutionReason::DeadlineReached,
            ResolutionReason::FeedDegraded,
            ResolutionReason::FeedFailed,
        ])
        .prop_map(Step::Expire),
        1 => Just(Step::Cancel),
    ]
}

fn apply(record: &mut OperationRecord, step: &Step) {
    match step {
        Step::Observe { target, on } => {
            let targets = record.targets().to_vec();
            if let Some(id) = targets.get(target % targets.len().max(1)) {
                let state = EntityState::new(if *on { "on" } else { "off" });
                record.observe(id, &state, ConfirmationSource::Event, Utc::now());
            }
        }
        Step::Settle => {
            record.try_settle().unwrap();
        }
        Step::Expire(reason) => {
            record.expire(*reason).unwrap();
        }
        Step::Cancel => {
            record.cancel(ResolutionReason::Cancelled).unwrap();
        }
    }
}

proptest! {
    #[test]
    fn outcome_keys_always_equal_targets(
        seeds in prop::collection::vec(arb_seed(), 1..8),
        steps in prop::collection::vec(arb_step(), 0..24),
    ) {
        let mut record = OperationRecord::new(CorrelationId::new(), seeds.clone(), Duration::from_secs(5));
        let expected: BTreeSet<EntityId> = seeds.into_iter().map(|(id, _)| id).collect();

        for step in &steps {
            apply(&mut record, step);
            let keys: BTreeSet<EntityId> = record.outcome_keys().cloned().collect();
            prop_assert_eq!(&keys, &expected);
            prop_assert_eq!(record.targets().len(), expected.len());
        }
    }

    #[test]
    fn terminal_records_never_change(
        seeds in prop::collection::vec(arb_seed(), 1..8),
        steps in prop::collection::vec(arb_step(), 0..24),
    ) {
        let mut record = OperationRecord::new(CorrelationId::new(), seeds, Duration::from_secs(5));
        let mut frozen: Option<(OperationStatus, Vec<EntityOutcome>)> = None;

        for step in &steps {
            apply(&mut record, step);
            let outcomes: Vec<EntityOutcome> = record
                .targets()
                .iter()
                .filter_map(|id| record.outcome(id).cloned())
                .collect();

            match &frozen {
                Some((status, before)) => {
                    prop_assert_eq!(record.status(), *status);
                    prop_assert_eq!(&outcomes, before);
                }
                None if record.is_terminal() => {
                    prop_assert!(record.reason().is_some());
                    prop_assert!(record.pending().is_empty());
                    frozen = Some((record.status(), outcomes));
                }
                None => prop_assert_eq!(record.status(), OperationStatus::Pending),
            }
        }
    }

    #[test]
    fn confirmed_status_means_every_target_confirmed(
        seeds in prop::collection::vec(arb_seed(), 1..8),
        steps in prop::collection::vec(arb_step(), 0..24),
    ) {
        let mut record = OperationRecord::new(CorrelationId::new(), seeds, Duration::from_secs(5));
        for step in &steps {
            apply(&mut record, step);
        }

        let confirmed = record
            .targets()
            .iter()
            .filter(|id| record.outcome(id).is_some_and(EntityOutcome::is_confirmed))
            .count();
        match record.status() {
            OperationStatus::Confirmed => prop_assert_eq!(confirmed, record.targets().len()),
            OperationStatus::Partial => {
                prop_assert!(confirmed > 0);
                prop_assert!(confirmed < record.targets().len());
            }
            OperationStatus::Failed | OperationStatus::TimedOut => prop_assert_eq!(confirmed, 0),
            OperationStatus::Pending | OperationStatus::Cancelled => {}
        }
    }
}
