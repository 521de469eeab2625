//! Command dispatch.
//!
//! Turns an [`Intent`] into control-plane calls and classifies what comes
//! back. An acknowledged call only means the control plane accepted the
//! request: it never confirms an entity. That is the tracker's job.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::DispatcherConfig;
use crate::control::{CallAck, ControlPlane, ServiceCall};
use crate::entity::{EntityId, EntityState};
use crate::error::{ConfirmError, ConfirmResult, ControlPlaneError};
use crate::intent::{Action, DispatchMode, EntityCommand, Intent};
use crate::predicate::{CommandPlan, PredicateTable, StatePredicate};
use crate::subscriber::StateCache;
use crate::tracker::{duration_ms, CorrelationId, TargetSeed};

/// Immediate result of dispatching one entity's command.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// The call was accepted. Confirmation is still pending.
    Acknowledged {
        /// Service that was called.
        service: String,
        /// State that will confirm the command.
        predicate: StatePredicate,
        /// Control-plane acknowledgment.
        ack: CallAck,
    },
    /// The command never reached the device.
    Rejected {
        /// Human-readable reason.
        reason: String,
        /// The underlying error.
        #[serde(skip)]
        error: ConfirmError,
    },
}

impl DispatchOutcome {
    /// Returns true if the call was accepted.
    #[must_use]
    pub const fn is_acknowledged(&self) -> bool {
        matches!(self, Self::Acknowledged { .. })
    }

    fn rejected(error: ConfirmError) -> Self {
        Self::Rejected {
            reason: error.to_string(),
            error,
        }
    }
}

/// One entity's line in a [`DispatchReport`].
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityDispatch {
    pub entity_id: EntityId,
    pub outcome: DispatchOutcome,
}

/// What happened when an intent was dispatched.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchReport {
    pub correlation_id: CorrelationId,
    /// In intent order.
    pub entities: Vec<EntityDispatch>,
    pub dispatched_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl DispatchReport {
    /// Entities whose call was accepted.
    #[must_use]
    pub fn acknowledged(&self) -> usize {
        self.entities.iter().filter(|e| e.outcome.is_acknowledged()).count()
    }

    /// Entities whose call failed.
    #[must_use]
    pub fn rejected(&self) -> usize {
        self.entities.len() - self.acknowledged()
    }

    /// Seeds for the operation record, in intent order.
    #[must_use]
    pub fn seeds(&self) -> Vec<(EntityId, TargetSeed)> {
        self.entities
            .iter()
            .map(|e| {
                let seed = match &e.outcome {
                    DispatchOutcome::Acknowledged { predicate, ack, .. } => TargetSeed::Awaiting {
                        predicate: predicate.clone(),
                        ack: ack.clone(),
                    },
                    DispatchOutcome::Rejected { reason, .. } => TargetSeed::Rejected { reason: reason.clone() },
                };
                (e.entity_id.clone(), seed)
            })
            .collect()
    }
}

/// Issues control-plane calls for intents.
#[derive(Clone)]
pub struct CommandDispatcher {
    control: Arc<dyn ControlPlane>,
    table: PredicateTable,
    cache: Arc<StateCache>,
    cfg: DispatcherConfig,
}

impl std::fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("table", &self.table)
            .field("cfg", &self.cfg)
            .finish_non_exhaustive()
    }
}

struct PlannedCall {
    call: ServiceCall,
    /// Entity and its predicate, per target of `call`.
    members: Vec<(EntityId, StatePredicate)>,
}

impl CommandDispatcher {
    /// Creates a dispatcher. `cache` supplies current states for toggles.
    pub fn new(
        control: Arc<dyn ControlPlane>,
        table: PredicateTable,
        cache: Arc<StateCache>,
        cfg: DispatcherConfig,
    ) -> Self {
        Self {
            control,
            table,
            cache,
            cfg,
        }
    }

    /// Dispatches an intent under a fresh correlation id.
    ///
    /// Per-entity failures (unsupported action, unknown toggle source, refused
    /// call, invalid target) are reported in the result, not as an error.
    ///
    /// # Errors
    /// - `Validation` if the intent is empty or targets an entity twice
    /// - `ControlPlane(Authentication)` if the control plane refuses credentials
    pub fn dispatch(&self, intent: &Intent) -> ConfirmResult<DispatchReport> {
        intent.validate()?;

        let correlation_id = CorrelationId::new();
        let dispatched_at = Utc::now();
        let started = Instant::now();

        let mut outcomes: HashMap<EntityId, DispatchOutcome> = HashMap::with_capacity(intent.commands.len());
        let mut planned: Vec<(EntityId, CommandPlan)> = Vec::with_capacity(intent.commands.len());
        for command in &intent.commands {
            match self.plan(command) {
                Ok(plan) => planned.push((command.entity_id.clone(), plan)),
                Err(err) => {
                    warn!(%correlation_id, entity = %command.entity_id, error = %err, "command rejected before dispatch");
                    outcomes.insert(command.entity_id.clone(), DispatchOutcome::rejected(err));
                }
            }
        }

        let calls = group_calls(planned, intent.mode);
        let results = self.execute(&calls, intent.parallel);

        for (planned_call, result) in calls.into_iter().zip(results) {
            match result {
                Ok(ack) => {
                    debug!(%correlation_id, call = %planned_call.call.label(), targets = planned_call.members.len(), "call acknowledged");
                    for (entity_id, predicate) in planned_call.members {
                        outcomes.insert(
                            entity_id,
                            DispatchOutcome::Acknowledged {
                                service: planned_call.call.service.clone(),
                                predicate,
                                ack: ack.clone(),
                            },
                        );
                    }
                }
                Err(err) if err.is_fatal() => {
                    warn!(%correlation_id, error = %err, "control plane refused credentials");
                    return Err(err.into());
                }
                Err(err) => {
                    warn!(%correlation_id, call = %planned_call.call.label(), error = %err, "call rejected");
                    for (entity_id, _) in planned_call.members {
                        outcomes.insert(entity_id, DispatchOutcome::rejected(err.clone().into()));
                    }
                }
            }
        }

        let entities: Vec<EntityDispatch> = intent
            .targets()
            .filter_map(|id| {
                outcomes.remove(id).map(|outcome| EntityDispatch {
                    entity_id: id.clone(),
                    outcome,
                })
            })
            .collect();

        let report = DispatchReport {
            correlation_id,
            entities,
            dispatched_at,
            duration_ms: duration_ms(started.elapsed()),
        };
        info!(
            %correlation_id,
            acknowledged = report.acknowledged(),
            rejected = report.rejected(),
            duration_ms = report.duration_ms,
            "intent dispatched"
        );
        Ok(report)
    }

    fn plan(&self, command: &EntityCommand) -> ConfirmResult<CommandPlan> {
        let current = if command.action == Action::Toggle {
            self.current_state(&command.entity_id)
        } else {
            None
        };
        Ok(self.table.plan(command, current.as_ref())?)
    }

    fn current_state(&self, entity_id: &EntityId) -> Option<EntityState> {
        self.cache.get(entity_id).or_else(|| match self.control.get_state(entity_id) {
            Ok(state) => state,
            Err(err) => {
                debug!(entity = %entity_id, error = %err, "state read for toggle failed");
                None
            }
        })
    }

    fn execute(&self, calls: &[PlannedCall], parallel: bool) -> Vec<Result<CallAck, ControlPlaneError>> {
        if !parallel || calls.len() <= 1 {
            return calls.iter().map(|c| self.control.call_service(&c.call)).collect();
        }

        let mut results = Vec::with_capacity(calls.len());
        for chunk in calls.chunks(self.cfg.max_parallel_calls.max(1)) {
            thread::scope(|s| {
                let handles: Vec<_> = chunk
                    .iter()
                    .map(|c| s.spawn(move || self.control.call_service(&c.call)))
                    .collect();
                for handle in handles {
                    results.push(
                        handle
                            .join()
                            .unwrap_or_else(|_| Err(ControlPlaneError::connection("call worker panicked"))),
                    );
                }
            });
        }
        results
    }
}

/// Splits planned commands into calls. Grouping keeps first-seen order.
fn group_calls(planned: Vec<(EntityId, CommandPlan)>, mode: DispatchMode) -> Vec<PlannedCall> {
    let single = |entity_id: EntityId, plan: CommandPlan| PlannedCall {
        call: ServiceCall {
            domain: entity_id.domain().to_string(),
            service: plan.service,
            targets: vec![entity_id.clone()],
            data: plan.data,
        },
        members: vec![(entity_id, plan.predicate)],
    };

    match mode {
        DispatchMode::PerEntity => planned.into_iter().map(|(id, plan)| single(id, plan)).collect(),
        DispatchMode::Grouped => {
            let mut calls: Vec<PlannedCall> = Vec::new();
            let mut index: HashMap<(String, String, String), usize> = HashMap::new();
            for (entity_id, plan) in planned {
                let key = (
                    entity_id.domain().to_string(),
                    plan.service.clone(),
                    serde_json::Value::Object(plan.data.clone()).to_string(),
                );
                if let Some(&i) = index.get(&key) {
                    calls[i].call.targets.push(entity_id.clone());
                    calls[i].members.push((entity_id, plan.predicate));
                } else {
                    index.insert(key, calls.len());
                    calls.push(single(entity_id, plan));
                }
            }
            calls
        }
    }
}
