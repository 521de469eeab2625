//! Intents: validated requests to change device state.
//!
//! Deciding *what* to send is upstream of this crate. An [`Intent`] arrives
//! with canonical entity ids already resolved; the dispatcher only needs to
//! turn it into control-plane calls.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::entity::EntityId;
use crate::error::ValidationError;
use crate::predicate::StatePredicate;

/// High-level action on an entity.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    On,
    Off,
    Toggle,
    Open,
    Close,
    Lock,
    Unlock,
    /// Set a level (brightness, position, temperature, volume, ...) from the parameters.
    Set,
    /// A raw domain service; requires an explicit expectation.
    Service(String),
}

impl Action {
    /// Short action name used in logs and errors.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::On => "on",
            Self::Off => "off",
            Self::Toggle => "toggle",
            Self::Open => "open",
            Self::Close => "close",
            Self::Lock => "lock",
            Self::Unlock => "unlock",
            Self::Set => "set",
            Self::Service(s) => s.as_str(),
        }
    }
}

/// One entity's part of an intent.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityCommand {
    pub entity_id: EntityId,
    pub action: Action,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
    /// Overrides the predicate table's expectation for this entity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect: Option<StatePredicate>,
}

impl EntityCommand {
    /// Command with no parameters and the table's default expectation.
    #[must_use]
    pub fn new(entity_id: EntityId, action: Action) -> Self {
        Self {
            entity_id,
            action,
            parameters: Map::new(),
            expect: None,
        }
    }

    /// Builder-style parameter setter.
    #[must_use]
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    /// Builder-style expectation override.
    #[must_use]
    pub fn expecting(mut self, predicate: StatePredicate) -> Self {
        self.expect = Some(predicate);
        self
    }
}

/// How the dispatcher splits a bulk intent into control-plane calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// One call per entity; each succeeds or fails on its own.
    #[default]
    PerEntity,
    /// One call per `(domain, service, parameters)` group.
    Grouped,
}

/// A request to change the state of one or more entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    /// Per-entity commands; each entity appears at most once.
    pub commands: Vec<EntityCommand>,
    /// Issue the calls concurrently rather than in order.
    #[serde(default = "default_parallel")]
    pub parallel: bool,
    /// Call splitting strategy.
    #[serde(default)]
    pub mode: DispatchMode,
}

const fn default_parallel() -> bool {
    true
}

impl Default for Intent {
    fn default() -> Self {
        Self {
            commands: Vec::new(),
            parallel: true,
            mode: DispatchMode::PerEntity,
        }
    }
}

impl Intent {
    /// Creates an empty intent.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Intent with a single command.
    #[must_use]
    pub fn single(entity_id: EntityId, action: Action) -> Self {
        Self::new().command(EntityCommand::new(entity_id, action))
    }

    /// Intent applying the same action to every entity.
    #[must_use]
    pub fn bulk(entity_ids: impl IntoIterator<Item = EntityId>, action: &Action) -> Self {
        entity_ids
            .into_iter()
            .fold(Self::new(), |intent, id| intent.command(EntityCommand::new(id, action.clone())))
    }

    /// Appends a command.
    #[must_use]
    pub fn command(mut self, command: EntityCommand) -> Self {
        self.commands.push(command);
        self
    }

    /// Issue calls one after another in intent order.
    #[must_use]
    pub fn sequential(mut self) -> Self {
        self.parallel = false;
        self
    }

    /// Use [`DispatchMode::Grouped`].
    #[must_use]
    pub fn grouped(mut self) -> Self {
        self.mode = DispatchMode::Grouped;
        self
    }

    /// Target entity ids, in intent order.
    pub fn targets(&self) -> impl Iterator<Item = &EntityId> {
        self.commands.iter().map(|c| &c.entity_id)
    }

    /// Checks that the intent is non-empty and targets each entity at most once.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.commands.is_empty() {
            return Err(ValidationError::EmptyIntent);
        }
        let mut seen = HashSet::with_capacity(self.commands.len());
        for id in self.targets() {
            if !seen.insert(id) {
                return Err(ValidationError::DuplicateTarget { entity_id: id.clone() });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> EntityId {
        EntityId::parse(s).unwrap()
    }

    #[test]
    fn empty_intent_is_invalid() {
        assert_eq!(Intent::new().validate(), Err(ValidationError::EmptyIntent));
    }

    #[test]
    fn duplicate_targets_are_invalid() {
        let intent = Intent::bulk([id("light.a"), id("light.b"), id("light.a")], &Action::On);
        assert_eq!(
            intent.validate(),
            Err(ValidationError::DuplicateTarget { entity_id: id("light.a") })
        );
    }

    #[test]
    fn intent_deserializes_with_defaults() {
        let intent: Intent = serde_json::from_str(
            r#"{"commands":[{"entity_id":"light.kitchen","action":"on","parameters":{"brightness_pct":30}}]}"#,
        )
        .unwrap();
        assert!(intent.parallel);
        assert_eq!(intent.mode, DispatchMode::PerEntity);
        assert_eq!(intent.commands[0].action, Action::On);
        assert!(intent.validate().is_ok());
    }

    #[test]
    fn custom_service_action_roundtrips_by_name() {
        let action: Action = serde_json::from_str(r#"{"service":"start"}"#).unwrap();
        assert_eq!(action.name(), "start");
    }
}
