//! Expected-state predicates and the per-domain predicate table.
//!
//! A single equality check is not enough across device classes: a light asked
//! for 40% brightness reports a 0-255 attribute with rounding, a cover reports
//! a position that settles within a couple of percent, a thermostat rounds to
//! its own step. The [`PredicateTable`] turns an action on a domain into the
//! service to call plus the predicate that counts as "it happened".

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::PredicateConfig;
use crate::entity::{EntityId, EntityState};
use crate::error::ValidationError;
use crate::intent::{Action, EntityCommand};

/// A per-entity test deciding whether an observed state is the desired one.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatePredicate {
    /// Primary state equals the given value.
    StateEquals { state: String },

    /// Primary state is one of the given values.
    StateIn { states: Vec<String> },

    /// Primary state parses as a number within `tolerance` of `target`.
    StateWithin { target: f64, tolerance: f64 },

    /// Attribute equals the given JSON value.
    AttributeEquals { attribute: String, value: Value },

    /// Numeric attribute within `tolerance` of `target`.
    AttributeWithin {
        attribute: String,
        target: f64,
        tolerance: f64,
    },

    /// Every inner predicate holds.
    All { predicates: Vec<StatePredicate> },
}

impl StatePredicate {
    /// Shorthand for [`StatePredicate::StateEquals`].
    #[must_use]
    pub fn state(state: impl Into<String>) -> Self {
        Self::StateEquals { state: state.into() }
    }

    /// Shorthand for [`StatePredicate::AttributeWithin`].
    #[must_use]
    pub fn attribute_within(attribute: impl Into<String>, target: f64, tolerance: f64) -> Self {
        Self::AttributeWithin {
            attribute: attribute.into(),
            target,
            tolerance,
        }
    }

    /// Evaluates the predicate against an observation.
    #[must_use]
    pub fn is_satisfied_by(&self, observed: &EntityState) -> bool {
        match self {
            Self::StateEquals { state } => observed.state == *state,
            Self::StateIn { states } => states.iter().any(|s| *s == observed.state),
            Self::StateWithin { target, tolerance } => observed
                .state
                .trim()
                .parse::<f64>()
                .is_ok_and(|v| within(v, *target, *tolerance)),
            Self::AttributeEquals { attribute, value } => observed.attribute(attribute) == Some(value),
            Self::AttributeWithin {
                attribute,
                target,
                tolerance,
            } => observed
                .numeric_attribute(attribute)
                .is_some_and(|v| within(v, *target, *tolerance)),
            Self::All { predicates } => predicates.iter().all(|p| p.is_satisfied_by(observed)),
        }
    }
}

fn within(value: f64, target: f64, tolerance: f64) -> bool {
    value.is_finite() && (value - target).abs() <= tolerance.abs()
}

/// What the dispatcher should send for one entity, and what confirms it.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandPlan {
    /// Service name within the entity's domain (`turn_on`, `set_cover_position`, ...).
    pub service: String,
    /// Service data excluding the target entity.
    pub data: Map<String, Value>,
    /// Expected state once the command has taken effect.
    pub predicate: StatePredicate,
}

const ON_OFF_DOMAINS: &[&str] = &[
    "light",
    "switch",
    "fan",
    "input_boolean",
    "automation",
    "siren",
    "humidifier",
    "remote",
    "media_player",
];

const MEDIA_ON_STATES: &[&str] = &["on", "idle", "playing", "paused", "buffering", "standby"];

/// Maps `(domain, action, parameters)` to a service call and its confirming predicate.
#[derive(Debug, Clone, Default)]
pub struct PredicateTable {
    cfg: PredicateConfig,
}

impl PredicateTable {
    /// Creates a table with the given tolerances.
    #[must_use]
    pub fn new(cfg: PredicateConfig) -> Self {
        Self { cfg }
    }

    /// Plans one entity command.
    ///
    /// `current` is the last known state of the entity; it is only consulted
    /// for `toggle`, whose target depends on where the entity starts.
    ///
    /// An explicit `expect` on the command replaces the table's predicate but
    /// not its service mapping.
    pub fn plan(&self, command: &EntityCommand, current: Option<&EntityState>) -> Result<CommandPlan, ValidationError> {
        let entity_id = &command.entity_id;
        let domain = entity_id.domain();
        let params = &command.parameters;

        let (service, predicate) = match &command.action {
            Action::On => self.plan_on(domain, params)?,
            Action::Off => {
                require_domain(domain, ON_OFF_DOMAINS, &command.action)?;
                ("turn_off".to_string(), Some(StatePredicate::state("off")))
            }
            Action::Toggle => ("toggle".to_string(), Some(toggle_target(entity_id, current)?)),
            Action::Open => match domain {
                "cover" => ("open_cover".to_string(), Some(StatePredicate::state("open"))),
                "valve" => ("open_valve".to_string(), Some(StatePredicate::state("open"))),
                _ => return Err(unsupported(domain, &command.action)),
            },
            Action::Close => match domain {
                "cover" => ("close_cover".to_string(), Some(StatePredicate::state("closed"))),
                "valve" => ("close_valve".to_string(), Some(StatePredicate::state("closed"))),
                _ => return Err(unsupported(domain, &command.action)),
            },
            Action::Lock => {
                require_domain(domain, &["lock"], &command.action)?;
                ("lock".to_string(), Some(StatePredicate::state("locked")))
            }
            Action::Unlock => {
                require_domain(domain, &["lock"], &command.action)?;
                ("unlock".to_string(), Some(StatePredicate::state("unlocked")))
            }
            Action::Set => self.plan_set(domain, params, &command.action)?,
            Action::Service(service) => (service.clone(), None),
        };

        let predicate = match (command.expect.clone(), predicate) {
            (Some(explicit), _) => explicit,
            (None, Some(p)) => p,
            (None, None) => {
                return Err(ValidationError::MissingExpectation {
                    domain: domain.to_string(),
                    service,
                })
            }
        };

        Ok(CommandPlan {
            service,
            data: params.clone(),
            predicate,
        })
    }

    fn plan_on(&self, domain: &str, params: &Map<String, Value>) -> Result<(String, Option<StatePredicate>), ValidationError> {
        require_domain(domain, ON_OFF_DOMAINS, &Action::On)?;
        if domain == "light" && zero_brightness(params)? {
            // The light switches off instead of reporting brightness 0.
            return Ok(("turn_on".to_string(), Some(StatePredicate::state("off"))));
        }

        let base = if domain == "media_player" {
            StatePredicate::StateIn {
                states: MEDIA_ON_STATES.iter().map(|s| (*s).to_string()).collect(),
            }
        } else {
            StatePredicate::state("on")
        };

        let mut predicates = vec![base];
        match domain {
            "light" => predicates.extend(self.light_extras(params)?),
            "fan" => {
                if let Some(pct) = number_param(params, "percentage")? {
                    predicates.push(StatePredicate::attribute_within(
                        "percentage",
                        pct,
                        self.cfg.percentage_tolerance,
                    ));
                }
            }
            _ => {}
        }

        Ok(("turn_on".to_string(), Some(collapse(predicates))))
    }

    fn light_extras(&self, params: &Map<String, Value>) -> Result<Vec<StatePredicate>, ValidationError> {
        let mut out = Vec::new();
        if let Some(pct) = number_param(params, "brightness_pct")? {
            if !(0.0..=100.0).contains(&pct) {
                return Err(ValidationError::InvalidParameter {
                    parameter: "brightness_pct".to_string(),
                    reason: format!("{pct} is outside 0..=100"),
                });
            }
            out.push(StatePredicate::attribute_within(
                "brightness",
                (pct * 255.0 / 100.0).round(),
                self.cfg.brightness_tolerance,
            ));
        } else if let Some(raw) = number_param(params, "brightness")? {
            out.push(StatePredicate::attribute_within(
                "brightness",
                raw,
                self.cfg.brightness_tolerance,
            ));
        }
        if let Some(kelvin) = number_param(params, "color_temp_kelvin")? {
            out.push(StatePredicate::attribute_within(
                "color_temp_kelvin",
                kelvin,
                self.cfg.color_temp_tolerance,
            ));
        }
        Ok(out)
    }

    fn plan_set(
        &self,
        domain: &str,
        params: &Map<String, Value>,
        action: &Action,
    ) -> Result<(String, Option<StatePredicate>), ValidationError> {
        match domain {
            "light" => self.plan_on(domain, params),
            "cover" => {
                if let Some(pos) = number_param(params, "position")? {
                    Ok((
                        "set_cover_position".to_string(),
                        Some(StatePredicate::attribute_within(
                            "current_position",
                            pos,
                            self.cfg.position_tolerance,
                        )),
                    ))
                } else if let Some(tilt) = number_param(params, "tilt_position")? {
                    Ok((
                        "set_cover_tilt_position".to_string(),
                        Some(StatePredicate::attribute_within(
                            "current_tilt_position",
                            tilt,
                            self.cfg.position_tolerance,
                        )),
                    ))
                } else {
                    Err(missing_param("position"))
                }
            }
            "climate" => {
                let mode = string_param(params, "hvac_mode")?;
                let temperature = number_param(params, "temperature")?;
                match (temperature, mode) {
                    (Some(t), mode) => {
                        let mut predicates = Vec::new();
                        if let Some(m) = mode {
                            predicates.push(StatePredicate::state(m));
                        }
                        predicates.push(StatePredicate::attribute_within(
                            "temperature",
                            t,
                            self.cfg.temperature_tolerance,
                        ));
                        Ok(("set_temperature".to_string(), Some(collapse(predicates))))
                    }
                    (None, Some(m)) => Ok(("set_hvac_mode".to_string(), Some(StatePredicate::state(m)))),
                    (None, None) => Err(missing_param("temperature")),
                }
            }
            "fan" => {
                let pct = number_param(params, "percentage")?.ok_or_else(|| missing_param("percentage"))?;
                Ok((
                    "set_percentage".to_string(),
                    Some(StatePredicate::attribute_within(
                        "percentage",
                        pct,
                        self.cfg.percentage_tolerance,
                    )),
                ))
            }
            "media_player" => {
                let volume = number_param(params, "volume_level")?.ok_or_else(|| missing_param("volume_level"))?;
                Ok((
                    "volume_set".to_string(),
                    Some(StatePredicate::attribute_within(
                        "volume_level",
                        volume,
                        self.cfg.volume_tolerance,
                    )),
                ))
            }
            "input_number" | "number" => {
                let value = number_param(params, "value")?.ok_or_else(|| missing_param("value"))?;
                Ok((
                    "set_value".to_string(),
                    Some(StatePredicate::StateWithin {
                        target: value,
                        tolerance: self.cfg.numeric_state_tolerance,
                    }),
                ))
            }
            "input_select" | "select" => {
                let option = string_param(params, "option")?.ok_or_else(|| missing_param("option"))?;
                Ok(("select_option".to_string(), Some(StatePredicate::state(option))))
            }
            _ => Err(unsupported(domain, action)),
        }
    }
}

fn collapse(mut predicates: Vec<StatePredicate>) -> StatePredicate {
    if predicates.len() == 1 {
        predicates.remove(0)
    } else {
        StatePredicate::All { predicates }
    }
}

fn toggle_target(entity_id: &EntityId, current: Option<&EntityState>) -> Result<StatePredicate, ValidationError> {
    let state = current.map_or("unknown", |s| s.state.as_str());
    let target = match (entity_id.domain(), state) {
        ("cover" | "valve", "open") => "closed",
        ("cover" | "valve", "closed") => "open",
        (_, "on") => "off",
        (_, "off") => "on",
        _ => {
            return Err(ValidationError::ToggleSourceUnknown {
                entity_id: entity_id.clone(),
                state: state.to_string(),
            })
        }
    };
    Ok(StatePredicate::state(target))
}

fn require_domain(domain: &str, allowed: &[&str], action: &Action) -> Result<(), ValidationError> {
    if allowed.contains(&domain) {
        Ok(())
    } else {
        Err(unsupported(domain, action))
    }
}

fn unsupported(domain: &str, action: &Action) -> ValidationError {
    ValidationError::UnsupportedAction {
        domain: domain.to_string(),
        action: action.name().to_string(),
    }
}

fn zero_brightness(params: &Map<String, Value>) -> Result<bool, ValidationError> {
    let target = match number_param(params, "brightness_pct")? {
        Some(pct) => Some(pct),
        None => number_param(params, "brightness")?,
    };
    Ok(target.is_some_and(|v| v.abs() < f64::EPSILON))
}

fn missing_param(name: &str) -> ValidationError {
    ValidationError::InvalidParameter {
        parameter: name.to_string(),
        reason: "required for this action".to_string(),
    }
}

fn number_param(params: &Map<String, Value>, name: &str) -> Result<Option<f64>, ValidationError> {
    match params.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n.as_f64().map(Some).ok_or_else(|| ValidationError::InvalidParameter {
            parameter: name.to_string(),
            reason: "not representable as f64".to_string(),
        }),
        Some(Value::String(s)) => s.trim().parse().map(Some).map_err(|_| ValidationError::InvalidParameter {
            parameter: name.to_string(),
            reason: format!("expected a number, got {s:?}"),
        }),
        Some(other) => Err(ValidationError::InvalidParameter {
            parameter: name.to_string(),
            reason: format!("expected a number, got {other}"),
        }),
    }
}

fn string_param(params: &Map<String, Value>, name: &str) -> Result<Option<String>, ValidationError> {
    match params.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(Some(s.trim().to_string())),
        Some(other) => Err(ValidationError::InvalidParameter {
            parameter: name.to_string(),
            reason: format!("expected a non-empty string, got {other}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cmd(entity: &str, action: Action, params: Value) -> EntityCommand {
        let mut c = EntityCommand::new(EntityId::parse(entity).unwrap(), action);
        if let Value::Object(map) = params {
            c.parameters = map;
        }
        c
    }

    #[test]
    fn light_on_with_brightness_pct_uses_tolerance() {
        let table = PredicateTable::default();
        let plan = table
            .plan(&cmd("light.kitchen", Action::On, json!({"brightness_pct": 40})), None)
            .unwrap();
        assert_eq!(plan.service, "turn_on");
        assert_eq!(plan.data.get("brightness_pct"), Some(&json!(40)));

        let close = EntityState::new("on").with_attribute("brightness", 103);
        let far = EntityState::new("on").with_attribute("brightness", 120);
        let off = EntityState::new("off").with_attribute("brightness", 102);
        assert!(plan.predicate.is_satisfied_by(&close));
        assert!(!plan.predicate.is_satisfied_by(&far));
        assert!(!plan.predicate.is_satisfied_by(&off));
    }

    #[test]
    fn brightness_pct_out_of_range_is_rejected() {
        let table = PredicateTable::default();
        let err = table
            .plan(&cmd("light.kitchen", Action::On, json!({"brightness_pct": 140})), None)
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidParameter { .. }));
    }

    #[test]
    fn zero_brightness_expects_the_light_off() {
        let table = PredicateTable::default();
        let off = EntityState::new("off");
        let dim = EntityState::new("on").with_attribute("brightness", 0);

        for params in [json!({"brightness_pct": 0}), json!({"brightness": 0})] {
            let plan = table.plan(&cmd("light.kitchen", Action::On, params), None).unwrap();
            assert_eq!(plan.service, "turn_on");
            assert_eq!(plan.predicate, StatePredicate::state("off"));
            assert!(plan.predicate.is_satisfied_by(&off));
            assert!(!plan.predicate.is_satisfied_by(&dim));
        }
    }

    #[test]
    fn toggle_depends_on_current_state() {
        let table = PredicateTable::default();
        let on = EntityState::new("on");
        let plan = table.plan(&cmd("switch.porch", Action::Toggle, json!({})), Some(&on)).unwrap();
        assert_eq!(plan.predicate, StatePredicate::state("off"));

        let open = EntityState::new("open");
        let plan = table.plan(&cmd("cover.garage", Action::Toggle, json!({})), Some(&open)).unwrap();
        assert_eq!(plan.predicate, StatePredicate::state("closed"));

        let err = table.plan(&cmd("switch.porch", Action::Toggle, json!({})), None).unwrap_err();
        assert!(matches!(err, ValidationError::ToggleSourceUnknown { .. }));
    }

    #[test]
    fn cover_position_within_tolerance() {
        let table = PredicateTable::default();
        let plan = table
            .plan(&cmd("cover.blinds", Action::Set, json!({"position": 50})), None)
            .unwrap();
        assert_eq!(plan.service, "set_cover_position");
        assert!(plan
            .predicate
            .is_satisfied_by(&EntityState::new("open").with_attribute("current_position", 51)));
        assert!(!plan
            .predicate
            .is_satisfied_by(&EntityState::new("open").with_attribute("current_position", 60)));
    }

    #[test]
    fn climate_mode_and_temperature_combine() {
        let table = PredicateTable::default();
        let plan = table
            .plan(
                &cmd("climate.hall", Action::Set, json!({"temperature": 21.0, "hvac_mode": "heat"})),
                None,
            )
            .unwrap();
        assert_eq!(plan.service, "set_temperature");
        assert!(plan
            .predicate
            .is_satisfied_by(&EntityState::new("heat").with_attribute("temperature", 21.5)));
        assert!(!plan
            .predicate
            .is_satisfied_by(&EntityState::new("cool").with_attribute("temperature", 21.0)));
    }

    #[test]
    fn unsupported_action_for_domain() {
        let table = PredicateTable::default();
        let err = table.plan(&cmd("sensor.outdoor", Action::On, json!({})), None).unwrap_err();
        assert_eq!(
            err,
            ValidationError::UnsupportedAction {
                domain: "sensor".to_string(),
                action: "on".to_string(),
            }
        );
        let err = table.plan(&cmd("light.kitchen", Action::Lock, json!({})), None).unwrap_err();
        assert!(matches!(err, ValidationError::UnsupportedAction { .. }));
    }

    #[test]
    fn custom_service_requires_expectation() {
        let table = PredicateTable::default();
        let action = Action::Service("start".to_string());
        let err = table.plan(&cmd("vacuum.downstairs", action.clone(), json!({})), None).unwrap_err();
        assert!(matches!(err, ValidationError::MissingExpectation { .. }));

        let mut c = cmd("vacuum.downstairs", action, json!({}));
        c.expect = Some(StatePredicate::state("cleaning"));
        let plan = table.plan(&c, None).unwrap();
        assert_eq!(plan.service, "start");
        assert!(plan.predicate.is_satisfied_by(&EntityState::new("cleaning")));
    }

    #[test]
    fn numeric_state_predicate() {
        let p = StatePredicate::StateWithin {
            target: 12.0,
            tolerance: 0.01,
        };
        assert!(p.is_satisfied_by(&EntityState::new("12.0")));
        assert!(!p.is_satisfied_by(&EntityState::new("12.5")));
        assert!(!p.is_satisfied_by(&EntityState::new("unavailable")));
    }

    #[test]
    fn predicate_serde_is_tagged() {
        let p = StatePredicate::attribute_within("brightness", 102.0, 3.0);
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["type"], "attribute_within");
        let back: StatePredicate = serde_json::from_value(v).unwrap();
        assert_eq!(back, p);
    }
}
