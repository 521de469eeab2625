//! Entity identifiers and observed entity state.
//!
//! An `EntityId` is the canonical `<domain>.<object_id>` form produced by the
//! entity resolver. Everything downstream of resolution (dispatch, tracking,
//! event fan-out) keys on it.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ValidationError;

fn entity_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9_]+\.[a-z0-9_]+$").expect("static entity id pattern"))
}

/// Canonical entity identifier, e.g. `light.kitchen`.
///
/// # Examples
///
/// ```
/// use devconfirm::EntityId;
///
/// let id = EntityId::parse("light.kitchen").unwrap();
/// assert_eq!(id.domain(), "light");
/// assert_eq!(id.object_id(), "kitchen");
/// assert!(EntityId::parse("Kitchen Light").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId(String);

impl EntityId {
    /// Parses and validates a canonical entity id.
    ///
    /// Surrounding whitespace is trimmed; no other normalization is applied
    /// because canonicalization is the resolver's job.
    pub fn parse(value: &str) -> Result<Self, ValidationError> {
        let trimmed = value.trim();
        if entity_id_pattern().is_match(trimmed) {
            Ok(Self(trimmed.to_string()))
        } else {
            Err(ValidationError::InvalidEntityId {
                value: value.to_string(),
            })
        }
    }

    /// The domain part (`light` in `light.kitchen`).
    #[must_use]
    pub fn domain(&self) -> &str {
        self.0.split_once('.').map_or(self.0.as_str(), |(d, _)| d)
    }

    /// The object part (`kitchen` in `light.kitchen`).
    #[must_use]
    pub fn object_id(&self) -> &str {
        self.0.split_once('.').map_or("", |(_, o)| o)
    }

    /// Borrow the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EntityId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for EntityId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> Self {
        id.0
    }
}

/// A point-in-time observation of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    /// Primary state string (`on`, `off`, `open`, `heat`, ...).
    pub state: String,
    /// Domain-specific attributes (`brightness`, `current_position`, ...).
    #[serde(default)]
    pub attributes: Map<String, Value>,
    /// When the control plane last saw the state change.
    pub last_changed: DateTime<Utc>,
}

impl EntityState {
    /// Creates a state with no attributes, stamped now.
    #[must_use]
    pub fn new(state: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            attributes: Map::new(),
            last_changed: Utc::now(),
        }
    }

    /// Builder-style attribute setter.
    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Returns an attribute by name.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    /// Returns an attribute as `f64` if it is numeric (or a numeric string).
    #[must_use]
    pub fn numeric_attribute(&self, name: &str) -> Option<f64> {
        match self.attributes.get(name)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Returns true when the control plane reports the entity as absent or unreachable.
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self.state.as_str(), "unavailable" | "unknown")
    }
}
