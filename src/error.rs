//! Error types for devconfirm.
//!
//! All errors are strongly typed using thiserror so callers can match on
//! the exact failure. Partial success and sequence gaps are not errors: they
//! surface as [`crate::OperationStatus::Partial`] and
//! [`crate::FeedSignal::SequenceGap`].

use thiserror::Error;

use crate::entity::EntityId;
use crate::tracker::{CorrelationId, OperationStatus};

/// Validation errors raised before anything is sent to the control plane.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Intent must target at least one entity")]
    EmptyIntent,

    #[error("Entity '{entity_id}' is targeted more than once in the same intent")]
    DuplicateTarget {
        entity_id: EntityId,
    },

    #[error("Invalid entity id '{value}': expected '<domain>.<object_id>'")]
    InvalidEntityId {
        value: String,
    },

    #[error("Invalid timeout {timeout_ms}ms: must be within 1..={max_ms}ms")]
    InvalidTimeout {
        timeout_ms: u64,
        max_ms: u64,
    },

    #[error("No expected state known for {domain}.{service}; supply an explicit expectation")]
    MissingExpectation {
        domain: String,
        service: String,
    },

    #[error("Action '{action}' is not supported for domain '{domain}'")]
    UnsupportedAction {
        domain: String,
        action: String,
    },

    #[error("Cannot toggle '{entity_id}': current state '{state}' has no opposite")]
    ToggleSourceUnknown {
        entity_id: EntityId,
        state: String,
    },

    #[error("Parameter '{parameter}' is invalid: {reason}")]
    InvalidParameter {
        parameter: String,
        reason: String,
    },

    #[error("Could not resolve '{reference}' to an entity: {reason}")]
    UnresolvedReference {
        reference: String,
        reason: String,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },
}

/// Errors reported by the remote control plane or its event feed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlPlaneError {
    /// Transient network or connection loss. Retried with backoff.
    #[error("Connection error: {message}")]
    Connection {
        message: String,
    },

    /// Credentials were refused. Fatal, never retried.
    #[error("Authentication rejected: {message}")]
    Authentication {
        message: String,
    },

    /// The control plane refused the call.
    #[error("Call rejected (code {code}): {message}")]
    Rejected {
        code: String,
        message: String,
    },

    /// The call targeted an entity the control plane does not know.
    #[error("Invalid target: {entity_id}")]
    InvalidTarget {
        entity_id: EntityId,
    },
}

impl ControlPlaneError {
    /// Creates a connection error.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Returns true if the failure is transient.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    /// Returns true if the failure must not be retried under any policy.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }
}

/// Execution errors raised by the tracker service.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecutionError {
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Unknown operation: {id}")]
    UnknownOperation {
        id: CorrelationId,
    },

    #[error("Channel disconnected: {path}")]
    Disconnected {
        path: String,
    },

    #[error("Illegal status transition from {from:?} to {to:?}")]
    IllegalTransition {
        from: OperationStatus,
        to: OperationStatus,
    },

    #[error("Engine is shutting down")]
    ShuttingDown,
}

/// Top-level error type for devconfirm.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfirmError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Control plane error: {0}")]
    ControlPlane(#[from] ControlPlaneError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl ConfirmError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if the id was never issued or has been purged.
    #[must_use]
    pub const fn is_unknown_operation(&self) -> bool {
        matches!(self, Self::Execution(ExecutionError::UnknownOperation { .. }))
    }

    /// Returns true for conditions that end the engine's usefulness.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        match self {
            Self::ControlPlane(e) => e.is_fatal(),
            _ => false,
        }
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) => false,
            Self::ControlPlane(e) => e.is_transient(),
            Self::Execution(e) => matches!(e, ExecutionError::Timeout { .. }),
            Self::Internal { .. } => false,
        }
    }
}

/// Result type alias for devconfirm operations.
pub type ConfirmResult<T> = Result<T, ConfirmError>;

pub(crate) fn lock_err(context: &'static str) -> ConfirmError {
    ConfirmError::internal(format!("poisoned lock: {context}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_timeout() {
        let err = ValidationError::InvalidTimeout {
            timeout_ms: 0,
            max_ms: 300_000,
        };
        let msg = format!("{err}");
        assert!(msg.contains("0ms"));
        assert!(msg.contains("300000ms"));
    }

    #[test]
    fn test_execution_error_unknown_operation() {
        let id = CorrelationId::new();
        let err = ExecutionError::UnknownOperation { id };
        assert!(err.to_string().contains(&id.to_string()));
    }

    #[test]
    fn test_control_plane_error_classification() {
        assert!(ControlPlaneError::connection("reset").is_transient());
        let auth = ControlPlaneError::Authentication {
            message: "bad token".to_string(),
        };
        assert!(auth.is_fatal());
        assert!(!auth.is_transient());
    }

    #[test]
    fn test_confirm_error_from_control_plane() {
        let err: ConfirmError = ControlPlaneError::connection("refused").into();
        assert!(err.is_retryable());
        assert!(!err.is_fatal());

        let err: ConfirmError = ControlPlaneError::Authentication {
            message: "expired".to_string(),
        }
        .into();
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_confirm_error_unknown_operation() {
        let err: ConfirmError = ExecutionError::UnknownOperation {
            id: CorrelationId::new(),
        }
        .into();
        assert!(err.is_unknown_operation());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_confirm_error_internal() {
        let err = ConfirmError::internal("unexpected state");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("unexpected state"));
    }

    #[test]
    fn test_rejected_error_display() {
        let err = ControlPlaneError::Rejected {
            code: "not_found".to_string(),
            message: "Service light.explode not found".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("not_found"));
        assert!(msg.contains("light.explode"));
    }
}
