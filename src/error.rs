//! # Fleet Error Types
//!
//! Structured errors returned by every public orchestrator operation. Validation and
//! state errors are raised before any mutation; upstream failures that happen inside
//! background lifecycle transitions are recorded on the entity instead of returned.

use crate::config::ConfigurationError;
use crate::state_machine::StateMachineError;
use crate::store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} '{id}' cannot {operation} while {state}")]
    InvalidState {
        kind: &'static str,
        id: String,
        state: String,
        operation: String,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Write conflict on {kind} '{id}' not resolved after {attempts} attempts")]
    Conflict {
        kind: &'static str,
        id: String,
        attempts: u32,
    },

    #[error("Upstream failure from {source_name}: {message}")]
    Upstream {
        source_name: &'static str,
        message: String,
    },

    /// Raised internally by the resource monitor; converted into an eviction and never
    /// returned through the control plane.
    #[error("Resource limit exceeded on {kind} '{id}': {resource} {observed:.1} > {limit:.1}")]
    ResourceLimitExceeded {
        kind: &'static str,
        id: String,
        resource: &'static str,
        observed: f64,
        limit: f64,
    },

    #[error("Operation {operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    StateMachine(#[from] StateMachineError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl FleetError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn invalid_state(
        kind: &'static str,
        id: impl Into<String>,
        state: impl ToString,
        operation: impl Into<String>,
    ) -> Self {
        Self::InvalidState {
            kind,
            id: id.into(),
            state: state.to_string(),
            operation: operation.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn upstream(source_name: &'static str, message: impl Into<String>) -> Self {
        Self::Upstream {
            source_name,
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Whether the error is a lifecycle guard rejection rather than an I/O failure
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Self::InvalidState { .. })
    }
}

impl From<serde_json::Error> for FleetError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FleetError>;
