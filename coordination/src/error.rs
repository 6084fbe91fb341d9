//! Integration error taxonomy
//!
//! Every failure that crosses a component boundary is described by an
//! [`IntegrationError`]: a structured record carrying the failing component,
//! the operation, a JSON context map and whether the failure is a candidate
//! for automated recovery.
//!
//! # Classification
//!
//! | Kind                     | Class          | Recoverable |
//! |--------------------------|----------------|-------------|
//! | ComponentInitialization  | infrastructure | yes         |
//! | StateSynchronization     | infrastructure | yes         |
//! | EventPropagation         | infrastructure | yes         |
//! | EngineInitialization     | infrastructure | yes         |
//! | EngineCommunication      | infrastructure | yes         |
//! | CalculationTimeout       | infrastructure | yes         |
//! | EngineCrashed            | infrastructure | yes         |
//! | CircuitOpen              | infrastructure | no          |
//! | ApiValidation            | validation     | no          |
//! | InvalidPosition          | validation     | no          |
//! | InvalidAiMove            | validation     | no          |

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Category of an integration failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ComponentInitialization,
    StateSynchronization,
    ApiValidation,
    EventPropagation,
    EngineInitialization,
    EngineCommunication,
    InvalidPosition,
    CalculationTimeout,
    EngineCrashed,
    InvalidAiMove,
    CircuitOpen,
}

impl ErrorKind {
    /// Validation-class errors are surfaced immediately and never retried.
    pub fn is_validation(self) -> bool {
        matches!(
            self,
            Self::ApiValidation | Self::InvalidPosition | Self::InvalidAiMove
        )
    }

    /// Whether a recovery strategy may be attempted for this kind.
    ///
    /// An open circuit is a deliberate rejection, so it is not recoverable
    /// even though it is not a validation failure.
    pub fn is_recoverable(self) -> bool {
        !self.is_validation() && self != Self::CircuitOpen
    }

    /// Stable snake_case name, used as the recovery action label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ComponentInitialization => "component_initialization",
            Self::StateSynchronization => "state_synchronization",
            Self::ApiValidation => "api_validation",
            Self::EventPropagation => "event_propagation",
            Self::EngineInitialization => "engine_initialization",
            Self::EngineCommunication => "engine_communication",
            Self::InvalidPosition => "invalid_position",
            Self::CalculationTimeout => "calculation_timeout",
            Self::EngineCrashed => "engine_crashed",
            Self::InvalidAiMove => "invalid_ai_move",
            Self::CircuitOpen => "circuit_open",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured failure record shared by every component.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("[{kind}] {component}.{operation}: {message}")]
pub struct IntegrationError {
    pub kind: ErrorKind,
    /// Component that observed the failure (e.g. "engine_adapter").
    pub component: String,
    /// Operation that was running (e.g. "get_best_move").
    pub operation: String,
    pub message: String,
    /// Relevant context for debugging and recovery
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,
    pub recoverable: bool,
    /// How many times this failure has been retried so far.
    pub attempt_count: u32,
    pub timestamp: DateTime<Utc>,
    /// Rendered source chain of the underlying error, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl IntegrationError {
    /// Create a new error; recoverability defaults from the kind.
    pub fn new(
        kind: ErrorKind,
        component: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            component: component.into(),
            operation: operation.into(),
            message: message.into(),
            context: HashMap::new(),
            recoverable: kind.is_recoverable(),
            attempt_count: 0,
            timestamp: Utc::now(),
            cause: None,
        }
    }

    /// Add context key-value pair
    pub fn with_context(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Attach the source chain of an underlying error.
    pub fn with_cause(mut self, cause: &(dyn std::error::Error + 'static)) -> Self {
        let mut rendered = cause.to_string();
        let mut source = cause.source();
        while let Some(inner) = source {
            rendered.push_str(": ");
            rendered.push_str(&inner.to_string());
            source = inner.source();
        }
        self.cause = Some(rendered);
        self
    }

    /// Override the recoverable flag derived from the kind.
    pub fn recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }

    pub fn with_attempts(mut self, attempt_count: u32) -> Self {
        self.attempt_count = attempt_count;
        self
    }

    /// JSON payload used when the error is published on the event bus.
    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| {
            serde_json::json!({
                "kind": self.kind.as_str(),
                "component": self.component,
                "operation": self.operation,
                "message": self.message,
            })
        })
    }
}
