// SPDX-License-Identifier: MIT

//! Typed error handling for stepgraph-rs
//!
//! Errors are split by the boundary that raises them:
//! - `ValidationError` - the step set is not a valid DAG (raised before anything runs)
//! - `StateStoreError` - persisting or loading a checkpoint failed
//! - `ExecutorError` - what `execute`/`resume`/`cancel` return to the caller
//! - `StepGraphError` - everything above plus loading, configuration and building
//!
//! Step-level failures are `StepError` (see `sdk::step`) and never escape the
//! executor; they are recorded in the workflow state instead.

use thiserror::Error;

/// The step set handed to the executor does not describe a valid DAG
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// Two steps share a name
    #[error("duplicate step name: '{0}'")]
    DuplicateStep(String),

    /// A step depends on a name that no step in the workflow carries
    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    /// The dependency relation contains a cycle; members listed in traversal order
    #[error("circular dependency detected: {}", .0.join(" -> "))]
    CycleDetected(Vec<String>),

    /// A step was declared with an empty name
    #[error("step names must not be empty")]
    EmptyStepName,

    /// Resume was given steps that differ from the persisted step set
    #[error("step set does not match the persisted workflow: {0}")]
    StepSetMismatch(String),
}

/// Errors raised by a `StateStore`
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("workflow '{0}' not found")]
    NotFound(String),

    #[error("state store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend specific failure that fits none of the above
    #[error("state store error: {0}")]
    Backend(String),
}

/// Errors returned by the executor entry points
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A checkpoint could not be written or read; the last committed
    /// checkpoint is left intact
    #[error(transparent)]
    Store(StateStoreError),

    #[error("workflow '{0}' not found")]
    NotFound(String),

    #[error("workflow '{0}' is already running")]
    AlreadyRunning(String),

    /// `resume` by id alone needs the step set from an earlier call in this process
    #[error("no step set known for workflow '{0}'; resume it with its steps")]
    UnknownSteps(String),
}

impl From<StateStoreError> for ExecutorError {
    fn from(err: StateStoreError) -> Self {
        match err {
            StateStoreError::NotFound(id) => Self::NotFound(id),
            other => Self::Store(other),
        }
    }
}

/// Errors raised while parsing a `when` condition
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConditionError {
    #[error("unexpected end of condition '{0}'")]
    UnexpectedEnd(String),

    #[error("unexpected token '{token}' at offset {offset} in condition '{input}'")]
    UnexpectedToken {
        token: String,
        offset: usize,
        input: String,
    },

    #[error("unterminated string literal in condition '{0}'")]
    UnterminatedString(String),
}

/// Top-level error type for stepgraph-rs
#[derive(Debug, Error)]
pub enum StepGraphError {
    /// Configuration errors (invalid values, bad environment overrides)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A workflow definition names a step kind the registry does not know
    #[error("Unknown step kind '{kind}' for step '{step}'")]
    UnknownStepKind { step: String, kind: String },

    /// A step definition carries a configuration its kind cannot accept
    #[error("Invalid step '{step}': {message}")]
    InvalidStep { step: String, message: String },

    #[error("Condition error: {0}")]
    Condition(#[from] ConditionError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl StepGraphError {
    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create an invalid step error
    pub fn invalid_step(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidStep {
            step: step.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_members() {
        let err = ValidationError::CycleDetected(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(err.to_string(), "circular dependency detected: a -> b -> a");
    }

    #[test]
    fn test_store_not_found_maps_to_executor_not_found() {
        let err: ExecutorError = StateStoreError::NotFound("wf-1".into()).into();
        assert!(matches!(err, ExecutorError::NotFound(id) if id == "wf-1"));

        let err: ExecutorError = StateStoreError::Backend("disk full".into()).into();
        assert!(matches!(err, ExecutorError::Store(_)));
    }

    #[test]
    fn test_validation_error_lifts_into_top_level() {
        let err: StepGraphError = ValidationError::DuplicateStep("a".into()).into();
        assert_eq!(err.to_string(), "duplicate step name: 'a'");
    }
}
