// SPDX-License-Identifier: MIT

//! The step contract every unit of work implements.
//!
//! The executor only ever sees `Arc<dyn Step>`; concrete step types (the
//! built-ins under `crate::steps`, `FnStep`, or caller-defined types) are
//! interchangeable behind it.
//!
//! `execute` may be called several times for one workflow run (once per
//! attempt, and again after a resume). Making that safe is the step
//! author's job: the engine promises at-least-once execution, not
//! exactly-once side effects.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::workflow::condition::Condition;

/// Failure reported by a single step attempt.
///
/// The variant is the classification the retry policy acts on.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum StepError {
    /// Transient failure (I/O, rate limit, upstream 5xx); eligible for retry
    #[error("retryable step error: {0}")]
    Retryable(String),

    /// Permanent failure (malformed input, validation); never retried
    #[error("non-retryable step error: {0}")]
    NonRetryable(String),

    /// The attempt exceeded its timeout
    #[error("step timed out after {0:?}")]
    Timeout(Duration),

    /// The attempt was abandoned because the workflow was cancelled
    #[error("step cancelled")]
    Cancelled,
}

/// Message fragments that mark a failure as permanent
const NON_RETRYABLE_MARKERS: &[&str] = &[
    "authentication",
    "permission",
    "not found",
    "invalid",
    "400",
    "401",
    "403",
    "404",
];

impl StepError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable(message.into())
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self::NonRetryable(message.into())
    }

    /// Classify a free-form error message.
    ///
    /// Messages carrying a known terminal marker are non-retryable; anything
    /// else is assumed transient.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lowered = message.to_lowercase();
        if NON_RETRYABLE_MARKERS.iter().any(|m| lowered.contains(m)) {
            Self::NonRetryable(message)
        } else {
            Self::Retryable(message)
        }
    }

    /// Whether this failure may be retried. Timeouts follow `retry_timeouts`.
    pub fn is_retryable(&self, retry_timeouts: bool) -> bool {
        match self {
            Self::Retryable(_) => true,
            Self::Timeout(_) => retry_timeouts,
            Self::NonRetryable(_) | Self::Cancelled => false,
        }
    }
}

/// Read-only view handed to a step for one attempt
#[derive(Debug, Clone)]
pub struct StepContext {
    workflow_id: String,
    attempt: u32,
    input: Arc<Value>,
    outputs: Arc<Map<String, Value>>,
    cancellation: CancellationToken,
}

impl StepContext {
    pub fn new(
        workflow_id: impl Into<String>,
        attempt: u32,
        input: Arc<Value>,
        outputs: Arc<Map<String, Value>>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            attempt,
            input,
            outputs,
            cancellation,
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// 1-based attempt number, cumulative across resumes
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The workflow's original input payload
    pub fn input(&self) -> &Value {
        &self.input
    }

    /// Outputs of every step completed before this step's layer started
    pub fn outputs(&self) -> &Map<String, Value> {
        &self.outputs
    }

    pub fn output(&self, step: &str) -> Option<&Value> {
        self.outputs.get(step)
    }

    /// Output of a declared dependency, or a non-retryable error when it is missing
    pub fn dependency_output(&self, step: &str) -> Result<&Value, StepError> {
        self.outputs.get(step).ok_or_else(|| {
            StepError::non_retryable(format!("output of step '{}' is not available", step))
        })
    }

    /// Resolve a dotted path: `input.x.y` reads the workflow input, any other
    /// root names a completed step. Numeric segments index into arrays.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let root = parts.next()?;
        let mut current = if root == "input" {
            self.input.as_ref()
        } else {
            self.outputs.get(root)?
        };
        for part in parts {
            current = match current {
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                other => other.get(part)?,
            };
        }
        Some(current)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Completes once the workflow is cancelled; steps doing long I/O can
    /// `select!` on this to stop early
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }
}

/// Core step trait
#[async_trait]
pub trait Step: Send + Sync {
    /// Unique name within the workflow
    fn name(&self) -> &str;

    /// Names of the steps that must complete before this one runs
    fn depends_on(&self) -> &[String];

    /// Predicate evaluated against the accumulated context; `false` skips the step
    fn condition(&self) -> Option<&Condition> {
        None
    }

    /// Per-attempt timeout; `None` uses the executor default
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Attempt budget; `None` uses the retry policy's
    fn max_attempts(&self) -> Option<u32> {
        None
    }

    /// Run one attempt
    async fn execute(&self, ctx: &StepContext, input: &Value) -> Result<Value, StepError>;
}

/// Declarative header shared by step implementations
#[derive(Debug, Clone, Default)]
pub struct StepSpec {
    pub name: String,
    pub depends_on: Vec<String>,
    pub condition: Option<Condition>,
    pub timeout: Option<Duration>,
    pub max_attempts: Option<u32>,
}

impl StepSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }
}

type StepFn =
    Arc<dyn Fn(StepContext, Value) -> BoxFuture<'static, Result<Value, StepError>> + Send + Sync>;

/// A step backed by an async closure
pub struct FnStep {
    spec: StepSpec,
    func: StepFn,
}

impl FnStep {
    pub fn new<I, S, F, Fut>(name: impl Into<String>, depends_on: I, func: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(StepContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, StepError>> + Send + 'static,
    {
        Self::from_spec(StepSpec::new(name).with_dependencies(depends_on), func)
    }

    pub fn from_spec<F, Fut>(spec: StepSpec, func: F) -> Self
    where
        F: Fn(StepContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, StepError>> + Send + 'static,
    {
        Self {
            spec,
            func: Arc::new(move |ctx, input| func(ctx, input).boxed()),
        }
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.spec.condition = Some(condition);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.spec.timeout = Some(timeout);
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.spec.max_attempts = Some(attempts);
        self
    }
}

#[async_trait]
impl Step for FnStep {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn depends_on(&self) -> &[String] {
        &self.spec.depends_on
    }

    fn condition(&self) -> Option<&Condition> {
        self.spec.condition.as_ref()
    }

    fn timeout(&self) -> Option<Duration> {
        self.spec.timeout
    }

    fn max_attempts(&self) -> Option<u32> {
        self.spec.max_attempts
    }

    async fn execute(&self, ctx: &StepContext, input: &Value) -> Result<Value, StepError> {
        (self.func)(ctx.clone(), input.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx_with(input: Value, outputs: Value) -> StepContext {
        let outputs = match outputs {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        StepContext::new(
            "wf",
            1,
            Arc::new(input),
            Arc::new(outputs),
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_from_message_classification() {
        assert!(matches!(
            StepError::from_message("HTTP 503 Service Unavailable"),
            StepError::Retryable(_)
        ));
        assert!(matches!(
            StepError::from_message("connection reset by peer"),
            StepError::Retryable(_)
        ));
        assert!(matches!(
            StepError::from_message("Authentication failed"),
            StepError::NonRetryable(_)
        ));
        assert!(matches!(
            StepError::from_message("404 page Not Found"),
            StepError::NonRetryable(_)
        ));
    }

    #[test]
    fn test_timeout_retryability_is_configurable() {
        let err = StepError::Timeout(Duration::from_secs(1));
        assert!(err.is_retryable(true));
        assert!(!err.is_retryable(false));
        assert!(!StepError::Cancelled.is_retryable(true));
        assert!(!StepError::non_retryable("bad").is_retryable(true));
    }

    #[test]
    fn test_step_error_serde() {
        let err = StepError::retryable("flaky");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json, json!({"kind": "retryable", "detail": "flaky"}));
        let back: StepError = serde_json::from_value(json).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn test_get_path_resolves_input_and_outputs() {
        let ctx = ctx_with(
            json!({"topic": "rust"}),
            json!({"research": {"sources": ["a", "b"], "score": 0.9}}),
        );

        assert_eq!(ctx.get_path("input.topic"), Some(&json!("rust")));
        assert_eq!(ctx.get_path("research.score"), Some(&json!(0.9)));
        assert_eq!(ctx.get_path("research.sources.1"), Some(&json!("b")));
        assert_eq!(ctx.get_path("research.missing"), None);
        assert_eq!(ctx.get_path("unknown"), None);
    }

    #[test]
    fn test_dependency_output_missing_is_terminal() {
        let ctx = ctx_with(json!({}), json!({"a": 1}));
        assert_eq!(ctx.dependency_output("a").unwrap(), &json!(1));
        assert!(matches!(
            ctx.dependency_output("b"),
            Err(StepError::NonRetryable(_))
        ));
    }

    #[tokio::test]
    async fn test_fn_step_runs_closure() {
        let step = FnStep::new("double", ["source"], |ctx, _input| async move {
            let n = ctx.dependency_output("source")?.as_i64().unwrap_or(0);
            Ok(json!(n * 2))
        })
        .with_max_attempts(5);

        assert_eq!(step.name(), "double");
        assert_eq!(step.depends_on(), &["source".to_string()]);
        assert_eq!(step.max_attempts(), Some(5));

        let ctx = ctx_with(json!({}), json!({"source": 21}));
        let out = step.execute(&ctx, &json!({})).await.unwrap();
        assert_eq!(out, json!(42));
    }
}
