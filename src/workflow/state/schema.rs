// SPDX-License-Identifier: MIT

//! Persisted workflow state
//!
//! `WorkflowState` is the unit a `StateStore` saves and loads. It carries
//! the step set (names and dependencies) so a resume can rebuild the graph
//! without the original definition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

use crate::sdk::step::StepError;
use crate::workflow::graph::dag::DependencyGraph;

/// Lifecycle of a single step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// Lifecycle of a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Why a step was skipped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "step", rename_all = "snake_case")]
pub enum SkipReason {
    /// The step's own condition evaluated false
    ConditionFalse,
    /// A (transitive) dependency was skipped
    UpstreamSkipped(String),
    /// A (transitive) dependency failed terminally
    UpstreamFailed(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConditionFalse => f.write_str("condition evaluated false"),
            Self::UpstreamSkipped(step) => write!(f, "upstream step '{}' was skipped", step),
            Self::UpstreamFailed(step) => write!(f, "upstream step '{}' failed", step),
        }
    }
}

/// State of one step within a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    pub status: StepStatus,
    /// Attempts dispatched so far, cumulative across resumes
    pub attempts: u32,
    pub depends_on: Vec<String>,
    /// Index of the layer the step belongs to
    pub layer: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<StepError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepState {
    pub fn pending(depends_on: Vec<String>, layer: usize) -> Self {
        Self {
            status: StepStatus::Pending,
            attempts: 0,
            depends_on,
            layer,
            output: None,
            last_error: None,
            skip_reason: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Snapshot of a workflow run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub steps: BTreeMap<String, StepState>,
    /// Outputs of completed steps keyed by step name
    pub context: Map<String, Value>,
    pub input: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowState {
    /// Fresh state with every step pending
    pub fn new(workflow_id: impl Into<String>, input: Value, graph: &DependencyGraph) -> Self {
        let now = Utc::now();
        let steps = graph
            .step_names()
            .map(|name| {
                let deps = graph.dependencies(name).to_vec();
                let layer = graph.layer_of(name).unwrap_or_default();
                (name.to_string(), StepState::pending(deps, layer))
            })
            .collect();

        Self {
            workflow_id: workflow_id.into(),
            status: WorkflowStatus::Pending,
            steps,
            context: Map::new(),
            input,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn step(&self, name: &str) -> Option<&StepState> {
        self.steps.get(name)
    }

    pub fn step_status(&self, name: &str) -> Option<StepStatus> {
        self.steps.get(name).map(|s| s.status)
    }

    pub fn output(&self, name: &str) -> Option<&Value> {
        self.context.get(name)
    }

    /// Names of steps currently in `status`, in name order
    pub fn steps_with_status(&self, status: StepStatus) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|(_, s)| s.status == status)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn completed_steps(&self) -> Vec<&str> {
        self.steps_with_status(StepStatus::Completed)
    }

    pub fn failed_steps(&self) -> Vec<&str> {
        self.steps_with_status(StepStatus::Failed)
    }

    /// Every step has reached a terminal state
    pub fn is_settled(&self) -> bool {
        self.steps.values().all(|s| s.status.is_terminal())
    }

    /// Status implied by the step states once the run has settled
    pub fn settled_status(&self) -> WorkflowStatus {
        if self.steps.values().any(|s| s.status == StepStatus::Failed) {
            WorkflowStatus::Failed
        } else {
            WorkflowStatus::Completed
        }
    }

    /// Persisted step set as `(name, dependencies)` pairs
    pub fn step_set(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.steps
            .iter()
            .map(|(name, s)| (name.as_str(), s.depends_on.as_slice()))
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.finished_at.map(|end| end - self.created_at)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    fn step_mut(&mut self, name: &str) -> Option<&mut StepState> {
        self.steps.get_mut(name)
    }

    /// Pending -> Running for a new attempt
    pub fn mark_running(&mut self, name: &str, attempt: u32) {
        if let Some(step) = self.step_mut(name) {
            step.status = StepStatus::Running;
            step.attempts = attempt;
            step.started_at = Some(Utc::now());
            step.finished_at = None;
        }
        self.touch();
    }

    pub fn mark_completed(&mut self, name: &str, output: Value) {
        if let Some(step) = self.step_mut(name) {
            step.status = StepStatus::Completed;
            step.output = Some(output.clone());
            step.last_error = None;
            step.finished_at = Some(Utc::now());
        }
        self.context.insert(name.to_string(), output);
        self.touch();
    }

    pub fn mark_failed(&mut self, name: &str, error: StepError) {
        if let Some(step) = self.step_mut(name) {
            step.status = StepStatus::Failed;
            step.last_error = Some(error);
            step.finished_at = Some(Utc::now());
        }
        self.touch();
    }

    /// A failed attempt that will be retried: back to Pending until the
    /// next attempt starts, attempt count and error kept
    pub fn mark_retrying(&mut self, name: &str, error: StepError) {
        if let Some(step) = self.step_mut(name) {
            step.status = StepStatus::Pending;
            step.last_error = Some(error);
            step.finished_at = None;
        }
        self.touch();
    }

    /// Record an error without changing the step's status
    pub fn record_attempt_error(&mut self, name: &str, error: StepError) {
        if let Some(step) = self.step_mut(name) {
            step.last_error = Some(error);
        }
        self.touch();
    }

    pub fn mark_skipped(&mut self, name: &str, reason: SkipReason) {
        if let Some(step) = self.step_mut(name) {
            step.status = StepStatus::Skipped;
            step.skip_reason = Some(reason);
            step.finished_at = Some(Utc::now());
        }
        self.touch();
    }

    /// Back to Pending, keeping the attempt count
    pub fn reset_pending(&mut self, name: &str) {
        if let Some(step) = self.step_mut(name) {
            step.status = StepStatus::Pending;
            step.skip_reason = None;
            step.output = None;
            step.finished_at = None;
        }
        self.context.remove(name);
        self.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn graph() -> DependencyGraph {
        let a: Vec<String> = vec![];
        let b = vec!["a".to_string()];
        DependencyGraph::build([("a", a.as_slice()), ("b", b.as_slice())]).unwrap()
    }

    #[test]
    fn test_new_state_is_all_pending() {
        let state = WorkflowState::new("wf", json!({"x": 1}), &graph());

        assert_eq!(state.status, WorkflowStatus::Pending);
        assert_eq!(state.steps.len(), 2);
        assert!(state.steps.values().all(|s| s.status == StepStatus::Pending));
        assert_eq!(state.step("b").unwrap().depends_on, vec!["a"]);
        assert_eq!(state.step("b").unwrap().layer, 1);
        assert!(!state.is_settled());
    }

    #[test]
    fn test_transitions_update_context() {
        let mut state = WorkflowState::new("wf", json!({}), &graph());
        state.mark_running("a", 1);
        assert_eq!(state.step_status("a"), Some(StepStatus::Running));

        state.mark_completed("a", json!("done"));
        assert_eq!(state.output("a"), Some(&json!("done")));
        assert_eq!(state.completed_steps(), vec!["a"]);

        state.mark_running("b", 1);
        state.mark_failed("b", StepError::non_retryable("boom"));
        assert_eq!(state.failed_steps(), vec!["b"]);
        assert!(state.is_settled());
        assert_eq!(state.settled_status(), WorkflowStatus::Failed);

        state.reset_pending("b");
        let b = state.step("b").unwrap();
        assert_eq!(b.status, StepStatus::Pending);
        assert_eq!(b.attempts, 1);
    }

    #[test]
    fn test_retrying_step_is_not_running() {
        let mut state = WorkflowState::new("wf", json!({}), &graph());
        state.mark_running("a", 2);
        state.mark_retrying("a", StepError::retryable("503"));

        let a = state.step("a").unwrap();
        assert_eq!(a.status, StepStatus::Pending);
        assert_eq!(a.attempts, 2);
        assert_eq!(a.last_error, Some(StepError::retryable("503")));
        assert!(state.steps_with_status(StepStatus::Running).is_empty());

        state.mark_running("a", 3);
        assert_eq!(state.step("a").unwrap().attempts, 3);
    }

    #[test]
    fn test_skipped_by_condition_counts_as_success() {
        let mut state = WorkflowState::new("wf", json!({}), &graph());
        state.mark_skipped("a", SkipReason::ConditionFalse);
        state.mark_skipped("b", SkipReason::UpstreamSkipped("a".into()));
        assert!(state.is_settled());
        assert_eq!(state.settled_status(), WorkflowStatus::Completed);
    }

    #[test]
    fn test_serde_round_trip_is_lossless() {
        let mut state = WorkflowState::new("wf", json!({"topic": "dags"}), &graph());
        state.mark_running("a", 2);
        state.mark_completed("a", json!({"n": [1, 2, 3]}));
        state.mark_skipped("b", SkipReason::UpstreamFailed("a".into()));

        let text = serde_json::to_string(&state).unwrap();
        let back: WorkflowState = serde_json::from_str(&text).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_skip_reason_serde_shape() {
        let json = serde_json::to_value(SkipReason::UpstreamFailed("a".into())).unwrap();
        assert_eq!(json, json!({"reason": "upstream_failed", "step": "a"}));
        let json = serde_json::to_value(SkipReason::ConditionFalse).unwrap();
        assert_eq!(json, json!({"reason": "condition_false"}));
    }
}
