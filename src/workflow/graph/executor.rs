// SPDX-License-Identifier: MIT

//! Layered workflow executor
//!
//! A run walks the dependency graph one layer at a time:
//! 1. Evaluate each pending step's condition against the context as it stood
//!    when the layer started. A false condition skips the step and every
//!    step downstream of it.
//! 2. Spawn one task per remaining step. A task owns its retry loop, so a
//!    backoff sleep never holds up the other steps of the layer. Attempts
//!    across all runs share one semaphore, which bounds in-flight work.
//! 3. Tasks report back over a channel. Only this loop mutates the
//!    `WorkflowState`, and it checkpoints after every transition.
//! 4. The next layer starts once every step of the current one is terminal.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::dag::DependencyGraph;
use crate::sdk::error::{ExecutorError, ValidationError};
use crate::sdk::progress::{Notifier, ProgressEmitter, ProgressEvent};
use crate::sdk::step::{Step, StepContext, StepError};
use crate::workflow::retry::RetryPolicy;
use crate::workflow::state::{
    SkipReason, StateStore, StepStatus, WorkflowState, WorkflowStatus,
};

/// Runtime knobs for the executor
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum step attempts running at once, across every workflow this
    /// executor hosts
    pub max_in_flight: usize,
    /// Per-attempt timeout for steps that do not declare their own
    pub step_timeout: Option<Duration>,
    /// Bound on each progress callback and on draining them at the end of a run
    pub listener_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 5,
            step_timeout: Some(Duration::from_secs(30)),
            listener_timeout: Duration::from_secs(1),
        }
    }
}

/// Messages from step tasks back to the run loop
#[derive(Debug)]
enum StepEvent {
    Started {
        step: String,
        attempt: u32,
    },
    Completed {
        step: String,
        output: Value,
    },
    Failed {
        step: String,
        attempt: u32,
        error: StepError,
        will_retry: bool,
    },
    /// The workflow was cancelled while the step was queued, running or backing off
    Interrupted {
        step: String,
    },
}

/// Everything a step task needs, owned
struct StepJob {
    workflow_id: String,
    step: Arc<dyn Step>,
    first_attempt: u32,
    max_attempts: u32,
    timeout: Option<Duration>,
    input: Arc<Value>,
    outputs: Arc<Map<String, Value>>,
    policy: RetryPolicy,
    permits: Arc<Semaphore>,
    token: CancellationToken,
}

/// Removes the running-registry entry when a run ends, however it ends
struct RunGuard<'a> {
    running: &'a DashMap<String, CancellationToken>,
    workflow_id: String,
    token: CancellationToken,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.running.remove(&self.workflow_id);
    }
}

/// Executes, resumes and cancels workflows against a `StateStore`
pub struct WorkflowExecutor {
    store: Arc<dyn StateStore>,
    config: ExecutorConfig,
    policy: RetryPolicy,
    emitter: Option<Arc<dyn ProgressEmitter>>,
    permits: Arc<Semaphore>,
    running: DashMap<String, CancellationToken>,
    known_steps: DashMap<String, Vec<Arc<dyn Step>>>,
}

impl WorkflowExecutor {
    pub fn new(store: Arc<dyn StateStore>, config: ExecutorConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_in_flight.max(1)));
        Self {
            store,
            config,
            policy: RetryPolicy::default(),
            emitter: None,
            permits,
            running: DashMap::new(),
            known_steps: DashMap::new(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Listener used by every run that does not bring its own
    pub fn with_emitter(mut self, emitter: Arc<dyn ProgressEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Whether a run for `workflow_id` is in progress in this executor
    pub fn is_running(&self, workflow_id: &str) -> bool {
        self.running.contains_key(workflow_id)
    }

    /// Validate `steps`, persist a fresh state and run it to completion.
    ///
    /// Step failures are recorded in the returned state. Only validation and
    /// store failures are returned as errors; a validation error means
    /// nothing was persisted.
    pub async fn execute(
        &self,
        workflow_id: &str,
        steps: Vec<Arc<dyn Step>>,
        input: Value,
    ) -> Result<WorkflowState, ExecutorError> {
        self.execute_inner(workflow_id, steps, input, self.emitter.clone())
            .await
    }

    /// `execute` with a listener for this run only
    pub async fn execute_with_emitter(
        &self,
        workflow_id: &str,
        steps: Vec<Arc<dyn Step>>,
        input: Value,
        emitter: Arc<dyn ProgressEmitter>,
    ) -> Result<WorkflowState, ExecutorError> {
        self.execute_inner(workflow_id, steps, input, Some(emitter))
            .await
    }

    async fn execute_inner(
        &self,
        workflow_id: &str,
        steps: Vec<Arc<dyn Step>>,
        input: Value,
        emitter: Option<Arc<dyn ProgressEmitter>>,
    ) -> Result<WorkflowState, ExecutorError> {
        let graph = DependencyGraph::from_steps(&steps)?;
        let guard = self.claim(workflow_id)?;

        let mut state = WorkflowState::new(workflow_id, input, &graph);
        state.status = WorkflowStatus::Running;
        self.checkpoint(&state).await?;
        self.known_steps
            .insert(workflow_id.to_string(), steps.clone());

        log::info!(
            "[{}] workflow started: {} steps in {} layers",
            workflow_id,
            graph.len(),
            graph.layers().len()
        );
        self.drive(state, &graph, &steps, &guard.token, emitter)
            .await
    }

    /// Resume a workflow whose steps this executor has seen before
    pub async fn resume(&self, workflow_id: &str) -> Result<WorkflowState, ExecutorError> {
        self.resume_inner(workflow_id, None).await
    }

    /// Resume with an explicit step set, e.g. after a process restart.
    /// The steps must match the persisted step set.
    pub async fn resume_with_steps(
        &self,
        workflow_id: &str,
        steps: Vec<Arc<dyn Step>>,
    ) -> Result<WorkflowState, ExecutorError> {
        self.resume_inner(workflow_id, Some(steps)).await
    }

    async fn resume_inner(
        &self,
        workflow_id: &str,
        steps: Option<Vec<Arc<dyn Step>>>,
    ) -> Result<WorkflowState, ExecutorError> {
        let guard = self.claim(workflow_id)?;
        let mut state = self.store.load(workflow_id).await?;

        if state
            .steps
            .values()
            .all(|s| matches!(s.status, StepStatus::Completed | StepStatus::Skipped))
        {
            // the run may have stopped between its last step and its final checkpoint
            if !matches!(
                state.status,
                WorkflowStatus::Completed | WorkflowStatus::Failed
            ) {
                state.status = state.settled_status();
                state.finished_at.get_or_insert_with(chrono::Utc::now);
                state.touch();
                self.checkpoint(&state).await?;
                log::info!("[{}] settled as {:?}", workflow_id, state.status);
            } else {
                log::info!("[{}] nothing to resume", workflow_id);
            }
            self.forget_if_completed(&state);
            return Ok(state);
        }

        let supplied = steps.is_some();
        let steps = match steps {
            Some(steps) => steps,
            None => self
                .known_steps
                .get(workflow_id)
                .map(|entry| entry.value().clone())
                .ok_or_else(|| ExecutorError::UnknownSteps(workflow_id.to_string()))?,
        };

        let graph = DependencyGraph::build(state.step_set())?;
        verify_step_set(&graph, &steps)?;
        if supplied {
            self.known_steps
                .insert(workflow_id.to_string(), steps.clone());
        }

        let mut reset = Vec::new();
        for (name, step) in &state.steps {
            let rerun = match step.status {
                StepStatus::Completed => false,
                StepStatus::Skipped => {
                    matches!(step.skip_reason, Some(SkipReason::UpstreamFailed(_)))
                }
                StepStatus::Pending | StepStatus::Running | StepStatus::Failed => true,
            };
            if rerun {
                reset.push(name.clone());
            }
        }
        for name in &reset {
            state.reset_pending(name);
        }
        state.context = state
            .steps
            .iter()
            .filter(|(_, s)| s.status == StepStatus::Completed)
            .filter_map(|(name, s)| s.output.clone().map(|out| (name.clone(), out)))
            .collect();
        state.status = WorkflowStatus::Running;
        state.finished_at = None;
        state.touch();
        self.checkpoint(&state).await?;

        log::info!(
            "[{}] resuming: {} steps re-enter scheduling",
            workflow_id,
            reset.len()
        );
        self.drive(state, &graph, &steps, &guard.token, self.emitter.clone())
            .await
    }

    /// Stop a workflow.
    ///
    /// A run in progress is signalled; its in-flight steps return to Pending
    /// and the run saves a Cancelled state before `execute`/`resume`
    /// returns. A workflow not running here has its persisted state marked
    /// Cancelled unless it already finished.
    pub async fn cancel(&self, workflow_id: &str) -> Result<(), ExecutorError> {
        if let Some(token) = self.running.get(workflow_id).map(|e| e.value().clone()) {
            log::info!("[{}] cancellation requested", workflow_id);
            token.cancel();
            return Ok(());
        }

        let mut state = self.store.load(workflow_id).await?;
        if matches!(
            state.status,
            WorkflowStatus::Pending | WorkflowStatus::Running
        ) {
            state.status = WorkflowStatus::Cancelled;
            state.touch();
            self.checkpoint(&state).await?;
            log::info!("[{}] marked cancelled", workflow_id);
        }
        Ok(())
    }

    fn claim(&self, workflow_id: &str) -> Result<RunGuard<'_>, ExecutorError> {
        match self.running.entry(workflow_id.to_string()) {
            Entry::Occupied(_) => Err(ExecutorError::AlreadyRunning(workflow_id.to_string())),
            Entry::Vacant(slot) => {
                let token = CancellationToken::new();
                slot.insert(token.clone());
                Ok(RunGuard {
                    running: &self.running,
                    workflow_id: workflow_id.to_string(),
                    token,
                })
            }
        }
    }

    /// A completed run is never resumed into work again, so its steps can go
    fn forget_if_completed(&self, state: &WorkflowState) {
        if state.status == WorkflowStatus::Completed {
            self.known_steps.remove(&state.workflow_id);
        }
    }

    async fn checkpoint(&self, state: &WorkflowState) -> Result<(), ExecutorError> {
        self.store.save(state).await.map_err(|e| {
            log::error!("[{}] checkpoint failed: {}", state.workflow_id, e);
            ExecutorError::Store(e)
        })
    }

    async fn drive(
        &self,
        mut state: WorkflowState,
        graph: &DependencyGraph,
        steps: &[Arc<dyn Step>],
        token: &CancellationToken,
        emitter: Option<Arc<dyn ProgressEmitter>>,
    ) -> Result<WorkflowState, ExecutorError> {
        let notifier = Notifier::spawn(emitter, self.config.listener_timeout);
        let by_name: HashMap<&str, &Arc<dyn Step>> =
            steps.iter().map(|s| (s.name(), s)).collect();

        let result = self
            .run_layers(&mut state, graph, &by_name, token, &notifier)
            .await;
        if let Err(err) = result {
            token.cancel();
            notifier.finish().await;
            return Err(err);
        }

        if token.is_cancelled() && !state.is_settled() {
            state.status = WorkflowStatus::Cancelled;
            log::info!("[{}] workflow cancelled", state.workflow_id);
        } else {
            state.status = state.settled_status();
            state.finished_at = Some(chrono::Utc::now());
            log::info!(
                "[{}] workflow finished: {:?} ({} completed, {} failed)",
                state.workflow_id,
                state.status,
                state.completed_steps().len(),
                state.failed_steps().len()
            );
        }
        state.touch();
        self.checkpoint(&state).await?;
        self.forget_if_completed(&state);

        notifier.emit(ProgressEvent::WorkflowCompleted {
            workflow_id: state.workflow_id.clone(),
            state: Box::new(state.clone()),
        });
        notifier.finish().await;
        Ok(state)
    }

    async fn run_layers(
        &self,
        state: &mut WorkflowState,
        graph: &DependencyGraph,
        by_name: &HashMap<&str, &Arc<dyn Step>>,
        token: &CancellationToken,
        notifier: &Notifier,
    ) -> Result<(), ExecutorError> {
        let workflow_id = state.workflow_id.clone();

        for (index, layer) in graph.layers().iter().enumerate() {
            if token.is_cancelled() {
                break;
            }

            let pending: Vec<&str> = layer
                .iter()
                .map(String::as_str)
                .filter(|name| state.step_status(name) == Some(StepStatus::Pending))
                .collect();
            if pending.is_empty() {
                continue;
            }
            log::info!(
                "[{}] layer {}: {} pending steps",
                workflow_id,
                index,
                pending.len()
            );

            let input = Arc::new(state.input.clone());
            let outputs = Arc::new(state.context.clone());
            let mut jobs = Vec::new();
            let mut skipped_any = false;

            for name in pending {
                // steps can be skipped by propagation from earlier in this loop
                if state.step_status(name) != Some(StepStatus::Pending) {
                    continue;
                }

                if let Some(reason) = blocked_by(state, graph, name) {
                    skip(state, graph, name, reason, notifier);
                    skipped_any = true;
                    continue;
                }

                let Some(step) = by_name.get(name).copied() else {
                    let error = StepError::non_retryable(format!(
                        "no implementation for step '{}'",
                        name
                    ));
                    fail(state, graph, name, error, notifier);
                    skipped_any = true;
                    continue;
                };

                let first_attempt = state
                    .step(name)
                    .map(|s| s.attempts)
                    .unwrap_or_default()
                    + 1;

                if let Some(condition) = step.condition() {
                    let ctx = StepContext::new(
                        workflow_id.clone(),
                        first_attempt,
                        input.clone(),
                        outputs.clone(),
                        token.clone(),
                    );
                    if !condition.evaluate(&ctx) {
                        log::debug!(
                            "[{}] condition {:?} false for '{}'",
                            workflow_id,
                            condition,
                            name
                        );
                        skip(state, graph, name, SkipReason::ConditionFalse, notifier);
                        skipped_any = true;
                        continue;
                    }
                }

                jobs.push(StepJob {
                    workflow_id: workflow_id.clone(),
                    step: step.clone(),
                    first_attempt,
                    max_attempts: step
                        .max_attempts()
                        .unwrap_or(self.policy.max_attempts())
                        .max(1),
                    timeout: step.timeout().or(self.config.step_timeout),
                    input: input.clone(),
                    outputs: outputs.clone(),
                    policy: self.policy.clone(),
                    permits: self.permits.clone(),
                    token: token.clone(),
                });
            }

            if skipped_any {
                self.checkpoint(state).await?;
            }
            if !jobs.is_empty() {
                self.run_layer(state, graph, jobs, token, notifier).await?;
            }
        }
        Ok(())
    }

    async fn run_layer(
        &self,
        state: &mut WorkflowState,
        graph: &DependencyGraph,
        jobs: Vec<StepJob>,
        token: &CancellationToken,
        notifier: &Notifier,
    ) -> Result<(), ExecutorError> {
        let workflow_id = state.workflow_id.clone();
        let dispatched: Vec<String> = jobs.iter().map(|j| j.step.name().to_string()).collect();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tasks = JoinSet::new();
        for job in jobs {
            tasks.spawn(run_step(job, tx.clone()));
        }
        drop(tx);

        while let Some(event) = rx.recv().await {
            match event {
                StepEvent::Started { step, attempt } => {
                    log::info!("[{}] step '{}' attempt {}", workflow_id, step, attempt);
                    state.mark_running(&step, attempt);
                    notifier.emit(ProgressEvent::StepStarted {
                        workflow_id: workflow_id.clone(),
                        step,
                        attempt,
                    });
                }
                StepEvent::Completed { step, output } => {
                    log::info!("[{}] step '{}' completed", workflow_id, step);
                    state.mark_completed(&step, output.clone());
                    notifier.emit(ProgressEvent::StepCompleted {
                        workflow_id: workflow_id.clone(),
                        step,
                        output,
                    });
                }
                StepEvent::Failed {
                    step,
                    attempt,
                    error,
                    will_retry,
                } => {
                    notifier.emit(ProgressEvent::StepFailed {
                        workflow_id: workflow_id.clone(),
                        step: step.clone(),
                        error: error.clone(),
                        attempt,
                        will_retry,
                    });
                    if will_retry {
                        log::warn!(
                            "[{}] step '{}' attempt {} failed, retrying: {}",
                            workflow_id,
                            step,
                            attempt,
                            error
                        );
                        state.mark_retrying(&step, error);
                    } else {
                        log::error!(
                            "[{}] step '{}' failed after {} attempts: {}",
                            workflow_id,
                            step,
                            attempt,
                            error
                        );
                        fail(state, graph, &step, error, notifier);
                    }
                }
                StepEvent::Interrupted { step } => {
                    log::info!("[{}] step '{}' interrupted", workflow_id, step);
                    state.reset_pending(&step);
                    state.record_attempt_error(&step, StepError::Cancelled);
                }
            }
            self.checkpoint(state).await?;
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                log::error!("[{}] step task ended abnormally: {}", workflow_id, err);
            }
        }

        // a task that died without reporting leaves its step mid-flight
        let mut repaired = false;
        for name in &dispatched {
            let status = state.step_status(name);
            if !matches!(status, Some(StepStatus::Running | StepStatus::Pending)) {
                continue;
            }
            if token.is_cancelled() {
                if status == Some(StepStatus::Running) {
                    state.reset_pending(name);
                    repaired = true;
                }
            } else {
                let error = StepError::non_retryable("step task terminated unexpectedly");
                fail(state, graph, name, error, notifier);
                repaired = true;
            }
        }
        if repaired {
            self.checkpoint(state).await?;
        }
        Ok(())
    }
}

/// Reason a pending step can no longer run, if any of its dependencies
/// ended without completing
fn blocked_by(state: &WorkflowState, graph: &DependencyGraph, name: &str) -> Option<SkipReason> {
    for dep in graph.dependencies(name) {
        match state.step_status(dep) {
            Some(StepStatus::Failed) => return Some(SkipReason::UpstreamFailed(dep.clone())),
            Some(StepStatus::Skipped) => {
                let reason = match state.step(dep).and_then(|s| s.skip_reason.as_ref()) {
                    Some(SkipReason::UpstreamFailed(_)) => SkipReason::UpstreamFailed(dep.clone()),
                    _ => SkipReason::UpstreamSkipped(dep.clone()),
                };
                return Some(reason);
            }
            _ => {}
        }
    }
    None
}

fn skip(
    state: &mut WorkflowState,
    graph: &DependencyGraph,
    name: &str,
    reason: SkipReason,
    notifier: &Notifier,
) {
    let downstream = match reason {
        SkipReason::UpstreamFailed(_) => SkipReason::UpstreamFailed(name.to_string()),
        _ => SkipReason::UpstreamSkipped(name.to_string()),
    };
    mark_skipped(state, name, reason, notifier);
    propagate(state, graph, name, downstream, notifier);
}

fn fail(
    state: &mut WorkflowState,
    graph: &DependencyGraph,
    name: &str,
    error: StepError,
    notifier: &Notifier,
) {
    state.mark_failed(name, error);
    propagate(
        state,
        graph,
        name,
        SkipReason::UpstreamFailed(name.to_string()),
        notifier,
    );
}

/// Skip every non-terminal step downstream of `name`
fn propagate(
    state: &mut WorkflowState,
    graph: &DependencyGraph,
    name: &str,
    reason: SkipReason,
    notifier: &Notifier,
) {
    for dependent in graph.transitive_dependents(name) {
        let terminal = state
            .step_status(dependent)
            .map_or(true, StepStatus::is_terminal);
        if !terminal {
            mark_skipped(state, dependent, reason.clone(), notifier);
        }
    }
}

fn mark_skipped(state: &mut WorkflowState, name: &str, reason: SkipReason, notifier: &Notifier) {
    log::debug!("[{}] skipping '{}': {}", state.workflow_id, name, reason);
    state.mark_skipped(name, reason.clone());
    notifier.emit(ProgressEvent::StepSkipped {
        workflow_id: state.workflow_id.clone(),
        step: name.to_string(),
        reason,
    });
}

/// Stored step set and supplied steps must agree on names and dependencies
fn verify_step_set(graph: &DependencyGraph, steps: &[Arc<dyn Step>]) -> Result<(), ValidationError> {
    let supplied: HashMap<&str, HashSet<&str>> = steps
        .iter()
        .map(|s| (s.name(), s.depends_on().iter().map(String::as_str).collect()))
        .collect();

    if supplied.len() != steps.len() {
        return Err(ValidationError::StepSetMismatch(
            "supplied steps contain duplicate names".into(),
        ));
    }
    if supplied.len() != graph.len() {
        return Err(ValidationError::StepSetMismatch(format!(
            "{} steps supplied, {} persisted",
            supplied.len(),
            graph.len()
        )));
    }
    for name in graph.step_names() {
        let Some(deps) = supplied.get(name) else {
            return Err(ValidationError::StepSetMismatch(format!(
                "persisted step '{}' was not supplied",
                name
            )));
        };
        let stored: HashSet<&str> = graph.dependencies(name).iter().map(String::as_str).collect();
        if *deps != stored {
            return Err(ValidationError::StepSetMismatch(format!(
                "dependencies of step '{}' changed",
                name
            )));
        }
    }
    Ok(())
}

async fn run_attempt(
    step: &Arc<dyn Step>,
    ctx: &StepContext,
    input: &Value,
    timeout: Option<Duration>,
) -> Result<Value, StepError> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, step.execute(ctx, input))
            .await
            .unwrap_or(Err(StepError::Timeout(limit))),
        None => step.execute(ctx, input).await,
    }
}

/// Attempt loop for one step. Runs until the step completes, fails
/// terminally, or the workflow is cancelled.
async fn run_step(job: StepJob, tx: mpsc::UnboundedSender<StepEvent>) {
    let name = job.step.name().to_string();
    let mut attempt = job.first_attempt;

    loop {
        let permit = tokio::select! {
            _ = job.token.cancelled() => None,
            permit = job.permits.clone().acquire_owned() => permit.ok(),
        };
        let Some(permit) = permit else {
            let _ = tx.send(StepEvent::Interrupted { step: name });
            return;
        };

        let _ = tx.send(StepEvent::Started {
            step: name.clone(),
            attempt,
        });
        let ctx = StepContext::new(
            job.workflow_id.clone(),
            attempt,
            job.input.clone(),
            job.outputs.clone(),
            job.token.clone(),
        );

        let outcome = tokio::select! {
            biased;
            _ = job.token.cancelled() => Err(StepError::Cancelled),
            result = run_attempt(&job.step, &ctx, &job.input, job.timeout) => result,
        };

        let error = match outcome {
            Ok(output) => {
                let _ = tx.send(StepEvent::Completed { step: name, output });
                return;
            }
            Err(_) if job.token.is_cancelled() => {
                let _ = tx.send(StepEvent::Interrupted { step: name });
                return;
            }
            Err(error) => error,
        };

        let will_retry = job
            .policy
            .should_retry_within(&error, attempt, job.max_attempts);
        let _ = tx.send(StepEvent::Failed {
            step: name.clone(),
            attempt,
            error,
            will_retry,
        });
        drop(permit);
        if !will_retry {
            return;
        }

        let delay = job.policy.backoff_delay(attempt);
        tokio::select! {
            _ = job.token.cancelled() => {
                let _ = tx.send(StepEvent::Interrupted { step: name });
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdk::step::FnStep;
    use crate::workflow::condition::Condition;
    use crate::workflow::state::InMemoryStateStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    fn executor(store: Arc<InMemoryStateStore>) -> WorkflowExecutor {
        WorkflowExecutor::new(store, ExecutorConfig::default()).with_retry_policy(
            RetryPolicy::new()
                .with_base_delay(Duration::from_millis(1))
                .with_max_delay(Duration::from_millis(5)),
        )
    }

    fn ok_step(name: &str, deps: &[&str]) -> Arc<dyn Step> {
        let label = name.to_string();
        Arc::new(FnStep::new(name, deps.to_vec(), move |_ctx, _input| {
            let label = label.clone();
            async move { Ok(json!(label)) }
        }))
    }

    #[tokio::test]
    async fn test_linear_chain_passes_outputs() {
        let store = Arc::new(InMemoryStateStore::new());
        let steps: Vec<Arc<dyn Step>> = vec![
            ok_step("a", &[]),
            Arc::new(FnStep::new("b", ["a"], |ctx, _input| async move {
                let upstream = ctx.dependency_output("a")?.clone();
                Ok(json!({"saw": upstream}))
            })),
        ];

        let state = executor(store.clone())
            .execute("chain", steps, json!({}))
            .await
            .unwrap();

        assert_eq!(state.status, WorkflowStatus::Completed);
        assert_eq!(state.output("b"), Some(&json!({"saw": "a"})));
        assert_eq!(store.load("chain").await.unwrap(), state);
    }

    #[tokio::test]
    async fn test_retry_then_succeed() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let flaky: Arc<dyn Step> = Arc::new(FnStep::new(
            "flaky",
            Vec::<String>::new(),
            move |ctx, _input| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if ctx.attempt() < 3 {
                        Err(StepError::retryable("try again"))
                    } else {
                        Ok(json!(ctx.attempt()))
                    }
                }
            },
        ));

        let state = executor(Arc::new(InMemoryStateStore::new()))
            .execute("retry", vec![flaky], json!(null))
            .await
            .unwrap();

        assert_eq!(state.status, WorkflowStatus::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(state.step("flaky").unwrap().attempts, 3);
        assert_eq!(state.output("flaky"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let bad: Arc<dyn Step> = Arc::new(FnStep::new(
            "bad",
            Vec::<String>::new(),
            move |_ctx, _input| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(StepError::non_retryable("malformed"))
                }
            },
        ));

        let state = executor(Arc::new(InMemoryStateStore::new()))
            .execute("bad", vec![bad, ok_step("after", &["bad"])], json!(null))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(state.status, WorkflowStatus::Failed);
        assert_eq!(state.step_status("after"), Some(StepStatus::Skipped));
        assert_eq!(
            state.step("after").unwrap().skip_reason,
            Some(SkipReason::UpstreamFailed("bad".into()))
        );
    }

    #[tokio::test]
    async fn test_timeout_is_retried_then_fails() {
        let slow: Arc<dyn Step> = Arc::new(
            FnStep::new("slow", Vec::<String>::new(), |_ctx, _input| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(json!(null))
            })
            .with_timeout(Duration::from_millis(10))
            .with_max_attempts(2),
        );

        let state = executor(Arc::new(InMemoryStateStore::new()))
            .execute("slow", vec![slow], json!(null))
            .await
            .unwrap();

        let step = state.step("slow").unwrap();
        assert_eq!(step.status, StepStatus::Failed);
        assert_eq!(step.attempts, 2);
        assert_eq!(
            step.last_error,
            Some(StepError::Timeout(Duration::from_millis(10)))
        );
    }

    #[tokio::test]
    async fn test_condition_false_skips_downstream() {
        let gated: Arc<dyn Step> = Arc::new(
            FnStep::new("publish", ["draft"], |_ctx, _input| async { Ok(json!("published")) })
                .with_condition(Condition::parse("input.publish == true").unwrap()),
        );
        let steps = vec![ok_step("draft", &[]), gated, ok_step("announce", &["publish"])];

        let state = executor(Arc::new(InMemoryStateStore::new()))
            .execute("gated", steps, json!({"publish": false}))
            .await
            .unwrap();

        assert_eq!(state.status, WorkflowStatus::Completed);
        assert_eq!(
            state.step("publish").unwrap().skip_reason,
            Some(SkipReason::ConditionFalse)
        );
        assert_eq!(
            state.step("announce").unwrap().skip_reason,
            Some(SkipReason::UpstreamSkipped("publish".into()))
        );
        assert_eq!(state.step("announce").unwrap().attempts, 0);
    }

    #[tokio::test]
    async fn test_validation_error_persists_nothing() {
        let store = Arc::new(InMemoryStateStore::new());
        let err = executor(store.clone())
            .execute("bad", vec![ok_step("a", &["b"]), ok_step("b", &["a"])], json!(null))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ExecutorError::Validation(ValidationError::CycleDetected(_))
        ));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let steps: Vec<Arc<dyn Step>> = (0..6)
            .map(|i| {
                let current = current.clone();
                let peak = peak.clone();
                Arc::new(FnStep::new(
                    format!("s{}", i),
                    Vec::<String>::new(),
                    move |_ctx, _input| {
                        let current = current.clone();
                        let peak = peak.clone();
                        async move {
                            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            current.fetch_sub(1, Ordering::SeqCst);
                            Ok(json!(null))
                        }
                    },
                )) as Arc<dyn Step>
            })
            .collect();

        let config = ExecutorConfig {
            max_in_flight: 2,
            ..ExecutorConfig::default()
        };
        let state = WorkflowExecutor::new(Arc::new(InMemoryStateStore::new()), config)
            .execute("bounded", steps, json!(null))
            .await
            .unwrap();

        assert_eq!(state.status, WorkflowStatus::Completed);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_panicking_step_is_failed() {
        let boom: Arc<dyn Step> = Arc::new(FnStep::new(
            "boom",
            Vec::<String>::new(),
            |_ctx, _input| async {
                if true {
                    panic!("step blew up");
                }
                Ok(json!(null))
            },
        ));

        let state = executor(Arc::new(InMemoryStateStore::new()))
            .execute("panic", vec![boom, ok_step("next", &["boom"])], json!(null))
            .await
            .unwrap();

        assert_eq!(state.step_status("boom"), Some(StepStatus::Failed));
        assert_eq!(state.step_status("next"), Some(StepStatus::Skipped));
        assert_eq!(state.status, WorkflowStatus::Failed);
    }

    #[tokio::test]
    async fn test_resume_unknown_workflow() {
        let err = executor(Arc::new(InMemoryStateStore::new()))
            .resume("missing")
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::NotFound(id) if id == "missing"));
    }

    #[tokio::test]
    async fn test_resume_rejects_changed_step_set() {
        let store = Arc::new(InMemoryStateStore::new());
        let failing: Arc<dyn Step> = Arc::new(FnStep::new(
            "a",
            Vec::<String>::new(),
            |_ctx, _input| async { Err(StepError::non_retryable("no")) },
        ));
        executor(store.clone())
            .execute("wf", vec![failing], json!(null))
            .await
            .unwrap();

        let err = executor(store)
            .resume_with_steps("wf", vec![ok_step("a", &[]), ok_step("extra", &[])])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExecutorError::Validation(ValidationError::StepSetMismatch(_))
        ));
    }

    #[tokio::test]
    async fn test_resume_without_steps_needs_prior_run() {
        let store = Arc::new(InMemoryStateStore::new());
        let failing: Arc<dyn Step> = Arc::new(FnStep::new(
            "a",
            Vec::<String>::new(),
            |_ctx, _input| async { Err(StepError::non_retryable("no")) },
        ));
        executor(store.clone())
            .execute("wf", vec![failing], json!(null))
            .await
            .unwrap();

        let err = executor(store).resume("wf").await.unwrap_err();
        assert!(matches!(err, ExecutorError::UnknownSteps(_)));
    }

    /// Fails terminally on its first call, succeeds afterwards
    fn fails_once(name: &str) -> Arc<dyn Step> {
        let calls = Arc::new(AtomicU32::new(0));
        Arc::new(FnStep::new(name, Vec::<String>::new(), move |_ctx, _input| {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(StepError::non_retryable("first run fails"))
                } else {
                    Ok(json!("recovered"))
                }
            }
        }))
    }

    #[tokio::test]
    async fn test_rejected_resume_keeps_known_steps() {
        let exec = executor(Arc::new(InMemoryStateStore::new()));
        let failed = exec
            .execute("wf", vec![fails_once("a")], json!(null))
            .await
            .unwrap();
        assert_eq!(failed.status, WorkflowStatus::Failed);

        let err = exec
            .resume_with_steps("wf", vec![ok_step("x", &[])])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExecutorError::Validation(ValidationError::StepSetMismatch(_))
        ));

        let resumed = exec.resume("wf").await.unwrap();
        assert_eq!(resumed.status, WorkflowStatus::Completed);
        assert_eq!(resumed.output("a"), Some(&json!("recovered")));
    }

    #[tokio::test]
    async fn test_resume_settles_workflow_with_only_terminal_steps() {
        let store = Arc::new(InMemoryStateStore::new());
        let none: Vec<String> = vec![];
        let graph = DependencyGraph::build([("a", none.as_slice())]).unwrap();

        for (id, status) in [
            ("crash", WorkflowStatus::Running),
            ("late-cancel", WorkflowStatus::Cancelled),
        ] {
            let mut state = WorkflowState::new(id, json!(null), &graph);
            state.status = status;
            state.mark_completed("a", json!("a"));
            store.save(&state).await.unwrap();
        }

        let exec = executor(store.clone());
        for id in ["crash", "late-cancel"] {
            let resumed = exec.resume(id).await.unwrap();
            assert_eq!(resumed.status, WorkflowStatus::Completed);
            assert!(resumed.finished_at.is_some());
            assert_eq!(store.load(id).await.unwrap(), resumed);
        }
    }

    #[tokio::test]
    async fn test_completed_runs_release_their_steps() {
        let exec = executor(Arc::new(InMemoryStateStore::new()));
        exec.execute("done", vec![ok_step("a", &[])], json!(null))
            .await
            .unwrap();
        assert!(!exec.known_steps.contains_key("done"));

        exec.execute("broken", vec![fails_once("a")], json!(null))
            .await
            .unwrap();
        assert!(exec.known_steps.contains_key("broken"));

        exec.resume("broken").await.unwrap();
        assert!(!exec.known_steps.contains_key("broken"));
    }

    #[tokio::test]
    async fn test_cancel_persisted_workflow() {
        let store = Arc::new(InMemoryStateStore::new());
        let none: Vec<String> = vec![];
        let graph = DependencyGraph::build([("a", none.as_slice())]).unwrap();
        let mut state = WorkflowState::new("idle", json!(null), &graph);
        state.status = WorkflowStatus::Running;
        store.save(&state).await.unwrap();

        let exec = executor(store.clone());
        exec.cancel("idle").await.unwrap();
        assert_eq!(
            store.load("idle").await.unwrap().status,
            WorkflowStatus::Cancelled
        );
        assert!(matches!(
            exec.cancel("ghost").await,
            Err(ExecutorError::NotFound(_))
        ));
    }
}
