// SPDX-License-Identifier: MIT

//! Progress notification for workflow runs.
//!
//! Listeners implement `ProgressEmitter`. The executor never calls a listener
//! directly: events go onto an unbounded channel drained by a delivery task
//! (`Notifier`), so a slow, failing or panicking listener cannot hold up a
//! workflow. Failures are logged and dropped.

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::sdk::step::StepError;
use crate::workflow::state::{SkipReason, WorkflowState};

/// A listener could not handle an event
#[derive(Debug, Error)]
#[error("progress listener error: {0}")]
pub struct ProgressError(pub String);

/// Events emitted over the course of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    StepStarted {
        workflow_id: String,
        step: String,
        attempt: u32,
    },
    StepCompleted {
        workflow_id: String,
        step: String,
        output: Value,
    },
    /// Emitted for every failed attempt; `will_retry` tells terminal failures apart
    StepFailed {
        workflow_id: String,
        step: String,
        error: StepError,
        attempt: u32,
        will_retry: bool,
    },
    StepSkipped {
        workflow_id: String,
        step: String,
        reason: SkipReason,
    },
    WorkflowCompleted {
        workflow_id: String,
        state: Box<WorkflowState>,
    },
}

impl ProgressEvent {
    pub fn workflow_id(&self) -> &str {
        match self {
            Self::StepStarted { workflow_id, .. }
            | Self::StepCompleted { workflow_id, .. }
            | Self::StepFailed { workflow_id, .. }
            | Self::StepSkipped { workflow_id, .. }
            | Self::WorkflowCompleted { workflow_id, .. } => workflow_id,
        }
    }
}

/// Listener for workflow progress. Every callback defaults to a no-op.
#[async_trait]
pub trait ProgressEmitter: Send + Sync {
    async fn on_step_start(&self, _workflow_id: &str, _step: &str) -> Result<(), ProgressError> {
        Ok(())
    }

    async fn on_step_complete(
        &self,
        _workflow_id: &str,
        _step: &str,
        _output: &Value,
    ) -> Result<(), ProgressError> {
        Ok(())
    }

    async fn on_step_failed(
        &self,
        _workflow_id: &str,
        _step: &str,
        _error: &StepError,
        _attempt: u32,
    ) -> Result<(), ProgressError> {
        Ok(())
    }

    async fn on_step_skipped(
        &self,
        _workflow_id: &str,
        _step: &str,
        _reason: &SkipReason,
    ) -> Result<(), ProgressError> {
        Ok(())
    }

    async fn on_workflow_complete(
        &self,
        _workflow_id: &str,
        _state: &WorkflowState,
    ) -> Result<(), ProgressError> {
        Ok(())
    }

    /// Route an event to the matching callback. Override to consume events whole.
    async fn emit(&self, event: &ProgressEvent) -> Result<(), ProgressError> {
        match event {
            ProgressEvent::StepStarted {
                workflow_id, step, ..
            } => self.on_step_start(workflow_id, step).await,
            ProgressEvent::StepCompleted {
                workflow_id,
                step,
                output,
            } => self.on_step_complete(workflow_id, step, output).await,
            ProgressEvent::StepFailed {
                workflow_id,
                step,
                error,
                attempt,
                ..
            } => self.on_step_failed(workflow_id, step, error, *attempt).await,
            ProgressEvent::StepSkipped {
                workflow_id,
                step,
                reason,
            } => self.on_step_skipped(workflow_id, step, reason).await,
            ProgressEvent::WorkflowCompleted { workflow_id, state } => {
                self.on_workflow_complete(workflow_id, state).await
            }
        }
    }
}

/// Forwards every event to a tokio channel
pub struct ChannelEmitter {
    tx: mpsc::Sender<ProgressEvent>,
}

impl ChannelEmitter {
    pub fn new(tx: mpsc::Sender<ProgressEvent>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl ProgressEmitter for ChannelEmitter {
    async fn emit(&self, event: &ProgressEvent) -> Result<(), ProgressError> {
        self.tx
            .send(event.clone())
            .await
            .map_err(|e| ProgressError(format!("receiver dropped: {}", e)))
    }
}

/// Writes progress to the `log` facade
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEmitter;

#[async_trait]
impl ProgressEmitter for LogEmitter {
    async fn emit(&self, event: &ProgressEvent) -> Result<(), ProgressError> {
        match event {
            ProgressEvent::StepStarted {
                workflow_id,
                step,
                attempt,
            } => log::info!("[{}] step '{}' started (attempt {})", workflow_id, step, attempt),
            ProgressEvent::StepCompleted {
                workflow_id, step, ..
            } => log::info!("[{}] step '{}' completed", workflow_id, step),
            ProgressEvent::StepFailed {
                workflow_id,
                step,
                error,
                attempt,
                will_retry,
            } => log::warn!(
                "[{}] step '{}' failed on attempt {}{}: {}",
                workflow_id,
                step,
                attempt,
                if *will_retry { ", retrying" } else { "" },
                error
            ),
            ProgressEvent::StepSkipped {
                workflow_id,
                step,
                reason,
            } => log::info!("[{}] step '{}' skipped: {}", workflow_id, step, reason),
            ProgressEvent::WorkflowCompleted { workflow_id, state } => {
                log::info!("[{}] workflow finished: {:?}", workflow_id, state.status)
            }
        }
        Ok(())
    }
}

/// Per-run delivery of progress events to one listener
pub(crate) struct Notifier {
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
    handle: Option<JoinHandle<()>>,
    timeout: Duration,
}

impl Notifier {
    pub(crate) fn spawn(emitter: Option<Arc<dyn ProgressEmitter>>, timeout: Duration) -> Self {
        let Some(emitter) = emitter else {
            return Self {
                tx: None,
                handle: None,
                timeout,
            };
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<ProgressEvent>();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let delivery = AssertUnwindSafe(emitter.emit(&event)).catch_unwind();
                match tokio::time::timeout(timeout, delivery).await {
                    Ok(Ok(Ok(()))) => {}
                    Ok(Ok(Err(e))) => log::warn!(
                        "[{}] progress listener failed: {}",
                        event.workflow_id(),
                        e
                    ),
                    Ok(Err(_)) => log::warn!(
                        "[{}] progress listener panicked",
                        event.workflow_id()
                    ),
                    Err(_) => log::warn!(
                        "[{}] progress listener timed out after {:?}",
                        event.workflow_id(),
                        timeout
                    ),
                }
            }
        });

        Self {
            tx: Some(tx),
            handle: Some(handle),
            timeout,
        }
    }

    pub(crate) fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                log::warn!("progress delivery task has stopped; event dropped");
            }
        }
    }

    /// Close the channel and give pending deliveries a bounded time to finish
    pub(crate) async fn finish(mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if tokio::time::timeout(self.timeout, handle).await.is_err() {
                log::warn!("progress listener still draining after {:?}", self.timeout);
            }
        }
    }
}
