// SPDX-License-Identifier: MIT

//! Durable checkpoint storage for workflow state

use async_trait::async_trait;
use dashmap::DashMap;

use super::schema::WorkflowState;
use crate::sdk::error::StateStoreError;

/// Persistence boundary for workflow checkpoints.
///
/// `save` must be atomic per workflow id: a concurrent or interrupted save
/// never leaves a partially written state visible to `load`.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Persist a full snapshot, replacing any previous one for the same id
    async fn save(&self, state: &WorkflowState) -> Result<(), StateStoreError>;

    /// Most recently saved snapshot, or `StateStoreError::NotFound`
    async fn load(&self, workflow_id: &str) -> Result<WorkflowState, StateStoreError>;

    /// Remove a snapshot; deleting an unknown id is not an error
    async fn delete(&self, workflow_id: &str) -> Result<(), StateStoreError>;

    /// Ids of all stored workflows
    async fn list(&self) -> Result<Vec<String>, StateStoreError>;
}

/// Process-local store, mostly for tests and embedding
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    states: DashMap<String, WorkflowState>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn clear(&self) {
        self.states.clear();
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn save(&self, state: &WorkflowState) -> Result<(), StateStoreError> {
        self.states
            .insert(state.workflow_id.clone(), state.clone());
        Ok(())
    }

    async fn load(&self, workflow_id: &str) -> Result<WorkflowState, StateStoreError> {
        self.states
            .get(workflow_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StateStoreError::NotFound(workflow_id.to_string()))
    }

    async fn delete(&self, workflow_id: &str) -> Result<(), StateStoreError> {
        self.states.remove(workflow_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, StateStoreError> {
        let mut ids: Vec<String> = self.states.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        Ok(ids)
    }
}
