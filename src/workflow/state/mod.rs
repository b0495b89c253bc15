// SPDX-License-Identifier: MIT

//! Workflow state and its persistence
//!
//! This module provides:
//! - `WorkflowState` - the checkpointed snapshot of a run
//! - `StateStore` - the persistence trait the executor writes through
//! - `InMemoryStateStore` / `FileStateStore` - the bundled backends

mod file;
mod schema;
mod store;

pub use file::FileStateStore;
pub use schema::{SkipReason, StepState, StepStatus, WorkflowState, WorkflowStatus};
pub use store::{InMemoryStateStore, StateStore};
