// SPDX-License-Identifier: MIT

pub mod builder;
pub mod condition;
pub mod graph;
pub mod loader;
pub mod registry;
pub mod retry;
pub mod state;

pub use builder::Builder;
pub use condition::Condition;
pub use graph::{DependencyGraph, ExecutorConfig, WorkflowExecutor};
pub use loader::WorkflowLoader;
pub use registry::StepRegistry;
pub use retry::RetryPolicy;
pub use state::{
    FileStateStore, InMemoryStateStore, SkipReason, StateStore, StepState, StepStatus,
    WorkflowState, WorkflowStatus,
};
