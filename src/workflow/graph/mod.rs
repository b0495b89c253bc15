// SPDX-License-Identifier: MIT

//! Graph-based workflow execution
//!
//! This module provides the dependency graph, the layered executor that
//! runs steps against it, and the declarative definition types.

pub mod dag;
pub mod executor;
pub mod types;

pub use dag::DependencyGraph;
pub use executor::{ExecutorConfig, WorkflowExecutor};
pub use types::{DependsOn, StepDef, WorkflowDef};
