// SPDX-License-Identifier: MIT

//! Declarative workflow definition types
//!
//! ```yaml
//! name: publish-report
//! description: Fetch, render and upload a report
//! steps:
//!   - name: fetch
//!     kind: http
//!     config: { url: "https://example.com/data.json" }
//!   - name: render
//!     kind: shell
//!     depends_on: fetch
//!     timeout_ms: 60000
//!     config: { command: "./render.sh" }
//!   - name: upload
//!     kind: shell
//!     depends_on: [render]
//!     when: "input.publish == true"
//!     max_attempts: 5
//!     config: { command: "./upload.sh" }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// A workflow definition
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct WorkflowDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub steps: Vec<StepDef>,
}

/// One step of a workflow definition
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StepDef {
    /// Unique name within the workflow
    pub name: String,
    /// Registry key of the step implementation
    pub kind: String,
    #[serde(default)]
    pub depends_on: DependsOn,
    /// Condition expression; the step is skipped when it evaluates false
    pub when: Option<String>,
    pub timeout_ms: Option<u64>,
    pub max_attempts: Option<u32>,
    /// Kind-specific settings
    #[serde(default)]
    pub config: Value,
}

impl StepDef {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Dependency specification for a step
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(untagged)]
pub enum DependsOn {
    /// No dependencies (entry step)
    #[default]
    None,
    Single(String),
    Multiple(Vec<String>),
}

impl DependsOn {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            DependsOn::None => vec![],
            DependsOn::Single(s) => vec![s.clone()],
            DependsOn::Multiple(v) => v.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            DependsOn::None => true,
            DependsOn::Single(_) => false,
            DependsOn::Multiple(v) => v.is_empty(),
        }
    }
}
