// SPDX-License-Identifier: MIT

//! Workflow builder - turns definitions into executable steps
//!
//! Every problem in a definition (unknown kind, bad config, unparsable
//! `when`, invalid graph) is reported here, before anything runs.

use std::path::Path;
use std::sync::Arc;

use crate::sdk::error::StepGraphError;
use crate::sdk::step::{Step, StepSpec};
use crate::workflow::condition::Condition;
use crate::workflow::graph::dag::DependencyGraph;
use crate::workflow::graph::types::{StepDef, WorkflowDef};
use crate::workflow::loader::WorkflowLoader;
use crate::workflow::registry::StepRegistry;

/// High-level builder for constructing step sets from YAML definitions
pub struct Builder {
    loader: WorkflowLoader,
    registry: StepRegistry,
}

impl Builder {
    pub fn new(registry: StepRegistry) -> Self {
        Self {
            loader: WorkflowLoader::new(),
            registry,
        }
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    /// Load a definition from disk and build its steps
    pub async fn build_file<P: AsRef<Path>>(
        &self,
        path: P,
    ) -> Result<(WorkflowDef, Vec<Arc<dyn Step>>), StepGraphError> {
        let def = self.loader.load_workflow(path)?;
        let steps = self.build(&def).await?;
        Ok((def, steps))
    }

    /// Build and validate the steps of a parsed definition
    pub async fn build(&self, def: &WorkflowDef) -> Result<Vec<Arc<dyn Step>>, StepGraphError> {
        let mut steps = Vec::with_capacity(def.steps.len());
        for step_def in &def.steps {
            steps.push(self.build_step(step_def).await?);
        }

        let graph = DependencyGraph::from_steps(&steps)?;
        log::info!(
            "built workflow '{}': {} steps in {} layers",
            def.name,
            graph.len(),
            graph.layers().len()
        );
        Ok(steps)
    }

    async fn build_step(&self, def: &StepDef) -> Result<Arc<dyn Step>, StepGraphError> {
        let factory =
            self.registry
                .get(&def.kind)
                .await
                .ok_or_else(|| StepGraphError::UnknownStepKind {
                    step: def.name.clone(),
                    kind: def.kind.clone(),
                })?;

        let mut spec = StepSpec::new(&def.name).with_dependencies(def.depends_on.to_vec());
        if let Some(when) = &def.when {
            spec = spec.with_condition(Condition::parse(when)?);
        }
        if let Some(timeout) = def.timeout() {
            if timeout.is_zero() {
                return Err(StepGraphError::invalid_step(&def.name, "timeout_ms must be positive"));
            }
            spec = spec.with_timeout(timeout);
        }
        if let Some(attempts) = def.max_attempts {
            if attempts == 0 {
                return Err(StepGraphError::invalid_step(&def.name, "max_attempts must be at least 1"));
            }
            spec = spec.with_max_attempts(attempts);
        }

        factory(spec, &def.config)
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new(StepRegistry::with_builtins())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdk::error::ValidationError;
    use std::time::Duration;

    async fn build(yaml: &str) -> Result<Vec<Arc<dyn Step>>, StepGraphError> {
        let def = WorkflowLoader::parse_yaml(yaml).unwrap();
        Builder::default().build(&def).await
    }

    #[tokio::test]
    async fn test_builds_steps_with_headers() {
        let steps = build(
            r#"
name: report
steps:
  - name: gather
    kind: echo
    config: { value: 42 }
  - name: render
    kind: shell
    depends_on: gather
    when: "gather > 10"
    timeout_ms: 1500
    max_attempts: 4
    config: { command: "cat" }
"#,
        )
        .await
        .unwrap();

        assert_eq!(steps.len(), 2);
        let render = &steps[1];
        assert_eq!(render.name(), "render");
        assert_eq!(render.depends_on(), &["gather".to_string()]);
        assert_eq!(render.timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(render.max_attempts(), Some(4));
        assert!(render.condition().is_some());
    }

    #[tokio::test]
    async fn test_unknown_kind() {
        let err = build("name: x\nsteps:\n  - name: a\n    kind: teleport\n")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StepGraphError::UnknownStepKind { kind, .. } if kind == "teleport"));
    }

    #[tokio::test]
    async fn test_bad_condition_fails_at_build_time() {
        let err = build("name: x\nsteps:\n  - name: a\n    kind: echo\n    when: \"a ==\"\n")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StepGraphError::Condition(_)));
    }

    #[tokio::test]
    async fn test_graph_is_validated() {
        let yaml = r#"
name: loop
steps:
  - name: a
    kind: echo
    depends_on: b
  - name: b
    kind: echo
    depends_on: a
"#;
        let err = build(yaml).await.err().unwrap();
        assert!(matches!(
            err,
            StepGraphError::Validation(ValidationError::CycleDetected(_))
        ));
    }

    #[tokio::test]
    async fn test_zero_attempts_rejected() {
        let err = build("name: x\nsteps:\n  - name: a\n    kind: echo\n    max_attempts: 0\n")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StepGraphError::InvalidStep { .. }));
    }
}
