// SPDX-License-Identifier: MIT

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::sdk::error::StepGraphError;
use crate::sdk::step::{Step, StepContext, StepError, StepSpec};
use crate::workflow::condition::Condition;

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct EchoArgs {
    /// Fixed output; when absent the step echoes its input and dependencies
    #[serde(default)]
    pub value: Option<Value>,
}

/// Returns a fixed value, or `{input, dependencies}`
pub struct EchoStep {
    spec: StepSpec,
    args: EchoArgs,
}

impl EchoStep {
    pub fn new(spec: StepSpec, args: EchoArgs) -> Self {
        Self { spec, args }
    }

    pub fn from_config(spec: StepSpec, config: &Value) -> Result<Self, StepGraphError> {
        let args = if config.is_null() {
            EchoArgs::default()
        } else {
            serde_json::from_value(config.clone())
                .map_err(|e| StepGraphError::invalid_step(&spec.name, e.to_string()))?
        };
        Ok(Self::new(spec, args))
    }
}

#[async_trait]
impl Step for EchoStep {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn depends_on(&self) -> &[String] {
        &self.spec.depends_on
    }

    fn condition(&self) -> Option<&Condition> {
        self.spec.condition.as_ref()
    }

    fn timeout(&self) -> Option<std::time::Duration> {
        self.spec.timeout
    }

    fn max_attempts(&self) -> Option<u32> {
        self.spec.max_attempts
    }

    async fn execute(&self, ctx: &StepContext, input: &Value) -> Result<Value, StepError> {
        if let Some(value) = &self.args.value {
            return Ok(value.clone());
        }

        let mut dependencies = Map::new();
        for dep in &self.spec.depends_on {
            dependencies.insert(dep.clone(), ctx.dependency_output(dep)?.clone());
        }
        Ok(json!({
            "input": input,
            "dependencies": dependencies,
        }))
    }
}
