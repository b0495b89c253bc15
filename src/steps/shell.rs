// SPDX-License-Identifier: MIT

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::process::Stdio;
use tokio::process::Command;

use crate::sdk::error::StepGraphError;
use crate::sdk::step::{Step, StepContext, StepError, StepSpec};
use crate::workflow::condition::Condition;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellArgs {
    /// Passed to `sh -c`
    pub command: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
}

/// Runs a shell command.
///
/// The child sees `STEPGRAPH_WORKFLOW_ID`, `STEPGRAPH_ATTEMPT`,
/// `STEPGRAPH_INPUT` (JSON) and `STEPGRAPH_OUTPUTS` (JSON of completed
/// outputs). It is killed if the workflow is cancelled or the attempt
/// times out.
pub struct ShellStep {
    spec: StepSpec,
    args: ShellArgs,
}

impl ShellStep {
    pub fn new(spec: StepSpec, args: ShellArgs) -> Self {
        Self { spec, args }
    }

    pub fn from_config(spec: StepSpec, config: &Value) -> Result<Self, StepGraphError> {
        let args: ShellArgs = serde_json::from_value(config.clone())
            .map_err(|e| StepGraphError::invalid_step(&spec.name, e.to_string()))?;
        if args.command.trim().is_empty() {
            return Err(StepGraphError::invalid_step(&spec.name, "command is empty"));
        }
        Ok(Self::new(spec, args))
    }

    fn command(&self, ctx: &StepContext, input: &Value) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.args.command)
            .envs(&self.args.env)
            .env("STEPGRAPH_WORKFLOW_ID", ctx.workflow_id())
            .env("STEPGRAPH_ATTEMPT", ctx.attempt().to_string())
            .env("STEPGRAPH_INPUT", input.to_string())
            .env(
                "STEPGRAPH_OUTPUTS",
                Value::Object(ctx.outputs().clone()).to_string(),
            )
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.args.cwd {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[async_trait]
impl Step for ShellStep {
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
        let mut cmd = self.command(ctx, input);
        log::debug!("[{}] {}: sh -c {:?}", ctx.workflow_id(), self.spec.name, self.args.command);

        let output = tokio::select! {
            _ = ctx.cancelled() => return Err(StepError::Cancelled),
            output = cmd.output() => output.map_err(|e| StepError::from_message(e.to_string()))?,
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let status = output.status.code();

        if !output.status.success() {
            let code = status.map_or_else(|| "signal".to_string(), |c| c.to_string());
            return Err(StepError::from_message(format!(
                "command exited with {}: {}",
                code,
                stderr.trim()
            )));
        }

        Ok(json!({
            "status": status,
            "stdout": stdout,
            "stderr": stderr,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn ctx(token: CancellationToken) -> StepContext {
        let mut outputs = Map::new();
        outputs.insert("prev".into(), json!({"n": 7}));
        StepContext::new("wf-sh", 2, Arc::new(json!({"who": "world"})), Arc::new(outputs), token)
    }

    fn shell(command: &str) -> ShellStep {
        ShellStep::from_config(StepSpec::new("sh"), &json!({ "command": command })).unwrap()
    }

    #[tokio::test]
    async fn test_captures_stdout() {
        let out = shell("echo hello")
            .execute(&ctx(CancellationToken::new()), &json!({}))
            .await
            .unwrap();
        assert_eq!(out["status"], 0);
        assert_eq!(out["stdout"], "hello\n");
    }

    #[tokio::test]
    async fn test_exposes_context_in_env() {
        let out = shell("printf '%s|%s' \"$STEPGRAPH_WORKFLOW_ID\" \"$STEPGRAPH_ATTEMPT\"")
            .execute(&ctx(CancellationToken::new()), &json!({}))
            .await
            .unwrap();
        assert_eq!(out["stdout"], "wf-sh|2");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_classified() {
        let err = shell("echo 'invalid argument' >&2; exit 3")
            .execute(&ctx(CancellationToken::new()), &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::NonRetryable(msg) if msg.contains("exited with 3")));

        let err = shell("exit 1")
            .execute(&ctx(CancellationToken::new()), &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Retryable(_)));
    }

    #[tokio::test]
    async fn test_cancellation_stops_command() {
        let token = CancellationToken::new();
        token.cancel();
        let err = shell("sleep 5")
            .execute(&ctx(token), &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err, StepError::Cancelled);
    }

    #[test]
    fn test_requires_command() {
        assert!(ShellStep::from_config(StepSpec::new("sh"), &json!({})).is_err());
        assert!(ShellStep::from_config(StepSpec::new("sh"), &json!({"command": " "})).is_err());
    }
}
