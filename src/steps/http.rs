// SPDX-License-Identifier: MIT

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;

use crate::sdk::error::StepGraphError;
use crate::sdk::step::{Step, StepContext, StepError, StepSpec};
use crate::workflow::condition::Condition;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpArgs {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Sent as a JSON body when present
    #[serde(default)]
    pub body: Option<Value>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Issues one HTTP request per attempt.
///
/// Transport errors, 429 and 5xx responses are retryable; any other
/// non-success status is not.
pub struct HttpStep {
    spec: StepSpec,
    args: HttpArgs,
    method: Method,
    client: Client,
}

impl HttpStep {
    pub fn from_config(spec: StepSpec, config: &Value) -> Result<Self, StepGraphError> {
        let args: HttpArgs = serde_json::from_value(config.clone())
            .map_err(|e| StepGraphError::invalid_step(&spec.name, e.to_string()))?;
        let method = Method::from_bytes(args.method.to_uppercase().as_bytes()).map_err(|_| {
            StepGraphError::invalid_step(&spec.name, format!("bad method '{}'", args.method))
        })?;
        reqwest::Url::parse(&args.url).map_err(|e| {
            StepGraphError::invalid_step(&spec.name, format!("bad url '{}': {}", args.url, e))
        })?;
        Ok(Self {
            spec,
            args,
            method,
            client: Client::new(),
        })
    }
}

/// Map a non-success status onto the retry classification
pub fn classify_status(status: StatusCode, body: &str) -> StepError {
    let message = format!("HTTP {}: {}", status, body.trim());
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        StepError::Retryable(message)
    } else {
        StepError::NonRetryable(message)
    }
}

#[async_trait]
impl Step for HttpStep {
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

    async fn execute(&self, ctx: &StepContext, _input: &Value) -> Result<Value, StepError> {
        let mut request = self.client.request(self.method.clone(), &self.args.url);
        for (name, value) in &self.args.headers {
            request = request.header(name, value);
        }
        if let Some(body) = &self.args.body {
            request = request.json(body);
        }

        let send = async {
            let resp = request
                .send()
                .await
                .map_err(|e| StepError::retryable(e.to_string()))?;
            let status = resp.status();
            let text = resp
                .text()
                .await
                .map_err(|e| StepError::retryable(e.to_string()))?;
            Ok::<_, StepError>((status, text))
        };

        let (status, text) = tokio::select! {
            _ = ctx.cancelled() => return Err(StepError::Cancelled),
            result = send => result?,
        };

        if !status.is_success() {
            return Err(classify_status(status, &text));
        }

        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
        Ok(json!({
            "status": status.as_u16(),
            "body": body,
        }))
    }
}
