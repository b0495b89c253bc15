// SPDX-License-Identifier: MIT

//! Engine configuration
//!
//! Loaded from an optional YAML file, then overridden from the environment:
//! - `STEPGRAPH_MAX_IN_FLIGHT`
//! - `STEPGRAPH_MAX_ATTEMPTS`
//! - `STEPGRAPH_STATE_DIR`
//!
//! ```yaml
//! executor:
//!   max_in_flight: 8
//!   step_timeout_ms: 60000
//! retry:
//!   max_attempts: 5
//!   base_delay_ms: 200
//! state:
//!   backend: file
//!   dir: /var/lib/stepgraph
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::sdk::error::StepGraphError;
use crate::workflow::graph::executor::ExecutorConfig;
use crate::workflow::retry::RetryPolicy;
use crate::workflow::state::{FileStateStore, InMemoryStateStore, StateStore};

pub const ENV_MAX_IN_FLIGHT: &str = "STEPGRAPH_MAX_IN_FLIGHT";
pub const ENV_MAX_ATTEMPTS: &str = "STEPGRAPH_MAX_ATTEMPTS";
pub const ENV_STATE_DIR: &str = "STEPGRAPH_STATE_DIR";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub executor: ExecutorSettings,
    pub retry: RetrySettings,
    pub state: StateSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    pub max_in_flight: usize,
    /// `None` disables the default per-attempt timeout
    pub step_timeout_ms: Option<u64>,
    pub listener_timeout_ms: u64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_in_flight: 5,
            step_timeout_ms: Some(30_000),
            listener_timeout_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter: f64,
    pub retry_timeouts: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 5_000,
            jitter: 0.25,
            retry_timeouts: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    Memory,
    #[default]
    File,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateSettings {
    pub backend: StateBackend,
    pub dir: PathBuf,
}

impl Default for StateSettings {
    fn default() -> Self {
        Self {
            backend: StateBackend::File,
            dir: PathBuf::from(".stepgraph/state"),
        }
    }
}

impl EngineConfig {
    /// Read `path` if given, apply environment overrides, validate
    pub fn load(path: Option<&Path>) -> Result<Self, StepGraphError> {
        let mut config = match path {
            Some(path) => {
                log::debug!("loading engine config from {}", path.display());
                Self::from_yaml(&std::fs::read_to_string(path)?)?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self, StepGraphError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Apply overrides from `lookup`, normally the process environment
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), StepGraphError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_MAX_IN_FLIGHT) {
            self.executor.max_in_flight = parse_env(ENV_MAX_IN_FLIGHT, &value)?;
        }
        if let Some(value) = lookup(ENV_MAX_ATTEMPTS) {
            self.retry.max_attempts = parse_env(ENV_MAX_ATTEMPTS, &value)?;
        }
        if let Some(value) = lookup(ENV_STATE_DIR) {
            self.state.dir = PathBuf::from(value);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), StepGraphError> {
        if self.executor.max_in_flight == 0 {
            return Err(StepGraphError::config("executor.max_in_flight must be at least 1"));
        }
        if self.executor.step_timeout_ms == Some(0) {
            return Err(StepGraphError::config("executor.step_timeout_ms must be positive"));
        }
        if self.retry.max_attempts == 0 {
            return Err(StepGraphError::config("retry.max_attempts must be at least 1"));
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(StepGraphError::config("retry.multiplier must be >= 1.0"));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(StepGraphError::config("retry.jitter must be within [0, 1]"));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(StepGraphError::config(
                "retry.max_delay_ms must not be below retry.base_delay_ms",
            ));
        }
        Ok(())
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            max_in_flight: self.executor.max_in_flight,
            step_timeout: self.executor.step_timeout_ms.map(Duration::from_millis),
            listener_timeout: Duration::from_millis(self.executor.listener_timeout_ms),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new()
            .with_max_attempts(self.retry.max_attempts)
            .with_base_delay(Duration::from_millis(self.retry.base_delay_ms))
            .with_multiplier(self.retry.multiplier)
            .with_max_delay(Duration::from_millis(self.retry.max_delay_ms))
            .with_jitter(self.retry.jitter)
            .with_retry_timeouts(self.retry.retry_timeouts)
    }

    /// Open the configured state store
    pub async fn open_store(&self) -> Result<Arc<dyn StateStore>, StepGraphError> {
        let store: Arc<dyn StateStore> = match self.state.backend {
            StateBackend::Memory => Arc::new(InMemoryStateStore::new()),
            StateBackend::File => Arc::new(
                FileStateStore::open(&self.state.dir)
                    .await
                    .map_err(|e| StepGraphError::config(e.to_string()))?,
            ),
        };
        Ok(store)
    }
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T, StepGraphError> {
    value
        .trim()
        .parse()
        .map_err(|_| StepGraphError::config(format!("{} has invalid value '{}'", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.executor.max_in_flight, 5);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.state.backend, StateBackend::File);
        assert!(config.validate().is_ok());

        let exec = config.executor_config();
        assert_eq!(exec.step_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.retry_policy(), RetryPolicy::default());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = EngineConfig::from_yaml(
            r#"
executor:
  max_in_flight: 9
  step_timeout_ms: null
retry:
  jitter: 0
state:
  backend: memory
"#,
        )
        .unwrap();
        assert_eq!(config.executor.max_in_flight, 9);
        assert_eq!(config.executor_config().step_timeout, None);
        assert_eq!(config.executor.listener_timeout_ms, 1_000);
        assert_eq!(config.retry.jitter, 0.0);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.state.backend, StateBackend::Memory);
        assert_eq!(config.state.dir, PathBuf::from(".stepgraph/state"));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_MAX_IN_FLIGHT, "12"),
            (ENV_MAX_ATTEMPTS, " 7 "),
            (ENV_STATE_DIR, "/tmp/sg"),
        ]
        .into_iter()
        .collect();

        let mut config = EngineConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.executor.max_in_flight, 12);
        assert_eq!(config.retry.max_attempts, 7);
        assert_eq!(config.state.dir, PathBuf::from("/tmp/sg"));
    }

    #[test]
    fn test_bad_env_value() {
        let mut config = EngineConfig::default();
        let err = config
            .apply_overrides(|key| (key == ENV_MAX_IN_FLIGHT).then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, StepGraphError::Config(msg) if msg.contains("lots")));
    }

    #[test]
    fn test_validation() {
        let mut config = EngineConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.retry.multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.executor.max_in_flight = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.retry.jitter = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.yaml");
        std::fs::write(&path, "retry:\n  base_delay_ms: 10\n  max_delay_ms: 20\n").unwrap();

        // environment is left untouched by other tests, so only the file applies here
        let config = EngineConfig::from_yaml(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(config.retry.base_delay_ms, 10);
        assert!(config.validate().is_ok());
        assert!(EngineConfig::load(Some(&dir.path().join("missing.yaml"))).is_err());
    }

    #[tokio::test]
    async fn test_open_memory_store() {
        let mut config = EngineConfig::default();
        config.state.backend = StateBackend::Memory;
        let store = config.open_store().await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }
}
