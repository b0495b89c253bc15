// SPDX-License-Identifier: MIT

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::sdk::error::StepGraphError;
use crate::sdk::step::{Step, StepSpec};
use crate::steps::{EchoStep, HttpStep, ShellStep};

/// Builds a step from its declared header and kind-specific config
pub type StepFactory =
    Arc<dyn Fn(StepSpec, &Value) -> Result<Arc<dyn Step>, StepGraphError> + Send + Sync>;

fn factory<F>(f: F) -> StepFactory
where
    F: Fn(StepSpec, &Value) -> Result<Arc<dyn Step>, StepGraphError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Maps a step `kind` to the factory that builds it
#[derive(Clone)]
pub struct StepRegistry {
    factories: Arc<RwLock<HashMap<String, StepFactory>>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self {
            factories: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Registry preloaded with `echo`, `shell` and `http`
    pub fn with_builtins() -> Self {
        let mut factories: HashMap<String, StepFactory> = HashMap::new();
        factories.insert(
            "echo".into(),
            factory(|spec, config| Ok(Arc::new(EchoStep::from_config(spec, config)?))),
        );
        factories.insert(
            "shell".into(),
            factory(|spec, config| Ok(Arc::new(ShellStep::from_config(spec, config)?))),
        );
        factories.insert(
            "http".into(),
            factory(|spec, config| Ok(Arc::new(HttpStep::from_config(spec, config)?))),
        );
        Self {
            factories: Arc::new(RwLock::new(factories)),
        }
    }

    pub async fn register<F>(&self, kind: impl Into<String>, f: F)
    where
        F: Fn(StepSpec, &Value) -> Result<Arc<dyn Step>, StepGraphError> + Send + Sync + 'static,
    {
        let mut factories = self.factories.write().await;
        factories.insert(kind.into(), factory(f));
    }

    pub async fn get(&self, kind: &str) -> Option<StepFactory> {
        let factories = self.factories.read().await;
        factories.get(kind).cloned()
    }

    /// Registered kinds, sorted
    pub async fn kinds(&self) -> Vec<String> {
        let factories = self.factories.read().await;
        let mut kinds: Vec<String> = factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdk::step::FnStep;
    use serde_json::json;

    #[tokio::test]
    async fn test_builtins_are_registered() {
        let registry = StepRegistry::with_builtins();
        assert_eq!(registry.kinds().await, vec!["echo", "http", "shell"]);

        let factory = registry.get("echo").await.unwrap();
        let step = factory(StepSpec::new("hello"), &json!({"value": 1})).unwrap();
        assert_eq!(step.name(), "hello");
    }

    #[tokio::test]
    async fn test_get_unknown_kind() {
        assert!(StepRegistry::new().get("nonexistent").await.is_none());
    }

    #[tokio::test]
    async fn test_register_custom_kind() {
        let registry = StepRegistry::new();
        registry
            .register("noop", |spec: StepSpec, _config: &Value| {
                let step: Arc<dyn Step> = Arc::new(FnStep::from_spec(spec, |_ctx, _input| async {
                    Ok(Value::Null)
                }));
                Ok(step)
            })
            .await;

        let factory = registry.get("noop").await.unwrap();
        let step = factory(StepSpec::new("n").with_dependencies(["x"]), &Value::Null).unwrap();
        assert_eq!(step.depends_on(), &["x".to_string()]);
    }

    #[tokio::test]
    async fn test_registry_is_clone() {
        let registry = StepRegistry::new();
        let cloned = registry.clone();
        cloned
            .register("late", |spec: StepSpec, config: &Value| {
                let step: Arc<dyn Step> = Arc::new(EchoStep::from_config(spec, config)?);
                Ok(step)
            })
            .await;

        // registering on a clone is visible to the original
        assert!(registry.get("late").await.is_some());
    }

    #[tokio::test]
    async fn test_factory_surfaces_config_errors() {
        let registry = StepRegistry::with_builtins();
        let factory = registry.get("shell").await.unwrap();
        let err = factory(StepSpec::new("s"), &json!({})).err().unwrap();
        assert!(matches!(err, StepGraphError::InvalidStep { step, .. } if step == "s"));
    }
}
