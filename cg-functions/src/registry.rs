use crate::error::{FunctionError, Result};
use crate::traits::{AssistantFunction, FunctionSpec};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Name-keyed dispatch for everything the backend may call mid-run.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<dyn AssistantFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, function: Arc<dyn AssistantFunction>) {
        let name = function.spec().name;
        if self.functions.insert(name.clone(), function).is_some() {
            tracing::warn!(function = %name, "function re-registered, previous impl replaced");
        }
    }

    pub fn specs(&self) -> Vec<FunctionSpec> {
        let mut specs: Vec<FunctionSpec> = self.functions.values().map(|f| f.spec()).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    #[tracing::instrument(level = "info", skip(self, arguments), fields(function = %name))]
    pub async fn execute(&self, name: &str, arguments: serde_json::Value) -> Result<serde_json::Value> {
        let Some(function) = self.functions.get(name) else {
            return Err(FunctionError::Unknown(name.to_string()));
        };
        let started = Instant::now();
        let result = function.execute(arguments).await;
        match &result {
            Ok(value) => tracing::info!(
                latency_ms = started.elapsed().as_millis() as u64,
                output_len = value.to_string().len(),
                "function executed"
            ),
            Err(e) => tracing::warn!(
                latency_ms = started.elapsed().as_millis() as u64,
                error = %e,
                "function execution failed"
            ),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    struct EchoFunction;

    #[async_trait]
    impl AssistantFunction for EchoFunction {
        fn spec(&self) -> FunctionSpec {
            FunctionSpec {
                name: "echo".to_string(),
                description: "returns its arguments".to_string(),
                parameters_schema: json!({"type": "object"}),
            }
        }

        async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value> {
            Ok(arguments)
        }
    }

    #[tokio::test]
    async fn executes_registered_function() {
        let mut registry = FunctionRegistry::new();
        registry.register(Arc::new(EchoFunction));
        let out = registry
            .execute("echo", json!({"a": 1}))
            .await
            .expect("echo executes");
        assert_eq!(out, json!({"a": 1}));
    }

    #[tokio::test]
    async fn unknown_name_is_a_distinct_error() {
        let registry = FunctionRegistry::new();
        let err = registry
            .execute("missing", json!({}))
            .await
            .expect_err("unknown function must fail");
        assert!(matches!(err, FunctionError::Unknown(name) if name == "missing"));
    }
}
