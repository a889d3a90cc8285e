use crate::error::{FunctionError, Result};
use async_trait::async_trait;

pub struct FunctionSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the arguments object.
    pub parameters_schema: serde_json::Value,
}

#[async_trait]
pub trait AssistantFunction: Send + Sync {
    fn spec(&self) -> FunctionSpec;
    async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value>;
}

pub(crate) fn require_string(args: &serde_json::Value, key: &str) -> Result<String> {
    let Some(v) = args.get(key) else {
        return Err(FunctionError::InvalidArguments(format!(
            "missing key: {key}"
        )));
    };
    match v {
        serde_json::Value::String(s) => Ok(s.clone()),
        other => Err(FunctionError::InvalidArguments(format!(
            "key {key} must be string, got {other:?}"
        ))),
    }
}

pub(crate) fn optional_u64(args: &serde_json::Value, key: &str) -> Result<Option<u64>> {
    let Some(v) = args.get(key) else {
        return Ok(None);
    };
    match v {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::Number(n) => n.as_u64().map(Some).ok_or_else(|| {
            FunctionError::InvalidArguments(format!("key {key} must be a non-negative integer"))
        }),
        other => Err(FunctionError::InvalidArguments(format!(
            "key {key} must be a number, got {other:?}"
        ))),
    }
}
