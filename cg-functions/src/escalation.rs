use crate::error::Result;
use crate::traits::{AssistantFunction, FunctionSpec, require_string};
use async_trait::async_trait;
use serde_json::json;

/// Flags a conversation for a human operator. The flag is surfaced through
/// logs/monitoring; the assistant gets an acknowledgement so it can tell
/// the guest someone will follow up.
pub struct EscalateToHumanFunction;

#[async_trait]
impl AssistantFunction for EscalateToHumanFunction {
    fn spec(&self) -> FunctionSpec {
        FunctionSpec {
            name: "escalate_to_human".to_string(),
            description: "Hand the conversation over to a human operator.".to_string(),
            parameters_schema: json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "user_id": { "type": "string" },
                    "reason": { "type": "string" }
                },
                "required": ["reason"]
            }),
        }
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value> {
        let reason = require_string(&arguments, "reason")?;
        let user_id = arguments
            .get("user_id")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        tracing::warn!(
            user_id = %user_id,
            reason = %reason,
            "conversation escalated to human operator"
        );
        Ok(json!({
            "success": true,
            "escalated": true,
            "reason": reason,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FunctionError;
    use serde_json::json;

    #[tokio::test]
    async fn acknowledges_escalation() {
        let out = EscalateToHumanFunction
            .execute(json!({"user_id": "u1", "reason": "complex refund"}))
            .await
            .expect("escalation succeeds");
        assert_eq!(out["escalated"], json!(true));
    }

    #[tokio::test]
    async fn requires_a_reason() {
        let err = EscalateToHumanFunction
            .execute(json!({"user_id": "u1"}))
            .await
            .expect_err("missing reason must fail");
        assert!(matches!(err, FunctionError::InvalidArguments(_)));
    }
}
