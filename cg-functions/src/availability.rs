use crate::error::{FunctionError, Result};
use crate::traits::{AssistantFunction, FunctionSpec, optional_u64, require_string};
use async_trait::async_trait;
use serde_json::json;

/// Booking-availability lookup against the property-management API.
pub struct CheckAvailabilityFunction {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
}

impl CheckAvailabilityFunction {
    pub fn new(api_url: &str, api_key: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    fn validate_date(value: &str, key: &str) -> Result<()> {
        if chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d").is_err() {
            return Err(FunctionError::InvalidArguments(format!(
                "key {key} must be a YYYY-MM-DD date, got {value:?}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl AssistantFunction for CheckAvailabilityFunction {
    fn spec(&self) -> FunctionSpec {
        FunctionSpec {
            name: "check_availability".to_string(),
            description: "Check room availability and rates for a date range.".to_string(),
            parameters_schema: json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "check_in": { "type": "string", "format": "date" },
                    "check_out": { "type": "string", "format": "date" },
                    "guests": { "type": "integer", "minimum": 1 }
                },
                "required": ["check_in", "check_out"]
            }),
        }
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value> {
        let check_in = require_string(&arguments, "check_in")?;
        let check_out = require_string(&arguments, "check_out")?;
        Self::validate_date(&check_in, "check_in")?;
        Self::validate_date(&check_out, "check_out")?;
        let guests = optional_u64(&arguments, "guests")?.unwrap_or(2);

        let response = self
            .http
            .get(format!("{}/availability", self.api_url))
            .bearer_auth(&self.api_key)
            .query(&[
                ("check_in", check_in.as_str()),
                ("check_out", check_out.as_str()),
                ("guests", &guests.to_string()),
            ])
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(FunctionError::ExecutionFailed(format!(
                "availability lookup failed: status={status} body={body}"
            )));
        }

        let options: serde_json::Value = serde_json::from_str(&body)
            .map_err(|e| FunctionError::ExecutionFailed(format!("invalid availability response: {e}")))?;
        Ok(json!({
            "success": true,
            "check_in": check_in,
            "check_out": check_out,
            "guests": guests,
            "options": options,
        }))
    }
}
