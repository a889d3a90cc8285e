use crate::backend::AssistantBackend;
use crate::error::{BackendError, Result};
use crate::types::{
    AssistantInfo, MessageRole, PendingToolCall, Run, RunStatus, RunUsage, ThreadMessage,
    ToolOutput,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

/// Assistants-v2-style HTTP implementation of [`AssistantBackend`].
#[derive(Clone)]
pub struct HttpAssistantBackend {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    assistant_id: String,
}

impl HttpAssistantBackend {
    pub fn new(api_key: &str, assistant_id: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Self {
            http,
            api_base: DEFAULT_API_BASE.to_string(),
            api_key: api_key.to_string(),
            assistant_id: assistant_id.to_string(),
        }
    }

    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    pub fn assistant_id(&self) -> &str {
        &self.assistant_id
    }

    /// Resolve the configured assistant on the backend; used by `doctor`.
    pub async fn retrieve_assistant(&self) -> Result<AssistantInfo> {
        let url = format!("{}/assistants/{}", self.api_base, self.assistant_id);
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.api_key)
            .header("OpenAI-Beta", "assistants=v2")
            .send()
            .await?;
        let body = Self::read_success_body(response).await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn post_json<B: Serialize>(&self, path: &str, body: &B) -> Result<String> {
        let url = format!("{}{path}", self.api_base);
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.api_key)
            .header("OpenAI-Beta", "assistants=v2")
            .json(body)
            .send()
            .await?;
        Self::read_success_body(response).await
    }

    async fn get_json(&self, path: &str) -> Result<String> {
        let url = format!("{}{path}", self.api_base);
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.api_key)
            .header("OpenAI-Beta", "assistants=v2")
            .send()
            .await?;
        Self::read_success_body(response).await
    }

    async fn read_success_body(response: reqwest::Response) -> Result<String> {
        let status = response.status();
        let body = response.text().await?;
        if status.is_success() {
            return Ok(body);
        }
        let parsed: std::result::Result<ApiErrorEnvelope, _> = serde_json::from_str(&body);
        let (code, message) = match parsed {
            Ok(envelope) => (envelope.error.code, envelope.error.message),
            Err(_) => (None, body),
        };
        Err(BackendError::Api {
            status: status.as_u16(),
            code,
            message,
        })
    }
}

#[async_trait]
impl AssistantBackend for HttpAssistantBackend {
    #[tracing::instrument(level = "debug", skip_all)]
    async fn create_thread(&self) -> Result<String> {
        let body = self
            .post_json("/threads", &serde_json::json!({}))
            .await?;
        let thread: ThreadEnvelope = serde_json::from_str(&body)?;
        tracing::info!(thread_id = %thread.id, "backend thread created");
        Ok(thread.id)
    }

    #[tracing::instrument(level = "debug", skip_all, fields(thread_id = %thread_id))]
    async fn add_message(&self, thread_id: &str, role: MessageRole, text: &str) -> Result<()> {
        let request = CreateMessageRequest {
            role,
            content: text,
        };
        self.post_json(&format!("/threads/{thread_id}/messages"), &request)
            .await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(thread_id = %thread_id))]
    async fn create_run(&self, thread_id: &str) -> Result<Run> {
        let request = CreateRunRequest {
            assistant_id: &self.assistant_id,
        };
        let body = self
            .post_json(&format!("/threads/{thread_id}/runs"), &request)
            .await?;
        let run: RunEnvelope = serde_json::from_str(&body)?;
        run.try_into()
    }

    async fn get_run(&self, thread_id: &str, run_id: &str) -> Result<Run> {
        let body = self
            .get_json(&format!("/threads/{thread_id}/runs/{run_id}"))
            .await?;
        let run: RunEnvelope = serde_json::from_str(&body)?;
        run.try_into()
    }

    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(thread_id = %thread_id, run_id = %run_id, outputs = outputs.len())
    )]
    async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: &[ToolOutput],
    ) -> Result<()> {
        let request = SubmitToolOutputsRequest {
            tool_outputs: outputs,
        };
        self.post_json(
            &format!("/threads/{thread_id}/runs/{run_id}/submit_tool_outputs"),
            &request,
        )
        .await?;
        Ok(())
    }

    async fn list_messages(&self, thread_id: &str, limit: u32) -> Result<Vec<ThreadMessage>> {
        let body = self
            .get_json(&format!(
                "/threads/{thread_id}/messages?order=desc&limit={limit}"
            ))
            .await?;
        let listing: MessageListEnvelope = serde_json::from_str(&body)?;
        let messages = listing
            .data
            .into_iter()
            .filter_map(|m| {
                let role = match m.role.as_str() {
                    "user" => MessageRole::User,
                    "assistant" => MessageRole::Assistant,
                    _ => return None,
                };
                let text = m.content.into_iter().find_map(|block| match block {
                    ContentBlock::Text { text } => Some(text.value),
                    ContentBlock::Other => None,
                });
                Some(ThreadMessage {
                    id: m.id,
                    role,
                    text,
                })
            })
            .collect();
        Ok(messages)
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
    #[serde(default)]
    code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ThreadEnvelope {
    id: String,
}

#[derive(Debug, Serialize)]
struct CreateMessageRequest<'a> {
    role: MessageRole,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct CreateRunRequest<'a> {
    assistant_id: &'a str,
}

#[derive(Debug, Serialize)]
struct SubmitToolOutputsRequest<'a> {
    tool_outputs: &'a [ToolOutput],
}

#[derive(Debug, Deserialize)]
struct RunEnvelope {
    id: String,
    status: RunStatus,
    #[serde(default)]
    required_action: Option<RequiredAction>,
    #[serde(default)]
    usage: Option<RunUsage>,
    #[serde(default)]
    last_error: Option<RunLastError>,
}

#[derive(Debug, Deserialize)]
struct RequiredAction {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    submit_tool_outputs: Option<SubmitToolOutputsAction>,
}

#[derive(Debug, Deserialize)]
struct SubmitToolOutputsAction {
    tool_calls: Vec<RawToolCall>,
}

#[derive(Debug, Deserialize)]
struct RawToolCall {
    id: String,
    function: RawFunctionCall,
}

#[derive(Debug, Deserialize)]
struct RawFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct RunLastError {
    #[serde(default)]
    code: Option<String>,
    message: String,
}

impl TryFrom<RunEnvelope> for Run {
    type Error = BackendError;

    fn try_from(envelope: RunEnvelope) -> Result<Run> {
        let pending_tool_calls = match (envelope.status, envelope.required_action) {
            (RunStatus::RequiresAction, Some(action)) => {
                if action.kind != "submit_tool_outputs" {
                    return Err(BackendError::ResponseFormat(format!(
                        "unsupported required_action type: {}",
                        action.kind
                    )));
                }
                let Some(submit) = action.submit_tool_outputs else {
                    return Err(BackendError::ResponseFormat(
                        "required_action missing submit_tool_outputs".to_string(),
                    ));
                };
                submit
                    .tool_calls
                    .into_iter()
                    .map(|tc| PendingToolCall {
                        id: tc.id,
                        name: tc.function.name,
                        arguments: tc.function.arguments,
                    })
                    .collect()
            }
            _ => Vec::new(),
        };

        Ok(Run {
            id: envelope.id,
            status: envelope.status,
            pending_tool_calls,
            usage: envelope.usage,
            last_error: envelope.last_error.map(|e| match e.code {
                Some(code) => format!("{code}: {}", e.message),
                None => e.message,
            }),
        })
    }
}

#[derive(Debug, Deserialize)]
struct MessageListEnvelope {
    data: Vec<RawMessage>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    id: String,
    role: String,
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: TextValue },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct TextValue {
    value: String,
}
