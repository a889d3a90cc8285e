use crate::traits::ChannelAdapter;
use crate::types::InboundEvent;
use anyhow::{Result, anyhow};
use tokio::sync::mpsc;

/// WhatsApp gateway adapter for a Whapi-style HTTP API.
#[derive(Clone)]
pub struct WhapiAdapter {
    http: reqwest::Client,
    api_url: String,
    token: String,
}

impl WhapiAdapter {
    pub fn new(api_url: &str, token: &str) -> Result<Self> {
        let api_url = api_url.trim().trim_end_matches('/');
        if api_url.is_empty() {
            return Err(anyhow!("whapi api url is required"));
        }
        let token = token.trim();
        if token.is_empty() {
            return Err(anyhow!("whapi token is required"));
        }
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            api_url: api_url.to_string(),
            token: token.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for WhapiAdapter {
    fn channel_id(&self) -> &str {
        "whatsapp"
    }

    async fn start(&self, _tx: mpsc::Sender<InboundEvent>) -> Result<()> {
        // Inbound events arrive via the deployment's webhook plumbing.
        Ok(())
    }

    async fn send(&self, chat_id: &str, text: &str) -> Result<()> {
        let to = chat_id.trim();
        if to.is_empty() {
            return Err(anyhow!("chat_id is required"));
        }
        let body = text.trim();
        if body.is_empty() {
            return Err(anyhow!("message text is empty"));
        }

        let payload = serde_json::json!({
            "to": to,
            "body": body,
        });
        let response = self
            .http
            .post(format!("{}/messages/text", self.api_url))
            .bearer_auth(&self.token)
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(anyhow!(
                "whapi send failed: status={} body={}",
                status,
                body
            ));
        }
        tracing::debug!(chat_id = %to, text_len = text.len(), "whapi message sent");
        Ok(())
    }

    async fn send_typing(&self, chat_id: &str, active: bool) -> Result<()> {
        let presence = if active { "typing" } else { "online" };
        let payload = serde_json::json!({
            "presence": presence,
            "delay": 0,
        });
        let response = self
            .http
            .put(format!("{}/presences/{}", self.api_url, chat_id))
            .bearer_auth(&self.token)
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "whapi presence failed: status={} body={}",
                status,
                body
            ));
        }
        Ok(())
    }

    fn supports_typing_events(&self) -> bool {
        true
    }
}
