use crate::types::InboundEvent;
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Unique channel identifier: "whatsapp", "webchat".
    fn channel_id(&self) -> &str;

    /// Start receiving events. Push to tx for each inbound event.
    async fn start(&self, tx: mpsc::Sender<InboundEvent>) -> Result<()>;

    /// Send a reply to a conversation on this platform.
    async fn send(&self, chat_id: &str, text: &str) -> Result<()>;

    /// Toggle a typing indicator where supported.
    async fn send_typing(&self, _chat_id: &str, _active: bool) -> Result<()> {
        Err(anyhow::anyhow!(
            "send_typing is not supported by this channel"
        ))
    }

    fn supports_typing_events(&self) -> bool {
        false
    }
}
