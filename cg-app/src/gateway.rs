//! Inbound event wiring: channel adapters feed one queue, the queue feeds
//! the buffer, and flushed turns come back through [`TurnHandler`] for
//! orchestration and dispatch.

use crate::buffer::{MessageBuffer, Turn, TurnProcessor};
use crate::orchestrator::Orchestrator;
use anyhow::Result;
use cg_channels::{ChannelAdapter, EventClass, InboundEvent};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Buffer flush callback: runs the orchestrator and dispatches the reply.
/// Typed orchestrator failures become the configured fallback message; the
/// user never sees a raw error.
pub struct TurnHandler {
    orchestrator: Arc<Orchestrator>,
    channel: Arc<dyn ChannelAdapter>,
    fallback_reply: String,
    typing_indicator: bool,
}

impl TurnHandler {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        channel: Arc<dyn ChannelAdapter>,
        fallback_reply: String,
        typing_indicator: bool,
    ) -> Self {
        Self {
            orchestrator,
            channel,
            fallback_reply,
            typing_indicator,
        }
    }
}

#[async_trait::async_trait]
impl TurnProcessor for TurnHandler {
    async fn process_turn(&self, turn: Turn) -> Result<()> {
        let typing = self.typing_indicator && self.channel.supports_typing_events();
        if typing {
            if let Err(e) = self.channel.send_typing(&turn.chat_id, true).await {
                tracing::debug!(chat_id = %turn.chat_id, %e, "typing indicator failed");
            }
        }

        let result = self.orchestrator.process(&turn).await;

        if typing {
            if let Err(e) = self.channel.send_typing(&turn.chat_id, false).await {
                tracing::debug!(chat_id = %turn.chat_id, %e, "typing indicator failed");
            }
        }

        let reply = match result {
            Ok(outcome) => outcome.reply,
            Err(e) => {
                tracing::warn!(
                    user_id = %turn.user_id,
                    error = %e,
                    "turn orchestration failed, sending fallback reply"
                );
                self.fallback_reply.clone()
            }
        };
        self.channel.send(&turn.chat_id, &reply).await
    }
}

pub struct Gateway {
    buffer: MessageBuffer,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<InboundEvent>>,
}

impl Gateway {
    pub fn new(buffer: MessageBuffer, inbound_rx: mpsc::Receiver<InboundEvent>) -> Self {
        Self {
            buffer,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    pub async fn run_loop(&self) -> Result<()> {
        loop {
            let event = {
                let mut rx = self.inbound_rx.lock().await;
                rx.recv().await
            };
            let Some(event) = event else {
                tracing::info!("inbound queue closed, gateway loop exiting");
                return Ok(());
            };
            self.handle_inbound(event);
        }
    }

    fn handle_inbound(&self, event: InboundEvent) {
        tracing::debug!(
            sender_id = %event.sender_id,
            class = ?event.class,
            message_id = %event.message_id,
            "inbound event"
        );
        match event.class {
            EventClass::Message => {
                self.buffer.add(
                    &event.sender_id,
                    &event.content,
                    &event.chat_id,
                    &event.display_name,
                );
            }
            EventClass::Voice => {
                self.buffer.add(
                    &event.sender_id,
                    &event.content,
                    &event.chat_id,
                    &event.display_name,
                );
                self.buffer.set_priority(&event.sender_id, EventClass::Voice);
            }
            EventClass::Typing | EventClass::Recording => {
                self.buffer.set_priority(&event.sender_id, event.class);
            }
        }
    }
}
