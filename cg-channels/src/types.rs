use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What kind of activity an inbound event represents. The buffer maps each
/// class to a debounce delay; the channel only classifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventClass {
    Message,
    Voice,
    Typing,
    Recording,
}

impl EventClass {
    /// Presence events signal activity but carry no content of their own.
    pub fn is_presence(&self) -> bool {
        matches!(self, Self::Typing | Self::Recording)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub class: EventClass,
    pub message_id: String,
    /// Stable identifier for the conversation participant.
    pub sender_id: String,
    /// Destination identifier used when dispatching the reply.
    pub chat_id: String,
    /// Best-known human-readable name as reported by the gateway.
    pub display_name: String,
    /// Message text; transcribed text for voice events; empty for presence.
    pub content: String,
    pub received_at: DateTime<Utc>,
}
