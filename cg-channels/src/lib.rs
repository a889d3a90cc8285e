//! Messaging-gateway contract: inbound event types and channel adapters.

mod traits;
mod types;
mod whapi;

pub use traits::ChannelAdapter;
pub use types::{EventClass, InboundEvent};
pub use whapi::WhapiAdapter;
