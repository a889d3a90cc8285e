//! Assistant-backend contract: threads, messages, runs, tool outputs.

mod backend;
mod error;
mod http;
mod types;

pub use backend::AssistantBackend;
pub use error::{BackendError, Result};
pub use http::HttpAssistantBackend;
pub use types::{
    AssistantInfo, MessageRole, PendingToolCall, Run, RunStatus, RunUsage, ThreadMessage,
    ToolOutput,
};
