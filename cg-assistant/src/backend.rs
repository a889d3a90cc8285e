use crate::error::Result;
use crate::types::{MessageRole, Run, ThreadMessage, ToolOutput};
use async_trait::async_trait;

/// The narrow contract the orchestrator needs from a conversational-AI
/// backend. Production uses [`crate::HttpAssistantBackend`]; tests script
/// their own implementations.
#[async_trait]
pub trait AssistantBackend: Send + Sync {
    /// Create a fresh conversation thread and return its opaque id.
    async fn create_thread(&self) -> Result<String>;

    /// Append one message to a thread.
    async fn add_message(&self, thread_id: &str, role: MessageRole, text: &str) -> Result<()>;

    /// Start a run against the thread's current content.
    async fn create_run(&self, thread_id: &str) -> Result<Run>;

    /// Fetch the current state of a run. Status transitions are only ever
    /// observed through this call.
    async fn get_run(&self, thread_id: &str, run_id: &str) -> Result<Run>;

    /// Submit every pending tool output for a `requires_action` run as a
    /// single batch.
    async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: &[ToolOutput],
    ) -> Result<()>;

    /// Newest-first messages on the thread, at most `limit`.
    async fn list_messages(&self, thread_id: &str, limit: u32) -> Result<Vec<ThreadMessage>>;
}
