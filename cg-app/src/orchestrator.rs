//! Conversation run orchestrator: drives one aggregated turn through the
//! assistant backend to a reply.
//!
//! Per user the pipeline is strictly serialized: resolve thread → submit →
//! poll → reply runs under that user's lock, so two turns can never race
//! on the same conversation thread. Turns for different users proceed in
//! parallel.

use crate::buffer::Turn;
use crate::threads::{ConversationThread, ThreadRegistry};
use cg_assistant::{
    AssistantBackend, BackendError, MessageRole, PendingToolCall, Run, RunStatus, RunUsage,
    ToolOutput,
};
use cg_functions::{FunctionError, FunctionRegistry};
use cg_retry::{RetryPolicy, retry_if};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Delay between run-status polls while the backend is working.
    pub poll_interval: Duration,
    /// Growth applied to the poll delay after a transient fetch error.
    pub poll_growth_factor: f64,
    pub max_poll_delay: Duration,
    /// Hard ceiling on polls per run; exceeding it is `RunTimedOut`.
    pub max_poll_attempts: u32,
    /// Retry shape for thread creation, submission and output upload.
    pub retry: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            poll_growth_factor: 1.5,
            max_poll_delay: Duration::from_secs(5),
            max_poll_attempts: 30,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("backend run ended {status}: {detail}")]
    RunFailed { status: RunStatus, detail: String },

    #[error("run polling gave up after {attempts} attempts")]
    RunTimedOut { attempts: u32 },

    #[error("assistant produced no reply text")]
    EmptyReply,

    #[error("backend requested unknown function: {0}")]
    UnknownFunction(String),

    #[error("malformed arguments for {function}: {detail}")]
    MalformedArguments { function: String, detail: String },

    #[error("thread registry error: {0}")]
    Registry(String),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl OrchestratorError {
    fn recoverable_invalid_thread(&self) -> bool {
        matches!(self, Self::Backend(e) if e.is_invalid_thread())
    }
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub reply: String,
    pub thread_id: String,
    pub usage: Option<RunUsage>,
}

pub struct Orchestrator {
    backend: Arc<dyn AssistantBackend>,
    registry: Arc<ThreadRegistry>,
    functions: Arc<FunctionRegistry>,
    cfg: OrchestratorConfig,
    user_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl Orchestrator {
    pub fn new(
        backend: Arc<dyn AssistantBackend>,
        registry: Arc<ThreadRegistry>,
        functions: Arc<FunctionRegistry>,
        cfg: OrchestratorConfig,
    ) -> Self {
        Self {
            backend,
            registry,
            functions,
            cfg,
            user_locks: DashMap::new(),
        }
    }

    /// Process one flushed turn to a reply. Serialized per user; the lock
    /// is released on every exit path, including timeouts.
    #[tracing::instrument(level = "info", skip_all, fields(user_id = %turn.user_id))]
    pub async fn process(&self, turn: &Turn) -> Result<TurnOutcome, OrchestratorError> {
        let lock = self
            .user_locks
            .entry(turn.user_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let started = Instant::now();
        let result = match self.run_turn(turn).await {
            Err(e) if e.recoverable_invalid_thread() => {
                tracing::warn!(
                    user_id = %turn.user_id,
                    error = %e,
                    "backend thread is gone, recreating and replaying turn once"
                );
                self.registry
                    .remove(&turn.user_id)
                    .await
                    .map_err(|e| OrchestratorError::Registry(e.to_string()))?;
                self.run_turn(turn).await
            }
            other => other,
        };

        match &result {
            Ok(outcome) => tracing::info!(
                user_id = %turn.user_id,
                thread_id = %outcome.thread_id,
                latency_ms = started.elapsed().as_millis() as u64,
                total_tokens = outcome.usage.map(|u| u.total_tokens).unwrap_or(0),
                reply_len = outcome.reply.len(),
                "turn completed"
            ),
            Err(e) => tracing::warn!(
                user_id = %turn.user_id,
                latency_ms = started.elapsed().as_millis() as u64,
                error = %e,
                "turn failed"
            ),
        }
        result
    }

    async fn run_turn(&self, turn: &Turn) -> Result<TurnOutcome, OrchestratorError> {
        let thread = self.resolve_thread(turn).await?;
        let thread_id = thread.thread_id.clone();

        retry_if(self.cfg.retry, BackendError::is_transient, || {
            self.backend
                .add_message(&thread_id, MessageRole::User, &turn.combined_text)
        })
        .await?;

        let run = retry_if(self.cfg.retry, BackendError::is_transient, || {
            self.backend.create_run(&thread_id)
        })
        .await?;
        tracing::info!(
            user_id = %turn.user_id,
            thread_id = %thread_id,
            run_id = %run.id,
            "run created"
        );

        let outcome = self.drive_run(turn, &thread_id, run).await?;
        self.registry
            .record_turn(&turn.user_id)
            .await
            .map_err(|e| OrchestratorError::Registry(e.to_string()))?;
        Ok(outcome)
    }

    /// Reuse the mapped thread, or create a fresh one when the user has
    /// none or the old thread has carried too many turns. Rotation is
    /// decided here, before submission, never reactively.
    async fn resolve_thread(&self, turn: &Turn) -> Result<ConversationThread, OrchestratorError> {
        if let Some(existing) = self.registry.resolve(&turn.user_id) {
            if !self.registry.needs_rotation(&turn.user_id) {
                return Ok(existing);
            }
            tracing::info!(
                user_id = %turn.user_id,
                thread_id = %existing.thread_id,
                message_count = existing.message_count,
                "rotating conversation thread"
            );
        }

        let thread_id = retry_if(self.cfg.retry, BackendError::is_transient, || {
            self.backend.create_thread()
        })
        .await?;
        self.registry
            .upsert(
                &turn.user_id,
                &thread_id,
                &turn.chat_id,
                &turn.display_name,
                0,
            )
            .await
            .map_err(|e| OrchestratorError::Registry(e.to_string()))
    }

    /// Poll the run to a terminal state, servicing tool calls along the
    /// way. Transient fetch errors grow the poll delay exponentially (with
    /// jitter, capped); the attempt ceiling covers the whole run.
    async fn drive_run(
        &self,
        turn: &Turn,
        thread_id: &str,
        mut run: Run,
    ) -> Result<TurnOutcome, OrchestratorError> {
        let mut attempts = 0u32;
        let mut delay = self.cfg.poll_interval;

        loop {
            match run.status {
                RunStatus::Completed => {
                    return self.fetch_reply(thread_id, run.usage).await;
                }
                RunStatus::RequiresAction => {
                    let outputs = self.service_tool_calls(turn, &run.pending_tool_calls).await?;
                    retry_if(self.cfg.retry, BackendError::is_transient, || {
                        self.backend.submit_tool_outputs(thread_id, &run.id, &outputs)
                    })
                    .await?;
                    tracing::info!(
                        run_id = %run.id,
                        outputs = outputs.len(),
                        "tool outputs submitted, resuming polling"
                    );
                    // This batch is delivered; a transient error on the next
                    // poll must not re-service it.
                    run.status = RunStatus::InProgress;
                    run.pending_tool_calls = Vec::new();
                }
                RunStatus::Failed | RunStatus::Cancelled | RunStatus::Expired => {
                    return Err(OrchestratorError::RunFailed {
                        status: run.status,
                        detail: run
                            .last_error
                            .unwrap_or_else(|| "no additional details".to_string()),
                    });
                }
                RunStatus::Queued | RunStatus::InProgress => {}
            }

            if attempts >= self.cfg.max_poll_attempts {
                tracing::error!(
                    run_id = %run.id,
                    attempts,
                    "run polling ceiling reached"
                );
                return Err(OrchestratorError::RunTimedOut { attempts });
            }
            tokio::time::sleep(delay).await;
            attempts += 1;

            match self.backend.get_run(thread_id, &run.id).await {
                Ok(current) => {
                    if current.status != run.status {
                        tracing::debug!(
                            run_id = %current.id,
                            status = %current.status,
                            attempts,
                            "run status changed"
                        );
                    }
                    run = current;
                    delay = self.cfg.poll_interval;
                }
                Err(e) if e.is_transient() => {
                    let grown = delay.as_millis() as f64 * self.cfg.poll_growth_factor
                        + rand::random::<f64>() * self.cfg.poll_interval.as_millis() as f64;
                    delay = Duration::from_millis(grown as u64).min(self.cfg.max_poll_delay);
                    tracing::warn!(
                        run_id = %run.id,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient poll error, backing off"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Execute every pending tool call and collect one output batch.
    /// Execution failures become that call's own error output so the
    /// backend can react; unknown functions abort the turn.
    async fn service_tool_calls(
        &self,
        turn: &Turn,
        calls: &[PendingToolCall],
    ) -> Result<Vec<ToolOutput>, OrchestratorError> {
        let mut outputs = Vec::with_capacity(calls.len());
        for call in calls {
            let mut arguments: serde_json::Value =
                serde_json::from_str(&call.arguments).map_err(|e| {
                    OrchestratorError::MalformedArguments {
                        function: call.name.clone(),
                        detail: e.to_string(),
                    }
                })?;
            if let Some(object) = arguments.as_object_mut() {
                object
                    .entry("user_id".to_string())
                    .or_insert_with(|| serde_json::Value::String(turn.user_id.clone()));
            }

            tracing::info!(
                tool_call_id = %call.id,
                function = %call.name,
                "servicing tool call"
            );
            let output = match self.functions.execute(&call.name, arguments).await {
                Ok(value) => value.to_string(),
                Err(FunctionError::Unknown(name)) => {
                    return Err(OrchestratorError::UnknownFunction(name));
                }
                Err(e) => {
                    tracing::warn!(
                        tool_call_id = %call.id,
                        function = %call.name,
                        error = %e,
                        "tool call failed, reporting error output"
                    );
                    serde_json::json!({ "error": e.to_string() }).to_string()
                }
            };
            outputs.push(ToolOutput {
                tool_call_id: call.id.clone(),
                output,
            });
        }
        Ok(outputs)
    }

    /// Fetch the newest assistant-authored message on the thread. A
    /// missing message or missing text is a distinct terminal error.
    async fn fetch_reply(
        &self,
        thread_id: &str,
        usage: Option<RunUsage>,
    ) -> Result<TurnOutcome, OrchestratorError> {
        let messages = retry_if(self.cfg.retry, BackendError::is_transient, || {
            self.backend.list_messages(thread_id, 1)
        })
        .await?;

        let Some(latest) = messages.first() else {
            return Err(OrchestratorError::EmptyReply);
        };
        if latest.role != MessageRole::Assistant {
            return Err(OrchestratorError::EmptyReply);
        }
        let reply = latest
            .text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(OrchestratorError::EmptyReply)?;

        Ok(TurnOutcome {
            reply: reply.to_string(),
            thread_id: thread_id.to_string(),
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::threads::MemoryThreadStore;
    use async_trait::async_trait;
    use cg_assistant::ThreadMessage;
    use cg_functions::{AssistantFunction, FunctionSpec};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Backend double scripted with the statuses successive polls observe.
    struct ScriptedBackend {
        created_threads: AtomicU32,
        poll_script: Mutex<VecDeque<Run>>,
        reply: Mutex<Vec<ThreadMessage>>,
        submitted_batches: Mutex<Vec<Vec<ToolOutput>>>,
        dead_thread: Option<String>,
        in_flight: AtomicU32,
        max_in_flight: AtomicU32,
    }

    impl ScriptedBackend {
        fn new(statuses: Vec<Run>, reply: Vec<ThreadMessage>) -> Arc<Self> {
            Arc::new(Self {
                created_threads: AtomicU32::new(0),
                poll_script: Mutex::new(statuses.into()),
                reply: Mutex::new(reply),
                submitted_batches: Mutex::new(Vec::new()),
                dead_thread: None,
                in_flight: AtomicU32::new(0),
                max_in_flight: AtomicU32::new(0),
            })
        }

        fn with_dead_thread(statuses: Vec<Run>, reply: Vec<ThreadMessage>, dead: &str) -> Arc<Self> {
            Arc::new(Self {
                created_threads: AtomicU32::new(0),
                poll_script: Mutex::new(statuses.into()),
                reply: Mutex::new(reply),
                submitted_batches: Mutex::new(Vec::new()),
                dead_thread: Some(dead.to_string()),
                in_flight: AtomicU32::new(0),
                max_in_flight: AtomicU32::new(0),
            })
        }

        fn run(status: RunStatus) -> Run {
            Run {
                id: "run-1".to_string(),
                status,
                pending_tool_calls: Vec::new(),
                usage: None,
                last_error: None,
            }
        }

        fn assistant_reply(text: &str) -> Vec<ThreadMessage> {
            vec![ThreadMessage {
                id: "msg-1".to_string(),
                role: MessageRole::Assistant,
                text: Some(text.to_string()),
            }]
        }
    }

    #[async_trait]
    impl AssistantBackend for ScriptedBackend {
        async fn create_thread(&self) -> cg_assistant::Result<String> {
            let n = self.created_threads.fetch_add(1, Ordering::SeqCst);
            Ok(format!("thread-{n}"))
        }

        async fn add_message(
            &self,
            thread_id: &str,
            _role: MessageRole,
            _text: &str,
        ) -> cg_assistant::Result<()> {
            if self.dead_thread.as_deref() == Some(thread_id) {
                return Err(BackendError::Api {
                    status: 404,
                    code: None,
                    message: format!("No thread found with id {thread_id}"),
                });
            }
            Ok(())
        }

        async fn create_run(&self, _thread_id: &str) -> cg_assistant::Result<Run> {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            Ok(Self::run(RunStatus::Queued))
        }

        async fn get_run(&self, _thread_id: &str, _run_id: &str) -> cg_assistant::Result<Run> {
            // Hold the "run in flight" window open briefly so overlapping
            // turns would be observable.
            tokio::time::sleep(Duration::from_millis(5)).await;
            let next = self
                .poll_script
                .lock()
                .expect("script lock")
                .pop_front()
                .unwrap_or_else(|| Self::run(RunStatus::InProgress));
            if next.status != RunStatus::Queued && next.status != RunStatus::InProgress {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
            }
            Ok(next)
        }

        async fn submit_tool_outputs(
            &self,
            _thread_id: &str,
            _run_id: &str,
            outputs: &[ToolOutput],
        ) -> cg_assistant::Result<()> {
            self.submitted_batches
                .lock()
                .expect("batches lock")
                .push(outputs.to_vec());
            Ok(())
        }

        async fn list_messages(
            &self,
            _thread_id: &str,
            _limit: u32,
        ) -> cg_assistant::Result<Vec<ThreadMessage>> {
            Ok(self.reply.lock().expect("reply lock").clone())
        }
    }

    struct RecordedFunction {
        seen_arguments: Mutex<Vec<serde_json::Value>>,
        fail: bool,
    }

    #[async_trait]
    impl AssistantFunction for RecordedFunction {
        fn spec(&self) -> FunctionSpec {
            FunctionSpec {
                name: "check_availability".to_string(),
                description: "test double".to_string(),
                parameters_schema: json!({"type": "object"}),
            }
        }

        async fn execute(
            &self,
            arguments: serde_json::Value,
        ) -> cg_functions::Result<serde_json::Value> {
            self.seen_arguments
                .lock()
                .expect("arguments lock")
                .push(arguments);
            if self.fail {
                return Err(FunctionError::ExecutionFailed("upstream is down".to_string()));
            }
            Ok(json!({"success": true}))
        }
    }

    fn fast_config() -> OrchestratorConfig {
        OrchestratorConfig {
            poll_interval: Duration::from_millis(2),
            poll_growth_factor: 1.5,
            max_poll_delay: Duration::from_millis(20),
            max_poll_attempts: 20,
            retry: RetryPolicy::new(1, Duration::from_millis(1), Duration::from_millis(5)),
        }
    }

    async fn registry() -> Arc<ThreadRegistry> {
        Arc::new(
            ThreadRegistry::load(Arc::new(MemoryThreadStore::new()), 1000)
                .await
                .expect("load registry"),
        )
    }

    fn turn(user_id: &str) -> Turn {
        Turn {
            user_id: user_id.to_string(),
            combined_text: "hola\nquiero reservar".to_string(),
            chat_id: format!("{user_id}@chat"),
            display_name: "Ana".to_string(),
        }
    }

    fn orchestrator(
        backend: Arc<ScriptedBackend>,
        registry: Arc<ThreadRegistry>,
        functions: FunctionRegistry,
    ) -> Orchestrator {
        Orchestrator::new(backend, registry, Arc::new(functions), fast_config())
    }

    #[tokio::test]
    async fn completed_run_yields_the_assistant_reply() {
        let backend = ScriptedBackend::new(
            vec![
                ScriptedBackend::run(RunStatus::InProgress),
                ScriptedBackend::run(RunStatus::Completed),
            ],
            ScriptedBackend::assistant_reply("¡Hola! ¿Para qué fechas?"),
        );
        let registry = registry().await;
        let orch = orchestrator(backend.clone(), registry.clone(), FunctionRegistry::new());

        let outcome = orch.process(&turn("u1")).await.expect("turn succeeds");
        assert_eq!(outcome.reply, "¡Hola! ¿Para qué fechas?");
        assert_eq!(outcome.thread_id, "thread-0");

        // Successful submission is recorded on the mapping.
        let thread = registry.resolve("u1").expect("mapping exists");
        assert_eq!(thread.message_count, 1);
    }

    #[tokio::test]
    async fn requires_action_submits_one_output_batch() {
        let mut action_run = ScriptedBackend::run(RunStatus::RequiresAction);
        action_run.pending_tool_calls = vec![PendingToolCall {
            id: "call-1".to_string(),
            name: "check_availability".to_string(),
            arguments: r#"{"check_in":"2026-01-10"}"#.to_string(),
        }];
        let backend = ScriptedBackend::new(
            vec![action_run, ScriptedBackend::run(RunStatus::Completed)],
            ScriptedBackend::assistant_reply("Tenemos disponibilidad."),
        );

        let function = Arc::new(RecordedFunction {
            seen_arguments: Mutex::new(Vec::new()),
            fail: false,
        });
        let mut functions = FunctionRegistry::new();
        functions.register(function.clone());

        let orch = orchestrator(backend.clone(), registry().await, functions);
        let outcome = orch.process(&turn("u1")).await.expect("turn succeeds");
        assert_eq!(outcome.reply, "Tenemos disponibilidad.");

        let batches = backend.submitted_batches.lock().expect("batches lock").clone();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[0][0].tool_call_id, "call-1");
        assert!(batches[0][0].output.contains("success"));

        // The caller's user id is injected when the backend omitted it.
        let seen = function.seen_arguments.lock().expect("arguments lock").clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["user_id"], json!("u1"));
        assert_eq!(seen[0]["check_in"], json!("2026-01-10"));
    }

    #[tokio::test]
    async fn tool_failure_is_reported_as_its_own_output() {
        let mut action_run = ScriptedBackend::run(RunStatus::RequiresAction);
        action_run.pending_tool_calls = vec![PendingToolCall {
            id: "call-1".to_string(),
            name: "check_availability".to_string(),
            arguments: "{}".to_string(),
        }];
        let backend = ScriptedBackend::new(
            vec![action_run, ScriptedBackend::run(RunStatus::Completed)],
            ScriptedBackend::assistant_reply("Lo reviso enseguida."),
        );

        let mut functions = FunctionRegistry::new();
        functions.register(Arc::new(RecordedFunction {
            seen_arguments: Mutex::new(Vec::new()),
            fail: true,
        }));

        let orch = orchestrator(backend.clone(), registry().await, functions);
        orch.process(&turn("u1")).await.expect("turn still succeeds");

        let batches = backend.submitted_batches.lock().expect("batches lock").clone();
        assert_eq!(batches.len(), 1);
        assert!(batches[0][0].output.contains("upstream is down"));
    }

    #[tokio::test]
    async fn unknown_function_is_a_terminal_failure() {
        let mut action_run = ScriptedBackend::run(RunStatus::RequiresAction);
        action_run.pending_tool_calls = vec![PendingToolCall {
            id: "call-1".to_string(),
            name: "launch_rocket".to_string(),
            arguments: "{}".to_string(),
        }];
        let backend = ScriptedBackend::new(vec![action_run], Vec::new());

        let orch = orchestrator(backend, registry().await, FunctionRegistry::new());
        let err = orch.process(&turn("u1")).await.expect_err("must fail");
        assert!(matches!(err, OrchestratorError::UnknownFunction(name) if name == "launch_rocket"));
    }

    #[tokio::test]
    async fn malformed_arguments_fail_fast() {
        let mut action_run = ScriptedBackend::run(RunStatus::RequiresAction);
        action_run.pending_tool_calls = vec![PendingToolCall {
            id: "call-1".to_string(),
            name: "check_availability".to_string(),
            arguments: "{not json".to_string(),
        }];
        let backend = ScriptedBackend::new(vec![action_run], Vec::new());

        let mut functions = FunctionRegistry::new();
        functions.register(Arc::new(RecordedFunction {
            seen_arguments: Mutex::new(Vec::new()),
            fail: false,
        }));

        let orch = orchestrator(backend, registry().await, functions);
        let err = orch.process(&turn("u1")).await.expect_err("must fail");
        assert!(matches!(err, OrchestratorError::MalformedArguments { .. }));
    }

    #[tokio::test]
    async fn backend_terminal_states_surface_as_run_failed() {
        let mut failed = ScriptedBackend::run(RunStatus::Failed);
        failed.last_error = Some("server_error: boom".to_string());
        let backend = ScriptedBackend::new(vec![failed], Vec::new());

        let orch = orchestrator(backend, registry().await, FunctionRegistry::new());
        let err = orch.process(&turn("u1")).await.expect_err("must fail");
        match err {
            OrchestratorError::RunFailed { status, detail } => {
                assert_eq!(status, RunStatus::Failed);
                assert!(detail.contains("boom"));
            }
            other => panic!("expected RunFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn polling_ceiling_yields_timed_out() {
        let backend = ScriptedBackend::new(Vec::new(), Vec::new());
        let mut cfg = fast_config();
        cfg.max_poll_attempts = 3;
        let orch = Orchestrator::new(
            backend,
            registry().await,
            Arc::new(FunctionRegistry::new()),
            cfg,
        );

        let err = orch.process(&turn("u1")).await.expect_err("must time out");
        assert!(matches!(err, OrchestratorError::RunTimedOut { attempts: 3 }));
    }

    #[tokio::test]
    async fn empty_reply_is_a_distinct_error() {
        let backend = ScriptedBackend::new(
            vec![ScriptedBackend::run(RunStatus::Completed)],
            Vec::new(),
        );
        let orch = orchestrator(backend, registry().await, FunctionRegistry::new());
        let err = orch.process(&turn("u1")).await.expect_err("must fail");
        assert!(matches!(err, OrchestratorError::EmptyReply));
    }

    #[tokio::test]
    async fn invalid_thread_recovers_exactly_once() {
        let backend = ScriptedBackend::with_dead_thread(
            vec![ScriptedBackend::run(RunStatus::Completed)],
            ScriptedBackend::assistant_reply("Recuperado."),
            "thread-dead",
        );
        let registry = registry().await;
        registry
            .upsert("u1", "thread-dead", "u1@chat", "Ana", 12)
            .await
            .expect("seed mapping");

        let orch = orchestrator(backend.clone(), registry.clone(), FunctionRegistry::new());
        let outcome = orch.process(&turn("u1")).await.expect("turn recovers");
        assert_eq!(outcome.reply, "Recuperado.");

        let thread = registry.resolve("u1").expect("fresh mapping");
        assert_ne!(thread.thread_id, "thread-dead");
        assert_eq!(thread.message_count, 1);
        assert_eq!(backend.created_threads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rotation_creates_a_fresh_thread_before_submission() {
        let backend = ScriptedBackend::new(
            vec![ScriptedBackend::run(RunStatus::Completed)],
            ScriptedBackend::assistant_reply("Nuevo contexto."),
        );
        let registry = Arc::new(
            ThreadRegistry::load(Arc::new(MemoryThreadStore::new()), 10)
                .await
                .expect("load registry"),
        );
        registry
            .upsert("u1", "thread-old", "u1@chat", "Ana", 11)
            .await
            .expect("seed mapping");
        assert!(registry.needs_rotation("u1"));

        let orch = orchestrator(backend.clone(), registry.clone(), FunctionRegistry::new());
        orch.process(&turn("u1")).await.expect("turn succeeds");

        let thread = registry.resolve("u1").expect("mapping exists");
        assert_ne!(thread.thread_id, "thread-old");
        assert_eq!(thread.message_count, 1);
        assert!(!registry.needs_rotation("u1"));
    }

    #[tokio::test]
    async fn same_user_turns_never_overlap() {
        let backend = ScriptedBackend::new(
            vec![
                ScriptedBackend::run(RunStatus::Completed),
                ScriptedBackend::run(RunStatus::Completed),
            ],
            ScriptedBackend::assistant_reply("ok"),
        );
        let orch = Arc::new(orchestrator(
            backend.clone(),
            registry().await,
            FunctionRegistry::new(),
        ));

        let first = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.process(&turn("u1")).await })
        };
        let second = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.process(&turn("u1")).await })
        };
        first.await.expect("join").expect("first turn");
        second.await.expect("join").expect("second turn");

        assert_eq!(backend.max_in_flight.load(Ordering::SeqCst), 1);
    }
}
