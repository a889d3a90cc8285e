//! Component construction and the long-running serve loop.

use crate::buffer::MessageBuffer;
use crate::config::ConciergeConfig;
use crate::gateway::{Gateway, TurnHandler};
use crate::orchestrator::Orchestrator;
use crate::threads::{SqliteThreadStore, ThreadRegistry};
use anyhow::Result;
use cg_assistant::HttpAssistantBackend;
use cg_channels::{ChannelAdapter, WhapiAdapter};
use cg_functions::{CheckAvailabilityFunction, EscalateToHumanFunction, FunctionRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = ConciergeConfig::load(config_path).await?;

    let api_key = cfg
        .keys
        .openai_api_key
        .clone()
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| anyhow::anyhow!("keys.openai_api_key (or OPENAI_API_KEY) is required"))?;
    let whapi_token = cfg
        .keys
        .whapi_token
        .clone()
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| anyhow::anyhow!("keys.whapi_token (or WHAPI_TOKEN) is required"))?;

    let backend = Arc::new(HttpAssistantBackend::new(&api_key, &cfg.general.assistant_id));

    let db_path = cfg.threads.resolved_db_path();
    let store = Arc::new(SqliteThreadStore::open(&db_path)?);
    let registry = Arc::new(ThreadRegistry::load(store, cfg.threads.rotation_ceiling).await?);
    tracing::info!(
        db_path = %db_path.display(),
        threads = registry.len(),
        "thread registry ready"
    );

    let mut functions = FunctionRegistry::new();
    functions.register(Arc::new(EscalateToHumanFunction));
    if let (Some(api_url), Some(api_key)) = (&cfg.booking.api_url, &cfg.booking.api_key) {
        functions.register(Arc::new(CheckAvailabilityFunction::new(api_url, api_key)));
    }
    let registered: Vec<String> = functions.specs().iter().map(|s| s.name.clone()).collect();
    tracing::info!(functions = ?registered, "function registry ready");

    let orchestrator = Arc::new(Orchestrator::new(
        backend,
        registry,
        Arc::new(functions),
        cfg.run.to_orchestrator_config(),
    ));

    let channel: Arc<dyn ChannelAdapter> =
        Arc::new(WhapiAdapter::new(&cfg.gateway.whapi_api_url, &whapi_token)?);
    let handler = Arc::new(TurnHandler::new(
        orchestrator,
        channel.clone(),
        cfg.general.fallback_reply.clone(),
        cfg.gateway.typing_indicator,
    ));
    let buffer = MessageBuffer::new(cfg.buffer.to_buffer_config(), handler);

    spawn_buffer_cleanup(
        buffer.clone(),
        Duration::from_secs(cfg.buffer.cleanup_interval_secs),
        Duration::from_secs(cfg.buffer.max_idle_secs),
    );

    let (inbound_tx, inbound_rx) = mpsc::channel(256);
    channel.start(inbound_tx).await?;
    tracing::info!(channel = channel.channel_id(), "channel started");

    let gateway = Gateway::new(buffer, inbound_rx);
    gateway.run_loop().await
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = ConciergeConfig::load(config_path).await?;

    let api_key = cfg
        .keys
        .openai_api_key
        .clone()
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| anyhow::anyhow!("keys.openai_api_key (or OPENAI_API_KEY) is required"))?;
    let backend = HttpAssistantBackend::new(&api_key, &cfg.general.assistant_id);
    let assistant = backend.retrieve_assistant().await?;
    tracing::info!(
        assistant_id = %assistant.id,
        assistant_name = assistant.name.as_deref().unwrap_or("-"),
        model = assistant.model.as_deref().unwrap_or("-"),
        "assistant backend reachable"
    );

    if cfg
        .keys
        .whapi_token
        .as_deref()
        .is_none_or(|t| t.trim().is_empty())
    {
        tracing::warn!("keys.whapi_token is not set; serve will refuse to start");
    }
    tracing::info!(
        rotation_ceiling = cfg.threads.rotation_ceiling,
        db_path = %cfg.threads.resolved_db_path().display(),
        "config ok"
    );
    Ok(())
}

fn spawn_buffer_cleanup(buffer: MessageBuffer, interval: Duration, max_age: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = buffer.cleanup(max_age);
            if removed > 0 {
                tracing::info!(removed, "stale buffers cleaned up");
            }
        }
    });
}
