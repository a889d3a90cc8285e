//! Concierge configuration loader.

use crate::buffer::BufferConfig;
use crate::orchestrator::OrchestratorConfig;
use cg_retry::RetryPolicy;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct ConciergeConfig {
    pub general: GeneralConfig,
    #[serde(default)]
    pub keys: KeysConfig,
    #[serde(default)]
    pub buffer: BufferSettings,
    #[serde(default)]
    pub threads: ThreadSettings,
    #[serde(default)]
    pub run: RunSettings,
    #[serde(default)]
    pub gateway: GatewaySettings,
    #[serde(default)]
    pub booking: BookingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    /// Backend assistant the runs execute against.
    pub assistant_id: String,
    #[serde(default = "default_fallback_reply")]
    pub fallback_reply: String,
}

fn default_fallback_reply() -> String {
    "Lo siento, estamos teniendo un inconveniente técnico. Un miembro del equipo te \
     responderá en breve."
        .to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeysConfig {
    pub openai_api_key: Option<String>,
    pub whapi_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BufferSettings {
    #[serde(default = "default_message_delay_ms")]
    pub message_delay_ms: u64,
    #[serde(default = "default_voice_delay_ms")]
    pub voice_delay_ms: u64,
    #[serde(default = "default_typing_delay_ms")]
    pub typing_delay_ms: u64,
    #[serde(default = "default_recording_delay_ms")]
    pub recording_delay_ms: u64,
    #[serde(default = "default_max_events")]
    pub max_events: usize,
    #[serde(default = "default_placeholder_display_name")]
    pub placeholder_display_name: String,
    /// Cadence of the idle-buffer sweep.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// Idle age past which an unflushed buffer is discarded.
    #[serde(default = "default_max_idle_secs")]
    pub max_idle_secs: u64,
}

fn default_message_delay_ms() -> u64 {
    5000
}

fn default_voice_delay_ms() -> u64 {
    8000
}

fn default_typing_delay_ms() -> u64 {
    10000
}

fn default_recording_delay_ms() -> u64 {
    10000
}

fn default_max_events() -> usize {
    50
}

fn default_placeholder_display_name() -> String {
    "unknown".to_string()
}

fn default_cleanup_interval_secs() -> u64 {
    300
}

fn default_max_idle_secs() -> u64 {
    900
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            message_delay_ms: default_message_delay_ms(),
            voice_delay_ms: default_voice_delay_ms(),
            typing_delay_ms: default_typing_delay_ms(),
            recording_delay_ms: default_recording_delay_ms(),
            max_events: default_max_events(),
            placeholder_display_name: default_placeholder_display_name(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            max_idle_secs: default_max_idle_secs(),
        }
    }
}

impl BufferSettings {
    pub fn to_buffer_config(&self) -> BufferConfig {
        BufferConfig {
            message_delay: Duration::from_millis(self.message_delay_ms),
            voice_delay: Duration::from_millis(self.voice_delay_ms),
            typing_delay: Duration::from_millis(self.typing_delay_ms),
            recording_delay: Duration::from_millis(self.recording_delay_ms),
            max_events: self.max_events,
            placeholder_display_name: self.placeholder_display_name.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThreadSettings {
    /// Defaults to `<data dir>/threads.db`.
    #[serde(default)]
    pub db_path: Option<String>,
    #[serde(default = "default_rotation_ceiling")]
    pub rotation_ceiling: u64,
}

fn default_rotation_ceiling() -> u64 {
    1000
}

impl Default for ThreadSettings {
    fn default() -> Self {
        Self {
            db_path: None,
            rotation_ceiling: default_rotation_ceiling(),
        }
    }
}

impl ThreadSettings {
    pub fn resolved_db_path(&self) -> PathBuf {
        match &self.db_path {
            Some(path) => PathBuf::from(path),
            None => default_data_dir().join("threads.db"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunSettings {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_poll_growth_factor")]
    pub poll_growth_factor: f64,
    #[serde(default = "default_max_poll_delay_ms")]
    pub max_poll_delay_ms: u64,
    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: u32,
    #[serde(default = "default_retry_max_retries")]
    pub retry_max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_poll_growth_factor() -> f64 {
    1.5
}

fn default_max_poll_delay_ms() -> u64 {
    5000
}

fn default_max_poll_attempts() -> u32 {
    30
}

fn default_retry_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_retry_max_delay_ms() -> u64 {
    10000
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            poll_growth_factor: default_poll_growth_factor(),
            max_poll_delay_ms: default_max_poll_delay_ms(),
            max_poll_attempts: default_max_poll_attempts(),
            retry_max_retries: default_retry_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

impl RunSettings {
    pub fn to_orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            poll_growth_factor: self.poll_growth_factor,
            max_poll_delay: Duration::from_millis(self.max_poll_delay_ms),
            max_poll_attempts: self.max_poll_attempts,
            retry: RetryPolicy::new(
                self.retry_max_retries,
                Duration::from_millis(self.retry_base_delay_ms),
                Duration::from_millis(self.retry_max_delay_ms),
            ),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySettings {
    #[serde(default = "default_whapi_api_url")]
    pub whapi_api_url: String,
    /// Send a typing indicator while a turn is being processed.
    #[serde(default = "default_typing_indicator")]
    pub typing_indicator: bool,
}

fn default_whapi_api_url() -> String {
    "https://gate.whapi.cloud".to_string()
}

fn default_typing_indicator() -> bool {
    true
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            whapi_api_url: default_whapi_api_url(),
            typing_indicator: default_typing_indicator(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BookingConfig {
    pub api_url: Option<String>,
    pub api_key: Option<String>,
}

impl ConciergeConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let path = path.unwrap_or_else(default_config_path);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;

        let mut cfg: ConciergeConfig = toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?;

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("OPENAI_API_KEY") {
            if !v.trim().is_empty() {
                self.keys.openai_api_key = Some(v);
            }
        }
        if let Ok(v) = std::env::var("WHAPI_TOKEN") {
            if !v.trim().is_empty() {
                self.keys.whapi_token = Some(v);
            }
        }
        if let Ok(v) = std::env::var("CONCIERGE_ASSISTANT_ID") {
            if !v.trim().is_empty() {
                self.general.assistant_id = v;
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.general.assistant_id.trim().is_empty() {
            return Err(anyhow::anyhow!("general.assistant_id is required"));
        }
        if self.buffer.max_events == 0 {
            return Err(anyhow::anyhow!("buffer.max_events must be > 0"));
        }
        if self.run.max_poll_attempts == 0 {
            return Err(anyhow::anyhow!("run.max_poll_attempts must be > 0"));
        }
        if self.run.poll_growth_factor < 1.0 {
            return Err(anyhow::anyhow!("run.poll_growth_factor must be >= 1.0"));
        }
        if self.threads.rotation_ceiling == 0 {
            return Err(anyhow::anyhow!("threads.rotation_ceiling must be > 0"));
        }
        if self.booking.api_url.is_some() != self.booking.api_key.is_some() {
            return Err(anyhow::anyhow!(
                "booking.api_url and booking.api_key must be set together"
            ));
        }
        Ok(())
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".concierge").join("config.toml")
}

pub fn default_data_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".concierge").join("data")
}
