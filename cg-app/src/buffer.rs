//! Adaptive message buffer: debounces a user's burst of inbound events
//! into one logical turn.
//!
//! Each user owns at most one live debounce timer. The armed delay depends
//! on the event class and may only be extended, never shortened, within a
//! buffering cycle: a late "recording" presence event must not let an
//! earlier, shorter message timer truncate a burst that is still arriving.

use cg_channels::EventClass;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct BufferConfig {
    pub message_delay: Duration,
    pub voice_delay: Duration,
    pub typing_delay: Duration,
    pub recording_delay: Duration,
    /// Pending-event hard cap; reaching it flushes immediately.
    pub max_events: usize,
    /// Display-name sentinel the gateway sends when it has no real name.
    pub placeholder_display_name: String,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            message_delay: Duration::from_secs(5),
            voice_delay: Duration::from_secs(8),
            typing_delay: Duration::from_secs(10),
            recording_delay: Duration::from_secs(10),
            max_events: 50,
            placeholder_display_name: "unknown".to_string(),
        }
    }
}

impl BufferConfig {
    pub fn delay_for(&self, class: EventClass) -> Duration {
        match class {
            EventClass::Message => self.message_delay,
            EventClass::Voice => self.voice_delay,
            EventClass::Typing => self.typing_delay,
            EventClass::Recording => self.recording_delay,
        }
    }

    fn is_placeholder(&self, display_name: &str) -> bool {
        let trimmed = display_name.trim();
        trimmed.is_empty() || trimmed.eq_ignore_ascii_case(&self.placeholder_display_name)
    }
}

/// One aggregated unit of user input, handed to the turn processor when
/// the debounce window closes.
#[derive(Debug, Clone)]
pub struct Turn {
    pub user_id: String,
    pub combined_text: String,
    pub chat_id: String,
    pub display_name: String,
}

#[async_trait::async_trait]
pub trait TurnProcessor: Send + Sync {
    async fn process_turn(&self, turn: Turn) -> anyhow::Result<()>;
}

struct BufferEntry {
    chat_id: String,
    display_name: String,
    pending: Vec<String>,
    current_delay: Duration,
    last_activity: Instant,
    /// Monotonic re-arm counter; a timer only flushes the generation it
    /// was armed for, so a stale timer that already woke is inert.
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl BufferEntry {
    fn new(chat_id: &str, display_name: &str, delay: Duration) -> Self {
        Self {
            chat_id: chat_id.to_string(),
            display_name: display_name.to_string(),
            pending: Vec::new(),
            current_delay: delay,
            last_activity: Instant::now(),
            generation: 0,
            timer: None,
        }
    }

    fn cancel_timer(&mut self) {
        self.generation += 1;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[derive(Clone)]
pub struct MessageBuffer {
    inner: Arc<BufferInner>,
}

struct BufferInner {
    cfg: BufferConfig,
    entries: DashMap<String, BufferEntry>,
    processor: Arc<dyn TurnProcessor>,
}

impl MessageBuffer {
    pub fn new(cfg: BufferConfig, processor: Arc<dyn TurnProcessor>) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                cfg,
                entries: DashMap::new(),
                processor,
            }),
        }
    }

    /// Append one text fragment to the user's pending turn, creating the
    /// buffer (message-class delay) if none exists, and re-arm the
    /// debounce countdown at the buffer's current delay.
    pub fn add(&self, user_id: &str, text: &str, chat_id: &str, display_name: &str) {
        let mut capped = None;
        {
            let mut entry = self.inner.entries.entry(user_id.to_string()).or_insert_with(|| {
                BufferEntry::new(chat_id, display_name, self.inner.cfg.message_delay)
            });
            let e = entry.value_mut();
            e.last_activity = Instant::now();

            if !self.inner.cfg.is_placeholder(display_name) && e.display_name != display_name {
                e.display_name = display_name.to_string();
            }
            if e.chat_id.is_empty() && !chat_id.is_empty() {
                e.chat_id = chat_id.to_string();
            }

            if e.pending.last().map(String::as_str) == Some(text) {
                tracing::debug!(user_id, "duplicate event skipped");
                return;
            }

            e.pending.push(text.to_string());
            tracing::debug!(
                user_id,
                pending = e.pending.len(),
                delay_ms = e.current_delay.as_millis() as u64,
                "event buffered"
            );

            if e.pending.len() >= self.inner.cfg.max_events {
                tracing::warn!(
                    user_id,
                    pending = e.pending.len(),
                    max_events = self.inner.cfg.max_events,
                    "event cap reached, flushing immediately"
                );
                e.cancel_timer();
                capped = Some(Turn {
                    user_id: user_id.to_string(),
                    combined_text: std::mem::take(&mut e.pending).join("\n"),
                    chat_id: e.chat_id.clone(),
                    display_name: e.display_name.clone(),
                });
                e.current_delay = self.inner.cfg.message_delay;
            } else {
                let delay = e.current_delay;
                self.arm(e, user_id, delay);
            }
        }

        if let Some(turn) = capped {
            self.inner
                .entries
                .remove_if(user_id, |_, e| e.pending.is_empty() && e.timer.is_none());
            let buffer = self.clone();
            tokio::spawn(async move {
                buffer.deliver(turn).await;
            });
        }
    }

    /// Raise the armed debounce delay for the event class, re-arming the
    /// timer only when the class maps to a strictly longer delay. No-op
    /// when the user has no pending aggregation: presence alone carries
    /// nothing to flush.
    pub fn set_priority(&self, user_id: &str, class: EventClass) {
        let delay = self.inner.cfg.delay_for(class);
        let Some(mut entry) = self.inner.entries.get_mut(user_id) else {
            return;
        };
        let e = entry.value_mut();
        e.last_activity = Instant::now();
        if delay > e.current_delay {
            tracing::debug!(
                user_id,
                class = ?class,
                previous_ms = e.current_delay.as_millis() as u64,
                delay_ms = delay.as_millis() as u64,
                "debounce window extended"
            );
            e.current_delay = delay;
            self.arm(e, user_id, delay);
        }
    }

    /// Discard buffers idle longer than `max_age` without flushing.
    /// Returns the number removed.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let mut removed = 0usize;
        self.inner.entries.retain(|user_id, e| {
            if e.last_activity.elapsed() <= max_age {
                return true;
            }
            tracing::info!(
                user_id = %user_id,
                pending = e.pending.len(),
                idle_ms = e.last_activity.elapsed().as_millis() as u64,
                "discarding stale buffer"
            );
            e.cancel_timer();
            removed += 1;
            false
        });
        removed
    }

    pub fn pending_len(&self, user_id: &str) -> Option<usize> {
        self.inner.entries.get(user_id).map(|e| e.pending.len())
    }

    pub fn current_delay(&self, user_id: &str) -> Option<Duration> {
        self.inner.entries.get(user_id).map(|e| e.current_delay)
    }

    pub fn active_buffers(&self) -> usize {
        self.inner.entries.len()
    }

    fn arm(&self, entry: &mut BufferEntry, user_id: &str, delay: Duration) {
        entry.cancel_timer();
        let generation = entry.generation;
        let buffer = self.clone();
        let user_id = user_id.to_string();
        entry.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            buffer.flush_expired(&user_id, generation).await;
        }));
    }

    /// Timer-side flush: removes the buffer and its timer atomically, but
    /// only if the firing timer is still the current generation.
    async fn flush_expired(&self, user_id: &str, generation: u64) {
        let Some((_, entry)) = self
            .inner
            .entries
            .remove_if(user_id, |_, e| e.generation == generation)
        else {
            return;
        };
        if entry.pending.is_empty() {
            return;
        }
        let turn = Turn {
            user_id: user_id.to_string(),
            combined_text: entry.pending.join("\n"),
            chat_id: entry.chat_id,
            display_name: entry.display_name,
        };
        self.deliver(turn).await;
    }

    async fn deliver(&self, turn: Turn) {
        tracing::info!(
            user_id = %turn.user_id,
            display_name = %turn.display_name,
            text_len = turn.combined_text.len(),
            "turn flushed"
        );
        if let Err(e) = self.inner.processor.process_turn(turn.clone()).await {
            tracing::error!(
                user_id = %turn.user_id,
                error = %e,
                "turn processing failed"
            );
        }
    }
}
