//! Durable user → conversation-thread registry.
//!
//! The registry owns the only state shared across turns for a given user.
//! Mutations are last-writer-wins keyed by user id and always flow through
//! the store so a restart reloads the same mapping.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rusqlite::{Connection, params};
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub struct ConversationThread {
    pub user_id: String,
    /// Opaque handle issued by the assistant backend.
    pub thread_id: String,
    pub chat_id: String,
    pub display_name: String,
    /// Turns submitted on this thread since it was created or rotated.
    pub message_count: u64,
    pub last_activity: DateTime<Utc>,
}

/// Storage seam for the registry; production uses sqlite, tests use the
/// in-memory fake.
#[async_trait]
pub trait ThreadStore: Send + Sync {
    async fn load_all(&self) -> Result<Vec<ConversationThread>>;
    async fn put(&self, thread: &ConversationThread) -> Result<()>;
    async fn delete(&self, user_id: &str) -> Result<()>;
}

pub struct SqliteThreadStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteThreadStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute(
            r#"
CREATE TABLE IF NOT EXISTS conversation_threads (
    user_id TEXT PRIMARY KEY,
    thread_id TEXT NOT NULL,
    chat_id TEXT NOT NULL,
    display_name TEXT NOT NULL,
    message_count INTEGER NOT NULL,
    last_activity TEXT NOT NULL
)
"#,
            [],
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock_conn(conn: &Arc<Mutex<Connection>>) -> Result<std::sync::MutexGuard<'_, Connection>> {
        conn.lock()
            .map_err(|_| anyhow::anyhow!("thread store connection mutex poisoned"))
    }
}

#[async_trait]
impl ThreadStore for SqliteThreadStore {
    async fn load_all(&self) -> Result<Vec<ConversationThread>> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Self::lock_conn(&conn)?;
            let mut stmt = conn.prepare(
                r#"
SELECT user_id, thread_id, chat_id, display_name, message_count, last_activity
  FROM conversation_threads
"#,
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?;
            let mut threads = Vec::new();
            for row in rows {
                let (user_id, thread_id, chat_id, display_name, message_count, last_activity) =
                    row?;
                let last_activity = last_activity
                    .parse::<DateTime<Utc>>()
                    .map_err(|e| anyhow::anyhow!("invalid last_activity for {user_id}: {e}"))?;
                threads.push(ConversationThread {
                    user_id,
                    thread_id,
                    chat_id,
                    display_name,
                    message_count: message_count.max(0) as u64,
                    last_activity,
                });
            }
            Ok(threads)
        })
        .await?
    }

    async fn put(&self, thread: &ConversationThread) -> Result<()> {
        let conn = self.conn.clone();
        let thread = thread.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Self::lock_conn(&conn)?;
            conn.execute(
                r#"
INSERT INTO conversation_threads
    (user_id, thread_id, chat_id, display_name, message_count, last_activity)
VALUES (?1, ?2, ?3, ?4, ?5, ?6)
ON CONFLICT(user_id) DO UPDATE
SET thread_id = excluded.thread_id,
    chat_id = excluded.chat_id,
    display_name = excluded.display_name,
    message_count = excluded.message_count,
    last_activity = excluded.last_activity
"#,
                params![
                    thread.user_id,
                    thread.thread_id,
                    thread.chat_id,
                    thread.display_name,
                    thread.message_count as i64,
                    thread.last_activity.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await?
    }

    async fn delete(&self, user_id: &str) -> Result<()> {
        let conn = self.conn.clone();
        let user_id = user_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = Self::lock_conn(&conn)?;
            conn.execute(
                "DELETE FROM conversation_threads WHERE user_id = ?1",
                params![user_id],
            )?;
            Ok(())
        })
        .await?
    }
}

/// In-memory store for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryThreadStore {
    threads: Mutex<Vec<ConversationThread>>,
}

impl MemoryThreadStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ThreadStore for MemoryThreadStore {
    async fn load_all(&self) -> Result<Vec<ConversationThread>> {
        Ok(self
            .threads
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store mutex poisoned"))?
            .clone())
    }

    async fn put(&self, thread: &ConversationThread) -> Result<()> {
        let mut threads = self
            .threads
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store mutex poisoned"))?;
        threads.retain(|t| t.user_id != thread.user_id);
        threads.push(thread.clone());
        Ok(())
    }

    async fn delete(&self, user_id: &str) -> Result<()> {
        self.threads
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store mutex poisoned"))?
            .retain(|t| t.user_id != user_id);
        Ok(())
    }
}

pub struct ThreadRegistry {
    store: Arc<dyn ThreadStore>,
    threads: DashMap<String, ConversationThread>,
    rotation_ceiling: u64,
}

impl ThreadRegistry {
    /// Reload the full mapping from the store; must complete before any
    /// turn is processed.
    pub async fn load(store: Arc<dyn ThreadStore>, rotation_ceiling: u64) -> Result<Self> {
        let threads = DashMap::new();
        for thread in store.load_all().await? {
            threads.insert(thread.user_id.clone(), thread);
        }
        tracing::info!(threads = threads.len(), rotation_ceiling, "thread registry loaded");
        Ok(Self {
            store,
            threads,
            rotation_ceiling,
        })
    }

    /// Pure lookup, no side effects.
    pub fn resolve(&self, user_id: &str) -> Option<ConversationThread> {
        self.threads.get(user_id).map(|t| t.clone())
    }

    /// True once the thread has carried more turns than the ceiling.
    pub fn needs_rotation(&self, user_id: &str) -> bool {
        self.threads
            .get(user_id)
            .map(|t| t.message_count > self.rotation_ceiling)
            .unwrap_or(false)
    }

    pub async fn upsert(
        &self,
        user_id: &str,
        thread_id: &str,
        chat_id: &str,
        display_name: &str,
        message_count: u64,
    ) -> Result<ConversationThread> {
        let thread = ConversationThread {
            user_id: user_id.to_string(),
            thread_id: thread_id.to_string(),
            chat_id: chat_id.to_string(),
            display_name: display_name.to_string(),
            message_count,
            last_activity: Utc::now(),
        };
        self.store.put(&thread).await?;
        self.threads.insert(user_id.to_string(), thread.clone());
        Ok(thread)
    }

    /// Bump the turn counter and refresh the activity timestamp after a
    /// successful submission.
    pub async fn record_turn(&self, user_id: &str) -> Result<Option<ConversationThread>> {
        let updated = {
            let Some(mut entry) = self.threads.get_mut(user_id) else {
                return Ok(None);
            };
            entry.message_count += 1;
            entry.last_activity = Utc::now();
            entry.clone()
        };
        self.store.put(&updated).await?;
        Ok(Some(updated))
    }

    /// Sever a mapping whose backend thread is gone; backend-side history
    /// is never touched.
    pub async fn remove(&self, user_id: &str) -> Result<()> {
        self.threads.remove(user_id);
        self.store.delete(user_id).await?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_registry(ceiling: u64) -> ThreadRegistry {
        ThreadRegistry::load(Arc::new(MemoryThreadStore::new()), ceiling)
            .await
            .expect("load registry")
    }

    #[tokio::test]
    async fn resolve_is_a_pure_lookup() {
        let registry = memory_registry(1000).await;
        assert!(registry.resolve("u1").is_none());
        assert!(registry.resolve("u1").is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn rotation_flips_only_past_the_ceiling() {
        let registry = memory_registry(3).await;
        registry
            .upsert("u1", "t1", "chat-1", "Ana", 0)
            .await
            .expect("upsert");
        assert!(!registry.needs_rotation("u1"));

        for _ in 0..3 {
            registry.record_turn("u1").await.expect("record turn");
        }
        assert!(!registry.needs_rotation("u1"));

        registry.record_turn("u1").await.expect("record turn");
        assert!(registry.needs_rotation("u1"));

        // Repeated resolves never change the answer.
        for _ in 0..5 {
            let _ = registry.resolve("u1");
        }
        assert!(registry.needs_rotation("u1"));

        // Upsert with a reset count ends the rotation condition.
        registry
            .upsert("u1", "t2", "chat-1", "Ana", 0)
            .await
            .expect("upsert reset");
        assert!(!registry.needs_rotation("u1"));
        assert_eq!(registry.resolve("u1").expect("thread").thread_id, "t2");
    }

    #[tokio::test]
    async fn record_turn_on_unknown_user_is_none() {
        let registry = memory_registry(1000).await;
        assert!(registry.record_turn("ghost").await.expect("ok").is_none());
    }

    #[tokio::test]
    async fn remove_severs_the_mapping() {
        let registry = memory_registry(1000).await;
        registry
            .upsert("u1", "t1", "chat-1", "Ana", 5)
            .await
            .expect("upsert");
        registry.remove("u1").await.expect("remove");
        assert!(registry.resolve("u1").is_none());
    }

    #[tokio::test]
    async fn sqlite_store_survives_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("threads.db");

        {
            let store = Arc::new(SqliteThreadStore::open(&db_path).expect("open store"));
            let registry = ThreadRegistry::load(store, 1000).await.expect("load");
            registry
                .upsert("u1", "t1", "chat-1", "Ana", 7)
                .await
                .expect("upsert");
            registry.record_turn("u1").await.expect("record");
        }

        let store = Arc::new(SqliteThreadStore::open(&db_path).expect("reopen store"));
        let registry = ThreadRegistry::load(store, 1000).await.expect("reload");
        let thread = registry.resolve("u1").expect("thread survives restart");
        assert_eq!(thread.thread_id, "t1");
        assert_eq!(thread.message_count, 8);
        assert_eq!(thread.display_name, "Ana");
    }

    #[tokio::test]
    async fn sqlite_delete_removes_the_row() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("threads.db");
        let store = Arc::new(SqliteThreadStore::open(&db_path).expect("open store"));
        let registry = ThreadRegistry::load(store.clone(), 1000)
            .await
            .expect("load");
        registry
            .upsert("u1", "t1", "chat-1", "Ana", 0)
            .await
            .expect("upsert");
        registry.remove("u1").await.expect("remove");

        let reloaded = ThreadRegistry::load(store, 1000).await.expect("reload");
        assert!(reloaded.resolve("u1").is_none());
    }
}
