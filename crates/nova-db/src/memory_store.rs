use chrono::{DateTime, Utc};
use nova_common::{Error, Result};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Persisted memory entry used for recall during prompt assembly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    pub user_context_id: String,
    pub conversation_id: Option<String>,
    pub role: MemoryRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMemoryEntry {
    pub user_context_id: String,
    pub conversation_id: Option<String>,
    pub role: MemoryRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MemoryRole {
    User,
    Assistant,
    System,
}

impl MemoryRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "assistant" => Self::Assistant,
            "system" => Self::System,
            _ => Self::User,
        }
    }
}

/// Keyword recall store, scoped per user context.
pub struct MemoryStore {
    conn: Connection,
}

impl MemoryStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        info!("opening memory store at {}", db_path.display());
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open memory database: {e}")))?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        let store = Self { conn };
        store.run_migrations()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;

        let store = Self { conn };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS memory_entries (
                    id TEXT PRIMARY KEY,
                    user_context_id TEXT NOT NULL,
                    conversation_id TEXT,
                    role TEXT NOT NULL,
                    content TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_memory_user_created_at
                    ON memory_entries(user_context_id, created_at);

                CREATE TABLE IF NOT EXISTS user_preferences (
                    user_context_id TEXT NOT NULL,
                    key TEXT NOT NULL,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (user_context_id, key)
                );",
            )
            .map_err(|e| Error::Database(format!("memory migration failed: {e}")))?;
        Ok(())
    }

    pub fn remember(&self, entry: NewMemoryEntry) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.conn
            .execute(
                "INSERT INTO memory_entries (id, user_context_id, conversation_id, role, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id,
                    entry.user_context_id,
                    entry.conversation_id,
                    entry.role.as_str(),
                    entry.content,
                    Utc::now().to_rfc3339()
                ],
            )
            .map_err(|e| Error::Database(format!("failed to store memory: {e}")))?;
        Ok(id)
    }

    /// Newest-first entries for the user whose content contains any keyword
    /// of `query` (words of three or more characters).
    pub fn recall(&self, user_context_id: &str, query: &str, limit: usize) -> Result<Vec<MemoryEntry>> {
        let keywords: Vec<String> = query
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.chars().count() >= 3)
            .map(|w| format!("%{}%", w.to_lowercase()))
            .take(8)
            .collect();
        if keywords.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let clauses = (0..keywords.len())
            .map(|i| format!("lower(content) LIKE ?{}", i + 2))
            .collect::<Vec<_>>()
            .join(" OR ");
        let sql = format!(
            "SELECT id, user_context_id, conversation_id, role, content, created_at
             FROM memory_entries
             WHERE user_context_id = ?1 AND ({clauses})
             ORDER BY rowid DESC
             LIMIT {limit}"
        );

        let mut bind: Vec<&dyn rusqlite::ToSql> = vec![&user_context_id];
        for kw in &keywords {
            bind.push(kw);
        }

        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|e| Error::Database(format!("failed to prepare recall query: {e}")))?;
        let rows = stmt
            .query_map(bind.as_slice(), |row| {
                let role: String = row.get(3)?;
                let created: String = row.get(5)?;
                Ok(MemoryEntry {
                    id: row.get(0)?,
                    user_context_id: row.get(1)?,
                    conversation_id: row.get(2)?,
                    role: MemoryRole::parse(&role),
                    content: row.get(4)?,
                    created_at: DateTime::parse_from_rfc3339(&created)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                })
            })
            .map_err(|e| Error::Database(format!("failed to recall memory: {e}")))?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Database(format!("failed to read memory row: {e}")))
    }

    /// Insert or overwrite one preference for the user.
    pub fn set_preference(&self, user_context_id: &str, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO user_preferences (user_context_id, key, value, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_context_id, key)
                 DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![user_context_id, key, value, Utc::now().to_rfc3339()],
            )
            .map_err(|e| Error::Database(format!("failed to store preference: {e}")))?;
        Ok(())
    }

    /// All preferences for the user, ordered by key.
    pub fn preferences(&self, user_context_id: &str) -> Result<Vec<(String, String)>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT key, value FROM user_preferences
                 WHERE user_context_id = ?1
                 ORDER BY key",
            )
            .map_err(|e| Error::Database(format!("failed to prepare preference query: {e}")))?;
        let rows = stmt
            .query_map(params![user_context_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| Error::Database(format!("failed to load preferences: {e}")))?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Database(format!("failed to read preference row: {e}")))
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(user: &str, content: &str) -> NewMemoryEntry {
        NewMemoryEntry {
            user_context_id: user.to_string(),
            conversation_id: Some("conv".to_string()),
            role: MemoryRole::User,
            content: content.to_string(),
        }
    }

    #[test]
    fn in_memory_creates_memory_entries_table() {
        let store = MemoryStore::in_memory().expect("failed to create in-memory memory store");
        let exists: i64 = store
            .connection()
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name='memory_entries'",
                [],
                |row| row.get(0),
            )
            .expect("failed to query sqlite_master");

        assert_eq!(exists, 1);
    }

    #[test]
    fn recall_matches_keywords_newest_first() {
        let store = MemoryStore::in_memory().unwrap();
        store.remember(entry("u1", "I live in Lisbon")).unwrap();
        store.remember(entry("u1", "My favourite coin is ETH")).unwrap();
        store.remember(entry("u1", "Lisbon trip in May")).unwrap();
        store.remember(entry("u2", "Lisbon is sunny")).unwrap();

        let hits = store.recall("u1", "weather in lisbon?", 5).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].content, "Lisbon trip in May");
        assert_eq!(hits[1].content, "I live in Lisbon");
    }

    #[test]
    fn preferences_upsert_per_user() {
        let store = MemoryStore::in_memory().unwrap();
        store.set_preference("u1", "units", "imperial").unwrap();
        store.set_preference("u1", "tone", "brief").unwrap();
        store.set_preference("u1", "units", "metric").unwrap();
        store.set_preference("u2", "units", "imperial").unwrap();

        assert_eq!(
            store.preferences("u1").unwrap(),
            vec![
                ("tone".to_string(), "brief".to_string()),
                ("units".to_string(), "metric".to_string())
            ]
        );
        assert!(store.preferences("u3").unwrap().is_empty());
    }

    #[test]
    fn recall_with_only_short_words_is_empty() {
        let store = MemoryStore::in_memory().unwrap();
        store.remember(entry("u1", "a b c")).unwrap();
        assert!(store.recall("u1", "a b", 5).unwrap().is_empty());
    }
}
