use nova_common::{Error, Result};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// Persisted transcript row.
#[derive(Debug, Clone)]
pub struct TranscriptTurn {
    pub id: String,
    pub session_id: String,
    pub role: String,
    pub text: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub meta: serde_json::Value,
}

/// Aggregated token usage for one model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageTotals {
    pub model: String,
    pub calls: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
}

/// Identifies one generated output delivered into a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryKey {
    pub mission_run_id: String,
    pub run_key: String,
    pub node_id: String,
    pub output_index: u32,
}

/// Transcript, usage and delivery bookkeeping backed by SQLite.
pub struct TranscriptStore {
    conn: Connection,
}

impl TranscriptStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        info!("opening transcript store at {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open database: {e}")))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
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
                "CREATE TABLE IF NOT EXISTS transcript_turns (
                    id TEXT PRIMARY KEY,
                    session_id TEXT NOT NULL,
                    role TEXT NOT NULL,
                    text TEXT NOT NULL,
                    meta TEXT DEFAULT '{}',
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_transcript_session
                    ON transcript_turns(session_id, created_at);

                CREATE TABLE IF NOT EXISTS usage_events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    model TEXT NOT NULL,
                    prompt_tokens INTEGER NOT NULL,
                    completion_tokens INTEGER NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS deliveries (
                    mission_run_id TEXT NOT NULL,
                    run_key TEXT NOT NULL,
                    node_id TEXT NOT NULL,
                    output_index INTEGER NOT NULL,
                    conversation_id TEXT NOT NULL,
                    message_id TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE (mission_run_id, run_key, node_id, output_index)
                );",
            )
            .map_err(|e| Error::Database(format!("migration failed: {e}")))?;
        Ok(())
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Append one transcript entry and return its id.
    pub fn append_transcript_turn(
        &self,
        session_id: &str,
        role: &str,
        text: &str,
        meta: &serde_json::Value,
    ) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.conn
            .execute(
                "INSERT INTO transcript_turns (id, session_id, role, text, meta, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id,
                    session_id,
                    role,
                    text,
                    meta.to_string(),
                    chrono::Utc::now().to_rfc3339()
                ],
            )
            .map_err(|e| Error::Database(format!("failed to append transcript turn: {e}")))?;
        Ok(id)
    }

    /// Load the most recent entries for a session in chronological order.
    pub fn load_recent_turns(&self, session_id: &str, limit: usize) -> Result<Vec<TranscriptTurn>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, session_id, role, text, meta, created_at
                 FROM transcript_turns
                 WHERE session_id = ?1
                 ORDER BY rowid DESC
                 LIMIT ?2",
            )
            .map_err(|e| Error::Database(format!("failed to prepare transcript query: {e}")))?;

        let rows = stmt
            .query_map(params![session_id, limit as i64], |row| {
                let meta_raw: String = row.get(4)?;
                let created_raw: String = row.get(5)?;
                Ok(TranscriptTurn {
                    id: row.get(0)?,
                    session_id: row.get(1)?,
                    role: row.get(2)?,
                    text: row.get(3)?,
                    meta: serde_json::from_str(&meta_raw).unwrap_or(serde_json::Value::Null),
                    created_at: parse_timestamp(&created_raw),
                })
            })
            .map_err(|e| Error::Database(format!("failed to load transcript: {e}")))?;

        let mut turns = Vec::new();
        for row in rows {
            turns.push(
                row.map_err(|e| Error::Database(format!("failed to read transcript row: {e}")))?,
            );
        }

        // DESC for a cheap tail fetch; callers want chronological order.
        turns.reverse();
        Ok(turns)
    }

    /// Delete all but the newest `keep` entries of a session.
    pub fn prune_old_turns(&self, session_id: &str, keep: usize) -> Result<usize> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM transcript_turns
                 WHERE session_id = ?1
                   AND rowid NOT IN (
                     SELECT rowid FROM transcript_turns
                     WHERE session_id = ?1
                     ORDER BY rowid DESC
                     LIMIT ?2
                   )",
                params![session_id, keep as i64],
            )
            .map_err(|e| Error::Database(format!("failed to prune transcript: {e}")))?;
        Ok(deleted)
    }

    pub fn persist_usage(&self, model: &str, prompt_tokens: u32, completion_tokens: u32) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO usage_events (model, prompt_tokens, completion_tokens)
                 VALUES (?1, ?2, ?3)",
                params![model, prompt_tokens as i64, completion_tokens as i64],
            )
            .map_err(|e| Error::Database(format!("failed to persist usage: {e}")))?;
        Ok(())
    }

    pub fn usage_totals(&self, model: &str) -> Result<Option<UsageTotals>> {
        self.conn
            .query_row(
                "SELECT model, count(*), sum(prompt_tokens), sum(completion_tokens)
                 FROM usage_events WHERE model = ?1 GROUP BY model",
                params![model],
                |row| {
                    Ok(UsageTotals {
                        model: row.get(0)?,
                        calls: row.get(1)?,
                        prompt_tokens: row.get(2)?,
                        completion_tokens: row.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(|e| Error::Database(format!("failed to read usage totals: {e}")))
    }

    /// Record a delivery. Returns `false` when the key was already delivered.
    pub fn record_delivery(
        &self,
        key: &DeliveryKey,
        conversation_id: &str,
        message_id: Option<&str>,
    ) -> Result<bool> {
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO deliveries
                   (mission_run_id, run_key, node_id, output_index, conversation_id, message_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    key.mission_run_id,
                    key.run_key,
                    key.node_id,
                    key.output_index as i64,
                    conversation_id,
                    message_id
                ],
            )
            .map_err(|e| Error::Database(format!("failed to record delivery: {e}")))?;
        Ok(inserted == 1)
    }

    /// Attach the transcript message id to an already-recorded delivery.
    pub fn set_delivery_message(&self, key: &DeliveryKey, message_id: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE deliveries SET message_id = ?5
                 WHERE mission_run_id = ?1 AND run_key = ?2 AND node_id = ?3 AND output_index = ?4",
                params![
                    key.mission_run_id,
                    key.run_key,
                    key.node_id,
                    key.output_index as i64,
                    message_id
                ],
            )
            .map_err(|e| Error::Database(format!("failed to update delivery: {e}")))?;
        Ok(())
    }

    pub fn delivered_message_id(&self, key: &DeliveryKey) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT message_id FROM deliveries
                 WHERE mission_run_id = ?1 AND run_key = ?2 AND node_id = ?3 AND output_index = ?4",
                params![
                    key.mission_run_id,
                    key.run_key,
                    key.node_id,
                    key.output_index as i64
                ],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()
            .map(|found| found.flatten())
            .map_err(|e| Error::Database(format!("failed to read delivery: {e}")))
    }
}

fn parse_timestamp(value: &str) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .unwrap_or_else(|e| {
            warn!("failed to parse timestamp '{}': {e}, falling back to now", value);
            chrono::Utc::now()
        })
}

#[cfg(test)]
mod tests {
    use super::{DeliveryKey, TranscriptStore};

    fn key(index: u32) -> DeliveryKey {
        DeliveryKey {
            mission_run_id: "run-1".to_string(),
            run_key: "daily".to_string(),
            node_id: "summary".to_string(),
            output_index: index,
        }
    }

    #[test]
    fn append_and_load_recent_turns_round_trip() {
        let store = TranscriptStore::in_memory().expect("in-memory store should open");

        store
            .append_transcript_turn("sess-1", "user", "hello", &serde_json::json!({}))
            .expect("user turn append should succeed");
        store
            .append_transcript_turn(
                "sess-1",
                "assistant",
                "hi there",
                &serde_json::json!({"route": "llm"}),
            )
            .expect("assistant turn append should succeed");
        store
            .append_transcript_turn("sess-2", "user", "other", &serde_json::json!({}))
            .expect("other session append should succeed");

        let turns = store
            .load_recent_turns("sess-1", 10)
            .expect("transcript load should succeed");
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, "user");
        assert_eq!(turns[0].text, "hello");
        assert_eq!(turns[1].role, "assistant");
        assert_eq!(turns[1].meta["route"], "llm");
    }

    #[test]
    fn prune_old_turns_keeps_recent() {
        let store = TranscriptStore::in_memory().unwrap();
        for i in 0..5 {
            store
                .append_transcript_turn("sess", "user", &format!("msg {i}"), &serde_json::json!({}))
                .unwrap();
        }

        let deleted = store.prune_old_turns("sess", 2).unwrap();
        assert_eq!(deleted, 3);

        let turns = store.load_recent_turns("sess", 10).unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].text, "msg 3");
        assert_eq!(turns[1].text, "msg 4");
    }

    #[test]
    fn usage_totals_accumulate_per_model() {
        let store = TranscriptStore::in_memory().unwrap();
        store.persist_usage("gpt-4o-mini", 100, 20).unwrap();
        store.persist_usage("gpt-4o-mini", 50, 10).unwrap();
        store.persist_usage("claude", 1, 1).unwrap();

        let totals = store.usage_totals("gpt-4o-mini").unwrap().unwrap();
        assert_eq!(totals.calls, 2);
        assert_eq!(totals.prompt_tokens, 150);
        assert_eq!(totals.completion_tokens, 30);
        assert!(store.usage_totals("missing").unwrap().is_none());
    }

    #[test]
    fn record_delivery_dedupes_on_composite_key() {
        let store = TranscriptStore::in_memory().unwrap();

        assert!(store.record_delivery(&key(0), "conv-1", None).unwrap());
        assert!(!store.record_delivery(&key(0), "conv-1", None).unwrap());
        assert!(store.record_delivery(&key(1), "conv-1", None).unwrap());

        store.set_delivery_message(&key(0), "msg-9").unwrap();
        assert_eq!(
            store.delivered_message_id(&key(0)).unwrap().as_deref(),
            Some("msg-9")
        );
        assert!(store.delivered_message_id(&key(1)).unwrap().is_none());
    }
}
