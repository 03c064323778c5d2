use std::path::Path;

use async_trait::async_trait;
use nova_common::Result;
use nova_db::{DeliveryKey, TranscriptStore, TranscriptTurn};
use nova_security::redact_secrets;
use tokio::sync::Mutex;
use tracing::debug;

/// Durable record of turns, usage and report deliveries.
///
/// Implementations redact secrets before anything reaches storage.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn append_transcript_turn(
        &self,
        session_id: &str,
        role: &str,
        text: &str,
        meta: serde_json::Value,
    ) -> Result<String>;

    async fn load_history(&self, session_id: &str, limit: usize) -> Result<Vec<TranscriptTurn>>;

    async fn persist_usage(&self, model: &str, prompt_tokens: u32, completion_tokens: u32) -> Result<()>;

    /// Returns `false` when the key was already delivered.
    async fn record_delivery(
        &self,
        key: &DeliveryKey,
        conversation_id: &str,
        message_id: Option<&str>,
    ) -> Result<bool>;

    async fn delivered_message_id(&self, key: &DeliveryKey) -> Result<Option<String>>;
}

/// [`PersistenceSink`] over the SQLite transcript store.
pub struct SqlitePersistence {
    store: Mutex<TranscriptStore>,
}

impl SqlitePersistence {
    pub fn new(store: TranscriptStore) -> Self {
        Self {
            store: Mutex::new(store),
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(TranscriptStore::open(path)?))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(TranscriptStore::in_memory()?))
    }
}

#[async_trait]
impl PersistenceSink for SqlitePersistence {
    async fn append_transcript_turn(
        &self,
        session_id: &str,
        role: &str,
        text: &str,
        meta: serde_json::Value,
    ) -> Result<String> {
        let text = redact_secrets(text);
        let store = self.store.lock().await;
        let id = store.append_transcript_turn(session_id, role, &text, &meta)?;
        debug!(session_id, role, id = %id, "transcript turn stored");
        Ok(id)
    }

    async fn load_history(&self, session_id: &str, limit: usize) -> Result<Vec<TranscriptTurn>> {
        self.store.lock().await.load_recent_turns(session_id, limit)
    }

    async fn persist_usage(&self, model: &str, prompt_tokens: u32, completion_tokens: u32) -> Result<()> {
        self.store
            .lock()
            .await
            .persist_usage(model, prompt_tokens, completion_tokens)
    }

    async fn record_delivery(
        &self,
        key: &DeliveryKey,
        conversation_id: &str,
        message_id: Option<&str>,
    ) -> Result<bool> {
        self.store
            .lock()
            .await
            .record_delivery(key, conversation_id, message_id)
    }

    async fn delivered_message_id(&self, key: &DeliveryKey) -> Result<Option<String>> {
        self.store.lock().await.delivered_message_id(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transcript_text_is_redacted() {
        let sink = SqlitePersistence::in_memory().unwrap();
        sink.append_transcript_turn(
            "conv-1",
            "user",
            "my key is sk-ant-REDACTED",
            serde_json::json!({}),
        )
        .await
        .unwrap();

        let turns = sink.load_history("conv-1", 10).await.unwrap();
        assert_eq!(turns.len(), 1);
        assert!(!turns[0].text.contains("abcdefghijklmnopqrstuvwxyz"));
    }

    #[tokio::test]
    async fn delivery_is_recorded_once() {
        let sink = SqlitePersistence::in_memory().unwrap();
        let key = DeliveryKey {
            mission_run_id: "run-1".into(),
            run_key: "daily".into(),
            node_id: "summary".into(),
            output_index: 0,
        };
        assert!(sink.record_delivery(&key, "conv-1", Some("m1")).await.unwrap());
        assert!(!sink.record_delivery(&key, "conv-1", Some("m2")).await.unwrap());
        assert_eq!(
            sink.delivered_message_id(&key).await.unwrap().as_deref(),
            Some("m1")
        );
    }
}
