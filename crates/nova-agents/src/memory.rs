use std::path::Path;

use async_trait::async_trait;
use nova_common::Result;
use nova_db::{MemoryRole, MemoryStore, NewMemoryEntry};
use nova_security::redact_secrets;
use tokio::sync::Mutex;

/// Long-term memory scoped by user context.
#[async_trait]
pub trait MemoryRecall: Send + Sync {
    /// Snippets relevant to `query`, newest first.
    async fn recall(&self, user_context_id: &str, query: &str, limit: usize) -> Result<Vec<String>>;

    async fn remember(
        &self,
        user_context_id: &str,
        conversation_id: &str,
        role: MemoryRole,
        content: &str,
    ) -> Result<()>;

    /// Standing `(key, value)` preferences for the user.
    async fn preferences(&self, _user_context_id: &str) -> Result<Vec<(String, String)>> {
        Ok(Vec::new())
    }

    async fn set_preference(&self, _user_context_id: &str, _key: &str, _value: &str) -> Result<()> {
        Ok(())
    }
}

pub struct SqliteMemory {
    store: Mutex<MemoryStore>,
}

impl SqliteMemory {
    pub fn new(store: MemoryStore) -> Self {
        Self {
            store: Mutex::new(store),
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(MemoryStore::open(path)?))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(MemoryStore::in_memory()?))
    }
}

#[async_trait]
impl MemoryRecall for SqliteMemory {
    async fn recall(&self, user_context_id: &str, query: &str, limit: usize) -> Result<Vec<String>> {
        let entries = self.store.lock().await.recall(user_context_id, query, limit)?;
        Ok(entries
            .into_iter()
            .map(|e| format!("[{}] {}", e.role.as_str(), e.content))
            .collect())
    }

    async fn remember(
        &self,
        user_context_id: &str,
        conversation_id: &str,
        role: MemoryRole,
        content: &str,
    ) -> Result<()> {
        self.store.lock().await.remember(NewMemoryEntry {
            user_context_id: user_context_id.to_string(),
            conversation_id: Some(conversation_id.to_string()),
            role,
            content: redact_secrets(content),
        })?;
        Ok(())
    }

    async fn preferences(&self, user_context_id: &str) -> Result<Vec<(String, String)>> {
        self.store.lock().await.preferences(user_context_id)
    }

    async fn set_preference(&self, user_context_id: &str, key: &str, value: &str) -> Result<()> {
        self.store
            .lock()
            .await
            .set_preference(user_context_id, key, &redact_secrets(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recall_is_scoped_to_user() {
        let memory = SqliteMemory::in_memory().unwrap();
        memory
            .remember("alice", "c1", MemoryRole::User, "my cat is called Miso")
            .await
            .unwrap();
        memory
            .remember("bob", "c2", MemoryRole::User, "my cat is called Pixel")
            .await
            .unwrap();

        let hits = memory.recall("alice", "what is my cat called", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].contains("Miso"));
    }

    #[tokio::test]
    async fn preferences_round_trip_through_the_trait() {
        let memory = SqliteMemory::in_memory().unwrap();
        memory.set_preference("alice", "units", "metric").await.unwrap();
        assert_eq!(
            memory.preferences("alice").await.unwrap(),
            vec![("units".to_string(), "metric".to_string())]
        );
        assert!(memory.preferences("bob").await.unwrap().is_empty());
    }
}
