//! Pluggable key→value storage with TTL semantics. Storage is the source of
//! truth for sessions and in-flight authorization state; the replay-recovery
//! path in refresh relies on it as the coordination point across processes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

/// Errors emitted by storage backends.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum StorageError {
    /// Serialization error (e.g., JSON)
    #[error("serialization error: {0}")]
    #[diagnostic(code(heddle_oauth::storage::serde))]
    Serde(#[from] serde_json::Error),
    /// Any other error from a backend implementation
    #[error(transparent)]
    #[diagnostic(code(heddle_oauth::storage::other))]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Storage capability for the OAuth engine.
///
/// Keys are flat strings (`pkce:<state>`, `session:<sessionId>`). An entry
/// written with a TTL must behave as absent once the TTL elapses.
#[async_trait]
pub trait OAuthStorage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError>;
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>)
    -> Result<(), StorageError>;
    async fn del(&self, key: &str) -> Result<(), StorageError>;
}

#[derive(Clone)]
struct StoredEntry {
    value: Value,
    expires_at: Option<Instant>,
}

impl StoredEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-memory store suitable for tests and single-process deployments.
#[derive(Clone, Default)]
pub struct MemoryAuthStore(Arc<RwLock<HashMap<String, StoredEntry>>>);

impl MemoryAuthStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OAuthStorage for MemoryAuthStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let expired = match self.0.read().await.get(key) {
            None => return Ok(None),
            Some(entry) if entry.is_expired() => true,
            Some(entry) => return Ok(Some(entry.value.clone())),
        };
        if expired {
            self.0.write().await.remove(key);
        }
        Ok(None)
    }

    async fn set(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError> {
        let entry = StoredEntry {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.0.write().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StorageError> {
        self.0.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn set_get_del_round_trip() {
        let store = MemoryAuthStore::new();
        store.set("k", json!({"a": 1}), None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(json!({"a": 1})));
        store.del("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_entries_read_as_absent() {
        let store = MemoryAuthStore::new();
        store
            .set("k", json!("v"), Some(Duration::from_millis(0)))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn unexpired_ttl_entries_are_readable() {
        let store = MemoryAuthStore::new();
        store
            .set("k", json!("v"), Some(Duration::from_secs(600)))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(json!("v")));
    }
}
