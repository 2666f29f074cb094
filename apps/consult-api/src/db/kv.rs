use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::ApiError;

/// Abstraction over a key-value store used for short-lived gateway tickets.
///
/// Backed by an in-memory map; a shared store is needed once the gateway runs
/// on more than one process.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), ApiError>;

    /// Atomically read and delete a key.
    async fn take(&self, key: &str) -> Result<Option<String>, ApiError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

struct Entry {
    value: String,
    expires_at: Instant,
}

pub struct MemoryStore {
    data: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), ApiError> {
        let mut data = self.data.lock();
        let now = Instant::now();
        // Opportunistic sweep so abandoned tickets don't pile up.
        data.retain(|_, e| e.expires_at > now);
        data.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + Duration::from_secs(ttl_secs),
            },
        );
        Ok(())
    }

    async fn take(&self, key: &str) -> Result<Option<String>, ApiError> {
        let entry = self.data.lock().remove(key);
        Ok(entry
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_ex_overwrites() {
        let kv = MemoryStore::new();
        kv.set_ex("k", "v1", 30).await.unwrap();
        kv.set_ex("k", "v2", 30).await.unwrap();
        assert_eq!(kv.take("k").await.unwrap().as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn take_is_single_use() {
        let kv = MemoryStore::new();
        kv.set_ex("k", "v", 30).await.unwrap();
        assert_eq!(kv.take("k").await.unwrap().as_deref(), Some("v"));
        assert!(kv.take("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_entries_are_invisible() {
        let kv = MemoryStore::new();
        kv.set_ex("k", "v", 0).await.unwrap();
        assert!(kv.take("k").await.unwrap().is_none());
    }
}
