//! In-Memory Persistent Storage
//!
//! Keeps saved artifacts in a sorted map. Used for tests and for running the
//! store without a durable backend; an availability switch simulates outages.

use crate::domain::PersistentStorage;
use crate::domain::StorageRecord;
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

const BACKEND_NAME: &str = "memory-storage";

/// In-memory persistent storage
pub struct MemoryStorage {
    /// Saved artifacts keyed by file key
    store: RwLock<BTreeMap<String, Bytes>>,
    /// Number of successful saves
    save_count: AtomicU64,
    /// Is backend available
    available: AtomicBool,
}

impl MemoryStorage {
    /// Create empty storage
    pub fn new() -> Self {
        Self {
            store: RwLock::new(BTreeMap::new()),
            save_count: AtomicU64::new(0),
            available: AtomicBool::new(true),
        }
    }

    /// Every saved record, ordered by file key
    pub fn records(&self) -> Vec<StorageRecord> {
        self.store
            .read()
            .iter()
            .map(|(file_key, content)| StorageRecord {
                file_key: file_key.clone(),
                content: content.clone(),
            })
            .collect()
    }

    /// Number of successful saves so far
    pub fn save_count(&self) -> u64 {
        self.save_count.load(Ordering::Relaxed)
    }

    /// Set availability (for testing)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    /// Check if available
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    fn ensure_available(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(Error::BackendUnavailable {
                backend: BACKEND_NAME.to_string(),
            })
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PersistentStorage for MemoryStorage {
    async fn save(&self, file_key: &str, content: Bytes) -> Result<()> {
        self.ensure_available()?;
        self.store.write().insert(file_key.to_string(), content);
        self.save_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn load(&self, file_key: &str) -> Result<Option<Bytes>> {
        self.ensure_available()?;
        Ok(self.store.read().get(file_key).cloned())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.ensure_available()?;
        let store = self.store.read();
        Ok(store
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn delete(&self, file_key: &str) -> Result<bool> {
        self.ensure_available()?;
        Ok(self.store.write().remove(file_key).is_some())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.is_available())
    }

    fn backend_name(&self) -> &str {
        BACKEND_NAME
    }
}

// =============================================================================
// Tests
// =============================================================================
