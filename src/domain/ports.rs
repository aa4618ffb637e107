//! Domain Ports - Core trait definitions for the write-back store
//!
//! These traits define the boundaries between the write-back engine and the
//! external systems it buffers for. Adapters implement these traits to provide
//! concrete functionality.

use crate::domain::types::{ExpirationStream, StorageRecord};
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Key-Value Cache Port
// =============================================================================

/// Port for the low-latency, TTL-capable key-value store
#[async_trait]
pub trait KeyValueCache: Send + Sync {
    /// Get the value stored under `key`, if it has not expired
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Set `key` to `value`, expiring after `ttl`
    async fn set_ex(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()>;

    /// Set every key to its paired value with the same `ttl`, all or nothing
    ///
    /// Mismatched key and value counts are rejected before anything is written.
    async fn multi_set_ex(&self, keys: &[String], values: &[Bytes], ttl: Duration) -> Result<()>;

    /// Delete `key`
    ///
    /// Returns true if the key existed.
    async fn del(&self, key: &str) -> Result<bool>;

    /// Configure the store to publish notifications when keys expire
    async fn enable_expiry_notifications(&self) -> Result<()>;

    /// Subscribe to key-expiration notifications
    async fn subscribe_expirations(&self) -> Result<ExpirationStream>;

    /// Check if the cache is reachable
    async fn health_check(&self) -> Result<bool>;

    /// Get backend name
    fn backend_name(&self) -> &str;
}

// =============================================================================
// Persistent Storage Port
// =============================================================================

/// Port for durable storage of flushed task state
#[async_trait]
pub trait PersistentStorage: Send + Sync {
    /// Save `content` under `file_key`
    async fn save(&self, file_key: &str, content: Bytes) -> Result<()>;

    /// Load the content saved under `file_key`
    async fn load(&self, file_key: &str) -> Result<Option<Bytes>>;

    /// List saved keys starting with `prefix`, in ascending order
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Delete the content saved under `file_key`
    ///
    /// Returns true if something was deleted.
    async fn delete(&self, file_key: &str) -> Result<bool>;

    /// Check if the backend is healthy
    async fn health_check(&self) -> Result<bool>;

    /// Get backend name
    fn backend_name(&self) -> &str;
}

/// Load the most recent artifact saved under `save_dir`
///
/// Every flush writes a new time-qualified key, so readers reconcile a task by
/// taking the greatest key under its save directory.
pub async fn load_latest(
    storage: &dyn PersistentStorage,
    save_dir: &str,
) -> Result<Option<StorageRecord>> {
    let prefix = format!("{}/", save_dir.trim_end_matches('/'));
    let keys = storage.list_keys(&prefix).await?;
    let Some(file_key) = keys.into_iter().max() else {
        return Ok(None);
    };
    Ok(storage
        .load(&file_key)
        .await?
        .map(|content| StorageRecord { file_key, content }))
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type KeyValueCacheRef = Arc<dyn KeyValueCache>;
pub type PersistentStorageRef = Arc<dyn PersistentStorage>;
