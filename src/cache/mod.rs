//! Key-Value Cache Adapters
//!
//! Implementations of the [`KeyValueCache`](crate::domain::KeyValueCache) port:
//! - **Redis**: the production store, using keyspace notifications for expiry
//! - **Memory**: an in-process store with the same TTL and notification behavior

mod memory;
mod redis;

pub use self::memory::{MemoryCache, MemoryCacheConfig};
pub use self::redis::RedisCache;

use crate::config::{CacheBackend, CacheConfig};
use crate::domain::KeyValueCacheRef;
use crate::error::Result;
use std::sync::Arc;

/// Channel key-expiration events of logical database `db` are published on
pub fn expired_channel(db: i64) -> String {
    format!("__keyevent@{db}__:expired")
}

/// Build the cache selected by `config`
pub async fn connect(config: &CacheConfig) -> Result<KeyValueCacheRef> {
    let cache: KeyValueCacheRef = match config.backend {
        CacheBackend::Redis => Arc::new(RedisCache::connect(config).await?),
        CacheBackend::Memory => MemoryCache::with_config(config.into()),
    };
    Ok(cache)
}
