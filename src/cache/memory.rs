//! In-Memory Key-Value Cache
//!
//! A process-local cache with real TTLs and key-expiration notifications,
//! backed by DashMap for concurrent access. Expired keys are dropped lazily on
//! read and by a background sweeper, and each drop publishes an expiration
//! event the same way Redis does with `notify-keyspace-events Ex`.

use crate::cache::expired_channel;
use crate::config::CacheConfig;
use crate::domain::{ExpirationEvent, ExpirationStream, KeyValueCache};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

const BACKEND_NAME: &str = "memory-cache";

// =============================================================================
// Memory Cache Configuration
// =============================================================================

/// Configuration for the in-memory cache
#[derive(Debug, Clone)]
pub struct MemoryCacheConfig {
    /// How often the sweeper looks for expired keys
    pub sweep_interval: Duration,
    /// Logical database number used to name the expiration channel
    pub db: i64,
    /// Capacity of the expiration notification channel
    pub notification_capacity: usize,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(1),
            db: 0,
            notification_capacity: 1024,
        }
    }
}

impl From<&CacheConfig> for MemoryCacheConfig {
    fn from(config: &CacheConfig) -> Self {
        Self {
            sweep_interval: config.sweep_interval(),
            db: config.db.unwrap_or(0),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: Bytes,
    expires_at: Instant,
}

impl StoredValue {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

// =============================================================================
// Memory Cache
// =============================================================================

/// In-process key-value cache with TTLs and expiration notifications
pub struct MemoryCache {
    /// Live entries
    entries: DashMap<String, StoredValue>,
    /// Held shared by single-key writes, exclusively by multi-key writes
    write_gate: RwLock<()>,
    /// Expiration notifications
    expired_tx: broadcast::Sender<ExpirationEvent>,
    /// Channel name stamped on every notification
    channel: String,
    /// Whether expirations are published
    notifications_enabled: AtomicBool,
    /// Is the cache reachable
    available: AtomicBool,
    /// Fail the multi-key write after staging this many pairs (0 = never)
    fail_multi_set_after: AtomicUsize,
}

impl MemoryCache {
    /// Create a new memory cache with default config
    ///
    /// Must be called within a Tokio runtime; the sweeper runs as a task.
    pub fn new() -> Arc<Self> {
        Self::with_config(MemoryCacheConfig::default())
    }

    /// Create a new memory cache with full config
    pub fn with_config(config: MemoryCacheConfig) -> Arc<Self> {
        let (expired_tx, _) = broadcast::channel(config.notification_capacity.max(1));
        let cache = Arc::new(Self {
            entries: DashMap::new(),
            write_gate: RwLock::new(()),
            expired_tx,
            channel: expired_channel(config.db),
            notifications_enabled: AtomicBool::new(false),
            available: AtomicBool::new(true),
            fail_multi_set_after: AtomicUsize::new(0),
        });

        tokio::spawn(Self::sweep_loop(Arc::downgrade(&cache), config.sweep_interval));
        cache
    }

    /// Periodically expire keys until the cache is dropped
    async fn sweep_loop(cache: Weak<Self>, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(cache) = cache.upgrade() else {
                break;
            };
            let expired = cache.sweep();
            if expired > 0 {
                debug!(expired, "Swept expired cache keys");
            }
        }
    }

    /// Drop every expired key, returning how many were dropped
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let candidates: Vec<String> = self
            .entries
            .iter()
            .filter(|r| r.value().is_expired(now))
            .map(|r| r.key().clone())
            .collect();

        candidates
            .into_iter()
            .filter(|key| self.expire(key, now))
            .count()
    }

    /// Remove `key` if it is expired at `now`, publishing a notification
    fn expire(&self, key: &str, now: Instant) -> bool {
        if self.entries.remove_if(key, |_, v| v.is_expired(now)).is_none() {
            return false;
        }
        if self.notifications_enabled.load(Ordering::Relaxed) {
            // No subscribers is fine, same as Redis.
            let _ = self
                .expired_tx
                .send(ExpirationEvent::new(self.channel.clone(), key));
        }
        true
    }

    /// Remaining time to live of `key`
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|r| !r.value().is_expired(now))
            .map(|r| r.value().expires_at - now)
    }

    /// Number of entries, including expired ones not yet swept
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Set availability (for testing)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    /// Make the next multi-key write fail after staging `pairs` pairs (for testing)
    pub fn fail_next_multi_set_after(&self, pairs: usize) {
        self.fail_multi_set_after.store(pairs, Ordering::Relaxed);
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(Error::BackendUnavailable {
                backend: BACKEND_NAME.to_string(),
            })
        }
    }

    fn stored(value: Bytes, ttl: Duration) -> StoredValue {
        StoredValue {
            value,
            expires_at: Instant::now() + ttl,
        }
    }
}

#[async_trait]
impl KeyValueCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.ensure_available()?;

        let _gate = self.write_gate.read();
        let now = Instant::now();
        let found = self.entries.get(key).map(|r| r.value().clone());
        match found {
            Some(stored) if stored.is_expired(now) => {
                self.expire(key, now);
                Ok(None)
            }
            Some(stored) => Ok(Some(stored.value)),
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        self.ensure_available()?;

        let _gate = self.write_gate.read();
        self.entries.insert(key.to_string(), Self::stored(value, ttl));
        Ok(())
    }

    async fn multi_set_ex(&self, keys: &[String], values: &[Bytes], ttl: Duration) -> Result<()> {
        if keys.len() != values.len() {
            return Err(Error::KeyValueMismatch {
                keys: keys.len(),
                values: values.len(),
            });
        }
        self.ensure_available()?;

        // Stage every pair first so a failure leaves the cache untouched.
        let fail_after = self.fail_multi_set_after.swap(0, Ordering::Relaxed);
        let mut staged = Vec::with_capacity(keys.len());
        for (key, value) in keys.iter().zip(values) {
            if fail_after > 0 && staged.len() == fail_after {
                return Err(Error::StorageOperationFailed {
                    backend: BACKEND_NAME.to_string(),
                    operation: "multi_set_ex".to_string(),
                    reason: format!("injected failure after {} pairs", fail_after),
                });
            }
            staged.push((key.clone(), Self::stored(value.clone(), ttl)));
        }

        let _gate = self.write_gate.write();
        for (key, stored) in staged {
            self.entries.insert(key, stored);
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        self.ensure_available()?;

        let _gate = self.write_gate.read();
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .map(|(_, stored)| !stored.is_expired(now))
            .unwrap_or(false))
    }

    async fn enable_expiry_notifications(&self) -> Result<()> {
        self.ensure_available()?;
        self.notifications_enabled.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn subscribe_expirations(&self) -> Result<ExpirationStream> {
        self.ensure_available()?;

        let rx = self.expired_tx.subscribe();
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Expiration subscriber lagged, notifications dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.available.load(Ordering::Relaxed))
    }

    fn backend_name(&self) -> &str {
        BACKEND_NAME
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn fast_sweeping() -> Arc<MemoryCache> {
        MemoryCache::with_config(MemoryCacheConfig {
            sweep_interval: Duration::from_millis(100),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_basic_operations() {
        let cache = MemoryCache::new();

        cache
            .set_ex("k1", Bytes::from("hello"), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.get("k1").await.unwrap(), Some(Bytes::from("hello")));
        assert_eq!(cache.len(), 1);

        assert!(cache.del("k1").await.unwrap());
        assert!(!cache.del("k1").await.unwrap());
        assert_eq!(cache.get("k1").await.unwrap(), None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lazy_expiry_on_read() {
        let cache = MemoryCache::new();
        cache
            .set_ex("k1", Bytes::from("v"), Duration::from_secs(5))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_millis(4_999)).await;
        assert!(cache.get("k1").await.unwrap().is_some());
        assert_eq!(cache.ttl("k1"), Some(Duration::from_millis(1)));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(cache.get("k1").await.unwrap(), None);
        assert_eq!(cache.ttl("k1"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_notifications() {
        let cache = fast_sweeping();
        cache.enable_expiry_notifications().await.unwrap();
        let mut events = cache.subscribe_expirations().await.unwrap();

        cache
            .set_ex("short", Bytes::from("v"), Duration::from_secs(1))
            .await
            .unwrap();
        cache
            .set_ex("long", Bytes::from("v"), Duration::from_secs(60))
            .await
            .unwrap();

        let event = events.next().await.unwrap();
        assert_eq!(event, ExpirationEvent::new("__keyevent@0__:expired", "short"));
        assert!(cache.get("long").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_notifications_until_enabled() {
        let cache = fast_sweeping();
        let mut events = cache.subscribe_expirations().await.unwrap();

        cache
            .set_ex("k", Bytes::from("v"), Duration::from_secs(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(cache.len(), 0);

        cache.enable_expiry_notifications().await.unwrap();
        cache
            .set_ex("k2", Bytes::from("v"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(events.next().await.unwrap().key, "k2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rewrite_resets_ttl() {
        let cache = MemoryCache::new();
        cache
            .set_ex("k", Bytes::from("1"), Duration::from_secs(10))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;
        cache
            .set_ex("k", Bytes::from("2"), Duration::from_secs(10))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;

        assert_eq!(cache.get("k").await.unwrap(), Some(Bytes::from("2")));
    }

    #[tokio::test]
    async fn test_multi_set_mismatch_rejected() {
        let cache = MemoryCache::new();
        let keys = vec!["a".to_string(), "b".to_string()];
        let values = vec![Bytes::from("1")];

        assert_matches!(
            cache.multi_set_ex(&keys, &values, Duration::from_secs(60)).await,
            Err(Error::KeyValueMismatch { keys: 2, values: 1 })
        );
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_multi_set_failure_is_all_or_nothing() {
        let cache = MemoryCache::new();
        let keys = vec!["a".to_string(), "b".to_string()];
        let ttl = Duration::from_secs(60);

        cache
            .multi_set_ex(&keys, &[Bytes::from("a0"), Bytes::from("b0")], ttl)
            .await
            .unwrap();

        cache.fail_next_multi_set_after(1);
        assert!(cache
            .multi_set_ex(&keys, &[Bytes::from("a1"), Bytes::from("b1")], ttl)
            .await
            .is_err());

        assert_eq!(cache.get("a").await.unwrap(), Some(Bytes::from("a0")));
        assert_eq!(cache.get("b").await.unwrap(), Some(Bytes::from("b0")));

        // Injection is one-shot
        cache
            .multi_set_ex(&keys, &[Bytes::from("a2"), Bytes::from("b2")], ttl)
            .await
            .unwrap();
        assert_eq!(cache.get("a").await.unwrap(), Some(Bytes::from("a2")));
        assert_eq!(cache.get("b").await.unwrap(), Some(Bytes::from("b2")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_multi_set_is_isolated_from_readers() {
        let cache = MemoryCache::new();
        let keys = vec!["value".to_string(), "meta".to_string()];
        let ttl = Duration::from_secs(60);
        cache
            .multi_set_ex(&keys, &[Bytes::from("0"), Bytes::from("0")], ttl)
            .await
            .unwrap();

        let writer = {
            let cache = cache.clone();
            let keys = keys.clone();
            tokio::spawn(async move {
                for i in 1..=2_000u32 {
                    let version = Bytes::from(i.to_string());
                    cache
                        .multi_set_ex(&keys, &[version.clone(), version], ttl)
                        .await
                        .unwrap();
                }
            })
        };

        let version = |raw: Option<Bytes>| -> u32 {
            std::str::from_utf8(&raw.unwrap()).unwrap().parse().unwrap()
        };
        while !writer.is_finished() {
            // Metadata is applied after the value, so it can never be ahead of it
            let meta = version(cache.get("meta").await.unwrap());
            let value = version(cache.get("value").await.unwrap());
            assert!(value >= meta, "value {} behind metadata {}", value, meta);
        }
        writer.await.unwrap();

        assert_eq!(cache.get("value").await.unwrap(), Some(Bytes::from("2000")));
        assert_eq!(cache.get("meta").await.unwrap(), Some(Bytes::from("2000")));
    }

    #[tokio::test]
    async fn test_unavailable() {
        let cache = MemoryCache::new();
        cache.set_available(false);

        assert!(!cache.health_check().await.unwrap());
        assert_matches!(
            cache.get("k").await,
            Err(Error::BackendUnavailable { .. })
        );
        assert_matches!(
            cache.set_ex("k", Bytes::new(), Duration::from_secs(1)).await,
            Err(Error::BackendUnavailable { .. })
        );
    }
}
