//! Write-Back Store
//!
//! Buffers live task state in the key-value cache and decides when to copy it
//! to persistent storage. Two independent triggers feed that decision:
//!
//! - **Threshold**: every write adds its action count to a reminder counter;
//!   once the counter reaches `num_actions_for_write` the value is flushed
//!   immediately and the reminder deleted.
//! - **Expiry**: below the threshold the reminder is re-armed with the short
//!   `time_for_write` TTL. If no write arrives before it expires, the cache's
//!   expiration notification drives an out-of-band flush.
//!
//! The value TTL (`timeout`) must outlive the reminder TTL so the state is
//! still cached when its reminder fires; construction refuses configs that
//! break this.

use crate::config::WriteBackConfig;
use crate::domain::{KeyValueCacheRef, PersistentStorageRef, StateMetadata};
use crate::error::{Error, Result};
use crate::paths;
use crate::writeback::events::{FlushTrigger, WriteBackEvent};
use crate::writeback::listener;
use crate::writeback::metrics::{WriteBackMetrics, WriteBackStatsSnapshot};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Capacity of the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Write-back caching layer between a TTL cache and persistent storage
pub struct WriteBackStore {
    /// Fast store holding live state
    cache: KeyValueCacheRef,
    /// Durable store flushes are saved to
    storage: PersistentStorageRef,
    /// Timing and threshold settings
    config: WriteBackConfig,
    /// Counters
    metrics: Arc<WriteBackMetrics>,
    /// Event broadcaster
    event_tx: broadcast::Sender<WriteBackEvent>,
    /// Stops the expiration listener and flush worker
    shutdown: CancellationToken,
    /// Background tasks
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WriteBackStore {
    /// Create the store and start listening for reminder expirations
    ///
    /// Validates `config`, enables expiration notifications on the cache and
    /// subscribes once for the lifetime of the store.
    pub async fn start(
        config: WriteBackConfig,
        cache: KeyValueCacheRef,
        storage: PersistentStorageRef,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        cache.enable_expiry_notifications().await?;
        let expirations = cache.subscribe_expirations().await?;

        let store = Self::new(config, cache.clone(), storage);
        let handles = listener::spawn(
            Arc::downgrade(&store),
            cache,
            expirations,
            store.metrics.clone(),
            store.shutdown.clone(),
        );
        store.tasks.lock().extend(handles);

        info!(
            cache = store.cache.backend_name(),
            storage = store.storage.backend_name(),
            timeout_secs = store.config.timeout_secs,
            time_for_write_secs = store.config.time_for_write_secs,
            num_actions_for_write = store.config.num_actions_for_write,
            "Write-back store started"
        );
        Ok(store)
    }

    /// Create the store without an expiration listener
    ///
    /// For one-shot writers and flushes running next to a long-lived store
    /// that owns the expiry path. Reminders armed here are flushed by that
    /// store when they expire.
    pub fn open(
        config: WriteBackConfig,
        cache: KeyValueCacheRef,
        storage: PersistentStorageRef,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        debug!(
            cache = cache.backend_name(),
            storage = storage.backend_name(),
            "Write-back store opened without expiration listener"
        );
        Ok(Self::new(config, cache, storage))
    }

    fn new(
        config: WriteBackConfig,
        cache: KeyValueCacheRef,
        storage: PersistentStorageRef,
    ) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            cache,
            storage,
            config,
            metrics: Arc::new(WriteBackMetrics::new()),
            event_tx,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Stop the expiration listener and wait for background tasks to exit
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Write-back task ended abnormally");
            }
        }
        info!("Write-back store stopped");
    }

    /// Store `value` and its metadata, then account for `actions_applied`
    ///
    /// Value and metadata are written in one atomic call with the primary
    /// TTL. May flush to persistent storage before returning.
    pub async fn set_ex_with_reminder(
        &self,
        key: &str,
        value: Bytes,
        metadata: &StateMetadata,
        actions_applied: u64,
    ) -> Result<()> {
        if actions_applied == 0 {
            return Err(Error::InvalidArgument(
                "actions_applied must be at least 1".to_string(),
            ));
        }

        let metadata_json = Bytes::from(serde_json::to_vec(metadata)?);
        let keys = [key.to_string(), paths::metadata_key_of(key)];
        self.cache
            .multi_set_ex(&keys, &[value.clone(), metadata_json], self.config.timeout())
            .await?;
        self.metrics.record_write(actions_applied);

        self.set_write_reminder(key, value, metadata, actions_applied)
            .await
    }

    /// Get a cached value
    pub async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.cache.get(key).await
    }

    /// Delete a cached key
    pub async fn del(&self, key: &str) -> Result<bool> {
        self.cache.del(key).await
    }

    /// Save `value` under a fresh time-qualified key in `save_dir`
    ///
    /// Returns the file key written. Each call produces a new artifact.
    pub async fn write_back_task(&self, save_dir: &str, value: Bytes) -> Result<String> {
        let file_key = paths::file_key_of(save_dir);
        self.storage.save(&file_key, value).await?;
        Ok(file_key)
    }

    /// Flush the cached state of `key` now and clear its reminder
    pub async fn flush_now(&self, key: &str) -> Result<String> {
        let file_key = self.flush_from_cache(key, FlushTrigger::Manual).await?;
        self.cache.del(&paths::reminder_key_of(key)).await?;
        Ok(file_key)
    }

    /// Actions recorded for `key` since its last flush
    pub async fn pending_actions(&self, key: &str) -> Result<u64> {
        let reminder_key = paths::reminder_key_of(key);
        match self.cache.get(&reminder_key).await? {
            Some(raw) => parse_counter(&reminder_key, &raw),
            None => Ok(0),
        }
    }

    /// Subscribe to write-back events
    pub fn subscribe(&self) -> broadcast::Receiver<WriteBackEvent> {
        self.event_tx.subscribe()
    }

    /// Get current counters
    pub fn metrics(&self) -> WriteBackStatsSnapshot {
        self.metrics.snapshot()
    }

    /// Get configuration
    pub fn config(&self) -> &WriteBackConfig {
        &self.config
    }

    /// Check that both the cache and the storage backend are healthy
    pub async fn health_check(&self) -> Result<bool> {
        Ok(self.cache.health_check().await? && self.storage.health_check().await?)
    }

    /// Add `actions_applied` to the reminder of `key`, flushing at the threshold
    async fn set_write_reminder(
        &self,
        key: &str,
        value: Bytes,
        metadata: &StateMetadata,
        actions_applied: u64,
    ) -> Result<()> {
        let pending = self
            .pending_actions(key)
            .await?
            .saturating_add(actions_applied);
        let reminder_key = paths::reminder_key_of(key);

        if pending >= self.config.num_actions_for_write {
            let size_bytes = value.len() as u64;
            let file_key = match self.write_back_task(&metadata.save_dir(), value).await {
                Ok(file_key) => file_key,
                Err(e) => {
                    let error = self.flush_failed(key, Some(metadata), FlushTrigger::Threshold, e);
                    // Leave a reminder behind so the expiry path retries the flush
                    if let Err(rearm) = self
                        .set_ex(
                            &reminder_key,
                            Bytes::from(pending.to_string()),
                            self.config.time_for_write(),
                        )
                        .await
                    {
                        error!(key, error = %rearm, "Could not re-arm reminder after failed flush");
                    }
                    return Err(error);
                }
            };
            self.cache.del(&reminder_key).await?;
            self.flushed(key, file_key, FlushTrigger::Threshold, size_bytes);
        } else {
            self.set_ex(
                &reminder_key,
                Bytes::from(pending.to_string()),
                self.config.time_for_write(),
            )
            .await?;
            debug!(key, pending_actions = pending, "Reminder re-armed");
            self.emit_event(WriteBackEvent::ReminderArmed {
                key: key.to_string(),
                pending_actions: pending,
            });
        }
        Ok(())
    }

    /// Flush whatever is cached for `key`, locating its save dir via metadata
    ///
    /// Both the metadata and the value must still be cached; their absence
    /// means state was lost without being persisted.
    pub(crate) async fn flush_from_cache(&self, key: &str, trigger: FlushTrigger) -> Result<String> {
        let metadata = match self.cached_metadata(key).await {
            Ok(metadata) => metadata,
            Err(e) => return Err(self.flush_failed(key, None, trigger, e)),
        };

        let value = match self.cache.get(key).await {
            Ok(Some(value)) => value,
            Ok(None) => {
                let e = Error::missing(key, "value");
                return Err(self.flush_failed(key, Some(&metadata), trigger, e));
            }
            Err(e) => return Err(self.flush_failed(key, Some(&metadata), trigger, e)),
        };

        let size_bytes = value.len() as u64;
        match self.write_back_task(&metadata.save_dir(), value).await {
            Ok(file_key) => {
                self.flushed(key, file_key.clone(), trigger, size_bytes);
                Ok(file_key)
            }
            Err(e) => Err(self.flush_failed(key, Some(&metadata), trigger, e)),
        }
    }

    async fn cached_metadata(&self, key: &str) -> Result<StateMetadata> {
        let raw = self
            .cache
            .get(&paths::metadata_key_of(key))
            .await?
            .ok_or_else(|| Error::missing(key, "metadata"))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Set with expiry, only for reminder counters
    async fn set_ex(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        self.cache.set_ex(key, value, ttl).await
    }

    fn flushed(&self, key: &str, file_key: String, trigger: FlushTrigger, size_bytes: u64) {
        self.metrics.record_flush(trigger, size_bytes);
        info!(key, file_key = %file_key, %trigger, size_bytes, "Flushed cached state");
        self.emit_event(WriteBackEvent::Flushed {
            key: key.to_string(),
            file_key,
            trigger,
            size_bytes,
        });
    }

    /// Report a failed flush and hand the error back
    fn flush_failed(
        &self,
        key: &str,
        metadata: Option<&StateMetadata>,
        trigger: FlushTrigger,
        error: Error,
    ) -> Error {
        let project_name = metadata.map(|m| m.project_name.clone());
        let task_id = metadata.map(|m| m.task_id.clone());

        if let Error::ConsistencyViolation { missing, .. } = &error {
            self.metrics.record_consistency_violation();
            error!(
                key,
                missing = %missing,
                project = project_name.as_deref().unwrap_or("unknown"),
                task = task_id.as_deref().unwrap_or("unknown"),
                %trigger,
                "Cached state lost before it was persisted"
            );
            self.emit_event(WriteBackEvent::ConsistencyViolation {
                key: key.to_string(),
                missing: missing.clone(),
            });
        } else {
            self.metrics.record_flush_failure();
            error!(
                key,
                project = project_name.as_deref().unwrap_or("unknown"),
                task = task_id.as_deref().unwrap_or("unknown"),
                %trigger,
                error = %error,
                "Flush to persistent storage failed"
            );
            self.emit_event(WriteBackEvent::FlushFailed {
                key: key.to_string(),
                trigger,
                project_name,
                task_id,
                error: error.to_string(),
            });
        }
        error
    }

    fn emit_event(&self, event: WriteBackEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl std::fmt::Debug for WriteBackStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteBackStore")
            .field("cache", &self.cache.backend_name())
            .field("storage", &self.storage.backend_name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Drop for WriteBackStore {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn parse_counter(reminder_key: &str, raw: &[u8]) -> Result<u64> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| Error::CorruptReminder {
            key: reminder_key.to_string(),
            value: String::from_utf8_lossy(raw).to_string(),
        })
}

// =============================================================================
// Tests
// =============================================================================
