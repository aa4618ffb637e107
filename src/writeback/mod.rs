//! Write-Back Engine
//!
//! Sits between the key-value cache and persistent storage, buffering
//! frequent mutations of task state and guaranteeing they are eventually
//! flushed.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Write-Back Store                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  set_ex_with_reminder ──► atomic [value, metadata] ──► reminder counter │
//! │                                                            │            │
//! │                     count >= threshold ◄───────────────────┤            │
//! │                            │                               │            │
//! │                     flush + delete reminder     re-arm reminder (TTL)   │
//! │                                                            │            │
//! │  expiration stream ──► listener ──► queue ──► flush worker ◄┘ (expired) │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │        KeyValueCache (Redis / memory)   │   PersistentStorage           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use writeback_store::{MemoryCache, MemoryStorage, StateMetadata, WriteBackConfig, WriteBackStore};
//! use bytes::Bytes;
//! use std::sync::Arc;
//!
//! let store = WriteBackStore::start(
//!     WriteBackConfig::default(),
//!     MemoryCache::new(),
//!     Arc::new(MemoryStorage::new()),
//! ).await?;
//!
//! let metadata = StateMetadata::new("my-project", "000000");
//! let key = metadata.save_dir();
//! store.set_ex_with_reminder(&key, Bytes::from("{}"), &metadata, 1).await?;
//! ```

pub mod events;
mod listener;
pub mod metrics;
pub mod store;

pub use events::{FlushTrigger, WriteBackEvent};
pub use metrics::{WriteBackMetrics, WriteBackStatsSnapshot};
pub use store::WriteBackStore;
