//! Write-Back Store
//!
//! A write-back caching layer that buffers frequently mutated, collaboratively
//! edited task state in a low-latency TTL key-value store and guarantees it is
//! eventually persisted to durable storage, even if no caller ever asks for a
//! flush.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              Write-Back Store                               │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │  Atomic Value + │  │  Reminder       │  │  Expiration Listener        │  │
//! │  │  Metadata Write │  │  Counter        │  │  + Flush Worker             │  │
//! │  └────────┬────────┘  └────────┬────────┘  └─────────────┬───────────────┘  │
//! │           │                    │                         │                  │
//! │           └────────────────────┼─────────────────────────┘                  │
//! │                                │                                            │
//! │                    ┌───────────┴───────────┐                                │
//! │                    │    Key Derivation     │                                │
//! │                    │       (paths)         │                                │
//! │                    └───────────────────────┘                                │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────┐  ┌─────────────────────────────────────┐   │
//! │  │   Key-Value Cache           │  │   Persistent Storage                │   │
//! │  │   (Redis / in-memory)       │  │   (filesystem / in-memory)          │   │
//! │  └─────────────────────────────┘  └─────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`writeback`]: The write-back engine and its expiration listener
//! - [`cache`]: Key-value cache adapters
//! - [`storage`]: Persistent storage adapters
//! - [`domain`]: Core types and port traits
//! - [`paths`]: Key and path derivation
//! - [`config`]: Configuration
//! - [`error`]: Error types and handling

pub mod cache;
pub mod config;
pub mod domain;
pub mod error;
pub mod paths;
pub mod storage;
pub mod writeback;

// Re-export commonly used types
pub use cache::{MemoryCache, MemoryCacheConfig, RedisCache};

pub use config::{CacheBackend, CacheConfig, Settings, StorageBackend, StorageConfig, WriteBackConfig};

pub use domain::{
    load_latest, ExpirationEvent, ExpirationStream, KeyValueCache, KeyValueCacheRef,
    PersistentStorage, PersistentStorageRef, StateMetadata, StorageRecord,
};

pub use error::{Error, Result};

pub use storage::{FileStorage, FileStorageConfig, MemoryStorage};

pub use writeback::{FlushTrigger, WriteBackEvent, WriteBackStatsSnapshot, WriteBackStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
