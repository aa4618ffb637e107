//! Persistent Storage Adapters
//!
//! Implementations of the [`PersistentStorage`](crate::domain::PersistentStorage)
//! port that flushed task state is saved to.

mod file;
mod memory;

pub use file::{FileStorage, FileStorageConfig, FILE_EXTENSION};
pub use memory::MemoryStorage;

use crate::config::{StorageBackend, StorageConfig};
use crate::domain::PersistentStorageRef;
use crate::error::Result;
use std::sync::Arc;

/// Build the storage backend selected by `config`
pub async fn open(config: &StorageConfig) -> Result<PersistentStorageRef> {
    let storage: PersistentStorageRef = match config.backend {
        StorageBackend::File => Arc::new(FileStorage::with_config(config.into()).await?),
        StorageBackend::Memory => Arc::new(MemoryStorage::new()),
    };
    Ok(storage)
}
