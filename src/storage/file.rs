//! Local Filesystem Storage
//!
//! Saves each artifact as `<root>/<file key>.json`. Writes land in a temporary
//! sibling first and are renamed into place, so a reader never sees a partial
//! artifact.

use crate::config::StorageConfig;
use crate::domain::PersistentStorage;
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

const BACKEND_NAME: &str = "file";

/// Extension of saved artifacts
pub const FILE_EXTENSION: &str = "json";

// =============================================================================
// File Storage Configuration
// =============================================================================

/// Configuration for file storage
#[derive(Debug, Clone)]
pub struct FileStorageConfig {
    /// Root directory for saved artifacts
    pub root_path: PathBuf,
    /// Whether to fsync each artifact before renaming it into place
    pub sync_writes: bool,
}

impl Default for FileStorageConfig {
    fn default() -> Self {
        Self {
            root_path: PathBuf::from("./data"),
            sync_writes: true,
        }
    }
}

impl From<&StorageConfig> for FileStorageConfig {
    fn from(config: &StorageConfig) -> Self {
        Self {
            root_path: config.root.clone(),
            ..Default::default()
        }
    }
}

// =============================================================================
// File Storage
// =============================================================================

/// Persistent storage on the local filesystem
pub struct FileStorage {
    /// Root directory for saved artifacts
    root_path: PathBuf,
    /// Whether to sync writes
    sync_writes: bool,
}

impl FileStorage {
    /// Create file storage rooted at `root_path`
    pub async fn with_path(root_path: impl Into<PathBuf>) -> Result<Self> {
        Self::with_config(FileStorageConfig {
            root_path: root_path.into(),
            ..Default::default()
        })
        .await
    }

    /// Create file storage with full config
    pub async fn with_config(config: FileStorageConfig) -> Result<Self> {
        // Create root directory if it doesn't exist
        fs::create_dir_all(&config.root_path).await?;

        Ok(Self {
            root_path: config.root_path,
            sync_writes: config.sync_writes,
        })
    }

    /// Root directory
    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    /// Path an artifact key is stored at
    fn file_path(&self, file_key: &str) -> Result<PathBuf> {
        let relative = Path::new(file_key);
        let is_safe = !file_key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !is_safe {
            return Err(Error::InvalidArgument(format!(
                "Storage key must be a relative path without '..': {:?}",
                file_key
            )));
        }
        Ok(self
            .root_path
            .join(format!("{}.{}", file_key, FILE_EXTENSION)))
    }

    async fn write_then_rename(
        &self,
        tmp_path: &Path,
        path: &Path,
        content: &[u8],
    ) -> std::io::Result<()> {
        let mut file = fs::File::create(tmp_path).await?;
        file.write_all(content).await?;
        if self.sync_writes {
            file.sync_all().await?;
        }
        drop(file);
        fs::rename(tmp_path, path).await
    }

    /// Artifact key of a file under the root, if it is an artifact
    fn file_key(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root_path).ok()?;
        let key = relative.to_str()?.strip_suffix(&format!(".{}", FILE_EXTENSION))?;
        Some(key.replace(std::path::MAIN_SEPARATOR, "/"))
    }
}

#[async_trait]
impl PersistentStorage for FileStorage {
    async fn save(&self, file_key: &str, content: Bytes) -> Result<()> {
        let path = self.file_path(file_key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp_path = path.with_extension(format!("{}.tmp", FILE_EXTENSION));
        if let Err(e) = self.write_then_rename(&tmp_path, &path, &content).await {
            if let Err(cleanup) = fs::remove_file(&tmp_path).await {
                if cleanup.kind() != ErrorKind::NotFound {
                    warn!(path = %tmp_path.display(), error = %cleanup, "Failed to remove temporary file");
                }
            }
            return Err(e.into());
        }

        debug!(file_key, bytes = content.len(), "Saved artifact");
        Ok(())
    }

    async fn load(&self, file_key: &str) -> Result<Option<Bytes>> {
        let path = self.file_path(file_key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        // Only the directory part of the prefix can be walked
        let dir_part = match prefix.rfind('/') {
            Some(idx) => &prefix[..idx],
            None => "",
        };
        let start = self.root_path.join(dir_part);

        let mut keys = Vec::new();
        let mut pending = vec![start];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if let Some(key) = self.file_key(&path) {
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, file_key: &str) -> Result<bool> {
        let path = self.file_path(file_key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn health_check(&self) -> Result<bool> {
        // Check that root directory exists and is writable
        let test_path = self.root_path.join(".health_check");
        match fs::write(&test_path, b"ok").await {
            Ok(_) => {
                let _ = fs::remove_file(&test_path).await;
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    fn backend_name(&self) -> &str {
        BACKEND_NAME
    }
}
