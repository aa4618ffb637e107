//! Domain Types
//!
//! Records exchanged between the write-back engine and its adapters.

use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// State Metadata
// =============================================================================

/// Metadata envelope cached alongside every task value
///
/// Carries enough identity to locate the task's save directory when only the
/// cache key is known, as happens when a reminder expires.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateMetadata {
    /// Project the task belongs to
    pub project_name: String,
    /// Task identifier within the project
    pub task_id: String,
    /// Processed action ids mapped to the timestamps they were applied at
    #[serde(default)]
    pub action_ids: BTreeMap<String, Vec<i64>>,
}

impl StateMetadata {
    /// Create metadata for a task with no recorded actions
    pub fn new(project_name: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            project_name: project_name.into(),
            task_id: task_id.into(),
            action_ids: BTreeMap::new(),
        }
    }

    /// Record that `action_id` was applied at `timestamp_ms`
    pub fn record_action(&mut self, action_id: impl Into<String>, timestamp_ms: i64) {
        self.action_ids
            .entry(action_id.into())
            .or_default()
            .push(timestamp_ms);
    }

    /// Save directory of the task this metadata describes
    pub fn save_dir(&self) -> String {
        crate::paths::save_dir_of(&self.project_name, &self.task_id)
    }
}

// =============================================================================
// Expiration Events
// =============================================================================

/// A key-expiration notification delivered by the cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpirationEvent {
    /// Notification channel the event arrived on
    pub channel: String,
    /// Name of the key that expired
    pub key: String,
}

impl ExpirationEvent {
    pub fn new(channel: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            key: key.into(),
        }
    }
}

/// Stream of expiration events, open for as long as the subscription lives
pub type ExpirationStream = BoxStream<'static, ExpirationEvent>;

// =============================================================================
// Storage Records
// =============================================================================

/// A durable artifact produced by one flush
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageRecord {
    /// Time-qualified key the content was saved under
    pub file_key: String,
    /// Saved content
    pub content: Bytes,
}
