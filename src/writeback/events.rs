//! Write-Back Events
//!
//! Events emitted by the write-back store for monitoring and observability.
//! Expiry-driven flushes have no caller, so this channel is where their
//! outcome is reported.

use serde::{Deserialize, Serialize};

/// What caused a flush
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushTrigger {
    /// Pending actions reached the configured threshold
    Threshold,
    /// The reminder expired after a quiet period
    Expiry,
    /// Requested explicitly
    Manual,
}

impl std::fmt::Display for FlushTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlushTrigger::Threshold => write!(f, "threshold"),
            FlushTrigger::Expiry => write!(f, "expiry"),
            FlushTrigger::Manual => write!(f, "manual"),
        }
    }
}

/// Events emitted by the write-back store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteBackEvent {
    /// Actions were recorded below the threshold and the reminder re-armed
    ReminderArmed {
        key: String,
        pending_actions: u64,
    },

    /// Cached state was saved to persistent storage
    Flushed {
        key: String,
        file_key: String,
        trigger: FlushTrigger,
        size_bytes: u64,
    },

    /// Saving cached state failed
    FlushFailed {
        key: String,
        trigger: FlushTrigger,
        project_name: Option<String>,
        task_id: Option<String>,
        error: String,
    },

    /// A reminder expired but the state it guards was already gone
    ConsistencyViolation {
        key: String,
        missing: String,
    },
}

impl WriteBackEvent {
    /// Get the cache key associated with this event
    pub fn key(&self) -> &str {
        match self {
            WriteBackEvent::ReminderArmed { key, .. } => key,
            WriteBackEvent::Flushed { key, .. } => key,
            WriteBackEvent::FlushFailed { key, .. } => key,
            WriteBackEvent::ConsistencyViolation { key, .. } => key,
        }
    }

    /// Get the flush trigger (if this event is about a flush)
    pub fn trigger(&self) -> Option<FlushTrigger> {
        match self {
            WriteBackEvent::Flushed { trigger, .. } => Some(*trigger),
            WriteBackEvent::FlushFailed { trigger, .. } => Some(*trigger),
            _ => None,
        }
    }

    /// Check if this is an error event
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            WriteBackEvent::FlushFailed { .. } | WriteBackEvent::ConsistencyViolation { .. }
        )
    }
}
