//! Key and Path Derivation
//!
//! Pure mappings from a task identity to the keys the write-back store uses:
//! the cached value key, its metadata and reminder companions, and the
//! time-qualified file key every flush is saved under.

use crate::error::{Error, Result};
use chrono::{TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

/// Separator between a base key and its companion suffix
pub const KEY_SEPARATOR: char = '^';

/// Suffix of metadata keys
pub const META_SUFFIX: &str = "meta";

/// Suffix of reminder keys
pub const REMINDER_SUFFIX: &str = "reminder";

/// Top-level directory holding all projects in persistent storage
pub const PROJECT_DIR: &str = "projects";

/// Directory under a project holding saved task snapshots
pub const SAVED_DIR: &str = "saved";

/// Last microsecond timestamp handed out by [`file_key_of`]
static LAST_FILE_MICROS: AtomicI64 = AtomicI64::new(0);

/// Key holding the metadata envelope of `base_key`
pub fn metadata_key_of(base_key: &str) -> String {
    format!("{base_key}{KEY_SEPARATOR}{META_SUFFIX}")
}

/// Key holding the pending action counter of `base_key`
pub fn reminder_key_of(base_key: &str) -> String {
    format!("{base_key}{KEY_SEPARATOR}{REMINDER_SUFFIX}")
}

/// Whether `key` names a reminder
pub fn is_reminder_key(key: &str) -> bool {
    key.rsplit_once(KEY_SEPARATOR)
        .map(|(base, suffix)| !base.is_empty() && suffix == REMINDER_SUFFIX)
        .unwrap_or(false)
}

/// Recover the base key from a reminder key
pub fn base_key_of(reminder_key: &str) -> Result<&str> {
    match reminder_key.rsplit_once(KEY_SEPARATOR) {
        Some((base, REMINDER_SUFFIX)) if !base.is_empty() => Ok(base),
        _ => Err(Error::InvalidKey {
            key: reminder_key.to_string(),
        }),
    }
}

/// Storage prefix of a project
pub fn project_key_of(project_name: &str) -> String {
    format!("{PROJECT_DIR}/{project_name}")
}

/// Directory that saved snapshots of a task are written under
pub fn save_dir_of(project_name: &str, task_id: &str) -> String {
    format!("{}/{SAVED_DIR}/{task_id}", project_key_of(project_name))
}

/// Fresh file key under `save_dir`
///
/// Keys are qualified with a UTC timestamp at microsecond resolution. Calls
/// within the same microsecond are pushed forward so every key is distinct and
/// later keys always sort after earlier ones.
pub fn file_key_of(save_dir: &str) -> String {
    let micros = next_file_micros(Utc::now().timestamp_micros());
    let stamp = Utc
        .timestamp_micros(micros)
        .single()
        .unwrap_or_else(Utc::now)
        .format("%Y-%m-%d_%H-%M-%S-%6f");
    format!("{save_dir}/{stamp}")
}

fn next_file_micros(now: i64) -> i64 {
    let mut last = LAST_FILE_MICROS.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_FILE_MICROS.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed)
        {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}
