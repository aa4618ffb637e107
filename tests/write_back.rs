//! End-to-end behavior of the write-back store over the in-memory cache,
//! driven on a paused clock so TTLs elapse instantly.

use assert_matches::assert_matches;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use writeback_store::{
    load_latest, paths, Error, FileStorage, FlushTrigger, KeyValueCache, MemoryCache,
    MemoryStorage, PersistentStorage, StateMetadata, WriteBackConfig, WriteBackEvent,
    WriteBackStore,
};

const TIMEOUT_SECS: u64 = 3600;
const TIME_FOR_WRITE_SECS: u64 = 600;
const NUM_ACTIONS_FOR_WRITE: u64 = 10;

fn config() -> WriteBackConfig {
    WriteBackConfig {
        timeout_secs: TIMEOUT_SECS,
        time_for_write_secs: TIME_FOR_WRITE_SECS,
        num_actions_for_write: NUM_ACTIONS_FOR_WRITE,
    }
}

struct Fixture {
    store: Arc<WriteBackStore>,
    cache: Arc<MemoryCache>,
    storage: Arc<MemoryStorage>,
    events: broadcast::Receiver<WriteBackEvent>,
}

async fn fixture() -> Fixture {
    let cache = MemoryCache::new();
    let storage = Arc::new(MemoryStorage::new());
    let store = WriteBackStore::start(config(), cache.clone(), storage.clone())
        .await
        .unwrap();
    let events = store.subscribe();
    Fixture {
        store,
        cache,
        storage,
        events,
    }
}

fn task(id: &str) -> (String, StateMetadata) {
    let metadata = StateMetadata::new("demo", id);
    (metadata.save_dir(), metadata)
}

/// Wait for the next flush outcome, skipping reminder bookkeeping
async fn next_outcome(events: &mut broadcast::Receiver<WriteBackEvent>) -> WriteBackEvent {
    let wait = async {
        loop {
            match events.recv().await.unwrap() {
                WriteBackEvent::ReminderArmed { .. } => continue,
                outcome => return outcome,
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(TIMEOUT_SECS * 2), wait)
        .await
        .expect("no flush outcome before timeout")
}

#[tokio::test(start_paused = true)]
async fn value_and_metadata_share_the_primary_ttl() {
    let f = fixture().await;
    let (key, metadata) = task("000001");

    f.store
        .set_ex_with_reminder(&key, Bytes::from("state"), &metadata, 1)
        .await
        .unwrap();

    let meta_key = paths::metadata_key_of(&key);
    assert_eq!(f.cache.ttl(&key), Some(Duration::from_secs(TIMEOUT_SECS)));
    assert_eq!(f.cache.ttl(&meta_key), f.cache.ttl(&key));
    assert_eq!(
        f.cache.ttl(&paths::reminder_key_of(&key)),
        Some(Duration::from_secs(TIME_FOR_WRITE_SECS))
    );

    let raw = f.cache.get(&meta_key).await.unwrap().unwrap();
    let json: serde_json::Value = serde_json::from_slice(&raw).unwrap();
    assert_eq!(json["projectName"], "demo");
    assert_eq!(json["taskId"], "000001");
}

#[tokio::test(start_paused = true)]
async fn threshold_reached_in_one_write_flushes_immediately() {
    let mut f = fixture().await;
    let (key, metadata) = task("000001");

    f.store
        .set_ex_with_reminder(&key, Bytes::from("big-batch"), &metadata, NUM_ACTIONS_FOR_WRITE)
        .await
        .unwrap();

    // Flushed before the call returned
    assert_eq!(f.storage.save_count(), 1);
    assert_eq!(
        f.cache.get(&paths::reminder_key_of(&key)).await.unwrap(),
        None
    );
    assert_matches!(
        next_outcome(&mut f.events).await,
        WriteBackEvent::Flushed { trigger: FlushTrigger::Threshold, .. }
    );

    let latest = load_latest(&*f.storage, &key).await.unwrap().unwrap();
    assert_eq!(latest.content, Bytes::from("big-batch"));
}

#[tokio::test(start_paused = true)]
async fn failed_threshold_flush_is_retried_by_expiry() {
    let mut f = fixture().await;
    let (key, metadata) = task("000001");
    f.storage.set_available(false);

    let result = f
        .store
        .set_ex_with_reminder(&key, Bytes::from("retry-me"), &metadata, NUM_ACTIONS_FOR_WRITE)
        .await;
    assert_matches!(result, Err(Error::BackendUnavailable { .. }));
    assert_matches!(
        next_outcome(&mut f.events).await,
        WriteBackEvent::FlushFailed { trigger: FlushTrigger::Threshold, .. }
    );
    assert_eq!(
        f.store.pending_actions(&key).await.unwrap(),
        NUM_ACTIONS_FOR_WRITE
    );

    f.storage.set_available(true);
    assert_matches!(
        next_outcome(&mut f.events).await,
        WriteBackEvent::Flushed { trigger: FlushTrigger::Expiry, .. }
    );

    let latest = load_latest(&*f.storage, &key).await.unwrap().unwrap();
    assert_eq!(latest.content, Bytes::from("retry-me"));
    assert_eq!(f.storage.save_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn cached_state_is_gone_once_the_primary_ttl_elapses() {
    let f = fixture().await;
    let (key, metadata) = task("000001");

    f.store
        .set_ex_with_reminder(&key, Bytes::from("state"), &metadata, 1)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(TIMEOUT_SECS - 1)).await;
    assert_eq!(f.store.get(&key).await.unwrap(), Some(Bytes::from("state")));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(f.store.get(&key).await.unwrap(), None);
    assert_eq!(
        f.cache.get(&paths::metadata_key_of(&key)).await.unwrap(),
        None
    );
}

#[tokio::test(start_paused = true)]
async fn steady_writes_accumulate_until_threshold() {
    let mut f = fixture().await;
    let (key, metadata) = task("000001");

    for i in 1..NUM_ACTIONS_FOR_WRITE {
        f.store
            .set_ex_with_reminder(&key, Bytes::from(format!("v{}", i)), &metadata, 1)
            .await
            .unwrap();
        assert_eq!(f.store.pending_actions(&key).await.unwrap(), i);
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    assert_eq!(f.storage.save_count(), 0);

    f.store
        .set_ex_with_reminder(&key, Bytes::from("v10"), &metadata, 1)
        .await
        .unwrap();

    assert_eq!(f.store.pending_actions(&key).await.unwrap(), 0);
    let records = f.storage.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].content, Bytes::from("v10"));
    assert_matches!(
        next_outcome(&mut f.events).await,
        WriteBackEvent::Flushed { trigger: FlushTrigger::Threshold, .. }
    );

    // No reminder is left to fire later
    tokio::time::sleep(Duration::from_secs(TIME_FOR_WRITE_SECS + 1)).await;
    assert_eq!(f.storage.save_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn quiet_task_is_flushed_once_when_its_reminder_expires() {
    let mut f = fixture().await;
    let (key, metadata) = task("000001");

    f.store
        .set_ex_with_reminder(&key, Bytes::from("quiet"), &metadata, 1)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(TIME_FOR_WRITE_SECS - 1)).await;
    assert_eq!(f.storage.save_count(), 0);

    let outcome = next_outcome(&mut f.events).await;
    assert_matches!(
        &outcome,
        WriteBackEvent::Flushed { key: k, trigger: FlushTrigger::Expiry, size_bytes: 5, .. } if *k == key
    );
    let WriteBackEvent::Flushed { file_key, .. } = outcome else {
        unreachable!()
    };
    assert_eq!(
        f.storage.load(&file_key).await.unwrap(),
        Some(Bytes::from("quiet"))
    );

    // Value and metadata expiring later are not reminders
    tokio::time::sleep(Duration::from_secs(TIMEOUT_SECS)).await;
    assert_eq!(f.storage.save_count(), 1);
    let stats = f.store.metrics();
    assert_eq!(stats.expiry_flushes, 1);
    assert_eq!(stats.ignored_expirations, 2);
}

#[tokio::test(start_paused = true)]
async fn writes_within_the_quiet_period_postpone_the_flush() {
    let mut f = fixture().await;
    let (key, metadata) = task("000001");

    f.store
        .set_ex_with_reminder(&key, Bytes::from("v1"), &metadata, 1)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(TIME_FOR_WRITE_SECS - 10)).await;
    f.store
        .set_ex_with_reminder(&key, Bytes::from("v2"), &metadata, 1)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(TIME_FOR_WRITE_SECS - 10)).await;
    assert_eq!(f.storage.save_count(), 0);

    assert_matches!(
        next_outcome(&mut f.events).await,
        WriteBackEvent::Flushed { trigger: FlushTrigger::Expiry, .. }
    );
    let latest = load_latest(&*f.storage, &key).await.unwrap().unwrap();
    assert_eq!(latest.content, Bytes::from("v2"));
}

#[tokio::test(start_paused = true)]
async fn non_reminder_expirations_are_ignored() {
    let f = fixture().await;

    f.cache
        .set_ex("session:abc", Bytes::from("x"), Duration::from_secs(5))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(6)).await;

    assert_eq!(f.storage.save_count(), 0);
    assert_eq!(f.store.metrics().ignored_expirations, 1);
    assert_eq!(f.store.metrics().total_flushes(), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_atomic_write_leaves_no_partial_state() {
    let f = fixture().await;
    let (key, metadata) = task("000001");

    f.cache.fail_next_multi_set_after(1);
    let result = f
        .store
        .set_ex_with_reminder(&key, Bytes::from("v"), &metadata, 1)
        .await;
    assert_matches!(result, Err(Error::StorageOperationFailed { .. }));

    assert_eq!(f.cache.get(&key).await.unwrap(), None);
    assert_eq!(f.cache.get(&paths::metadata_key_of(&key)).await.unwrap(), None);
    assert_eq!(f.cache.get(&paths::reminder_key_of(&key)).await.unwrap(), None);
    assert!(f.cache.is_empty());
}

#[tokio::test(start_paused = true)]
async fn every_flush_produces_a_new_artifact() {
    let f = fixture().await;
    let (key, metadata) = task("000001");

    f.store
        .set_ex_with_reminder(&key, Bytes::from("same"), &metadata, NUM_ACTIONS_FOR_WRITE)
        .await
        .unwrap();
    f.store
        .set_ex_with_reminder(&key, Bytes::from("same"), &metadata, NUM_ACTIONS_FOR_WRITE)
        .await
        .unwrap();

    let keys = f.storage.list_keys(&format!("{}/", key)).await.unwrap();
    assert_eq!(keys.len(), 2);
    assert_ne!(keys[0], keys[1]);
    assert!(keys.iter().all(|k| k.starts_with("projects/demo/saved/000001/")));

    let latest = load_latest(&*f.storage, &key).await.unwrap().unwrap();
    assert_eq!(latest.file_key, keys[1]);
}

#[tokio::test(start_paused = true)]
async fn lost_metadata_is_reported_and_the_worker_keeps_going() {
    let mut f = fixture().await;
    let (lost_key, lost_metadata) = task("000001");
    let (kept_key, kept_metadata) = task("000002");

    f.store
        .set_ex_with_reminder(&lost_key, Bytes::from("lost"), &lost_metadata, 1)
        .await
        .unwrap();
    f.cache
        .del(&paths::metadata_key_of(&lost_key))
        .await
        .unwrap();

    assert_matches!(
        next_outcome(&mut f.events).await,
        WriteBackEvent::ConsistencyViolation { key, missing } if key == lost_key && missing == "metadata"
    );
    assert_eq!(f.store.metrics().consistency_violations, 1);

    f.store
        .set_ex_with_reminder(&kept_key, Bytes::from("kept"), &kept_metadata, 1)
        .await
        .unwrap();
    assert_matches!(
        next_outcome(&mut f.events).await,
        WriteBackEvent::Flushed { key, trigger: FlushTrigger::Expiry, .. } if key == kept_key
    );
    assert_eq!(f.storage.save_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn storage_outage_during_expiry_flush_is_reported() {
    let mut f = fixture().await;
    let (key, metadata) = task("000001");

    f.store
        .set_ex_with_reminder(&key, Bytes::from("v"), &metadata, 1)
        .await
        .unwrap();
    f.storage.set_available(false);

    assert_matches!(
        next_outcome(&mut f.events).await,
        WriteBackEvent::FlushFailed { trigger: FlushTrigger::Expiry, project_name: Some(p), task_id: Some(t), .. }
            if p == "demo" && t == "000001"
    );
    assert_eq!(f.store.metrics().flush_failures, 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_expiry_flushes() {
    let f = fixture().await;
    let (key, metadata) = task("000001");

    f.store
        .set_ex_with_reminder(&key, Bytes::from("v"), &metadata, 1)
        .await
        .unwrap();
    f.store.shutdown().await;

    tokio::time::sleep(Duration::from_secs(TIME_FOR_WRITE_SECS + 1)).await;
    assert_eq!(f.storage.save_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn expiry_flush_lands_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(FileStorage::with_path(dir.path()).await.unwrap());
    let cache = MemoryCache::new();
    let store = WriteBackStore::start(config(), cache, storage.clone())
        .await
        .unwrap();
    let mut events = store.subscribe();
    let (key, metadata) = task("000001");

    store
        .set_ex_with_reminder(&key, Bytes::from(r#"{"cells":[]}"#), &metadata, 1)
        .await
        .unwrap();
    assert_matches!(
        next_outcome(&mut events).await,
        WriteBackEvent::Flushed { trigger: FlushTrigger::Expiry, .. }
    );

    let latest = tokio_test::assert_ok!(load_latest(&*storage, &key).await).unwrap();
    assert_eq!(latest.content, Bytes::from(r#"{"cells":[]}"#));

    let on_disk = dir
        .path()
        .join(format!("{}.{}", latest.file_key, writeback_store::storage::FILE_EXTENSION));
    assert!(on_disk.is_file());

    store.shutdown().await;
}
