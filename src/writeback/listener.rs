//! Expiration Listener
//!
//! Two background tasks own the expiry-driven half of the write-back store:
//!
//! - the **listener** drains the cache's expiration stream, drops every key
//!   that is not a reminder and queues the base key of each expired reminder;
//! - the **flush worker** takes queued keys one at a time, in arrival order,
//!   and flushes them.
//!
//! The unbounded queue between them keeps a slow flush from stalling
//! notification delivery. A failed flush is reported by the store and never
//! stops the worker.

use crate::domain::{ExpirationStream, KeyValueCacheRef};
use crate::paths;
use crate::writeback::events::FlushTrigger;
use crate::writeback::metrics::WriteBackMetrics;
use crate::writeback::store::WriteBackStore;
use futures::StreamExt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Delay between attempts to re-subscribe after the stream closes
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Spawn the listener and flush worker, returning their handles
pub(crate) fn spawn(
    store: Weak<WriteBackStore>,
    cache: KeyValueCacheRef,
    expirations: ExpirationStream,
    metrics: Arc<WriteBackMetrics>,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let (queue_tx, queue_rx) = mpsc::unbounded_channel();

    let listener = tokio::spawn(listen(
        cache,
        expirations,
        queue_tx,
        metrics,
        shutdown.clone(),
    ));
    let worker = tokio::spawn(flush_worker(store, queue_rx, shutdown));
    vec![listener, worker]
}

async fn listen(
    cache: KeyValueCacheRef,
    mut expirations: ExpirationStream,
    queue: mpsc::UnboundedSender<String>,
    metrics: Arc<WriteBackMetrics>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = expirations.next() => event,
        };

        let Some(event) = event else {
            error!("Expiration stream closed, expiry flushes paused until re-subscribed");
            match resubscribe(&cache, &shutdown).await {
                Some(stream) => {
                    expirations = stream;
                    continue;
                }
                None => break,
            }
        };

        if !paths::is_reminder_key(&event.key) {
            metrics.record_ignored_expiration();
            continue;
        }

        match paths::base_key_of(&event.key) {
            Ok(base_key) => {
                debug!(key = base_key, channel = %event.channel, "Reminder expired");
                if queue.send(base_key.to_string()).is_err() {
                    break;
                }
            }
            Err(e) => warn!(error = %e, "Skipping expiration event"),
        }
    }
    debug!("Expiration listener stopped");
}

async fn resubscribe(
    cache: &KeyValueCacheRef,
    shutdown: &CancellationToken,
) -> Option<ExpirationStream> {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return None,
            _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
        }

        // A reconnected server may have lost the notification setting
        let attempt = match cache.enable_expiry_notifications().await {
            Ok(()) => cache.subscribe_expirations().await,
            Err(e) => Err(e),
        };
        match attempt {
            Ok(stream) => {
                info!("Re-subscribed to key-expiration notifications");
                return Some(stream);
            }
            Err(e) => warn!(error = %e, "Re-subscribing to expirations failed"),
        }
    }
}

async fn flush_worker(
    store: Weak<WriteBackStore>,
    mut queue: mpsc::UnboundedReceiver<String>,
    shutdown: CancellationToken,
) {
    loop {
        let key = tokio::select! {
            _ = shutdown.cancelled() => break,
            key = queue.recv() => key,
        };
        let Some(key) = key else {
            break;
        };
        let Some(store) = store.upgrade() else {
            break;
        };

        // Failures are logged and published by the store
        let _ = store.flush_from_cache(&key, FlushTrigger::Expiry).await;
    }
    debug!("Flush worker stopped");
}
