//! Redis Key-Value Cache
//!
//! Production adapter for the key-value cache port. Commands go over a shared
//! multiplexed connection; expiration notifications arrive on a dedicated
//! pub/sub connection opened per subscription.

use crate::cache::expired_channel;
use crate::config::CacheConfig;
use crate::domain::{ExpirationEvent, ExpirationStream, KeyValueCache};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, ConnectionInfo, IntoConnectionInfo};
use std::time::Duration;
use tracing::{debug, info, warn};

const BACKEND_NAME: &str = "redis";

/// Key-value cache backed by a Redis server
pub struct RedisCache {
    /// Client used to open pub/sub connections
    client: redis::Client,
    /// Shared command connection
    conn: MultiplexedConnection,
    /// Keyevent channel expirations are published on
    channel: String,
}

impl RedisCache {
    /// Connect to the server named by `config.url`
    pub async fn connect(config: &CacheConfig) -> Result<Self> {
        let client = redis::Client::open(connection_info(config)?)?;
        let conn = client.get_multiplexed_tokio_connection().await?;

        // Keyevents are published per database, so listen where keys are written
        let db = client.get_connection_info().redis.db;
        info!(url = %config.url, db, "Connected to Redis");

        Ok(Self {
            client,
            conn,
            channel: expired_channel(db),
        })
    }

    /// Channel expiration notifications are received on
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

/// Connection settings from `config.url`, with `config.db` taking precedence
fn connection_info(config: &CacheConfig) -> Result<ConnectionInfo> {
    let mut info = config.url.as_str().into_connection_info()?;
    if let Some(db) = config.db {
        info.redis.db = db;
    }
    Ok(info)
}

/// PSETEX takes whole milliseconds and rejects zero
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl KeyValueCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value.map(Bytes::from))
    }

    async fn set_ex(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PSETEX")
            .arg(key)
            .arg(ttl_millis(ttl))
            .arg(value.as_ref())
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn multi_set_ex(&self, keys: &[String], values: &[Bytes], ttl: Duration) -> Result<()> {
        if keys.len() != values.len() {
            return Err(Error::KeyValueMismatch {
                keys: keys.len(),
                values: values.len(),
            });
        }

        let ttl_ms = ttl_millis(ttl);
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, value) in keys.iter().zip(values) {
            pipe.cmd("PSETEX")
                .arg(key)
                .arg(ttl_ms)
                .arg(value.as_ref())
                .ignore();
        }

        let mut conn = self.conn.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;
        debug!(keys = keys.len(), ttl_ms, "Applied atomic multi-set");
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn enable_expiry_notifications(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg("Ex")
            .query_async::<_, ()>(&mut conn)
            .await?;
        info!("Enabled Redis key-expiration notifications");
        Ok(())
    }

    async fn subscribe_expirations(&self) -> Result<ExpirationStream> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(self.channel.as_str()).await?;
        info!(channel = %self.channel, "Subscribed to key-expiration notifications");

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(key) => Some(ExpirationEvent::new(msg.get_channel_name(), key)),
                Err(e) => {
                    warn!(error = %e, "Dropping malformed expiration notification");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn health_check(&self) -> Result<bool> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(pong == "PONG")
    }

    fn backend_name(&self) -> &str {
        BACKEND_NAME
    }
}
