use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, AsyncCommands, Client};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::{CacheError, CacheStore};

const SCAN_BATCH: usize = 100;

/// Redis-backed cache store.
pub struct RedisStore {
    client: Client,
    connection: RwLock<Option<MultiplexedConnection>>,
    available: AtomicBool,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("available", &self.available.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Opens a client and verifies connectivity with `PING`.
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = Client::open(url)?;

        let mut conn = client.get_multiplexed_async_connection().await?;
        let _: () = redis::cmd("PING").query_async(&mut conn).await?;
        info!("redis cache connectivity check succeeded");

        Ok(Self {
            client,
            connection: RwLock::new(Some(conn)),
            available: AtomicBool::new(true),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, CacheError> {
        {
            let conn = self.connection.read().await;
            if let Some(conn) = conn.as_ref() {
                return Ok(conn.clone());
            }
        }

        match self.client.get_multiplexed_async_connection().await {
            Ok(conn) => {
                let mut lock = self.connection.write().await;
                *lock = Some(conn.clone());
                self.available.store(true, Ordering::Relaxed);
                Ok(conn)
            }
            Err(err) => {
                self.available.store(false, Ordering::Relaxed);
                Err(CacheError::Backend(format!("redis unavailable: {err}")))
            }
        }
    }

    async fn mark_connection_failed(&self, err: &redis::RedisError) {
        warn!(error = %err, "redis command failed; dropping connection");
        let mut lock = self.connection.write().await;
        *lock = None;
        self.available.store(false, Ordering::Relaxed);
    }

    async fn run<T, F, Fut>(&self, command: F) -> Result<T, CacheError>
    where
        F: FnOnce(MultiplexedConnection) -> Fut + Send,
        Fut: std::future::Future<Output = redis::RedisResult<T>> + Send,
        T: Send,
    {
        let conn = self.connection().await?;
        match command(conn).await {
            Ok(value) => {
                self.available.store(true, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                self.mark_connection_failed(&err).await;
                Err(CacheError::Redis(err))
            }
        }
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.run(|mut conn| async move { conn.get::<_, Option<Vec<u8>>>(key).await })
            .await
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl_seconds: u64) -> Result<(), CacheError> {
        self.run(|mut conn| async move { conn.set_ex::<_, _, ()>(key, value, ttl_seconds).await })
            .await
    }

    async fn del(&self, keys: &[String]) -> Result<u64, CacheError> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.run(|mut conn| async move { conn.del::<_, u64>(keys).await })
            .await
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        self.run(|mut conn| async move {
            let mut found = Vec::new();
            let mut cursor = 0u64;
            loop {
                let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(pattern)
                    .arg("COUNT")
                    .arg(SCAN_BATCH)
                    .query_async(&mut conn)
                    .await?;
                found.extend(batch);
                cursor = next;
                if cursor == 0 {
                    break;
                }
            }
            found.sort();
            found.dedup();
            Ok(found)
        })
        .await
    }

    async fn flush_all(&self) -> Result<(), CacheError> {
        self.run(|mut conn| async move {
            let _: () = redis::cmd("FLUSHDB").query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }
}
