//! Redis channel backend
//!
//! Commands go through a deadpool connection pool; the delta subscription
//! holds its own dedicated pub/sub connection for as long as it runs.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config, Pool, PoolConfig, Runtime};
use futures::StreamExt;
use redis::AsyncCommands;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ttl_millis, DeltaHandler, MeshChannel, DELTA_TOPIC, LEADER_KEY, SNAPSHOT_KEY};
use crate::{
    config::RedisConfig,
    error::{MeshError, MeshResult},
};

/// Extend the key's TTL only while it still holds the caller's identity.
const RENEW_LEADER_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
end
return 0
"#;

#[derive(Clone)]
pub struct RedisChannel {
    pool: Pool,
    client: redis::Client,
}

impl std::fmt::Debug for RedisChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisChannel")
            .field("pool", &self.pool.status())
            .finish()
    }
}

impl RedisChannel {
    pub fn new(config: &RedisConfig) -> MeshResult<Self> {
        config.validate().map_err(MeshError::Config)?;

        let url = config.url.trim().to_string();
        let mut cfg = Config::from_url(url.clone());
        cfg.pool = Some(PoolConfig::new(config.pool_max));
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| MeshError::Config(e.to_string()))?;
        let client = redis::Client::open(url)?;

        Ok(Self { pool, client })
    }
}

#[async_trait]
impl MeshChannel for RedisChannel {
    async fn set_snapshot(&self, data: &[u8], ttl: Duration) -> MeshResult<()> {
        let mut conn = self.pool.get().await?;
        redis::cmd("SET")
            .arg(SNAPSHOT_KEY)
            .arg(data)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_snapshot(&self) -> MeshResult<Option<Vec<u8>>> {
        let mut conn = self.pool.get().await?;
        let data: Option<Vec<u8>> = conn.get(SNAPSHOT_KEY).await?;
        Ok(data)
    }

    async fn publish_delta(&self, data: &[u8]) -> MeshResult<()> {
        let mut conn = self.pool.get().await?;
        let receivers: i64 = conn.publish(DELTA_TOPIC, data).await?;
        debug!(receivers, bytes = data.len(), "Published mesh delta");
        Ok(())
    }

    async fn subscribe_delta(
        &self,
        handler: DeltaHandler,
        cancel: CancellationToken,
    ) -> MeshResult<()> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(DELTA_TOPIC).await?;
        info!(topic = DELTA_TOPIC, "Subscribed to mesh delta topic");

        {
            let mut messages = pubsub.on_message();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!(topic = DELTA_TOPIC, "Delta subscription cancelled");
                        break;
                    }
                    msg = messages.next() => {
                        let Some(msg) = msg else {
                            warn!(topic = DELTA_TOPIC, "Delta subscription stream closed");
                            return Err(MeshError::Channel(redis::RedisError::from((
                                redis::ErrorKind::IoError,
                                "pub/sub connection closed",
                            ))));
                        };
                        match msg.get_payload::<Vec<u8>>() {
                            Ok(payload) => handler(&payload),
                            Err(e) => warn!(error = %e, "Dropping unreadable delta payload"),
                        }
                    }
                }
            }
        }

        if let Err(e) = pubsub.unsubscribe(DELTA_TOPIC).await {
            debug!(error = %e, "Unsubscribe failed; dropping connection");
        }
        Ok(())
    }

    async fn try_acquire_leader(&self, identity: &str, ttl: Duration) -> MeshResult<bool> {
        let mut conn = self.pool.get().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(LEADER_KEY)
            .arg(identity)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn renew_leader(&self, identity: &str, ttl: Duration) -> MeshResult<bool> {
        let mut conn = self.pool.get().await?;
        let renewed: i64 = redis::Script::new(RENEW_LEADER_SCRIPT)
            .key(LEADER_KEY)
            .arg(identity)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }
}
