//! Persistence and pub/sub channel shared by the collector and the server
//!
//! Three primitives over one external store:
//! - a snapshot slot (`mesh:snapshot`) with a mandatory TTL
//! - a broadcast topic (`mesh:delta`) with at-most-once, no-replay delivery
//! - a leadership key (`mesh:leader`) taken with set-if-absent plus TTL
//!
//! Backends:
//! - Redis (production)
//! - Memory (tests and single-process runs)

mod memory;
mod redis;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub use self::{memory::InMemoryChannel, redis::RedisChannel};
use crate::error::MeshResult;

pub const SNAPSHOT_KEY: &str = "mesh:snapshot";
pub const DELTA_TOPIC: &str = "mesh:delta";
pub const LEADER_KEY: &str = "mesh:leader";

/// Invoked synchronously for every message received on the delta topic.
pub type DeltaHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

#[async_trait]
pub trait MeshChannel: Send + Sync {
    /// Overwrite the snapshot slot; it reads as absent once `ttl` elapses.
    async fn set_snapshot(&self, data: &[u8], ttl: Duration) -> MeshResult<()>;

    /// `Ok(None)` when nothing has been published or the last write expired.
    async fn get_snapshot(&self) -> MeshResult<Option<Vec<u8>>>;

    /// Best-effort fan-out to the listeners connected right now.
    async fn publish_delta(&self, data: &[u8]) -> MeshResult<()>;

    /// Deliver delta messages to `handler` until `cancel` fires, then release
    /// the subscription and return `Ok(())`.
    async fn subscribe_delta(
        &self,
        handler: DeltaHandler,
        cancel: CancellationToken,
    ) -> MeshResult<()>;

    /// Take the leader key if it is absent or expired. First writer wins.
    async fn try_acquire_leader(&self, identity: &str, ttl: Duration) -> MeshResult<bool>;

    /// Extend the leader key's TTL if `identity` still holds it.
    async fn renew_leader(&self, identity: &str, ttl: Duration) -> MeshResult<bool>;
}

pub type SharedChannel = Arc<dyn MeshChannel>;

fn ttl_millis(ttl: Duration) -> u64 {
    // A zero TTL is rejected by the store, so round up to the smallest unit.
    (ttl.as_millis() as u64).max(1)
}
