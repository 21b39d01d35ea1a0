//! In-process channel backend
//!
//! Same contract as the Redis backend: snapshot and leader key expire on the
//! tokio clock, deltas go to whoever is subscribed at publish time.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{sync::broadcast, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{DeltaHandler, MeshChannel, DELTA_TOPIC};
use crate::error::MeshResult;

const DELTA_BUFFER: usize = 256;

#[derive(Debug, Clone)]
struct Expiring<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Expiring<T> {
    fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

#[derive(Debug)]
pub struct InMemoryChannel {
    snapshot: Mutex<Option<Expiring<Vec<u8>>>>,
    leader: Mutex<Option<Expiring<String>>>,
    deltas: broadcast::Sender<Vec<u8>>,
}

impl InMemoryChannel {
    pub fn new() -> Self {
        let (deltas, _) = broadcast::channel(DELTA_BUFFER);
        Self {
            snapshot: Mutex::new(None),
            leader: Mutex::new(None),
            deltas,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.deltas.receiver_count()
    }

    /// Identity currently holding the leader key, if any.
    pub fn leader(&self) -> Option<String> {
        self.leader
            .lock()
            .as_ref()
            .filter(|entry| entry.is_live())
            .map(|entry| entry.value.clone())
    }
}

impl Default for InMemoryChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MeshChannel for InMemoryChannel {
    async fn set_snapshot(&self, data: &[u8], ttl: Duration) -> MeshResult<()> {
        *self.snapshot.lock() = Some(Expiring::new(data.to_vec(), ttl));
        Ok(())
    }

    async fn get_snapshot(&self) -> MeshResult<Option<Vec<u8>>> {
        let mut slot = self.snapshot.lock();
        match slot.as_ref() {
            Some(entry) if entry.is_live() => Ok(Some(entry.value.clone())),
            Some(_) => {
                *slot = None;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn publish_delta(&self, data: &[u8]) -> MeshResult<()> {
        // No receivers is not an error: delivery is at-most-once.
        let receivers = self.deltas.send(data.to_vec()).unwrap_or(0);
        debug!(receivers, bytes = data.len(), "Published mesh delta");
        Ok(())
    }

    async fn subscribe_delta(
        &self,
        handler: DeltaHandler,
        cancel: CancellationToken,
    ) -> MeshResult<()> {
        let mut rx = self.deltas.subscribe();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                msg = rx.recv() => match msg {
                    Ok(payload) => handler(&payload),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, topic = DELTA_TOPIC, "Delta subscriber lagged; messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        Ok(())
    }

    async fn try_acquire_leader(&self, identity: &str, ttl: Duration) -> MeshResult<bool> {
        let mut leader = self.leader.lock();
        match leader.as_ref() {
            Some(entry) if entry.is_live() => Ok(false),
            _ => {
                *leader = Some(Expiring::new(identity.to_string(), ttl));
                Ok(true)
            }
        }
    }

    async fn renew_leader(&self, identity: &str, ttl: Duration) -> MeshResult<bool> {
        let mut leader = self.leader.lock();
        match leader.as_mut() {
            Some(entry) if entry.is_live() && entry.value == identity => {
                entry.expires_at = Instant::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
