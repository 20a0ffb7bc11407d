//! Bounded access to upstream connections.
//!
//! reqwest already keeps idle keep-alive sockets per host and throws away the
//! ones that break, so the pool does not own sockets itself. It owns the
//! *right* to use one: a [`ConnectionLease`] is a permit from a fair (FIFO)
//! semaphore sized to `pool_max_idle_per_host`, bundled with the shared client.
//! Waiting for a lease is bounded by the acquire timeout.

use crate::error::{ProxyError, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone)]
pub struct ConnectionPool {
    client: reqwest::Client,
    slots: Arc<Semaphore>,
    capacity: usize,
    acquire_timeout: Duration,
}

/// A held upstream slot. Dropping it returns the slot to the pool.
#[derive(Debug)]
pub struct ConnectionLease {
    client: reqwest::Client,
    _permit: OwnedSemaphorePermit,
    acquired_at: Instant,
}

impl ConnectionPool {
    pub fn new(client: reqwest::Client, capacity: usize, acquire_timeout: Duration) -> Self {
        Self {
            client,
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
            acquire_timeout,
        }
    }

    /// Build the shared client with keep-alive reuse matching the pool size.
    pub fn build_client(
        capacity: usize,
        connect_timeout: Duration,
        idle_timeout: Duration,
    ) -> Result<reqwest::Client> {
        // No overall timeout: it would cut long streams short.
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .pool_max_idle_per_host(capacity)
            .pool_idle_timeout(idle_timeout)
            .build()?;
        Ok(client)
    }

    /// Wait for a free slot, in arrival order, up to the acquire timeout.
    pub async fn acquire(&self) -> Result<ConnectionLease> {
        let started = Instant::now();
        let permit = tokio::time::timeout(self.acquire_timeout, self.slots.clone().acquire_owned())
            .await
            .map_err(|_| ProxyError::PoolExhausted {
                waited_ms: started.elapsed().as_millis(),
            })?
            .map_err(|e| ProxyError::other(format!("Connection pool closed: {e}")))?;

        let waited = started.elapsed();
        if waited > Duration::from_millis(100) {
            tracing::debug!(waited_ms = waited.as_millis(), "Waited for upstream connection");
        }

        Ok(ConnectionLease {
            client: self.client.clone(),
            _permit: permit,
            acquired_at: Instant::now(),
        })
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently free.
    #[must_use]
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }
}

impl ConnectionLease {
    #[must_use]
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    #[must_use]
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Give the slot back now rather than at end of scope.
    pub fn release(self) {
        tracing::trace!(held_ms = self.held_for().as_millis(), "Released upstream connection");
    }
}
