//! The waiting pool of idle tunnels, and how public callers claim from it.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Notify, Semaphore};
use tokio::time::{timeout_at, Instant};

#[derive(Debug, Error)]
#[error("tunnel pool is closed")]
pub struct PoolClosed;

/// A bounded FIFO of idle tunnels shared by the control and public sides.
///
/// Implementations must hand any given tunnel to at most one claimant.
pub trait TunnelPool: Send + Sync + 'static {
    type Tunnel: Send + 'static;

    /// Deposit a tunnel, waiting while the pool is full
    fn push(&self, tunnel: Self::Tunnel) -> impl Future<Output = Result<(), PoolClosed>> + Send;

    /// Claim the oldest idle tunnel if there is one
    fn try_pop(&self) -> Option<Self::Tunnel>;

    /// Claim the oldest idle tunnel, waiting up to `wait` for one to arrive
    fn pop_within(&self, wait: Duration) -> impl Future<Output = Option<Self::Tunnel>> + Send;

    /// Number of idle tunnels
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-process [`TunnelPool`] backed by a mutex-guarded queue.
///
/// A semaphore sized to the capacity makes `push` wait when full; claiming a
/// tunnel returns its permit. Closing the pool drops every queued tunnel.
pub struct WaitingPool<T> {
    idle: Mutex<VecDeque<T>>,
    free_slots: Semaphore,
    arrived: Notify,
    capacity: usize,
}

impl<T> WaitingPool<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            idle: Mutex::new(VecDeque::with_capacity(capacity)),
            free_slots: Semaphore::new(capacity),
            arrived: Notify::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Refuse further pushes and drop every idle tunnel
    pub fn close(&self) {
        self.free_slots.close();
        self.queue().clear();
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Send + 'static> TunnelPool for WaitingPool<T> {
    type Tunnel = T;

    async fn push(&self, tunnel: T) -> Result<(), PoolClosed> {
        let permit = self.free_slots.acquire().await.map_err(|_| PoolClosed)?;
        {
            let mut queue = self.queue();
            // close() may have run between acquire and lock
            if self.free_slots.is_closed() {
                return Err(PoolClosed);
            }
            queue.push_back(tunnel);
        }
        permit.forget();
        self.arrived.notify_one();
        Ok(())
    }

    fn try_pop(&self) -> Option<T> {
        let tunnel = self.queue().pop_front()?;
        self.free_slots.add_permits(1);
        Some(tunnel)
    }

    async fn pop_within(&self, wait: Duration) -> Option<T> {
        let deadline = Instant::now() + wait;
        loop {
            let arrived = self.arrived.notified();
            if let Some(tunnel) = self.try_pop() {
                return Some(tunnel);
            }
            if timeout_at(deadline, arrived).await.is_err() {
                return self.try_pop();
            }
        }
    }

    fn len(&self) -> usize {
        self.queue().len()
    }
}

/// How a public connection obtains a tunnel.
///
/// `FailFast` never waits: an empty pool means an immediate 503. `Wait` holds
/// the caller up to the given duration for an agent to reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PairingPolicy {
    #[default]
    FailFast,
    Wait(Duration),
}

impl PairingPolicy {
    pub async fn claim<P: TunnelPool>(&self, pool: &P) -> Option<P::Tunnel> {
        match *self {
            PairingPolicy::FailFast => pool.try_pop(),
            PairingPolicy::Wait(wait) => pool.pop_within(wait).await,
        }
    }
}
