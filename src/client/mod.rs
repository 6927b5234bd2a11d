//! Agent side of the tunnel.
//!
//! - [`ClientPool`] - keeps a fixed number of tunnel workers running
//! - [`TunnelWorker`] - one outbound tunnel slot and its reconnect loop
//! - [`RetryPolicy`] - reconnect timing

mod retry;
mod worker;

pub use retry::RetryPolicy;
pub use worker::TunnelWorker;

use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::AgentSettings;
use crate::protocol::{SessionCounter, SlotId};

/// Fixed-size pool of outbound tunnels to the relay.
///
/// The pool size bounds how many public requests this agent serves at once.
pub struct ClientPool {
    settings: Arc<AgentSettings>,
    sessions: SessionCounter,
}

impl ClientPool {
    pub fn new(settings: AgentSettings) -> Self {
        Self {
            settings: Arc::new(settings),
            sessions: SessionCounter::new(),
        }
    }

    /// Launch every worker and run until the process is stopped or every
    /// worker has exhausted its retries
    pub async fn run(self) {
        info!(
            "Opening {} tunnels to {} for {}",
            self.settings.pool_size, self.settings.relay_addr, self.settings.local_addr
        );

        let mut slots = JoinSet::new();
        for index in 0..self.settings.pool_size {
            slots.spawn(supervise(
                SlotId(index),
                self.settings.clone(),
                self.sessions.clone(),
            ));
        }

        while slots.join_next().await.is_some() {}
        warn!("Every tunnel worker has stopped");
    }
}

/// Keep one slot occupied, relaunching its worker if it panics
async fn supervise(slot: SlotId, settings: Arc<AgentSettings>, sessions: SessionCounter) {
    keep_running(slot, || {
        TunnelWorker::new(slot, settings.clone(), sessions.clone()).run()
    })
    .await
}

/// Run the task `launch` builds until it returns, building a fresh one after
/// each panic
async fn keep_running<F, Fut>(slot: SlotId, launch: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    loop {
        // A one-task set so the worker is aborted along with its supervisor
        let mut worker = JoinSet::new();
        worker.spawn(launch());
        match worker.join_next().await {
            Some(Err(e)) if e.is_panic() => {
                error!(%slot, "Tunnel worker panicked, relaunching: {}", e);
            }
            _ => return,
        }
    }
}
