use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, info, trace, warn};

use crate::config::AgentSettings;
use crate::protocol::{SessionCounter, SessionId, SlotId};
use crate::traffic::relay;

use super::retry::Backoff;

/// Lifecycle of the tunnel connection a worker currently owns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Dialing the relay's control endpoint
    Dialing,
    /// Connected and waiting in the relay's pool
    Idle,
    /// Paired with a public caller and bridged to the local service
    Paired,
    /// No connection held
    Closed,
}

/// How one pass through the worker loop ended
#[derive(Debug)]
pub enum Cycle {
    /// The relay's control endpoint refused or timed out
    RelayUnreachable(io::Error),
    /// The pooled tunnel ended before any request bytes arrived
    ClosedWhileIdle(Option<io::Error>),
    /// Paired, but the local service could not be reached
    LocalUnreachable { session: SessionId, error: io::Error },
    /// Connected to the local service, but it refused the leading chunk
    LocalWriteFailed { session: SessionId, error: io::Error },
    /// Paired and bridged until one side finished
    Bridged {
        session: SessionId,
        request_bytes: u64,
        response_bytes: u64,
    },
}

/// One slot of the agent's outbound pool.
///
/// Loops until stopped: dial the relay, wait to be paired, bridge the session
/// to the local service, then dial again. Only a failed relay dial backs off.
/// A pooled tunnel dropped before pairing, a finished session or a refused
/// local dial all redial at once. The loop ends only when the retry policy's
/// attempt limit runs out.
pub struct TunnelWorker {
    slot: SlotId,
    settings: Arc<AgentSettings>,
    sessions: SessionCounter,
    backoff: Backoff,
    state: SlotState,
}

impl TunnelWorker {
    pub fn new(slot: SlotId, settings: Arc<AgentSettings>, sessions: SessionCounter) -> Self {
        let backoff = Backoff::new(settings.retry.clone());
        Self {
            slot,
            settings,
            sessions,
            backoff,
            state: SlotState::Closed,
        }
    }

    fn transition(&mut self, next: SlotState) {
        trace!(slot = %self.slot, from = ?self.state, to = ?next, "Slot state changed");
        self.state = next;
    }

    pub async fn run(mut self) {
        loop {
            match self.cycle().await {
                Cycle::RelayUnreachable(e) => {
                    warn!(
                        slot = %self.slot,
                        attempt = self.backoff.attempt() + 1,
                        "Relay {} unreachable: {}",
                        self.settings.relay_addr,
                        e
                    );
                    self.backoff.wait().await;
                    if self.backoff.exhausted() {
                        error!(
                            slot = %self.slot,
                            "Giving up after {} attempts",
                            self.backoff.attempt()
                        );
                        return;
                    }
                }
                Cycle::ClosedWhileIdle(e) => {
                    debug!(slot = %self.slot, error = ?e, "Pooled tunnel closed before pairing");
                }
                Cycle::LocalUnreachable { session, error } => {
                    warn!(
                        slot = %self.slot,
                        %session,
                        "Local service {} unreachable: {}",
                        self.settings.local_addr,
                        error
                    );
                }
                Cycle::LocalWriteFailed { session, error } => {
                    warn!(
                        slot = %self.slot,
                        %session,
                        "Failed to send request to local service {}: {}",
                        self.settings.local_addr,
                        error
                    );
                }
                Cycle::Bridged {
                    session,
                    request_bytes,
                    response_bytes,
                } => {
                    info!(
                        slot = %self.slot,
                        %session,
                        request_bytes,
                        response_bytes,
                        "Session finished"
                    );
                }
            }
        }
    }

    /// Run one dial → wait → bridge pass
    pub async fn cycle(&mut self) -> Cycle {
        self.transition(SlotState::Dialing);
        let mut tunnel = match TcpStream::connect(&self.settings.relay_addr).await {
            Ok(stream) => stream,
            Err(e) => {
                self.transition(SlotState::Closed);
                return Cycle::RelayUnreachable(e);
            }
        };

        self.transition(SlotState::Idle);
        self.backoff.reset();
        debug!(slot = %self.slot, "Tunnel connected, waiting to be paired");

        // Blocks until the relay pairs this tunnel and forwards request bytes
        let mut chunk = vec![0u8; self.settings.chunk_size];
        let n = match tunnel.read(&mut chunk).await {
            Ok(0) => {
                self.transition(SlotState::Closed);
                return Cycle::ClosedWhileIdle(None);
            }
            Ok(n) => n,
            Err(e) => {
                self.transition(SlotState::Closed);
                return Cycle::ClosedWhileIdle(Some(e));
            }
        };
        chunk.truncate(n);

        self.transition(SlotState::Paired);
        let session = self.sessions.next();
        debug!(slot = %self.slot, %session, leading_bytes = n, "Tunnel paired");

        let local = match TcpStream::connect(&self.settings.local_addr).await {
            Ok(stream) => stream,
            Err(error) => {
                // Dropping the tunnel resets the waiting public caller
                drop(tunnel);
                self.transition(SlotState::Closed);
                return Cycle::LocalUnreachable { session, error };
            }
        };

        self.bridge(session, tunnel, local, &chunk).await
    }

    /// Hand the leading chunk to the local service, then relay both ways
    async fn bridge<L>(
        &mut self,
        session: SessionId,
        tunnel: TcpStream,
        mut local: L,
        chunk: &[u8],
    ) -> Cycle
    where
        L: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        if let Err(error) = local.write_all(chunk).await {
            self.transition(SlotState::Closed);
            return Cycle::LocalWriteFailed { session, error };
        }

        let report = relay(tunnel, local).await;
        self.transition(SlotState::Closed);
        if let Some(e) = &report.error {
            debug!(
                slot = %self.slot,
                %session,
                direction = %report.first_finished,
                "Session ended with error: {}",
                e
            );
        }

        Cycle::Bridged {
            session,
            request_bytes: chunk.len() as u64 + report.request_bytes,
            response_bytes: report.response_bytes,
        }
    }
}
