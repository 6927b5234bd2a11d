use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::protocol::{unavailable_response, SessionCounter, SessionId};
use crate::traffic::relay;

use super::control::PooledTunnel;
use super::pool::{PairingPolicy, TunnelPool};

/// Accepts public callers and pairs each with an idle tunnel.
pub struct PublicAcceptor<P> {
    listener: TcpListener,
    pool: Arc<P>,
    policy: PairingPolicy,
    sessions: SessionCounter,
    unavailable: Arc<[u8]>,
}

impl<P> PublicAcceptor<P>
where
    P: TunnelPool<Tunnel = PooledTunnel>,
{
    pub fn new(
        listener: TcpListener,
        pool: Arc<P>,
        policy: PairingPolicy,
        sessions: SessionCounter,
        unavailable_message: &str,
    ) -> Self {
        Self {
            listener,
            pool,
            policy,
            sessions,
            unavailable: unavailable_response(unavailable_message).into(),
        }
    }

    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, caller) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("Public listener failed: {}", e);
                    return Err(e.into());
                }
            };

            let id = self.sessions.next();
            info!(session = %id, %caller, "New public connection");

            let pool = self.pool.clone();
            let policy = self.policy;
            let unavailable = self.unavailable.clone();
            tokio::spawn(async move {
                match policy.claim(&*pool).await {
                    Some(tunnel) => PublicSession::new(id, stream, caller, tunnel).run().await,
                    None => {
                        warn!(session = %id, "No idle tunnel, rejecting");
                        if let Err(e) = reject(stream, &unavailable).await {
                            debug!(session = %id, "Failed to send unavailable response: {}", e);
                        }
                    }
                }
            });
        }
    }
}

/// A public caller paired with one tunnel, owning both for its lifetime
pub struct PublicSession {
    id: SessionId,
    public: TcpStream,
    caller: SocketAddr,
    tunnel: PooledTunnel,
}

impl PublicSession {
    pub fn new(id: SessionId, public: TcpStream, caller: SocketAddr, tunnel: PooledTunnel) -> Self {
        Self {
            id,
            public,
            caller,
            tunnel,
        }
    }

    pub async fn run(self) {
        debug!(
            session = %self.id,
            caller = %self.caller,
            agent = %self.tunnel.agent,
            idle_ms = self.tunnel.pooled_at.elapsed().as_millis() as u64,
            "Paired with tunnel"
        );

        let report = relay(self.public, self.tunnel.stream).await;

        info!(
            session = %self.id,
            request_bytes = report.request_bytes,
            response_bytes = report.response_bytes,
            ended_by = %report.first_finished,
            "Session closed"
        );
        if let Some(e) = report.error {
            debug!(session = %self.id, "Session ended with error: {}", e);
        }
    }
}

/// Write the unavailable response and close the connection
pub async fn reject<S>(mut stream: S, response: &[u8]) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(response).await?;
    stream.shutdown().await
}
