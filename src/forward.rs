//! Plain TCP port forwarder.
//!
//! Every accepted connection is paired with a fresh connection to the target
//! and relayed until either side finishes. Useful for exposing the relay's
//! public port elsewhere or for testing an agent without a relay.

use std::io;
use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

use crate::config::ForwardSettings;
use crate::error::Result;
use crate::protocol::SessionCounter;
use crate::server::bind_listener;
use crate::traffic::relay;

pub struct Forwarder {
    listener: TcpListener,
    target: String,
    sessions: SessionCounter,
}

impl Forwarder {
    pub async fn bind(settings: ForwardSettings) -> Result<Self> {
        let listener = bind_listener("forward", &settings.listen_addr).await?;
        Ok(Self {
            listener,
            target: settings.target_addr,
            sessions: SessionCounter::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> Result<()> {
        info!(
            "Forwarding {} -> {}",
            self.local_addr()?,
            self.target
        );

        loop {
            let (inbound, peer) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("Forward listener failed: {}", e);
                    return Err(e.into());
                }
            };

            let id = self.sessions.next();
            let target = self.target.clone();
            tokio::spawn(async move {
                info!(session = %id, %peer, "Connection opened");
                let outbound = match TcpStream::connect(&target).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(session = %id, "Failed to connect to {}: {}", target, e);
                        return;
                    }
                };

                let report = relay(inbound, outbound).await;
                info!(
                    session = %id,
                    request_bytes = report.request_bytes,
                    response_bytes = report.response_bytes,
                    "Connection closed"
                );
            });
        }
    }
}
