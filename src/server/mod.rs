//! Relay side of the tunnel.
//!
//! The relay listens on two endpoints. Agents dial the control endpoint and
//! each connection becomes an idle tunnel in a [`WaitingPool`]. Public
//! callers dial the public endpoint and are paired with the oldest idle
//! tunnel, or turned away with a 503 when none is idle.
//!
//! - [`RelayServer`] - binds both endpoints and runs the acceptors
//! - [`ControlAcceptor`] / [`PublicAcceptor`] - the two accept loops
//! - [`TunnelPool`] / [`PairingPolicy`] - the pool seam and claim strategy

mod control;
mod pool;
mod public;

pub use control::{ControlAcceptor, PooledTunnel};
pub use pool::{PairingPolicy, TunnelPool, WaitingPool};
pub use public::PublicAcceptor;

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

use crate::config::RelaySettings;
use crate::error::{Result, WarrenError};
use crate::protocol::SessionCounter;

/// Bind a listener, mapping failure to a startup error naming the endpoint
pub(crate) async fn bind_listener(role: &'static str, addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| WarrenError::Bind {
            role,
            addr: addr.to_string(),
            source,
        })
}

pub struct RelayServer {
    control: TcpListener,
    public: TcpListener,
    pool: Arc<WaitingPool<PooledTunnel>>,
    sessions: SessionCounter,
    settings: RelaySettings,
}

impl RelayServer {
    /// Bind both endpoints. Either failing is fatal.
    pub async fn bind(settings: RelaySettings) -> Result<Self> {
        let control = bind_listener("control", &settings.control_addr).await?;
        let public = bind_listener("public", &settings.public_addr).await?;

        Ok(Self {
            control,
            public,
            pool: Arc::new(WaitingPool::new(settings.pool_capacity)),
            sessions: SessionCounter::new(),
            settings,
        })
    }

    pub fn control_addr(&self) -> io::Result<SocketAddr> {
        self.control.local_addr()
    }

    pub fn public_addr(&self) -> io::Result<SocketAddr> {
        self.public.local_addr()
    }

    #[cfg(test)]
    pub fn pool(&self) -> Arc<WaitingPool<PooledTunnel>> {
        self.pool.clone()
    }

    /// Serve until `shutdown` resolves, then drop every idle tunnel.
    ///
    /// A failed accept loop stops only that endpoint; the other keeps
    /// serving until shutdown.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!(
            "Relay listening: control {} (agents), public {} (callers), pool capacity {}",
            self.control_addr()?,
            self.public_addr()?,
            self.pool.capacity()
        );

        let control = ControlAcceptor::new(self.control, self.pool.clone());
        let public = PublicAcceptor::new(
            self.public,
            self.pool.clone(),
            self.settings.pairing,
            self.sessions.clone(),
            &self.settings.unavailable_message,
        );

        let control_task = tokio::spawn(control.run());
        let public_task = tokio::spawn(public.run());

        shutdown.await;
        info!(
            "Shutting down relay after {} sessions, dropping {} idle tunnels",
            self.sessions.issued(),
            self.pool.len()
        );

        control_task.abort();
        public_task.abort();
        for (role, task) in [("control", control_task), ("public", public_task)] {
            if let Ok(Err(e)) = task.await {
                error!("{} acceptor had stopped: {}", role, e);
            }
        }
        self.pool.close();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientPool, RetryPolicy};
    use crate::config::AgentSettings;
    use crate::protocol::{unavailable_response, DEFAULT_UNAVAILABLE_MESSAGE};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;
    use tokio::time::{sleep, timeout};

    fn relay_settings(pairing: PairingPolicy) -> RelaySettings {
        RelaySettings {
            control_addr: "127.0.0.1:0".to_string(),
            public_addr: "127.0.0.1:0".to_string(),
            pool_capacity: 100,
            pairing,
            unavailable_message: DEFAULT_UNAVAILABLE_MESSAGE.to_string(),
        }
    }

    struct TestRelay {
        public: SocketAddr,
        control: SocketAddr,
        pool: Arc<WaitingPool<PooledTunnel>>,
        stop: oneshot::Sender<()>,
    }

    async fn start_relay(pairing: PairingPolicy) -> TestRelay {
        let server = RelayServer::bind(relay_settings(pairing)).await.unwrap();
        let public = server.public_addr().unwrap();
        let control = server.control_addr().unwrap();
        let pool = server.pool();
        let (stop, stopped) = oneshot::channel::<()>();
        tokio::spawn(server.run_until(async {
            let _ = stopped.await;
        }));
        TestRelay {
            public,
            control,
            pool,
            stop,
        }
    }

    fn start_agent(control: SocketAddr, local: SocketAddr, pool_size: usize) {
        let settings = AgentSettings {
            relay_addr: control.to_string(),
            local_addr: local.to_string(),
            pool_size,
            retry: RetryPolicy::fixed(Duration::from_millis(100)),
            chunk_size: 1024,
        };
        tokio::spawn(ClientPool::new(settings).run());
    }

    /// Local service that answers one read with the same bytes, then hangs up
    async fn start_echo_once() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    if let Ok(n) = stream.read(&mut buf).await {
                        let _ = stream.write_all(&buf[..n]).await;
                    }
                });
            }
        });
        addr
    }

    async fn unused_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    async fn wait_for_idle(pool: &WaitingPool<PooledTunnel>, expected: usize) {
        timeout(Duration::from_secs(10), async {
            while pool.len() != expected {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("pool never reached expected size");
    }

    async fn read_all(stream: &mut TcpStream) -> Vec<u8> {
        let mut buf = Vec::new();
        timeout(Duration::from_secs(5), stream.read_to_end(&mut buf))
            .await
            .expect("connection was not closed")
            .unwrap();
        buf
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let relay = start_relay(PairingPolicy::FailFast).await;

        let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = local.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = local.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"PING");
            stream.write_all(b"PONG").await.unwrap();
        });

        start_agent(relay.control, local_addr, 1);
        wait_for_idle(&relay.pool, 1).await;

        let mut caller = TcpStream::connect(relay.public).await.unwrap();
        caller.write_all(b"PING").await.unwrap();
        assert_eq!(read_all(&mut caller).await, b"PONG");
    }

    #[tokio::test]
    async fn test_third_caller_rejected_when_two_tunnels_busy() {
        let relay = start_relay(PairingPolicy::FailFast).await;
        let local = start_echo_once().await;
        start_agent(relay.control, local, 2);
        wait_for_idle(&relay.pool, 2).await;

        let mut callers = Vec::new();
        for _ in 0..3 {
            callers.push(TcpStream::connect(relay.public).await.unwrap());
        }

        // The rejected caller is answered and closed without sending anything
        let mut rejected = Vec::new();
        let mut paired = Vec::new();
        for mut caller in callers {
            let mut buf = Vec::new();
            match timeout(Duration::from_millis(500), caller.read_to_end(&mut buf)).await {
                Ok(Ok(_)) => rejected.push(buf),
                _ => paired.push(caller),
            }
        }

        assert_eq!(rejected.len(), 1);
        assert_eq!(
            rejected[0],
            unavailable_response(DEFAULT_UNAVAILABLE_MESSAGE)
        );
        assert_eq!(paired.len(), 2);

        for (i, caller) in paired.iter_mut().enumerate() {
            let payload = format!("hello-{}", i);
            caller.write_all(payload.as_bytes()).await.unwrap();
            assert_eq!(read_all(caller).await, payload.as_bytes());
        }
    }

    #[tokio::test]
    async fn test_payload_larger_than_leading_chunk() {
        const LEN: usize = 200_000;
        let relay = start_relay(PairingPolicy::FailFast).await;

        let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = local.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = local.accept().await.unwrap();
            let mut received = vec![0u8; LEN];
            stream.read_exact(&mut received).await.unwrap();
            stream.write_all(&received).await.unwrap();
        });

        start_agent(relay.control, local_addr, 1);
        wait_for_idle(&relay.pool, 1).await;

        let payload: Vec<u8> = (0..LEN).map(|i| (i % 253) as u8).collect();
        let caller = TcpStream::connect(relay.public).await.unwrap();
        let (mut reader, mut writer) = caller.into_split();
        let sent = payload.clone();
        let write_task = tokio::spawn(async move {
            writer.write_all(&sent).await.unwrap();
            writer
        });

        let mut echoed = Vec::new();
        timeout(Duration::from_secs(10), reader.read_to_end(&mut echoed))
            .await
            .expect("echo never completed")
            .unwrap();
        let _writer = write_task.await.unwrap();

        assert_eq!(echoed.len(), LEN);
        assert_eq!(echoed, payload);
    }

    #[tokio::test]
    async fn test_pool_refills_after_local_dial_failure() {
        let relay = start_relay(PairingPolicy::FailFast).await;
        let dead_local = unused_addr().await;
        start_agent(relay.control, dead_local, 1);
        wait_for_idle(&relay.pool, 1).await;

        let mut caller = TcpStream::connect(relay.public).await.unwrap();
        caller.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        // The caller sees the tunnel drop, by EOF or reset
        let mut buf = Vec::new();
        let outcome = timeout(Duration::from_secs(5), caller.read_to_end(&mut buf)).await;
        assert!(outcome.is_ok(), "caller was never disconnected");
        assert!(buf.is_empty());

        wait_for_idle(&relay.pool, 1).await;
    }

    #[tokio::test]
    async fn test_caller_hangup_closes_local_connection() {
        let relay = start_relay(PairingPolicy::FailFast).await;

        let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = local.local_addr().unwrap();
        let (got_request, request_seen) = oneshot::channel();
        let (got_eof, eof_seen) = oneshot::channel();
        tokio::spawn(async move {
            let (mut stream, _) = local.accept().await.unwrap();
            let mut buf = [0u8; 2];
            stream.read_exact(&mut buf).await.unwrap();
            let _ = got_request.send(());
            let mut rest = Vec::new();
            let _ = stream.read_to_end(&mut rest).await;
            let _ = got_eof.send(());
        });

        start_agent(relay.control, local_addr, 1);
        wait_for_idle(&relay.pool, 1).await;

        let mut caller = TcpStream::connect(relay.public).await.unwrap();
        caller.write_all(b"hi").await.unwrap();
        timeout(Duration::from_secs(5), request_seen)
            .await
            .unwrap()
            .unwrap();

        drop(caller);
        timeout(Duration::from_secs(5), eof_seen)
            .await
            .expect("local connection outlived the caller")
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_policy_holds_caller_until_agent_arrives() {
        let relay = start_relay(PairingPolicy::Wait(Duration::from_secs(5))).await;
        let local = start_echo_once().await;

        let mut caller = TcpStream::connect(relay.public).await.unwrap();
        caller.write_all(b"early").await.unwrap();

        sleep(Duration::from_millis(200)).await;
        start_agent(relay.control, local, 1);

        assert_eq!(read_all(&mut caller).await, b"early");
    }

    #[tokio::test]
    async fn test_shutdown_closes_idle_tunnels() {
        let relay = start_relay(PairingPolicy::FailFast).await;

        let mut agent = TcpStream::connect(relay.control).await.unwrap();
        wait_for_idle(&relay.pool, 1).await;

        relay.stop.send(()).unwrap();

        let mut buf = Vec::new();
        timeout(Duration::from_secs(5), agent.read_to_end(&mut buf))
            .await
            .expect("idle tunnel survived shutdown")
            .unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_bind_failure_names_endpoint() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut settings = relay_settings(PairingPolicy::FailFast);
        settings.public_addr = taken.local_addr().unwrap().to_string();

        match RelayServer::bind(settings).await {
            Err(WarrenError::Bind { role, .. }) => assert_eq!(role, "public"),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("bound an address already in use"),
        }
    }
}
