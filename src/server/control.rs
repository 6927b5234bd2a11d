use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::error::Result;

use super::pool::TunnelPool;

/// An agent connection waiting in the pool to be paired
#[derive(Debug)]
pub struct PooledTunnel {
    pub stream: TcpStream,
    pub agent: SocketAddr,
    pub pooled_at: Instant,
}

/// Accepts agent connections and deposits each one as an idle tunnel.
///
/// Pushing waits while the pool is full, so a backed-up pool stops this
/// loop from accepting more agents until a tunnel is claimed.
pub struct ControlAcceptor<P> {
    listener: TcpListener,
    pool: Arc<P>,
}

impl<P> ControlAcceptor<P>
where
    P: TunnelPool<Tunnel = PooledTunnel>,
{
    pub fn new(listener: TcpListener, pool: Arc<P>) -> Self {
        Self { listener, pool }
    }

    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, agent) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("Control listener failed: {}", e);
                    return Err(e.into());
                }
            };

            let tunnel = PooledTunnel {
                stream,
                agent,
                pooled_at: Instant::now(),
            };
            if self.pool.push(tunnel).await.is_err() {
                info!("Tunnel pool closed, control acceptor stopping");
                return Ok(());
            }
            debug!(%agent, idle = self.pool.len(), "Tunnel pooled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::WaitingPool;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    async fn wait_for_len(pool: &WaitingPool<PooledTunnel>, expected: usize) {
        timeout(Duration::from_secs(5), async {
            while pool.len() != expected {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("pool never reached expected size");
    }

    #[tokio::test]
    async fn test_every_agent_connection_is_pooled() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let pool = Arc::new(WaitingPool::new(10));
        tokio::spawn(ControlAcceptor::new(listener, pool.clone()).run());

        let mut agents = Vec::new();
        for _ in 0..3 {
            agents.push(TcpStream::connect(addr).await.unwrap());
        }
        wait_for_len(&pool, 3).await;

        let first = pool.try_pop().unwrap();
        assert_eq!(first.stream.peer_addr().unwrap().port(), first.agent.port());
    }

    #[tokio::test]
    async fn test_full_pool_holds_back_new_agents() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let pool = Arc::new(WaitingPool::new(2));
        tokio::spawn(ControlAcceptor::new(listener, pool.clone()).run());

        let mut agents = Vec::new();
        for _ in 0..3 {
            agents.push(TcpStream::connect(addr).await.unwrap());
        }
        wait_for_len(&pool, 2).await;
        sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.len(), 2);

        // Claiming one frees room for the third
        let _claimed = pool.try_pop().unwrap();
        wait_for_len(&pool, 2).await;
    }

    #[tokio::test]
    async fn test_stops_when_pool_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let pool = Arc::new(WaitingPool::new(4));
        pool.close();
        let acceptor = tokio::spawn(ControlAcceptor::new(listener, pool.clone()).run());

        let _agent = TcpStream::connect(addr).await.unwrap();
        let result = timeout(Duration::from_secs(5), acceptor)
            .await
            .expect("acceptor kept running")
            .unwrap();
        assert!(result.is_ok());
    }
}
