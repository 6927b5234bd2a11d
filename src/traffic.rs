//! Bidirectional byte pump shared by the relay, the agent and the forwarder.
//!
//! [`relay`] copies A→B and B→A on two tasks and returns as soon as either
//! direction hits EOF or an error. Both streams are dropped before it returns,
//! which tears down whichever direction was still running.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, trace};

const COPY_BUFFER_SIZE: usize = 8192;

/// Which way bytes flow through a relayed pair.
///
/// `Request` is A→B (caller towards the service), `Response` is B→A.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Request => write!(f, "request"),
            Direction::Response => write!(f, "response"),
        }
    }
}

/// Per-direction byte counts for one session, for logging only
#[derive(Debug, Clone, Default)]
pub struct ByteCounters {
    request: Arc<AtomicU64>,
    response: Arc<AtomicU64>,
}

impl ByteCounters {
    fn slot(&self, direction: Direction) -> &AtomicU64 {
        match direction {
            Direction::Request => &self.request,
            Direction::Response => &self.response,
        }
    }

    pub fn request(&self) -> u64 {
        self.request.load(Ordering::Relaxed)
    }

    pub fn response(&self) -> u64 {
        self.response.load(Ordering::Relaxed)
    }
}

/// Outcome of a finished relay
#[derive(Debug)]
pub struct RelayReport {
    /// Direction whose completion ended the session
    pub first_finished: Direction,
    /// Error that ended it, `None` for a clean EOF
    pub error: Option<io::Error>,
    pub request_bytes: u64,
    pub response_bytes: u64,
}

type Completion = (Direction, io::Result<()>);

/// Relay bytes between `a` and `b` until either direction completes.
pub async fn relay<A, B>(a: A, b: B) -> RelayReport
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let counters = ByteCounters::default();
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    // Room for both completions so the losing task never blocks on send
    let (done_tx, mut done_rx) = mpsc::channel::<Completion>(2);

    let request_task = tokio::spawn(pump(
        a_read,
        b_write,
        Direction::Request,
        counters.clone(),
        done_tx.clone(),
    ));
    let response_task = tokio::spawn(pump(
        b_read,
        a_write,
        Direction::Response,
        counters.clone(),
        done_tx,
    ));

    let (first_finished, result) = done_rx.recv().await.unwrap_or_else(|| {
        (
            Direction::Request,
            Err(io::Error::other("relay task exited without reporting")),
        )
    });

    // Dropping the halves held by the tasks closes both streams
    request_task.abort();
    response_task.abort();
    let _ = request_task.await;
    let _ = response_task.await;

    debug!(
        first = %first_finished,
        request_bytes = counters.request(),
        response_bytes = counters.response(),
        "relay finished"
    );

    RelayReport {
        first_finished,
        error: result.err(),
        request_bytes: counters.request(),
        response_bytes: counters.response(),
    }
}

async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    direction: Direction,
    counters: ByteCounters,
    done: mpsc::Sender<Completion>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let result = copy_counted(&mut reader, &mut writer, direction, counters.slot(direction)).await;
    let _ = done.send((direction, result)).await;
}

async fn copy_counted<R, W>(
    reader: &mut R,
    writer: &mut W,
    direction: Direction,
    counter: &AtomicU64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            writer.flush().await?;
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
        trace!(%direction, bytes = n, "forwarded chunk");
    }
}
