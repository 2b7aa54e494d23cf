//! Duplex relay
//!
//! Copies bytes both ways between the client and remote streams. The relay
//! ends as soon as either direction ends; both write sides are then shut
//! down so the peer's pending read is released instead of lingering
//! half-open.

use pin_project_lite::pin_project;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

pin_project! {
    /// Stream wrapper recording the last activity time and bytes read
    struct TimedStream<S> {
        #[pin]
        inner: S,
        start_time: Instant,
        // Milliseconds since `start_time`
        last_activity: Arc<AtomicU64>,
        read_bytes: Arc<AtomicU64>,
    }
}

impl<S> TimedStream<S> {
    fn new(
        inner: S,
        start_time: Instant,
        last_activity: Arc<AtomicU64>,
        read_bytes: Arc<AtomicU64>,
    ) -> Self {
        Self {
            inner,
            start_time,
            last_activity,
            read_bytes,
        }
    }
}

fn elapsed_millis(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

impl<S: AsyncRead> AsyncRead for TimedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before_len = buf.filled().len();
        let result = this.inner.poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let bytes_read = buf.filled().len() - before_len;
            if bytes_read > 0 {
                this.last_activity
                    .store(elapsed_millis(*this.start_time), Ordering::Release);
                this.read_bytes
                    .fetch_add(bytes_read as u64, Ordering::Relaxed);
            }
        }
        result
    }
}

impl<S: AsyncWrite> AsyncWrite for TimedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        let result = this.inner.poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            if *n > 0 {
                this.last_activity
                    .store(elapsed_millis(*this.start_time), Ordering::Release);
            }
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

/// Copy direction, seen from the client side of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToRemote,
    RemoteToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToRemote => write!(f, "client->remote"),
            Direction::RemoteToClient => write!(f, "remote->client"),
        }
    }
}

/// What terminated the relay
#[derive(Debug)]
pub enum RelayEnd {
    /// The reading side of `Direction` reached EOF
    Eof(Direction),
    /// Reading or writing in `Direction` failed
    Error(Direction, io::Error),
    /// No bytes moved in either direction for the idle timeout
    IdleTimeout,
}

/// Result of a finished relay
#[derive(Debug)]
pub struct RelayOutcome {
    pub end: RelayEnd,
    /// Bytes read from the client
    pub client_to_remote: u64,
    /// Bytes read from the remote
    pub remote_to_client: u64,
}

/// Relay `client` and `remote` until either direction terminates.
///
/// With `idle_timeout` set, the relay also ends after that long without
/// traffic. Both write halves are shut down before returning; the streams
/// themselves close when the halves drop.
pub async fn relay<A, B>(client: A, remote: B, idle_timeout: Option<Duration>) -> RelayOutcome
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let start_time = Instant::now();
    let last_activity = Arc::new(AtomicU64::new(0));
    let up = Arc::new(AtomicU64::new(0));
    let down = Arc::new(AtomicU64::new(0));

    let client = TimedStream::new(client, start_time, Arc::clone(&last_activity), Arc::clone(&up));
    let remote = TimedStream::new(remote, start_time, Arc::clone(&last_activity), Arc::clone(&down));

    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut remote_rd, mut remote_wr) = tokio::io::split(remote);

    let end = {
        let upstream = copy_one_way(&mut client_rd, &mut remote_wr, Direction::ClientToRemote);
        let downstream = copy_one_way(&mut remote_rd, &mut client_wr, Direction::RemoteToClient);
        let idle = idle_watch(idle_timeout, start_time, &last_activity);

        tokio::select! {
            end = upstream => end,
            end = downstream => end,
            _ = idle => RelayEnd::IdleTimeout,
        }
    };

    let _ = client_wr.shutdown().await;
    let _ = remote_wr.shutdown().await;

    RelayOutcome {
        end,
        client_to_remote: up.load(Ordering::Relaxed),
        remote_to_client: down.load(Ordering::Relaxed),
    }
}

async fn copy_one_way<R, W>(reader: &mut R, writer: &mut W, direction: Direction) -> RelayEnd
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match tokio::io::copy(reader, writer).await {
        Ok(_) => RelayEnd::Eof(direction),
        Err(e) => RelayEnd::Error(direction, e),
    }
}

/// Resolves once nothing has moved for `timeout`; never resolves without one
async fn idle_watch(timeout: Option<Duration>, start_time: Instant, last_activity: &AtomicU64) {
    let Some(timeout) = timeout else {
        return std::future::pending().await;
    };
    let limit = timeout.as_millis() as u64;
    let period = (timeout / 2).clamp(Duration::from_millis(10), Duration::from_secs(30));

    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        interval.tick().await;
        let last_active = last_activity.load(Ordering::Acquire);
        let idle = elapsed_millis(start_time).saturating_sub(last_active);
        if idle >= limit {
            return;
        }
    }
}
