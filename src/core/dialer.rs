//! Outbound dialer
//!
//! Opens the remote side of a session, optionally from a fixed local
//! address, bounded by a connect timeout. Never retries.

use crate::error::{FwdError, Result};

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};

/// Outbound TCP connector
#[derive(Debug, Clone)]
pub struct Dialer {
    local_addr: Option<SocketAddr>,
    timeout: Duration,
    nodelay: bool,
}

impl Dialer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            local_addr: None,
            timeout,
            nodelay: true,
        }
    }

    /// Bind outbound sockets to `local` before connecting
    pub fn with_local_addr(mut self, local: Option<SocketAddr>) -> Self {
        self.local_addr = local;
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Connect to `remote`. On error no socket is left open.
    pub async fn dial(&self, remote: SocketAddr) -> Result<TcpStream> {
        let socket = if remote.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(|source| FwdError::Dial { remote, source })?;

        if let Some(local) = self.local_addr {
            // Fixed source ports would otherwise sit in TIME_WAIT between sessions
            socket
                .set_reuseaddr(true)
                .map_err(|source| FwdError::Dial { remote, source })?;
            socket
                .bind(local)
                .map_err(|source| FwdError::Bind { addr: local, source })?;
        }

        match tokio::time::timeout(self.timeout, socket.connect(remote)).await {
            Ok(Ok(stream)) => {
                if self.nodelay {
                    let _ = stream.set_nodelay(true);
                }
                Ok(stream)
            }
            Ok(Err(source)) => Err(FwdError::Dial { remote, source }),
            Err(_) => Err(FwdError::DialTimeout {
                remote,
                timeout: self.timeout,
            }),
        }
    }
}

/// One-shot form of [`Dialer::dial`]
pub async fn dial(
    local: Option<SocketAddr>,
    remote: SocketAddr,
    timeout: Duration,
) -> Result<TcpStream> {
    Dialer::new(timeout).with_local_addr(local).dial(remote).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_dial_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote = listener.local_addr().unwrap();

        let stream = dial(None, remote, Duration::from_secs(3)).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap(), remote);
        assert!(stream.nodelay().unwrap());

        let (_, peer) = listener.accept().await.unwrap();
        assert_eq!(peer, stream.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_dial_refused() {
        // Grab a free port and release it so nothing listens there
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote = listener.local_addr().unwrap();
        drop(listener);

        let err = dial(None, remote, Duration::from_secs(3)).await.unwrap_err();
        match err {
            FwdError::Dial { remote: r, source } => {
                assert_eq!(r, remote);
                assert_eq!(source.kind(), std::io::ErrorKind::ConnectionRefused);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_dial_binds_local_addr() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote = listener.local_addr().unwrap();

        let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let local = reserved.local_addr().unwrap();
        drop(reserved);

        let dialer = Dialer::new(Duration::from_secs(3)).with_local_addr(Some(local));
        assert_eq!(dialer.local_addr(), Some(local));
        let stream = dialer.dial(remote).await.unwrap();
        assert_eq!(stream.local_addr().unwrap(), local);

        let (_, peer) = listener.accept().await.unwrap();
        assert_eq!(peer, local);
    }

    #[tokio::test]
    async fn test_dial_unbindable_local_addr() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote = listener.local_addr().unwrap();

        // TEST-NET-1 is never assigned to a local interface
        let local: SocketAddr = "192.0.2.1:0".parse().unwrap();
        let err = dial(Some(local), remote, Duration::from_secs(3)).await.unwrap_err();
        assert!(matches!(err, FwdError::Bind { addr, .. } if addr == local));
    }

    #[tokio::test]
    async fn test_dial_honours_timeout() {
        // Backlog 0 and never accepting: once the accept queue is full the
        // kernel drops further SYNs and connects hang
        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )
        .unwrap();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        socket.bind(&addr.into()).unwrap();
        socket.listen(0).unwrap();
        let remote = socket.local_addr().unwrap().as_socket().unwrap();

        let mut queued = Vec::new();
        for _ in 0..4 {
            let attempt =
                tokio::time::timeout(Duration::from_millis(200), TcpStream::connect(remote)).await;
            if let Ok(Ok(stream)) = attempt {
                queued.push(stream);
            }
        }

        let timeout = Duration::from_millis(300);
        let started = std::time::Instant::now();
        let err = dial(None, remote, timeout).await.unwrap_err();
        let elapsed = started.elapsed();

        assert!(
            matches!(err, FwdError::DialTimeout { remote: r, timeout: t } if r == remote && t == timeout),
            "unexpected error: {err}"
        );
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout * 3);
    }

    #[test]
    fn test_dialer_defaults() {
        let dialer = Dialer::new(Duration::from_secs(3));
        assert!(dialer.local_addr().is_none());
        assert!(dialer.nodelay);
    }
}
