//! Forwarder startup and lifecycle
//!
//! `start` performs all setup (resolution, bind) before returning, then runs
//! the forwarding loop in the background. The returned handle stops it
//! without waiting for in-flight relays; `drain` waits for them as well.

use crate::config::ForwardConfig;
use crate::core::{ForwardStats, Protocol, Shutdown, TcpForwarder, UdpForwarder};
use crate::error::{FwdError, Result};
use crate::logger::log;

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// A bound forwarder of either protocol
pub enum Forwarder {
    Tcp(TcpForwarder),
    Udp(UdpForwarder),
}

impl Forwarder {
    /// Validate the config, resolve addresses and bind sockets
    pub async fn bind(config: &ForwardConfig) -> Result<Self> {
        config.validate()?;
        match config.protocol {
            Protocol::Tcp => Ok(Forwarder::Tcp(TcpForwarder::bind(config).await?)),
            Protocol::Udp => Ok(Forwarder::Udp(UdpForwarder::bind(config).await?)),
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            Forwarder::Tcp(_) => Protocol::Tcp,
            Forwarder::Udp(_) => Protocol::Udp,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        match self {
            Forwarder::Tcp(f) => f.local_addr(),
            Forwarder::Udp(f) => f.local_addr(),
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        match self {
            Forwarder::Tcp(f) => f.remote_addr(),
            Forwarder::Udp(f) => f.remote_addr(),
        }
    }

    pub fn stats(&self) -> Arc<ForwardStats> {
        match self {
            Forwarder::Tcp(f) => f.stats(),
            Forwarder::Udp(f) => f.stats(),
        }
    }

    /// Relay tasks of this forwarder. UDP has none, so its tracker is
    /// closed and empty from the start.
    pub fn sessions(&self) -> TaskTracker {
        match self {
            Forwarder::Tcp(f) => f.sessions(),
            Forwarder::Udp(_) => {
                let sessions = TaskTracker::new();
                sessions.close();
                sessions
            }
        }
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        match self {
            Forwarder::Tcp(f) => f.run(shutdown).await,
            Forwarder::Udp(f) => f.run(shutdown).await,
        }
    }
}

/// Handle to a running forwarder
pub struct ForwarderHandle {
    protocol: Protocol,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    stats: Arc<ForwardStats>,
    shutdown: Shutdown,
    sessions: TaskTracker,
    task: JoinHandle<Result<()>>,
}

impl ForwarderHandle {
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Actual bound address (useful with port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn stats(&self) -> Arc<ForwardStats> {
        Arc::clone(&self.stats)
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Request a stop; returns immediately
    pub fn stop(&self) {
        self.shutdown.trigger();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Tracker that completes once the loop has ended and every relay it
    /// started has finished
    pub fn sessions(&self) -> TaskTracker {
        self.sessions.clone()
    }

    /// Relays still running
    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Wait for the forwarding loop to end. Relays may still be running.
    pub async fn wait(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| FwdError::Task(e.to_string()))?
    }

    /// Wait for the forwarding loop, then for every relay still running
    pub async fn drain(self) -> Result<()> {
        let sessions = self.sessions.clone();
        let result = self.wait().await;
        sessions.wait().await;
        result
    }
}

/// Start forwarding with a fresh shutdown coordinator
pub async fn start(config: ForwardConfig) -> Result<ForwarderHandle> {
    start_with_shutdown(config, Shutdown::new()).await
}

/// Start forwarding, stopping when `shutdown` is triggered.
///
/// Setup errors are returned here; the loop's own outcome comes from
/// [`ForwarderHandle::wait`].
pub async fn start_with_shutdown(
    config: ForwardConfig,
    shutdown: Shutdown,
) -> Result<ForwarderHandle> {
    let forwarder = Forwarder::bind(&config).await?;
    let protocol = forwarder.protocol();
    let local_addr = forwarder.local_addr();
    let remote_addr = forwarder.remote_addr();
    let stats = forwarder.stats();
    let sessions = forwarder.sessions();

    log::info!(
        "Forwarding {} traffic from '{}' to '{}'",
        protocol,
        local_addr,
        remote_addr
    );
    log::info!(
        protocol = %protocol,
        cli_addr = ?config.cli_addr,
        conn_timeout_secs = config.conn_timeout.as_secs(),
        max_connections = config.max_connections,
        "<CTRL+C> to exit"
    );

    let task = tokio::spawn(forwarder.run(shutdown.token()));

    Ok(ForwarderHandle {
        protocol,
        local_addr,
        remote_addr,
        stats,
        shutdown,
        sessions,
        task,
    })
}
