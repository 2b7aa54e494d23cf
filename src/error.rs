use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Unified error type for the forwarder
#[derive(Error, Debug)]
pub enum FwdError {
    /// Missing or malformed configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// Address could not be resolved
    #[error("Failed to resolve '{addr}': {reason}")]
    Resolve { addr: String, reason: String },

    /// Local socket could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Outbound connection failed
    #[error("Failed to connect to {remote}: {source}")]
    Dial {
        remote: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Outbound connection did not complete in time
    #[error("Connection to {remote} timed out after {}s", .timeout.as_secs())]
    DialTimeout { remote: SocketAddr, timeout: Duration },

    /// Listener accept failed
    #[error("Accept error: {0}")]
    Accept(#[source] io::Error),

    /// UDP read or write failed
    #[error("UDP error: {0}")]
    Udp(#[source] io::Error),

    /// Background forwarding task panicked or was aborted
    #[error("Forwarding task failed: {0}")]
    Task(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, FwdError>;

/// IO error kinds that affect a single connection or datagram only
pub fn is_transient_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

/// Out of file descriptors or buffers; worth a short back-off and retry
pub fn is_resource_exhausted(err: &io::Error) -> bool {
    #[cfg(unix)]
    {
        // EMFILE, ENFILE, ENOMEM
        const CODES: [i32; 3] = [24, 23, 12];
        if let Some(code) = err.raw_os_error() {
            return CODES.contains(&code);
        }
    }
    err.kind() == io::ErrorKind::OutOfMemory
}
