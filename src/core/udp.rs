//! UDP forwarding session
//!
//! One inbound socket, one connected outbound socket, one direction.
//! Every datagram from any sender goes to the single remote; replies from
//! the remote are never read.

use super::endpoint::{Endpoint, Protocol};
use super::stats::ForwardStats;
use crate::config::ForwardConfig;
use crate::error::{is_transient_io, FwdError, Result};
use crate::logger::log;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

pub struct UdpForwarder {
    inbound: UdpSocket,
    outbound: UdpSocket,
    local_addr: SocketAddr,
    remote: SocketAddr,
    buffer_size: usize,
    stats: Arc<ForwardStats>,
}

impl UdpForwarder {
    /// Resolve addresses, bind the inbound socket and connect the outbound one.
    ///
    /// The outbound socket binds `cli_addr` when configured.
    pub async fn bind(config: &ForwardConfig) -> Result<Self> {
        let from = Endpoint::resolve(Protocol::Udp, &config.from).await?;
        let to = Endpoint::resolve(Protocol::Udp, &config.to).await?;
        let outbound_local = match config.cli_addr {
            Some(ref cli_addr) => {
                Endpoint::resolve_for_peer(Protocol::Udp, cli_addr, &to.addr).await?.addr
            }
            None => unspecified_for(&to.addr),
        };

        log::debug!(from = %from.host, to = %to.host, remote = %to.addr, "Resolved endpoints");

        let inbound = UdpSocket::bind(from.addr)
            .await
            .map_err(|source| FwdError::Bind { addr: from.addr, source })?;
        let local_addr = inbound.local_addr()?;

        let outbound = UdpSocket::bind(outbound_local)
            .await
            .map_err(|source| FwdError::Bind { addr: outbound_local, source })?;
        outbound
            .connect(to.addr)
            .await
            .map_err(|source| FwdError::Dial { remote: to.addr, source })?;

        Ok(Self {
            inbound,
            outbound,
            local_addr,
            remote: to.addr,
            buffer_size: config.udp_buffer_size,
            stats: Arc::new(ForwardStats::new()),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Source address the remote sees
    pub fn outbound_local_addr(&self) -> Result<SocketAddr> {
        Ok(self.outbound.local_addr()?)
    }

    pub fn stats(&self) -> Arc<ForwardStats> {
        Arc::clone(&self.stats)
    }

    /// Forward datagrams until `shutdown` fires or a non-transient error.
    ///
    /// Datagrams longer than the buffer are forwarded truncated to the
    /// buffer size and counted. Both sockets close on return.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        // One spare byte tells an exact fit apart from a truncated datagram
        let mut buf = vec![0u8; self.buffer_size + 1];

        loop {
            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                received = self.inbound.recv_from(&mut buf) => received,
            };

            let (n, src) = match received {
                Ok(v) => v,
                Err(e) if is_transient_io(&e) => {
                    log::warn!(error = %e, "UDP receive failed, continuing");
                    continue;
                }
                Err(e) => {
                    log::error!(error = %e, "UDP receive failed");
                    return Err(FwdError::Udp(e));
                }
            };

            let truncated = n > self.buffer_size;
            let len = n.min(self.buffer_size);

            match self.outbound.send(&buf[..len]).await {
                Ok(_) => {
                    log::trace!(src = %src, bytes = len, "Datagram forwarded");
                    log::datagram(len, truncated);
                    self.stats.record_datagram(len, truncated);
                }
                Err(e) if is_transient_io(&e) => {
                    // Typically ICMP port unreachable from an earlier send
                    log::warn!(src = %src, remote = %self.remote, error = %e, "UDP send failed, datagram dropped");
                }
                Err(e) => {
                    log::error!(remote = %self.remote, error = %e, "UDP send failed");
                    return Err(FwdError::Udp(e));
                }
            }
        }

        let stats = self.stats.snapshot();
        log::info!(
            address = %self.local_addr,
            datagrams = stats.datagrams,
            truncated = stats.datagrams_truncated,
            bytes = stats.bytes_up,
            "UDP session stopped"
        );
        Ok(())
    }
}

fn unspecified_for(peer: &SocketAddr) -> SocketAddr {
    let ip = if peer.is_ipv4() {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    };
    SocketAddr::new(ip, 0)
}
