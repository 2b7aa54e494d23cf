//! Endpoint resolution
//!
//! Turns `host:port` strings into socket addresses once, at startup.

use crate::error::{FwdError, Result};

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

const DNS_RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Transport protocol of a forwarding run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// A resolved `(protocol, host, port)` triple
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub protocol: Protocol,
    /// Host as written by the user, brackets stripped
    pub host: String,
    pub addr: SocketAddr,
}

impl Endpoint {
    /// Resolve `host:port`, taking the first address returned.
    ///
    /// An empty host (`:8000`) resolves to the IPv4 unspecified address.
    pub async fn resolve(protocol: Protocol, target: &str) -> Result<Self> {
        Self::resolve_inner(protocol, target, None).await
    }

    /// Resolve `host:port`, preferring an address of the same family as
    /// `peer`. Used for client-bind addresses so the bound socket can reach
    /// the remote.
    pub async fn resolve_for_peer(protocol: Protocol, target: &str, peer: &SocketAddr) -> Result<Self> {
        Self::resolve_inner(protocol, target, Some(peer.is_ipv4())).await
    }

    async fn resolve_inner(protocol: Protocol, target: &str, want_ipv4: Option<bool>) -> Result<Self> {
        let (host, port) = split_host_port(target)?;

        if host.is_empty() {
            let ip = match want_ipv4 {
                Some(false) => IpAddr::from(std::net::Ipv6Addr::UNSPECIFIED),
                _ => IpAddr::from(Ipv4Addr::UNSPECIFIED),
            };
            return Ok(Self {
                protocol,
                host: String::new(),
                addr: SocketAddr::new(ip, port),
            });
        }

        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(Self {
                protocol,
                host: host.to_string(),
                addr: SocketAddr::new(ip, port),
            });
        }

        let addrs: Vec<SocketAddr> = tokio::time::timeout(
            DNS_RESOLVE_TIMEOUT,
            tokio::net::lookup_host((host, port)),
        )
        .await
        .map_err(|_| FwdError::Resolve {
            addr: target.to_string(),
            reason: format!("DNS resolution timeout after {}s", DNS_RESOLVE_TIMEOUT.as_secs()),
        })?
        .map_err(|e| FwdError::Resolve {
            addr: target.to_string(),
            reason: e.to_string(),
        })?
        .collect();

        let chosen = want_ipv4
            .and_then(|v4| addrs.iter().find(|a| a.is_ipv4() == v4))
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| FwdError::Resolve {
                addr: target.to_string(),
                reason: "no addresses found".to_string(),
            })?;

        Ok(Self {
            protocol,
            host: host.to_string(),
            addr: chosen,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}

/// Split `host:port` / `[v6]:port` into host and numeric port
fn split_host_port(target: &str) -> Result<(&str, u16)> {
    let (host, port) = target.rsplit_once(':').ok_or_else(|| FwdError::Resolve {
        addr: target.to_string(),
        reason: "missing port".to_string(),
    })?;
    let port = port.parse::<u16>().map_err(|_| FwdError::Resolve {
        addr: target.to_string(),
        reason: format!("invalid port '{}'", port),
    })?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    Ok((host, port))
}
