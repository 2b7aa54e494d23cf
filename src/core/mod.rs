//! Forwarding core
//!
//! - Endpoint resolution
//! - Outbound dialer with timeout and source binding
//! - Duplex relay
//! - TCP listener and UDP session
//! - Shutdown coordination

mod dialer;
mod endpoint;
mod listener;
mod relay;
mod shutdown;
mod stats;
mod udp;

pub use dialer::{dial, Dialer};
pub use endpoint::{Endpoint, Protocol};
pub use listener::TcpForwarder;
pub use relay::{relay, Direction, RelayEnd, RelayOutcome};
pub use shutdown::Shutdown;
pub use stats::{ForwardStats, StatsSnapshot};
pub use udp::UdpForwarder;
