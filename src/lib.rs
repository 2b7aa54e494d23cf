//! TCP/UDP port-forwarding relay
//!
//! Layout:
//! - `core/`: forwarding engine (dialer, relay, TCP listener, UDP session, shutdown)
//! - `config`: CLI arguments, config file and validated [`ForwardConfig`]
//! - `server_runner`: `start`/`stop` lifecycle around the core
//! - `logger`: tracing setup

pub mod config;
pub mod core;
pub mod error;
pub mod logger;
pub mod server_runner;
pub mod sysinfo;

pub use config::ForwardConfig;
pub use crate::core::{Protocol, Shutdown};
pub use error::{FwdError, Result};
pub use server_runner::{start, start_with_shutdown, ForwarderHandle};
