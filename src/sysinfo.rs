//! Host information for the `--list` and `--build` flags

use std::net::{IpAddr, Ipv4Addr};

/// IPv4 addresses of all local interfaces, loopback included.
/// Candidates for `cli_addr`.
pub fn local_ipv4_addrs() -> std::io::Result<Vec<Ipv4Addr>> {
    let mut addrs: Vec<Ipv4Addr> = get_if_addrs::get_if_addrs()?
        .into_iter()
        .filter_map(|iface| match iface.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
        .collect();
    addrs.sort();
    addrs.dedup();
    Ok(addrs)
}

/// One-line build description
pub fn build_info() -> String {
    format!(
        "{} {} built for {}/{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}
