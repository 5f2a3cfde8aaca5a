//! Network address helpers

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::error::ConfigError;

/// Resolve a front-end host specifier to a bind address.
///
/// A name matching a local interface yields the interface's first IPv4
/// address, `*` yields the unspecified address, and anything else falls
/// back to loopback.
pub fn get_ip(iface: &str) -> IpAddr {
    if iface == "*" {
        return IpAddr::V4(Ipv4Addr::UNSPECIFIED);
    }
    if let Ok(addrs) = if_addrs::get_if_addrs() {
        for addr in addrs {
            if addr.name == iface {
                if let IpAddr::V4(v4) = addr.ip() {
                    return IpAddr::V4(v4);
                }
            }
        }
    }
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

/// Build a socket address from an IP string and a port, validating the
/// port range.
pub fn parse_tcp_addr(addr: &str, port: u32) -> Result<SocketAddr, ConfigError> {
    if port == 0 || port > 65535 {
        return Err(ConfigError::PortOutOfRange(port));
    }
    let ip: IpAddr = addr
        .parse()
        .map_err(|_| ConfigError::BadAddress(addr.to_string()))?;
    Ok(SocketAddr::new(ip, port as u16))
}
