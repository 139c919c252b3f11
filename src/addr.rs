//! Node identity: an IPv4 address plus the port the node listens on.
//!
//! Peers address one another by the port they accept connections on, not
//! by whatever ephemeral source port a TCP stream happens to carry, so a
//! [`NodeAddress`] is the identity used as the key of every peer table.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs, UdpSocket};
use std::str::FromStr;

use thiserror::Error;

/// Failure to turn a textual `host:port` into a [`NodeAddress`].
#[derive(Debug, Error)]
pub enum AddressError {
    #[error("address `{0}` is missing a `:port` suffix")]
    MissingPort(String),
    #[error("invalid port in `{0}`")]
    InvalidPort(String),
    #[error("host `{0}` did not resolve to an IPv4 address")]
    NoIpv4(String),
    #[error("failed to resolve `{0}`: {1}")]
    Resolve(String, std::io::Error),
}

/// Identity of a node on the overlay: `(ipv4, listening port)`.
///
/// Equality and hashing use both fields. The textual form is
/// `a.b.c.d:port` and round-trips through [`FromStr`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeAddress {
    ip: Ipv4Addr,
    port: u16,
}

impl NodeAddress {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Resolve `host:port` into a node address.
    ///
    /// The host may be a dotted quad or a DNS name; resolution keeps the
    /// first IPv4 result. A host that resolves only to loopback is
    /// replaced with this machine's primary non-loopback IPv4 when one
    /// exists, so that the address other peers learn for us is reachable
    /// from outside this host.
    pub fn resolve(text: &str) -> Result<Self, AddressError> {
        let (host, port_text) = text
            .rsplit_once(':')
            .ok_or_else(|| AddressError::MissingPort(text.to_string()))?;
        let port: u16 = port_text
            .parse()
            .map_err(|_| AddressError::InvalidPort(text.to_string()))?;

        let mut ip = resolve_ipv4(host, port)?;
        if ip.is_loopback() {
            if let Some(primary) = primary_local_ipv4() {
                ip = primary;
            }
        }
        Ok(Self { ip, port })
    }

    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }

    /// Parse `a.b.c.d:port` without touching the resolver; used for
    /// addresses carried inside protocol payloads, which are always
    /// dotted quads.
    pub(crate) fn parse_literal(text: &str) -> Option<Self> {
        let (host, port) = text.rsplit_once(':')?;
        Some(Self {
            ip: host.parse().ok()?,
            port: port.parse().ok()?,
        })
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl fmt::Debug for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl FromStr for NodeAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::resolve(s)
    }
}

fn resolve_ipv4(host: &str, port: u16) -> Result<Ipv4Addr, AddressError> {
    // Fast path for dotted quads; ToSocketAddrs would hit the resolver.
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(ip);
    }
    let candidates = (host, port)
        .to_socket_addrs()
        .map_err(|e| AddressError::Resolve(host.to_string(), e))?;
    for addr in candidates {
        if let IpAddr::V4(ip) = addr.ip() {
            return Ok(ip);
        }
    }
    Err(AddressError::NoIpv4(host.to_string()))
}

/// Primary non-loopback IPv4 of this machine, if it has one.
///
/// Opens a UDP socket and "connects" it toward a routable address; no
/// packet is sent, but the kernel picks the outgoing interface, whose
/// address is then readable from `local_addr`.
pub(crate) fn primary_local_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect(("8.8.8.8", 53)).ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_loopback() => Some(ip),
        _ => None,
    }
}

/// Every IPv4 this host answers on, for self-send detection.
pub(crate) fn local_ipv4s() -> Vec<Ipv4Addr> {
    let mut addrs = vec![Ipv4Addr::LOCALHOST];
    if let Some(primary) = primary_local_ipv4() {
        if !addrs.contains(&primary) {
            addrs.push(primary);
        }
    }
    addrs
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn display_round_trips_through_parse() {
        let addr = NodeAddress::new(Ipv4Addr::new(10, 1, 2, 3), 5001);
        assert_eq!(addr.to_string(), "10.1.2.3:5001");
        let parsed: NodeAddress = "10.1.2.3:5001".parse().unwrap();
        assert_eq!(parsed, addr);
    }

    #[test]
    fn equality_and_hash_use_both_fields() {
        let a = NodeAddress::new(Ipv4Addr::new(10, 0, 0, 1), 5000);
        let b = NodeAddress::new(Ipv4Addr::new(10, 0, 0, 1), 5001);
        let c = NodeAddress::new(Ipv4Addr::new(10, 0, 0, 2), 5000);
        assert_ne!(a, b);
        assert_ne!(a, c);

        let set: HashSet<NodeAddress> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn missing_port_is_rejected() {
        assert!(matches!(
            NodeAddress::resolve("10.0.0.1"),
            Err(AddressError::MissingPort(_))
        ));
    }

    #[test]
    fn bad_port_is_rejected() {
        assert!(matches!(
            NodeAddress::resolve("10.0.0.1:notaport"),
            Err(AddressError::InvalidPort(_))
        ));
        assert!(matches!(
            NodeAddress::resolve("10.0.0.1:70000"),
            Err(AddressError::InvalidPort(_))
        ));
    }

    #[test]
    fn local_set_always_contains_loopback() {
        assert!(local_ipv4s().contains(&Ipv4Addr::LOCALHOST));
    }
}
