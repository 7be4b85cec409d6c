//! Endpoint keys and decoding of caller-supplied socket addresses.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use libc::{sockaddr, socklen_t, AF_INET, AF_INET6};

/// Host or port component matching anything.
pub const WILDCARD: &str = "*";

/// Normalized `host:port` rule key. Either component may be [`WILDCARD`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EndpointKey(String);

impl EndpointKey {
    pub fn new(host: &str, port: &str) -> Self {
        EndpointKey(format!("{host}:{port}"))
    }

    /// True if a concrete address could ever produce this key.
    ///
    /// Hosts must be `*` or a canonical dotted quad, ports `*` or a decimal
    /// number without leading zeros, because lookups format candidates the
    /// same way.
    pub fn is_matchable(&self) -> bool {
        let Some((host, port)) = self.0.rsplit_once(':') else {
            return false;
        };
        let host_ok = host == WILDCARD || host.parse::<Ipv4Addr>().is_ok();
        let port_ok = port == WILDCARD
            || port
                .parse::<u16>()
                .is_ok_and(|p| p.to_string() == port);
        host_ok && port_ok
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A concrete destination extracted from a socket address.
///
/// `host` is `None` for destinations without an IPv4 form (plain IPv6),
/// which can only match host-wildcard rules.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub host: Option<Ipv4Addr>,
    pub port: u16,
}

impl Endpoint {
    pub fn v4(host: Ipv4Addr, port: u16) -> Self {
        Endpoint {
            host: Some(host),
            port,
        }
    }

    /// Candidate keys in lookup precedence order: exact, any host,
    /// any port, catch-all.
    pub fn candidates(&self) -> Vec<EndpointKey> {
        let port = self.port.to_string();
        match self.host {
            Some(host) => {
                let host = host.to_string();
                vec![
                    EndpointKey::new(&host, &port),
                    EndpointKey::new(WILDCARD, &port),
                    EndpointKey::new(&host, WILDCARD),
                    EndpointKey::new(WILDCARD, WILDCARD),
                ]
            }
            None => vec![
                EndpointKey::new(WILDCARD, &port),
                EndpointKey::new(WILDCARD, WILDCARD),
            ],
        }
    }
}

impl From<SocketAddrV4> for Endpoint {
    fn from(addr: SocketAddrV4) -> Self {
        Endpoint::v4(*addr.ip(), addr.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.host {
            Some(host) => write!(f, "{}:{}", host, self.port),
            None => write!(f, "[v6]:{}", self.port),
        }
    }
}

/// Decode an `AF_INET` address. Anything else, or a buffer shorter than
/// `sockaddr_in`, yields `None`.
///
/// # Safety
/// `addr` must be null or point to at least `addrlen` readable bytes.
pub unsafe fn ipv4_from_sockaddr(
    addr: *const sockaddr,
    addrlen: socklen_t,
) -> Option<SocketAddrV4> {
    if addr.is_null() || (addrlen as usize) < std::mem::size_of::<libc::sockaddr_in>() {
        return None;
    }
    if (*addr).sa_family as i32 != AF_INET {
        return None;
    }
    let sin = std::ptr::read_unaligned(addr as *const libc::sockaddr_in);
    let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
    Some(SocketAddrV4::new(ip, u16::from_be(sin.sin_port)))
}

/// Decode an `AF_INET` or `AF_INET6` destination for connect-side lookup.
///
/// # Safety
/// `addr` must be null or point to at least `addrlen` readable bytes.
pub unsafe fn endpoint_from_sockaddr(
    addr: *const sockaddr,
    addrlen: socklen_t,
) -> Option<Endpoint> {
    if let Some(v4) = ipv4_from_sockaddr(addr, addrlen) {
        return Some(v4.into());
    }
    if addr.is_null()
        || (addrlen as usize) < std::mem::size_of::<libc::sockaddr_in6>()
        || (*addr).sa_family as i32 != AF_INET6
    {
        return None;
    }
    let sin6 = std::ptr::read_unaligned(addr as *const libc::sockaddr_in6);
    let ip = std::net::Ipv6Addr::from(sin6.sin6_addr.s6_addr);
    Some(Endpoint {
        host: ip.to_ipv4_mapped(),
        port: u16::from_be(sin6.sin6_port),
    })
}
