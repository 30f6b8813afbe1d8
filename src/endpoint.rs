//! Address and endpoint value types.
//!
//! [`IpAddress`] wraps a v4 or v6 address, [`Endpoint`] pairs an address with
//! a port. Both are plain values owned by the caller; sockets accept and
//! return them by value everywhere.

use std::fmt;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use crate::error::Error;

/// An IPv4 or IPv6 address.
///
/// Constructed from a numeric string or obtained via [`IpAddress::resolve`].
/// Equality is octet-wise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IpAddress(IpAddr);

impl IpAddress {
    /// Loopback address of the given family's v4 form (`127.0.0.1`).
    pub const LOCALHOST: IpAddress = IpAddress(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));

    /// The unspecified v4 address (`0.0.0.0`), used for wildcard binds.
    pub const UNSPECIFIED: IpAddress = IpAddress(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));

    /// Whether this is a 4-octet address.
    pub fn is_ipv4(&self) -> bool {
        self.0.is_ipv4()
    }

    /// Whether this is a 16-octet address.
    pub fn is_ipv6(&self) -> bool {
        self.0.is_ipv6()
    }

    /// Resolve a hostname into its addresses.
    ///
    /// Performs a blocking DNS lookup on the calling thread. Returns an empty
    /// list on failure; the resolver's returned ordering is preserved.
    pub fn resolve(hostname: &str) -> Vec<IpAddress> {
        match (hostname, 0u16).to_socket_addrs() {
            Ok(addrs) => addrs.map(|a| IpAddress(a.ip())).collect(),
            Err(e) => {
                tracing::error!(hostname, error = %e, "name resolution failed");
                Vec::new()
            }
        }
    }
}

impl FromStr for IpAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        s.parse::<IpAddr>()
            .map(IpAddress)
            .map_err(|_| Error::InvalidAddress { input: s.into() })
    }
}

impl From<IpAddr> for IpAddress {
    fn from(addr: IpAddr) -> Self {
        IpAddress(addr)
    }
}

impl From<IpAddress> for IpAddr {
    fn from(addr: IpAddress) -> Self {
        addr.0
    }
}

impl fmt::Display for IpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An (address, port) pair identifying one end of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    address: IpAddress,
    port: u16,
}

impl Endpoint {
    /// Create an endpoint from an address and port.
    pub fn new(address: IpAddress, port: u16) -> Self {
        Endpoint { address, port }
    }

    /// The address half.
    pub fn address(&self) -> IpAddress {
        self.address
    }

    /// The port half.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Endpoint {
            address: IpAddress(addr.ip()),
            port: addr.port(),
        }
    }
}

impl From<Endpoint> for SocketAddr {
    fn from(endpoint: Endpoint) -> Self {
        SocketAddr::new(endpoint.address.0, endpoint.port)
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        s.parse::<SocketAddr>()
            .map(Endpoint::from)
            .map_err(|_| Error::InvalidAddress { input: s.into() })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        SocketAddr::from(*self).fmt(f)
    }
}
