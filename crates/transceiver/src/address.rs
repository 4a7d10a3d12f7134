use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::{Error, Result};

/// The IP family of an [`Address`], or `Auto` to let [`Address::new`] try
/// IPv4 first and fall back to IPv6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Auto,
    V4,
    V6,
}

/// A socket endpoint: an IP family, an IP address, a port, and an optional
/// multicast interface.
///
/// `Address` is a value type — equality and presentation are based entirely
/// on its fields, and it is immutable once constructed except through the
/// explicit mutators ([`Address::set_port`], [`Address::set_multicast_interface`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    sockaddr: SocketAddr,
    multicast_iface: Option<IpAddr>,
}

impl Address {
    /// Parses `ip` (and `port`) into an address.
    ///
    /// `Family::Auto` tries IPv4 first, then IPv6; `Family::V4`/`Family::V6`
    /// require the string to parse as that family specifically.
    pub fn new(family: Family, ip: &str, port: u16) -> Result<Self> {
        let try_v4 = || ip.parse::<Ipv4Addr>().map(|v4| SocketAddr::from((v4, port)));
        let try_v6 = || ip.parse::<Ipv6Addr>().map(|v6| SocketAddr::from((v6, port)));

        let sockaddr = match family {
            Family::Auto => try_v4().or_else(|_| try_v6()),
            Family::V4 => try_v4(),
            Family::V6 => try_v6(),
        }
        .map_err(|_| Error::InvalidAddress(format!("{ip}:{port}")))?;

        Ok(Self {
            sockaddr,
            multicast_iface: None,
        })
    }

    /// Wraps an already-resolved [`SocketAddr`], e.g. one returned by
    /// `getsockname`/`getpeername` after a bind, connect or accept.
    pub fn from_socket_addr(sockaddr: SocketAddr) -> Self {
        Self {
            sockaddr,
            multicast_iface: None,
        }
    }

    pub fn to_socket_addr(self) -> SocketAddr {
        self.sockaddr
    }

    pub fn family(&self) -> Family {
        if self.sockaddr.is_ipv4() {
            Family::V4
        } else {
            Family::V6
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.sockaddr.ip()
    }

    pub fn port(&self) -> u16 {
        self.sockaddr.port()
    }

    /// Overwrites the port, e.g. after the OS assigns a concrete port for a
    /// bind that requested port 0.
    pub fn set_port(&mut self, port: u16) {
        self.sockaddr.set_port(port);
    }

    pub fn is_multicast(&self) -> bool {
        self.sockaddr.ip().is_multicast()
    }

    pub fn multicast_interface(&self) -> Option<IpAddr> {
        self.multicast_iface
    }

    /// Sets the local interface used to send to / join a multicast group.
    ///
    /// Fails if this address is not itself a multicast address, or if
    /// `iface` cannot be parsed as a member of `family` (or, for
    /// `Family::Auto`, as either family), or if the family that does parse
    /// does not match this address's own family.
    pub fn set_multicast_interface(&mut self, family: Family, iface: &str) -> Result<()> {
        if !self.is_multicast() {
            return Err(Error::NotMulticast(*self));
        }

        if matches!(family, Family::Auto | Family::V4) {
            if let Ok(v4) = iface.parse::<Ipv4Addr>() {
                if self.family() != Family::V4 {
                    return Err(Error::FamilyMismatch);
                }
                self.multicast_iface = Some(IpAddr::V4(v4));
                return Ok(());
            }
        }

        if matches!(family, Family::Auto | Family::V6) {
            if let Ok(v6) = iface.parse::<Ipv6Addr>() {
                if self.family() != Family::V6 {
                    return Err(Error::FamilyMismatch);
                }
                self.multicast_iface = Some(IpAddr::V6(v6));
                return Ok(());
            }
        }

        Err(Error::InvalidAddress(iface.to_string()))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sockaddr)
    }
}

impl From<SocketAddr> for Address {
    fn from(sockaddr: SocketAddr) -> Self {
        Self::from_socket_addr(sockaddr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_format_round_trip_v4() {
        let addr = Address::new(Family::Auto, "127.0.0.1", 4433).unwrap();
        assert_eq!(addr.family(), Family::V4);
        assert_eq!(addr.port(), 4433);
        assert_eq!(addr.to_string(), "127.0.0.1:4433");
    }

    #[test]
    fn parse_format_round_trip_v6() {
        let addr = Address::new(Family::Auto, "::1", 80).unwrap();
        assert_eq!(addr.family(), Family::V6);
        assert_eq!(addr.port(), 80);
        assert_eq!(addr.to_string(), "[::1]:80");
    }

    #[test]
    fn forcing_wrong_family_fails() {
        assert!(Address::new(Family::V6, "127.0.0.1", 0).is_err());
        assert!(Address::new(Family::V4, "::1", 0).is_err());
    }

    #[test]
    fn multicast_interface_round_trip() {
        let mut addr = Address::new(Family::Auto, "239.0.0.1", 9000).unwrap();
        assert!(addr.is_multicast());
        addr.set_multicast_interface(Family::Auto, "192.168.1.1")
            .unwrap();
        assert_eq!(
            addr.multicast_interface(),
            Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)))
        );
    }

    #[test]
    fn multicast_interface_rejected_on_unicast_address() {
        let mut addr = Address::new(Family::Auto, "127.0.0.1", 9000).unwrap();
        assert!(addr
            .set_multicast_interface(Family::Auto, "192.168.1.1")
            .is_err());
    }

    #[test]
    fn multicast_interface_family_mismatch_fails() {
        let mut addr = Address::new(Family::Auto, "239.0.0.1", 9000).unwrap();
        assert!(addr.set_multicast_interface(Family::V6, "::1").is_err());
    }

    #[test]
    fn set_port_overwrites_assigned_port() {
        let mut addr = Address::new(Family::Auto, "0.0.0.0", 0).unwrap();
        addr.set_port(5000);
        assert_eq!(addr.port(), 5000);
    }
}
