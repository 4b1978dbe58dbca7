//! Addressing primitives shared by every routing stage.
//!
//! A flow's endpoints are either a literal socket address or a hostname that
//! has not been resolved yet:
//!
//! ```
//! # use switchyard::model::{Address, Network};
//! let addr: Address = "example.com:443".parse().unwrap();
//! assert!(addr.is_domain());
//! assert_eq!(addr.port(), 443);
//! assert_eq!(Network::Tcp.to_string(), "tcp");
//! ```
use std::fmt;
pub use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use serde::*;

/// Transport kind of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Tcp,
    Udp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Udp => write!(f, "udp"),
        }
    }
}

impl Network {
    pub const ALL: [Network; 2] = [Network::Tcp, Network::Udp];

    /// Upper-case name used in route-time error messages.
    pub fn upper(&self) -> &'static str {
        match self {
            Network::Tcp => "TCP",
            Network::Udp => "UDP",
        }
    }
}

/// ip address or hostname, and port
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Address {
    IpAddr(IpAddr, u16),
    Domain(String, u16),
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Address::*;
        match self {
            IpAddr(addr @ std::net::IpAddr::V6(_), port) => write!(f, "[{}]:{}", addr, port),
            IpAddr(addr, port) => write!(f, "{}:{}", addr, port),
            Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

impl Address {
    /// Builds an address from a host part that may be an ip literal.
    pub fn from_host(host: &str, port: u16) -> Self {
        let trimmed = host.trim_start_matches('[').trim_end_matches(']');
        match trimmed.parse::<IpAddr>() {
            Ok(ip) => Address::IpAddr(ip, port),
            Err(_) => Address::Domain(normalize_domain(host), port),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Address::IpAddr(_, port) => *port,
            Address::Domain(_, port) => *port,
        }
    }

    pub fn with_port(&self, port: u16) -> Self {
        match self {
            Address::IpAddr(addr, _) => Address::IpAddr(*addr, port),
            Address::Domain(host, _) => Address::Domain(host.clone(), port),
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Address::IpAddr(addr, _) => Some(*addr),
            Address::Domain(..) => None,
        }
    }

    pub fn domain(&self) -> Option<&str> {
        match self {
            Address::IpAddr(..) => None,
            Address::Domain(host, _) => Some(host),
        }
    }

    pub fn is_ip(&self) -> bool {
        matches!(self, Address::IpAddr(..))
    }

    pub fn is_domain(&self) -> bool {
        matches!(self, Address::Domain(..))
    }

    pub fn is_ipv4(&self) -> bool {
        matches!(self, Address::IpAddr(IpAddr::V4(_), _))
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self, Address::IpAddr(IpAddr::V6(_), _))
    }

    /// 0.0.0.0 / :: destinations are produced by inbounds that could not
    /// recover the original destination.
    pub fn is_unspecified(&self) -> bool {
        match self {
            Address::IpAddr(addr, _) => addr.is_unspecified(),
            Address::Domain(host, _) => host.is_empty(),
        }
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.ip().map(|ip| SocketAddr::new(ip, self.port()))
    }

    /// host part without port
    pub fn host(&self) -> String {
        match self {
            Address::IpAddr(addr, _) => addr.to_string(),
            Address::Domain(host, _) => host.clone(),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::IpAddr(addr.ip(), addr.port())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressParseError(String);

impl fmt::Display for AddressParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "invalid address: {}", self.0)
    }
}

impl std::error::Error for AddressParseError {}

impl FromStr for Address {
    type Err = AddressParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(addr.into());
        }
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| AddressParseError(s.to_owned()))?;
        let port = port.parse().map_err(|_| AddressParseError(s.to_owned()))?;
        if host.is_empty() || host.contains(':') {
            return Err(AddressParseError(s.to_owned()));
        }
        Ok(Address::from_host(host, port))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// lower-case, no trailing root label
pub fn normalize_domain(domain: &str) -> String {
    domain.trim_end_matches('.').to_ascii_lowercase()
}

// Domain labels can include letter, digit and hyphen
// See https://tools.ietf.org/html/rfc1035#section-2.3.1
pub fn is_domain_name(domain: &str) -> bool {
    let domain = domain.trim_end_matches('.');
    if domain.is_empty() || domain.len() > 253 || domain.parse::<IpAddr>().is_ok() {
        return false;
    }
    domain.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_address() {
        assert_eq!(
            "192.168.0.1:80".parse::<Address>().unwrap(),
            Address::IpAddr("192.168.0.1".parse().unwrap(), 80)
        );
        assert_eq!(
            "[::1]:53".parse::<Address>().unwrap(),
            Address::IpAddr("::1".parse().unwrap(), 53)
        );
        assert_eq!(
            "Example.COM.:443".parse::<Address>().unwrap(),
            Address::Domain("example.com".into(), 443)
        );
        assert!("example.com".parse::<Address>().is_err());
        assert!("example.com:http".parse::<Address>().is_err());
    }

    #[test]
    fn display_brackets_ipv6() {
        let addr = Address::IpAddr("2001:db8::1".parse().unwrap(), 443);
        assert_eq!(addr.to_string(), "[2001:db8::1]:443");
        assert_eq!(addr.to_string().parse::<Address>().unwrap(), addr);
    }

    #[test]
    fn domain_names() {
        assert!(is_domain_name("example.com"));
        assert!(is_domain_name("a-b.example.com."));
        assert!(!is_domain_name("1.1.1.1"));
        assert!(!is_domain_name("-bad.example.com"));
        assert!(!is_domain_name(""));
    }

    #[test]
    fn unspecified() {
        assert!("0.0.0.0:0".parse::<Address>().unwrap().is_unspecified());
        assert!(!"1.0.0.1:0".parse::<Address>().unwrap().is_unspecified());
    }
}
