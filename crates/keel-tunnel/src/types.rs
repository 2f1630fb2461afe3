//! Core value types: tunnel identifiers, network prefixes and endpoints.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TunnelError};

/// Maximum interface name length on Linux (`IFNAMSIZ - 1`).
pub const MAX_TUNNEL_NAME_LEN: usize = 15;

/// Stable name of the tunnel. Doubles as the virtual interface name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TunnelId(String);

impl TunnelId {
    /// Creates a tunnel id after checking it is a usable interface name.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let reject = |reason: &str| TunnelError::InvalidTunnelName {
            name: name.clone(),
            reason: reason.to_string(),
        };

        if name.is_empty() {
            return Err(reject("name cannot be empty"));
        }
        if name.len() > MAX_TUNNEL_NAME_LEN {
            return Err(reject("name cannot exceed 15 characters"));
        }
        if name == "." || name == ".." {
            return Err(reject("name cannot be a path component"));
        }
        if let Some(c) = name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '=' | '+' | '.' | '-')))
        {
            return Err(reject(&format!("invalid character '{c}'")));
        }

        Ok(Self(name))
    }

    /// Returns the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TunnelId {
    type Err = TunnelError;
    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// A network prefix in CIDR notation (`10.100.0.2/24`, `::/0`).
///
/// Host bits are kept as written, so an interface address parses and formats
/// back to the same text.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cidr {
    network: IpNet,
}

impl Cidr {
    /// Creates a prefix from an `IpNet`.
    #[must_use]
    pub const fn new(network: IpNet) -> Self {
        Self { network }
    }

    /// Returns the network.
    #[must_use]
    pub const fn network(&self) -> &IpNet {
        &self.network
    }

    /// Returns the address part.
    #[must_use]
    pub fn addr(&self) -> IpAddr {
        self.network.addr()
    }

    /// Returns the prefix length.
    #[must_use]
    pub fn prefix_len(&self) -> u8 {
        self.network.prefix_len()
    }

    /// True for `0.0.0.0/0` and `::/0`.
    #[must_use]
    pub fn is_default_route(&self) -> bool {
        self.network.prefix_len() == 0
    }

    /// Parses CIDR notation. A bare address is rejected: the prefix length
    /// must be explicit.
    pub fn from_cidr(s: &str) -> Result<Self> {
        let network = s
            .trim()
            .parse::<IpNet>()
            .map_err(|e| TunnelError::field("cidr", format!("'{s}': {e}")))?;
        Ok(Self { network })
    }
}

impl FromStr for Cidr {
    type Err = TunnelError;
    fn from_str(s: &str) -> Result<Self> {
        Self::from_cidr(s)
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.network)
    }
}

/// Host part of an endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Host {
    /// Literal IP address.
    Ip(IpAddr),
    /// DNS name, resolved by the backend.
    Name(String),
}

/// A peer endpoint, `host:port`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: Host,
    port: u16,
}

impl Endpoint {
    /// Creates an endpoint from a socket address.
    #[must_use]
    pub fn new(address: SocketAddr) -> Self {
        Self {
            host: Host::Ip(address.ip()),
            port: address.port(),
        }
    }

    /// Returns the host.
    #[must_use]
    pub const fn host(&self) -> &Host {
        &self.host
    }

    /// Returns the port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Returns the socket address when the host is a literal IP.
    #[must_use]
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self.host {
            Host::Ip(ip) => Some(SocketAddr::new(ip, self.port)),
            Host::Name(_) => None,
        }
    }
}

fn is_valid_hostname(host: &str) -> bool {
    if host.is_empty() || host.len() > 253 {
        return false;
    }
    host.trim_end_matches('.').split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

impl FromStr for Endpoint {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = |reason: &str| TunnelError::field("endpoint", format!("'{s}': {reason}"));

        if let Ok(address) = s.parse::<SocketAddr>() {
            if address.port() == 0 {
                return Err(invalid("port cannot be 0"));
            }
            return Ok(Self::new(address));
        }

        let (host, port) = s.rsplit_once(':').ok_or_else(|| invalid("expected host:port"))?;
        let port: u16 = port.parse().map_err(|_| invalid("invalid port"))?;
        if port == 0 {
            return Err(invalid("port cannot be 0"));
        }
        if host.contains(':') || host.starts_with('[') {
            return Err(invalid("IPv6 addresses must be written as [addr]:port"));
        }
        if host.parse::<IpAddr>().is_ok() {
            // Covered by the SocketAddr parse above unless something odd slipped through.
            return Err(invalid("invalid address"));
        }
        if !is_valid_hostname(host) {
            return Err(invalid("invalid hostname"));
        }

        Ok(Self {
            host: Host::Name(host.to_ascii_lowercase()),
            port,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Host::Ip(IpAddr::V6(ip)) => write!(f, "[{ip}]:{}", self.port),
            Host::Ip(IpAddr::V4(ip)) => write!(f, "{ip}:{}", self.port),
            Host::Name(name) => write!(f, "{name}:{}", self.port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("keel0" ; "simple")]
    #[test_case("wg-home.1" ; "punctuation")]
    #[test_case("abcdefghijklmno" ; "fifteen chars")]
    fn tunnel_id_accepts(name: &str) {
        assert_eq!(TunnelId::new(name).expect("valid name").as_str(), name);
    }

    #[test_case("" ; "empty")]
    #[test_case("abcdefghijklmnop" ; "sixteen chars")]
    #[test_case("wg 0" ; "space")]
    #[test_case("wg/0" ; "slash")]
    #[test_case(".." ; "parent dir")]
    fn tunnel_id_rejects(name: &str) {
        assert!(matches!(
            TunnelId::new(name),
            Err(TunnelError::InvalidTunnelName { .. })
        ));
    }

    #[test_case("10.100.0.2/24")]
    #[test_case("0.0.0.0/0")]
    #[test_case("::/0")]
    #[test_case("fd00::2/64")]
    fn cidr_roundtrips(text: &str) {
        let cidr = Cidr::from_cidr(text).expect("valid cidr");
        assert_eq!(cidr.to_string(), text);
    }

    #[test_case("10.0.0.1" ; "missing prefix")]
    #[test_case("10.0.0.1/33" ; "prefix too long")]
    #[test_case("300.0.0.1/24" ; "bad octet")]
    #[test_case("" ; "empty")]
    fn cidr_rejects(text: &str) {
        assert!(Cidr::from_cidr(text).is_err());
    }

    #[test]
    fn cidr_default_route() {
        assert!(Cidr::from_cidr("0.0.0.0/0").expect("valid").is_default_route());
        assert!(!Cidr::from_cidr("10.0.0.0/8").expect("valid").is_default_route());
    }

    #[test_case("192.168.1.100:51820" ; "ipv4")]
    #[test_case("[2001:db8::1]:51820" ; "ipv6")]
    #[test_case("vpn.example.com:51820" ; "hostname")]
    fn endpoint_roundtrips(text: &str) {
        let endpoint: Endpoint = text.parse().expect("valid endpoint");
        assert_eq!(endpoint.to_string(), text);
        assert_eq!(endpoint.port(), 51820);
    }

    #[test_case("192.168.1.100" ; "missing port")]
    #[test_case("vpn.example.com:0" ; "zero port")]
    #[test_case("192.168.1.100:0" ; "zero port ipv4")]
    #[test_case("[2001:db8::1]:0" ; "zero port ipv6")]
    #[test_case("vpn.example.com:99999" ; "port overflow")]
    #[test_case("2001:db8::1:51820" ; "unbracketed ipv6")]
    #[test_case("-bad-.example:51820" ; "bad label")]
    #[test_case(":51820" ; "empty host")]
    fn endpoint_rejects(text: &str) {
        assert!(text.parse::<Endpoint>().is_err());
    }

    #[test]
    fn endpoint_socket_addr_only_for_literals() {
        let lit: Endpoint = "10.0.0.1:51820".parse().expect("valid");
        assert!(lit.socket_addr().is_some());
        let named: Endpoint = "vpn.example.com:51820".parse().expect("valid");
        assert_eq!(named.socket_addr(), None);
        assert_eq!(named.host(), &Host::Name("vpn.example.com".to_string()));
    }
}
