//! Tunnel configuration model.
//!
//! A [`TunnelConfiguration`] is immutable once built and always valid: every
//! address parses, every key is 32 bytes and there is at least one peer. The
//! only ways to obtain one are [`TunnelConfiguration::build`] (raw fields, as
//! a provisioning collaborator supplies them) and
//! [`TunnelConfigurationBuilder`] (already-typed values).

use std::net::IpAddr;

use crate::error::{Result, TunnelError};
use crate::keys::{PresharedKey, PrivateKey, PublicKey};
use crate::types::{Cidr, Endpoint};

/// Largest keepalive interval `WireGuard` can express (16-bit field).
pub const MAX_KEEPALIVE_SECS: i64 = 65_535;

/// Raw configuration fields, unvalidated.
#[derive(Clone, Default)]
pub struct ConfigFields {
    /// Interface address in CIDR notation.
    pub local_address: String,
    /// Interface private key, base64.
    pub private_key: String,
    /// Resolver addresses, in order.
    pub dns_servers: Vec<String>,
    /// Remote peers, in order.
    pub peers: Vec<PeerFields>,
}

/// Raw peer fields, unvalidated.
#[derive(Clone, Debug, Default)]
pub struct PeerFields {
    /// Peer public key, base64.
    pub public_key: String,
    /// Optional preshared key, base64.
    pub preshared_key: Option<String>,
    /// `host:port` of the peer.
    pub endpoint: String,
    /// Prefixes routed to this peer.
    pub allowed_ips: Vec<String>,
    /// Keepalive interval in seconds, 0 disables it.
    pub persistent_keepalive: i64,
}

impl std::fmt::Debug for ConfigFields {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigFields")
            .field("local_address", &self.local_address)
            .field("private_key", &"[REDACTED]")
            .field("dns_servers", &self.dns_servers)
            .field("peers", &self.peers)
            .finish()
    }
}

/// Configuration of one remote peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerConfiguration {
    public_key: PublicKey,
    preshared_key: Option<PresharedKey>,
    endpoint: Endpoint,
    allowed_ips: Vec<Cidr>,
    persistent_keepalive: u16,
}

impl PeerConfiguration {
    /// The peer's public key.
    #[must_use]
    pub const fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// The optional preshared key.
    #[must_use]
    pub const fn preshared_key(&self) -> Option<&PresharedKey> {
        self.preshared_key.as_ref()
    }

    /// The peer endpoint.
    #[must_use]
    pub const fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Prefixes this peer may route.
    #[must_use]
    pub fn allowed_ips(&self) -> &[Cidr] {
        &self.allowed_ips
    }

    /// Keepalive interval in seconds; 0 means disabled.
    #[must_use]
    pub const fn persistent_keepalive(&self) -> u16 {
        self.persistent_keepalive
    }

    /// Whether this peer captures all traffic of its address family.
    #[must_use]
    pub fn routes_everything(&self) -> bool {
        self.allowed_ips.iter().any(Cidr::is_default_route)
    }
}

/// Full configuration of the tunnel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TunnelConfiguration {
    local_address: Cidr,
    private_key: PrivateKey,
    dns_servers: Vec<IpAddr>,
    peers: Vec<PeerConfiguration>,
}

impl TunnelConfiguration {
    /// Validates raw fields and builds a configuration.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::InvalidField`] naming the first invalid field.
    pub fn build(fields: ConfigFields) -> Result<Self> {
        let local_address = parse_cidr("local_address", &fields.local_address)?;
        let private_key = PrivateKey::from_base64(&fields.private_key)
            .map_err(|e| TunnelError::field("private_key", e.to_string()))?;

        let dns_servers = fields
            .dns_servers
            .iter()
            .enumerate()
            .map(|(i, server)| {
                server.trim().parse::<IpAddr>().map_err(|_| {
                    TunnelError::field(
                        format!("dns_servers[{i}]"),
                        format!("'{server}' is not an IP address"),
                    )
                })
            })
            .collect::<Result<Vec<_>>>()?;

        if fields.peers.is_empty() {
            return Err(TunnelError::field("peers", "at least one peer is required"));
        }

        let peers = fields
            .peers
            .iter()
            .enumerate()
            .map(|(i, peer)| build_peer(i, peer))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            local_address,
            private_key,
            dns_servers,
            peers,
        })
    }

    /// Address assigned to the virtual interface.
    #[must_use]
    pub const fn local_address(&self) -> &Cidr {
        &self.local_address
    }

    /// The interface private key.
    #[must_use]
    pub const fn private_key(&self) -> &PrivateKey {
        &self.private_key
    }

    /// Public key derived from the interface private key.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        self.private_key.public_key()
    }

    /// DNS resolvers, in order.
    #[must_use]
    pub fn dns_servers(&self) -> &[IpAddr] {
        &self.dns_servers
    }

    /// Peers, in order. Never empty.
    #[must_use]
    pub fn peers(&self) -> &[PeerConfiguration] {
        &self.peers
    }
}

fn parse_cidr(field: &str, value: &str) -> Result<Cidr> {
    Cidr::from_cidr(value)
        .map_err(|_| TunnelError::field(field, format!("'{value}' is not a CIDR prefix")))
}

fn build_peer(index: usize, fields: &PeerFields) -> Result<PeerConfiguration> {
    let path = |name: &str| format!("peers[{index}].{name}");

    let public_key = PublicKey::from_base64(&fields.public_key)
        .map_err(|e| TunnelError::field(path("public_key"), e.to_string()))?;

    let preshared_key = fields
        .preshared_key
        .as_deref()
        .map(PresharedKey::from_base64)
        .transpose()
        .map_err(|e| TunnelError::field(path("preshared_key"), e.to_string()))?;

    let endpoint = fields.endpoint.parse::<Endpoint>().map_err(|e| match e {
        TunnelError::InvalidField { reason, .. } => TunnelError::field(path("endpoint"), reason),
        other => TunnelError::field(path("endpoint"), other.to_string()),
    })?;

    if fields.allowed_ips.is_empty() {
        return Err(TunnelError::field(path("allowed_ips"), "at least one prefix is required"));
    }
    let allowed_ips = fields
        .allowed_ips
        .iter()
        .enumerate()
        .map(|(j, ip)| parse_cidr(&format!("{}[{j}]", path("allowed_ips")), ip))
        .collect::<Result<Vec<_>>>()?;

    if !(0..=MAX_KEEPALIVE_SECS).contains(&fields.persistent_keepalive) {
        return Err(TunnelError::field(
            path("persistent_keepalive"),
            format!("{} is outside 0..={MAX_KEEPALIVE_SECS}", fields.persistent_keepalive),
        ));
    }

    Ok(PeerConfiguration {
        public_key,
        preshared_key,
        endpoint,
        allowed_ips,
        persistent_keepalive: fields.persistent_keepalive as u16,
    })
}

/// Builder for a [`TunnelConfiguration`] from typed values.
#[derive(Default)]
pub struct TunnelConfigurationBuilder {
    local_address: Option<Cidr>,
    private_key: Option<PrivateKey>,
    dns_servers: Vec<IpAddr>,
    peers: Vec<PeerConfiguration>,
}

impl TunnelConfigurationBuilder {
    /// Creates a new builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the interface address.
    #[must_use]
    pub fn local_address(mut self, address: Cidr) -> Self {
        self.local_address = Some(address);
        self
    }

    /// Sets the private key.
    #[must_use]
    pub fn private_key(mut self, key: PrivateKey) -> Self {
        self.private_key = Some(key);
        self
    }

    /// Adds a DNS server.
    #[must_use]
    pub fn dns(mut self, server: IpAddr) -> Self {
        self.dns_servers.push(server);
        self
    }

    /// Adds a peer.
    #[must_use]
    pub fn peer(mut self, peer: PeerConfiguration) -> Self {
        self.peers.push(peer);
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> Result<TunnelConfiguration> {
        let local_address = self
            .local_address
            .ok_or_else(|| TunnelError::field("local_address", "is required"))?;
        let private_key = self
            .private_key
            .ok_or_else(|| TunnelError::field("private_key", "is required"))?;
        if self.peers.is_empty() {
            return Err(TunnelError::field("peers", "at least one peer is required"));
        }

        Ok(TunnelConfiguration {
            local_address,
            private_key,
            dns_servers: self.dns_servers,
            peers: self.peers,
        })
    }
}

/// Builder for a [`PeerConfiguration`] from typed values.
#[derive(Default)]
pub struct PeerConfigurationBuilder {
    public_key: Option<PublicKey>,
    preshared_key: Option<PresharedKey>,
    endpoint: Option<Endpoint>,
    allowed_ips: Vec<Cidr>,
    persistent_keepalive: u16,
}

impl PeerConfigurationBuilder {
    /// Creates a new builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the public key.
    #[must_use]
    pub fn public_key(mut self, key: PublicKey) -> Self {
        self.public_key = Some(key);
        self
    }

    /// Sets the preshared key.
    #[must_use]
    pub fn preshared_key(mut self, key: PresharedKey) -> Self {
        self.preshared_key = Some(key);
        self
    }

    /// Sets the endpoint.
    #[must_use]
    pub fn endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Adds an allowed prefix.
    #[must_use]
    pub fn allowed_ip(mut self, prefix: Cidr) -> Self {
        self.allowed_ips.push(prefix);
        self
    }

    /// Sets the persistent keepalive interval.
    #[must_use]
    pub fn persistent_keepalive(mut self, seconds: u16) -> Self {
        self.persistent_keepalive = seconds;
        self
    }

    /// Builds the peer.
    pub fn build(self) -> Result<PeerConfiguration> {
        let public_key = self
            .public_key
            .ok_or_else(|| TunnelError::field("public_key", "is required"))?;
        let endpoint = self
            .endpoint
            .ok_or_else(|| TunnelError::field("endpoint", "is required"))?;
        if self.allowed_ips.is_empty() {
            return Err(TunnelError::field("allowed_ips", "at least one prefix is required"));
        }

        Ok(PeerConfiguration {
            public_key,
            preshared_key: self.preshared_key,
            endpoint,
            allowed_ips: self.allowed_ips,
            persistent_keepalive: self.persistent_keepalive,
        })
    }
}
