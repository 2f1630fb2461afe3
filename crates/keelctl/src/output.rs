//! Output formatting for CLI commands.
//!
//! Supports text (human-readable) and JSON output formats.

use std::io::Write;

use keel_tunnel::{TunnelConfiguration, TunnelState};
use serde::Serialize;

/// Output format options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    /// Human-readable text.
    #[default]
    Text,
    /// JSON for scripting.
    Json,
}

impl Format {
    /// Picks JSON when `json` is set.
    #[must_use]
    pub const fn from_flag(json: bool) -> Self {
        if json { Self::Json } else { Self::Text }
    }

    /// Writes `value` in this format.
    pub fn write<W, T>(self, writer: &mut W, value: &T) -> anyhow::Result<()>
    where
        W: Write,
        T: Serialize + TextDisplay,
    {
        match self {
            Self::Json => {
                serde_json::to_writer_pretty(&mut *writer, value)?;
                writeln!(writer)?;
            }
            Self::Text => value.write_text(writer)?,
        }
        Ok(())
    }
}

/// Types that can be printed for humans.
pub trait TextDisplay {
    /// Writes the value as text.
    fn write_text<W: Write>(&self, writer: &mut W) -> std::io::Result<()>;
}

/// Tunnel status as printed by `keelctl status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    /// Interface name.
    pub tunnel: String,
    /// Current state.
    pub status: TunnelState,
}

impl TextDisplay for StatusReport {
    fn write_text<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writeln!(writer, "{}: {}", self.tunnel, self.status)
    }
}

/// Peer line of a [`ConfigSummary`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerSummary {
    /// Peer public key, base64.
    pub public_key: String,
    /// Peer endpoint.
    pub endpoint: String,
    /// Routed prefixes.
    pub allowed_ips: Vec<String>,
    /// Keepalive interval, 0 when off.
    pub persistent_keepalive: u16,
    /// Whether a preshared key is configured.
    pub preshared_key: bool,
}

/// Redacted view of a configuration, printed by `keelctl check`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigSummary {
    /// Interface public key, base64.
    pub public_key: String,
    /// Interface address.
    pub address: String,
    /// DNS servers.
    pub dns: Vec<String>,
    /// Peers.
    pub peers: Vec<PeerSummary>,
}

impl From<&TunnelConfiguration> for ConfigSummary {
    fn from(config: &TunnelConfiguration) -> Self {
        Self {
            public_key: config.public_key().to_base64(),
            address: config.local_address().to_string(),
            dns: config.dns_servers().iter().map(ToString::to_string).collect(),
            peers: config
                .peers()
                .iter()
                .map(|peer| PeerSummary {
                    public_key: peer.public_key().to_base64(),
                    endpoint: peer.endpoint().to_string(),
                    allowed_ips: peer.allowed_ips().iter().map(ToString::to_string).collect(),
                    persistent_keepalive: peer.persistent_keepalive(),
                    preshared_key: peer.preshared_key().is_some(),
                })
                .collect(),
        }
    }
}

impl TextDisplay for ConfigSummary {
    fn write_text<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writeln!(writer, "interface")?;
        writeln!(writer, "  public key:  {}", self.public_key)?;
        writeln!(writer, "  address:     {}", self.address)?;
        if !self.dns.is_empty() {
            writeln!(writer, "  dns:         {}", self.dns.join(", "))?;
        }
        for peer in &self.peers {
            writeln!(writer)?;
            writeln!(writer, "peer {}", peer.public_key)?;
            writeln!(writer, "  endpoint:    {}", peer.endpoint)?;
            writeln!(writer, "  allowed ips: {}", peer.allowed_ips.join(", "))?;
            if peer.persistent_keepalive > 0 {
                writeln!(writer, "  keepalive:   every {} seconds", peer.persistent_keepalive)?;
            }
            if peer.preshared_key {
                writeln!(writer, "  preshared key: (hidden)")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_text() {
        let report = StatusReport {
            tunnel: "keel0".into(),
            status: TunnelState::Error("handshake failed".into()),
        };
        let mut buf = Vec::new();
        Format::Text.write(&mut buf, &report).expect("write");
        assert_eq!(String::from_utf8(buf).expect("utf8"), "keel0: error: handshake failed\n");
    }

    #[test]
    fn status_json() {
        let report = StatusReport {
            tunnel: "keel0".into(),
            status: TunnelState::Up,
        };
        let mut buf = Vec::new();
        Format::from_flag(true).write(&mut buf, &report).expect("write");
        let value: serde_json::Value = serde_json::from_slice(&buf).expect("json");
        assert_eq!(value["tunnel"], "keel0");
        assert_eq!(value["status"]["state"], "up");
    }
}
