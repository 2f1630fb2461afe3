//! wg-quick configuration file rendering and parsing.
//!
//! Handles the INI-style format read by `wg-quick`. Parsing only collects raw
//! values; all validation goes through [`TunnelConfiguration::build`] so a
//! parsed file obeys exactly the same invariants as any other configuration.

use std::fmt::Write as FmtWrite;

use crate::config::{ConfigFields, PeerFields, TunnelConfiguration};
use crate::error::{Result, TunnelError};

/// Renders a configuration in wg-quick format.
///
/// The output contains the private key. Write it only to files the backend
/// owns, with restrictive permissions.
#[must_use]
pub fn render(config: &TunnelConfiguration) -> String {
    let mut output = String::new();

    output.push_str("[Interface]\n");
    let _ = writeln!(output, "PrivateKey = {}", config.private_key().to_base64());
    let _ = writeln!(output, "Address = {}", config.local_address());

    if !config.dns_servers().is_empty() {
        let dns: Vec<String> = config.dns_servers().iter().map(ToString::to_string).collect();
        let _ = writeln!(output, "DNS = {}", dns.join(", "));
    }

    for peer in config.peers() {
        output.push_str("\n[Peer]\n");
        let _ = writeln!(output, "PublicKey = {}", peer.public_key().to_base64());

        if let Some(psk) = peer.preshared_key() {
            let _ = writeln!(output, "PresharedKey = {}", psk.to_base64());
        }

        let ips: Vec<String> = peer.allowed_ips().iter().map(ToString::to_string).collect();
        let _ = writeln!(output, "AllowedIPs = {}", ips.join(", "));
        let _ = writeln!(output, "Endpoint = {}", peer.endpoint());

        if peer.persistent_keepalive() > 0 {
            let _ = writeln!(output, "PersistentKeepalive = {}", peer.persistent_keepalive());
        }
    }

    output
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Interface,
    Peer,
}

fn parse_error(line: usize, message: impl Into<String>) -> TunnelError {
    TunnelError::Parse {
        line,
        message: message.into(),
    }
}

fn split_list(value: &str) -> impl Iterator<Item = String> + '_ {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

/// Parses a wg-quick configuration file.
///
/// # Errors
///
/// Returns [`TunnelError::Parse`] for syntax problems and
/// [`TunnelError::InvalidField`] for values that fail validation.
pub fn parse(input: &str) -> Result<TunnelConfiguration> {
    let mut section = Section::None;
    let mut seen_interface = false;
    let mut fields = ConfigFields::default();
    let mut addresses: Vec<String> = Vec::new();

    for (index, raw) in input.lines().enumerate() {
        let line_number = index + 1;
        let line = raw.split('#').next().unwrap_or_default().trim();

        if line.is_empty() {
            continue;
        }

        if line.starts_with('[') && line.ends_with(']') {
            let name = &line[1..line.len() - 1];
            section = match name.trim() {
                "Interface" => {
                    if seen_interface {
                        return Err(parse_error(line_number, "duplicate [Interface] section"));
                    }
                    seen_interface = true;
                    Section::Interface
                }
                "Peer" => {
                    fields.peers.push(PeerFields::default());
                    Section::Peer
                }
                other => {
                    return Err(parse_error(line_number, format!("unknown section: {other}")));
                }
            };
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            return Err(parse_error(line_number, format!("invalid line format: {line}")));
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();

        match section {
            Section::None => {
                return Err(parse_error(line_number, "key-value pair outside of section"));
            }
            Section::Interface => match key.as_str() {
                "privatekey" => fields.private_key = value.to_string(),
                "address" => addresses.extend(split_list(value)),
                "dns" => fields.dns_servers.extend(split_list(value)),
                _ => {}
            },
            Section::Peer => {
                let Some(peer) = fields.peers.last_mut() else {
                    return Err(parse_error(line_number, "peer value outside of [Peer]"));
                };
                parse_peer_key(peer, &key, value, line_number)?;
            }
        }
    }

    if !seen_interface {
        return Err(parse_error(0, "missing [Interface] section"));
    }

    match addresses.len() {
        0 => return Err(TunnelError::field("local_address", "missing Address in [Interface]")),
        1 => fields.local_address = addresses.remove(0),
        n => {
            return Err(TunnelError::field(
                "local_address",
                format!("exactly one Address is supported, found {n}"),
            ));
        }
    }

    TunnelConfiguration::build(fields)
}

fn parse_peer_key(peer: &mut PeerFields, key: &str, value: &str, line_number: usize) -> Result<()> {
    match key {
        "publickey" => peer.public_key = value.to_string(),
        "presharedkey" => peer.preshared_key = Some(value.to_string()),
        "allowedips" => peer.allowed_ips.extend(split_list(value)),
        "endpoint" => peer.endpoint = value.to_string(),
        "persistentkeepalive" => {
            peer.persistent_keepalive = if value.eq_ignore_ascii_case("off") {
                0
            } else {
                value.parse().map_err(|_| {
                    parse_error(line_number, format!("invalid PersistentKeepalive: {value}"))
                })?
            };
        }
        _ => {}
    }
    Ok(())
}
