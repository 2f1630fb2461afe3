//! Tunnel state types.
//!
//! [`TunnelState`] is what observers see. [`LinkState`] is the narrower
//! vocabulary a backend understands: it can be asked to bring the link up or
//! down and it reports whether the link is up or down.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Observable state of the tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum TunnelState {
    /// No tunnel is established.
    #[default]
    Down,
    /// The backend is bringing the tunnel up.
    Connecting,
    /// The tunnel is established.
    Up,
    /// The backend is tearing the tunnel down.
    Disconnecting,
    /// The last transition failed.
    Error(String),
}

impl TunnelState {
    /// True while a backend transition is in flight.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Connecting | Self::Disconnecting)
    }

    /// True when a connect command would start a transition.
    #[must_use]
    pub const fn can_connect(&self) -> bool {
        matches!(self, Self::Down | Self::Error(_))
    }

    /// The failure reason, if any.
    #[must_use]
    pub fn error_reason(&self) -> Option<&str> {
        match self {
            Self::Error(reason) => Some(reason),
            _ => None,
        }
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Down => write!(f, "down"),
            Self::Connecting => write!(f, "connecting"),
            Self::Up => write!(f, "up"),
            Self::Disconnecting => write!(f, "disconnecting"),
            Self::Error(reason) => write!(f, "error: {reason}"),
        }
    }
}

/// Link state as requested from or reported by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    /// Link is (or should be) up.
    Up,
    /// Link is (or should be) down.
    Down,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
        }
    }
}

impl From<LinkState> for TunnelState {
    fn from(link: LinkState) -> Self {
        match link {
            LinkState::Up => Self::Up,
            LinkState::Down => Self::Down,
        }
    }
}

/// Translates a report pushed by the backend into the next tunnel state.
///
/// Returns `None` when the report does not change the observable state:
/// intermediate reports during a transition (the outcome of the in-flight
/// `apply` settles those), a `Down` while in `Error` (the reason stays
/// visible for a retry), and reports equal to the current state.
#[must_use]
pub fn fold_report(current: &TunnelState, reported: LinkState) -> Option<TunnelState> {
    match (current, reported) {
        (TunnelState::Connecting, LinkState::Up) => Some(TunnelState::Up),
        (TunnelState::Disconnecting, LinkState::Down) => Some(TunnelState::Down),
        (TunnelState::Connecting | TunnelState::Disconnecting, _) => None,
        (TunnelState::Up, LinkState::Down) => Some(TunnelState::Down),
        (TunnelState::Down | TunnelState::Error(_), LinkState::Up) => Some(TunnelState::Up),
        (TunnelState::Error(_), LinkState::Down) => None,
        (TunnelState::Up, LinkState::Up) | (TunnelState::Down, LinkState::Down) => None,
    }
}

/// What kind of OS authorization a backend needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionKind {
    /// A user-facing VPN consent dialog.
    VpnConsent,
    /// The `CAP_NET_ADMIN` capability (or root).
    NetAdmin,
}

/// An OS-level authorization artifact that must be granted before a virtual
/// interface can be created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PermissionRequest {
    /// Kind of authorization.
    pub kind: PermissionKind,
    /// Human-readable explanation for the prompt.
    pub rationale: String,
}

impl PermissionRequest {
    /// Creates a new permission request.
    #[must_use]
    pub fn new(kind: PermissionKind, rationale: impl Into<String>) -> Self {
        Self {
            kind,
            rationale: rationale.into(),
        }
    }
}

/// Manager-side record of the permission protocol.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PermissionStatus {
    /// Not asked yet.
    #[default]
    Unknown,
    /// A request was surfaced and awaits `on_permission_result`.
    Pending(PermissionRequest),
    /// Granted; cached for the manager's lifetime.
    Granted,
    /// The last request was refused.
    Denied,
}
