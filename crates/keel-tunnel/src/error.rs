//! Error types for tunnel configuration and lifecycle commands.
//!
//! Backend failures never surface here: the manager folds them into
//! [`TunnelState::Error`](crate::state::TunnelState::Error). What remains are
//! conditions the caller must act on.

use thiserror::Error;

/// Result type alias for tunnel operations.
pub type Result<T> = std::result::Result<T, TunnelError>;

/// Errors reported to callers of this crate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TunnelError {
    /// A configuration field failed validation.
    #[error("invalid {field}: {reason}")]
    InvalidField {
        /// Path of the offending field, e.g. `peers[0].endpoint`.
        field: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A wg-quick configuration file could not be parsed.
    #[error("parse error at line {line}: {message}")]
    Parse {
        /// 1-based line number (0 when the problem is not tied to a line).
        line: usize,
        /// Description of the problem.
        message: String,
    },

    /// Invalid key material.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Invalid key length.
    #[error("invalid key length: expected 32, got {0}")]
    InvalidKeyLength(usize),

    /// Invalid tunnel name.
    #[error("invalid tunnel name '{name}': {reason}")]
    InvalidTunnelName {
        /// The rejected name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The user or OS refused permission to create the virtual interface.
    #[error("permission to create the tunnel interface was denied")]
    PermissionDenied,

    /// Another command is running and the manager rejects instead of queueing.
    #[error("tunnel is busy with another transition")]
    Busy,

    /// A bare retry was requested but no configuration was ever supplied.
    #[error("no tunnel configuration has been supplied")]
    NoConfiguration,
}

impl TunnelError {
    /// Shorthand for an [`TunnelError::InvalidField`] error.
    pub(crate) fn field(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Returns the offending field path for validation errors.
    #[must_use]
    pub fn field_name(&self) -> Option<&str> {
        match self {
            Self::InvalidField { field, .. } => Some(field),
            _ => None,
        }
    }
}
