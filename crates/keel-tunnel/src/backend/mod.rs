//! Backend adapter capability.
//!
//! A backend is whatever actually negotiates and maintains the encrypted
//! session. The manager only asks it for permission, tells it which link
//! state it wants and listens for the state it reports.

mod fake;
mod wg_quick;

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;

use crate::config::TunnelConfiguration;
use crate::state::{LinkState, PermissionRequest};
use crate::types::TunnelId;

pub use fake::{ApplyCall, FakeBackend};
pub use wg_quick::{WgQuickBackend, WgQuickConfig};

/// Errors a backend may return from a state change.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The OS revoked a previously granted permission.
    #[error("permission revoked: {0}")]
    PermissionRevoked(String),

    /// `apply(Up)` was called without a configuration.
    #[error("no configuration supplied for bringing the tunnel up")]
    MissingConfiguration,

    /// An external command failed.
    #[error("command `{command}` failed: {detail}")]
    Command {
        /// The command line that was run.
        command: String,
        /// Exit status and stderr.
        detail: String,
    },

    /// The handshake with the peer did not complete.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else.
    #[error("{0}")]
    Other(String),
}

/// Narrow listener a backend calls when the link changes on its own.
///
/// Implementations must not block: the call may come from the backend's
/// internal thread or task.
pub trait TunnelListener: Send + Sync {
    /// Name of the tunnel this listener follows.
    fn name(&self) -> &str;

    /// Called with every link state the backend observes.
    fn on_state_change(&self, state: LinkState);
}

/// Capability the lifecycle manager depends on.
///
/// The returned futures are `Send` so that calls can run on a spawned task,
/// away from whatever drives the UI.
pub trait TunnelBackend: Send + Sync + 'static {
    /// Registers the listener that receives pushed state changes.
    fn register_listener(&self, listener: Arc<dyn TunnelListener>);

    /// Reports the current link state of `tunnel`.
    fn current_state(
        &self,
        tunnel: &TunnelId,
    ) -> impl Future<Output = Result<LinkState, BackendError>> + Send;

    /// Drives `tunnel` towards `desired`. `config` is required for
    /// [`LinkState::Up`] and ignored for [`LinkState::Down`]. Returns the
    /// state the backend settled in.
    fn apply(
        &self,
        tunnel: &TunnelId,
        desired: LinkState,
        config: Option<&TunnelConfiguration>,
    ) -> impl Future<Output = Result<LinkState, BackendError>> + Send;

    /// Returns the authorization that must be granted before the first
    /// connect, or `None` if it is already in place.
    fn request_permission(&self) -> Option<PermissionRequest>;
}
