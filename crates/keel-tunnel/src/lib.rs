//! Lifecycle management for a single `WireGuard` tunnel.
//!
//! This crate owns the client side of a tunnel: a validated configuration
//! model, a state machine that drives a pluggable backend through
//! connect/disconnect transitions, and a latest-value stream observers can
//! subscribe to.
//!
//! # Example
//!
//! ```rust,no_run
//! use keel_tunnel::{CommandOutcome, FakeBackend, ManagerConfig, TunnelManager, wgconf};
//!
//! # async fn example() -> keel_tunnel::Result<()> {
//! let text = std::fs::read_to_string("/etc/keel/keel0.conf").unwrap_or_default();
//! let config = wgconf::parse(&text)?;
//! let manager = TunnelManager::new(FakeBackend::new(), ManagerConfig::default())?;
//!
//! let mut states = manager.subscribe();
//! match manager.connect(config).await? {
//!     CommandOutcome::PermissionRequired(request) => {
//!         println!("{}", request.rationale);
//!         manager.on_permission_result(true).await?;
//!     }
//!     outcome => println!("{outcome:?}"),
//! }
//! # drop(states.try_next());
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod config;
pub mod error;
pub mod keys;
pub mod manager;
pub mod state;
pub mod stream;
pub mod types;
pub mod wgconf;

pub use backend::{
    ApplyCall, BackendError, FakeBackend, TunnelBackend, TunnelListener, WgQuickBackend,
    WgQuickConfig,
};
pub use config::{
    ConfigFields, PeerConfiguration, PeerConfigurationBuilder, PeerFields, TunnelConfiguration,
    TunnelConfigurationBuilder,
};
pub use error::{Result, TunnelError};
pub use keys::{KEY_SIZE, PresharedKey, PrivateKey, PublicKey, generate_keypair};
pub use manager::{CommandOutcome, CommandPolicy, ManagerConfig, TunnelManager};
pub use state::{
    LinkState, PermissionKind, PermissionRequest, PermissionStatus, TunnelState, fold_report,
};
pub use stream::{StateStream, StateSubscription};
pub use types::{Cidr, Endpoint, Host, TunnelId};
