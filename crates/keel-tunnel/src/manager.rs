//! Tunnel lifecycle manager.
//!
//! The [`TunnelManager`] owns the observable state of one tunnel and is the
//! only component that issues commands to the backend. Commands are
//! serialized by an async mutex that is held for the whole transition,
//! including the backend call, so at most one `apply` is ever in flight.
//!
//! The backend call runs on its own spawned task. That task owns the command
//! lock and publishes the settled state itself, so dropping a command future
//! half way through never leaves the state stuck in a transient value.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};

use futures::FutureExt;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use crate::backend::{BackendError, TunnelBackend, TunnelListener};
use crate::config::TunnelConfiguration;
use crate::error::{Result, TunnelError};
use crate::state::{LinkState, PermissionRequest, PermissionStatus, TunnelState, fold_report};
use crate::stream::{StateStream, StateSubscription};
use crate::types::TunnelId;

/// Default tunnel interface name.
pub const DEFAULT_TUNNEL_NAME: &str = "keel0";

/// What happens to a command that arrives while another one is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandPolicy {
    /// Wait for the running command, in arrival order.
    #[default]
    Queue,
    /// Fail immediately with [`TunnelError::Busy`].
    Reject,
}

/// Manager configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Interface name of the managed tunnel.
    pub tunnel_name: String,
    /// Policy for overlapping commands.
    pub policy: CommandPolicy,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            tunnel_name: DEFAULT_TUNNEL_NAME.to_string(),
            policy: CommandPolicy::default(),
        }
    }
}

impl ManagerConfig {
    /// Sets the tunnel name.
    #[must_use]
    pub fn with_tunnel_name(mut self, name: impl Into<String>) -> Self {
        self.tunnel_name = name.into();
        self
    }

    /// Sets the command policy.
    #[must_use]
    pub const fn with_policy(mut self, policy: CommandPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Result of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// The backend was driven and the tunnel settled in this state.
    Applied(TunnelState),
    /// Nothing needed doing; the tunnel is in this state.
    Unchanged(TunnelState),
    /// The connect is waiting on this authorization. Answer it with
    /// [`TunnelManager::on_permission_result`].
    PermissionRequired(PermissionRequest),
}

impl CommandOutcome {
    /// The resulting tunnel state, if the command reached one.
    #[must_use]
    pub const fn state(&self) -> Option<&TunnelState> {
        match self {
            Self::Applied(state) | Self::Unchanged(state) => Some(state),
            Self::PermissionRequired(_) => None,
        }
    }

    /// True when the command settled in [`TunnelState::Error`].
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Applied(TunnelState::Error(_)))
    }
}

#[derive(Debug, Default)]
struct Session {
    retained: Option<Arc<TunnelConfiguration>>,
    pending: Option<Arc<TunnelConfiguration>>,
    permission: PermissionStatus,
}

struct Inner<B> {
    tunnel: TunnelId,
    policy: CommandPolicy,
    backend: Arc<B>,
    stream: StateStream,
    commands: Arc<AsyncMutex<()>>,
    session: parking_lot::Mutex<Session>,
}

impl<B: TunnelBackend> Inner<B> {
    /// Publishes `next` if it differs from the current state.
    fn publish(&self, next: TunnelState) {
        let published = self
            .stream
            .update(|current| (*current != next).then_some(next));
        if let Some(state) = published {
            info!(tunnel = %self.tunnel, state = %state, "tunnel state changed");
        }
    }

    fn settle(
        &self,
        desired: LinkState,
        result: std::thread::Result<std::result::Result<LinkState, BackendError>>,
    ) -> TunnelState {
        match result {
            Ok(Ok(settled)) => {
                debug!(
                    tunnel = %self.tunnel,
                    desired = %desired,
                    settled = %settled,
                    "backend settled"
                );
                settled.into()
            }
            Ok(Err(err)) => {
                if matches!(err, BackendError::PermissionRevoked(_)) {
                    warn!(tunnel = %self.tunnel, "permission revoked, clearing cached grant");
                    self.session.lock().permission = PermissionStatus::Unknown;
                }
                warn!(tunnel = %self.tunnel, desired = %desired, error = %err, "backend failed");
                TunnelState::Error(err.to_string())
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(
                    tunnel = %self.tunnel,
                    desired = %desired,
                    panic = %message,
                    "backend panicked"
                );
                TunnelState::Error(format!("backend panicked: {message}"))
            }
        }
    }
}

/// Whether a transition toward `desired` may start from `current`.
fn may_start(current: &TunnelState, desired: LinkState) -> bool {
    match desired {
        LinkState::Up => current.can_connect(),
        LinkState::Down => !matches!(current, TunnelState::Down),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Listener registered on the backend. Holds the manager weakly so the
/// backend never keeps it alive.
struct StateListener<B> {
    name: String,
    inner: Weak<Inner<B>>,
}

impl<B: TunnelBackend> TunnelListener for StateListener<B> {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_state_change(&self, reported: LinkState) {
        let Some(inner) = self.inner.upgrade() else {
            debug!(tunnel = %self.name, "report for dropped manager ignored");
            return;
        };
        match inner.stream.update(|current| fold_report(current, reported)) {
            Some(state) => {
                info!(
                    tunnel = %self.name,
                    reported = %reported,
                    state = %state,
                    "backend pushed state change"
                );
            }
            None => {
                debug!(tunnel = %self.name, reported = %reported, "backend report ignored");
            }
        }
    }
}

/// Drives one tunnel through its lifecycle.
///
/// Cloning is cheap; clones share the same state, stream and command lock.
pub struct TunnelManager<B> {
    inner: Arc<Inner<B>>,
}

impl<B> Clone for TunnelManager<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: TunnelBackend> std::fmt::Debug for TunnelManager<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelManager")
            .field("tunnel", &self.inner.tunnel)
            .field("policy", &self.inner.policy)
            .field("state", &self.inner.stream.current())
            .finish_non_exhaustive()
    }
}

impl<B: TunnelBackend> TunnelManager<B> {
    /// Creates a manager in state `Down` and registers its listener on
    /// `backend`.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::InvalidTunnelName`] if the configured name is
    /// not a valid interface name.
    pub fn new(backend: B, config: ManagerConfig) -> Result<Self> {
        let tunnel = TunnelId::new(config.tunnel_name)?;
        let inner = Arc::new(Inner {
            tunnel: tunnel.clone(),
            policy: config.policy,
            backend: Arc::new(backend),
            stream: StateStream::default(),
            commands: Arc::new(AsyncMutex::new(())),
            session: parking_lot::Mutex::new(Session::default()),
        });

        inner.backend.register_listener(Arc::new(StateListener {
            name: tunnel.as_str().to_string(),
            inner: Arc::downgrade(&inner),
        }));

        info!(tunnel = %tunnel, policy = ?config.policy, "tunnel manager created");
        Ok(Self { inner })
    }

    /// The managed tunnel.
    #[must_use]
    pub fn tunnel_id(&self) -> &TunnelId {
        &self.inner.tunnel
    }

    /// The backend this manager drives.
    #[must_use]
    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    /// The configured command policy.
    #[must_use]
    pub fn policy(&self) -> CommandPolicy {
        self.inner.policy
    }

    /// Latest published state.
    #[must_use]
    pub fn current_state(&self) -> TunnelState {
        self.inner.stream.current()
    }

    /// Subscribes to state changes, starting with the current state.
    #[must_use]
    pub fn subscribe(&self) -> StateSubscription {
        self.inner.stream.subscribe()
    }

    /// The configuration used by the last connect, if any.
    #[must_use]
    pub fn retained_configuration(&self) -> Option<Arc<TunnelConfiguration>> {
        self.inner.session.lock().retained.clone()
    }

    /// Where the permission protocol stands.
    #[must_use]
    pub fn permission(&self) -> PermissionStatus {
        self.inner.session.lock().permission.clone()
    }

    /// True while a command holds the command lock.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.inner.commands.try_lock().is_err()
    }

    async fn acquire(&self, command: &'static str) -> Result<OwnedMutexGuard<()>> {
        let commands = Arc::clone(&self.inner.commands);
        match self.inner.policy {
            CommandPolicy::Queue => Ok(commands.lock_owned().await),
            CommandPolicy::Reject => commands.try_lock_owned().map_err(|_| {
                debug!(
                    tunnel = %self.inner.tunnel,
                    command,
                    "rejected, another command is running"
                );
                TunnelError::Busy
            }),
        }
    }

    /// Brings the tunnel up with `config`.
    ///
    /// The configuration is retained for [`TunnelManager::reconnect`] and
    /// [`TunnelManager::toggle`]. While `Up` this is a no-op and `config` is
    /// discarded; disconnect first to switch configurations.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Busy`] under [`CommandPolicy::Reject`] when
    /// another command is running.
    pub async fn connect(&self, config: TunnelConfiguration) -> Result<CommandOutcome> {
        let guard = self.acquire("connect").await?;
        let current = self.current_state();
        if !current.can_connect() {
            debug!(tunnel = %self.inner.tunnel, state = %current, "connect ignored");
            return Ok(CommandOutcome::Unchanged(current));
        }

        let config = Arc::new(config);
        self.inner.session.lock().retained = Some(Arc::clone(&config));
        self.connect_locked(guard, config).await
    }

    /// Brings the tunnel up with the retained configuration.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::NoConfiguration`] if no configuration was ever
    /// supplied, or [`TunnelError::Busy`] as for `connect`.
    pub async fn reconnect(&self) -> Result<CommandOutcome> {
        let guard = self.acquire("reconnect").await?;
        let current = self.current_state();
        if !current.can_connect() {
            return Ok(CommandOutcome::Unchanged(current));
        }
        let config = self.retained()?;
        self.connect_locked(guard, config).await
    }

    /// Tears the tunnel down.
    ///
    /// A connect waiting on permission is abandoned. From `Error` the
    /// teardown is attempted again; only `Down` is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Busy`] under [`CommandPolicy::Reject`] when
    /// another command is running.
    pub async fn disconnect(&self) -> Result<CommandOutcome> {
        let guard = self.acquire("disconnect").await?;
        self.inner.session.lock().pending = None;
        self.transition(guard, LinkState::Down, None).await
    }

    /// Connects with the retained configuration when `Down` or `Error`,
    /// otherwise disconnects.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::NoConfiguration`] when a connect is needed but
    /// no configuration was ever supplied.
    pub async fn toggle(&self) -> Result<CommandOutcome> {
        let guard = self.acquire("toggle").await?;
        let current = self.current_state();
        if current.can_connect() {
            let config = self.retained()?;
            self.connect_locked(guard, config).await
        } else {
            self.transition(guard, LinkState::Down, None).await
        }
    }

    /// Delivers the answer to a [`CommandOutcome::PermissionRequired`].
    ///
    /// A grant is cached for the lifetime of the manager and resumes the
    /// waiting connect, if any.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::PermissionDenied`] when `granted` is false; the
    /// tunnel state is left untouched.
    pub async fn on_permission_result(&self, granted: bool) -> Result<CommandOutcome> {
        let guard = self.acquire("on_permission_result").await?;
        let pending = {
            let mut session = self.inner.session.lock();
            session.permission = if granted {
                PermissionStatus::Granted
            } else {
                PermissionStatus::Denied
            };
            session.pending.take()
        };

        if !granted {
            warn!(tunnel = %self.inner.tunnel, "permission denied");
            return Err(TunnelError::PermissionDenied);
        }
        info!(
            tunnel = %self.inner.tunnel,
            resumes_connect = pending.is_some(),
            "permission granted"
        );

        let current = self.current_state();
        match pending {
            Some(config) if current.can_connect() => {
                self.transition(guard, LinkState::Up, Some(config)).await
            }
            _ => Ok(CommandOutcome::Unchanged(current)),
        }
    }

    /// Asks the backend for the actual link state and folds it in.
    ///
    /// Used at startup to adopt a tunnel left up by an earlier process.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Busy`] under [`CommandPolicy::Reject`] when
    /// another command is running.
    pub async fn refresh(&self) -> Result<CommandOutcome> {
        let _guard = self.acquire("refresh").await?;
        match self.inner.backend.current_state(&self.inner.tunnel).await {
            Ok(link) => {
                let folded = self.inner.stream.update(|current| fold_report(current, link));
                Ok(match folded {
                    Some(state) => {
                        info!(tunnel = %self.inner.tunnel, state = %state, "adopted backend state");
                        CommandOutcome::Applied(state)
                    }
                    None => CommandOutcome::Unchanged(self.current_state()),
                })
            }
            Err(err) => {
                warn!(tunnel = %self.inner.tunnel, error = %err, "failed to read backend state");
                let state = TunnelState::Error(err.to_string());
                self.inner.publish(state.clone());
                Ok(CommandOutcome::Applied(state))
            }
        }
    }

    fn retained(&self) -> Result<Arc<TunnelConfiguration>> {
        self.inner
            .session
            .lock()
            .retained
            .clone()
            .ok_or(TunnelError::NoConfiguration)
    }

    async fn connect_locked(
        &self,
        guard: OwnedMutexGuard<()>,
        config: Arc<TunnelConfiguration>,
    ) -> Result<CommandOutcome> {
        if let Some(request) = self.permission_needed() {
            let mut session = self.inner.session.lock();
            session.pending = Some(config);
            session.permission = PermissionStatus::Pending(request.clone());
            info!(tunnel = %self.inner.tunnel, kind = ?request.kind, "permission required");
            return Ok(CommandOutcome::PermissionRequired(request));
        }
        self.transition(guard, LinkState::Up, Some(config)).await
    }

    fn permission_needed(&self) -> Option<PermissionRequest> {
        if self.inner.session.lock().permission == PermissionStatus::Granted {
            return None;
        }
        let request = self.inner.backend.request_permission();
        if request.is_none() {
            self.inner.session.lock().permission = PermissionStatus::Granted;
        }
        request
    }

    /// Runs one backend transition. The spawned task keeps the command lock
    /// until the settled state is published.
    ///
    /// The start condition is checked and the transient state published in
    /// one stream update, so a pushed report cannot slip in between.
    async fn transition(
        &self,
        guard: OwnedMutexGuard<()>,
        desired: LinkState,
        config: Option<Arc<TunnelConfiguration>>,
    ) -> Result<CommandOutcome> {
        let mut blocked = None;
        let started = self.inner.stream.update(|current| {
            if !may_start(current, desired) {
                blocked = Some(current.clone());
                return None;
            }
            Some(match desired {
                LinkState::Up => TunnelState::Connecting,
                LinkState::Down => TunnelState::Disconnecting,
            })
        });
        if let Some(current) = blocked {
            debug!(
                tunnel = %self.inner.tunnel,
                desired = %desired,
                state = %current,
                "nothing to do"
            );
            return Ok(CommandOutcome::Unchanged(current));
        }
        if let Some(state) = started {
            info!(tunnel = %self.inner.tunnel, state = %state, "tunnel state changed");
        }

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let _guard = guard;
            let apply = inner.backend.apply(&inner.tunnel, desired, config.as_deref());
            let result = AssertUnwindSafe(apply).catch_unwind().await;
            let next = inner.settle(desired, result);
            inner.publish(next.clone());
            next
        });

        let next = match task.await {
            Ok(next) => next,
            Err(err) => {
                error!(tunnel = %self.inner.tunnel, error = %err, "transition task failed");
                let state = TunnelState::Error(format!("transition task failed: {err}"));
                self.inner.publish(state.clone());
                state
            }
        };
        Ok(CommandOutcome::Applied(next))
    }
}
