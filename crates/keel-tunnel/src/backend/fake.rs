//! Scriptable in-memory backend.
//!
//! Used by tests and by `keelctl --simulate`. Every `apply` call is recorded,
//! results can be scripted per call, and calls can be held at a gate until
//! the test releases them, which makes interleavings deterministic.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::debug;

use super::{BackendError, TunnelBackend, TunnelListener};
use crate::config::TunnelConfiguration;
use crate::state::{LinkState, PermissionRequest};
use crate::types::TunnelId;

/// One recorded `apply` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyCall {
    /// Tunnel the call targeted.
    pub tunnel: TunnelId,
    /// Requested link state.
    pub desired: LinkState,
    /// Whether a configuration was passed.
    pub with_config: bool,
}

#[derive(Default)]
struct FakeState {
    links: HashMap<TunnelId, LinkState>,
    listeners: Vec<Arc<dyn TunnelListener>>,
    script: VecDeque<Result<LinkState, BackendError>>,
    calls: Vec<ApplyCall>,
    last_config: Option<TunnelConfiguration>,
    permission: Option<PermissionRequest>,
    permission_queries: usize,
    gate: Option<Arc<Semaphore>>,
    latency: Option<Duration>,
    intermediate: Option<LinkState>,
    panic_next: bool,
}

#[derive(Default)]
struct FakeInner {
    state: Mutex<FakeState>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// A fake backend for testing and simulation.
#[derive(Clone, Default)]
pub struct FakeBackend {
    inner: Arc<FakeInner>,
}

impl FakeBackend {
    /// Creates a backend where every apply succeeds immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `request_permission` return `request` until
    /// [`FakeBackend::grant_permission`] is called.
    #[must_use]
    pub fn with_permission_request(self, request: PermissionRequest) -> Self {
        self.inner.state.lock().permission = Some(request);
        self
    }

    /// Adds a fixed delay to every apply.
    #[must_use]
    pub fn with_latency(self, latency: Duration) -> Self {
        self.inner.state.lock().latency = Some(latency);
        self
    }

    /// Makes every apply push `state` to the listeners before settling.
    #[must_use]
    pub fn with_intermediate_report(self, state: LinkState) -> Self {
        self.inner.state.lock().intermediate = Some(state);
        self
    }

    /// Queues the result of the next unscripted apply. Unscripted calls
    /// succeed with the desired state.
    pub fn push_result(&self, result: Result<LinkState, BackendError>) {
        self.inner.state.lock().script.push_back(result);
    }

    /// Queues a failure for the next apply.
    pub fn fail_next(&self, error: BackendError) {
        self.push_result(Err(error));
    }

    /// Makes the next apply panic.
    pub fn panic_next(&self) {
        self.inner.state.lock().panic_next = true;
    }

    /// Marks the permission as granted at the OS level.
    pub fn grant_permission(&self) {
        self.inner.state.lock().permission = None;
    }

    /// Requires permission again, as if the OS revoked it.
    pub fn revoke_permission(&self, request: PermissionRequest) {
        self.inner.state.lock().permission = Some(request);
    }

    /// Holds every subsequent apply until released.
    pub fn hold_applies(&self) {
        self.inner.state.lock().gate = Some(Arc::new(Semaphore::new(0)));
    }

    /// Lets `n` held applies proceed.
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.inner.state.lock().gate {
            gate.add_permits(n);
        }
    }

    /// Stops holding and lets every waiting apply proceed.
    pub fn stop_holding(&self) {
        if let Some(gate) = self.inner.state.lock().gate.take() {
            gate.close();
        }
    }

    /// Sets the link state the backend reports for `tunnel`.
    pub fn set_link(&self, tunnel: &TunnelId, state: LinkState) {
        self.inner.state.lock().links.insert(tunnel.clone(), state);
    }

    /// Simulates a spontaneous link change (e.g. the tunnel was killed) and
    /// notifies the registered listeners.
    pub fn simulate_report(&self, state: LinkState) {
        let listeners = {
            let mut inner = self.inner.state.lock();
            let listeners = inner.listeners.clone();
            for listener in &listeners {
                if let Ok(id) = TunnelId::new(listener.name()) {
                    inner.links.insert(id, state);
                }
            }
            listeners
        };
        for listener in listeners {
            listener.on_state_change(state);
        }
    }

    /// All apply calls so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<ApplyCall> {
        self.inner.state.lock().calls.clone()
    }

    /// Number of apply calls requesting `desired`.
    #[must_use]
    pub fn apply_count(&self, desired: LinkState) -> usize {
        self.inner
            .state
            .lock()
            .calls
            .iter()
            .filter(|c| c.desired == desired)
            .count()
    }

    /// Number of applies currently running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of applies that ever ran at once.
    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.inner.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Configuration passed to the most recent `apply(Up)`.
    #[must_use]
    pub fn last_config(&self) -> Option<TunnelConfiguration> {
        self.inner.state.lock().last_config.clone()
    }

    /// Number of `request_permission` calls.
    #[must_use]
    pub fn permission_queries(&self) -> usize {
        self.inner.state.lock().permission_queries
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.state.lock().listeners.len()
    }

    fn notify(&self, state: LinkState) {
        let listeners = self.inner.state.lock().listeners.clone();
        for listener in listeners {
            listener.on_state_change(state);
        }
    }
}

struct InFlight<'a>(&'a FakeInner);

impl<'a> InFlight<'a> {
    fn enter(inner: &'a FakeInner) -> Self {
        let now = inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        inner.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(inner)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl TunnelBackend for FakeBackend {
    fn register_listener(&self, listener: Arc<dyn TunnelListener>) {
        self.inner.state.lock().listeners.push(listener);
    }

    async fn current_state(&self, tunnel: &TunnelId) -> Result<LinkState, BackendError> {
        Ok(self
            .inner
            .state
            .lock()
            .links
            .get(tunnel)
            .copied()
            .unwrap_or(LinkState::Down))
    }

    async fn apply(
        &self,
        tunnel: &TunnelId,
        desired: LinkState,
        config: Option<&TunnelConfiguration>,
    ) -> Result<LinkState, BackendError> {
        let _in_flight = InFlight::enter(&self.inner);

        let (gate, latency, intermediate) = {
            let mut state = self.inner.state.lock();
            state.calls.push(ApplyCall {
                tunnel: tunnel.clone(),
                desired,
                with_config: config.is_some(),
            });
            if let (LinkState::Up, Some(config)) = (desired, config) {
                state.last_config = Some(config.clone());
            }
            (state.gate.clone(), state.latency, state.intermediate)
        };
        debug!(tunnel = %tunnel, desired = %desired, "fake backend apply");

        if let Some(gate) = gate {
            // A closed gate means holding was stopped.
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(report) = intermediate {
            self.notify(report);
        }

        let (result, panic_now) = {
            let mut state = self.inner.state.lock();
            let panic_now = std::mem::take(&mut state.panic_next);
            let result = state.script.pop_front().unwrap_or(Ok(desired));
            if let Ok(settled) = &result {
                state.links.insert(tunnel.clone(), *settled);
            }
            (result, panic_now)
        };

        assert!(!panic_now, "fake backend panicked while applying {desired}");

        if desired == LinkState::Up && config.is_none() && result.is_ok() {
            return Err(BackendError::MissingConfiguration);
        }
        result
    }

    fn request_permission(&self) -> Option<PermissionRequest> {
        let mut state = self.inner.state.lock();
        state.permission_queries += 1;
        state.permission.clone()
    }
}
