//! Latest-value broadcast of tunnel state.
//!
//! [`StateStream`] keeps the most recent [`TunnelState`] behind a mutex along
//! with one queue per subscriber. Publishing never blocks and never waits for
//! observers; each subscriber sees the value current at subscribe time and
//! then every later publish, in order and without coalescing.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::state::TunnelState;

struct Shared {
    latest: TunnelState,
    subscribers: Vec<mpsc::UnboundedSender<TunnelState>>,
    closed: bool,
}

impl Shared {
    fn broadcast(&mut self, state: &TunnelState) {
        self.subscribers.retain(|tx| tx.send(state.clone()).is_ok());
    }
}

/// Single-slot, latest-value broadcast channel.
pub struct StateStream {
    shared: Mutex<Shared>,
}

impl StateStream {
    /// Creates a stream holding `initial`.
    #[must_use]
    pub fn new(initial: TunnelState) -> Self {
        Self {
            shared: Mutex::new(Shared {
                latest: initial,
                subscribers: Vec::new(),
                closed: false,
            }),
        }
    }

    /// Returns the latest published value.
    #[must_use]
    pub fn current(&self) -> TunnelState {
        self.shared.lock().latest.clone()
    }

    /// Publishes a value to every current subscriber and retains it for
    /// future ones.
    pub fn publish(&self, state: TunnelState) {
        let mut shared = self.shared.lock();
        shared.broadcast(&state);
        shared.latest = state;
    }

    /// Read-modify-write under the stream's lock.
    ///
    /// `f` sees the current value; when it returns `Some`, that value is
    /// published. Returns what was published.
    pub fn update<F>(&self, f: F) -> Option<TunnelState>
    where
        F: FnOnce(&TunnelState) -> Option<TunnelState>,
    {
        let mut shared = self.shared.lock();
        let next = f(&shared.latest)?;
        shared.broadcast(&next);
        shared.latest = next.clone();
        Some(next)
    }

    /// Subscribes to state changes, starting with the latest value.
    #[must_use]
    pub fn subscribe(&self) -> StateSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut shared = self.shared.lock();
        // The receiver is alive, so this send cannot fail.
        let _ = tx.send(shared.latest.clone());
        if !shared.closed {
            shared.subscribers.push(tx);
        }
        StateSubscription { receiver: rx }
    }

    /// Ends every subscription. Later subscribers receive the final value and
    /// then end immediately.
    pub fn close(&self) {
        let mut shared = self.shared.lock();
        shared.closed = true;
        shared.subscribers.clear();
    }

    /// Returns true once [`StateStream::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let mut shared = self.shared.lock();
        shared.subscribers.retain(|tx| !tx.is_closed());
        shared.subscribers.len()
    }
}

impl Default for StateStream {
    fn default() -> Self {
        Self::new(TunnelState::default())
    }
}

impl std::fmt::Debug for StateStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.shared.lock();
        f.debug_struct("StateStream")
            .field("latest", &shared.latest)
            .field("subscribers", &shared.subscribers.len())
            .field("closed", &shared.closed)
            .finish()
    }
}

/// A subscriber's view of the state stream.
///
/// Ends when the owning [`StateStream`] is closed or dropped.
#[derive(Debug)]
pub struct StateSubscription {
    receiver: mpsc::UnboundedReceiver<TunnelState>,
}

impl StateSubscription {
    /// Returns the next value without waiting, if one is queued.
    pub fn try_next(&mut self) -> Option<TunnelState> {
        self.receiver.try_recv().ok()
    }
}

impl Stream for StateSubscription {
    type Item = TunnelState;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}
