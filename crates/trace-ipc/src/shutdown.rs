//! Shutdown utilities for graceful dispatcher termination.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Shared shutdown state between the dispatcher and every endpoint.
#[derive(Debug)]
pub(crate) struct ShutdownState {
    /// Flag indicating the command channel is closed for new endpoints.
    closed: AtomicBool,
    /// Flag indicating shutdown has been initiated.
    shutdown_initiated: AtomicBool,
}

impl ShutdownState {
    pub(crate) fn new() -> Self {
        Self { closed: AtomicBool::new(false), shutdown_initiated: AtomicBool::new(false) }
    }

    /// Marks the channel as closed for new endpoint registrations.
    #[inline]
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Returns `true` if closed for new registrations.
    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Initiates shutdown sequence.
    #[inline]
    pub(crate) fn initiate_shutdown(&self) {
        self.shutdown_initiated.store(true, Ordering::Release);
    }

    /// Returns `true` if shutdown has been initiated.
    #[inline]
    pub(crate) fn is_shutdown_initiated(&self) -> bool {
        self.shutdown_initiated.load(Ordering::Acquire)
    }
}

/// A cloneable signal for triggering dispatcher shutdown externally.
///
/// The dispatcher's own select loop wakes on the shared `Notify` and then
/// checks [`ShutdownState::is_shutdown_initiated`], rather than the signal
/// pushing a one-shot event directly into the loop — that keeps an
/// arbitrary number of `ShutdownSignal` clones able to trigger it without
/// needing to race each other over who owns the one-shot sender.
///
/// Idempotent: calling [`ShutdownSignal::shutdown`] more than once after
/// the first has no additional effect.
#[derive(Clone)]
pub struct ShutdownSignal {
    state: Arc<ShutdownState>,
    wake: Arc<Notify>,
}

impl ShutdownSignal {
    pub(crate) fn new(state: Arc<ShutdownState>, wake: Arc<Notify>) -> Self {
        Self { state, wake }
    }

    /// Triggers graceful shutdown: closes the command channel to new
    /// endpoint registrations and wakes the dispatcher loop (and any
    /// endpoint blocked sending into a full channel) so it can observe the
    /// closed state.
    pub fn shutdown(&self) {
        if !self.state.is_shutdown_initiated() {
            self.state.initiate_shutdown();
            self.state.close();
            self.wake.notify_waiters();
        }
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.state.is_shutdown_initiated()
    }

    /// Whether the dispatcher has stopped accepting new producer
    /// registrations. Always `true` once [`ShutdownSignal::is_shutdown`] is.
    pub(crate) fn is_closed(&self) -> bool {
        self.state.is_closed()
    }
}
