//! Cooperative cancellation shared by the pipeline components.
//!
//! A [`CancellationToken`] is a flag plus a trip wire: cancelling sets the flag and
//! disconnects a channel, so any thread parked in a `crossbeam_channel::select!` that
//! includes [`CancellationToken::tripped`] wakes immediately. Threads that are busy
//! (running a callback, reading a file) only notice at their next check point.
//!
//! [`AbortState`] layers the first-error-wins slot on top of a token and is created once
//! per pipeline invocation.

use crate::error::PipelineError;
use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cloneable handle used to request cancellation of one or more pipelines.
#[derive(Clone, Debug)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

#[derive(Debug)]
struct TokenInner {
    cancelled: AtomicBool,
    // Dropped on cancel; never used to send.
    trip: Mutex<Option<Sender<()>>>,
    tripped: Receiver<()>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        let (trip, tripped) = bounded(0);
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                trip: Mutex::new(Some(trip)),
                tripped,
            }),
        }
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        drop(self.inner.trip.lock().take());
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// A receiver that becomes ready (disconnected) once the token is cancelled.
    #[must_use]
    pub fn tripped(&self) -> &Receiver<()> {
        &self.inner.tripped
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Abort flag and first-error slot for a single pipeline invocation.
pub(crate) struct AbortState {
    name: &'static str,
    token: CancellationToken,
    external: Option<CancellationToken>,
    first_error: Mutex<Option<PipelineError>>,
}

impl AbortState {
    pub(crate) fn new(name: &'static str, external: Option<CancellationToken>) -> Self {
        Self { name, token: CancellationToken::new(), external, first_error: Mutex::new(None) }
    }

    /// True once the invocation has been aborted, internally or through the external token.
    pub(crate) fn is_aborted(&self) -> bool {
        self.token.is_cancelled() || self.external.as_ref().is_some_and(|t| t.is_cancelled())
    }

    /// Check for abort at a loop-top check point.
    ///
    /// An external cancellation observed here is recorded as [`PipelineError::Cancelled`]
    /// so that it flows through the same first-error-wins slot as any other failure.
    pub(crate) fn should_stop(&self) -> bool {
        if self.token.is_cancelled() {
            return true;
        }
        if self.external.as_ref().is_some_and(|t| t.is_cancelled()) {
            self.fail(PipelineError::Cancelled);
            return true;
        }
        false
    }

    /// Raise the abort flag without recording an error.
    pub(crate) fn raise(&self) {
        self.token.cancel();
    }

    /// Record an error; only the first one is retained. Returns true if this was the first.
    pub(crate) fn record(&self, error: PipelineError) -> bool {
        let mut slot = self.first_error.lock();
        if slot.is_none() {
            log::error!("{}: {}", self.name, error);
            *slot = Some(error);
            true
        } else {
            log::warn!("{}: discarding error after first failure: {}", self.name, error);
            false
        }
    }

    /// Record an error and abort the invocation.
    pub(crate) fn fail(&self, error: PipelineError) {
        self.record(error);
        self.raise();
    }

    pub(crate) fn take_error(&self) -> Option<PipelineError> {
        self.first_error.lock().take()
    }

    /// Receiver for the invocation's own trip wire.
    pub(crate) fn tripped(&self) -> &Receiver<()> {
        self.token.tripped()
    }

    /// Receiver for the external trip wire, or one that never fires.
    pub(crate) fn external_tripped(&self) -> Receiver<()> {
        match &self.external {
            Some(token) => token.tripped().clone(),
            None => crossbeam_channel::never(),
        }
    }
}

/// Turn a panic payload into a readable message.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
