//! Cross-thread relay for callback failures.
//!
//! Callbacks run on the owning thread's behalf (async messages, trampolined
//! native events, timers) must not unwind into the native toolkit or into the
//! middle of a drain loop. Their panics are caught here and parked until the
//! owning thread reaches its next loop boundary, where
//! [`ExceptionRelay::throw_if_pending`] hands the failure back as an error.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};

use parking_lot::Mutex;

use crate::error::{BridgeError, CallbackPanic, Result};
use crate::logging::targets::RELAY;

/// What to do with a failure that arrives while another is still pending.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RelayPolicy {
    /// Keep the first failure; later ones are logged and dropped until the
    /// first has been observed.
    #[default]
    FirstWins,
    /// Keep every failure and re-raise them one per loop boundary, in order.
    Queue,
}

/// Holds failures captured on behalf of the owning thread.
#[derive(Debug, Default)]
pub struct ExceptionRelay {
    policy: RelayPolicy,
    pending: Mutex<VecDeque<CallbackPanic>>,
}

impl ExceptionRelay {
    /// Create a relay with the given policy.
    pub fn new(policy: RelayPolicy) -> Self {
        Self {
            policy,
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// The relay's policy.
    pub fn policy(&self) -> RelayPolicy {
        self.policy
    }

    /// Park a failure for the owning thread.
    ///
    /// Returns `false` if the failure was dropped because the policy is
    /// [`RelayPolicy::FirstWins`] and an earlier failure is still pending.
    pub fn store(&self, failure: CallbackPanic) -> bool {
        let mut pending = self.pending.lock();
        if self.policy == RelayPolicy::FirstWins && !pending.is_empty() {
            tracing::warn!(
                target: RELAY,
                thread = failure.thread_name(),
                message = failure.message(),
                "dropping callback failure: an earlier failure is still pending"
            );
            return false;
        }
        tracing::debug!(
            target: RELAY,
            thread = failure.thread_name(),
            message = failure.message(),
            "callback failure stored for the owning thread"
        );
        pending.push_back(failure);
        true
    }

    /// Run `f`, storing its panic (if any) instead of unwinding.
    ///
    /// Returns `true` if `f` completed normally.
    pub fn run_guarded<F>(&self, f: F) -> bool
    where
        F: FnOnce(),
    {
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(()) => true,
            Err(payload) => {
                self.store(CallbackPanic::from_payload(payload));
                false
            }
        }
    }

    /// Take the oldest pending failure, if any.
    pub fn take(&self) -> Option<CallbackPanic> {
        self.pending.lock().pop_front()
    }

    /// Clear the oldest pending failure and return it as `FailedExec`.
    pub fn throw_if_pending(&self) -> Result<()> {
        match self.take() {
            Some(failure) => Err(BridgeError::FailedExec(failure)),
            None => Ok(()),
        }
    }

    /// Whether a failure is waiting to be observed.
    pub fn has_pending(&self) -> bool {
        !self.pending.lock().is_empty()
    }

    /// Number of failures waiting to be observed.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Drop every pending failure, logging each one. Returns how many were
    /// discarded.
    pub fn discard_all(&self) -> usize {
        let drained: Vec<_> = self.pending.lock().drain(..).collect();
        for failure in &drained {
            tracing::warn!(
                target: RELAY,
                thread = failure.thread_name(),
                message = failure.message(),
                "discarding unobserved callback failure"
            );
        }
        drained.len()
    }
}
