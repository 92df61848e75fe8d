//! Deferred call queue for cross-thread execution on the owning thread.
//!
//! Any thread may submit callbacks; only the owning thread (or the native
//! thread while it holds the exclusive section on the owner's behalf) drains
//! them, at well-defined loop points.
//!
//! # How It Works
//!
//! 1. [`Synchronizer::async_exec`] appends the callback and returns at once.
//!
//! 2. [`Synchronizer::sync_exec`] runs inline when the caller is already
//!    allowed to touch the facade. Otherwise it appends the callback together
//!    with a completion latch and blocks on that latch. The callback's result,
//!    or its panic, travels back through the latch to the caller.
//!
//! 3. [`Synchronizer::run_async_messages`] pops entries one at a time, so a
//!    callback may freely enqueue further callbacks or dispose the display.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, ThreadId};

use crossbeam_channel::bounded;
use parking_lot::{Mutex, RwLock};

use crate::error::{BridgeError, CallbackPanic, Result};
use crate::logging::targets::SYNC;
use crate::relay::ExceptionRelay;

/// A boxed deferred callback.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// One pending deferred call.
struct DeferredCall {
    callback: Callback,
    /// Thread that submitted the call.
    caller: ThreadId,
    /// Set for `sync_exec` entries. Their callback reports completion through
    /// its own latch and never unwinds.
    synchronous: bool,
}

#[derive(Default)]
struct QueueState {
    calls: VecDeque<DeferredCall>,
    closed: bool,
}

/// Owns the deferred call queue of one display.
pub struct Synchronizer {
    queue: Mutex<QueueState>,
    /// Thread whose `sync_exec` callback is currently running.
    sync_thread: RwLock<Option<ThreadId>>,
    /// Maximum calls per non-exhaustive drain. `None` drains every call that
    /// was queued when the drain started.
    batch_size: Option<usize>,
}

impl Synchronizer {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::with_batch_size(None)
    }

    /// Create an empty queue that runs at most `batch_size` calls per cycle.
    pub fn with_batch_size(batch_size: Option<usize>) -> Self {
        Self {
            queue: Mutex::new(QueueState::default()),
            sync_thread: RwLock::new(None),
            batch_size,
        }
    }

    fn push(&self, call: DeferredCall) -> Result<()> {
        let mut queue = self.queue.lock();
        if queue.closed {
            return Err(BridgeError::DeviceDisposed);
        }
        queue.calls.push_back(call);
        Ok(())
    }

    /// Queue `f` for the owning thread and return immediately.
    ///
    /// A panic in `f` is relayed to the owning thread at its next loop
    /// boundary, never to the submitter.
    pub fn async_exec<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let caller = thread::current().id();
        self.push(DeferredCall {
            callback: Box::new(f),
            caller,
            synchronous: false,
        })?;
        tracing::trace!(target: SYNC, ?caller, "async call queued");
        Ok(())
    }

    /// Run `f` on the owning thread and return its result.
    ///
    /// With `run_inline` set, `f` runs immediately on the calling thread.
    /// Otherwise it is queued, `wake` is invoked to rouse the owning thread,
    /// and the caller blocks until the call has been drained and run. A panic
    /// in `f` comes back as `FailedExec`; a call dropped unrun because the
    /// display went away comes back as `DeviceDisposed`.
    pub fn sync_exec<F, R, W>(&self, f: F, run_inline: bool, wake: W) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
        W: FnOnce(),
    {
        if run_inline {
            return panic::catch_unwind(AssertUnwindSafe(f))
                .map_err(|payload| CallbackPanic::from_payload(payload).into());
        }

        let (latch, completion) = bounded::<std::result::Result<R, CallbackPanic>>(1);
        let caller = thread::current().id();

        self.push(DeferredCall {
            callback: Box::new(move || {
                let outcome =
                    panic::catch_unwind(AssertUnwindSafe(f)).map_err(CallbackPanic::from_payload);
                let _ = latch.send(outcome);
            }),
            caller,
            synchronous: true,
        })?;
        tracing::trace!(target: SYNC, ?caller, "sync call queued, waiting for completion");
        wake();

        match completion.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(failure)) => Err(BridgeError::FailedExec(failure)),
            Err(_) => Err(BridgeError::DeviceDisposed),
        }
    }

    /// Drain queued calls on the current thread.
    ///
    /// With `all` unset, runs the calls that were queued when the drain began
    /// (capped by the batch size); calls they enqueue wait for the next cycle.
    /// With `all` set, runs until the queue is empty. `is_live` is checked
    /// after every call so a callback that disposes the display stops the
    /// drain. An async panic is stored in `relay` and also stops the drain;
    /// the remaining calls run in later cycles.
    ///
    /// Returns `true` if at least one call ran.
    pub fn run_async_messages<L>(&self, all: bool, relay: &ExceptionRelay, is_live: L) -> bool
    where
        L: Fn() -> bool,
    {
        let budget = if all {
            usize::MAX
        } else {
            let queued = self.pending_count();
            self.batch_size.map_or(queued, |batch| queued.min(batch))
        };

        let mut ran = 0;
        while ran < budget {
            let Some(call) = self.queue.lock().calls.pop_front() else {
                break;
            };
            ran += 1;

            let completed = self.run_call(call, relay);
            if !completed || !is_live() {
                break;
            }
        }

        if ran > 0 {
            tracing::trace!(target: SYNC, count = ran, "deferred calls drained");
        }
        ran > 0
    }

    fn run_call(&self, call: DeferredCall, relay: &ExceptionRelay) -> bool {
        if call.synchronous {
            let previous = self.sync_thread.write().replace(call.caller);
            (call.callback)();
            *self.sync_thread.write() = previous;
            true
        } else {
            relay.run_guarded(call.callback)
        }
    }

    /// Close the queue if it is empty.
    ///
    /// Returns `true` once the queue is closed. Later submissions fail with
    /// `DeviceDisposed`.
    pub fn close_if_drained(&self) -> bool {
        let mut queue = self.queue.lock();
        if queue.calls.is_empty() {
            queue.closed = true;
        }
        queue.closed
    }

    /// Close the queue and drop every pending call unrun.
    ///
    /// Blocked `sync_exec` callers wake up with `DeviceDisposed`.
    pub fn abandon(&self) -> usize {
        let dropped: Vec<_> = {
            let mut queue = self.queue.lock();
            queue.closed = true;
            queue.calls.drain(..).collect()
        };
        if !dropped.is_empty() {
            tracing::warn!(target: SYNC, count = dropped.len(), "dropping undrained deferred calls");
        }
        dropped.len()
    }

    /// Whether the queue accepts no more calls.
    pub fn is_closed(&self) -> bool {
        self.queue.lock().closed
    }

    /// Number of queued calls.
    pub fn pending_count(&self) -> usize {
        self.queue.lock().calls.len()
    }

    /// Thread whose `sync_exec` callback is running right now, if any.
    pub fn sync_thread(&self) -> Option<ThreadId> {
        *self.sync_thread.read()
    }
}

impl Default for Synchronizer {
    fn default() -> Self {
        Self::new()
    }
}
