//! Reconciles the owning thread's cooperative loop with the native toolkit's
//! own dispatch thread.
//!
//! # Native mode
//!
//! The owning thread *is* the toolkit's dispatch thread. `read_and_dispatch`
//! pumps one native event directly and `sleep` blocks in the toolkit's own
//! wait primitive.
//!
//! # Proxy mode
//!
//! The owning thread is some other thread. It claims the
//! [`ExclusiveSection`] when the bridge is created and holds it while
//! application code runs. Facade-bound work reaching the native thread is
//! wrapped in a [trampoline](EventLoopBridge::trampoline) that enters the
//! section, runs under the exception relay, and leaves. The owning thread's
//! `read_and_dispatch` hands the section over for exactly one such step and
//! takes it back, so application code observes a single cooperative loop
//! even though dispatch physically happens on another thread.
//!
//! Callbacks running on the native thread while it holds the section may
//! start nested loops; those pump the native queue directly, as in native
//! mode.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;

use crate::error::{BridgeError, Result};
use crate::logging::targets::EVENT_LOOP;
use crate::native::{NativeTask, NativeToolkit};
use crate::relay::ExceptionRelay;
use crate::section::ExclusiveSection;
use crate::thread_check::ThreadAffinity;

/// How the owning thread relates to the native dispatch thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopMode {
    /// The owning thread is the native dispatch thread.
    Native,
    /// The owning thread is separate; native work is trampolined through the
    /// exclusive section.
    Proxy,
}

/// The per-display event loop bridge.
pub struct EventLoopBridge {
    mode: LoopMode,
    owner: ThreadAffinity,
    section: ExclusiveSection,
    relay: Arc<ExceptionRelay>,
    toolkit: Arc<dyn NativeToolkit>,
    disposed: AtomicBool,
}

impl EventLoopBridge {
    /// Create a bridge owned by the calling thread.
    ///
    /// The mode is fixed here: native if the caller is the toolkit's dispatch
    /// thread, proxy otherwise. In proxy mode the caller claims the section.
    pub fn new(toolkit: Arc<dyn NativeToolkit>, relay: Arc<ExceptionRelay>) -> Result<Arc<Self>> {
        let mode = if toolkit.is_dispatch_thread() {
            LoopMode::Native
        } else {
            LoopMode::Proxy
        };

        let bridge = Arc::new(Self {
            mode,
            owner: ThreadAffinity::current(),
            section: ExclusiveSection::new(),
            relay,
            toolkit,
            disposed: AtomicBool::new(false),
        });

        if mode == LoopMode::Proxy {
            bridge.section.acquire()?;
        }
        tracing::debug!(target: EVENT_LOOP, ?mode, owner = ?bridge.owner.thread_id(), "event loop bridge created");
        Ok(bridge)
    }

    /// The bridge's mode.
    pub fn mode(&self) -> LoopMode {
        self.mode
    }

    /// The owning thread.
    pub fn owner(&self) -> ThreadId {
        self.owner.thread_id()
    }

    /// The toolkit this bridge drives.
    pub fn toolkit(&self) -> &Arc<dyn NativeToolkit> {
        &self.toolkit
    }

    /// The exclusive section.
    pub fn section(&self) -> &ExclusiveSection {
        &self.section
    }

    /// The relay receiving failures from trampolined work.
    pub fn relay(&self) -> &Arc<ExceptionRelay> {
        &self.relay
    }

    /// Whether the bridge has been shut down.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Whether the caller may touch facade state right now: it is the owning
    /// thread, or it holds the section on the owner's behalf.
    pub fn has_access(&self) -> bool {
        self.owner.is_same_thread() || self.section.is_held_by_current()
    }

    /// Check thread access, then liveness.
    pub fn check_access(&self) -> Result<()> {
        if !self.has_access() {
            return Err(BridgeError::ThreadInvalidAccess);
        }
        if self.is_disposed() {
            return Err(BridgeError::DeviceDisposed);
        }
        Ok(())
    }

    /// Wrap `f` so it runs on the native thread on the owning thread's behalf.
    ///
    /// In proxy mode the task enters the section first and is skipped if the
    /// bridge has been shut down by then. Panics are stored in the relay, so
    /// they never unwind into the toolkit.
    pub fn trampoline<F>(self: &Arc<Self>, f: F) -> NativeTask
    where
        F: FnOnce() + Send + 'static,
    {
        let bridge: Weak<Self> = Arc::downgrade(self);
        Box::new(move || {
            let Some(bridge) = bridge.upgrade() else {
                return;
            };
            if bridge.is_disposed() {
                tracing::trace!(target: EVENT_LOOP, "skipping native work for disposed display");
                return;
            }
            match bridge.mode {
                LoopMode::Native => {
                    bridge.relay.run_guarded(f);
                }
                LoopMode::Proxy => {
                    let _guard = match bridge.section.enter() {
                        Ok(guard) => guard,
                        Err(err) => {
                            tracing::trace!(target: EVENT_LOOP, %err, "skipping native work");
                            return;
                        }
                    };
                    bridge.relay.run_guarded(f);
                }
            }
        })
    }

    /// Queue `f` onto the native thread through the trampoline.
    pub fn invoke_later<F>(self: &Arc<Self>, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_disposed() {
            return Err(BridgeError::DeviceDisposed);
        }
        self.toolkit.invoke_later(self.trampoline(f))
    }

    /// Let one native event run on the owning thread's behalf.
    ///
    /// On the dispatch thread this pumps the native queue directly. On the
    /// owning thread in proxy mode it yields the section for one step if a
    /// trampoline is waiting. Returns whether anything ran.
    pub fn dispatch_native(&self) -> Result<bool> {
        if self.toolkit.is_dispatch_thread() {
            return Ok(self.toolkit.dispatch_one());
        }
        if self.section.is_closed() {
            return Ok(false);
        }
        self.section.yield_step()
    }

    /// Block until there is something to do or a wake arrives.
    ///
    /// Returns `true` if native work is pending.
    pub fn sleep(&self) -> bool {
        if self.toolkit.is_dispatch_thread() {
            self.toolkit.wait_for_event(None)
        } else {
            self.section.wait_for_request(None)
        }
    }

    /// Interrupt a blocked [`sleep`](Self::sleep), whichever primitive it is
    /// blocked in.
    pub fn wake(&self) {
        self.section.wake();
        self.toolkit.wake_dispatch();
    }

    /// Stop admitting trampolines.
    ///
    /// Pending native work for this bridge becomes a no-op and trampolines
    /// blocked on the section are released.
    pub fn shutdown(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.section.close();
        tracing::debug!(target: EVENT_LOOP, mode = ?self.mode, "event loop bridge shut down");
    }
}

impl fmt::Debug for EventLoopBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoopBridge")
            .field("mode", &self.mode)
            .field("owner", &self.owner.thread_id())
            .field("section", &self.section)
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

static_assertions::assert_impl_all!(EventLoopBridge: Send, Sync);
