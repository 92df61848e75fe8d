//! The per-thread facade root.
//!
//! A [`Display`] belongs to the thread that created it. That thread drives the
//! cooperative loop:
//!
//! ```no_run
//! use std::sync::Arc;
//! use horizon_bridge::{Display, NativeDispatcher};
//!
//! let toolkit = Arc::new(NativeDispatcher::spawn()?);
//! let display = Display::new(toolkit)?;
//!
//! let remote = display.clone();
//! std::thread::spawn(move || {
//!     remote.async_exec(|| println!("hello from the UI thread")).unwrap();
//! });
//!
//! while !display.is_disposed() {
//!     if !display.read_and_dispatch()? {
//!         display.sleep()?;
//!     }
//! }
//! # Ok::<(), horizon_bridge::BridgeError>(())
//! ```
//!
//! Any thread may call [`Display::async_exec`], [`Display::sync_exec`],
//! [`Display::wake`], and [`Display::post_event`]. Everything else must be
//! called on the owning thread, or by the native dispatch thread while it
//! runs a callback on the owner's behalf.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::bridge::{EventLoopBridge, LoopMode};
use crate::error::{BridgeError, CallbackPanic, Result};
use crate::event::{DeferredEvents, Event, EventKind, EventTable, ListenerId};
use crate::logging::DisplayDebug;
use crate::logging::targets::DISPLAY;
use crate::native::{NativeHandle, NativeToolkit};
use crate::registry::{self, Registered};
use crate::relay::{ExceptionRelay, RelayPolicy};
use crate::synchronizer::{Callback, Synchronizer};
use crate::thread_check;
use crate::timer::{Runnable, TimerService};

/// Decides what happens to a relayed callback failure.
///
/// Returning `Ok(())` consumes the failure; returning an error makes the loop
/// call that observed it fail with that error.
pub type ExceptionHandler = Arc<dyn Fn(CallbackPanic) -> Result<()> + Send + Sync + 'static>;

/// Configuration for creating a [`Display`].
#[derive(Debug, Clone)]
pub struct DisplayConfig {
    /// Name used in diagnostics and for the timer thread.
    pub name: String,
    /// What to do with failures that arrive while one is pending.
    pub relay_policy: RelayPolicy,
    /// Maximum deferred calls run per `read_and_dispatch`. `None` runs every
    /// call queued when the cycle started.
    pub async_batch: Option<usize>,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            name: "horizon-display".to_string(),
            relay_policy: RelayPolicy::default(),
            async_batch: None,
        }
    }
}

impl DisplayConfig {
    /// Create a new configuration with the given name.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Builder for displays with custom configuration.
#[derive(Debug, Default)]
pub struct DisplayBuilder {
    config: DisplayConfig,
}

impl DisplayBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the display name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set the relay policy.
    pub fn relay_policy(mut self, policy: RelayPolicy) -> Self {
        self.config.relay_policy = policy;
        self
    }

    /// Cap the number of deferred calls run per loop cycle.
    pub fn async_batch(mut self, batch: usize) -> Self {
        self.config.async_batch = Some(batch);
        self
    }

    /// Create the display on the calling thread.
    pub fn build(self, toolkit: Arc<dyn NativeToolkit>) -> Result<Display> {
        Display::with_config(toolkit, self.config)
    }
}

struct DisplayInner {
    config: DisplayConfig,
    thread: ThreadId,
    bridge: Arc<EventLoopBridge>,
    relay: Arc<ExceptionRelay>,
    synchronizer: Synchronizer,
    timers: TimerService,
    listeners: EventTable,
    deferred: DeferredEvents,
    dispose_list: Mutex<Vec<Callback>>,
    exception_handler: RwLock<Option<ExceptionHandler>>,
    disposing: AtomicBool,
    registration: Weak<dyn Registered>,
}

impl Registered for DisplayInner {
    fn is_live(&self) -> bool {
        !self.bridge.is_disposed()
    }
}

impl Drop for DisplayInner {
    fn drop(&mut self) {
        registry::deregister(self.thread, &self.registration);
        if self.bridge.is_disposed() {
            return;
        }
        tracing::debug!(target: DISPLAY, name = %self.config.name, "display dropped without dispose");
        self.timers.shutdown();
        self.bridge.shutdown();
        self.synchronizer.abandon();
        self.deferred.clear();
        self.relay.discard_all();
    }
}

/// The facade root owned by one thread.
///
/// Cloning yields another handle to the same display.
#[derive(Clone)]
pub struct Display {
    inner: Arc<DisplayInner>,
}

static_assertions::assert_impl_all!(Display: Send, Sync);

impl Display {
    /// Create a display owned by the calling thread with default configuration.
    pub fn new(toolkit: Arc<dyn NativeToolkit>) -> Result<Self> {
        Self::with_config(toolkit, DisplayConfig::default())
    }

    /// Create a display owned by the calling thread.
    ///
    /// Fails with `DisplayExists` if the thread already owns a live display.
    #[tracing::instrument(skip(toolkit), target = "horizon_bridge::display", level = "debug")]
    pub fn with_config(toolkit: Arc<dyn NativeToolkit>, config: DisplayConfig) -> Result<Self> {
        if config.async_batch == Some(0) {
            return Err(BridgeError::InvalidArgument("async batch size must be positive"));
        }

        let thread = thread::current().id();
        let relay = Arc::new(ExceptionRelay::new(config.relay_policy));
        let bridge = EventLoopBridge::new(toolkit, relay.clone())?;

        let fire_bridge = Arc::downgrade(&bridge);
        let timers = TimerService::new(
            format!("{}-timers", config.name),
            Box::new(move |runnable: Runnable| {
                let Some(bridge) = fire_bridge.upgrade() else {
                    return;
                };
                if let Err(err) = bridge.invoke_later(move || runnable.run()) {
                    tracing::debug!(target: DISPLAY, %err, "dropping expired timer");
                }
            }),
        )?;
        let synchronizer = Synchronizer::with_batch_size(config.async_batch);

        let inner = Arc::new_cyclic(|weak: &Weak<DisplayInner>| {
            let registration: Weak<dyn Registered> = weak.clone();
            DisplayInner {
                config,
                thread,
                bridge,
                relay,
                synchronizer,
                timers,
                listeners: EventTable::new(),
                deferred: DeferredEvents::new(),
                dispose_list: Mutex::new(Vec::new()),
                exception_handler: RwLock::new(None),
                disposing: AtomicBool::new(false),
                registration,
            }
        });

        registry::register(thread, inner.registration.clone())?;
        tracing::debug!(
            target: DISPLAY,
            name = %inner.config.name,
            mode = ?inner.bridge.mode(),
            "display created"
        );
        Ok(Self { inner })
    }

    /// Start configuring a display.
    pub fn builder() -> DisplayBuilder {
        DisplayBuilder::new()
    }

    /// The display's name.
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// The owning thread.
    pub fn thread(&self) -> ThreadId {
        self.inner.thread
    }

    /// Whether the owning thread is the toolkit's dispatch thread.
    pub fn mode(&self) -> LoopMode {
        self.inner.bridge.mode()
    }

    /// The toolkit behind this display.
    pub fn toolkit(&self) -> &Arc<dyn NativeToolkit> {
        self.inner.bridge.toolkit()
    }

    /// Whether the display has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.inner.bridge.is_disposed()
    }

    /// Fail unless called with access to this display and before disposal.
    pub fn check_device(&self) -> Result<()> {
        self.inner.bridge.check_access()
    }

    /// Like [`check_device`](Self::check_device), and additionally fail with
    /// `WidgetDisposed` if `handle` has been destroyed.
    pub fn check_widget(&self, handle: NativeHandle) -> Result<()> {
        self.check_device()?;
        if !self.toolkit().is_alive(handle) {
            return Err(BridgeError::WidgetDisposed);
        }
        Ok(())
    }

    /// Panic unless the caller may touch facade state: the owning thread, or
    /// the native thread while it holds the section for a callback.
    ///
    /// For widget facades that prefer a hard failure over
    /// [`check_device`](Self::check_device).
    ///
    /// # Panics
    ///
    /// Panics with the offending thread's name when called without access.
    #[track_caller]
    pub fn assert_widget_thread(&self) {
        if !self.inner.bridge.has_access() {
            thread_check::access_violation(self.inner.thread, "widget accessed from wrong thread");
        }
    }

    /// Queue `f` to run on the owning thread at its next loop cycle.
    ///
    /// Never blocks. A panic in `f` is re-raised on the owning thread, not
    /// here.
    pub fn async_exec<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_disposed() {
            return Err(BridgeError::DeviceDisposed);
        }
        self.inner.synchronizer.async_exec(f)?;
        self.wake_owner();
        Ok(())
    }

    /// Run `f` on the owning thread and wait for its result.
    ///
    /// Runs inline when called on the owning thread (or by the section
    /// holder). A panic in `f` is returned to this caller as `FailedExec`.
    pub fn sync_exec<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_disposed() {
            return Err(BridgeError::DeviceDisposed);
        }
        let inline = self.inner.bridge.has_access();
        self.inner
            .synchronizer
            .sync_exec(f, inline, || self.wake_owner())
    }

    /// Run `runnable` on the owning thread after `delay_ms` milliseconds.
    ///
    /// Scheduling a runnable that is already pending replaces its deadline. A
    /// negative delay cancels it instead. Cancellation is best-effort: a timer
    /// that has already expired may still run once.
    pub fn timer_exec(&self, delay_ms: i64, runnable: &Runnable) -> Result<()> {
        self.check_device()?;
        if delay_ms < 0 {
            self.inner.timers.cancel(runnable);
            return Ok(());
        }
        self.inner
            .timers
            .schedule(Duration::from_millis(delay_ms.unsigned_abs()), runnable)?;
        Ok(())
    }

    /// Run one cycle of the loop.
    ///
    /// Lets one native event run, delivers posted events, and drains one batch
    /// of deferred calls, re-raising any relayed failure at each step. Returns
    /// `true` if anything was processed, meaning the caller should call again
    /// before sleeping.
    #[tracing::instrument(skip(self), target = "horizon_bridge::event_loop", level = "trace")]
    pub fn read_and_dispatch(&self) -> Result<bool> {
        self.check_device()?;
        self.throw_if_pending()?;

        let dispatched = self.inner.bridge.dispatch_native()?;
        self.throw_if_pending()?;

        let delivered = self.drain_events();
        self.throw_if_pending()?;

        let ran = self.run_async_messages(false);
        self.throw_if_pending()?;

        Ok(dispatched || delivered || ran || self.is_disposed())
    }

    /// Block until there is work to do or [`wake`](Self::wake) is called.
    ///
    /// Returns immediately if deferred calls or posted events are already
    /// waiting.
    #[tracing::instrument(skip(self), target = "horizon_bridge::event_loop", level = "trace")]
    pub fn sleep(&self) -> Result<bool> {
        self.check_device()?;
        if self.inner.synchronizer.pending_count() > 0 || !self.inner.deferred.is_empty() {
            return Ok(true);
        }
        Ok(self.inner.bridge.sleep())
    }

    /// Wake the owning thread if it is blocked in [`sleep`](Self::sleep).
    ///
    /// Callable from any thread; on the owning thread itself it does nothing.
    /// Fails fast on a disposed display.
    pub fn wake(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(BridgeError::DeviceDisposed);
        }
        if thread::current().id() != self.inner.thread {
            self.wake_owner();
        }
        Ok(())
    }

    fn wake_owner(&self) {
        self.inner.bridge.wake();
    }

    /// The thread whose `sync_exec` callback is running right now.
    pub fn sync_thread(&self) -> Result<Option<ThreadId>> {
        self.check_device()?;
        Ok(self.inner.synchronizer.sync_thread())
    }

    /// Install a handler that sees relayed failures before they are
    /// re-raised.
    pub fn set_exception_handler<F>(&self, handler: F) -> Result<()>
    where
        F: Fn(CallbackPanic) -> Result<()> + Send + Sync + 'static,
    {
        self.check_device()?;
        *self.inner.exception_handler.write() = Some(Arc::new(handler));
        Ok(())
    }

    /// Remove the exception handler; relayed failures propagate again.
    pub fn clear_exception_handler(&self) -> Result<()> {
        self.check_device()?;
        self.inner.exception_handler.write().take();
        Ok(())
    }

    /// Re-raise the oldest relayed failure, if any, through the exception
    /// handler.
    pub fn throw_if_pending(&self) -> Result<()> {
        let Some(failure) = self.inner.relay.take() else {
            return Ok(());
        };
        tracing::debug!(
            target: DISPLAY,
            thread = failure.thread_name(),
            message = failure.message(),
            "re-raising relayed failure"
        );
        let handler = self.inner.exception_handler.read().clone();
        match handler {
            Some(handler) => handler(failure),
            None => Err(BridgeError::FailedExec(failure)),
        }
    }

    fn drain_events(&self) -> bool {
        let inner = &self.inner;
        inner
            .deferred
            .drain(&inner.listeners, inner.bridge.toolkit().as_ref(), &inner.relay)
    }

    fn run_async_messages(&self, all: bool) -> bool {
        let inner = &self.inner;
        inner
            .synchronizer
            .run_async_messages(all, &inner.relay, || !inner.bridge.is_disposed())
    }

    /// Register `listener` for display events of `kind`.
    pub fn add_listener<F>(&self, kind: EventKind, listener: F) -> Result<ListenerId>
    where
        F: Fn(&mut Event) + Send + Sync + 'static,
    {
        self.check_device()?;
        Ok(self.inner.listeners.add(kind, listener))
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> Result<bool> {
        self.check_device()?;
        Ok(self.inner.listeners.remove(id))
    }

    /// Deliver `event` to its listeners right away.
    pub fn send_event(&self, event: &mut Event) -> Result<()> {
        self.check_device()?;
        self.inner.listeners.send(event);
        Ok(())
    }

    /// Queue `event` for delivery at the owning thread's next loop cycle.
    ///
    /// Callable from any thread. Events targeting a handle that has been
    /// destroyed by then are dropped.
    pub fn post_event(&self, event: Event) -> Result<()> {
        if self.is_disposed() {
            return Err(BridgeError::DeviceDisposed);
        }
        self.inner.deferred.post(event);
        self.wake_owner();
        Ok(())
    }

    /// Register `f` to run at the end of disposal.
    pub fn dispose_exec<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.check_device()?;
        self.inner.dispose_list.lock().push(Box::new(f));
        Ok(())
    }

    /// Ask the display to close.
    ///
    /// `Close` listeners may veto by clearing `doit`; otherwise the display is
    /// disposed.
    pub fn close(&self) -> Result<()> {
        self.check_device()?;
        let mut event = Event::new(EventKind::Close);
        self.inner.listeners.send(&mut event);
        if !event.doit {
            tracing::debug!(target: DISPLAY, name = %self.name(), "close vetoed");
            return Ok(());
        }
        self.dispose()
    }

    /// Dispose the display.
    ///
    /// Sends `Dispose` to listeners, runs every queued deferred call, cancels
    /// timers, releases native work waiting on the section, and runs the
    /// `dispose_exec` callbacks. A failure relayed during all of that is
    /// returned here; further ones are logged and dropped. Disposing twice is
    /// a no-op.
    #[tracing::instrument(skip(self), target = "horizon_bridge::display", level = "debug")]
    pub fn dispose(&self) -> Result<()> {
        if self.is_disposed() {
            return Ok(());
        }
        self.check_device()?;
        let inner = &self.inner;
        if inner.disposing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut event = Event::new(EventKind::Dispose);
        inner.relay.run_guarded(|| inner.listeners.send(&mut event));

        loop {
            self.drain_events();
            self.run_async_messages(true);
            if inner.synchronizer.close_if_drained() && inner.deferred.is_empty() {
                break;
            }
        }

        inner.timers.shutdown();
        inner.bridge.shutdown();

        let disposers = std::mem::take(&mut *inner.dispose_list.lock());
        for callback in disposers {
            inner.relay.run_guarded(callback);
        }

        registry::deregister(inner.thread, &inner.registration);
        tracing::debug!(target: DISPLAY, name = %inner.config.name, "display disposed");

        let result = self.throw_if_pending();
        let discarded = inner.relay.discard_all();
        if discarded > 0 {
            tracing::warn!(target: DISPLAY, discarded, "failures left unobserved at disposal");
        }
        result
    }

    /// Snapshot the display's internal state for debugging.
    pub fn debug_snapshot(&self) -> DisplayDebug {
        let inner = &self.inner;
        let section = inner.bridge.section();
        DisplayDebug {
            name: inner.config.name.clone(),
            mode: inner.bridge.mode(),
            owner: inner.thread,
            disposed: inner.bridge.is_disposed(),
            section_holder: section.holder(),
            section_waiting: section.waiting_count(),
            pending_calls: inner.synchronizer.pending_count(),
            pending_failures: inner.relay.pending_count(),
            active_timers: inner.timers.active_count(),
            deferred_events: inner.deferred.len(),
            listeners: inner.listeners.len(),
        }
    }
}

impl fmt::Debug for Display {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Display")
            .field("name", &self.inner.config.name)
            .field("thread", &self.inner.thread)
            .field("mode", &self.inner.bridge.mode())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}
