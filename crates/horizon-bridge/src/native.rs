//! The native toolkit seam.
//!
//! [`NativeToolkit`] lists the handful of primitives the bridge consumes from
//! the underlying GUI toolkit. [`NativeDispatcher`] is an in-process toolkit
//! with a real event queue, a dispatch thread, and native handle liveness. It
//! backs the tests and the demo, and is a starting point for wiring a real
//! toolkit.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use horizon_bridge::native::NativeDispatcher;
//!
//! let dispatcher = Arc::new(NativeDispatcher::spawn()?);
//! let (tx, rx) = crossbeam_channel::bounded(1);
//! dispatcher.post(move || tx.send(std::thread::current().name().map(String::from)).unwrap())?;
//! assert_eq!(rx.recv().unwrap().as_deref(), Some("horizon-native-dispatch"));
//! dispatcher.shutdown();
//! # Ok::<(), horizon_bridge::BridgeError>(())
//! ```

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use slotmap::{SlotMap, new_key_type};

use crate::error::{BridgeError, CallbackPanic, Result};
use crate::logging::targets::NATIVE;

/// A unit of work queued onto the native dispatch thread.
pub type NativeTask = Box<dyn FnOnce() + Send + 'static>;

new_key_type! {
    /// Identifies a native resource (window, control) owned by the toolkit.
    pub struct NativeHandle;
}

/// Primitives consumed from the native GUI toolkit.
pub trait NativeToolkit: Send + Sync + 'static {
    /// Whether the calling thread is the toolkit's dispatch thread.
    fn is_dispatch_thread(&self) -> bool;

    /// Queue `task` to run on the dispatch thread, in submission order.
    fn invoke_later(&self, task: NativeTask) -> Result<()>;

    /// Pump one pending native event on the calling thread.
    ///
    /// Only meaningful on the dispatch thread. Returns `false` if nothing was
    /// dispatched.
    fn dispatch_one(&self) -> bool;

    /// Block the dispatch thread until an event is pending, a wake is
    /// requested, or `timeout` elapses. Returns `true` if an event is pending.
    fn wait_for_event(&self, timeout: Option<Duration>) -> bool;

    /// Interrupt a blocked `wait_for_event`.
    fn wake_dispatch(&self);

    /// Whether `handle` still refers to a live native resource.
    fn is_alive(&self, handle: NativeHandle) -> bool;
}

/// Configuration for a [`NativeDispatcher`] with its own thread.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Name for the dispatch thread.
    pub name: String,
    /// Stack size for the dispatch thread in bytes. `None` uses the default.
    pub stack_size: Option<usize>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            name: "horizon-native-dispatch".to_string(),
            stack_size: None,
        }
    }
}

impl DispatcherConfig {
    /// Create a new configuration with the given thread name.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Builder for dispatchers with custom configuration.
#[derive(Debug, Default)]
pub struct DispatcherBuilder {
    config: DispatcherConfig,
}

impl DispatcherBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the dispatch thread name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set the stack size for the dispatch thread.
    pub fn stack_size(mut self, size: usize) -> Self {
        self.config.stack_size = Some(size);
        self
    }

    /// Build the dispatcher and start its thread.
    pub fn spawn(self) -> Result<NativeDispatcher> {
        NativeDispatcher::with_config(self.config)
    }
}

struct DispatchQueue {
    events: VecDeque<NativeTask>,
    woken: bool,
    running: bool,
}

/// State shared between the dispatcher handle and its thread.
struct DispatchShared {
    queue: Mutex<DispatchQueue>,
    available: Condvar,
    dispatched: AtomicU64,
    handles: Mutex<SlotMap<NativeHandle, ()>>,
}

impl DispatchShared {
    fn new() -> Self {
        Self {
            queue: Mutex::new(DispatchQueue {
                events: VecDeque::new(),
                woken: false,
                running: true,
            }),
            available: Condvar::new(),
            dispatched: AtomicU64::new(0),
            handles: Mutex::new(SlotMap::with_key()),
        }
    }

    fn pop(&self) -> Option<NativeTask> {
        self.queue.lock().events.pop_front()
    }

    fn run(&self, task: NativeTask) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
            let failure = CallbackPanic::from_payload(payload);
            tracing::error!(
                target: NATIVE,
                message = failure.message(),
                "native event handler panicked"
            );
        }
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }
}

/// An in-process native toolkit: one dispatch thread pumping a FIFO queue.
///
/// Created either with its own thread ([`spawn`](Self::spawn)) or bound to
/// the calling thread ([`attach_current`](Self::attach_current)), in which
/// case the caller pumps events itself, typically through a display running
/// in native mode.
pub struct NativeDispatcher {
    shared: Arc<DispatchShared>,
    dispatch_thread: ThreadId,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl NativeDispatcher {
    /// Start a dispatcher with default configuration on a new thread.
    pub fn spawn() -> Result<Self> {
        Self::with_config(DispatcherConfig::default())
    }

    /// Start a dispatcher with custom configuration on a new thread.
    pub fn with_config(config: DispatcherConfig) -> Result<Self> {
        let shared = Arc::new(DispatchShared::new());
        let thread_shared = shared.clone();

        let mut builder = thread::Builder::new().name(config.name.clone());
        if let Some(stack_size) = config.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let handle = builder
            .spawn(move || dispatch_loop(thread_shared))
            .map_err(|source| BridgeError::ThreadSpawn {
                name: config.name.clone(),
                source,
            })?;
        tracing::debug!(target: NATIVE, name = %config.name, "native dispatch thread started");

        Ok(Self {
            shared,
            dispatch_thread: handle.thread().id(),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Make the calling thread the dispatch thread.
    pub fn attach_current() -> Self {
        Self {
            shared: Arc::new(DispatchShared::new()),
            dispatch_thread: thread::current().id(),
            handle: Mutex::new(None),
        }
    }

    /// The dispatch thread's id.
    pub fn thread_id(&self) -> ThreadId {
        self.dispatch_thread
    }

    /// Queue a closure onto the dispatch thread.
    pub fn post<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.invoke_later(Box::new(f))
    }

    /// Whether the dispatcher still accepts events.
    pub fn is_running(&self) -> bool {
        self.shared.queue.lock().running
    }

    /// Number of queued, not yet dispatched events.
    pub fn pending_events(&self) -> usize {
        self.shared.queue.lock().events.len()
    }

    /// Total number of events dispatched so far.
    pub fn dispatched_count(&self) -> u64 {
        self.shared.dispatched.load(Ordering::Relaxed)
    }

    /// Allocate a live native handle.
    pub fn create_handle(&self) -> NativeHandle {
        self.shared.handles.lock().insert(())
    }

    /// Destroy a native handle. Returns `false` if it was already gone.
    pub fn destroy_handle(&self, handle: NativeHandle) -> bool {
        self.shared.handles.lock().remove(handle).is_some()
    }

    /// Stop accepting events and wait for the dispatch thread to finish.
    ///
    /// Events already queued are dispatched before the thread exits. When
    /// called on the dispatch thread itself the join is skipped.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock();
            if !queue.running {
                return;
            }
            queue.running = false;
            self.shared.available.notify_all();
        }

        if thread::current().id() == self.dispatch_thread {
            return;
        }
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                tracing::error!(target: NATIVE, "native dispatch thread panicked");
            }
            tracing::debug!(target: NATIVE, "native dispatch thread stopped");
        }
    }
}

impl NativeToolkit for NativeDispatcher {
    fn is_dispatch_thread(&self) -> bool {
        thread::current().id() == self.dispatch_thread
    }

    fn invoke_later(&self, task: NativeTask) -> Result<()> {
        let mut queue = self.shared.queue.lock();
        if !queue.running {
            return Err(BridgeError::ToolkitUnavailable);
        }
        queue.events.push_back(task);
        self.shared.available.notify_all();
        Ok(())
    }

    fn dispatch_one(&self) -> bool {
        if !self.is_dispatch_thread() {
            return false;
        }
        match self.shared.pop() {
            Some(task) => {
                self.shared.run(task);
                true
            }
            None => false,
        }
    }

    fn wait_for_event(&self, timeout: Option<Duration>) -> bool {
        if !self.is_dispatch_thread() {
            return false;
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut queue = self.shared.queue.lock();

        while queue.events.is_empty() && !queue.woken && queue.running {
            match deadline {
                Some(deadline) => {
                    if self
                        .shared
                        .available
                        .wait_until(&mut queue, deadline)
                        .timed_out()
                    {
                        break;
                    }
                }
                None => self.shared.available.wait(&mut queue),
            }
        }

        queue.woken = false;
        !queue.events.is_empty()
    }

    fn wake_dispatch(&self) {
        let mut queue = self.shared.queue.lock();
        queue.woken = true;
        self.shared.available.notify_all();
    }

    fn is_alive(&self, handle: NativeHandle) -> bool {
        self.shared.handles.lock().contains_key(handle)
    }
}

impl Drop for NativeDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

static_assertions::assert_impl_all!(NativeDispatcher: Send, Sync);

/// The dispatch thread's main loop.
fn dispatch_loop(shared: Arc<DispatchShared>) {
    loop {
        let task = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(task) = queue.events.pop_front() {
                    break Some(task);
                }
                if !queue.running {
                    break None;
                }
                shared.available.wait(&mut queue);
            }
        };

        match task {
            Some(task) => shared.run(task),
            None => break,
        }
    }
}
