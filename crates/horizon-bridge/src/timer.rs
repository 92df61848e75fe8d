//! One-shot timers keyed by runnable identity.
//!
//! A [`TimerService`] owns a single sleeper thread that waits for the earliest
//! deadline. When a timer expires the service hands its runnable to a fire
//! callback supplied by the display, which queues it onto the owning thread
//! through the native toolkit. Timers never run on the sleeper thread.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use parking_lot::Mutex;
use slotmap::{SlotMap, new_key_type};

use crate::error::{BridgeError, Result};
use crate::logging::targets::TIMER;

new_key_type! {
    /// A unique identifier for a scheduled timer.
    pub struct TimerId;
}

/// A shareable piece of work whose identity is the allocation it points to.
///
/// Cloning a `Runnable` yields the same identity, so a clone can be used to
/// reschedule or cancel a timer registered with the original.
#[derive(Clone)]
pub struct Runnable(Arc<dyn Fn() + Send + Sync + 'static>);

impl Runnable {
    /// Wrap a closure.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Run the wrapped closure.
    pub fn run(&self) {
        (self.0)()
    }

    fn addr(&self) -> *const () {
        Arc::as_ptr(&self.0) as *const ()
    }
}

impl PartialEq for Runnable {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for Runnable {}

impl Hash for Runnable {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl fmt::Debug for Runnable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Runnable").field(&self.addr()).finish()
    }
}

/// Internal timer data.
struct TimerData {
    runnable: Runnable,
    fire_at: Instant,
}

/// An entry in the sleeper's queue (min-heap by fire time).
#[derive(Debug, Clone, Copy)]
struct TimerQueueEntry {
    id: TimerId,
    fire_at: Instant,
}

impl PartialEq for TimerQueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at
    }
}

impl Eq for TimerQueueEntry {}

impl PartialOrd for TimerQueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerQueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse order for min-heap (BinaryHeap is max-heap by default).
        other.fire_at.cmp(&self.fire_at)
    }
}

#[derive(Default)]
struct TimerRegistry {
    timers: SlotMap<TimerId, TimerData>,
    by_runnable: HashMap<Runnable, TimerId>,
    shut_down: bool,
}

impl TimerRegistry {
    fn remove(&mut self, id: TimerId) -> Option<TimerData> {
        let data = self.timers.remove(id)?;
        self.by_runnable.remove(&data.runnable);
        Some(data)
    }
}

enum TimerCommand {
    Schedule(TimerQueueEntry),
    Shutdown,
}

/// Callback that receives expired runnables on the sleeper thread.
pub type FireCallback = Box<dyn Fn(Runnable) + Send + 'static>;

/// Schedules runnables to be queued for the owning thread after a delay.
///
/// At most one timer exists per runnable identity; scheduling a runnable that
/// is already pending replaces its deadline.
pub struct TimerService {
    registry: Arc<Mutex<TimerRegistry>>,
    commands: Sender<TimerCommand>,
    sleeper: Mutex<Option<JoinHandle<()>>>,
}

impl TimerService {
    /// Start a timer service whose expirations are handed to `fire`.
    ///
    /// `thread_name` names the sleeper thread.
    pub fn new(thread_name: impl Into<String>, fire: FireCallback) -> Result<Self> {
        let name = thread_name.into();
        let registry = Arc::new(Mutex::new(TimerRegistry::default()));
        let (commands, receiver) = unbounded();

        let thread_registry = registry.clone();
        let sleeper = thread::Builder::new()
            .name(name.clone())
            .spawn(move || sleeper_loop(receiver, thread_registry, fire))
            .map_err(|source| BridgeError::ThreadSpawn { name, source })?;

        Ok(Self {
            registry,
            commands,
            sleeper: Mutex::new(Some(sleeper)),
        })
    }

    /// Schedule `runnable` to fire once after `delay`.
    ///
    /// Replaces any pending timer for the same runnable. Returns the new
    /// timer's id.
    pub fn schedule(&self, delay: Duration, runnable: &Runnable) -> Result<TimerId> {
        let fire_at = Instant::now() + delay;
        let id = {
            let mut registry = self.registry.lock();
            if registry.shut_down {
                return Err(BridgeError::DeviceDisposed);
            }
            if let Some(previous) = registry.by_runnable.get(runnable).copied() {
                registry.remove(previous);
                tracing::trace!(target: TIMER, ?previous, "timer replaced");
            }
            let id = registry.timers.insert(TimerData {
                runnable: runnable.clone(),
                fire_at,
            });
            registry.by_runnable.insert(runnable.clone(), id);
            id
        };

        self.commands
            .send(TimerCommand::Schedule(TimerQueueEntry { id, fire_at }))
            .map_err(|_| BridgeError::DeviceDisposed)?;
        tracing::trace!(target: TIMER, ?id, ?delay, "timer scheduled");
        Ok(id)
    }

    /// Cancel the pending timer for `runnable`.
    ///
    /// Returns `false` if no timer was pending, including when it has already
    /// fired.
    pub fn cancel(&self, runnable: &Runnable) -> bool {
        let mut registry = self.registry.lock();
        let Some(id) = registry.by_runnable.get(runnable).copied() else {
            return false;
        };
        registry.remove(id);
        tracing::trace!(target: TIMER, ?id, "timer cancelled");
        true
    }

    /// Whether a timer is pending for `runnable`.
    pub fn is_scheduled(&self, runnable: &Runnable) -> bool {
        self.registry.lock().by_runnable.contains_key(runnable)
    }

    /// Time left before the pending timer for `runnable` fires.
    pub fn remaining(&self, runnable: &Runnable) -> Option<Duration> {
        let registry = self.registry.lock();
        let id = registry.by_runnable.get(runnable)?;
        let data = registry.timers.get(*id)?;
        Some(data.fire_at.saturating_duration_since(Instant::now()))
    }

    /// Number of pending timers.
    pub fn active_count(&self) -> usize {
        self.registry.lock().timers.len()
    }

    /// Cancel every timer and stop the sleeper thread.
    ///
    /// Idempotent.
    pub fn shutdown(&self) {
        // Runnables are dropped outside the registry lock.
        let cancelled = {
            let mut registry = self.registry.lock();
            registry.shut_down = true;
            registry.by_runnable.clear();
            std::mem::take(&mut registry.timers)
        };
        let _ = self.commands.send(TimerCommand::Shutdown);

        let Some(handle) = self.sleeper.lock().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            // Dropped from the fire callback; the loop exits on its own.
            return;
        }
        if handle.join().is_err() {
            tracing::error!(target: TIMER, "timer thread panicked");
        }
        tracing::debug!(target: TIMER, cancelled = cancelled.len(), "timer service stopped");
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[tracing::instrument(skip_all, target = "horizon_bridge::timer", level = "trace")]
fn sleeper_loop(
    commands: Receiver<TimerCommand>,
    registry: Arc<Mutex<TimerRegistry>>,
    fire: FireCallback,
) {
    let mut queue: BinaryHeap<TimerQueueEntry> = BinaryHeap::new();

    loop {
        let now = Instant::now();
        while let Some(entry) = queue.peek().copied() {
            if entry.fire_at > now {
                break;
            }
            queue.pop();

            // Cancelled or replaced timers are no longer in the registry.
            let expired = registry.lock().remove(entry.id);
            if let Some(data) = expired {
                tracing::trace!(target: TIMER, id = ?entry.id, "timer expired");
                fire(data.runnable);
            }
        }

        let command = match queue.peek() {
            Some(next) => commands.recv_deadline(next.fire_at),
            None => commands.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match command {
            Ok(TimerCommand::Schedule(entry)) => queue.push(entry),
            Ok(TimerCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
}
