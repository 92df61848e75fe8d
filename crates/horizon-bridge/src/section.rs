//! The exclusive section serializing access to facade state.
//!
//! At most one actor is inside the section at a time. In proxy mode the
//! owning thread claims the section when its display is created and keeps it
//! while application code runs; the native dispatch thread must enter the
//! section before running any facade callback, and can only do so while the
//! owning thread has handed it over from inside `read_and_dispatch`.
//!
//! The section is re-entrant for its holder. The holder's depth is saved when
//! the owning thread yields and restored when it reclaims, so nested loops on
//! either side never deadlock against themselves.

use std::marker::PhantomData;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{BridgeError, Result};
use crate::logging::targets::SECTION;

#[derive(Debug, Default)]
struct SectionState {
    /// Thread currently inside the section.
    holder: Option<ThreadId>,
    /// Re-entrant depth of the holder.
    depth: usize,
    /// Actors blocked in `enter`.
    waiting: usize,
    /// Completed turns: bumped every time the depth falls back to zero.
    steps: u64,
    /// A wake request not yet observed by `wait_for_request`.
    wake_requested: bool,
    /// No new holders are admitted once set.
    closed: bool,
}

/// A re-entrant lock plus monitor shared by the owning thread and the native
/// dispatch thread.
#[derive(Debug, Default)]
pub struct ExclusiveSection {
    state: Mutex<SectionState>,
    monitor: Condvar,
}

/// Scoped guard returned by [`ExclusiveSection::enter`].
///
/// Leaves the section when dropped. The guard is tied to the entering thread
/// and is therefore neither `Send` nor `Sync`.
#[must_use = "the section is left as soon as the guard is dropped"]
pub struct SectionGuard<'a> {
    section: &'a ExclusiveSection,
    _not_send: PhantomData<*const ()>,
}

impl Drop for SectionGuard<'_> {
    fn drop(&mut self) {
        self.section.release();
    }
}

impl ExclusiveSection {
    /// Create an open, unheld section.
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the calling thread holds the section.
    ///
    /// Re-entrant: a holder entering again only bumps its depth. Fails with
    /// `DeviceDisposed` if the section is closed while waiting.
    pub fn enter(&self) -> Result<SectionGuard<'_>> {
        self.acquire()?;
        Ok(SectionGuard {
            section: self,
            _not_send: PhantomData,
        })
    }

    /// Acquire without a guard. Paired with [`release`](Self::release).
    pub(crate) fn acquire(&self) -> Result<()> {
        let me = thread::current().id();
        let mut state = self.state.lock();

        if state.holder != Some(me) {
            if state.closed {
                return Err(BridgeError::DeviceDisposed);
            }
            state.waiting += 1;
            // Let a sleeping owner know someone wants a turn.
            self.monitor.notify_all();
            while !state.closed && state.holder.is_some() {
                self.monitor.wait(&mut state);
            }
            state.waiting -= 1;
            if state.closed {
                self.monitor.notify_all();
                return Err(BridgeError::DeviceDisposed);
            }
            state.holder = Some(me);
            tracing::trace!(target: SECTION, thread = ?me, "section entered");
        }

        state.depth += 1;
        Ok(())
    }

    /// Leave one level of the section.
    pub(crate) fn release(&self) {
        let mut state = self.state.lock();
        debug_assert_eq!(state.holder, Some(thread::current().id()));
        state.depth = state.depth.saturating_sub(1);
        if state.depth == 0 {
            state.holder = None;
            state.steps = state.steps.wrapping_add(1);
            tracing::trace!(target: SECTION, steps = state.steps, "section released");
            self.monitor.notify_all();
        }
    }

    /// Hand the section to one waiting actor and take it back afterwards.
    ///
    /// Must be called by the current holder. Returns `Ok(false)` without
    /// blocking when nobody is waiting. Otherwise the holder's depth is saved,
    /// the section is released, and the call blocks until the waiting actor has
    /// completed one turn and the section is free again.
    pub fn yield_step(&self) -> Result<bool> {
        let me = thread::current().id();
        let mut state = self.state.lock();

        if state.holder != Some(me) {
            return Err(BridgeError::ThreadInvalidAccess);
        }
        if state.waiting == 0 {
            return Ok(false);
        }

        let saved_depth = state.depth;
        let start = state.steps;
        state.holder = None;
        state.depth = 0;
        self.monitor.notify_all();

        while state.holder.is_some() || (state.steps == start && !state.closed) {
            self.monitor.wait(&mut state);
        }

        state.holder = Some(me);
        state.depth = saved_depth;
        tracing::trace!(target: SECTION, steps = state.steps, "section reclaimed");
        Ok(true)
    }

    /// Block until an actor is waiting to enter, a wake is requested, or the
    /// section closes.
    ///
    /// Returns `true` if an actor is waiting for a turn. Any pending wake
    /// request is consumed.
    pub fn wait_for_request(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();

        loop {
            if state.waiting > 0 || state.wake_requested || state.closed {
                break;
            }
            match deadline {
                Some(deadline) => {
                    if self.monitor.wait_until(&mut state, deadline).timed_out() {
                        break;
                    }
                }
                None => self.monitor.wait(&mut state),
            }
        }

        state.wake_requested = false;
        state.waiting > 0
    }

    /// Request that a thread blocked in `wait_for_request` returns.
    ///
    /// The request is sticky: if nobody is waiting, the next call to
    /// `wait_for_request` returns immediately.
    pub fn wake(&self) {
        let mut state = self.state.lock();
        state.wake_requested = true;
        self.monitor.notify_all();
    }

    /// Refuse new holders and release everyone blocked in `enter`.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.monitor.notify_all();
    }

    /// Whether the section has been closed.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Whether the calling thread currently holds the section.
    pub fn is_held_by_current(&self) -> bool {
        self.state.lock().holder == Some(thread::current().id())
    }

    /// The thread currently holding the section.
    pub fn holder(&self) -> Option<ThreadId> {
        self.state.lock().holder
    }

    /// Number of actors blocked in `enter`.
    pub fn waiting_count(&self) -> usize {
        self.state.lock().waiting
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_reentrant_enter() {
        let section = ExclusiveSection::new();
        let outer = section.enter().unwrap();
        assert!(section.is_held_by_current());
        {
            let _inner = section.enter().unwrap();
            assert!(section.is_held_by_current());
        }
        assert!(section.is_held_by_current());
        drop(outer);
        assert!(section.holder().is_none());
    }

    #[test]
    fn test_exclusive_across_threads() {
        let section = Arc::new(ExclusiveSection::new());
        let guard = section.enter().unwrap();

        let entered = Arc::new(AtomicBool::new(false));
        let handle = {
            let section = section.clone();
            let entered = entered.clone();
            thread::spawn(move || {
                let _guard = section.enter().unwrap();
                entered.store(true, Ordering::SeqCst);
            })
        };

        wait_until(|| section.waiting_count() == 1);
        assert!(!entered.load(Ordering::SeqCst));

        drop(guard);
        handle.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
    }

    #[test]
    fn test_yield_without_waiters_returns_false() {
        let section = ExclusiveSection::new();
        let _guard = section.enter().unwrap();
        assert!(!section.yield_step().unwrap());
        assert!(section.is_held_by_current());
    }

    #[test]
    fn test_yield_requires_holder() {
        let section = ExclusiveSection::new();
        assert!(matches!(
            section.yield_step(),
            Err(BridgeError::ThreadInvalidAccess)
        ));
    }

    #[test]
    fn test_yield_runs_exactly_one_step_and_restores_depth() {
        let section = Arc::new(ExclusiveSection::new());
        let _outer = section.enter().unwrap();
        let _inner = section.enter().unwrap();

        let steps = Arc::new(AtomicUsize::new(0));
        let handle = {
            let section = section.clone();
            let steps = steps.clone();
            thread::spawn(move || {
                let _guard = section.enter().unwrap();
                steps.fetch_add(1, Ordering::SeqCst);
            })
        };

        wait_until(|| section.waiting_count() == 1);
        assert!(section.yield_step().unwrap());
        assert_eq!(steps.load(Ordering::SeqCst), 1);
        assert!(section.is_held_by_current());
        handle.join().unwrap();

        // Both levels must still be held: leaving once keeps the section.
        drop(_inner);
        assert!(section.is_held_by_current());
    }

    #[test]
    fn test_wake_interrupts_wait_for_request() {
        let section = Arc::new(ExclusiveSection::new());
        let waker = {
            let section = section.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(5));
                section.wake();
            })
        };

        let start = Instant::now();
        assert!(!section.wait_for_request(Some(Duration::from_secs(5))));
        assert!(start.elapsed() < Duration::from_secs(1));
        waker.join().unwrap();
    }

    #[test]
    fn test_wake_before_wait_is_sticky() {
        let section = ExclusiveSection::new();
        section.wake();
        assert!(!section.wait_for_request(None));
        // Consumed: the next wait times out.
        assert!(!section.wait_for_request(Some(Duration::from_millis(10))));
    }

    #[test]
    fn test_close_releases_waiters() {
        let section = Arc::new(ExclusiveSection::new());
        let _guard = section.enter().unwrap();

        let handle = {
            let section = section.clone();
            thread::spawn(move || section.enter().map(|_| ()))
        };

        wait_until(|| section.waiting_count() == 1);
        section.close();
        let result = handle.join().unwrap();
        assert!(matches!(result, Err(BridgeError::DeviceDisposed)));
        assert!(section.is_closed());
    }
}
